//! Human-in-the-loop approvals: drop files and signed URL tokens.
//!
//! The two channels are independent. A plain-text file dropped into the
//! approval directory decides a stage, and so does hitting a signed
//! approve/reject URL; whichever arrives first wins and the other is
//! cleaned up. File reads are destructive: the file is deleted no matter
//! what it contained.

use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::TokenError;
use crate::state::{StateStore, now_ts};

/// What a drop file asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDecision {
    Approve,
    Reject,
}

/// Everything a human needs to decide one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub host: String,
    pub pane_id: String,
    pub stage: String,
    pub file_path: PathBuf,
    pub token: Option<String>,
    pub approve_url: Option<String>,
    pub reject_url: Option<String>,
}

pub struct ApprovalManager {
    approval_dir: PathBuf,
    secret: Option<String>,
    base_url: Option<String>,
    token_ttl_secs: i64,
}

impl ApprovalManager {
    pub const DEFAULT_TOKEN_TTL_SECS: i64 = 24 * 3600;

    pub fn new(
        approval_dir: PathBuf,
        secret: Option<String>,
        base_url: Option<String>,
        token_ttl_secs: i64,
    ) -> Result<Self> {
        std::fs::create_dir_all(&approval_dir).with_context(|| {
            format!(
                "failed to create approval directory {}",
                approval_dir.display()
            )
        })?;
        Ok(Self {
            approval_dir,
            secret: secret.filter(|s| !s.is_empty()),
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
            token_ttl_secs,
        })
    }

    /// Deterministic drop-file path for one (host, pane, stage) key.
    pub fn approval_file(&self, host: &str, pane_id: &str, stage: &str) -> PathBuf {
        let name = format!(
            "{}__{}__{}.txt",
            sanitize(host),
            sanitize(pane_id),
            sanitize(stage)
        );
        self.approval_dir.join(name)
    }

    /// Read and consume the drop file. The file is deleted regardless of
    /// whether its content classified as a decision.
    pub fn poll_file_decision(
        &self,
        host: &str,
        pane_id: &str,
        stage: &str,
    ) -> Option<FileDecision> {
        let path = self.approval_file(host, pane_id, stage);
        let contents = std::fs::read_to_string(&path).ok()?;
        let _ = std::fs::remove_file(&path);

        let token = contents.split_whitespace().next()?.to_lowercase();
        match token.as_str() {
            "approve" | "approved" | "yes" => Some(FileDecision::Approve),
            "reject" | "rejected" | "no" => Some(FileDecision::Reject),
            other => {
                debug!(decision = other, "unrecognized approval drop content");
                None
            }
        }
    }

    /// Ensure there is a live request for the key: reuse the stored token if
    /// one is unexpired, mint otherwise. Without a signing secret any stored
    /// token is purged and no URLs are offered.
    pub fn ensure_request(
        &self,
        store: &StateStore,
        host: &str,
        pane_id: &str,
        stage: &str,
    ) -> Result<ApprovalRequest> {
        let token = match &self.secret {
            Some(secret) => match store.get_approval_token(host, pane_id, stage)? {
                Some((token, _)) => Some(token),
                None => {
                    let expires_at = now_ts() + self.token_ttl_secs;
                    let token = make_token(secret, host, pane_id, stage, expires_at);
                    store.upsert_approval_token(host, pane_id, stage, &token, expires_at)?;
                    Some(token)
                }
            },
            None => {
                store.delete_approval_token(host, pane_id, stage)?;
                None
            }
        };

        let (approve_url, reject_url) = match (&token, &self.base_url) {
            (Some(token), Some(base)) => (
                Some(format!("{base}/a/{token}/approve")),
                Some(format!("{base}/a/{token}/reject")),
            ),
            _ => (None, None),
        };

        Ok(ApprovalRequest {
            host: host.to_string(),
            pane_id: pane_id.to_string(),
            stage: stage.to_string(),
            file_path: self.approval_file(host, pane_id, stage),
            token,
            approve_url,
            reject_url,
        })
    }

    /// Verify a token and consume its stored row. Returns the
    /// (host, pane_id, stage) triple the token was minted for.
    pub fn resolve_token(
        &self,
        store: &StateStore,
        token: &str,
    ) -> Result<(String, String, String)> {
        let secret = self.secret.as_deref().ok_or(TokenError::NotConfigured)?;
        let (host, pane_id, stage, expires_at) = parse_token(secret, token)?;
        if expires_at < now_ts() {
            store.delete_approval_token(&host, &pane_id, &stage)?;
            return Err(TokenError::Expired.into());
        }
        store.delete_approval_token(&host, &pane_id, &stage)?;
        Ok((host, pane_id, stage))
    }
}

fn sanitize(component: &str) -> String {
    component
        .replace('%', "pct")
        .replace(['/', ':'], "_")
}

fn make_token(secret: &str, host: &str, pane_id: &str, stage: &str, expires_at: i64) -> String {
    let payload = format!("{host}|{pane_id}|{stage}|{expires_at}");
    let sig = hmac_sha256(secret.as_bytes(), payload.as_bytes());
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(payload.as_bytes()),
        URL_SAFE_NO_PAD.encode(sig)
    )
}

fn parse_token(
    secret: &str,
    token: &str,
) -> std::result::Result<(String, String, String, i64), TokenError> {
    let (payload_b64, sig_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;
    let payload_raw = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| TokenError::Malformed)?;
    let sig_raw = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| TokenError::Malformed)?;

    let expected = hmac_sha256(secret.as_bytes(), &payload_raw);
    if !constant_time_eq(&sig_raw, &expected) {
        return Err(TokenError::BadSignature);
    }

    let payload = String::from_utf8(payload_raw).map_err(|_| TokenError::Malformed)?;
    // Parse from the right: expires_at, then stage, then host|pane_id. Only
    // the leftmost surviving field (host) may itself contain '|'.
    let (rest, expires_str) = payload.rsplit_once('|').ok_or(TokenError::Malformed)?;
    let (rest, stage) = rest.rsplit_once('|').ok_or(TokenError::Malformed)?;
    let (host, pane_id) = rest.rsplit_once('|').ok_or(TokenError::Malformed)?;
    let expires_at: i64 = expires_str.parse().map_err(|_| TokenError::Malformed)?;

    Ok((
        host.to_string(),
        pane_id.to_string(),
        stage.to_string(),
        expires_at,
    ))
}

/// HMAC-SHA256 (RFC 2104) over the sha2 primitives; the example corpus
/// carries no dedicated hmac crate.
fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    const BLOCK_SIZE: usize = 64;

    let mut block = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        let digest = Sha256::digest(key);
        block[..digest.len()].copy_from_slice(&digest);
    } else {
        block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    let ipad: Vec<u8> = block.iter().map(|b| b ^ 0x36).collect();
    inner.update(&ipad);
    inner.update(message);
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    let opad: Vec<u8> = block.iter().map(|b| b ^ 0x5c).collect();
    outer.update(&opad);
    outer.update(inner_hash);
    outer.finalize().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
