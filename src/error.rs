//! Typed leaf errors. Application plumbing uses `anyhow` with context;
//! these enums exist where callers branch on the failure kind.

use thiserror::Error;

/// A tmux (or ssh-wrapped tmux) invocation failed. The pane observer treats
/// this as "no panes this tick for this host" and carries on.
#[derive(Debug, Error)]
pub enum TmuxError {
    #[error("tmux unavailable: {0}")]
    Unavailable(String),
}

/// Approval-token verification failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("approval secret not configured")]
    NotConfigured,
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}
