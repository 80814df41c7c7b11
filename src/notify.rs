//! Notification fan-out. Channels come from the comma-separated `notify`
//! setting; each message goes to every configured sink. Send failures are
//! logged and never fatal to the tick.
//!
//! Only the in-process sinks live here: `stdout` for interactive runs and
//! `bus` for anything downstream. External adapters (chat webhooks, email)
//! are separate relay components that tail the notifications journal.

use anyhow::{Result, bail};
use tracing::warn;

use crate::bus::LocalBus;
use crate::state::JsonMap;

/// A user-visible message heading to the configured sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    pub title: String,
    pub body: String,
}

impl NotificationMessage {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Stdout,
    Bus,
}

pub struct Notifier {
    channels: Vec<Channel>,
    bus: LocalBus,
}

impl Notifier {
    /// Parse the channel list. Unknown channels are a configuration error
    /// and fatal at startup.
    pub fn new(channel_list: &str, bus: LocalBus) -> Result<Self> {
        let mut channels = Vec::new();
        for name in channel_list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match name {
                "stdout" => channels.push(Channel::Stdout),
                "bus" | "local_bus" => channels.push(Channel::Bus),
                other => bail!("unknown notification channel: {other}"),
            }
        }
        if channels.is_empty() {
            bail!("notification channel list must not be empty");
        }
        Ok(Self { channels, bus })
    }

    pub fn send(&self, message: &NotificationMessage) {
        for channel in &self.channels {
            if let Err(e) = self.dispatch(*channel, message) {
                warn!(channel = ?channel, error = %e, "notification send failed");
            }
        }
    }

    fn dispatch(&self, channel: Channel, message: &NotificationMessage) -> Result<()> {
        match channel {
            Channel::Stdout => {
                println!("[NOTIFY] {}\n{}", message.title, message.body);
                Ok(())
            }
            Channel::Bus => {
                self.bus
                    .append_notification(&message.title, &message.body, JsonMap::new())?;
                Ok(())
            }
        }
    }
}
