//! Centralized configuration for the IPC engine.
//!
//! Constant groups mirror the host conventions peers rely on (default queue
//! geometry, priority range, permission bits, ceiling locations). Per-channel
//! settings live in [`ChannelOptions`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message queue defaults shared by every channel.
pub struct QueueConfig;

impl QueueConfig {
    pub const DEFAULT_MAX_MESSAGES: usize = 10;
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024; // bytes
    pub const DEFAULT_TIMEOUT_SECS: i64 = 3;
    pub const PRIORITY_MIN: u32 = 0;
    pub const PRIORITY_MAX: u32 = 31;
    pub const DEFAULT_PRIORITY: u32 = Self::PRIORITY_MIN;
    pub const MODE: u32 = 0o664;
}

/// Shared memory defaults.
pub struct RegionConfig;

impl RegionConfig {
    pub const MODE: u32 = 0o664;
}

/// Host files holding the message queue ceilings.
pub struct LimitsConfig;

impl LimitsConfig {
    pub const MSG_MAX_PATH: &'static str = "/proc/sys/fs/mqueue/msg_max";
    pub const MSGSIZE_MAX_PATH: &'static str = "/proc/sys/fs/mqueue/msgsize_max";
}

/// How long a send or receive may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeout {
    /// Fail immediately when the queue is full (send) or empty (receive).
    NonBlocking,
    /// Wait at most this long.
    Bounded(Duration),
}

impl Timeout {
    /// Interpret a timeout in seconds; zero or negative means non-blocking.
    pub fn from_secs(secs: i64) -> Self {
        match u64::try_from(secs) {
            Ok(secs) if secs > 0 => Timeout::Bounded(Duration::from_secs(secs)),
            _ => Timeout::NonBlocking,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Timeout::NonBlocking => None,
            Timeout::Bounded(duration) => Some(*duration),
        }
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Timeout::Bounded(_))
    }

    /// Whole seconds, 0 for non-blocking.
    pub fn as_secs(&self) -> u64 {
        self.as_duration().map(|d| d.as_secs()).unwrap_or(0)
    }
}

/// Settings for a single channel.
///
/// `None` for either queue geometry field selects the built-in default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ChannelOptions {
    /// Maximum number of messages queued in each direction.
    pub max_messages: Option<usize>,
    /// Maximum size of one message in bytes.
    pub max_message_size: Option<usize>,
    /// Send timeout in seconds (<= 0 for non-blocking).
    pub send_timeout_secs: i64,
    /// Receive timeout in seconds (<= 0 for non-blocking).
    pub recv_timeout_secs: i64,
}

impl ChannelOptions {
    pub fn new(
        max_messages: Option<usize>,
        max_message_size: Option<usize>,
        send_timeout_secs: i64,
        recv_timeout_secs: i64,
    ) -> Self {
        Self {
            max_messages,
            max_message_size,
            send_timeout_secs,
            recv_timeout_secs,
        }
    }

    /// Default geometry with both directions non-blocking.
    pub fn non_blocking() -> Self {
        Self {
            send_timeout_secs: 0,
            recv_timeout_secs: 0,
            ..Self::default()
        }
    }

    pub fn max_messages(mut self, count: usize) -> Self {
        self.max_messages = Some(count);
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    pub fn effective_max_messages(&self) -> usize {
        self.max_messages
            .unwrap_or(QueueConfig::DEFAULT_MAX_MESSAGES)
    }

    pub fn effective_max_message_size(&self) -> usize {
        self.max_message_size
            .unwrap_or(QueueConfig::DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn send_timeout(&self) -> Timeout {
        Timeout::from_secs(self.send_timeout_secs)
    }

    pub fn recv_timeout(&self) -> Timeout {
        Timeout::from_secs(self.recv_timeout_secs)
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            max_messages: None,
            max_message_size: None,
            send_timeout_secs: QueueConfig::DEFAULT_TIMEOUT_SECS,
            recv_timeout_secs: QueueConfig::DEFAULT_TIMEOUT_SECS,
        }
    }
}
