//! Error types for the IPC engine.
//!
//! Every engine operation returns a [`Result`] and also records the outcome
//! as the engine's last error. [`Operation`] carries the numeric codes that
//! callers inspecting the last error can match on.

use crate::platform::QueueDirection;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the IPC engine.
#[derive(Debug, Error)]
pub enum IpcError {
    // Naming errors
    #[error("Invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("System object name {name:?} is {len} bytes, limit is {max}")]
    NameTooLong { name: String, len: usize, max: usize },

    // Host ceiling errors
    #[error("Can't read queue ceiling from {path:?}: {source}")]
    CeilingUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Queue ceiling in {path:?} is not a number: {value:?}")]
    CeilingInvalid { path: PathBuf, value: String },

    #[error("{setting} of {requested} exceeds host ceiling {ceiling}")]
    CeilingExceeded {
        setting: &'static str,
        requested: usize,
        ceiling: usize,
    },

    // Channel errors
    #[error("Channel already added: {peer}")]
    DuplicateChannel { peer: String },

    #[error("Channel not found: {peer}")]
    ChannelNotFound { peer: String },

    #[error("Channel {peer} is closed")]
    ChannelClosed { peer: String },

    #[error("Unable to open {direction} queue {name}: {source}")]
    QueueOpen {
        name: String,
        direction: QueueDirection,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to close queue {name}: {source}")]
    QueueClose {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to unlink queue {name}: {source}")]
    QueueUnlink {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Priority {priority} is out of range {min}..={max}")]
    PriorityOutOfRange { priority: i32, min: u32, max: u32 },

    #[error("Send to {peer} failed: {source}")]
    Send {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Receive from {peer} failed: {source}")]
    Receive {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    // Region errors
    #[error("Region already added: {name}")]
    DuplicateRegion { name: String },

    #[error("Region not found: {name}")]
    RegionNotFound { name: String },

    #[error("Region {name} is closed")]
    RegionClosed { name: String },

    #[error("Region {name} can't have size {size}")]
    InvalidRegionSize { name: String, size: usize },

    #[error("Unable to open shared memory {name}: {source}")]
    SegmentOpen {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to resize shared memory {name} to {size} bytes: {source}")]
    SegmentResize {
        name: String,
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to map shared memory {name}: {source}")]
    SegmentMap {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to release shared memory {name}: {source}")]
    SegmentRelease {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to unlink shared memory {name}: {source}")]
    SegmentUnlink {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Range {addr}+{size} is outside region {name} of {region_size} bytes")]
    OutOfBounds {
        name: String,
        addr: usize,
        size: usize,
        region_size: usize,
    },

    #[error("Access to region {name} failed: {source}")]
    RegionAccess {
        name: String,
        #[source]
        source: std::io::Error,
    },

    // Engine errors
    #[error("Terminating engine failed: {source}")]
    Terminate {
        #[source]
        source: Box<IpcError>,
    },
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, IpcError>;

impl IpcError {
    /// The OS error number behind a failed send or receive, if any.
    ///
    /// These are surfaced verbatim as the engine's last error code so callers
    /// can tell a full queue from a timeout from a closed descriptor.
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            IpcError::Send { source, .. } | IpcError::Receive { source, .. } => {
                source.raw_os_error()
            }
            _ => None,
        }
    }

    /// Check if retrying the same call may succeed once the peer catches up.
    pub fn is_retryable(&self) -> bool {
        match self {
            IpcError::Send { source, .. } | IpcError::Receive { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// Engine operation an error was recorded against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ChannelAdd,
    ChannelDelete,
    ChannelOpen,
    ChannelSend,
    ChannelReceive,
    RegionAdd,
    RegionDelete,
    RegionOpen,
    RegionRead,
    RegionWrite,
    Terminate,
    ChannelClose,
    RegionClose,
}

impl Operation {
    /// Numeric code reported for failures of this operation.
    pub fn code(&self) -> i32 {
        match self {
            Operation::ChannelAdd => -1,
            Operation::ChannelDelete => -2,
            Operation::ChannelOpen => -3,
            Operation::ChannelSend => -4,
            Operation::ChannelReceive => -5,
            Operation::RegionAdd => -6,
            Operation::RegionDelete => -7,
            Operation::RegionOpen => -8,
            Operation::RegionRead => -9,
            Operation::RegionWrite => -10,
            Operation::Terminate => -11,
            Operation::ChannelClose => -12,
            Operation::RegionClose => -13,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ChannelAdd => "channel add",
            Operation::ChannelDelete => "channel delete",
            Operation::ChannelOpen => "channel open",
            Operation::ChannelSend => "channel send",
            Operation::ChannelReceive => "channel receive",
            Operation::RegionAdd => "region add",
            Operation::RegionDelete => "region delete",
            Operation::RegionOpen => "region open",
            Operation::RegionRead => "region read",
            Operation::RegionWrite => "region write",
            Operation::Terminate => "terminate",
            Operation::ChannelClose => "channel close",
            Operation::RegionClose => "region close",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The last error observed by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    /// Operation that failed, `None` when the last call succeeded.
    pub operation: Option<Operation>,
    /// 0 on success, the operation code or the OS error number otherwise.
    pub code: i32,
    /// Human readable description.
    pub message: String,
}

impl LastError {
    pub const NO_ERROR_CODE: i32 = 0;
    pub const NO_ERROR_MESSAGE: &'static str = "no error";

    /// The state recorded after a successful call.
    pub fn none() -> Self {
        Self {
            operation: None,
            code: Self::NO_ERROR_CODE,
            message: Self::NO_ERROR_MESSAGE.to_string(),
        }
    }

    /// Record `err` as a failure of `operation`.
    pub fn from_error(operation: Operation, err: &IpcError) -> Self {
        Self {
            operation: Some(operation),
            code: err.os_error_code().unwrap_or_else(|| operation.code()),
            message: format!("failed to {}: {}", operation, err),
        }
    }

    pub fn is_error(&self) -> bool {
        self.operation.is_some()
    }
}

impl Default for LastError {
    fn default() -> Self {
        Self::none()
    }
}
