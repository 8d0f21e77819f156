//! Platform abstraction over the OS IPC primitives.
//!
//! The engine never calls the message queue or shared memory APIs directly.
//! It goes through [`IpcBackend`], which keeps all `unsafe` and all `#[cfg]`
//! blocks in this module.
//!
//! # Architecture
//!
//! - `posix` - POSIX message queues (`mq_*`) and shared memory
//!   (`shm_open` + `mmap`), Linux only
//! - `memory` - In-process emulation of both namespaces with fault
//!   injection, for tests of code built on the engine
//!
//! Handles returned by a backend own their OS resource: dropping a queue
//! closes it, dropping a mapping unmaps it, dropping a segment closes its
//! descriptor. The explicit `close_*`/`unmap_*` methods do the same but
//! report failures.

pub mod memory;
#[cfg(target_os = "linux")]
pub mod posix;

pub use memory::{FaultPoint, MemoryBackend};
#[cfg(target_os = "linux")]
pub use posix::PosixBackend;

use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;

/// Which side of a channel a queue serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueDirection {
    /// Written by this engine, read by the peer.
    Outbound,
    /// Written by the peer, read by this engine.
    Inbound,
}

impl std::fmt::Display for QueueDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueDirection::Outbound => write!(f, "sending"),
            QueueDirection::Inbound => write!(f, "receiving"),
        }
    }
}

/// Everything needed to (re)open one directional queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub direction: QueueDirection,
    /// Open with `O_NONBLOCK`.
    pub nonblocking: bool,
    /// Queue depth used if the queue has to be created.
    pub max_messages: usize,
    /// Message size used if the queue has to be created.
    pub max_message_size: usize,
    /// Permission bits used if the queue has to be created.
    pub mode: u32,
}

/// A shared memory mapping.
///
/// Implementations check that `offset..offset + len` lies inside the
/// mapping and fail with `InvalidInput` otherwise.
pub trait SharedMapping {
    /// Length of the mapping in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> io::Result<()>;

    /// Copy `data` into the mapping starting at `offset`.
    fn write_at(&mut self, offset: usize, data: &[u8]) -> io::Result<()>;
}

/// OS message queue and shared memory primitives used by the engine.
///
/// Queue and segment opens create the object if it doesn't exist and reuse
/// it otherwise.
pub trait IpcBackend {
    /// Open message queue descriptor.
    type Queue;
    /// Open shared memory object descriptor.
    type Segment;
    /// Mapped view of a shared memory object.
    type Mapping: SharedMapping;

    /// Open (creating if absent) the queue `name`.
    fn open_queue(&self, name: &str, spec: &QueueSpec) -> io::Result<Self::Queue>;

    /// Release a queue descriptor. The queue itself survives.
    fn close_queue(&self, queue: Self::Queue) -> io::Result<()>;

    /// Remove the queue `name` from the namespace.
    fn unlink_queue(&self, name: &str) -> io::Result<()>;

    /// Whether the queue `name` currently exists.
    fn queue_exists(&self, name: &str) -> io::Result<bool>;

    /// Enqueue `payload`. `None` timeout follows the descriptor's blocking mode.
    fn send(
        &self,
        queue: &Self::Queue,
        payload: &[u8],
        priority: u32,
        timeout: Option<Duration>,
    ) -> io::Result<()>;

    /// Dequeue the oldest highest-priority message into `buf`.
    ///
    /// Returns the message length and priority.
    fn receive(
        &self,
        queue: &Self::Queue,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<(usize, u32)>;

    /// Open (creating if absent) the shared memory object `name` read-write.
    ///
    /// The flag is true when this call created the object.
    fn open_segment(&self, name: &str, mode: u32) -> io::Result<(Self::Segment, bool)>;

    /// Set the size of a shared memory object.
    fn resize_segment(&self, segment: &Self::Segment, size: usize) -> io::Result<()>;

    /// Map `size` bytes of a shared memory object read-write, shared.
    fn map_segment(&self, segment: &Self::Segment, size: usize) -> io::Result<Self::Mapping>;

    fn unmap_segment(&self, mapping: Self::Mapping) -> io::Result<()>;

    fn close_segment(&self, segment: Self::Segment) -> io::Result<()>;

    /// Remove the shared memory object `name` from the namespace.
    fn unlink_segment(&self, name: &str) -> io::Result<()>;

    /// Whether the shared memory object `name` currently exists.
    fn segment_exists(&self, name: &str) -> io::Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_display() {
        assert_eq!(QueueDirection::Outbound.to_string(), "sending");
        assert_eq!(QueueDirection::Inbound.to_string(), "receiving");
    }
}
