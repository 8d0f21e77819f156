//! ipceng - Named IPC engines over POSIX message queues and shared memory.
//!
//! An [`Engine`] is a named participant that talks to other engines, in the
//! same or other processes, through:
//!
//! - **Channels**: a pair of message queues per peer, one per direction,
//!   named so that both engines arrive at the same two queues without
//!   exchanging anything
//! - **Regions**: named shared memory blocks accessed with bounds-checked
//!   reads and writes
//!
//! Every operation returns a [`Result`] and also records a [`LastError`] on
//! the engine, with numeric codes that interoperate with peers inspecting
//! error codes.
//!
//! # Example
//!
//! ```rust,no_run
//! use ipceng::{ChannelOptions, Engine};
//!
//! fn main() -> ipceng::Result<()> {
//!     let mut a = Engine::init("A")?;
//!     let mut b = Engine::init("B")?;
//!
//!     a.add_channel("B", &ChannelOptions::default())?;
//!     b.add_channel("A", &ChannelOptions::default())?;
//!     a.send_text("B", "hello world!", 0)?;
//!     println!("{}", b.receive("A")?.text());
//!
//!     a.add_region("frame", 13)?;
//!     a.write_region("frame", 0, b"hello world!\0")?;
//!
//!     a.delete_all_channels()?;
//!     a.delete_all_regions()?;
//!     let _ = a.terminate();
//!     let _ = b.terminate();
//!     Ok(())
//! }
//! ```
//!
//! Code that should run without touching host IPC objects can build an
//! engine on [`MemoryBackend`] with [`Engine::with_backend`].

pub mod config;
pub mod error;
pub mod limits;
pub mod naming;
pub mod platform;

mod engine;
mod unwind;

#[cfg(test)]
mod testing;

pub use config::{ChannelOptions, QueueConfig, RegionConfig, Timeout};
pub use engine::{ChannelInfo, Engine, EngineBuilder, Message, RegionInfo, TerminateFailure};
#[cfg(target_os = "linux")]
pub use engine::PosixEngine;
pub use error::{IpcError, LastError, Operation, Result};
pub use limits::QueueLimits;
#[cfg(target_os = "linux")]
pub use platform::PosixBackend;
pub use platform::{
    FaultPoint, IpcBackend, MemoryBackend, QueueDirection, QueueSpec, SharedMapping,
};
