//! The IPC engine.
//!
//! An [`Engine`] is one named participant. It owns a set of channels (pairs
//! of message queues to named peers) and a set of shared memory regions,
//! and remembers the outcome of its most recent operation.
//!
//! # Architecture
//!
//! - `builder` - [`EngineBuilder`] for choosing backend, ceilings and logging
//! - `channels` - Channel add/delete/open/close and messaging
//! - `regions` - Region add/delete/open/close and bounded byte access
//! - `records` - Per-channel and per-region state, ordered registry
//!
//! Every public operation records a [`LastError`]: `no error` on success,
//! the failing [`Operation`] and a message otherwise. With logging enabled
//! each failure is also emitted as a `tracing` warning.
//!
//! Dropping an engine releases its descriptors and mappings but leaves the
//! named OS objects in place. Use the delete operations to unlink them.

mod builder;
mod channels;
mod records;
mod regions;

pub use builder::EngineBuilder;
pub use channels::Message;
pub use records::{ChannelInfo, RegionInfo};

use crate::error::{IpcError, LastError, Operation, Result};
use crate::limits::QueueLimits;
use crate::platform::IpcBackend;
#[cfg(target_os = "linux")]
use crate::platform::PosixBackend;
use records::{ChannelRecord, RegionRecord, Registry};
use std::fmt;
use tracing::{info, warn};

/// Engine on the host's POSIX message queues and shared memory.
#[cfg(target_os = "linux")]
pub type PosixEngine = Engine<PosixBackend>;

type ChannelRegistry<B> = Registry<ChannelRecord<<B as IpcBackend>::Queue>>;
type RegionRegistry<B> =
    Registry<RegionRecord<<B as IpcBackend>::Segment, <B as IpcBackend>::Mapping>>;

/// A named IPC participant.
pub struct Engine<B: IpcBackend> {
    name: String,
    logging: bool,
    last_error: LastError,
    backend: B,
    limits: QueueLimits,
    channels: ChannelRegistry<B>,
    regions: RegionRegistry<B>,
}

#[cfg(target_os = "linux")]
impl Engine<PosixBackend> {
    /// Create an engine named `name` on the host's POSIX namespaces.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use ipceng::Engine;
    ///
    /// let mut engine = Engine::init("A")?;
    /// engine.add_channel_simple("B")?;
    /// engine.send_simple("B", b"hello world!")?;
    /// # Ok::<(), ipceng::IpcError>(())
    /// ```
    pub fn init(name: &str) -> Result<Self> {
        Self::builder(name).build()
    }

    /// Start configuring an engine named `name`.
    pub fn builder(name: impl Into<String>) -> EngineBuilder<PosixBackend> {
        EngineBuilder::new(name)
    }
}

impl<B: IpcBackend> Engine<B> {
    /// Create an engine named `name` on `backend`.
    pub fn with_backend(name: &str, backend: B) -> Result<Self> {
        EngineBuilder::with_backend(name, backend).build()
    }

    pub(crate) fn from_parts(name: String, backend: B, limits: QueueLimits, logging: bool) -> Self {
        Self {
            name,
            logging,
            last_error: LastError::none(),
            backend,
            limits,
            channels: Registry::new(),
            regions: Registry::new(),
        }
    }

    /// The engine's logical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn limits(&self) -> &QueueLimits {
        &self.limits
    }

    pub fn enable_logging(&mut self) {
        self.logging = true;
        self.last_error = LastError::none();
    }

    pub fn disable_logging(&mut self) {
        self.logging = false;
        self.last_error = LastError::none();
    }

    pub fn is_logging_enabled(&self) -> bool {
        self.logging
    }

    /// Outcome of the most recent operation.
    pub fn last_error(&self) -> &LastError {
        &self.last_error
    }

    /// 0 after a success, otherwise the operation code or the OS error
    /// number of a failed send/receive.
    pub fn error_code(&self) -> i32 {
        self.last_error.code
    }

    pub fn error_message(&self) -> &str {
        &self.last_error.message
    }

    /// Close every channel and region, then dispose of the engine.
    ///
    /// Named OS objects are left in place. On failure the engine is handed
    /// back inside [`TerminateFailure`] with the failure recorded as its
    /// last error; everything that could be closed has been.
    pub fn terminate(mut self) -> std::result::Result<(), TerminateFailure<B>> {
        let channels = self.close_every_channel();
        let regions = self.close_every_region();

        match channels.and(regions) {
            Ok(()) => {
                if self.logging {
                    info!("Terminated IPC engine {}", self.name);
                }
                Ok(())
            }
            Err(source) => {
                let error = IpcError::Terminate {
                    source: Box::new(source),
                };
                self.last_error = LastError::from_error(Operation::Terminate, &error);
                if self.logging {
                    warn!("Engine {}: {}", self.name, self.last_error.message);
                }
                Err(TerminateFailure {
                    engine: self,
                    error,
                })
            }
        }
    }

    /// Store the outcome of `operation` as the last error and pass it on.
    pub(crate) fn record<T>(&mut self, operation: Operation, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.last_error = LastError::none(),
            Err(err) => {
                self.last_error = LastError::from_error(operation, err);
                if self.logging {
                    warn!("Engine {}: {}", self.name, self.last_error.message);
                }
            }
        }
        result
    }
}

impl<B: IpcBackend> fmt::Debug for Engine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name)
            .field("logging", &self.logging)
            .field("last_error", &self.last_error)
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .field("regions", &self.regions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A failed [`Engine::terminate`], carrying the engine back to the caller.
pub struct TerminateFailure<B: IpcBackend> {
    pub engine: Engine<B>,
    pub error: IpcError,
}

impl<B: IpcBackend> fmt::Debug for TerminateFailure<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminateFailure")
            .field("engine", &self.engine)
            .field("error", &self.error)
            .finish()
    }
}

impl<B: IpcBackend> fmt::Display for TerminateFailure<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine {}: {}", self.engine.name, self.error)
    }
}

impl<B: IpcBackend> std::error::Error for TerminateFailure<B> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
