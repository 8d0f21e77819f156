//! Builder for configuring engine initialization.

use crate::engine::Engine;
use crate::error::Result;
use crate::limits::QueueLimits;
use crate::naming;
use crate::platform::IpcBackend;
#[cfg(target_os = "linux")]
use crate::platform::PosixBackend;
use tracing::info;

/// Builder for configuring an [`Engine`].
///
/// Use this for more control than [`Engine::init`] offers.
///
/// # Example
///
/// ```rust,ignore
/// use ipceng::{Engine, MemoryBackend};
///
/// let engine = Engine::builder("A")
///     .backend(MemoryBackend::new())
///     .logging(false)
///     .build()?;
/// ```
pub struct EngineBuilder<B> {
    name: String,
    backend: B,
    limits: QueueLimits,
    logging: bool,
}

#[cfg(target_os = "linux")]
impl EngineBuilder<PosixBackend> {
    /// Create a builder for an engine on the host's POSIX namespaces.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_backend(name, PosixBackend)
    }
}

impl<B: IpcBackend> EngineBuilder<B> {
    /// Create a builder for an engine on `backend`.
    pub fn with_backend(name: impl Into<String>, backend: B) -> Self {
        Self {
            name: name.into(),
            backend,
            limits: QueueLimits::default(),
            logging: true,
        }
    }

    /// Swap the IPC backend.
    pub fn backend<C: IpcBackend>(self, backend: C) -> EngineBuilder<C> {
        EngineBuilder {
            name: self.name,
            backend,
            limits: self.limits,
            logging: self.logging,
        }
    }

    /// Read queue ceilings from somewhere other than `/proc/sys/fs/mqueue`.
    ///
    /// Default: [`QueueLimits::default`]
    pub fn limits(mut self, limits: QueueLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Emit `tracing` events for lifecycle changes and failed operations.
    ///
    /// Default: `true`
    pub fn logging(mut self, enable: bool) -> Self {
        self.logging = enable;
        self
    }

    /// Validate the engine name and build the engine.
    ///
    /// No OS object is touched until the first channel or region is added.
    pub fn build(self) -> Result<Engine<B>> {
        naming::validate_logical_name(&self.name)?;
        if self.logging {
            info!("Initialized IPC engine {}", self.name);
        }
        Ok(Engine::from_parts(
            self.name,
            self.backend,
            self.limits,
            self.logging,
        ))
    }
}
