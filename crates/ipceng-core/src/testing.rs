//! Shared fixtures for unit tests.

use crate::engine::{Engine, EngineBuilder};
use crate::limits::QueueLimits;
use crate::platform::MemoryBackend;
use std::fs;
use tempfile::TempDir;

/// Ceiling files with the given values. Keep the directory alive for as long
/// as the limits are used.
pub(crate) fn ceilings(msg_max: usize, msgsize_max: usize) -> (TempDir, QueueLimits) {
    let dir = TempDir::new().unwrap();
    let msg_max_path = dir.path().join("msg_max");
    let msgsize_max_path = dir.path().join("msgsize_max");
    fs::write(&msg_max_path, format!("{}\n", msg_max)).unwrap();
    fs::write(&msgsize_max_path, format!("{}\n", msgsize_max)).unwrap();
    (dir, QueueLimits::at(msg_max_path, msgsize_max_path))
}

/// Engine on `backend` with generous ceilings.
pub(crate) fn memory_engine(name: &str, backend: &MemoryBackend) -> (TempDir, Engine<MemoryBackend>) {
    let (dir, limits) = ceilings(64, 8192);
    let engine = EngineBuilder::with_backend(name, backend.clone())
        .limits(limits)
        .build()
        .unwrap();
    (dir, engine)
}
