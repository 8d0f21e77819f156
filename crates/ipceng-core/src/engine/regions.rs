//! Shared memory regions.

use super::records::RegionRecord;
use super::{Engine, RegionInfo};
use crate::config::RegionConfig;
use crate::error::{IpcError, Operation, Result};
use crate::naming;
use crate::platform::{IpcBackend, SharedMapping};
use std::io;
use tracing::debug;

impl<B: IpcBackend> Engine<B> {
    /// Create (or attach to) the region `name` of `size` bytes and map it.
    pub fn add_region(&mut self, name: &str, size: usize) -> Result<()> {
        self.add_region_with_mode(name, size, RegionConfig::MODE)
    }

    /// Like [`Engine::add_region`] with explicit permission bits for a newly
    /// created backing object.
    pub fn add_region_with_mode(&mut self, name: &str, size: usize, mode: u32) -> Result<()> {
        let result = self.try_add_region(name, size, mode);
        self.record(Operation::RegionAdd, result)
    }

    /// Unmap, unlink and forget a region. Deleting an unknown region succeeds.
    pub fn delete_region(&mut self, name: &str) -> Result<()> {
        let result = self.try_delete_region(name);
        self.record(Operation::RegionDelete, result)
    }

    /// Delete every region. Keeps going past failures and reports the first.
    pub fn delete_all_regions(&mut self) -> Result<()> {
        let names: Vec<String> = self.regions.keys().map(String::from).collect();
        let mut first_error = None;
        for name in names {
            if let Err(err) = self.try_delete_region(&name) {
                first_error.get_or_insert(err);
            }
        }
        self.record(Operation::RegionDelete, first_error.map_or(Ok(()), Err))
    }

    /// Map a closed region again. An open region is left alone.
    pub fn open_region(&mut self, name: &str) -> Result<()> {
        let backend = &self.backend;
        let result = match self.regions.get_mut(name) {
            Some(record) => record.open(backend, self.logging),
            None => Err(IpcError::RegionNotFound {
                name: name.to_string(),
            }),
        };
        self.record(Operation::RegionOpen, result)
    }

    /// Unmap a region and release its descriptor, keeping the record and the
    /// backing object. Closing an unknown or closed region succeeds.
    pub fn close_region(&mut self, name: &str) -> Result<()> {
        let backend = &self.backend;
        let result = match self.regions.get_mut(name) {
            Some(record) => record.close(backend),
            None => Ok(()),
        };
        self.record(Operation::RegionClose, result)
    }

    /// Close every region. Keeps going past failures and reports the first.
    pub fn close_all_regions(&mut self) -> Result<()> {
        let result = self.close_every_region();
        self.record(Operation::RegionClose, result)
    }

    /// Copy `size` bytes starting at `addr` out of the region.
    ///
    /// Fails without copying anything if `addr + size` passes the end.
    pub fn read_region(&mut self, name: &str, addr: usize, size: usize) -> Result<Vec<u8>> {
        let result = self.try_read_region(name, addr, size);
        self.record(Operation::RegionRead, result)
    }

    /// Copy `data` into the region starting at `addr`.
    ///
    /// Fails without writing anything if `addr + data.len()` passes the end.
    pub fn write_region(&mut self, name: &str, addr: usize, data: &[u8]) -> Result<()> {
        let result = self.try_write_region(name, addr, data);
        self.record(Operation::RegionWrite, result)
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn has_region(&self, name: &str) -> bool {
        self.regions.contains(name)
    }

    /// Regions in the order they were added.
    pub fn region_names(&self) -> Vec<String> {
        self.regions.keys().map(String::from).collect()
    }

    pub fn region_info(&self, name: &str) -> Option<RegionInfo> {
        self.regions.get(name).map(|record| record.info(name))
    }

    pub fn regions(&self) -> Vec<RegionInfo> {
        self.regions
            .iter()
            .map(|(name, record)| record.info(name))
            .collect()
    }

    pub(crate) fn close_every_region(&mut self) -> Result<()> {
        let backend = &self.backend;
        let mut first_error = None;
        for record in self.regions.values_mut() {
            if let Err(err) = record.close(backend) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn try_add_region(&mut self, name: &str, size: usize, mode: u32) -> Result<()> {
        naming::validate_logical_name(name)?;
        if self.regions.contains(name) {
            return Err(IpcError::DuplicateRegion {
                name: name.to_string(),
            });
        }
        if size == 0 {
            return Err(IpcError::InvalidRegionSize {
                name: name.to_string(),
                size,
            });
        }

        let mut record = RegionRecord::new(naming::region_name(name)?, size, mode);
        record.open(&self.backend, self.logging)?;

        if self.logging {
            debug!(
                "Engine {}: added region {} ({}, {} bytes)",
                self.name, name, record.system_name, size
            );
        }
        self.regions.insert(name.to_string(), record);
        Ok(())
    }

    fn try_delete_region(&mut self, name: &str) -> Result<()> {
        let Some(mut record) = self.regions.remove(name) else {
            return Ok(());
        };

        let released = record.close(&self.backend);
        let unlinked = match self.backend.unlink_segment(&record.system_name) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(IpcError::SegmentUnlink {
                name: record.system_name.clone(),
                source,
            }),
        };

        if self.logging {
            debug!("Engine {}: deleted region {}", self.name, name);
        }
        released.and(unlinked)
    }

    fn try_read_region(&self, name: &str, addr: usize, size: usize) -> Result<Vec<u8>> {
        let record = self
            .regions
            .get(name)
            .ok_or_else(|| IpcError::RegionNotFound {
                name: name.to_string(),
            })?;
        let mapping = record.mapping().ok_or_else(|| IpcError::RegionClosed {
            name: name.to_string(),
        })?;
        check_bounds(name, addr, size, record.size)?;

        let mut buf = vec![0u8; size];
        mapping
            .read_at(addr, &mut buf)
            .map_err(|source| IpcError::RegionAccess {
                name: name.to_string(),
                source,
            })?;
        Ok(buf)
    }

    fn try_write_region(&mut self, name: &str, addr: usize, data: &[u8]) -> Result<()> {
        let record = self
            .regions
            .get_mut(name)
            .ok_or_else(|| IpcError::RegionNotFound {
                name: name.to_string(),
            })?;
        let region_size = record.size;
        let mapping = record.mapping_mut().ok_or_else(|| IpcError::RegionClosed {
            name: name.to_string(),
        })?;
        check_bounds(name, addr, data.len(), region_size)?;

        mapping
            .write_at(addr, data)
            .map_err(|source| IpcError::RegionAccess {
                name: name.to_string(),
                source,
            })
    }
}

fn check_bounds(name: &str, addr: usize, size: usize, region_size: usize) -> Result<()> {
    match addr.checked_add(size) {
        Some(end) if end <= region_size => Ok(()),
        _ => Err(IpcError::OutOfBounds {
            name: name.to_string(),
            addr,
            size,
            region_size,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{FaultPoint, MemoryBackend};
    use crate::testing::memory_engine;

    #[test]
    fn test_add_region_maps_backing_object() {
        let backend = MemoryBackend::new();
        let (_dir, mut engine) = memory_engine("A", &backend);

        engine.add_region("frame", 128).unwrap();

        assert!(engine.has_region("frame"));
        assert_eq!(backend.segment_size("/frame.shm"), Some(128));
        assert_eq!(backend.segment_mappings("/frame.shm"), 1);
        let info = engine.region_info("frame").unwrap();
        assert_eq!(info.system_name, "/frame.shm");
        assert_eq!(info.mode, 0o664);
        assert!(info.open);
    }

    #[test]
    fn test_add_region_rejects_zero_size_and_duplicates() {
        let backend = MemoryBackend::new();
        let (_dir, mut engine) = memory_engine("A", &backend);

        let err = engine.add_region("empty", 0).unwrap_err();
        assert!(matches!(err, IpcError::InvalidRegionSize { .. }));
        assert!(backend.segment_names().is_empty());

        engine.add_region("frame", 8).unwrap();
        let err = engine.add_region("frame", 8).unwrap_err();
        assert!(matches!(err, IpcError::DuplicateRegion { .. }));
        assert_eq!(engine.error_code(), Operation::RegionAdd.code());
        assert_eq!(engine.region_count(), 1);
    }

    #[test]
    fn test_add_region_failure_leaves_nothing_behind() {
        for point in [
            FaultPoint::OpenSegment,
            FaultPoint::ResizeSegment,
            FaultPoint::MapSegment,
        ] {
            let backend = MemoryBackend::new();
            let (_dir, mut engine) = memory_engine("A", &backend);
            backend.fail_next(point, "/frame.shm");

            assert!(engine.add_region("frame", 64).is_err(), "{:?}", point);
            assert_eq!(engine.error_code(), Operation::RegionAdd.code());
            assert!(!engine.has_region("frame"));
            assert_eq!(backend.live_segment_handles(), 0, "{:?}", point);
            assert!(!backend.segment_exists("/frame.shm").unwrap(), "{:?}", point);
            assert_eq!(backend.pending_faults(), 0);

            engine.add_region("frame", 64).unwrap();
        }
    }

    #[test]
    fn test_add_region_failure_keeps_peer_object() {
        let backend = MemoryBackend::new();
        let (_dir_a, mut a) = memory_engine("A", &backend);
        let (_dir_b, mut b) = memory_engine("B", &backend);
        b.add_region("frame", 64).unwrap();
        b.write_region("frame", 0, b"owned").unwrap();
        backend.fail_next(FaultPoint::MapSegment, "/frame.shm");

        let err = a.add_region("frame", 64).unwrap_err();
        assert!(matches!(err, IpcError::SegmentMap { .. }));
        assert!(backend.segment_exists("/frame.shm").unwrap());
        assert_eq!(backend.segment_handles("/frame.shm"), 1);
        assert_eq!(b.read_region("frame", 0, 5).unwrap(), b"owned");
    }

    #[test]
    fn test_reopen_failure_stays_closed() {
        for point in [FaultPoint::OpenSegment, FaultPoint::MapSegment] {
            let backend = MemoryBackend::new();
            let (_dir, mut engine) = memory_engine("A", &backend);
            engine.add_region("frame", 16).unwrap();
            engine.close_region("frame").unwrap();
            backend.fail_next(point, "/frame.shm");

            assert!(engine.open_region("frame").is_err(), "{:?}", point);
            assert_eq!(engine.error_code(), Operation::RegionOpen.code());
            assert!(!engine.region_info("frame").unwrap().open);
            assert_eq!(backend.segment_handles("/frame.shm"), 0);
            assert_eq!(backend.live_segment_handles(), 0);
            assert_eq!(backend.segment_mappings("/frame.shm"), 0);
            assert!(backend.segment_exists("/frame.shm").unwrap());

            engine.open_region("frame").unwrap();
            assert!(engine.region_info("frame").unwrap().open);
        }
    }

    #[test]
    fn test_write_then_read() {
        let backend = MemoryBackend::new();
        let (_dir, mut engine) = memory_engine("A", &backend);
        engine.add_region("frame", 32).unwrap();

        engine.write_region("frame", 4, b"hello world!").unwrap();
        assert_eq!(engine.read_region("frame", 4, 12).unwrap(), b"hello world!");
        assert_eq!(engine.read_region("frame", 0, 4).unwrap(), vec![0; 4]);
        assert_eq!(engine.error_code(), 0);
    }

    #[test]
    fn test_two_engines_share_region() {
        let backend = MemoryBackend::new();
        let (_dir_a, mut a) = memory_engine("A", &backend);
        let (_dir_b, mut b) = memory_engine("B", &backend);
        a.add_region("shared", 16).unwrap();
        b.add_region("shared", 16).unwrap();

        a.write_region("shared", 0, b"ping").unwrap();
        assert_eq!(b.read_region("shared", 0, 4).unwrap(), b"ping");
    }

    #[test]
    fn test_bounds_are_enforced() {
        let backend = MemoryBackend::new();
        let (_dir, mut engine) = memory_engine("A", &backend);
        engine.add_region("frame", 16).unwrap();

        engine.write_region("frame", 0, &[7; 16]).unwrap();
        engine.read_region("frame", 16, 0).unwrap();

        let err = engine.write_region("frame", 10, &[1; 7]).unwrap_err();
        assert!(matches!(err, IpcError::OutOfBounds { .. }));
        assert_eq!(engine.error_code(), Operation::RegionWrite.code());
        assert_eq!(engine.read_region("frame", 10, 6).unwrap(), vec![7; 6]);

        let err = engine.read_region("frame", usize::MAX, 2).unwrap_err();
        assert!(matches!(err, IpcError::OutOfBounds { .. }));
        assert_eq!(engine.error_code(), Operation::RegionRead.code());
    }

    #[test]
    fn test_access_to_unknown_or_closed_region() {
        let backend = MemoryBackend::new();
        let (_dir, mut engine) = memory_engine("A", &backend);

        let err = engine.read_region("frame", 0, 1).unwrap_err();
        assert!(matches!(err, IpcError::RegionNotFound { .. }));

        engine.add_region("frame", 8).unwrap();
        engine.close_region("frame").unwrap();
        let err = engine.write_region("frame", 0, b"x").unwrap_err();
        assert!(matches!(err, IpcError::RegionClosed { .. }));
        assert!(!engine.region_info("frame").unwrap().open);
    }

    #[test]
    fn test_close_then_open_keeps_contents() {
        let backend = MemoryBackend::new();
        let (_dir, mut engine) = memory_engine("A", &backend);
        engine.add_region("frame", 8).unwrap();
        engine.write_region("frame", 0, b"persist").unwrap();

        engine.close_region("frame").unwrap();
        engine.close_region("frame").unwrap();
        assert_eq!(backend.segment_mappings("/frame.shm"), 0);

        engine.open_region("frame").unwrap();
        engine.open_region("frame").unwrap();
        assert_eq!(backend.segment_mappings("/frame.shm"), 1);
        assert_eq!(engine.read_region("frame", 0, 7).unwrap(), b"persist");
    }

    #[test]
    fn test_open_unknown_region_fails() {
        let backend = MemoryBackend::new();
        let (_dir, mut engine) = memory_engine("A", &backend);
        let err = engine.open_region("frame").unwrap_err();
        assert!(matches!(err, IpcError::RegionNotFound { .. }));
        assert_eq!(engine.error_code(), Operation::RegionOpen.code());
    }

    #[test]
    fn test_delete_unlinks_and_is_idempotent() {
        let backend = MemoryBackend::new();
        let (_dir, mut engine) = memory_engine("A", &backend);
        engine.add_region("frame", 8).unwrap();

        engine.delete_region("frame").unwrap();
        assert!(!engine.has_region("frame"));
        assert!(!backend.segment_exists("/frame.shm").unwrap());
        assert_eq!(backend.segment_mappings("/frame.shm"), 0);

        engine.delete_region("frame").unwrap();
        assert_eq!(engine.error_code(), 0);
    }

    #[test]
    fn test_bulk_close_and_delete() {
        let backend = MemoryBackend::new();
        let (_dir, mut engine) = memory_engine("A", &backend);
        for name in ["a", "b", "c"] {
            engine.add_region(name, 4).unwrap();
        }
        assert_eq!(engine.region_names(), vec!["a", "b", "c"]);

        engine.close_all_regions().unwrap();
        assert!(engine.regions().iter().all(|info| !info.open));

        engine.delete_all_regions().unwrap();
        assert_eq!(engine.region_count(), 0);
        assert!(backend.segment_names().is_empty());
    }

    #[test]
    fn test_unmap_failure_still_closes() {
        let backend = MemoryBackend::new();
        let (_dir, mut engine) = memory_engine("A", &backend);
        engine.add_region("frame", 8).unwrap();
        backend.fail_next(FaultPoint::UnmapSegment, "/frame.shm");

        let err = engine.close_region("frame").unwrap_err();
        assert!(matches!(err, IpcError::SegmentRelease { .. }));
        assert_eq!(engine.error_code(), Operation::RegionClose.code());
        assert!(!engine.region_info("frame").unwrap().open);
        assert_eq!(backend.segment_handles("/frame.shm"), 0);
    }
}
