//! Channel and region records, and the ordered collection that holds them.

use crate::config::{QueueConfig, Timeout};
use crate::error::{IpcError, Result};
use crate::platform::{IpcBackend, QueueDirection, QueueSpec};
use crate::unwind::Unwind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Insertion-ordered map from logical name to record.
///
/// Lookups and duplicate checks go through the index; enumeration follows
/// insertion order.
pub(crate) struct Registry<T> {
    entries: Vec<(String, T)>,
    index: HashMap<String, usize>,
}

impl<T> Registry<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub(crate) fn get(&self, key: &str) -> Option<&T> {
        let &position = self.index.get(key)?;
        self.entries.get(position).map(|(_, value)| value)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        let &position = self.index.get(key)?;
        self.entries.get_mut(position).map(|(_, value)| value)
    }

    /// Append `value` under `key`. Returns false (and drops nothing) if the
    /// key is already present.
    pub(crate) fn insert(&mut self, key: String, value: T) -> bool {
        if self.index.contains_key(&key) {
            return false;
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, value));
        true
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<T> {
        let position = self.index.remove(key)?;
        let (_, value) = self.entries.remove(position);
        for (offset, (later_key, _)) in self.entries[position..].iter().enumerate() {
            self.index.insert(later_key.clone(), position + offset);
        }
        Some(value)
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.iter_mut().map(|(_, value)| value)
    }
}

/// Open/closed state of one directional queue. The descriptor exists only
/// while open.
pub(crate) enum QueueState<Q> {
    Closed,
    Opened(Q),
}

/// One side of a channel. Keeps everything needed to reopen it.
pub(crate) struct DirectionalQueue<Q> {
    pub(crate) name: String,
    pub(crate) timeout: Timeout,
    pub(crate) spec: QueueSpec,
    state: QueueState<Q>,
}

impl<Q> DirectionalQueue<Q> {
    pub(crate) fn new(
        name: String,
        direction: QueueDirection,
        timeout: Timeout,
        max_messages: usize,
        max_message_size: usize,
    ) -> Self {
        Self {
            name,
            timeout,
            spec: QueueSpec {
                direction,
                nonblocking: !timeout.is_blocking(),
                max_messages,
                max_message_size,
                mode: QueueConfig::MODE,
            },
            state: QueueState::Closed,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(self.state, QueueState::Opened(_))
    }

    pub(crate) fn handle(&self) -> Option<&Q> {
        match &self.state {
            QueueState::Opened(queue) => Some(queue),
            QueueState::Closed => None,
        }
    }

    /// Open the queue unless it already is.
    pub(crate) fn open<B>(&mut self, backend: &B) -> Result<()>
    where
        B: IpcBackend<Queue = Q>,
    {
        if self.is_open() {
            return Ok(());
        }
        let queue = backend
            .open_queue(&self.name, &self.spec)
            .map_err(|source| IpcError::QueueOpen {
                name: self.name.clone(),
                direction: self.spec.direction,
                source,
            })?;
        self.state = QueueState::Opened(queue);
        Ok(())
    }

    /// Release the descriptor. The queue is closed afterwards even if the
    /// OS reports an error.
    pub(crate) fn close<B>(&mut self, backend: &B) -> Result<()>
    where
        B: IpcBackend<Queue = Q>,
    {
        match std::mem::replace(&mut self.state, QueueState::Closed) {
            QueueState::Closed => Ok(()),
            QueueState::Opened(queue) => {
                backend
                    .close_queue(queue)
                    .map_err(|source| IpcError::QueueClose {
                        name: self.name.clone(),
                        source,
                    })
            }
        }
    }
}

/// A channel: one queue we write, one queue we read.
pub(crate) struct ChannelRecord<Q> {
    pub(crate) outbound: DirectionalQueue<Q>,
    pub(crate) inbound: DirectionalQueue<Q>,
}

impl<Q> ChannelRecord<Q> {
    /// Close both queues, attempting the second even if the first fails.
    pub(crate) fn close<B>(&mut self, backend: &B) -> Result<()>
    where
        B: IpcBackend<Queue = Q>,
    {
        let outbound = self.outbound.close(backend);
        let inbound = self.inbound.close(backend);
        outbound.and(inbound)
    }

    pub(crate) fn info(&self, peer: &str) -> ChannelInfo {
        ChannelInfo {
            peer: peer.to_string(),
            outbound_queue: self.outbound.name.clone(),
            inbound_queue: self.inbound.name.clone(),
            max_messages: self.outbound.spec.max_messages,
            max_message_size: self.outbound.spec.max_message_size,
            send_timeout: self.outbound.timeout,
            recv_timeout: self.inbound.timeout,
            outbound_open: self.outbound.is_open(),
            inbound_open: self.inbound.is_open(),
        }
    }
}

/// Open/closed state of a region. The mapping is reachable only while open.
pub(crate) enum RegionState<S, M> {
    Closed,
    Opened { segment: S, mapping: M },
}

pub(crate) struct RegionRecord<S, M> {
    pub(crate) system_name: String,
    pub(crate) mode: u32,
    pub(crate) size: usize,
    state: RegionState<S, M>,
}

impl<S, M> RegionRecord<S, M> {
    pub(crate) fn new(system_name: String, size: usize, mode: u32) -> Self {
        Self {
            system_name,
            mode,
            size,
            state: RegionState::Closed,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(self.state, RegionState::Opened { .. })
    }

    pub(crate) fn mapping(&self) -> Option<&M> {
        match &self.state {
            RegionState::Opened { mapping, .. } => Some(mapping),
            RegionState::Closed => None,
        }
    }

    pub(crate) fn mapping_mut(&mut self) -> Option<&mut M> {
        match &mut self.state {
            RegionState::Opened { mapping, .. } => Some(mapping),
            RegionState::Closed => None,
        }
    }

    /// Open, size and map the backing object unless already open.
    ///
    /// On failure the record stays closed, every descriptor acquired on the
    /// way has been released, and a backing object created by this call has
    /// been unlinked again. An object that already existed is left alone.
    pub(crate) fn open<B>(&mut self, backend: &B, verbose: bool) -> Result<()>
    where
        B: IpcBackend<Segment = S, Mapping = M>,
    {
        if self.is_open() {
            return Ok(());
        }

        let name = &self.system_name;
        // Declared before the segment so the descriptor is released first.
        let mut unwind = Unwind::new(verbose);
        let (segment, created) = backend
            .open_segment(name, self.mode)
            .map_err(|source| IpcError::SegmentOpen {
                name: name.clone(),
                source,
            })?;
        if created {
            unwind.defer("unlink new region object", move || {
                if let Err(err) = backend.unlink_segment(name) {
                    if verbose {
                        warn!("Failed to unlink {} during rollback: {}", name, err);
                    }
                }
            });
        }
        backend
            .resize_segment(&segment, self.size)
            .map_err(|source| IpcError::SegmentResize {
                name: name.clone(),
                size: self.size,
                source,
            })?;
        let mapping = backend
            .map_segment(&segment, self.size)
            .map_err(|source| IpcError::SegmentMap {
                name: name.clone(),
                source,
            })?;
        unwind.commit();

        self.state = RegionState::Opened { segment, mapping };
        Ok(())
    }

    /// Unmap and release the descriptor. Closed afterwards even on error.
    pub(crate) fn close<B>(&mut self, backend: &B) -> Result<()>
    where
        B: IpcBackend<Segment = S, Mapping = M>,
    {
        match std::mem::replace(&mut self.state, RegionState::Closed) {
            RegionState::Closed => Ok(()),
            RegionState::Opened { segment, mapping } => {
                let unmapped = backend.unmap_segment(mapping);
                let closed = backend.close_segment(segment);
                unmapped
                    .and(closed)
                    .map_err(|source| IpcError::SegmentRelease {
                        name: self.system_name.clone(),
                        source,
                    })
            }
        }
    }

    pub(crate) fn info(&self, name: &str) -> RegionInfo {
        RegionInfo {
            name: name.to_string(),
            system_name: self.system_name.clone(),
            size: self.size,
            mode: self.mode,
            open: self.is_open(),
        }
    }
}

/// Snapshot of a channel's configuration and state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub peer: String,
    pub outbound_queue: String,
    pub inbound_queue: String,
    pub max_messages: usize,
    pub max_message_size: usize,
    pub send_timeout: Timeout,
    pub recv_timeout: Timeout,
    pub outbound_open: bool,
    pub inbound_open: bool,
}

/// Snapshot of a region's configuration and state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub name: String,
    pub system_name: String,
    pub size: usize,
    pub mode: u32,
    pub open: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_preserves_insertion_order() {
        let mut registry = Registry::new();
        assert!(registry.insert("c".to_string(), 3));
        assert!(registry.insert("a".to_string(), 1));
        assert!(registry.insert("b".to_string(), 2));
        assert_eq!(registry.keys().collect::<Vec<_>>(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = Registry::new();
        assert!(registry.insert("a".to_string(), 1));
        assert!(!registry.insert("a".to_string(), 2));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a"), Some(&1));
    }

    #[test]
    fn test_registry_remove_reindexes() {
        let mut registry = Registry::new();
        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            registry.insert(key.to_string(), i);
        }

        assert_eq!(registry.remove("b"), Some(1));
        assert_eq!(registry.remove("b"), None);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get("c"), Some(&2));
        assert_eq!(registry.get("d"), Some(&3));
        assert_eq!(registry.keys().collect::<Vec<_>>(), vec!["a", "c", "d"]);

        *registry.get_mut("d").unwrap() = 30;
        assert_eq!(registry.iter().last(), Some(("d", &30)));
    }

    #[test]
    fn test_queue_flags_follow_timeout() {
        let blocking: DirectionalQueue<()> = DirectionalQueue::new(
            "/a2b.mq".to_string(),
            QueueDirection::Outbound,
            Timeout::from_secs(3),
            10,
            1024,
        );
        assert!(!blocking.spec.nonblocking);
        assert!(!blocking.is_open());

        let nonblocking: DirectionalQueue<()> = DirectionalQueue::new(
            "/b2a.mq".to_string(),
            QueueDirection::Inbound,
            Timeout::from_secs(0),
            10,
            1024,
        );
        assert!(nonblocking.spec.nonblocking);
        assert_eq!(nonblocking.spec.mode, 0o664);
    }
}
