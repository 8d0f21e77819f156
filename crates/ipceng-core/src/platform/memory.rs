//! In-process emulation of the message queue and shared memory namespaces.
//!
//! Clones of a [`MemoryBackend`] share one namespace, so two engines built
//! from clones of the same backend see each other's queues and segments the
//! way two processes see the host's. Queue semantics follow POSIX: creation
//! attributes apply only to the first opener, unlinked objects stay usable
//! through handles that are still open, messages are delivered highest
//! priority first and FIFO within a priority.
//!
//! [`MemoryBackend::fail_next`] makes the next matching call fail, which is
//! how the engine's rollback paths are exercised.

use super::{IpcBackend, QueueDirection, QueueSpec, SharedMapping};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Backend call that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    OpenQueue,
    CloseQueue,
    UnlinkQueue,
    Send,
    Receive,
    OpenSegment,
    ResizeSegment,
    MapSegment,
    UnmapSegment,
    CloseSegment,
    UnlinkSegment,
}

/// Shared in-memory IPC namespace.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Namespaces>,
}

#[derive(Debug, Default)]
struct Namespaces {
    queues: Mutex<HashMap<String, Arc<QueueObject>>>,
    segments: Mutex<HashMap<String, Arc<SegmentObject>>>,
    faults: Mutex<Vec<(FaultPoint, String)>>,
    live: Arc<LiveHandles>,
}

/// Descriptors still held, whether or not their object was unlinked.
#[derive(Debug, Default)]
struct LiveHandles {
    queues: AtomicUsize,
    segments: AtomicUsize,
}

#[derive(Debug)]
struct QueueObject {
    max_messages: usize,
    max_message_size: usize,
    state: Mutex<QueueContents>,
    changed: Condvar,
    handles: AtomicUsize,
}

#[derive(Debug, Default)]
struct QueueContents {
    messages: Vec<QueuedMessage>,
    next_seq: u64,
}

#[derive(Debug)]
struct QueuedMessage {
    priority: u32,
    seq: u64,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct SegmentObject {
    data: Mutex<Vec<u8>>,
    handles: AtomicUsize,
    mappings: AtomicUsize,
}

/// Queue descriptor into a [`MemoryBackend`].
#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    object: Arc<QueueObject>,
    live: Arc<LiveHandles>,
    direction: QueueDirection,
    nonblocking: bool,
}

impl Drop for MemoryQueue {
    fn drop(&mut self) {
        self.object.handles.fetch_sub(1, Ordering::SeqCst);
        self.live.queues.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared memory descriptor into a [`MemoryBackend`].
#[derive(Debug)]
pub struct MemorySegment {
    name: String,
    object: Arc<SegmentObject>,
    live: Arc<LiveHandles>,
}

impl Drop for MemorySegment {
    fn drop(&mut self) {
        self.object.handles.fetch_sub(1, Ordering::SeqCst);
        self.live.segments.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mapping of a [`MemorySegment`].
#[derive(Debug)]
pub struct MemoryMapping {
    name: String,
    object: Arc<SegmentObject>,
    len: usize,
}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        self.object.mappings.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SharedMapping for MemoryMapping {
    fn len(&self) -> usize {
        self.len
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        let range = mapped_range(offset, buf.len(), self.len)?;
        let data = lock(&self.object.data);
        let src = data.get(range).ok_or_else(past_end_of_object)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) -> io::Result<()> {
        let range = mapped_range(offset, data.len(), self.len)?;
        let mut contents = lock(&self.object.data);
        let dst = contents.get_mut(range).ok_or_else(past_end_of_object)?;
        dst.copy_from_slice(data);
        Ok(())
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `point` call on object `name` fail.
    ///
    /// Faults are one-shot and matched in the order they were added.
    pub fn fail_next(&self, point: FaultPoint, name: &str) {
        lock(&self.shared.faults).push((point, name.to_string()));
    }

    /// Number of faults added but not yet triggered.
    pub fn pending_faults(&self) -> usize {
        lock(&self.shared.faults).len()
    }

    /// Open descriptors on queue `name`, 0 if it doesn't exist.
    pub fn queue_handles(&self, name: &str) -> usize {
        lock(&self.shared.queues)
            .get(name)
            .map(|q| q.handles.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Queue descriptors held anywhere in this namespace, including ones on
    /// queues that have since been unlinked.
    pub fn live_queue_handles(&self) -> usize {
        self.shared.live.queues.load(Ordering::SeqCst)
    }

    /// Messages waiting in queue `name`, 0 if it doesn't exist.
    pub fn queued_messages(&self, name: &str) -> usize {
        lock(&self.shared.queues)
            .get(name)
            .map(|q| lock(&q.state).messages.len())
            .unwrap_or(0)
    }

    /// Names of all existing queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.shared.queues).keys().cloned().collect();
        names.sort();
        names
    }

    /// Open descriptors on segment `name`, 0 if it doesn't exist.
    pub fn segment_handles(&self, name: &str) -> usize {
        lock(&self.shared.segments)
            .get(name)
            .map(|s| s.handles.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Segment descriptors held anywhere in this namespace, including ones on
    /// segments that have since been unlinked.
    pub fn live_segment_handles(&self) -> usize {
        self.shared.live.segments.load(Ordering::SeqCst)
    }

    /// Live mappings of segment `name`, 0 if it doesn't exist.
    pub fn segment_mappings(&self, name: &str) -> usize {
        lock(&self.shared.segments)
            .get(name)
            .map(|s| s.mappings.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Current size of segment `name`, `None` if it doesn't exist.
    pub fn segment_size(&self, name: &str) -> Option<usize> {
        lock(&self.shared.segments)
            .get(name)
            .map(|s| lock(&s.data).len())
    }

    /// Names of all existing segments, sorted.
    pub fn segment_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.shared.segments).keys().cloned().collect();
        names.sort();
        names
    }

    fn check_fault(&self, point: FaultPoint, name: &str) -> io::Result<()> {
        let mut faults = lock(&self.shared.faults);
        match faults.iter().position(|(p, n)| *p == point && n == name) {
            Some(index) => {
                faults.remove(index);
                Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("injected {:?} fault on {}", point, name),
                ))
            }
            None => Ok(()),
        }
    }
}

impl IpcBackend for MemoryBackend {
    type Queue = MemoryQueue;
    type Segment = MemorySegment;
    type Mapping = MemoryMapping;

    fn open_queue(&self, name: &str, spec: &QueueSpec) -> io::Result<MemoryQueue> {
        self.check_fault(FaultPoint::OpenQueue, name)?;

        let mut queues = lock(&self.shared.queues);
        let object = match queues.get(name) {
            Some(object) => Arc::clone(object),
            None => {
                if spec.max_messages == 0 || spec.max_message_size == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "queue attributes must be positive",
                    ));
                }
                let object = Arc::new(QueueObject {
                    max_messages: spec.max_messages,
                    max_message_size: spec.max_message_size,
                    state: Mutex::new(QueueContents::default()),
                    changed: Condvar::new(),
                    handles: AtomicUsize::new(0),
                });
                queues.insert(name.to_string(), Arc::clone(&object));
                object
            }
        };
        object.handles.fetch_add(1, Ordering::SeqCst);
        self.shared.live.queues.fetch_add(1, Ordering::SeqCst);

        Ok(MemoryQueue {
            name: name.to_string(),
            object,
            live: Arc::clone(&self.shared.live),
            direction: spec.direction,
            nonblocking: spec.nonblocking,
        })
    }

    fn close_queue(&self, queue: MemoryQueue) -> io::Result<()> {
        let name = queue.name.clone();
        drop(queue);
        self.check_fault(FaultPoint::CloseQueue, &name)
    }

    fn unlink_queue(&self, name: &str) -> io::Result<()> {
        self.check_fault(FaultPoint::UnlinkQueue, name)?;
        match lock(&self.shared.queues).remove(name) {
            Some(_) => Ok(()),
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn queue_exists(&self, name: &str) -> io::Result<bool> {
        Ok(lock(&self.shared.queues).contains_key(name))
    }

    fn send(
        &self,
        queue: &MemoryQueue,
        payload: &[u8],
        priority: u32,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        self.check_fault(FaultPoint::Send, &queue.name)?;
        if queue.direction != QueueDirection::Outbound {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "queue not open for writing",
            ));
        }

        let object = &queue.object;
        if payload.len() > object.max_message_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "message too long",
            ));
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock(&object.state);
        while state.messages.len() >= object.max_messages {
            state = wait_for_change(&object.changed, state, queue.nonblocking, deadline)?;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.messages.push(QueuedMessage {
            priority,
            seq,
            payload: payload.to_vec(),
        });
        object.changed.notify_all();
        Ok(())
    }

    fn receive(
        &self,
        queue: &MemoryQueue,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<(usize, u32)> {
        self.check_fault(FaultPoint::Receive, &queue.name)?;
        if queue.direction != QueueDirection::Inbound {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "queue not open for reading",
            ));
        }

        let object = &queue.object;
        if buf.len() < object.max_message_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer smaller than queue message size",
            ));
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock(&object.state);
        let index = loop {
            let next = state
                .messages
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
                .map(|(index, _)| index);
            match next {
                Some(index) => break index,
                None => {
                    state = wait_for_change(&object.changed, state, queue.nonblocking, deadline)?
                }
            }
        };

        let message = state.messages.remove(index);
        object.changed.notify_all();
        let len = message.payload.len();
        buf[..len].copy_from_slice(&message.payload);
        Ok((len, message.priority))
    }

    fn open_segment(&self, name: &str, _mode: u32) -> io::Result<(MemorySegment, bool)> {
        self.check_fault(FaultPoint::OpenSegment, name)?;
        let mut segments = lock(&self.shared.segments);
        let created = !segments.contains_key(name);
        let object = Arc::clone(segments.entry(name.to_string()).or_default());
        drop(segments);

        object.handles.fetch_add(1, Ordering::SeqCst);
        self.shared.live.segments.fetch_add(1, Ordering::SeqCst);
        let segment = MemorySegment {
            name: name.to_string(),
            object,
            live: Arc::clone(&self.shared.live),
        };
        Ok((segment, created))
    }

    fn resize_segment(&self, segment: &MemorySegment, size: usize) -> io::Result<()> {
        self.check_fault(FaultPoint::ResizeSegment, &segment.name)?;
        lock(&segment.object.data).resize(size, 0);
        Ok(())
    }

    fn map_segment(&self, segment: &MemorySegment, size: usize) -> io::Result<MemoryMapping> {
        self.check_fault(FaultPoint::MapSegment, &segment.name)?;
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "can't map zero bytes",
            ));
        }
        segment.object.mappings.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryMapping {
            name: segment.name.clone(),
            object: Arc::clone(&segment.object),
            len: size,
        })
    }

    fn unmap_segment(&self, mapping: MemoryMapping) -> io::Result<()> {
        let name = mapping.name.clone();
        drop(mapping);
        self.check_fault(FaultPoint::UnmapSegment, &name)
    }

    fn close_segment(&self, segment: MemorySegment) -> io::Result<()> {
        let name = segment.name.clone();
        drop(segment);
        self.check_fault(FaultPoint::CloseSegment, &name)
    }

    fn unlink_segment(&self, name: &str) -> io::Result<()> {
        self.check_fault(FaultPoint::UnlinkSegment, name)?;
        match lock(&self.shared.segments).remove(name) {
            Some(_) => Ok(()),
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn segment_exists(&self, name: &str) -> io::Result<bool> {
        Ok(lock(&self.shared.segments).contains_key(name))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Block until the queue changes, honoring non-blocking mode and deadline.
fn wait_for_change<'a>(
    changed: &Condvar,
    guard: MutexGuard<'a, QueueContents>,
    nonblocking: bool,
    deadline: Option<Instant>,
) -> io::Result<MutexGuard<'a, QueueContents>> {
    if nonblocking {
        return Err(io::Error::from(io::ErrorKind::WouldBlock));
    }
    match deadline {
        None => Ok(changed.wait(guard).unwrap_or_else(PoisonError::into_inner)),
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::from(io::ErrorKind::TimedOut));
            }
            let (guard, _) = changed
                .wait_timeout(guard, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            Ok(guard)
        }
    }
}

fn mapped_range(offset: usize, len: usize, total: usize) -> io::Result<std::ops::Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= total => Ok(offset..end),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "range outside mapping",
        )),
    }
}

fn past_end_of_object() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "mapping extends past end of object",
    )
}
