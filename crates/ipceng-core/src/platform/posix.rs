//! POSIX message queue and shared memory backend.
//!
//! Message queues go through `libc` directly because the timed variants
//! (`mq_timedsend`/`mq_timedreceive`) are needed; shared memory goes through
//! `nix`.

#![allow(unsafe_code)]

use super::{IpcBackend, QueueDirection, QueueSpec, SharedMapping};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::ffi::{c_void, CString};
use std::io;
use std::mem::ManuallyDrop;
use std::num::NonZeroUsize;
use std::os::fd::{IntoRawFd, OwnedFd};
use std::ptr::NonNull;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Backend over the host's POSIX IPC namespaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixBackend;

impl PosixBackend {
    pub fn new() -> Self {
        Self
    }
}

/// Open message queue descriptor. Closed on drop.
#[derive(Debug)]
pub struct PosixQueue {
    mqd: libc::mqd_t,
}

impl PosixQueue {
    fn into_raw(self) -> libc::mqd_t {
        ManuallyDrop::new(self).mqd
    }
}

impl Drop for PosixQueue {
    fn drop(&mut self) {
        // SAFETY: mqd came from a successful mq_open and is owned by this
        // handle alone; into_raw() skips this drop.
        unsafe {
            libc::mq_close(self.mqd);
        }
    }
}

/// Shared read-write mapping. Unmapped on drop.
#[derive(Debug)]
pub struct PosixMapping {
    ptr: NonNull<c_void>,
    len: usize,
}

// SAFETY: the mapping is owned by exactly one PosixMapping and is not tied
// to the thread that created it.
unsafe impl Send for PosixMapping {}

impl PosixMapping {
    fn bytes(&self) -> &[u8] {
        // SAFETY: ptr..ptr+len is a live mapping for as long as self exists.
        // Other processes may write to it concurrently; the engine documents
        // reads as unsynchronized.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in bytes(); &mut self guarantees no other view exists
        // in this process.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }

    fn into_raw(self) -> (NonNull<c_void>, usize) {
        let this = ManuallyDrop::new(self);
        (this.ptr, this.len)
    }
}

impl Drop for PosixMapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe a mapping created by mmap and not yet
        // unmapped; no slices borrowed from it outlive self.
        let _ = unsafe { munmap(self.ptr, self.len) };
    }
}

impl SharedMapping for PosixMapping {
    fn len(&self) -> usize {
        self.len
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        let range = checked_range(offset, buf.len(), self.len)?;
        buf.copy_from_slice(&self.bytes()[range]);
        Ok(())
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) -> io::Result<()> {
        let range = checked_range(offset, data.len(), self.len)?;
        self.bytes_mut()[range].copy_from_slice(data);
        Ok(())
    }
}

impl IpcBackend for PosixBackend {
    type Queue = PosixQueue;
    type Segment = OwnedFd;
    type Mapping = PosixMapping;

    fn open_queue(&self, name: &str, spec: &QueueSpec) -> io::Result<PosixQueue> {
        let c_name = c_name(name)?;
        let mut oflag = libc::O_CREAT
            | match spec.direction {
                QueueDirection::Outbound => libc::O_WRONLY,
                QueueDirection::Inbound => libc::O_RDONLY,
            };
        if spec.nonblocking {
            oflag |= libc::O_NONBLOCK;
        }

        // SAFETY: mq_attr is plain old data; all-zero is a valid value.
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        attr.mq_maxmsg = to_c_long(spec.max_messages)?;
        attr.mq_msgsize = to_c_long(spec.max_message_size)?;

        // SAFETY: c_name is NUL-terminated and outlives the call. With
        // O_CREAT, mq_open(3) reads a mode_t and an mq_attr pointer from the
        // variadic arguments; attr is valid for the duration of the call.
        let mqd = unsafe {
            libc::mq_open(
                c_name.as_ptr(),
                oflag,
                spec.mode as libc::mode_t,
                &mut attr as *mut libc::mq_attr,
            )
        };
        if mqd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(PosixQueue { mqd })
    }

    fn close_queue(&self, queue: PosixQueue) -> io::Result<()> {
        let mqd = queue.into_raw();
        // SAFETY: mqd is an open descriptor whose ownership was just taken
        // out of the handle, so it is closed exactly once.
        if unsafe { libc::mq_close(mqd) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn unlink_queue(&self, name: &str) -> io::Result<()> {
        let c_name = c_name(name)?;
        // SAFETY: c_name is NUL-terminated and outlives the call.
        if unsafe { libc::mq_unlink(c_name.as_ptr()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn queue_exists(&self, name: &str) -> io::Result<bool> {
        let c_name = c_name(name)?;
        // SAFETY: without O_CREAT mq_open takes no variadic arguments.
        let mqd = unsafe { libc::mq_open(c_name.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK) };
        if mqd == -1 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENOENT) => Ok(false),
                Some(libc::EACCES) => Ok(true),
                _ => Err(err),
            };
        }
        drop(PosixQueue { mqd });
        Ok(true)
    }

    fn send(
        &self,
        queue: &PosixQueue,
        payload: &[u8],
        priority: u32,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let ptr = payload.as_ptr().cast::<libc::c_char>();
        let rc = match timeout {
            Some(timeout) => {
                let deadline = realtime_deadline(timeout)?;
                // SAFETY: ptr/len describe the payload slice, deadline lives
                // on the stack for the whole call.
                unsafe { libc::mq_timedsend(queue.mqd, ptr, payload.len(), priority, &deadline) }
            }
            // SAFETY: ptr/len describe the payload slice.
            None => unsafe { libc::mq_send(queue.mqd, ptr, payload.len(), priority) },
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn receive(
        &self,
        queue: &PosixQueue,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<(usize, u32)> {
        let mut priority: libc::c_uint = 0;
        let ptr = buf.as_mut_ptr().cast::<libc::c_char>();
        let len = match timeout {
            Some(timeout) => {
                let deadline = realtime_deadline(timeout)?;
                // SAFETY: ptr/len describe the writable buffer; priority and
                // deadline are valid for the whole call.
                unsafe {
                    libc::mq_timedreceive(queue.mqd, ptr, buf.len(), &mut priority, &deadline)
                }
            }
            // SAFETY: ptr/len describe the writable buffer.
            None => unsafe { libc::mq_receive(queue.mqd, ptr, buf.len(), &mut priority) },
        };
        // A negative count is the only failure; zero-length messages are valid.
        let len = usize::try_from(len).map_err(|_| io::Error::last_os_error())?;
        Ok((len, priority))
    }

    fn open_segment(&self, name: &str, mode: u32) -> io::Result<(OwnedFd, bool)> {
        let mode = Mode::from_bits_truncate(mode as libc::mode_t);
        // Retry while a peer unlinks the object between the two opens.
        loop {
            match shm_open(name, OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR, mode) {
                Ok(fd) => return Ok((fd, true)),
                Err(Errno::EEXIST) => {}
                Err(e) => return Err(e.into()),
            }
            match shm_open(name, OFlag::O_RDWR, Mode::empty()) {
                Ok(fd) => return Ok((fd, false)),
                Err(Errno::ENOENT) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn resize_segment(&self, segment: &OwnedFd, size: usize) -> io::Result<()> {
        let len = libc::off_t::try_from(size).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "segment size too large")
        })?;
        ftruncate(segment, len)?;
        Ok(())
    }

    fn map_segment(&self, segment: &OwnedFd, size: usize) -> io::Result<PosixMapping> {
        let length = NonZeroUsize::new(size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "can't map zero bytes"))?;
        // SAFETY: the kernel picks the address, so the new mapping aliases no
        // existing Rust object; the descriptor is open for the call.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                segment,
                0,
            )
        }?;
        Ok(PosixMapping { ptr, len: size })
    }

    fn unmap_segment(&self, mapping: PosixMapping) -> io::Result<()> {
        let (ptr, len) = mapping.into_raw();
        // SAFETY: ownership of the mapping was taken out of the handle, so it
        // is unmapped exactly once and nothing borrows from it.
        unsafe { munmap(ptr, len) }?;
        Ok(())
    }

    fn close_segment(&self, segment: OwnedFd) -> io::Result<()> {
        nix::unistd::close(segment.into_raw_fd())?;
        Ok(())
    }

    fn unlink_segment(&self, name: &str) -> io::Result<()> {
        shm_unlink(name)?;
        Ok(())
    }

    fn segment_exists(&self, name: &str) -> io::Result<bool> {
        match shm_open(name, OFlag::O_RDONLY, Mode::empty()) {
            Ok(_fd) => Ok(true),
            Err(Errno::ENOENT) => Ok(false),
            Err(Errno::EACCES) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains NUL"))
}

fn to_c_long(value: usize) -> io::Result<libc::c_long> {
    libc::c_long::try_from(value)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "queue attribute too large"))
}

fn checked_range(offset: usize, len: usize, total: usize) -> io::Result<std::ops::Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= total => Ok(offset..end),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "range outside mapping",
        )),
    }
}

/// Absolute CLOCK_REALTIME deadline `timeout` from now, as the timed queue
/// calls expect.
fn realtime_deadline(timeout: Duration) -> io::Result<libc::timespec> {
    let deadline = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|now| now.checked_add(timeout))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid deadline"))?;

    // SAFETY: timespec is plain old data; all-zero is a valid value.
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    ts.tv_sec = libc::time_t::try_from(deadline.as_secs())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "timeout too large"))?;
    ts.tv_nsec = deadline.subsec_nanos().try_into().unwrap_or(0);
    Ok(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_range() {
        assert_eq!(checked_range(0, 13, 100).unwrap(), 0..13);
        assert_eq!(checked_range(90, 10, 100).unwrap(), 90..100);
        assert!(checked_range(91, 10, 100).is_err());
        assert!(checked_range(usize::MAX, 2, 100).is_err());
    }

    #[test]
    fn test_realtime_deadline_is_in_future() {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        let ts = realtime_deadline(Duration::from_secs(3)).unwrap();
        assert!(ts.tv_sec as u64 >= now.as_secs() + 2);
        assert!(ts.tv_nsec >= 0 && ts.tv_nsec < 1_000_000_000);
    }

    #[test]
    fn test_missing_queue_does_not_exist() {
        let name = format!("/ipceng-missing-{}.mq", std::process::id());
        assert!(!PosixBackend.queue_exists(&name).unwrap());
    }

    #[test]
    fn test_name_with_nul_rejected() {
        assert_eq!(
            c_name("/a\0b").unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }
}
