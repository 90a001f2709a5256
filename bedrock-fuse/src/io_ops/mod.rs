//! Raw, synchronous I/O primitives over the `/dev/fuse` file descriptor.
//!
//! Every session worker thread blocks in [`SubChannel::do_receive`] waiting for the next
//! kernel request, and replies with a single `writev` via [`SubChannel::send`]. There is no
//! async runtime involved: one kernel request occupies one OS thread for the duration of its
//! handler, matching how the FUSE kernel driver dispatches work across worker threads.

use libc::{self, c_void, size_t};

use std::io::IoSlice;
use std::os::unix::prelude::AsRawFd;
use std::{
    ops::Deref,
    os::unix::io::RawFd,
    sync::{atomic::AtomicBool, Arc},
};

use std::io;

/// In the latest version of rust this isn't required since RawFd implements AsRawFD
/// but until pretty recently that didn't work. So including this wrapper is cheap and allows
/// us better compatibility.
#[derive(Debug)]
pub struct FileDescriptorRawHandle {
    pub(in crate) fd: RawFd,
    is_closed: AtomicBool,
}

impl FileDescriptorRawHandle {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            is_closed: AtomicBool::default(),
        }
    }
    pub fn close(&self) {
        let already_closed = self
            .is_closed
            .swap(true, std::sync::atomic::Ordering::SeqCst);
        if !already_closed {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}
impl Drop for FileDescriptorRawHandle {
    fn drop(&mut self) {
        self.close()
    }
}

impl AsRawFd for FileDescriptorRawHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// A blocking duplex channel over a single `/dev/fuse` file descriptor.
#[derive(Debug, Clone)]
pub struct SubChannel {
    fd: Arc<FileDescriptorRawHandle>,
}

impl SubChannel {
    pub fn as_raw_fd(&self) -> &FileDescriptorRawHandle {
        &self.fd
    }

    pub fn new(fd: FileDescriptorRawHandle) -> io::Result<SubChannel> {
        Ok(SubChannel { fd: Arc::new(fd) })
    }

    /// Send all data in the slice of slices of bytes in a single `writev` (can block).
    pub fn send(&self, buffer: &[&[u8]]) -> io::Result<()> {
        let iovecs: Vec<_> = buffer
            .iter()
            .map(|d| libc::iovec {
                iov_base: d.as_ptr() as *mut c_void,
                iov_len: d.len() as size_t,
            })
            .collect();
        let rc = unsafe { libc::writev(self.fd.fd, iovecs.as_ptr(), iovecs.len() as libc::c_int) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn close(&self) {
        self.fd.close()
    }

    /// Block until a request arrives, or the kernel tears down the mount.
    pub fn do_receive(&self, buffer: &mut [u8]) -> io::Result<usize> {
        blocking_receive(&self.fd, buffer)
    }
}

/// Receives data up to the capacity of the given buffer (blocks until data or an error).
fn blocking_receive(fd: &FileDescriptorRawHandle, buffer: &mut [u8]) -> io::Result<usize> {
    let rc = unsafe {
        libc::read(
            fd.fd,
            buffer.as_mut_ptr() as *mut c_void,
            buffer.len() as size_t,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

/// Shared, cloneable handle to a [`SubChannel`]; implements [`crate::reply::ReplySender`] so it
/// can be handed to a [`crate::reply::ReplyHandler`] as the reply destination for a request.
#[derive(Debug, Clone)]
pub struct ArcSubChannel(pub(crate) Arc<SubChannel>);

impl ArcSubChannel {
    pub fn new(sub_channel: SubChannel) -> Self {
        Self(Arc::new(sub_channel))
    }

    pub fn as_raw_fd(&self) -> &FileDescriptorRawHandle {
        self.0.as_ref().as_raw_fd()
    }

    pub fn close(&self) {
        self.0.close()
    }
}

impl Deref for ArcSubChannel {
    type Target = SubChannel;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl crate::reply::ReplySender for ArcSubChannel {
    fn send(&self, data: &[IoSlice<'_>]) -> io::Result<()> {
        let bufs: Vec<&[u8]> = data.iter().map(|s| &s[..]).collect();
        SubChannel::send(self.0.as_ref(), &bufs)
    }

    #[cfg(feature = "abi-7-40")]
    fn open_backing(&self, _fd: std::os::fd::BorrowedFd<'_>) -> io::Result<crate::passthrough::BackingId> {
        Err(io::Error::from_raw_os_error(libc::ENOSYS))
    }
}

/// Alias used by [`crate::notify::Notifier`] to send out-of-band notifications on the same
/// channel a session uses to reply to requests.
pub(crate) type ChannelSender = ArcSubChannel;
