//! Out-of-band notifications sent to the kernel outside of a request/reply cycle.
//!
//! These use the same `/dev/fuse` channel a session replies on, but are not associated with
//! any pending request: the kernel distinguishes them by `unique == 0` and a notification code
//! in place of the usual error field.

#[allow(unused)]
use std::convert::TryInto;
#[allow(unused)]
use std::ffi::OsStr;
use std::io::{self, IoSlice};
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;

use zerocopy::IntoBytes;

use crate::io_ops::ChannelSender;
use crate::ll::fuse_abi::{
    fuse_notify_code as notify_code, fuse_notify_delete_out, fuse_notify_inval_entry_out,
    fuse_notify_inval_inode_out, fuse_notify_poll_wakeup_out, fuse_notify_store_out,
    fuse_out_header,
};
use crate::INodeNo;

/// A handle to a pending `poll()` request.
#[derive(Copy, Clone, Debug)]
pub struct PollHandle(pub u64);

/// A [handle](PollHandle) to a pending `poll()` request coupled with notifier reference.
/// Can be saved and used to notify the kernel when a poll is ready.
#[derive(Clone)]
pub struct PollNotifier {
    handle: PollHandle,
    notifier: Notifier,
}

impl PollNotifier {
    pub(crate) fn new(cs: ChannelSender, kh: PollHandle) -> Self {
        Self {
            handle: kh,
            notifier: Notifier::new(cs),
        }
    }

    /// Handle associated with this poll notifier.
    pub fn handle(&self) -> PollHandle {
        self.handle
    }

    /// Notify the kernel that the associated file handle is ready to be polled.
    /// # Errors
    /// Returns an error if the kernel rejects the notification.
    pub fn notify(self) -> io::Result<()> {
        self.notifier.poll(self.handle)
    }
}

impl std::fmt::Debug for PollNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PollHandle").field(&self.handle).finish()
    }
}

/// A handle by which the application can send notifications to the server
#[derive(Debug, Clone)]
pub struct Notifier(ChannelSender);

impl Notifier {
    pub(crate) fn new(cs: ChannelSender) -> Self {
        Self(cs)
    }

    /// Notify poll clients of I/O readiness
    /// # Errors
    /// Returns an error if the kernel rejects the notification.
    pub fn poll(&self, kh: PollHandle) -> io::Result<()> {
        let body = fuse_notify_poll_wakeup_out { kh: kh.0 };
        self.send(notify_code::FUSE_POLL, &[body.as_bytes()])
    }

    /// Invalidate the kernel cache for a given directory entry
    /// # Errors
    /// Returns an error if the notification data is too large.
    /// Returns an error if the kernel rejects the notification.
    pub fn inval_entry(&self, parent: INodeNo, name: &OsStr) -> io::Result<()> {
        let namelen: u32 = name
            .len()
            .try_into()
            .map_err(Self::too_big_err)?;
        let body = fuse_notify_inval_entry_out {
            parent: parent.0,
            namelen,
            padding: 0,
        };
        self.send_inval(
            notify_code::FUSE_NOTIFY_INVAL_ENTRY,
            &[body.as_bytes(), name.as_bytes(), b"\0"],
        )
    }

    /// Invalidate the kernel cache for a given inode (metadata and
    /// data in the given range)
    /// # Errors
    /// Returns an error if the kernel rejects the notification.
    pub fn inval_inode(&self, ino: INodeNo, offset: i64, len: i64) -> io::Result<()> {
        let body = fuse_notify_inval_inode_out {
            ino: ino.0,
            off: offset,
            len,
        };
        self.send_inval(notify_code::FUSE_NOTIFY_INVAL_INODE, &[body.as_bytes()])
    }

    /// Update the kernel's cached copy of a given inode's data
    /// # Errors
    /// Returns an error if the notification data is too large.
    /// Returns an error if the kernel rejects the notification.
    pub fn store(&self, ino: INodeNo, offset: u64, data: &[u8]) -> io::Result<()> {
        let size: u32 = data.len().try_into().map_err(Self::too_big_err)?;
        let body = fuse_notify_store_out {
            nodeid: ino.0,
            offset,
            size,
            padding: 0,
        };
        // Not strictly an invalidate, but the inode we're operating
        // on may have been evicted anyway, so treat is as such
        self.send_inval(notify_code::FUSE_NOTIFY_STORE, &[body.as_bytes(), data])
    }

    /// Invalidate the kernel cache for a given directory entry and inform
    /// inotify watchers of a file deletion.
    /// # Errors
    /// Returns an error if the notification data is too large.
    /// Returns an error if the kernel rejects the notification.
    pub fn delete(&self, parent: INodeNo, child: INodeNo, name: &OsStr) -> io::Result<()> {
        let namelen: u32 = name
            .len()
            .try_into()
            .map_err(Self::too_big_err)?;
        let body = fuse_notify_delete_out {
            parent: parent.0,
            child: child.0,
            namelen,
            padding: 0,
        };
        self.send_inval(
            notify_code::FUSE_NOTIFY_DELETE,
            &[body.as_bytes(), name.as_bytes(), b"\0"],
        )
    }

    #[allow(unused)]
    fn send_inval(&self, code: notify_code, payload: &[&[u8]]) -> io::Result<()> {
        match self.send(code, payload) {
            // ENOENT is harmless for an invalidation (the
            // kernel may have already dropped the cached
            // entry on its own anyway), so ignore it.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            x => x,
        }
    }

    fn send(&self, code: notify_code, payload: &[&[u8]]) -> io::Result<()> {
        let body_len: usize = payload.iter().map(|s| s.len()).sum();
        let header = fuse_out_header {
            len: (size_of::<fuse_out_header>() + body_len) as u32,
            error: -(code as i32),
            unique: 0,
        };
        let header_bytes = header.as_bytes();
        let mut iov: Vec<IoSlice<'_>> = Vec::with_capacity(payload.len() + 1);
        iov.push(IoSlice::new(header_bytes));
        for chunk in payload {
            iov.push(IoSlice::new(chunk));
        }
        crate::reply::ReplySender::send(&self.0, &iov)
    }

    /// Create an error for indicating when a notification message
    /// would exceed the capacity that its length descriptor field is
    /// capable of encoding.
    fn too_big_err(tfie: std::num::TryFromIntError) -> io::Error {
        io::Error::new(io::ErrorKind::Other, format!("Data too large: {tfie:?}"))
    }
}
