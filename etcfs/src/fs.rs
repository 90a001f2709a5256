//! The etcfs `Filesystem` implementation (spec §4.6): per-path routing to
//! a caller's local stratum or the configured global stratum, override
//! enforcement, and the full read/write FUSE surface `/etc` needs.

use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bedrock_core::config::{require_root, validate_command_bytes};
use bedrock_core::error::{CoreError, CoreResult};
use bedrock_core::identity::{impersonate, CallerIdentity};
use bedrock_core::resolve::{confine, ConfinedPath};
use bedrock_core::stratum::{StratumHandle, StratumPool};

use bedrock_fuse::{
    AccessFlags, Bytes, Dirent, DirentList, Entry, FileAttr, FileHandle, FileType, FopenFlags,
    INodeNo, KernelConfig, OpenFlags, ReadFlags, RenameFlags, Request, Statfs, WriteFlags, Xattr,
};

use crate::config::{EtcConfigStore, Override};
use crate::handle::HandleTable;
use crate::inode::InodeTable;
use crate::override_engine;
use crate::resolver::{self, Classification};

const NO_CACHE: Duration = Duration::ZERO;

pub struct EtcFs {
    strata_root: PathBuf,
    global_stratum: String,
    pool: StratumPool,
    config: EtcConfigStore,
    inodes: InodeTable,
    handles: HandleTable,
}

/// A path that has been classified, resolved to a stratum, and had any
/// declared override enforced on it. `real_path` is a chroot-escape-safe
/// alias (spec §4.3), not a raw join of the stratum root and `etc_path`.
struct Resolved {
    stratum: Arc<StratumHandle>,
    etc_path: PathBuf,
    real_path: ConfinedPath,
}

impl EtcFs {
    pub fn new(strata_root: PathBuf, global_stratum: String) -> EtcFs {
        EtcFs {
            pool: StratumPool::new(strata_root.clone()),
            strata_root,
            global_stratum,
            config: EtcConfigStore::new(crate::config::EtcConfig::new()),
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
        }
    }

    fn path_for(&self, ino: INodeNo) -> CoreResult<PathBuf> {
        self.inodes.path_for_ino(ino.0).ok_or(CoreError::NotFound)
    }

    fn local_alias_target(&self, identity: &CallerIdentity) -> CoreResult<PathBuf> {
        let handle = bedrock_core::stratum::resolve_local_stratum(&self.pool, identity)?;
        Ok(self.strata_root.join(handle.name()))
    }

    /// Classify, route to a stratum, enforce any declared override, and
    /// return the backing real path (spec §4.5 "before any other work").
    fn resolve(&self, identity: &CallerIdentity, path: &Path) -> CoreResult<Resolved> {
        let classification = {
            let config = self.config.read();
            resolver::classify(&config, path)
        };
        let Classification::Routed { etc_path, global } = classification else {
            return Err(CoreError::InvalidArgument("not a routed path".into()));
        };
        let stratum = resolver::backing_stratum(&self.pool, identity, &self.global_stratum, global)?;
        let real_path = confine(&stratum, &etc_path)?;
        let etc_path_str = etc_path.to_string_lossy();
        override_engine::enforce(&self.config, &etc_path_str, &real_path)?;
        Ok(Resolved { stratum, etc_path, real_path })
    }

    fn classify_only(&self, path: &Path) -> Classification {
        let config = self.config.read();
        resolver::classify(&config, path)
    }

    fn control_file_path() -> PathBuf {
        Path::new("/").join(resolver::CONTROL_FILE_NAME)
    }

    fn attr_for_routed(&self, ino: u64, real_path: &Path) -> CoreResult<FileAttr> {
        let meta = fs::symlink_metadata(real_path)?;
        Ok(to_file_attr(ino, &meta))
    }

    /// Reverse a previously-applied `inject` override on the caller's own
    /// routing before it is dropped from the table (spec §4.5 "Uninjection").
    /// Best effort: only the stratum the override currently routes to (for
    /// the caller issuing the control write) is touched; a missing backing
    /// file simply has nothing to uninject.
    fn uninject_for_writer(&self, identity: &CallerIdentity, etc_path: &str, needle: &[u8]) {
        let global = self.config.read().is_global(etc_path);
        let Ok(stratum) = resolver::backing_stratum(&self.pool, identity, &self.global_stratum, global)
        else {
            return;
        };
        let Ok(real_path) = confine(&stratum, Path::new(etc_path)) else {
            return;
        };
        let _ = override_engine::uninject(&real_path, needle);
    }
}

fn to_file_attr(ino: u64, meta: &fs::Metadata) -> FileAttr {
    let kind = FileType::from_std(meta.file_type()).unwrap_or(FileType::RegularFile);
    FileAttr {
        ino: INodeNo(ino),
        size: meta.size(),
        blocks: meta.blocks(),
        atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        ctime: SystemTime::UNIX_EPOCH + Duration::from_secs(meta.ctime().max(0) as u64),
        crtime: SystemTime::UNIX_EPOCH,
        kind,
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

fn dir_attr(ino: u64, perm: u16) -> FileAttr {
    FileAttr {
        ino: INodeNo(ino),
        size: 0,
        blocks: 0,
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        crtime: SystemTime::UNIX_EPOCH,
        kind: FileType::Directory,
        perm,
        nlink: 2,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn symlink_attr(ino: u64, size: u64) -> FileAttr {
    FileAttr {
        ino: INodeNo(ino),
        size,
        blocks: 0,
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        crtime: SystemTime::UNIX_EPOCH,
        kind: FileType::Symlink,
        perm: 0o777,
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

impl bedrock_fuse::Filesystem for EtcFs {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::io::Result<()> {
        Ok(())
    }

    fn lookup(&self, req: &Request, parent: INodeNo, name: &OsStr, reply: bedrock_fuse::ReplyEntry) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let Ok(parent_path) = self.path_for(parent) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        let child = if parent_path == Path::new("/") {
            PathBuf::from("/").join(name)
        } else {
            parent_path.join(name)
        };
        match self.classify_only(&child) {
            Classification::Root => {
                let ino = self.inodes.ino_for_path(&child);
                reply.entry(root_entry(ino));
            }
            Classification::ControlFile => {
                let ino = self.inodes.ino_for_path(&child);
                let size = self.config.read().serialize().len() as u64;
                reply.entry(simple_entry(ino, control_file_attr(ino, size)));
            }
            Classification::LocalAlias => match self.local_alias_target(&identity) {
                Ok(target) => {
                    let ino = self.inodes.ino_for_path(&child);
                    reply.entry(simple_entry(ino, symlink_attr(ino, target.as_os_str().len() as u64)));
                }
                Err(e) => reply.error(e.to_errno()),
            },
            Classification::Routed { .. } => match self.resolve(&identity, &child) {
                Ok(resolved) => {
                    let ino = self.inodes.ino_for_path(&child);
                    match self.attr_for_routed(ino, &resolved.real_path) {
                        Ok(attr) => reply.entry(simple_entry(ino, attr)),
                        Err(e) => reply.error(e.to_errno()),
                    }
                }
                Err(e) => reply.error(e.to_errno()),
            },
        }
    }

    fn getattr(&self, req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: bedrock_fuse::ReplyAttr) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let Ok(path) = self.path_for(ino) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        match self.classify_only(&path) {
            Classification::Root => reply.attr(dir_attr(ino.0, 0o755), NO_CACHE),
            Classification::ControlFile => {
                let size = self.config.read().serialize().len() as u64;
                reply.attr(control_file_attr(ino.0, size), NO_CACHE);
            }
            Classification::LocalAlias => match self.local_alias_target(&identity) {
                Ok(target) => reply.attr(symlink_attr(ino.0, target.as_os_str().len() as u64), NO_CACHE),
                Err(e) => reply.error(e.to_errno()),
            },
            Classification::Routed { .. } => match self.resolve(&identity, &path) {
                Ok(resolved) => match self.attr_for_routed(ino.0, &resolved.real_path) {
                    Ok(attr) => reply.attr(attr, NO_CACHE),
                    Err(e) => reply.error(e.to_errno()),
                },
                Err(e) => reply.error(e.to_errno()),
            },
        }
    }

    fn setattr(
        &self,
        req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<bedrock_fuse::TimeOrNow>,
        _mtime: Option<bedrock_fuse::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<bedrock_fuse::BsdFileFlags>,
        reply: bedrock_fuse::ReplyAttr,
    ) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let Ok(path) = self.path_for(ino) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        if path == Self::control_file_path() {
            reply.error(CoreError::ReadOnly.to_errno());
            return;
        }
        let result = self.resolve(&identity, &path).and_then(|resolved| {
            let p = &resolved.real_path;
            if let Some(mode) = mode {
                fs::set_permissions(p, fs::Permissions::from_mode(mode & 0o7777))?;
            }
            if uid.is_some() || gid.is_some() {
                let c_path = std::ffi::CString::new(p.as_os_str().as_bytes()).unwrap();
                let rc = unsafe {
                    libc::chown(
                        c_path.as_ptr(),
                        uid.unwrap_or(u32::MAX),
                        gid.unwrap_or(u32::MAX),
                    )
                };
                if rc != 0 {
                    return Err(std::io::Error::last_os_error().into());
                }
            }
            if let Some(size) = size {
                let f = OpenOptions::new().write(true).open(p)?;
                f.set_len(size)?;
            }
            self.attr_for_routed(ino.0, p)
        });
        match result {
            Ok(attr) => reply.attr(attr, NO_CACHE),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&self, req: &Request, ino: INodeNo, reply: bedrock_fuse::ReplyData) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let Ok(path) = self.path_for(ino) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        let target = match self.classify_only(&path) {
            Classification::LocalAlias => self.local_alias_target(&identity),
            Classification::Routed { .. } => self
                .resolve(&identity, &path)
                .and_then(|r| fs::read_link(&r.real_path).map_err(CoreError::from)),
            _ => Err(CoreError::InvalidArgument("not a symlink".into())),
        };
        match target {
            Ok(target) => reply.data(Bytes::Owned(target.into_os_string().into_encoded_bytes())),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: bedrock_fuse::ReplyEntry,
    ) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let Ok(child) = self.child_path(parent, name) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        let result = self.resolve(&identity, &child).and_then(|r| {
            let c_path = std::ffi::CString::new(r.real_path.as_os_str().as_bytes()).unwrap();
            let rc = unsafe { libc::mknod(c_path.as_ptr(), mode, rdev as libc::dev_t) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            let ino = self.inodes.ino_for_path(&child);
            self.attr_for_routed(ino, &r.real_path).map(|attr| simple_entry(ino, attr))
        });
        match result {
            Ok(entry) => reply.entry(entry),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: bedrock_fuse::ReplyEntry,
    ) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let Ok(child) = self.child_path(parent, name) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        let result = self.resolve(&identity, &child).and_then(|r| {
            fs::create_dir(&r.real_path)?;
            fs::set_permissions(&r.real_path, fs::Permissions::from_mode(mode & 0o7777))?;
            let ino = self.inodes.ino_for_path(&child);
            self.attr_for_routed(ino, &r.real_path).map(|attr| simple_entry(ino, attr))
        });
        match result {
            Ok(entry) => reply.entry(entry),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&self, req: &Request, parent: INodeNo, name: &OsStr, reply: bedrock_fuse::ReplyEmpty) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let Ok(child) = self.child_path(parent, name) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        match self.resolve(&identity, &child).and_then(|r| Ok(fs::remove_file(&r.real_path)?)) {
            Ok(()) => {
                self.inodes.forget_path(&child);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&self, req: &Request, parent: INodeNo, name: &OsStr, reply: bedrock_fuse::ReplyEmpty) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let Ok(child) = self.child_path(parent, name) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        match self.resolve(&identity, &child).and_then(|r| Ok(fs::remove_dir(&r.real_path)?)) {
            Ok(()) => {
                self.inodes.forget_path(&child);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &self,
        req: &Request,
        parent: INodeNo,
        link_name: &OsStr,
        target: &Path,
        reply: bedrock_fuse::ReplyEntry,
    ) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let Ok(child) = self.child_path(parent, link_name) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        let result = self.resolve(&identity, &child).and_then(|r| {
            std::os::unix::fs::symlink(target, &r.real_path)?;
            let ino = self.inodes.ino_for_path(&child);
            self.attr_for_routed(ino, &r.real_path).map(|attr| simple_entry(ino, attr))
        });
        match result {
            Ok(entry) => reply.entry(entry),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    /// The subtlest operation (spec §4.6): refuses any touch on the
    /// control file, then emulates a cross-device move when source and
    /// destination backing paths resolve to different real filesystems
    /// (different local strata, or local vs global).
    fn rename(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        flags: RenameFlags,
        reply: bedrock_fuse::ReplyEmpty,
    ) {
        if !flags.is_empty() {
            // RENAME_EXCHANGE / RENAME_NOREPLACE / RENAME_WHITEOUT: unimplemented
            // (spec §9 open question, SPEC_FULL.md decision: fail closed).
            reply.error(CoreError::Unsupported.to_errno());
            return;
        }
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let (Ok(src), Ok(dst)) = (self.child_path(parent, name), self.child_path(newparent, newname)) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        if src == Self::control_file_path() || dst == Self::control_file_path() {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        }
        let result = (|| -> CoreResult<()> {
            let src_r = self.resolve(&identity, &src)?;
            let dst_r = self.resolve(&identity, &dst)?;
            rename_possibly_cross_device(&src_r.real_path, &dst_r.real_path)?;
            self.inodes.rekey(&src, dst.clone());
            Ok(())
        })();
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn link(
        &self,
        req: &Request,
        ino: INodeNo,
        newparent: INodeNo,
        newname: &OsStr,
        reply: bedrock_fuse::ReplyEntry,
    ) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let (Ok(src), Ok(dst)) = (self.path_for(ino), self.child_path(newparent, newname)) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        let result = (|| -> CoreResult<Entry> {
            let src_r = self.resolve(&identity, &src)?;
            let dst_r = self.resolve(&identity, &dst)?;
            fs::hard_link(&src_r.real_path, &dst_r.real_path)?;
            let new_ino = self.inodes.ino_for_path(&dst);
            self.attr_for_routed(new_ino, &dst_r.real_path).map(|attr| simple_entry(new_ino, attr))
        })();
        match result {
            Ok(entry) => reply.entry(entry),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&self, req: &Request, ino: INodeNo, flags: OpenFlags, reply: bedrock_fuse::ReplyOpen) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let Ok(path) = self.path_for(ino) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        if path == Self::control_file_path() {
            if flags.acc_mode() != bedrock_fuse::OpenAccMode::O_RDONLY && require_root(req.uid()).is_err() {
                reply.error(CoreError::PermissionDenied.to_errno());
                return;
            }
            reply.opened(FileHandle(0), FopenFlags::empty());
            return;
        }
        let result = self.resolve(&identity, &path).and_then(|r| {
            let opts = open_options_for(flags);
            let f = opts.open(&r.real_path)?;
            Ok(self.handles.insert(f))
        });
        match result {
            Ok(fh) => reply.opened(FileHandle(fh), FopenFlags::empty()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: bedrock_fuse::ReplyCreate,
    ) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let Ok(child) = self.child_path(parent, name) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        let result = self.resolve(&identity, &child).and_then(|r| {
            let mut opts = open_options_for(OpenFlags(flags));
            opts.create(true).mode(mode & 0o7777);
            let f = opts.open(&r.real_path)?;
            let ino = self.inodes.ino_for_path(&child);
            let attr = self.attr_for_routed(ino, &r.real_path)?;
            let fh = self.handles.insert(f);
            Ok((simple_entry(ino, attr), fh))
        });
        match result {
            Ok((entry, fh)) => reply.created(entry, FileHandle(fh), FopenFlags::empty()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _read_flags: ReadFlags,
        _flags: u32,
        _lock_owner: Option<bedrock_fuse::LockOwner>,
        reply: bedrock_fuse::ReplyData,
    ) {
        if fh.0 == 0 {
            let Ok(path) = self.path_for(ino) else {
                reply.error(CoreError::NotFound.to_errno());
                return;
            };
            if path == Self::control_file_path() {
                let content = self.config.read().serialize().into_bytes();
                let start = (offset as usize).min(content.len());
                let end = (start + size as usize).min(content.len());
                reply.data(Bytes::Owned(content[start..end].to_vec()));
                return;
            }
        }
        let result = self.handles.with(fh.0, |f| -> std::io::Result<Vec<u8>> {
            f.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; size as usize];
            let n = f.read(&mut buf)?;
            buf.truncate(n);
            Ok(buf)
        });
        match result {
            Some(Ok(buf)) => reply.data(Bytes::Owned(buf)),
            Some(Err(e)) => reply.error(CoreError::from(e).to_errno()),
            None => reply.error(CoreError::NotFound.to_errno()),
        }
    }

    fn write(
        &self,
        req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: i64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<bedrock_fuse::LockOwner>,
        reply: bedrock_fuse::ReplyWrite,
    ) {
        if fh.0 == 0 {
            let Ok(path) = self.path_for(ino) else {
                reply.error(CoreError::NotFound.to_errno());
                return;
            };
            if path == Self::control_file_path() {
                if require_root(req.uid()).is_err() {
                    reply.error(CoreError::PermissionDenied.to_errno());
                    return;
                }
                let Ok(identity) = impersonate(req) else {
                    reply.error(CoreError::PermissionDenied.to_errno());
                    return;
                };
                let result = validate_command_bytes(data).and_then(|line| self.apply_control_command(&identity, line));
                match result {
                    Ok(()) => reply.written(data.len() as u32),
                    Err(e) => reply.error(e.to_errno()),
                }
                return;
            }
        }
        let result = self.handles.with(fh.0, |f| -> std::io::Result<u32> {
            f.seek(SeekFrom::Start(offset as u64))?;
            f.write_all(data)?;
            Ok(data.len() as u32)
        });
        match result {
            Some(Ok(n)) => reply.written(n),
            Some(Err(e)) => reply.error(CoreError::from(e).to_errno()),
            None => reply.error(CoreError::NotFound.to_errno()),
        }
    }

    fn flush(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _lock_owner: bedrock_fuse::LockOwner,
        reply: bedrock_fuse::ReplyEmpty,
    ) {
        if fh.0 != 0 {
            let _ = self.handles.with(fh.0, |f| f.flush());
        }
        reply.ok();
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<bedrock_fuse::LockOwner>,
        _flush: bool,
        reply: bedrock_fuse::ReplyEmpty,
    ) {
        if fh.0 != 0 {
            self.handles.remove(fh.0);
        }
        reply.ok();
    }

    fn fsync(&self, _req: &Request, _ino: INodeNo, fh: FileHandle, datasync: bool, reply: bedrock_fuse::ReplyEmpty) {
        if fh.0 == 0 {
            reply.ok();
            return;
        }
        let result = self.handles.with(fh.0, |f| if datasync { f.sync_data() } else { f.sync_all() });
        match result {
            Some(Ok(())) | None => reply.ok(),
            Some(Err(e)) => reply.error(CoreError::from(e).to_errno()),
        }
    }

    fn fallocate(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: i64,
        length: i64,
        _mode: i32,
        reply: bedrock_fuse::ReplyEmpty,
    ) {
        let result = self.handles.with(fh.0, |f| -> std::io::Result<()> {
            let rc = unsafe { libc::posix_fallocate(std::os::unix::io::AsRawFd::as_raw_fd(f), offset, length) };
            if rc != 0 {
                return Err(std::io::Error::from_raw_os_error(rc));
            }
            Ok(())
        });
        match result {
            Some(Ok(())) => reply.ok(),
            Some(Err(e)) => reply.error(CoreError::from(e).to_errno()),
            None => reply.error(CoreError::NotFound.to_errno()),
        }
    }

    fn opendir(&self, _req: &Request, _ino: INodeNo, _flags: OpenFlags, reply: bedrock_fuse::ReplyOpen) {
        reply.opened(FileHandle(0), FopenFlags::empty());
    }

    fn readdir(
        &self,
        req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        reply: bedrock_fuse::ReplyDirectory,
    ) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let Ok(path) = self.path_for(ino) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        match self.list_directory(&identity, &path) {
            Ok(names) => {
                let mut entries = vec![
                    Dirent { ino: ino.0, offset: 1, kind: FileType::Directory, name: Bytes::Owned(b".".to_vec()) },
                    Dirent { ino: ino.0, offset: 2, kind: FileType::Directory, name: Bytes::Owned(b"..".to_vec()) },
                ];
                for (idx, (name, kind, child_path)) in names.into_iter().enumerate() {
                    let child_ino = self.inodes.ino_for_path(&child_path);
                    entries.push(Dirent {
                        ino: child_ino,
                        offset: 3 + idx as i64,
                        kind,
                        name: Bytes::Owned(name.into_vec()),
                    });
                }
                let list: DirentList<'_, '_> = entries.into();
                reply.dir(&list, 4096, offset as i64);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn releasedir(&self, _req: &Request, _ino: INodeNo, _fh: FileHandle, _flags: OpenFlags, reply: bedrock_fuse::ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&self, _req: &Request, _ino: INodeNo, reply: bedrock_fuse::ReplyStatfs) {
        reply.statfs(Statfs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            bsize: 4096,
            namelen: bedrock_core::limits::NAME_MAX as u32,
            frsize: 4096,
        });
    }

    fn access(&self, req: &Request, ino: INodeNo, _mask: AccessFlags, reply: bedrock_fuse::ReplyEmpty) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let Ok(path) = self.path_for(ino) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        match self.classify_only(&path) {
            Classification::ControlFile if require_root(req.uid()).is_err() => {
                reply.error(CoreError::PermissionDenied.to_errno())
            }
            Classification::Routed { .. } => match self.resolve(&identity, &path) {
                Ok(_) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            },
            _ => reply.ok(),
        }
    }

    fn getxattr(&self, req: &Request, ino: INodeNo, name: &OsStr, size: u32, reply: bedrock_fuse::ReplyXattr) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let Ok(path) = self.path_for(ino) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        match self.xattr_value(&identity, &path, name) {
            Ok(value) => {
                if size == 0 {
                    reply.xattr(Xattr::Size(value.len() as u32));
                } else if value.len() as u32 > size {
                    reply.error(CoreError::Range.to_errno());
                } else {
                    reply.xattr(Xattr::Data(Bytes::Owned(value)));
                }
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn listxattr(&self, req: &Request, ino: INodeNo, size: u32, reply: bedrock_fuse::ReplyXattr) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let Ok(path) = self.path_for(ino) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        let mut buf = Vec::new();
        for name in self.xattr_names_for(&identity, &path) {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
        }
        if size == 0 {
            reply.xattr(Xattr::Size(buf.len() as u32));
        } else if buf.len() as u32 > size {
            reply.error(CoreError::Range.to_errno());
        } else {
            reply.xattr(Xattr::Data(Bytes::Owned(buf)));
        }
    }

    fn setxattr(
        &self,
        req: &Request,
        ino: INodeNo,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: bedrock_fuse::ReplyEmpty,
    ) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let Ok(path) = self.path_for(ino) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        if path == Self::control_file_path() {
            reply.error(CoreError::ReadOnly.to_errno());
            return;
        }
        let result = self.resolve(&identity, &path).and_then(|r| {
            let c_path = std::ffi::CString::new(r.real_path.as_os_str().as_bytes()).unwrap();
            let c_name = std::ffi::CString::new(name.as_bytes())
                .map_err(|_| CoreError::InvalidArgument("name".into()))?;
            let rc = unsafe {
                libc::setxattr(
                    c_path.as_ptr(),
                    c_name.as_ptr(),
                    value.as_ptr() as *const libc::c_void,
                    value.len(),
                    0,
                )
            };
            if rc != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn removexattr(&self, req: &Request, ino: INodeNo, name: &OsStr, reply: bedrock_fuse::ReplyEmpty) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let Ok(path) = self.path_for(ino) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        let result = self.resolve(&identity, &path).and_then(|r| {
            let c_path = std::ffi::CString::new(r.real_path.as_os_str().as_bytes()).unwrap();
            let c_name = std::ffi::CString::new(name.as_bytes())
                .map_err(|_| CoreError::InvalidArgument("name".into()))?;
            let rc = unsafe { libc::removexattr(c_path.as_ptr(), c_name.as_ptr()) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

fn open_options_for(flags: OpenFlags) -> OpenOptions {
    let mut opts = OpenOptions::new();
    match flags.acc_mode() {
        bedrock_fuse::OpenAccMode::O_RDONLY => {
            opts.read(true);
        }
        bedrock_fuse::OpenAccMode::O_WRONLY => {
            opts.write(true);
        }
        bedrock_fuse::OpenAccMode::O_RDWR => {
            opts.read(true).write(true);
        }
    }
    if flags.0 & libc::O_APPEND != 0 {
        opts.append(true);
    }
    if flags.0 & libc::O_TRUNC != 0 {
        opts.truncate(true);
    }
    opts
}

fn root_entry(ino: u64) -> Entry {
    simple_entry(ino, dir_attr(ino, 0o755))
}

fn control_file_attr(ino: u64, size: u64) -> FileAttr {
    FileAttr {
        ino: INodeNo(ino),
        size,
        blocks: size.div_ceil(512),
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        crtime: SystemTime::UNIX_EPOCH,
        kind: FileType::RegularFile,
        perm: 0o600,
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn simple_entry(ino: u64, attr: FileAttr) -> Entry {
    Entry {
        ino,
        generation: None,
        file_ttl: NO_CACHE,
        attr,
        attr_ttl: NO_CACHE,
    }
}

/// Emulate `rename(2)` across a device boundary (spec §4.6 "etcfs-specific"):
/// the kernel refuses `EXDEV` in-place renames when source and destination
/// resolve to different real filesystems, so copy-and-remove by file type.
fn rename_possibly_cross_device(src: &Path, dst: &Path) -> std::io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => return Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {}
        Err(e) => return Err(e),
    }
    let meta = fs::symlink_metadata(src)?;
    if meta.is_dir() {
        fs::create_dir(dst)?;
        fs::set_permissions(dst, meta.permissions())?;
    } else if meta.file_type().is_symlink() {
        let target = fs::read_link(src)?;
        std::os::unix::fs::symlink(target, dst)?;
    } else if meta.file_type().is_char_device() || meta.file_type().is_block_device() || meta.file_type().is_fifo() {
        let c_path = std::ffi::CString::new(dst.as_os_str().as_bytes()).unwrap();
        let rc = unsafe { libc::mknod(c_path.as_ptr(), meta.mode(), meta.rdev() as libc::dev_t) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
    } else {
        // Copy to a sibling temporary and rename over dst (spec §4.6: a
        // concurrent reader of dst must never observe a partial copy, and a
        // failed copy must leave dst untouched), the same pattern
        // override_engine.rs uses for injection.
        let tmp = override_engine::sibling_tmp(dst);
        let copy_result = (|| -> std::io::Result<()> {
            let mut reader = File::open(src)?;
            let mut writer = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(meta.permissions().mode())
                .open(&tmp)?;
            std::io::copy(&mut reader, &mut writer)?;
            writer.flush()?;
            fs::rename(&tmp, dst)
        })();
        if copy_result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        copy_result?;
    }
    let c_path = std::ffi::CString::new(dst.as_os_str().as_bytes()).unwrap();
    let rc = unsafe { libc::chown(c_path.as_ptr(), meta.uid(), meta.gid()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    if meta.file_type().is_dir() || !meta.file_type().is_symlink() {
        fs::set_permissions(dst, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
    }
    if meta.is_dir() {
        fs::remove_dir(src)?;
    } else {
        fs::remove_file(src)?;
    }
    Ok(())
}

impl EtcFs {
    fn child_path(&self, parent: INodeNo, name: &OsStr) -> CoreResult<PathBuf> {
        let parent_path = self.path_for(parent)?;
        Ok(if parent_path == Path::new("/") {
            PathBuf::from("/").join(name)
        } else {
            parent_path.join(name)
        })
    }

    fn apply_control_command(&self, identity: &CallerIdentity, line: &str) -> CoreResult<()> {
        let mut words = line.split(' ');
        let is_rm_override = words.next() == Some("rm_override");
        let target_path = words.next().map(str::to_string);

        if is_rm_override {
            if let Some(path) = &target_path {
                let needle = match self.config.read().override_for(path) {
                    Some(Override { kind: crate::config::OverrideKind::Inject(bytes), .. }) => {
                        Some(bytes.clone())
                    }
                    _ => None,
                };
                if let Some(needle) = needle {
                    self.uninject_for_writer(identity, path, &needle);
                }
            }
        }
        self.config.write().apply_command(line)
    }

    fn xattr_names_for(&self, identity: &CallerIdentity, path: &Path) -> Vec<&'static str> {
        if matches!(self.classify_only(path), Classification::Routed { .. }) && self.resolve(identity, path).is_ok() {
            vec![bedrock_core::xattr::STRATUM_XATTR, bedrock_core::xattr::LOCALPATH_XATTR]
        } else {
            Vec::new()
        }
    }

    fn xattr_value(&self, identity: &CallerIdentity, path: &Path, name: &OsStr) -> CoreResult<Vec<u8>> {
        let name_str = name.to_str().ok_or(CoreError::NoAttribute)?;
        if !self.xattr_names_for(identity, path).contains(&name_str) {
            return Err(CoreError::NoAttribute);
        }
        let Classification::Routed { global, .. } = self.classify_only(path) else {
            return Err(CoreError::NoAttribute);
        };
        let stratum = resolver::backing_stratum(&self.pool, identity, &self.global_stratum, global)?;
        match name_str {
            n if n == bedrock_core::xattr::STRATUM_XATTR => Ok(stratum.name().as_bytes().to_vec()),
            n if n == bedrock_core::xattr::LOCALPATH_XATTR => {
                let resolved = self.resolve(identity, path)?;
                let display_path = resolved.stratum.join(&resolved.etc_path);
                Ok(display_path.as_os_str().as_bytes().to_vec())
            }
            _ => Err(CoreError::NoAttribute),
        }
    }

    /// List the contents of a directory-classified path. etcfs has no
    /// virtual intermediate directories beyond the root (unlike crossfs's
    /// routing table): every non-root directory maps straight onto the
    /// routed stratum's real directory.
    fn list_directory(
        &self,
        identity: &CallerIdentity,
        path: &Path,
    ) -> CoreResult<Vec<(std::ffi::OsString, FileType, PathBuf)>> {
        let mut out = Vec::new();
        if path == Path::new("/") {
            out.push((
                std::ffi::OsString::from(resolver::CONTROL_FILE_NAME),
                FileType::RegularFile,
                Self::control_file_path(),
            ));
            out.push((
                std::ffi::OsString::from(resolver::LOCAL_ALIAS_NAME),
                FileType::Symlink,
                Path::new("/").join(resolver::LOCAL_ALIAS_NAME),
            ));
        }
        let resolved = self.resolve(identity, path)?;
        let rd = fs::read_dir(&resolved.real_path)?;
        for entry in rd.flatten() {
            let name = entry.file_name();
            let Ok(meta) = entry.metadata() else { continue };
            let kind = if meta.is_dir() {
                FileType::Directory
            } else if meta.file_type().is_symlink() {
                FileType::Symlink
            } else {
                FileType::RegularFile
            };
            let child_path = path.join(&name);
            out.push((name, kind, child_path));
        }
        Ok(out)
    }
}
