//! The crossfs `Filesystem` implementation (spec §4.6): wires identity
//! impersonation, the routing table, the path resolver and the content
//! filters into FUSE handlers.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::debug;

use bedrock_core::config::{require_root, validate_command_bytes};
use bedrock_core::error::{CoreError, CoreResult};
use bedrock_core::identity::{impersonate, CallerIdentity};
use bedrock_core::stratum::{resolve_local_stratum, StratumPool};

use bedrock_fuse::{
    AccessFlags, Bytes, Dirent, DirentList, Entry, FileAttr, FileHandle, FileType, FopenFlags,
    INodeNo, KernelConfig, OpenFlags, ReadFlags, Request, Statfs, WriteFlags, Xattr,
};

use crate::config::{CrossConfigStore, FilterKind};
use crate::filters::{self, FilterEnv, InitFlavor, ResolvedBacking};
use crate::inode::InodeTable;
use crate::resolver::{self, Classification};

/// Caches are disabled throughout (spec §4.6: "Negative, entry, and
/// attribute caches are disabled so that lower-filesystem changes are
/// visible immediately").
const NO_CACHE: Duration = Duration::ZERO;

pub struct CrossFs {
    strata_root: PathBuf,
    pool: StratumPool,
    config: CrossConfigStore,
    inodes: InodeTable,
    bouncer: crate::bouncer::Bouncer,
    host_init: InitFlavor,
}

impl CrossFs {
    pub fn new(
        strata_root: PathBuf,
        bouncer: crate::bouncer::Bouncer,
        host_init: InitFlavor,
    ) -> CrossFs {
        CrossFs {
            pool: StratumPool::new(strata_root.clone()),
            strata_root,
            config: CrossConfigStore::new(crate::config::CrossConfig::new()),
            inodes: InodeTable::new(),
            bouncer,
            host_init,
        }
    }

    fn classify(&self, identity: &CallerIdentity, path: &Path) -> CoreResult<Classification> {
        let config = self.config.read();
        resolver::classify(&config, &self.pool, identity, path)
    }

    fn filter_env(&self) -> FilterEnv<'_> {
        FilterEnv {
            strata_root: &self.strata_root,
            bouncer: &self.bouncer,
            host_init: self.host_init,
        }
    }

    fn path_for(&self, ino: INodeNo) -> CoreResult<PathBuf> {
        self.inodes.path_for_ino(ino.0).ok_or(CoreError::NotFound)
    }

    fn local_alias_target(&self, identity: &CallerIdentity) -> CoreResult<PathBuf> {
        let handle = resolve_local_stratum(&self.pool, identity)?;
        Ok(self.strata_root.join(handle.name()))
    }

    /// Build the `FileAttr` for a classified path. `existing` is the full
    /// set of backing candidates that exist, already in configured order.
    fn attr_for(
        &self,
        ino: u64,
        classification: &Classification,
        identity: &CallerIdentity,
    ) -> CoreResult<FileAttr> {
        match classification {
            Classification::Root | Classification::VirtualIntermediate => {
                Ok(dir_attr(ino, 0o555))
            }
            Classification::ControlFile => {
                let size = self.config.read().serialize().len() as u64;
                Ok(file_attr(ino, size, 0o600, 0, 0))
            }
            Classification::LocalAlias => {
                let target = self.local_alias_target(identity)?;
                Ok(symlink_attr(ino, target.as_os_str().len() as u64))
            }
            Classification::Backing { filter, existing } => {
                self.backing_attr(ino, *filter, existing)
            }
            Classification::NotFound => Err(CoreError::NotFound),
        }
    }

    fn backing_attr(
        &self,
        ino: u64,
        filter: FilterKind,
        existing: &[ResolvedBacking],
    ) -> CoreResult<FileAttr> {
        let first = existing.first().ok_or(CoreError::NotFound)?;
        let confined = first.confine()?;
        let meta = std::fs::symlink_metadata(&confined)?;
        if meta.is_dir() {
            return Ok(dir_attr(ino, 0o555));
        }
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&confined)?;
            return Ok(symlink_attr(ino, target.as_os_str().len() as u64));
        }
        let content = filters::materialize(filter, &self.filter_env(), existing)?;
        let mode = match filter {
            FilterKind::Bin | FilterKind::BinRestrict => {
                use std::os::unix::fs::PermissionsExt;
                (meta.permissions().mode() & filters::BIN_MODE_MASK) | filters::BIN_MODE_OR
            }
            _ => 0o444,
        };
        Ok(file_attr(ino, content.len() as u64, mode as u16, 0, 0))
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

fn file_attr(ino: u64, size: u64, perm: u16, uid: u32, gid: u32) -> FileAttr {
    FileAttr {
        ino: INodeNo(ino),
        size,
        blocks: size.div_ceil(512),
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        crtime: SystemTime::UNIX_EPOCH,
        kind: FileType::RegularFile,
        perm,
        nlink: 1,
        uid,
        gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

/// The top-level path component directly under `prefix` shared by `path`,
/// e.g. child_component("/", "/bin/vi") == Some("bin").
fn child_component(prefix: &Path, path: &Path) -> Option<PathBuf> {
    let suffix = path.strip_prefix(prefix).ok()?;
    let first = suffix.components().next()?;
    Some(prefix.join(first.as_os_str()))
}

impl bedrock_fuse::Filesystem for CrossFs {
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
        match self.classify(&identity, &child) {
            Ok(Classification::NotFound) => reply.error(CoreError::NotFound.to_errno()),
            Ok(classification) => {
                let ino = self.inodes.ino_for_path(&child);
                match self.attr_for(ino, &classification, &identity) {
                    Ok(attr) => reply.entry(Entry {
                        ino,
                        generation: None,
                        file_ttl: NO_CACHE,
                        attr,
                        attr_ttl: NO_CACHE,
                    }),
                    Err(e) => reply.error(e.to_errno()),
                }
            }
            Err(e) => reply.error(e.to_errno()),
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
        match self.classify(&identity, &path) {
            Ok(classification) => match self.attr_for(ino.0, &classification, &identity) {
                Ok(attr) => reply.attr(attr, NO_CACHE),
                Err(e) => reply.error(e.to_errno()),
            },
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
        let target = match self.classify(&identity, &path) {
            Ok(Classification::LocalAlias) => self.local_alias_target(&identity),
            Ok(Classification::Backing { existing, .. }) => existing
                .first()
                .ok_or(CoreError::NotFound)
                .and_then(|b| b.confine())
                .and_then(|confined| std::fs::read_link(&confined).map_err(CoreError::from)),
            Ok(_) => Err(CoreError::InvalidArgument("not a symlink".into())),
            Err(e) => Err(e),
        };
        match target {
            Ok(target) => reply.data(Bytes::Owned(target.into_os_string().into_encoded_bytes())),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&self, req: &Request, ino: INodeNo, flags: OpenFlags, reply: bedrock_fuse::ReplyOpen) {
        if flags.acc_mode() != bedrock_fuse::OpenAccMode::O_RDONLY {
            let Ok(path) = self.path_for(ino) else {
                reply.error(CoreError::NotFound.to_errno());
                return;
            };
            if path != Path::new("/").join(resolver::CONTROL_FILE_NAME) {
                reply.error(CoreError::ReadOnly.to_errno());
                return;
            }
            if require_root(req.uid()).is_err() {
                reply.error(CoreError::PermissionDenied.to_errno());
                return;
            }
        }
        reply.opened(FileHandle(0), FopenFlags::empty());
    }

    fn read(
        &self,
        req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        size: u32,
        _read_flags: ReadFlags,
        _flags: u32,
        _lock_owner: Option<bedrock_fuse::LockOwner>,
        reply: bedrock_fuse::ReplyData,
    ) {
        let Ok(identity) = impersonate(req) else {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        };
        let Ok(path) = self.path_for(ino) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        if path == Path::new("/").join(resolver::CONTROL_FILE_NAME) {
            if require_root(req.uid()).is_err() {
                reply.error(CoreError::PermissionDenied.to_errno());
                return;
            }
            let content = self.config.read().serialize().into_bytes();
            let slice = filters::slice_window(&content, offset, size);
            reply.data(Bytes::Owned(slice));
            return;
        }
        match self.classify(&identity, &path) {
            Ok(Classification::Backing { filter, existing }) => {
                match filters::materialize(filter, &self.filter_env(), &existing) {
                    Ok(content) => reply.data(Bytes::Owned(filters::slice_window(&content, offset, size))),
                    Err(e) => reply.error(e.to_errno()),
                }
            }
            Ok(_) => reply.error(CoreError::InvalidArgument("not a regular file".into()).to_errno()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &self,
        req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        _offset: i64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<bedrock_fuse::LockOwner>,
        reply: bedrock_fuse::ReplyWrite,
    ) {
        let Ok(path) = self.path_for(ino) else {
            reply.error(CoreError::NotFound.to_errno());
            return;
        };
        if path != Path::new("/").join(resolver::CONTROL_FILE_NAME) {
            reply.error(CoreError::ReadOnly.to_errno());
            return;
        }
        if require_root(req.uid()).is_err() {
            reply.error(CoreError::PermissionDenied.to_errno());
            return;
        }
        let result = validate_command_bytes(data).and_then(|line| {
            let mut config = self.config.write();
            let before = config.referenced_strata();
            let outcome = config.apply_command(line);
            let after = config.referenced_strata();
            drop(config);
            // A stratum dropped from every routing entry by this command
            // (an `rm` of its last backing, or `clear`) is closed here
            // (spec §3: a stratum is released once nothing routes to it).
            for name in before.difference(&after) {
                self.pool.release(name);
            }
            outcome
        });
        match result {
            Ok(()) => reply.written(data.len() as u32),
            Err(e) => reply.error(e.to_errno()),
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
                    Dirent {
                        ino: ino.0,
                        offset: 1,
                        kind: FileType::Directory,
                        name: Bytes::Owned(b".".to_vec()),
                    },
                    Dirent {
                        ino: ino.0,
                        offset: 2,
                        kind: FileType::Directory,
                        name: Bytes::Owned(b"..".to_vec()),
                    },
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

    fn releasedir(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _fh: FileHandle,
        _flags: OpenFlags,
        reply: bedrock_fuse::ReplyEmpty,
    ) {
        reply.ok();
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<bedrock_fuse::LockOwner>,
        _flush: bool,
        reply: bedrock_fuse::ReplyEmpty,
    ) {
        reply.ok();
    }

    fn flush(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _fh: FileHandle,
        _lock_owner: bedrock_fuse::LockOwner,
        reply: bedrock_fuse::ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsync(&self, _req: &Request, _ino: INodeNo, _fh: FileHandle, _datasync: bool, reply: bedrock_fuse::ReplyEmpty) {
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
        match self.classify(&identity, &path) {
            Ok(Classification::NotFound) => reply.error(CoreError::NotFound.to_errno()),
            Ok(Classification::ControlFile) if require_root(req.uid()).is_err() => {
                reply.error(CoreError::PermissionDenied.to_errno())
            }
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
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
        let names = self.xattr_names(&identity, &path);
        let mut buf = Vec::new();
        for name in names {
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
        _req: &Request,
        _ino: INodeNo,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: bedrock_fuse::ReplyEmpty,
    ) {
        reply.error(CoreError::ReadOnly.to_errno());
    }

    fn removexattr(&self, _req: &Request, _ino: INodeNo, _name: &OsStr, reply: bedrock_fuse::ReplyEmpty) {
        reply.error(CoreError::ReadOnly.to_errno());
    }

    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
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
        debug!("setattr(ino: {ino:#x?}) refused: crossfs is read-only");
        reply.error(CoreError::ReadOnly.to_errno());
    }

    fn mknod(
        &self,
        _req: &Request,
        _parent: INodeNo,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: bedrock_fuse::ReplyEntry,
    ) {
        reply.error(CoreError::ReadOnly.to_errno());
    }

    fn mkdir(
        &self,
        _req: &Request,
        _parent: INodeNo,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: bedrock_fuse::ReplyEntry,
    ) {
        reply.error(CoreError::ReadOnly.to_errno());
    }

    fn unlink(&self, _req: &Request, _parent: INodeNo, _name: &OsStr, reply: bedrock_fuse::ReplyEmpty) {
        reply.error(CoreError::ReadOnly.to_errno());
    }

    fn rmdir(&self, _req: &Request, _parent: INodeNo, _name: &OsStr, reply: bedrock_fuse::ReplyEmpty) {
        reply.error(CoreError::ReadOnly.to_errno());
    }

    fn symlink(
        &self,
        _req: &Request,
        _parent: INodeNo,
        _link_name: &OsStr,
        _target: &Path,
        reply: bedrock_fuse::ReplyEntry,
    ) {
        reply.error(CoreError::ReadOnly.to_errno());
    }

    fn rename(
        &self,
        _req: &Request,
        _parent: INodeNo,
        _name: &OsStr,
        _newparent: INodeNo,
        _newname: &OsStr,
        _flags: bedrock_fuse::RenameFlags,
        reply: bedrock_fuse::ReplyEmpty,
    ) {
        reply.error(CoreError::ReadOnly.to_errno());
    }

    fn link(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _newparent: INodeNo,
        _newname: &OsStr,
        reply: bedrock_fuse::ReplyEntry,
    ) {
        reply.error(CoreError::ReadOnly.to_errno());
    }

    fn create(
        &self,
        _req: &Request,
        _parent: INodeNo,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: bedrock_fuse::ReplyCreate,
    ) {
        reply.error(CoreError::ReadOnly.to_errno());
    }
}

impl CrossFs {
    /// xattr names crossfs reports on a given classified path (spec §4.4
    /// "bin"/"bin-restrict", §6 "every entry").
    fn xattr_names(&self, identity: &CallerIdentity, path: &Path) -> Vec<&'static str> {
        match self.classify(identity, path) {
            Ok(Classification::Backing { filter, existing }) if !existing.is_empty() => {
                let mut names = vec![
                    bedrock_core::xattr::STRATUM_XATTR,
                    bedrock_core::xattr::LOCALPATH_XATTR,
                ];
                if filter == FilterKind::BinRestrict {
                    names.push(bedrock_core::xattr::RESTRICT_XATTR);
                }
                names
            }
            _ => Vec::new(),
        }
    }

    fn xattr_value(&self, identity: &CallerIdentity, path: &Path, name: &OsStr) -> CoreResult<Vec<u8>> {
        let name = name.to_str().ok_or(CoreError::NoAttribute)?;
        let Classification::Backing { filter, existing } = self.classify(identity, path)? else {
            return Err(CoreError::NoAttribute);
        };
        let first = existing.first().ok_or(CoreError::NotFound)?;
        match name {
            n if n == bedrock_core::xattr::STRATUM_XATTR => Ok(first.stratum.clone().into_bytes()),
            n if n == bedrock_core::xattr::LOCALPATH_XATTR => {
                Ok(first.path.as_os_str().as_bytes().to_vec())
            }
            n if n == bedrock_core::xattr::RESTRICT_XATTR && filter == FilterKind::BinRestrict => {
                Ok(bedrock_core::xattr::RESTRICT_VALUE.as_bytes().to_vec())
            }
            _ => Err(CoreError::NoAttribute),
        }
    }

    /// List the contents of a directory-classified path (spec §4.6):
    /// reserved root entries, virtual-intermediate components, and entries
    /// merged across every existing backing directory (deduplicated,
    /// self-referential symlinks skipped).
    fn list_directory(
        &self,
        identity: &CallerIdentity,
        path: &Path,
    ) -> CoreResult<Vec<(std::ffi::OsString, FileType, PathBuf)>> {
        let mut seen = std::collections::BTreeSet::new();
        let mut out = Vec::new();

        if path == Path::new("/") {
            out.push((
                std::ffi::OsString::from(resolver::CONTROL_FILE_NAME),
                FileType::RegularFile,
                Path::new("/").join(resolver::CONTROL_FILE_NAME),
            ));
            seen.insert(resolver::CONTROL_FILE_NAME.to_string());
            out.push((
                std::ffi::OsString::from(resolver::LOCAL_ALIAS_NAME),
                FileType::Symlink,
                Path::new("/").join(resolver::LOCAL_ALIAS_NAME),
            ));
            seen.insert(resolver::LOCAL_ALIAS_NAME.to_string());
        }

        let config = self.config.read();
        for vpath in config.entries().keys() {
            if let Some(child) = child_component(path, Path::new(vpath)) {
                if let Some(name) = child.file_name().and_then(|n| n.to_str()) {
                    if seen.insert(name.to_string()) {
                        let kind = if Path::new(vpath) == child {
                            FileType::RegularFile
                        } else {
                            FileType::Directory
                        };
                        out.push((std::ffi::OsString::from(name), kind, child));
                    }
                }
            }
        }

        if let Classification::Backing { existing, .. } = self.classify(identity, path)? {
            for backing in &existing {
                let Ok(confined) = backing.confine() else {
                    continue;
                };
                let Ok(rd) = std::fs::read_dir(&confined) else {
                    continue;
                };
                for entry in rd.flatten() {
                    let name = entry.file_name();
                    let Some(name_str) = name.to_str() else { continue };
                    if !seen.insert(name_str.to_string()) {
                        continue;
                    }
                    let Ok(meta) = entry.metadata() else { continue };
                    if meta.file_type().is_symlink() {
                        if let Ok(target) = std::fs::read_link(entry.path()) {
                            if target == Path::new(".") {
                                // Self-referential symlink (e.g. /usr/bin/X11 -> .):
                                // the entry exists but is skipped from listings to
                                // avoid infinite readdir recursion (spec §4.6).
                                continue;
                            }
                        }
                    }
                    let kind = if meta.is_dir() {
                        FileType::Directory
                    } else if meta.file_type().is_symlink() {
                        FileType::Symlink
                    } else {
                        FileType::RegularFile
                    };
                    out.push((name, kind, path.join(name_str)));
                }
            }
        }

        Ok(out)
    }
}
