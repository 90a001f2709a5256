//! Per-thread identity shim (spec §4.1).
//!
//! Every FUSE worker thread in a multithreaded daemon handles requests for
//! different callers. Before any path-touching work happens, the *calling*
//! thread's filesystem identity (the credentials the kernel uses for
//! permission checks on path operations) must become the caller's UID, GID
//! and supplementary groups — not the process's, the thread's. glibc's
//! `setuid(2)`/`setgid(2)`/`setgroups(2)` wrappers broadcast the change to
//! every thread in the process (NPTL keeps POSIX's single-process-identity
//! illusion), which is exactly what must NOT happen here. We go around glibc
//! and hit the raw syscalls with `libc::syscall`, which affect only the
//! calling thread.

use std::io;

use bedrock_fuse::Request;
use libc::{gid_t, pid_t, uid_t};

use crate::error::{CoreError, CoreResult};

/// Credentials of a FUSE request's caller, captured once per request.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub uid: uid_t,
    pub gid: gid_t,
    pub pid: pid_t,
    /// Supplementary group list. Empty if it could not be read (see
    /// [`read_supplementary_groups`]); an empty list is safe because the
    /// subsequent EUID/EGID demotion happens unconditionally either way.
    pub groups: Vec<gid_t>,
}

impl CallerIdentity {
    /// Capture identity from a FUSE request's context (step 2 of §4.1).
    pub fn from_request(req: &Request) -> CallerIdentity {
        let pid = req.pid() as pid_t;
        CallerIdentity {
            uid: req.uid(),
            gid: req.gid(),
            pid,
            groups: read_supplementary_groups(pid).unwrap_or_default(),
        }
    }
}

/// Read `/proc/<pid>/status`'s `Groups:` line. Fails (returns `None`) for a
/// kernel thread, a process that has already exited, or a caller outside our
/// PID namespace — all cases spec §4.1 step 3 requires we tolerate, proceeding
/// with an empty supplementary-group list rather than aborting the request.
fn read_supplementary_groups(pid: pid_t) -> Option<Vec<gid_t>> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Groups:") {
            return Some(
                rest.split_whitespace()
                    .filter_map(|tok| tok.parse::<gid_t>().ok())
                    .collect(),
            );
        }
    }
    Some(Vec::new())
}

/// Raise the calling thread's EUID to 0. Succeeds as long as the thread's
/// saved-set-uid is still 0, which holds as long as no prior call on this
/// thread touched the saved ID (we never do below).
fn raise_euid_to_root() -> io::Result<()> {
    setresuid_thread(-1, 0, -1)
}

/// Set the calling thread's supplementary groups, then EGID, then EUID to
/// the caller's values, in that order (§4.1 step 4): demoting EUID first
/// would make the subsequent `setgroups` call itself require privilege we'd
/// have just given up.
fn demote_to_caller(identity: &CallerIdentity) -> io::Result<()> {
    setgroups_thread(&identity.groups)?;
    setresgid_thread(-1, identity.gid as i64, -1)?;
    setresuid_thread(-1, identity.uid as i64, -1)?;
    Ok(())
}

/// Apply the full identity-shim prologue for one request (§4.1 steps 1-4).
/// Must be called at the top of every FUSE handler, before touching any
/// backing path. Failure here aborts the handler with permission-denied
/// (§7 "Propagation policy") rather than being retried.
pub fn impersonate(req: &Request) -> CoreResult<CallerIdentity> {
    let identity = CallerIdentity::from_request(req);
    raise_euid_to_root().map_err(|_| CoreError::PermissionDenied)?;
    demote_to_caller(&identity).map_err(|_| CoreError::PermissionDenied)?;
    Ok(identity)
}

fn setresuid_thread(ruid: i64, euid: i64, suid: i64) -> io::Result<()> {
    raw_syscall3(libc::SYS_setresuid, ruid, euid, suid)
}

fn setresgid_thread(rgid: i64, egid: i64, sgid: i64) -> io::Result<()> {
    raw_syscall3(libc::SYS_setresgid, rgid, egid, sgid)
}

fn setgroups_thread(groups: &[gid_t]) -> io::Result<()> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_setgroups,
            groups.len() as libc::c_long,
            groups.as_ptr(),
        )
    };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// `-1` for any of the three id arguments means "leave unchanged", matching
/// `setresuid(2)`/`setresgid(2)` semantics.
fn raw_syscall3(nr: libc::c_long, a: i64, b: i64, c: i64) -> io::Result<()> {
    let ret = unsafe { libc::syscall(nr, a, b, c) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_pid_yields_empty_groups() {
        assert_eq!(read_supplementary_groups(pid_t::MAX - 1), None);
    }
}
