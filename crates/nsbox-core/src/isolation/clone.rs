//! clone(2) wrapper for namespace-isolated children

use super::namespace;
use crate::{NsboxError, Result};
use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::unistd::{ForkResult, Pid};
use parking_lot::Mutex;

/// Serializes process duplication against other forks in this process
static FORK_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Duplicate the calling process into fresh mount, PID, UTS and IPC
/// namespaces, plus whatever `extra` asks for (e.g. `CLONE_VFORK` when the
/// child execs right away, `CLONE_NEWUSER`).
///
/// Returns `Parent { child }` in the caller and `Child` in the new process.
///
/// # Safety
/// Same contract as `fork(2)` in a multi-threaded program: until it execs
/// or exits, the child may only call async-signal-safe functions. No
/// allocation, no locks, no logging.
pub unsafe fn fork(extra: CloneFlags) -> Result<ForkResult> {
    let flags = namespace::compose(extra)?;

    let guard = FORK_LOCK.lock();
    // SAFETY: without a new stack the child continues on a copy of the
    // parent's, like fork(2); the caller upholds the child-side contract
    let ret = unsafe { libc::syscall(libc::SYS_clone, flags, 0usize, 0usize, 0usize, 0usize) };

    if ret == 0 {
        // unlocking could wake waiters through parking_lot's shared state;
        // the child's copy of the lock is discarded by exec
        std::mem::forget(guard);
        return Ok(ForkResult::Child);
    }

    let errno = Errno::last();
    drop(guard);

    if ret == -1 {
        return Err(classify(errno, extra));
    }

    #[allow(clippy::cast_possible_truncation)]
    let child = Pid::from_raw(ret as libc::pid_t);
    tracing::debug!(pid = child.as_raw(), ?extra, "cloned into new namespaces");
    Ok(ForkResult::Parent { child })
}

/// `EINVAL` from clone means the kernel does not know one of the requested
/// namespace types, which deserves its own diagnostic
fn classify(errno: Errno, extra: CloneFlags) -> NsboxError {
    match errno {
        Errno::EINVAL => NsboxError::UnsupportedNamespaces(namespace::BASE_NAMESPACES | extra),
        other => NsboxError::Fork(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn einval_is_reported_as_missing_namespace_support() {
        let err = classify(Errno::EINVAL, CloneFlags::CLONE_NEWUSER);
        match err {
            NsboxError::UnsupportedNamespaces(flags) => {
                assert!(flags.contains(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWPID));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(classify(Errno::EINVAL, CloneFlags::empty()).is_fatal_precondition());
    }

    #[test]
    fn other_errors_are_plain_fork_failures() {
        assert!(matches!(
            classify(Errno::EPERM, CloneFlags::empty()),
            NsboxError::Fork(Errno::EPERM)
        ));
        assert!(matches!(
            classify(Errno::EAGAIN, CloneFlags::empty()),
            NsboxError::Fork(Errno::EAGAIN)
        ));
    }

    #[test]
    fn kernel_einval_is_reported_as_unsupported_namespaces() {
        // CLONE_SYSVSEM next to CLONE_NEWIPC is always EINVAL; the new user
        // namespace gets the check past the privilege test without root.
        // Either way no child is created.
        let extra = CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_SYSVSEM;
        // SAFETY: the clone cannot succeed
        match unsafe { fork(extra) } {
            Err(NsboxError::UnsupportedNamespaces(flags)) => {
                assert!(flags.contains(extra | CloneFlags::CLONE_NEWIPC));
            }
            // hosts that refuse unprivileged user namespaces stop earlier
            Err(NsboxError::Fork(Errno::EPERM | Errno::EACCES | Errno::ENOSPC | Errno::EUSERS)) => {}
            other => panic!("unexpected {other:?}"),
        }
        // the lock was released on the error path
        assert!(FORK_LOCK.try_lock().is_some());
    }

    #[test]
    fn sharing_flags_never_reach_the_kernel() {
        // SAFETY: the flag check fails before any process is duplicated
        let result = unsafe { fork(CloneFlags::CLONE_FILES) };
        assert!(matches!(result, Err(NsboxError::ForbiddenFlags(_))));
    }
}
