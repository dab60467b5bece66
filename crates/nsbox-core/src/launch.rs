//! Launching a program inside fresh namespaces
//!
//! A launch moves strictly forward:
//! `Initial → Confined (optional) → Cloned → ParentWaiting | ChildExecuting → Exited`.
//! A child whose exec fails exits with status 127; it never returns into
//! the caller's code.

use crate::isolation::{Cgroup, chroot_into, find_cgroup_vfs};
use crate::vfs::Vfs;
use crate::{LaunchConfig, NsboxError, Result};
use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid};
use std::ffi::{CString, c_char};
use std::os::unix::ffi::OsStrExt;

/// Exit status of a child whose exec failed
pub const EXEC_FAILED: i32 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    /// Nothing done yet
    Initial,
    /// Root changed to the configured directory
    Confined,
    /// Clone returned in the parent
    Cloned,
    /// Parent blocked on the child
    ParentWaiting,
    /// Child side between clone and exec, only seen by the child's copy
    ChildExecuting,
    /// Child reaped
    Exited,
}

/// How the child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub pid: Pid,
    pub status: WaitStatus,
}

impl LaunchOutcome {
    /// Shell-style exit code: the exit status, or 128 + signal number
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.status {
            WaitStatus::Exited(_, code) => code,
            WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
            _ => 1,
        }
    }
}

/// Drives one launch from configuration to reaped child
#[derive(Debug)]
pub struct Launcher {
    config: LaunchConfig,
    state: LaunchState,
    pid: Option<Pid>,
}

impl Launcher {
    #[must_use]
    pub const fn new(config: LaunchConfig) -> Self {
        Self {
            config,
            state: LaunchState::Initial,
            pid: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> LaunchState {
        self.state
    }

    #[must_use]
    pub const fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Join the configured cgroup, confine, clone, exec in the child and
    /// wait for it in the parent.
    ///
    /// Blocks until the child exits. There is no timeout: a caller that
    /// gives up waiting leaves the child running.
    pub fn run(&mut self) -> Result<LaunchOutcome> {
        if self.state != LaunchState::Initial {
            return Err(NsboxError::Config(format!(
                "launcher already used (state: {:?})",
                self.state
            )));
        }

        // everything the child needs is allocated before the clone
        let image = ExecImage::new(&self.config)?;

        if let Some(name) = &self.config.cgroup {
            join_cgroup(name, self.config.cgroup_root.as_deref())?;
        }

        if let Some(root) = &self.config.root {
            let root = chroot_into(root)?;
            self.state = LaunchState::Confined;
            tracing::info!(root = %root.display(), "confined to new root");
        }

        let mut extra = self.config.namespaces.to_clone_flags();
        if self.config.vfork {
            extra |= CloneFlags::CLONE_VFORK;
        }

        // SAFETY: the child branch only calls execve, write and _exit
        match unsafe { crate::isolation::fork(extra)? } {
            ForkResult::Child => {
                self.state = LaunchState::ChildExecuting;
                image.exec()
            }
            ForkResult::Parent { child } => {
                self.state = LaunchState::Cloned;
                self.pid = Some(child);
                tracing::info!(
                    pid = child.as_raw(),
                    program = %self.config.program.display(),
                    "child launched"
                );
                self.wait(child)
            }
        }
    }

    fn wait(&mut self, child: Pid) -> Result<LaunchOutcome> {
        self.state = LaunchState::ParentWaiting;

        let status = loop {
            match waitpid(child, None) {
                Ok(status) => break status,
                Err(Errno::EINTR) => {}
                Err(e) => return Err(NsboxError::Wait(e)),
            }
        };

        self.state = LaunchState::Exited;
        let outcome = LaunchOutcome { pid: child, status };
        tracing::info!(pid = child.as_raw(), code = outcome.exit_code(), "child exited");
        Ok(outcome)
    }
}

/// Launch `config` with a fresh [`Launcher`]
pub fn launch(config: &LaunchConfig) -> Result<LaunchOutcome> {
    Launcher::new(config.clone()).run()
}

/// Create the named group and move this process into it so the clone
/// inherits the membership
fn join_cgroup(name: &str, root: Option<&std::path::Path>) -> Result<()> {
    let root = match root {
        Some(path) => Vfs::open(path)?,
        None => find_cgroup_vfs().ok_or_else(|| {
            NsboxError::KernelUnsupported("no usable cgroup mount found".into())
        })?,
    };

    let (cgroup, failures) = Cgroup::create(&root, name)?;
    if !failures.is_empty() {
        tracing::warn!(cgroup = name, failed = failures.len(), "cgroup only partially created");
    }

    cgroup.add_process(nix::unistd::getpid().as_raw())
}

/// Program, argv and envp as C strings with their pointer arrays, built
/// ahead of the clone so the child does not allocate
struct ExecImage {
    program: CString,
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp_ptrs: Vec<*const c_char>,
}

impl ExecImage {
    fn new(config: &LaunchConfig) -> Result<Self> {
        let program = c_string(config.program.as_os_str().as_bytes())?;

        let mut argv = vec![program.clone()];
        for arg in &config.args {
            argv.push(c_string(arg.as_bytes())?);
        }

        let envp = config
            .environment()
            .into_iter()
            .map(|(k, v)| c_string(format!("{k}={v}").as_bytes()))
            .collect::<Result<Vec<_>>>()?;

        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);

        Ok(Self {
            program,
            _argv: argv,
            _envp: envp,
            argv_ptrs,
            envp_ptrs,
        })
    }

    /// Replace the process image. Only returns by exiting.
    fn exec(&self) -> ! {
        const MSG: &[u8] = b"nsbox: exec failed in isolated child\n";

        // SAFETY: all pointers reference CStrings owned by self and the
        // arrays are null-terminated; write and _exit are async-signal-safe
        unsafe {
            libc::execve(
                self.program.as_ptr(),
                self.argv_ptrs.as_ptr(),
                self.envp_ptrs.as_ptr(),
            );
            libc::write(libc::STDERR_FILENO, MSG.as_ptr().cast(), MSG.len());
            libc::_exit(EXEC_FAILED)
        }
    }
}

fn c_string(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|e| NsboxError::Config(format!("argument contains NUL: {e}")))
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn exit_codes_follow_shell_convention() {
        let pid = Pid::from_raw(10);
        let exited = LaunchOutcome {
            pid,
            status: WaitStatus::Exited(pid, 3),
        };
        assert_eq!(exited.exit_code(), 3);

        let killed = LaunchOutcome {
            pid,
            status: WaitStatus::Signaled(pid, Signal::SIGKILL, false),
        };
        assert_eq!(killed.exit_code(), 137);
    }

    #[test]
    fn exec_image_is_null_terminated() {
        let config = LaunchConfig::builder()
            .program("/bin/echo")
            .args(["one", "two"])
            .build();
        let image = ExecImage::new(&config).unwrap();

        assert_eq!(image.argv_ptrs.len(), 4);
        assert!(image.argv_ptrs[3].is_null());
        assert!(image.envp_ptrs.last().unwrap().is_null());
        // argv[0] is the program itself
        assert_eq!(image._argv[0].as_bytes(), b"/bin/echo");
        assert!(image._envp.iter().any(|e| e.as_bytes() == b"container=lxc"));
    }

    #[test]
    fn nul_in_arguments_is_a_config_error() {
        let config = LaunchConfig::builder().program("/bin/echo").arg("a\0b").build();
        assert!(matches!(ExecImage::new(&config), Err(NsboxError::Config(_))));
    }

    #[test]
    fn missing_root_fails_before_clone() {
        let config = LaunchConfig::builder()
            .root("/0abc1def2ghi3jkl4mno5pqr6stu7vwx8yz9")
            .program("/bin/true")
            .build();
        let mut launcher = Launcher::new(config);

        assert!(matches!(launcher.run(), Err(NsboxError::ChrootMissing(_))));
        assert_eq!(launcher.state(), LaunchState::Initial);
        assert!(launcher.pid().is_none());
    }

    #[test]
    fn explicit_cgroup_root_must_exist() {
        let config = LaunchConfig::builder()
            .cgroup("test")
            .cgroup_root("/0abc1def2ghi3jkl4mno5pqr6stu7vwx8yz9")
            .program("/bin/true")
            .build();
        assert!(matches!(launch(&config), Err(NsboxError::NotFound(_))));
    }
}
