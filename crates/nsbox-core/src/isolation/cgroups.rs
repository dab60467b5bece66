//! Per-controller cgroup (v1) management
//!
//! A [`Cgroup`] is a name interpreted as the directory `<controller>/<name>`
//! under every controller of a systemd-style cgroup root
//! (`/sys/fs/cgroup/{cpu,memory,...}`). Membership lives only in the
//! kernel's `tasks` files; nothing is kept in memory.

use crate::vfs::{MountTable, Vfs};
use crate::{NsboxError, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Conventional systemd cgroup root
pub const SYSTEMD_CGROUP_ROOT: &str = "/sys/fs/cgroup";

const TASKS: &str = "tasks";

/// A controller-level failure that did not stop the whole operation
#[derive(Debug)]
pub struct ControllerFailure {
    pub controller: String,
    pub error: NsboxError,
}

impl std::fmt::Display for ControllerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.controller, self.error)
    }
}

/// Available controllers from `/proc/cgroups`,
/// e.g. `[blkio, cpu, cpuacct, cpuset, devices, freezer, memory, net_cls]`
pub fn list_controllers() -> Result<Vec<String>> {
    list_controllers_in(&Vfs::procfs())
}

/// Available controllers from `cgroups` under the given procfs.
///
/// Rows with `enabled` set to 0 are left out. Recomputed on every call.
pub fn list_controllers_in(procfs: &Vfs) -> Result<Vec<String>> {
    let rows = procfs.get_map_list("cgroups", 0).map_err(|e| match e {
        NsboxError::NotFound(path) => NsboxError::KernelUnsupported(format!(
            "could not read {}, the kernel does not seem to support cgroups",
            path.display()
        )),
        other => other,
    })?;

    Ok(rows
        .into_iter()
        .filter(|(name, row)| {
            !name.starts_with('#') && row.get(3).is_none_or(|enabled| enabled != "0")
        })
        .map(|(name, _)| name)
        .collect())
}

/// Locate a usable per-controller cgroup root.
///
/// `/sys/fs/cgroup` is tried first. Failing that, any `cgroup` mount in the
/// table is taken as one controller of a systemd-style layout and its
/// parent directory returned. `None` means no usable cgroup support.
#[must_use]
pub fn find_cgroup_vfs() -> Option<Vfs> {
    match MountTable::read() {
        Ok(table) => find_cgroup_vfs_in(&table, SYSTEMD_CGROUP_ROOT),
        Err(e) => {
            tracing::warn!(error = %e, "could not read mount table");
            None
        }
    }
}

/// [`find_cgroup_vfs`] against a given mount table and preferred root
#[must_use]
pub fn find_cgroup_vfs_in(table: &MountTable, preferred: impl AsRef<Path>) -> Option<Vfs> {
    if let Ok(vfs) = Vfs::open_in(preferred.as_ref(), table) {
        if vfs.filesystem == "tmpfs" && matches!(vfs.is_cgroupfs(), Ok(true)) {
            tracing::debug!(root = %vfs, "using systemd cgroup root");
            return Some(vfs);
        }
    }

    for (mountpoint, entry) in table.iter() {
        if entry.filesystem != "cgroup" {
            continue;
        }
        let Some(parent) = mountpoint.parent() else {
            continue;
        };
        if let Ok(vfs) = Vfs::open_in(parent, table) {
            tracing::debug!(root = %vfs, controller = %mountpoint.display(), "using cgroup mount parent");
            return Some(vfs);
        }
    }

    None
}

/// A named group across every controller of a cgroup root
#[derive(Debug, Clone)]
pub struct Cgroup {
    name: String,
    root: Vfs,
    procfs: Vfs,
}

impl Cgroup {
    /// Create `name` under every controller of `root`
    ///
    /// ```no_run
    /// # use nsbox_core::isolation::cgroups::{find_cgroup_vfs, Cgroup};
    /// let root = find_cgroup_vfs().expect("no cgroup support");
    /// let (cg, _failures) = Cgroup::create(&root, "builder")?;
    /// cg.add_process(std::process::id() as i32)?;
    /// # Ok::<(), nsbox_core::NsboxError>(())
    /// ```
    pub fn create(root: &Vfs, name: &str) -> Result<(Self, Vec<ControllerFailure>)> {
        Self::create_in(root, &Vfs::procfs(), name)
    }

    /// Create `name` under every controller listed by `procfs`.
    ///
    /// An existing directory counts as created. Any other per-controller
    /// failure is logged and returned next to the group, which may then
    /// exist under only some controllers.
    pub fn create_in(
        root: &Vfs,
        procfs: &Vfs,
        name: &str,
    ) -> Result<(Self, Vec<ControllerFailure>)> {
        let cg = Self::open_in(root, procfs, name)?;

        let tasks = root.join(TASKS);
        if tasks.exists() {
            return Err(NsboxError::MonolithicMount(tasks));
        }

        let mut failures = Vec::new();
        for controller in list_controllers_in(procfs)? {
            let dir = cg.controller_dir(&controller);
            match std::fs::create_dir(&dir) {
                Ok(()) => tracing::debug!(controller = %controller, cgroup = %name, "created cgroup directory"),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    let error = NsboxError::io(&dir, e);
                    tracing::warn!(controller = %controller, cgroup = %name, %error, "could not create cgroup directory");
                    failures.push(ControllerFailure { controller, error });
                }
            }
        }

        tracing::info!(cgroup = %name, root = %root.path().display(), "cgroup ready");
        Ok((cg, failures))
    }

    /// Attach to an existing group without creating anything
    pub fn open(root: &Vfs, name: &str) -> Result<Self> {
        Self::open_in(root, &Vfs::procfs(), name)
    }

    /// [`Cgroup::open`] with controllers listed by `procfs`
    pub fn open_in(root: &Vfs, procfs: &Vfs, name: &str) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            root: root.clone(),
            procfs: procfs.clone(),
        })
    }

    /// Group name, the directory under each controller
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cgroup root holding one directory per controller
    #[must_use]
    pub const fn root(&self) -> &Vfs {
        &self.root
    }

    /// Full path of a control file in this group.
    ///
    /// The controller is needed even for prefixed files since not every
    /// file in a controller directory carries the prefix, e.g.
    /// `ctl_path("memory", "memory.swappiness")` =
    /// `/sys/fs/cgroup/memory/<name>/memory.swappiness`
    #[must_use]
    pub fn ctl_path(&self, controller: &str, file: &str) -> PathBuf {
        self.controller_dir(controller).join(file)
    }

    /// Write a tunable, e.g. `set("memory", "memory.swappiness", "0")`
    pub fn set(&self, controller: &str, file: &str, value: &str) -> Result<()> {
        self.root.set_string(self.relative(controller, file), value)
    }

    /// Read a tunable back
    pub fn get_string(&self, controller: &str, file: &str) -> Result<String> {
        self.root.get_string(self.relative(controller, file))
    }

    /// Task IDs currently in this group for one controller
    pub fn tasks(&self, controller: &str) -> Result<Vec<i64>> {
        self.root.get_int_list(self.relative(controller, TASKS))
    }

    /// Add a process and every one of its threads.
    ///
    /// Membership is per thread, so the IDs under `/proc/<pid>/task` are
    /// written individually after the PID itself. Controllers where the
    /// group has no directory (creation failed there) are skipped.
    pub fn add_process(&self, pid: i32) -> Result<()> {
        let threads = self.threads_of(pid)?;

        for controller in self.joinable_controllers()? {
            let tasks = self.relative(&controller, TASKS);
            self.root.append_string(&tasks, &pid.to_string())?;
            for tid in &threads {
                self.root.append_string(&tasks, tid)?;
            }
        }

        tracing::debug!(cgroup = %self.name, pid, threads = threads.len(), "added process");
        Ok(())
    }

    /// Add a single task ID without looking for sibling threads
    pub fn add_task(&self, tid: i32) -> Result<()> {
        for controller in self.joinable_controllers()? {
            self.root
                .append_string(self.relative(&controller, TASKS), &tid.to_string())?;
        }

        tracing::debug!(cgroup = %self.name, tid, "added task");
        Ok(())
    }

    /// Move every task back to the controller root and remove the group.
    ///
    /// Not transactional: a controller that fails is logged, returned and
    /// skipped, and the remaining controllers are still processed.
    /// Unmounted controllers are ignored and co-mounted ones are handled
    /// once.
    pub fn destroy(self) -> Result<Vec<ControllerFailure>> {
        let mut failures = Vec::new();

        for controller in self.mounted_controllers()? {
            if let Err(error) = self.destroy_controller(&controller) {
                tracing::warn!(controller = %controller, cgroup = %self.name, %error, "could not remove cgroup");
                failures.push(ControllerFailure { controller, error });
            }
        }

        tracing::info!(cgroup = %self.name, failed = failures.len(), "cgroup destroyed");
        Ok(failures)
    }

    fn destroy_controller(&self, controller: &str) -> Result<()> {
        let dir = self.controller_dir(controller);
        let tasks = match self.tasks(controller) {
            Ok(tasks) => tasks,
            Err(NsboxError::NotFound(_)) if dir.is_dir() => Vec::new(),
            Err(e) => return Err(e),
        };

        let root_tasks = Path::new(controller).join(TASKS);
        for task in tasks {
            self.root.append_string(&root_tasks, &task.to_string())?;
        }

        std::fs::remove_dir(&dir).map_err(|e| NsboxError::io(&dir, e))?;
        tracing::debug!(controller, cgroup = %self.name, "removed cgroup directory");
        Ok(())
    }

    /// Listed controllers with a hierarchy under the root, one name per
    /// hierarchy.
    ///
    /// Co-mounted controllers reached through symlinks (`cpu` and `cpuacct`
    /// both pointing at `cpu,cpuacct`) share a hierarchy and appear once,
    /// under the first name.
    fn mounted_controllers(&self) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut mounted = Vec::new();

        for controller in list_controllers_in(&self.procfs)? {
            match std::fs::canonicalize(self.root.join(&controller)) {
                Ok(hierarchy) => {
                    if seen.insert(hierarchy) {
                        mounted.push(controller);
                    }
                }
                Err(e) => {
                    tracing::debug!(controller = %controller, error = %e, "controller not mounted, skipped");
                }
            }
        }
        Ok(mounted)
    }

    /// Mounted controllers where this group has a directory
    fn joinable_controllers(&self) -> Result<Vec<String>> {
        let mut joinable = self.mounted_controllers()?;
        joinable.retain(|controller| {
            let present = self.controller_dir(controller).is_dir();
            if !present {
                tracing::debug!(controller = %controller, cgroup = %self.name, "no group directory, not joining");
            }
            present
        });
        Ok(joinable)
    }

    fn threads_of(&self, pid: i32) -> Result<Vec<String>> {
        let dir = self.procfs.join(pid.to_string()).join("task");
        let entries = std::fs::read_dir(&dir).map_err(|e| NsboxError::io(&dir, e))?;

        let mut threads = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| NsboxError::io(&dir, e))?;
            threads.push(entry.file_name().to_string_lossy().into_owned());
        }
        threads.sort_by_key(|tid| tid.parse::<i64>().unwrap_or(i64::MAX));
        Ok(threads)
    }

    fn controller_dir(&self, controller: &str) -> PathBuf {
        self.root.join(controller).join(&self.name)
    }

    fn relative(&self, controller: &str, file: &str) -> PathBuf {
        Path::new(controller).join(&self.name).join(file)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(NsboxError::Config(format!(
            "invalid cgroup name {name:?}, must be a single directory name"
        )));
    }
    Ok(())
}
