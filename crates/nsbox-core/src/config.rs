//! Launch configuration

use crate::isolation::NamespaceConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for one isolated launch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// New filesystem root, `None` to keep the current one
    pub root: Option<PathBuf>,

    /// Program to exec in the child, resolved inside `root`
    pub program: PathBuf,

    /// Arguments after `argv[0]`
    pub args: Vec<String>,

    /// Environment overrides applied on top of the inherited environment
    pub env: Vec<(String, String)>,

    /// Cgroup to create and join before cloning
    pub cgroup: Option<String>,

    /// Cgroup root to create `cgroup` under, discovered when unset
    pub cgroup_root: Option<PathBuf>,

    /// Optional namespaces beyond mount/PID/UTS/IPC
    pub namespaces: NamespaceConfig,

    /// Suspend the parent until the child has exec'd
    pub vfork: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            root: None,
            program: PathBuf::from("/bin/sh"),
            args: vec![],
            // lets init systems inside detect that they run in a container
            env: vec![("container".into(), "lxc".into())],
            cgroup: None,
            cgroup_root: None,
            namespaces: NamespaceConfig::default(),
            vfork: true,
        }
    }
}

impl LaunchConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> LaunchConfigBuilder {
        LaunchConfigBuilder::default()
    }

    /// The child's environment: inherited variables with overrides applied,
    /// later overrides winning
    #[must_use]
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut vars = inherited_environment();
        for (key, value) in &self.env {
            match vars.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1.clone_from(value),
                None => vars.push((key.clone(), value.clone())),
            }
        }
        vars
    }
}

/// Variables of the current process that are valid UTF-8
fn inherited_environment() -> Vec<(String, String)> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

/// Builder for LaunchConfig
#[derive(Debug, Default)]
pub struct LaunchConfigBuilder {
    config: LaunchConfig,
}

impl LaunchConfigBuilder {
    #[must_use]
    pub fn root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.root = Some(path.into());
        self
    }

    #[must_use]
    pub fn program(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.program = path.into();
        self
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.config.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn cgroup(mut self, name: impl Into<String>) -> Self {
        self.config.cgroup = Some(name.into());
        self
    }

    #[must_use]
    pub fn cgroup_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cgroup_root = Some(path.into());
        self
    }

    #[must_use]
    pub const fn namespaces(mut self, namespaces: NamespaceConfig) -> Self {
        self.config.namespaces = namespaces;
        self
    }

    #[must_use]
    pub const fn vfork(mut self, vfork: bool) -> Self {
        self.config.vfork = vfork;
        self
    }

    #[must_use]
    pub fn build(self) -> LaunchConfig {
        self.config
    }
}

/// Get the default cgroup root from NSBOX_CGROUP_ROOT env var or system default
///
/// Returns:
/// - `$NSBOX_CGROUP_ROOT` if set
/// - `/sys/fs/cgroup` otherwise
pub fn default_cgroup_root() -> PathBuf {
    std::env::var("NSBOX_CGROUP_ROOT").map_or_else(
        |_| PathBuf::from(crate::isolation::cgroups::SYSTEMD_CGROUP_ROOT),
        PathBuf::from,
    )
}
