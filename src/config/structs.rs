use super::impls::deserialize_level_filter;
use crate::namespace::NamespaceOptions;
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf};

/// What to run inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandMode {
    /// Interactive `/bin/sh`, also the default.
    Shell,
    /// The image's `/singularity` runscript, falling back to a shell.
    Run,
    /// An inline command string handed to `/bin/sh -c`.
    Exec,
}

/// Settings from the system configuration file. Only root controls these,
/// so this is where every security relevant path comes from.
#[derive(Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    #[serde(deserialize_with = "deserialize_level_filter", default)]
    pub log_level: Option<log::LevelFilter>,
    pub state_dir: Option<PathBuf>,
    pub sysconf_dir: Option<PathBuf>,
    pub tmp_root: Option<PathBuf>,
    pub max_loop_devices: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub log_level: log::LevelFilter,
    pub image: Option<PathBuf>,
    pub command: CommandMode,
    /// The inline command for [`CommandMode::Exec`].
    pub exec_command: Option<String>,
    /// Arguments handed to the program run in the container.
    pub args: Vec<String>,
    pub writable: bool,
    pub contain: bool,
    pub namespaces: NamespaceOptions,
    pub state_dir: PathBuf,
    pub sysconf_dir: PathBuf,
    pub tmp_root: PathBuf,
    pub max_loop_devices: u32,
    pub sources: HashMap<String, String>,
}

impl Config {
    /// Shared mount point every image gets mounted on, inside its own
    /// private mount namespace.
    pub fn mount_point(&self) -> PathBuf {
        self.state_dir.join("singularity/mnt")
    }
}
