//! Host configuration, read from a TOML file.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use grubenhancer_utils::PathQuotedDisplay;
use serde::{Deserialize, Serialize};

/// The environment variable that can be used to specify a config file.
const CONFIG_VAR: &str = "GRUBENHANCER_CONFIG";

/// The config file read when [`CONFIG_VAR`] is unset.
const DEFAULT_CONFIG_PATH: &str = "/etc/grubenhancer.toml";

fn default_grub_dir() -> Utf8PathBuf {
    "/boot/grub".into()
}

fn default_forbidden_filesystems() -> Vec<String> {
    ["btrfs", "cpiofs", "newc", "odc", "romfs", "squash4", "tarfs", "zfs"]
        .map(String::from)
        .into()
}

fn default_forbidden_devices() -> Vec<String> {
    ["/dev/mapper", "/dev/dm", "/dev/md"].map(String::from).into()
}

fn default_env_flag() -> String {
    "amorceiso".into()
}

/// Settings for this host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The GRUB directory used when none is given on the command line
    #[serde(default = "default_grub_dir")]
    pub grub_dir: Utf8PathBuf,
    /// Filesystems GRUB cannot save its environment on; a GRUB directory
    /// on one of these cannot hold permanent entries.
    #[serde(default = "default_forbidden_filesystems")]
    pub forbidden_filesystems: Vec<String>,
    /// Device path prefixes with the same restriction
    #[serde(default = "default_forbidden_devices")]
    pub forbidden_devices: Vec<String>,
    /// The `grubenv` variable that arms temporary entries
    #[serde(default = "default_env_flag")]
    pub env_flag: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grub_dir: default_grub_dir(),
            forbidden_filesystems: default_forbidden_filesystems(),
            forbidden_devices: default_forbidden_devices(),
            env_flag: default_env_flag(),
        }
    }
}

impl Config {
    /// Parse a config from TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load the config file named by `$GRUBENHANCER_CONFIG`, falling back to
    /// `/etc/grubenhancer.toml` and then to the built-in defaults.
    #[context("Loading configuration")]
    pub fn load() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_VAR) {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Reading {}", PathQuotedDisplay::new(&path)))?;
            return Self::parse(&text)
                .with_context(|| format!("Parsing {}", PathQuotedDisplay::new(&path)));
        }
        Self::load_optional(Utf8Path::new(DEFAULT_CONFIG_PATH))
    }

    fn load_optional(path: &Utf8Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).with_context(|| format!("Parsing {path}")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {path}, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("Reading {path}")),
        }
    }

    /// Whether GRUB on filesystem `fs` and device `disk` can hold
    /// permanent entries.
    pub fn permanence_allowed(&self, fs: &str, disk: &str) -> bool {
        let forbidden_fs = self.forbidden_filesystems.iter().any(|f| f == fs);
        let forbidden_dev = self
            .forbidden_devices
            .iter()
            .any(|prefix| disk.starts_with(prefix.as_str()));
        !(forbidden_fs || forbidden_dev)
    }
}
