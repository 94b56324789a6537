//! Distribution identity and installable-kernel descriptors.
//!
//! A [`KernelInfo`] is one concrete bootable kernel: distro + version plus
//! the on-disk paths (image, initrd, module tree, root filesystem) the VM
//! supervisor needs. The full list lives in `kernels.toml`, produced by the
//! distribution-specific enumeration tooling and consumed read-only here.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Distribution family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistroId {
    Ubuntu,
    Debian,
    CentOs,
    OracleLinux,
    OpenSuse,
}

impl DistroId {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ubuntu" => Ok(DistroId::Ubuntu),
            "debian" => Ok(DistroId::Debian),
            "centos" => Ok(DistroId::CentOs),
            "oraclelinux" => Ok(DistroId::OracleLinux),
            "opensuse" => Ok(DistroId::OpenSuse),
            other => anyhow::bail!("unknown distro {other:?}"),
        }
    }

    /// All known families, used for `--guess` target synthesis.
    pub fn all() -> &'static [DistroId] {
        &[
            DistroId::Ubuntu,
            DistroId::Debian,
            DistroId::CentOs,
            DistroId::OracleLinux,
            DistroId::OpenSuse,
        ]
    }
}

impl fmt::Display for DistroId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DistroId::Ubuntu => "ubuntu",
            DistroId::Debian => "debian",
            DistroId::CentOs => "centos",
            DistroId::OracleLinux => "oraclelinux",
            DistroId::OpenSuse => "opensuse",
        };
        f.write_str(s)
    }
}

/// Distribution family plus release (e.g. `ubuntu 18.04`).
///
/// An empty release means "any release of this family" when used as a
/// target constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distro {
    pub id: DistroId,
    #[serde(default)]
    pub release: String,
}

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.release.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{} {}", self.id, self.release)
        }
    }
}

/// One installable kernel, as listed in `kernels.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelInfo {
    pub distro: Distro,

    /// Must be *exactly* the same as `uname -r` inside the guest.
    pub kernel_version: String,
    pub kernel_release: String,

    // Build-time information
    #[serde(default)]
    pub kernel_source: Option<PathBuf>,
    #[serde(default)]
    pub container_name: Option<String>,

    // Runtime information
    pub kernel_path: PathBuf,
    #[serde(default)]
    pub initrd_path: Option<PathBuf>,
    #[serde(default)]
    pub modules_path: Option<PathBuf>,
    pub root_fs: PathBuf,

    /// Debug symbols for gdb sessions.
    #[serde(default)]
    pub vmlinux_path: Option<PathBuf>,

    /// Known-broken kernels are skipped by the CI driver.
    #[serde(default)]
    pub blocklisted: bool,
}

impl KernelInfo {
    /// Short human identifier used in log file names and result lines.
    pub fn slug(&self) -> String {
        format!(
            "{}-{}-{}",
            self.distro.id, self.distro.release, self.kernel_release
        )
    }
}

/// Contents of `kernels.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub kernels: Vec<KernelInfo>,
}

impl KernelConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read kernel config {}", path.display()))?;
        let cfg: KernelConfig = toml::from_str(&raw)
            .with_context(|| format!("parse kernel config {}", path.display()))?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distro_id_parses_case_insensitively() {
        assert_eq!(DistroId::parse("Ubuntu").unwrap(), DistroId::Ubuntu);
        assert_eq!(DistroId::parse("DEBIAN").unwrap(), DistroId::Debian);
        assert!(DistroId::parse("slackware").is_err());
    }

    #[test]
    fn kernel_config_parses_minimal_entry() {
        let raw = r#"
            [[kernels]]
            kernel_version = "5.4.0-162-generic"
            kernel_release = "5.4.0-162-generic"
            kernel_path = "/opt/kernels/ubuntu/vmlinuz-5.4.0-162"
            root_fs = "/opt/images/ubuntu-18.04.img"

            [kernels.distro]
            id = "ubuntu"
            release = "18.04"
        "#;
        let cfg: KernelConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.kernels.len(), 1);
        let ki = &cfg.kernels[0];
        assert_eq!(ki.distro.id, DistroId::Ubuntu);
        assert!(!ki.blocklisted);
        assert_eq!(ki.slug(), "ubuntu-18.04-5.4.0-162-generic");
    }
}
