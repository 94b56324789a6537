//! Artifact descriptor (`.modforge.toml`) and target matching.
//!
//! An artifact is the kernel module, privilege-escalation exploit, or script
//! under test, together with its build/test configuration. The descriptor is
//! immutable once a test run starts; every pipeline stage reads it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::kernel::{Distro, KernelInfo};

/// What kind of thing is under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    /// Any kind of out-of-tree kernel module.
    Module,
    /// Privilege-escalation exploit, verified via a root-owned marker file.
    Exploit,
    /// Plain script run inside the guest, for information gathering or
    /// automation.
    Script,
}

/// Kernel-release constraint of one target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelConstraint {
    /// Inclusion regex matched against the kernel release string.
    pub regex: String,
    /// Optional exclusion regex; a match here rejects the kernel.
    #[serde(default)]
    pub exclude_regex: String,
}

/// One (distribution, kernel-release regex) pair the artifact supports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub distro: Distro,
    pub kernel: KernelConstraint,
}

/// Extra file copied into the guest before the test runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransfer {
    pub user: String,
    pub local: String,
    pub remote: String,
}

/// Source patch applied before build. `path` and `source` are mutually
/// exclusive; `script` optionally runs after the patch is applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Patch {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
}

/// Dependency module built and inserted before the artifact's own test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreloadModule {
    pub path: PathBuf,
    /// Settle delay after insmod, for modules that need a moment to arm.
    #[serde(default)]
    pub settle_secs: u64,
}

/// VM resource requests and per-run timeouts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmOpts {
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub memory_mb: u32,
    /// Wall-clock bound for the whole VM lifetime (0 = default).
    #[serde(default)]
    pub timeout_secs: u64,
    /// Extra settling time after the VM starts, before any SSH use.
    #[serde(default)]
    pub after_start_secs: u64,
}

/// Build configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildOpts {
    /// Hard kill bound for local or container builds (0 = default).
    #[serde(default)]
    pub timeout_secs: u64,
    /// Extra arguments appended to the make invocation.
    #[serde(default)]
    pub make_target: String,
}

/// Kernel mitigation toggles, passed through to the boot command line.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Mitigations {
    #[serde(default)]
    pub disable_kaslr: bool,
    #[serde(default)]
    pub disable_smep: bool,
    #[serde(default)]
    pub disable_smap: bool,
    #[serde(default)]
    pub disable_kpti: bool,
}

/// The artifact under test plus its build/test configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,

    /// Source tree location; defaults to the working directory.
    #[serde(default)]
    pub source_path: PathBuf,

    /// Command run as the test for `Script` artifacts.
    #[serde(default)]
    pub script: String,

    #[serde(default)]
    pub targets: Vec<Target>,

    #[serde(default)]
    pub vm: VmOpts,
    #[serde(default)]
    pub build: BuildOpts,
    #[serde(default)]
    pub mitigations: Mitigations,

    #[serde(default)]
    pub patches: Vec<Patch>,
    #[serde(default)]
    pub test_files: Vec<FileTransfer>,

    /// Copy the host module tree into the guest before the test (the
    /// artifact depends on in-tree modules the minimal image lacks).
    #[serde(default)]
    pub standard_modules: bool,

    #[serde(default)]
    pub preload: Vec<PreloadModule>,
}

impl Artifact {
    /// Read and validate `.modforge.toml`.
    pub fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read artifact config {}", path.display()))?;
        let artifact: Artifact = toml::from_str(&raw)
            .with_context(|| format!("parse artifact config {}", path.display()))?;

        if artifact.name.split_whitespace().count() != 1 {
            anyhow::bail!("artifact name should not contain spaces");
        }

        Ok(artifact)
    }

    /// Returns true when the given kernel is supported by this artifact.
    ///
    /// A target matches iff the distro family matches (and the release too,
    /// when the target names one), the inclusion regex matches the kernel
    /// release string, and the exclusion regex (when present) does not.
    /// First matching target wins; target order is the tie-break.
    pub fn supported(&self, ki: &KernelInfo) -> Result<bool> {
        for target in &self.targets {
            if check_target(target, ki)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn vm_timeout(&self) -> Option<Duration> {
        match self.vm.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        match self.build.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

fn check_target(target: &Target, ki: &KernelInfo) -> Result<bool> {
    if target.distro.release.is_empty() {
        // Family-only constraint.
        if ki.distro.id != target.distro.id {
            return Ok(false);
        }
    } else if ki.distro != target.distro {
        return Ok(false);
    }

    let include = Regex::new(&target.kernel.regex)
        .with_context(|| format!("bad kernel regex {:?}", target.kernel.regex))?;
    if !include.is_match(&ki.kernel_release) {
        return Ok(false);
    }

    if !target.kernel.exclude_regex.is_empty() {
        let exclude = Regex::new(&target.kernel.exclude_regex).with_context(|| {
            format!("bad kernel exclude regex {:?}", target.kernel.exclude_regex)
        })?;
        if exclude.is_match(&ki.kernel_release) {
            return Ok(false);
        }
    }

    Ok(true)
}
