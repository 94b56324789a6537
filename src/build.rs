//! Artifact build stage.
//!
//! Copies the source tree into a scratch directory, applies patches, and
//! runs `make` either on the host (against an extracted kernel source tree)
//! or inside the kernel's build container. Build commands are killed hard
//! when the timeout fires; a non-zero make exit is a build failure, not an
//! infrastructure error.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info};

use crate::artifact::{Artifact, ArtifactType, Patch};
use crate::kernel::KernelInfo;
use crate::vm::random_tag;

pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(8 * 60);

/// What came out of the build stage.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// Scratch directory holding the patched source and build products.
    pub dir: PathBuf,
    /// The file the deploy stage ships into the guest.
    pub artifact_path: PathBuf,
    /// Combined make output (or patch output on patch failure).
    pub output: String,
    /// False when make (or a patch) exited non-zero.
    pub ok: bool,
}

/// Build the artifact for one kernel.
///
/// Returns `Err` only for infrastructure problems (scratch dir creation,
/// source copy, spawn failures, timeout). Compiler errors come back as
/// `ok == false` with the output attached.
pub async fn build(
    artifact: &Artifact,
    kernel: &KernelInfo,
    tmp_root: &Path,
    timeout: Duration,
) -> Result<BuildOutcome> {
    let dir = scratch_dir(tmp_root, &artifact.name)?;
    copy_source(&artifact.source_path, &dir).await?;

    let mut output = String::new();
    for (i, patch) in artifact.patches.iter().enumerate() {
        match apply_patch(&dir, i, patch).await? {
            PatchOutcome::Applied(out) => output.push_str(&out),
            PatchOutcome::Failed(out) => {
                output.push_str(&out);
                return Ok(BuildOutcome {
                    artifact_path: artifact_file(artifact, &dir),
                    dir,
                    output,
                    ok: false,
                });
            }
        }
    }

    let mut cmd = match &kernel.container_name {
        Some(container) => container_make(artifact, kernel, container, &dir),
        None => host_make(artifact, kernel, &dir)?,
    };
    cmd.stdin(Stdio::null()).kill_on_drop(true);

    debug!(dir = %dir.display(), ?timeout, "running build");

    // Dropping the output future on timeout kills the child.
    let result = tokio::time::timeout(timeout, cmd.output()).await;
    let make_output = match result {
        Ok(out) => out.context("failed to spawn build command")?,
        Err(_) => bail!("build timed out after {timeout:?}"),
    };

    output.push_str(&String::from_utf8_lossy(&make_output.stdout));
    output.push_str(&String::from_utf8_lossy(&make_output.stderr));

    let ok = make_output.status.success();
    if ok {
        info!(artifact = %artifact.name, kernel = %kernel.slug(), "build succeeded");
    }

    Ok(BuildOutcome {
        artifact_path: artifact_file(artifact, &dir),
        dir,
        output,
        ok,
    })
}

/// Where the built artifact lands inside the scratch directory.
pub fn artifact_file(artifact: &Artifact, dir: &Path) -> PathBuf {
    match artifact.artifact_type {
        ArtifactType::Module => dir.join(format!("{}.ko", artifact.name)),
        ArtifactType::Exploit | ArtifactType::Script => dir.join(&artifact.name),
    }
}

// ---------------------------------------------------------------------------
// Source preparation
// ---------------------------------------------------------------------------

fn scratch_dir(tmp_root: &Path, name: &str) -> Result<PathBuf> {
    let dir = tmp_root.join(format!("{}_{}", name, random_tag()));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create build dir {}", dir.display()))?;
    Ok(dir)
}

async fn copy_source(source: &Path, dir: &Path) -> Result<()> {
    let source = if source.as_os_str().is_empty() {
        Path::new(".")
    } else {
        source
    };

    // `cp -a src/. dst/` copies directory contents without nesting.
    let status = Command::new("cp")
        .arg("-a")
        .arg(format!("{}/.", source.display()))
        .arg(dir)
        .status()
        .await
        .context("failed to spawn cp")?;
    if !status.success() {
        bail!("copying source tree {} failed", source.display());
    }
    Ok(())
}

enum PatchOutcome {
    Applied(String),
    Failed(String),
}

async fn apply_patch(dir: &Path, index: usize, patch: &Patch) -> Result<PatchOutcome> {
    if patch.path.is_some() && patch.source.is_some() {
        bail!("patch {index}: path and source are mutually exclusive");
    }

    let mut combined = String::new();

    if patch.path.is_some() || patch.source.is_some() {
        let diff_name = format!("patch_{index:02}.diff");
        let diff_path = dir.join(&diff_name);
        match (&patch.path, &patch.source) {
            (Some(path), _) => {
                std::fs::copy(path, &diff_path)
                    .with_context(|| format!("copy patch {}", path.display()))?;
            }
            (_, Some(source)) => {
                std::fs::write(&diff_path, source)
                    .with_context(|| format!("write inline patch {diff_name}"))?;
            }
            _ => unreachable!(),
        }

        let output = Command::new("sh")
            .arg("-c")
            .arg(format!("patch -p1 < {diff_name}"))
            .current_dir(dir)
            .output()
            .await
            .context("failed to spawn patch")?;
        combined.push_str(&String::from_utf8_lossy(&output.stdout));
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Ok(PatchOutcome::Failed(combined));
        }
    }

    if let Some(script) = &patch.script {
        let script_name = format!("patch_{index:02}.sh");
        std::fs::write(dir.join(&script_name), script)
            .with_context(|| format!("write patch script {script_name}"))?;
        let output = Command::new("sh")
            .arg(&script_name)
            .current_dir(dir)
            .output()
            .await
            .context("failed to spawn patch script")?;
        combined.push_str(&String::from_utf8_lossy(&output.stdout));
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Ok(PatchOutcome::Failed(combined));
        }
    }

    Ok(PatchOutcome::Applied(combined))
}

// ---------------------------------------------------------------------------
// Make invocations
// ---------------------------------------------------------------------------

fn host_make(artifact: &Artifact, kernel: &KernelInfo, dir: &Path) -> Result<Command> {
    let kernel_source = kernel
        .kernel_source
        .as_ref()
        .context("kernel has neither a source tree nor a build container")?;

    let mut cmd = Command::new("make");
    cmd.current_dir(dir)
        .arg(format!("KERNEL={}", kernel_source.display()))
        .arg(format!("TARGET={}", artifact.name));
    if !artifact.build.make_target.is_empty() {
        cmd.arg(&artifact.build.make_target);
    }
    Ok(cmd)
}

fn container_make(
    artifact: &Artifact,
    kernel: &KernelInfo,
    container: &str,
    dir: &Path,
) -> Command {
    let mut cmd = Command::new("docker");
    cmd.arg("run")
        .arg("--rm")
        .arg("--network")
        .arg("none")
        .arg("-v")
        .arg(format!("{}:/work", dir.display()))
        .arg(container)
        .arg("make")
        .arg("-C")
        .arg("/work")
        .arg(format!(
            "KERNEL=/lib/modules/{}/build",
            kernel.kernel_release
        ))
        .arg(format!("TARGET={}", artifact.name));
    if !artifact.build.make_target.is_empty() {
        cmd.arg(&artifact.build.make_target);
    }
    cmd
}
