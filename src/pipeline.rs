//! The build → deploy → run → test phase machine for one (artifact, kernel)
//! pair.
//!
//! Each run gets a fresh VM. Phase failures are data, not panics: the
//! pipeline always comes back with a [`RunResult`] whose `internal_error`
//! field separates infrastructure trouble (host misconfiguration, dead scp,
//! QEMU refusing to boot) from genuine test verdicts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::artifact::{Artifact, ArtifactType};
use crate::build::{self, BuildOutcome};
use crate::kernel::KernelInfo;
use crate::vm::{random_tag, Vm, VmSpec};

pub const DEFAULT_VM_TIMEOUT: Duration = Duration::from_secs(60);
const SSH_WAIT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Output and verdict of one pipeline phase.
#[derive(Debug, Clone, Default)]
pub struct Phase {
    pub output: String,
    pub ok: bool,
}

/// Everything the CI driver needs to score and log one run.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub build: Phase,
    pub run: Phase,
    pub test: Phase,

    /// Set when infrastructure (not the artifact) failed; such runs are
    /// excluded from the reliability rate by default.
    pub internal_error: Option<String>,

    pub panicked: bool,
    pub timed_out: bool,

    /// Guest serial console, persisted alongside the phase logs.
    pub console: String,

    /// Build scratch directory and the built artifact, for `--dist` export.
    pub build_dir: Option<PathBuf>,
    pub build_artifact: Option<PathBuf>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.internal_error.is_none() && self.build.ok && self.run.ok && self.test.ok
    }

    fn internal(message: String) -> Self {
        RunResult {
            internal_error: Some(message),
            ..RunResult::default()
        }
    }

    /// A kernel panic invalidates whatever verdict the test phase produced.
    fn note_panic(&mut self) {
        self.panicked = true;
        self.test.ok = false;
    }
}

/// Why a deploy step failed: the host/transport, or the artifact itself.
///
/// An scp that cannot connect says nothing about the module; an `insmod`
/// that exits non-zero says everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployErrorKind {
    Infrastructure,
    Artifact,
}

#[derive(Debug)]
pub struct DeployError {
    pub kind: DeployErrorKind,
    pub message: String,
}

impl DeployError {
    fn infrastructure(err: anyhow::Error) -> Self {
        DeployError {
            kind: DeployErrorKind::Infrastructure,
            message: format!("{err:#}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Endless mode: keep re-running the test after a green pass until
/// something breaks, optionally with a stress workload in the background.
#[derive(Debug, Clone)]
pub struct EndlessOpts {
    pub stress_script: Option<PathBuf>,
    pub interval: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOpts {
    /// Pre-built artifact; skips the build phase.
    pub binary: Option<PathBuf>,

    /// Test script override; defaults to `<source>/test.sh`.
    pub test_script: Option<PathBuf>,

    /// Keep the root image writable (no `-snapshot`).
    pub mutable_image: bool,

    /// Expose a gdb stub and log the ssh command line for manual debugging.
    pub gdb_port: Option<u16>,

    pub endless: Option<EndlessOpts>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline<'a> {
    pub artifact: &'a Artifact,
    pub kernel: &'a KernelInfo,
    pub tmp_root: &'a Path,
    pub opts: PipelineOpts,
}

impl<'a> Pipeline<'a> {
    /// Run the full phase machine. Never returns `Err`: infrastructure
    /// failures land in `RunResult::internal_error`.
    pub async fn run(&self) -> RunResult {
        let mut result = RunResult::default();

        // Build phase (or skip for scripts / pre-built binaries).
        let artifact_path = match self.build_phase(&mut result).await {
            Ok(Some(path)) => Some(path),
            Ok(None) => return result,
            Err(e) => return RunResult::internal(format!("build: {e:#}")),
        };

        let vm = match Vm::new(self.kernel.clone(), self.vm_spec()) {
            Ok(vm) => vm,
            Err(e) => return RunResult::internal(format!("vm setup: {e:#}")),
        };

        if let Err(e) = vm.start().await {
            return RunResult::internal(format!("vm start: {e:#}"));
        }

        if let Some(port) = self.opts.gdb_port {
            info!(gdb = port, ssh = %vm.remote().ssh_command_line("root"), "debug session ready");
        }

        let outcome = self.guest_phases(&vm, artifact_path.as_deref(), &mut result).await;

        result.timed_out = vm.timed_out();
        result.console = vm.console().await;

        if let Err(e) = outcome {
            result.internal_error = Some(format!("{e:#}"));
        }
        if vm.panicked() {
            result.note_panic();
        }

        if let Err(e) = vm.stop().await {
            warn!(error = %e, "vm stop failed");
        }

        result
    }

    fn vm_spec(&self) -> VmSpec {
        let a = self.artifact;
        VmSpec {
            cpus: if a.vm.cpus == 0 { 1 } else { a.vm.cpus },
            memory_mb: if a.vm.memory_mb == 0 { 512 } else { a.vm.memory_mb },
            timeout: a.vm_timeout().unwrap_or(DEFAULT_VM_TIMEOUT),
            after_start: Duration::from_secs(a.vm.after_start_secs),
            mutable: self.opts.mutable_image,
            gdb_port: self.opts.gdb_port,
            disable_kaslr: a.mitigations.disable_kaslr,
            disable_smep: a.mitigations.disable_smep,
            disable_smap: a.mitigations.disable_smap,
            disable_kpti: a.mitigations.disable_kpti,
        }
    }

    // -----------------------------------------------------------------------
    // Build
    // -----------------------------------------------------------------------

    /// Returns the path of the file to ship into the guest, or `None` when
    /// the build failed (the verdict is already in `result.build`).
    async fn build_phase(&self, result: &mut RunResult) -> Result<Option<PathBuf>> {
        match self.artifact.artifact_type {
            ArtifactType::Script => {
                result.build.ok = true;
                return Ok(Some(PathBuf::new()));
            }
            ArtifactType::Module | ArtifactType::Exploit => {}
        }

        if let Some(binary) = &self.opts.binary {
            if !binary.exists() {
                bail!("pre-built binary does not exist: {}", binary.display());
            }
            result.build.ok = true;
            return Ok(Some(binary.clone()));
        }

        let timeout = self
            .artifact
            .build_timeout()
            .unwrap_or(build::DEFAULT_BUILD_TIMEOUT);
        let BuildOutcome {
            dir,
            artifact_path,
            output,
            ok,
        } = build::build(self.artifact, self.kernel, self.tmp_root, timeout).await?;

        result.build = Phase { output, ok };
        result.build_dir = Some(dir);
        result.build_artifact = Some(artifact_path.clone());

        Ok(if ok { Some(artifact_path) } else { None })
    }

    // -----------------------------------------------------------------------
    // Guest phases
    // -----------------------------------------------------------------------

    async fn guest_phases(
        &self,
        vm: &Vm,
        artifact_path: Option<&Path>,
        result: &mut RunResult,
    ) -> Result<()> {
        vm.wait_for_ssh(SSH_WAIT).await.context("wait for ssh")?;

        let test_path = self.install_test_script(vm).await?;
        self.copy_standard_modules(vm).await?;
        self.preload_modules(vm).await?;
        self.copy_test_files(vm).await?;

        // Deploy / run.
        let exploit_path = match self.deploy(vm, artifact_path, result).await {
            Ok(path) => path,
            Err(e) if e.kind == DeployErrorKind::Infrastructure => {
                bail!("deploy: {}", e.message);
            }
            Err(e) => {
                result.run = Phase {
                    output: e.message,
                    ok: false,
                };
                return Ok(());
            }
        };
        if !result.run.ok {
            return Ok(());
        }

        self.test_phase(vm, &test_path, exploit_path.as_deref(), result)
            .await?;

        // The guest must still answer after the test; a wedged or rebooted
        // kernel means the pass was not clean.
        let check = vm
            .command("root", "echo connection check")
            .await
            .context("post-test connection check")?;
        if !check.ok {
            result.test.ok = false;
            result
                .test
                .output
                .push_str("\n[guest unreachable after test]");
        }

        if result.success() {
            if let Some(endless) = &self.opts.endless {
                self.endless_loop(vm, &test_path, exploit_path.as_deref(), endless, result)
                    .await;
            }
        }

        Ok(())
    }

    /// Ship `test.sh` into the guest, synthesizing a default when the
    /// artifact has none.
    async fn install_test_script(&self, vm: &Vm) -> Result<String> {
        let remote_path = format!("/tmp/test_{}", random_tag());

        let local = match &self.opts.test_script {
            Some(path) => Some(path.clone()),
            None => {
                let default = self.source_root().join("test.sh");
                default.exists().then_some(default)
            }
        };

        match local {
            Some(path) => {
                vm.copy_file("root", &path, &remote_path)
                    .await
                    .context("copy test script")?;
            }
            None => {
                // Exploits get a runner that makes the marker-file protocol
                // work out of the box; everything else a no-op script.
                let body = match self.artifact.artifact_type {
                    ArtifactType::Exploit => "#!/bin/sh\necho touch $2 | $1",
                    _ => "#!/bin/sh\n",
                };
                let cmd = format!("cat > {remote_path} << 'EOF'\n{body}\nEOF");
                let res = vm.command("root", &cmd).await.context("write default test script")?;
                if !res.ok {
                    bail!("writing default test script failed: {}", res.output.trim());
                }
            }
        }

        let chmod = vm
            .command("root", &format!("chmod +x {remote_path}"))
            .await
            .context("chmod test script")?;
        if !chmod.ok {
            bail!("chmod test script failed: {}", chmod.output.trim());
        }
        Ok(remote_path)
    }

    async fn copy_standard_modules(&self, vm: &Vm) -> Result<()> {
        if !self.artifact.standard_modules {
            return Ok(());
        }
        let modules = self
            .kernel
            .modules_path
            .as_ref()
            .context("standard_modules requested but the kernel has no modules_path")?;
        vm.copy_directory(
            "root",
            modules,
            &format!("/lib/modules/{}", self.kernel.kernel_release),
        )
        .await
        .context("copy standard modules")
    }

    async fn preload_modules(&self, vm: &Vm) -> Result<()> {
        for preload in &self.artifact.preload {
            let config = preload.path.join(".modforge.toml");
            let mut dep = Artifact::read(&config)
                .with_context(|| format!("preload module {}", preload.path.display()))?;
            dep.source_path = preload.path.clone();

            let timeout = dep.build_timeout().unwrap_or(build::DEFAULT_BUILD_TIMEOUT);
            let out = build::build(&dep, self.kernel, self.tmp_root, timeout).await?;
            if !out.ok {
                bail!("preload module {} failed to build:\n{}", dep.name, out.output);
            }

            let insmod = vm.copy_and_insmod(&out.artifact_path).await?;
            if !insmod.ok {
                bail!("preload insmod {} failed: {}", dep.name, insmod.output.trim());
            }

            if preload.settle_secs > 0 {
                tokio::time::sleep(Duration::from_secs(preload.settle_secs)).await;
            }
        }
        Ok(())
    }

    async fn copy_test_files(&self, vm: &Vm) -> Result<()> {
        for file in &self.artifact.test_files {
            let local = self.source_root().join(&file.local);
            vm.copy_file(&file.user, &local, &file.remote)
                .await
                .with_context(|| format!("copy test file {}", file.local))?;
        }
        Ok(())
    }

    /// Deploy the artifact. For modules this is also the run phase
    /// (`insmod`); for exploits it stages the binary and returns its guest
    /// path for the test phase.
    async fn deploy(
        &self,
        vm: &Vm,
        artifact_path: Option<&Path>,
        result: &mut RunResult,
    ) -> std::result::Result<Option<String>, DeployError> {
        match self.artifact.artifact_type {
            ArtifactType::Script => {
                result.run.ok = true;
                Ok(None)
            }
            ArtifactType::Module => {
                let path = artifact_path.ok_or_else(|| DeployError {
                    kind: DeployErrorKind::Infrastructure,
                    message: "no module to deploy".into(),
                })?;
                let insmod = vm
                    .copy_and_insmod(path)
                    .await
                    .map_err(DeployError::infrastructure)?;
                if !insmod.ok {
                    return Err(DeployError {
                        kind: DeployErrorKind::Artifact,
                        message: insmod.output,
                    });
                }
                result.run = Phase {
                    output: insmod.output,
                    ok: true,
                };
                Ok(None)
            }
            ArtifactType::Exploit => {
                let path = artifact_path.ok_or_else(|| DeployError {
                    kind: DeployErrorKind::Infrastructure,
                    message: "no exploit to deploy".into(),
                })?;
                let remote_path = format!("/tmp/exploit_{}", random_tag());
                vm.copy_file("user", path, &remote_path)
                    .await
                    .map_err(DeployError::infrastructure)?;
                let chmod = vm
                    .command("user", &format!("chmod +x {remote_path}"))
                    .await
                    .map_err(DeployError::infrastructure)?;
                if !chmod.ok {
                    return Err(DeployError {
                        kind: DeployErrorKind::Infrastructure,
                        message: chmod.output,
                    });
                }
                result.run.ok = true;
                Ok(Some(remote_path))
            }
        }
    }

    async fn test_phase(
        &self,
        vm: &Vm,
        test_path: &str,
        exploit_path: Option<&str>,
        result: &mut RunResult,
    ) -> Result<()> {
        result.test = self.run_test_once(vm, test_path, exploit_path).await?;
        Ok(())
    }

    async fn run_test_once(
        &self,
        vm: &Vm,
        test_path: &str,
        exploit_path: Option<&str>,
    ) -> Result<Phase> {
        match self.artifact.artifact_type {
            ArtifactType::Module => {
                let res = vm.command("root", test_path).await.context("run test script")?;
                Ok(Phase {
                    output: res.output,
                    ok: res.ok,
                })
            }
            ArtifactType::Script => {
                let res = vm
                    .command("root", &self.artifact.script)
                    .await
                    .context("run script")?;
                Ok(Phase {
                    output: res.output,
                    ok: res.ok,
                })
            }
            ArtifactType::Exploit => {
                let exploit = exploit_path.context("exploit path missing in test phase")?;
                let marker = format!("/root/{}", random_tag());

                // The test script runs unprivileged; only a successful
                // escalation can leave the root-owned marker behind.
                let res = vm
                    .command("user", &format!("{test_path} {exploit} {marker}"))
                    .await
                    .context("run exploit test")?;
                let mut output = res.output;

                let stat = vm
                    .command("root", &format!("stat {marker}"))
                    .await
                    .context("check exploit marker")?;
                output.push_str(&stat.output);

                Ok(Phase {
                    output,
                    ok: res.ok && stat.ok,
                })
            }
        }
    }

    async fn endless_loop(
        &self,
        vm: &Vm,
        test_path: &str,
        exploit_path: Option<&str>,
        endless: &EndlessOpts,
        result: &mut RunResult,
    ) {
        if let Some(stress) = &endless.stress_script {
            match vm.copy_and_run_async("root", stress).await {
                Ok(path) => info!(script = %path, "stress workload started"),
                Err(e) => {
                    result.internal_error = Some(format!("stress script: {e:#}"));
                    return;
                }
            }
        }

        let mut iterations: u64 = 0;
        loop {
            tokio::time::sleep(endless.interval).await;
            if vm.died() || vm.panicked() {
                warn!(iterations, "guest went away during endless run");
                result.test.ok = false;
                return;
            }

            match self.run_test_once(vm, test_path, exploit_path).await {
                Ok(phase) if phase.ok => {
                    iterations += 1;
                    info!(iterations, "endless iteration passed");
                }
                Ok(phase) => {
                    warn!(iterations, "endless iteration failed");
                    result.test = phase;
                    return;
                }
                Err(e) => {
                    result.internal_error = Some(format!("endless test: {e:#}"));
                    return;
                }
            }
        }
    }

    fn source_root(&self) -> &Path {
        if self.artifact.source_path.as_os_str().is_empty() {
            Path::new(".")
        } else {
            &self.artifact.source_path
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_requires_all_three_phases() {
        let mut r = RunResult::default();
        assert!(!r.success());
        r.build.ok = true;
        r.run.ok = true;
        r.test.ok = true;
        assert!(r.success());
    }

    #[test]
    fn internal_error_poisons_success() {
        let mut r = RunResult::default();
        r.build.ok = true;
        r.run.ok = true;
        r.test.ok = true;
        r.internal_error = Some("scp exploded".into());
        assert!(!r.success());
    }

    #[test]
    fn panic_downgrades_a_green_test() {
        let mut r = RunResult::default();
        r.build.ok = true;
        r.run.ok = true;
        r.test.ok = true;

        r.note_panic();
        assert!(r.panicked);
        assert!(!r.test.ok);
        assert!(!r.success());
    }

    #[test]
    fn deploy_error_kinds_are_distinct() {
        let infra = DeployError::infrastructure(anyhow::anyhow!("connection refused"));
        assert_eq!(infra.kind, DeployErrorKind::Infrastructure);
        assert_ne!(DeployErrorKind::Infrastructure, DeployErrorKind::Artifact);
    }
}
