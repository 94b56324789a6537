//! CI driver: expands the artifact's target matrix into concrete runs,
//! executes them through a bounded worker pool, and aggregates the verdicts
//! into a reliability rate.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rand::seq::SliceRandom;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::artifact::{Artifact, KernelConstraint, Target};
use crate::kernel::{Distro, DistroId, KernelConfig, KernelInfo};
use crate::logging;
use crate::paths::ForgePaths;
use crate::pipeline::{Pipeline, PipelineOpts, RunResult};

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Tally of finished runs. Merging is associative, so partial summaries from
/// any number of workers can be folded in any order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub overall: u64,
    pub success: u64,
    pub internal_errors: u64,
}

impl RunSummary {
    pub fn from_result(result: &RunResult) -> Self {
        RunSummary {
            overall: 1,
            success: result.success() as u64,
            internal_errors: result.internal_error.is_some() as u64,
        }
    }

    pub fn merge(&mut self, other: RunSummary) {
        self.overall += other.overall;
        self.success += other.success;
        self.internal_errors += other.internal_errors;
    }

    /// Fraction of successful runs. Infrastructure failures are excluded
    /// from the denominator unless `include_internal` is set; an empty
    /// summary rates 0.0 rather than dividing by zero.
    pub fn rate(&self, include_internal: bool) -> f64 {
        let denominator = if include_internal {
            self.overall
        } else {
            self.overall.saturating_sub(self.internal_errors)
        };
        if denominator == 0 {
            return 0.0;
        }
        self.success as f64 / denominator as f64
    }
}

/// Error out when the success rate is below the required threshold, for CI
/// exit codes.
pub fn check_threshold(summary: &RunSummary, threshold: f64, include_internal: bool) -> Result<()> {
    let rate = summary.rate(include_internal);
    if rate < threshold {
        bail!(
            "reliability threshold not met: {:.2} < {:.2} ({}/{} runs succeeded, {} internal errors)",
            rate,
            threshold,
            summary.success,
            summary.overall,
            summary.internal_errors
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Kernel selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SelectOpts {
    /// Cap on distinct kernels (0 = no cap).
    pub max_kernels: usize,
    pub shuffle: bool,
    /// Boot every selected kernel from this image instead of its own.
    pub root_fs: Option<PathBuf>,
}

/// Pick the kernels this artifact will be tested on: supported by a target,
/// not blocklisted, optionally shuffled and capped.
pub fn select_kernels(
    artifact: &Artifact,
    config: &KernelConfig,
    opts: &SelectOpts,
) -> Result<Vec<KernelInfo>> {
    let mut kernels = Vec::new();
    for kernel in &config.kernels {
        if kernel.blocklisted {
            continue;
        }
        if artifact.supported(kernel)? {
            let mut kernel = kernel.clone();
            if let Some(root_fs) = &opts.root_fs {
                kernel.root_fs = root_fs.clone();
            }
            kernels.push(kernel);
        }
    }

    if opts.shuffle {
        kernels.shuffle(&mut rand::thread_rng());
    }
    if opts.max_kernels > 0 {
        kernels.truncate(opts.max_kernels);
    }

    if kernels.is_empty() {
        bail!("no supported kernels found for artifact {}", artifact.name);
    }
    Ok(kernels)
}

/// Targets that accept every known kernel, for `--guess`.
pub fn guess_targets() -> Vec<Target> {
    DistroId::all()
        .iter()
        .map(|&id| Target {
            distro: Distro {
                id,
                release: String::new(),
            },
            kernel: KernelConstraint {
                regex: ".*".into(),
                exclude_regex: String::new(),
            },
        })
        .collect()
}

/// Parse a `--kernel distro:regex` override into a single target.
pub fn parse_kernel_override(spec: &str) -> Result<Target> {
    let (distro, regex) = spec
        .split_once(':')
        .context("kernel override must look like distro:regex (e.g. ubuntu:5\\.4.*)")?;
    Ok(Target {
        distro: Distro {
            id: DistroId::parse(distro)?,
            release: String::new(),
        },
        kernel: KernelConstraint {
            regex: regex.to_string(),
            exclude_regex: String::new(),
        },
    })
}

// ---------------------------------------------------------------------------
// Local execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunnerOpts {
    /// Worker-pool width; also the bound on concurrently live VMs.
    pub threads: usize,
    /// Runs per selected kernel.
    pub runs: u32,
    /// Wall-clock bound for the whole matrix; stops new dispatch only.
    pub deadline: Option<Duration>,
    /// Log-directory tag for this invocation.
    pub tag: String,
    /// Export built artifacts per kernel into this directory.
    pub dist: Option<PathBuf>,
}

impl Default for RunnerOpts {
    fn default() -> Self {
        Self {
            threads: 1,
            runs: 1,
            deadline: None,
            tag: "results".into(),
            dist: None,
        }
    }
}

/// Run the full matrix locally and return the merged summary.
///
/// In-flight runs always finish: the deadline and the cancellation token
/// only stop new dispatch, then the pool drains.
pub async fn run_matrix(
    artifact: Arc<Artifact>,
    kernels: Vec<KernelInfo>,
    paths: &ForgePaths,
    opts: RunnerOpts,
    pipeline_opts: PipelineOpts,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let semaphore = Arc::new(Semaphore::new(opts.threads.max(1)));
    let deadline = opts.deadline.map(|d| Instant::now() + d);
    let log_dir = paths.logs.join(&opts.tag);
    let tmp_root = paths.tmp.clone();

    let mut set: JoinSet<RunSummary> = JoinSet::new();
    let mut summary = RunSummary::default();

    'dispatch: for kernel in kernels {
        for run_index in 0..opts.runs.max(1) {
            // The select below races a possibly-ready permit against the
            // stop conditions; check them first so a passed deadline never
            // lets another run slip through.
            if cancel.is_cancelled() {
                info!("cancelled, draining in-flight runs");
                break 'dispatch;
            }
            if deadline.is_some_and(|at| Instant::now() >= at) {
                info!("deadline reached, draining in-flight runs");
                break 'dispatch;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => {
                    permit.context("worker pool closed")?
                }
                _ = cancel.cancelled() => {
                    info!("cancelled, draining in-flight runs");
                    break 'dispatch;
                }
                _ = sleep_until_deadline(deadline) => {
                    info!("deadline reached, draining in-flight runs");
                    break 'dispatch;
                }
            };

            let artifact = artifact.clone();
            let kernel = kernel.clone();
            let log_dir = log_dir.clone();
            let tmp_root = tmp_root.clone();
            let dist = opts.dist.clone();
            let pipeline_opts = pipeline_opts.clone();

            set.spawn(async move {
                let _permit = permit;

                let pipeline = Pipeline {
                    artifact: &artifact,
                    kernel: &kernel,
                    tmp_root: &tmp_root,
                    opts: pipeline_opts,
                };
                let result = pipeline.run().await;

                report(&kernel, run_index, &result);
                if let Err(e) = persist_run_log(&log_dir, &kernel, run_index, &result) {
                    warn!(error = %e, "writing run log failed");
                }
                if let Some(dist) = dist {
                    if let Err(e) = export_artifact(&dist, &kernel, &result) {
                        warn!(error = %e, "dist export failed");
                    }
                }

                RunSummary::from_result(&result)
            });
        }
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(part) => summary.merge(part),
            Err(e) => {
                error!(error = %e, "worker task failed");
                summary.merge(RunSummary {
                    overall: 1,
                    success: 0,
                    internal_errors: 1,
                });
            }
        }
    }

    info!(
        overall = summary.overall,
        success = summary.success,
        internal_errors = summary.internal_errors,
        "matrix finished"
    );
    Ok(summary)
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn report(kernel: &KernelInfo, run_index: u32, result: &RunResult) {
    match &result.internal_error {
        Some(message) => warn!(
            kernel = %kernel.slug(),
            run = run_index,
            error = message,
            "internal error"
        ),
        None => info!(
            kernel = %kernel.slug(),
            run = run_index,
            build = result.build.ok,
            insmod = result.run.ok,
            test = result.test.ok,
            panic = result.panicked,
            timeout = result.timed_out,
            success = result.success(),
            "run finished"
        ),
    }
}

fn persist_run_log(
    log_dir: &std::path::Path,
    kernel: &KernelInfo,
    run_index: u32,
    result: &RunResult,
) -> Result<()> {
    let file_name = format!("{}-{run_index}.log", kernel.slug());
    let (mut writer, _guard) = logging::run_log_file(log_dir, &file_name)?;

    for (label, phase) in [
        ("build", &result.build),
        ("run", &result.run),
        ("test", &result.test),
    ] {
        writeln!(writer, "=== {label} (ok: {}) ===", phase.ok)?;
        writeln!(writer, "{}", phase.output)?;
    }
    if let Some(message) = &result.internal_error {
        writeln!(writer, "=== internal error ===\n{message}")?;
    }
    writeln!(writer, "=== console ===\n{}", result.console)?;
    Ok(())
}

fn export_artifact(
    dist: &std::path::Path,
    kernel: &KernelInfo,
    result: &RunResult,
) -> Result<()> {
    let Some(artifact_path) = &result.build_artifact else {
        return Ok(());
    };
    if !result.build.ok || !artifact_path.exists() {
        return Ok(());
    }

    let dir = dist.join(kernel.slug());
    std::fs::create_dir_all(&dir)?;
    let file_name = artifact_path
        .file_name()
        .context("built artifact has no file name")?;
    std::fs::copy(artifact_path, dir.join(file_name))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactType, BuildOpts, Mitigations, VmOpts};

    fn summary(overall: u64, success: u64, internal: u64) -> RunSummary {
        RunSummary {
            overall,
            success,
            internal_errors: internal,
        }
    }

    #[test]
    fn merge_is_associative() {
        let parts = [summary(3, 2, 1), summary(5, 5, 0), summary(2, 0, 2)];

        let mut left = parts[0];
        left.merge(parts[1]);
        left.merge(parts[2]);

        let mut right_tail = parts[1];
        right_tail.merge(parts[2]);
        let mut right = parts[0];
        right.merge(right_tail);

        assert_eq!(left, right);
        assert_eq!(left, summary(10, 7, 3));
    }

    #[test]
    fn empty_summary_rates_zero_without_division() {
        assert_eq!(RunSummary::default().rate(false), 0.0);
        assert_eq!(RunSummary::default().rate(true), 0.0);
        // All runs internal: denominator collapses to zero.
        assert_eq!(summary(2, 0, 2).rate(false), 0.0);
    }

    #[test]
    fn internal_errors_excluded_from_rate_by_default() {
        let s = summary(10, 6, 2);
        assert!((s.rate(false) - 0.75).abs() < f64::EPSILON);
        assert!((s.rate(true) - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn threshold_check_uses_the_rate() {
        let s = summary(10, 9, 0);
        assert!(check_threshold(&s, 0.9, false).is_ok());
        assert!(check_threshold(&s, 0.95, false).is_err());
        let msg = check_threshold(&s, 1.0, false).unwrap_err().to_string();
        assert!(msg.contains("reliability threshold not met"));
    }

    fn test_artifact(targets: Vec<Target>) -> Artifact {
        Artifact {
            name: "m".into(),
            artifact_type: ArtifactType::Module,
            source_path: PathBuf::new(),
            script: String::new(),
            targets,
            vm: VmOpts::default(),
            build: BuildOpts::default(),
            mitigations: Mitigations::default(),
            patches: vec![],
            test_files: vec![],
            standard_modules: false,
            preload: vec![],
        }
    }

    fn ubuntu_kernel(release: &str, blocklisted: bool) -> KernelInfo {
        KernelInfo {
            distro: Distro {
                id: DistroId::Ubuntu,
                release: "18.04".into(),
            },
            kernel_version: release.into(),
            kernel_release: release.into(),
            kernel_source: None,
            container_name: None,
            kernel_path: PathBuf::from("/k"),
            initrd_path: None,
            modules_path: None,
            root_fs: PathBuf::from("/r"),
            vmlinux_path: None,
            blocklisted,
        }
    }

    #[test]
    fn selection_skips_blocklisted_and_unsupported() {
        let artifact = test_artifact(vec![Target {
            distro: Distro {
                id: DistroId::Ubuntu,
                release: String::new(),
            },
            kernel: KernelConstraint {
                regex: r"^5\.".into(),
                exclude_regex: String::new(),
            },
        }]);
        let config = KernelConfig {
            kernels: vec![
                ubuntu_kernel("5.4.0-162-generic", false),
                ubuntu_kernel("5.15.0-91-generic", true),
                ubuntu_kernel("4.15.0-213-generic", false),
            ],
        };

        let selected = select_kernels(&artifact, &config, &SelectOpts::default()).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].kernel_release, "5.4.0-162-generic");
    }

    #[test]
    fn selection_honors_max_and_root_fs_override() {
        let artifact = test_artifact(guess_targets());
        let config = KernelConfig {
            kernels: vec![
                ubuntu_kernel("5.4.0-162-generic", false),
                ubuntu_kernel("5.15.0-91-generic", false),
            ],
        };
        let opts = SelectOpts {
            max_kernels: 1,
            shuffle: false,
            root_fs: Some(PathBuf::from("/custom.img")),
        };
        let selected = select_kernels(&artifact, &config, &opts).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].root_fs, PathBuf::from("/custom.img"));
    }

    #[test]
    fn no_supported_kernels_is_an_error() {
        let artifact = test_artifact(vec![]);
        let config = KernelConfig {
            kernels: vec![ubuntu_kernel("5.4.0-162-generic", false)],
        };
        assert!(select_kernels(&artifact, &config, &SelectOpts::default()).is_err());
    }

    #[test]
    fn kernel_override_parses_family_and_regex() {
        let target = parse_kernel_override("ubuntu:5\\.4.*").unwrap();
        assert_eq!(target.distro.id, DistroId::Ubuntu);
        assert!(target.distro.release.is_empty());
        assert_eq!(target.kernel.regex, "5\\.4.*");
        assert!(parse_kernel_override("no-colon-here").is_err());
    }

    #[test]
    fn guess_targets_cover_every_family() {
        let targets = guess_targets();
        assert_eq!(targets.len(), DistroId::all().len());
        assert!(targets.iter().all(|t| t.kernel.regex == ".*"));
    }
}
