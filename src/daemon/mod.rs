//! Job daemon: accepts work over a mutually-authenticated TLS channel,
//! serves the backing git repositories, and drives queued jobs through the
//! pipeline under a host resource budget.
//!
//! ```text
//! daemon::run()
//!     ├─► server::serve          (TLS listener, command handlers, git tunnel)
//!     ├─► git daemon child       (git:// on 127.0.0.1:9418, receive-pack on)
//!     └─► poll loop (1 s)
//!             ├─► NEW     → WAITING
//!             └─► WAITING → worker slot + CPU/RAM claim → RUNNING
//!                              └─► clone at commit → pipeline → logs →
//!                                  SUCCESS / FAILURE, resources released
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod db;
pub mod protocol;
pub mod resources;
pub mod server;

use crate::kernel::KernelConfig;
use crate::paths::ForgePaths;
use crate::pipeline::{Pipeline, PipelineOpts, RunResult};
use db::{Db, Job, JobFilter, JobStatus};
use resources::Resources;

/// Default TLS listen port for the control channel.
pub const DEFAULT_PORT: u16 = 63527;

/// Local port the bundled git daemon listens on.
pub const GIT_PORT: u16 = 9418;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub listen_port: u16,
    /// Worker-pool width for concurrently running jobs.
    pub workers: usize,
    pub cpu_overcommit: f64,
    pub ram_overcommit: f64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            workers: 4,
            cpu_overcommit: 1.0,
            ram_overcommit: 1.0,
        }
    }
}

/// Run the daemon until the token is cancelled.
pub async fn run(paths: ForgePaths, config: DaemonConfig, cancel: CancellationToken) -> Result<()> {
    paths.ensure().context("create daemon directories")?;
    server::ensure_tls_material(&paths).await?;

    let database = Db::open(&paths.daemon_db())?;
    let resources = Arc::new(Resources::detect(
        config.cpu_overcommit,
        config.ram_overcommit,
    )?);
    let kernels = KernelConfig::read(&paths.kernels_config())
        .unwrap_or_else(|e| {
            warn!(error = %e, "no kernel config, daemon starts with an empty list");
            KernelConfig::default()
        });

    let mut git_daemon = spawn_git_daemon(&paths)?;

    let listener = server::Listener::bind(&paths, database.clone(), kernels, config.listen_port)
        .await?;
    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = listener.serve(server_cancel).await {
            error!(error = %e, "control listener failed");
        }
    });

    info!(port = config.listen_port, workers = config.workers, "daemon up");

    let workers = Arc::new(Semaphore::new(config.workers.max(1)));
    let mut first_iteration = true;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        if first_iteration {
            // Jobs left RUNNING by a previous daemon life can't be resumed;
            // put them back in the queue before dispatching anything.
            match database.requeue_stale_running() {
                Ok(0) => {}
                Ok(n) => info!(count = n, "requeued stale running jobs"),
                Err(e) => warn!(error = %e, "requeue of stale jobs failed"),
            }
            first_iteration = false;
        }

        if let Err(e) = poll_once(&database, &paths, &resources, &workers).await {
            warn!(error = %e, "poll iteration failed");
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = cancel.cancelled() => break,
        }
    }

    info!("daemon shutting down");
    let _ = git_daemon.kill().await;
    Ok(())
}

async fn poll_once(
    database: &Db,
    paths: &ForgePaths,
    resources: &Arc<Resources>,
    workers: &Arc<Semaphore>,
) -> Result<()> {
    let jobs = database.jobs(&JobFilter::default())?;

    for job in jobs {
        match job.status {
            JobStatus::New => {
                database.set_job_status(&job.uuid, JobStatus::Waiting)?;
            }
            JobStatus::Waiting => {
                let Ok(permit) = workers.clone().try_acquire_owned() else {
                    // Pool is full; the rest of the queue waits too.
                    break;
                };

                let (cpus, ram_mb) = job_request(&job);
                let claim = match resources.claim(cpus, ram_mb) {
                    Ok(claim) => claim,
                    Err(e) => {
                        // Not enough host left over; leave the job WAITING.
                        warn!(uuid = %job.uuid, error = %e, "resource claim failed");
                        drop(permit);
                        continue;
                    }
                };

                // On a failed write the claim guard drops and releases.
                database.set_job_status(&job.uuid, JobStatus::Running)?;
                info!(uuid = %job.uuid, repo = %job.repo, cpus, ram_mb, "job started");

                let database = database.clone();
                let paths = paths.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let uuid = job.uuid.clone();

                    let verdict = process_job(&paths, job).await;
                    drop(claim);

                    let status = match verdict {
                        Ok(true) => JobStatus::Success,
                        Ok(false) => JobStatus::Failure,
                        Err(e) => {
                            error!(uuid = %uuid, error = %format!("{e:#}"), "job processing failed");
                            JobStatus::Failure
                        }
                    };
                    if let Err(e) = database.set_job_status(&uuid, status) {
                        error!(uuid = %uuid, error = %e, "finalizing job status failed");
                    }
                });
            }
            JobStatus::Running | JobStatus::Success | JobStatus::Failure => {}
        }
    }
    Ok(())
}

/// CPU/RAM the job's VM will consume, with the supervisor's defaults.
fn job_request(job: &Job) -> (u64, u64) {
    let cpus = if job.artifact.vm.cpus == 0 {
        1
    } else {
        job.artifact.vm.cpus as u64
    };
    let ram = if job.artifact.vm.memory_mb == 0 {
        512
    } else {
        job.artifact.vm.memory_mb as u64
    };
    (cpus, ram)
}

/// Clone, run, persist logs. `Ok(true)` means the test passed.
async fn process_job(paths: &ForgePaths, mut job: Job) -> Result<bool> {
    let checkout = clone_at_commit(paths, &job.repo, &job.commit).await?;
    job.artifact.source_path = checkout.clone();

    let pipeline = Pipeline {
        artifact: &job.artifact,
        kernel: &job.kernel,
        tmp_root: &paths.tmp,
        opts: PipelineOpts::default(),
    };
    let result = pipeline.run().await;

    if let Err(e) = write_job_logs(paths, &job.uuid, &result) {
        warn!(uuid = %job.uuid, error = %e, "writing job logs failed");
    }
    let _ = tokio::fs::remove_dir_all(&checkout).await;

    if let Some(message) = &result.internal_error {
        bail!("internal error: {message}");
    }
    Ok(result.test.ok)
}

async fn clone_at_commit(paths: &ForgePaths, repo: &str, commit: &str) -> Result<PathBuf> {
    let dir = paths.tmp.join(format!("job_{}", uuid::Uuid::new_v4()));
    let url = format!("git://localhost:{GIT_PORT}/{repo}");

    let clone = Command::new("git")
        .arg("clone")
        .arg("--quiet")
        .arg(&url)
        .arg(&dir)
        .stdin(Stdio::null())
        .output()
        .await
        .context("failed to spawn git clone")?;
    if !clone.status.success() {
        bail!(
            "git clone {url} failed: {}",
            String::from_utf8_lossy(&clone.stderr).trim()
        );
    }

    let checkout = Command::new("git")
        .arg("-C")
        .arg(&dir)
        .arg("checkout")
        .arg("--quiet")
        .arg(commit)
        .output()
        .await
        .context("failed to spawn git checkout")?;
    if !checkout.status.success() {
        let _ = tokio::fs::remove_dir_all(&dir).await;
        bail!(
            "git checkout {commit} failed: {}",
            String::from_utf8_lossy(&checkout.stderr).trim()
        );
    }

    Ok(dir)
}

fn write_job_logs(paths: &ForgePaths, uuid: &str, result: &RunResult) -> Result<()> {
    let dir = paths.daemon_logs.join(uuid);
    std::fs::create_dir_all(&dir)?;

    std::fs::write(dir.join("build.log"), &result.build.output)?;
    std::fs::write(dir.join("run.log"), &result.run.output)?;
    std::fs::write(dir.join("test.log"), &result.test.output)?;
    std::fs::write(dir.join("console.log"), &result.console)?;
    if let Some(message) = &result.internal_error {
        std::fs::write(dir.join("internal.log"), message)?;
    }
    Ok(())
}

fn spawn_git_daemon(paths: &ForgePaths) -> Result<tokio::process::Child> {
    Command::new("git")
        .arg("daemon")
        .arg("--export-all")
        .arg("--enable=receive-pack")
        .arg("--reuseaddr")
        .arg("--listen=127.0.0.1")
        .arg(format!("--port={GIT_PORT}"))
        .arg(format!("--base-path={}", paths.repos.display()))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn git daemon")
}
