//! modforge: build-deploy-test automation for out-of-tree kernel modules and
//! exploits across a distribution/kernel/mitigation matrix.
//!
//! Each test run boots a throwaway QEMU VM for one kernel, builds the
//! artifact against it, ships it over SSH, runs the test, and scores the
//! result. The `run` command drives the matrix locally or submits it to a
//! `modforge daemon` over mutually-authenticated TLS.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use modforge::artifact::Artifact;
use modforge::client::Client;
use modforge::daemon::{self, db::JobFilter};
use modforge::kernel::KernelConfig;
use modforge::logging;
use modforge::paths::ForgePaths;
use modforge::pipeline::{EndlessOpts, PipelineOpts};
use modforge::runner::{self, RunnerOpts, SelectOpts};

/// Kernel module / exploit CI across a distro-kernel matrix
#[derive(Parser, Debug)]
#[command(name = "modforge", version, about)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Build, deploy and test the artifact across its kernel matrix
    Run(RunArgs),
    /// Run the job daemon
    Daemon(DaemonArgs),
    /// Inspect jobs on a remote daemon
    Jobs(JobsArgs),
    /// Manage repositories on a remote daemon
    Repos(ReposArgs),
    /// List the kernels known locally or to a remote daemon
    Kernels(RemoteArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Artifact config
    #[arg(long, default_value = ".modforge.toml")]
    config: PathBuf,

    /// Ignore the config's targets and try every known kernel
    #[arg(long)]
    guess: bool,

    /// Target override, e.g. ubuntu:5\.4.*
    #[arg(long)]
    kernel: Option<String>,

    /// Concurrent runs (and live VMs)
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Runs per kernel
    #[arg(long, default_value_t = 1)]
    runs: u32,

    /// Cap on distinct kernels (0 = all)
    #[arg(long, default_value_t = 0)]
    max: usize,

    /// Shuffle the kernel list before applying --max
    #[arg(long)]
    shuffle: bool,

    /// Stop dispatching new runs after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Minimum success rate for a zero exit code
    #[arg(long, default_value_t = 1.0)]
    threshold: f64,

    /// Count infrastructure failures against the success rate
    #[arg(long)]
    include_internal_errors: bool,

    /// Log directory tag for this invocation
    #[arg(long, default_value = "results")]
    tag: String,

    /// Export built artifacts per kernel into this directory
    #[arg(long)]
    dist: Option<PathBuf>,

    /// Boot every kernel from this root image instead of its own
    #[arg(long)]
    root_fs: Option<PathBuf>,

    /// Use a pre-built artifact instead of building
    #[arg(long)]
    binary: Option<PathBuf>,

    /// Test script override (default: <source>/test.sh)
    #[arg(long)]
    test_script: Option<PathBuf>,

    /// Let the guest write to the root image (no -snapshot)
    #[arg(long)]
    mutable: bool,

    /// Expose a gdb stub on this port and log the ssh command line
    #[arg(long)]
    gdb: Option<u16>,

    /// After a green pass, keep re-running the test until it breaks
    #[arg(long)]
    endless: bool,

    /// Stress workload started before the endless loop
    #[arg(long)]
    endless_stress: Option<PathBuf>,

    /// Seconds between endless iterations
    #[arg(long, default_value_t = 30)]
    endless_interval: u64,

    /// Submit to this daemon instead of running locally
    #[arg(long)]
    remote: Option<String>,

    #[arg(long, default_value_t = daemon::DEFAULT_PORT)]
    remote_port: u16,

    /// Repo name on the daemon (remote mode)
    #[arg(long)]
    repo: Option<String>,

    /// Commit to test (remote mode)
    #[arg(long)]
    commit: Option<String>,

    /// Poll the submitted job group until it finishes
    #[arg(long)]
    watch: bool,
}

#[derive(Parser, Debug)]
struct DaemonArgs {
    #[arg(long, default_value_t = daemon::DEFAULT_PORT)]
    port: u16,

    /// Concurrently running jobs
    #[arg(long, default_value_t = 4)]
    workers: usize,

    #[arg(long, default_value_t = 1.0)]
    cpu_overcommit: f64,

    #[arg(long, default_value_t = 1.0)]
    ram_overcommit: f64,
}

#[derive(Parser, Debug)]
struct RemoteArgs {
    /// Daemon address; omit to use local data only
    #[arg(long)]
    remote: Option<String>,

    #[arg(long, default_value_t = daemon::DEFAULT_PORT)]
    remote_port: u16,
}

#[derive(Parser, Debug)]
struct JobsArgs {
    #[command(flatten)]
    remote: RemoteArgs,

    #[command(subcommand)]
    command: JobsCmd,
}

#[derive(Subcommand, Debug)]
enum JobsCmd {
    /// List jobs, optionally filtered
    List {
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        commit: Option<String>,
        /// Only jobs touched within the last N hours
        #[arg(long)]
        updated: Option<u32>,
    },
    /// Show one job's status
    Status { uuid: String },
    /// Fetch one job's log artifacts
    Logs { uuid: String },
}

#[derive(Parser, Debug)]
struct ReposArgs {
    #[command(flatten)]
    remote: RemoteArgs,

    #[command(subcommand)]
    command: ReposCmd,
}

#[derive(Subcommand, Debug)]
enum ReposCmd {
    List,
    /// Register a new bare repository on the daemon
    Add { name: String },
    /// Tunnel a local port to the daemon's git daemon
    Proxy {
        #[arg(long, default_value_t = 9419)]
        port: u16,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let paths = ForgePaths::resolve().context("HOME is not set")?;
    paths.ensure().context("create application directories")?;
    let _log_guard = logging::init(&paths.data);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    runtime.block_on(async move {
        let cancel = CancellationToken::new();
        spawn_signal_handler(cancel.clone());

        match args.command {
            Cmd::Run(run) => cmd_run(&paths, run, cancel).await,
            Cmd::Daemon(d) => {
                daemon::run(
                    paths.clone(),
                    daemon::DaemonConfig {
                        listen_port: d.port,
                        workers: d.workers,
                        cpu_overcommit: d.cpu_overcommit,
                        ram_overcommit: d.ram_overcommit,
                    },
                    cancel,
                )
                .await
            }
            Cmd::Jobs(jobs) => cmd_jobs(&paths, jobs).await,
            Cmd::Repos(repos) => cmd_repos(&paths, repos).await,
            Cmd::Kernels(remote) => cmd_kernels(&paths, remote).await,
        }
    })
}

/// First Ctrl-C drains in-flight work; the second one gives up waiting.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let seen = AtomicBool::new(false);
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if seen.swap(true, Ordering::SeqCst) {
                warn!("second interrupt, exiting immediately");
                std::process::exit(130);
            }
            info!("interrupt received, finishing in-flight runs (Ctrl-C again to abort)");
            cancel.cancel();
        }
    });
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(paths: &ForgePaths, args: RunArgs, cancel: CancellationToken) -> Result<()> {
    let mut artifact = Artifact::read(&args.config)?;
    if artifact.source_path.as_os_str().is_empty() {
        if let Some(dir) = args.config.parent() {
            artifact.source_path = dir.to_path_buf();
        }
    }

    if args.guess {
        artifact.targets = runner::guess_targets();
    } else if let Some(spec) = &args.kernel {
        artifact.targets = vec![runner::parse_kernel_override(spec)?];
    }
    if artifact.targets.is_empty() {
        bail!("artifact has no targets; use --guess or --kernel to provide some");
    }

    let select = SelectOpts {
        max_kernels: args.max,
        shuffle: args.shuffle,
        root_fs: args.root_fs.clone(),
    };

    if let Some(host) = args.remote.clone() {
        return cmd_run_remote(paths, &artifact, &select, &host, &args).await;
    }

    let config = KernelConfig::read(&paths.kernels_config())?;
    let kernels = runner::select_kernels(&artifact, &config, &select)?;
    info!(kernels = kernels.len(), runs = args.runs, "matrix expanded");

    let pipeline_opts = PipelineOpts {
        binary: args.binary.clone(),
        test_script: args.test_script.clone(),
        mutable_image: args.mutable,
        gdb_port: args.gdb,
        endless: args.endless.then(|| EndlessOpts {
            stress_script: args.endless_stress.clone(),
            interval: Duration::from_secs(args.endless_interval),
        }),
    };
    let opts = RunnerOpts {
        threads: args.threads,
        runs: args.runs,
        deadline: args.timeout.map(Duration::from_secs),
        tag: args.tag.clone(),
        dist: args.dist.clone(),
    };

    let summary = runner::run_matrix(
        Arc::new(artifact),
        kernels,
        paths,
        opts,
        pipeline_opts,
        cancel,
    )
    .await?;

    println!(
        "{}/{} runs succeeded, {} internal errors, success rate {:.2}",
        summary.success,
        summary.overall,
        summary.internal_errors,
        summary.rate(args.include_internal_errors)
    );
    runner::check_threshold(&summary, args.threshold, args.include_internal_errors)
}

async fn cmd_run_remote(
    paths: &ForgePaths,
    artifact: &Artifact,
    select: &SelectOpts,
    host: &str,
    args: &RunArgs,
) -> Result<()> {
    let repo = args
        .repo
        .as_deref()
        .context("--repo is required with --remote")?;
    let commit = args
        .commit
        .as_deref()
        .context("--commit is required with --remote")?;

    let client = Client::new(paths, host, args.remote_port)?;
    let (group, queued) = client
        .submit_matrix(repo, commit, artifact, select, args.runs)
        .await?;
    println!("queued {queued} jobs in group {group}");

    if !args.watch {
        return Ok(());
    }

    let summary = client.watch_group(&group, Duration::from_secs(5)).await?;
    println!(
        "{}/{} jobs succeeded, success rate {:.2}",
        summary.success,
        summary.overall,
        summary.rate(args.include_internal_errors)
    );
    runner::check_threshold(&summary, args.threshold, args.include_internal_errors)
}

// ---------------------------------------------------------------------------
// jobs / repos / kernels
// ---------------------------------------------------------------------------

fn remote_client(paths: &ForgePaths, remote: &RemoteArgs) -> Result<Client> {
    let host = remote
        .remote
        .as_deref()
        .context("--remote <host> is required for this command")?;
    Client::new(paths, host, remote.remote_port)
}

async fn cmd_jobs(paths: &ForgePaths, args: JobsArgs) -> Result<()> {
    let client = remote_client(paths, &args.remote)?;

    match args.command {
        JobsCmd::List {
            group,
            repo,
            commit,
            updated,
        } => {
            let jobs = client
                .jobs(JobFilter {
                    group_uuid: group,
                    repo,
                    commit,
                    status: None,
                    updated_hours: updated,
                })
                .await?;
            for job in jobs {
                println!(
                    "{}  {:8}  {}  {}  {}",
                    job.uuid,
                    job.status.as_str(),
                    job.repo,
                    job.commit,
                    job.kernel.slug()
                );
            }
        }
        JobsCmd::Status { uuid } => {
            println!("{}", client.job_status(&uuid).await?.as_str());
        }
        JobsCmd::Logs { uuid } => {
            for log in client.job_logs(&uuid).await? {
                println!("===== {} =====", log.name);
                println!("{}", log.content);
            }
        }
    }
    Ok(())
}

async fn cmd_repos(paths: &ForgePaths, args: ReposArgs) -> Result<()> {
    let client = remote_client(paths, &args.remote)?;

    match args.command {
        ReposCmd::List => {
            for name in client.repos().await? {
                println!("{name}");
            }
        }
        ReposCmd::Add { name } => {
            client.add_repo(&name).await?;
            println!("repo {name} created");
        }
        ReposCmd::Proxy { port } => {
            client.git_proxy(port).await?;
        }
    }
    Ok(())
}

async fn cmd_kernels(paths: &ForgePaths, args: RemoteArgs) -> Result<()> {
    let kernels = match &args.remote {
        Some(host) => Client::new(paths, host, args.remote_port)?.kernels().await?,
        None => KernelConfig::read(&paths.kernels_config())?.kernels,
    };

    if kernels.is_empty() {
        error!("no kernels configured");
        return Ok(());
    }
    for kernel in kernels {
        let marker = if kernel.blocklisted {
            "  [blocklisted]"
        } else {
            ""
        };
        println!("{}{marker}", kernel.slug());
    }
    Ok(())
}
