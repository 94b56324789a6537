//! Matrix dispatch behavior: the deadline and cancellation stop new work
//! deterministically while the summary stays consistent.
//!
//! No guest is needed: the kernels here have neither a source tree nor a
//! build container, so every dispatched run fails in the build stage and
//! comes back as an internal error long before any VM would start.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use modforge::artifact::{Artifact, ArtifactType, BuildOpts, Mitigations, VmOpts};
use modforge::kernel::{Distro, DistroId, KernelInfo};
use modforge::paths::ForgePaths;
use modforge::pipeline::PipelineOpts;
use modforge::runner::{run_matrix, RunnerOpts};

fn test_paths(root: &std::path::Path) -> ForgePaths {
    let data = root.join("data");
    let daemon = data.join("daemon");
    ForgePaths {
        config: root.join("config"),
        logs: data.join("logs"),
        daemon_logs: daemon.join("logs"),
        repos: daemon.join("repos"),
        tmp: data.join("tmp"),
        daemon,
        data,
    }
}

fn unbuildable_kernel(release: &str) -> KernelInfo {
    KernelInfo {
        distro: Distro {
            id: DistroId::Ubuntu,
            release: "18.04".into(),
        },
        kernel_version: release.into(),
        kernel_release: release.into(),
        kernel_source: None,
        container_name: None,
        kernel_path: PathBuf::from("/opt/kernels/vmlinuz"),
        initrd_path: None,
        modules_path: None,
        root_fs: PathBuf::from("/opt/images/bionic.img"),
        vmlinux_path: None,
        blocklisted: false,
    }
}

fn test_artifact(source: PathBuf) -> Artifact {
    Artifact {
        name: "m".into(),
        artifact_type: ArtifactType::Module,
        source_path: source,
        script: String::new(),
        targets: vec![],
        vm: VmOpts::default(),
        build: BuildOpts::default(),
        mitigations: Mitigations::default(),
        patches: vec![],
        test_files: vec![],
        standard_modules: false,
        preload: vec![],
    }
}

#[tokio::test]
async fn matrix_without_deadline_runs_every_scheduled_pair() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let paths = test_paths(root.path());
    paths.ensure().unwrap();

    let kernels = vec![
        unbuildable_kernel("5.4.0-162-generic"),
        unbuildable_kernel("5.15.0-91-generic"),
    ];
    let opts = RunnerOpts {
        threads: 2,
        runs: 2,
        ..RunnerOpts::default()
    };

    let summary = run_matrix(
        Arc::new(test_artifact(src.path().to_path_buf())),
        kernels,
        &paths,
        opts,
        PipelineOpts::default(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    // 2 kernels x 2 runs, each an internal error (nothing to build against).
    assert_eq!(summary.overall, 4);
    assert_eq!(summary.internal_errors, 4);
    assert_eq!(summary.success, 0);
}

#[tokio::test]
async fn expired_deadline_stops_dispatch_before_any_run() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let paths = test_paths(root.path());
    paths.ensure().unwrap();

    let kernels = vec![
        unbuildable_kernel("5.4.0-162-generic"),
        unbuildable_kernel("5.15.0-91-generic"),
    ];
    let opts = RunnerOpts {
        threads: 2,
        runs: 3,
        deadline: Some(Duration::ZERO),
        ..RunnerOpts::default()
    };

    let summary = run_matrix(
        Arc::new(test_artifact(src.path().to_path_buf())),
        kernels,
        &paths,
        opts,
        PipelineOpts::default(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    // The deadline had already passed when dispatch began; nothing may have
    // been issued, and the empty summary must still be well-formed.
    assert_eq!(summary.overall, 0);
    assert_eq!(summary.rate(false), 0.0);
}

#[tokio::test]
async fn cancelled_token_stops_dispatch_before_any_run() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let paths = test_paths(root.path());
    paths.ensure().unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = run_matrix(
        Arc::new(test_artifact(src.path().to_path_buf())),
        vec![unbuildable_kernel("5.4.0-162-generic")],
        &paths,
        RunnerOpts::default(),
        PipelineOpts::default(),
        cancel,
    )
    .await
    .unwrap();

    assert_eq!(summary.overall, 0);
}
