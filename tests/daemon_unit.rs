//! Daemon-side properties: the job state machine against a real SQLite
//! file, and the resource ledger under contention.

use std::sync::Arc;

use chrono::Utc;
use modforge::artifact::{Artifact, ArtifactType, BuildOpts, Mitigations, VmOpts};
use modforge::daemon::db::{Db, Job, JobFilter, JobStatus};
use modforge::daemon::resources::Resources;
use modforge::kernel::{Distro, DistroId, KernelInfo};

fn job(uuid: &str, group: &str) -> Job {
    Job {
        id: 0,
        uuid: uuid.into(),
        group_uuid: group.into(),
        repo: "kernel-exploits".into(),
        commit: "4f2c1a9".into(),
        artifact: Artifact {
            name: "uaf_repro".into(),
            artifact_type: ArtifactType::Module,
            source_path: Default::default(),
            script: String::new(),
            targets: vec![],
            vm: VmOpts {
                cpus: 2,
                memory_mb: 1024,
                ..VmOpts::default()
            },
            build: BuildOpts::default(),
            mitigations: Mitigations::default(),
            patches: vec![],
            test_files: vec![],
            standard_modules: false,
            preload: vec![],
        },
        kernel: KernelInfo {
            distro: Distro {
                id: DistroId::Ubuntu,
                release: "18.04".into(),
            },
            kernel_version: "5.4.0-162-generic".into(),
            kernel_release: "5.4.0-162-generic".into(),
            kernel_source: None,
            container_name: None,
            kernel_path: "/opt/kernels/vmlinuz".into(),
            initrd_path: None,
            modules_path: None,
            root_fs: "/opt/images/bionic.img".into(),
            vmlinux_path: None,
            blocklisted: false,
        },
        status: JobStatus::New,
        created: Utc::now(),
        started: None,
        finished: None,
    }
}

fn temp_db() -> (tempfile::TempDir, Db) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&dir.path().join("daemon.db")).unwrap();
    (dir, db)
}

#[test]
fn job_lifecycle_is_forward_only_on_disk() {
    let (_dir, db) = temp_db();
    db.add_job(job("u1", "g1")).unwrap();

    db.set_job_status("u1", JobStatus::Waiting).unwrap();
    db.set_job_status("u1", JobStatus::Running).unwrap();

    let running = db.job_by_uuid("u1").unwrap().unwrap();
    assert!(running.started.is_some());
    assert!(running.finished.is_none());

    db.set_job_status("u1", JobStatus::Failure).unwrap();
    let finished = db.job_by_uuid("u1").unwrap().unwrap();
    assert!(finished.finished.is_some());

    // Nothing moves a terminal job, not even "forward".
    assert!(db.set_job_status("u1", JobStatus::Success).is_err());
    assert!(db.set_job_status("u1", JobStatus::New).is_err());
}

#[test]
fn daemon_restart_requeues_only_running_jobs() {
    let (_dir, db) = temp_db();
    db.add_job(job("stale", "g1")).unwrap();
    db.add_job(job("queued", "g1")).unwrap();
    db.add_job(job("done", "g1")).unwrap();

    db.set_job_status("stale", JobStatus::Waiting).unwrap();
    db.set_job_status("stale", JobStatus::Running).unwrap();
    db.set_job_status("queued", JobStatus::Waiting).unwrap();
    db.set_job_status("done", JobStatus::Waiting).unwrap();
    db.set_job_status("done", JobStatus::Running).unwrap();
    db.set_job_status("done", JobStatus::Success).unwrap();

    assert_eq!(db.requeue_stale_running().unwrap(), 1);

    assert_eq!(
        db.job_by_uuid("stale").unwrap().unwrap().status,
        JobStatus::Waiting
    );
    assert_eq!(
        db.job_by_uuid("queued").unwrap().unwrap().status,
        JobStatus::Waiting
    );
    assert_eq!(
        db.job_by_uuid("done").unwrap().unwrap().status,
        JobStatus::Success
    );
}

#[test]
fn descriptors_survive_the_json_columns() {
    let (_dir, db) = temp_db();
    db.add_job(job("u1", "g1")).unwrap();

    let loaded = db.job_by_uuid("u1").unwrap().unwrap();
    assert_eq!(loaded.artifact.name, "uaf_repro");
    assert_eq!(loaded.artifact.vm.cpus, 2);
    assert_eq!(loaded.kernel.distro.id, DistroId::Ubuntu);
    assert_eq!(loaded.kernel.kernel_release, "5.4.0-162-generic");
}

#[test]
fn group_filter_separates_submissions() {
    let (_dir, db) = temp_db();
    db.add_job(job("a1", "groupA")).unwrap();
    db.add_job(job("a2", "groupA")).unwrap();
    db.add_job(job("b1", "groupB")).unwrap();

    let group_a = db
        .jobs(&JobFilter {
            group_uuid: Some("groupA".into()),
            ..JobFilter::default()
        })
        .unwrap();
    assert_eq!(group_a.len(), 2);
    assert!(group_a.iter().all(|j| j.group_uuid == "groupA"));
}

// ---------------------------------------------------------------------------
// Resource ledger
// ---------------------------------------------------------------------------

#[test]
fn ledger_rejections_leave_counters_untouched() {
    let resources = Resources::with_capacity(4, 2048);

    resources.allocate(2, 1024).unwrap();
    // The second job wants more RAM than is left; the CPU side of the
    // failed claim must roll back too.
    assert!(resources.allocate(2, 2048).is_err());
    assert_eq!(resources.cpu.allocated(), 2);
    assert_eq!(resources.ram_mb.allocated(), 1024);

    resources.release(2, 1024);
    assert_eq!(resources.cpu.allocated(), 0);
    assert_eq!(resources.ram_mb.allocated(), 0);
}

#[test]
fn ledger_holds_its_bound_under_contention() {
    let resources = Arc::new(Resources::with_capacity(8, 8192));
    let mut handles = Vec::new();

    for _ in 0..16 {
        let resources = resources.clone();
        handles.push(std::thread::spawn(move || {
            let mut claimed = 0u32;
            for _ in 0..500 {
                if resources.allocate(2, 2048).is_ok() {
                    let cpu = resources.cpu.allocated();
                    let ram = resources.ram_mb.allocated();
                    assert!(cpu <= 8, "cpu counter above capacity: {cpu}");
                    assert!(ram <= 8192, "ram counter above capacity: {ram}");
                    claimed += 1;
                    resources.release(2, 2048);
                }
            }
            claimed
        }));
    }

    let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(total > 0, "at least some claims should have succeeded");
    assert_eq!(resources.cpu.allocated(), 0);
    assert_eq!(resources.ram_mb.allocated(), 0);
}

#[test]
fn double_release_cannot_mint_capacity() {
    let resources = Resources::with_capacity(4, 1024);
    resources.allocate(4, 1024).unwrap();
    resources.release(4, 1024);
    resources.release(4, 1024);

    resources.allocate(4, 1024).unwrap();
    assert!(resources.allocate(1, 1).is_err());
}
