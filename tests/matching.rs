//! End-to-end target-matching and matrix-expansion scenarios: artifact
//! config text in, selected kernels out.

use std::path::PathBuf;

use modforge::artifact::Artifact;
use modforge::kernel::{Distro, DistroId, KernelConfig, KernelInfo};
use modforge::runner::{check_threshold, select_kernels, RunSummary, SelectOpts};

fn kernel(id: DistroId, release: &str, kernel_release: &str) -> KernelInfo {
    KernelInfo {
        distro: Distro {
            id,
            release: release.into(),
        },
        kernel_version: kernel_release.into(),
        kernel_release: kernel_release.into(),
        kernel_source: None,
        container_name: None,
        kernel_path: PathBuf::from("/opt/kernels/vmlinuz"),
        initrd_path: None,
        modules_path: None,
        root_fs: PathBuf::from("/opt/images/root.img"),
        vmlinux_path: None,
        blocklisted: false,
    }
}

fn parse_artifact(raw: &str) -> Artifact {
    toml::from_str(raw).expect("artifact config should parse")
}

#[test]
fn ubuntu_exact_release_target() {
    let artifact = parse_artifact(
        r#"
        name = "uaf_repro"
        type = "module"

        [[targets]]
        [targets.distro]
        id = "ubuntu"
        release = "18.04"
        [targets.kernel]
        regex = ".*"
    "#,
    );

    assert!(artifact
        .supported(&kernel(DistroId::Ubuntu, "18.04", "5.4.0-162-generic"))
        .unwrap());
    assert!(!artifact
        .supported(&kernel(DistroId::Ubuntu, "20.04", "5.15.0-91-generic"))
        .unwrap());
    assert!(!artifact
        .supported(&kernel(DistroId::Debian, "10", "4.19.0-25-amd64"))
        .unwrap());
}

#[test]
fn debian_family_wide_target() {
    let artifact = parse_artifact(
        r#"
        name = "family_mod"
        type = "module"

        [[targets]]
        [targets.distro]
        id = "debian"
        [targets.kernel]
        regex = "^4\\.19"
    "#,
    );

    assert!(artifact
        .supported(&kernel(DistroId::Debian, "10", "4.19.0-25-amd64"))
        .unwrap());
    assert!(artifact
        .supported(&kernel(DistroId::Debian, "9", "4.19.0-0.bpo.1-amd64"))
        .unwrap());
    assert!(!artifact
        .supported(&kernel(DistroId::Debian, "10", "5.10.0-26-amd64"))
        .unwrap());
}

#[test]
fn exclude_regex_carves_out_cloud_kernels() {
    let artifact = parse_artifact(
        r#"
        name = "lpe"
        type = "exploit"

        [[targets]]
        [targets.distro]
        id = "ubuntu"
        release = "18.04"
        [targets.kernel]
        regex = "^5\\.4"
        exclude_regex = "-(aws|azure|gcp)$"
    "#,
    );

    assert!(artifact
        .supported(&kernel(DistroId::Ubuntu, "18.04", "5.4.0-162-generic"))
        .unwrap());
    assert!(!artifact
        .supported(&kernel(DistroId::Ubuntu, "18.04", "5.4.0-1110-aws"))
        .unwrap());
    assert!(!artifact
        .supported(&kernel(DistroId::Ubuntu, "18.04", "5.4.0-1122-azure"))
        .unwrap());
}

#[test]
fn matrix_expansion_filters_and_caps() {
    let artifact = parse_artifact(
        r#"
        name = "m"
        type = "module"

        [[targets]]
        [targets.distro]
        id = "ubuntu"
        [targets.kernel]
        regex = "^5\\."
    "#,
    );

    let mut blocked = kernel(DistroId::Ubuntu, "20.04", "5.15.0-91-generic");
    blocked.blocklisted = true;

    let config = KernelConfig {
        kernels: vec![
            kernel(DistroId::Ubuntu, "18.04", "5.4.0-162-generic"),
            blocked,
            kernel(DistroId::Ubuntu, "18.04", "4.15.0-213-generic"),
            kernel(DistroId::Debian, "10", "5.10.0-26-amd64"),
            kernel(DistroId::Ubuntu, "22.04", "5.19.0-50-generic"),
        ],
    };

    let selected = select_kernels(&artifact, &config, &SelectOpts::default()).unwrap();
    let releases: Vec<_> = selected.iter().map(|k| k.kernel_release.as_str()).collect();
    assert_eq!(releases, ["5.4.0-162-generic", "5.19.0-50-generic"]);

    let capped = select_kernels(
        &artifact,
        &config,
        &SelectOpts {
            max_kernels: 1,
            shuffle: false,
            root_fs: None,
        },
    )
    .unwrap();
    assert_eq!(capped.len(), 1);
}

#[test]
fn empty_matrix_is_a_config_error_not_a_pass() {
    let artifact = parse_artifact(
        r#"
        name = "m"
        type = "module"

        [[targets]]
        [targets.distro]
        id = "opensuse"
        [targets.kernel]
        regex = ".*"
    "#,
    );
    let config = KernelConfig {
        kernels: vec![kernel(DistroId::Ubuntu, "18.04", "5.4.0-162-generic")],
    };

    // No supported kernels must surface as an error before any rate math;
    // a 0/0 summary would otherwise read as a vacuous green run.
    assert!(select_kernels(&artifact, &config, &SelectOpts::default()).is_err());
    let empty = RunSummary::default();
    assert_eq!(empty.rate(false), 0.0);
    assert!(check_threshold(&empty, 0.5, false).is_err());
}
