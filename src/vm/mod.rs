//! VM management module for modforge.
//!
//! Provides the QEMU process supervisor (boot, console capture, panic and
//! timeout watchers, shutdown escalation) and the SSH/scp transport used to
//! drive tests inside the guest over a forwarded loopback port.

use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;

pub mod ssh;
pub mod supervisor;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Resource and behavior knobs for one guest VM.
///
/// Passed to [`supervisor::Vm::new`]; kernel image paths come from the
/// kernel descriptor, everything else from the artifact config or CLI flags.
#[derive(Debug, Clone)]
pub struct VmSpec {
    /// Number of virtual CPUs to give the VM.
    pub cpus: u32,

    /// Memory allocation in megabytes.
    pub memory_mb: u32,

    /// Wall-clock bound for the whole VM lifetime.
    pub timeout: Duration,

    /// Extra settling time after boot, before the first SSH use.
    pub after_start: Duration,

    /// Run without `-snapshot`, letting the guest write to the root image.
    pub mutable: bool,

    /// Expose a gdb stub on this TCP port.
    pub gdb_port: Option<u16>,

    // Kernel mitigation toggles, appended to the boot command line.
    pub disable_kaslr: bool,
    pub disable_smep: bool,
    pub disable_smap: bool,
    pub disable_kpti: bool,
}

impl Default for VmSpec {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory_mb: 512,
            timeout: Duration::from_secs(60),
            after_start: Duration::ZERO,
            mutable: false,
            gdb_port: None,
            disable_kaslr: false,
            disable_smep: false,
            disable_smap: false,
            disable_kpti: false,
        }
    }
}

impl VmSpec {
    /// Boot command-line tokens for the requested mitigation toggles.
    pub fn boot_tokens(&self) -> Vec<&'static str> {
        let mut tokens = Vec::new();
        if self.disable_kaslr {
            tokens.push("nokaslr");
        }
        if self.disable_smep {
            tokens.push("nosmep");
        }
        if self.disable_smap {
            tokens.push("nosmap");
        }
        if self.disable_kpti {
            tokens.push("nokpti");
        }
        tokens
    }
}

// ---------------------------------------------------------------------------
// Loopback endpoint allocation
// ---------------------------------------------------------------------------

/// Pick a free loopback TCP endpoint for the guest's forwarded SSH port.
///
/// Probes random high ports by actually binding them; the listener is
/// dropped immediately, so a race with another process remains possible but
/// QEMU will fail loudly if it loses it.
pub fn free_loopback_endpoint() -> Result<SocketAddr> {
    let mut rng = rand::thread_rng();
    for _ in 0..64 {
        let port: u16 = rng.gen_range(1024..=65535);
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        if TcpListener::bind(addr).is_ok() {
            return Ok(addr);
        }
    }

    // Fall back to a kernel-assigned port.
    let listener =
        TcpListener::bind("127.0.0.1:0").context("no free loopback port available")?;
    let addr = listener.local_addr()?;
    Ok(addr)
}

/// Short alphanumeric tag for collision-free remote and scratch paths.
pub(crate) fn random_tag() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| {
            let n = rng.gen_range(0..36u32);
            char::from_digit(n, 36).unwrap_or('x')
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use ssh::{ExecResult, Remote};
pub use supervisor::Vm;
