//! QEMU process supervisor.
//!
//! One [`Vm`] wraps one `qemu-system-x86_64` child: it boots a kernel/rootfs
//! pair with SSH forwarded to a random loopback port, captures the serial
//! console into a shared buffer, watches that buffer for kernel panics,
//! enforces a lifetime bound, and tears the guest down with escalation
//! (monitor quit, SIGTERM, SIGKILL).
//!
//! ```text
//! Vm::start()
//!     └─► tokio::process::Command  →  qemu child process
//!             ├─► console reader tasks  (stdout/stderr → shared buffer)
//!             ├─► exit monitor task     (try_wait every 500 ms → died flag)
//!             ├─► panic watcher task    (scans console every 1 s)
//!             └─► timeout watcher task  (spec.timeout → stop())
//! ```

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::kernel::KernelInfo;
use crate::vm::ssh::{ExecResult, Remote};
use crate::vm::{free_loopback_endpoint, random_tag, VmSpec};

/// Wait after spawn before declaring the boot attempt plausible. A bad
/// kernel path or unusable accelerator makes QEMU exit within this window.
const SPAWN_GRACE: Duration = Duration::from_millis(100);

/// Retry schedule for guest file copies.
const COPY_ATTEMPTS: u32 = 4;
const COPY_RETRY_DELAY: Duration = Duration::from_millis(250);

/// A supervised guest VM.
///
/// Dropping a `Vm` does NOT stop the child process — call [`Vm::stop`]
/// explicitly; it is idempotent and safe to call from multiple watchers.
pub struct Vm {
    kernel: KernelInfo,
    spec: VmSpec,
    remote: Remote,

    child: Arc<RwLock<Option<Child>>>,
    console: Arc<Mutex<String>>,

    died: Arc<AtomicBool>,
    panicked: Arc<AtomicBool>,
    timed_out: Arc<AtomicBool>,
}

impl Vm {
    /// Prepare a VM for the given kernel. Allocates the forwarded SSH
    /// endpoint but does not spawn anything until [`Vm::start`].
    pub fn new(kernel: KernelInfo, spec: VmSpec) -> Result<Self> {
        let remote = Remote::new(free_loopback_endpoint()?);
        Ok(Self {
            kernel,
            spec,
            remote,
            child: Arc::new(RwLock::new(None)),
            console: Arc::new(Mutex::new(String::new())),
            died: Arc::new(AtomicBool::new(false)),
            panicked: Arc::new(AtomicBool::new(false)),
            timed_out: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn kernel(&self) -> &KernelInfo {
        &self.kernel
    }

    pub fn remote(&self) -> Remote {
        self.remote
    }

    /// True once the QEMU process has exited, for any reason.
    pub fn died(&self) -> bool {
        self.died.load(Ordering::SeqCst)
    }

    /// True once the panic watcher has seen `Kernel panic` on the console.
    pub fn panicked(&self) -> bool {
        self.panicked.load(Ordering::SeqCst)
    }

    /// True once the lifetime bound fired.
    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Snapshot of everything the guest has written to the serial console.
    pub async fn console(&self) -> String {
        self.console.lock().await.clone()
    }

    // -----------------------------------------------------------------------
    // Boot
    // -----------------------------------------------------------------------

    /// Spawn QEMU and arm the watchers.
    ///
    /// # Errors
    ///
    /// Returns `Err` when a required image path is missing, the process
    /// fails to spawn, or the child exits within the spawn grace window
    /// (the error carries the console tail for diagnosis).
    pub async fn start(&self) -> Result<()> {
        if !self.kernel.kernel_path.exists() {
            bail!(
                "kernel image does not exist: {}",
                self.kernel.kernel_path.display()
            );
        }
        if !self.kernel.root_fs.exists() {
            bail!(
                "root filesystem does not exist: {}",
                self.kernel.root_fs.display()
            );
        }

        let args = qemu_args(&self.kernel, &self.spec, &self.remote, kvm_usable());

        debug!(args = ?args, "qemu command line");

        let mut child = Command::new("qemu-system-x86_64")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn qemu-system-x86_64")?;

        if let Some(stdout) = child.stdout.take() {
            spawn_console_reader(stdout, self.console.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_console_reader(stderr, self.console.clone());
        }

        *self.child.write().await = Some(child);

        self.spawn_exit_monitor();
        self.spawn_panic_watcher();
        self.spawn_timeout_watcher();

        // Immediate-death check: a bad command line fails fast.
        tokio::time::sleep(SPAWN_GRACE).await;
        if self.died() {
            let console = self.console().await;
            bail!(
                "qemu died immediately after start: {}",
                console.trim().lines().last().unwrap_or("<no output>")
            );
        }

        info!(
            kernel = %self.kernel.slug(),
            ssh = %self.remote,
            cpus = self.spec.cpus,
            memory_mb = self.spec.memory_mb,
            "VM started"
        );

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop the guest, escalating until the process is gone.
    ///
    /// Order: Ctrl-A x on the QEMU monitor (graceful quit), short wait,
    /// SIGTERM, short wait, SIGKILL. Idempotent; callable after the child
    /// has already exited.
    pub async fn stop(&self) -> Result<()> {
        let mut guard = self.child.write().await;
        let Some(child) = guard.as_mut() else {
            return Ok(());
        };

        if child.try_wait()?.is_some() {
            self.died.store(true, Ordering::SeqCst);
            return Ok(());
        }

        // Graceful: Ctrl-A x quits the QEMU monitor.
        if let Some(stdin) = child.stdin.as_mut() {
            let _ = stdin.write_all(b"\x01x").await;
            let _ = stdin.flush().await;
        }
        if wait_for_exit(child, Duration::from_secs(3)).await? {
            self.died.store(true, Ordering::SeqCst);
            debug!(ssh = %self.remote, "VM quit via monitor");
            return Ok(());
        }

        // SIGTERM, then SIGKILL as the last resort.
        if let Some(pid) = child.id() {
            let _ = Command::new("kill").arg(pid.to_string()).status().await;
            if wait_for_exit(child, Duration::from_secs(2)).await? {
                self.died.store(true, Ordering::SeqCst);
                return Ok(());
            }
        }

        warn!(ssh = %self.remote, "VM ignored SIGTERM, killing");
        child.kill().await.context("failed to kill qemu")?;
        let _ = child.wait().await;
        self.died.store(true, Ordering::SeqCst);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Guest interaction
    // -----------------------------------------------------------------------

    /// Block until sshd inside the guest answers an `echo`, or the deadline
    /// passes. Aborts early when the VM dies or panics.
    pub async fn wait_for_ssh(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.died() {
                bail!("VM died while waiting for ssh");
            }
            if self.panicked() {
                bail!("kernel panicked while waiting for ssh");
            }

            if let Ok(result) = self.remote.run("root", "echo ssh is up").await {
                if result.ok {
                    if !self.spec.after_start.is_zero() {
                        tokio::time::sleep(self.spec.after_start).await;
                    }
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                bail!("ssh not reachable within {:?}", timeout);
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Run a command inside the guest, returning combined output + status.
    pub async fn command(&self, user: &str, cmd: &str) -> Result<ExecResult> {
        if self.died() {
            bail!("VM is not running");
        }
        self.remote.run(user, cmd).await
    }

    /// Start a command inside the guest without waiting for it.
    pub async fn async_command(&self, user: &str, cmd: &str) -> Result<()> {
        if self.died() {
            bail!("VM is not running");
        }
        self.remote.run_detached(user, cmd).await
    }

    /// Copy a file into the guest, retrying transient scp failures.
    pub async fn copy_file(&self, user: &str, local: &Path, remote_path: &str) -> Result<()> {
        self.copy_with_retry(user, local, remote_path, false).await
    }

    /// Copy a directory tree into the guest.
    pub async fn copy_directory(
        &self,
        user: &str,
        local: &Path,
        remote_path: &str,
    ) -> Result<()> {
        self.copy_with_retry(user, local, remote_path, true).await
    }

    async fn copy_with_retry(
        &self,
        user: &str,
        local: &Path,
        remote_path: &str,
        recursive: bool,
    ) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..COPY_ATTEMPTS {
            if self.died() {
                bail!("VM died during file copy");
            }
            match self.remote.copy(user, local, remote_path, recursive).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(attempt, error = %e, "copy attempt failed");
                    last_err = Some(e);
                }
            }
            tokio::time::sleep(COPY_RETRY_DELAY).await;
        }
        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("copy failed"))
            .context(format!("copy {} -> {remote_path}", local.display())))
    }

    /// Copy a kernel module into the guest and insmod it as root.
    pub async fn copy_and_insmod(&self, local: &Path) -> Result<ExecResult> {
        let remote_path = format!("/tmp/module_{}.ko", random_tag());
        self.copy_file("root", local, &remote_path).await?;
        self.command("root", &format!("insmod {remote_path}")).await
    }

    /// Copy an executable into the guest, make it runnable, and run it.
    pub async fn copy_and_run(&self, user: &str, local: &Path) -> Result<ExecResult> {
        let remote_path = self.copy_executable(user, local).await?;
        self.command(user, &remote_path).await
    }

    /// Like [`Vm::copy_and_run`] but detaches from the process (stress
    /// scripts in endless mode).
    pub async fn copy_and_run_async(&self, user: &str, local: &Path) -> Result<String> {
        let remote_path = self.copy_executable(user, local).await?;
        self.async_command(user, &remote_path).await?;
        Ok(remote_path)
    }

    async fn copy_executable(&self, user: &str, local: &Path) -> Result<String> {
        let remote_path = format!("/tmp/run_{}", random_tag());
        self.copy_file(user, local, &remote_path).await?;
        let chmod = self
            .command(user, &format!("chmod +x {remote_path}"))
            .await?;
        if !chmod.ok {
            bail!("chmod failed: {}", chmod.output.trim());
        }
        Ok(remote_path)
    }

    // -----------------------------------------------------------------------
    // Watchers
    // -----------------------------------------------------------------------

    fn spawn_exit_monitor(&self) {
        let child = self.child.clone();
        let died = self.died.clone();
        tokio::spawn(async move {
            loop {
                {
                    let mut guard = child.write().await;
                    match guard.as_mut() {
                        Some(c) => match c.try_wait() {
                            Ok(Some(status)) => {
                                debug!(exit_status = ?status, "qemu exited");
                                died.store(true, Ordering::SeqCst);
                                return;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(error = %e, "try_wait on qemu failed");
                                died.store(true, Ordering::SeqCst);
                                return;
                            }
                        },
                        None => return,
                    }
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });
    }

    fn spawn_panic_watcher(&self) {
        let console = self.console.clone();
        let panicked = self.panicked.clone();
        let died = self.died.clone();
        let vm = self.weak_clone();
        tokio::spawn(async move {
            loop {
                if died.load(Ordering::SeqCst) {
                    return;
                }
                if console.lock().await.contains("Kernel panic") {
                    warn!("kernel panic detected on console");
                    panicked.store(true, Ordering::SeqCst);
                    let _ = vm.stop().await;
                    return;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
    }

    fn spawn_timeout_watcher(&self) {
        let timeout = self.spec.timeout;
        let timed_out = self.timed_out.clone();
        let died = self.died.clone();
        let vm = self.weak_clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if died.load(Ordering::SeqCst) {
                return;
            }
            warn!(?timeout, "VM lifetime bound reached");
            timed_out.store(true, Ordering::SeqCst);
            let _ = vm.stop().await;
        });
    }

    /// Cheap handle for the watcher tasks: shares the child/flags but not
    /// the kernel descriptor's allocations.
    fn weak_clone(&self) -> Vm {
        Vm {
            kernel: self.kernel.clone(),
            spec: self.spec.clone(),
            remote: self.remote,
            child: self.child.clone(),
            console: self.console.clone(),
            died: self.died.clone(),
            panicked: self.panicked.clone(),
            timed_out: self.timed_out.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Command-line construction
// ---------------------------------------------------------------------------

fn qemu_args(kernel: &KernelInfo, spec: &VmSpec, remote: &Remote, kvm: bool) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-nographic".into(),
        "-hda".into(),
        kernel.root_fs.display().to_string(),
        "-kernel".into(),
        kernel.kernel_path.display().to_string(),
        "-smp".into(),
        spec.cpus.to_string(),
        "-m".into(),
        spec.memory_mb.to_string(),
        "-device".into(),
        "e1000,netdev=n1".into(),
        "-netdev".into(),
        format!(
            "user,id=n1,hostfwd=tcp:{}:{}-:22",
            remote.addr.ip(),
            remote.addr.port()
        ),
    ];

    if !spec.mutable {
        args.push("-snapshot".into());
    }

    if let Some(initrd) = &kernel.initrd_path {
        args.push("-initrd".into());
        args.push(initrd.display().to_string());
    }

    if kvm {
        args.push("-enable-kvm".into());
        args.push("-cpu".into());
        args.push("max".into());
    }

    if let Some(port) = spec.gdb_port {
        args.push("-gdb".into());
        args.push(format!("tcp::{port}"));
    }

    let mut append = String::from("root=/dev/sda console=ttyS0 rw");
    for token in spec.boot_tokens() {
        append.push(' ');
        append.push_str(token);
    }
    args.push("-append".into());
    args.push(append);

    args
}

fn kvm_usable() -> bool {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/kvm")
        .is_ok()
}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if child.try_wait()?.is_some() {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ---------------------------------------------------------------------------
// Reader tasks
// ---------------------------------------------------------------------------

fn spawn_console_reader<R>(mut reader: R, console: Arc<Mutex<String>>)
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    console.lock().await.push_str(&chunk);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Distro, DistroId};
    use std::path::PathBuf;

    fn test_kernel() -> KernelInfo {
        KernelInfo {
            distro: Distro {
                id: DistroId::Ubuntu,
                release: "18.04".into(),
            },
            kernel_version: "5.4.0-162-generic".into(),
            kernel_release: "5.4.0-162-generic".into(),
            kernel_source: None,
            container_name: None,
            kernel_path: PathBuf::from("/opt/kernels/vmlinuz"),
            initrd_path: Some(PathBuf::from("/opt/kernels/initrd.img")),
            modules_path: None,
            root_fs: PathBuf::from("/opt/images/bionic.img"),
            vmlinux_path: None,
            blocklisted: false,
        }
    }

    fn remote() -> Remote {
        Remote::new("127.0.0.1:41022".parse().unwrap())
    }

    #[test]
    fn qemu_args_forward_ssh_to_the_probed_endpoint() {
        let args = qemu_args(&test_kernel(), &VmSpec::default(), &remote(), false);
        assert!(args
            .iter()
            .any(|a| a == "user,id=n1,hostfwd=tcp:127.0.0.1:41022-:22"));
    }

    #[test]
    fn qemu_args_snapshot_by_default_mutable_opt_out() {
        let args = qemu_args(&test_kernel(), &VmSpec::default(), &remote(), false);
        assert!(args.contains(&"-snapshot".to_string()));

        let spec = VmSpec {
            mutable: true,
            ..VmSpec::default()
        };
        let args = qemu_args(&test_kernel(), &spec, &remote(), false);
        assert!(!args.contains(&"-snapshot".to_string()));
    }

    #[test]
    fn qemu_args_append_line_carries_mitigation_tokens() {
        let spec = VmSpec {
            disable_kaslr: true,
            disable_smep: true,
            disable_smap: true,
            disable_kpti: true,
            ..VmSpec::default()
        };
        let args = qemu_args(&test_kernel(), &spec, &remote(), false);
        let append = args
            .iter()
            .position(|a| a == "-append")
            .map(|i| args[i + 1].clone())
            .unwrap();
        assert!(append.starts_with("root=/dev/sda console=ttyS0 rw"));
        for token in ["nokaslr", "nosmep", "nosmap", "nokpti"] {
            assert!(append.contains(token), "missing {token} in {append}");
        }
    }

    #[test]
    fn qemu_args_kvm_adds_accelerator_and_cpu() {
        let args = qemu_args(&test_kernel(), &VmSpec::default(), &remote(), true);
        assert!(args.contains(&"-enable-kvm".to_string()));
        let cpu = args.iter().position(|a| a == "-cpu").unwrap();
        assert_eq!(args[cpu + 1], "max");
    }

    #[test]
    fn qemu_args_initrd_only_when_present() {
        let mut kernel = test_kernel();
        let args = qemu_args(&kernel, &VmSpec::default(), &remote(), false);
        assert!(args.contains(&"-initrd".to_string()));

        kernel.initrd_path = None;
        let args = qemu_args(&kernel, &VmSpec::default(), &remote(), false);
        assert!(!args.contains(&"-initrd".to_string()));
    }

    #[test]
    fn random_tag_is_filename_safe() {
        let tag = random_tag();
        assert_eq!(tag.len(), 8);
        assert!(tag.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let vm = Vm::new(test_kernel(), VmSpec::default()).unwrap();
        vm.stop().await.unwrap();
        vm.stop().await.unwrap();
        assert!(!vm.panicked());
        assert!(!vm.timed_out());
    }
}
