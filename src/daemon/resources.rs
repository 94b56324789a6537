//! Host resource ledger for the daemon.
//!
//! Two independent counters (CPU units, RAM megabytes) bound how many jobs
//! may run at once. Capacity is detected once at startup and scaled by a
//! per-counter overcommit factor; allocation fails when a request would
//! push a counter past its bound, and release saturates at zero so a buggy
//! double-release can never open the gate wider than the hardware.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

pub struct Counter {
    name: &'static str,
    capacity: u64,
    allocated: Mutex<u64>,
}

impl Counter {
    pub fn new(name: &'static str, capacity: u64) -> Self {
        Self {
            name,
            capacity,
            allocated: Mutex::new(0),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.lock().map(|v| *v).unwrap_or(0)
    }

    pub fn allocate(&self, amount: u64) -> Result<()> {
        if amount == 0 {
            bail!("refusing zero-sized {} allocation", self.name);
        }
        let mut allocated = self
            .allocated
            .lock()
            .map_err(|_| anyhow::anyhow!("{} counter poisoned", self.name))?;
        let wanted = allocated
            .checked_add(amount)
            .with_context(|| format!("{} allocation overflow", self.name))?;
        if wanted > self.capacity {
            bail!(
                "not enough {}: want {amount}, {} of {} in use",
                self.name,
                *allocated,
                self.capacity
            );
        }
        *allocated = wanted;
        debug!(counter = self.name, allocated = *allocated, "allocated");
        Ok(())
    }

    pub fn release(&self, amount: u64) {
        if let Ok(mut allocated) = self.allocated.lock() {
            *allocated = allocated.saturating_sub(amount);
            debug!(counter = self.name, allocated = *allocated, "released");
        }
    }
}

pub struct Resources {
    pub cpu: Counter,
    pub ram_mb: Counter,
}

/// A live claim against both counters. Dropping it releases the claim, so
/// the ledger stays balanced no matter how the holder's code path exits.
pub struct ResourceClaim {
    resources: Arc<Resources>,
    cpus: u64,
    ram_mb: u64,
}

impl Drop for ResourceClaim {
    fn drop(&mut self) {
        self.resources.release(self.cpus, self.ram_mb);
    }
}

impl Resources {
    /// Detect host capacity and apply the overcommit factors.
    pub fn detect(cpu_overcommit: f64, ram_overcommit: f64) -> Result<Self> {
        let cpus = std::thread::available_parallelism()
            .context("detect CPU count")?
            .get() as u64;
        let ram_mb = total_ram_mb().context("detect total RAM")?;

        let resources = Self::with_capacity(
            scale(cpus, cpu_overcommit),
            scale(ram_mb, ram_overcommit),
        );
        info!(
            cpus = resources.cpu.capacity(),
            ram_mb = resources.ram_mb.capacity(),
            "resource ledger initialized"
        );
        Ok(resources)
    }

    pub fn with_capacity(cpus: u64, ram_mb: u64) -> Self {
        Self {
            cpu: Counter::new("cpu", cpus),
            ram_mb: Counter::new("ram_mb", ram_mb),
        }
    }

    /// Claim both counters and tie the claim to a guard that releases on
    /// drop.
    pub fn claim(self: &Arc<Self>, cpus: u64, ram_mb: u64) -> Result<ResourceClaim> {
        self.allocate(cpus, ram_mb)?;
        Ok(ResourceClaim {
            resources: self.clone(),
            cpus,
            ram_mb,
        })
    }

    /// Claim both counters, leaving neither allocated on failure.
    pub fn allocate(&self, cpus: u64, ram_mb: u64) -> Result<()> {
        self.cpu.allocate(cpus)?;
        if let Err(e) = self.ram_mb.allocate(ram_mb) {
            self.cpu.release(cpus);
            return Err(e);
        }
        Ok(())
    }

    pub fn release(&self, cpus: u64, ram_mb: u64) {
        self.cpu.release(cpus);
        self.ram_mb.release(ram_mb);
    }
}

fn scale(value: u64, factor: f64) -> u64 {
    ((value as f64) * factor).max(0.0) as u64
}

fn total_ram_mb() -> Result<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo")?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .context("parse MemTotal")?;
            return Ok(kb / 1024);
        }
    }
    bail!("MemTotal not found in /proc/meminfo")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn allocation_respects_capacity() {
        let c = Counter::new("cpu", 4);
        c.allocate(3).unwrap();
        assert!(c.allocate(2).is_err());
        c.allocate(1).unwrap();
        assert_eq!(c.allocated(), 4);
    }

    #[test]
    fn zero_requests_are_rejected() {
        let r = Resources::with_capacity(4, 1024);
        assert!(r.cpu.allocate(0).is_err());
        assert!(r.allocate(0, 512).is_err());
        assert!(r.allocate(1, 0).is_err());
        // Nothing sticks after rejected combined allocations.
        assert_eq!(r.cpu.allocated(), 0);
        assert_eq!(r.ram_mb.allocated(), 0);
    }

    #[test]
    fn release_saturates_at_zero() {
        let c = Counter::new("ram_mb", 1024);
        c.allocate(512).unwrap();
        c.release(1024);
        assert_eq!(c.allocated(), 0);
        // The full capacity is available again, not more.
        c.allocate(1024).unwrap();
        assert!(c.allocate(1).is_err());
    }

    #[test]
    fn failed_ram_claim_rolls_back_cpu() {
        let r = Resources::with_capacity(8, 1024);
        assert!(r.allocate(2, 4096).is_err());
        assert_eq!(r.cpu.allocated(), 0);
        r.allocate(2, 1024).unwrap();
        assert_eq!(r.cpu.allocated(), 2);
    }

    #[test]
    fn overcommit_scales_detected_capacity() {
        assert_eq!(scale(8, 1.5), 12);
        assert_eq!(scale(8, 1.0), 8);
        assert_eq!(scale(1000, 0.5), 500);
    }

    #[test]
    fn dropped_claim_releases_both_counters() {
        let r = Arc::new(Resources::with_capacity(4, 2048));
        let claim = r.claim(2, 1024).unwrap();
        assert_eq!(r.cpu.allocated(), 2);
        assert_eq!(r.ram_mb.allocated(), 1024);

        drop(claim);
        assert_eq!(r.cpu.allocated(), 0);
        assert_eq!(r.ram_mb.allocated(), 0);
    }

    #[test]
    fn claim_releases_when_an_error_path_unwinds_the_scope() {
        let r = Arc::new(Resources::with_capacity(4, 2048));

        let outcome = (|| -> Result<()> {
            let _claim = r.claim(2, 1024)?;
            bail!("status write failed");
        })();

        assert!(outcome.is_err());
        assert_eq!(r.cpu.allocated(), 0);
        assert_eq!(r.ram_mb.allocated(), 0);
    }

    #[test]
    fn concurrent_allocation_never_exceeds_capacity() {
        let r = Arc::new(Resources::with_capacity(16, 16));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let r = r.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    if r.allocate(2, 2).is_ok() {
                        assert!(r.cpu.allocated() <= 16);
                        assert!(r.ram_mb.allocated() <= 16);
                        r.release(2, 2);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(r.cpu.allocated(), 0);
        assert_eq!(r.ram_mb.allocated(), 0);
    }
}
