use std::fs;

/// Source of the process memory figure used for pressure checks.
pub trait MemoryProbe: Send + Sync {
    /// Current memory usage in bytes; 0 when unknown.
    fn used_bytes(&self) -> u64;
}

/// Resident set size of this process, from `/proc/self/status`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemory;

impl MemoryProbe for ProcessMemory {
    fn used_bytes(&self) -> u64 {
        fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| parse_vm_rss_bytes(&status))
            .unwrap_or(0)
    }
}

fn parse_vm_rss_bytes(status: &str) -> Option<u64> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb = rest.split_whitespace().next()?.parse::<u64>().ok()?;
            return Some(kb.saturating_mul(1024));
        }
    }
    None
}

/// Memory-pressure predicate over the last sampled usage.
///
/// The memory source is only read by [`MemoryGuard::sample`], which the dispatch
/// loop calls on its own timer; per-frame checks see the cached figure.
pub struct MemoryGuard {
    probe: Box<dyn MemoryProbe>,
    ceiling: u64,
    used: u64,
}

impl MemoryGuard {
    pub fn new(probe: Box<dyn MemoryProbe>, ceiling: u64) -> Self {
        Self {
            probe,
            ceiling,
            used: 0,
        }
    }

    /// Reads the probe and caches the result.
    pub fn sample(&mut self) -> u64 {
        self.used = self.probe.used_bytes();
        self.used
    }

    /// Usage at the last sample.
    pub fn used_bytes(&self) -> u64 {
        self.used
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn under_pressure(&self) -> bool {
        self.used > self.ceiling
    }
}

impl std::fmt::Debug for MemoryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGuard")
            .field("ceiling", &self.ceiling)
            .field("used", &self.used)
            .finish()
    }
}
