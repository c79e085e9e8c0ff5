//! Resource usage sampling for admission control.
//!
//! The task manager samples once per admission and defers work while CPU or
//! memory usage is above its configured thresholds. Values are percentages on
//! a 0-100 scale.

use serde::{Deserialize, Serialize};
use std::io;
use std::sync::RwLock;

/// Point-in-time resource usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Source of resource usage snapshots
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceSnapshot;
}

/// Samples the host: load average over core count for CPU, and
/// `MemAvailable` against `MemTotal` for memory.
#[derive(Debug, Default)]
pub struct SystemResourceSampler;

impl SystemResourceSampler {
    pub fn new() -> Self {
        Self
    }

    #[cfg(target_os = "linux")]
    fn cpu_percent() -> io::Result<f64> {
        let loadavg = std::fs::read_to_string("/proc/loadavg")?;
        let one_minute = loadavg
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(|| io::Error::other("Failed to parse /proc/loadavg"))?;

        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as f64)
            .unwrap_or(1.0);
        Ok((one_minute / cores * 100.0).clamp(0.0, 100.0))
    }

    #[cfg(target_os = "linux")]
    fn memory_percent() -> io::Result<f64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo")?;
        let mut total = None;
        let mut available = None;

        for line in meminfo.lines() {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("MemTotal:") => total = parts.next().and_then(|v| v.parse::<f64>().ok()),
                Some("MemAvailable:") => {
                    available = parts.next().and_then(|v| v.parse::<f64>().ok())
                }
                _ => {}
            }
        }

        match (total, available) {
            (Some(total), Some(available)) if total > 0.0 => {
                Ok(((total - available) / total * 100.0).clamp(0.0, 100.0))
            }
            _ => Err(io::Error::other("Failed to parse /proc/meminfo")),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn cpu_percent() -> io::Result<f64> {
        Ok(0.0)
    }

    #[cfg(not(target_os = "linux"))]
    fn memory_percent() -> io::Result<f64> {
        Ok(0.0)
    }
}

impl ResourceSampler for SystemResourceSampler {
    fn sample(&self) -> ResourceSnapshot {
        let cpu_percent = Self::cpu_percent().unwrap_or_else(|e| {
            tracing::debug!("CPU sampling unavailable: {}", e);
            0.0
        });
        let memory_percent = Self::memory_percent().unwrap_or_else(|e| {
            tracing::debug!("Memory sampling unavailable: {}", e);
            0.0
        });

        ResourceSnapshot {
            cpu_percent,
            memory_percent,
        }
    }
}

/// Sampler returning a value set by the embedder
#[derive(Debug, Default)]
pub struct FixedResourceSampler {
    snapshot: RwLock<ResourceSnapshot>,
}

impl FixedResourceSampler {
    pub fn new(cpu_percent: f64, memory_percent: f64) -> Self {
        Self {
            snapshot: RwLock::new(ResourceSnapshot {
                cpu_percent,
                memory_percent,
            }),
        }
    }

    pub fn set(&self, cpu_percent: f64, memory_percent: f64) {
        if let Ok(mut snapshot) = self.snapshot.write() {
            *snapshot = ResourceSnapshot {
                cpu_percent,
                memory_percent,
            };
        }
    }
}

impl ResourceSampler for FixedResourceSampler {
    fn sample(&self) -> ResourceSnapshot {
        self.snapshot.read().map(|s| *s).unwrap_or_default()
    }
}
