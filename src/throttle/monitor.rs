//! Resource sampling for the auto-throttler.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// One reading of process-wide load
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Live tasks on the current tokio runtime
    pub tasks: u64,
}

/// Source of resource samples
pub trait ResourceMonitor: Send + Sync + Debug {
    fn sample(&self) -> ResourceSample;
}

/// Host CPU from `sysinfo`, this process's resident memory as a share of
/// physical memory, and the task count of the tokio runtime
///
/// CPU usage is measured between consecutive samples, so the first sample
/// after construction reads close to zero.
#[derive(Debug)]
pub struct SysinfoMonitor {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SysinfoMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn memory_percent(resident: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (resident as f64 / total as f64 * 100.0).min(100.0)
    }
}

fn live_tasks() -> u64 {
    tokio::runtime::Handle::try_current()
        .map(|handle| handle.metrics().num_alive_tasks() as u64)
        .unwrap_or(0)
}

impl ResourceMonitor for SysinfoMonitor {
    fn sample(&self) -> ResourceSample {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_cpu_usage();
        system.refresh_memory();

        let resident = match self.pid {
            Some(pid) => {
                system.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[pid]),
                    true,
                    ProcessRefreshKind::nothing().with_memory(),
                );
                system.process(pid).map_or(0, |p| p.memory())
            }
            None => 0,
        };
        let memory_percent = memory_percent(resident, system.total_memory());

        ResourceSample {
            cpu_percent: system.global_cpu_usage() as f64,
            memory_percent,
            tasks: live_tasks(),
        }
    }
}

/// Returns whatever sample was last set
#[derive(Debug, Default)]
pub struct FixedMonitor {
    sample: Mutex<ResourceSample>,
}

impl FixedMonitor {
    pub fn new(sample: ResourceSample) -> Self {
        Self {
            sample: Mutex::new(sample),
        }
    }

    pub fn set(&self, sample: ResourceSample) {
        *self.sample.lock().unwrap_or_else(|e| e.into_inner()) = sample;
    }
}

impl ResourceMonitor for FixedMonitor {
    fn sample(&self) -> ResourceSample {
        *self.sample.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysinfo_sample_is_in_range() {
        let monitor = SysinfoMonitor::new();
        let sample = monitor.sample();
        assert!(sample.cpu_percent >= 0.0);
        assert!((0.0..=100.0).contains(&sample.memory_percent));
        assert_eq!(sample.tasks, 0);
    }

    #[test]
    fn test_memory_is_this_process() {
        let monitor = SysinfoMonitor::new();
        assert!(monitor.pid.is_some());
        // A running test binary has resident pages
        assert!(monitor.sample().memory_percent > 0.0);

        assert_eq!(memory_percent(512, 2048), 25.0);
        assert_eq!(memory_percent(1, 0), 0.0);
    }

    #[tokio::test]
    async fn test_sample_counts_runtime_tasks() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = rx.await;
        });

        let sample = SysinfoMonitor::new().sample();
        assert!(sample.tasks >= 1);

        let _ = tx.send(());
        handle.await.unwrap();
    }

    #[test]
    fn test_fixed_monitor() {
        let monitor = FixedMonitor::default();
        assert_eq!(monitor.sample(), ResourceSample::default());
        monitor.set(ResourceSample {
            cpu_percent: 98.0,
            memory_percent: 10.0,
            tasks: 5,
        });
        assert_eq!(monitor.sample().cpu_percent, 98.0);
    }
}
