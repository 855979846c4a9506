// gantry: a multi-language build system and test runner.
// Copyright (C) 2024 International Digital Economy Academy
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// For inquiries, you can contact us via e-mail at jichuruanjian@idea.edu.cn.

//! Periodic sampling of system CPU / memory / io-wait for display and
//! rate-shaping decisions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{CpuExt, System, SystemExt};

/// How often the sampler polls the OS.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// One snapshot of system load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemStats {
    pub num_cpus: i32,
    /// Busy CPU, in percent, clamped to `[0, 100 * num_cpus]`.
    pub cpu_use: f64,
    /// Time spent waiting on I/O, in percent of total CPU time.
    pub io_wait: f64,
    pub mem_total: u64,
    pub mem_used: u64,
    pub num_worker_processes: i32,
}

impl SystemStats {
    /// Used memory as a percentage, recomputed from the totals rather than
    /// trusting any percentage the OS itself reports.
    pub fn mem_used_percent(&self) -> f64 {
        if self.mem_total == 0 {
            0.0
        } else {
            self.mem_used as f64 / self.mem_total as f64 * 100.0
        }
    }
}

#[cfg(target_os = "linux")]
#[derive(Default, Clone, Copy)]
struct CpuTimes {
    iowait: u64,
    total: u64,
}

#[cfg(target_os = "linux")]
fn read_cpu_times() -> Option<CpuTimes> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 5 {
        return None;
    }
    Some(CpuTimes {
        iowait: fields[4],
        total: fields.iter().sum(),
    })
}

/// Background sampler writing [`SystemStats`] on a fixed cadence.
///
/// The worker-process count is not something the OS can tell us; pools
/// update it through the handle returned by [`ResourceSampler::worker_count`].
pub struct ResourceSampler {
    shared: Arc<Mutex<SystemStats>>,
    workers: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ResourceSampler {
    pub fn start() -> Self {
        let shared = Arc::new(Mutex::new(SystemStats::default()));
        let workers = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let shared2 = Arc::clone(&shared);
        let workers2 = Arc::clone(&workers);
        let stop2 = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("resource-sampler".to_owned())
            .spawn(move || sample_loop(&shared2, &workers2, &stop2))
            .expect("failed to spawn the resource sampler thread");

        ResourceSampler {
            shared,
            workers,
            stop,
            handle: Some(handle),
        }
    }

    pub fn snapshot(&self) -> SystemStats {
        self.shared.lock().unwrap().clone()
    }

    /// Shared counter of currently running worker subprocesses.
    pub fn worker_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.workers)
    }
}

impl Drop for ResourceSampler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn sample_loop(shared: &Mutex<SystemStats>, workers: &AtomicUsize, stop: &AtomicBool) {
    let mut sys = System::new();
    sys.refresh_cpu();
    sys.refresh_memory();
    #[cfg(target_os = "linux")]
    let mut last_times = read_cpu_times().unwrap_or_default();

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(SAMPLE_INTERVAL);
        if stop.load(Ordering::Relaxed) {
            break;
        }
        sys.refresh_cpu();
        sys.refresh_memory();

        let num_cpus = sys.cpus().len() as i32;
        let busy: f64 = sys.cpus().iter().map(|c| f64::from(c.cpu_usage())).sum();
        let cpu_use = busy.clamp(0.0, 100.0 * f64::from(num_cpus));

        let io_wait = {
            #[cfg(target_os = "linux")]
            {
                match read_cpu_times() {
                    Some(now) => {
                        let d_total = now.total.saturating_sub(last_times.total);
                        let d_iowait = now.iowait.saturating_sub(last_times.iowait);
                        last_times = now;
                        if d_total == 0 {
                            0.0
                        } else {
                            (d_iowait as f64 / d_total as f64 * 100.0).clamp(0.0, 100.0)
                        }
                    }
                    None => 0.0,
                }
            }
            #[cfg(not(target_os = "linux"))]
            {
                0.0
            }
        };

        let mut stats = shared.lock().unwrap();
        *stats = SystemStats {
            num_cpus,
            cpu_use,
            io_wait,
            mem_total: sys.total_memory(),
            mem_used: sys.used_memory(),
            num_worker_processes: workers.load(Ordering::Relaxed) as i32,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_percent_recomputed() {
        let stats = SystemStats {
            mem_total: 200,
            mem_used: 50,
            ..Default::default()
        };
        assert_eq!(stats.mem_used_percent(), 25.0);
        assert_eq!(SystemStats::default().mem_used_percent(), 0.0);
    }

    #[test]
    fn sampler_produces_a_snapshot() {
        let sampler = ResourceSampler::start();
        sampler.worker_count().store(3, Ordering::Relaxed);
        std::thread::sleep(SAMPLE_INTERVAL + Duration::from_millis(200));
        let stats = sampler.snapshot();
        assert!(stats.num_cpus > 0);
        assert_eq!(stats.num_worker_processes, 3);
        assert!(stats.cpu_use >= 0.0);
        assert!(stats.cpu_use <= 100.0 * f64::from(stats.num_cpus));
    }
}
