use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value as JsonValue;
use serde_json::json;
use sysinfo::Disks;
use sysinfo::System;
use time::OffsetDateTime;
use time::macros::format_description;

const LOG_CAPACITY: usize = 100;

/// System stats plus the worker's log ring buffer, pushed to the host every
/// telemetry tick and available on demand via `get_system_stats`.
pub struct Monitor {
    system: Mutex<System>,
    logs: Mutex<VecDeque<String>>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    pub fn new() -> Self {
        let monitor = Self {
            system: Mutex::new(System::new_all()),
            logs: Mutex::new(VecDeque::with_capacity(LOG_CAPACITY)),
        };
        monitor.add_log("INFO: nimbus worker started");
        monitor
    }

    /// Appends a timestamped line to the ring buffer. Spinner noise and
    /// consecutive duplicates are dropped.
    pub fn add_log(&self, message: &str) {
        if ["verifying sha256", "pulling manifest"]
            .iter()
            .any(|skip| message.contains(skip))
        {
            return;
        }
        let timestamp = OffsetDateTime::now_utc()
            .format(format_description!("[hour]:[minute]:[second]"))
            .unwrap_or_default();
        let entry = format!("[{timestamp}] {message}");

        let mut logs = self.lock_logs();
        if logs.back().is_some_and(|last| *last == entry) {
            return;
        }
        if logs.len() == LOG_CAPACITY {
            logs.pop_front();
        }
        logs.push_back(entry);
    }

    pub fn logs(&self) -> Vec<String> {
        self.lock_logs().iter().cloned().collect()
    }

    /// CPU, RAM, disk and GPU usage plus the log tail, in the shape the
    /// host's console expects.
    pub fn snapshot(&self) -> JsonValue {
        let (cpu_usage, ram_percent, cores, threads) = {
            let mut system = match self.system.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            system.refresh_cpu_usage();
            system.refresh_memory();
            let threads = system.cpus().len();
            let ram_percent = if system.total_memory() > 0 {
                (system.used_memory() as f64 / system.total_memory() as f64) * 100.0
            } else {
                0.0
            };
            (
                system.global_cpu_usage(),
                ram_percent,
                System::physical_core_count().unwrap_or(threads),
                threads,
            )
        };

        let disk_percent = Disks::new_with_refreshed_list()
            .iter()
            .filter(|disk| disk.total_space() > 0)
            .map(|disk| {
                let used = disk.total_space() - disk.available_space();
                (used as f64 / disk.total_space() as f64) * 100.0
            })
            .fold(0.0f64, f64::max);

        // GPU telemetry collection is an external collaborator; report the
        // integrated placeholder the host renders for machines without one.
        let gpu = json!({
            "available": false,
            "name": "Generic / Integrated",
            "usage_percent": 0,
            "vram_used": 0,
            "vram_total": 0,
        });

        json!({
            "cpu": {"usage_percent": round1(cpu_usage as f64)},
            "ram": {"usage_percent": round1(ram_percent)},
            "disk": {"usage_percent": round1(disk_percent)},
            "gpu": gpu,
            "vramUsed": 0,
            "vramTotal": 0,
            "cores": cores,
            "threads": threads,
            "logs": self.logs(),
        })
    }

    fn lock_logs(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        match self.logs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn snapshot_has_the_expected_shape() {
        let monitor = Monitor::new();
        let snapshot = monitor.snapshot();
        assert!(snapshot["cpu"]["usage_percent"].is_number());
        assert!(snapshot["ram"]["usage_percent"].is_number());
        assert!(snapshot["disk"]["usage_percent"].is_number());
        assert_eq!(snapshot["gpu"]["available"], false);
        assert!(snapshot["threads"].as_u64().unwrap() >= 1);
        assert!(snapshot["logs"].as_array().unwrap().len() >= 1);
    }

    #[test]
    fn ring_buffer_caps_at_one_hundred() {
        let monitor = Monitor::new();
        for i in 0..150 {
            monitor.add_log(&format!("line {i}"));
        }
        let logs = monitor.logs();
        assert_eq!(logs.len(), LOG_CAPACITY);
        assert!(logs.last().unwrap().contains("line 149"));
    }

    #[test]
    fn duplicate_and_spinner_lines_are_dropped() {
        let monitor = Monitor::new();
        let before = monitor.logs().len();
        monitor.add_log("OLLAMA: pulling manifest");
        monitor.add_log("same line");
        monitor.add_log("same line");
        assert_eq!(monitor.logs().len(), before + 1);
    }
}
