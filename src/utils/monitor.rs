#[cfg(feature = "cli")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "cli")]
use std::sync::Mutex;
#[cfg(feature = "cli")]
use std::time::{Duration, Instant};
#[cfg(feature = "cli")]
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, Pid, ProcessesToUpdate, RefreshKind, System};

/// 可用記憶體低於此值時提醒，DSI Studio 追蹤大量 tracks 時很吃記憶體
#[cfg(feature = "cli")]
const LOW_MEMORY_MB: u64 = 1024;

#[cfg(feature = "cli")]
#[derive(Debug, Clone)]
pub struct SystemStats {
    pub cpu_usage: f32,
    pub memory_used_mb: u64,
    pub memory_available_mb: u64,
    /// 本程序啟動的子程序（DSI Studio）合計
    pub child_memory_mb: u64,
    pub peak_child_memory_mb: u64,
    pub elapsed_time: Duration,
}

#[cfg(feature = "cli")]
pub struct SystemMonitor {
    system: Mutex<System>,
    own_pid: Option<Pid>,
    started: Instant,
    peak_child_mb: AtomicU64,
    enabled: bool,
}

#[cfg(feature = "cli")]
impl SystemMonitor {
    pub fn new(enabled: bool) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );

        Self {
            system: Mutex::new(system),
            own_pid: sysinfo::get_current_pid().ok(),
            started: Instant::now(),
            peak_child_mb: AtomicU64::new(0),
            enabled,
        }
    }

    pub fn get_stats(&self) -> Option<SystemStats> {
        if !self.enabled {
            return None;
        }

        let mut system = self.system.lock().ok()?;
        system.refresh_cpu_usage();
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let child_bytes: u64 = match self.own_pid {
            Some(own) => system
                .processes()
                .values()
                .filter(|process| process.parent() == Some(own))
                .map(|process| process.memory())
                .sum(),
            None => 0,
        };
        let child_memory_mb = child_bytes / 1024 / 1024;
        let peak = self
            .peak_child_mb
            .fetch_max(child_memory_mb, Ordering::Relaxed)
            .max(child_memory_mb);

        Some(SystemStats {
            cpu_usage: system.global_cpu_usage(),
            memory_used_mb: system.used_memory() / 1024 / 1024,
            memory_available_mb: system.available_memory() / 1024 / 1024,
            child_memory_mb,
            peak_child_memory_mb: peak,
            elapsed_time: self.started.elapsed(),
        })
    }

    pub fn log_stats(&self, phase: &str) {
        let Some(stats) = self.get_stats() else {
            return;
        };

        tracing::info!(
            "📊 {} - CPU: {:.1}%, RAM used: {}MB, available: {}MB, DSI Studio: {}MB, Time: {:.0?}",
            phase,
            stats.cpu_usage,
            stats.memory_used_mb,
            stats.memory_available_mb,
            stats.child_memory_mb,
            stats.elapsed_time
        );
        if stats.memory_available_mb < LOW_MEMORY_MB {
            tracing::warn!(
                "⚠️  Only {}MB of memory available; consider fewer tracks or threads",
                stats.memory_available_mb
            );
        }
    }

    pub fn log_final_stats(&self) {
        if let Some(stats) = self.get_stats() {
            tracing::info!(
                "📊 Final Stats - Total Time: {:.0?}, Peak DSI Studio memory: {}MB",
                stats.elapsed_time,
                stats.peak_child_memory_mb
            );
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 邏輯 CPU 數量，用來檢查 thread_count 是否超出機器能力
    pub fn cpu_count(&self) -> Option<usize> {
        let count = self.system.lock().ok()?.cpus().len();
        (count > 0).then_some(count)
    }
}

#[cfg(feature = "cli")]
impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

// 沒有 sysinfo 時只保留 CPU 數量
#[cfg(not(feature = "cli"))]
#[derive(Default)]
pub struct SystemMonitor;

#[cfg(not(feature = "cli"))]
impl SystemMonitor {
    pub fn new(_enabled: bool) -> Self {
        Self
    }

    pub fn log_stats(&self, _phase: &str) {}

    pub fn log_final_stats(&self) {}

    pub fn is_enabled(&self) -> bool {
        false
    }

    pub fn cpu_count(&self) -> Option<usize> {
        std::thread::available_parallelism().ok().map(|n| n.get())
    }
}

#[cfg(all(test, feature = "cli"))]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_monitor_reports_nothing() {
        let monitor = SystemMonitor::new(false);
        assert!(!monitor.is_enabled());
        assert!(monitor.get_stats().is_none());
    }

    #[test]
    fn test_enabled_monitor_tracks_peak_child_memory() {
        let monitor = SystemMonitor::new(true);
        let first = monitor.get_stats().unwrap();
        let second = monitor.get_stats().unwrap();
        assert!(second.peak_child_memory_mb >= first.child_memory_mb);
        assert!(second.elapsed_time >= first.elapsed_time);
    }

    #[test]
    fn test_cpu_count_is_positive() {
        if let Some(count) = SystemMonitor::default().cpu_count() {
            assert!(count > 0);
        }
    }
}
