use crate::events::EventBroadcaster;
use crate::manager::MachineManager;
use crate::vision::QualityInspector;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub machines_tracked: usize,
    pub machines_reporting: usize,
    pub subscribers: usize,
    pub inspections_run: u64,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("disabled".to_string())),
        }
    }

    pub fn mark_mqtt_connecting(&self) {
        *self.mqtt_status.lock() = "connecting".to_string();
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disabled(&self) {
        *self.mqtt_status.lock() = "disabled".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn get_health(
        &self,
        manager: &MachineManager,
        broadcaster: &EventBroadcaster,
        inspector: &QualityInspector,
    ) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            machines_tracked: manager.machine_count(),
            machines_reporting: manager.reporting_count(),
            subscribers: broadcaster.subscriber_count(),
            inspections_run: inspector.inspections_run(),
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }
}

/// RSS du process (Linux), 0 ailleurs
fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_snapshot() {
        let tracker = HealthTracker::new();
        let manager = MachineManager::default();
        let broadcaster = EventBroadcaster::new();
        let inspector = QualityInspector::default();

        let health = tracker.get_health(&manager, &broadcaster, &inspector);
        assert_eq!(health.machines_tracked, 0);
        assert_eq!(health.subscribers, 0);
        assert_eq!(health.inspections_run, 0);
        assert_eq!(health.mqtt_status, "disabled");
        assert!(health.memory_usage_mb >= 0.0);
    }

    #[test]
    fn test_mqtt_status_transitions() {
        let tracker = HealthTracker::new();
        tracker.mark_mqtt_connecting();
        tracker.increment_reconnects();
        let clone = tracker.clone();
        clone.mark_mqtt_connected();

        let health = tracker.get_health(&MachineManager::default(), &EventBroadcaster::new(), &QualityInspector::default());
        assert_eq!(health.mqtt_status, "connected");
        assert_eq!(health.mqtt_reconnects, 1);
    }
}
