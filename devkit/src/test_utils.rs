/*!
Test Harness pour le kernel MillWatch

Assemble un environnement complet en mémoire :
- Broadcaster avec un sink enregistreur abonné
- MachineManager relié au broadcaster
- Ajout de machines scriptées en une ligne
- Attentes bornées sur l'historique et les événements
*/

use crate::mock_controller::MockController;
use crate::sinks::RecordingSink;
use millwatch_kernel::events::EventBroadcaster;
use millwatch_kernel::manager::MachineManager;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Intervalle de polling des machines du harness
pub const FAST_POLL: Duration = Duration::from_millis(10);

pub struct TestHarness {
    pub broadcaster: Arc<EventBroadcaster>,
    pub manager: Arc<MachineManager>,
    pub events: RecordingSink,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_history(millwatch_kernel::manager::DEFAULT_HISTORY_SIZE)
    }

    pub fn with_history(history_size: usize) -> Self {
        env_logger::try_init().ok(); // Init logging pour tests

        let broadcaster = Arc::new(EventBroadcaster::new());
        let events = RecordingSink::new();
        broadcaster.subscribe(Arc::new(events.clone()), None);

        let manager = Arc::new(
            MachineManager::new(history_size, Duration::from_secs(2)).with_broadcaster(broadcaster.clone()),
        );

        Self { broadcaster, manager, events }
    }

    /// Enregistre une machine scriptée ; panique si le manager la refuse
    pub async fn add_mock(&self, mock: Arc<MockController>) -> Arc<MockController> {
        let outcome = self.manager.add_controller(mock.monitored(FAST_POLL)).await;
        assert!(outcome.is_success(), "add_controller failed: {:?}", outcome.error());
        log::info!("registered mock machine");
        mock
    }

    /// Attend que l'historique d'une machine atteigne `count` entrées
    pub async fn wait_for_history(&self, machine_id: &str, count: usize, timeout_ms: u64) -> bool {
        let manager = self.manager.clone();
        let id = machine_id.to_string();
        wait_until(Duration::from_millis(timeout_ms), move || {
            manager.history(&id, None).result().map_or(false, |h| h.len() >= count)
        })
        .await
    }

    /// Attend le premier événement du type donné
    pub async fn wait_for_event(&self, event_type: &str, timeout_ms: u64) -> Option<Value> {
        let events = self.events.clone();
        let wanted = event_type.to_string();
        let found = wait_until(Duration::from_millis(timeout_ms), move || {
            !events.events_of_type(&wanted).is_empty()
        })
        .await;
        if !found {
            log::warn!("timeout waiting for event {event_type}");
            return None;
        }
        self.events.events_of_type(event_type).into_iter().next()
    }

    /// Assert qu'un champ (chemin pointé, ex. "data.new_state") du premier
    /// événement du type donné vaut `expected`
    pub fn assert_event_field(&self, event_type: &str, field_path: &str, expected: &Value) -> anyhow::Result<()> {
        let Some(event) = self.events.events_of_type(event_type).into_iter().next() else {
            anyhow::bail!("no {event_type} event recorded");
        };
        match get_nested_field(&event, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!("field '{field_path}' mismatch: expected {expected:?}, got {actual:?}"),
            None => anyhow::bail!("field '{field_path}' not found in {event_type} event"),
        }
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-teste `condition` toutes les 5 ms jusqu'au délai
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(obj) => obj.get(part),
        _ => None,
    })
}
