/**
 * MACHINE MANAGER - Flotte de machines CNC surveillées
 *
 * RÔLE :
 * Possède les contrôleurs, leurs boucles de surveillance et l'historique borné
 * des statuts. Expose les requêtes flotte et l'arrêt d'urgence global.
 *
 * FONCTIONNEMENT :
 * - add_controller : connect → enregistrement → callback historique → surveillance
 *   (rien n'est enregistré si la connexion échoue)
 * - Historique par machine en VecDeque borné (FIFO), écrit uniquement par la
 *   boucle de cette machine
 * - Callback : publie machine_state_changed / machine_alarm sur le broadcaster
 * - emergency_stop_all : une tâche par machine, résultats isolés (panique incluse)
 * - shutdown : arrêt + déconnexion de toutes les machines, borné par un timeout,
 *   erreurs avalées
 *
 * Aucun verrou n'est tenu pendant un `.await` : on clone les Arc puis on relâche.
 */

use crate::controllers::{CncCommand, MonitoredController};
use crate::events::EventBroadcaster;
use crate::models::event::{EMERGENCY_STOP, MACHINE_ALARM, MACHINE_STATE_CHANGED};
use crate::models::{ErrorCode, MachineState, MachineStatus, ManufacturingEvent, OperationResult, Priority};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub const DEFAULT_HISTORY_SIZE: usize = 1000;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const COMPONENT: &str = "machine-manager";

type History = Arc<Mutex<VecDeque<MachineStatus>>>;

struct ManagedMachine {
    controller: Arc<MonitoredController>,
    history: History,
}

pub struct MachineManager {
    machines: RwLock<HashMap<String, ManagedMachine>>,
    history_size: usize,
    shutdown_timeout: Duration,
    broadcaster: Option<Arc<EventBroadcaster>>,
}

impl Default for MachineManager {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE, DEFAULT_SHUTDOWN_TIMEOUT)
    }
}

impl MachineManager {
    pub fn new(history_size: usize, shutdown_timeout: Duration) -> Self {
        Self {
            machines: RwLock::new(HashMap::new()),
            history_size: history_size.max(1),
            shutdown_timeout,
            broadcaster: None,
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<EventBroadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn history_size(&self) -> usize {
        self.history_size
    }

    pub fn machine_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.machines.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn machine_count(&self) -> usize {
        self.machines.read().len()
    }

    /// Machines ayant déjà produit au moins un statut
    pub fn reporting_count(&self) -> usize {
        self.machines
            .read()
            .values()
            .filter(|m| !m.history.lock().is_empty())
            .count()
    }

    pub fn controller(&self, machine_id: &str) -> Option<Arc<MonitoredController>> {
        self.machines.read().get(machine_id).map(|m| m.controller.clone())
    }

    pub async fn add_controller(&self, controller: Arc<MonitoredController>) -> OperationResult<bool> {
        let started = Instant::now();
        let machine_id = controller.machine_id().to_string();

        if self.machines.read().contains_key(&machine_id) {
            return OperationResult::failure_since(
                ErrorCode::AlreadyRegistered,
                format!("machine {machine_id} is already registered"),
                started,
            );
        }

        let connected = controller.connect().await;
        if !connected.is_success() {
            warn!(machine_id = %machine_id, error = ?connected.error(), "controller not added: connection failed");
            return connected;
        }

        let history: History = Arc::new(Mutex::new(VecDeque::with_capacity(self.history_size.min(64))));
        // un add concurrent a pu gagner pendant le connect
        let raced = {
            let mut machines = self.machines.write();
            if machines.contains_key(&machine_id) {
                true
            } else {
                machines.insert(
                    machine_id.clone(),
                    ManagedMachine { controller: controller.clone(), history: history.clone() },
                );
                false
            }
        };
        if raced {
            controller.disconnect().await;
            return OperationResult::failure_since(
                ErrorCode::AlreadyRegistered,
                format!("machine {machine_id} is already registered"),
                started,
            );
        }

        controller.add_status_callback(status_recorder(history, self.history_size, self.broadcaster.clone()));

        // une machine enregistrée est toujours surveillée : sinon l'ajout est annulé
        let monitoring = controller.start_monitoring().await;
        if !monitoring.is_success() {
            warn!(machine_id = %machine_id, error = ?monitoring.error(), "controller not added: monitoring not started");
            self.machines.write().remove(&machine_id);
            controller.disconnect().await;
            return monitoring.with_metadata("machine_id", machine_id);
        }

        info!(machine_id = %machine_id, protocol = controller.protocol().as_str(), "controller added");
        OperationResult::success_since(true, started).with_metadata("machine_id", machine_id)
    }

    /// Retire une machine : arrêt de la surveillance puis déconnexion
    pub async fn remove_controller(&self, machine_id: &str) -> OperationResult<bool> {
        let started = Instant::now();
        let Some(machine) = self.machines.write().remove(machine_id) else {
            return unknown_machine(machine_id, started);
        };
        machine.controller.disconnect().await;
        info!(machine_id, "controller removed");
        OperationResult::success_since(true, started)
    }

    /// Dernier statut de chaque machine, celles sans poll réussi sont omises
    pub fn get_all_status(&self) -> OperationResult<BTreeMap<String, MachineStatus>> {
        let started = Instant::now();
        let all: BTreeMap<String, MachineStatus> = self
            .machines
            .read()
            .iter()
            .filter_map(|(id, m)| m.controller.latest_status().map(|s| (id.clone(), s)))
            .collect();
        OperationResult::success_since(all, started)
    }

    pub fn get_status(&self, machine_id: &str) -> OperationResult<MachineStatus> {
        let started = Instant::now();
        let Some(controller) = self.controller(machine_id) else {
            return unknown_machine(machine_id, started);
        };
        match controller.latest_status() {
            Some(status) => OperationResult::success_since(status, started),
            None => OperationResult::failure_since(
                ErrorCode::StatusUnavailable,
                format!("machine {machine_id} has not reported yet"),
                started,
            ),
        }
    }

    /// Les `limit` derniers statuts, du plus ancien au plus récent
    pub fn history(&self, machine_id: &str, limit: Option<usize>) -> OperationResult<Vec<MachineStatus>> {
        let started = Instant::now();
        let history = match self.machines.read().get(machine_id) {
            Some(m) => m.history.clone(),
            None => return unknown_machine(machine_id, started),
        };
        let buf = history.lock();
        let take = limit.unwrap_or(buf.len()).min(buf.len());
        let entries: Vec<MachineStatus> = buf.iter().skip(buf.len() - take).cloned().collect();
        OperationResult::success_since(entries, started)
    }

    pub async fn send_command(
        &self,
        machine_id: &str,
        command: CncCommand,
        parameters: Option<serde_json::Value>,
    ) -> OperationResult<bool> {
        let started = Instant::now();
        let Some(controller) = self.controller(machine_id) else {
            return unknown_machine(machine_id, started);
        };
        controller.send_command(command, parameters).await
    }

    /// Arrêt d'urgence inconditionnel de toute la flotte.
    ///
    /// Chaque machine est arrêtée dans sa propre tâche : une machine qui
    /// échoue (ou panique) n'empêche ni ne contamine le résultat des autres.
    pub async fn emergency_stop_all(&self) -> OperationResult<HashMap<String, bool>> {
        let started = Instant::now();
        let targets: Vec<(String, Arc<MonitoredController>)> = self
            .machines
            .read()
            .iter()
            .map(|(id, m)| (id.clone(), m.controller.clone()))
            .collect();

        warn!(machines = targets.len(), "fleet emergency stop requested");

        let handles: Vec<_> = targets
            .into_iter()
            .map(|(id, controller)| {
                let handle = tokio::spawn(async move { controller.emergency_stop().await.is_success() });
                (id, handle)
            })
            .collect();

        let (ids, handles): (Vec<String>, Vec<_>) = handles.into_iter().unzip();
        let outcomes = join_all(handles).await;

        let mut results = HashMap::with_capacity(ids.len());
        for (id, outcome) in ids.into_iter().zip(outcomes) {
            let stopped = match outcome {
                Ok(stopped) => stopped,
                Err(e) => {
                    error!(safety = true, machine_id = %id, error = %e, "emergency stop task crashed");
                    false
                }
            };
            if !stopped {
                error!(safety = true, machine_id = %id, "emergency stop not confirmed");
            }
            results.insert(id, stopped);
        }

        let failed = results.values().filter(|ok| !**ok).count();
        if let Some(bus) = &self.broadcaster {
            let per_machine = serde_json::to_value(&results).unwrap_or_default();
            bus.broadcast(
                &ManufacturingEvent::new(EMERGENCY_STOP, COMPONENT, Priority::Emergency)
                    .with_data("results", per_machine)
                    .with_data("failed", failed),
            );
        }

        OperationResult::success_since(results, started).with_metadata("failed", failed)
    }

    /// Arrête toutes les boucles et déconnecte tout, dans la limite du timeout
    pub async fn shutdown(&self) -> OperationResult<bool> {
        let started = Instant::now();
        let controllers: Vec<Arc<MonitoredController>> =
            self.machines.write().drain().map(|(_, m)| m.controller).collect();
        let count = controllers.len();

        let all = join_all(controllers.iter().map(|c| c.disconnect()));
        let timed_out = tokio::time::timeout(self.shutdown_timeout, all).await.is_err();
        if timed_out {
            warn!(
                machines = count,
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "shutdown timed out, abandoning remaining controllers"
            );
        } else {
            info!(machines = count, "machine manager shut down");
        }

        OperationResult::success_since(true, started)
            .with_metadata("machines", count)
            .with_metadata("timed_out", timed_out)
    }
}

fn unknown_machine<T>(machine_id: &str, started: Instant) -> OperationResult<T> {
    OperationResult::failure_since(ErrorCode::UnknownMachine, format!("unknown machine {machine_id}"), started)
}

fn state_priority(state: MachineState) -> Priority {
    match state {
        MachineState::EmergencyStop => Priority::Emergency,
        MachineState::Fault => Priority::Critical,
        _ => Priority::Normal,
    }
}

/// Callback historique + événements pour une machine
fn status_recorder(
    history: History,
    capacity: usize,
    broadcaster: Option<Arc<EventBroadcaster>>,
) -> crate::controllers::StatusCallback {
    Arc::new(move |status: &MachineStatus| {
        let previous = {
            let mut buf = history.lock();
            let previous = buf.back().cloned();
            buf.push_back(status.clone());
            while buf.len() > capacity {
                buf.pop_front();
            }
            previous
        };

        let Some(bus) = &broadcaster else { return };

        let old_state = previous.as_ref().map(|p| p.state());
        if old_state != Some(status.state()) {
            bus.broadcast(
                &ManufacturingEvent::new(MACHINE_STATE_CHANGED, COMPONENT, state_priority(status.state()))
                    .with_data("machine_id", status.machine_id())
                    .with_data("old_state", old_state.map(|s| s.name()))
                    .with_data("new_state", status.state().name()),
            );
        }

        let raised = status.new_alarms_since(previous.as_ref());
        if !raised.is_empty() {
            bus.broadcast(
                &ManufacturingEvent::new(MACHINE_ALARM, COMPONENT, Priority::High)
                    .with_data("machine_id", status.machine_id())
                    .with_data("alarms", raised),
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelSink;

    #[test]
    fn test_history_is_bounded_fifo() {
        let history: History = Arc::new(Mutex::new(VecDeque::new()));
        let record = status_recorder(history.clone(), 3, None);

        for line in 1..=4u64 {
            let status = MachineStatus::builder("cnc-01", MachineState::Active)
                .program("O1", Some(line))
                .build();
            record(&status);
        }

        let lines: Vec<Option<u64>> = history.lock().iter().map(|s| s.line_number()).collect();
        assert_eq!(lines, vec![Some(2), Some(3), Some(4)]);
    }

    #[test]
    fn test_recorder_publishes_state_changes_and_new_alarms() {
        let bus = Arc::new(EventBroadcaster::new());
        let (sink, mut rx) = ChannelSink::pair();
        bus.subscribe(Arc::new(sink), None);
        let history: History = Arc::new(Mutex::new(VecDeque::new()));
        let record = status_recorder(history, 10, Some(bus));

        record(&MachineStatus::builder("cnc-01", MachineState::Ready).build());
        record(&MachineStatus::builder("cnc-01", MachineState::Ready).build());
        record(&MachineStatus::builder("cnc-01", MachineState::Fault).alarm("SERVO_FAULT").build());

        let events: Vec<serde_json::Value> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| serde_json::from_str(&m).unwrap())
            .collect();
        let kinds: Vec<&str> = events.iter().map(|e| e["data"]["event_type"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["machine_state_changed", "machine_state_changed", "machine_alarm"]);
        assert_eq!(events[1]["data"]["priority"], "CRITICAL");
        assert_eq!(events[1]["data"]["data"]["old_state"], "READY");
        assert_eq!(events[2]["data"]["data"]["alarms"][0], "SERVO_FAULT");
    }

    #[test]
    fn test_unknown_machine_queries() {
        let manager = MachineManager::default();
        assert_eq!(manager.get_status("ghost").error_code(), Some(ErrorCode::UnknownMachine));
        assert_eq!(manager.history("ghost", None).error_code(), Some(ErrorCode::UnknownMachine));
        assert!(manager.get_all_status().result().unwrap().is_empty());
    }
}
