/*!
Contrôleur machine scripté

Implémente `MachineController` sans aucun équipement : les statuts retournés
sont mis en file par le test, le dernier reste collant, les commandes reçues
sont enregistrées et leur résultat est programmable.
*/

use async_trait::async_trait;
use millwatch_kernel::controllers::{CncCommand, MachineController, MonitoredController, ProtocolType};
use millwatch_kernel::error::ControllerError;
use millwatch_kernel::models::{MachineState, MachineStatus};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct MockController {
    machine_id: String,
    statuses: Mutex<VecDeque<Result<MachineStatus, ControllerError>>>,
    connect_error: Mutex<Option<ControllerError>>,
    command_results: Mutex<HashMap<CncCommand, Result<bool, ControllerError>>>,
    commands: Mutex<Vec<(CncCommand, Option<Value>)>>,
    connected: AtomicBool,
    polls: AtomicUsize,
}

impl MockController {
    pub fn new(machine_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            statuses: Mutex::new(VecDeque::new()),
            connect_error: Mutex::new(None),
            command_results: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            polls: AtomicUsize::new(0),
        }
    }

    /// Statut minimal dans l'état donné
    pub fn status(&self, state: MachineState) -> MachineStatus {
        MachineStatus::builder(self.machine_id.clone(), state).build()
    }

    pub fn push_status(&self, status: MachineStatus) -> &Self {
        self.statuses.lock().unwrap().push_back(Ok(status));
        self
    }

    pub fn push_state(&self, state: MachineState) -> &Self {
        self.push_status(self.status(state))
    }

    pub fn push_error(&self, error: ControllerError) -> &Self {
        self.statuses.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn fail_connect(&self, error: ControllerError) {
        *self.connect_error.lock().unwrap() = Some(error);
    }

    pub fn set_command_result(&self, command: CncCommand, result: Result<bool, ControllerError>) {
        self.command_results.lock().unwrap().insert(command, result);
    }

    pub fn commands(&self) -> Vec<(CncCommand, Option<Value>)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Enveloppe dans un MonitoredController avec l'intervalle donné
    pub fn monitored(self: &Arc<Self>, interval: Duration) -> Arc<MonitoredController> {
        Arc::new(MonitoredController::with_interval(self.clone(), interval))
    }
}

#[async_trait]
impl MachineController for MockController {
    fn machine_id(&self) -> &str {
        &self.machine_id
    }

    fn protocol(&self) -> ProtocolType {
        ProtocolType::Custom
    }

    async fn connect(&self) -> Result<(), ControllerError> {
        if let Some(err) = self.connect_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.connected.store(true, Ordering::SeqCst);
        log::debug!("[MOCK] {} connected", self.machine_id);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        log::debug!("[MOCK] {} disconnected", self.machine_id);
    }

    async fn get_status(&self) -> Result<MachineStatus, ControllerError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.statuses.lock().unwrap();
        match queue.len() {
            0 => Err(ControllerError::StatusUnavailable("no scripted status".into())),
            1 => queue[0].clone(),
            _ => queue.pop_front().unwrap_or_else(|| Err(ControllerError::StatusUnavailable("empty".into()))),
        }
    }

    async fn send_command(&self, command: CncCommand, parameters: Option<Value>) -> Result<bool, ControllerError> {
        self.commands.lock().unwrap().push((command, parameters));
        log::info!("[MOCK] {} received {}", self.machine_id, command);
        self.command_results
            .lock()
            .unwrap()
            .get(&command)
            .cloned()
            .unwrap_or(Ok(true))
    }
}
