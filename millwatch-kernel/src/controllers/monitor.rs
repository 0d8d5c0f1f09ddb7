/**
 * MONITORED CONTROLLER - Cycle de vie et boucle de polling d'une machine
 *
 * RÔLE :
 * Enveloppe un `MachineController` et possède tout ce qui est commun aux
 * protocoles : machine à états, tâche de surveillance, callbacks, dernier statut.
 *
 * FONCTIONNEMENT :
 * - UNINITIALIZED → READY (connect) → MONITORING (start_monitoring) → UNINITIALIZED (disconnect)
 * - EMERGENCY_STOP = verrou posé depuis n'importe quel état, levé seulement par connect()
 * - Échec de start_program = escalade sécurité : verrou + commande EMERGENCY_STOP envoyée à la machine
 * - Une tâche tokio par machine, arrêt signalé via un canal watch observé
 *   pendant l'attente ET pendant la requête en cours
 * - Ticks manqués sautés, jamais deux get_status simultanés pour une machine
 * - Callbacks invoqués dans l'ordre d'enregistrement, hors de tout verrou
 */

use super::{CncCommand, MachineController, ProgramInfo, ProtocolType};
use crate::models::{ErrorCode, MachineStatus, OperationResult};
use crate::safety::{self, SafetyLatch};
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub type StatusCallback = Arc<dyn Fn(&MachineStatus) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerState {
    Uninitialized,
    Ready,
    Monitoring,
    EmergencyStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Ready,
    Monitoring,
}

struct LifecycleState {
    lifecycle: Lifecycle,
    estop_latched: bool,
}

struct MonitorTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Ce que la tâche de surveillance partage avec son propriétaire
struct PollShared {
    inner: Arc<dyn MachineController>,
    latest: Mutex<Option<MachineStatus>>,
    callbacks: Mutex<Vec<StatusCallback>>,
}

pub struct MonitoredController {
    machine_id: String,
    poll_interval: Duration,
    shared: Arc<PollShared>,
    state: Mutex<LifecycleState>,
    task: Mutex<Option<MonitorTask>>,
    span: tracing::Span,
}

impl MonitoredController {
    pub fn new(inner: Arc<dyn MachineController>) -> Self {
        Self::with_interval(inner, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_interval(inner: Arc<dyn MachineController>, poll_interval: Duration) -> Self {
        let machine_id = inner.machine_id().to_string();
        let span = tracing::info_span!(
            "controller",
            machine_id = %machine_id,
            protocol = inner.protocol().as_str()
        );

        Self {
            machine_id,
            poll_interval,
            shared: Arc::new(PollShared {
                inner,
                latest: Mutex::new(None),
                callbacks: Mutex::new(Vec::new()),
            }),
            state: Mutex::new(LifecycleState {
                lifecycle: Lifecycle::Uninitialized,
                estop_latched: false,
            }),
            task: Mutex::new(None),
            span,
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn protocol(&self) -> ProtocolType {
        self.shared.inner.protocol()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn state(&self) -> ControllerState {
        let st = self.state.lock();
        if st.estop_latched {
            return ControllerState::EmergencyStop;
        }
        match st.lifecycle {
            Lifecycle::Uninitialized => ControllerState::Uninitialized,
            Lifecycle::Ready => ControllerState::Ready,
            Lifecycle::Monitoring => ControllerState::Monitoring,
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map_or(false, |t| !t.handle.is_finished())
    }

    /// Dernier statut obtenu par la boucle, `None` tant qu'aucun poll n'a réussi
    pub fn latest_status(&self) -> Option<MachineStatus> {
        self.shared.latest.lock().clone()
    }

    pub fn add_status_callback(&self, callback: StatusCallback) {
        self.shared.callbacks.lock().push(callback);
    }

    /// Connecte la machine. Lève aussi le verrou d'arrêt d'urgence.
    pub async fn connect(&self) -> OperationResult<bool> {
        let started = Instant::now();
        let was_latched = {
            let st = self.state.lock();
            if !st.estop_latched && st.lifecycle != Lifecycle::Uninitialized {
                return OperationResult::success_since(true, started);
            }
            st.estop_latched
        };

        if let Err(e) = self.shared.inner.connect().await {
            warn!(machine_id = %self.machine_id, error = %e, "connection failed");
            return OperationResult::failure_since(e.code(), e.to_string(), started);
        }

        let monitoring = self.is_monitoring();
        let mut st = self.state.lock();
        st.estop_latched = false;
        st.lifecycle = if monitoring { Lifecycle::Monitoring } else { Lifecycle::Ready };
        drop(st);

        if was_latched {
            info!(machine_id = %self.machine_id, "emergency stop latch cleared by reconnect");
        } else {
            info!(machine_id = %self.machine_id, "controller connected");
        }
        OperationResult::success_since(true, started)
    }

    /// Best effort et idempotent : arrête la surveillance puis coupe la session
    pub async fn disconnect(&self) -> OperationResult<bool> {
        let started = Instant::now();
        self.stop_monitoring().await;
        self.shared.inner.disconnect().await;
        self.state.lock().lifecycle = Lifecycle::Uninitialized;
        debug!(machine_id = %self.machine_id, "controller disconnected");
        OperationResult::success_since(true, started)
    }

    pub async fn start_monitoring(&self) -> OperationResult<bool> {
        let started = Instant::now();
        {
            let st = self.state.lock();
            if st.estop_latched {
                return OperationResult::failure_since(
                    ErrorCode::InvalidState,
                    "controller is latched in emergency stop, reconnect first",
                    started,
                );
            }
            if st.lifecycle == Lifecycle::Uninitialized {
                return OperationResult::failure_since(ErrorCode::NotConnected, "controller not connected", started);
            }
        }

        let mut slot = self.task.lock();
        if slot.as_ref().map_or(false, |t| !t.handle.is_finished()) {
            return OperationResult::failure_since(ErrorCode::AlreadyMonitoring, "monitoring already active", started);
        }

        let (tx, rx) = watch::channel(false);
        let shared = self.shared.clone();
        let handle = tokio::spawn(
            poll_loop(shared, self.machine_id.clone(), self.poll_interval, rx).instrument(self.span.clone()),
        );
        *slot = Some(MonitorTask { shutdown: tx, handle });
        drop(slot);

        self.state.lock().lifecycle = Lifecycle::Monitoring;
        info!(machine_id = %self.machine_id, interval_ms = self.poll_interval.as_millis() as u64, "monitoring started");
        OperationResult::success_since(true, started)
    }

    /// Signale l'arrêt et attend la fin de la tâche. Sans effet si rien ne tourne.
    pub async fn stop_monitoring(&self) {
        let task = self.task.lock().take();
        let Some(task) = task else { return };

        let _ = task.shutdown.send(true);
        if let Err(e) = task.handle.await {
            if e.is_panic() {
                error!(machine_id = %self.machine_id, "monitoring task panicked");
            }
        }

        let mut st = self.state.lock();
        if st.lifecycle == Lifecycle::Monitoring {
            st.lifecycle = Lifecycle::Ready;
        }
        drop(st);
        info!(machine_id = %self.machine_id, "monitoring stopped");
    }

    pub async fn send_command(&self, command: CncCommand, parameters: Option<serde_json::Value>) -> OperationResult<bool> {
        match command {
            CncCommand::EmergencyStop => return self.emergency_stop().await,
            CncCommand::StartProgram => return self.start_program(parameters).await,
            _ => {}
        }

        let started = Instant::now();
        if let Some(refusal) = self.refuse_command(command, started) {
            return refusal;
        }

        match self.shared.inner.send_command(command, parameters).await {
            Ok(accepted) => OperationResult::success_since(accepted, started).with_metadata("command", command.as_str()),
            Err(e) => {
                warn!(machine_id = %self.machine_id, command = command.as_str(), error = %e, "command failed");
                OperationResult::failure_since(e.code(), e.to_string(), started)
                    .with_metadata("command", command.as_str())
            }
        }
    }

    pub async fn load_program(&self, program: &ProgramInfo) -> OperationResult<bool> {
        let params = serde_json::json!({ "program": program });
        self.send_command(CncCommand::LoadProgram, Some(params)).await
    }

    pub async fn start_program(&self, parameters: Option<serde_json::Value>) -> OperationResult<bool> {
        let started = Instant::now();
        if let Some(refusal) = self.refuse_command(CncCommand::StartProgram, started) {
            return refusal;
        }
        let inner = self.shared.inner.clone();
        let result = safety::guard(self, "start_program", async move {
            inner.send_command(CncCommand::StartProgram, parameters).await
        })
        .await;
        if result.error_code() == Some(ErrorCode::SafetyError) {
            self.dispatch_emergency_stop().await;
        }
        result
    }

    /// Arrêt d'urgence physique après une escalade sécurité. Le verrou est déjà posé.
    async fn dispatch_emergency_stop(&self) {
        match self.shared.inner.send_command(CncCommand::EmergencyStop, None).await {
            Ok(true) => warn!(machine_id = %self.machine_id, "emergency stop dispatched after safety failure"),
            Ok(false) => error!(
                safety = true,
                machine_id = %self.machine_id,
                "emergency stop rejected by controller after safety failure"
            ),
            Err(e) => error!(
                safety = true,
                machine_id = %self.machine_id,
                error = %e,
                "emergency stop could not be dispatched after safety failure"
            ),
        }
    }

    /// Arrêt d'urgence : la commande part vers la machine et le verrou logiciel
    /// est posé quelle que soit l'issue.
    pub async fn emergency_stop(&self) -> OperationResult<bool> {
        let inner = self.shared.inner.clone();
        let result = safety::guard(self, "emergency_stop", async move {
            inner.send_command(CncCommand::EmergencyStop, None).await
        })
        .await;
        self.latch_emergency_stop("emergency stop requested");
        result
    }

    fn refuse_command(&self, command: CncCommand, started: Instant) -> Option<OperationResult<bool>> {
        let st = self.state.lock();
        if st.estop_latched {
            return Some(
                OperationResult::failure_since(
                    ErrorCode::InvalidState,
                    format!("{command} refused: controller latched in emergency stop"),
                    started,
                )
                .with_metadata("command", command.as_str()),
            );
        }
        if st.lifecycle == Lifecycle::Uninitialized {
            return Some(
                OperationResult::failure_since(ErrorCode::NotConnected, "controller not connected", started)
                    .with_metadata("command", command.as_str()),
            );
        }
        None
    }
}

impl SafetyLatch for MonitoredController {
    fn component_id(&self) -> &str {
        &self.machine_id
    }

    fn latch_emergency_stop(&self, reason: &str) {
        let mut st = self.state.lock();
        if !st.estop_latched {
            st.estop_latched = true;
            drop(st);
            warn!(machine_id = %self.machine_id, reason, "emergency stop latched");
        }
    }
}

impl Drop for MonitoredController {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            let _ = task.shutdown.send(true);
            task.handle.abort();
        }
    }
}

async fn poll_loop(
    shared: Arc<PollShared>,
    machine_id: String,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let polled = tokio::select! {
            _ = shutdown.changed() => break,
            polled = shared.inner.get_status() => polled,
        };

        match polled {
            Ok(status) => publish(&shared, &machine_id, status),
            Err(e) => warn!(machine_id = %machine_id, error = %e, "status poll failed"),
        }
    }
    debug!(machine_id = %machine_id, "poll loop exited");
}

fn publish(shared: &PollShared, machine_id: &str, status: MachineStatus) {
    {
        let mut latest = shared.latest.lock();
        let previous = latest.as_ref();

        if let Some(prev) = previous {
            if prev.state() != status.state() {
                info!(
                    machine_id,
                    old_state = prev.state().name(),
                    new_state = status.state().name(),
                    "machine state changed"
                );
            }
        }
        let raised = status.new_alarms_since(previous);
        if !raised.is_empty() {
            warn!(machine_id, alarms = ?raised, "machine alarms raised");
        }

        *latest = Some(status.clone());
    }

    let callbacks: Vec<StatusCallback> = shared.callbacks.lock().clone();
    for cb in callbacks {
        if catch_unwind(AssertUnwindSafe(|| cb(&status))).is_err() {
            error!(machine_id, "status callback panicked");
        }
    }
}
