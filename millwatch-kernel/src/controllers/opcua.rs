/**
 * OPC-UA - Contrôleur lecture/écriture piloté par table de nœuds
 *
 * RÔLE :
 * Lit l'état machine dans des nœuds nommés et traduit les commandes CNC en
 * écritures de nœuds, le tout décrit par configuration (aucun node id en dur).
 *
 * FONCTIONNEMENT :
 * - Le transport OPC-UA est derrière le trait `NodeSession`
 * - `SimulatedNodeSession` = espace d'adresses en mémoire (endpoints sim://, tests)
 * - Statut : lecture de chaque nœud configuré, erreur de lecture = StatusUnavailable,
 *   valeur de type inattendu = champ ignoré (exécution → UNAVAILABLE)
 * - Commandes : table commande → {node_id, value | parameter}, absente = NotSupported
 */

use super::{CncCommand, MachineController, ProtocolType};
use crate::error::{ConfigError, ControllerError};
use crate::models::{MachineState, MachineStatus, SpindleDirection};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Valeur scalaire d'un nœud
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl NodeValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NodeValue::Int(i) => Some(*i as f64),
            NodeValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            NodeValue::Bool(b) => Some(*b),
            NodeValue::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            NodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Conversion depuis un paramètre JSON de commande
    pub fn from_json(value: &serde_json::Value) -> Option<NodeValue> {
        match value {
            serde_json::Value::Bool(b) => Some(NodeValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(NodeValue::Int)
                .or_else(|| n.as_f64().map(NodeValue::Double)),
            serde_json::Value::String(s) => Some(NodeValue::String(s.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpcUaCredentials {
    pub username: String,
    pub password: String,
}

/// Transport OPC-UA minimal utilisé par le contrôleur
#[async_trait]
pub trait NodeSession: Send + Sync {
    async fn open(&self, endpoint: &str, credentials: Option<&OpcUaCredentials>) -> Result<(), ControllerError>;

    async fn read(&self, node_id: &str) -> Result<NodeValue, ControllerError>;

    async fn write(&self, node_id: &str, value: NodeValue) -> Result<(), ControllerError>;

    async fn close(&self);
}

/// Nœuds lus à chaque poll (tous optionnels)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpcUaNodeMap {
    #[serde(default)]
    pub execution: Option<String>,
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub line: Option<String>,
    #[serde(default)]
    pub feedrate: Option<String>,
    #[serde(default)]
    pub spindle_speed: Option<String>,
    #[serde(default)]
    pub spindle_load: Option<String>,
    #[serde(default)]
    pub emergency_stop: Option<String>,
    #[serde(default)]
    pub door_open: Option<String>,
    #[serde(default)]
    pub coolant_on: Option<String>,
    /// Texte d'alarmes séparées par ';'
    #[serde(default)]
    pub alarms: Option<String>,
    /// nom d'axe → node id
    #[serde(default)]
    pub axes: BTreeMap<String, String>,
}

/// Écriture associée à une commande : valeur fixe ou paramètre de l'appelant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandBinding {
    pub node_id: String,
    #[serde(default)]
    pub value: Option<NodeValue>,
    #[serde(default)]
    pub parameter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpcUaConfig {
    pub machine_id: String,
    pub endpoint_url: String,
    #[serde(default)]
    pub credentials: Option<OpcUaCredentials>,
    #[serde(default)]
    pub nodes: OpcUaNodeMap,
    #[serde(default)]
    pub commands: HashMap<CncCommand, CommandBinding>,
    #[serde(default = "default_axis_unit")]
    pub axis_unit: String,
}

fn default_axis_unit() -> String {
    "mm".into()
}

pub struct OpcUaController {
    config: OpcUaConfig,
    session: Arc<dyn NodeSession>,
    connected: AtomicBool,
}

impl OpcUaController {
    pub fn new(config: OpcUaConfig, session: Arc<dyn NodeSession>) -> Result<Self, ConfigError> {
        if config.endpoint_url.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "machine {}: opcua endpoint_url is empty",
                config.machine_id
            )));
        }
        for (command, binding) in &config.commands {
            if binding.value.is_none() && binding.parameter.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "machine {}: command {command} needs either a value or a parameter",
                    config.machine_id
                )));
            }
        }

        Ok(Self {
            config,
            session,
            connected: AtomicBool::new(false),
        })
    }

    async fn read_optional(&self, node: &Option<String>) -> Result<Option<NodeValue>, ControllerError> {
        match node {
            Some(id) => self
                .session
                .read(id)
                .await
                .map(Some)
                .map_err(|e| ControllerError::StatusUnavailable(format!("read {id}: {e}"))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl MachineController for OpcUaController {
    fn machine_id(&self) -> &str {
        &self.config.machine_id
    }

    fn protocol(&self) -> ProtocolType {
        ProtocolType::Opcua
    }

    async fn connect(&self) -> Result<(), ControllerError> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        self.session
            .open(&self.config.endpoint_url, self.config.credentials.as_ref())
            .await
            .map_err(|e| match e {
                ControllerError::ConnectionFailed(_) => e,
                other => ControllerError::ConnectionFailed(other.to_string()),
            })?;
        self.connected.store(true, Ordering::Release);
        info!(machine_id = %self.config.machine_id, endpoint = %self.config.endpoint_url, "opc-ua session opened");
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.session.close().await;
        }
    }

    async fn get_status(&self) -> Result<MachineStatus, ControllerError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(ControllerError::NotConnected);
        }
        let nodes = &self.config.nodes;
        let mut status = MachineStatus::builder(self.config.machine_id.clone(), MachineState::Ready);

        if let Some(v) = self.read_optional(&nodes.execution).await? {
            let state = v.as_text().and_then(MachineState::from_name).unwrap_or(MachineState::Unavailable);
            status.set_state(state);
        }
        if let Some(v) = self.read_optional(&nodes.program).await? {
            if let Some(p) = v.as_text().filter(|p| !p.is_empty()) {
                status.set_program_name(p);
            }
        }
        if let Some(v) = self.read_optional(&nodes.line).await? {
            if let Some(line) = v.as_f64().filter(|l| *l >= 0.0) {
                status.set_line_number(line as u64);
            }
        }
        if let Some(v) = self.read_optional(&nodes.feedrate).await? {
            if let Some(f) = v.as_f64() {
                status.set_feedrate(f);
            }
        }
        if let Some(v) = self.read_optional(&nodes.spindle_speed).await? {
            if let Some(speed) = v.as_f64() {
                let spindle = status.spindle_mut();
                spindle.speed_rpm = speed.abs();
                spindle.is_running = speed != 0.0;
                spindle.direction = if speed > 0.0 {
                    SpindleDirection::Clockwise
                } else if speed < 0.0 {
                    SpindleDirection::Counterclockwise
                } else {
                    SpindleDirection::Stopped
                };
            }
        }
        if let Some(v) = self.read_optional(&nodes.spindle_load).await? {
            if let Some(load) = v.as_f64() {
                status.spindle_mut().load_percent = load;
            }
        }
        if let Some(v) = self.read_optional(&nodes.emergency_stop).await? {
            status.set_emergency_stop(v.as_bool().unwrap_or(false));
        }
        if let Some(v) = self.read_optional(&nodes.door_open).await? {
            status.set_door_open(v.as_bool().unwrap_or(false));
        }
        if let Some(v) = self.read_optional(&nodes.coolant_on).await? {
            status.set_coolant_on(v.as_bool().unwrap_or(false));
        }
        if let Some(v) = self.read_optional(&nodes.alarms).await? {
            for alarm in v.as_text().unwrap_or("").split(';').map(str::trim).filter(|a| !a.is_empty()) {
                status.push_alarm(alarm);
            }
        }
        for (axis, node_id) in &nodes.axes {
            let value = self
                .session
                .read(node_id)
                .await
                .map_err(|e| ControllerError::StatusUnavailable(format!("read {node_id}: {e}")))?;
            match value.as_f64() {
                Some(pos) => status.set_axis(axis.clone(), pos, self.config.axis_unit.clone()),
                None => debug!(machine_id = %self.config.machine_id, axis = %axis, "non-numeric axis node ignored"),
            }
        }

        Ok(status.build())
    }

    async fn send_command(
        &self,
        command: CncCommand,
        parameters: Option<serde_json::Value>,
    ) -> Result<bool, ControllerError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(ControllerError::NotConnected);
        }
        let binding = self.config.commands.get(&command).ok_or_else(|| {
            ControllerError::NotSupported(format!("no node mapping for {command} on {}", self.config.machine_id))
        })?;

        let value = match (&binding.value, &binding.parameter) {
            (Some(fixed), _) => fixed.clone(),
            (None, Some(name)) => parameters
                .as_ref()
                .and_then(|p| p.get(name))
                .and_then(NodeValue::from_json)
                .ok_or_else(|| ControllerError::CommandFailed(format!("{command} requires parameter '{name}'")))?,
            (None, None) => {
                return Err(ControllerError::CommandFailed(format!("{command} binding has no value")));
            }
        };

        self.session
            .write(&binding.node_id, value)
            .await
            .map_err(|e| ControllerError::CommandFailed(format!("write {}: {e}", binding.node_id)))?;
        debug!(machine_id = %self.config.machine_id, command = command.as_str(), node = %binding.node_id, "command written");
        Ok(true)
    }
}

/// Espace d'adresses OPC-UA en mémoire
#[derive(Default)]
pub struct SimulatedNodeSession {
    nodes: Mutex<HashMap<String, NodeValue>>,
    writes: Mutex<Vec<(String, NodeValue)>>,
    open: AtomicBool,
    reject_writes: AtomicBool,
}

pub const SIMULATED_SCHEME: &str = "sim://";

impl SimulatedNodeSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes<I, K>(nodes: I) -> Self
    where
        I: IntoIterator<Item = (K, NodeValue)>,
        K: Into<String>,
    {
        let session = Self::default();
        {
            let mut map = session.nodes.lock();
            for (k, v) in nodes {
                map.insert(k.into(), v);
            }
        }
        session
    }

    pub fn set(&self, node_id: impl Into<String>, value: NodeValue) {
        self.nodes.lock().insert(node_id.into(), value);
    }

    pub fn get(&self, node_id: &str) -> Option<NodeValue> {
        self.nodes.lock().get(node_id).cloned()
    }

    pub fn writes(&self) -> Vec<(String, NodeValue)> {
        self.writes.lock().clone()
    }

    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

#[async_trait]
impl NodeSession for SimulatedNodeSession {
    async fn open(&self, endpoint: &str, _credentials: Option<&OpcUaCredentials>) -> Result<(), ControllerError> {
        if !endpoint.starts_with(SIMULATED_SCHEME) {
            return Err(ControllerError::ConnectionFailed(format!(
                "simulated session cannot reach {endpoint}"
            )));
        }
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn read(&self, node_id: &str) -> Result<NodeValue, ControllerError> {
        if !self.is_open() {
            return Err(ControllerError::NotConnected);
        }
        self.get(node_id)
            .ok_or_else(|| ControllerError::StatusUnavailable(format!("unknown node {node_id}")))
    }

    async fn write(&self, node_id: &str, value: NodeValue) -> Result<(), ControllerError> {
        if !self.is_open() {
            return Err(ControllerError::NotConnected);
        }
        if self.reject_writes.load(Ordering::Acquire) {
            return Err(ControllerError::CommandFailed(format!("write to {node_id} rejected")));
        }
        self.writes.lock().push((node_id.to_string(), value.clone()));
        self.nodes.lock().insert(node_id.to_string(), value);
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OpcUaConfig {
        let yaml = r#"
machine_id: lathe-02
endpoint_url: "sim://lathe-02"
nodes:
  execution: "ns=2;s=Execution"
  program: "ns=2;s=Program"
  spindle_speed: "ns=2;s=SpindleSpeed"
  emergency_stop: "ns=2;s=EStop"
  alarms: "ns=2;s=Alarms"
  axes:
    X: "ns=2;s=X"
    Z: "ns=2;s=Z"
commands:
  emergency_stop:
    node_id: "ns=2;s=EStopCmd"
    value: true
  set_feedrate:
    node_id: "ns=2;s=FeedOverride"
    parameter: feedrate
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    fn session() -> Arc<SimulatedNodeSession> {
        Arc::new(SimulatedNodeSession::with_nodes([
            ("ns=2;s=Execution", NodeValue::String("ACTIVE".into())),
            ("ns=2;s=Program", NodeValue::String("O2000".into())),
            ("ns=2;s=SpindleSpeed", NodeValue::Double(1800.0)),
            ("ns=2;s=EStop", NodeValue::Bool(false)),
            ("ns=2;s=Alarms", NodeValue::String("AXIS_Z_LIMIT; ;LUBE_LOW".into())),
            ("ns=2;s=X", NodeValue::Double(10.0)),
            ("ns=2;s=Z", NodeValue::Int(-3)),
        ]))
    }

    #[tokio::test]
    async fn test_status_from_node_map() {
        let sim = session();
        let ctrl = OpcUaController::new(config(), sim.clone()).unwrap();
        assert_eq!(ctrl.get_status().await.unwrap_err(), ControllerError::NotConnected);

        ctrl.connect().await.unwrap();
        let status = ctrl.get_status().await.unwrap();
        assert_eq!(status.state(), MachineState::Active);
        assert_eq!(status.program_name(), Some("O2000"));
        assert_eq!(status.spindle_status().map(|s| s.speed_rpm), Some(1800.0));
        assert_eq!(status.alarms(), ["AXIS_Z_LIMIT".to_string(), "LUBE_LOW".to_string()]);
        assert_eq!(status.axis_positions()["Z"].position, -3.0);

        sim.set("ns=2;s=EStop", NodeValue::Bool(true));
        let status = ctrl.get_status().await.unwrap();
        assert_eq!(status.state(), MachineState::EmergencyStop);
    }

    #[tokio::test]
    async fn test_unexpected_execution_value_degrades() {
        let sim = session();
        sim.set("ns=2;s=Execution", NodeValue::Int(7));
        let ctrl = OpcUaController::new(config(), sim).unwrap();
        ctrl.connect().await.unwrap();
        assert_eq!(ctrl.get_status().await.unwrap().state(), MachineState::Unavailable);
    }

    #[tokio::test]
    async fn test_missing_node_is_status_unavailable() {
        let sim = Arc::new(SimulatedNodeSession::new());
        let ctrl = OpcUaController::new(config(), sim).unwrap();
        ctrl.connect().await.unwrap();
        assert!(matches!(ctrl.get_status().await, Err(ControllerError::StatusUnavailable(_))));
    }

    #[tokio::test]
    async fn test_command_mapping() {
        let sim = session();
        let ctrl = OpcUaController::new(config(), sim.clone()).unwrap();
        ctrl.connect().await.unwrap();

        assert_eq!(ctrl.send_command(CncCommand::EmergencyStop, None).await, Ok(true));
        let params = serde_json::json!({ "feedrate": 85 });
        assert_eq!(ctrl.send_command(CncCommand::SetFeedrate, Some(params)).await, Ok(true));
        assert_eq!(
            sim.writes(),
            vec![
                ("ns=2;s=EStopCmd".to_string(), NodeValue::Bool(true)),
                ("ns=2;s=FeedOverride".to_string(), NodeValue::Int(85)),
            ]
        );

        assert!(matches!(
            ctrl.send_command(CncCommand::HomeAllAxes, None).await,
            Err(ControllerError::NotSupported(_))
        ));
        assert!(matches!(
            ctrl.send_command(CncCommand::SetFeedrate, None).await,
            Err(ControllerError::CommandFailed(_))
        ));

        sim.reject_writes(true);
        assert!(matches!(
            ctrl.send_command(CncCommand::EmergencyStop, None).await,
            Err(ControllerError::CommandFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let mut cfg = config();
        cfg.endpoint_url = "opc.tcp://10.0.0.5:4840".into();
        let ctrl = OpcUaController::new(cfg, session()).unwrap();
        assert!(matches!(ctrl.connect().await, Err(ControllerError::ConnectionFailed(_))));

        let sim = session();
        let ctrl = OpcUaController::new(config(), sim.clone()).unwrap();
        ctrl.connect().await.unwrap();
        ctrl.disconnect().await;
        ctrl.disconnect().await;
        assert!(!sim.is_open());
    }

    #[test]
    fn test_binding_without_value_is_rejected() {
        let mut cfg = config();
        cfg.commands.insert(
            CncCommand::Reset,
            CommandBinding { node_id: "ns=2;s=Reset".into(), value: None, parameter: None },
        );
        assert!(OpcUaController::new(cfg, session()).is_err());
    }
}
