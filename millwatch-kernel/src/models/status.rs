use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// États opérationnels d'une machine tels que rapportés par le protocole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineState {
    Unavailable,
    Ready,
    Active,
    Interrupted,
    Stopped,
    EmergencyStop,
    Maintenance,
    Fault,
}

impl MachineState {
    pub fn name(&self) -> &'static str {
        match self {
            MachineState::Unavailable => "UNAVAILABLE",
            MachineState::Ready => "READY",
            MachineState::Active => "ACTIVE",
            MachineState::Interrupted => "INTERRUPTED",
            MachineState::Stopped => "STOPPED",
            MachineState::EmergencyStop => "EMERGENCY_STOP",
            MachineState::Maintenance => "MAINTENANCE",
            MachineState::Fault => "FAULT",
        }
    }

    /// Retrouve un état depuis son nom canonique (insensible à la casse)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "UNAVAILABLE" => Some(MachineState::Unavailable),
            "READY" => Some(MachineState::Ready),
            "ACTIVE" => Some(MachineState::Active),
            "INTERRUPTED" => Some(MachineState::Interrupted),
            "STOPPED" => Some(MachineState::Stopped),
            "EMERGENCY_STOP" => Some(MachineState::EmergencyStop),
            "MAINTENANCE" => Some(MachineState::Maintenance),
            "FAULT" => Some(MachineState::Fault),
            _ => None,
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisPosition {
    pub position: f64,
    pub unit: String, // "mm" par défaut
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpindleDirection {
    Stopped,
    Clockwise,
    Counterclockwise,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpindleStatus {
    pub speed_rpm: f64,
    pub load_percent: f64,
    pub temperature: Option<f64>,
    pub is_running: bool,
    pub direction: SpindleDirection,
}

impl Default for SpindleStatus {
    fn default() -> Self {
        Self {
            speed_rpm: 0.0,
            load_percent: 0.0,
            temperature: None,
            is_running: false,
            direction: SpindleDirection::Stopped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub tool_id: String,
    pub tool_number: u32,
    pub tool_type: String,
    pub diameter: f64,
    pub length: f64,
    pub wear_offset: f64,
    pub life_remaining: Option<f64>,
}

/// Instantané complet d'une machine à un instant donné.
///
/// Construit uniquement via [`MachineStatusBuilder`], puis immuable : le
/// snapshot suivant remplace le précédent, il ne le modifie jamais.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineStatus {
    machine_id: String,
    state: MachineState,
    program_name: Option<String>,
    line_number: Option<u64>,
    feedrate: Option<f64>,
    axis_positions: BTreeMap<String, AxisPosition>,
    spindle_status: Option<SpindleStatus>,
    current_tool: Option<ToolInfo>,
    coolant_on: bool,
    door_open: bool,
    emergency_stop_active: bool,
    alarms: Vec<String>,
    warnings: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

impl MachineStatus {
    pub fn builder(machine_id: impl Into<String>, state: MachineState) -> MachineStatusBuilder {
        MachineStatusBuilder::new(machine_id, state)
    }

    /// Statut dégradé renvoyé quand la charge utile protocolaire est illisible
    pub fn unavailable(machine_id: impl Into<String>) -> Self {
        MachineStatusBuilder::new(machine_id, MachineState::Unavailable).build()
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn program_name(&self) -> Option<&str> {
        self.program_name.as_deref()
    }

    pub fn line_number(&self) -> Option<u64> {
        self.line_number
    }

    pub fn feedrate(&self) -> Option<f64> {
        self.feedrate
    }

    pub fn axis_positions(&self) -> &BTreeMap<String, AxisPosition> {
        &self.axis_positions
    }

    pub fn spindle_status(&self) -> Option<&SpindleStatus> {
        self.spindle_status.as_ref()
    }

    pub fn current_tool(&self) -> Option<&ToolInfo> {
        self.current_tool.as_ref()
    }

    pub fn coolant_on(&self) -> bool {
        self.coolant_on
    }

    pub fn door_open(&self) -> bool {
        self.door_open
    }

    pub fn emergency_stop_active(&self) -> bool {
        self.emergency_stop_active
    }

    pub fn alarms(&self) -> &[String] {
        &self.alarms
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn is_operational(&self) -> bool {
        matches!(self.state, MachineState::Ready | MachineState::Active)
    }

    pub fn has_errors(&self) -> bool {
        !self.alarms.is_empty() || self.emergency_stop_active
    }

    /// Alarmes présentes ici mais absentes du snapshot précédent
    pub fn new_alarms_since<'a>(&'a self, previous: Option<&MachineStatus>) -> Vec<&'a str> {
        self.alarms
            .iter()
            .filter(|a| previous.map_or(true, |p| !p.alarms.contains(a)))
            .map(String::as_str)
            .collect()
    }
}

/// Accumulateur mutable utilisé par les contrôleurs pendant le parsing
#[derive(Debug, Clone)]
pub struct MachineStatusBuilder {
    machine_id: String,
    state: MachineState,
    program_name: Option<String>,
    line_number: Option<u64>,
    feedrate: Option<f64>,
    axis_positions: BTreeMap<String, AxisPosition>,
    spindle_status: Option<SpindleStatus>,
    current_tool: Option<ToolInfo>,
    coolant_on: bool,
    door_open: bool,
    emergency_stop_active: bool,
    alarms: Vec<String>,
    warnings: Vec<String>,
    timestamp: Option<OffsetDateTime>,
}

impl MachineStatusBuilder {
    pub fn new(machine_id: impl Into<String>, state: MachineState) -> Self {
        Self {
            machine_id: machine_id.into(),
            state,
            program_name: None,
            line_number: None,
            feedrate: None,
            axis_positions: BTreeMap::new(),
            spindle_status: None,
            current_tool: None,
            coolant_on: false,
            door_open: false,
            emergency_stop_active: false,
            alarms: Vec::new(),
            warnings: Vec::new(),
            timestamp: None,
        }
    }

    pub fn state(mut self, state: MachineState) -> Self {
        self.state = state;
        self
    }

    pub fn set_state(&mut self, state: MachineState) {
        self.state = state;
    }

    pub fn current_state(&self) -> MachineState {
        self.state
    }

    pub fn program(mut self, name: impl Into<String>, line: Option<u64>) -> Self {
        self.program_name = Some(name.into());
        self.line_number = line;
        self
    }

    pub fn set_program_name(&mut self, name: impl Into<String>) {
        self.program_name = Some(name.into());
    }

    pub fn set_line_number(&mut self, line: u64) {
        self.line_number = Some(line);
    }

    pub fn feedrate(mut self, feedrate: f64) -> Self {
        self.feedrate = Some(feedrate);
        self
    }

    pub fn set_feedrate(&mut self, feedrate: f64) {
        self.feedrate = Some(feedrate);
    }

    pub fn axis(mut self, name: impl Into<String>, position: f64, unit: impl Into<String>) -> Self {
        self.set_axis(name, position, unit);
        self
    }

    pub fn set_axis(&mut self, name: impl Into<String>, position: f64, unit: impl Into<String>) {
        self.axis_positions.insert(
            name.into(),
            AxisPosition { position, unit: unit.into() },
        );
    }

    pub fn spindle(mut self, spindle: SpindleStatus) -> Self {
        self.spindle_status = Some(spindle);
        self
    }

    /// Accès à la broche, créée à l'arrêt si absente
    pub fn spindle_mut(&mut self) -> &mut SpindleStatus {
        self.spindle_status.get_or_insert_with(SpindleStatus::default)
    }

    pub fn tool(mut self, tool: ToolInfo) -> Self {
        self.current_tool = Some(tool);
        self
    }

    pub fn coolant_on(mut self, on: bool) -> Self {
        self.coolant_on = on;
        self
    }

    pub fn set_coolant_on(&mut self, on: bool) {
        self.coolant_on = on;
    }

    pub fn door_open(mut self, open: bool) -> Self {
        self.door_open = open;
        self
    }

    pub fn set_door_open(&mut self, open: bool) {
        self.door_open = open;
    }

    pub fn emergency_stop(mut self, active: bool) -> Self {
        self.emergency_stop_active = active;
        self
    }

    pub fn set_emergency_stop(&mut self, active: bool) {
        self.emergency_stop_active = active;
    }

    pub fn alarm(mut self, alarm: impl Into<String>) -> Self {
        self.alarms.push(alarm.into());
        self
    }

    pub fn push_alarm(&mut self, alarm: impl Into<String>) {
        self.alarms.push(alarm.into());
    }

    pub fn warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn push_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn timestamp(mut self, ts: OffsetDateTime) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Fige le snapshot. Un arrêt d'urgence actif force l'état EMERGENCY_STOP.
    pub fn build(self) -> MachineStatus {
        let state = if self.emergency_stop_active {
            MachineState::EmergencyStop
        } else {
            self.state
        };

        MachineStatus {
            machine_id: self.machine_id,
            state,
            program_name: self.program_name,
            line_number: self.line_number,
            feedrate: self.feedrate,
            axis_positions: self.axis_positions,
            spindle_status: self.spindle_status,
            current_tool: self.current_tool,
            coolant_on: self.coolant_on,
            door_open: self.door_open,
            emergency_stop_active: self.emergency_stop_active,
            alarms: self.alarms,
            warnings: self.warnings,
            timestamp: self.timestamp.unwrap_or_else(OffsetDateTime::now_utc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emergency_stop_is_never_operational() {
        for state in [
            MachineState::Ready,
            MachineState::Active,
            MachineState::Stopped,
            MachineState::Unavailable,
        ] {
            let status = MachineStatus::builder("cnc-01", state).emergency_stop(true).build();
            assert!(status.emergency_stop_active());
            assert_eq!(status.state(), MachineState::EmergencyStop);
            assert!(!status.is_operational());
            assert!(status.has_errors());
        }
    }

    #[test]
    fn test_operational_states() {
        assert!(MachineStatus::builder("m", MachineState::Ready).build().is_operational());
        assert!(MachineStatus::builder("m", MachineState::Active).build().is_operational());
        assert!(!MachineStatus::builder("m", MachineState::Interrupted).build().is_operational());
        assert!(!MachineStatus::unavailable("m").is_operational());
    }

    #[test]
    fn test_new_alarms_since_previous() {
        let first = MachineStatus::builder("m", MachineState::Active).alarm("SPINDLE_OVERLOAD").build();
        let second = MachineStatus::builder("m", MachineState::Active)
            .alarm("SPINDLE_OVERLOAD")
            .alarm("AXIS_X_LIMIT")
            .build();

        assert_eq!(second.new_alarms_since(Some(&first)), vec!["AXIS_X_LIMIT"]);
        assert_eq!(first.new_alarms_since(None), vec!["SPINDLE_OVERLOAD"]);
    }

    #[test]
    fn test_state_names_roundtrip() {
        assert_eq!(MachineState::from_name("emergency_stop"), Some(MachineState::EmergencyStop));
        assert_eq!(MachineState::from_name("FEED_HOLD"), None);
        assert_eq!(MachineState::Fault.to_string(), "FAULT");
    }

    #[test]
    fn test_status_serializes_enums_as_names() {
        let status = MachineStatus::builder("cnc-01", MachineState::Active)
            .axis("X", 10.5, "mm")
            .build();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "ACTIVE");
        assert_eq!(json["axis_positions"]["X"]["unit"], "mm");
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }
}
