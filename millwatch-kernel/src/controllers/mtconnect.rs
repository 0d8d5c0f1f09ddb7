/**
 * MTCONNECT - Contrôleur lecture seule pour agents MTConnect (HTTP + XML)
 *
 * RÔLE :
 * Interroge un agent MTConnect et convertit le document `current` en
 * MachineStatus uniforme.
 *
 * FONCTIONNEMENT :
 * - connect : GET {base_url}/probe, succès HTTP obligatoire
 * - get_status : GET {base_url}/current[?device=...], parsing quick-xml en flux
 * - Samples → broche, avance, positions d'axes
 * - Events → exécution (table de correspondance), arrêt d'urgence, programme,
 *   ligne, porte, arrosage
 * - Conditions → Fault en alarme, Warning en avertissement
 * - Document illisible → statut UNAVAILABLE, jamais d'erreur (la boucle continue)
 * - Sample UNAVAILABLE ignoré, sample non numérique = document malformé → UNAVAILABLE
 * - send_command → toujours NotSupported
 */

use super::{CncCommand, MachineController, ProtocolType};
use crate::error::{ConfigError, ControllerError};
use crate::models::{MachineState, MachineStatus, MachineStatusBuilder, SpindleDirection};
use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtConnectConfig {
    pub machine_id: String,
    pub base_url: String,
    /// Nom ou uuid du device, ajouté en `?device=` sur /current
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    5000
}

pub struct MtConnectController {
    config: MtConnectConfig,
    client: reqwest::Client,
    connected: AtomicBool,
}

impl MtConnectController {
    pub fn new(config: MtConnectConfig) -> Result<Self, ConfigError> {
        if config.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "machine {}: mtconnect base_url is empty",
                config.machine_id
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("machine {}: http client: {e}", config.machine_id)))?;

        Ok(Self {
            config,
            client,
            connected: AtomicBool::new(false),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }
}

#[async_trait]
impl MachineController for MtConnectController {
    fn machine_id(&self) -> &str {
        &self.config.machine_id
    }

    fn protocol(&self) -> ProtocolType {
        ProtocolType::Mtconnect
    }

    async fn connect(&self) -> Result<(), ControllerError> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        let resp = self
            .client
            .get(self.url("probe"))
            .send()
            .await
            .map_err(|e| ControllerError::ConnectionFailed(format!("probe request: {e}")))?;

        if !resp.status().is_success() {
            return Err(ControllerError::ConnectionFailed(format!(
                "probe returned HTTP {}",
                resp.status().as_u16()
            )));
        }
        self.connected.store(true, Ordering::Release);
        debug!(machine_id = %self.config.machine_id, base_url = %self.config.base_url, "mtconnect agent reachable");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    async fn get_status(&self) -> Result<MachineStatus, ControllerError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(ControllerError::NotConnected);
        }

        let mut request = self.client.get(self.url("current"));
        if let Some(device) = &self.config.device {
            request = request.query(&[("device", device)]);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ControllerError::StatusUnavailable(format!("current request: {e}")))?;
        if !resp.status().is_success() {
            return Err(ControllerError::StatusUnavailable(format!(
                "current returned HTTP {}",
                resp.status().as_u16()
            )));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| ControllerError::StatusUnavailable(format!("current body: {e}")))?;

        Ok(parse_current(&self.config.machine_id, &body))
    }

    async fn send_command(
        &self,
        command: CncCommand,
        _parameters: Option<serde_json::Value>,
    ) -> Result<bool, ControllerError> {
        Err(ControllerError::NotSupported(format!(
            "{command} is not available: MTConnect is read-only"
        )))
    }
}

/// Correspondance des valeurs `Execution` vers l'état machine
pub fn execution_state(value: &str) -> MachineState {
    match value.trim().to_ascii_uppercase().as_str() {
        "ACTIVE" => MachineState::Active,
        "READY" => MachineState::Ready,
        "STOPPED" | "PROGRAM_STOPPED" => MachineState::Stopped,
        "INTERRUPTED" | "FEED_HOLD" => MachineState::Interrupted,
        _ => MachineState::Unavailable,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Samples,
    Events,
    Condition,
}

/// Élément de donnée en cours de lecture
struct DataItem {
    tag: String,
    name: Option<String>,
    units: Option<String>,
    condition_type: Option<String>,
    native_code: Option<String>,
    text: String,
}

struct StreamParser {
    status: MachineStatusBuilder,
    component: Option<String>,
    component_name: Option<String>,
    section: Option<Section>,
    item: Option<DataItem>,
    saw_streams_root: bool,
    malformed_sample: Option<String>,
}

/// Convertit un document MTConnect `current` en statut.
///
/// Sans élément `Execution` l'état par défaut est READY. Tout document
/// malformé ou sans racine `MTConnectStreams` donne un statut UNAVAILABLE,
/// de même qu'un sample dont la valeur n'est ni numérique ni `UNAVAILABLE`.
pub fn parse_current(machine_id: &str, xml: &str) -> MachineStatus {
    let mut reader = Reader::from_str(xml);
    let mut parser = StreamParser {
        status: MachineStatus::builder(machine_id, MachineState::Ready),
        component: None,
        component_name: None,
        section: None,
        item: None,
        saw_streams_root: false,
        malformed_sample: None,
    };

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => parser.handle_start(e, false),
            Ok(Event::Empty(ref e)) => parser.handle_start(e, true),
            Ok(Event::Text(ref e)) => {
                if let Some(item) = parser.item.as_mut() {
                    item.text.push_str(&e.unescape().unwrap_or_default());
                }
            }
            Ok(Event::End(ref e)) => {
                let tag = local_name(e.local_name().as_ref());
                parser.handle_end(&tag);
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!(machine_id, error = %e, "malformed MTConnect document");
                return MachineStatus::unavailable(machine_id);
            }
            _ => {}
        }
    }

    if !parser.saw_streams_root {
        warn!(machine_id, "MTConnect response is not a streams document");
        return MachineStatus::unavailable(machine_id);
    }
    if let Some(sample) = parser.malformed_sample {
        warn!(machine_id, sample = %sample, "malformed MTConnect sample");
        return MachineStatus::unavailable(machine_id);
    }
    parser.status.build()
}

fn local_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn attr(e: &BytesStart<'_>, key: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

impl StreamParser {
    fn handle_start(&mut self, e: &BytesStart<'_>, empty: bool) {
        let tag = local_name(e.local_name().as_ref());
        match tag.as_str() {
            "MTConnectStreams" => self.saw_streams_root = true,
            "ComponentStream" => {
                self.component = attr(e, "component");
                self.component_name = attr(e, "name");
            }
            "Samples" => self.section = Some(Section::Samples),
            "Events" => self.section = Some(Section::Events),
            "Condition" => self.section = Some(Section::Condition),
            _ if self.section.is_some() => {
                let item = DataItem {
                    name: attr(e, "name"),
                    units: attr(e, "units"),
                    condition_type: attr(e, "type"),
                    native_code: attr(e, "nativeCode"),
                    tag,
                    text: String::new(),
                };
                if empty {
                    self.apply(item);
                } else {
                    self.item = Some(item);
                }
            }
            _ => {}
        }
    }

    fn handle_end(&mut self, tag: &str) {
        match tag {
            "ComponentStream" => {
                self.component = None;
                self.component_name = None;
            }
            "Samples" | "Events" | "Condition" => self.section = None,
            _ => {
                if let Some(item) = self.item.take() {
                    if item.tag == tag {
                        self.apply(item);
                    } else {
                        self.item = Some(item);
                    }
                }
            }
        }
    }

    fn apply(&mut self, item: DataItem) {
        match self.section {
            Some(Section::Samples) => self.apply_sample(&item),
            Some(Section::Events) => self.apply_event(&item),
            Some(Section::Condition) => self.apply_condition(&item),
            None => {}
        }
    }

    fn is_spindle_component(&self) -> bool {
        let matches = |s: &Option<String>| {
            s.as_deref()
                .map(|v| {
                    let v = v.to_ascii_lowercase();
                    v == "rotary" || v.contains("spindle")
                })
                .unwrap_or(false)
        };
        matches(&self.component) || matches(&self.component_name)
    }

    /// Samples numériques effectivement lus, les autres sont ignorés sans contrôle
    fn consumes_sample(&self, tag: &str) -> bool {
        match tag {
            "SpindleSpeed" | "RotaryVelocity" | "Feedrate" | "PathFeedrate" => true,
            "Load" | "Temperature" => self.is_spindle_component(),
            tag => tag.starts_with("Position"),
        }
    }

    fn apply_sample(&mut self, item: &DataItem) {
        let raw = item.text.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("UNAVAILABLE") {
            return;
        }
        let Ok(value) = raw.parse::<f64>() else {
            if self.consumes_sample(&item.tag) && self.malformed_sample.is_none() {
                self.malformed_sample = Some(format!("{}={raw}", item.tag));
            }
            return;
        };

        match item.tag.as_str() {
            "SpindleSpeed" | "RotaryVelocity" => {
                let spindle = self.status.spindle_mut();
                spindle.speed_rpm = value.abs();
                spindle.is_running = value != 0.0;
                spindle.direction = if value > 0.0 {
                    SpindleDirection::Clockwise
                } else if value < 0.0 {
                    SpindleDirection::Counterclockwise
                } else {
                    SpindleDirection::Stopped
                };
            }
            "Load" if self.is_spindle_component() => {
                self.status.spindle_mut().load_percent = value;
            }
            "Temperature" if self.is_spindle_component() => {
                self.status.spindle_mut().temperature = Some(value);
            }
            "Feedrate" | "PathFeedrate" => self.status.set_feedrate(value),
            tag if tag.starts_with("Position") => {
                let axis = item
                    .name
                    .clone()
                    .or_else(|| self.component_name.clone())
                    .unwrap_or_else(|| tag.to_string());
                let unit = item.units.as_deref().map(unit_label).unwrap_or("mm");
                self.status.set_axis(axis, value, unit);
            }
            _ => {}
        }
    }

    fn apply_event(&mut self, item: &DataItem) {
        let raw = item.text.trim();

        // Execution UNAVAILABLE doit faire basculer l'état, pas être ignoré
        if item.tag == "Execution" {
            self.status.set_state(execution_state(raw));
            return;
        }
        if raw.is_empty() || raw.eq_ignore_ascii_case("UNAVAILABLE") {
            return;
        }

        match item.tag.as_str() {
            // Vocabulaire MTConnect : TRIGGERED = arrêt d'urgence engagé,
            // ARMED = circuit fermé, la machine peut tourner
            "EmergencyStop" => self.status.set_emergency_stop(raw.eq_ignore_ascii_case("TRIGGERED")),
            "Program" => self.status.set_program_name(raw),
            "Line" | "LineNumber" => {
                if let Ok(line) = raw.parse::<u64>() {
                    self.status.set_line_number(line);
                }
            }
            "DoorState" => self.status.set_door_open(raw.eq_ignore_ascii_case("OPEN")),
            "CoolantState" | "Coolant" => self.status.set_coolant_on(raw.eq_ignore_ascii_case("ON")),
            _ => {}
        }
    }

    fn apply_condition(&mut self, item: &DataItem) {
        let kind = item.condition_type.as_deref().unwrap_or("SYSTEM");
        let text = item.text.trim();
        let message = match (&item.native_code, text.is_empty()) {
            (Some(code), false) => format!("{kind} [{code}]: {text}"),
            (Some(code), true) => format!("{kind} [{code}]"),
            (None, false) => format!("{kind}: {text}"),
            (None, true) => kind.to_string(),
        };

        match item.tag.as_str() {
            "Fault" => self.status.push_alarm(message),
            "Warning" => self.status.push_warning(message),
            _ => {}
        }
    }
}

/// Unités MTConnect (MILLIMETER, INCH...) vers libellés courts
fn unit_label(units: &str) -> &str {
    match units {
        "MILLIMETER" => "mm",
        "INCH" => "in",
        "DEGREE" => "deg",
        other => other,
    }
}
