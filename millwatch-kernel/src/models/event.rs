use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use uuid::Uuid;

/// Niveaux de priorité : plus la valeur est petite, plus l'événement est urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Emergency = 0,
    Critical = 1,
    High = 2,
    Normal = 3,
    Low = 4,
    Background = 5,
}

impl Priority {
    pub fn value(&self) -> u8 {
        *self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            Priority::Emergency => "EMERGENCY",
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Normal => "NORMAL",
            Priority::Low => "LOW",
            Priority::Background => "BACKGROUND",
        }
    }

    /// Vrai si `self` est au moins aussi urgent que `threshold`
    pub fn meets(&self, threshold: Priority) -> bool {
        self.value() <= threshold.value()
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EMERGENCY" => Ok(Priority::Emergency),
            "CRITICAL" => Ok(Priority::Critical),
            "HIGH" => Ok(Priority::High),
            "NORMAL" => Ok(Priority::Normal),
            "LOW" => Ok(Priority::Low),
            "BACKGROUND" => Ok(Priority::Background),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

// Types d'événements émis par le kernel
pub const MACHINE_STATE_CHANGED: &str = "machine_state_changed";
pub const MACHINE_ALARM: &str = "machine_alarm";
pub const EMERGENCY_STOP: &str = "emergency_stop";
pub const QUALITY_INSPECTION: &str = "quality_inspection";

/// Notification diffusable vers les abonnés
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManufacturingEvent {
    pub event_id: Uuid,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub source_component: String,
    pub priority: Priority,
    pub data: BTreeMap<String, serde_json::Value>,
}

impl ManufacturingEvent {
    pub fn new(event_type: impl Into<String>, source_component: impl Into<String>, priority: Priority) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: OffsetDateTime::now_utc(),
            source_component: source_component.into(),
            priority,
            data: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Enveloppe `{type: "event", data: ...}` poussée vers les transports
    pub fn to_envelope(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&serde_json::json!({
            "type": "event",
            "data": self,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical.meets(Priority::High));
        assert!(Priority::High.meets(Priority::High));
        assert!(!Priority::Normal.meets(Priority::High));
        assert!(Priority::Emergency < Priority::Background);
        assert_eq!("critical".parse::<Priority>(), Ok(Priority::Critical));
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_envelope_format() {
        let event = ManufacturingEvent::new(MACHINE_ALARM, "machine-manager", Priority::High)
            .with_data("machine_id", "cnc-01");
        let envelope: serde_json::Value = serde_json::from_str(&event.to_envelope().unwrap()).unwrap();

        assert_eq!(envelope["type"], "event");
        assert_eq!(envelope["data"]["event_type"], "machine_alarm");
        assert_eq!(envelope["data"]["priority"], "HIGH");
        assert_eq!(envelope["data"]["data"]["machine_id"], "cnc-01");
        assert_eq!(envelope["data"]["event_id"], event.event_id.to_string());
        let ts = envelope["data"]["timestamp"].as_str().unwrap();
        assert!(OffsetDateTime::parse(ts, &time::format_description::well_known::Rfc3339).is_ok());
    }
}
