/*!
Sinks d'événements pour tests

`RecordingSink` garde chaque enveloppe reçue (clonable : le test garde une
copie, le broadcaster l'autre). `FailingSink` échoue toujours, pour vérifier
le retrait des abonnés défaillants.
*/

use millwatch_kernel::error::SinkError;
use millwatch_kernel::events::EventSink;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct RecordingSink {
    envelopes: Arc<Mutex<Vec<String>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelopes(&self) -> Vec<String> {
        self.envelopes.lock().unwrap().clone()
    }

    /// Partie `data` de chaque enveloppe, dans l'ordre de réception
    pub fn events(&self) -> Vec<Value> {
        self.envelopes()
            .iter()
            .filter_map(|raw| serde_json::from_str::<Value>(raw).ok())
            .map(|mut env| env["data"].take())
            .collect()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|e| e["event_type"] == event_type)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.envelopes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.envelopes.lock().unwrap().clear();
    }
}

impl EventSink for RecordingSink {
    fn deliver(&self, envelope: &str) -> Result<(), SinkError> {
        self.envelopes.lock().unwrap().push(envelope.to_string());
        Ok(())
    }

    fn describe(&self) -> String {
        "recording".into()
    }
}

#[derive(Default)]
pub struct FailingSink {
    attempts: AtomicUsize,
}

impl FailingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl EventSink for FailingSink {
    fn deliver(&self, _envelope: &str) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Transport("simulated transport failure".into()))
    }

    fn describe(&self) -> String {
        "failing".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_unwraps_envelopes() {
        let sink = RecordingSink::new();
        sink.deliver(r#"{"type":"event","data":{"event_type":"machine_alarm"}}"#).unwrap();
        sink.deliver(r#"{"type":"event","data":{"event_type":"emergency_stop"}}"#).unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.events_of_type("machine_alarm").len(), 1);
        sink.clear();
        assert!(sink.is_empty());
    }
}
