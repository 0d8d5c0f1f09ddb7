/**
 * MQTT SINK - Relais des événements du kernel vers un broker MQTT
 *
 * RÔLE :
 * Abonné du broadcaster qui republie chaque enveloppe sur un topic MQTT
 * (supervision usine, historiens, tableaux de bord).
 *
 * FONCTIONNEMENT :
 * - Client rumqttc + tâche qui pilote l'eventloop (reconnexion après 2s)
 * - Livraison non bloquante via try_publish : file pleine = message perdu
 *   (warn), l'abonné reste inscrit
 * - Tâche eventloop terminée = sink fermé, le broadcaster retire alors l'abonné
 * - État de connexion reporté dans le HealthTracker, "disabled" à la destruction
 */

use crate::error::SinkError;
use crate::events::{EventSink, SubscriptionFilter};
use crate::health::HealthTracker;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConf {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Capacité de la file de requêtes du client
    #[serde(default = "default_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub filter: Option<SubscriptionFilter>,
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "millwatch-kernel".into()
}

fn default_topic() -> String {
    "millwatch/events".into()
}

fn default_keep_alive() -> u64 {
    15
}

fn default_capacity() -> usize {
    64
}

pub struct MqttSink {
    client: AsyncClient,
    topic: String,
    driver: Option<JoinHandle<()>>,
    health: HealthTracker,
}

impl MqttSink {
    /// Crée le client et lance la tâche eventloop (runtime tokio requis)
    pub fn spawn(conf: &MqttConf, health: HealthTracker) -> Self {
        let mut opts = MqttOptions::new(&conf.client_id, &conf.host, conf.port);
        opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs));
        let (client, eventloop) = AsyncClient::new(opts, conf.queue_capacity);

        let broker = format!("{}:{}", conf.host, conf.port);
        health.mark_mqtt_connecting();
        let driver = tokio::spawn(drive(eventloop, broker, health.clone()));

        Self {
            client,
            topic: conf.topic.clone(),
            driver: Some(driver),
            health,
        }
    }

    #[cfg(test)]
    fn detached(client: AsyncClient, topic: impl Into<String>, driver: Option<JoinHandle<()>>, health: HealthTracker) -> Self {
        Self { client, topic: topic.into(), driver, health }
    }

    fn is_closed(&self) -> bool {
        self.driver.as_ref().is_some_and(|d| d.is_finished())
    }
}

async fn drive(mut eventloop: EventLoop, broker: String, health: HealthTracker) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!(broker = %broker, "mqtt connected");
                health.mark_mqtt_connected();
            }
            Ok(_) => {}
            Err(e) => {
                warn!(broker = %broker, error = %e, "mqtt connection error, retrying in 2s");
                health.increment_reconnects();
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

impl EventSink for MqttSink {
    fn deliver(&self, envelope: &str) -> Result<(), SinkError> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        if let Err(e) = self
            .client
            .try_publish(self.topic.as_str(), QoS::AtLeastOnce, false, envelope.as_bytes().to_vec())
        {
            warn!(topic = %self.topic, error = %e, "mqtt request queue full, event dropped");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("mqtt:{}", self.topic)
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.health.mark_mqtt_disabled();
        debug!(topic = %self.topic, "mqtt sink released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBroadcaster;
    use crate::manager::MachineManager;
    use crate::models::{ManufacturingEvent, Priority};
    use crate::vision::QualityInspector;
    use std::sync::Arc;

    fn mqtt_status(health: &HealthTracker) -> String {
        health
            .get_health(&MachineManager::default(), &EventBroadcaster::new(), &QualityInspector::default())
            .mqtt_status
    }

    #[test]
    fn test_conf_defaults() {
        let conf: MqttConf = serde_yaml::from_str("host: broker.local").unwrap();
        assert_eq!(conf.port, 1883);
        assert_eq!(conf.topic, "millwatch/events");
        assert!(conf.filter.is_none());
    }

    #[test]
    fn test_full_request_queue_drops_event_and_keeps_subscriber() {
        let opts = MqttOptions::new("test-sink", "localhost", 1883);
        let (client, _eventloop) = AsyncClient::new(opts, 1);
        let sink = MqttSink::detached(client, "millwatch/test", None, HealthTracker::new());
        assert_eq!(sink.describe(), "mqtt:millwatch/test");

        let broadcaster = EventBroadcaster::new();
        broadcaster.subscribe(Arc::new(sink), None);
        let event = ManufacturingEvent::new("machine_alarm", "manager", Priority::High);

        for _ in 0..3 {
            let report = broadcaster.broadcast(&event);
            assert_eq!(report.dropped, 0);
            assert_eq!(report.delivered, 1);
        }
        assert_eq!(broadcaster.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_finished_driver_closes_sink() {
        let opts = MqttOptions::new("test-sink", "localhost", 1883);
        let (client, _eventloop) = AsyncClient::new(opts, 4);
        let driver = tokio::spawn(async {});
        while !driver.is_finished() {
            tokio::task::yield_now().await;
        }
        let sink = MqttSink::detached(client, "millwatch/test", Some(driver), HealthTracker::new());
        assert!(matches!(sink.deliver("{}"), Err(SinkError::Closed)));
    }

    #[test]
    fn test_drop_reports_mqtt_disabled() {
        let health = HealthTracker::new();
        health.mark_mqtt_connected();
        let opts = MqttOptions::new("test-sink", "localhost", 1883);
        let (client, _eventloop) = AsyncClient::new(opts, 4);
        let sink = MqttSink::detached(client, "millwatch/test", None, health.clone());
        assert_eq!(mqtt_status(&health), "connected");

        drop(sink);
        assert_eq!(mqtt_status(&health), "disabled");
    }
}
