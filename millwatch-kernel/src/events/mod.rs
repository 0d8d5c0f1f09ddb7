/**
 * EVENT BROADCASTER - Diffusion filtrée des événements vers les abonnés
 *
 * RÔLE :
 * Point unique de sortie des événements du kernel (changements d'état machine,
 * alarmes, arrêts d'urgence, inspections) vers WebSocket, MQTT...
 *
 * FONCTIONNEMENT :
 * - Abonnés indexés par Uuid, chacun avec un sink et un filtre optionnel
 * - Filtre : types d'événements (vide = tous), priorité minimale, composant source
 * - broadcast : enveloppe sérialisée une fois, chaque abonné évalué indépendamment
 * - Échec de livraison = abonné retiré, les autres ne sont jamais interrompus
 * - RwLock parking_lot : la diffusion lit un instantané, l'ajout/retrait écrit
 */

pub mod sinks;

pub use sinks::{ChannelSink, EventSink};

use crate::models::{ManufacturingEvent, Priority};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub event_types: HashSet<String>,
    #[serde(default)]
    pub priority_filter: Option<Priority>,
    #[serde(default)]
    pub component_filter: Option<String>,
}

impl SubscriptionFilter {
    pub fn accepts(&self, event: &ManufacturingEvent) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if let Some(min) = self.priority_filter {
            if !event.priority.meets(min) {
                return false;
            }
        }
        if let Some(component) = &self.component_filter {
            if &event.source_component != component {
                return false;
            }
        }
        true
    }
}

/// Bilan d'une diffusion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub filtered: usize,
    pub dropped: usize,
}

struct Subscriber {
    sink: Arc<dyn EventSink>,
    filter: Option<SubscriptionFilter>,
}

#[derive(Default)]
pub struct EventBroadcaster {
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>, filter: Option<SubscriptionFilter>) -> Uuid {
        let id = Uuid::new_v4();
        let kind = sink.describe();
        self.subscribers.write().insert(id, Subscriber { sink, filter });
        info!(subscriber_id = %id, sink = %kind, "subscriber registered");
        id
    }

    pub fn unsubscribe(&self, id: &Uuid) -> bool {
        let removed = self.subscribers.write().remove(id).is_some();
        if removed {
            info!(subscriber_id = %id, "subscriber removed");
        }
        removed
    }

    /// Remplace le filtre d'un abonné existant (`None` = tout recevoir)
    pub fn update_filter(&self, id: &Uuid, filter: Option<SubscriptionFilter>) -> bool {
        match self.subscribers.write().get_mut(id) {
            Some(sub) => {
                sub.filter = filter;
                debug!(subscriber_id = %id, "subscription filter updated");
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn broadcast(&self, event: &ManufacturingEvent) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        let envelope = match event.to_envelope() {
            Ok(e) => e,
            Err(e) => {
                warn!(event_type = %event.event_type, error = %e, "event serialization failed");
                return report;
            }
        };

        let targets: Vec<(Uuid, Arc<dyn EventSink>, bool)> = self
            .subscribers
            .read()
            .iter()
            .map(|(id, sub)| {
                let wanted = sub.filter.as_ref().map_or(true, |f| f.accepts(event));
                (*id, sub.sink.clone(), wanted)
            })
            .collect();

        let mut failed = Vec::new();
        for (id, sink, wanted) in targets {
            if !wanted {
                report.filtered += 1;
                continue;
            }
            match sink.deliver(&envelope) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(subscriber_id = %id, error = %e, "delivery failed, dropping subscriber");
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let mut subs = self.subscribers.write();
            for id in &failed {
                subs.remove(id);
            }
            report.dropped = failed.len();
        }

        debug!(
            event_type = %event.event_type,
            priority = event.priority.name(),
            delivered = report.delivered,
            filtered = report.filtered,
            dropped = report.dropped,
            "event broadcast"
        );
        report
    }
}
