/**
 * CONFIG - Chargement de kernel.yaml
 *
 * RÔLE :
 * Décrire le parc machines, les réglages du manager, du pipeline d'inspection
 * et du relais MQTT, puis construire les contrôleurs correspondants.
 *
 * FONCTIONNEMENT :
 * - Chemin : $MILLWATCH_KERNEL_CONFIG sinon ./kernel.yaml
 * - Fichier absent ou vide = configuration par défaut (avertissement)
 * - Fichier illisible, YAML invalide ou validation en échec = ConfigError,
 *   le kernel refuse de démarrer
 */

use crate::controllers::{
    MachineController, MonitoredController, MtConnectConfig, MtConnectController, NodeValue, OpcUaConfig,
    OpcUaController, SimulatedNodeSession,
};
use crate::controllers::opcua::SIMULATED_SCHEME;
use crate::error::ConfigError;
use crate::mqtt::MqttConf;
use crate::vision::InspectionConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "MILLWATCH_KERNEL_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "kernel.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub api: ApiConf,
    pub manager: ManagerConf,
    pub machines: Vec<MachineDefinition>,
    pub inspection: InspectionConfig,
    pub mqtt: Option<MqttConf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConf {
    pub bind: String,
}

impl Default for ApiConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConf {
    pub history_size: usize,
    pub poll_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for ManagerConf {
    fn default() -> Self {
        Self {
            history_size: crate::manager::DEFAULT_HISTORY_SIZE,
            poll_interval_ms: 1000,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl ManagerConf {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Machine déclarée, discriminée par `protocol`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum MachineDefinition {
    Mtconnect(MtConnectConfig),
    Opcua(OpcUaMachine),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpcUaMachine {
    #[serde(flatten)]
    pub config: OpcUaConfig,
    /// Valeurs initiales de l'espace d'adresses simulé (endpoints sim://)
    #[serde(default)]
    pub simulated_nodes: BTreeMap<String, NodeValue>,
}

impl MachineDefinition {
    pub fn machine_id(&self) -> &str {
        match self {
            MachineDefinition::Mtconnect(c) => &c.machine_id,
            MachineDefinition::Opcua(m) => &m.config.machine_id,
        }
    }

    pub fn build(&self, poll_interval: Duration) -> Result<Arc<MonitoredController>, ConfigError> {
        let inner: Arc<dyn MachineController> = match self {
            MachineDefinition::Mtconnect(c) => Arc::new(MtConnectController::new(c.clone())?),
            MachineDefinition::Opcua(m) => {
                // seul le transport simulé est embarqué
                if !m.config.endpoint_url.starts_with(SIMULATED_SCHEME) {
                    return Err(ConfigError::Invalid(format!(
                        "machine {}: no OPC-UA transport for {} (only {SIMULATED_SCHEME} endpoints)",
                        m.config.machine_id, m.config.endpoint_url
                    )));
                }
                let session = SimulatedNodeSession::with_nodes(m.simulated_nodes.clone());
                Arc::new(OpcUaController::new(m.config.clone(), Arc::new(session))?)
            }
        };
        Ok(Arc::new(MonitoredController::with_interval(inner, poll_interval)))
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.manager.history_size == 0 {
            return Err(ConfigError::Invalid("manager.history_size must be at least 1".into()));
        }
        if self.manager.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("manager.poll_interval_ms must be positive".into()));
        }

        let mut seen = HashSet::new();
        for machine in &self.machines {
            let id = machine.machine_id();
            if id.trim().is_empty() {
                return Err(ConfigError::Invalid("machine with empty machine_id".into()));
            }
            if !seen.insert(id) {
                return Err(ConfigError::Invalid(format!("machine {id} declared twice")));
            }
        }

        self.inspection.preprocessing.validate()?;
        self.inspection.detector.validate()?;
        self.inspection.scoring.validate()
    }

    pub fn from_yaml(path: &str, text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse { path: path.to_string(), source })
    }
}

pub async fn load_config() -> Result<KernelConfig, ConfigError> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    load_config_from(&path).await
}

pub async fn load_config_from(path: &str) -> Result<KernelConfig, ConfigError> {
    let config = if Path::new(path).exists() {
        let text = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read { path: path.to_string(), source })?;
        let config = KernelConfig::from_yaml(path, &text)?;
        info!(path, machines = config.machines.len(), "config loaded");
        config
    } else {
        warn!(path, "config file not found, using defaults");
        KernelConfig::default()
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::{CncCommand, ProtocolType};
    use std::io::Write;

    const SAMPLE: &str = r#"
api:
  bind: 127.0.0.1:9090
manager:
  history_size: 50
  poll_interval_ms: 250
machines:
  - protocol: mtconnect
    machine_id: haas-vf2
    base_url: http://agent.local:5000
  - protocol: opcua
    machine_id: dmg-01
    endpoint_url: sim://dmg-01
    nodes:
      execution: ns=2;s=Execution
    commands:
      stop_program:
        node_id: ns=2;s=Stop
        value: true
    simulated_nodes:
      ns=2;s=Execution: ACTIVE
inspection:
  scoring:
    pass_threshold: 0.9
mqtt:
  host: broker.local
  topic: plant/events
"#;

    #[test]
    fn test_parse_sample() {
        let config = KernelConfig::from_yaml("kernel.yaml", SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.api.bind, "127.0.0.1:9090");
        assert_eq!(config.manager.history_size, 50);
        assert_eq!(config.manager.shutdown_timeout_ms, 10_000);
        assert_eq!(config.machines.len(), 2);
        assert_eq!(config.machines[1].machine_id(), "dmg-01");
        assert_eq!(config.inspection.scoring.pass_threshold, 0.9);
        assert_eq!(config.inspection.scoring.review_threshold, 0.8);
        assert_eq!(config.mqtt.unwrap().topic, "plant/events");

        let MachineDefinition::Opcua(opc) = &config.machines[1] else {
            panic!("expected opcua machine");
        };
        assert!(opc.config.commands.contains_key(&CncCommand::StopProgram));
        assert_eq!(opc.simulated_nodes["ns=2;s=Execution"], NodeValue::String("ACTIVE".into()));
    }

    #[test]
    fn test_build_controllers() {
        let config = KernelConfig::from_yaml("kernel.yaml", SAMPLE).unwrap();
        let built: Vec<_> = config
            .machines
            .iter()
            .map(|m| m.build(config.manager.poll_interval()).unwrap())
            .collect();
        assert_eq!(built[0].protocol(), ProtocolType::Mtconnect);
        assert_eq!(built[1].protocol(), ProtocolType::Opcua);
        assert_eq!(built[1].poll_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_real_opcua_endpoint_is_rejected() {
        let yaml = "machines:\n  - protocol: opcua\n    machine_id: m1\n    endpoint_url: opc.tcp://10.0.0.5:4840\n";
        let config = KernelConfig::from_yaml("kernel.yaml", yaml).unwrap();
        assert!(matches!(config.machines[0].build(Duration::from_secs(1)), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_errors() {
        let dup = "machines:\n  - {protocol: mtconnect, machine_id: a, base_url: 'http://x'}\n  - {protocol: mtconnect, machine_id: a, base_url: 'http://y'}\n";
        let config = KernelConfig::from_yaml("kernel.yaml", dup).unwrap();
        assert!(config.validate().is_err());

        let zero = KernelConfig::from_yaml("kernel.yaml", "manager:\n  history_size: 0\n").unwrap();
        assert!(zero.validate().is_err());

        assert!(matches!(
            KernelConfig::from_yaml("kernel.yaml", "machines: [oops"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_invalid_pipeline_settings_rejected_at_startup() {
        let rejected = [
            "inspection:\n  preprocessing:\n    tile_grid: 0\n",
            "inspection:\n  preprocessing:\n    sigma_space: -1.0\n",
            "inspection:\n  preprocessing:\n    denoise_radius: 100000\n",
            "inspection:\n  preprocessing:\n    denoise_radius: 0\n",
            "inspection:\n  preprocessing:\n    clip_limit: 0.0\n",
            "inspection:\n  detector:\n    confidence_threshold: 1.5\n",
            "inspection:\n  detector:\n    edge_threshold: 0.0\n",
            "inspection:\n  detector:\n    max_edge_fraction: 0.0\n",
            "inspection:\n  detector:\n    scratch_elongation: 0.5\n",
        ];
        for yaml in rejected {
            let config = KernelConfig::from_yaml("kernel.yaml", yaml).unwrap();
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))), "{yaml}");
        }

        let tuned = "inspection:\n  preprocessing:\n    denoise_radius: 2\n    tile_grid: 4\n  detector:\n    min_area: 0.0\n";
        KernelConfig::from_yaml("kernel.yaml", tuned).unwrap().validate().unwrap();
    }

    #[tokio::test]
    async fn test_load_from_file_and_missing_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = load_config_from(&path).await.unwrap();
        assert_eq!(config.machines.len(), 2);

        let defaults = load_config_from("/nonexistent/millwatch.yaml").await.unwrap();
        assert!(defaults.machines.is_empty());
        assert_eq!(defaults.api.bind, "0.0.0.0:8080");
    }
}
