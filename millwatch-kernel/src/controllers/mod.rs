/**
 * CONTRÔLEURS CNC - Abstraction des protocoles industriels
 *
 * RÔLE :
 * Définit le contrat commun que tout protocole (MTConnect, OPC-UA, futurs)
 * implémente pour que le Manager pilote les machines sans les connaître.
 *
 * FONCTIONNEMENT :
 * - `MachineController` = trait async objet (connect/disconnect/get_status/send_command)
 * - `MonitoredController` = enveloppe qui possède le cycle de vie, la boucle
 *   de polling et les callbacks ordonnés (voir monitor.rs)
 * - Chaque protocole vit dans son propre module et ne touche jamais au Manager
 *
 * CONTRAT :
 * - connect : idempotent une fois connecté, `ConnectionFailed` sinon
 * - disconnect : best effort, toujours Ok, idempotent
 * - get_status : `StatusUnavailable` sur erreur transport, statut UNAVAILABLE
 *   quand la charge utile est illisible
 * - send_command : `NotSupported` (lecture seule / non mappé) ou `CommandFailed`
 */

pub mod monitor;
pub mod mtconnect;
pub mod opcua;

pub use monitor::{ControllerState, MonitoredController, StatusCallback};
pub use mtconnect::{MtConnectConfig, MtConnectController};
pub use opcua::{NodeSession, NodeValue, OpcUaConfig, OpcUaController, SimulatedNodeSession};

use crate::error::ControllerError;
use crate::models::MachineStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Commandes CNC exposées aux appelants (forme filaire snake_case)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CncCommand {
    StartProgram,
    StopProgram,
    PauseProgram,
    ResumeProgram,
    Reset,
    HomeAllAxes,
    EmergencyStop,
    LoadProgram,
    UnloadProgram,
    SetFeedrate,
    SetSpindleSpeed,
}

impl CncCommand {
    pub const ALL: [CncCommand; 11] = [
        CncCommand::StartProgram,
        CncCommand::StopProgram,
        CncCommand::PauseProgram,
        CncCommand::ResumeProgram,
        CncCommand::Reset,
        CncCommand::HomeAllAxes,
        CncCommand::EmergencyStop,
        CncCommand::LoadProgram,
        CncCommand::UnloadProgram,
        CncCommand::SetFeedrate,
        CncCommand::SetSpindleSpeed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CncCommand::StartProgram => "start_program",
            CncCommand::StopProgram => "stop_program",
            CncCommand::PauseProgram => "pause_program",
            CncCommand::ResumeProgram => "resume_program",
            CncCommand::Reset => "reset",
            CncCommand::HomeAllAxes => "home_all_axes",
            CncCommand::EmergencyStop => "emergency_stop",
            CncCommand::LoadProgram => "load_program",
            CncCommand::UnloadProgram => "unload_program",
            CncCommand::SetFeedrate => "set_feedrate",
            CncCommand::SetSpindleSpeed => "set_spindle_speed",
        }
    }

    /// Commandes qui passent par le garde de sécurité et exigent une confirmation côté API
    pub fn is_safety_critical(&self) -> bool {
        matches!(self, CncCommand::EmergencyStop | CncCommand::StartProgram)
    }
}

impl std::str::FromStr for CncCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        CncCommand::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| format!("unknown command '{s}'"))
    }
}

impl std::fmt::Display for CncCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Programme pièce envoyé par `load_program`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramInfo {
    pub program_name: String,
    pub program_content: String,
    pub estimated_runtime_min: Option<f64>,
    pub material: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolType {
    Mtconnect,
    Opcua,
    Custom,
}

impl ProtocolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::Mtconnect => "mtconnect",
            ProtocolType::Opcua => "opcua",
            ProtocolType::Custom => "custom",
        }
    }
}

/// Contrat d'un protocole machine.
///
/// Les méthodes prennent `&self` : chaque implémentation gère sa propre
/// mutabilité interne, ce qui permet au moniteur et aux commandes API de
/// partager le même contrôleur via `Arc`.
#[async_trait]
pub trait MachineController: Send + Sync {
    fn machine_id(&self) -> &str;

    fn protocol(&self) -> ProtocolType;

    async fn connect(&self) -> Result<(), ControllerError>;

    async fn disconnect(&self);

    async fn get_status(&self) -> Result<MachineStatus, ControllerError>;

    async fn send_command(
        &self,
        command: CncCommand,
        parameters: Option<serde_json::Value>,
    ) -> Result<bool, ControllerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_names() {
        assert_eq!("START_PROGRAM".parse::<CncCommand>(), Ok(CncCommand::StartProgram));
        assert_eq!("set_spindle_speed".parse::<CncCommand>(), Ok(CncCommand::SetSpindleSpeed));
        assert!("warp_drive".parse::<CncCommand>().is_err());

        let json = serde_json::to_string(&CncCommand::HomeAllAxes).unwrap();
        assert_eq!(json, "\"home_all_axes\"");
    }

    #[test]
    fn test_safety_critical_commands() {
        let critical: Vec<_> = CncCommand::ALL.into_iter().filter(|c| c.is_safety_critical()).collect();
        assert_eq!(critical, vec![CncCommand::StartProgram, CncCommand::EmergencyStop]);
    }
}
