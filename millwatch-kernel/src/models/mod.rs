/**
 * MODELS - Types de données partagés par tout le kernel MillWatch
 *
 * RÔLE :
 * Vocabulaire commun entre contrôleurs, manager, inspecteur et diffusion.
 *
 * FONCTIONNEMENT :
 * - status : instantanés machine (MachineStatus + builder)
 * - inspection : défauts, mesures et rapport d'inspection qualité
 * - event : événements diffusés + niveaux de priorité
 * - result : enveloppe OperationResult + codes d'erreur stables
 *
 * Les invariants (bornes [0,1], e-stop ⇒ EMERGENCY_STOP, tolérance figée)
 * sont garantis à la construction : aucun champ public ne permet de les casser.
 */

pub mod event;
pub mod inspection;
pub mod result;
pub mod status;

pub use event::{ManufacturingEvent, Priority};
pub use inspection::{
    BoundingBox, DefectDetection, DefectType, InspectionReport, InspectionResult, QualityMeasurement,
};
pub use result::{ErrorCode, OperationResult};
pub use status::{
    AxisPosition, MachineState, MachineStatus, MachineStatusBuilder, SpindleDirection, SpindleStatus, ToolInfo,
};
