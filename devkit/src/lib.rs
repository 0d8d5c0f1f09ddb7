/*!
# MillWatch DevKit - Doublures et fixtures pour tester le kernel

Bibliothèque facilitant l'écriture de tests du kernel MillWatch avec:
- Contrôleur machine scripté (statuts, erreurs, commandes enregistrées)
- Sinks d'événements enregistreurs / défaillants
- Fixtures images et documents MTConnect
- Agent MTConnect HTTP en mémoire
- Harness assemblant manager + broadcaster
*/

pub mod fixtures;
pub mod mock_controller;
pub mod mtconnect_stub;
pub mod sinks;
pub mod test_utils;

pub use mock_controller::MockController;
pub use mtconnect_stub::MtConnectAgentStub;
pub use sinks::{FailingSink, RecordingSink};
pub use test_utils::{wait_until, TestHarness};
