/**
 * SAFETY - Garde des opérations critiques (arrêt d'urgence, démarrage programme)
 *
 * RÔLE :
 * Exécute une opération sécurité et, si elle échoue, escalade :
 * log niveau `error` avec `safety = true`, verrouillage du composant
 * propriétaire en EMERGENCY_STOP, puis OperationResult en échec SAFETY_ERROR.
 * Un échec de sécurité n'est jamais avalé silencieusement.
 *
 * Une commande que le protocole ne sait pas exécuter (`NotSupported`) n'est
 * pas un échec de sécurité : elle remonte telle quelle avec son code.
 */

use crate::error::ControllerError;
use crate::models::{ErrorCode, OperationResult};
use std::future::Future;
use std::time::Instant;
use tracing::{error, info};

/// Composant capable de se verrouiller en arrêt d'urgence
pub trait SafetyLatch {
    fn component_id(&self) -> &str;

    fn latch_emergency_stop(&self, reason: &str);
}

pub async fn guard<L, F>(component: &L, operation: &str, op: F) -> OperationResult<bool>
where
    L: SafetyLatch + ?Sized,
    F: Future<Output = Result<bool, ControllerError>>,
{
    let started = Instant::now();
    info!(component = component.component_id(), operation, "safety operation started");

    match op.await {
        Ok(true) => {
            info!(component = component.component_id(), operation, "safety operation completed");
            OperationResult::success_since(true, started)
        }
        Err(ControllerError::NotSupported(msg)) => {
            OperationResult::failure_since(ErrorCode::NotSupported, msg, started)
        }
        outcome => {
            let reason = match outcome {
                Ok(_) => "command rejected by controller".to_string(),
                Err(e) => e.to_string(),
            };
            error!(
                safety = true,
                component = component.component_id(),
                operation,
                error = %reason,
                "safety operation failed"
            );
            component.latch_emergency_stop(&reason);
            OperationResult::failure_since(
                ErrorCode::SafetyError,
                format!("safety operation {operation} failed: {reason}"),
                started,
            )
            .with_metadata("operation", operation)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Latch {
        reasons: Mutex<Vec<String>>,
    }

    impl SafetyLatch for Latch {
        fn component_id(&self) -> &str {
            "test"
        }

        fn latch_emergency_stop(&self, reason: &str) {
            self.reasons.lock().push(reason.to_string());
        }
    }

    #[tokio::test]
    async fn test_guard_success_does_not_latch() {
        let latch = Latch::default();
        let r = guard(&latch, "start_program", async { Ok(true) }).await;
        assert!(r.is_success());
        assert!(latch.reasons.lock().is_empty());
    }

    #[tokio::test]
    async fn test_guard_failure_escalates() {
        let latch = Latch::default();
        let r = guard(&latch, "emergency_stop", async {
            Err(ControllerError::CommandFailed("write timeout".into()))
        })
        .await;

        assert_eq!(r.error_code(), Some(ErrorCode::SafetyError));
        assert_eq!(r.metadata()["operation"], "emergency_stop");
        assert_eq!(latch.reasons.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_guard_rejected_command_escalates() {
        let latch = Latch::default();
        let r = guard(&latch, "start_program", async { Ok(false) }).await;
        assert_eq!(r.error_code(), Some(ErrorCode::SafetyError));
        assert_eq!(latch.reasons.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_guard_not_supported_passes_through() {
        let latch = Latch::default();
        let r = guard(&latch, "emergency_stop", async {
            Err(ControllerError::NotSupported("read-only".into()))
        })
        .await;
        assert_eq!(r.error_code(), Some(ErrorCode::NotSupported));
        assert!(latch.reasons.lock().is_empty());
    }
}
