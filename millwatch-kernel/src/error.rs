/**
 * ERREURS - Types d'erreurs typés du kernel MillWatch
 *
 * RÔLE :
 * Une énumération thiserror par préoccupation (protocole, pipeline vision,
 * configuration, diffusion). Chacune sait se projeter sur un `ErrorCode`
 * stable, c'est ce code que portent les OperationResult et que l'API
 * traduit en statut HTTP.
 */

use crate::models::ErrorCode;

/// Erreurs des contrôleurs protocolaires
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControllerError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("status unavailable: {0}")]
    StatusUnavailable(String),
    #[error("command not supported: {0}")]
    NotSupported(String),
    #[error("command failed: {0}")]
    CommandFailed(String),
    #[error("controller not connected")]
    NotConnected,
}

impl ControllerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ControllerError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            ControllerError::StatusUnavailable(_) => ErrorCode::StatusUnavailable,
            ControllerError::NotSupported(_) => ErrorCode::NotSupported,
            ControllerError::CommandFailed(_) => ErrorCode::CommandFailed,
            ControllerError::NotConnected => ErrorCode::NotConnected,
        }
    }
}

/// Erreurs des étapes du pipeline d'inspection
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("preprocessing failed: {0}")]
    PreprocessingFailed(String),
    #[error("detection failed: {0}")]
    DetectionFailed(String),
    #[error("inspection error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::InvalidImage(_) => ErrorCode::InvalidImage,
            PipelineError::PreprocessingFailed(_) => ErrorCode::PreprocessingFailed,
            PipelineError::DetectionFailed(_) => ErrorCode::DetectionFailed,
            PipelineError::Internal(_) => ErrorCode::InspectionError,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config value: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ConfigError
    }
}

/// Échec de livraison vers un abonné : l'abonné est alors retiré
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("subscriber channel closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ControllerError::NotSupported("x".into()).code(), ErrorCode::NotSupported);
        assert_eq!(ControllerError::NotConnected.code(), ErrorCode::NotConnected);
        assert_eq!(PipelineError::Internal("panic".into()).code(), ErrorCode::InspectionError);
        assert_eq!(ConfigError::Invalid("x".into()).code(), ErrorCode::ConfigError);
    }
}
