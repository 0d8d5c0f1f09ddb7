use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

/// Codes d'erreur stables exposés aux appelants (API, logs, tests)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConnectionFailed,
    StatusUnavailable,
    NotSupported,
    CommandFailed,
    NotConnected,
    InvalidState,
    AlreadyMonitoring,
    UnknownMachine,
    AlreadyRegistered,
    InvalidImage,
    PreprocessingFailed,
    DetectionFailed,
    InspectionError,
    SafetyError,
    ConfigError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::StatusUnavailable => "STATUS_UNAVAILABLE",
            ErrorCode::NotSupported => "NOT_SUPPORTED",
            ErrorCode::CommandFailed => "COMMAND_FAILED",
            ErrorCode::NotConnected => "NOT_CONNECTED",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::AlreadyMonitoring => "ALREADY_MONITORING",
            ErrorCode::UnknownMachine => "UNKNOWN_MACHINE",
            ErrorCode::AlreadyRegistered => "ALREADY_REGISTERED",
            ErrorCode::InvalidImage => "INVALID_IMAGE",
            ErrorCode::PreprocessingFailed => "PREPROCESSING_FAILED",
            ErrorCode::DetectionFailed => "DETECTION_FAILED",
            ErrorCode::InspectionError => "INSPECTION_ERROR",
            ErrorCode::SafetyError => "SAFETY_ERROR",
            ErrorCode::ConfigError => "CONFIG_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enveloppe uniforme des opérations du kernel.
///
/// `result` n'existe que sur succès, `error`/`error_code` que sur échec :
/// les champs sont privés et seuls `success`/`failure` construisent la valeur.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult<T> {
    success: bool,
    result: Option<T>,
    error: Option<String>,
    error_code: Option<ErrorCode>,
    duration_ms: f64,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl<T> OperationResult<T> {
    pub fn success(result: T, duration: Duration) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            error_code: None,
            duration_ms: duration_ms(duration),
            timestamp: OffsetDateTime::now_utc(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn failure(code: ErrorCode, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            error_code: Some(code),
            duration_ms: duration_ms(duration),
            timestamp: OffsetDateTime::now_utc(),
            metadata: BTreeMap::new(),
        }
    }

    /// Variante pratique qui mesure depuis `started`
    pub fn success_since(result: T, started: Instant) -> Self {
        Self::success(result, started.elapsed())
    }

    pub fn failure_since(code: ErrorCode, error: impl Into<String>, started: Instant) -> Self {
        Self::failure(code, error, started.elapsed())
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn result(&self) -> Option<&T> {
        self.result.as_ref()
    }

    pub fn into_result(self) -> Option<T> {
        self.result
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error_code
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration_ms
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    /// Convertit le type porté sans toucher à l'issue ni aux métadonnées
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OperationResult<U> {
        OperationResult {
            success: self.success,
            result: self.result.map(f),
            error: self.error,
            error_code: self.error_code,
            duration_ms: self.duration_ms,
            timestamp: self.timestamp,
            metadata: self.metadata,
        }
    }
}

fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope() {
        let r = OperationResult::success(42u32, Duration::from_millis(12)).with_metadata("stage", "detect");
        assert!(r.is_success());
        assert_eq!(r.result(), Some(&42));
        assert!(r.error().is_none());
        assert!(r.error_code().is_none());
        assert!((r.duration_ms() - 12.0).abs() < 1e-9);
        assert_eq!(r.metadata()["stage"], "detect");
    }

    #[test]
    fn test_failure_envelope_serialization() {
        let r: OperationResult<u32> =
            OperationResult::failure(ErrorCode::DetectionFailed, "edge map empty", Duration::ZERO);
        assert!(!r.is_success());
        assert!(r.result().is_none());

        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error_code"], "DETECTION_FAILED");
        assert_eq!(json["error"], "edge map empty");
        assert!(json["result"].is_null());
    }

    #[test]
    fn test_map_keeps_outcome() {
        let r = OperationResult::success(3u8, Duration::ZERO).map(|v| v.to_string());
        assert_eq!(r.result().map(String::as_str), Some("3"));

        let f: OperationResult<u8> = OperationResult::failure(ErrorCode::UnknownMachine, "nope", Duration::ZERO);
        let f = f.map(|v| v * 2);
        assert_eq!(f.error_code(), Some(ErrorCode::UnknownMachine));
    }
}
