/**
 * QUALITY INSPECTOR - Orchestration du pipeline d'inspection
 *
 * RÔLE :
 * Produire un InspectionReport pour une image de pièce : prétraitement,
 * détection, mesures, score global et verdict PASS/FAIL/...
 *
 * FONCTIONNEMENT :
 * - Étapes CPU exécutées sur le pool bloquant (spawn_blocking)
 * - Première étape en erreur = échec avec le code de l'étape
 * - Panique d'une étape = INSPECTION_ERROR
 * - Mesure individuelle impossible = journalisée et ignorée
 * - Score : 1 − Σ sévérité·confiance·w_défaut − Σ_hors_tolérance w_mesure·confiance
 * - Verdict : défaut critique ou mesure hors tolérance → FAIL, sinon seuils
 */

use super::{DefectDetector, DetectorConfig, Image, ImageProcessor, PreprocessConfig, RegionOfInterest};
use crate::error::{ConfigError, PipelineError};
use crate::models::{
    DefectDetection, ErrorCode, InspectionReport, InspectionResult, OperationResult, QualityMeasurement,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn, Span};

pub const SURFACE_ROUGHNESS: &str = "surface_roughness";
pub const BRIGHTNESS: &str = "brightness";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToleranceBand {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    pub surface_roughness: ToleranceBand,
    pub brightness: ToleranceBand,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            surface_roughness: ToleranceBand { min: Some(0.0), max: Some(50.0), confidence: 0.8 },
            brightness: ToleranceBand { min: Some(80.0), max: Some(200.0), confidence: 0.9 },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub defect_weight: f64,
    pub tolerance_weight: f64,
    pub pass_threshold: f64,
    pub review_threshold: f64,
    pub uncertain_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            defect_weight: 0.2,
            tolerance_weight: 0.1,
            pass_threshold: 0.95,
            review_threshold: 0.80,
            uncertain_threshold: 0.60,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.defect_weight >= 0.0 && self.tolerance_weight >= 0.0) {
            return Err(ConfigError::Invalid("scoring weights must be non-negative".into()));
        }
        let ordered = 1.0 >= self.pass_threshold
            && self.pass_threshold >= self.review_threshold
            && self.review_threshold >= self.uncertain_threshold
            && self.uncertain_threshold >= 0.0;
        if !ordered {
            return Err(ConfigError::Invalid(format!(
                "scoring bands must satisfy 1 >= pass ({}) >= review ({}) >= uncertain ({}) >= 0",
                self.pass_threshold, self.review_threshold, self.uncertain_threshold
            )));
        }
        Ok(())
    }
}

/// Section `inspection` de kernel.yaml
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectionConfig {
    pub preprocessing: PreprocessConfig,
    pub detector: DetectorConfig,
    pub measurements: MeasurementConfig,
    pub scoring: ScoringConfig,
}

pub fn quality_score(defects: &[DefectDetection], measurements: &[QualityMeasurement], scoring: &ScoringConfig) -> f64 {
    let defect_penalty: f64 = defects
        .iter()
        .map(|d| d.severity() * d.confidence() * scoring.defect_weight)
        .sum();
    let tolerance_penalty: f64 = measurements
        .iter()
        .filter(|m| !m.within_tolerance())
        .map(|m| scoring.tolerance_weight * m.confidence())
        .sum();
    (1.0 - defect_penalty - tolerance_penalty).clamp(0.0, 1.0)
}

pub fn classify(
    score: f64,
    defects: &[DefectDetection],
    measurements: &[QualityMeasurement],
    scoring: &ScoringConfig,
) -> InspectionResult {
    if defects.iter().any(|d| d.is_critical()) {
        return InspectionResult::Fail;
    }
    if measurements.iter().any(|m| !m.within_tolerance()) {
        return InspectionResult::Fail;
    }
    if score >= scoring.pass_threshold {
        InspectionResult::Pass
    } else if score >= scoring.review_threshold {
        InspectionResult::NeedsReview
    } else if score >= scoring.uncertain_threshold {
        InspectionResult::Uncertain
    } else {
        InspectionResult::Fail
    }
}

struct Stages {
    processor: ImageProcessor,
    detector: DefectDetector,
    measurements: MeasurementConfig,
}

struct StageOutput {
    defects: Vec<DefectDetection>,
    measurements: Vec<QualityMeasurement>,
    total_regions: usize,
}

impl Stages {
    fn run(&self, image: &Image) -> Result<StageOutput, PipelineError> {
        let processed = self.processor.preprocess(image)?;
        let detection = self.detector.detect(&processed)?;
        debug!(
            total_regions = detection.total_regions,
            kept = detection.filtered_regions,
            "detection complete"
        );

        let measurements = collect_measurements([
            (SURFACE_ROUGHNESS, "pixel_intensity_std", &self.measurements.surface_roughness, processed.std_dev()),
            (BRIGHTNESS, "pixel_intensity_mean", &self.measurements.brightness, processed.mean()),
        ]);

        Ok(StageOutput {
            defects: detection.defects,
            measurements,
            total_regions: detection.total_regions,
        })
    }
}

type Reading<'a> = (&'a str, &'a str, &'a ToleranceBand, Option<f64>);

/// Une lecture absente ou non finie est journalisée puis ignorée, les autres sont gardées
fn collect_measurements<const N: usize>(readings: [Reading<'_>; N]) -> Vec<QualityMeasurement> {
    let mut measurements = Vec::with_capacity(N);
    for (name, unit, band, value) in readings {
        match value.filter(|v| v.is_finite()) {
            Some(v) => measurements.push(QualityMeasurement::new(name, v, unit, band.min, band.max, band.confidence)),
            None => warn!(measurement = name, "measurement unavailable, skipped"),
        }
    }
    measurements
}

pub struct QualityInspector {
    stages: Arc<Stages>,
    scoring: ScoringConfig,
    inspections: AtomicU64,
    span: Span,
}

impl Default for QualityInspector {
    fn default() -> Self {
        Self::new(InspectionConfig::default())
    }
}

impl QualityInspector {
    pub fn new(config: InspectionConfig) -> Self {
        Self {
            stages: Arc::new(Stages {
                processor: ImageProcessor::new(config.preprocessing),
                detector: DefectDetector::new(config.detector),
                measurements: config.measurements,
            }),
            scoring: config.scoring,
            inspections: AtomicU64::new(0),
            span: tracing::info_span!("inspector"),
        }
    }

    /// Nombre d'inspections ayant produit un rapport
    pub fn inspections_run(&self) -> u64 {
        self.inspections.load(Ordering::Relaxed)
    }

    pub async fn inspect_region(
        &self,
        image: Image,
        roi: RegionOfInterest,
        part_id: &str,
    ) -> OperationResult<InspectionReport> {
        let started = Instant::now();
        match image.crop(&roi) {
            Ok(region) => self.inspect_part(region, part_id).await,
            Err(e) => {
                warn!(parent: &self.span, part_id, error = %e, "region of interest rejected");
                OperationResult::failure_since(e.code(), e.to_string(), started)
            }
        }
    }

    pub async fn inspect_part(&self, image: Image, part_id: &str) -> OperationResult<InspectionReport> {
        let started = Instant::now();
        let stages = self.stages.clone();
        let span = self.span.clone();
        let meta = image.metadata();

        let outcome = tokio::task::spawn_blocking(move || span.in_scope(|| stages.run(&image))).await;

        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(parent: &self.span, part_id, code = %e.code(), error = %e, "inspection stage failed");
                return OperationResult::failure_since(e.code(), e.to_string(), started);
            }
            Err(join) => return self.join_failure(part_id, join, started),
        };

        let score = quality_score(&output.defects, &output.measurements, &self.scoring);
        let verdict = classify(score, &output.defects, &output.measurements, &self.scoring);
        let defect_count = output.defects.len();
        let measurement_count = output.measurements.len();
        let notes = override_notes(&output.defects, &output.measurements);

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut report = InspectionReport::new(
            part_id,
            verdict,
            score,
            output.defects,
            output.measurements,
            elapsed_ms,
        );
        if let Some(notes) = notes {
            report = report.with_notes(notes);
        }
        self.inspections.fetch_add(1, Ordering::Relaxed);

        info!(
            parent: &self.span,
            part_id,
            result = verdict.name(),
            score = format_args!("{score:.3}"),
            defects = defect_count,
            "part inspected"
        );

        OperationResult::success_since(report, started)
            .with_metadata("width", meta.width)
            .with_metadata("height", meta.height)
            .with_metadata("channels", meta.channels)
            .with_metadata("total_regions", output.total_regions)
            .with_metadata("kept_defects", defect_count)
            .with_metadata("defect_count", defect_count)
            .with_metadata("measurement_count", measurement_count)
            .with_metadata("overall_score", score)
    }

    fn join_failure(&self, part_id: &str, join: JoinError, started: Instant) -> OperationResult<InspectionReport> {
        error!(parent: &self.span, part_id, error = %join, "inspection task aborted");
        OperationResult::failure_since(ErrorCode::InspectionError, format!("inspection task failed: {join}"), started)
    }
}

fn override_notes(defects: &[DefectDetection], measurements: &[QualityMeasurement]) -> Option<String> {
    let critical = defects.iter().filter(|d| d.is_critical()).count();
    let outside: Vec<&str> = measurements
        .iter()
        .filter(|m| !m.within_tolerance())
        .map(|m| m.measurement_type())
        .collect();

    let mut parts = Vec::new();
    if critical > 0 {
        parts.push(format!("{critical} critical defect(s)"));
    }
    if !outside.is_empty() {
        parts.push(format!("out of tolerance: {}", outside.join(", ")));
    }
    (!parts.is_empty()).then(|| parts.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoundingBox, DefectType};

    fn defect(severity: f64, confidence: f64) -> DefectDetection {
        DefectDetection::new(DefectType::SurfaceDefect, confidence, BoundingBox::new(0.0, 0.0, 10.0, 10.0), severity)
    }

    fn in_tolerance() -> Vec<QualityMeasurement> {
        vec![
            QualityMeasurement::new(SURFACE_ROUGHNESS, 12.0, "pixel_intensity_std", Some(0.0), Some(50.0), 0.8),
            QualityMeasurement::new(BRIGHTNESS, 128.0, "pixel_intensity_mean", Some(80.0), Some(200.0), 0.9),
        ]
    }

    fn gray_with_square(size: usize, side: usize, background: u8, square: u8) -> Image {
        let mut data = vec![background; size * size];
        let start = (size - side) / 2;
        for y in start..start + side {
            for x in start..start + side {
                data[y * size + x] = square;
            }
        }
        Image::gray(size, size, data).unwrap()
    }

    #[test]
    fn test_critical_defect_overrides_score() {
        let scoring = ScoringConfig::default();
        let defects = vec![defect(0.9, 0.9)];
        let measurements = in_tolerance();

        let score = quality_score(&defects, &measurements, &scoring);
        assert!((score - 0.838).abs() < 1e-9);
        assert_eq!(classify(score, &defects, &measurements, &scoring), InspectionResult::Fail);
    }

    #[test]
    fn test_out_of_tolerance_measurement_fails() {
        let scoring = ScoringConfig::default();
        let bright = QualityMeasurement::new(BRIGHTNESS, 250.0, "pixel_intensity_mean", Some(80.0), Some(200.0), 0.9);
        assert!(!bright.within_tolerance());

        let measurements = vec![bright];
        let score = quality_score(&[], &measurements, &scoring);
        assert!((score - 0.91).abs() < 1e-9);
        assert_eq!(classify(score, &[], &measurements, &scoring), InspectionResult::Fail);
    }

    #[test]
    fn test_score_bands() {
        let scoring = ScoringConfig::default();
        let m = in_tolerance();
        assert_eq!(classify(1.0, &[], &m, &scoring), InspectionResult::Pass);
        assert_eq!(classify(0.95, &[], &m, &scoring), InspectionResult::Pass);
        assert_eq!(classify(0.85, &[], &m, &scoring), InspectionResult::NeedsReview);
        assert_eq!(classify(0.60, &[], &m, &scoring), InspectionResult::Uncertain);
        assert_eq!(classify(0.59, &[], &m, &scoring), InspectionResult::Fail);
    }

    #[test]
    fn test_score_never_increases_with_more_defects() {
        let scoring = ScoringConfig::default();
        let m = in_tolerance();
        let mut defects = Vec::new();
        let mut previous = quality_score(&defects, &m, &scoring);
        for i in 0..12 {
            defects.push(defect(0.1 * (i % 7) as f64, 0.6));
            let score = quality_score(&defects, &m, &scoring);
            assert!(score <= previous);
            assert!((0.0..=1.0).contains(&score));
            previous = score;
        }
        assert_eq!(quality_score(&vec![defect(1.0, 1.0); 10], &m, &scoring), 0.0);
    }

    #[test]
    fn test_failed_measurement_is_skipped_and_report_still_scored() {
        let config = MeasurementConfig::default();
        let measurements = collect_measurements([
            (SURFACE_ROUGHNESS, "pixel_intensity_std", &config.surface_roughness, Some(f64::NAN)),
            (BRIGHTNESS, "pixel_intensity_mean", &config.brightness, Some(128.0)),
        ]);
        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].measurement_type(), BRIGHTNESS);

        let none = collect_measurements([(SURFACE_ROUGHNESS, "pixel_intensity_std", &config.surface_roughness, None)]);
        assert!(none.is_empty());

        let scoring = ScoringConfig::default();
        let score = quality_score(&[], &measurements, &scoring);
        assert_eq!(score, 1.0);
        assert_eq!(classify(score, &[], &measurements, &scoring), InspectionResult::Pass);
    }

    #[test]
    fn test_scoring_validation() {
        assert!(ScoringConfig::default().validate().is_ok());
        let inverted = ScoringConfig { review_threshold: 0.97, ..Default::default() };
        assert!(inverted.validate().is_err());
    }

    #[tokio::test]
    async fn test_clean_part_passes() {
        let inspector = QualityInspector::default();
        let image = Image::gray(100, 100, vec![128; 100 * 100]).unwrap();

        let outcome = inspector.inspect_part(image, "P-001").await;
        assert!(outcome.is_success(), "{:?}", outcome.error());
        let report = outcome.result().unwrap();
        assert_eq!(report.inspection_result(), InspectionResult::Pass);
        assert_eq!(report.overall_score(), 1.0);
        assert_eq!(report.defect_count(), 0);
        assert_eq!(report.measurements().len(), 2);
        assert!(report.inspector_notes().is_none());
        assert_eq!(outcome.metadata()["defect_count"], 0);
        assert_eq!(inspector.inspections_run(), 1);
    }

    #[tokio::test]
    async fn test_large_blob_fails_on_critical_defect() {
        let inspector = QualityInspector::default();
        let outcome = inspector.inspect_part(gray_with_square(200, 80, 128, 20), "P-002").await;

        let report = outcome.result().unwrap();
        assert_eq!(report.inspection_result(), InspectionResult::Fail);
        assert_eq!(report.critical_defects().len(), 1);
        assert!(report.inspector_notes().unwrap().contains("critical"));
    }

    #[tokio::test]
    async fn test_overexposed_part_fails_on_brightness() {
        let inspector = QualityInspector::default();
        let image = Image::gray(100, 100, vec![250; 100 * 100]).unwrap();
        let report = inspector.inspect_part(image, "P-003").await.into_result().unwrap();

        assert_eq!(report.inspection_result(), InspectionResult::Fail);
        let outside = report.out_of_tolerance_measurements();
        assert_eq!(outside.len(), 1);
        assert_eq!(outside[0].measurement_type(), BRIGHTNESS);
    }

    #[tokio::test]
    async fn test_stage_error_carries_stage_code() {
        let inspector = QualityInspector::default();
        let tiny = Image::gray(4, 4, vec![0; 16]).unwrap();
        let outcome = inspector.inspect_part(tiny, "P-004").await;
        assert_eq!(outcome.error_code(), Some(ErrorCode::PreprocessingFailed));
        assert_eq!(inspector.inspections_run(), 0);
    }

    #[tokio::test]
    async fn test_region_outside_image_is_invalid() {
        let inspector = QualityInspector::default();
        let image = Image::gray(50, 50, vec![128; 2500]).unwrap();
        let roi = RegionOfInterest { x: 40, y: 40, width: 20, height: 20 };
        let outcome = inspector.inspect_region(image, roi, "P-005").await;
        assert_eq!(outcome.error_code(), Some(ErrorCode::InvalidImage));
    }

    #[tokio::test]
    async fn test_panicking_stage_maps_to_inspection_error() {
        let inspector = QualityInspector::default();
        let join = tokio::spawn(async { panic!("stage exploded") }).await.unwrap_err();
        let outcome = inspector.join_failure("P-006", join, Instant::now());
        assert_eq!(outcome.error_code(), Some(ErrorCode::InspectionError));
    }
}
