use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Seuil au-delà duquel un défaut est considéré critique
pub const CRITICAL_SEVERITY: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefectType {
    SurfaceDefect,
    DimensionalError,
    Scratch,
    Crack,
    Discoloration,
    ForeignMaterial,
    IncompleteFeature,
    Burr,
    Corrosion,
    Deformation,
    Unknown,
}

impl DefectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefectType::SurfaceDefect => "surface_defect",
            DefectType::DimensionalError => "dimensional_error",
            DefectType::Scratch => "scratch",
            DefectType::Crack => "crack",
            DefectType::Discoloration => "discoloration",
            DefectType::ForeignMaterial => "foreign_material",
            DefectType::IncompleteFeature => "incomplete_feature",
            DefectType::Burr => "burr",
            DefectType::Corrosion => "corrosion",
            DefectType::Deformation => "deformation",
            DefectType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }
}

/// Un défaut localisé, classé et scoré
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefectDetection {
    defect_type: DefectType,
    confidence: f64,
    bounding_box: BoundingBox,
    severity: f64,
    description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    detection_timestamp: OffsetDateTime,
}

impl DefectDetection {
    /// Confiance et sévérité sont ramenées dans [0,1]
    pub fn new(defect_type: DefectType, confidence: f64, bounding_box: BoundingBox, severity: f64) -> Self {
        Self {
            defect_type,
            confidence: unit_clamp(confidence),
            bounding_box,
            severity: unit_clamp(severity),
            description: None,
            detection_timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn defect_type(&self) -> DefectType {
        self.defect_type
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn bounding_box(&self) -> &BoundingBox {
        &self.bounding_box
    }

    pub fn severity(&self) -> f64 {
        self.severity
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn detection_timestamp(&self) -> OffsetDateTime {
        self.detection_timestamp
    }

    pub fn is_critical(&self) -> bool {
        self.severity > CRITICAL_SEVERITY
    }
}

/// Mesure scalaire avec contrôle de tolérance figé à la construction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityMeasurement {
    measurement_type: String,
    value: f64,
    unit: String,
    tolerance_min: Option<f64>,
    tolerance_max: Option<f64>,
    within_tolerance: bool,
    confidence: f64,
    #[serde(with = "time::serde::rfc3339")]
    measurement_timestamp: OffsetDateTime,
}

impl QualityMeasurement {
    pub fn new(
        measurement_type: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        tolerance_min: Option<f64>,
        tolerance_max: Option<f64>,
        confidence: f64,
    ) -> Self {
        let within_tolerance = tolerance_min.map_or(true, |min| min <= value)
            && tolerance_max.map_or(true, |max| value <= max);

        Self {
            measurement_type: measurement_type.into(),
            value,
            unit: unit.into(),
            tolerance_min,
            tolerance_max,
            within_tolerance,
            confidence: unit_clamp(confidence),
            measurement_timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn measurement_type(&self) -> &str {
        &self.measurement_type
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn tolerance_min(&self) -> Option<f64> {
        self.tolerance_min
    }

    pub fn tolerance_max(&self) -> Option<f64> {
        self.tolerance_max
    }

    pub fn within_tolerance(&self) -> bool {
        self.within_tolerance
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn measurement_timestamp(&self) -> OffsetDateTime {
        self.measurement_timestamp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InspectionResult {
    Pass,
    Fail,
    Uncertain,
    NeedsReview,
}

impl InspectionResult {
    pub fn name(&self) -> &'static str {
        match self {
            InspectionResult::Pass => "PASS",
            InspectionResult::Fail => "FAIL",
            InspectionResult::Uncertain => "UNCERTAIN",
            InspectionResult::NeedsReview => "NEEDS_REVIEW",
        }
    }
}

/// Rapport d'inspection complet, produit une fois par appel à `inspect_part`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InspectionReport {
    part_id: String,
    inspection_result: InspectionResult,
    overall_score: f64,
    defects: Vec<DefectDetection>,
    measurements: Vec<QualityMeasurement>,
    processing_time_ms: f64,
    inspector_notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    inspection_timestamp: OffsetDateTime,
}

impl InspectionReport {
    pub fn new(
        part_id: impl Into<String>,
        inspection_result: InspectionResult,
        overall_score: f64,
        defects: Vec<DefectDetection>,
        measurements: Vec<QualityMeasurement>,
        processing_time_ms: f64,
    ) -> Self {
        Self {
            part_id: part_id.into(),
            inspection_result,
            overall_score: unit_clamp(overall_score),
            defects,
            measurements,
            processing_time_ms,
            inspector_notes: None,
            inspection_timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.inspector_notes = Some(notes.into());
        self
    }

    pub fn part_id(&self) -> &str {
        &self.part_id
    }

    pub fn inspection_result(&self) -> InspectionResult {
        self.inspection_result
    }

    pub fn overall_score(&self) -> f64 {
        self.overall_score
    }

    pub fn defects(&self) -> &[DefectDetection] {
        &self.defects
    }

    pub fn measurements(&self) -> &[QualityMeasurement] {
        &self.measurements
    }

    pub fn processing_time_ms(&self) -> f64 {
        self.processing_time_ms
    }

    pub fn inspector_notes(&self) -> Option<&str> {
        self.inspector_notes.as_deref()
    }

    pub fn inspection_timestamp(&self) -> OffsetDateTime {
        self.inspection_timestamp
    }

    pub fn defect_count(&self) -> usize {
        self.defects.len()
    }

    pub fn critical_defects(&self) -> Vec<&DefectDetection> {
        self.defects.iter().filter(|d| d.is_critical()).collect()
    }

    pub fn out_of_tolerance_measurements(&self) -> Vec<&QualityMeasurement> {
        self.measurements.iter().filter(|m| !m.within_tolerance()).collect()
    }
}

/// NaN compte comme 0
pub(crate) fn unit_clamp(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defect(severity: f64) -> DefectDetection {
        DefectDetection::new(DefectType::Scratch, 0.8, BoundingBox::new(0.0, 0.0, 10.0, 2.0), severity)
    }

    #[test]
    fn test_within_tolerance_both_bounds() {
        let ok = QualityMeasurement::new("brightness", 120.0, "pixel_intensity_mean", Some(80.0), Some(200.0), 0.9);
        let high = QualityMeasurement::new("brightness", 250.0, "pixel_intensity_mean", Some(80.0), Some(200.0), 0.9);
        let edge = QualityMeasurement::new("brightness", 200.0, "pixel_intensity_mean", Some(80.0), Some(200.0), 0.9);

        assert!(ok.within_tolerance());
        assert!(!high.within_tolerance());
        assert!(edge.within_tolerance());
    }

    #[test]
    fn test_within_tolerance_without_bounds() {
        let m = QualityMeasurement::new("diameter", -4.0, "mm", None, None, 1.0);
        assert!(m.within_tolerance());

        let only_max = QualityMeasurement::new("diameter", 12.0, "mm", None, Some(10.0), 1.0);
        assert!(!only_max.within_tolerance());
    }

    #[test]
    fn test_defect_scores_are_clamped() {
        let d = DefectDetection::new(DefectType::Crack, 1.7, BoundingBox::new(0.0, 0.0, 1.0, 1.0), -0.3);
        assert_eq!(d.confidence(), 1.0);
        assert_eq!(d.severity(), 0.0);

        let nan = DefectDetection::new(DefectType::Crack, f64::NAN, BoundingBox::new(0.0, 0.0, 1.0, 1.0), 0.5);
        assert_eq!(nan.confidence(), 0.0);
    }

    #[test]
    fn test_report_derived_views() {
        let measurements = vec![
            QualityMeasurement::new("surface_roughness", 12.0, "pixel_intensity_std", Some(0.0), Some(50.0), 0.8),
            QualityMeasurement::new("brightness", 250.0, "pixel_intensity_mean", Some(80.0), Some(200.0), 0.9),
        ];
        let report = InspectionReport::new(
            "PART-7",
            InspectionResult::Fail,
            0.5,
            vec![defect(0.9), defect(0.2), defect(0.71)],
            measurements,
            3.5,
        );

        assert_eq!(report.defect_count(), 3);
        let critical: Vec<f64> = report.critical_defects().iter().map(|d| d.severity()).collect();
        assert_eq!(critical, vec![0.9, 0.71]);
        assert_eq!(report.out_of_tolerance_measurements().len(), 1);
        assert_eq!(report.out_of_tolerance_measurements()[0].measurement_type(), "brightness");
    }

    #[test]
    fn test_bounding_box_geometry() {
        let b = BoundingBox::new(10.0, 20.0, 4.0, 6.0);
        assert_eq!(b.center(), (12.0, 23.0));
        assert_eq!(b.area(), 24.0);
    }
}
