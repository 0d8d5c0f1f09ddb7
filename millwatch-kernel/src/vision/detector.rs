/**
 * DEFECT DETECTOR - Localisation des défauts de surface
 *
 * RÔLE :
 * Trouver les régions anormales d'une image prétraitée et les convertir en
 * `DefectDetection` scorées.
 *
 * FONCTIONNEMENT :
 * - Magnitude du gradient de Sobel, seuillée en carte de contours binaire
 * - Régions 8-connexes de la carte de contours, boîte englobante par région
 * - Région retenue si aire de boîte > min_area
 * - Forme allongée (grand côté / petit côté > seuil) → scratch, sinon surface_defect
 * - confidence = min(0.9, aire / 1000), severity = min(1, aire / 5000)
 * - Détection gardée seulement si confidence ≥ confidence_threshold
 */

use super::GrayImage;
use crate::error::{ConfigError, PipelineError};
use crate::models::{BoundingBox, DefectDetection, DefectType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Seuil sur la magnitude du gradient (échelle Sobel 0..~1443)
    pub edge_threshold: f32,
    pub min_area: f64,
    pub confidence_threshold: f64,
    pub scratch_elongation: f64,
    /// Au-delà de cette fraction de pixels de contour, l'image est inexploitable
    pub max_edge_fraction: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            edge_threshold: 100.0,
            min_area: 100.0,
            confidence_threshold: 0.5,
            scratch_elongation: 3.0,
            max_edge_fraction: 0.5,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.edge_threshold.is_finite() && self.edge_threshold > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "inspection.detector.edge_threshold {} must be positive",
                self.edge_threshold
            )));
        }
        if !(self.min_area.is_finite() && self.min_area >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "inspection.detector.min_area {} must be non-negative",
                self.min_area
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "inspection.detector.confidence_threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        if !(self.scratch_elongation.is_finite() && self.scratch_elongation >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "inspection.detector.scratch_elongation {} must be at least 1",
                self.scratch_elongation
            )));
        }
        if !(self.max_edge_fraction > 0.0 && self.max_edge_fraction <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "inspection.detector.max_edge_fraction {} outside (0, 1]",
                self.max_edge_fraction
            )));
        }
        Ok(())
    }
}

/// Résultat brut de détection
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub defects: Vec<DefectDetection>,
    pub total_regions: usize,
    pub filtered_regions: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DefectDetector {
    config: DetectorConfig,
}

struct Region {
    min_x: usize,
    min_y: usize,
    max_x: usize,
    max_y: usize,
}

impl DefectDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn detect(&self, image: &GrayImage) -> Result<Detection, PipelineError> {
        let (w, h) = (image.width(), image.height());
        if w < 3 || h < 3 {
            return Err(PipelineError::DetectionFailed(format!("image {w}x{h} too small for gradient")));
        }

        let edges = edge_map(image, self.config.edge_threshold);
        let edge_count = edges.iter().filter(|&&e| e).count();
        let fraction = edge_count as f64 / (w * h) as f64;
        if fraction > self.config.max_edge_fraction {
            return Err(PipelineError::DetectionFailed(format!(
                "edge map saturated ({:.0}% of pixels), image too noisy to segment",
                fraction * 100.0
            )));
        }

        let regions = connected_regions(&edges, w, h);
        let total_regions = regions.len();
        let defects: Vec<DefectDetection> = regions.iter().filter_map(|r| self.classify(r)).collect();

        Ok(Detection {
            filtered_regions: defects.len(),
            defects,
            total_regions,
        })
    }

    fn classify(&self, region: &Region) -> Option<DefectDetection> {
        let width = (region.max_x - region.min_x + 1) as f64;
        let height = (region.max_y - region.min_y + 1) as f64;
        let area = width * height;
        if area <= self.config.min_area {
            return None;
        }

        let elongation = width.max(height) / width.min(height);
        let defect_type = if elongation > self.config.scratch_elongation {
            DefectType::Scratch
        } else {
            DefectType::SurfaceDefect
        };

        let confidence = (area / 1000.0).min(0.9);
        if confidence < self.config.confidence_threshold {
            return None;
        }
        let severity = (area / 5000.0).min(1.0);
        let bbox = BoundingBox::new(region.min_x as f64, region.min_y as f64, width, height);

        Some(
            DefectDetection::new(defect_type, confidence, bbox, severity)
                .with_description(format!("Detected {} with area {area:.1} pixels", defect_type.as_str())),
        )
    }
}

fn edge_map(image: &GrayImage, threshold: f32) -> Vec<bool> {
    let (w, h) = (image.width(), image.height());
    let mut edges = vec![false; w * h];
    let p = |x: usize, y: usize| image.get(x, y) as f32;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = (p(x + 1, y - 1) + 2.0 * p(x + 1, y) + p(x + 1, y + 1))
                - (p(x - 1, y - 1) + 2.0 * p(x - 1, y) + p(x - 1, y + 1));
            let gy = (p(x - 1, y + 1) + 2.0 * p(x, y + 1) + p(x + 1, y + 1))
                - (p(x - 1, y - 1) + 2.0 * p(x, y - 1) + p(x + 1, y - 1));
            edges[y * w + x] = (gx * gx + gy * gy).sqrt() >= threshold;
        }
    }
    edges
}

fn connected_regions(edges: &[bool], w: usize, h: usize) -> Vec<Region> {
    let mut seen = vec![false; w * h];
    let mut regions = Vec::new();
    let mut stack = Vec::new();

    for start in 0..w * h {
        if !edges[start] || seen[start] {
            continue;
        }
        seen[start] = true;
        stack.push(start);
        let mut region = Region {
            min_x: start % w,
            min_y: start / w,
            max_x: start % w,
            max_y: start / w,
        };

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % w, idx / w);
            region.min_x = region.min_x.min(x);
            region.max_x = region.max_x.max(x);
            region.min_y = region.min_y.min(y);
            region.max_y = region.max_y.max(y);

            for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                    let n = ny * w + nx;
                    if edges[n] && !seen[n] {
                        seen[n] = true;
                        stack.push(n);
                    }
                }
            }
        }
        regions.push(region);
    }
    regions
}
