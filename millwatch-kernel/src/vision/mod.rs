/**
 * VISION - Pipeline d'inspection qualité par image
 *
 * RÔLE :
 * Types d'image du kernel et pipeline prétraitement → détection → mesures →
 * score → classification.
 *
 * FONCTIONNEMENT :
 * - `Image` : pixels 8 bits entrelacés (1, 3 ou 4 canaux, ordre RGB(A)),
 *   dimensions validées à la construction
 * - `GrayImage` : luminance 8 bits, format de travail de tout le pipeline
 * - processor.rs : débruitage bilatéral + égalisation locale du contraste
 * - detector.rs : gradient de Sobel → régions connexes → classification de forme
 * - inspector.rs : orchestration, mesures, score et verdict
 */

pub mod detector;
pub mod inspector;
pub mod processor;

pub use detector::{DefectDetector, Detection, DetectorConfig};
pub use inspector::{InspectionConfig, MeasurementConfig, QualityInspector, ScoringConfig, ToleranceBand};
pub use processor::{ImageProcessor, PreprocessConfig};

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageMetadata {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub bit_depth: u8,
}

/// Sous-rectangle analysé à la place de l'image complète
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<u8>,
}

impl Image {
    pub fn new(width: usize, height: usize, channels: usize, data: Vec<u8>) -> Result<Self, PipelineError> {
        if width == 0 || height == 0 {
            return Err(PipelineError::InvalidImage(format!("empty image {width}x{height}")));
        }
        if !matches!(channels, 1 | 3 | 4) {
            return Err(PipelineError::InvalidImage(format!("unsupported channel count {channels}")));
        }
        let expected = width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(channels))
            .ok_or_else(|| PipelineError::InvalidImage("image dimensions overflow".into()))?;
        if data.len() != expected {
            return Err(PipelineError::InvalidImage(format!(
                "pixel buffer has {} bytes, {width}x{height}x{channels} needs {expected}",
                data.len()
            )));
        }
        Ok(Self { width, height, channels, data })
    }

    pub fn gray(width: usize, height: usize, data: Vec<u8>) -> Result<Self, PipelineError> {
        Self::new(width, height, 1, data)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn metadata(&self) -> ImageMetadata {
        ImageMetadata {
            width: self.width,
            height: self.height,
            channels: self.channels,
            bit_depth: 8,
        }
    }

    /// Luminance BT.601, canal alpha ignoré
    pub fn to_gray(&self) -> GrayImage {
        let pixels = match self.channels {
            1 => self.data.clone(),
            _ => self
                .data
                .chunks_exact(self.channels)
                .map(|px| {
                    let y = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
                    y.round().clamp(0.0, 255.0) as u8
                })
                .collect(),
        };
        GrayImage { width: self.width, height: self.height, pixels }
    }

    pub fn crop(&self, roi: &RegionOfInterest) -> Result<Image, PipelineError> {
        let fits = roi.width > 0
            && roi.height > 0
            && roi.x.checked_add(roi.width).map_or(false, |r| r <= self.width)
            && roi.y.checked_add(roi.height).map_or(false, |b| b <= self.height);
        if !fits {
            return Err(PipelineError::InvalidImage(format!(
                "region {}x{}+{}+{} outside {}x{} image",
                roi.width, roi.height, roi.x, roi.y, self.width, self.height
            )));
        }

        let row_bytes = roi.width * self.channels;
        let mut data = Vec::with_capacity(row_bytes * roi.height);
        for y in roi.y..roi.y + roi.height {
            let start = (y * self.width + roi.x) * self.channels;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        Ok(Image { width: roi.width, height: roi.height, channels: self.channels, data })
    }
}

/// Image de luminance 8 bits, ligne par ligne
#[derive(Debug, Clone, PartialEq)]
pub struct GrayImage {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
}

impl GrayImage {
    pub(crate) fn from_raw(width: usize, height: usize, pixels: Vec<u8>) -> Self {
        debug_assert_eq!(pixels.len(), width * height);
        Self { width, height, pixels }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.pixels[y * self.width + x]
    }

    pub fn mean(&self) -> Option<f64> {
        if self.pixels.is_empty() {
            return None;
        }
        let sum: f64 = self.pixels.iter().map(|&p| p as f64).sum();
        Some(sum / self.pixels.len() as f64)
    }

    /// Écart-type de population des intensités
    pub fn std_dev(&self) -> Option<f64> {
        let mean = self.mean()?;
        let var = self
            .pixels
            .iter()
            .map(|&p| {
                let d = p as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / self.pixels.len() as f64;
        Some(var.sqrt())
    }
}
