/**
 * IMAGE PROCESSOR - Prétraitement avant détection
 *
 * RÔLE :
 * Réduire le bruit capteur sans écraser les contours, puis rehausser le
 * contraste local pour que les défauts peu marqués restent détectables.
 *
 * FONCTIONNEMENT :
 * - Conversion en luminance
 * - Filtre bilatéral : poids spatial gaussien × poids d'intensité gaussien
 * - Égalisation adaptative par tuiles avec écrêtage d'histogramme, tables
 *   interpolées bilinéairement entre centres de tuiles
 */

use super::{GrayImage, Image};
use crate::error::{ConfigError, PipelineError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Rayon de la fenêtre bilatérale (4 → fenêtre 9×9)
    pub denoise_radius: usize,
    pub sigma_space: f32,
    pub sigma_range: f32,
    pub clip_limit: f32,
    pub tile_grid: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            denoise_radius: 4,
            sigma_space: 75.0,
            sigma_range: 75.0,
            clip_limit: 2.0,
            tile_grid: 8,
        }
    }
}

/// Au-delà, la fenêtre bilatérale coûte plus qu'elle ne lisse
pub const MAX_DENOISE_RADIUS: usize = 32;

impl PreprocessConfig {
    /// Contrôle au démarrage des valeurs que `preprocess` refuserait à chaque image
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_DENOISE_RADIUS).contains(&self.denoise_radius) {
            return Err(ConfigError::Invalid(format!(
                "inspection.preprocessing.denoise_radius {} outside [1, {MAX_DENOISE_RADIUS}]",
                self.denoise_radius
            )));
        }
        let positive = |v: f32| v.is_finite() && v > 0.0;
        if !(positive(self.sigma_space) && positive(self.sigma_range)) {
            return Err(ConfigError::Invalid("inspection.preprocessing sigmas must be positive".into()));
        }
        if !positive(self.clip_limit) {
            return Err(ConfigError::Invalid(format!(
                "inspection.preprocessing.clip_limit {} must be positive",
                self.clip_limit
            )));
        }
        if self.tile_grid == 0 {
            return Err(ConfigError::Invalid("inspection.preprocessing.tile_grid must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImageProcessor {
    config: PreprocessConfig,
}

impl ImageProcessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    pub fn preprocess(&self, image: &Image) -> Result<GrayImage, PipelineError> {
        let cfg = &self.config;
        if cfg.tile_grid == 0 || !(cfg.clip_limit > 0.0) {
            return Err(PipelineError::PreprocessingFailed(format!(
                "invalid contrast settings: tile_grid={} clip_limit={}",
                cfg.tile_grid, cfg.clip_limit
            )));
        }
        if !(cfg.sigma_space > 0.0 && cfg.sigma_range > 0.0) {
            return Err(PipelineError::PreprocessingFailed("filter sigmas must be positive".into()));
        }
        let window = 2 * cfg.denoise_radius + 1;
        if image.width() < window || image.height() < window {
            return Err(PipelineError::PreprocessingFailed(format!(
                "image {}x{} smaller than {window}x{window} denoise window",
                image.width(),
                image.height()
            )));
        }

        let gray = image.to_gray();
        let smoothed = bilateral(&gray, cfg.denoise_radius, cfg.sigma_space, cfg.sigma_range);
        Ok(equalize_tiles(&smoothed, cfg.tile_grid, cfg.clip_limit))
    }
}

fn bilateral(src: &GrayImage, radius: usize, sigma_space: f32, sigma_range: f32) -> GrayImage {
    let (w, h) = (src.width(), src.height());
    let r = radius as isize;
    let side = 2 * radius + 1;

    let mut spatial = Vec::with_capacity(side * side);
    for dy in -r..=r {
        for dx in -r..=r {
            let d2 = (dx * dx + dy * dy) as f32;
            spatial.push((-d2 / (2.0 * sigma_space * sigma_space)).exp());
        }
    }
    let range: Vec<f32> = (0..256)
        .map(|d| {
            let d = d as f32;
            (-(d * d) / (2.0 * sigma_range * sigma_range)).exp()
        })
        .collect();

    let mut out = vec![0u8; w * h];
    for y in 0..h {
        for x in 0..w {
            let center = src.get(x, y);
            let mut acc = 0.0f32;
            let mut norm = 0.0f32;
            for (k, (dy, dx)) in (-r..=r).flat_map(|dy| (-r..=r).map(move |dx| (dy, dx))).enumerate() {
                // bords : réflexion
                let sx = reflect(x as isize + dx, w);
                let sy = reflect(y as isize + dy, h);
                let v = src.get(sx, sy);
                let weight = spatial[k] * range[center.abs_diff(v) as usize];
                acc += weight * v as f32;
                norm += weight;
            }
            out[y * w + x] = (acc / norm).round().clamp(0.0, 255.0) as u8;
        }
    }
    GrayImage::from_raw(w, h, out)
}

#[inline]
fn reflect(i: isize, len: usize) -> usize {
    let n = len as isize;
    let mut i = i;
    if i < 0 {
        i = -i;
    }
    if i >= n {
        i = 2 * (n - 1) - i;
    }
    i.clamp(0, n - 1) as usize
}

fn equalize_tiles(src: &GrayImage, grid: usize, clip_limit: f32) -> GrayImage {
    let (w, h) = (src.width(), src.height());
    let tile_w = w.div_ceil(grid.min(w));
    let tile_h = h.div_ceil(grid.min(h));
    // aucune tuile vide après arrondi
    let tiles_x = w.div_ceil(tile_w);
    let tiles_y = h.div_ceil(tile_h);

    let mut luts = vec![[0u8; 256]; tiles_x * tiles_y];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);
            let mut hist = [0f32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[src.get(x, y) as usize] += 1.0;
                }
            }
            let count = (x1.saturating_sub(x0) * y1.saturating_sub(y0)) as f32;
            luts[ty * tiles_x + tx] = clipped_lut(&mut hist, count, clip_limit);
        }
    }

    let mut out = vec![0u8; w * h];
    for y in 0..h {
        // position relative aux centres de tuiles
        let gy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
        let ty0 = gy.floor().clamp(0.0, (tiles_y - 1) as f32) as usize;
        let ty1 = (ty0 + 1).min(tiles_y - 1);
        let fy = (gy - ty0 as f32).clamp(0.0, 1.0);
        for x in 0..w {
            let gx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
            let tx0 = gx.floor().clamp(0.0, (tiles_x - 1) as f32) as usize;
            let tx1 = (tx0 + 1).min(tiles_x - 1);
            let fx = (gx - tx0 as f32).clamp(0.0, 1.0);

            let v = src.get(x, y) as usize;
            let tl = luts[ty0 * tiles_x + tx0][v] as f32;
            let tr = luts[ty0 * tiles_x + tx1][v] as f32;
            let bl = luts[ty1 * tiles_x + tx0][v] as f32;
            let br = luts[ty1 * tiles_x + tx1][v] as f32;
            let top = tl + (tr - tl) * fx;
            let bottom = bl + (br - bl) * fx;
            out[y * w + x] = (top + (bottom - top) * fy).round().clamp(0.0, 255.0) as u8;
        }
    }
    GrayImage::from_raw(w, h, out)
}

/// Histogramme écrêté puis excédent redistribué uniformément
fn clipped_lut(hist: &mut [f32; 256], count: f32, clip_limit: f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    if count <= 0.0 {
        for (i, slot) in lut.iter_mut().enumerate() {
            *slot = i as u8;
        }
        return lut;
    }

    let limit = (clip_limit * count / 256.0).max(1.0);
    let mut excess = 0.0f32;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let share = excess / 256.0;

    let scale = 255.0 / count;
    let mut cdf = 0.0f32;
    for (slot, bin) in lut.iter_mut().zip(hist.iter()) {
        cdf += bin + share;
        *slot = (cdf * scale).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(w: usize, h: usize, value: u8) -> Image {
        Image::gray(w, h, vec![value; w * h]).unwrap()
    }

    #[test]
    fn test_uniform_image_stays_uniform() {
        let out = ImageProcessor::default().preprocess(&uniform(64, 48, 128)).unwrap();
        let first = out.pixels()[0];
        assert!(out.pixels().iter().all(|&p| p == first));
        assert!(first.abs_diff(128) <= 4, "uniform gray drifted to {first}");
    }

    #[test]
    fn test_denoise_keeps_step_edge() {
        let (w, h) = (40, 40);
        let mut data = vec![40u8; w * h];
        for y in 0..h {
            for x in w / 2..w {
                data[y * w + x] = 200;
            }
        }
        let out = ImageProcessor::default().preprocess(&Image::gray(w, h, data).unwrap()).unwrap();
        let left = out.get(5, 20) as i32;
        let right = out.get(35, 20) as i32;
        assert!(right - left > 100, "edge contrast lost: {left} vs {right}");
    }

    #[test]
    fn test_impulse_noise_is_attenuated() {
        let (w, h) = (32, 32);
        let mut data = vec![120u8; w * h];
        data[16 * w + 16] = 140;
        let out = ImageProcessor::default().preprocess(&Image::gray(w, h, data).unwrap()).unwrap();
        let std = out.std_dev().unwrap();
        assert!(std < 1.0, "noise not smoothed, std = {std}");
    }

    #[test]
    fn test_too_small_image_fails() {
        let err = ImageProcessor::default().preprocess(&uniform(5, 5, 10)).unwrap_err();
        assert!(matches!(err, PipelineError::PreprocessingFailed(_)));
    }

    #[test]
    fn test_invalid_settings_fail() {
        let processor = ImageProcessor::new(PreprocessConfig { tile_grid: 0, ..Default::default() });
        assert!(processor.preprocess(&uniform(20, 20, 10)).is_err());
    }
}
