//! Image analysis: mirror symmetry scores plus an edge-density complexity
//! measure, combined into a single fitness scalar.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::vm::Image;

/// Canny hysteresis thresholds applied to the L1 gradient magnitude.
const CANNY_LOW: f64 = 50.0;
const CANNY_HIGH: f64 = 150.0;

/// Analyzer configuration: per-axis enables and fitness weights.
///
/// The enables gate only the fitness combination; the overall symmetry score
/// always averages all four axis scores.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyzerConfig {
    pub enable_horizontal: bool,
    pub enable_vertical: bool,
    pub enable_diagonal: bool,
    pub enable_rotational: bool,
    pub enable_complexity: bool,
    pub horizontal_weight: f64,
    pub vertical_weight: f64,
    pub diagonal_weight: f64,
    pub rotational_weight: f64,
    pub complexity_weight: f64,
    pub histogram_bins: u32,
    pub noise_threshold: f64,
    pub normalize_scores: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            enable_horizontal: true,
            enable_vertical: true,
            enable_diagonal: true,
            enable_rotational: true,
            enable_complexity: true,
            horizontal_weight: 0.25,
            vertical_weight: 0.25,
            diagonal_weight: 0.20,
            rotational_weight: 0.20,
            complexity_weight: 0.10,
            histogram_bins: 64,
            noise_threshold: 0.05,
            normalize_scores: true,
        }
    }
}

/// All scores are in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SymmetryResult {
    pub horizontal: f64,
    pub vertical: f64,
    pub diagonal: f64,
    pub rotational: f64,
    /// Mean of the four axis scores, ignoring the per-axis enables.
    pub overall: f64,
    pub complexity: f64,
    /// Weighted sum of the enabled components, clamped to `[0, 1]`.
    pub fitness: f64,
}

/// Pure image-to-score reducer. Cheap to clone; holds only configuration.
#[derive(Debug, Clone)]
pub struct SymmetryAnalyzer {
    config: AnalyzerConfig,
}

impl SymmetryAnalyzer {
    #[must_use]
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Scores `image` using this analyzer's configuration.
    #[must_use]
    pub fn analyze(&self, image: &Image) -> SymmetryResult {
        Self::analyze_with(image, &self.config)
    }

    /// Scores `image` with an explicit configuration.
    #[must_use]
    pub fn analyze_with(image: &Image, config: &AnalyzerConfig) -> SymmetryResult {
        let mut result = SymmetryResult {
            horizontal: horizontal_symmetry(image),
            vertical: vertical_symmetry(image),
            diagonal: diagonal_symmetry(image),
            rotational: rotational_symmetry(image),
            complexity: complexity(image),
            ..SymmetryResult::default()
        };
        result.overall =
            (result.horizontal + result.vertical + result.diagonal + result.rotational) / 4.0;
        result.fitness = fitness(&result, config);
        result
    }

    /// Multi-line textual rendering of a result, for logs and clients.
    #[must_use]
    pub fn describe(result: &SymmetryResult) -> String {
        let mut text = String::from("Symmetry analysis:\n");
        let _ = writeln!(text, "  overall:    {:.3}", result.overall);
        let _ = writeln!(text, "  horizontal: {:.3}", result.horizontal);
        let _ = writeln!(text, "  vertical:   {:.3}", result.vertical);
        let _ = writeln!(text, "  diagonal:   {:.3}", result.diagonal);
        let _ = writeln!(text, "  rotational: {:.3}", result.rotational);
        let _ = writeln!(text, "  complexity: {:.3}", result.complexity);
        let _ = writeln!(text, "  fitness:    {:.3}", result.fitness);
        text
    }
}

fn fitness(result: &SymmetryResult, config: &AnalyzerConfig) -> f64 {
    let mut fitness = 0.0;
    if config.enable_horizontal {
        fitness += result.horizontal * config.horizontal_weight;
    }
    if config.enable_vertical {
        fitness += result.vertical * config.vertical_weight;
    }
    if config.enable_diagonal {
        fitness += result.diagonal * config.diagonal_weight;
    }
    if config.enable_rotational {
        fitness += result.rotational * config.rotational_weight;
    }
    if config.enable_complexity {
        fitness += result.complexity * config.complexity_weight;
    }
    fitness.clamp(0.0, 1.0)
}

/// Mean absolute channel difference mapped onto a similarity in `[0, 1]`.
fn similarity(total_diff: f64, comparisons: u64) -> f64 {
    if comparisons == 0 {
        return 0.0;
    }
    (1.0 - total_diff / comparisons as f64 / 255.0).max(0.0)
}

fn pixel_diff(a: [u8; 3], b: [u8; 3]) -> f64 {
    (0..3)
        .map(|c| f64::from((i32::from(a[c]) - i32::from(b[c])).abs()))
        .sum()
}

fn horizontal_symmetry(image: &Image) -> f64 {
    let (w, h) = (image.width(), image.height());
    if h < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    let mut comparisons = 0u64;
    for y in 0..h / 2 {
        let mirror = h - 1 - y;
        for x in 0..w {
            total += pixel_diff(image.pixel(x, y), image.pixel(x, mirror));
            comparisons += 3;
        }
    }
    similarity(total, comparisons)
}

fn vertical_symmetry(image: &Image) -> f64 {
    let (w, h) = (image.width(), image.height());
    if w < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    let mut comparisons = 0u64;
    for y in 0..h {
        for x in 0..w / 2 {
            let mirror = w - 1 - x;
            total += pixel_diff(image.pixel(x, y), image.pixel(mirror, y));
            comparisons += 3;
        }
    }
    similarity(total, comparisons)
}

/// Compares `(i, j)` with `(j, i)` over the square prefix of the image.
fn diagonal_symmetry(image: &Image) -> f64 {
    let (w, h) = (image.width(), image.height());
    if w < 2 || h < 2 {
        return 0.0;
    }
    let side = w.min(h);
    let mut total = 0.0;
    let mut comparisons = 0u64;
    for i in 0..side {
        for j in i + 1..side {
            total += pixel_diff(image.pixel(j, i), image.pixel(i, j));
            comparisons += 3;
        }
    }
    similarity(total, comparisons)
}

/// 180° rotation: compares the upper-left quadrant against its point
/// reflection through the center.
fn rotational_symmetry(image: &Image) -> f64 {
    let (w, h) = (image.width(), image.height());
    if w < 2 || h < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    let mut comparisons = 0u64;
    for y in 0..h / 2 {
        for x in 0..w / 2 {
            total += pixel_diff(image.pixel(x, y), image.pixel(w - 1 - x, h - 1 - y));
            comparisons += 3;
        }
    }
    similarity(total, comparisons)
}

/// Edge density: fraction of Canny edge pixels, scaled by 10 and clamped.
fn complexity(image: &Image) -> f64 {
    let (w, h) = (image.width() as usize, image.height() as usize);
    if w == 0 || h == 0 {
        return 0.0;
    }
    let edges = canny_edges(image);
    let edge_pixels = edges.iter().filter(|&&edge| edge).count();
    let total_pixels = w * h;
    ((edge_pixels as f64 / total_pixels as f64) * 10.0).min(1.0)
}

fn grayscale(image: &Image) -> Vec<f64> {
    image
        .data()
        .chunks_exact(3)
        .map(|p| 0.299 * f64::from(p[0]) + 0.587 * f64::from(p[1]) + 0.114 * f64::from(p[2]))
        .collect()
}

/// Canny edge detector: Sobel gradients on the grayscale image, non-maximum
/// suppression along the quantized gradient direction, then double-threshold
/// hysteresis with thresholds 50/150 on the L1 magnitude.
fn canny_edges(image: &Image) -> Vec<bool> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    if w < 3 || h < 3 {
        return vec![false; w * h];
    }
    let gray = grayscale(image);

    let mut magnitude = vec![0.0f64; w * h];
    let mut direction = vec![0u8; w * h];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let at = |dx: isize, dy: isize| -> f64 {
                gray[(y as isize + dy) as usize * w + (x as isize + dx) as usize]
            };
            let gx = -at(-1, -1) - 2.0 * at(-1, 0) - at(-1, 1)
                + at(1, -1)
                + 2.0 * at(1, 0)
                + at(1, 1);
            let gy = -at(-1, -1) - 2.0 * at(0, -1) - at(1, -1)
                + at(-1, 1)
                + 2.0 * at(0, 1)
                + at(1, 1);
            let idx = y * w + x;
            magnitude[idx] = gx.abs() + gy.abs();
            direction[idx] = quantize_direction(gx, gy);
        }
    }

    // Non-maximum suppression: keep only local maxima along the gradient.
    let mut strong = Vec::new();
    let mut state = vec![EdgeState::None; w * h];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let idx = y * w + x;
            let mag = magnitude[idx];
            if mag < CANNY_LOW {
                continue;
            }
            let (dx, dy): (isize, isize) = match direction[idx] {
                0 => (1, 0),
                1 => (1, 1),
                2 => (0, 1),
                _ => (1, -1),
            };
            let ahead = magnitude[(y as isize + dy) as usize * w + (x as isize + dx) as usize];
            let behind = magnitude[(y as isize - dy) as usize * w + (x as isize - dx) as usize];
            if mag < ahead || mag < behind {
                continue;
            }
            if mag >= CANNY_HIGH {
                state[idx] = EdgeState::Strong;
                strong.push(idx);
            } else {
                state[idx] = EdgeState::Weak;
            }
        }
    }

    // Hysteresis: weak pixels survive only when connected to a strong one.
    let mut edges = vec![false; w * h];
    let mut stack = strong;
    while let Some(idx) = stack.pop() {
        if edges[idx] {
            continue;
        }
        edges[idx] = true;
        let (x, y) = (idx % w, idx / w);
        for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
            for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                let neighbor = ny * w + nx;
                if !edges[neighbor] && state[neighbor] != EdgeState::None {
                    stack.push(neighbor);
                }
            }
        }
    }
    edges
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    None,
    Weak,
    Strong,
}

/// Quantizes a gradient vector into one of four sampling directions.
fn quantize_direction(gx: f64, gy: f64) -> u8 {
    let angle = gy.atan2(gx).to_degrees();
    let angle = if angle < 0.0 { angle + 180.0 } else { angle };
    if !(22.5..157.5).contains(&angle) {
        0 // horizontal gradient: compare left/right
    } else if angle < 67.5 {
        1
    } else if angle < 112.5 {
        2 // vertical gradient: compare up/down
    } else {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(width: u32, height: u32, color: [u8; 3]) -> Image {
        let mut image = Image::new(width, height);
        for y in 0..height as i32 {
            for x in 0..width as i32 {
                image.set_pixel(x, y, color);
            }
        }
        image
    }

    #[test]
    fn uniform_image_is_perfectly_symmetric() {
        let image = filled(32, 32, [120, 30, 200]);
        let result = SymmetryAnalyzer::new(AnalyzerConfig::default()).analyze(&image);
        assert_eq!(result.horizontal, 1.0);
        assert_eq!(result.vertical, 1.0);
        assert_eq!(result.diagonal, 1.0);
        assert_eq!(result.rotational, 1.0);
        assert_eq!(result.overall, 1.0);
        assert_eq!(result.complexity, 0.0);
    }

    #[test]
    fn half_and_half_image_breaks_vertical_symmetry() {
        let mut image = Image::new(32, 32);
        for y in 0..32 {
            for x in 0..16 {
                image.set_pixel(x, y, [255, 255, 255]);
            }
        }
        let result = SymmetryAnalyzer::new(AnalyzerConfig::default()).analyze(&image);
        // Left-white/right-black mirrors perfectly top-to-bottom but not
        // left-to-right.
        assert_eq!(result.horizontal, 1.0);
        assert_eq!(result.vertical, 0.0);
    }

    #[test]
    fn degenerate_images_score_zero_per_axis() {
        let row = filled(8, 1, [10, 10, 10]);
        let result = SymmetryAnalyzer::new(AnalyzerConfig::default()).analyze(&row);
        assert_eq!(result.horizontal, 0.0);
        assert_eq!(result.diagonal, 0.0);
        assert_eq!(result.rotational, 0.0);

        let single = filled(1, 1, [10, 10, 10]);
        let result = SymmetryAnalyzer::new(AnalyzerConfig::default()).analyze(&single);
        assert_eq!(result.overall, 0.0);
        assert_eq!(result.fitness, 0.0);
    }

    #[test]
    fn scores_stay_in_unit_interval() {
        let mut image = Image::new(16, 16);
        for y in 0..16 {
            for x in 0..16 {
                let value = ((x * 37 + y * 101) % 256) as u8;
                image.set_pixel(x, y, [value, value.wrapping_mul(3), value ^ 0x55]);
            }
        }
        let result = SymmetryAnalyzer::new(AnalyzerConfig::default()).analyze(&image);
        for score in [
            result.horizontal,
            result.vertical,
            result.diagonal,
            result.rotational,
            result.overall,
            result.complexity,
            result.fitness,
        ] {
            assert!((0.0..=1.0).contains(&score), "score {score} out of range");
        }
    }

    #[test]
    fn sharp_boundary_registers_complexity() {
        let mut image = Image::new(64, 64);
        for y in 0..64 {
            for x in 0..32 {
                image.set_pixel(x, y, [255, 255, 255]);
            }
        }
        let result = SymmetryAnalyzer::new(AnalyzerConfig::default()).analyze(&image);
        assert!(result.complexity > 0.0, "hard edge should produce edges");
    }

    #[test]
    fn disabled_axes_drop_out_of_fitness_but_not_overall() {
        let mut image = Image::new(32, 32);
        for y in 0..32 {
            for x in 0..16 {
                image.set_pixel(x, y, [255, 0, 0]);
            }
        }
        let full = AnalyzerConfig::default();
        let mut horizontal_only = AnalyzerConfig {
            enable_vertical: false,
            enable_diagonal: false,
            enable_rotational: false,
            enable_complexity: false,
            ..AnalyzerConfig::default()
        };
        horizontal_only.horizontal_weight = 1.0;

        let scored_full = SymmetryAnalyzer::analyze_with(&image, &full);
        let scored_partial = SymmetryAnalyzer::analyze_with(&image, &horizontal_only);
        assert_eq!(scored_full.overall, scored_partial.overall);
        assert_eq!(scored_partial.fitness, scored_partial.horizontal);
    }

    #[test]
    fn fitness_is_clamped() {
        let image = filled(16, 16, [200, 200, 200]);
        let config = AnalyzerConfig {
            horizontal_weight: 5.0,
            ..AnalyzerConfig::default()
        };
        let result = SymmetryAnalyzer::analyze_with(&image, &config);
        assert_eq!(result.fitness, 1.0);
    }

    #[test]
    fn describe_mentions_every_score() {
        let image = filled(8, 8, [1, 2, 3]);
        let result = SymmetryAnalyzer::new(AnalyzerConfig::default()).analyze(&image);
        let text = SymmetryAnalyzer::describe(&result);
        for label in ["overall", "horizontal", "vertical", "diagonal", "rotational", "complexity", "fitness"] {
            assert!(text.contains(label));
        }
    }
}
