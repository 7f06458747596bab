//! Gamma correction and guarded color remapping.
//!
//! A [`ColorCorrector`] is built once from a [`ColorConfig`] and never
//! mutated. Construction precomputes everything the per-pixel loop needs:
//!
//! - a 256-entry gamma lookup table,
//! - an exact `match_color -> replacement` map,
//! - a [`ToleranceIndex`] of colors within tolerance of some rule that also
//!   pass that rule's [`HueGuard`].
//!
//! Remap decisions are made on the source pixel. A remapped pixel gets the
//! replacement color verbatim; every other pixel goes through the gamma table.

use std::collections::HashMap;

use card_export_cache::PixelBuffer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ColorError;

/// Tolerances above this fall back to scanning the rules per pixel
pub const MAX_PRECOMPUTED_TOLERANCE: u8 = 48;

/// Largest estimated number of colors the precomputed index may hold, summed
/// over all rules
pub const MAX_PRECOMPUTED_ENTRIES: usize = 262_144;

/// An 8-bit RGB color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u8; 3]", into = "[u8; 3]")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub const fn channels(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }

    /// Squared Euclidean distance in RGB space
    pub fn distance_sq(self, other: Rgb) -> u32 {
        let dr = i32::from(self.r) - i32::from(other.r);
        let dg = i32::from(self.g) - i32::from(other.g);
        let db = i32::from(self.b) - i32::from(other.b);
        (dr * dr + dg * dg + db * db) as u32
    }

    /// Difference between the largest and smallest channel
    pub fn spread(self) -> u8 {
        let c = self.channels();
        let max = c.iter().copied().max().unwrap_or(0);
        let min = c.iter().copied().min().unwrap_or(0);
        max - min
    }
}

impl From<[u8; 3]> for Rgb {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Self::new(r, g, b)
    }
}

impl From<Rgb> for [u8; 3] {
    fn from(color: Rgb) -> Self {
        color.channels()
    }
}

/// Replace `match_color` (and, within tolerance, its neighbours) with
/// `replacement`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorRule {
    pub match_color: Rgb,
    pub replacement: Rgb,
}

impl ColorRule {
    pub fn new(match_color: Rgb, replacement: Rgb) -> Self {
        Self {
            match_color,
            replacement,
        }
    }
}

/// Hue-family check applied to tolerance matches.
///
/// Keeps a tolerance sphere around a saturated accent color from swallowing
/// grays and other hues that happen to be close in RGB distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HueGuard {
    /// A dominant channel must exceed both others by more than this
    pub dominance_margin: u8,
    /// A dominant channel must be above this level
    pub min_dominant_level: u8,
    /// Colors whose channel spread is below this are near-neutral
    pub neutral_spread: u8,
}

impl Default for HueGuard {
    fn default() -> Self {
        Self {
            dominance_margin: 50,
            min_dominant_level: 180,
            neutral_spread: 24,
        }
    }
}

/// Which pixels a rule may claim through a tolerance match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleFamily {
    /// Index of the channel that dominates the rule color
    Dominant(usize),
    Neutral,
    Mixed,
}

impl HueGuard {
    pub fn is_near_neutral(&self, color: Rgb) -> bool {
        color.spread() < self.neutral_spread
    }

    /// Channel (0 = red, 1 = green, 2 = blue) exceeding both others by more
    /// than `dominance_margin`
    pub fn dominant_channel(&self, color: Rgb) -> Option<usize> {
        let c = color.channels().map(u16::from);
        let margin = u16::from(self.dominance_margin);
        (0..3).find(|&i| (0..3).all(|j| j == i || c[i] > c[j] + margin))
    }

    fn family(&self, rule_color: Rgb) -> RuleFamily {
        if self.is_near_neutral(rule_color) {
            RuleFamily::Neutral
        } else if let Some(channel) = self.dominant_channel(rule_color) {
            RuleFamily::Dominant(channel)
        } else {
            RuleFamily::Mixed
        }
    }

    fn admits_family(&self, family: RuleFamily, pixel: Rgb) -> bool {
        let neutral = self.is_near_neutral(pixel);
        match family {
            RuleFamily::Dominant(channel) => {
                !neutral
                    && self.dominant_channel(pixel) == Some(channel)
                    && pixel.channels()[channel] > self.min_dominant_level
            }
            RuleFamily::Neutral => neutral,
            RuleFamily::Mixed => !neutral,
        }
    }

    /// Whether a pixel is plausibly the same hue family as `rule_color`
    pub fn admits(&self, rule_color: Rgb, pixel: Rgb) -> bool {
        self.admits_family(self.family(rule_color), pixel)
    }
}

/// Color correction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorConfig {
    pub gamma: f32,
    /// Maximum RGB distance for a tolerance match (0 = exact only)
    pub tolerance: u8,
    pub rules: Vec<ColorRule>,
    pub guard: HueGuard,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            gamma: 1.0,
            tolerance: 0,
            rules: Vec::new(),
            guard: HueGuard::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    color: Rgb,
    family: RuleFamily,
}

/// Nearest admitted rule within tolerance; earlier rules win ties
fn nearest_rule(
    candidates: &[Candidate],
    guard: &HueGuard,
    tolerance_sq: u32,
    pixel: Rgb,
) -> Option<usize> {
    let mut best: Option<(usize, u32)> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        let distance = candidate.color.distance_sq(pixel);
        if distance > tolerance_sq || !guard.admits_family(candidate.family, pixel) {
            continue;
        }
        if best.map_or(true, |(_, d)| distance < d) {
            best = Some((index, distance));
        }
    }
    best.map(|(index, _)| index)
}

/// Lookup from a pixel color to the rule that claims it by tolerance.
///
/// For small tolerances every guarded color inside every rule's sphere is
/// enumerated up front, as long as the spheres together stay under
/// [`MAX_PRECOMPUTED_ENTRIES`]. Otherwise lookups scan the rules per pixel
/// with the same nearest-wins semantics.
#[derive(Debug, Clone)]
pub struct ToleranceIndex {
    candidates: Vec<Candidate>,
    guard: HueGuard,
    tolerance_sq: u32,
    precomputed: Option<HashMap<Rgb, usize>>,
}

impl ToleranceIndex {
    pub fn build(rules: &[ColorRule], tolerance: u8, guard: HueGuard) -> Self {
        Self::build_with_limit(rules, tolerance, guard, MAX_PRECOMPUTED_TOLERANCE)
    }

    fn build_with_limit(rules: &[ColorRule], tolerance: u8, guard: HueGuard, limit: u8) -> Self {
        let candidates: Vec<Candidate> = if tolerance == 0 {
            Vec::new()
        } else {
            rules
                .iter()
                .map(|rule| Candidate {
                    color: rule.match_color,
                    family: guard.family(rule.match_color),
                })
                .collect()
        };
        let tolerance_sq = u32::from(tolerance) * u32::from(tolerance);

        let precomputed = (!candidates.is_empty()
            && tolerance <= limit
            && estimated_entries(&candidates, tolerance) <= MAX_PRECOMPUTED_ENTRIES)
            .then(|| Self::enumerate(&candidates, &guard, tolerance, tolerance_sq));

        Self {
            candidates,
            guard,
            tolerance_sq,
            precomputed,
        }
    }

    fn enumerate(
        candidates: &[Candidate],
        guard: &HueGuard,
        tolerance: u8,
        tolerance_sq: u32,
    ) -> HashMap<Rgb, usize> {
        let mut claimed: HashMap<Rgb, (usize, u32)> = HashMap::new();
        let span = |c: u8| {
            let lo = c.saturating_sub(tolerance);
            let hi = c.saturating_add(tolerance);
            lo..=hi
        };

        for (index, candidate) in candidates.iter().enumerate() {
            let center = candidate.color;
            for r in span(center.r) {
                for g in span(center.g) {
                    for b in span(center.b) {
                        let pixel = Rgb::new(r, g, b);
                        let distance = center.distance_sq(pixel);
                        if distance > tolerance_sq
                            || !guard.admits_family(candidate.family, pixel)
                        {
                            continue;
                        }
                        claimed
                            .entry(pixel)
                            .and_modify(|best| {
                                if distance < best.1 {
                                    *best = (index, distance);
                                }
                            })
                            .or_insert((index, distance));
                    }
                }
            }
        }

        claimed.into_iter().map(|(color, (index, _))| (color, index)).collect()
    }

    /// Index of the rule claiming `pixel`, if any
    pub fn rule_for(&self, pixel: Rgb) -> Option<usize> {
        match &self.precomputed {
            Some(map) => map.get(&pixel).copied(),
            None if self.candidates.is_empty() => None,
            None => nearest_rule(&self.candidates, &self.guard, self.tolerance_sq, pixel),
        }
    }

    pub fn is_precomputed(&self) -> bool {
        self.precomputed.is_some()
    }

    /// Number of precomputed colors (0 when scanning)
    pub fn len(&self) -> usize {
        self.precomputed.as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Approximate color count inside every rule's sphere, clipped to the RGB cube
fn estimated_entries(candidates: &[Candidate], tolerance: u8) -> usize {
    let span = |c: u8| usize::from(c.saturating_add(tolerance) - c.saturating_sub(tolerance)) + 1;
    candidates
        .iter()
        .map(|candidate| {
            let Rgb { r, g, b } = candidate.color;
            // A sphere fills about pi/6 of its bounding cube
            span(r) * span(g) * span(b) * 52 / 100
        })
        .sum()
}

fn gamma_table(gamma: f32) -> [u8; 256] {
    let mut table = [0u8; 256];
    let exponent = 1.0 / f64::from(gamma);
    for (i, entry) in table.iter_mut().enumerate() {
        let normalized = i as f64 / 255.0;
        *entry = (255.0 * normalized.powf(exponent)).round().clamp(0.0, 255.0) as u8;
    }
    table
}

/// Immutable gamma + remap transform
#[derive(Debug, Clone)]
pub struct ColorCorrector {
    config: ColorConfig,
    lut: [u8; 256],
    exact: HashMap<Rgb, Rgb>,
    tolerance: ToleranceIndex,
    fingerprint: u64,
}

impl ColorCorrector {
    pub fn new(config: ColorConfig) -> Result<Self, ColorError> {
        if !config.gamma.is_finite() || config.gamma <= 0.0 {
            return Err(ColorError::InvalidGamma(config.gamma));
        }
        Ok(Self::build(config))
    }

    /// A corrector that leaves pixels untouched
    pub fn identity() -> Self {
        Self::build(ColorConfig::default())
    }

    fn build(config: ColorConfig) -> Self {
        let mut exact = HashMap::with_capacity(config.rules.len());
        for rule in &config.rules {
            exact.entry(rule.match_color).or_insert(rule.replacement);
        }
        let tolerance = ToleranceIndex::build(&config.rules, config.tolerance, config.guard);
        let fingerprint = Self::digest(&config);

        tracing::debug!(
            gamma = config.gamma,
            rules = config.rules.len(),
            tolerance = config.tolerance,
            precomputed = tolerance.len(),
            "built color corrector"
        );

        Self {
            lut: gamma_table(config.gamma),
            exact,
            tolerance,
            fingerprint,
            config,
        }
    }

    fn digest(config: &ColorConfig) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(config.gamma.to_bits().to_le_bytes());
        hasher.update([config.tolerance]);
        hasher.update([
            config.guard.dominance_margin,
            config.guard.min_dominant_level,
            config.guard.neutral_spread,
        ]);
        hasher.update((config.rules.len() as u64).to_le_bytes());
        for rule in &config.rules {
            hasher.update(rule.match_color.channels());
            hasher.update(rule.replacement.channels());
        }
        let hash = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&hash[..8]);
        u64::from_le_bytes(head)
    }

    pub fn config(&self) -> &ColorConfig {
        &self.config
    }

    /// Stable digest of every setting that affects output pixels
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// True when [`correct`](Self::correct) only copies
    pub fn is_identity(&self) -> bool {
        self.config.gamma == 1.0 && self.config.rules.is_empty()
    }

    pub fn tolerance_index(&self) -> &ToleranceIndex {
        &self.tolerance
    }

    /// Replacement for a source color, if a rule claims it
    pub fn remap(&self, color: Rgb) -> Option<Rgb> {
        if self.config.rules.is_empty() {
            return None;
        }
        self.exact.get(&color).copied().or_else(|| {
            self.tolerance
                .rule_for(color)
                .map(|index| self.config.rules[index].replacement)
        })
    }

    /// Corrected value of a single opaque color
    pub fn correct_color(&self, color: Rgb) -> Rgb {
        self.remap(color).unwrap_or_else(|| {
            Rgb::new(
                self.lut[usize::from(color.r)],
                self.lut[usize::from(color.g)],
                self.lut[usize::from(color.b)],
            )
        })
    }

    /// Produce a corrected copy of `input`. The input is never modified.
    pub fn correct(&self, input: &PixelBuffer) -> Result<PixelBuffer, ColorError> {
        let (width, height) = input.dimensions();
        if input.is_empty() {
            return Err(ColorError::InvalidImage { width, height });
        }
        if self.is_identity() {
            return Ok(input.clone());
        }

        let bpp = input.format().bytes_per_pixel();
        let remapping = !self.config.rules.is_empty();
        let mut bytes = input.bytes().to_vec();

        for px in bytes.chunks_exact_mut(bpp) {
            let transparent = bpp == 4 && px[3] == 0;
            if remapping && !transparent {
                if let Some(replacement) = self.remap(Rgb::new(px[0], px[1], px[2])) {
                    px[..3].copy_from_slice(&replacement.channels());
                    continue;
                }
            }
            for channel in &mut px[..3] {
                *channel = self.lut[usize::from(*channel)];
            }
        }

        PixelBuffer::new(width, height, input.format(), bytes)
            .map_err(|_| ColorError::InvalidImage { width, height })
    }
}
