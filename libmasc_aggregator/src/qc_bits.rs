//! Quality control bitmasks.
//!
//! Each output level (image, particle, time bin) has its own table mapping a failure condition to a
//! bit position. Positions are only meaningful within their own table; a mask is typed by the table
//! it was built from so masks of different levels can never be mixed. Conditions are independent and
//! any number of them may be set at once.
use std::fmt::Display;
use std::marker::PhantomData;

use super::config::{ImageQualityParameters, TimeBinningParameters};
use super::features::ImageFeatureSet;
use super::quality::{rounded_focus, QualityVerdict};

/// The three independent bit tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QcContext {
    Image,
    Particle,
    TimeBin,
}

/// A named failure condition with a fixed position in one context's table
pub trait QcFlag: std::fmt::Debug + Copy + Eq + 'static {
    const CONTEXT: QcContext;
    /// Every flag of the table in bit order
    const ALL: &'static [Self];

    fn bit(self) -> u32;

    fn name(self) -> &'static str;

    fn mask(self) -> u32 {
        1 << self.bit()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageQcFlag {
    FallSpeedBad,
    CameraIdMissing,
    /// The extractor produced no measurements at all
    ImageMissing,
    NoParticleDetected,
    FailedQualityCheck,
    BelowWarningMinimum,
    AboveWarningMaximum,
}

impl QcFlag for ImageQcFlag {
    const CONTEXT: QcContext = QcContext::Image;
    const ALL: &'static [Self] = &[
        Self::FallSpeedBad,
        Self::CameraIdMissing,
        Self::ImageMissing,
        Self::NoParticleDetected,
        Self::FailedQualityCheck,
        Self::BelowWarningMinimum,
        Self::AboveWarningMaximum,
    ];

    fn bit(self) -> u32 {
        match self {
            Self::FallSpeedBad => 0,
            Self::CameraIdMissing => 1,
            Self::ImageMissing => 2,
            Self::NoParticleDetected => 3,
            Self::FailedQualityCheck => 4,
            Self::BelowWarningMinimum => 5,
            Self::AboveWarningMaximum => 6,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::FallSpeedBad => "fall_speed_bad",
            Self::CameraIdMissing => "camera_id_missing",
            Self::ImageMissing => "image_missing",
            Self::NoParticleDetected => "no_particle_detected",
            Self::FailedQualityCheck => "failed_quality_check",
            Self::BelowWarningMinimum => "below_warning_minimum",
            Self::AboveWarningMaximum => "above_warning_maximum",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticleQcFlag {
    FallSpeedBad,
    NotAggregated,
    QuorumNotMet,
    RainSuspected,
    /// Averaged from fewer views than the configured warning minimum
    FewViews,
    CameraCountMismatch,
}

impl QcFlag for ParticleQcFlag {
    const CONTEXT: QcContext = QcContext::Particle;
    const ALL: &'static [Self] = &[
        Self::FallSpeedBad,
        Self::NotAggregated,
        Self::QuorumNotMet,
        Self::RainSuspected,
        Self::FewViews,
        Self::CameraCountMismatch,
    ];

    fn bit(self) -> u32 {
        match self {
            Self::FallSpeedBad => 0,
            Self::NotAggregated => 1,
            Self::QuorumNotMet => 2,
            Self::RainSuspected => 3,
            Self::FewViews => 4,
            Self::CameraCountMismatch => 5,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::FallSpeedBad => "fall_speed_bad",
            Self::NotAggregated => "not_aggregated",
            Self::QuorumNotMet => "quorum_not_met",
            Self::RainSuspected => "rain_suspected",
            Self::FewViews => "few_views",
            Self::CameraCountMismatch => "camera_count_mismatch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBinQcFlag {
    AveragesMissing,
    BelowMinParticles,
    NoParticlesUsed,
    EmptyBin,
    AggregationError,
}

impl QcFlag for TimeBinQcFlag {
    const CONTEXT: QcContext = QcContext::TimeBin;
    const ALL: &'static [Self] = &[
        Self::AveragesMissing,
        Self::BelowMinParticles,
        Self::NoParticlesUsed,
        Self::EmptyBin,
        Self::AggregationError,
    ];

    fn bit(self) -> u32 {
        match self {
            Self::AveragesMissing => 0,
            Self::BelowMinParticles => 1,
            Self::NoParticlesUsed => 2,
            Self::EmptyBin => 3,
            Self::AggregationError => 4,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::AveragesMissing => "averages_missing",
            Self::BelowMinParticles => "below_min_particles",
            Self::NoParticlesUsed => "no_particles_used",
            Self::EmptyBin => "empty_bin",
            Self::AggregationError => "aggregation_error",
        }
    }
}

/// An OR-combination of the flags of one table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QcBitmask<F: QcFlag> {
    bits: u32,
    table: PhantomData<F>,
}

impl<F: QcFlag> Default for QcBitmask<F> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<F: QcFlag> QcBitmask<F> {
    pub fn empty() -> Self {
        Self {
            bits: 0,
            table: PhantomData,
        }
    }

    /// Set the bit of every condition which is true
    pub fn encode(conditions: &[(F, bool)]) -> Self {
        let mut mask = Self::empty();
        for (flag, is_set) in conditions {
            if *is_set {
                mask.set(*flag);
            }
        }
        mask
    }

    pub fn set(&mut self, flag: F) {
        self.bits |= flag.mask();
    }

    pub fn contains(&self, flag: F) -> bool {
        self.bits & flag.mask() != 0
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn context(&self) -> QcContext {
        F::CONTEXT
    }

    /// The flags which are set, in bit order
    pub fn flags(&self) -> Vec<F> {
        F::ALL
            .iter()
            .copied()
            .filter(|flag| self.contains(*flag))
            .collect()
    }
}

impl<F: QcFlag> Display for QcBitmask<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.bits)
    }
}

/// Describe a table as `bit name` pairs, e.g. `0 fall_speed_bad, 1 not_aggregated, ...`
pub fn legend<F: QcFlag>() -> String {
    F::ALL
        .iter()
        .map(|flag| format!("{} {}", flag.bit(), flag.name()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Missing, negative, or faster than the binning limit
pub fn is_fall_speed_bad(fall_speed_mps: Option<f64>, max_fall_speed_mps: f64) -> bool {
    match fall_speed_mps {
        Some(speed) => speed < 0.0 || speed > max_fall_speed_mps,
        None => true,
    }
}

/// Per-image mask. The warning limits are the gate thresholds, plus a dedicated mean intensity
/// limit since the gate only checks the brightest pixel. A missing value never triggers a warning
/// bit since it is already covered by the image-missing and quality bits.
pub fn image_qc_bits(
    image: &ImageFeatureSet,
    verdict: &QualityVerdict,
    fall_speed_mps: Option<f64>,
    quality: &ImageQualityParameters,
    binning: &TimeBinningParameters,
) -> QcBitmask<ImageQcFlag> {
    let min_size_mm = quality.min_flake_size_mm();
    let [bottom_min, bottom_max] = quality.bottom_location_range_mm;
    let below = |value: Option<f64>, limit: f64| value.is_some_and(|v| v < limit);
    let above = |value: Option<f64>, limit: f64| value.is_some_and(|v| v > limit);

    let below_warning = below(image.cross_section_mm2, min_size_mm * min_size_mm)
        || below(image.mean_intensity, quality.warn_min_mean_intensity)
        || below(image.intensity_variability, quality.min_intensity_variability)
        || below(image.roi_focus.map(rounded_focus), quality.focus_threshold)
        || below(image.roi_bottom_mm, bottom_min);
    let above_warning = above(image.edge_touch_mm, quality.max_edge_touch_length_mm())
        || above(image.roi_bottom_mm, bottom_max);

    QcBitmask::encode(&[
        (
            ImageQcFlag::FallSpeedBad,
            is_fall_speed_bad(fall_speed_mps, binning.max_fall_speed_mps),
        ),
        (ImageQcFlag::CameraIdMissing, image.camera_id.is_none()),
        (ImageQcFlag::ImageMissing, image.is_blank()),
        (
            ImageQcFlag::NoParticleDetected,
            matches!(image.num_objects, None | Some(0)),
        ),
        (ImageQcFlag::FailedQualityCheck, !verdict.passed_all_checks()),
        (ImageQcFlag::BelowWarningMinimum, below_warning),
        (ImageQcFlag::AboveWarningMaximum, above_warning),
    ])
}

/// Per-time-bin mask
pub fn time_bin_qc_bits(
    total_particle_count: usize,
    num_used_for_average: usize,
    has_averages: bool,
    has_error: bool,
    min_particles_per_bin: usize,
) -> QcBitmask<TimeBinQcFlag> {
    QcBitmask::encode(&[
        (TimeBinQcFlag::AveragesMissing, !has_averages),
        (
            TimeBinQcFlag::BelowMinParticles,
            num_used_for_average < min_particles_per_bin,
        ),
        (TimeBinQcFlag::NoParticlesUsed, num_used_for_average == 0),
        (TimeBinQcFlag::EmptyBin, total_particle_count == 0),
        (TimeBinQcFlag::AggregationError, has_error),
    ])
}
