use std::fmt::Display;

use time::PrimitiveDateTime;

use super::config::Config;
use super::constants::RAIN_QUORUM;
use super::features::{AveragedFields, ImageFeatureSet};
use super::qc_bits::{is_fall_speed_bad, ParticleQcFlag, QcBitmask};
use super::quality::{ImageQualityGate, QualityVerdict};

/// One camera view of a particle together with its quality verdict
#[derive(Debug, Clone, PartialEq)]
pub struct CameraImage {
    pub features: ImageFeatureSet,
    pub verdict: QualityVerdict,
}

impl CameraImage {
    pub fn evaluate(features: ImageFeatureSet, gate: &ImageQualityGate) -> Self {
        let verdict = gate.evaluate(&features);
        Self { features, verdict }
    }
}

/// The result of averaging several inputs.
///
/// Only exists when at least one input contributed, so the averaged fields are always present
/// together and `num_used_for_average` is never zero.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedFeatures {
    pub averages: AveragedFields,
    pub flatness: Option<f64>,
    pub num_used_for_average: usize,
    /// Logical AND of the verdicts of every contributing input
    pub quality: QualityVerdict,
}

/// Why a particle was left without aggregated features. None of these are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MalformedInput,
    CameraCountMismatch { expected: usize, found: usize },
    QuorumNotMet { passed: usize },
    RainSuspected { passed: usize, clear: usize },
    NoGoodInputs,
}

impl Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedInput => write!(f, "no images to aggregate"),
            Self::CameraCountMismatch { expected, found } => {
                write!(f, "expected {expected} camera images, found {found}")
            }
            Self::QuorumNotMet { passed } => write!(
                f,
                "only {passed} images passed quality, need at least {RAIN_QUORUM}"
            ),
            Self::RainSuspected { passed, clear } => write!(
                f,
                "only {clear} of {passed} passing images look like a single dim object"
            ),
            Self::NoGoodInputs => write!(f, "no input was good for averaging"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParticleAggregation {
    Aggregated(AggregatedFeatures),
    NotAggregated(Rejection),
}

impl ParticleAggregation {
    pub fn features(&self) -> Option<&AggregatedFeatures> {
        match self {
            Self::Aggregated(features) => Some(features),
            Self::NotAggregated(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Aggregated(_) => None,
            Self::NotAggregated(rejection) => Some(rejection),
        }
    }

    pub fn is_built_from_average(&self) -> bool {
        matches!(self, Self::Aggregated(_))
    }
}

/// Whether averaging combines camera images of one particle or particles of one time bin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AverageMode {
    Images,
    Particles,
}

/// Anything that can take part in an average
pub trait AverageInput {
    fn averaged_fields(&self) -> Option<AveragedFields>;
    fn flatness(&self) -> Option<f64>;
    fn verdict(&self) -> QualityVerdict;

    /// All averaged fields present and passing quality. When averaging particles the flatness must
    /// also be known.
    fn is_good_for_averaging(&self, mode: AverageMode) -> bool {
        self.averaged_fields().is_some()
            && (mode == AverageMode::Images || self.flatness().is_some())
            && self.verdict().passed_all_checks()
    }
}

impl AverageInput for CameraImage {
    fn averaged_fields(&self) -> Option<AveragedFields> {
        self.features.averaged_fields()
    }

    fn flatness(&self) -> Option<f64> {
        None
    }

    fn verdict(&self) -> QualityVerdict {
        self.verdict
    }
}

impl AverageInput for AggregatedFeatures {
    fn averaged_fields(&self) -> Option<AveragedFields> {
        Some(self.averages)
    }

    fn flatness(&self) -> Option<f64> {
        self.flatness
    }

    fn verdict(&self) -> QualityVerdict {
        self.quality
    }
}

/// Arithmetic mean of the good inputs.
///
/// In image mode flatness is the spread of the aspect ratios relative to their mean, which needs at
/// least two inputs. In particle mode it is the mean of the inputs' own flatness. Returns None when no
/// input is good.
pub fn average<'a, I, T>(inputs: I, mode: AverageMode) -> Option<AggregatedFeatures>
where
    I: IntoIterator<Item = &'a T>,
    T: AverageInput + 'a,
{
    let mut sums = AveragedFields::default();
    let mut quality = QualityVerdict::all_passed();
    let mut good_count: usize = 0;
    let mut flatness_sum = 0.0;
    let mut aspect_min = f64::INFINITY;
    let mut aspect_max = f64::NEG_INFINITY;

    for input in inputs {
        if !input.is_good_for_averaging(mode) {
            continue;
        }
        // Checked by is_good_for_averaging
        let Some(fields) = input.averaged_fields() else {
            continue;
        };
        good_count += 1;
        sums.accumulate(&fields);
        quality = quality.and(&input.verdict());
        flatness_sum += input.flatness().unwrap_or(0.0);
        aspect_min = aspect_min.min(fields.aspect_ratio);
        aspect_max = aspect_max.max(fields.aspect_ratio);
    }

    if good_count == 0 {
        return None;
    }

    let factor = 1.0 / good_count as f64;
    sums.scale(factor);
    let flatness = match mode {
        AverageMode::Images if good_count > 1 && sums.aspect_ratio != 0.0 => {
            Some(((aspect_max - aspect_min) / sums.aspect_ratio).abs())
        }
        AverageMode::Images => None,
        AverageMode::Particles => Some(flatness_sum * factor),
    };

    Some(AggregatedFeatures {
        averages: sums,
        flatness,
        num_used_for_average: good_count,
        quality,
    })
}

/// Combines the camera views of a particle into one set of features, after screening out
/// particles that look like rain.
#[derive(Debug, Clone)]
pub struct ParticleAggregator {
    num_cameras: usize,
}

impl ParticleAggregator {
    pub fn new(num_cameras: usize) -> Self {
        Self { num_cameras }
    }

    pub fn num_cameras(&self) -> usize {
        self.num_cameras
    }

    /// Require every camera to be present, a quorum of passing views, and every passing view to
    /// be a single dim smooth object.
    pub fn rain_filter(&self, images: &[CameraImage]) -> Result<(), Rejection> {
        if images.is_empty() {
            return Err(Rejection::MalformedInput);
        }
        if images.len() != self.num_cameras {
            return Err(Rejection::CameraCountMismatch {
                expected: self.num_cameras,
                found: images.len(),
            });
        }

        let passing = images.iter().filter(|im| im.verdict.passed_all_checks());
        let passed = passing.clone().count();
        if passed < RAIN_QUORUM {
            return Err(Rejection::QuorumNotMet { passed });
        }
        let clear = passing.filter(|im| im.features.is_clear_view()).count();
        if clear < passed {
            return Err(Rejection::RainSuspected { passed, clear });
        }
        Ok(())
    }

    pub fn aggregate(&self, images: &[CameraImage]) -> ParticleAggregation {
        if let Err(rejection) = self.rain_filter(images) {
            return ParticleAggregation::NotAggregated(rejection);
        }
        match average(images, AverageMode::Images) {
            Some(features) => ParticleAggregation::Aggregated(features),
            None => ParticleAggregation::NotAggregated(Rejection::NoGoodInputs),
        }
    }
}

/// A particle seen by the cameras. Aggregated exactly once, at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleRecord {
    pub particle_id: u64,
    pub captured_at: PrimitiveDateTime,
    pub fall_speed_mps: Option<f64>,
    pub images: Vec<CameraImage>,
    pub aggregation: ParticleAggregation,
}

impl ParticleRecord {
    pub fn new(
        particle_id: u64,
        captured_at: PrimitiveDateTime,
        fall_speed_mps: Option<f64>,
        images: Vec<CameraImage>,
        aggregator: &ParticleAggregator,
    ) -> Self {
        let aggregation = aggregator.aggregate(&images);
        Self {
            particle_id,
            captured_at,
            fall_speed_mps,
            images,
            aggregation,
        }
    }

    /// Run the gate over raw features and aggregate
    pub fn from_features(
        particle_id: u64,
        captured_at: PrimitiveDateTime,
        fall_speed_mps: Option<f64>,
        features: Vec<ImageFeatureSet>,
        gate: &ImageQualityGate,
        aggregator: &ParticleAggregator,
    ) -> Self {
        let images = features
            .into_iter()
            .map(|f| CameraImage::evaluate(f, gate))
            .collect();
        Self::new(particle_id, captured_at, fall_speed_mps, images, aggregator)
    }

    pub fn features(&self) -> Option<&AggregatedFeatures> {
        self.aggregation.features()
    }

    /// Fall speed known and at most the limit, with features usable in a time-bin average
    pub fn is_good_for_binning(&self, max_fall_speed_mps: f64) -> bool {
        self.fall_speed_mps
            .is_some_and(|speed| speed <= max_fall_speed_mps)
            && self
                .features()
                .is_some_and(|f| f.is_good_for_averaging(AverageMode::Particles))
    }

    pub fn qc_bits(&self, config: &Config) -> QcBitmask<ParticleQcFlag> {
        let rejection = self.aggregation.rejection();
        let few_views = self.features().is_some_and(|f| {
            f.num_used_for_average < config.particle.warn_min_images_for_average
        });
        QcBitmask::encode(&[
            (
                ParticleQcFlag::FallSpeedBad,
                is_fall_speed_bad(
                    self.fall_speed_mps,
                    config.time_binning.max_fall_speed_mps,
                ),
            ),
            (ParticleQcFlag::NotAggregated, rejection.is_some()),
            (
                ParticleQcFlag::QuorumNotMet,
                matches!(rejection, Some(Rejection::QuorumNotMet { .. })),
            ),
            (
                ParticleQcFlag::RainSuspected,
                matches!(rejection, Some(Rejection::RainSuspected { .. })),
            ),
            (ParticleQcFlag::FewViews, few_views),
            (
                ParticleQcFlag::CameraCountMismatch,
                matches!(rejection, Some(Rejection::CameraCountMismatch { .. })),
            ),
        ])
    }
}
