use time::{Duration, PrimitiveDateTime, Time};

use super::config::{BinWidth, TimeBinningParameters};
use super::error::AggregationError;
use super::particle::{average, AggregatedFeatures, AverageMode, ParticleRecord};
use super::qc_bits::{time_bin_qc_bits, QcBitmask, TimeBinQcFlag};

/// Truncate a timestamp to the start of its hour
pub fn hour_floor(timestamp: PrimitiveDateTime) -> PrimitiveDateTime {
    timestamp.replace_time(Time::MIDNIGHT) + Duration::hours(timestamp.hour() as i64)
}

/// A time bin's single quality criterion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeBinVerdict {
    pub passed_min_particles: bool,
}

impl TimeBinVerdict {
    pub fn passed_all_checks(&self) -> bool {
        self.passed_min_particles
    }
}

/// A fixed-width window of time, aligned to the hour
#[derive(Debug, Clone, PartialEq)]
pub struct TimeBin {
    pub center: PrimitiveDateTime,
    pub width_secs: u32,
    /// Every particle assigned to the bin, regardless of quality
    pub total_particle_count: usize,
    /// Particles which passed the fall speed and averaging filters
    pub num_used_for_average: usize,
    pub mean_fall_speed_mps: Option<f64>,
    pub features: Option<AggregatedFeatures>,
    pub quality: TimeBinVerdict,
    pub error: Option<AggregationError>,
}

impl TimeBin {
    fn empty(center: PrimitiveDateTime, width_secs: u32) -> Self {
        Self {
            center,
            width_secs,
            total_particle_count: 0,
            num_used_for_average: 0,
            mean_fall_speed_mps: None,
            features: None,
            quality: TimeBinVerdict::default(),
            error: None,
        }
    }

    pub fn qc_bits(&self, min_particles_per_bin: usize) -> QcBitmask<TimeBinQcFlag> {
        time_bin_qc_bits(
            self.total_particle_count,
            self.num_used_for_average,
            self.features.is_some(),
            self.error.is_some(),
            min_particles_per_bin,
        )
    }
}

/// Groups a time-sorted particle stream into hour-aligned bins and averages each bin
#[derive(Debug, Clone)]
pub struct TimeBinAggregator {
    bin_width: BinWidth,
    max_fall_speed_mps: f64,
    min_particles_per_bin: usize,
}

impl TimeBinAggregator {
    pub fn new(parameters: &TimeBinningParameters) -> Self {
        Self {
            bin_width: parameters.bin_width,
            max_fall_speed_mps: parameters.max_fall_speed_mps,
            min_particles_per_bin: parameters.min_particles_per_bin,
        }
    }

    pub fn min_particles_per_bin(&self) -> usize {
        self.min_particles_per_bin
    }

    /// Allocate every bin from the hour floor of the first particle up to one hour past the hour
    /// floor of the last one
    pub fn allocate_bins(&self, first: PrimitiveDateTime, last: PrimitiveDateTime) -> Vec<TimeBin> {
        let width = self.bin_width.seconds() as i64;
        let from = hour_floor(first);
        let to = hour_floor(last) + Duration::HOUR;
        let span = (to - from).whole_seconds().max(0);
        let n_bins = (span + width - 1) / width;
        (0..n_bins)
            .map(|i| {
                let center = from + Duration::milliseconds((2 * i + 1) * width * 500);
                TimeBin::empty(center, width as u32)
            })
            .collect()
    }

    /// Bin the particles, which must be sorted ascending by capture time. Particles which fall
    /// outside the allocated range or before the current bin are logged and skipped.
    pub fn aggregate(&self, particles: &[ParticleRecord]) -> Vec<TimeBin> {
        let (Some(first), Some(last)) = (particles.first(), particles.last()) else {
            return Vec::new();
        };
        let mut bins = self.allocate_bins(first.captured_at, last.captured_at);
        let from = hour_floor(first.captured_at);
        let width = self.bin_width.seconds() as i64;

        let mut group: Vec<&ParticleRecord> = Vec::new();
        let mut group_key: Option<(time::Date, u8, usize)> = None;
        for particle in particles {
            let since = (particle.captured_at - from).whole_seconds();
            if since < 0 || since / width >= bins.len() as i64 {
                spdlog::warn!(
                    "Particle {} at {} is outside the binned range; skipping",
                    particle.particle_id,
                    particle.captured_at
                );
                continue;
            }
            let index = (since / width) as usize;
            let key = (particle.captured_at.date(), particle.captured_at.hour(), index);

            match group_key {
                Some(current) if current == key => (),
                Some(current) if current.2 > index => {
                    spdlog::warn!(
                        "Particle {} at {} is out of time order; skipping",
                        particle.particle_id,
                        particle.captured_at
                    );
                    continue;
                }
                Some(current) => {
                    self.close_bin(&mut bins[current.2], &group);
                    group.clear();
                    group_key = Some(key);
                }
                None => group_key = Some(key),
            }
            group.push(particle);
        }
        if let Some(current) = group_key {
            self.close_bin(&mut bins[current.2], &group);
        }

        bins
    }

    fn close_bin(&self, bin: &mut TimeBin, group: &[&ParticleRecord]) {
        bin.total_particle_count = group.len();

        let mut speed_sum = 0.0;
        let mut used: Vec<&AggregatedFeatures> = Vec::new();
        for particle in group {
            if !particle.is_good_for_binning(self.max_fall_speed_mps) {
                continue;
            }
            if let (Some(speed), Some(features)) = (particle.fall_speed_mps, particle.features()) {
                speed_sum += speed;
                used.push(features);
            }
        }

        if !used.is_empty() {
            let features = average(used.iter().copied(), AverageMode::Particles);
            match reconcile(bin.center, used.len(), features) {
                Ok(features) => {
                    bin.num_used_for_average = used.len();
                    bin.mean_fall_speed_mps = Some(speed_sum / used.len() as f64);
                    bin.features = Some(features);
                }
                Err(e) => {
                    spdlog::error!("{e}; the bin is left without averages");
                    bin.error = Some(e);
                }
            }
        }
        bin.quality.passed_min_particles = bin.num_used_for_average >= self.min_particles_per_bin;
    }
}

/// The number of particles averaged must match the number that passed the filter
fn reconcile(
    center: PrimitiveDateTime,
    filtered: usize,
    features: Option<AggregatedFeatures>,
) -> Result<AggregatedFeatures, AggregationError> {
    let Some(features) = features else {
        return Err(AggregationError::AverageRejected {
            center: center.to_string(),
            reason: format!("none of the {filtered} filtered particles could be averaged"),
        });
    };
    if features.num_used_for_average != filtered {
        return Err(AggregationError::CountMismatch {
            center: center.to_string(),
            filtered,
            reported: features.num_used_for_average,
        });
    }
    Ok(features)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::ImageFeatureSet;
    use crate::particle::{CameraImage, ParticleAggregator};
    use crate::quality::QualityVerdict;
    use crate::test_support::passing_image;
    use time::macros::datetime;

    fn binner(width_secs: i64, min_particles_per_bin: usize) -> TimeBinAggregator {
        TimeBinAggregator::new(&TimeBinningParameters {
            bin_width: BinWidth::from_seconds(width_secs).expect("valid width"),
            max_fall_speed_mps: 5.0,
            min_particles_per_bin,
        })
    }

    fn particle(id: u64, at: PrimitiveDateTime, fall_speed: f64) -> ParticleRecord {
        let aggregator = ParticleAggregator::new(3);
        let images = [0.4, 0.5, 0.6]
            .into_iter()
            .map(|aspect| {
                let mut features: ImageFeatureSet = passing_image();
                features.captured_at = at;
                features.aspect_ratio = Some(aspect);
                CameraImage {
                    features,
                    verdict: QualityVerdict::all_passed(),
                }
            })
            .collect();
        ParticleRecord::new(id, at, Some(fall_speed), images, &aggregator)
    }

    #[test]
    fn test_bin_count_spans_whole_hours() {
        let bins = binner(300, 1).allocate_bins(
            datetime!(2015-10-28 22:19:34),
            datetime!(2015-10-28 23:05:00),
        );
        assert_eq!(bins.len(), 24);
        assert_eq!(bins[0].center, datetime!(2015-10-28 22:02:30));
        assert_eq!(bins[23].center, datetime!(2015-10-28 23:57:30));

        let bins = binner(1, 1).allocate_bins(
            datetime!(2015-10-28 23:59:59),
            datetime!(2015-10-29 00:00:01),
        );
        assert_eq!(bins.len(), 7200);
        assert_eq!(bins[0].center, datetime!(2015-10-28 23:00:00.5));
    }

    #[test]
    fn test_hour_floor() {
        assert_eq!(
            hour_floor(datetime!(2015-10-28 22:19:34.25)),
            datetime!(2015-10-28 22:00:00)
        );
    }

    #[test]
    fn test_empty_input_gives_no_bins() {
        assert!(binner(300, 1).aggregate(&[]).is_empty());
    }

    #[test]
    fn test_particles_are_grouped_by_bin() {
        let particles = vec![
            particle(0, datetime!(2015-10-28 22:01:00), 1.0),
            particle(1, datetime!(2015-10-28 22:03:00), 2.0),
            particle(2, datetime!(2015-10-28 22:04:59), 9.0),
            particle(3, datetime!(2015-10-28 22:31:00), 1.5),
        ];
        let bins = binner(300, 2).aggregate(&particles);
        assert_eq!(bins.len(), 12);

        let first = &bins[0];
        assert_eq!(first.total_particle_count, 3);
        assert_eq!(first.num_used_for_average, 2);
        assert_eq!(first.mean_fall_speed_mps, Some(1.5));
        assert!(first.quality.passed_all_checks());
        let features = first.features.as_ref().expect("averaged");
        assert_eq!(features.num_used_for_average, 2);
        assert_eq!(first.qc_bits(2).bits(), 0);

        let sixth = &bins[6];
        assert_eq!(sixth.total_particle_count, 1);
        assert!(!sixth.quality.passed_all_checks());
        assert!(sixth.qc_bits(2).contains(TimeBinQcFlag::BelowMinParticles));

        let empty = &bins[1];
        assert_eq!(empty.total_particle_count, 0);
        assert!(empty.features.is_none());
        assert!(empty.qc_bits(2).contains(TimeBinQcFlag::EmptyBin));
    }

    #[test]
    fn test_every_particle_is_counted_once() {
        let start = datetime!(2015-10-28 22:00:00);
        let particles: Vec<ParticleRecord> = (0..200)
            .map(|i| particle(i, start + Duration::seconds(i as i64 * 37), 1.0))
            .collect();
        let bins = binner(120, 1).aggregate(&particles);
        let total: usize = bins.iter().map(|b| b.total_particle_count).sum();
        assert_eq!(total, particles.len());
        for pair in bins.windows(2) {
            assert_eq!(pair[1].center - pair[0].center, Duration::seconds(120));
        }
        for bin in &bins {
            assert!(bin.num_used_for_average <= bin.total_particle_count);
            assert!(bin.error.is_none());
        }
    }

    #[test]
    fn test_out_of_order_particle_is_skipped() {
        let particles = vec![
            particle(0, datetime!(2015-10-28 22:11:00), 1.0),
            particle(1, datetime!(2015-10-28 22:01:00), 1.0),
            particle(2, datetime!(2015-10-28 22:12:00), 1.0),
        ];
        let bins = binner(300, 1).aggregate(&particles);
        let total: usize = bins.iter().map(|b| b.total_particle_count).sum();
        assert_eq!(total, 2);
        assert_eq!(bins[2].total_particle_count, 2);
    }

    #[test]
    fn test_unusable_particles_are_counted_but_not_averaged() {
        let at = datetime!(2015-10-28 22:01:00);
        let no_speed = ParticleRecord {
            fall_speed_mps: None,
            ..particle(1, at, 1.0)
        };

        // Two passing views but only one complete, so the particle has no flatness
        let mut incomplete = passing_image();
        incomplete.captured_at = at;
        incomplete.complexity = None;
        let mut complete = passing_image();
        complete.captured_at = at;
        let images = vec![
            CameraImage {
                features: complete.clone(),
                verdict: QualityVerdict::all_passed(),
            },
            CameraImage {
                features: incomplete,
                verdict: QualityVerdict::all_passed(),
            },
            CameraImage {
                features: complete,
                verdict: crate::test_support::failed_verdict(),
            },
        ];
        let single_view =
            ParticleRecord::new(2, at, Some(1.0), images, &ParticleAggregator::new(3));
        let features = single_view.features().expect("aggregated from one view");
        assert_eq!(features.num_used_for_average, 1);
        assert_eq!(features.flatness, None);

        let particles = vec![particle(0, at, 2.0), no_speed, single_view];
        let bins = binner(300, 1).aggregate(&particles);
        let first = &bins[0];
        assert_eq!(first.total_particle_count, 3);
        assert_eq!(first.num_used_for_average, 1);
        assert_eq!(first.mean_fall_speed_mps, Some(2.0));
        assert!(first.error.is_none());
        assert_eq!(
            first.features.as_ref().map(|f| f.num_used_for_average),
            Some(1)
        );
    }

    #[test]
    fn test_count_mismatch_is_an_error() {
        let p = particle(0, datetime!(2015-10-28 22:01:00), 1.0);
        let features = p.features().cloned();
        let reported = features
            .as_ref()
            .map(|f| f.num_used_for_average)
            .expect("aggregated");
        let center = datetime!(2015-10-28 22:02:30);
        assert!(reconcile(center, reported, features.clone()).is_ok());
        assert_eq!(
            reconcile(center, reported + 1, features),
            Err(AggregationError::CountMismatch {
                center: center.to_string(),
                filtered: reported + 1,
                reported,
            })
        );
        assert!(matches!(
            reconcile(center, 1, None),
            Err(AggregationError::AverageRejected { .. })
        ));
    }
}
