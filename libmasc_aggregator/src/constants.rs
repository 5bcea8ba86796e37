/// Value used by the instrument and in all output files for a measurement that was not computed
pub const MISSING_VALUE: f64 = -9999.0;
/// Text written in place of any missing value
pub const MISSING_TOKEN: &str = "-9999";

pub const SECONDS_PER_HOUR: u32 = 3600;

// Rain exclusion. A view only counts as "clear" if it saw exactly one object that is both dim and
// smooth; bright or highly variable views are typical of rain drops.
pub const RAIN_QUORUM: usize = 2;
pub const RAIN_MAX_OBJECTS: u32 = 1;
pub const RAIN_MAX_MEAN_INTENSITY: f64 = 0.3;
pub const RAIN_MAX_INTENSITY_VARIABILITY: f64 = 0.3;

/// Number of buffered payloads the OrderedWriter collects before it starts draining
pub const DEFAULT_WRITER_BATCH_THRESHOLD: usize = 10;

pub const MAX_FALL_SPEED_LIMIT: f64 = 1000.0;

pub const IMAGES_FILE_NAME: &str = "images.tsv";
pub const PARTICLES_FILE_NAME: &str = "particles.tsv";
pub const TIME_BINS_FILE_NAME: &str = "time_bins.tsv";
