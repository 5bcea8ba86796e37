use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::constants::{
    DEFAULT_WRITER_BATCH_THRESHOLD, IMAGES_FILE_NAME, MAX_FALL_SPEED_LIMIT, PARTICLES_FILE_NAME,
    SECONDS_PER_HOUR, TIME_BINS_FILE_NAME,
};
use super::error::{BinWidthError, ConfigError};

/// Thresholds applied to every image by the ImageQualityGate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageQualityParameters {
    /// Minimum acceptable object width (microns)
    pub min_flake_size_um: f64,
    /// Maximum length an object may touch the frame edge (microns)
    pub max_edge_touch_length_um: f64,
    /// Minimum acceptable brightest pixel, [0, 1]. Darker objects tend to be out of focus
    pub min_max_pixel_intensity: f64,
    /// Minimum internal variability, [0, 1]. Background noise and blurred objects are very flat
    pub min_intensity_variability: f64,
    /// Mean intensity, [0, 1], below which an image gets the below-warning QC bit. Not a gate check
    pub warn_min_mean_intensity: f64,
    pub reject_out_of_focus: bool,
    /// Focus threshold, [0, 1]. Compared against the focus rounded to two decimals
    pub focus_threshold: f64,
    /// Inclusive range of the region of interest bottom, measured from the top of the frame (mm)
    pub bottom_location_range_mm: [f64; 2],
}

impl Default for ImageQualityParameters {
    fn default() -> Self {
        Self {
            min_flake_size_um: 200.0,
            max_edge_touch_length_um: 500.0,
            min_max_pixel_intensity: 0.2,
            min_intensity_variability: 5.0 / 255.0,
            warn_min_mean_intensity: 0.05,
            reject_out_of_focus: true,
            focus_threshold: 0.02,
            bottom_location_range_mm: [33.0, 39.0],
        }
    }
}

impl ImageQualityParameters {
    pub fn min_flake_size_mm(&self) -> f64 {
        self.min_flake_size_um / 1000.0
    }

    pub fn max_edge_touch_length_mm(&self) -> f64 {
        self.max_edge_touch_length_um / 1000.0
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_unit_range("image_quality.min_max_pixel_intensity", self.min_max_pixel_intensity)?;
        check_unit_range(
            "image_quality.min_intensity_variability",
            self.min_intensity_variability,
        )?;
        check_unit_range(
            "image_quality.warn_min_mean_intensity",
            self.warn_min_mean_intensity,
        )?;
        check_unit_range("image_quality.focus_threshold", self.focus_threshold)?;
        check_non_negative("image_quality.min_flake_size_um", self.min_flake_size_um)?;
        check_non_negative(
            "image_quality.max_edge_touch_length_um",
            self.max_edge_touch_length_um,
        )?;
        let [bottom_min, bottom_max] = self.bottom_location_range_mm;
        check_non_negative("image_quality.bottom_location_range_mm", bottom_min)?;
        check_non_negative("image_quality.bottom_location_range_mm", bottom_max)?;
        if bottom_min > bottom_max {
            return Err(invalid(
                "image_quality.bottom_location_range_mm",
                format!("minimum {bottom_min} is greater than maximum {bottom_max}"),
            ));
        }
        Ok(())
    }
}

/// Per-particle settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleParameters {
    /// Particles averaged from fewer views than this are flagged (but still kept)
    pub warn_min_images_for_average: usize,
}

impl Default for ParticleParameters {
    fn default() -> Self {
        Self {
            warn_min_images_for_average: 2,
        }
    }
}

/// Width of a time bin in whole seconds. Always in [1, 3600] and a divisor of 3600.
///
/// Can be given in a config either as an integer number of seconds or as a description made of
/// `<number><unit>` groups with units h, m, s, e.g. `5m`, `1h`, `2m24s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BinWidthSpec", into = "BinWidthSpec")]
pub struct BinWidth(u32);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum BinWidthSpec {
    Seconds(i64),
    Description(String),
}

impl TryFrom<BinWidthSpec> for BinWidth {
    type Error = BinWidthError;

    fn try_from(spec: BinWidthSpec) -> Result<Self, Self::Error> {
        match spec {
            BinWidthSpec::Seconds(s) => Self::from_seconds(s),
            BinWidthSpec::Description(d) => Self::parse(&d),
        }
    }
}

impl From<BinWidth> for BinWidthSpec {
    fn from(width: BinWidth) -> Self {
        BinWidthSpec::Description(width.to_string())
    }
}

impl BinWidth {
    pub fn from_seconds(seconds: i64) -> Result<Self, BinWidthError> {
        if seconds < 1 || seconds > SECONDS_PER_HOUR as i64 {
            return Err(BinWidthError::OutOfRange(seconds));
        }
        let seconds = seconds as u32;
        if SECONDS_PER_HOUR % seconds != 0 {
            return Err(BinWidthError::DoesNotDivideHour(seconds));
        }
        Ok(Self(seconds))
    }

    /// Parse a description such as `5m` or `2m24s`.
    ///
    /// Hours and minutes may be fractional. Seconds are rounded down on their own, then the total
    /// is rounded down to whole seconds.
    pub fn parse(description: &str) -> Result<Self, BinWidthError> {
        let trimmed = description.trim();
        if trimmed.is_empty() {
            return Err(BinWidthError::Empty);
        }

        let mut total_seconds = 0.0;
        let mut number = String::new();
        for c in trimmed.chars() {
            if c.is_ascii_digit() || c == '.' {
                number.push(c);
                continue;
            }
            let unit = c.to_ascii_lowercase();
            if !matches!(unit, 'h' | 'm' | 's') {
                return Err(BinWidthError::BadUnit(description.to_string(), c));
            }
            let value: f64 = number
                .parse()
                .map_err(|_| BinWidthError::BadNumber(description.to_string(), number.clone()))?;
            total_seconds += match unit {
                'h' => value * SECONDS_PER_HOUR as f64,
                'm' => value * 60.0,
                _ => value.floor(),
            };
            number.clear();
        }
        if !number.is_empty() {
            return Err(BinWidthError::MissingUnit(description.to_string()));
        }

        Self::from_seconds(total_seconds.floor() as i64)
    }

    pub fn seconds(&self) -> u32 {
        self.0
    }
}

impl Display for BinWidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hours = self.0 / SECONDS_PER_HOUR;
        let minutes = (self.0 % SECONDS_PER_HOUR) / 60;
        let seconds = self.0 % 60;
        if hours > 0 {
            write!(f, "{hours}h")?;
        }
        if minutes > 0 {
            write!(f, "{minutes}m")?;
        }
        if seconds > 0 {
            write!(f, "{seconds}s")?;
        }
        Ok(())
    }
}

/// Settings for grouping particles into time bins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeBinningParameters {
    pub bin_width: BinWidth,
    /// Particles falling faster than this (m/s) are counted but not averaged
    pub max_fall_speed_mps: f64,
    /// Minimum number of averaged particles for a bin to be statistically significant
    pub min_particles_per_bin: usize,
}

impl Default for TimeBinningParameters {
    fn default() -> Self {
        Self {
            bin_width: BinWidth(300),
            max_fall_speed_mps: 5.0,
            min_particles_per_bin: 10,
        }
    }
}

impl TimeBinningParameters {
    fn validate(&self) -> Result<(), ConfigError> {
        // Re-check in case the struct was built by hand rather than deserialized
        BinWidth::from_seconds(self.bin_width.seconds() as i64)?;
        if !(self.max_fall_speed_mps > 0.0 && self.max_fall_speed_mps <= MAX_FALL_SPEED_LIMIT) {
            return Err(invalid(
                "time_binning.max_fall_speed_mps",
                format!(
                    "{} is outside (0, {MAX_FALL_SPEED_LIMIT}] m/s",
                    self.max_fall_speed_mps
                ),
            ));
        }
        if self.min_particles_per_bin == 0 {
            return Err(invalid(
                "time_binning.min_particles_per_bin",
                String::from("must be greater than 0"),
            ));
        }
        Ok(())
    }
}

/// Settings for the OrderedWriter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterParameters {
    /// Number of buffered payloads collected before draining starts
    pub batch_threshold: usize,
    /// Optional cap on buffered payloads. Submitters wait while the buffer is full
    pub max_pending: Option<usize>,
    pub submit_timeout_secs: u64,
}

impl Default for WriterParameters {
    fn default() -> Self {
        Self {
            batch_threshold: DEFAULT_WRITER_BATCH_THRESHOLD,
            max_pending: None,
            submit_timeout_secs: 60,
        }
    }
}

impl WriterParameters {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_threshold == 0 {
            return Err(invalid(
                "writer.batch_threshold",
                String::from("must be at least 1"),
            ));
        }
        if let Some(max) = self.max_pending {
            if max <= self.batch_threshold {
                return Err(invalid(
                    "writer.max_pending",
                    format!(
                        "{max} must be greater than batch_threshold {}",
                        self.batch_threshold
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Structure representing the application configuration. Contains pathing, threading and all
/// analysis thresholds. Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Delimited text file with one row per camera image
    pub input_path: PathBuf,
    /// Directory receiving the image, particle and time bin tables
    pub output_path: PathBuf,
    pub delimiter: String,
    pub n_threads: usize,
    pub particles_per_chunk: usize,
    pub num_cameras: usize,
    pub image_quality: ImageQualityParameters,
    pub particle: ParticleParameters,
    pub time_binning: TimeBinningParameters,
    pub writer: WriterParameters,
}

impl Default for Config {
    /// Generate a new Config object. Paths will be empty/invalid, thresholds are usable defaults
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("None"),
            output_path: PathBuf::from("None"),
            delimiter: String::from("\t"),
            n_threads: 1,
            particles_per_chunk: 100,
            num_cameras: 3,
            image_quality: ImageQualityParameters::default(),
            particle: ParticleParameters::default(),
            time_binning: TimeBinningParameters::default(),
            writer: WriterParameters::default(),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file and validate it
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;
        let config = serde_yaml::from_str::<Self>(&yaml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every parameter against its allowed range. Processing must not start otherwise
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.is_n_threads_valid() {
            return Err(invalid("n_threads", String::from("must be at least 1")));
        }
        if self.particles_per_chunk == 0 {
            return Err(invalid(
                "particles_per_chunk",
                String::from("must be at least 1"),
            ));
        }
        if self.num_cameras == 0 {
            return Err(invalid("num_cameras", String::from("must be at least 1")));
        }
        if self.delimiter.is_empty() || self.delimiter.contains('\n') {
            return Err(invalid(
                "delimiter",
                String::from("must be non-empty and contain no newline"),
            ));
        }
        if self.particle.warn_min_images_for_average == 0 {
            return Err(invalid(
                "particle.warn_min_images_for_average",
                String::from("must be at least 1"),
            ));
        }
        self.image_quality.validate()?;
        self.time_binning.validate()?;
        self.writer.validate()?;
        Ok(())
    }

    pub fn is_n_threads_valid(&self) -> bool {
        self.n_threads >= 1
    }

    /// Get the path to one of the output tables
    pub fn get_output_file(&self, file_name: &str) -> Result<PathBuf, ConfigError> {
        if self.output_path.exists() {
            Ok(self.output_path.join(file_name))
        } else {
            Err(ConfigError::BadFilePath(self.output_path.clone()))
        }
    }

    pub fn get_images_file(&self) -> Result<PathBuf, ConfigError> {
        self.get_output_file(IMAGES_FILE_NAME)
    }

    pub fn get_particles_file(&self) -> Result<PathBuf, ConfigError> {
        self.get_output_file(PARTICLES_FILE_NAME)
    }

    pub fn get_time_bins_file(&self) -> Result<PathBuf, ConfigError> {
        self.get_output_file(TIME_BINS_FILE_NAME)
    }
}

fn invalid(name: &'static str, reason: String) -> ConfigError {
    ConfigError::InvalidParameter { name, reason }
}

fn check_unit_range(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(name, format!("{value} is outside [0, 1]")))
    }
}

fn check_non_negative(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(name, format!("{value} must be >= 0")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_width_descriptions() {
        assert_eq!(BinWidth::parse("5m").unwrap().seconds(), 300);
        assert_eq!(BinWidth::parse("1h").unwrap().seconds(), 3600);
        assert_eq!(BinWidth::parse("2m24s").unwrap().seconds(), 144);
        assert_eq!(BinWidth::parse("10s").unwrap().seconds(), 10);
        assert_eq!(BinWidth::parse("0.5m").unwrap().seconds(), 30);
        // fractional seconds are floored
        assert_eq!(BinWidth::parse("15.9s").unwrap().seconds(), 15);
    }

    #[test]
    fn test_bin_width_rejections() {
        assert_eq!(BinWidth::parse(""), Err(BinWidthError::Empty));
        assert_eq!(
            BinWidth::parse("300"),
            Err(BinWidthError::MissingUnit(String::from("300")))
        );
        assert_eq!(
            BinWidth::parse("5d"),
            Err(BinWidthError::BadUnit(String::from("5d"), 'd'))
        );
        assert_eq!(BinWidth::parse("2h"), Err(BinWidthError::OutOfRange(7200)));
        assert_eq!(BinWidth::parse("0s"), Err(BinWidthError::OutOfRange(0)));
        assert_eq!(
            BinWidth::parse("7m"),
            Err(BinWidthError::DoesNotDivideHour(420))
        );
    }

    #[test]
    fn test_bin_width_display_round_trips() {
        let width = BinWidth::parse("2m24s").unwrap();
        assert_eq!(width.to_string(), "2m24s");
        assert_eq!(BinWidth::parse(&width.to_string()).unwrap(), width);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_yaml_accepts_both_bin_width_forms() {
        let yaml = "time_binning:\n  bin_width: \"1m\"\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.time_binning.bin_width.seconds(), 60);

        let yaml = "time_binning:\n  bin_width: 600\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.time_binning.bin_width.seconds(), 600);

        let yaml = "time_binning:\n  bin_width: \"7m\"\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_validation_fails_fast() {
        let mut config = Config::default();
        config.image_quality.focus_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidParameter {
                name: "image_quality.focus_threshold",
                ..
            })
        ));

        let mut config = Config::default();
        config.image_quality.warn_min_mean_intensity = -0.1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidParameter {
                name: "image_quality.warn_min_mean_intensity",
                ..
            })
        ));

        let mut config = Config::default();
        config.image_quality.bottom_location_range_mm = [40.0, 30.0];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.time_binning.max_fall_speed_mps = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.writer.max_pending = Some(5);
        assert!(config.validate().is_err());
    }
}
