//! Delimited text rendering of images, particles and time bins.
//!
//! Every table starts with a header row naming each column. Missing values are written as the
//! instrument's sentinel token so downstream tools see a single representation.
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::PrimitiveDateTime;

use super::config::Config;
use super::constants::MISSING_TOKEN;
use super::error::RecordError;
use super::features::{AveragedFields, ImageFeatureSet};
use super::particle::{AggregatedFeatures, ParticleRecord};
use super::qc_bits::image_qc_bits;
use super::time_bin::TimeBin;

pub(crate) const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[month].[day].[year]");
const TIME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[hour]:[minute]:[second].[subsecond digits:6]");

/// Image measurement columns, in [`ImageFeatureSet::measurements`] order
pub const MEASUREMENT_COLUMNS: [&str; ImageFeatureSet::NUM_MEASUREMENTS] = [
    "max_dimension_mm",
    "particle_area_mm2",
    "area_eq_radius_mm",
    "perimeter_mm",
    "edge_touch_mm",
    "orientation_deg",
    "aspect_ratio",
    "complexity",
    "cross_section_mm2",
    "mean_intensity",
    "intensity_variability",
    "max_intensity",
    "roi_focus",
    "roi_position_x_mm",
    "roi_position_y_mm",
    "roi_half_width_mm",
    "roi_half_height_mm",
    "roi_bottom_mm",
];

/// Averaged columns, in [`AveragedFields::as_array`] order
pub const AVERAGED_COLUMNS: [&str; AveragedFields::NUM_FIELDS] = [
    "max_dimension_mm",
    "particle_area_mm2",
    "area_eq_radius_mm",
    "perimeter_mm",
    "orientation_deg",
    "aspect_ratio",
    "complexity",
    "cross_section_mm2",
    "mean_intensity",
    "intensity_variability",
];

const IMAGE_LEADING_COLUMNS: [&str; 9] = [
    "particle_id",
    "date",
    "time",
    "fall_speed_mps",
    "camera_id",
    "passed",
    "quality_bits",
    "qc_mask",
    "num_objects",
];

const PARTICLE_LEADING_COLUMNS: [&str; 7] = [
    "particle_id",
    "date",
    "time",
    "fall_speed_mps",
    "qc_mask",
    "aggregated",
    "num_images_used",
];

const TIME_BIN_LEADING_COLUMNS: [&str; 9] = [
    "center_date",
    "center_time",
    "width_secs",
    "total_particles",
    "particles_used",
    "passed",
    "qc_mask",
    "mean_fall_speed_mps",
    "num_used_for_average",
];

pub fn format_date(timestamp: PrimitiveDateTime) -> Result<String, RecordError> {
    Ok(timestamp.format(DATE_FORMAT)?)
}

pub fn format_time(timestamp: PrimitiveDateTime) -> Result<String, RecordError> {
    Ok(timestamp.format(TIME_FORMAT)?)
}

/// Render a value, or the sentinel token if it is missing
fn value<T: ToString>(value: Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => String::from(MISSING_TOKEN),
    }
}

fn flag(value: bool) -> String {
    String::from(if value { "1" } else { "0" })
}

fn line(columns: Vec<String>, delimiter: &str) -> String {
    let mut row = columns.join(delimiter);
    row.push('\n');
    row
}

fn header(leading: &[&str], trailing: &[&str], delimiter: &str) -> String {
    let columns: Vec<String> = leading
        .iter()
        .chain(trailing.iter())
        .map(|c| c.to_string())
        .collect();
    line(columns, delimiter)
}

fn push_aggregate(columns: &mut Vec<String>, features: Option<&AggregatedFeatures>) {
    match features {
        Some(f) => {
            columns.extend(f.averages.as_array().iter().map(|v| v.to_string()));
            columns.push(value(f.flatness));
        }
        None => columns.extend(
            std::iter::repeat(String::from(MISSING_TOKEN)).take(AveragedFields::NUM_FIELDS + 1),
        ),
    }
}

pub fn images_header(delimiter: &str) -> String {
    let mut trailing: Vec<&str> = MEASUREMENT_COLUMNS.to_vec();
    trailing.push("rain_like");
    header(&IMAGE_LEADING_COLUMNS, &trailing, delimiter)
}

pub fn particles_header(delimiter: &str) -> String {
    let mut trailing: Vec<&str> = AVERAGED_COLUMNS.to_vec();
    trailing.push("flatness");
    header(&PARTICLE_LEADING_COLUMNS, &trailing, delimiter)
}

pub fn time_bins_header(delimiter: &str) -> String {
    let mut trailing: Vec<&str> = AVERAGED_COLUMNS.to_vec();
    trailing.push("flatness");
    header(&TIME_BIN_LEADING_COLUMNS, &trailing, delimiter)
}

/// One row per camera image of the particle
pub fn image_rows(particle: &ParticleRecord, config: &Config) -> Result<String, RecordError> {
    let mut rows = String::new();
    for image in &particle.images {
        let features = &image.features;
        let passed = image.verdict.passed_all_checks();
        let mask = image_qc_bits(
            features,
            &image.verdict,
            particle.fall_speed_mps,
            &config.image_quality,
            &config.time_binning,
        );
        let mut columns = vec![
            particle.particle_id.to_string(),
            format_date(features.captured_at)?,
            format_time(features.captured_at)?,
            value(particle.fall_speed_mps),
            value(features.camera_id),
            flag(passed),
            image.verdict.bit_string(),
            mask.to_string(),
            value(features.num_objects),
        ];
        columns.extend(features.measurements().into_iter().map(value));
        columns.push(if passed {
            flag(!features.is_clear_view())
        } else {
            String::from(MISSING_TOKEN)
        });
        rows.push_str(&line(columns, &config.delimiter));
    }
    Ok(rows)
}

pub fn particle_row(particle: &ParticleRecord, config: &Config) -> Result<String, RecordError> {
    let features = particle.features();
    let mut columns = vec![
        particle.particle_id.to_string(),
        format_date(particle.captured_at)?,
        format_time(particle.captured_at)?,
        value(particle.fall_speed_mps),
        particle.qc_bits(config).to_string(),
        flag(particle.aggregation.is_built_from_average()),
        features
            .map(|f| f.num_used_for_average)
            .unwrap_or(0)
            .to_string(),
    ];
    push_aggregate(&mut columns, features);
    Ok(line(columns, &config.delimiter))
}

pub fn time_bin_row(bin: &TimeBin, config: &Config) -> Result<String, RecordError> {
    let features = bin.features.as_ref();
    let mut columns = vec![
        format_date(bin.center)?,
        format_time(bin.center)?,
        bin.width_secs.to_string(),
        bin.total_particle_count.to_string(),
        bin.num_used_for_average.to_string(),
        flag(bin.quality.passed_all_checks()),
        bin.qc_bits(config.time_binning.min_particles_per_bin)
            .to_string(),
        value(bin.mean_fall_speed_mps),
        value(features.map(|f| f.num_used_for_average)),
    ];
    push_aggregate(&mut columns, features);
    Ok(line(columns, &config.delimiter))
}
