//! # masc_aggregator
//!
//! masc_aggregator is the particle aggregation and quality control engine for the Multi-Angle
//! Snowflake Camera (MASC), written in Rust. It takes the per-camera morphological measurements
//! produced by the feature extractor, combines the camera views of each particle into one
//! quality-checked particle record, groups the particles into hour-aligned time bins and writes
//! all three levels out as delimited text tables.
//!
//! ## Installation
//!
//! The only method of install is from source.
//!
//! ### Rust
//!
//! If you have not used Rust before, you will most likely need to install the Rust tool
//! chain. See the [Rust docs](https://www.rust-lang.org/tools/install) for installation
//! instructions.
//!
//! ### Building & Install
//!
//! To build and install the CLI use `cargo install --path ./masc_aggregator_cli` from the
//! top level repository. The binary will be installed to your cargo install location
//! (typically something like `~/.cargo/bin/`).
//!
//! ## Processing
//!
//! Processing happens in three levels:
//!
//! - Images: every camera image is run through the [`quality::ImageQualityGate`], which applies
//! six independent checks (minimum size, intensity range, intensity ceiling, edge touch, focus and
//! bottom location).
//! - Particles: the [`particle::ParticleAggregator`] first screens out particles that look like
//! rain. All cameras must be present, at least two views must pass quality, and every passing view
//! must contain a single dim, smooth object. The views which are good for averaging are then
//! averaged, and the flatness is computed from the spread of their aspect ratios.
//! - Time bins: the [`time_bin::TimeBinAggregator`] allocates fixed-width bins aligned to the
//! hour over the whole time span of the input and averages the particles in each bin which fall
//! slowly enough and have usable features.
//!
//! Rejections at any level are not errors. They leave the record without averages and are
//! reported through the QC bitmasks described in [`qc_bits`].
//!
//! Particle processing is split into fixed-size chunks dealt out to `n_threads` workers. Results
//! are written through an [`ordered_writer::OrderedWriter`] so the output is always in input order
//! no matter which worker finishes first.
//!
//! ## Configuration
//!
//! Configuration is a YAML file. A template can be generated with the CLI `new` subcommand:
//!
//! ```yml
//! input_path: None
//! output_path: None
//! delimiter: "\t"
//! n_threads: 1
//! particles_per_chunk: 100
//! num_cameras: 3
//! image_quality:
//!   min_flake_size_um: 200.0
//!   max_edge_touch_length_um: 500.0
//!   min_max_pixel_intensity: 0.2
//!   min_intensity_variability: 0.0196078431372549
//!   warn_min_mean_intensity: 0.05
//!   reject_out_of_focus: true
//!   focus_threshold: 0.02
//!   bottom_location_range_mm:
//!   - 33.0
//!   - 39.0
//! particle:
//!   warn_min_images_for_average: 2
//! time_binning:
//!   bin_width: 5m
//!   max_fall_speed_mps: 5.0
//!   min_particles_per_bin: 10
//! writer:
//!   batch_threshold: 10
//!   max_pending: null
//!   submit_timeout_secs: 60
//! ```
//!
//! `bin_width` accepts either an integer number of seconds or a description made of
//! `<number><unit>` groups with units `h`, `m` and `s`, such as `5m`, `1h` or `2m24s`. It must
//! divide an hour evenly.
//!
//! ## Input Format
//!
//! The input is a delimited text file with a header row and one row per camera image:
//!
//! ```text
//! particle_id, date (mm.dd.yyyy), time (hh:mm:ss.ffffff), fall_speed_mps, camera_id, num_objects,
//! max_dimension_mm, particle_area_mm2, area_eq_radius_mm, perimeter_mm, edge_touch_mm,
//! orientation_deg, aspect_ratio, complexity, cross_section_mm2, mean_intensity,
//! intensity_variability, max_intensity, roi_focus, roi_position_x_mm, roi_position_y_mm,
//! roi_half_width_mm, roi_half_height_mm, roi_bottom_mm
//! ```
//!
//! Missing values are written as `-9999`.
//!
//! ## Output
//!
//! masc_aggregator writes `images.tsv`, `particles.tsv` and `time_bins.tsv` to the output
//! directory, plus a log file. Every time bin is written, including empty ones, so the time
//! series has no holes. Log files contain the detailed status of the run; if an error occurs,
//! check the log file first.
pub mod config;
pub mod constants;
pub mod error;
pub mod features;
pub mod ingest;
pub mod ordered_writer;
pub mod particle;
pub mod process;
pub mod qc_bits;
pub mod quality;
pub mod record_format;
pub mod time_bin;
pub mod worker_status;

#[cfg(test)]
mod test_support;
