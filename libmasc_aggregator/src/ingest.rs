use std::path::Path;

use fxhash::FxHashMap;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, PrimitiveDateTime, Time};

use super::constants::MISSING_VALUE;
use super::error::IngestError;
use super::features::{from_sentinel, ImageFeatureSet, Measurement};
use super::record_format::{DATE_FORMAT, MEASUREMENT_COLUMNS};

const TIME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[hour]:[minute]:[second][optional [.[subsecond]]]");

const LEADING_COLUMNS: usize = 6; // particle id, date, time, fall speed, camera id, object count
const ENTRIES_PER_LINE: usize = LEADING_COLUMNS + ImageFeatureSet::NUM_MEASUREMENTS;

/// The camera images of one particle as read from the input, before any quality checks
#[derive(Debug, Clone, PartialEq)]
pub struct RawParticle {
    pub particle_id: u64,
    pub captured_at: PrimitiveDateTime,
    pub fall_speed_mps: Measurement,
    pub images: Vec<ImageFeatureSet>,
}

fn parse_measurement(
    line: usize,
    column: &'static str,
    text: &str,
) -> Result<Measurement, IngestError> {
    text.trim()
        .parse::<f64>()
        .map(from_sentinel)
        .map_err(|_| bad_value(line, column, text))
}

/// Integer columns share the measurement sentinel
fn parse_count<T: TryFrom<i64>>(
    line: usize,
    column: &'static str,
    text: &str,
) -> Result<Option<T>, IngestError> {
    let raw: i64 = text
        .trim()
        .parse()
        .map_err(|_| bad_value(line, column, text))?;
    if raw == MISSING_VALUE as i64 {
        return Ok(None);
    }
    T::try_from(raw)
        .map(Some)
        .map_err(|_| bad_value(line, column, text))
}

fn bad_value(line: usize, column: &'static str, text: &str) -> IngestError {
    IngestError::BadValue {
        line,
        column,
        value: text.to_string(),
    }
}

fn parse_timestamp(line: usize, date: &str, time: &str) -> Result<PrimitiveDateTime, IngestError> {
    let date = Date::parse(date.trim(), DATE_FORMAT)
        .map_err(|source| IngestError::BadTimestamp { line, source })?;
    let time = Time::parse(time.trim(), TIME_FORMAT)
        .map_err(|source| IngestError::BadTimestamp { line, source })?;
    Ok(PrimitiveDateTime::new(date, time))
}

/// Parse a single image row. Returns the particle id, fall speed and image
fn parse_row(
    line: usize,
    entries: &[&str],
) -> Result<(u64, Measurement, ImageFeatureSet), IngestError> {
    let particle_id: u64 = entries[0]
        .trim()
        .parse()
        .map_err(|_| bad_value(line, "particle_id", entries[0]))?;
    let captured_at = parse_timestamp(line, entries[1], entries[2])?;
    let fall_speed = parse_measurement(line, "fall_speed_mps", entries[3])?;
    let camera_id = parse_count::<u8>(line, "camera_id", entries[4])?;

    let mut m = [None; ImageFeatureSet::NUM_MEASUREMENTS];
    for (idx, slot) in m.iter_mut().enumerate() {
        *slot = parse_measurement(
            line,
            MEASUREMENT_COLUMNS[idx],
            entries[LEADING_COLUMNS + idx],
        )?;
    }

    let image = ImageFeatureSet {
        camera_id,
        captured_at,
        num_objects: parse_count::<u32>(line, "num_objects", entries[5])?,
        max_dimension_mm: m[0],
        particle_area_mm2: m[1],
        area_eq_radius_mm: m[2],
        perimeter_mm: m[3],
        edge_touch_mm: m[4],
        orientation_deg: m[5],
        aspect_ratio: m[6],
        complexity: m[7],
        cross_section_mm2: m[8],
        mean_intensity: m[9],
        intensity_variability: m[10],
        max_intensity: m[11],
        roi_focus: m[12],
        roi_position_mm: [m[13], m[14]],
        roi_half_extent_mm: [m[15], m[16]],
        roi_bottom_mm: m[17],
    };
    Ok((particle_id, fall_speed, image))
}

/// Parse delimited text with one row per camera image. The first line is a header and is skipped.
///
/// Rows sharing a particle id are grouped, in order of first appearance. The particle takes its
/// capture time and fall speed from its first row.
pub fn parse_particles(
    contents: &str,
    delimiter: &str,
    num_cameras: usize,
) -> Result<Vec<RawParticle>, IngestError> {
    let mut lines = contents.lines().enumerate();
    if lines.next().is_none() {
        return Err(IngestError::NoHeader);
    }

    let mut particles: Vec<RawParticle> = Vec::new();
    let mut lookup: FxHashMap<u64, usize> = FxHashMap::default();
    for (idx, line) in lines {
        let line_number = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        let entries: Vec<&str> = line.split(delimiter).collect();
        if entries.len() != ENTRIES_PER_LINE {
            return Err(IngestError::BadColumnCount {
                line: line_number,
                found: entries.len(),
                expected: ENTRIES_PER_LINE,
            });
        }

        let (particle_id, fall_speed_mps, image) = parse_row(line_number, &entries)?;
        match lookup.get(&particle_id) {
            Some(position) => particles[*position].images.push(image),
            None => {
                lookup.insert(particle_id, particles.len());
                particles.push(RawParticle {
                    particle_id,
                    captured_at: image.captured_at,
                    fall_speed_mps,
                    images: vec![image],
                });
            }
        }
    }

    let mismatched = particles
        .iter()
        .filter(|p| p.images.len() != num_cameras)
        .count();
    if mismatched > 0 {
        spdlog::warn!(
            "{mismatched} of {} particles do not have exactly {num_cameras} camera images",
            particles.len()
        );
    }
    Ok(particles)
}

/// Read and parse the input file
pub fn read_particles(
    path: &Path,
    delimiter: &str,
    num_cameras: usize,
) -> Result<Vec<RawParticle>, IngestError> {
    if !path.exists() {
        return Err(IngestError::BadFilePath(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path)?;
    spdlog::info!(
        "Read {} of input from {}",
        human_bytes::human_bytes(contents.len() as f64),
        path.display()
    );
    parse_particles(&contents, delimiter, num_cameras)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn row(particle_id: &str, time: &str, camera_id: &str, area: &str) -> String {
        let mut entries = vec![
            particle_id.to_string(),
            String::from("10.28.2015"),
            time.to_string(),
            String::from("1.5"),
            camera_id.to_string(),
            String::from("1"),
        ];
        for idx in 0..ImageFeatureSet::NUM_MEASUREMENTS {
            entries.push(if idx == 1 {
                area.to_string()
            } else {
                String::from("0.25")
            });
        }
        entries.join("\t")
    }

    fn header() -> String {
        String::from("particle_id\tdate\ttime\t...")
    }

    #[test]
    fn test_rows_group_by_particle() {
        let contents = [
            header(),
            row("5", "22:19:34.250000", "0", "1.0"),
            row("4", "22:19:35", "0", "2.0"),
            row("5", "22:19:34.250000", "1", "-9999"),
            String::new(),
            row("5", "22:19:34.250000", "-9999", "3.0"),
        ]
        .join("\n");
        let particles = parse_particles(&contents, "\t", 3).expect("parsed");
        assert_eq!(particles.len(), 2);

        let first = &particles[0];
        assert_eq!(first.particle_id, 5);
        assert_eq!(first.captured_at, datetime!(2015-10-28 22:19:34.25));
        assert_eq!(first.fall_speed_mps, Some(1.5));
        assert_eq!(first.images.len(), 3);
        assert_eq!(first.images[1].particle_area_mm2, None);
        assert_eq!(first.images[2].camera_id, None);
        assert_eq!(first.images[2].particle_area_mm2, Some(3.0));
        assert_eq!(first.images[0].roi_bottom_mm, Some(0.25));

        assert_eq!(particles[1].particle_id, 4);
        assert_eq!(particles[1].images.len(), 1);
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let contents = [header(), row("1", "22:19:34", "0", "1.0"), String::from("1\t2")].join("\n");
        match parse_particles(&contents, "\t", 3) {
            Err(IngestError::BadColumnCount { line, found, .. }) => {
                assert_eq!(line, 3);
                assert_eq!(found, 2);
            }
            other => panic!("unexpected result {other:?}"),
        }

        let contents = [header(), row("1", "22:19:34", "300", "1.0")].join("\n");
        assert!(matches!(
            parse_particles(&contents, "\t", 3),
            Err(IngestError::BadValue {
                line: 2,
                column: "camera_id",
                ..
            })
        ));

        let contents = [header(), row("1", "22:19:34", "0", "big")].join("\n");
        assert!(matches!(
            parse_particles(&contents, "\t", 3),
            Err(IngestError::BadValue {
                line: 2,
                column: "particle_area_mm2",
                ..
            })
        ));

        let contents = [header(), row("1", "25:19:34", "0", "1.0")].join("\n");
        assert!(matches!(
            parse_particles(&contents, "\t", 3),
            Err(IngestError::BadTimestamp { line: 2, .. })
        ));
    }

    #[test]
    fn test_empty_input_has_no_header() {
        assert!(matches!(
            parse_particles("", "\t", 3),
            Err(IngestError::NoHeader)
        ));
        assert!(parse_particles("header only", "\t", 3)
            .expect("parsed")
            .is_empty());
    }

    #[test]
    fn test_missing_file() {
        let result = read_particles(Path::new("/definitely/not/here.tsv"), "\t", 3);
        assert!(matches!(result, Err(IngestError::BadFilePath(_))));
    }
}
