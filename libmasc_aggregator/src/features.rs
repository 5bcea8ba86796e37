use time::PrimitiveDateTime;

use super::constants::{
    MISSING_VALUE, RAIN_MAX_INTENSITY_VARIABILITY, RAIN_MAX_MEAN_INTENSITY, RAIN_MAX_OBJECTS,
};

/// A single measurement. `None` is the in-memory form of the instrument's missing value.
pub type Measurement = Option<f64>;

/// Convert a raw instrument value into a Measurement, mapping the sentinel (and NaN) to None
pub fn from_sentinel(value: f64) -> Measurement {
    if value == MISSING_VALUE || value.is_nan() {
        None
    } else {
        Some(value)
    }
}

/// The morphological measurements produced by the feature extractor for one camera image.
///
/// Every measurement may be missing. The set is immutable once built; the particle owning it only
/// ever reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFeatureSet {
    pub camera_id: Option<u8>,
    pub captured_at: PrimitiveDateTime,
    /// Number of objects which passed the extractor's filters
    pub num_objects: Option<u32>,
    pub max_dimension_mm: Measurement,
    pub particle_area_mm2: Measurement,
    pub area_eq_radius_mm: Measurement,
    pub perimeter_mm: Measurement,
    /// Length of the object outline touching the image frame
    pub edge_touch_mm: Measurement,
    /// Angle from horizontal to the major axis
    pub orientation_deg: Measurement,
    /// Minor over major axis
    pub aspect_ratio: Measurement,
    pub complexity: Measurement,
    pub cross_section_mm2: Measurement,
    /// Mean pixel intensity in [0, 1]
    pub mean_intensity: Measurement,
    /// Mean pixel intensity variability in [0, 1]
    pub intensity_variability: Measurement,
    /// Brightest pixel of the object in [0, 1]
    pub max_intensity: Measurement,
    pub roi_focus: Measurement,
    pub roi_position_mm: [Measurement; 2],
    pub roi_half_extent_mm: [Measurement; 2],
    /// Distance of the bottom of the region of interest from the top of the frame
    pub roi_bottom_mm: Measurement,
}

impl ImageFeatureSet {
    pub const NUM_MEASUREMENTS: usize = 18;

    /// An image for which the extractor produced nothing
    pub fn empty(camera_id: Option<u8>, captured_at: PrimitiveDateTime) -> Self {
        Self {
            camera_id,
            captured_at,
            num_objects: None,
            max_dimension_mm: None,
            particle_area_mm2: None,
            area_eq_radius_mm: None,
            perimeter_mm: None,
            edge_touch_mm: None,
            orientation_deg: None,
            aspect_ratio: None,
            complexity: None,
            cross_section_mm2: None,
            mean_intensity: None,
            intensity_variability: None,
            max_intensity: None,
            roi_focus: None,
            roi_position_mm: [None, None],
            roi_half_extent_mm: [None, None],
            roi_bottom_mm: None,
        }
    }

    /// The fields which take part in averaging, all or nothing
    pub fn averaged_fields(&self) -> Option<AveragedFields> {
        Some(AveragedFields {
            max_dimension_mm: self.max_dimension_mm?,
            particle_area_mm2: self.particle_area_mm2?,
            area_eq_radius_mm: self.area_eq_radius_mm?,
            perimeter_mm: self.perimeter_mm?,
            orientation_deg: self.orientation_deg?,
            aspect_ratio: self.aspect_ratio?,
            complexity: self.complexity?,
            cross_section_mm2: self.cross_section_mm2?,
            mean_intensity: self.mean_intensity?,
            intensity_variability: self.intensity_variability?,
        })
    }

    /// True if the extractor produced no measurement at all for this image
    pub fn is_blank(&self) -> bool {
        self.num_objects.is_none() && self.measurements().iter().all(|m| m.is_none())
    }

    /// A view is "clear" (not rain-like) when it holds exactly one dim, smooth object
    pub fn is_clear_view(&self) -> bool {
        matches!(self.num_objects, Some(n) if n == RAIN_MAX_OBJECTS)
            && matches!(self.intensity_variability, Some(v) if v < RAIN_MAX_INTENSITY_VARIABILITY)
            && matches!(self.mean_intensity, Some(v) if v < RAIN_MAX_MEAN_INTENSITY)
    }

    /// All scalar measurements in output column order
    pub fn measurements(&self) -> [Measurement; Self::NUM_MEASUREMENTS] {
        [
            self.max_dimension_mm,
            self.particle_area_mm2,
            self.area_eq_radius_mm,
            self.perimeter_mm,
            self.edge_touch_mm,
            self.orientation_deg,
            self.aspect_ratio,
            self.complexity,
            self.cross_section_mm2,
            self.mean_intensity,
            self.intensity_variability,
            self.max_intensity,
            self.roi_focus,
            self.roi_position_mm[0],
            self.roi_position_mm[1],
            self.roi_half_extent_mm[0],
            self.roi_half_extent_mm[1],
            self.roi_bottom_mm,
        ]
    }
}

/// The averaged morphological fields. Kept as a unit so they are present or missing together.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AveragedFields {
    pub max_dimension_mm: f64,
    pub particle_area_mm2: f64,
    pub area_eq_radius_mm: f64,
    pub perimeter_mm: f64,
    pub orientation_deg: f64,
    pub aspect_ratio: f64,
    pub complexity: f64,
    pub cross_section_mm2: f64,
    pub mean_intensity: f64,
    pub intensity_variability: f64,
}

impl AveragedFields {
    pub const NUM_FIELDS: usize = 10;

    /// Field values in output column order
    pub fn as_array(&self) -> [f64; Self::NUM_FIELDS] {
        [
            self.max_dimension_mm,
            self.particle_area_mm2,
            self.area_eq_radius_mm,
            self.perimeter_mm,
            self.orientation_deg,
            self.aspect_ratio,
            self.complexity,
            self.cross_section_mm2,
            self.mean_intensity,
            self.intensity_variability,
        ]
    }

    pub fn accumulate(&mut self, other: &Self) {
        self.max_dimension_mm += other.max_dimension_mm;
        self.particle_area_mm2 += other.particle_area_mm2;
        self.area_eq_radius_mm += other.area_eq_radius_mm;
        self.perimeter_mm += other.perimeter_mm;
        self.orientation_deg += other.orientation_deg;
        self.aspect_ratio += other.aspect_ratio;
        self.complexity += other.complexity;
        self.cross_section_mm2 += other.cross_section_mm2;
        self.mean_intensity += other.mean_intensity;
        self.intensity_variability += other.intensity_variability;
    }

    pub fn scale(&mut self, factor: f64) {
        self.max_dimension_mm *= factor;
        self.particle_area_mm2 *= factor;
        self.area_eq_radius_mm *= factor;
        self.perimeter_mm *= factor;
        self.orientation_deg *= factor;
        self.aspect_ratio *= factor;
        self.complexity *= factor;
        self.cross_section_mm2 *= factor;
        self.mean_intensity *= factor;
        self.intensity_variability *= factor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{passing_image, CAPTURE_TIME};

    #[test]
    fn test_sentinel_is_missing() {
        assert_eq!(from_sentinel(MISSING_VALUE), None);
        assert_eq!(from_sentinel(f64::NAN), None);
        assert_eq!(from_sentinel(0.0), Some(0.0));
        assert_eq!(from_sentinel(-9998.5), Some(-9998.5));
    }

    #[test]
    fn test_averaged_fields_need_every_value() {
        let image = passing_image();
        let fields = image.averaged_fields().expect("all present");
        assert_eq!(fields.aspect_ratio, 0.5);

        let mut partial = image.clone();
        partial.complexity = None;
        assert!(partial.averaged_fields().is_none());
        // max intensity is not averaged
        partial = image;
        partial.max_intensity = None;
        assert!(partial.averaged_fields().is_some());
    }

    #[test]
    fn test_blank_and_clear_views() {
        let blank = ImageFeatureSet::empty(Some(0), CAPTURE_TIME);
        assert!(blank.is_blank());
        assert!(!blank.is_clear_view());

        let image = passing_image();
        assert!(!image.is_blank());
        assert!(image.is_clear_view());

        let mut crowded = image.clone();
        crowded.num_objects = Some(2);
        assert!(!crowded.is_clear_view());

        let mut bright = image;
        bright.mean_intensity = Some(RAIN_MAX_MEAN_INTENSITY);
        assert!(!bright.is_clear_view());
    }

    #[test]
    fn test_accumulate_then_scale() {
        let fields = passing_image().averaged_fields().expect("all present");
        let mut sum = AveragedFields::default();
        sum.accumulate(&fields);
        sum.accumulate(&fields);
        sum.scale(0.5);
        assert_eq!(sum, fields);
    }
}
