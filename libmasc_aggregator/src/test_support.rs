use time::macros::datetime;
use time::PrimitiveDateTime;

use super::features::ImageFeatureSet;
use super::quality::QualityVerdict;

pub const CAPTURE_TIME: PrimitiveDateTime = datetime!(2015-10-28 22:19:34);

/// An image that passes every default quality check and looks like a single clear snowflake
pub fn passing_image() -> ImageFeatureSet {
    let mut image = ImageFeatureSet::empty(Some(0), CAPTURE_TIME);
    image.num_objects = Some(1);
    image.max_dimension_mm = Some(2.0);
    image.particle_area_mm2 = Some(1.0);
    image.area_eq_radius_mm = Some(0.56);
    image.perimeter_mm = Some(5.0);
    image.edge_touch_mm = Some(0.0);
    image.orientation_deg = Some(10.0);
    image.aspect_ratio = Some(0.5);
    image.complexity = Some(1.2);
    image.cross_section_mm2 = Some(1.1);
    image.mean_intensity = Some(0.2);
    image.intensity_variability = Some(0.1);
    image.max_intensity = Some(0.5);
    image.roi_focus = Some(0.05);
    image.roi_position_mm = [Some(10.0), Some(30.0)];
    image.roi_half_extent_mm = [Some(1.0), Some(1.5)];
    image.roi_bottom_mm = Some(35.0);
    image
}

pub fn failed_verdict() -> QualityVerdict {
    QualityVerdict {
        passed_min_size: false,
        ..QualityVerdict::all_passed()
    }
}
