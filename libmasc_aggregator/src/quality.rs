use super::config::ImageQualityParameters;
use super::features::ImageFeatureSet;

/// The outcome of the six image quality checks.
///
/// `passed_all_checks` is derived from the six checks and cannot be set independently. Verdicts
/// from several inputs are merged with [`QualityVerdict::and`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QualityVerdict {
    pub passed_min_size: bool,
    pub passed_intensity_range: bool,
    pub passed_intensity_max: bool,
    pub passed_edge_touch: bool,
    pub passed_focus: bool,
    pub passed_bottom_location: bool,
}

impl QualityVerdict {
    /// Every check passed. Starting point when combining verdicts
    pub fn all_passed() -> Self {
        Self {
            passed_min_size: true,
            passed_intensity_range: true,
            passed_intensity_max: true,
            passed_edge_touch: true,
            passed_focus: true,
            passed_bottom_location: true,
        }
    }

    pub fn passed_all_checks(&self) -> bool {
        self.checks().iter().all(|c| *c)
    }

    /// Logical AND of each check
    pub fn and(&self, other: &Self) -> Self {
        Self {
            passed_min_size: self.passed_min_size && other.passed_min_size,
            passed_intensity_range: self.passed_intensity_range && other.passed_intensity_range,
            passed_intensity_max: self.passed_intensity_max && other.passed_intensity_max,
            passed_edge_touch: self.passed_edge_touch && other.passed_edge_touch,
            passed_focus: self.passed_focus && other.passed_focus,
            passed_bottom_location: self.passed_bottom_location && other.passed_bottom_location,
        }
    }

    /// The individual checks in gate order
    pub fn checks(&self) -> [bool; 6] {
        [
            self.passed_min_size,
            self.passed_intensity_range,
            self.passed_intensity_max,
            self.passed_edge_touch,
            self.passed_focus,
            self.passed_bottom_location,
        ]
    }

    /// One character per check, '1' if passed, in gate order
    pub fn bit_string(&self) -> String {
        self.checks()
            .iter()
            .map(|c| if *c { '1' } else { '0' })
            .collect()
    }
}

/// Round to two decimal places the same way for the gate and for QC flagging
pub fn rounded_focus(focus: f64) -> f64 {
    (focus * 100.0).round() / 100.0
}

/// Evaluates images against the configured thresholds. Pure; holds only a copy of the thresholds.
#[derive(Debug, Clone)]
pub struct ImageQualityGate {
    parameters: ImageQualityParameters,
}

impl ImageQualityGate {
    pub fn new(parameters: ImageQualityParameters) -> Self {
        Self { parameters }
    }

    pub fn parameters(&self) -> &ImageQualityParameters {
        &self.parameters
    }

    /// Run all six checks. A missing measurement fails the check that needs it
    pub fn evaluate(&self, image: &ImageFeatureSet) -> QualityVerdict {
        let p = &self.parameters;
        let min_size_mm = p.min_flake_size_mm();
        let [bottom_min, bottom_max] = p.bottom_location_range_mm;

        QualityVerdict {
            passed_min_size: image
                .particle_area_mm2
                .is_some_and(|area| area > min_size_mm * min_size_mm),
            passed_intensity_range: image
                .intensity_variability
                .is_some_and(|v| v >= p.min_intensity_variability),
            passed_intensity_max: image
                .max_intensity
                .is_some_and(|v| v >= p.min_max_pixel_intensity),
            passed_edge_touch: image
                .edge_touch_mm
                .is_some_and(|e| e <= p.max_edge_touch_length_mm()),
            passed_focus: !p.reject_out_of_focus
                || image
                    .roi_focus
                    .is_some_and(|f| rounded_focus(f) >= p.focus_threshold),
            passed_bottom_location: image
                .roi_bottom_mm
                .is_some_and(|b| b >= bottom_min && b <= bottom_max),
        }
    }
}
