// range/filter.rs

// Filtering policy of a range device: how long readings live in each buffer,
// how far from the robot cumulative readings may be, and how densely readings
// are allowed to pack. Values come from configuration, so nonsense is clamped
// to "disabled" with a warning instead of being rejected.

// Dependencies
use log::warn;
use serde::{Deserialize, Serialize};

/// Age, distance and spacing limits for the two buffers of a device.
///
/// `None` (or `0.0` for the spacing limits) disables a limit. Distances are in
/// millimetres and ages in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    /// Current readings older than this are dropped each cycle.
    pub max_seconds_current: Option<f64>,
    /// Cumulative readings older than this are dropped each cycle.
    pub max_seconds_cumulative: Option<f64>,
    /// Cumulative readings farther than this from the robot's pose at filter
    /// time are dropped each cycle.
    pub max_dist_cumulative: Option<f64>,
    /// A current reading closer than this to an existing one is not added.
    pub min_dist_between_current: f64,
    /// A cumulative reading closer than this to an existing one is not added.
    pub min_dist_between_cumulative: f64,
    /// Readings farther than this from the robot never enter the cumulative
    /// buffer.
    pub max_insert_dist_cumulative: Option<f64>,
}

impl Default for FilterParams {
    fn default() -> Self {
        FilterParams {
            max_seconds_current: None,
            max_seconds_cumulative: None,
            max_dist_cumulative: None,
            min_dist_between_current: 0.0,
            min_dist_between_cumulative: 0.0,
            max_insert_dist_cumulative: None,
        }
    }
}

impl FilterParams {
    /// Returns a copy with invalid values clamped to their disabled state.
    ///
    /// `device` only labels the log lines.
    pub fn sanitized(&self, device: &str) -> FilterParams {
        FilterParams {
            max_seconds_current: positive_or_none(device, "max_seconds_current", self.max_seconds_current),
            max_seconds_cumulative: positive_or_none(
                device,
                "max_seconds_cumulative",
                self.max_seconds_cumulative,
            ),
            max_dist_cumulative: positive_or_none(device, "max_dist_cumulative", self.max_dist_cumulative),
            min_dist_between_current: non_negative_or_zero(
                device,
                "min_dist_between_current",
                self.min_dist_between_current,
            ),
            min_dist_between_cumulative: non_negative_or_zero(
                device,
                "min_dist_between_cumulative",
                self.min_dist_between_cumulative,
            ),
            max_insert_dist_cumulative: positive_or_none(
                device,
                "max_insert_dist_cumulative",
                self.max_insert_dist_cumulative,
            ),
        }
    }

    /// Squared forms of the distance limits, for the hot paths.
    pub fn squared(&self) -> SquaredLimits {
        SquaredLimits {
            max_dist_cumulative: self.max_dist_cumulative.map(|d| d * d),
            min_dist_between_current: self.min_dist_between_current * self.min_dist_between_current,
            min_dist_between_cumulative: self.min_dist_between_cumulative * self.min_dist_between_cumulative,
            max_insert_dist_cumulative: self.max_insert_dist_cumulative.map(|d| d * d),
        }
    }
}

/// Distance limits of [`FilterParams`] pre-squared.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SquaredLimits {
    /// Squared [`FilterParams::max_dist_cumulative`].
    pub max_dist_cumulative: Option<f64>,
    /// Squared [`FilterParams::min_dist_between_current`].
    pub min_dist_between_current: f64,
    /// Squared [`FilterParams::min_dist_between_cumulative`].
    pub min_dist_between_cumulative: f64,
    /// Squared [`FilterParams::max_insert_dist_cumulative`].
    pub max_insert_dist_cumulative: Option<f64>,
}

fn positive_or_none(device: &str, field: &str, value: Option<f64>) -> Option<f64> {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => Some(v),
        Some(v) => {
            warn!("{}: {} = {} is not a positive number, disabling it", device, field, v);
            None
        }
        None => None,
    }
}

fn non_negative_or_zero(device: &str, field: &str, value: f64) -> f64 {
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        warn!("{}: {} = {} is invalid, using 0", device, field, value);
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_clamps_bad_values() {
        let params = FilterParams {
            max_seconds_current: Some(-1.0),
            max_seconds_cumulative: Some(f64::NAN),
            max_dist_cumulative: Some(0.0),
            min_dist_between_current: -5.0,
            min_dist_between_cumulative: 20.0,
            max_insert_dist_cumulative: Some(3000.0),
        };
        let clean = params.sanitized("test");
        assert_eq!(clean.max_seconds_current, None);
        assert_eq!(clean.max_seconds_cumulative, None);
        assert_eq!(clean.max_dist_cumulative, None);
        assert_eq!(clean.min_dist_between_current, 0.0);
        assert_eq!(clean.min_dist_between_cumulative, 20.0);
        assert_eq!(clean.max_insert_dist_cumulative, Some(3000.0));
    }

    #[test]
    fn test_squared_limits() {
        let params = FilterParams {
            max_dist_cumulative: Some(100.0),
            min_dist_between_cumulative: 50.0,
            ..FilterParams::default()
        };
        let sq = params.squared();
        assert_eq!(sq.max_dist_cumulative, Some(10_000.0));
        assert_eq!(sq.min_dist_between_cumulative, 2500.0);
        assert_eq!(sq.min_dist_between_current, 0.0);
        assert_eq!(sq.max_insert_dist_cumulative, None);
    }

    #[test]
    fn test_yaml_defaults_missing_fields() {
        let params: FilterParams = serde_yaml::from_str("max_seconds_current: 2.5\n").unwrap();
        assert_eq!(params.max_seconds_current, Some(2.5));
        assert_eq!(params.min_dist_between_cumulative, 0.0);
        assert_eq!(params.max_dist_cumulative, None);
    }
}
