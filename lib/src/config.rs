//! Welder configuration.
//!
//! All tunables of the post-processor live in [`WelderConfig`]. The defaults
//! are conservative: 0.05 mm resolution keeps welded paths visually
//! indistinguishable from the source on common FDM printers.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Error, Result};

/// Configuration for the welder and the arc accumulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WelderConfig {
    /// Maximum deviation of the fitted arc from any source vertex (mm).
    pub resolution_mm: f64,

    /// Relative cap on per-segment length deviation within an arc (0-1).
    pub path_tolerance_percent: f64,

    /// Arcs with a larger radius are kept as line segments (mm).
    pub max_radius_mm: f64,

    /// Firmware-interpolation floor: minimum number of firmware segments an
    /// emitted arc must produce. 0 disables firmware compensation.
    pub min_arc_segments: u32,

    /// Firmware-interpolation segment length (mm), paired with
    /// `min_arc_segments`. 0 disables firmware compensation.
    pub mm_per_arc_segment: f64,

    /// Whether G90/G91 also switches the extruder between absolute and
    /// relative mode (Marlin behavior when configured so).
    pub g90_influences_extruder: bool,

    /// Permit helical arcs with monotone Z progression.
    pub allow_3d_arcs: bool,

    /// Track the maximum observed decimal places per axis and emit arcs at
    /// that precision.
    pub allow_dynamic_precision: bool,

    /// Decimal places for X/Y/Z/I/J in emitted arcs (floor when dynamic
    /// precision is enabled).
    pub default_xyz_precision: u8,

    /// Decimal places for E in emitted arcs (floor when dynamic precision is
    /// enabled).
    pub default_e_precision: u8,

    /// Upper bound on run length, sized to the motion parser's interpolation
    /// capacity downstream.
    pub buffer_size: usize,
}

impl Default for WelderConfig {
    fn default() -> Self {
        Self {
            resolution_mm: 0.05,
            path_tolerance_percent: 0.05, // 5%
            max_radius_mm: 1_000_000.0,   // 1 km: effectively unbounded
            min_arc_segments: 0,
            mm_per_arc_segment: 0.0,
            g90_influences_extruder: false,
            allow_3d_arcs: false,
            allow_dynamic_precision: false,
            default_xyz_precision: 3,
            default_e_precision: 5,
            buffer_size: 1000,
        }
    }
}

impl WelderConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the resolution (mm).
    pub fn resolution_mm(mut self, resolution: f64) -> Self {
        self.resolution_mm = resolution;
        self
    }

    /// Builder: set the path tolerance (0-1).
    pub fn path_tolerance_percent(mut self, tolerance: f64) -> Self {
        self.path_tolerance_percent = tolerance;
        self
    }

    /// Builder: set the maximum radius (mm).
    pub fn max_radius_mm(mut self, radius: f64) -> Self {
        self.max_radius_mm = radius;
        self
    }

    /// Builder: set the firmware-compensation floor. Either value at 0
    /// disables compensation.
    pub fn firmware_compensation(mut self, mm_per_arc_segment: f64, min_arc_segments: u32) -> Self {
        self.mm_per_arc_segment = mm_per_arc_segment;
        self.min_arc_segments = min_arc_segments;
        self
    }

    /// Builder: permit helical arcs.
    pub fn allow_3d_arcs(mut self, allow: bool) -> Self {
        self.allow_3d_arcs = allow;
        self
    }

    /// Builder: enable dynamic precision tracking.
    pub fn allow_dynamic_precision(mut self, allow: bool) -> Self {
        self.allow_dynamic_precision = allow;
        self
    }

    /// True when both firmware-compensation knobs are engaged.
    pub fn firmware_compensation_enabled(&self) -> bool {
        self.mm_per_arc_segment > 0.0 && self.min_arc_segments > 0
    }

    /// The largest run the accumulator may grow, leaving headroom in the
    /// downstream parser buffer.
    pub fn max_segments(&self) -> usize {
        self.buffer_size.saturating_sub(5)
    }

    /// Load a configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.resolution_mm <= 0.0 {
            return Err(Error::Config("resolution_mm must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.path_tolerance_percent) {
            return Err(Error::Config(
                "path_tolerance_percent must be within 0..=1".into(),
            ));
        }
        if self.max_radius_mm <= 0.0 {
            return Err(Error::Config("max_radius_mm must be positive".into()));
        }
        if self.mm_per_arc_segment < 0.0 {
            return Err(Error::Config("mm_per_arc_segment must not be negative".into()));
        }
        if self.default_xyz_precision > 6 || self.default_e_precision > 6 {
            return Err(Error::Config("precisions are limited to 6 decimals".into()));
        }
        if self.buffer_size < 10 {
            return Err(Error::Config("buffer_size must be at least 10".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WelderConfig::default();
        assert!((config.resolution_mm - 0.05).abs() < 1e-12);
        assert!((config.path_tolerance_percent - 0.05).abs() < 1e-12);
        assert_eq!(config.default_xyz_precision, 3);
        assert_eq!(config.default_e_precision, 5);
        assert!(!config.firmware_compensation_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = WelderConfig::new()
            .resolution_mm(0.1)
            .max_radius_mm(500.0)
            .firmware_compensation(1.0, 14)
            .allow_3d_arcs(true);
        assert!((config.resolution_mm - 0.1).abs() < 1e-12);
        assert!((config.max_radius_mm - 500.0).abs() < 1e-12);
        assert!(config.firmware_compensation_enabled());
        assert!(config.allow_3d_arcs);
    }

    #[test]
    fn test_max_segments_headroom() {
        let config = WelderConfig::default();
        assert_eq!(config.max_segments(), 995);
    }

    #[test]
    fn test_validate_rejects_bad_tolerance() {
        let config = WelderConfig::default().path_tolerance_percent(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let config = WelderConfig::default().resolution_mm(0.025);
        let json = serde_json::to_string(&config).unwrap();
        let back: WelderConfig = serde_json::from_str(&json).unwrap();
        assert!((back.resolution_mm - 0.025).abs() < 1e-12);
    }

    #[test]
    fn test_partial_json() {
        // serde(default) fills unlisted fields.
        let back: WelderConfig = serde_json::from_str(r#"{"resolution_mm": 0.02}"#).unwrap();
        assert!((back.resolution_mm - 0.02).abs() < 1e-12);
        assert_eq!(back.buffer_size, 1000);
    }
}
