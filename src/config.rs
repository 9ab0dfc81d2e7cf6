//! Configuration for mvr
//!
//! One YAML document with a section per concern. Every field has a default, so
//! a file only needs to list what it changes. Out-of-range numbers are clamped
//! with a warning; only settings that cannot be repaired are errors.

use log::{info, warn, LevelFilter};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::error::{MvrError, Result};
use crate::sensors::{BumperSettings, ForbiddenSettings, LaserSettings, SonarSettings};
use crate::session::SessionConfig;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MvrConfig {
    /// Cycle timing and robot geometry.
    pub session: SessionConfig,
    /// Log level.
    pub logging: LoggingConfig,
    /// Sonar device and transducer layout.
    pub sonar: SonarSettings,
    /// Laser device and scan cleaning.
    pub laser: LaserSettings,
    /// Bumper device.
    pub bumpers: BumperSettings,
    /// Map forbidden-zone device.
    pub forbidden: ForbiddenSettings,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level (trace, debug, info, warn, error, off). `RUST_LOG`
    /// overrides it.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// The configured level as a filter for env_logger.
    pub fn level_filter(&self) -> Result<LevelFilter> {
        self.level
            .parse()
            .map_err(|_| MvrError::InvalidConfig(format!("unknown log level '{}'", self.level)))
    }
}

impl MvrConfig {
    /// Load configuration from a YAML file
    ///
    /// # Example
    /// ```no_run
    /// use mvr::config::MvrConfig;
    ///
    /// let config = MvrConfig::from_file("mvr.yaml")?;
    /// # Ok::<(), mvr::MvrError>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config = Self::from_yaml_str(&contents)?;
        info!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    /// Parses and validates a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut config: MvrConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the whole configuration, defaults included.
    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Save configuration to a YAML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_yaml_string()?)?;
        Ok(())
    }

    /// Clamps repairable values and rejects the rest.
    pub fn validate(&mut self) -> Result<()> {
        self.logging.level_filter()?;

        let session = &mut self.session;
        if session.cycle_ms == 0 {
            warn!("session.cycle_ms must be positive, using 100");
            session.cycle_ms = 100;
        }
        if !(session.robot_radius.is_finite() && session.robot_radius > 0.0) {
            warn!("session.robot_radius {} is invalid, using 250", session.robot_radius);
            session.robot_radius = 250.0;
        }

        let sonar = &mut self.sonar;
        clamp_non_negative(&mut sonar.near_dist, "sonar.near_dist", 50.0);
        clamp_non_negative(&mut sonar.far_dist, "sonar.far_dist", 3000.0);

        let laser = &mut self.laser;
        clamp_non_negative(&mut laser.clean_dist, "laser.clean_dist", 75.0);
        clamp_non_negative(&mut laser.clean_interval, "laser.clean_interval", 1.0);

        let bumpers = &mut self.bumpers;
        if !(bumpers.angle_range.is_finite() && bumpers.angle_range > 0.0 && bumpers.angle_range <= 360.0) {
            warn!("bumpers.angle_range {} is invalid, using 135", bumpers.angle_range);
            bumpers.angle_range = 135.0;
        }

        let forbidden = &mut self.forbidden;
        if !(forbidden.distance_increment.is_finite() && forbidden.distance_increment > 0.0) {
            warn!(
                "forbidden.distance_increment {} is invalid, using 100",
                forbidden.distance_increment
            );
            forbidden.distance_increment = 100.0;
        }

        let mut names = HashSet::new();
        for name in [
            &self.sonar.device.name,
            &self.laser.device.name,
            &self.bumpers.device.name,
            &self.forbidden.device.name,
        ] {
            if name.is_empty() {
                return Err(MvrError::InvalidConfig("device names must not be empty".to_string()));
            }
            if !names.insert(name.as_str()) {
                return Err(MvrError::InvalidConfig(format!("device name '{}' is used twice", name)));
            }
        }
        Ok(())
    }
}

fn clamp_non_negative(value: &mut f64, field: &str, default: f64) {
    if !(value.is_finite() && *value >= 0.0) {
        warn!("{} {} is invalid, using {}", field, value, default);
        *value = default;
    }
}
