//! User settings and their JSON store
//!
//! The engine consumes [`Settings`] as a plain value object. Only
//! [`SettingsStore`] knows about the file on disk; its shape matches the
//! `settings.json` written by earlier versions of the tool.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::{ConfigError, Resolution};

/// Default pixel-difference threshold
pub const DEFAULT_SENSITIVITY: u64 = 10_000;

/// Arm/disarm hours of day.
///
/// Purely informational: the engine reports the next change but never
/// applies it on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub arm: u8,
    pub disarm: u8,
}

impl Default for Schedule {
    fn default() -> Self {
        Self { arm: 21, disarm: 7 }
    }
}

/// What the next scheduled change would do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAction {
    Arm,
    Disarm,
}

impl fmt::Display for ScheduleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleAction::Arm => write!(f, "arm"),
            ScheduleAction::Disarm => write!(f, "disarm"),
        }
    }
}

/// The next scheduled change, reported as a bare hour of day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleChange {
    pub action: ScheduleAction,
    pub hour: u8,
}

impl Schedule {
    /// Next change relative to `hour`.
    ///
    /// The branch order is fixed: before the arm hour the next change is
    /// "arm"; otherwise before the disarm hour it is "disarm"; otherwise it
    /// wraps to "arm". With arm=21/disarm=7 this reports "arm at 21" for
    /// every hour from 0 through 23, including mid-morning.
    pub fn next_change(&self, hour: u8) -> ScheduleChange {
        if hour < self.arm {
            ScheduleChange {
                action: ScheduleAction::Arm,
                hour: self.arm,
            }
        } else if hour < self.disarm {
            ScheduleChange {
                action: ScheduleAction::Disarm,
                hour: self.disarm,
            }
        } else {
            ScheduleChange {
                action: ScheduleAction::Arm,
                hour: self.arm,
            }
        }
    }
}

/// Flat configuration snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Capture resolution
    #[serde(rename = "video_resolution")]
    pub resolution: Resolution,
    /// Motion score a cycle must exceed to count as motion
    pub sensitivity: u64,
    /// Informational arm/disarm hours
    #[serde(rename = "schedule_times")]
    pub schedule: Schedule,
    /// Camera device index
    #[serde(rename = "current_camera")]
    pub camera_index: u32,
    /// Compute motion regions while armed
    #[serde(rename = "show_motion")]
    pub show_motion_highlight: bool,
    /// Run detection (with regions) even while disarmed
    pub preview_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            sensitivity: DEFAULT_SENSITIVITY,
            schedule: Schedule::default(),
            camera_index: 0,
            show_motion_highlight: false,
            preview_mode: false,
        }
    }
}

impl Settings {
    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "resolution {} has a zero dimension",
                self.resolution
            )));
        }
        for (name, hour) in [("arm", self.schedule.arm), ("disarm", self.schedule.disarm)] {
            if hour > 23 {
                return Err(ConfigError::Invalid(format!(
                    "{} hour {} is outside 0-23",
                    name, hour
                )));
            }
        }
        Ok(())
    }

    /// Change the resolution and reset sensitivity to 5% of its pixel count
    pub fn set_resolution(&mut self, resolution: Resolution) {
        self.resolution = resolution;
        self.sensitivity = resolution.pixels() * 5 / 100;
    }
}

/// Loads and saves [`Settings`] as pretty-printed JSON
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a settings file exists yet
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load settings. A missing file yields the defaults; missing keys fall
    /// back to their defaults individually.
    pub fn load(&self) -> Result<Settings, ConfigError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No settings file at {:?}, using defaults", self.path);
                return Ok(Settings::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let settings: Settings = serde_json::from_str(&text)?;
        settings.validate()?;
        debug!(?settings, "Settings loaded from {:?}", self.path);
        Ok(settings)
    }

    /// Save settings, replacing the file atomically
    pub fn save(&self, settings: &Settings) -> Result<(), ConfigError> {
        settings.validate()?;
        let json = serde_json::to_string_pretty(settings)?;

        let io_err = |source| ConfigError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;

        info!("Settings saved to {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_before_arm_hour() {
        let s = Schedule { arm: 21, disarm: 7 };
        let next = s.next_change(3);
        assert_eq!(next.action, ScheduleAction::Arm);
        assert_eq!(next.hour, 21);
    }

    #[test]
    fn schedule_after_arm_hour_wraps_to_arm() {
        let s = Schedule { arm: 21, disarm: 7 };
        let next = s.next_change(23);
        assert_eq!(next.action, ScheduleAction::Arm);
        assert_eq!(next.hour, 21);
    }

    #[test]
    fn schedule_mid_morning_still_reports_arm() {
        // 10 < 21, so the first branch wins; "disarm at 7" would be wrong.
        let s = Schedule { arm: 21, disarm: 7 };
        let next = s.next_change(10);
        assert_eq!(next.action, ScheduleAction::Arm);
        assert_eq!(next.hour, 21);
    }

    #[test]
    fn schedule_disarm_branch_when_disarm_is_later() {
        let s = Schedule { arm: 8, disarm: 18 };
        assert_eq!(s.next_change(7).action, ScheduleAction::Arm);
        let next = s.next_change(12);
        assert_eq!(next.action, ScheduleAction::Disarm);
        assert_eq!(next.hour, 18);
        assert_eq!(s.next_change(20).action, ScheduleAction::Arm);
    }

    #[test]
    fn every_hour_matches_branch_order() {
        let s = Schedule { arm: 21, disarm: 7 };
        for hour in 0..24u8 {
            assert_eq!(s.next_change(hour).action, ScheduleAction::Arm, "hour {}", hour);
        }
    }

    #[test]
    fn settings_parse_legacy_file_shape() {
        let json = r#"{
            "video_resolution": [1280, 720],
            "sensitivity": 46080,
            "schedule_times": {"arm": 22, "disarm": 6},
            "current_camera": 1,
            "show_motion": true,
            "preview_mode": false
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.resolution, Resolution::new(1280, 720));
        assert_eq!(settings.sensitivity, 46080);
        assert_eq!(settings.schedule, Schedule { arm: 22, disarm: 6 });
        assert_eq!(settings.camera_index, 1);
        assert!(settings.show_motion_highlight);
        assert!(!settings.preview_mode);
    }

    #[test]
    fn settings_missing_keys_use_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"sensitivity": 5}"#).unwrap();
        assert_eq!(settings.sensitivity, 5);
        assert_eq!(settings.resolution, Resolution::new(640, 480));
        assert_eq!(settings.schedule, Schedule::default());
    }

    #[test]
    fn set_resolution_resets_sensitivity_to_five_percent() {
        let mut settings = Settings::default();
        settings.set_resolution(Resolution::new(1920, 1080));
        assert_eq!(settings.sensitivity, 103_680);
    }

    #[test]
    fn validate_rejects_bad_hours() {
        let mut settings = Settings::default();
        settings.schedule.arm = 24;
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn store_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json"));
        assert!(!store.exists());
        assert_eq!(store.load().unwrap(), Settings::default());
    }

    #[test]
    fn store_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("nested/settings.json"));

        let mut settings = Settings::default();
        settings.sensitivity = 1234;
        settings.preview_mode = true;
        store.save(&settings).unwrap();

        assert!(store.exists());
        assert_eq!(store.load().unwrap(), settings);
    }

    #[test]
    fn store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();
        let err = SettingsStore::new(path).load().unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
