//
// pgcam - Point Grey camera acquisition engine
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Program configuration.
//!

use crate::camera::{CameraSettings, Size};
use crate::camera::drivers::simulator::SimConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod groups {
    pub const ACQUISITION: &str = "Acquisition";
    pub const CAMERA: &str = "Camera";
    pub const SIMULATOR: &str = "Simulator";
}

mod keys {
    // group: CAMERA
    pub const DRIVER: &str = "Driver";
    pub const SERIAL_NUMBER: &str = "SerialNumber";
    pub const PACKET_SIZE: &str = "PacketSize";
    pub const PACKET_DELAY: &str = "PacketDelay";
    pub const GRAB_TIMEOUT_MS: &str = "GrabTimeoutMs";

    // group: ACQUISITION
    pub const BUFFER_FRAMES: &str = "BufferFrames";
    pub const NB_FRAMES: &str = "NbFrames";
    pub const EXPOSURE_MS: &str = "ExposureMs";
    pub const LATENCY_MS: &str = "LatencyMs";

    // group: SIMULATOR
    pub const WIDTH: &str = "Width";
    pub const HEIGHT: &str = "Height";
    pub const FRAME_PERIOD_MS: &str = "FramePeriodMs";
}

const DEFAULT_GRAB_TIMEOUT_MS: u64 = 600_000;
const DEFAULT_BUFFER_FRAMES: usize = 16;
const DEFAULT_NB_FRAMES: u64 = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
pub enum DriverKind {
    #[strum(serialize = "simulator")]
    Simulator,
    #[strum(serialize = "flycap2")]
    FlyCapture2
}

pub struct Configuration {
    table: toml::Table
}

impl Configuration {
    /// Loads the configuration file from the user's configuration directory.
    pub fn new() -> Configuration {
        let file_path = config_file_path();
        match Configuration::from_file(&file_path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("failed to load configuration from {}: {}", file_path.to_string_lossy(), e);
                Configuration{ table: toml::Table::new() }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Configuration, String> {
        let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        Configuration::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Configuration, String> {
        contents.parse::<toml::Table>()
            .map(|table| Configuration{ table })
            .map_err(|e| e.to_string())
    }

    fn value(&self, group: &str, key: &str) -> Option<&toml::Value> {
        self.table.get(group)?.as_table()?.get(key)
    }

    fn string(&self, group: &str, key: &str) -> Option<String> {
        match self.value(group, key) {
            Some(toml::Value::String(s)) => Some(s.clone()),
            Some(other) => {
                log::warn!("invalid configuration value for {}/{}: {}", group, key, other);
                None
            },
            None => None
        }
    }

    /// Returns a positive integer.
    fn positive_integer(&self, group: &str, key: &str) -> Option<u64> {
        match self.value(group, key) {
            Some(toml::Value::Integer(i)) if *i > 0 => Some(*i as u64),
            Some(other) => {
                log::warn!("invalid configuration value for {}/{}: {}", group, key, other);
                None
            },
            None => None
        }
    }

    /// Returns a non-negative number (integer or float).
    fn number(&self, group: &str, key: &str) -> Option<f64> {
        let number = match self.value(group, key) {
            Some(toml::Value::Integer(i)) => Some(*i as f64),
            Some(toml::Value::Float(f)) => Some(*f),
            Some(_) => None,
            None => return None
        };

        match number {
            Some(n) if n >= 0.0 => Some(n),
            _ => {
                log::warn!("invalid configuration value for {}/{}", group, key);
                None
            }
        }
    }

    pub fn driver(&self) -> DriverKind {
        match self.string(groups::CAMERA, keys::DRIVER) {
            Some(s) => match s.parse::<DriverKind>() {
                Ok(driver) => driver,
                Err(_) => {
                    log::warn!("unknown camera driver \"{}\"; using the simulator", s);
                    DriverKind::Simulator
                }
            },
            None => DriverKind::Simulator
        }
    }

    pub fn serial_number(&self) -> Option<u32> {
        self.positive_integer(groups::CAMERA, keys::SERIAL_NUMBER).map(|n| n as u32)
    }

    pub fn packet_size(&self) -> Option<u32> {
        self.positive_integer(groups::CAMERA, keys::PACKET_SIZE).map(|n| n as u32)
    }

    pub fn packet_delay(&self) -> Option<u32> {
        self.positive_integer(groups::CAMERA, keys::PACKET_DELAY).map(|n| n as u32)
    }

    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(
            self.positive_integer(groups::CAMERA, keys::GRAB_TIMEOUT_MS).unwrap_or(DEFAULT_GRAB_TIMEOUT_MS)
        )
    }

    pub fn camera_settings(&self) -> CameraSettings {
        CameraSettings{
            grab_timeout: self.grab_timeout(),
            packet_size: self.packet_size(),
            packet_delay: self.packet_delay()
        }
    }

    pub fn buffer_frames(&self) -> usize {
        self.positive_integer(groups::ACQUISITION, keys::BUFFER_FRAMES)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_BUFFER_FRAMES)
    }

    pub fn nb_frames(&self) -> u64 {
        match self.value(groups::ACQUISITION, keys::NB_FRAMES) {
            Some(toml::Value::Integer(i)) if *i >= 0 => *i as u64,
            Some(other) => {
                log::warn!("invalid configuration value for {}/{}: {}", groups::ACQUISITION, keys::NB_FRAMES, other);
                DEFAULT_NB_FRAMES
            },
            None => DEFAULT_NB_FRAMES
        }
    }

    /// Exposure time in seconds.
    pub fn exposure(&self) -> Option<f64> {
        self.number(groups::ACQUISITION, keys::EXPOSURE_MS).map(|ms| ms / 1000.0)
    }

    /// Latency time in seconds.
    pub fn latency(&self) -> Option<f64> {
        self.number(groups::ACQUISITION, keys::LATENCY_MS).map(|ms| ms / 1000.0)
    }

    pub fn simulator(&self) -> SimConfig {
        let mut config = SimConfig::default();

        if let (Some(width), Some(height)) = (
            self.positive_integer(groups::SIMULATOR, keys::WIDTH),
            self.positive_integer(groups::SIMULATOR, keys::HEIGHT)
        ) {
            config.sensor_size = Size::new(width as u32, height as u32);
        }
        if let Some(period) = self.positive_integer(groups::SIMULATOR, keys::FRAME_PERIOD_MS) {
            config.frame_period = Duration::from_millis(period);
        }

        config
    }
}

fn config_file_path() -> PathBuf {
    dirs::config_dir().unwrap_or_default().join("pgcam.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_empty_configuration_defaults_apply() {
        let config = Configuration::from_toml_str("").unwrap();
        assert_eq!(DriverKind::Simulator, config.driver());
        assert_eq!(Duration::from_secs(600), config.grab_timeout());
        assert_eq!(16, config.buffer_frames());
        assert_eq!(1, config.nb_frames());
        assert_eq!(None, config.exposure());
        assert_eq!(None, config.serial_number());
    }

    #[test]
    fn given_full_configuration_values_are_read() {
        let config = Configuration::from_toml_str(r#"
            [Camera]
            Driver = "flycap2"
            SerialNumber = 12345678
            PacketSize = 9000
            PacketDelay = 400
            GrabTimeoutMs = 2000

            [Acquisition]
            BufferFrames = 4
            NbFrames = 0
            ExposureMs = 12.5
            LatencyMs = 5

            [Simulator]
            Width = 320
            Height = 240
            FramePeriodMs = 10
        "#).unwrap();

        assert_eq!(DriverKind::FlyCapture2, config.driver());
        assert_eq!(Some(12345678), config.serial_number());
        let settings = config.camera_settings();
        assert_eq!(Duration::from_millis(2000), settings.grab_timeout);
        assert_eq!((Some(9000), Some(400)), (settings.packet_size, settings.packet_delay));
        assert_eq!(4, config.buffer_frames());
        assert_eq!(0, config.nb_frames());
        assert_eq!(Some(0.0125), config.exposure());
        assert_eq!(Some(0.005), config.latency());
        let sim = config.simulator();
        assert_eq!(Size::new(320, 240), sim.sensor_size);
        assert_eq!(Duration::from_millis(10), sim.frame_period);
    }

    #[test]
    fn given_invalid_values_they_are_ignored() {
        let config = Configuration::from_toml_str(r#"
            [Camera]
            Driver = "v4l2"
            PacketSize = -1

            [Acquisition]
            BufferFrames = "many"
            ExposureMs = -3.0
        "#).unwrap();

        assert_eq!(DriverKind::Simulator, config.driver());
        assert_eq!(None, config.packet_size());
        assert_eq!(16, config.buffer_frames());
        assert_eq!(None, config.exposure());
    }

    #[test]
    fn given_malformed_toml_parsing_fails() {
        assert!(Configuration::from_toml_str("[Camera\nDriver = ").is_err());
    }
}
