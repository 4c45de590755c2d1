//
// pgcam - Point Grey camera acquisition engine
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Camera drivers.
//!

#[cfg(feature = "camera_flycap2")]
pub mod flycapture2;
pub mod simulator;

use crate::camera::{CameraError, Device};
use crate::config::{Configuration, DriverKind};

/// Creates the device selected in the configuration; it is connected later, by `Camera::open`.
pub fn open_device(config: &Configuration) -> Result<Box<dyn Device>, CameraError> {
    match config.driver() {
        #[cfg(feature = "camera_flycap2")]
        DriverKind::FlyCapture2 => {
            log::info!("initializing FlyCapture2 camera driver");
            Ok(Box::new(flycapture2::FlyCapture2Device::new(config.serial_number())?))
        },

        #[cfg(not(feature = "camera_flycap2"))]
        DriverKind::FlyCapture2 => Err(CameraError::NotSupported(
            "FlyCapture2 driver (build with feature \"camera_flycap2\")".to_string()
        )),

        DriverKind::Simulator => {
            log::info!("initializing camera simulator driver");
            Ok(Box::new(simulator::SimDevice::new(config.simulator())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_simulator_driver_device_is_created() {
        let config = Configuration::from_toml_str("[Camera]\nDriver = \"simulator\"").unwrap();
        let device = open_device(&config).unwrap();
        device.connect().unwrap();
        assert_eq!("Simulator", device.device_info().unwrap().model);
    }
}
