//
// pgcam - Point Grey camera acquisition engine
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Property synchronizer.
//!

use crate::camera::{CameraError, Device, PropertyId, PropertyInfo, PropertyValue};
use std::collections::HashMap;
use strum::IntoEnumIterator;

/// Cached state of one device property.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertySnapshot {
    /// Fetched once at construction.
    pub info: PropertyInfo,
    pub value: PropertyValue
}

/// Exposure and latency limits, in seconds.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ValidRanges {
    pub min_exp: f64,
    pub max_exp: f64,
    pub min_lat: f64,
    pub max_lat: f64
}

const MS_PER_S: f64 = 1000.0;

/// Mirrors the device's exposure, gain and frame rate.
///
/// Values of properties in manual mode are served from the cache; properties in auto mode
/// are re-read from the device on every `get`.
pub struct PropertySynchronizer {
    snapshots: HashMap<PropertyId, PropertySnapshot>
}

impl PropertySynchronizer {
    pub fn new(device: &dyn Device) -> Result<PropertySynchronizer, CameraError> {
        let mut snapshots = HashMap::new();
        for id in PropertyId::iter() {
            let info = device.property_info(id)?;
            let value = if info.present { device.property(id)? } else { PropertyValue::default() };
            log::debug!(
                "property {}: present = {}, range = [{}, {}] {}, auto = {}",
                id, info.present, info.min, info.max, info.units, value.auto
            );
            snapshots.insert(id, PropertySnapshot{ info, value });
        }

        Ok(PropertySynchronizer{ snapshots })
    }

    fn snapshot(&self, id: PropertyId) -> Result<&PropertySnapshot, CameraError> {
        match self.snapshots.get(&id) {
            Some(snapshot) if snapshot.info.present => Ok(snapshot),
            _ => Err(CameraError::NotSupported(format!("property {}", id)))
        }
    }

    fn snapshot_mut(&mut self, id: PropertyId) -> Result<&mut PropertySnapshot, CameraError> {
        match self.snapshots.get_mut(&id) {
            Some(snapshot) if snapshot.info.present => Ok(snapshot),
            _ => Err(CameraError::NotSupported(format!("property {}", id)))
        }
    }

    pub fn is_present(&self, id: PropertyId) -> bool {
        self.snapshot(id).is_ok()
    }

    pub fn info(&self, id: PropertyId) -> Option<&PropertyInfo> {
        self.snapshot(id).ok().map(|s| &s.info)
    }

    pub fn get(&mut self, device: &dyn Device, id: PropertyId) -> Result<f64, CameraError> {
        let snapshot = self.snapshot_mut(id)?;
        if snapshot.value.auto {
            snapshot.value = device.property(id)?;
        }
        Ok(snapshot.value.value)
    }

    /// Sets a manual value; auto mode is switched off.
    pub fn set(&mut self, device: &dyn Device, id: PropertyId, value: f64) -> Result<(), CameraError> {
        let snapshot = self.snapshot_mut(id)?;
        if !snapshot.info.contains(value) {
            return Err(CameraError::InvalidValue(format!(
                "{} {} {} outside [{}, {}]", id, value, snapshot.info.units, snapshot.info.min, snapshot.info.max
            )));
        }

        let new_value = PropertyValue{ value, auto: false, on: true, one_push: false };
        device.set_property(id, &new_value)?;
        snapshot.value = new_value;

        Ok(())
    }

    pub fn range(&self, id: PropertyId) -> Result<(f64, f64), CameraError> {
        let info = &self.snapshot(id)?.info;
        Ok((info.min, info.max))
    }

    pub fn auto(&self, id: PropertyId) -> bool {
        self.snapshot(id).map(|s| s.value.auto).unwrap_or(false)
    }

    /// Unsupported auto mode is only logged.
    pub fn set_auto(&mut self, device: &dyn Device, id: PropertyId, auto: bool) -> Result<(), CameraError> {
        let snapshot = match self.snapshot_mut(id) {
            Ok(s) if s.info.auto_supported => s,
            _ => {
                log::warn!("auto mode not supported for {}; ignoring", id);
                return Ok(());
            }
        };

        let new_value = PropertyValue{ auto, one_push: false, ..snapshot.value };
        device.set_property(id, &new_value)?;
        snapshot.value = new_value;
        if !auto {
            // keep whatever the device settled on
            snapshot.value = device.property(id)?;
        }

        Ok(())
    }

    pub fn on_off(&self, id: PropertyId) -> bool {
        self.snapshot(id).map(|s| s.value.on).unwrap_or(false)
    }

    /// Unsupported on/off control is only logged.
    pub fn set_on_off(&mut self, device: &dyn Device, id: PropertyId, on: bool) -> Result<(), CameraError> {
        let snapshot = match self.snapshot_mut(id) {
            Ok(s) if s.info.on_off_supported => s,
            _ => {
                log::warn!("on/off control not supported for {}; ignoring", id);
                return Ok(());
            }
        };

        let new_value = PropertyValue{ on, one_push: false, ..snapshot.value };
        device.set_property(id, &new_value)?;
        snapshot.value = new_value;

        Ok(())
    }

    /// Triggers a single automatic adjustment.
    pub fn one_push(&mut self, device: &dyn Device, id: PropertyId) -> Result<(), CameraError> {
        let snapshot = match self.snapshot_mut(id) {
            Ok(s) if s.info.one_push_supported => s,
            _ => {
                log::warn!("one-push not supported for {}; ignoring", id);
                return Ok(());
            }
        };

        device.set_property(id, &PropertyValue{ one_push: true, ..snapshot.value })?;
        snapshot.value = device.property(id)?;

        Ok(())
    }

    // Exposure/latency model; all values in seconds.

    pub fn exp_time(&mut self, device: &dyn Device) -> Result<f64, CameraError> {
        Ok(self.get(device, PropertyId::Shutter)? / MS_PER_S)
    }

    /// Keeps the current latency by adjusting a fixed frame rate (clamped to its range).
    pub fn set_exp_time(&mut self, device: &dyn Device, exp_time: f64) -> Result<(), CameraError> {
        let latency = self.lat_time(device)?;
        self.set(device, PropertyId::Shutter, exp_time * MS_PER_S)?;

        if latency > 0.0 {
            let (fr_min, fr_max) = self.range(PropertyId::FrameRate)?;
            let frame_rate = (1.0 / (exp_time + latency)).max(fr_min).min(fr_max);
            self.set(device, PropertyId::FrameRate, frame_rate)?;
        }

        Ok(())
    }

    /// Frame period minus exposure; 0 if the frame rate is not fixed.
    pub fn lat_time(&mut self, device: &dyn Device) -> Result<f64, CameraError> {
        let frame_rate = match self.snapshot(PropertyId::FrameRate) {
            Ok(s) if !s.value.auto && s.value.on && s.value.value > 0.0 => s.value.value,
            _ => return Ok(0.0)
        };

        let exp_time = self.exp_time(device)?;
        Ok((1.0 / frame_rate - exp_time).max(0.0))
    }

    /// Zero latency lets the camera run as fast as it can; otherwise the frame rate is fixed
    /// at 1 / (exposure + latency).
    pub fn set_lat_time(&mut self, device: &dyn Device, lat_time: f64) -> Result<(), CameraError> {
        if !(lat_time >= 0.0) {
            return Err(CameraError::InvalidValue(format!("latency {} s", lat_time)));
        }

        if lat_time == 0.0 {
            let info = match self.info(PropertyId::FrameRate) {
                Some(info) => info.clone(),
                None => return Ok(())
            };
            return if info.auto_supported {
                self.set_auto(device, PropertyId::FrameRate, true)
            } else if info.on_off_supported {
                self.set_on_off(device, PropertyId::FrameRate, false)
            } else {
                self.set(device, PropertyId::FrameRate, info.max)
            };
        }

        if !self.is_present(PropertyId::FrameRate) {
            return Err(CameraError::NotSupported("latency time (no frame rate control)".to_string()));
        }

        let exp_time = self.exp_time(device)?;
        let frame_rate = 1.0 / (exp_time + lat_time);
        let (fr_min, fr_max) = self.range(PropertyId::FrameRate)?;
        if frame_rate < fr_min || frame_rate > fr_max {
            return Err(CameraError::InvalidValue(format!(
                "latency {} s needs frame rate {:.3} fps outside [{}, {}]", lat_time, frame_rate, fr_min, fr_max
            )));
        }

        self.set(device, PropertyId::FrameRate, frame_rate)
    }

    pub fn valid_ranges(&mut self, device: &dyn Device) -> Result<ValidRanges, CameraError> {
        let (exp_min, exp_max) = self.range(PropertyId::Shutter)?;
        let exp_time = self.exp_time(device)?;

        let max_lat = match self.range(PropertyId::FrameRate) {
            Ok((fr_min, _)) if fr_min > 0.0 => (1.0 / fr_min - exp_time).max(0.0),
            _ => 0.0
        };

        Ok(ValidRanges{
            min_exp: exp_min / MS_PER_S,
            max_exp: exp_max / MS_PER_S,
            min_lat: 0.0,
            max_lat
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::drivers::simulator::{SimConfig, SimDevice};

    fn synchronizer(config: SimConfig) -> (SimDevice, PropertySynchronizer) {
        let device = SimDevice::new(config);
        device.connect().unwrap();
        let props = PropertySynchronizer::new(&device).unwrap();
        (device, props)
    }

    fn assert_close(expected: f64, actual: f64) {
        assert!((expected - actual).abs() < 1.0e-9, "expected {}, got {}", expected, actual);
    }

    #[test]
    fn given_auto_mode_get_refetches_from_device() {
        let (device, mut props) = synchronizer(SimConfig::default());
        props.set_auto(&device, PropertyId::Gain, true).unwrap();
        device.simulate_auto_adjust(PropertyId::Gain, 12.0);
        assert_close(12.0, props.get(&device, PropertyId::Gain).unwrap());
    }

    #[test]
    fn given_manual_mode_get_returns_cached_value() {
        let (device, mut props) = synchronizer(SimConfig::default());
        props.set(&device, PropertyId::Gain, 5.0).unwrap();
        device.simulate_auto_adjust(PropertyId::Gain, 7.0);
        assert_close(5.0, props.get(&device, PropertyId::Gain).unwrap());
    }

    #[test]
    fn given_unsupported_auto_set_auto_is_soft_no_op() {
        let (device, mut props) = synchronizer(SimConfig{ auto_gain_supported: false, ..SimConfig::default() });
        assert!(props.set_auto(&device, PropertyId::Gain, true).is_ok());
        assert!(!props.auto(PropertyId::Gain));
        assert!(!device.device_property(PropertyId::Gain).auto);
    }

    #[test]
    fn given_auto_mode_set_switches_to_manual() {
        let (device, mut props) = synchronizer(SimConfig::default());
        props.set_auto(&device, PropertyId::Shutter, true).unwrap();
        assert!(props.auto(PropertyId::Shutter));

        props.set(&device, PropertyId::Shutter, 20.0).unwrap();
        assert!(!props.auto(PropertyId::Shutter));
        assert!(!device.device_property(PropertyId::Shutter).auto);
        assert_close(20.0, device.device_property(PropertyId::Shutter).value);
    }

    #[test]
    fn given_value_out_of_range_set_fails_and_keeps_value() {
        let (device, mut props) = synchronizer(SimConfig::default());
        props.set(&device, PropertyId::Gain, 3.0).unwrap();
        assert!(matches!(props.set(&device, PropertyId::Gain, 30.0), Err(CameraError::InvalidValue(_))));
        assert_close(3.0, props.get(&device, PropertyId::Gain).unwrap());
        assert_close(3.0, device.device_property(PropertyId::Gain).value);
    }

    #[test]
    fn given_positive_latency_frame_rate_is_fixed() {
        let (device, mut props) = synchronizer(SimConfig::default());
        props.set_exp_time(&device, 0.010).unwrap();
        props.set_lat_time(&device, 0.0025).unwrap();

        assert_close(80.0, device.device_property(PropertyId::FrameRate).value);
        assert_close(0.0025, props.lat_time(&device).unwrap());
    }

    #[test]
    fn given_zero_latency_frame_rate_becomes_auto() {
        let (device, mut props) = synchronizer(SimConfig::default());
        props.set_lat_time(&device, 0.0).unwrap();
        assert!(props.auto(PropertyId::FrameRate));
        assert_close(0.0, props.lat_time(&device).unwrap());
    }

    #[test]
    fn given_latency_needing_too_low_frame_rate_it_is_rejected() {
        let (device, mut props) = synchronizer(SimConfig::default());
        props.set_exp_time(&device, 0.010).unwrap();
        assert!(matches!(props.set_lat_time(&device, 2.0), Err(CameraError::InvalidValue(_))));
        assert!(matches!(props.set_lat_time(&device, -1.0), Err(CameraError::InvalidValue(_))));
    }

    #[test]
    fn given_exposure_change_latency_is_kept() {
        let (device, mut props) = synchronizer(SimConfig::default());
        props.set_exp_time(&device, 0.010).unwrap();
        props.set_lat_time(&device, 0.015).unwrap();

        props.set_exp_time(&device, 0.020).unwrap();
        assert_close(0.015, props.lat_time(&device).unwrap());
        assert_close(1.0 / 0.035, device.device_property(PropertyId::FrameRate).value);
    }

    #[test]
    fn given_exposure_valid_latency_range_follows() {
        let (device, mut props) = synchronizer(SimConfig::default());
        props.set_exp_time(&device, 0.010).unwrap();
        let ranges = props.valid_ranges(&device).unwrap();
        assert_close(0.02 / 1000.0, ranges.min_exp);
        assert_close(1.0, ranges.max_exp);
        assert_close(0.0, ranges.min_lat);
        assert_close(0.99, ranges.max_lat);
    }

    #[test]
    fn given_unsupported_on_off_set_on_off_is_soft_no_op() {
        let (device, mut props) = synchronizer(SimConfig::default());
        assert!(props.set_on_off(&device, PropertyId::Gain, false).is_ok());
        assert!(props.on_off(PropertyId::Gain));
        assert!(device.device_property(PropertyId::Gain).on);
    }

    #[test]
    fn given_frame_rate_switched_off_latency_is_zero_until_switched_on() {
        let (device, mut props) = synchronizer(SimConfig::default());
        props.set_exp_time(&device, 0.010).unwrap();
        let latency = props.lat_time(&device).unwrap();
        assert_close(1.0 / 30.0 - 0.010, latency);

        props.set_on_off(&device, PropertyId::FrameRate, false).unwrap();
        assert!(!props.on_off(PropertyId::FrameRate));
        assert!(!device.device_property(PropertyId::FrameRate).on);
        assert_close(0.0, props.lat_time(&device).unwrap());

        props.set_on_off(&device, PropertyId::FrameRate, true).unwrap();
        assert!(device.device_property(PropertyId::FrameRate).on);
        assert_close(latency, props.lat_time(&device).unwrap());
    }

    #[test]
    fn given_one_push_value_is_refetched_and_mode_stays_manual() {
        let (device, mut props) = synchronizer(SimConfig::default());
        device.simulate_auto_adjust(PropertyId::Shutter, 25.0);
        assert_close(10.0, props.get(&device, PropertyId::Shutter).unwrap());

        props.one_push(&device, PropertyId::Shutter).unwrap();
        assert_close(25.0, props.get(&device, PropertyId::Shutter).unwrap());
        assert!(!props.auto(PropertyId::Shutter));

        assert!(props.one_push(&device, PropertyId::Gain).is_ok());
    }

    #[test]
    fn given_no_frame_rate_control_positive_latency_is_unsupported() {
        let (device, mut props) = synchronizer(SimConfig{ frame_rate_present: false, ..SimConfig::default() });
        assert!(props.set_lat_time(&device, 0.0).is_ok());
        assert!(matches!(props.set_lat_time(&device, 0.1), Err(CameraError::NotSupported(_))));
        assert_eq!(0.0, props.valid_ranges(&device).unwrap().max_lat);
    }
}
