//
// pgcam - Point Grey camera acquisition engine
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Camera simulator.
//!
//! Behaves like a Format7-capable camera with a configurable sensor; failures can be scripted
//! per retrieval attempt, which makes it the test double of the acquisition engine.
//!

use crate::camera::*;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

mod registers {
    pub const IMAGE_DATA_FORMAT: u32 = 0x1048;
}

const SERIAL_NUMBER: u32 = 10_203_040;

#[derive(Debug)]
pub enum SimulatorError {
    NotConnected,
    NotCapturing,
    AlreadyCapturing,
    PropertyAbsent(PropertyId),
    OutOfRange(PropertyId, f64),
    UnknownRegister(u32),
    /// Failure requested by the test script.
    Injected(&'static str)
}

impl From<SimulatorError> for CameraError {
    fn from(sim_error: SimulatorError) -> CameraError {
        CameraError::SimulatorError(sim_error)
    }
}

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub sensor_size: Size,
    pub offset_step: Size,
    pub size_step: Size,
    pub pixel_formats: Vec<PixelFormat>,
    pub binnings: Vec<Bin>,
    pub frame_period: Duration,
    pub auto_gain_supported: bool,
    pub frame_rate_present: bool,
    pub external_trigger: bool,
    /// Enables packet size/delay (transport tuning).
    pub gige: bool
}

impl Default for SimConfig {
    fn default() -> SimConfig {
        SimConfig{
            sensor_size: Size::new(640, 480),
            offset_step: Size::new(2, 2),
            size_step: Size::new(8, 2),
            pixel_formats: vec![PixelFormat::Mono8, PixelFormat::Mono16],
            binnings: vec![Bin::new(1, 1), Bin::new(2, 2)],
            frame_period: Duration::from_millis(1),
            auto_gain_supported: true,
            frame_rate_present: true,
            external_trigger: true,
            gige: false
        }
    }
}

struct SimState {
    connected: bool,
    capturing: bool,
    format: FormatDescriptor,
    transfer_size: u32,
    properties: HashMap<PropertyId, (PropertyInfo, PropertyValue)>,
    registers: HashMap<u32, u32>,
    trigger: DeviceTrigger,
    packet_size: u32,
    packet_delay: u32,
    frame_period: Duration,
    t_last_capture: Instant,

    fatal_on_attempt: Option<u64>,
    transient_attempts: HashSet<u64>,
    reject_formats: bool,
    fail_apply: bool,
    fail_start: bool,

    retrieve_attempts: u64,
    frames_delivered: u64,
    start_calls: usize,
    stop_calls: usize,
    register_writes: Vec<(u32, u32)>,
    applied_formats: Vec<FormatDescriptor>
}

/// Simulated camera; clones share the same device state.
#[derive(Clone)]
pub struct SimDevice {
    config: Arc<SimConfig>,
    state: Arc<Mutex<SimState>>
}

impl SimDevice {
    pub fn new(config: SimConfig) -> SimDevice {
        let mut properties = HashMap::new();

        properties.insert(PropertyId::Shutter, (
            PropertyInfo{
                present: true,
                min: 0.02,
                max: 1000.0,
                auto_supported: true,
                manual_supported: true,
                on_off_supported: false,
                one_push_supported: true,
                units: "ms".to_string()
            },
            PropertyValue{ value: 10.0, auto: false, on: true, one_push: false }
        ));

        properties.insert(PropertyId::Gain, (
            PropertyInfo{
                present: true,
                min: 0.0,
                max: 24.0,
                auto_supported: config.auto_gain_supported,
                manual_supported: true,
                on_off_supported: false,
                one_push_supported: false,
                units: "dB".to_string()
            },
            PropertyValue{ value: 0.0, auto: false, on: true, one_push: false }
        ));

        properties.insert(PropertyId::FrameRate, (
            PropertyInfo{
                present: config.frame_rate_present,
                min: 1.0,
                max: 120.0,
                auto_supported: true,
                manual_supported: true,
                on_off_supported: true,
                one_push_supported: false,
                units: "fps".to_string()
            },
            PropertyValue{ value: 30.0, auto: false, on: true, one_push: false }
        ));

        let mut regs = HashMap::new();
        regs.insert(registers::IMAGE_DATA_FORMAT, 0x8000_0000);

        let format = FormatDescriptor{
            offset: Point::default(),
            size: config.sensor_size,
            pixel_format: config.pixel_formats.first().copied().unwrap_or(PixelFormat::Mono8),
            bin: Bin::default()
        };

        let frame_period = config.frame_period;

        SimDevice{
            config: Arc::new(config),
            state: Arc::new(Mutex::new(SimState{
                connected: false,
                capturing: false,
                format,
                transfer_size: 0,
                properties,
                registers: regs,
                trigger: DeviceTrigger::Internal,
                packet_size: 1400,
                packet_delay: 0,
                frame_period,
                t_last_capture: Instant::now(),
                fatal_on_attempt: None,
                transient_attempts: HashSet::new(),
                reject_formats: false,
                fail_apply: false,
                fail_start: false,
                retrieve_attempts: 0,
                frames_delivered: 0,
                start_calls: 0,
                stop_calls: 0,
                register_writes: vec![],
                applied_formats: vec![]
            }))
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connected_state(&self) -> Result<MutexGuard<'_, SimState>, CameraError> {
        let state = self.state();
        if state.connected { Ok(state) } else { Err(SimulatorError::NotConnected.into()) }
    }

    // Scripting.

    /// Makes the `attempt`-th retrieval (1-based, counted over the device's lifetime) fail fatally.
    pub fn fail_on_retrieve_attempt(&self, attempt: u64) {
        self.state().fatal_on_attempt = Some(attempt);
    }

    /// Makes the `attempt`-th retrieval (1-based) return no image.
    pub fn miss_on_retrieve_attempt(&self, attempt: u64) {
        self.state().transient_attempts.insert(attempt);
    }

    pub fn set_reject_formats(&self, reject: bool) { self.state().reject_formats = reject; }

    pub fn set_fail_apply(&self, fail: bool) { self.state().fail_apply = fail; }

    pub fn set_fail_start(&self, fail: bool) { self.state().fail_start = fail; }

    pub fn set_frame_period(&self, period: Duration) { self.state().frame_period = period; }

    /// Changes a property value the way the camera's own auto-adjustment would.
    pub fn simulate_auto_adjust(&self, id: PropertyId, value: f64) {
        if let Some(prop) = self.state().properties.get_mut(&id) {
            prop.1.value = value;
        }
    }

    // Inspection.

    pub fn retrieve_attempts(&self) -> u64 { self.state().retrieve_attempts }

    pub fn frames_delivered(&self) -> u64 { self.state().frames_delivered }

    pub fn start_calls(&self) -> usize { self.state().start_calls }

    pub fn stop_calls(&self) -> usize { self.state().stop_calls }

    pub fn is_capturing(&self) -> bool { self.state().capturing }

    pub fn is_connected(&self) -> bool { self.state().connected }

    pub fn register_writes(&self) -> Vec<(u32, u32)> { self.state().register_writes.clone() }

    pub fn applied_formats(&self) -> Vec<FormatDescriptor> { self.state().applied_formats.clone() }

    pub fn trigger(&self) -> DeviceTrigger { self.state().trigger }

    pub fn transfer_size(&self) -> u32 { self.state().transfer_size }

    pub fn device_property(&self, id: PropertyId) -> PropertyValue {
        self.state().properties.get(&id).map(|p| p.1).unwrap_or_default()
    }

    fn capabilities(&self) -> FormatCapabilities {
        FormatCapabilities{
            max_size: self.config.sensor_size,
            offset_step: self.config.offset_step,
            size_step: self.config.size_step,
            pixel_formats: self.config.pixel_formats.clone(),
            binnings: self.config.binnings.clone()
        }
    }
}

fn is_multiple(value: u32, step: u32) -> bool {
    step == 0 || value % step == 0
}

impl Device for SimDevice {
    fn connect(&self) -> Result<(), CameraError> {
        self.state().connected = true;
        log::info!("simulator: connected");
        Ok(())
    }

    fn disconnect(&self) -> Result<(), CameraError> {
        let mut state = self.state();
        state.capturing = false;
        state.connected = false;
        log::info!("simulator: disconnected");
        Ok(())
    }

    fn device_info(&self) -> Result<DeviceInfo, CameraError> {
        let _state = self.connected_state()?;
        Ok(DeviceInfo{
            serial_number: SERIAL_NUMBER,
            model: "Simulator".to_string(),
            vendor: "pgcam".to_string(),
            sensor: "simulated CMOS".to_string(),
            resolution: self.config.sensor_size.to_string(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            firmware_build_time: "n/a".to_string(),
            external_trigger: self.config.external_trigger
        })
    }

    fn format_capabilities(&self) -> Result<FormatCapabilities, CameraError> {
        let _state = self.connected_state()?;
        Ok(self.capabilities())
    }

    fn current_format(&self) -> Result<FormatDescriptor, CameraError> {
        Ok(self.connected_state()?.format)
    }

    fn validate_format(&self, candidate: &FormatDescriptor) -> Result<FormatValidation, CameraError> {
        let state = self.connected_state()?;
        let caps = self.capabilities();

        let valid = !state.reject_formats &&
            caps.supports_pixel_format(candidate.pixel_format) &&
            caps.supports_bin(candidate.bin) &&
            !candidate.size.is_empty() &&
            is_multiple(candidate.offset.x, caps.offset_step.width) &&
            is_multiple(candidate.offset.y, caps.offset_step.height) &&
            is_multiple(candidate.size.width, caps.size_step.width) &&
            is_multiple(candidate.size.height, caps.size_step.height) &&
            candidate.roi().fits_in(caps.max_size_for(candidate.bin));

        let line_bytes = candidate.size.width * candidate.pixel_format.bytes_per_pixel() as u32;
        let transfer_size = ((line_bytes + 3) / 4 * 4).min(9000).max(4);

        Ok(FormatValidation{ valid, transfer_size })
    }

    fn apply_format(&self, format: &FormatDescriptor, transfer_size: u32) -> Result<(), CameraError> {
        let mut state = self.connected_state()?;
        if state.capturing { return Err(SimulatorError::AlreadyCapturing.into()); }
        if state.fail_apply { return Err(SimulatorError::Injected("apply format").into()); }

        state.format = *format;
        state.transfer_size = transfer_size;
        state.applied_formats.push(*format);

        Ok(())
    }

    fn start_capture(&self) -> Result<(), CameraError> {
        let mut state = self.connected_state()?;
        state.start_calls += 1;
        if state.fail_start { return Err(SimulatorError::Injected("start capture").into()); }
        if state.capturing { return Err(SimulatorError::AlreadyCapturing.into()); }
        state.capturing = true;
        state.t_last_capture = Instant::now();
        Ok(())
    }

    fn stop_capture(&self) -> Result<(), CameraError> {
        let mut state = self.connected_state()?;
        state.stop_calls += 1;
        if !state.capturing { return Err(SimulatorError::NotCapturing.into()); }
        state.capturing = false;
        Ok(())
    }

    fn retrieve_frame(&self, timeout: Duration, dest: &mut RawFrame) -> Result<(), RetrieveError> {
        let (format, frame_counter, wait) = {
            let mut state = self.state();
            state.retrieve_attempts += 1;
            let attempt = state.retrieve_attempts;

            if !state.connected {
                return Err(RetrieveError::Fatal(SimulatorError::NotConnected.into()));
            }
            if !state.capturing {
                return Err(RetrieveError::Fatal(SimulatorError::NotCapturing.into()));
            }
            if state.fatal_on_attempt == Some(attempt) {
                return Err(RetrieveError::Fatal(SimulatorError::Injected("retrieve frame").into()));
            }
            if state.transient_attempts.contains(&attempt) {
                return Err(RetrieveError::Transient);
            }

            let elapsed = state.t_last_capture.elapsed();
            let wait = if elapsed < state.frame_period { state.frame_period - elapsed } else { Duration::from_secs(0) };

            (state.format, state.frames_delivered, wait)
        };

        if wait > timeout {
            std::thread::sleep(timeout);
            return Err(RetrieveError::Transient);
        }
        std::thread::sleep(wait);

        let bpp = format.pixel_format.bytes_per_pixel();
        dest.size = format.size;
        dest.stride = format.size.width as usize * bpp;
        dest.pixel_format = format.pixel_format;
        dest.pixels.resize(format.byte_len(), 0);
        for (i, byte) in dest.pixels.iter_mut().enumerate() {
            *byte = (i as u64).wrapping_add(frame_counter) as u8;
        }

        let mut state = self.state();
        state.frames_delivered += 1;
        state.t_last_capture = Instant::now();

        Ok(())
    }

    fn property_info(&self, id: PropertyId) -> Result<PropertyInfo, CameraError> {
        let state = self.connected_state()?;
        Ok(state.properties.get(&id).map(|p| p.0.clone()).unwrap_or_default())
    }

    fn property(&self, id: PropertyId) -> Result<PropertyValue, CameraError> {
        let state = self.connected_state()?;
        match state.properties.get(&id) {
            Some((info, value)) if info.present => Ok(*value),
            _ => Err(SimulatorError::PropertyAbsent(id).into())
        }
    }

    fn set_property(&self, id: PropertyId, value: &PropertyValue) -> Result<(), CameraError> {
        let mut state = self.connected_state()?;
        let (info, current) = match state.properties.get_mut(&id) {
            Some((info, current)) if info.present => (info, current),
            _ => return Err(SimulatorError::PropertyAbsent(id).into())
        };

        if !value.auto && !info.contains(value.value) {
            return Err(SimulatorError::OutOfRange(id, value.value).into());
        }

        current.auto = value.auto && info.auto_supported;
        current.on = if info.on_off_supported { value.on } else { true };
        // one-push completes instantly, keeping the value the device settled on
        if !value.auto && !value.one_push { current.value = value.value; }
        current.one_push = false;

        Ok(())
    }

    fn read_register(&self, address: u32) -> Result<u32, CameraError> {
        let state = self.connected_state()?;
        state.registers.get(&address).copied().ok_or_else(|| SimulatorError::UnknownRegister(address).into())
    }

    fn write_register(&self, address: u32, value: u32) -> Result<(), CameraError> {
        let mut state = self.connected_state()?;
        if !state.registers.contains_key(&address) {
            return Err(SimulatorError::UnknownRegister(address).into());
        }
        state.registers.insert(address, value);
        state.register_writes.push((address, value));
        Ok(())
    }

    fn set_trigger(&self, trigger: DeviceTrigger) -> Result<(), CameraError> {
        let mut state = self.connected_state()?;
        if let DeviceTrigger::External{ .. } = trigger {
            if !self.config.external_trigger {
                return Err(CameraError::NotSupported("external trigger".to_string()));
            }
        }
        state.trigger = trigger;
        Ok(())
    }

    fn packet_size(&self) -> Result<u32, CameraError> {
        if !self.config.gige { return Err(CameraError::NotSupported("packet size".to_string())); }
        Ok(self.connected_state()?.packet_size)
    }

    fn set_packet_size(&self, packet_size: u32) -> Result<(), CameraError> {
        if !self.config.gige { return Err(CameraError::NotSupported("packet size".to_string())); }
        self.connected_state()?.packet_size = packet_size;
        Ok(())
    }

    fn packet_delay(&self) -> Result<u32, CameraError> {
        if !self.config.gige { return Err(CameraError::NotSupported("packet delay".to_string())); }
        Ok(self.connected_state()?.packet_delay)
    }

    fn set_packet_delay(&self, packet_delay: u32) -> Result<(), CameraError> {
        if !self.config.gige { return Err(CameraError::NotSupported("packet delay".to_string())); }
        self.connected_state()?.packet_delay = packet_delay;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> SimDevice {
        let device = SimDevice::new(SimConfig::default());
        device.connect().unwrap();
        device
    }

    #[test]
    fn given_scripted_failures_retrieval_reports_them() {
        let device = connected();
        device.miss_on_retrieve_attempt(2);
        device.fail_on_retrieve_attempt(3);
        device.start_capture().unwrap();

        let mut frame = RawFrame::default();
        let timeout = Duration::from_secs(1);
        assert!(device.retrieve_frame(timeout, &mut frame).is_ok());
        assert!(matches!(device.retrieve_frame(timeout, &mut frame), Err(RetrieveError::Transient)));
        assert!(matches!(device.retrieve_frame(timeout, &mut frame), Err(RetrieveError::Fatal(_))));
        assert_eq!(3, device.retrieve_attempts());
        assert_eq!(1, device.frames_delivered());
        assert_eq!(640 * 480, frame.pixels.len());
    }

    #[test]
    fn given_not_capturing_retrieval_is_fatal() {
        let device = connected();
        let mut frame = RawFrame::default();
        assert!(matches!(
            device.retrieve_frame(Duration::from_secs(1), &mut frame),
            Err(RetrieveError::Fatal(_))
        ));
    }

    #[test]
    fn given_misaligned_roi_validation_fails() {
        let device = connected();
        let mut format = device.current_format().unwrap();
        format.size = Size::new(101, 100);
        assert!(!device.validate_format(&format).unwrap().valid);

        format.size = Size::new(104, 100);
        assert!(device.validate_format(&format).unwrap().valid);

        format.offset = Point{ x: 600, y: 0 };
        assert!(!device.validate_format(&format).unwrap().valid);
    }

    #[test]
    fn given_capture_running_format_cannot_be_applied() {
        let device = connected();
        let format = device.current_format().unwrap();
        device.start_capture().unwrap();
        assert!(device.apply_format(&format, 1024).is_err());
        device.stop_capture().unwrap();
        assert!(device.apply_format(&format, 1024).is_ok());
    }

    #[test]
    fn given_no_gige_transport_tuning_is_unsupported() {
        let device = connected();
        assert!(matches!(device.packet_size(), Err(CameraError::NotSupported(_))));

        let gige = SimDevice::new(SimConfig{ gige: true, ..SimConfig::default() });
        gige.connect().unwrap();
        gige.set_packet_size(9000).unwrap();
        assert_eq!(9000, gige.packet_size().unwrap());
    }
}
