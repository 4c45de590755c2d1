//
// pgcam - Point Grey camera acquisition engine
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Camera session: acquisition control and the start/stop protocol.
//!

use crate::buffer::{BufferManager, FrameDim};
use crate::camera::*;
use crate::camera::format::FormatNegotiator;
use crate::camera::properties::{PropertySynchronizer, ValidRanges};
use crate::camera::status::StatusCell;
use crate::workers::capture;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Ten minutes.
pub const DEFAULT_GRAB_TIMEOUT: Duration = Duration::from_millis(600_000);

#[derive(Clone, Debug)]
pub struct CameraSettings {
    /// Timeout of a single frame retrieval.
    pub grab_timeout: Duration,
    pub packet_size: Option<u32>,
    pub packet_delay: Option<u32>
}

impl Default for CameraSettings {
    fn default() -> CameraSettings {
        CameraSettings{ grab_timeout: DEFAULT_GRAB_TIMEOUT, packet_size: None, packet_delay: None }
    }
}

pub type SizeListener = Box<dyn Fn(Size, ImageType) + Send>;

pub type RangeListener = Box<dyn Fn(&ValidRanges) + Send>;

/// State shared with the capture thread; guarded by `Shared::acq`.
pub(crate) struct AcqState {
    pub status: StatusCell,
    /// Acquisition requested by the control plane.
    pub armed: bool,
    /// Capture thread is to exit.
    pub quit: bool,
    /// Set by the capture thread while it runs an acquisition.
    pub thread_running: bool,
    /// 0: until stopped.
    pub nb_frames: u64,
    /// Frames acquired since the last `prepare_acq`.
    pub image_number: u64,
    pub frame_dim: FrameDim,
    pub t_start: Instant
}

pub(crate) struct Shared {
    pub device: Box<dyn Device>,
    pub buffer: Arc<dyn BufferManager>,
    pub grab_timeout: Duration,
    acq: Mutex<AcqState>,
    cond: Condvar
}

impl Shared {
    pub fn lock(&self) -> MutexGuard<'_, AcqState> {
        self.acq.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait<'a>(&self, guard: MutexGuard<'a, AcqState>) -> MutexGuard<'a, AcqState> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notify(&self) {
        self.cond.notify_all();
    }

    pub fn set_status(&self, status: Status, force: bool) -> bool {
        self.lock().status.set(status, force)
    }

    /// Disarms the capture thread and stops the device capture.
    ///
    /// An external caller blocks until the capture thread has left its acquisition loop.
    /// Does nothing if not armed.
    pub fn stop_acq(&self, internal: bool) -> Result<(), CameraError> {
        let mut acq = self.lock();
        if !acq.armed { return Ok(()); }

        acq.armed = false;
        self.notify();
        if !internal {
            while acq.thread_running {
                acq = self.wait(acq);
            }
        }

        // still under lock, so that a subsequent start cannot overtake the device stop
        let result = self.device.stop_capture();
        match &result {
            Ok(()) => { acq.status.set(Status::Ready, false); },
            Err(e) => {
                log::error!("failed to stop capture: {}", e);
                acq.status.set(Status::Fault, false);
            }
        }
        log::info!("acquisition stopped; {} frame(s) acquired", acq.image_number);

        result
    }
}

struct Control {
    format: FormatNegotiator,
    properties: PropertySynchronizer,
    trig_mode: TrigMode,
    closed: bool,
    size_listeners: Vec<SizeListener>,
    range_listeners: Vec<RangeListener>
}

/// Camera with its persistent capture thread.
///
/// Lock order: control state first, then acquisition state. The capture thread
/// only ever takes the latter.
pub struct Camera {
    shared: Arc<Shared>,
    control: Mutex<Control>,
    thread: Mutex<Option<JoinHandle<()>>>,
    info: DeviceInfo
}

fn log_device_info(info: &DeviceInfo) {
    log::info!(
        "connected to camera {} {} (S/N {}), sensor: {}, resolution: {}, firmware {} ({})",
        info.vendor, info.model, info.serial_number, info.sensor, info.resolution,
        info.firmware_version, info.firmware_build_time
    );
}

fn init_device(
    device: &dyn Device,
    settings: &CameraSettings
) -> Result<(DeviceInfo, FormatNegotiator, PropertySynchronizer), CameraError> {
    let info = device.device_info()?;
    log_device_info(&info);

    let format = FormatNegotiator::new(device)?;
    let properties = PropertySynchronizer::new(device)?;

    if let Some(packet_size) = settings.packet_size {
        if let Err(e) = device.set_packet_size(packet_size) {
            log::warn!("cannot set packet size {}: {}", packet_size, e);
        }
    }
    if let Some(packet_delay) = settings.packet_delay {
        if let Err(e) = device.set_packet_delay(packet_delay) {
            log::warn!("cannot set packet delay {}: {}", packet_delay, e);
        }
    }

    device.set_trigger(DeviceTrigger::Internal)?;

    Ok((info, format, properties))
}

impl Camera {
    /// Connects to the device, applies its current format and starts the capture thread.
    pub fn open(
        device: Box<dyn Device>,
        buffer: Arc<dyn BufferManager>,
        settings: CameraSettings
    ) -> Result<Camera, CameraError> {
        device.connect()?;

        let (info, format, properties) = match init_device(&*device, &settings) {
            Ok(result) => result,
            Err(e) => {
                if let Err(e) = device.disconnect() { log::warn!("failed to disconnect: {}", e); }
                return Err(e);
            }
        };

        let current = *format.current();
        let frame_dim = FrameDim::new(current.size, current.pixel_format);
        buffer.set_frame_dim(frame_dim);

        let shared = Arc::new(Shared{
            device,
            buffer,
            grab_timeout: settings.grab_timeout,
            acq: Mutex::new(AcqState{
                status: StatusCell::new(),
                armed: false,
                quit: false,
                thread_running: false,
                nb_frames: 1,
                image_number: 0,
                frame_dim,
                t_start: Instant::now()
            }),
            cond: Condvar::new()
        });

        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("pgcam-capture".to_string())
                .spawn(move || capture::capture_thread(shared))
        };
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                if let Err(e) = shared.device.disconnect() { log::warn!("failed to disconnect: {}", e); }
                return Err(CameraError::ThreadSpawn(e.to_string()));
            }
        };

        Ok(Camera{
            shared,
            control: Mutex::new(Control{
                format,
                properties,
                trig_mode: TrigMode::IntTrig,
                closed: false,
                size_listeners: vec![],
                range_listeners: vec![]
            }),
            thread: Mutex::new(Some(thread)),
            info
        })
    }

    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn control(&self) -> Result<MutexGuard<'_, Control>, CameraError> {
        let control = self.lock_control();
        if control.closed { Err(CameraError::Closed) } else { Ok(control) }
    }

    fn device(&self) -> &dyn Device { &*self.shared.device }

    /// Fails if the capture thread is armed.
    fn ensure_idle(&self) -> Result<(), CameraError> {
        if self.shared.lock().armed { Err(CameraError::AcquisitionRunning) } else { Ok(()) }
    }

    /// Propagates a committed format change to the buffer manager and the listeners.
    fn on_format_changed(&self, control: &Control, changed: bool) {
        if !changed { return; }

        let current = control.format.current();
        let frame_dim = FrameDim::new(current.size, current.pixel_format);
        self.shared.buffer.set_frame_dim(frame_dim);
        self.shared.lock().frame_dim = frame_dim;
        for listener in &control.size_listeners {
            listener(current.size, frame_dim.image_type());
        }
    }

    fn on_ranges_changed(&self, control: &mut Control) -> Result<(), CameraError> {
        let ranges = control.properties.valid_ranges(self.device())?;
        for listener in &control.range_listeners {
            listener(&ranges);
        }
        Ok(())
    }

    // Acquisition.

    /// Resets the frame counter for the next acquisition.
    pub fn prepare_acq(&self) -> Result<(), CameraError> {
        let _control = self.control()?;
        let mut acq = self.shared.lock();
        if acq.armed { return Err(CameraError::AcquisitionRunning); }
        acq.image_number = 0;
        Ok(())
    }

    /// Starts the device capture and arms the capture thread; does not wait for the first frame.
    pub fn start_acq(&self) -> Result<(), CameraError> {
        let control = self.control()?;
        {
            let acq = self.shared.lock();
            if acq.armed { return Err(CameraError::AcquisitionRunning); }
            if acq.status.get() == Status::Fault { return Err(CameraError::Fault); }
        }

        self.shared.buffer.set_start_timestamp(chrono::Utc::now());

        let mut acq = self.shared.lock();
        if let Err(e) = self.shared.device.start_capture() {
            log::error!("failed to start capture: {}", e);
            acq.status.set(Status::Fault, false);
            return Err(e);
        }

        let current = control.format.current();
        acq.frame_dim = FrameDim::new(current.size, current.pixel_format);
        acq.t_start = Instant::now();
        acq.armed = true;
        acq.status.set(Status::Exposure, false);
        self.shared.notify();

        log::info!(
            "acquisition started: {} frame(s), {} {}",
            if acq.nb_frames == 0 { "unlimited".to_string() } else { acq.nb_frames.to_string() },
            current.size, current.pixel_format
        );

        Ok(())
    }

    /// Waits for the capture thread to quiesce and stops the device capture. Does nothing if not armed.
    pub fn stop_acq(&self) -> Result<(), CameraError> {
        let _control = self.lock_control();
        self.shared.stop_acq(false)
    }

    /// Stops the acquisition and clears a fault.
    pub fn reset(&self) -> Result<(), CameraError> {
        let _control = self.lock_control();
        if let Err(e) = self.shared.stop_acq(false) {
            log::warn!("error while stopping for reset: {}", e);
        }
        self.shared.set_status(Status::Ready, true);
        log::info!("camera reset");
        Ok(())
    }

    pub fn status(&self) -> Status { self.shared.lock().status.get() }

    pub fn hw_status(&self) -> HwStatus { HwStatus::from(self.status()) }

    pub fn nb_hw_acquired_frames(&self) -> u64 { self.shared.lock().image_number }

    pub fn nb_frames(&self) -> u64 { self.shared.lock().nb_frames }

    /// 0: acquire until stopped.
    ///
    /// In `ExtTrigSingle` mode the device's frames-per-trigger count follows this value.
    pub fn set_nb_frames(&self, nb_frames: u64) -> Result<(), CameraError> {
        let control = self.control()?;
        let mut acq = self.shared.lock();
        if acq.armed { return Err(CameraError::AcquisitionRunning); }
        if control.trig_mode == TrigMode::ExtTrigSingle {
            self.device().set_trigger(DeviceTrigger::External{ frames_per_trigger: nb_frames as u32 })?;
        }
        acq.nb_frames = nb_frames;
        Ok(())
    }

    // Detector information.

    pub fn device_info(&self) -> &DeviceInfo { &self.info }

    pub fn detector_type(&self) -> String { self.info.vendor.clone() }

    pub fn detector_model(&self) -> String { self.info.model.clone() }

    /// Full frame size in the current binning.
    pub fn max_image_size(&self) -> Size { self.lock_control().format.max_image_size() }

    pub fn image_type(&self) -> ImageType { self.lock_control().format.image_type() }

    pub fn supports_image_type(&self, image_type: ImageType) -> bool {
        self.lock_control().format.supports_image_type(image_type)
    }

    pub fn set_image_type(&self, image_type: ImageType) -> Result<(), CameraError> {
        let mut control = self.control()?;
        self.ensure_idle()?;
        let changed = control.format.set_image_type(self.device(), image_type)?;
        self.on_format_changed(&control, changed);
        Ok(())
    }

    pub fn add_size_listener(&self, listener: SizeListener) {
        self.lock_control().size_listeners.push(listener);
    }

    pub fn add_range_listener(&self, listener: RangeListener) {
        self.lock_control().range_listeners.push(listener);
    }

    // Trigger.

    pub fn check_trig_mode(&self, mode: TrigMode) -> bool {
        match mode {
            TrigMode::IntTrig => true,
            TrigMode::ExtTrigSingle | TrigMode::ExtTrigMult => self.info.external_trigger,
            _ => false
        }
    }

    pub fn trig_mode(&self) -> TrigMode { self.lock_control().trig_mode }

    pub fn set_trig_mode(&self, mode: TrigMode) -> Result<(), CameraError> {
        if !self.check_trig_mode(mode) {
            return Err(CameraError::InvalidValue(format!("trigger mode {}", mode)));
        }

        let mut control = self.control()?;
        self.ensure_idle()?;
        let trigger = match mode {
            TrigMode::ExtTrigSingle => DeviceTrigger::External{ frames_per_trigger: self.nb_frames() as u32 },
            TrigMode::ExtTrigMult => DeviceTrigger::External{ frames_per_trigger: 1 },
            _ => DeviceTrigger::Internal
        };
        self.device().set_trigger(trigger)?;
        control.trig_mode = mode;

        Ok(())
    }

    // Exposure and latency (seconds).

    pub fn exp_time(&self) -> Result<f64, CameraError> {
        self.control()?.properties.exp_time(self.device())
    }

    pub fn set_exp_time(&self, exp_time: f64) -> Result<(), CameraError> {
        let mut control = self.control()?;
        control.properties.set_exp_time(self.device(), exp_time)?;
        self.on_ranges_changed(&mut control)
    }

    pub fn lat_time(&self) -> Result<f64, CameraError> {
        self.control()?.properties.lat_time(self.device())
    }

    pub fn set_lat_time(&self, lat_time: f64) -> Result<(), CameraError> {
        let mut control = self.control()?;
        control.properties.set_lat_time(self.device(), lat_time)?;
        self.on_ranges_changed(&mut control)
    }

    pub fn valid_ranges(&self) -> Result<ValidRanges, CameraError> {
        self.control()?.properties.valid_ranges(self.device())
    }

    pub fn auto_exp_time(&self) -> bool { self.lock_control().properties.auto(PropertyId::Shutter) }

    pub fn set_auto_exp_time(&self, auto: bool) -> Result<(), CameraError> {
        self.set_property_auto(PropertyId::Shutter, auto)
    }

    // Gain (dB).

    pub fn gain(&self) -> Result<f64, CameraError> { self.property(PropertyId::Gain) }

    pub fn set_gain(&self, gain: f64) -> Result<(), CameraError> { self.set_property(PropertyId::Gain, gain) }

    pub fn gain_range(&self) -> Result<(f64, f64), CameraError> { self.property_range(PropertyId::Gain) }

    pub fn auto_gain(&self) -> bool { self.lock_control().properties.auto(PropertyId::Gain) }

    pub fn set_auto_gain(&self, auto: bool) -> Result<(), CameraError> {
        self.set_property_auto(PropertyId::Gain, auto)
    }

    // Frame rate (fps).

    pub fn frame_rate(&self) -> Result<f64, CameraError> { self.property(PropertyId::FrameRate) }

    pub fn set_frame_rate(&self, frame_rate: f64) -> Result<(), CameraError> {
        self.set_property(PropertyId::FrameRate, frame_rate)
    }

    pub fn auto_frame_rate(&self) -> bool { self.lock_control().properties.auto(PropertyId::FrameRate) }

    pub fn set_auto_frame_rate(&self, auto: bool) -> Result<(), CameraError> {
        self.set_property_auto(PropertyId::FrameRate, auto)
    }

    // Generic property access.

    pub fn property(&self, id: PropertyId) -> Result<f64, CameraError> {
        self.control()?.properties.get(self.device(), id)
    }

    pub fn set_property(&self, id: PropertyId, value: f64) -> Result<(), CameraError> {
        self.control()?.properties.set(self.device(), id, value)
    }

    pub fn property_range(&self, id: PropertyId) -> Result<(f64, f64), CameraError> {
        self.lock_control().properties.range(id)
    }

    pub fn set_property_auto(&self, id: PropertyId, auto: bool) -> Result<(), CameraError> {
        self.control()?.properties.set_auto(self.device(), id, auto)
    }

    pub fn property_on_off(&self, id: PropertyId) -> bool { self.lock_control().properties.on_off(id) }

    pub fn set_property_on_off(&self, id: PropertyId, on: bool) -> Result<(), CameraError> {
        self.control()?.properties.set_on_off(self.device(), id, on)
    }

    pub fn one_push(&self, id: PropertyId) -> Result<(), CameraError> {
        self.control()?.properties.one_push(self.device(), id)
    }

    // ROI and binning.

    pub fn check_roi(&self, roi: &Roi) -> Result<Roi, CameraError> {
        self.lock_control().format.check_roi(roi)
    }

    pub fn roi(&self) -> Roi { self.lock_control().format.roi() }

    pub fn is_roi_active(&self) -> bool { self.lock_control().format.is_roi_active() }

    /// An empty `roi` selects the full frame.
    pub fn set_roi(&self, roi: &Roi) -> Result<(), CameraError> {
        let mut control = self.control()?;
        self.ensure_idle()?;
        let changed = control.format.set_roi(self.device(), roi)?;
        self.on_format_changed(&control, changed);
        Ok(())
    }

    pub fn check_bin(&self, bin: Bin) -> Bin { self.lock_control().format.check_bin(bin) }

    pub fn bin(&self) -> Bin { self.lock_control().format.bin() }

    pub fn binning_available(&self) -> bool { self.lock_control().format.binning_available() }

    /// Resets the ROI to full frame.
    pub fn set_bin(&self, bin: Bin) -> Result<(), CameraError> {
        let mut control = self.control()?;
        self.ensure_idle()?;
        let changed = control.format.set_bin(self.device(), bin)?;
        self.on_format_changed(&control, changed);
        Ok(())
    }

    // Transport tuning.

    pub fn packet_size(&self) -> Result<u32, CameraError> {
        let _control = self.control()?;
        self.device().packet_size()
    }

    pub fn set_packet_size(&self, packet_size: u32) -> Result<(), CameraError> {
        let _control = self.control()?;
        self.ensure_idle()?;
        self.device().set_packet_size(packet_size)
    }

    pub fn packet_delay(&self) -> Result<u32, CameraError> {
        let _control = self.control()?;
        self.device().packet_delay()
    }

    pub fn set_packet_delay(&self, packet_delay: u32) -> Result<(), CameraError> {
        let _control = self.control()?;
        self.ensure_idle()?;
        self.device().set_packet_delay(packet_delay)
    }

    /// Stops the acquisition, joins the capture thread and disconnects the device.
    ///
    /// Called on drop; later calls do nothing.
    pub fn close(&self) -> Result<(), CameraError> {
        let handle = match self.thread.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(handle) => handle,
            None => return Ok(())
        };

        let mut control = self.lock_control();
        if let Err(e) = self.shared.stop_acq(false) {
            log::warn!("error while stopping acquisition: {}", e);
        }

        {
            let mut acq = self.shared.lock();
            acq.quit = true;
            self.shared.notify();
        }
        if handle.join().is_err() {
            log::error!("capture thread panicked");
        }

        control.closed = true;
        self.shared.device.disconnect()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("error closing camera: {}", e);
        }
    }
}
