//
// pgcam - Point Grey camera acquisition engine
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! FlyCapture2 camera driver.
//!

use crate::camera::*;
use libflycapture2_sys::*;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const FALSE: BOOL = 0;
const TRUE: BOOL = 1;

macro_rules! checked_call {
    ($func_call:expr) => {
        match unsafe { $func_call } {
            fc2Error::FC2_ERROR_OK => (),
            error => return Err(CameraError::FlyCapture2Error(FlyCapture2Error::Internal(error)))
        }
    }
}

impl From<FlyCapture2Error> for CameraError {
    fn from(fc2_error: FlyCapture2Error) -> CameraError {
        CameraError::FlyCapture2Error(fc2_error)
    }
}

#[derive(Debug)]
pub enum FlyCapture2Error {
    Internal(_fc2Error),
    ContextCreationFailed,
    NoCameraFound,
    NoFormat7Modes,
    UnsupportedPixelFormat(fc2PixelFormat)
}

fn to_pix_fmt(fc2_pix_fmt: fc2PixelFormat) -> Result<PixelFormat, CameraError> {
    match fc2_pix_fmt {
        fc2PixelFormat::FC2_PIXEL_FORMAT_MONO8 => Ok(PixelFormat::Mono8),
        fc2PixelFormat::FC2_PIXEL_FORMAT_MONO16 | fc2PixelFormat::FC2_PIXEL_FORMAT_S_MONO16 => Ok(PixelFormat::Mono16),
        fc2PixelFormat::FC2_PIXEL_FORMAT_RAW8 => Ok(PixelFormat::Raw8),
        fc2PixelFormat::FC2_PIXEL_FORMAT_RAW16 => Ok(PixelFormat::Raw16),
        _ => Err(FlyCapture2Error::UnsupportedPixelFormat(fc2_pix_fmt).into())
    }
}

fn to_fc2_pix_fmt(pix_fmt: PixelFormat) -> fc2PixelFormat {
    match pix_fmt {
        PixelFormat::Mono8 => fc2PixelFormat::FC2_PIXEL_FORMAT_MONO8,
        PixelFormat::Mono16 => fc2PixelFormat::FC2_PIXEL_FORMAT_MONO16,
        PixelFormat::Raw8 => fc2PixelFormat::FC2_PIXEL_FORMAT_RAW8,
        PixelFormat::Raw16 => fc2PixelFormat::FC2_PIXEL_FORMAT_RAW16
    }
}

fn to_property_type(id: PropertyId) -> fc2PropertyType {
    match id {
        PropertyId::Shutter => fc2PropertyType::FC2_SHUTTER,
        PropertyId::Gain => fc2PropertyType::FC2_GAIN,
        PropertyId::FrameRate => fc2PropertyType::FC2_FRAME_RATE
    }
}

fn as_fmt7_mode(mode: u32) -> Option<fc2Mode> {
    match mode {
        0 => Some(fc2Mode::FC2_MODE_0),
        1 => Some(fc2Mode::FC2_MODE_1),
        2 => Some(fc2Mode::FC2_MODE_2),
        3 => Some(fc2Mode::FC2_MODE_3),
        4 => Some(fc2Mode::FC2_MODE_4),
        5 => Some(fc2Mode::FC2_MODE_5),
        6 => Some(fc2Mode::FC2_MODE_6),
        7 => Some(fc2Mode::FC2_MODE_7),
        8 => Some(fc2Mode::FC2_MODE_8),
        _ => None
    }
}

fn c_string(chars: &[std::os::raw::c_char]) -> String {
    let bytes: Vec<u8> = chars.iter().take_while(|c| **c != 0).map(|c| *c as u8).collect();
    String::from_utf8_lossy(&bytes).trim().to_string()
}

struct Context {
    handle: fc2Context
}

unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    fn new() -> Result<Context, CameraError> {
        let mut handle = std::ptr::null_mut();

        checked_call!(fc2CreateContext(&mut handle));

        if handle.is_null() {
            Err(FlyCapture2Error::ContextCreationFailed.into())
        } else {
            Ok(Context{ handle })
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe { fc2DestroyContext(self.handle); }
    }
}

/// Retrieval destination; used by the capture thread only.
struct RetrieveBuffer {
    fc2_image: fc2Image,
    grab_timeout: Option<Duration>
}

unsafe impl Send for RetrieveBuffer {}

impl Drop for RetrieveBuffer {
    fn drop(&mut self) {
        unsafe { fc2DestroyImage(&mut self.fc2_image) };
    }
}

struct Fc2State {
    connected: bool,
    /// Format7 modes, one per binning.
    modes: Vec<(Bin, fc2Format7Info)>
}

/// Point Grey camera accessed with the FlyCapture2 SDK, in Format7 modes only.
pub struct FlyCapture2Device {
    context: Context,
    serial_number: Option<u32>,
    state: Mutex<Fc2State>,
    retrieve_buffer: Mutex<RetrieveBuffer>
}

impl FlyCapture2Device {
    /// Without a serial number the first camera on the bus is used.
    pub fn new(serial_number: Option<u32>) -> Result<FlyCapture2Device, CameraError> {
        let mut version: fc2Version = unsafe { std::mem::zeroed() };
        checked_call!(fc2GetLibraryVersion(&mut version));
        log::info!("FlyCapture2 library version: {}.{}.{}.{}", version.major, version.minor, version.type_, version.build);

        let context = Context::new()?;

        let mut fc2_image: fc2Image = unsafe { std::mem::zeroed() };
        checked_call!(fc2CreateImage(&mut fc2_image));

        Ok(FlyCapture2Device{
            context,
            serial_number,
            state: Mutex::new(Fc2State{ connected: false, modes: vec![] }),
            retrieve_buffer: Mutex::new(RetrieveBuffer{ fc2_image, grab_timeout: None })
        })
    }

    fn state(&self) -> MutexGuard<'_, Fc2State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn format7_configuration(&self) -> Result<fc2Format7ImageSettings, CameraError> {
        let mut settings = std::mem::MaybeUninit::uninit();
        let mut packet_size = 0;
        let mut percentage = 0.0;
        checked_call!(fc2GetFormat7Configuration(
            self.context.handle, settings.as_mut_ptr(), &mut packet_size, &mut percentage
        ));
        Ok(unsafe { settings.assume_init() })
    }

    fn to_fmt7_settings(&self, format: &FormatDescriptor) -> Result<fc2Format7ImageSettings, CameraError> {
        let state = self.state();
        let mode = state.modes.iter()
            .find(|(bin, _)| *bin == format.bin)
            .map(|(_, info)| info.mode)
            .ok_or_else(|| CameraError::InvalidValue(format!("binning {}", format.bin)))?;

        let mut settings: fc2Format7ImageSettings = unsafe { std::mem::zeroed() };
        settings.mode = mode;
        settings.offsetX = format.offset.x;
        settings.offsetY = format.offset.y;
        settings.width = format.size.width;
        settings.height = format.size.height;
        settings.pixelFormat = to_fc2_pix_fmt(format.pixel_format);

        Ok(settings)
    }

    fn fc2_property(&self, id: PropertyId) -> Result<fc2Property, CameraError> {
        let mut prop: fc2Property = unsafe { std::mem::zeroed() };
        prop.type_ = to_property_type(id);
        checked_call!(fc2GetProperty(self.context.handle, &mut prop));
        Ok(prop)
    }

    /// Sets the SDK's retrieval timeout if it differs from the last one used.
    fn set_grab_timeout(&self, buffer: &mut RetrieveBuffer, timeout: Duration) -> Result<(), CameraError> {
        if buffer.grab_timeout == Some(timeout) { return Ok(()); }

        let mut config: fc2Config = unsafe { std::mem::zeroed() };
        checked_call!(fc2GetConfiguration(self.context.handle, &mut config));
        config.grabTimeout = timeout.as_millis().min(std::os::raw::c_int::MAX as u128) as std::os::raw::c_int;
        checked_call!(fc2SetConfiguration(self.context.handle, &mut config));
        buffer.grab_timeout = Some(timeout);

        Ok(())
    }
}

impl Device for FlyCapture2Device {
    fn connect(&self) -> Result<(), CameraError> {
        let mut guid: fc2PGRGuid = unsafe { std::mem::zeroed() };
        match self.serial_number {
            Some(serial_number) => checked_call!(fc2GetCameraFromSerialNumber(self.context.handle, serial_number, &mut guid)),
            None => {
                let mut num_cameras = 0;
                checked_call!(fc2GetNumOfCameras(self.context.handle, &mut num_cameras));
                if num_cameras == 0 { return Err(FlyCapture2Error::NoCameraFound.into()); }
                checked_call!(fc2GetCameraFromIndex(self.context.handle, 0, &mut guid));
            }
        }
        checked_call!(fc2Connect(self.context.handle, &mut guid));

        let mut modes: Vec<(Bin, fc2Format7Info)> = vec![];
        let mut mode_idx = 0;
        while let Some(mode) = as_fmt7_mode(mode_idx) {
            mode_idx += 1;

            let mut f7: fc2Format7Info = unsafe { std::mem::zeroed() };
            f7.mode = mode;
            let mut supported = FALSE;
            checked_call!(fc2GetFormat7Info(self.context.handle, &mut f7, &mut supported));
            if supported != TRUE || f7.maxWidth == 0 || f7.maxHeight == 0 { continue; }

            let bin = match modes.first() {
                None => Bin::default(),
                Some((_, f7_full)) => Bin::new(f7_full.maxWidth / f7.maxWidth, f7_full.maxHeight / f7.maxHeight)
            };
            if bin.x == 0 || bin.y == 0 || modes.iter().any(|(b, _)| *b == bin) { continue; }

            log::debug!("Format7 mode {}: {}x{}, bin {}", mode as u32, f7.maxWidth, f7.maxHeight, bin);
            modes.push((bin, f7));
        }

        if modes.is_empty() {
            checked_call!(fc2Disconnect(self.context.handle));
            return Err(FlyCapture2Error::NoFormat7Modes.into());
        }

        let mut state = self.state();
        state.modes = modes;
        state.connected = true;

        Ok(())
    }

    fn disconnect(&self) -> Result<(), CameraError> {
        let mut state = self.state();
        if state.connected {
            checked_call!(fc2Disconnect(self.context.handle));
            state.connected = false;
        }
        Ok(())
    }

    fn device_info(&self) -> Result<DeviceInfo, CameraError> {
        let mut cam_info: fc2CameraInfo = unsafe { std::mem::zeroed() };
        checked_call!(fc2GetCameraInfo(self.context.handle, &mut cam_info));

        let mut trigger_info: fc2TriggerModeInfo = unsafe { std::mem::zeroed() };
        checked_call!(fc2GetTriggerModeInfo(self.context.handle, &mut trigger_info));

        Ok(DeviceInfo{
            serial_number: cam_info.serialNumber,
            model: c_string(&cam_info.modelName),
            vendor: c_string(&cam_info.vendorName),
            sensor: c_string(&cam_info.sensorInfo),
            resolution: c_string(&cam_info.sensorResolution),
            firmware_version: c_string(&cam_info.firmwareVersion),
            firmware_build_time: c_string(&cam_info.firmwareBuildTime),
            external_trigger: trigger_info.present == TRUE
        })
    }

    fn format_capabilities(&self) -> Result<FormatCapabilities, CameraError> {
        let state = self.state();
        let (_, f7) = state.modes.first().ok_or(CameraError::FlyCapture2Error(FlyCapture2Error::NoFormat7Modes))?;

        let pixel_formats = supported_pixel_formats().into_iter()
            .filter(|pf| f7.pixelFormatBitField & to_fc2_pix_fmt(*pf) as u32 != 0)
            .collect();

        Ok(FormatCapabilities{
            max_size: Size::new(f7.maxWidth, f7.maxHeight),
            offset_step: Size::new(f7.offsetHStepSize, f7.offsetVStepSize),
            size_step: Size::new(f7.imageHStepSize, f7.imageVStepSize),
            pixel_formats,
            binnings: state.modes.iter().map(|(bin, _)| *bin).collect()
        })
    }

    fn current_format(&self) -> Result<FormatDescriptor, CameraError> {
        let settings = self.format7_configuration()?;
        let bin = self.state().modes.iter()
            .find(|(_, f7)| f7.mode == settings.mode)
            .map(|(bin, _)| *bin)
            .unwrap_or_default();

        Ok(FormatDescriptor{
            offset: Point{ x: settings.offsetX, y: settings.offsetY },
            size: Size::new(settings.width, settings.height),
            pixel_format: to_pix_fmt(settings.pixelFormat)?,
            bin
        })
    }

    fn validate_format(&self, candidate: &FormatDescriptor) -> Result<FormatValidation, CameraError> {
        let mut settings = self.to_fmt7_settings(candidate)?;
        let mut valid = FALSE;
        let mut packet_info: fc2Format7PacketInfo = unsafe { std::mem::zeroed() };
        checked_call!(fc2ValidateFormat7Settings(self.context.handle, &mut settings, &mut valid, &mut packet_info));

        Ok(FormatValidation{ valid: valid == TRUE, transfer_size: packet_info.recommendedBytesPerPacket })
    }

    fn apply_format(&self, format: &FormatDescriptor, transfer_size: u32) -> Result<(), CameraError> {
        let mut settings = self.to_fmt7_settings(format)?;
        checked_call!(fc2SetFormat7ConfigurationPacket(self.context.handle, &mut settings, transfer_size));
        Ok(())
    }

    fn start_capture(&self) -> Result<(), CameraError> {
        checked_call!(fc2StartCapture(self.context.handle));
        Ok(())
    }

    fn stop_capture(&self) -> Result<(), CameraError> {
        checked_call!(fc2StopCapture(self.context.handle));
        Ok(())
    }

    fn retrieve_frame(&self, timeout: Duration, dest: &mut RawFrame) -> Result<(), RetrieveError> {
        let mut buffer = self.retrieve_buffer.lock().unwrap_or_else(PoisonError::into_inner);
        self.set_grab_timeout(&mut buffer, timeout)?;

        match unsafe { fc2RetrieveBuffer(self.context.handle, &mut buffer.fc2_image) } {
            fc2Error::FC2_ERROR_OK => (),
            fc2Error::FC2_ERROR_TIMEOUT => return Err(RetrieveError::Transient),
            fc2Error::FC2_ERROR_IMAGE_CONSISTENCY_ERROR => {
                log::debug!("inconsistent image received");
                return Err(RetrieveError::Transient);
            },
            error => return Err(RetrieveError::Fatal(FlyCapture2Error::Internal(error).into()))
        }

        let image = &buffer.fc2_image;
        let frame_pixels: &[u8] = unsafe { std::slice::from_raw_parts(image.pData, image.dataSize as usize) };

        dest.size = Size::new(image.cols, image.rows);
        dest.stride = image.stride as usize;
        dest.pixel_format = to_pix_fmt(image.format)?;
        dest.pixels.clear();
        dest.pixels.extend_from_slice(frame_pixels);

        Ok(())
    }

    fn property_info(&self, id: PropertyId) -> Result<PropertyInfo, CameraError> {
        let mut prop_info: fc2PropertyInfo = unsafe { std::mem::zeroed() };
        prop_info.type_ = to_property_type(id);
        checked_call!(fc2GetPropertyInfo(self.context.handle, &mut prop_info));

        let mut min = prop_info.absMin as f64;
        let mut max = prop_info.absMax as f64;
        if min > max { std::mem::swap(&mut min, &mut max); }

        Ok(PropertyInfo{
            present: prop_info.present == TRUE && prop_info.absValSupported == TRUE,
            min,
            max,
            auto_supported: prop_info.autoSupported == TRUE,
            manual_supported: prop_info.manualSupported == TRUE,
            on_off_supported: prop_info.onOffSupported == TRUE,
            one_push_supported: prop_info.onePushSupported == TRUE,
            units: c_string(&prop_info.pUnitAbbr)
        })
    }

    fn property(&self, id: PropertyId) -> Result<PropertyValue, CameraError> {
        let prop = self.fc2_property(id)?;
        Ok(PropertyValue{
            value: prop.absValue as f64,
            auto: prop.autoManualMode == TRUE,
            on: prop.onOff == TRUE,
            one_push: prop.onePush == TRUE
        })
    }

    fn set_property(&self, id: PropertyId, value: &PropertyValue) -> Result<(), CameraError> {
        let mut prop = self.fc2_property(id)?;
        prop.absControl = TRUE;
        prop.autoManualMode = if value.auto { TRUE } else { FALSE };
        prop.onOff = if value.on { TRUE } else { FALSE };
        prop.onePush = if value.one_push { TRUE } else { FALSE };
        if !value.auto { prop.absValue = value.value as f32; }
        checked_call!(fc2SetProperty(self.context.handle, &mut prop));
        Ok(())
    }

    fn read_register(&self, address: u32) -> Result<u32, CameraError> {
        let mut value = 0;
        checked_call!(fc2ReadRegister(self.context.handle, address, &mut value));
        Ok(value)
    }

    fn write_register(&self, address: u32, value: u32) -> Result<(), CameraError> {
        checked_call!(fc2WriteRegister(self.context.handle, address, value));
        Ok(())
    }

    fn set_trigger(&self, trigger: DeviceTrigger) -> Result<(), CameraError> {
        let mut trigger_mode: fc2TriggerMode = unsafe { std::mem::zeroed() };
        checked_call!(fc2GetTriggerMode(self.context.handle, &mut trigger_mode));

        match trigger {
            DeviceTrigger::Internal => trigger_mode.onOff = FALSE,
            DeviceTrigger::External{ frames_per_trigger } => {
                trigger_mode.onOff = TRUE;
                if frames_per_trigger == 1 {
                    // standard external trigger: one exposure per pulse
                    trigger_mode.mode = 0;
                    trigger_mode.parameter = 0;
                } else {
                    // multi-shot trigger
                    trigger_mode.mode = 15;
                    trigger_mode.parameter = frames_per_trigger;
                }
            }
        }
        checked_call!(fc2SetTriggerMode(self.context.handle, &mut trigger_mode));

        Ok(())
    }
}

fn supported_pixel_formats() -> Vec<PixelFormat> {
    vec![PixelFormat::Mono8, PixelFormat::Raw8, PixelFormat::Mono16, PixelFormat::Raw16]
}
