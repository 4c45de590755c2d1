//
// pgcam - Point Grey camera acquisition engine
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Common camera code.
//!

pub mod drivers;
pub mod format;
pub mod properties;
pub mod session;
pub mod status;

pub use session::{Camera, CameraSettings};
pub use status::{AcqStatus, DetStatus, HwStatus, Status};

use std::time::Duration;

#[derive(Debug)]
pub enum CameraError {
    /// Retrieval returned no image; not an error condition for the acquisition.
    FrameUnavailable,
    /// Value outside the valid range or not supported by the device.
    InvalidValue(String),
    /// The device refused a candidate image format.
    FormatRejected(String),
    /// Operation not permitted while the capture thread is armed.
    AcquisitionRunning,
    NotSupported(String),
    /// Status is `Fault`; a reset is required first.
    Fault,
    /// The camera has been closed.
    Closed,
    ThreadSpawn(String),
    SimulatorError(drivers::simulator::SimulatorError),
    #[cfg(feature = "camera_flycap2")]
    FlyCapture2Error(drivers::flycapture2::FlyCapture2Error),
}

impl std::fmt::Display for CameraError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            CameraError::FrameUnavailable => write!(f, "frame unavailable"),
            CameraError::InvalidValue(s) => write!(f, "invalid value: {}", s),
            CameraError::FormatRejected(s) => write!(f, "image format rejected by device: {}", s),
            CameraError::AcquisitionRunning => write!(f, "acquisition is running"),
            CameraError::NotSupported(s) => write!(f, "not supported: {}", s),
            CameraError::Fault => write!(f, "camera is in fault state; reset required"),
            CameraError::Closed => write!(f, "camera has been closed"),
            CameraError::ThreadSpawn(s) => write!(f, "failed to start capture thread: {}", s),
            CameraError::SimulatorError(e) => write!(f, "simulator error: {:?}", e),
            #[cfg(feature = "camera_flycap2")]
            CameraError::FlyCapture2Error(e) => write!(f, "FlyCapture2 error: {:?}", e),
        }
    }
}

impl std::error::Error for CameraError {}

/// Outcome of a failed `Device::retrieve_frame`.
#[derive(Debug)]
pub enum RetrieveError {
    /// No image available this time (timeout, damaged frame); retrying makes sense.
    Transient,
    /// Device-level failure; the current run cannot continue.
    Fatal(CameraError),
}

impl From<CameraError> for RetrieveError {
    fn from(error: CameraError) -> RetrieveError {
        match error {
            CameraError::FrameUnavailable => RetrieveError::Transient,
            other => RetrieveError::Fatal(other)
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: u32,
    pub y: u32
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32
}

impl Size {
    pub fn new(width: u32, height: u32) -> Size { Size{ width, height } }

    pub fn is_empty(&self) -> bool { self.width == 0 || self.height == 0 }

    pub fn num_pixels(&self) -> usize { self.width as usize * self.height as usize }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Region of interest, in binned pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Roi {
    pub top_left: Point,
    pub size: Size
}

impl Roi {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Roi {
        Roi{ top_left: Point{ x, y }, size: Size{ width, height } }
    }

    pub fn full(size: Size) -> Roi {
        Roi{ top_left: Point::default(), size }
    }

    /// An empty ROI stands for "no ROI" (full frame).
    pub fn is_empty(&self) -> bool { self.size.is_empty() }

    pub fn fits_in(&self, bounds: Size) -> bool {
        self.top_left.x as u64 + self.size.width as u64 <= bounds.width as u64 &&
        self.top_left.y as u64 + self.size.height as u64 <= bounds.height as u64
    }
}

impl std::fmt::Display for Roi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "<{},{}>-{}", self.top_left.x, self.top_left.y, self.size)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Bin {
    pub x: u32,
    pub y: u32
}

impl Bin {
    pub fn new(x: u32, y: u32) -> Bin { Bin{ x, y } }

    pub fn is_one(&self) -> bool { self.x == 1 && self.y == 1 }
}

impl Default for Bin {
    fn default() -> Bin { Bin{ x: 1, y: 1 } }
}

impl std::fmt::Display for Bin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}x{}", self.x, self.y)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumIter)]
pub enum PixelFormat {
    Mono8,
    Mono16,
    Raw8,
    Raw16
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Mono8 | PixelFormat::Raw8 => 1,
            PixelFormat::Mono16 | PixelFormat::Raw16 => 2
        }
    }

    pub fn is_16bit(&self) -> bool { self.bytes_per_pixel() == 2 }

    pub fn image_type(&self) -> ImageType {
        if self.is_16bit() { ImageType::Bpp16 } else { ImageType::Bpp8 }
    }
}

/// Pixel depth as seen by the calling application.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumIter)]
pub enum ImageType {
    Bpp8,
    Bpp16
}

impl ImageType {
    /// Pixel formats able to deliver this image type, in order of preference.
    pub fn pixel_formats(&self) -> [PixelFormat; 2] {
        match self {
            ImageType::Bpp8 => [PixelFormat::Mono8, PixelFormat::Raw8],
            ImageType::Bpp16 => [PixelFormat::Mono16, PixelFormat::Raw16]
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumIter)]
pub enum TrigMode {
    IntTrig,
    IntTrigMult,
    ExtTrigSingle,
    ExtTrigMult,
    ExtGate,
    ExtStartStop,
    ExtTrigReadout
}

/// Trigger configuration understood by the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceTrigger {
    /// Free running.
    Internal,
    /// Each external pulse starts `frames_per_trigger` exposures (0: until stopped).
    External{ frames_per_trigger: u32 }
}

#[derive(Clone, Debug, Default)]
pub struct DeviceInfo {
    pub serial_number: u32,
    pub model: String,
    pub vendor: String,
    pub sensor: String,
    pub resolution: String,
    pub firmware_version: String,
    pub firmware_build_time: String,
    pub external_trigger: bool
}

/// Image format (Format7-style) configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FormatDescriptor {
    /// Offset in binned pixels.
    pub offset: Point,
    /// Size in binned pixels.
    pub size: Size,
    pub pixel_format: PixelFormat,
    pub bin: Bin
}

impl FormatDescriptor {
    pub fn roi(&self) -> Roi {
        Roi{ top_left: self.offset, size: self.size }
    }

    pub fn byte_len(&self) -> usize {
        self.size.num_pixels() * self.pixel_format.bytes_per_pixel()
    }
}

/// Image format limits reported by the device.
#[derive(Clone, Debug, PartialEq)]
pub struct FormatCapabilities {
    /// Unbinned sensor size.
    pub max_size: Size,
    pub offset_step: Size,
    pub size_step: Size,
    pub pixel_formats: Vec<PixelFormat>,
    pub binnings: Vec<Bin>
}

impl FormatCapabilities {
    /// Full frame size for the given binning.
    pub fn max_size_for(&self, bin: Bin) -> Size {
        Size{ width: self.max_size.width / bin.x.max(1), height: self.max_size.height / bin.y.max(1) }
    }

    pub fn supports_pixel_format(&self, pixel_format: PixelFormat) -> bool {
        self.pixel_formats.contains(&pixel_format)
    }

    pub fn supports_bin(&self, bin: Bin) -> bool {
        self.binnings.contains(&bin)
    }
}

/// Result of `Device::validate_format`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FormatValidation {
    pub valid: bool,
    /// Recommended transfer (packet) size in bytes.
    pub transfer_size: u32
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumIter)]
pub enum PropertyId {
    /// Exposure time (ms).
    Shutter,
    /// Gain (dB).
    Gain,
    /// Frame rate (fps).
    FrameRate
}

/// Hardware-reported capabilities and range of a property.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertyInfo {
    pub present: bool,
    pub min: f64,
    pub max: f64,
    pub auto_supported: bool,
    pub manual_supported: bool,
    pub on_off_supported: bool,
    pub one_push_supported: bool,
    pub units: String
}

impl PropertyInfo {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct PropertyValue {
    pub value: f64,
    pub auto: bool,
    pub on: bool,
    pub one_push: bool
}

/// Frame as delivered by the device; reused between retrievals.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub size: Size,
    pub stride: usize,
    pub pixel_format: PixelFormat,
    pub pixels: Vec<u8>
}

impl Default for RawFrame {
    fn default() -> RawFrame {
        RawFrame{ size: Size::default(), stride: 0, pixel_format: PixelFormat::Mono8, pixels: vec![] }
    }
}

/// Capability provider for one physical camera.
///
/// All methods take `&self`: the capture thread calls `retrieve_frame` concurrently with
/// the control calls issued by the application, so implementations synchronize internally
/// (or rely on a thread-safe SDK).
pub trait Device: Send + Sync {
    fn connect(&self) -> Result<(), CameraError>;

    fn disconnect(&self) -> Result<(), CameraError>;

    fn device_info(&self) -> Result<DeviceInfo, CameraError>;

    fn format_capabilities(&self) -> Result<FormatCapabilities, CameraError>;

    /// Returns the format the device is currently configured with.
    fn current_format(&self) -> Result<FormatDescriptor, CameraError>;

    fn validate_format(&self, candidate: &FormatDescriptor) -> Result<FormatValidation, CameraError>;

    fn apply_format(&self, format: &FormatDescriptor, transfer_size: u32) -> Result<(), CameraError>;

    fn start_capture(&self) -> Result<(), CameraError>;

    fn stop_capture(&self) -> Result<(), CameraError>;

    /// Blocks until a frame arrives or `timeout` elapses; may change the size,
    /// stride and pixel format of `dest`.
    fn retrieve_frame(&self, timeout: Duration, dest: &mut RawFrame) -> Result<(), RetrieveError>;

    fn property_info(&self, id: PropertyId) -> Result<PropertyInfo, CameraError>;

    fn property(&self, id: PropertyId) -> Result<PropertyValue, CameraError>;

    fn set_property(&self, id: PropertyId, value: &PropertyValue) -> Result<(), CameraError>;

    fn read_register(&self, address: u32) -> Result<u32, CameraError>;

    fn write_register(&self, address: u32, value: u32) -> Result<(), CameraError>;

    fn set_trigger(&self, trigger: DeviceTrigger) -> Result<(), CameraError>;

    // Transport tuning (GigE only).

    fn packet_size(&self) -> Result<u32, CameraError> {
        Err(CameraError::NotSupported("packet size".to_string()))
    }

    fn set_packet_size(&self, _packet_size: u32) -> Result<(), CameraError> {
        Err(CameraError::NotSupported("packet size".to_string()))
    }

    fn packet_delay(&self) -> Result<u32, CameraError> {
        Err(CameraError::NotSupported("packet delay".to_string()))
    }

    fn set_packet_delay(&self, _packet_delay: u32) -> Result<(), CameraError> {
        Err(CameraError::NotSupported("packet delay".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_binning_max_size_is_divided() {
        let caps = FormatCapabilities{
            max_size: Size::new(1280, 960),
            offset_step: Size::new(4, 2),
            size_step: Size::new(8, 2),
            pixel_formats: vec![PixelFormat::Mono8],
            binnings: vec![Bin::new(1, 1), Bin::new(2, 2)]
        };
        assert_eq!(Size::new(640, 480), caps.max_size_for(Bin::new(2, 2)));
        assert_eq!(Size::new(1280, 960), caps.max_size_for(Bin::default()));
    }

    #[test]
    fn given_roi_past_bounds_does_not_fit() {
        let bounds = Size::new(100, 50);
        assert!(Roi::new(0, 0, 100, 50).fits_in(bounds));
        assert!(!Roi::new(1, 0, 100, 50).fits_in(bounds));
        assert!(!Roi::new(0, 10, 10, 41).fits_in(bounds));
    }

    #[test]
    fn given_transient_camera_error_retrieve_error_is_transient() {
        assert!(matches!(RetrieveError::from(CameraError::FrameUnavailable), RetrieveError::Transient));
        assert!(matches!(RetrieveError::from(CameraError::Closed), RetrieveError::Fatal(CameraError::Closed)));
    }

    #[test]
    fn given_16bit_pixel_format_image_type_is_bpp16() {
        assert_eq!(ImageType::Bpp16, PixelFormat::Raw16.image_type());
        assert_eq!(ImageType::Bpp8, PixelFormat::Mono8.image_type());
        assert_eq!(2, PixelFormat::Mono16.bytes_per_pixel());
    }
}
