//
// pgcam - Point Grey camera acquisition engine
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Hardware interface: per-concern control objects over one camera.
//!

use crate::buffer::BufferManager;
use crate::camera::*;
use crate::camera::properties::ValidRanges;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum CapKind {
    DetInfo,
    Sync,
    Roi,
    Bin,
    Video,
    Buffer
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum ResetLevel {
    SoftReset,
    HardReset
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display, strum_macros::EnumIter)]
pub enum VideoMode {
    Y8,
    Y16
}

impl VideoMode {
    pub fn image_type(&self) -> ImageType {
        match self {
            VideoMode::Y8 => ImageType::Bpp8,
            VideoMode::Y16 => ImageType::Bpp16
        }
    }
}

impl From<ImageType> for VideoMode {
    fn from(image_type: ImageType) -> VideoMode {
        match image_type {
            ImageType::Bpp8 => VideoMode::Y8,
            ImageType::Bpp16 => VideoMode::Y16
        }
    }
}

pub trait DetInfoCtrl {
    /// Full frame in the current binning.
    fn max_image_size(&self) -> Size;

    fn detector_image_size(&self) -> Size;

    fn def_image_type(&self) -> ImageType;

    fn cur_image_type(&self) -> ImageType;

    fn set_cur_image_type(&self, image_type: ImageType) -> Result<(), CameraError>;

    /// Pixel width and height in metres, if known.
    fn pixel_size(&self) -> Option<(f64, f64)>;

    fn detector_type(&self) -> String;

    fn detector_model(&self) -> String;
}

/// Times in seconds.
pub trait SyncCtrl {
    fn check_trig_mode(&self, mode: TrigMode) -> bool;

    fn set_trig_mode(&self, mode: TrigMode) -> Result<(), CameraError>;

    fn trig_mode(&self) -> TrigMode;

    fn set_exp_time(&self, exp_time: f64) -> Result<(), CameraError>;

    fn exp_time(&self) -> Result<f64, CameraError>;

    fn set_lat_time(&self, lat_time: f64) -> Result<(), CameraError>;

    fn lat_time(&self) -> Result<f64, CameraError>;

    fn set_nb_frames(&self, nb_frames: u64) -> Result<(), CameraError>;

    fn nb_frames(&self) -> u64;

    fn valid_ranges(&self) -> Result<ValidRanges, CameraError>;
}

pub trait RoiCtrl {
    fn check_roi(&self, roi: &Roi) -> Result<Roi, CameraError>;

    fn set_roi(&self, roi: &Roi) -> Result<(), CameraError>;

    fn roi(&self) -> Roi;
}

pub trait BinCtrl {
    fn check_bin(&self, bin: Bin) -> Bin;

    fn set_bin(&self, bin: Bin) -> Result<(), CameraError>;

    fn bin(&self) -> Bin;
}

pub trait VideoCtrl {
    fn supported_video_modes(&self) -> Vec<VideoMode>;

    fn video_mode(&self) -> VideoMode;

    fn set_video_mode(&self, mode: VideoMode) -> Result<(), CameraError>;

    fn live(&self) -> bool;

    /// Live mode acquires until switched off.
    fn set_live(&self, live: bool) -> Result<(), CameraError>;

    fn gain(&self) -> Result<f64, CameraError>;

    fn set_gain(&self, gain: f64) -> Result<(), CameraError>;
}

pub struct CameraDetInfo {
    camera: Arc<Camera>
}

impl DetInfoCtrl for CameraDetInfo {
    fn max_image_size(&self) -> Size { self.camera.max_image_size() }

    fn detector_image_size(&self) -> Size { self.camera.max_image_size() }

    fn def_image_type(&self) -> ImageType { ImageType::Bpp16 }

    fn cur_image_type(&self) -> ImageType { self.camera.image_type() }

    fn set_cur_image_type(&self, image_type: ImageType) -> Result<(), CameraError> {
        self.camera.set_image_type(image_type)
    }

    fn pixel_size(&self) -> Option<(f64, f64)> { None }

    fn detector_type(&self) -> String { self.camera.detector_type() }

    fn detector_model(&self) -> String { self.camera.detector_model() }
}

pub struct CameraSync {
    camera: Arc<Camera>
}

impl SyncCtrl for CameraSync {
    fn check_trig_mode(&self, mode: TrigMode) -> bool { self.camera.check_trig_mode(mode) }

    fn set_trig_mode(&self, mode: TrigMode) -> Result<(), CameraError> { self.camera.set_trig_mode(mode) }

    fn trig_mode(&self) -> TrigMode { self.camera.trig_mode() }

    fn set_exp_time(&self, exp_time: f64) -> Result<(), CameraError> { self.camera.set_exp_time(exp_time) }

    fn exp_time(&self) -> Result<f64, CameraError> { self.camera.exp_time() }

    fn set_lat_time(&self, lat_time: f64) -> Result<(), CameraError> { self.camera.set_lat_time(lat_time) }

    fn lat_time(&self) -> Result<f64, CameraError> { self.camera.lat_time() }

    fn set_nb_frames(&self, nb_frames: u64) -> Result<(), CameraError> { self.camera.set_nb_frames(nb_frames) }

    fn nb_frames(&self) -> u64 { self.camera.nb_frames() }

    fn valid_ranges(&self) -> Result<ValidRanges, CameraError> { self.camera.valid_ranges() }
}

pub struct CameraRoi {
    camera: Arc<Camera>
}

impl RoiCtrl for CameraRoi {
    fn check_roi(&self, roi: &Roi) -> Result<Roi, CameraError> { self.camera.check_roi(roi) }

    fn set_roi(&self, roi: &Roi) -> Result<(), CameraError> { self.camera.set_roi(roi) }

    fn roi(&self) -> Roi { self.camera.roi() }
}

pub struct CameraBin {
    camera: Arc<Camera>
}

impl BinCtrl for CameraBin {
    fn check_bin(&self, bin: Bin) -> Bin { self.camera.check_bin(bin) }

    fn set_bin(&self, bin: Bin) -> Result<(), CameraError> { self.camera.set_bin(bin) }

    fn bin(&self) -> Bin { self.camera.bin() }
}

pub struct CameraVideo {
    camera: Arc<Camera>,
    live: AtomicBool
}

impl VideoCtrl for CameraVideo {
    fn supported_video_modes(&self) -> Vec<VideoMode> {
        vec![VideoMode::Y8, VideoMode::Y16]
    }

    fn video_mode(&self) -> VideoMode { self.camera.image_type().into() }

    fn set_video_mode(&self, mode: VideoMode) -> Result<(), CameraError> {
        self.camera.set_image_type(mode.image_type())
    }

    fn live(&self) -> bool { self.live.load(Ordering::SeqCst) }

    fn set_live(&self, live: bool) -> Result<(), CameraError> {
        if live {
            self.camera.set_nb_frames(0)?;
            self.camera.prepare_acq()?;
            self.camera.start_acq()?;
        } else {
            self.camera.stop_acq()?;
        }
        self.live.store(live, Ordering::SeqCst);

        Ok(())
    }

    fn gain(&self) -> Result<f64, CameraError> { self.camera.gain() }

    fn set_gain(&self, gain: f64) -> Result<(), CameraError> { self.camera.set_gain(gain) }
}

/// Entry point for an application driving one camera.
pub struct Interface {
    camera: Arc<Camera>,
    buffer: Arc<dyn BufferManager>,
    det_info: CameraDetInfo,
    sync: CameraSync,
    roi: CameraRoi,
    bin: Option<CameraBin>,
    video: CameraVideo
}

impl Interface {
    /// `buffer` is expected to be the one the camera was opened with.
    pub fn new(camera: Arc<Camera>, buffer: Arc<dyn BufferManager>) -> Interface {
        let bin = if camera.binning_available() { Some(CameraBin{ camera: Arc::clone(&camera) }) } else { None };

        Interface{
            det_info: CameraDetInfo{ camera: Arc::clone(&camera) },
            sync: CameraSync{ camera: Arc::clone(&camera) },
            roi: CameraRoi{ camera: Arc::clone(&camera) },
            bin,
            video: CameraVideo{ camera: Arc::clone(&camera), live: AtomicBool::new(false) },
            camera,
            buffer
        }
    }

    pub fn cap_list(&self) -> Vec<CapKind> {
        let mut caps = vec![CapKind::DetInfo, CapKind::Sync, CapKind::Roi];
        if self.bin.is_some() { caps.push(CapKind::Bin); }
        caps.push(CapKind::Video);
        caps.push(CapKind::Buffer);
        caps
    }

    pub fn det_info(&self) -> &dyn DetInfoCtrl { &self.det_info }

    pub fn sync(&self) -> &dyn SyncCtrl { &self.sync }

    pub fn roi(&self) -> &dyn RoiCtrl { &self.roi }

    pub fn bin(&self) -> Option<&dyn BinCtrl> { self.bin.as_ref().map(|b| b as &dyn BinCtrl) }

    pub fn video(&self) -> &dyn VideoCtrl { &self.video }

    pub fn buffer(&self) -> &Arc<dyn BufferManager> { &self.buffer }

    pub fn camera(&self) -> &Arc<Camera> { &self.camera }

    /// Stops any acquisition and clears a fault; both levels behave the same.
    pub fn reset(&self, level: ResetLevel) -> Result<(), CameraError> {
        log::info!("interface reset ({})", level);
        self.video.live.store(false, Ordering::SeqCst);
        self.camera.reset()
    }

    pub fn prepare_acq(&self) -> Result<(), CameraError> { self.camera.prepare_acq() }

    pub fn start_acq(&self) -> Result<(), CameraError> { self.camera.start_acq() }

    pub fn stop_acq(&self) -> Result<(), CameraError> {
        self.video.live.store(false, Ordering::SeqCst);
        self.camera.stop_acq()
    }

    pub fn status(&self) -> HwStatus { self.camera.hw_status() }

    pub fn nb_hw_acquired_frames(&self) -> u64 { self.camera.nb_hw_acquired_frames() }

    pub fn auto_exp_time(&self) -> bool { self.camera.auto_exp_time() }

    pub fn set_auto_exp_time(&self, auto: bool) -> Result<(), CameraError> { self.camera.set_auto_exp_time(auto) }

    pub fn auto_gain(&self) -> bool { self.camera.auto_gain() }

    pub fn set_auto_gain(&self, auto: bool) -> Result<(), CameraError> { self.camera.set_auto_gain(auto) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SoftBufferManager;
    use crate::camera::drivers::simulator::{SimConfig, SimDevice};
    use std::time::{Duration, Instant};

    fn interface(config: SimConfig) -> (SimDevice, Interface) {
        let device = SimDevice::new(config);
        let buffer = Arc::new(SoftBufferManager::new(4));
        let camera = Camera::open(Box::new(device.clone()), buffer.clone(), CameraSettings::default()).unwrap();
        (device, Interface::new(Arc::new(camera), buffer))
    }

    fn wait_for<F: Fn() -> bool>(condition: F) {
        let t_start = Instant::now();
        while !condition() {
            assert!(t_start.elapsed() < Duration::from_secs(10), "timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn given_single_binning_bin_capability_is_absent() {
        let (_device, hw) = interface(SimConfig::default());
        assert_eq!(
            vec![CapKind::DetInfo, CapKind::Sync, CapKind::Roi, CapKind::Bin, CapKind::Video, CapKind::Buffer],
            hw.cap_list()
        );

        let (_device, hw) = interface(SimConfig{ binnings: vec![Bin::new(1, 1)], ..SimConfig::default() });
        assert!(!hw.cap_list().contains(&CapKind::Bin));
        assert!(hw.bin().is_none());
    }

    #[test]
    fn given_detector_info_defaults_are_reported() {
        let (_device, hw) = interface(SimConfig::default());
        let det_info = hw.det_info();
        assert_eq!(ImageType::Bpp16, det_info.def_image_type());
        assert_eq!(ImageType::Bpp8, det_info.cur_image_type());
        assert_eq!(None, det_info.pixel_size());
        assert_eq!(Size::new(640, 480), det_info.max_image_size());
        assert_eq!("Simulator", det_info.detector_model());

        hw.bin().unwrap().set_bin(Bin::new(2, 2)).unwrap();
        assert_eq!(Size::new(320, 240), det_info.max_image_size());
    }

    #[test]
    fn given_fault_reset_returns_to_ready() {
        let (device, hw) = interface(SimConfig::default());
        device.fail_on_retrieve_attempt(1);
        hw.sync().set_nb_frames(5).unwrap();
        hw.prepare_acq().unwrap();
        hw.start_acq().unwrap();
        wait_for(|| hw.status().acq == AcqStatus::AcqFault);

        hw.reset(ResetLevel::SoftReset).unwrap();
        let status = hw.status();
        assert_eq!((AcqStatus::AcqReady, DetStatus::DetIdle), (status.acq, status.det));
    }

    #[test]
    fn given_live_video_acquisition_runs_until_switched_off() {
        let (_device, hw) = interface(SimConfig::default());
        let video = hw.video();
        video.set_video_mode(VideoMode::Y16).unwrap();
        assert_eq!(VideoMode::Y16, video.video_mode());

        video.set_live(true).unwrap();
        assert!(video.live());
        assert_eq!(0, hw.sync().nb_frames());
        wait_for(|| hw.nb_hw_acquired_frames() >= 5);

        video.set_live(false).unwrap();
        assert!(!video.live());
        assert_eq!(AcqStatus::AcqReady, hw.status().acq);
    }

    #[test]
    fn given_sync_control_times_are_in_seconds() {
        let (device, hw) = interface(SimConfig::default());
        hw.sync().set_exp_time(0.005).unwrap();
        assert!((device.device_property(PropertyId::Shutter).value - 5.0).abs() < 1.0e-9);
        assert!((hw.sync().exp_time().unwrap() - 0.005).abs() < 1.0e-9);
        assert!(!hw.auto_exp_time());
    }
}
