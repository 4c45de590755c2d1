//
// pgcam - Point Grey camera acquisition engine
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Image format negotiator.
//!

use crate::camera::*;

mod registers {
    pub const IMAGE_DATA_FORMAT: u32 = 0x1048;
}

/// Presence flag + little-endian 16-bit pixel data.
const IMAGE_DATA_FORMAT_16BIT: u32 = 0x8000_0001;

fn align_down(value: u32, step: u32) -> u32 {
    if step <= 1 { value } else { value / step * step }
}

fn align_up(value: u32, step: u32) -> u32 {
    if step <= 1 { value } else { (value + step - 1) / step * step }
}

/// Holds the committed image format; a candidate replaces it only after the device accepted it.
pub struct FormatNegotiator {
    caps: FormatCapabilities,
    current: FormatDescriptor,
    roi_active: bool
}

impl FormatNegotiator {
    /// Applies the device's current format (so the 16-bit fix-up is in effect from the start).
    pub fn new(device: &dyn Device) -> Result<FormatNegotiator, CameraError> {
        let caps = device.format_capabilities()?;
        let initial = device.current_format()?;
        let roi_active = initial.roi() != Roi::full(caps.max_size_for(initial.bin));

        let mut negotiator = FormatNegotiator{ caps, current: initial, roi_active };
        negotiator.apply(device, initial)?;

        Ok(negotiator)
    }

    pub fn capabilities(&self) -> &FormatCapabilities { &self.caps }

    pub fn current(&self) -> &FormatDescriptor { &self.current }

    pub fn image_type(&self) -> ImageType { self.current.pixel_format.image_type() }

    pub fn bin(&self) -> Bin { self.current.bin }

    /// Full frame size in the current binning.
    pub fn max_image_size(&self) -> Size { self.caps.max_size_for(self.current.bin) }

    pub fn is_roi_active(&self) -> bool { self.roi_active }

    pub fn roi(&self) -> Roi { self.current.roi() }

    /// Returns the region the device would actually use for `roi`.
    ///
    /// An empty ROI means full frame. The offset is aligned down and the size up
    /// to the device's steps.
    pub fn check_roi(&self, roi: &Roi) -> Result<Roi, CameraError> {
        let bounds = self.max_image_size();
        if roi.is_empty() {
            return Ok(Roi::full(bounds));
        }
        if !roi.fits_in(bounds) {
            return Err(CameraError::InvalidValue(format!("ROI {} outside {}", roi, bounds)));
        }

        let x = align_down(roi.top_left.x, self.caps.offset_step.width);
        let y = align_down(roi.top_left.y, self.caps.offset_step.height);
        let width = align_up(roi.size.width + roi.top_left.x - x, self.caps.size_step.width).min(bounds.width - x);
        let height = align_up(roi.size.height + roi.top_left.y - y, self.caps.size_step.height).min(bounds.height - y);

        Ok(Roi::new(x, y, width, height))
    }

    /// Returns whether the region changed.
    pub fn set_roi(&mut self, device: &dyn Device, roi: &Roi) -> Result<bool, CameraError> {
        let checked = self.check_roi(roi)?;
        let full = Roi::full(self.max_image_size());

        let candidate = FormatDescriptor{ offset: checked.top_left, size: checked.size, ..self.current };
        let changed = self.apply(device, candidate)?;
        self.roi_active = checked != full;

        Ok(changed)
    }

    /// Returns the closest supported binning not exceeding `bin`.
    pub fn check_bin(&self, bin: Bin) -> Bin {
        self.caps.binnings.iter()
            .filter(|b| b.x <= bin.x && b.y <= bin.y)
            .max_by_key(|b| b.x * b.y)
            .copied()
            .unwrap_or_default()
    }

    /// Resets the ROI to full frame of the new binning. Returns whether the format changed.
    pub fn set_bin(&mut self, device: &dyn Device, bin: Bin) -> Result<bool, CameraError> {
        if !self.caps.supports_bin(bin) {
            return Err(CameraError::InvalidValue(format!("binning {}", bin)));
        }

        let candidate = FormatDescriptor{
            offset: Point::default(),
            size: self.caps.max_size_for(bin),
            bin,
            ..self.current
        };
        let changed = self.apply(device, candidate)?;
        self.roi_active = false;

        Ok(changed)
    }

    pub fn binning_available(&self) -> bool { self.caps.binnings.len() > 1 }

    /// Returns whether the pixel format changed.
    pub fn set_image_type(&mut self, device: &dyn Device, image_type: ImageType) -> Result<bool, CameraError> {
        let pixel_format = image_type.pixel_formats().iter()
            .copied()
            .find(|pf| self.caps.supports_pixel_format(*pf))
            .ok_or_else(|| CameraError::InvalidValue(format!("image type {}", image_type)))?;

        self.apply(device, FormatDescriptor{ pixel_format, ..self.current })
    }

    pub fn supports_image_type(&self, image_type: ImageType) -> bool {
        image_type.pixel_formats().iter().any(|pf| self.caps.supports_pixel_format(*pf))
    }

    /// Validates and applies `candidate`; on failure the device is put back into the committed format.
    fn apply(&mut self, device: &dyn Device, candidate: FormatDescriptor) -> Result<bool, CameraError> {
        let validation = device.validate_format(&candidate)?;
        if !validation.valid {
            return Err(CameraError::FormatRejected(format!(
                "{} {} at {}, bin {}", candidate.size, candidate.pixel_format, candidate.roi(), candidate.bin
            )));
        }

        if let Err(e) = write_format(device, &candidate, validation.transfer_size) {
            log::warn!("failed to apply image format: {}; restoring previous", e);
            self.restore(device);
            return Err(e);
        }

        let changed = candidate != self.current;
        self.current = candidate;
        log::info!(
            "image format: {} {} at ({}, {}), bin {}, transfer size {}",
            candidate.size, candidate.pixel_format, candidate.offset.x, candidate.offset.y,
            candidate.bin, validation.transfer_size
        );

        Ok(changed)
    }

    fn restore(&self, device: &dyn Device) {
        let result = device.validate_format(&self.current)
            .and_then(|v| write_format(device, &self.current, v.transfer_size));

        if let Err(e) = result {
            log::error!("failed to restore image format: {}", e);
        }
    }
}

fn write_format(device: &dyn Device, format: &FormatDescriptor, transfer_size: u32) -> Result<(), CameraError> {
    device.apply_format(format, transfer_size)?;
    if format.pixel_format.is_16bit() {
        // the register cannot be reliably read back on all camera generations
        device.write_register(registers::IMAGE_DATA_FORMAT, IMAGE_DATA_FORMAT_16BIT)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::drivers::simulator::{SimConfig, SimDevice};

    fn negotiator(config: SimConfig) -> (SimDevice, FormatNegotiator) {
        let device = SimDevice::new(config);
        device.connect().unwrap();
        let negotiator = FormatNegotiator::new(&device).unwrap();
        (device, negotiator)
    }

    #[test]
    fn given_roi_outside_bounds_format_is_unchanged() {
        let (device, mut fmt) = negotiator(SimConfig::default());
        let before = *fmt.current();
        let applied = device.applied_formats().len();

        assert!(matches!(fmt.set_roi(&device, &Roi::new(600, 0, 64, 64)), Err(CameraError::InvalidValue(_))));
        assert_eq!(before, *fmt.current());
        assert_eq!(applied, device.applied_formats().len());
        assert!(!fmt.is_roi_active());
    }

    #[test]
    fn given_unaligned_roi_it_is_aligned_to_steps() {
        let (_device, fmt) = negotiator(SimConfig::default());
        assert_eq!(Roi::new(2, 2, 104, 100), fmt.check_roi(&Roi::new(3, 3, 100, 99)).unwrap());
        assert_eq!(Roi::full(Size::new(640, 480)), fmt.check_roi(&Roi::default()).unwrap());
    }

    #[test]
    fn given_valid_roi_it_is_committed() {
        let (device, mut fmt) = negotiator(SimConfig::default());
        assert!(fmt.set_roi(&device, &Roi::new(16, 8, 64, 32)).unwrap());
        assert!(fmt.is_roi_active());
        assert_eq!(Roi::new(16, 8, 64, 32), fmt.roi());
        assert_eq!(Some(fmt.current()), device.applied_formats().last());
    }

    #[test]
    fn given_full_frame_roi_it_is_normalized_to_inactive() {
        let (device, mut fmt) = negotiator(SimConfig::default());
        fmt.set_roi(&device, &Roi::new(16, 8, 64, 32)).unwrap();
        assert!(fmt.set_roi(&device, &Roi::new(0, 0, 640, 480)).unwrap());
        assert!(!fmt.is_roi_active());
        assert_eq!(Roi::full(Size::new(640, 480)), fmt.roi());
    }

    #[test]
    fn given_device_rejection_format_is_unchanged() {
        let (device, mut fmt) = negotiator(SimConfig::default());
        let before = *fmt.current();
        device.set_reject_formats(true);

        assert!(matches!(fmt.set_roi(&device, &Roi::new(16, 8, 64, 32)), Err(CameraError::FormatRejected(_))));
        assert!(matches!(fmt.set_image_type(&device, ImageType::Bpp16), Err(CameraError::FormatRejected(_))));
        assert_eq!(before, *fmt.current());
        assert!(device.register_writes().is_empty());
    }

    #[test]
    fn given_apply_failure_previous_format_is_kept() {
        let (device, mut fmt) = negotiator(SimConfig::default());
        let before = *fmt.current();
        device.set_fail_apply(true);

        assert!(fmt.set_bin(&device, Bin::new(2, 2)).is_err());
        assert_eq!(before, *fmt.current());
        assert_eq!(before, device.current_format().unwrap());
    }

    #[test]
    fn given_16bit_image_type_endianness_register_is_written_every_time() {
        let (device, mut fmt) = negotiator(SimConfig::default());
        assert!(fmt.set_image_type(&device, ImageType::Bpp16).unwrap());
        assert!(!fmt.set_image_type(&device, ImageType::Bpp16).unwrap());
        assert_eq!(
            vec![(registers::IMAGE_DATA_FORMAT, IMAGE_DATA_FORMAT_16BIT); 2],
            device.register_writes()
        );
        assert_eq!(PixelFormat::Mono16, fmt.current().pixel_format);

        fmt.set_image_type(&device, ImageType::Bpp8).unwrap();
        assert_eq!(2, device.register_writes().len());
    }

    #[test]
    fn given_unsupported_image_type_it_is_rejected() {
        let (device, mut fmt) = negotiator(SimConfig{ pixel_formats: vec![PixelFormat::Mono8], ..SimConfig::default() });
        assert!(!fmt.supports_image_type(ImageType::Bpp16));
        assert!(matches!(fmt.set_image_type(&device, ImageType::Bpp16), Err(CameraError::InvalidValue(_))));
    }

    #[test]
    fn given_binning_request_closest_supported_is_chosen() {
        let (device, mut fmt) = negotiator(SimConfig::default());
        assert_eq!(Bin::new(2, 2), fmt.check_bin(Bin::new(4, 4)));
        assert_eq!(Bin::new(1, 1), fmt.check_bin(Bin::new(1, 3)));
        assert!(matches!(fmt.set_bin(&device, Bin::new(3, 3)), Err(CameraError::InvalidValue(_))));

        fmt.set_roi(&device, &Roi::new(16, 8, 64, 32)).unwrap();
        fmt.set_bin(&device, Bin::new(2, 2)).unwrap();
        assert_eq!(Size::new(320, 240), fmt.max_image_size());
        assert_eq!(Roi::full(Size::new(320, 240)), fmt.roi());
        assert!(!fmt.is_roi_active());
    }
}
