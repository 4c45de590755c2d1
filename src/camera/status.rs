//
// pgcam - Point Grey camera acquisition engine
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Acquisition status model.
//!

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumIter)]
pub enum Status {
    /// Idle.
    Ready,
    /// Capture thread armed, no frame read out yet in this run.
    Exposure,
    /// At least one frame read out in this run.
    Readout,
    /// Inter-frame dead time; not reported by the device.
    Latency,
    /// Unrecoverable device error; cleared only by a forced write (reset).
    Fault
}

/// Current status with the sticky-fault rule applied on every write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusCell(Status);

impl StatusCell {
    pub fn new() -> StatusCell { StatusCell(Status::Ready) }

    pub fn get(&self) -> Status { self.0 }

    /// Returns `false` (and keeps the old value) if the current status is `Fault` and `force` is not set.
    pub fn set(&mut self, status: Status, force: bool) -> bool {
        if self.0 == Status::Fault && !force {
            if status != Status::Fault {
                log::debug!("ignoring status change {} -> {}", self.0, status);
            }
            return false;
        }

        if self.0 != status {
            log::debug!("status {} -> {}", self.0, status);
        }
        self.0 = status;

        true
    }
}

impl Default for StatusCell {
    fn default() -> StatusCell { StatusCell::new() }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum AcqStatus {
    AcqReady,
    AcqRunning,
    AcqFault
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum DetStatus {
    DetIdle,
    DetExposure,
    DetReadout,
    DetLatency,
    DetFault
}

impl DetStatus {
    pub fn bit(&self) -> u32 {
        match self {
            DetStatus::DetIdle => 0,
            DetStatus::DetFault => 1 << 0,
            DetStatus::DetExposure => 1 << 2,
            DetStatus::DetReadout => 1 << 3,
            DetStatus::DetLatency => 1 << 4
        }
    }
}

/// Status in the vocabulary of a generic hardware interface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HwStatus {
    pub acq: AcqStatus,
    pub det: DetStatus,
    /// Detector states this camera is able to report.
    pub det_mask: u32
}

impl From<Status> for HwStatus {
    fn from(status: Status) -> HwStatus {
        let (acq, det) = match status {
            Status::Ready => (AcqStatus::AcqReady, DetStatus::DetIdle),
            Status::Exposure => (AcqStatus::AcqRunning, DetStatus::DetExposure),
            Status::Readout => (AcqStatus::AcqRunning, DetStatus::DetReadout),
            Status::Latency => (AcqStatus::AcqRunning, DetStatus::DetLatency),
            Status::Fault => (AcqStatus::AcqFault, DetStatus::DetFault)
        };

        HwStatus{
            acq,
            det,
            det_mask: DetStatus::DetExposure.bit() | DetStatus::DetReadout.bit() | DetStatus::DetLatency.bit()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn given_fault_non_forced_set_is_ignored() {
        let mut status = StatusCell::new();
        assert!(status.set(Status::Fault, false));

        for s in Status::iter() {
            status.set(s, false);
            assert_eq!(Status::Fault, status.get());
        }
    }

    #[test]
    fn given_fault_forced_set_clears_it() {
        let mut status = StatusCell::new();
        status.set(Status::Fault, false);
        assert!(status.set(Status::Ready, true));
        assert_eq!(Status::Ready, status.get());
    }

    #[test]
    fn given_non_fault_status_transitions_are_free() {
        let mut status = StatusCell::new();
        assert!(status.set(Status::Exposure, false));
        assert!(status.set(Status::Readout, false));
        assert!(status.set(Status::Ready, false));
        assert_eq!(Status::Ready, status.get());
    }

    #[test]
    fn given_status_hw_status_is_mapped() {
        assert_eq!(AcqStatus::AcqReady, HwStatus::from(Status::Ready).acq);
        assert_eq!(DetStatus::DetReadout, HwStatus::from(Status::Readout).det);
        assert_eq!(AcqStatus::AcqRunning, HwStatus::from(Status::Latency).acq);
        let fault = HwStatus::from(Status::Fault);
        assert_eq!((AcqStatus::AcqFault, DetStatus::DetFault), (fault.acq, fault.det));
        assert_eq!(0, fault.det_mask & DetStatus::DetFault.bit());
    }
}
