//
// pgcam - Point Grey camera acquisition engine
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Capture thread.
//!

use crate::buffer::FrameInfo;
use crate::camera::{RawFrame, RetrieveError, Status};
use crate::camera::session::Shared;
use std::sync::Arc;

/// Body of the persistent capture thread of a camera.
///
/// Sleeps until the acquisition is armed, then drains frames into the buffer manager until
/// the frame target is reached, the buffer manager refuses further frames, a fatal device
/// error occurs or the acquisition is stopped. Exits when quit is requested.
pub fn capture_thread(shared: Arc<Shared>) {
    log::info!("capture thread started");

    // reused for every retrieval; the device resizes it as needed
    let mut frame = RawFrame::default();

    let mut acq = shared.lock();
    loop {
        while !acq.armed && !acq.quit {
            acq = shared.wait(acq);
        }
        if acq.quit { break; }

        acq.thread_running = true;
        acq.status.set(Status::Exposure, false);
        drop(acq);

        run_acquisition(&shared, &mut frame);

        // errors are already reflected in the status
        let _ = shared.stop_acq(true);

        acq = shared.lock();
        acq.thread_running = false;
        shared.notify();
    }

    log::info!("capture thread finished");
}

fn run_acquisition(shared: &Shared, frame: &mut RawFrame) {
    let mut num_missed: u64 = 0;

    loop {
        {
            let acq = shared.lock();
            if !acq.armed || acq.quit { break; }
            if acq.nb_frames != 0 && acq.image_number >= acq.nb_frames { break; }
        }

        match shared.device.retrieve_frame(shared.grab_timeout, frame) {
            Ok(()) => {
                let (frame_nb, frame_dim, t_start) = {
                    let mut acq = shared.lock();
                    // stopped while retrieving; the frame does not count
                    if !acq.armed { break; }
                    acq.status.set(Status::Readout, false);
                    (acq.image_number, acq.frame_dim, acq.t_start)
                };

                let valid_bytes = {
                    let mut slot = shared.buffer.frame_buffer(frame_nb);
                    let len = frame.pixels.len().min(slot.len());
                    slot[..len].copy_from_slice(&frame.pixels[..len]);
                    len
                };
                if valid_bytes < frame_dim.bytes() {
                    log::warn!("frame {}: received {} of {} bytes", frame_nb, valid_bytes, frame_dim.bytes());
                }

                let info = FrameInfo{ acq_frame_nb: frame_nb, frame_dim, valid_bytes, time_since_start: t_start.elapsed() };
                let accepted = shared.buffer.new_frame_ready(&info);
                shared.lock().image_number += 1;

                if !accepted {
                    log::info!("buffer manager accepts no more frames; stopping after frame {}", frame_nb);
                    break;
                }
            },

            Err(RetrieveError::Transient) => {
                num_missed += 1;
                log::debug!("no image available ({} missed so far)", num_missed);
            },

            Err(RetrieveError::Fatal(error)) => {
                log::error!("failed to retrieve frame: {}", error);
                shared.set_status(Status::Fault, false);
                break;
            }
        }
    }
}
