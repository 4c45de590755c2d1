//
// pgcam - Point Grey camera acquisition engine
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Frame buffer management.
//!

use crate::camera::{ImageType, PixelFormat, Size};
use chrono::{DateTime, Utc};
use crossbeam::channel;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Geometry of the frames being produced.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameDim {
    pub size: Size,
    pub pixel_format: PixelFormat
}

impl FrameDim {
    pub fn new(size: Size, pixel_format: PixelFormat) -> FrameDim {
        FrameDim{ size, pixel_format }
    }

    pub fn bytes(&self) -> usize {
        self.size.num_pixels() * self.pixel_format.bytes_per_pixel()
    }

    pub fn image_type(&self) -> ImageType { self.pixel_format.image_type() }
}

impl Default for FrameDim {
    fn default() -> FrameDim { FrameDim::new(Size::default(), PixelFormat::Mono8) }
}

/// Metadata published with every acquired frame.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FrameInfo {
    /// 0-based index within the current acquisition.
    pub acq_frame_nb: u64,
    pub frame_dim: FrameDim,
    /// Number of bytes of the slot filled with pixel data.
    pub valid_bytes: usize,
    pub time_since_start: Duration
}

/// Writable frame slot; exclusive until dropped.
pub type FrameSlot<'a> = Box<dyn DerefMut<Target = [u8]> + 'a>;

/// Consumer of acquired frames.
pub trait BufferManager: Send + Sync {
    fn frame_dim(&self) -> FrameDim;

    fn set_frame_dim(&self, frame_dim: FrameDim);

    /// Returns the slot for `frame_nb`, sized to `frame_dim().bytes()`.
    fn frame_buffer(&self, frame_nb: u64) -> FrameSlot<'_>;

    /// Returns `false` if no more frames will be accepted.
    fn new_frame_ready(&self, info: &FrameInfo) -> bool;

    fn set_start_timestamp(&self, timestamp: DateTime<Utc>);

    fn start_timestamp(&self) -> Option<DateTime<Utc>>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Slot {
    frame_nb: Option<u64>,
    pixels: Vec<u8>
}

struct SlotGuard<'a>(MutexGuard<'a, Slot>);

impl Deref for SlotGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] { &self.0.pixels }
}

impl DerefMut for SlotGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] { &mut self.0.pixels }
}

/// In-memory ring of frame slots; frame infos are forwarded to subscribers.
///
/// A subscriber whose channel is full makes `new_frame_ready` return `false`,
/// which stops the acquisition.
pub struct SoftBufferManager {
    frame_dim: Mutex<FrameDim>,
    slots: Vec<Mutex<Slot>>,
    start: Mutex<Option<DateTime<Utc>>>,
    last_frame_info: Mutex<Option<FrameInfo>>,
    frames_ready: AtomicU64,
    subscribers: Mutex<Vec<channel::Sender<FrameInfo>>>
}

impl SoftBufferManager {
    pub fn new(num_slots: usize) -> SoftBufferManager {
        SoftBufferManager{
            frame_dim: Mutex::new(FrameDim::default()),
            slots: (0..num_slots.max(1)).map(|_| Mutex::new(Slot{ frame_nb: None, pixels: vec![] })).collect(),
            start: Mutex::new(None),
            last_frame_info: Mutex::new(None),
            frames_ready: AtomicU64::new(0),
            subscribers: Mutex::new(vec![])
        }
    }

    pub fn num_slots(&self) -> usize { self.slots.len() }

    /// Returns a receiver of frame infos; `capacity` is the number of frames the consumer may lag behind.
    pub fn subscribe(&self, capacity: usize) -> channel::Receiver<FrameInfo> {
        let (sender, receiver) = channel::bounded(capacity);
        lock(&self.subscribers).push(sender);
        receiver
    }

    /// Returns a copy of the frame's pixels if its slot has not been reused yet.
    pub fn copy_frame(&self, frame_nb: u64) -> Option<Vec<u8>> {
        let slot = lock(&self.slots[self.slot_index(frame_nb)]);
        if slot.frame_nb == Some(frame_nb) { Some(slot.pixels.clone()) } else { None }
    }

    /// Number of frames published since creation.
    pub fn frames_ready(&self) -> u64 { self.frames_ready.load(Ordering::SeqCst) }

    pub fn last_frame_info(&self) -> Option<FrameInfo> { *lock(&self.last_frame_info) }

    fn slot_index(&self, frame_nb: u64) -> usize {
        (frame_nb % self.slots.len() as u64) as usize
    }
}

impl BufferManager for SoftBufferManager {
    fn frame_dim(&self) -> FrameDim { *lock(&self.frame_dim) }

    fn set_frame_dim(&self, frame_dim: FrameDim) {
        let mut current = lock(&self.frame_dim);
        if *current != frame_dim {
            log::debug!("frame buffers: {} {} x {}", frame_dim.size, frame_dim.pixel_format, self.slots.len());
            *current = frame_dim;
            for slot in &self.slots {
                lock(slot).frame_nb = None;
            }
        }
    }

    fn frame_buffer(&self, frame_nb: u64) -> FrameSlot<'_> {
        let bytes = self.frame_dim().bytes();
        let mut slot = lock(&self.slots[self.slot_index(frame_nb)]);
        if slot.pixels.len() != bytes {
            slot.pixels.resize(bytes, 0);
        }
        slot.frame_nb = Some(frame_nb);

        Box::new(SlotGuard(slot))
    }

    fn new_frame_ready(&self, info: &FrameInfo) -> bool {
        *lock(&self.last_frame_info) = Some(*info);
        self.frames_ready.fetch_add(1, Ordering::SeqCst);

        let mut accepted = true;
        lock(&self.subscribers).retain(|sender| match sender.try_send(*info) {
            Ok(()) => true,
            Err(channel::TrySendError::Full(_)) => {
                log::warn!("frame consumer not keeping up (frame {})", info.acq_frame_nb);
                accepted = false;
                true
            },
            Err(channel::TrySendError::Disconnected(_)) => false
        });

        accepted
    }

    fn set_start_timestamp(&self, timestamp: DateTime<Utc>) {
        *lock(&self.start) = Some(timestamp);
    }

    fn start_timestamp(&self) -> Option<DateTime<Utc>> { *lock(&self.start) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(acq_frame_nb: u64, frame_dim: FrameDim) -> FrameInfo {
        FrameInfo{ acq_frame_nb, frame_dim, valid_bytes: frame_dim.bytes(), time_since_start: Duration::from_millis(0) }
    }

    #[test]
    fn given_frame_dim_slots_are_sized_to_it() {
        let buffers = SoftBufferManager::new(2);
        buffers.set_frame_dim(FrameDim::new(Size::new(4, 2), PixelFormat::Mono16));
        assert_eq!(16, buffers.frame_buffer(0).len());

        buffers.set_frame_dim(FrameDim::new(Size::new(4, 2), PixelFormat::Mono8));
        assert_eq!(8, buffers.frame_buffer(0).len());
    }

    #[test]
    fn given_more_frames_than_slots_oldest_is_overwritten() {
        let buffers = SoftBufferManager::new(2);
        buffers.set_frame_dim(FrameDim::new(Size::new(2, 1), PixelFormat::Mono8));
        for frame_nb in 0..3u64 {
            buffers.frame_buffer(frame_nb).copy_from_slice(&[frame_nb as u8; 2]);
        }

        assert_eq!(None, buffers.copy_frame(0));
        assert_eq!(Some(vec![1, 1]), buffers.copy_frame(1));
        assert_eq!(Some(vec![2, 2]), buffers.copy_frame(2));
    }

    #[test]
    fn given_full_subscriber_channel_frame_is_not_accepted() {
        let buffers = SoftBufferManager::new(4);
        let dim = FrameDim::new(Size::new(2, 2), PixelFormat::Mono8);
        let receiver = buffers.subscribe(1);

        assert!(buffers.new_frame_ready(&info(0, dim)));
        assert!(!buffers.new_frame_ready(&info(1, dim)));
        assert_eq!(0, receiver.recv().unwrap().acq_frame_nb);
        assert!(buffers.new_frame_ready(&info(2, dim)));
        assert_eq!(3, buffers.frames_ready());
        assert_eq!(Some(2), buffers.last_frame_info().map(|i| i.acq_frame_nb));
    }

    #[test]
    fn given_dropped_subscriber_frames_are_still_accepted() {
        let buffers = SoftBufferManager::new(4);
        let dim = FrameDim::new(Size::new(2, 2), PixelFormat::Mono8);
        drop(buffers.subscribe(1));

        assert!(buffers.new_frame_ready(&info(0, dim)));
        assert!(buffers.new_frame_ready(&info(1, dim)));
    }

    #[test]
    fn given_start_timestamp_it_is_kept() {
        let buffers = SoftBufferManager::new(1);
        assert!(buffers.start_timestamp().is_none());
        let now = Utc::now();
        buffers.set_start_timestamp(now);
        assert_eq!(Some(now), buffers.start_timestamp());
    }
}
