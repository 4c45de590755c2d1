//
// pgcam - Point Grey camera acquisition engine
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Acquisition engine for Point Grey (FLIR) machine-vision cameras.
//!

pub mod buffer;
pub mod camera;
pub mod config;
pub mod interface;
pub mod workers;

pub use buffer::{BufferManager, FrameDim, FrameInfo, SoftBufferManager};
pub use camera::{Camera, CameraError, CameraSettings, HwStatus, Status};
pub use interface::Interface;
