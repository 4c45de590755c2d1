//
// pgcam - Point Grey camera acquisition engine
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Entry point of the `pgcam` executable.
//!

mod args;

use pgcam::buffer::{BufferManager, SoftBufferManager};
use pgcam::camera::{drivers, Camera, CameraError, Status};
use pgcam::config::Configuration;
use pgcam::interface::Interface;
use std::sync::Arc;
use std::time::Duration;

pub const VERSION_STRING: &'static str = include_str!(concat!(env!("OUT_DIR"), "/version"));

/// Frames the consumer may lag behind before the acquisition is stopped.
const CONSUMER_CAPACITY: usize = 64;

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(20);

fn set_up_logging() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        log::error!("{}\n\n{}", info, backtrace);
    }));

    let tz_offset = chrono::Local::now().offset().clone();

    let logfile = dirs::data_dir().unwrap_or(std::path::Path::new("").to_path_buf()).join(
        format!("pgcam_{}.log", chrono::Local::now().format("%Y-%m-%d_%H%M%S"))
    );

    println!("Logging to: {}", logfile.to_string_lossy());

    let mut config = simplelog::ConfigBuilder::new();
    config
        .set_target_level(simplelog::LevelFilter::Error)
        .set_time_format_custom(simplelog::format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]"
        ));
    if let Ok(offset) = time::UtcOffset::from_whole_seconds(tz_offset.local_minus_utc()) {
        config.set_time_offset(offset);
    }

    let file = match std::fs::File::create(&logfile) {
        Ok(file) => file,
        Err(e) => { eprintln!("Failed to create log file: {}.", e); return; }
    };

    if let Err(e) = simplelog::WriteLogger::init(simplelog::LevelFilter::Info, config.build(), file) {
        eprintln!("Failed to initialize logging: {}.", e);
    }
}

fn main() {
    let args = match args::parse_command_line(std::env::args()) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            std::process::exit(2);
        }
    };

    if args.logging { set_up_logging(); }

    log::info!("pgcam ver. {} on {} started", VERSION_STRING, os_info::get());

    let config = match &args.config {
        Some(path) => match Configuration::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                println!("Failed to load configuration from {}: {}.", path.to_string_lossy(), e);
                return;
            }
        },
        None => Configuration::new()
    };

    if let Err(e) = run(&args, &config) {
        log::error!("acquisition failed: {}", e);
        println!("Acquisition failed: {}.", e);
        std::process::exit(1);
    }
}

fn run(args: &args::Args, config: &Configuration) -> Result<(), CameraError> {
    let device = drivers::open_device(config)?;
    let buffer = Arc::new(SoftBufferManager::new(config.buffer_frames()));
    let frames = buffer.subscribe(CONSUMER_CAPACITY);

    let camera = Arc::new(Camera::open(
        device,
        Arc::clone(&buffer) as Arc<dyn BufferManager>,
        config.camera_settings()
    )?);
    let interface = Interface::new(Arc::clone(&camera), Arc::clone(&buffer) as Arc<dyn BufferManager>);

    let info = interface.det_info();
    println!(
        "Camera: {} {}, sensor {}, image type {}.",
        info.detector_type(), info.detector_model(), info.max_image_size(), info.cur_image_type()
    );

    if let Some(exp_time) = args.exposure.or(config.exposure()) {
        interface.sync().set_exp_time(exp_time)?;
    }
    if let Some(lat_time) = config.latency() {
        interface.sync().set_lat_time(lat_time)?;
    }

    let mut received = 0;
    match args.live {
        Some(duration) => {
            interface.video().set_live(true)?;
            let deadline = std::time::Instant::now() + duration;
            while std::time::Instant::now() < deadline {
                if frames.recv_timeout(STATUS_POLL_INTERVAL).is_ok() { received += 1; }
            }
            interface.video().set_live(false)?;
        },

        None => {
            interface.sync().set_nb_frames(args.nb_frames.unwrap_or(config.nb_frames()))?;
            interface.prepare_acq()?;
            interface.start_acq()?;
            loop {
                match frames.recv_timeout(STATUS_POLL_INTERVAL) {
                    Ok(_) => received += 1,
                    Err(_) => if matches!(camera.status(), Status::Ready | Status::Fault) { break; }
                }
            }
            interface.stop_acq()?;
        }
    }
    received += frames.try_iter().count();

    let status = interface.status();
    println!(
        "Acquired {} frame(s), received {}; status: {} / {}.",
        interface.nb_hw_acquired_frames(), received, status.acq, status.det
    );
    log::info!("acquired {} frame(s), final status {}", interface.nb_hw_acquired_frames(), camera.status());

    camera.close()
}
