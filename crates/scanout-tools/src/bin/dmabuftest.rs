// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Stream camera frames onto an overlay plane without copying them.
//!
//! Capture buffers are allocated as dma-bufs, imported by the camera and
//! scanned out directly by the display controller.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use scanout::{CapturePipeline, CaptureSpec, Error, LoopbackProducer, Producer, Result, V4l2Capture};
use scanout_tools::{list_outputs, DisplayArgs};

#[derive(Parser, Debug)]
#[command(name = "dmabuftest", version, about)]
struct Args {
    #[command(flatten)]
    display: DisplayArgs,

    /// Capture geometry and format, e.g. 640x480@YUYV.
    #[arg(short, long, value_name = "WxH@FOURCC", required_unless_present = "list")]
    capture: Option<CaptureSpec>,

    /// V4L2 capture device.
    #[arg(short, long, default_value = "/dev/video0")]
    device: PathBuf,

    /// Complete buffers in software instead of opening a camera.
    #[arg(long)]
    loopback: bool,

    /// Frames to display before exiting.
    #[arg(long, default_value_t = 500)]
    frames: u64,
}

fn producer(args: &Args, spec: CaptureSpec) -> Result<Box<dyn Producer>> {
    if args.loopback {
        info!("using loopback producer for {spec}");
        let bytes_used = spec
            .format
            .planes()
            .iter()
            .map(|p| {
                let (w, h) = p.dimensions(spec.width, spec.height);
                w * h * p.bpp / 8
            })
            .sum();
        return Ok(Box::new(
            LoopbackProducer::new(bytes_used).with_max_planes(spec.format.plane_count()),
        ));
    }
    Ok(Box::new(V4l2Capture::open(&args.device, spec)?))
}

fn run(args: &Args) -> Result<()> {
    if args.display.list {
        return list_outputs(&args.display.open_backend()?);
    }
    let Some(spec) = args.capture else {
        return Err(Error::InvalidArgument("--capture is required".into()));
    };

    let display = args.display.open_display()?;
    let allocator = args.display.allocator(&display)?;
    let config = args
        .display
        .pipeline_config(spec.format, spec.width, spec.height);
    let producer = producer(args, spec)?;

    let mut capture = CapturePipeline::new(display, allocator.as_ref(), producer, &config)?;
    let result = capture.run(args.frames);
    capture.shutdown()?;
    result
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
