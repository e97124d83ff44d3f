// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Page-flip a moving test pattern across one or more outputs.

use std::process::ExitCode;

use clap::Parser;
use log::error;
use scanout::{FlipLoop, PixelFormat, Result};
use scanout_tools::{list_outputs, DisplayArgs};

#[derive(Parser, Debug)]
#[command(name = "fliptest", version, about)]
struct Args {
    #[command(flatten)]
    display: DisplayArgs,

    /// Frames to present before exiting.
    #[arg(long, default_value_t = 500)]
    frames: u32,

    /// Primary buffer format.
    #[arg(long, default_value_t = PixelFormat::Xrgb8888)]
    format: PixelFormat,
}

fn run(args: &Args) -> Result<()> {
    if args.display.list {
        return list_outputs(&args.display.open_backend()?);
    }

    let display = args.display.open_display()?;
    let allocator = args.display.allocator(&display)?;
    let config = args.display.pipeline_config(args.format, 0, 0);

    let mut flip = FlipLoop::new(display, allocator.as_ref(), &config)?;
    let result = flip.run(args.frames);
    flip.shutdown()?;
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
