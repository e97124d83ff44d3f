// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Command-line plumbing shared by the `fliptest` and `dmabuftest` programs.

use std::time::Duration;

use clap::{Args, ValueEnum};
use log::info;
use scanout::display::connected_outputs;
use scanout::{
    Allocator, Backend, BackendKind, Display, DmaHeapAllocator, DumbAllocator, Error,
    HostAllocator, ModeSelection, PipelineConfig, PixelFormat, Result, Scanout, TilingMode,
};

/// Where buffer memory comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AllocatorKind {
    /// dma-heap if present, else DRM dumb buffers, else host memory.
    Auto,
    /// Contiguous or system dma-heap.
    Heap,
    /// DRM dumb buffers exported through PRIME.
    Dumb,
    /// Host memory, only importable by the headless backend.
    Host,
}

/// Display, memory and pacing options.
#[derive(Args, Debug, Clone)]
pub struct DisplayArgs {
    /// Set a mode: <connector>:<mode> or <connector>@<crtc>:<mode>.
    /// Repeat to drive several outputs side by side. Defaults to the first
    /// connected output in its preferred mode.
    #[arg(short = 's', long = "mode", value_name = "SELECTION")]
    pub modes: Vec<ModeSelection>,

    /// Display backend: kms, x11, gpu or headless. Probed when omitted.
    #[arg(short, long)]
    pub backend: Option<BackendKind>,

    /// Buffer memory source.
    #[arg(short, long, value_enum, default_value_t = AllocatorKind::Auto)]
    pub allocator: AllocatorKind,

    /// Target frame rate; 0 presents as fast as the display allows.
    #[arg(short, long, default_value_t = 0)]
    pub fps: u32,

    /// Number of buffers in the pool.
    #[arg(short = 'n', long, default_value_t = 3)]
    pub buffers: usize,

    /// Tiling hint: 8, 16, 32 or auto. Linear when omitted.
    #[arg(short, long, default_value_t = TilingMode::Linear)]
    pub tiling: TilingMode,

    /// Longest wait for page flips to complete, in milliseconds.
    #[arg(long, default_value_t = 3000)]
    pub flip_timeout_ms: u64,

    /// List connectors, modes and overlay planes, then exit.
    #[arg(long)]
    pub list: bool,
}

impl DisplayArgs {
    pub fn open_backend(&self) -> Result<Backend> {
        match self.backend {
            Some(kind) => Backend::open(kind),
            None => Backend::open_first(),
        }
    }

    /// Open the backend and resolve the requested outputs.
    pub fn open_display(&self) -> Result<Display<Backend>> {
        let backend = self.open_backend()?;
        let modes = if self.modes.is_empty() {
            let selection = connected_outputs(&backend)?
                .iter()
                .find_map(ModeSelection::preferred)
                .ok_or_else(|| Error::InvalidState("no connected output".into()))?;
            info!("no mode requested, using {selection}");
            vec![selection]
        } else {
            self.modes.clone()
        };
        let display = Display::open(backend, &modes)?;
        if display.outputs().is_empty() {
            return Err(Error::InvalidArgument("none of the requested outputs is usable".into()));
        }
        Ok(display)
    }

    pub fn allocator(&self, display: &Display<Backend>) -> Result<Box<dyn Allocator>> {
        let device = display.backend().drm_device();
        let headless = display.backend().kind() == BackendKind::Headless;
        match self.allocator {
            AllocatorKind::Heap => Ok(Box::new(DmaHeapAllocator::new()?)),
            AllocatorKind::Dumb => device
                .map(|device| Box::new(DumbAllocator::new(device)) as Box<dyn Allocator>)
                .ok_or_else(|| Error::Unsupported("dumb buffers need a KMS backend".into())),
            AllocatorKind::Host => Ok(Box::new(HostAllocator::new())),
            AllocatorKind::Auto if headless => Ok(Box::new(HostAllocator::new())),
            AllocatorKind::Auto => match (DmaHeapAllocator::new(), device) {
                (Ok(heap), _) => Ok(Box::new(heap)),
                (Err(e), Some(device)) => {
                    info!("dma-heap unavailable ({e}), using dumb buffers");
                    Ok(Box::new(DumbAllocator::new(device)))
                }
                (Err(e), None) => Err(e),
            },
        }
    }

    /// Pipeline settings for `format` at the given geometry; zero takes the
    /// display geometry.
    pub fn pipeline_config(&self, format: PixelFormat, width: u32, height: u32) -> PipelineConfig {
        PipelineConfig {
            fps: self.fps,
            buffer_count: self.buffers,
            format,
            width,
            height,
            modes: self.modes.clone(),
            tiling: self.tiling,
            flip_timeout: Duration::from_millis(self.flip_timeout_ms),
        }
    }
}

/// Print every connector with its modes, then the overlay planes.
pub fn list_outputs<S: Scanout + ?Sized>(scanout: &S) -> Result<()> {
    let crtcs = scanout.crtcs()?;
    println!("{}: crtcs {crtcs:?}", scanout.name());
    for id in scanout.connectors()? {
        let connector = scanout.connector(id)?;
        let state = if connector.connected { "connected" } else { "disconnected" };
        match connector.crtc {
            Some(crtc) => println!("connector {id}: {state}, crtc {crtc}"),
            None => println!("connector {id}: {state}"),
        }
        for mode in &connector.modes {
            println!("  {mode}");
        }
    }
    for plane in scanout.overlay_planes()? {
        println!("plane {}: crtc mask {:#b}", plane.id, plane.possible_crtcs);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        display: DisplayArgs,
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["test"]).unwrap();
        assert!(cli.display.modes.is_empty());
        assert_eq!(cli.display.backend, None);
        assert_eq!(cli.display.allocator, AllocatorKind::Auto);
        assert_eq!(cli.display.buffers, 3);
        assert_eq!(cli.display.tiling, TilingMode::Linear);

        let config = cli.display.pipeline_config(PixelFormat::Xrgb8888, 0, 0);
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_repeated_modes_and_tiling() {
        let cli = Cli::try_parse_from([
            "test", "-s", "32:1920x1080", "-s", "40@12:1280x720", "-t", "auto", "-f", "30",
            "--backend", "headless",
        ])
        .unwrap();
        let modes: Vec<String> = cli.display.modes.iter().map(|m| m.to_string()).collect();
        assert_eq!(modes, ["32:1920x1080", "40@12:1280x720"]);
        assert_eq!(cli.display.tiling, TilingMode::Auto);
        assert_eq!(cli.display.fps, 30);
        assert_eq!(cli.display.backend, Some(BackendKind::Headless));
    }

    #[test]
    fn test_rejects_bad_selection() {
        assert!(Cli::try_parse_from(["test", "-s", "hdmi"]).is_err());
    }

    #[test]
    fn test_headless_display_uses_preferred_mode() {
        let cli = Cli::try_parse_from(["test", "--backend", "headless"]).unwrap();
        let display = cli.display.open_display().unwrap();
        assert_eq!((display.width(), display.height()), (1280, 720));
        let allocator = cli.display.allocator(&display).unwrap();
        assert_eq!(allocator.name(), HostAllocator::new().name());
    }
}
