// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Pipeline configuration values.
//!
//! Everything here parses from the strings a command line hands over, so the
//! types double as `clap` value parsers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use crate::alloc::TilingMode;
use crate::display::{Connector, DEFAULT_FLIP_TIMEOUT};
use crate::error::{Error, Result};
use crate::format::PixelFormat;

/// Per-output mode selection: `<connector>:<mode>` or
/// `<connector>@<crtc>:<mode>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeSelection {
    pub connector: u32,
    pub crtc: Option<u32>,
    pub mode: String,
}

impl ModeSelection {
    /// The connector's first advertised mode, which drivers list as the
    /// preferred one.
    pub fn preferred(connector: &Connector) -> Option<Self> {
        connector.modes.first().map(|mode| Self {
            connector: connector.id,
            crtc: None,
            mode: mode.name.clone(),
        })
    }
}

impl FromStr for ModeSelection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            Error::InvalidArgument(format!(
                "invalid mode selection '{s}', expected <connector>[@<crtc>]:<mode>"
            ))
        };
        let (output, mode) = s.split_once(':').ok_or_else(invalid)?;
        if mode.is_empty() {
            return Err(invalid());
        }
        let (connector, crtc) = match output.split_once('@') {
            Some((connector, crtc)) => (connector, Some(crtc.parse().map_err(|_| invalid())?)),
            None => (output, None),
        };
        Ok(Self {
            connector: connector.parse().map_err(|_| invalid())?,
            crtc,
            mode: mode.to_string(),
        })
    }
}

impl fmt::Display for ModeSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.crtc {
            Some(crtc) => write!(f, "{}@{}:{}", self.connector, crtc, self.mode),
            None => write!(f, "{}:{}", self.connector, self.mode),
        }
    }
}

/// Capture geometry and format: `WxH@FOURCC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSpec {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl FromStr for CaptureSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            Error::InvalidArgument(format!("invalid capture spec '{s}', expected WxH@FOURCC"))
        };
        let (size, fourcc) = s.split_once('@').ok_or_else(invalid)?;
        let (width, height) = size.split_once('x').ok_or_else(invalid)?;
        let spec = Self {
            width: width.parse().map_err(|_| invalid())?,
            height: height.parse().map_err(|_| invalid())?,
            format: fourcc.parse()?,
        };
        spec.format.validate(spec.width, spec.height)?;
        Ok(spec)
    }
}

impl fmt::Display for CaptureSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.format)
    }
}

/// Everything needed to stand up a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Target presentation rate, 0 for ungoverned.
    pub fps: u32,
    pub buffer_count: usize,
    pub format: PixelFormat,
    /// Buffer geometry; 0 means "use the display geometry".
    pub width: u32,
    pub height: u32,
    pub modes: Vec<ModeSelection>,
    pub tiling: TilingMode,
    pub flip_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fps: 0,
            buffer_count: 3,
            format: PixelFormat::Xrgb8888,
            width: 0,
            height: 0,
            modes: Vec::new(),
            tiling: TilingMode::Linear,
            flip_timeout: DEFAULT_FLIP_TIMEOUT,
        }
    }
}

impl PipelineConfig {
    pub fn with_capture(mut self, capture: CaptureSpec) -> Self {
        self.width = capture.width;
        self.height = capture.height;
        self.format = capture.format;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_count == 0 {
            return Err(Error::InvalidArgument("buffer count must be at least 1".into()));
        }
        if self.flip_timeout.is_zero() {
            return Err(Error::InvalidArgument("flip timeout must be non-zero".into()));
        }
        if self.width != 0 || self.height != 0 {
            self.format.validate(self.width, self.height)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_selection_forms() {
        let sel: ModeSelection = "4:1920x1080".parse().unwrap();
        assert_eq!(sel.connector, 4);
        assert_eq!(sel.crtc, None);
        assert_eq!(sel.mode, "1920x1080");
        assert_eq!(sel.to_string(), "4:1920x1080");

        let sel: ModeSelection = "12@9:1280x720".parse().unwrap();
        assert_eq!(sel.connector, 12);
        assert_eq!(sel.crtc, Some(9));
        assert_eq!(sel.mode, "1280x720");
        assert_eq!(sel.to_string(), "12@9:1280x720");
    }

    #[test]
    fn test_mode_selection_rejects_garbage() {
        for bad in ["", "4", "4:", "x:1080p", "4@:720p", "@9:720p", "4@x:720p"] {
            assert!(bad.parse::<ModeSelection>().is_err(), "accepted '{bad}'");
        }
    }

    #[test]
    fn test_capture_spec() {
        let spec: CaptureSpec = "640x480@YUYV".parse().unwrap();
        assert_eq!(spec.width, 640);
        assert_eq!(spec.height, 480);
        assert_eq!(spec.format, PixelFormat::Yuyv);
        assert_eq!(spec.to_string(), "640x480@YUYV");

        assert!("640x480".parse::<CaptureSpec>().is_err());
        assert!("640@YUYV".parse::<CaptureSpec>().is_err());
        assert!("641x480@NV12".parse::<CaptureSpec>().is_err());
        assert!("640x480@ABCD".parse::<CaptureSpec>().is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.fps, 0);
        assert_eq!(config.buffer_count, 3);
        assert_eq!(config.flip_timeout, Duration::from_secs(3));
        assert!(config.validate().is_ok());

        let config = PipelineConfig {
            buffer_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_with_capture() {
        let config = PipelineConfig::default().with_capture("1280x720@NV12".parse().unwrap());
        assert_eq!((config.width, config.height), (1280, 720));
        assert_eq!(config.format, PixelFormat::Nv12);
        assert!(config.validate().is_ok());
    }
}
