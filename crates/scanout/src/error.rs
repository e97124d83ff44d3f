// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;

/// Errors raised by the buffer pool, display pipeline and producer bridge.
#[derive(Error, Debug)]
pub enum Error {
    /// A system call or ioctl failed.
    #[error("{component}: {operation} failed: {source}")]
    Os {
        component: &'static str,
        operation: &'static str,
        #[source]
        source: Errno,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Backing memory or display registration failed for one buffer of a
    /// pool. Everything allocated before it has already been released.
    #[error("allocation of buffer {index} failed: {source}")]
    Allocation {
        index: usize,
        #[source]
        source: Box<Error>,
    },

    /// One or more outputs failed to take the requested buffer.
    #[error("presentation failed on {} output(s): {}", failures.len(), FailureList(failures))]
    Presentation { failures: Vec<OutputFailure> },

    #[error("timed out after {waited:?} waiting for {outstanding} page flip(s)")]
    Timeout { waited: Duration, outstanding: u64 },

    /// The producer and the bridge disagree about buffer identity or
    /// registration.
    #[error("producer protocol error: {0}")]
    Protocol(String),

    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Builds a mapper for `map_err` that tags an errno with its origin.
    pub(crate) fn os(component: &'static str, operation: &'static str) -> impl FnOnce(Errno) -> Self {
        move |source| Error::Os {
            component,
            operation,
            source,
        }
    }

    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| Error::Io { context, source }
    }

    /// Soft errors leave the pipeline usable: the caller may skip a frame or
    /// an output and carry on.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Error::Presentation { .. } | Error::Timeout { .. } | Error::Protocol(_)
        )
    }

    /// The underlying errno, if this error came from the OS.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Os { source, .. } => Some(*source),
            Error::Io { source, .. } => source.raw_os_error().map(Errno::from_raw),
            Error::Allocation { source, .. } => source.errno(),
            _ => None,
        }
    }
}

/// A single output that could not be updated during a present call.
#[derive(Debug)]
pub struct OutputFailure {
    pub connector: u32,
    pub crtc: u32,
    pub error: Error,
}

impl fmt::Display for OutputFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connector {} (crtc {}): {}",
            self.connector, self.crtc, self.error
        )
    }
}

struct FailureList<'a>(&'a [OutputFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_classification() {
        assert!(Error::Timeout {
            waited: Duration::from_secs(3),
            outstanding: 1
        }
        .is_soft());
        assert!(Error::Protocol("mismatch".into()).is_soft());
        assert!(Error::Presentation { failures: vec![] }.is_soft());
        assert!(!Error::InvalidState("x".into()).is_soft());
        assert!(!Error::Allocation {
            index: 0,
            source: Box::new(Error::Unsupported("x".into()))
        }
        .is_soft());
    }

    #[test]
    fn test_presentation_message_lists_outputs() {
        let err = Error::Presentation {
            failures: vec![
                OutputFailure {
                    connector: 4,
                    crtc: 9,
                    error: Error::os("kms", "DRM_IOCTL_MODE_PAGE_FLIP")(Errno::EBUSY),
                },
                OutputFailure {
                    connector: 5,
                    crtc: 10,
                    error: Error::Unsupported("no overlay plane".into()),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 output(s)"), "{msg}");
        assert!(msg.contains("connector 4 (crtc 9)"), "{msg}");
        assert!(msg.contains("DRM_IOCTL_MODE_PAGE_FLIP"), "{msg}");
        assert!(msg.contains("connector 5 (crtc 10)"), "{msg}");
    }

    #[test]
    fn test_errno_passthrough() {
        let err = Error::Allocation {
            index: 2,
            source: Box::new(Error::os("dma-heap", "allocate")(Errno::ENOMEM)),
        };
        assert_eq!(err.errno(), Some(Errno::ENOMEM));
    }
}
