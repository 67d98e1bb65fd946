//! Error taxonomy for the compositing core
//!
//! Three classes of failure are kept apart:
//!
//! - [`ProtocolError`]: a client broke the protocol. Fatal to that client's
//!   connection only; the transport turns it into a disconnect.
//! - [`AllocError`]: buffer import or allocation failed. Recoverable where an
//!   alternate path exists, otherwise converted to a [`ProtocolError`].
//! - [`InternalError`]: an invariant inside the core was broken. These are
//!   programming errors and are always logged at `error!` level.

use thiserror::Error;
use wayland_server::protocol::wl_shm;

use crate::buffer::{BufferId, PixelFormat};
use crate::surface::SurfaceId;

/// Reason codes attached to a client fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCode {
    /// Stride smaller than width × bytes-per-pixel
    InvalidStride,
    /// Pixel format not supported by any import path
    InvalidFormat,
    /// Buffer storage does not cover the declared geometry
    InvalidFd,
    /// Buffer scale below 1
    InvalidScale,
    /// Surface already carries a role
    RoleAlreadyBound,
    /// Subsurface parent/child relation is invalid
    BadSurface,
    /// Hardware import failed with no fallback
    ImportFailed,
}

impl FaultCode {
    /// Wire-level error code for this fault
    ///
    /// Buffer faults use the `wl_shm` error enum; the remaining codes are the
    /// ones the role and subsurface interfaces declare first.
    pub fn code(&self) -> u32 {
        match self {
            FaultCode::InvalidStride => u32::from(wl_shm::Error::InvalidStride),
            FaultCode::InvalidFormat => u32::from(wl_shm::Error::InvalidFormat),
            FaultCode::InvalidFd => u32::from(wl_shm::Error::InvalidFd),
            FaultCode::InvalidScale => 0,
            FaultCode::RoleAlreadyBound => 0,
            FaultCode::BadSurface => 0,
            FaultCode::ImportFailed => 2,
        }
    }
}

/// A protocol violation attributable to one client connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("client fault ({code:?}): {message}")]
pub struct ProtocolError {
    pub code: FaultCode,
    pub message: String,
}

impl ProtocolError {
    pub fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Failures inside the buffer import pipeline
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),

    #[error("unsupported format code {0:#x}")]
    UnknownFormatCode(u32),

    #[error("stride {stride} is less than width × bytes per pixel ({minimum}); was the stride given in pixels?")]
    InvalidStride { stride: i32, minimum: u64 },

    #[error("buffer import failed: {0}")]
    ImportFailure(String),

    #[error("buffer of {needed} bytes does not fit in storage of {available} bytes")]
    OutOfBounds { needed: usize, available: usize },

    #[error("no render context could be made current: {0}")]
    NoRenderContext(String),
}

impl AllocError {
    /// Converts an allocator failure into the fault reported to the client
    pub fn into_client_fault(self) -> ProtocolError {
        let code = match &self {
            AllocError::UnsupportedFormat(_) | AllocError::UnknownFormatCode(_) => {
                FaultCode::InvalidFormat
            }
            AllocError::InvalidStride { .. } => FaultCode::InvalidStride,
            AllocError::OutOfBounds { .. } => FaultCode::InvalidFd,
            AllocError::ImportFailure(_) | AllocError::NoRenderContext(_) => {
                FaultCode::ImportFailed
            }
        };
        ProtocolError::new(code, self.to_string())
    }
}

/// Broken invariants inside the core; never caused by client input alone
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InternalError {
    #[error("buffer {0:?} released but it is not out for presentation")]
    NotInFlight(BufferId),

    #[error("buffer {0:?} released twice")]
    DoubleRelease(BufferId),

    #[error("buffer {0:?} submitted while already in the stream")]
    AlreadyQueued(BufferId),

    #[error("surface {0:?} is not registered")]
    UnknownSurface(SurfaceId),

    #[error("surface tree corrupted: {0}")]
    TreeCorrupted(String),
}

/// Outcome of a failed commit
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    #[error(transparent)]
    Client(#[from] ProtocolError),

    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl CommitError {
    pub fn is_client_fault(&self) -> bool {
        matches!(self, CommitError::Client(_))
    }
}

/// Errors reported by platform collaborators (GPU device, render context, sink)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("render context unavailable: {0}")]
    ContextUnavailable(String),

    #[error("GPU image creation failed: {0}")]
    ImageCreation(String),

    #[error("operation unsupported by platform: {0}")]
    Unsupported(String),

    #[error("presentation failed: {0}")]
    Presentation(String),
}

/// Failure of one presentation tick
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresentationError {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Internal(#[from] InternalError),
}
