// SPDX-License-Identifier: GPL-3.0-or-later

use std::io;

use smithay::reexports::drm::control::crtc;

/// How a failure should be treated by the layers above the kernel calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// A caller broke the flip/configuration protocol. This is a bug.
    ProtocolViolation,
    /// EACCES/EPERM, usually because a session switch revoked master.
    TransientPermission,
    /// The driver does not support the requested feature.
    HardwareUnsupported,
    /// Any other modesetting or framebuffer failure. Scanout state is undefined.
    DriverFailure,
    /// Waiting for kernel events failed for a reason other than an interrupt.
    EventLoopFailure,
}

#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    #[error("a page flip is already pending on crtc {crtc:?}")]
    FlipAlreadyPending { crtc: crtc::Handle },
    #[error("output {output} has no crtc")]
    NoCrtc { output: String },
    #[error("invalid display configuration: {0}")]
    InvalidConfiguration(String),
    #[error("a display buffer cannot span multiple gpu memory domains")]
    MixedDevices,
    #[error("{op} was denied: {source}")]
    PermissionDenied {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{op} is not supported by the hardware: {source}")]
    Unsupported {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{op} failed: {source}")]
    Driver {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for kms events: {0}")]
    EventLoop(#[source] io::Error),
    #[error(transparent)]
    Surface(#[from] anyhow::Error),
}

impl KmsError {
    /// Classifies a raw kernel-call failure.
    ///
    /// Permission errors are split out so callers can swallow them during
    /// session switches; everything else is a driver failure.
    pub fn from_io(op: &'static str, source: io::Error) -> Self {
        if is_permission_error(&source) {
            KmsError::PermissionDenied { op, source }
        } else {
            KmsError::Driver { op, source }
        }
    }

    /// Like [`KmsError::from_io`] but for optional features where
    /// a rejection means the hardware just can't do it.
    pub fn from_io_optional(op: &'static str, source: io::Error) -> Self {
        if is_permission_error(&source) {
            KmsError::PermissionDenied { op, source }
        } else {
            KmsError::Unsupported { op, source }
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            KmsError::FlipAlreadyPending { .. }
            | KmsError::NoCrtc { .. }
            | KmsError::InvalidConfiguration(_)
            | KmsError::MixedDevices => FailureClass::ProtocolViolation,
            KmsError::PermissionDenied { .. } => FailureClass::TransientPermission,
            KmsError::Unsupported { .. } => FailureClass::HardwareUnsupported,
            KmsError::Driver { .. } | KmsError::Surface(_) => FailureClass::DriverFailure,
            KmsError::EventLoop(_) => FailureClass::EventLoopFailure,
        }
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.class(),
            FailureClass::TransientPermission | FailureClass::HardwareUnsupported
        )
    }
}

/// Whether `err` is EACCES or EPERM.
pub fn is_permission_error(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EACCES) | Some(libc::EPERM))
        || err.kind() == io::ErrorKind::PermissionDenied
}
