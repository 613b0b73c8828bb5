// SPDX-License-Identifier: GPL-3.0-or-later

//! Asynchronous page flip scheduling shared by every output on one device.
//!
//! Only one thread at a time reads from the device's event descriptor. Whichever thread first
//! waits on an outstanding flip becomes the *worker* and dispatches kernel events for everyone;
//! all other waiters sleep on a condition variable until their own flip completes or the worker
//! role frees up, at which point one of them takes it over.

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Condvar, Mutex},
    thread::{self, ThreadId},
    time::Duration,
};

use smithay::reexports::drm::control::{connector, crtc, framebuffer};
use tracing::{debug, trace, warn};

use crate::{
    device::{FlipEvent, KmsDevice, OutputId},
    error::KmsError,
    report::DisplayReport,
};

/// A completed flip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Frame {
    /// Media stream counter: the number of vblanks seen on the crtc.
    pub msc: u64,
    /// Monotonic time of the vblank the flip completed on.
    pub timestamp: Duration,
}

pub trait PageFlipper: Send + Sync {
    /// Queues a flip of `crtc` to `framebuffer`.
    ///
    /// Returns `Ok(false)` if the kernel rejected the flip. Scheduling a second flip on a crtc
    /// before the first one was waited for is an error.
    fn schedule_flip(
        &self,
        crtc: crtc::Handle,
        framebuffer: framebuffer::Handle,
        connector: connector::Handle,
    ) -> Result<bool, KmsError>;

    /// Blocks until the flip on `crtc` has completed and returns its frame.
    ///
    /// Returns immediately with the last recorded frame if nothing is pending.
    fn wait_for_flip(&self, crtc: crtc::Handle) -> Result<Frame, KmsError>;
}

#[derive(Debug, Clone, Copy)]
struct PendingFlip {
    connector: connector::Handle,
}

/// Extends the kernel's 32-bit sequence across wrap-around.
#[derive(Debug, Default, Clone, Copy)]
struct SequenceCounter {
    last: u32,
    epoch: u64,
}

impl SequenceCounter {
    fn extend(&mut self, sequence: u32) -> u64 {
        if sequence < self.last {
            self.epoch += 1;
        }
        self.last = sequence;
        (self.epoch << 32) | sequence as u64
    }
}

#[derive(Debug, Default)]
struct FlipperState {
    pending: HashMap<crtc::Handle, PendingFlip>,
    completed: HashMap<crtc::Handle, Frame>,
    sequences: HashMap<crtc::Handle, SequenceCounter>,
    worker: Option<ThreadId>,
}

impl FlipperState {
    fn complete(&mut self, event: FlipEvent) -> Option<(PendingFlip, Frame)> {
        let Some(pending) = self.pending.remove(&event.crtc) else {
            debug!(crtc = ?event.crtc, "Ignoring flip event with no pending flip");
            return None;
        };

        let frame = Frame {
            msc: self
                .sequences
                .entry(event.crtc)
                .or_default()
                .extend(event.sequence),
            timestamp: event.timestamp,
        };
        self.completed.insert(event.crtc, frame);

        Some((pending, frame))
    }
}

/// The kms implementation of [`PageFlipper`].
pub struct KmsPageFlipper {
    device: Arc<dyn KmsDevice>,
    report: Arc<dyn DisplayReport>,
    state: Mutex<FlipperState>,
    cond: Condvar,
}

impl std::fmt::Debug for KmsPageFlipper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsPageFlipper")
            .field("device", &self.device.id())
            .field("state", &self.state)
            .finish()
    }
}

impl KmsPageFlipper {
    pub fn new(device: Arc<dyn KmsDevice>, report: Arc<dyn DisplayReport>) -> Self {
        Self {
            device,
            report,
            state: Mutex::new(FlipperState::default()),
            cond: Condvar::new(),
        }
    }

    /// The thread currently dispatching kernel events, if any.
    pub fn debug_worker_thread(&self) -> Option<ThreadId> {
        self.state.lock().unwrap().worker
    }

    /// Dispatches kernel events until the flip on `crtc` is done.
    ///
    /// Must only be called by the worker. The state lock is never held while blocking on the
    /// device or calling into the report.
    fn dispatch_until_done(&self, crtc: crtc::Handle) -> Result<(), KmsError> {
        loop {
            match self.device.wait_for_events() {
                Ok(()) => (),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(KmsError::EventLoop(err)),
            }

            let events = self.device.receive_events().map_err(KmsError::EventLoop)?;

            let (completed, done) = {
                let mut state = self.state.lock().unwrap();
                let completed = events
                    .into_iter()
                    .filter_map(|event| {
                        let crtc = event.crtc;
                        state.complete(event).map(|(pending, frame)| (crtc, pending, frame))
                    })
                    .collect::<Vec<_>>();

                if !completed.is_empty() {
                    self.cond.notify_all();
                }

                (completed, !state.pending.contains_key(&crtc))
            };

            for (crtc, pending, frame) in completed {
                trace!(?crtc, msc = frame.msc, "Page flip completed");
                self.report.report_vsync(
                    OutputId {
                        device: self.device.id(),
                        connector: pending.connector,
                    },
                    frame,
                );
            }

            if done {
                return Ok(());
            }
        }
    }
}

impl PageFlipper for KmsPageFlipper {
    fn schedule_flip(
        &self,
        crtc: crtc::Handle,
        framebuffer: framebuffer::Handle,
        connector: connector::Handle,
    ) -> Result<bool, KmsError> {
        let mut state = self.state.lock().unwrap();

        if state.pending.contains_key(&crtc) {
            return Err(KmsError::FlipAlreadyPending { crtc });
        }

        state.pending.insert(crtc, PendingFlip { connector });

        if let Err(err) = self.device.page_flip(crtc, framebuffer) {
            state.pending.remove(&crtc);
            warn!(?crtc, ?framebuffer, "Failed to schedule page flip: {err}");
            return Ok(false);
        }

        Ok(true)
    }

    fn wait_for_flip(&self, crtc: crtc::Handle) -> Result<Frame, KmsError> {
        let mut state = self.state.lock().unwrap();

        loop {
            if !state.pending.contains_key(&crtc) {
                return Ok(state.completed.get(&crtc).copied().unwrap_or_default());
            }

            if state.worker.is_some() {
                state = self.cond.wait(state).unwrap();
                continue;
            }

            state.worker = Some(thread::current().id());
            drop(state);

            let result = self.dispatch_until_done(crtc);

            state = self.state.lock().unwrap();
            state.worker = None;
            // Let one of the remaining waiters take over as worker
            self.cond.notify_all();

            result?;
        }
    }
}
