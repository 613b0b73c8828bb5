#![allow(dead_code)]

//! A fake kernel and fake renderer for driving the scanout stack without hardware.

use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use scanout::{
    device::{
        ConnectionState, ConnectorInfo, CrtcInfo, CursorPlane, DeviceId, DriverInfo,
        DumbAllocation, EncoderInfo, FlipEvent, FramebufferDesc, KmsDevice, OutputId, Resources,
        mode::{ModeTimings, mode_from_timings},
    },
    framebuffer::{BufferId, DestroyHook, ScanoutBuffer},
    page_flipper::Frame,
    report::DisplayReport,
    surface::{RenderSurface, Renderable, SurfaceFactory},
};
use smithay::{
    reexports::drm::{
        buffer::{self, DrmFourcc},
        control::{self, Mode, connector, crtc, encoder, framebuffer, property},
    },
    utils::{Logical, Rectangle, Size, Transform},
};

pub fn fhd() -> Mode {
    mode_from_timings(ModeTimings::FHD_60.preferred())
}

pub fn svga() -> Mode {
    mode_from_timings(ModeTimings::SVGA_60)
}

pub fn handle<T: From<control::RawResourceHandle>>(raw: u32) -> T {
    control::from_u32(raw).unwrap()
}

/// The fb the firmware left on screen for connectors created with [`FakeKmsBuilder::bound`].
pub const FIRMWARE_FB: u32 = 999;

/// A kernel entry point whose failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    SetCrtc,
    ClearCrtc,
    PageFlip,
    SetCursor,
    ClearCursor,
    MoveCursor,
    SetGamma,
    SetProperty,
    AddFramebuffer,
    CreateDumbBuffer,
    AcquireMaster,
    ReleaseMaster,
}

/// A recorded kernel call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SetCrtc {
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        connectors: Vec<connector::Handle>,
    },
    PageFlip {
        crtc: crtc::Handle,
        fb: framebuffer::Handle,
    },
    SetCursor {
        crtc: crtc::Handle,
        visible: bool,
    },
    MoveCursor {
        crtc: crtc::Handle,
        position: (i32, i32),
    },
    SetGamma {
        crtc: crtc::Handle,
        size: usize,
    },
    SetProperty {
        connector: connector::Handle,
        value: u64,
    },
    AddFramebuffer(framebuffer::Handle),
    DestroyFramebuffer(framebuffer::Handle),
    AcquireMaster,
    ReleaseMaster,
}

struct FakeConnector {
    info: ConnectorInfo,
}

struct FakeCrtc {
    info: CrtcInfo,
    cursor_visible: bool,
}

#[derive(Default)]
struct FakeState {
    connectors: Vec<FakeConnector>,
    encoders: Vec<EncoderInfo>,
    crtcs: Vec<FakeCrtc>,

    calls: Vec<Call>,
    failures: HashMap<Op, i32>,

    auto_vblank: bool,
    in_flight: Vec<crtc::Handle>,
    events: Vec<FlipEvent>,
    sequence: u32,
    interrupt_next_wait: bool,
    closed: bool,

    next_fb: u32,
    live_fbs: HashSet<framebuffer::Handle>,
    destroyed_fbs: Vec<framebuffer::Handle>,

    next_dumb: u32,
    dumb_buffers: HashMap<buffer::Handle, Vec<u8>>,

    dpms: HashMap<connector::Handle, u64>,

    resource_queries: usize,
    property_lookups: usize,
}

impl FakeState {
    fn fail(&self, op: Op) -> io::Result<()> {
        match self.failures.get(&op) {
            Some(errno) => Err(io::Error::from_raw_os_error(*errno)),
            None => Ok(()),
        }
    }

    fn connector_mut(&mut self, handle: connector::Handle) -> Option<&mut FakeConnector> {
        self.connectors
            .iter_mut()
            .find(|conn| conn.info.handle == handle)
    }

    fn crtc_mut(&mut self, handle: crtc::Handle) -> io::Result<&mut FakeCrtc> {
        self.crtcs
            .iter_mut()
            .find(|crtc| crtc.info.handle == handle)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn unbind_crtc(&mut self, crtc: crtc::Handle, keep: &[connector::Handle]) {
        let mut unbound = Vec::new();
        for encoder in self.encoders.iter_mut() {
            if encoder.crtc == Some(crtc) {
                encoder.crtc = None;
                unbound.push(encoder.handle);
            }
        }
        for conn in self.connectors.iter_mut() {
            if keep.contains(&conn.info.handle) {
                continue;
            }
            if conn
                .info
                .current_encoder
                .is_some_and(|enc| unbound.contains(&enc))
            {
                conn.info.current_encoder = None;
            }
        }
    }

    fn complete_flips(&mut self) {
        for crtc in std::mem::take(&mut self.in_flight) {
            self.complete_flip(crtc);
        }
    }

    fn complete_flip(&mut self, crtc: crtc::Handle) {
        self.in_flight.retain(|c| *c != crtc);
        self.sequence = self.sequence.wrapping_add(1);
        self.events.push(FlipEvent {
            crtc,
            sequence: self.sequence,
            timestamp: Duration::from_micros(self.sequence as u64 * 16_667),
        });
    }
}

/// A kms device that lives in memory and records every call.
///
/// Flips complete immediately by default; see [`FakeKms::set_auto_vblank`].
pub struct FakeKms {
    id: DeviceId,
    cursor_size: (u32, u32),
    state: Mutex<FakeState>,
    cond: Condvar,
}

impl std::fmt::Debug for FakeKms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeKms").field("id", &self.id).finish()
    }
}

pub struct FakeKmsBuilder {
    id: u64,
    crtcs: usize,
    gamma_length: u32,
    cursor_size: (u32, u32),
    connectors: Vec<(String, ConnectionState, Vec<Mode>, Option<usize>)>,
}

impl FakeKmsBuilder {
    pub fn crtcs(mut self, count: usize) -> Self {
        self.crtcs = count;
        self
    }

    pub fn gamma_length(mut self, length: u32) -> Self {
        self.gamma_length = length;
        self
    }

    pub fn cursor_size(mut self, size: (u32, u32)) -> Self {
        self.cursor_size = size;
        self
    }

    pub fn connector(mut self, name: &str, modes: Vec<Mode>) -> Self {
        self.connectors
            .push((name.to_string(), ConnectionState::Connected, modes, None));
        self
    }

    pub fn disconnected(mut self, name: &str) -> Self {
        self.connectors
            .push((name.to_string(), ConnectionState::Disconnected, Vec::new(), None));
        self
    }

    /// A connected connector already shown on crtc `crtc` by the firmware.
    pub fn bound(mut self, name: &str, modes: Vec<Mode>, crtc: usize) -> Self {
        self.connectors
            .push((name.to_string(), ConnectionState::Connected, modes, Some(crtc)));
        self
    }

    pub fn build(self) -> Arc<FakeKms> {
        let crtc_handles = (0..self.crtcs)
            .map(|idx| handle::<crtc::Handle>(300 + idx as u32))
            .collect::<Vec<_>>();

        let mut state = FakeState {
            auto_vblank: true,
            next_fb: 1000,
            next_dumb: 500,
            ..Default::default()
        };

        state.crtcs = crtc_handles
            .iter()
            .map(|crtc| FakeCrtc {
                info: CrtcInfo {
                    handle: *crtc,
                    position: (0, 0),
                    mode: None,
                    framebuffer: None,
                    gamma_length: self.gamma_length,
                },
                cursor_visible: false,
            })
            .collect();

        for (idx, (name, connection, modes, bound)) in self.connectors.into_iter().enumerate() {
            let encoder = handle::<encoder::Handle>(200 + idx as u32);
            let bound_crtc = bound.map(|crtc| crtc_handles[crtc]);

            state.encoders.push(EncoderInfo {
                handle: encoder,
                crtc: bound_crtc,
                possible_crtcs: crtc_handles.clone(),
            });

            if let Some(crtc) = bound_crtc {
                let fake = state.crtc_mut(crtc).unwrap();
                fake.info.mode = modes.first().copied();
                fake.info.framebuffer = Some(handle(FIRMWARE_FB));
            }

            state.connectors.push(FakeConnector {
                info: ConnectorInfo {
                    handle: handle(100 + idx as u32),
                    name,
                    state: connection,
                    modes,
                    encoders: vec![encoder],
                    current_encoder: bound_crtc.map(|_| encoder),
                    physical_size_mm: Some((600, 340)),
                },
            });
        }

        Arc::new(FakeKms {
            id: DeviceId(self.id),
            cursor_size: self.cursor_size,
            state: Mutex::new(state),
            cond: Condvar::new(),
        })
    }
}

impl FakeKms {
    pub fn builder(id: u64) -> FakeKmsBuilder {
        FakeKmsBuilder {
            id,
            crtcs: 2,
            gamma_length: 256,
            cursor_size: (64, 64),
            connectors: Vec::new(),
        }
    }

    /// One connected 1080p connector named `DP-1` and two crtcs.
    pub fn single(id: u64) -> Arc<FakeKms> {
        Self::builder(id).connector("DP-1", vec![fhd(), svga()]).build()
    }

    pub fn connector_handle(&self, name: &str) -> connector::Handle {
        let state = self.state.lock().unwrap();
        state
            .connectors
            .iter()
            .find(|conn| conn.info.name == name)
            .map(|conn| conn.info.handle)
            .unwrap_or_else(|| panic!("no connector named {name}"))
    }

    pub fn output_id(&self, name: &str) -> OutputId {
        OutputId {
            device: self.id,
            connector: self.connector_handle(name),
        }
    }

    pub fn crtc_handle(&self, idx: usize) -> crtc::Handle {
        handle(300 + idx as u32)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn count_calls(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|call| pred(call)).count()
    }

    /// Makes every call to `op` fail with `errno` until [`FakeKms::succeed`] is called.
    pub fn fail(&self, op: Op, errno: i32) {
        self.state.lock().unwrap().failures.insert(op, errno);
    }

    pub fn succeed(&self, op: Op) {
        self.state.lock().unwrap().failures.remove(&op);
    }

    /// Whether flips complete as soon as they are scheduled.
    pub fn set_auto_vblank(&self, auto: bool) {
        self.state.lock().unwrap().auto_vblank = auto;
    }

    /// Completes every flip in flight.
    pub fn signal_vblank(&self) {
        let mut state = self.state.lock().unwrap();
        state.complete_flips();
        self.cond.notify_all();
    }

    /// Completes the flip in flight on `crtc` only.
    pub fn signal_vblank_on(&self, crtc: crtc::Handle) {
        let mut state = self.state.lock().unwrap();
        if state.in_flight.contains(&crtc) {
            state.complete_flip(crtc);
        }
        self.cond.notify_all();
    }

    pub fn flips_in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }

    /// Makes the next wait for events return `EINTR`.
    pub fn interrupt_next_wait(&self) {
        self.state.lock().unwrap().interrupt_next_wait = true;
        self.cond.notify_all();
    }

    /// Closes the event descriptor; waits fail from now on.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }

    pub fn set_connected(&self, name: &str, connected: bool) {
        let mut state = self.state.lock().unwrap();
        let conn = state
            .connectors
            .iter_mut()
            .find(|conn| conn.info.name == name)
            .unwrap();
        conn.info.state = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        if connected && conn.info.modes.is_empty() {
            conn.info.modes = vec![fhd()];
        }
    }

    pub fn set_modes(&self, name: &str, modes: Vec<Mode>) {
        let mut state = self.state.lock().unwrap();
        let conn = state
            .connectors
            .iter_mut()
            .find(|conn| conn.info.name == name)
            .unwrap();
        conn.info.modes = modes;
    }

    /// How often resources were enumerated, i.e. how many crtc searches ran.
    pub fn resource_queries(&self) -> usize {
        self.state.lock().unwrap().resource_queries
    }

    pub fn property_lookups(&self) -> usize {
        self.state.lock().unwrap().property_lookups
    }

    pub fn remove_connector(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.connectors.retain(|conn| conn.info.name != name);
    }

    pub fn crtc_info(&self, idx: usize) -> CrtcInfo {
        let state = self.state.lock().unwrap();
        state.crtcs[idx].info.clone()
    }

    pub fn cursor_visible(&self, idx: usize) -> bool {
        self.state.lock().unwrap().crtcs[idx].cursor_visible
    }

    pub fn dpms_value(&self, name: &str) -> Option<u64> {
        let handle = self.connector_handle(name);
        self.state.lock().unwrap().dpms.get(&handle).copied()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.state.lock().unwrap().live_fbs.len()
    }

    pub fn destroyed_framebuffers(&self) -> Vec<framebuffer::Handle> {
        self.state.lock().unwrap().destroyed_fbs.clone()
    }

    pub fn live_dumb_buffers(&self) -> usize {
        self.state.lock().unwrap().dumb_buffers.len()
    }

    pub fn dumb_buffer_contents(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .dumb_buffers
            .values()
            .cloned()
            .collect()
    }
}

impl KmsDevice for FakeKms {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn driver_info(&self) -> io::Result<DriverInfo> {
        Ok(DriverInfo {
            name: "fake".to_string(),
            description: "In-memory kms".to_string(),
            date: "20260101".to_string(),
        })
    }

    fn resources(&self) -> io::Result<Resources> {
        let mut state = self.state.lock().unwrap();
        state.resource_queries += 1;
        Ok(Resources {
            connectors: state.connectors.iter().map(|conn| conn.info.handle).collect(),
            encoders: state.encoders.iter().map(|enc| enc.handle).collect(),
            crtcs: state.crtcs.iter().map(|crtc| crtc.info.handle).collect(),
        })
    }

    fn connector(&self, handle: connector::Handle) -> io::Result<ConnectorInfo> {
        let state = self.state.lock().unwrap();
        state
            .connectors
            .iter()
            .find(|conn| conn.info.handle == handle)
            .map(|conn| conn.info.clone())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn encoder(&self, handle: encoder::Handle) -> io::Result<EncoderInfo> {
        let state = self.state.lock().unwrap();
        state
            .encoders
            .iter()
            .find(|enc| enc.handle == handle)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn crtc(&self, handle: crtc::Handle) -> io::Result<CrtcInfo> {
        let mut state = self.state.lock().unwrap();
        Ok(state.crtc_mut(handle)?.info.clone())
    }

    fn find_property(
        &self,
        connector: connector::Handle,
        name: &str,
    ) -> io::Result<Option<property::Handle>> {
        self.state.lock().unwrap().property_lookups += 1;
        if name != "DPMS" {
            return Ok(None);
        }
        Ok(Some(handle(400 + u32::from(connector))))
    }

    fn set_connector_property(
        &self,
        connector: connector::Handle,
        _property: property::Handle,
        value: u64,
    ) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::SetProperty { connector, value });
        state.fail(Op::SetProperty)?;
        state.dpms.insert(connector, value);
        Ok(())
    }

    fn edid(&self, _connector: connector::Handle) -> io::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        framebuffer: Option<framebuffer::Handle>,
        position: (u32, u32),
        connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::SetCrtc {
            crtc,
            fb: framebuffer,
            connectors: connectors.to_vec(),
        });

        match (framebuffer, mode) {
            (Some(fb), Some(mode)) => {
                state.fail(Op::SetCrtc)?;

                state.unbind_crtc(crtc, connectors);
                let fake = state.crtc_mut(crtc)?;
                fake.info.framebuffer = Some(fb);
                fake.info.mode = Some(mode);
                fake.info.position = position;

                for handle in connectors {
                    let Some(encoder) = state
                        .connector_mut(*handle)
                        .and_then(|conn| conn.info.encoders.first().copied())
                    else {
                        return Err(io::Error::from_raw_os_error(libc::ENOENT));
                    };
                    if let Some(conn) = state.connector_mut(*handle) {
                        conn.info.current_encoder = Some(encoder);
                    }
                    if let Some(enc) = state.encoders.iter_mut().find(|e| e.handle == encoder) {
                        enc.crtc = Some(crtc);
                    }
                }
            }
            _ => {
                state.fail(Op::ClearCrtc)?;

                state.unbind_crtc(crtc, &[]);
                let fake = state.crtc_mut(crtc)?;
                fake.info.framebuffer = None;
                fake.info.mode = None;
            }
        }

        Ok(())
    }

    fn page_flip(&self, crtc: crtc::Handle, framebuffer: framebuffer::Handle) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::PageFlip {
            crtc,
            fb: framebuffer,
        });
        state.fail(Op::PageFlip)?;

        if state.in_flight.contains(&crtc) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        state.crtc_mut(crtc)?.info.framebuffer = Some(framebuffer);
        state.in_flight.push(crtc);

        if state.auto_vblank {
            state.complete_flips();
        }
        self.cond.notify_all();

        Ok(())
    }

    fn wait_for_events(&self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            }
            if state.interrupt_next_wait {
                state.interrupt_next_wait = false;
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            if !state.events.is_empty() {
                return Ok(());
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    fn receive_events(&self) -> io::Result<Vec<FlipEvent>> {
        Ok(std::mem::take(&mut self.state.lock().unwrap().events))
    }

    fn cursor_size(&self) -> (u32, u32) {
        self.cursor_size
    }

    fn set_cursor(&self, crtc: crtc::Handle, cursor: Option<CursorPlane>) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::SetCursor {
            crtc,
            visible: cursor.is_some(),
        });
        state.fail(if cursor.is_some() {
            Op::SetCursor
        } else {
            Op::ClearCursor
        })?;
        state.crtc_mut(crtc)?.cursor_visible = cursor.is_some();
        Ok(())
    }

    fn move_cursor(&self, crtc: crtc::Handle, position: (i32, i32)) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::MoveCursor { crtc, position });
        state.fail(Op::MoveCursor)
    }

    fn set_gamma(
        &self,
        crtc: crtc::Handle,
        red: &[u16],
        _green: &[u16],
        _blue: &[u16],
    ) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::SetGamma {
            crtc,
            size: red.len(),
        });
        state.fail(Op::SetGamma)
    }

    fn add_framebuffer(&self, _desc: &FramebufferDesc) -> io::Result<framebuffer::Handle> {
        let mut state = self.state.lock().unwrap();
        state.fail(Op::AddFramebuffer)?;
        state.next_fb += 1;
        let fb = handle(state.next_fb);
        state.live_fbs.insert(fb);
        state.calls.push(Call::AddFramebuffer(fb));
        Ok(fb)
    }

    fn destroy_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::DestroyFramebuffer(fb));
        if !state.live_fbs.remove(&fb) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        state.destroyed_fbs.push(fb);
        Ok(())
    }

    fn create_dumb_buffer(
        &self,
        size: (u32, u32),
        _format: DrmFourcc,
    ) -> io::Result<DumbAllocation> {
        let mut state = self.state.lock().unwrap();
        state.fail(Op::CreateDumbBuffer)?;
        state.next_dumb += 1;
        let handle = handle(state.next_dumb);
        let pitch = size.0 * 4;
        state
            .dumb_buffers
            .insert(handle, vec![0; (pitch * size.1) as usize]);
        Ok(DumbAllocation {
            handle,
            size,
            pitch,
        })
    }

    fn write_dumb_buffer(&self, handle: buffer::Handle, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        let contents = state
            .dumb_buffers
            .get_mut(&handle)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        let len = contents.len().min(data.len());
        contents[..len].copy_from_slice(&data[..len]);
        Ok(())
    }

    fn destroy_dumb_buffer(&self, handle: buffer::Handle) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .dumb_buffers
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn acquire_master(&self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::AcquireMaster);
        state.fail(Op::AcquireMaster)
    }

    fn release_master(&self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::ReleaseMaster);
        state.fail(Op::ReleaseMaster)
    }
}

/// A client or renderer buffer that runs its destroy hooks when dropped.
pub struct FakeBuffer {
    id: BufferId,
    device: DeviceId,
    size: (u32, u32),
    scanout: bool,
    hooks: Mutex<Vec<DestroyHook>>,
}

impl FakeBuffer {
    pub fn new(device: DeviceId, size: (u32, u32)) -> Arc<Self> {
        Arc::new(Self {
            id: BufferId::next(),
            device,
            size,
            scanout: true,
            hooks: Mutex::new(Vec::new()),
        })
    }

    /// A buffer allocated without scanout usage.
    pub fn without_scanout(device: DeviceId, size: (u32, u32)) -> Arc<Self> {
        Arc::new(Self {
            id: BufferId::next(),
            device,
            size,
            scanout: false,
            hooks: Mutex::new(Vec::new()),
        })
    }
}

impl ScanoutBuffer for FakeBuffer {
    fn id(&self) -> BufferId {
        self.id
    }

    fn device_id(&self) -> DeviceId {
        self.device
    }

    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn stride(&self) -> u32 {
        self.size.0 * 4
    }

    fn format(&self) -> DrmFourcc {
        DrmFourcc::Xrgb8888
    }

    fn handle(&self) -> buffer::Handle {
        handle(700)
    }

    fn can_scanout(&self) -> bool {
        self.scanout
    }

    fn on_destroy(&self, hook: DestroyHook) {
        self.hooks.lock().unwrap().push(hook);
    }
}

impl Drop for FakeBuffer {
    fn drop(&mut self) {
        for hook in self.hooks.get_mut().unwrap().drain(..) {
            hook();
        }
    }
}

/// Shared record of what the fake renderer was asked to do.
#[derive(Debug, Default)]
pub struct SurfaceLog {
    pub ops: Mutex<Vec<&'static str>>,
    pub swaps: AtomicUsize,
}

impl SurfaceLog {
    pub fn ops(&self) -> Vec<&'static str> {
        self.ops.lock().unwrap().clone()
    }

    fn push(&self, op: &'static str) {
        self.ops.lock().unwrap().push(op);
    }
}

/// A swapchain of fake buffers.
pub struct FakeSurface {
    size: Size<i32, Logical>,
    buffers: Vec<Arc<FakeBuffer>>,
    back: usize,
    front: Option<usize>,
    log: Arc<SurfaceLog>,
}

impl FakeSurface {
    pub fn new(device: DeviceId, size: Size<i32, Logical>, log: Arc<SurfaceLog>) -> Self {
        let buffers = (0..3)
            .map(|_| FakeBuffer::new(device, (size.w as u32, size.h as u32)))
            .collect();
        Self {
            size,
            buffers,
            back: 0,
            front: None,
            log,
        }
    }

    pub fn buffer_ids(&self) -> Vec<BufferId> {
        self.buffers.iter().map(|buffer| buffer.id()).collect()
    }
}

impl RenderSurface for FakeSurface {
    fn size(&self) -> Size<i32, Logical> {
        self.size
    }

    fn make_current(&mut self) -> anyhow::Result<()> {
        self.log.push("make_current");
        Ok(())
    }

    fn release_current(&mut self) -> anyhow::Result<()> {
        self.log.push("release_current");
        Ok(())
    }

    fn bind(&mut self) -> anyhow::Result<()> {
        self.log.push("bind");
        Ok(())
    }

    fn clear(&mut self, _color: [f32; 4]) -> anyhow::Result<()> {
        self.log.push("clear");
        Ok(())
    }

    fn swap_buffers(&mut self) -> anyhow::Result<()> {
        self.log.push("swap_buffers");
        self.log.swaps.fetch_add(1, Ordering::SeqCst);
        self.front = Some(self.back);
        self.back = (self.back + 1) % self.buffers.len();
        Ok(())
    }

    fn lock_front(&mut self) -> anyhow::Result<Arc<dyn ScanoutBuffer>> {
        let front = self
            .front
            .ok_or_else(|| anyhow::anyhow!("nothing swapped yet"))?;
        Ok(self.buffers[front].clone())
    }
}

/// Creates [`FakeSurface`]s, optionally on a different device than asked for.
#[derive(Default)]
pub struct FakeSurfaceFactory {
    pub log: Arc<SurfaceLog>,
    pub allocate_on: Option<DeviceId>,
    pub created: Mutex<Vec<(Size<i32, Logical>, bool)>>,
}

impl FakeSurfaceFactory {
    pub fn created(&self) -> Vec<(Size<i32, Logical>, bool)> {
        self.created.lock().unwrap().clone()
    }
}

impl SurfaceFactory for FakeSurfaceFactory {
    fn create_surface(
        &self,
        device: &Arc<dyn KmsDevice>,
        size: Size<i32, Logical>,
        shared: bool,
    ) -> anyhow::Result<Box<dyn RenderSurface>> {
        self.created.lock().unwrap().push((size, shared));
        let device = self.allocate_on.unwrap_or(device.id());
        Ok(Box::new(FakeSurface::new(device, size, self.log.clone())))
    }
}

pub struct FakeRenderable {
    pub position: Rectangle<i32, Logical>,
    pub buffer: Arc<FakeBuffer>,
    pub alpha: f32,
    pub opaque: bool,
    pub transform: Transform,
}

impl FakeRenderable {
    pub fn new(position: Rectangle<i32, Logical>, buffer: Arc<FakeBuffer>) -> Self {
        Self {
            position,
            buffer,
            alpha: 1.0,
            opaque: true,
            transform: Transform::Normal,
        }
    }
}

impl Renderable for FakeRenderable {
    fn screen_position(&self) -> Rectangle<i32, Logical> {
        self.position
    }

    fn buffer(&self) -> Arc<dyn ScanoutBuffer> {
        self.buffer.clone()
    }

    fn transform(&self) -> Transform {
        self.transform
    }

    fn alpha(&self) -> f32 {
        self.alpha
    }

    fn is_opaque(&self) -> bool {
        self.opaque
    }
}

/// A report that remembers what it was told.
#[derive(Default)]
pub struct RecordingReport {
    pub milestones: Mutex<Vec<&'static str>>,
    pub vsyncs: Mutex<Vec<(OutputId, Frame)>>,
    pub crtc_failures: Mutex<Vec<String>>,
    pub master_failures: Mutex<Vec<DeviceId>>,
}

impl RecordingReport {
    pub fn milestones(&self) -> Vec<&'static str> {
        self.milestones.lock().unwrap().clone()
    }

    pub fn vsyncs(&self) -> Vec<(OutputId, Frame)> {
        self.vsyncs.lock().unwrap().clone()
    }

    pub fn crtc_failures(&self) -> Vec<String> {
        self.crtc_failures.lock().unwrap().clone()
    }

    pub fn master_failures(&self) -> Vec<DeviceId> {
        self.master_failures.lock().unwrap().clone()
    }
}

impl DisplayReport for RecordingReport {
    fn report_vsync(&self, output: OutputId, frame: Frame) {
        self.vsyncs.lock().unwrap().push((output, frame));
    }

    fn report_successful_setup_of_native_resources(&self) {
        self.milestones.lock().unwrap().push("native_resources");
    }

    fn report_successful_make_current_on_construction(&self) {
        self.milestones.lock().unwrap().push("make_current");
    }

    fn report_successful_buffer_swap_on_construction(&self) {
        self.milestones.lock().unwrap().push("buffer_swap");
    }

    fn report_successful_drm_mode_set_crtc_on_construction(&self) {
        self.milestones.lock().unwrap().push("set_crtc");
    }

    fn report_successful_display_construction(&self) {
        self.milestones.lock().unwrap().push("display");
    }

    fn report_drm_master_failure(&self, device: DeviceId, _error: &io::Error) {
        self.master_failures.lock().unwrap().push(device);
    }

    fn report_crtc_failure(&self, output_name: &str, _crtc: Option<crtc::Handle>) {
        self.crtc_failures
            .lock()
            .unwrap()
            .push(output_name.to_string());
    }
}
