// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    collections::HashMap,
    fs::OpenOptions,
    io,
    os::{
        fd::{AsFd, AsRawFd, OwnedFd},
        unix::fs::OpenOptionsExt,
    },
    path::Path,
    sync::Mutex,
};

use smithay::{
    backend::drm::{DrmDeviceFd, DrmNode},
    reexports::drm::{
        ClientCapability, Device as _, DriverCapability,
        buffer::{self, Buffer as _, DrmFourcc, DrmModifier, PlanarBuffer},
        control::{
            AtomicCommitFlags, Device as _, Event, FbCmd2Flags, Mode, PageFlipFlags, PlaneType,
            ResourceHandle, atomic::AtomicModeReq, connector, crtc, dumbbuffer::DumbBuffer,
            encoder, framebuffer, plane, property,
        },
    },
    utils::DeviceFd,
};
use tracing::{debug, info, warn};

use super::{
    ConnectionState, ConnectorInfo, CrtcInfo, CursorPlane, DeviceId, DriverInfo, DumbAllocation,
    EncoderInfo, FlipEvent, FramebufferDesc, KmsDevice, Resources,
};

const FALLBACK_CURSOR_SIZE: u64 = 64;
/// Some older hardware misreports its cursor size.
const FORCE_64X64_CURSOR_ENV: &str = "SCANOUT_FORCE_64X64_CURSOR";

/// How modesets and flips are committed to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModesetStrategy {
    /// `drmModeSetCrtc` and `drmModePageFlip`.
    #[default]
    Legacy,
    /// Atomic commits on the crtc's primary plane.
    Atomic,
}

/// A kms device backed by a real drm file descriptor.
#[derive(Debug)]
pub struct DrmKmsDevice {
    id: DeviceId,
    fd: DrmDeviceFd,
    strategy: ModesetStrategy,
    cursor_size: (u32, u32),
    primary_planes: Mutex<HashMap<crtc::Handle, plane::Handle>>,
    dumb_buffers: Mutex<HashMap<buffer::Handle, DumbBuffer>>,
}

impl DrmKmsDevice {
    /// Opens the drm device at `path`.
    ///
    /// Atomic modesetting is only used if the driver accepts the atomic client capability;
    /// otherwise this falls back to legacy.
    pub fn open(path: &Path, strategy: ModesetStrategy) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NOCTTY)
            .open(path)?;

        let fd = DrmDeviceFd::new(DeviceFd::from(OwnedFd::from(file)));
        let node = DrmNode::from_file(&fd).map_err(io::Error::other)?;
        let id = DeviceId(node.dev_id());

        let strategy = match strategy {
            ModesetStrategy::Atomic => {
                let supported = fd
                    .set_client_capability(ClientCapability::UniversalPlanes, true)
                    .and_then(|_| fd.set_client_capability(ClientCapability::Atomic, true));
                match supported {
                    Ok(()) => ModesetStrategy::Atomic,
                    Err(err) => {
                        warn!(?path, "Atomic modesetting unavailable, using legacy: {err}");
                        ModesetStrategy::Legacy
                    }
                }
            }
            ModesetStrategy::Legacy => ModesetStrategy::Legacy,
        };

        let cursor_size = if std::env::var_os(FORCE_64X64_CURSOR_ENV).is_some() {
            (FALLBACK_CURSOR_SIZE as u32, FALLBACK_CURSOR_SIZE as u32)
        } else {
            let width = fd
                .get_driver_capability(DriverCapability::CursorWidth)
                .unwrap_or(FALLBACK_CURSOR_SIZE);
            let height = fd
                .get_driver_capability(DriverCapability::CursorHeight)
                .unwrap_or(FALLBACK_CURSOR_SIZE);
            (width as u32, height as u32)
        };

        info!(?path, %id, ?strategy, ?cursor_size, "Opened kms device");

        Ok(Self {
            id,
            fd,
            strategy,
            cursor_size,
            primary_planes: Mutex::new(HashMap::new()),
            dumb_buffers: Mutex::new(HashMap::new()),
        })
    }

    pub fn strategy(&self) -> ModesetStrategy {
        self.strategy
    }

    fn property(
        &self,
        handle: impl ResourceHandle,
        name: &str,
    ) -> io::Result<Option<(property::Handle, property::Info, property::RawValue)>> {
        let props = self.fd.get_properties(handle)?;
        let (ids, vals) = props.as_props_and_values();
        for (&id, &val) in ids.iter().zip(vals.iter()) {
            let info = self.fd.get_property(id)?;
            if Some(name) == info.name().to_str().ok() {
                return Ok(Some((id, info, val)));
            }
        }
        Ok(None)
    }

    fn required_property(
        &self,
        handle: impl ResourceHandle,
        name: &'static str,
    ) -> io::Result<property::Handle> {
        self.property(handle, name)?
            .map(|(id, _, _)| id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, format!("no {name} property")))
    }

    fn primary_plane(&self, crtc: crtc::Handle) -> io::Result<plane::Handle> {
        if let Some(plane) = self.primary_planes.lock().unwrap().get(&crtc) {
            return Ok(*plane);
        }

        let resources = self.fd.resource_handles()?;
        for plane in self.fd.plane_handles()? {
            let info = self.fd.get_plane(plane)?;
            if !resources
                .filter_crtcs(info.possible_crtcs())
                .contains(&crtc)
            {
                continue;
            }

            let Some((_, type_info, value)) = self.property(plane, "type")? else {
                continue;
            };
            let is_primary = matches!(
                type_info.value_type().convert_value(value),
                property::Value::Enum(Some(val)) if val.value() == PlaneType::Primary as u64
            );

            if is_primary {
                self.primary_planes.lock().unwrap().insert(crtc, plane);
                return Ok(plane);
            }
        }

        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no primary plane for crtc {crtc:?}"),
        ))
    }

    fn atomic_set_crtc(
        &self,
        crtc: crtc::Handle,
        framebuffer: Option<framebuffer::Handle>,
        position: (u32, u32),
        connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> io::Result<()> {
        let plane = self.primary_plane(crtc)?;
        let mut req = AtomicModeReq::new();

        match (framebuffer, mode) {
            (Some(fb), Some(mode)) => {
                let blob = self.fd.create_property_blob(&mode)?;
                let (w, h) = mode.size();
                let (x, y) = position;

                for conn in connectors {
                    req.add_property(
                        *conn,
                        self.required_property(*conn, "CRTC_ID")?,
                        property::Value::CRTC(Some(crtc)),
                    );
                }
                req.add_property(crtc, self.required_property(crtc, "MODE_ID")?, blob);
                req.add_property(
                    crtc,
                    self.required_property(crtc, "ACTIVE")?,
                    property::Value::Boolean(true),
                );

                let plane_props: [(&'static str, property::Value<'static>); 10] = [
                    ("FB_ID", property::Value::Framebuffer(Some(fb))),
                    ("CRTC_ID", property::Value::CRTC(Some(crtc))),
                    // Source coordinates are 16.16 fixed point
                    ("SRC_X", property::Value::UnsignedRange((x as u64) << 16)),
                    ("SRC_Y", property::Value::UnsignedRange((y as u64) << 16)),
                    ("SRC_W", property::Value::UnsignedRange((w as u64) << 16)),
                    ("SRC_H", property::Value::UnsignedRange((h as u64) << 16)),
                    ("CRTC_X", property::Value::SignedRange(0)),
                    ("CRTC_Y", property::Value::SignedRange(0)),
                    ("CRTC_W", property::Value::UnsignedRange(w as u64)),
                    ("CRTC_H", property::Value::UnsignedRange(h as u64)),
                ];
                for (name, value) in plane_props {
                    req.add_property(plane, self.required_property(plane, name)?, value);
                }
            }
            _ => {
                for conn in connectors {
                    req.add_property(
                        *conn,
                        self.required_property(*conn, "CRTC_ID")?,
                        property::Value::CRTC(None),
                    );
                }
                req.add_property(
                    plane,
                    self.required_property(plane, "FB_ID")?,
                    property::Value::Framebuffer(None),
                );
                req.add_property(
                    plane,
                    self.required_property(plane, "CRTC_ID")?,
                    property::Value::CRTC(None),
                );
                req.add_property(
                    crtc,
                    self.required_property(crtc, "MODE_ID")?,
                    property::Value::Unknown(0),
                );
                req.add_property(
                    crtc,
                    self.required_property(crtc, "ACTIVE")?,
                    property::Value::Boolean(false),
                );
            }
        }

        self.fd.atomic_commit(AtomicCommitFlags::ALLOW_MODESET, req)
    }

    fn atomic_page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle) -> io::Result<()> {
        let plane = self.primary_plane(crtc)?;
        let mut req = AtomicModeReq::new();
        req.add_property(
            plane,
            self.required_property(plane, "FB_ID")?,
            property::Value::Framebuffer(Some(fb)),
        );

        self.fd.atomic_commit(
            AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::NONBLOCK,
            req,
        )
    }
}

struct CursorBo(CursorPlane);

impl buffer::Buffer for CursorBo {
    fn size(&self) -> (u32, u32) {
        self.0.size
    }

    fn format(&self) -> DrmFourcc {
        DrmFourcc::Argb8888
    }

    fn pitch(&self) -> u32 {
        self.0.size.0 * 4
    }

    fn handle(&self) -> buffer::Handle {
        self.0.handle
    }
}

struct SinglePlane<'a>(&'a FramebufferDesc);

impl PlanarBuffer for SinglePlane<'_> {
    fn size(&self) -> (u32, u32) {
        self.0.size
    }

    fn format(&self) -> DrmFourcc {
        self.0.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        None
    }

    fn pitches(&self) -> [u32; 4] {
        [self.0.stride, 0, 0, 0]
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        [Some(self.0.handle), None, None, None]
    }

    fn offsets(&self) -> [u32; 4] {
        [0; 4]
    }
}

impl KmsDevice for DrmKmsDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn driver_info(&self) -> io::Result<DriverInfo> {
        let driver = self.fd.get_driver()?;
        Ok(DriverInfo {
            name: driver.name().to_string_lossy().into_owned(),
            description: driver.description().to_string_lossy().into_owned(),
            date: driver.date().to_string_lossy().into_owned(),
        })
    }

    fn resources(&self) -> io::Result<Resources> {
        let handles = self.fd.resource_handles()?;
        Ok(Resources {
            connectors: handles.connectors().to_vec(),
            encoders: handles.encoders().to_vec(),
            crtcs: handles.crtcs().to_vec(),
        })
    }

    fn connector(&self, handle: connector::Handle) -> io::Result<ConnectorInfo> {
        let info = self.fd.get_connector(handle, false)?;

        let state = match info.state() {
            connector::State::Connected => ConnectionState::Connected,
            connector::State::Disconnected => ConnectionState::Disconnected,
            connector::State::Unknown => ConnectionState::Unknown,
        };

        Ok(ConnectorInfo {
            handle,
            name: format!("{}-{}", info.interface().as_str(), info.interface_id()),
            state,
            modes: info.modes().to_vec(),
            encoders: info.encoders().to_vec(),
            current_encoder: info.current_encoder(),
            physical_size_mm: info.size(),
        })
    }

    fn encoder(&self, handle: encoder::Handle) -> io::Result<EncoderInfo> {
        let info = self.fd.get_encoder(handle)?;
        let resources = self.fd.resource_handles()?;
        Ok(EncoderInfo {
            handle,
            crtc: info.crtc(),
            possible_crtcs: resources.filter_crtcs(info.possible_crtcs()),
        })
    }

    fn crtc(&self, handle: crtc::Handle) -> io::Result<CrtcInfo> {
        let info = self.fd.get_crtc(handle)?;
        Ok(CrtcInfo {
            handle,
            position: info.position(),
            mode: info.mode(),
            framebuffer: info.framebuffer(),
            gamma_length: info.gamma_length(),
        })
    }

    fn find_property(
        &self,
        connector: connector::Handle,
        name: &str,
    ) -> io::Result<Option<property::Handle>> {
        Ok(self.property(connector, name)?.map(|(id, _, _)| id))
    }

    fn set_connector_property(
        &self,
        connector: connector::Handle,
        property: property::Handle,
        value: u64,
    ) -> io::Result<()> {
        self.fd.set_property(connector, property, value)
    }

    fn edid(&self, connector: connector::Handle) -> io::Result<Option<Vec<u8>>> {
        let Some((_, info, value)) = self.property(connector, "EDID")? else {
            return Ok(None);
        };

        match info.value_type().convert_value(value) {
            // A blob id of 0 means the monitor didn't provide one
            property::Value::Blob(0) => {
                debug!(?connector, "No EDID data available");
                Ok(None)
            }
            property::Value::Blob(blob) => self.fd.get_property_blob(blob).map(Some),
            other => {
                warn!(?connector, "EDID property has unexpected type: {other:?}");
                Ok(None)
            }
        }
    }

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        framebuffer: Option<framebuffer::Handle>,
        position: (u32, u32),
        connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> io::Result<()> {
        match self.strategy {
            ModesetStrategy::Legacy => match (framebuffer, mode) {
                (Some(fb), Some(mode)) => {
                    self.fd
                        .set_crtc(crtc, Some(fb), position, connectors, Some(mode))
                }
                // Disabling must not reference connectors or a mode
                _ => self.fd.set_crtc(crtc, None, (0, 0), &[], None),
            },
            ModesetStrategy::Atomic => {
                self.atomic_set_crtc(crtc, framebuffer, position, connectors, mode)
            }
        }
    }

    fn page_flip(&self, crtc: crtc::Handle, framebuffer: framebuffer::Handle) -> io::Result<()> {
        match self.strategy {
            ModesetStrategy::Legacy => {
                self.fd
                    .page_flip(crtc, framebuffer, PageFlipFlags::EVENT, None)
            }
            ModesetStrategy::Atomic => self.atomic_page_flip(crtc, framebuffer),
        }
    }

    fn wait_for_events(&self) -> io::Result<()> {
        let mut pollfd = libc::pollfd {
            fd: self.fd.as_fd().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        // SAFETY: `pollfd` is a valid, initialized pollfd and we pass a count of 1.
        let ret = unsafe { libc::poll(&mut pollfd, 1, -1) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        if pollfd.revents & (libc::POLLERR | libc::POLLNVAL | libc::POLLHUP) != 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        Ok(())
    }

    fn receive_events(&self) -> io::Result<Vec<FlipEvent>> {
        Ok(self
            .fd
            .receive_events()?
            .filter_map(|event| match event {
                Event::PageFlip(event) => Some(FlipEvent {
                    crtc: event.crtc,
                    sequence: event.frame,
                    timestamp: event.duration,
                }),
                _ => None,
            })
            .collect())
    }

    fn cursor_size(&self) -> (u32, u32) {
        self.cursor_size
    }

    fn set_cursor(&self, crtc: crtc::Handle, cursor: Option<CursorPlane>) -> io::Result<()> {
        let bo = cursor.map(CursorBo);
        #[allow(deprecated)]
        self.fd.set_cursor(crtc, bo.as_ref())
    }

    fn move_cursor(&self, crtc: crtc::Handle, position: (i32, i32)) -> io::Result<()> {
        #[allow(deprecated)]
        self.fd.move_cursor(crtc, position)
    }

    fn set_gamma(
        &self,
        crtc: crtc::Handle,
        red: &[u16],
        green: &[u16],
        blue: &[u16],
    ) -> io::Result<()> {
        self.fd.set_gamma(crtc, red, green, blue)
    }

    fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<framebuffer::Handle> {
        self.fd
            .add_planar_framebuffer(&SinglePlane(desc), FbCmd2Flags::empty())
    }

    fn destroy_framebuffer(&self, framebuffer: framebuffer::Handle) -> io::Result<()> {
        self.fd.destroy_framebuffer(framebuffer)
    }

    fn create_dumb_buffer(
        &self,
        size: (u32, u32),
        format: DrmFourcc,
    ) -> io::Result<DumbAllocation> {
        let buffer = self.fd.create_dumb_buffer(size, format, 32)?;
        let allocation = DumbAllocation {
            handle: buffer.handle(),
            size: buffer.size(),
            pitch: buffer.pitch(),
        };
        self.dumb_buffers
            .lock()
            .unwrap()
            .insert(allocation.handle, buffer);
        Ok(allocation)
    }

    fn write_dumb_buffer(&self, handle: buffer::Handle, data: &[u8]) -> io::Result<()> {
        let mut buffers = self.dumb_buffers.lock().unwrap();
        let buffer = buffers
            .get_mut(&handle)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;

        let mut mapping = self.fd.map_dumb_buffer(buffer)?;
        let bytes: &mut [u8] = mapping.as_mut();
        let len = data.len().min(bytes.len());
        bytes[..len].copy_from_slice(&data[..len]);
        Ok(())
    }

    fn destroy_dumb_buffer(&self, handle: buffer::Handle) -> io::Result<()> {
        let buffer = self
            .dumb_buffers
            .lock()
            .unwrap()
            .remove(&handle)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        self.fd.destroy_dumb_buffer(buffer)
    }

    fn acquire_master(&self) -> io::Result<()> {
        self.fd.acquire_master_lock()
    }

    fn release_master(&self) -> io::Result<()> {
        self.fd.release_master_lock()
    }
}
