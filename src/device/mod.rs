//! The device facade: one emulated accelerator card.
//!
//! A [`Device`] owns the per-device bookkeeping (bank allocators, buffer
//! registry, streaming queue tracker) and the lazily established session
//! to the device process. One state lock serializes every channel-using
//! operation; the peer cannot multiplex, so at most one request is in
//! flight per device. A second, narrower lock covers only session
//! establishment.

pub mod bo;
pub mod queue;

pub use bo::{BoRegistry, BufferObject, ExportToken, ExportedMapping, HostBacking};
pub use queue::{Completion, QueueManager, StreamingRequest};

use crate::config::Config;
use crate::container::{
    parse_connectivity, parse_mem_topology, ArgFlowMap, Container, MemKind, SectionKind,
};
use crate::error::{ShimError, ShimResult};
use crate::memory::{bank::ALLOC_ALIGN, DeviceMemory, MemoryBank};
use crate::protocol::{calls, Transport};
use crate::session::{LoopbackTransport, Session, SpawnOptions};
use crate::utils::{align_up, unique_path};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Upper half of a flow id selects the owning kernel instance.
const INSTANCE_MASK: u64 = 0xFFFF_0000;

/// Capacity snapshot reported by [`Device::device_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub memory_size: u64,
    pub memory_free: u64,
    pub bank_count: u32,
}

/// Progress of a binary-image load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    /// Container accepted, bitstream and side sections extracted.
    BitstreamExtracted,
    /// Per-instance streaming-argument routing delivered to the peer.
    InstancesConfigured,
    /// Peer acknowledged bitstream delivery.
    Loaded,
}

struct DeviceState {
    memory: DeviceMemory,
    registry: BoRegistry,
    queues: QueueManager,
    session: Option<Session>,
    /// Transport injected at open time, consumed by the first operation
    /// that needs the peer.
    pending_transport: Option<Box<dyn Transport>>,
    load_state: LoadState,
    /// Set when the last accepted container carried a debug-data section.
    debug_binary: bool,
    device_dir: PathBuf,
}

/// One open emulated device.
pub struct Device {
    index: u32,
    config: Config,
    state: Mutex<DeviceState>,
    spawn_lock: Mutex<()>,
}

impl Device {
    /// Opens device `index` with the given bank list, reading runtime
    /// options from the environment.
    #[must_use]
    pub fn open(index: u32, banks: &[MemoryBank]) -> Self {
        Self::open_with_config(index, banks, Config::from_env())
    }

    #[must_use]
    pub fn open_with_config(index: u32, banks: &[MemoryBank], config: Config) -> Self {
        let device_dir = unique_path(
            &std::env::temp_dir().join(format!("swemu_{}_device_{index}", std::process::id())),
        );
        Self {
            index,
            config,
            state: Mutex::new(DeviceState {
                memory: DeviceMemory::new(banks),
                registry: BoRegistry::default(),
                queues: QueueManager::default(),
                session: None,
                pending_transport: None,
                load_state: LoadState::Unloaded,
                debug_binary: false,
                device_dir,
            }),
            spawn_lock: Mutex::new(()),
        }
    }

    /// Opens a device over an already-connected transport instead of
    /// spawning anything. The test-suite's entry point.
    #[must_use]
    pub fn open_with_transport(
        index: u32,
        banks: &[MemoryBank],
        transport: Box<dyn Transport>,
        device_dir: PathBuf,
        config: Config,
    ) -> Self {
        let device = Self::open_with_config(index, banks, config);
        {
            let mut st = device.state();
            st.pending_transport = Some(transport);
            st.device_dir = device_dir;
        }
        device
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Establishes the session on first use.
    fn ensure_session(&self, st: &mut DeviceState) -> ShimResult<()> {
        if st.session.is_some() {
            return Ok(());
        }
        let _spawn = self
            .spawn_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let session = if let Some(transport) = st.pending_transport.take() {
            Session::with_transport(transport, st.device_dir.clone())?
        } else if self.config.dont_run || self.config.simulator.is_none() {
            if self.config.simulator.is_none() && !self.config.dont_run {
                log::warn!("no simulator configured; using in-process loopback peer");
            }
            let (transport, _) = LoopbackTransport::new();
            Session::with_transport(Box::new(transport), st.device_dir.clone())?
        } else {
            let opts = SpawnOptions {
                simulator: self.config.simulator.clone().unwrap_or_default(),
                device_dir: st.device_dir.clone(),
                session_id: self.index,
                debug: self.config.kernel_debug && st.debug_binary,
            };
            Session::spawn(&opts)?
        };
        st.session = Some(session);
        Ok(())
    }

    #[must_use]
    pub fn load_state(&self) -> LoadState {
        self.state().load_state
    }

    #[must_use]
    pub fn memory_available(&self) -> u64 {
        self.state().memory.available()
    }

    /// Capacity snapshot across all banks.
    #[must_use]
    pub fn device_info(&self) -> DeviceInfo {
        let st = self.state();
        DeviceInfo {
            memory_size: st.memory.capacity(),
            memory_free: st.memory.available(),
            bank_count: st.memory.bank_count(),
        }
    }

    /// True once a session to the peer exists. Used to verify that
    /// rejected operations had no channel side effects.
    #[must_use]
    pub fn has_session(&self) -> bool {
        self.state().session.is_some()
    }

    // ===========================================================================================
    // Buffer objects
    // ===========================================================================================

    /// Allocates a buffer in the selected bank and registers it with the
    /// peer. A zero size is normalized to one allocation unit.
    ///
    /// # Errors
    /// `OutOfMemory` when the bank has no hole large enough; the peer is
    /// not contacted in that case.
    pub fn create_bo(&self, size: u64, bank: u32, no_host_memory: bool) -> ShimResult<u32> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        Self::create_bo_locked(&mut st, size, bank, no_host_memory, HostBacking::None)
    }

    /// Like [`create_bo`](Self::create_bo), wrapping a caller-owned host
    /// pointer. The registry never frees the supplied memory.
    ///
    /// # Errors
    /// `OutOfMemory` when the bank has no hole large enough.
    ///
    /// # Safety
    /// `host` must stay valid for `size` bytes for the buffer's lifetime.
    pub unsafe fn create_bo_userptr(&self, host: *mut u8, size: u64, bank: u32) -> ShimResult<u32> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        Self::create_bo_locked(&mut st, size, bank, false, HostBacking::User(host))
    }

    fn create_bo_locked(
        st: &mut DeviceState,
        size: u64,
        bank: u32,
        no_host_memory: bool,
        host: HostBacking,
    ) -> ShimResult<u32> {
        let effective = align_up(size.max(1), ALLOC_ALIGN);
        let base = st
            .memory
            .alloc(bank, effective)
            .ok_or(ShimError::OutOfMemory {
                requested: effective,
                available: st.memory.bank_available(bank),
            })?;

        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        if let Err(e) = session.rpc(|t| calls::alloc_buffer(t, base, effective, no_host_memory)) {
            st.memory.free(base);
            return Err(e);
        }
        Ok(st.registry.insert(BufferObject {
            size: effective,
            base,
            bank,
            no_host_memory,
            host,
            imported_from: None,
        }))
    }

    /// Frees a buffer: region back to its bank, record out of the
    /// registry, host mapping released, peer notified.
    ///
    /// # Errors
    /// `BadHandle` for an unknown handle; the registry is untouched.
    pub fn free_bo(&self, handle: u32) -> ShimResult<()> {
        let mut st = self.state();
        let bo = st.registry.remove(handle)?;
        st.memory.free(bo.base);
        if let Some(session) = st.session.as_mut() {
            session.rpc(|t| calls::free_buffer(t, bo.base))?;
        }
        Ok(())
    }

    /// Device base address of a buffer.
    ///
    /// # Errors
    /// `BadHandle` for an unknown handle.
    pub fn bo_address(&self, handle: u32) -> ShimResult<u64> {
        Ok(self.state().registry.get(handle)?.base)
    }

    /// Effective (normalized) size of a buffer.
    ///
    /// # Errors
    /// `BadHandle` for an unknown handle.
    pub fn bo_size(&self, handle: u32) -> ShimResult<u64> {
        Ok(self.state().registry.get(handle)?.size)
    }

    /// Host view of a buffer, created lazily on first map.
    ///
    /// The returned pointer stays valid until the buffer is freed or the
    /// device closes.
    ///
    /// # Errors
    /// `BadHandle` for an unknown handle.
    pub fn map_bo(&self, handle: u32) -> ShimResult<*mut u8> {
        let mut st = self.state();
        let bo = st.registry.get_mut(handle)?;
        match &mut bo.host {
            HostBacking::None => {
                let buf = vec![0u8; bo.size as usize].into_boxed_slice();
                bo.host = HostBacking::Owned(buf);
                match &mut bo.host {
                    HostBacking::Owned(buf) => Ok(buf.as_mut_ptr()),
                    _ => unreachable!(),
                }
            }
            HostBacking::User(ptr) => Ok(*ptr),
            HostBacking::Owned(buf) => Ok(buf.as_mut_ptr()),
            HostBacking::Exported(map) => Ok(map.as_mut_ptr()),
        }
    }

    /// Releases a buffer's host view. An owned or exported mapping is
    /// unmapped here, exactly once; a caller-owned pointer is merely
    /// forgotten. The device region is unaffected.
    ///
    /// # Errors
    /// `BadHandle` for an unknown handle.
    pub fn unmap_bo(&self, handle: u32) -> ShimResult<()> {
        let mut st = self.state();
        let bo = st.registry.get_mut(handle)?;
        bo.host = HostBacking::None;
        Ok(())
    }

    // ===========================================================================================
    // Transfers
    // ===========================================================================================

    /// Copies host bytes into a buffer at `offset`, chunked to the
    /// configured packet size. Returns the bytes transferred.
    ///
    /// # Errors
    /// `ShortTransfer` when the range exceeds the buffer or the peer
    /// completes a chunk partially; remaining chunks are not sent.
    pub fn write_bo(&self, handle: u32, src: &[u8], offset: u64) -> ShimResult<u64> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let st = &mut *st;
        let bo = st.registry.get(handle)?;
        Self::check_range(bo.size, offset, src.len() as u64)?;
        let dst = bo.base + offset;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;

        let mut completed: u64 = 0;
        for chunk in src.chunks(self.config.packet_size as usize) {
            let n = session.rpc(|t| calls::write_mem(t, dst + completed, chunk))?;
            completed += n;
            if n < chunk.len() as u64 {
                return Err(ShimError::ShortTransfer {
                    completed,
                    requested: src.len() as u64,
                });
            }
        }
        Ok(completed)
    }

    /// Copies device bytes out of a buffer at `offset` into `dst`.
    /// Returns the bytes transferred.
    ///
    /// # Errors
    /// `ShortTransfer` when the range exceeds the buffer or the peer
    /// returns a partial chunk; remaining chunks are not requested.
    pub fn read_bo(&self, handle: u32, dst: &mut [u8], offset: u64) -> ShimResult<u64> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let st = &mut *st;
        let bo = st.registry.get(handle)?;
        Self::check_range(bo.size, offset, dst.len() as u64)?;
        let src = bo.base + offset;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;

        let packet = self.config.packet_size as usize;
        let mut completed: usize = 0;
        while completed < dst.len() {
            let want = packet.min(dst.len() - completed);
            let bytes = session.rpc(|t| calls::read_mem(t, src + completed as u64, want as u64))?;
            if bytes.len() > want {
                return Err(ShimError::Protocol(format!(
                    "peer returned {} bytes for a {want}-byte read",
                    bytes.len()
                )));
            }
            dst[completed..completed + bytes.len()].copy_from_slice(&bytes);
            completed += bytes.len();
            if bytes.len() < want {
                return Err(ShimError::ShortTransfer {
                    completed: completed as u64,
                    requested: dst.len() as u64,
                });
            }
        }
        Ok(completed as u64)
    }

    /// Pushes `size` bytes of the buffer's host view to the device.
    ///
    /// # Errors
    /// `Protocol` when the buffer has no host view yet.
    pub fn sync_to_device(&self, handle: u32, size: u64, offset: u64) -> ShimResult<u64> {
        let data = {
            let mut st = self.state();
            let bo = st.registry.get_mut(handle)?;
            Self::check_range(bo.size, offset, size)?;
            let bytes = unsafe { bo.host_bytes_mut() }
                .ok_or_else(|| ShimError::Protocol("buffer has no host mapping".into()))?;
            bytes[offset as usize..(offset + size) as usize].to_vec()
        };
        self.write_bo(handle, &data, offset)
    }

    /// Pulls `size` bytes from the device into the buffer's host view.
    ///
    /// # Errors
    /// `Protocol` when the buffer has no host view yet.
    pub fn sync_from_device(&self, handle: u32, size: u64, offset: u64) -> ShimResult<u64> {
        let mut data = vec![0u8; size as usize];
        let n = self.read_bo(handle, &mut data, offset)?;
        let mut st = self.state();
        let bo = st.registry.get_mut(handle)?;
        let bytes = unsafe { bo.host_bytes_mut() }
            .ok_or_else(|| ShimError::Protocol("buffer has no host mapping".into()))?;
        bytes[offset as usize..(offset + size) as usize].copy_from_slice(&data);
        Ok(n)
    }

    /// Buffer-to-buffer copy. A copy into an imported buffer targets the
    /// origin's shared file on the peer side, not the local region.
    ///
    /// # Errors
    /// `BadHandle`, `ShortTransfer`, or transport errors.
    pub fn copy_bo(
        &self,
        dst: u32,
        src: u32,
        size: u64,
        dst_offset: u64,
        src_offset: u64,
    ) -> ShimResult<()> {
        let (src_base, dst_file) = {
            let mut st = self.state();
            self.ensure_session(&mut st)?;
            let src_bo = st.registry.get(src)?;
            Self::check_range(src_bo.size, src_offset, size)?;
            let dst_bo = st.registry.get(dst)?;
            Self::check_range(dst_bo.size, dst_offset, size)?;
            (src_bo.base, dst_bo.imported_from.clone())
        };

        if let Some(path) = dst_file {
            let mut st = self.state();
            let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
            let path = path.to_string_lossy();
            session.rpc(|t| calls::copy_buffer(t, src_base, &path, size, src_offset, dst_offset))
        } else {
            let mut staging = vec![0u8; size as usize];
            self.read_bo(src, &mut staging, src_offset)?;
            self.write_bo(dst, &staging, dst_offset)?;
            Ok(())
        }
    }

    fn check_range(bo_size: u64, offset: u64, len: u64) -> ShimResult<()> {
        if offset.checked_add(len).is_none_or(|end| end > bo_size) {
            return Err(ShimError::ShortTransfer {
                completed: 0,
                requested: len,
            });
        }
        Ok(())
    }

    // ===========================================================================================
    // Control registers
    // ===========================================================================================

    /// # Errors
    /// Transport errors or a peer NAK.
    pub fn write_register(&self, offset: u64, data: &[u8]) -> ShimResult<()> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        session.rpc(|t| calls::write_register(t, offset, data))
    }

    /// # Errors
    /// Transport errors or a peer NAK.
    pub fn read_register(&self, offset: u64, len: u64) -> ShimResult<Vec<u8>> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        session.rpc(|t| calls::read_register(t, offset, len))
    }

    // ===========================================================================================
    // Binary load
    // ===========================================================================================

    /// Loads a binary container image.
    ///
    /// The image is fully validated before any session is established:
    /// a rejected container leaves the device without channel or process
    /// side effects. On success the device walks
    /// `Unloaded -> BitstreamExtracted -> InstancesConfigured -> Loaded`,
    /// with `Loaded` entered only after the peer acknowledges bitstream
    /// delivery.
    ///
    /// # Errors
    /// `InvalidContainer` for a bad magic, a missing bitstream section,
    /// or a connectivity index out of range; transport errors afterwards.
    pub fn load_binary(&self, image: &[u8]) -> ShimResult<()> {
        let container = Container::parse(image)?;
        let bitstream = container
            .section(SectionKind::Bitstream)
            .ok_or_else(|| ShimError::InvalidContainer("no bitstream section".into()))?;
        let routing = Self::instance_routing(&container)?;

        let mut st = self.state();
        st.load_state = LoadState::Unloaded;
        st.debug_binary = container.section(SectionKind::DebugData).is_some();
        self.ensure_session(&mut st)?;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;

        let binary_dir = session.next_binary_dir()?;
        if let Some(meta) = container.section(SectionKind::Metadata) {
            fs::write(unique_path(&binary_dir.join("metadata.bin")), meta)?;
        }
        if let Some(emu) = container.section(SectionKind::EmulationData) {
            fs::write(unique_path(&binary_dir.join("emulation_data.bin")), emu)?;
        }
        st.load_state = LoadState::BitstreamExtracted;

        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        for (base, args) in &routing {
            session.rpc(|t| calls::setup_instance(t, *base, args))?;
        }
        st.load_state = LoadState::InstancesConfigured;

        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        let device_dir = session.device_dir().to_string_lossy().into_owned();
        let binary_dir_str = binary_dir.to_string_lossy().into_owned();
        session.rpc(|t| {
            calls::load_bitstream(
                t,
                &device_dir,
                &binary_dir_str,
                bitstream,
                self.config.kernel_debug,
            )
        })?;
        st.load_state = LoadState::Loaded;
        log::info!(
            "device {}: binary loaded into {}",
            self.index,
            binary_dir.display()
        );
        Ok(())
    }

    /// Groups streaming argument bindings by kernel instance, one entry
    /// per distinct instance base address.
    fn instance_routing(container: &Container) -> ShimResult<BTreeMap<u64, ArgFlowMap>> {
        let mut routing: BTreeMap<u64, ArgFlowMap> = BTreeMap::new();
        let (Some(conn_bytes), Some(topo_bytes)) = (
            container.section(SectionKind::Connectivity),
            container.section(SectionKind::MemTopology),
        ) else {
            return Ok(routing);
        };

        let topology = parse_mem_topology(topo_bytes)?;
        for conn in parse_connectivity(conn_bytes)? {
            let entry = topology.get(conn.mem_index as usize).ok_or_else(|| {
                ShimError::InvalidContainer(format!(
                    "connectivity references memory entry {} out of range",
                    conn.mem_index
                ))
            })?;
            if entry.kind != MemKind::Streaming {
                continue;
            }
            let base = entry.flow_id & INSTANCE_MASK;
            let flow = entry.flow_id & !INSTANCE_MASK;
            routing
                .entry(base)
                .or_default()
                .insert(conn.arg_index, (flow, entry.tag.clone()));
        }
        Ok(routing)
    }

    // ===========================================================================================
    // Export / import
    // ===========================================================================================

    /// Converts a buffer into a file-backed shared mapping and returns
    /// its shareable identity. Idempotent for an already-exported buffer.
    ///
    /// # Errors
    /// `BadHandle`, `Io` on mapping failure, or a peer NAK.
    pub fn export_bo(&self, handle: u32) -> ShimResult<ExportToken> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let st = &mut *st;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        let bo = st.registry.get_mut(handle)?;

        if let HostBacking::Exported(map) = &bo.host {
            return Ok(ExportToken {
                path: map.path().to_path_buf(),
                size: bo.size,
            });
        }

        let path = unique_path(&session.device_dir().join(format!("bo{handle}.export")));
        let mapping = ExportedMapping::create(&path, bo.size)?;
        // Carry over host bytes already staged before the export.
        if let Some(prior) = unsafe { bo.host_bytes_mut() } {
            unsafe { mapping.bytes_mut() }.copy_from_slice(prior);
        }
        let (base, size) = (bo.base, bo.size);
        let path_str = path.to_string_lossy().into_owned();
        session.rpc(|t| calls::export_buffer(t, base, &path_str, size))?;
        bo.host = HostBacking::Exported(mapping);
        Ok(ExportToken {
            path,
            size: bo.size,
        })
    }

    /// Opens another session's export as a fresh local buffer. The origin
    /// file is recorded so copies into this buffer target the shared file.
    ///
    /// # Errors
    /// `Io` when the export file is absent, `OutOfMemory`, or a peer NAK.
    pub fn import_bo(&self, token: &ExportToken) -> ShimResult<u32> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let st = &mut *st;

        let effective = align_up(token.size.max(1), ALLOC_ALIGN);
        let base = st
            .memory
            .alloc(0, effective)
            .ok_or(ShimError::OutOfMemory {
                requested: effective,
                available: st.memory.bank_available(0),
            })?;

        let mapping = match ExportedMapping::open(&token.path, token.size) {
            Ok(m) => m,
            Err(e) => {
                st.memory.free(base);
                return Err(e);
            }
        };
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        let path_str = token.path.to_string_lossy().into_owned();
        let result = session
            .rpc(|t| calls::alloc_buffer(t, base, effective, false))
            .and_then(|()| {
                session.rpc(|t| calls::import_buffer(t, &path_str, base, token.size))
            });
        if let Err(e) = result {
            st.memory.free(base);
            return Err(e);
        }

        Ok(st.registry.insert(BufferObject {
            size: token.size,
            base,
            bank: 0,
            no_host_memory: false,
            host: HostBacking::Exported(mapping),
            imported_from: Some(token.path.clone()),
        }))
    }

    // ===========================================================================================
    // Streaming queues
    // ===========================================================================================

    /// # Errors
    /// Transport errors or a null handle from the peer.
    pub fn create_stream(&self, write: bool) -> ShimResult<u64> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        session.rpc(|t| calls::create_queue(t, write))
    }

    /// # Errors
    /// Transport errors or a peer NAK for an unknown queue.
    pub fn destroy_stream(&self, queue: u64) -> ShimResult<()> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        session.rpc(|t| calls::destroy_queue(t, queue))
    }

    /// Blocking stream write. Buffers are submitted in order under one
    /// request, with the end-of-transfer marker on the last one. Returns
    /// the total bytes accepted by the peer.
    ///
    /// # Errors
    /// Transport errors or a peer NAK; later buffers are not submitted.
    pub fn stream_write(&self, queue: u64, buffers: &[&[u8]], eot: bool) -> ShimResult<u64> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        let mut total = 0;
        for (i, data) in buffers.iter().enumerate() {
            let last = eot && i + 1 == buffers.len();
            total += session.rpc(|t| calls::write_queue(t, queue, 0, data, last))?;
        }
        Ok(total)
    }

    /// Non-blocking stream write. All buffers share one request tag; the
    /// completion, observed later through
    /// [`poll_completions`](Self::poll_completions), carries `context`
    /// and covers every span.
    ///
    /// # Errors
    /// Transport errors or a peer NAK; nothing is tracked on failure.
    pub fn stream_write_async(
        &self,
        queue: u64,
        buffers: &[&[u8]],
        eot: bool,
        context: u64,
    ) -> ShimResult<()> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let st = &mut *st;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        let seq = session.next_request();
        let mut spans = BTreeMap::new();
        for (i, data) in buffers.iter().enumerate() {
            let last = eot && i + 1 == buffers.len();
            session.rpc(|t| calls::write_queue(t, queue, seq, data, last))?;
            spans.insert(data.as_ptr() as u64, data.len() as u64);
        }
        st.queues.track(StreamingRequest {
            seq,
            context,
            spans,
        });
        Ok(())
    }

    /// Blocking stream read, filling each buffer in order. Returns the
    /// total bytes received, which may be fewer than requested if the
    /// queue drains first.
    ///
    /// # Errors
    /// Transport errors or a peer NAK.
    pub fn stream_read(&self, queue: u64, buffers: &mut [&mut [u8]], eot: bool) -> ShimResult<u64> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        let mut total = 0;
        let count = buffers.len();
        for (i, dst) in buffers.iter_mut().enumerate() {
            let last = eot && i + 1 == count;
            total += Self::read_queue_into(session, queue, 0, dst, last)?;
        }
        Ok(total)
    }

    /// Non-blocking stream read; data lands in the buffers and one
    /// completion covering all of them is reported later with `context`.
    ///
    /// # Errors
    /// Transport errors or a peer NAK; nothing is tracked on failure.
    pub fn stream_read_async(
        &self,
        queue: u64,
        buffers: &mut [&mut [u8]],
        eot: bool,
        context: u64,
    ) -> ShimResult<()> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let st = &mut *st;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        let seq = session.next_request();
        let mut spans = BTreeMap::new();
        let count = buffers.len();
        for (i, dst) in buffers.iter_mut().enumerate() {
            let last = eot && i + 1 == count;
            Self::read_queue_into(session, queue, seq, dst, last)?;
            spans.insert(dst.as_ptr() as u64, dst.len() as u64);
        }
        st.queues.track(StreamingRequest {
            seq,
            context,
            spans,
        });
        Ok(())
    }

    /// One queue read, bounded by the destination. A peer answering with
    /// more than asked for is a protocol violation, not a panic.
    fn read_queue_into(
        session: &mut Session,
        queue: u64,
        seq: u64,
        dst: &mut [u8],
        eot: bool,
    ) -> ShimResult<u64> {
        let len = dst.len() as u64;
        let bytes = session.rpc(|t| calls::read_queue(t, queue, seq, len, eot))?;
        if bytes.len() > dst.len() {
            return Err(ShimError::Protocol(format!(
                "peer returned {} bytes for a {}-byte queue read",
                bytes.len(),
                dst.len()
            )));
        }
        dst[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len() as u64)
    }

    /// Collects between `min` and `max` streaming completions, bounded
    /// by `timeout`. Returns early with whatever completed when the
    /// timeout elapses.
    ///
    /// # Errors
    /// Transport errors abort the poll.
    pub fn poll_completions(
        &self,
        min: usize,
        max: usize,
        timeout: Duration,
    ) -> ShimResult<Vec<Completion>> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let st = &mut *st;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        let queues = &mut st.queues;
        session.rpc(|t| queues.poll(t, min, max, timeout))
    }

    // ===========================================================================================
    // Graph control
    // ===========================================================================================

    /// Initializes the named dataflow graph on the peer under the given
    /// handle.
    ///
    /// # Errors
    /// Transport errors or a peer NAK for an unknown graph name.
    pub fn graph_init(&self, graph: u64, name: &str) -> ShimResult<()> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        session.rpc(|t| calls::graph_init(t, graph, name))
    }

    /// Runs a graph for `iterations` cycles; zero means run until ended.
    ///
    /// # Errors
    /// Transport errors or a peer NAK.
    pub fn graph_run(&self, graph: u64, iterations: u32) -> ShimResult<()> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        session.rpc(|t| calls::graph_run(t, graph, iterations))
    }

    /// Blocks until the graph's current run finishes.
    ///
    /// # Errors
    /// Transport errors or a peer NAK.
    pub fn graph_wait(&self, graph: u64) -> ShimResult<()> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        session.rpc(|t| calls::graph_wait(t, graph))
    }

    /// Tears a graph down on the peer.
    ///
    /// # Errors
    /// Transport errors or a peer NAK.
    pub fn graph_end(&self, graph: u64) -> ShimResult<()> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        session.rpc(|t| calls::graph_end(t, graph))
    }

    /// Updates a runtime parameter on a graph port.
    ///
    /// # Errors
    /// Transport errors or a peer NAK.
    pub fn graph_update_rtp(&self, graph: u64, port: &str, value: &[u8]) -> ShimResult<()> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        session.rpc(|t| calls::graph_update_rtp(t, graph, port, value))
    }

    /// Reads back a runtime parameter from a graph port.
    ///
    /// # Errors
    /// Transport errors, a peer NAK, or `Protocol` when the peer answers
    /// with more bytes than the parameter holds.
    pub fn graph_read_rtp(&self, graph: u64, port: &str, len: u64) -> ShimResult<Vec<u8>> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        let bytes = session.rpc(|t| calls::graph_read_rtp(t, graph, port, len))?;
        if bytes.len() as u64 > len {
            return Err(ShimError::Protocol(format!(
                "peer returned {} bytes for a {len}-byte parameter read",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Submits a command buffer for execution: the handle is validated
    /// locally, then its device address goes to the peer's scheduler.
    ///
    /// # Errors
    /// `BadHandle` for an unknown buffer; transport errors or a peer NAK
    /// afterwards.
    pub fn exec_buf(&self, handle: u32) -> ShimResult<()> {
        let mut st = self.state();
        self.ensure_session(&mut st)?;
        let st = &mut *st;
        let base = st.registry.get(handle)?.base;
        let session = st.session.as_mut().ok_or(ShimError::ChannelClosed)?;
        session.rpc(|t| calls::exec_buf(t, base))
    }

    /// Waits for command completions. Execution here is synchronous at
    /// submit time, so there is always at least one completion to report.
    #[must_use]
    pub fn exec_wait(&self, _timeout_ms: u32) -> u32 {
        1
    }

    // ===========================================================================================
    // Teardown
    // ===========================================================================================

    /// Orderly close: host mappings released, regions returned, peer told
    /// to exit and reaped, run directory removed unless configured to be
    /// kept.
    ///
    /// # Errors
    /// `Io` when run-directory cleanup fails; the device is closed
    /// regardless.
    pub fn close(&self) -> ShimResult<()> {
        let mut st = self.state();
        let drained: Vec<_> = st.registry.drain().collect();
        for (_, bo) in drained {
            st.memory.free(bo.base);
            // Mappings unmap on drop here.
        }
        st.load_state = LoadState::Unloaded;
        if let Some(session) = st.session.take() {
            session.shutdown(self.config.keep_rundir)?;
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let open = self.state().session.is_some();
        if open {
            if let Err(e) = self.close() {
                log::warn!("device {} close on drop failed: {e}", self.index);
            }
        }
    }
}
