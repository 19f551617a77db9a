//! In-process stand-in for the device process.
//!
//! Used when `SWEMU_DONT_RUN` is set and throughout the test-suite. The
//! peer keeps a byte-accurate model of device memory, control registers
//! and streaming queues, and answers every protocol call synchronously,
//! so the shim's bookkeeping can be exercised without forking.

use crate::error::{ShimError, ShimResult};
use crate::protocol::codec::{Message, Reader};
use crate::protocol::Transport;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

struct Region {
    base: u64,
    data: Vec<u8>,
    /// Backing file of an exported or imported buffer; kept in sync on
    /// every write so the sharing side observes device-side placement.
    export_path: Option<PathBuf>,
}

#[derive(Default)]
struct Graph {
    name: String,
    running: bool,
    /// port -> last written runtime-parameter bytes.
    rtps: HashMap<String, Vec<u8>>,
}

/// The simulated peer state. Tests hold an `Arc<Mutex<SimPeer>>` handle
/// to inspect side effects and to stage completion behavior.
#[derive(Default)]
pub struct SimPeer {
    regions: Vec<Region>,
    registers: HashMap<u64, u32>,
    queues: HashMap<u64, VecDeque<u8>>,
    next_queue: u64,
    graphs: HashMap<u64, Graph>,
    /// seq -> bytes processed, for observed-complete requests.
    completions: HashMap<u64, u64>,
    /// Requests parked while `hold` is set.
    held: HashMap<u64, u64>,
    hold: bool,
    /// Counters inspected by tests: a rejected container must leave all
    /// of these untouched.
    pub bitstream_loads: u32,
    pub instance_configs: Vec<(u64, Vec<(u64, u64, String)>)>,
    /// Device addresses of command buffers handed to the scheduler.
    pub exec_submissions: Vec<u64>,
    pub closed: bool,
}

impl SimPeer {
    /// Park subsequently submitted streaming requests instead of
    /// completing them immediately.
    pub fn hold_completions(&mut self, hold: bool) {
        self.hold = hold;
    }

    /// Name a graph handle was initialized with, if it is live.
    #[must_use]
    pub fn graph_name(&self, handle: u64) -> Option<&str> {
        self.graphs.get(&handle).map(|g| g.name.as_str())
    }

    /// Release one parked request so the next poll observes it complete.
    pub fn release_completion(&mut self, seq: u64) {
        if let Some(nbytes) = self.held.remove(&seq) {
            *self.completions.entry(seq).or_insert(0) += nbytes;
        }
    }

    fn region_mut(&mut self, addr: u64) -> Option<&mut Region> {
        self.regions
            .iter_mut()
            .find(|r| addr >= r.base && addr < r.base + r.data.len() as u64)
    }

    fn note_completion(&mut self, seq: u64, nbytes: u64) {
        if seq == 0 {
            return;
        }
        if self.hold {
            *self.held.entry(seq).or_insert(0) += nbytes;
        } else {
            *self.completions.entry(seq).or_insert(0) += nbytes;
        }
    }

    fn sync_export(region: &Region) {
        if let Some(path) = &region.export_path {
            if let Err(e) = fs::write(path, &region.data) {
                log::warn!("loopback: export sync to {} failed: {e}", path.display());
            }
        }
    }

    /// Executes one decoded request and produces the response payload.
    fn handle(&mut self, frame: &[u8]) -> ShimResult<Vec<u8>> {
        let mut rd = Reader::new(frame);
        let call = rd.call_name()?.to_string();
        let mut resp = Message::response(true);
        match call.as_str() {
            "allocBuffer" => {
                let base = rd.u64()?;
                let size = rd.u64()?;
                let _no_host_memory = rd.bool()?;
                self.regions.push(Region {
                    base,
                    data: vec![0; size as usize],
                    export_path: None,
                });
            }
            "freeBuffer" => {
                let base = rd.u64()?;
                self.regions.retain(|r| r.base != base);
            }
            "writeMem" => {
                let dst = rd.u64()?;
                let data = rd.bytes()?.to_vec();
                let Some(region) = self.region_mut(dst) else {
                    return Ok(Message::response(false).into_frame());
                };
                let at = (dst - region.base) as usize;
                if at + data.len() > region.data.len() {
                    return Ok(Message::response(false).into_frame());
                }
                region.data[at..at + data.len()].copy_from_slice(&data);
                Self::sync_export(region);
                resp.push_u64(data.len() as u64);
            }
            "readMem" => {
                let src = rd.u64()?;
                let len = rd.u64()? as usize;
                let Some(region) = self.region_mut(src) else {
                    return Ok(Message::response(false).into_frame());
                };
                let at = (src - region.base) as usize;
                let end = (at + len).min(region.data.len());
                let bytes = region.data[at..end].to_vec();
                resp.push_bytes(&bytes);
            }
            "writeCtrlReg" => {
                let offset = rd.u64()?;
                let data = rd.bytes()?;
                for (i, word) in data.chunks_exact(4).enumerate() {
                    self.registers.insert(
                        offset + 4 * i as u64,
                        u32::from_le_bytes(word.try_into().unwrap()),
                    );
                }
            }
            "readCtrlReg" => {
                let offset = rd.u64()?;
                let _len = rd.u64()?;
                let word = self.registers.get(&offset).copied().unwrap_or(0);
                resp.push_bytes(&word.to_le_bytes());
            }
            "loadBitstream" => {
                let _device_dir = rd.str()?;
                let _binary_dir = rd.str()?;
                let _image = rd.bytes()?;
                let _verbose = rd.bool()?;
                self.bitstream_loads += 1;
            }
            "setupInstance" => {
                let base = rd.u64()?;
                let count = rd.u32()?;
                let mut args = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let arg = rd.u64()?;
                    let flow = rd.u64()?;
                    let tag = rd.str()?.to_string();
                    args.push((arg, flow, tag));
                }
                self.instance_configs.push((base, args));
            }
            "createQueue" => {
                let _write = rd.bool()?;
                self.next_queue += 1;
                self.queues.insert(self.next_queue, VecDeque::new());
                resp.push_u64(self.next_queue);
            }
            "destroyQueue" => {
                let handle = rd.u64()?;
                if self.queues.remove(&handle).is_none() {
                    return Ok(Message::response(false).into_frame());
                }
            }
            "writeQueue" => {
                let handle = rd.u64()?;
                let seq = rd.u64()?;
                let data = rd.bytes()?.to_vec();
                let _eot = rd.bool()?;
                let Some(queue) = self.queues.get_mut(&handle) else {
                    return Ok(Message::response(false).into_frame());
                };
                queue.extend(data.iter().copied());
                self.note_completion(seq, data.len() as u64);
                resp.push_u64(data.len() as u64);
            }
            "readQueue" => {
                let handle = rd.u64()?;
                let seq = rd.u64()?;
                let len = rd.u64()? as usize;
                let _eot = rd.bool()?;
                let Some(queue) = self.queues.get_mut(&handle) else {
                    return Ok(Message::response(false).into_frame());
                };
                let take = len.min(queue.len());
                let bytes: Vec<u8> = queue.drain(..take).collect();
                self.note_completion(seq, bytes.len() as u64);
                resp.push_bytes(&bytes);
            }
            "pollCompletion" => {
                let seq = rd.u64()?;
                let count = rd.u32()?;
                for _ in 0..count {
                    let _addr = rd.u64()?;
                    let _len = rd.u64()?;
                }
                let nbytes = self.completions.remove(&seq).unwrap_or(0);
                resp.push_u64(nbytes);
            }
            "exportBuffer" => {
                let base = rd.u64()?;
                let path = PathBuf::from(rd.str()?);
                let _size = rd.u64()?;
                let Some(region) = self.region_mut(base) else {
                    return Ok(Message::response(false).into_frame());
                };
                region.export_path = Some(path);
                Self::sync_export(region);
            }
            "importBuffer" => {
                let path = PathBuf::from(rd.str()?);
                let base = rd.u64()?;
                let size = rd.u64()? as usize;
                let mut data = fs::read(&path).map_err(ShimError::Io)?;
                data.resize(size, 0);
                let Some(region) = self.region_mut(base) else {
                    return Ok(Message::response(false).into_frame());
                };
                let n = size.min(region.data.len());
                region.data[..n].copy_from_slice(&data[..n]);
                region.export_path = Some(path);
            }
            "copyBuffer" => {
                let src_base = rd.u64()?;
                let dst_path = PathBuf::from(rd.str()?);
                let size = rd.u64()? as usize;
                let src_off = rd.u64()? as usize;
                let dst_off = rd.u64()? as usize;
                let Some(region) = self.region_mut(src_base) else {
                    return Ok(Message::response(false).into_frame());
                };
                if src_off + size > region.data.len() {
                    return Ok(Message::response(false).into_frame());
                }
                let chunk = region.data[src_off..src_off + size].to_vec();
                let mut file = fs::read(&dst_path).unwrap_or_default();
                if file.len() < dst_off + size {
                    file.resize(dst_off + size, 0);
                }
                file[dst_off..dst_off + size].copy_from_slice(&chunk);
                fs::write(&dst_path, file).map_err(ShimError::Io)?;
            }
            "graphInit" => {
                let handle = rd.u64()?;
                let name = rd.str()?.to_string();
                self.graphs.insert(
                    handle,
                    Graph {
                        name,
                        ..Graph::default()
                    },
                );
            }
            "graphRun" => {
                let handle = rd.u64()?;
                let _iterations = rd.u32()?;
                let Some(graph) = self.graphs.get_mut(&handle) else {
                    return Ok(Message::response(false).into_frame());
                };
                graph.running = true;
            }
            "graphWait" => {
                let handle = rd.u64()?;
                let Some(graph) = self.graphs.get_mut(&handle) else {
                    return Ok(Message::response(false).into_frame());
                };
                graph.running = false;
            }
            "graphEnd" => {
                let handle = rd.u64()?;
                if self.graphs.remove(&handle).is_none() {
                    return Ok(Message::response(false).into_frame());
                }
            }
            "graphUpdateRTP" => {
                let handle = rd.u64()?;
                let port = rd.str()?.to_string();
                let value = rd.bytes()?.to_vec();
                let Some(graph) = self.graphs.get_mut(&handle) else {
                    return Ok(Message::response(false).into_frame());
                };
                graph.rtps.insert(port, value);
            }
            "graphReadRTP" => {
                let handle = rd.u64()?;
                let port = rd.str()?.to_string();
                let len = rd.u64()? as usize;
                let Some(graph) = self.graphs.get(&handle) else {
                    return Ok(Message::response(false).into_frame());
                };
                let mut value = graph.rtps.get(&port).cloned().unwrap_or_default();
                value.truncate(len);
                resp.push_bytes(&value);
            }
            "execBuf" => {
                let base = rd.u64()?;
                if self.region_mut(base).is_none() {
                    return Ok(Message::response(false).into_frame());
                }
                self.exec_submissions.push(base);
            }
            "close" => {
                self.closed = true;
            }
            other => {
                log::warn!("loopback: unknown call {other}");
                return Ok(Message::response(false).into_frame());
            }
        }
        Ok(resp.into_frame())
    }
}

/// Transport that hands each request straight to a [`SimPeer`].
pub struct LoopbackTransport {
    peer: Arc<Mutex<SimPeer>>,
    pending: Option<Vec<u8>>,
}

impl LoopbackTransport {
    /// Returns the transport and a shared handle to the peer model.
    #[must_use]
    pub fn new() -> (Self, Arc<Mutex<SimPeer>>) {
        let peer = Arc::new(Mutex::new(SimPeer::default()));
        (
            Self {
                peer: peer.clone(),
                pending: None,
            },
            peer,
        )
    }
}

impl Transport for LoopbackTransport {
    fn send(&mut self, frame: &[u8]) -> ShimResult<()> {
        let response = self
            .peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle(frame)?;
        self.pending = Some(response);
        Ok(())
    }

    fn recv(&mut self) -> ShimResult<Vec<u8>> {
        self.pending
            .take()
            .ok_or_else(|| ShimError::Protocol("no response pending".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::calls;

    #[test]
    fn memory_calls_round_trip() {
        let (mut t, _peer) = LoopbackTransport::new();
        calls::alloc_buffer(&mut t, 0x1000, 8192, false).unwrap();
        let written = calls::write_mem(&mut t, 0x1000 + 16, b"abcdef").unwrap();
        assert_eq!(written, 6);
        let back = calls::read_mem(&mut t, 0x1000 + 16, 6).unwrap();
        assert_eq!(back, b"abcdef");
    }

    #[test]
    fn writes_outside_any_region_are_nacked() {
        let (mut t, _peer) = LoopbackTransport::new();
        let err = calls::write_mem(&mut t, 0xdead_0000, b"xx").unwrap_err();
        assert!(matches!(err, ShimError::Protocol(_)));
    }

    #[test]
    fn queue_data_flows_write_to_read() {
        let (mut t, _peer) = LoopbackTransport::new();
        let q = calls::create_queue(&mut t, true).unwrap();
        calls::write_queue(&mut t, q, 0, b"stream data", false).unwrap();
        let got = calls::read_queue(&mut t, q, 0, 6, false).unwrap();
        assert_eq!(got, b"stream");
    }

    #[test]
    fn held_completions_stay_pending_until_released() {
        let (mut t, peer) = LoopbackTransport::new();
        let q = calls::create_queue(&mut t, true).unwrap();

        peer.lock().unwrap().hold_completions(true);
        calls::write_queue(&mut t, q, 42, b"abcd", false).unwrap();
        let spans = std::collections::BTreeMap::new();
        assert_eq!(calls::poll_completion(&mut t, 42, &spans).unwrap(), 0);

        peer.lock().unwrap().release_completion(42);
        assert_eq!(calls::poll_completion(&mut t, 42, &spans).unwrap(), 4);
    }

    #[test]
    fn graph_lifecycle_and_parameters() {
        let (mut t, peer) = LoopbackTransport::new();
        calls::graph_init(&mut t, 7, "mygraph").unwrap();
        assert_eq!(peer.lock().unwrap().graph_name(7), Some("mygraph"));

        calls::graph_run(&mut t, 7, 4).unwrap();
        calls::graph_update_rtp(&mut t, 7, "in.gain", &3u32.to_le_bytes()).unwrap();
        let value = calls::graph_read_rtp(&mut t, 7, "in.gain", 4).unwrap();
        assert_eq!(value, 3u32.to_le_bytes());
        calls::graph_wait(&mut t, 7).unwrap();
        calls::graph_end(&mut t, 7).unwrap();

        // Once ended, the handle is gone.
        let err = calls::graph_run(&mut t, 7, 1).unwrap_err();
        assert!(matches!(err, ShimError::Protocol(_)));
    }

    #[test]
    fn exec_requires_a_known_command_buffer() {
        let (mut t, peer) = LoopbackTransport::new();
        let err = calls::exec_buf(&mut t, 0xbad0_0000).unwrap_err();
        assert!(matches!(err, ShimError::Protocol(_)));

        calls::alloc_buffer(&mut t, 0x2000, 4096, false).unwrap();
        calls::exec_buf(&mut t, 0x2000).unwrap();
        assert_eq!(peer.lock().unwrap().exec_submissions, vec![0x2000]);
    }

    #[test]
    fn recv_without_send_is_an_error() {
        let (mut t, _peer) = LoopbackTransport::new();
        assert!(t.recv().is_err());
    }
}
