//! Typed wrappers for every operation forwarded to the device process.
//!
//! Each wrapper serializes its arguments, performs one send/receive
//! transaction, and decodes the acknowledgement from the response. The
//! acknowledgement is always read off the wire, never assumed; a NAK
//! surfaces as a `Protocol` error naming the call.

use super::codec::{Message, Reader};
use super::Transport;
use crate::container::ArgFlowMap;
use crate::error::{ShimError, ShimResult};
use std::collections::BTreeMap;

fn transact(t: &mut dyn Transport, msg: Message) -> ShimResult<Vec<u8>> {
    t.send(&msg.into_frame())?;
    t.recv()
}

/// Runs one call and returns a reader positioned after the ack flag.
fn acked<'a>(call: &str, response: &'a [u8]) -> ShimResult<Reader<'a>> {
    let mut rd = Reader::new(response);
    if rd.bool()? {
        Ok(rd)
    } else {
        Err(ShimError::Protocol(format!("{call} not acknowledged")))
    }
}

pub fn alloc_buffer(
    t: &mut dyn Transport,
    base: u64,
    size: u64,
    no_host_memory: bool,
) -> ShimResult<()> {
    let mut msg = Message::call("allocBuffer");
    msg.push_u64(base).push_u64(size).push_bool(no_host_memory);
    let resp = transact(t, msg)?;
    acked("allocBuffer", &resp).map(|_| ())
}

pub fn free_buffer(t: &mut dyn Transport, base: u64) -> ShimResult<()> {
    let mut msg = Message::call("freeBuffer");
    msg.push_u64(base);
    let resp = transact(t, msg)?;
    acked("freeBuffer", &resp).map(|_| ())
}

/// Writes one chunk of host data at a device address; returns the byte
/// count the peer reports as written.
pub fn write_mem(t: &mut dyn Transport, dst: u64, data: &[u8]) -> ShimResult<u64> {
    let mut msg = Message::call("writeMem");
    msg.push_u64(dst).push_bytes(data);
    let resp = transact(t, msg)?;
    acked("writeMem", &resp)?.u64()
}

/// Reads one chunk from a device address; may return fewer bytes than
/// requested.
pub fn read_mem(t: &mut dyn Transport, src: u64, len: u64) -> ShimResult<Vec<u8>> {
    let mut msg = Message::call("readMem");
    msg.push_u64(src).push_u64(len);
    let resp = transact(t, msg)?;
    let mut rd = acked("readMem", &resp)?;
    Ok(rd.bytes()?.to_vec())
}

pub fn write_register(t: &mut dyn Transport, offset: u64, data: &[u8]) -> ShimResult<()> {
    let mut msg = Message::call("writeCtrlReg");
    msg.push_u64(offset).push_bytes(data);
    let resp = transact(t, msg)?;
    acked("writeCtrlReg", &resp).map(|_| ())
}

pub fn read_register(t: &mut dyn Transport, offset: u64, len: u64) -> ShimResult<Vec<u8>> {
    let mut msg = Message::call("readCtrlReg");
    msg.push_u64(offset).push_u64(len);
    let resp = transact(t, msg)?;
    let mut rd = acked("readCtrlReg", &resp)?;
    Ok(rd.bytes()?.to_vec())
}

/// Delivers the bitstream image together with the directories the peer
/// should run out of. `Loaded` state is only entered after this call's
/// acknowledgement.
pub fn load_bitstream(
    t: &mut dyn Transport,
    device_dir: &str,
    binary_dir: &str,
    bitstream: &[u8],
    verbose: bool,
) -> ShimResult<()> {
    let mut msg = Message::call("loadBitstream");
    msg.push_str(device_dir)
        .push_str(binary_dir)
        .push_bytes(bitstream)
        .push_bool(verbose);
    let resp = transact(t, msg)?;
    acked("loadBitstream", &resp).map(|_| ())
}

/// Configures streaming-argument routing for one kernel instance.
pub fn setup_instance(t: &mut dyn Transport, base: u64, args: &ArgFlowMap) -> ShimResult<()> {
    let mut msg = Message::call("setupInstance");
    msg.push_u64(base).push_u32(args.len() as u32);
    for (arg, (flow, tag)) in args {
        msg.push_u64(*arg).push_u64(*flow).push_str(tag);
    }
    let resp = transact(t, msg)?;
    acked("setupInstance", &resp).map(|_| ())
}

/// Creates a streaming queue; `write` selects direction. The returned
/// handle is strictly positive.
pub fn create_queue(t: &mut dyn Transport, write: bool) -> ShimResult<u64> {
    let mut msg = Message::call("createQueue");
    msg.push_bool(write);
    let resp = transact(t, msg)?;
    let handle = acked("createQueue", &resp)?.u64()?;
    if handle == 0 {
        return Err(ShimError::Protocol("createQueue returned a null handle".into()));
    }
    Ok(handle)
}

pub fn destroy_queue(t: &mut dyn Transport, handle: u64) -> ShimResult<()> {
    let mut msg = Message::call("destroyQueue");
    msg.push_u64(handle);
    let resp = transact(t, msg)?;
    acked("destroyQueue", &resp).map(|_| ())
}

/// Submits one buffer to a write queue. `seq` is zero for blocking
/// submissions; non-zero tags a non-blocking request for later
/// completion polling.
pub fn write_queue(
    t: &mut dyn Transport,
    handle: u64,
    seq: u64,
    data: &[u8],
    eot: bool,
) -> ShimResult<u64> {
    let mut msg = Message::call("writeQueue");
    msg.push_u64(handle).push_u64(seq).push_bytes(data).push_bool(eot);
    let resp = transact(t, msg)?;
    acked("writeQueue", &resp)?.u64()
}

/// Requests up to `len` bytes from a read queue. An empty result on a
/// blocking request means "nothing yet"; the caller retries.
pub fn read_queue(
    t: &mut dyn Transport,
    handle: u64,
    seq: u64,
    len: u64,
    eot: bool,
) -> ShimResult<Vec<u8>> {
    let mut msg = Message::call("readQueue");
    msg.push_u64(handle).push_u64(seq).push_u64(len).push_bool(eot);
    let resp = transact(t, msg)?;
    let mut rd = acked("readQueue", &resp)?;
    Ok(rd.bytes()?.to_vec())
}

/// Queries completion of one outstanding streaming request; returns the
/// bytes processed so far, zero meaning still pending.
pub fn poll_completion(
    t: &mut dyn Transport,
    seq: u64,
    spans: &BTreeMap<u64, u64>,
) -> ShimResult<u64> {
    let mut msg = Message::call("pollCompletion");
    msg.push_u64(seq).push_u32(spans.len() as u32);
    for (addr, len) in spans {
        msg.push_u64(*addr).push_u64(*len);
    }
    let resp = transact(t, msg)?;
    acked("pollCompletion", &resp)?.u64()
}

/// Announces a file-backed shared mapping for an exported buffer so the
/// peer can place device-side data into the file.
pub fn export_buffer(t: &mut dyn Transport, base: u64, path: &str, size: u64) -> ShimResult<()> {
    let mut msg = Message::call("exportBuffer");
    msg.push_u64(base).push_str(path).push_u64(size);
    let resp = transact(t, msg)?;
    acked("exportBuffer", &resp).map(|_| ())
}

/// Associates an imported buffer's fresh device region with the shared
/// backing file of its origin.
pub fn import_buffer(t: &mut dyn Transport, path: &str, base: u64, size: u64) -> ShimResult<()> {
    let mut msg = Message::call("importBuffer");
    msg.push_str(path).push_u64(base).push_u64(size);
    let resp = transact(t, msg)?;
    acked("importBuffer", &resp).map(|_| ())
}

/// Device-to-file copy targeting the shared backing file of an imported
/// buffer.
pub fn copy_buffer(
    t: &mut dyn Transport,
    src_base: u64,
    dst_path: &str,
    size: u64,
    src_offset: u64,
    dst_offset: u64,
) -> ShimResult<()> {
    let mut msg = Message::call("copyBuffer");
    msg.push_u64(src_base)
        .push_str(dst_path)
        .push_u64(size)
        .push_u64(src_offset)
        .push_u64(dst_offset);
    let resp = transact(t, msg)?;
    acked("copyBuffer", &resp).map(|_| ())
}

/// Binds a host graph handle to a named dataflow graph on the peer.
pub fn graph_init(t: &mut dyn Transport, graph: u64, name: &str) -> ShimResult<()> {
    let mut msg = Message::call("graphInit");
    msg.push_u64(graph).push_str(name);
    let resp = transact(t, msg)?;
    acked("graphInit", &resp).map(|_| ())
}

/// Starts a graph; `iterations` of zero means run until ended.
pub fn graph_run(t: &mut dyn Transport, graph: u64, iterations: u32) -> ShimResult<()> {
    let mut msg = Message::call("graphRun");
    msg.push_u64(graph).push_u32(iterations);
    let resp = transact(t, msg)?;
    acked("graphRun", &resp).map(|_| ())
}

/// Blocks on the peer until the graph's current run completes.
pub fn graph_wait(t: &mut dyn Transport, graph: u64) -> ShimResult<()> {
    let mut msg = Message::call("graphWait");
    msg.push_u64(graph);
    let resp = transact(t, msg)?;
    acked("graphWait", &resp).map(|_| ())
}

pub fn graph_end(t: &mut dyn Transport, graph: u64) -> ShimResult<()> {
    let mut msg = Message::call("graphEnd");
    msg.push_u64(graph);
    let resp = transact(t, msg)?;
    acked("graphEnd", &resp).map(|_| ())
}

/// Updates a runtime parameter on a graph port.
pub fn graph_update_rtp(
    t: &mut dyn Transport,
    graph: u64,
    port: &str,
    value: &[u8],
) -> ShimResult<()> {
    let mut msg = Message::call("graphUpdateRTP");
    msg.push_u64(graph).push_str(port).push_bytes(value);
    let resp = transact(t, msg)?;
    acked("graphUpdateRTP", &resp).map(|_| ())
}

/// Reads back up to `len` bytes of a runtime parameter from a graph port.
pub fn graph_read_rtp(
    t: &mut dyn Transport,
    graph: u64,
    port: &str,
    len: u64,
) -> ShimResult<Vec<u8>> {
    let mut msg = Message::call("graphReadRTP");
    msg.push_u64(graph).push_str(port).push_u64(len);
    let resp = transact(t, msg)?;
    let mut rd = acked("graphReadRTP", &resp)?;
    Ok(rd.bytes()?.to_vec())
}

/// Hands a validated command buffer's device address to the peer's
/// scheduler.
pub fn exec_buf(t: &mut dyn Transport, base: u64) -> ShimResult<()> {
    let mut msg = Message::call("execBuf");
    msg.push_u64(base);
    let resp = transact(t, msg)?;
    acked("execBuf", &resp).map(|_| ())
}

/// Tells the peer to tear down and exit.
pub fn close_device(t: &mut dyn Transport) -> ShimResult<()> {
    let msg = Message::call("close");
    let resp = transact(t, msg)?;
    acked("close", &resp).map(|_| ())
}
