use crate::error::{ShimError, ShimResult};
use std::io::{Read, Write};

/// Explicit end-of-message delimiter, sent after every frame payload.
pub const MESSAGE_END: u8 = 0x04;

/// Upper bound on a single frame; transfers above this are chunked by the
/// transfer engine, so anything larger indicates a corrupted length.
pub const MAX_FRAME_LEN: u32 = 0x1000_0000;

/// Serializer for one message: a call name followed by positional
/// arguments. Argument order is the call's signature; there is no
/// per-argument tagging or versioning beyond the call name.
pub struct Message {
    buf: Vec<u8>,
}

impl Message {
    #[must_use]
    pub fn call(name: &str) -> Self {
        let mut buf = Vec::with_capacity(16 + name.len());
        buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        buf.extend_from_slice(name.as_bytes());
        Self { buf }
    }

    /// Starts a response message. By convention the first argument of
    /// every response is the acknowledgement flag.
    #[must_use]
    pub fn response(ack: bool) -> Self {
        let mut msg = Self { buf: Vec::new() };
        msg.push_bool(ack);
        msg
    }

    pub fn push_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn push_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn push_bool(&mut self, v: bool) -> &mut Self {
        self.buf.push(u8::from(v));
        self
    }

    pub fn push_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.push_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    pub fn push_str(&mut self, v: &str) -> &mut Self {
        self.push_bytes(v.as_bytes())
    }

    #[must_use]
    pub fn into_frame(self) -> Vec<u8> {
        self.buf
    }
}

/// Positional decoder over one received frame payload.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> ShimResult<&'a [u8]> {
        let slice = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or_else(|| ShimError::Protocol("truncated message".into()))?;
        self.pos += n;
        Ok(slice)
    }

    /// Reads the call name that opens a request frame.
    pub fn call_name(&mut self) -> ShimResult<&'a str> {
        let len = u16::from_le_bytes(self.take(2)?.try_into().unwrap()) as usize;
        std::str::from_utf8(self.take(len)?)
            .map_err(|_| ShimError::Protocol("call name is not UTF-8".into()))
    }

    pub fn u32(&mut self) -> ShimResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> ShimResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn bool(&mut self) -> ShimResult<bool> {
        Ok(self.take(1)?[0] != 0)
    }

    pub fn bytes(&mut self) -> ShimResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub fn str(&mut self) -> ShimResult<&'a str> {
        std::str::from_utf8(self.bytes()?)
            .map_err(|_| ShimError::Protocol("string argument is not UTF-8".into()))
    }
}

/// Writes one frame: length prefix, payload, end-of-message delimiter.
pub fn write_frame(w: &mut impl Write, payload: &[u8]) -> std::io::Result<()> {
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(payload)?;
    w.write_all(&[MESSAGE_END])?;
    w.flush()
}

/// Reads one frame and validates its delimiter.
pub fn read_frame(r: &mut impl Read) -> ShimResult<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(ShimError::Protocol(format!("oversized frame: {len} bytes")));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    let mut end = [0u8; 1];
    r.read_exact(&mut end)?;
    if end[0] != MESSAGE_END {
        return Err(ShimError::Protocol("missing end-of-message marker".into()));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let mut msg = Message::call("allocBuffer");
        msg.push_u64(0x1000).push_u64(4096).push_bool(false);
        let frame = msg.into_frame();

        let mut rd = Reader::new(&frame);
        assert_eq!(rd.call_name().unwrap(), "allocBuffer");
        assert_eq!(rd.u64().unwrap(), 0x1000);
        assert_eq!(rd.u64().unwrap(), 4096);
        assert!(!rd.bool().unwrap());
    }

    #[test]
    fn bytes_and_strings_round_trip() {
        let mut msg = Message::call("x");
        msg.push_bytes(b"\x00\xffpayload").push_str("tag");
        let frame = msg.into_frame();

        let mut rd = Reader::new(&frame);
        rd.call_name().unwrap();
        assert_eq!(rd.bytes().unwrap(), b"\x00\xffpayload");
        assert_eq!(rd.str().unwrap(), "tag");
    }

    #[test]
    fn truncated_message_is_a_protocol_error() {
        let mut msg = Message::call("y");
        msg.push_u32(7);
        let frame = msg.into_frame();

        let mut rd = Reader::new(&frame[..frame.len() - 1]);
        rd.call_name().unwrap();
        assert!(matches!(rd.u32(), Err(ShimError::Protocol(_))));
    }

    #[test]
    fn frame_io_validates_the_delimiter() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        assert_eq!(*buf.last().unwrap(), MESSAGE_END);

        let got = read_frame(&mut &buf[..]).unwrap();
        assert_eq!(got, b"hello");

        let last = buf.len() - 1;
        buf[last] = 0x00;
        assert!(matches!(
            read_frame(&mut &buf[..]),
            Err(ShimError::Protocol(_))
        ));
    }
}
