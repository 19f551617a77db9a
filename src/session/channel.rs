use crate::error::{ShimError, ShimResult};
use crate::protocol::codec::{read_frame, write_frame};
use crate::protocol::Transport;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::process::Child;
use std::time::{Duration, Instant};

/// How often to re-check for the child's connection while accepting.
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// The per-device channel to a spawned device process: a connected Unix
/// stream carrying framed request/response messages.
pub struct UnixTransport {
    stream: UnixStream,
}

impl UnixTransport {
    /// Waits for the freshly spawned child to connect to `listener`.
    ///
    /// # Errors
    /// `PeerDied` if the child exits before connecting; `Io` with
    /// `TimedOut` if nothing connects within `timeout`.
    pub fn accept(
        listener: &UnixListener,
        child: &mut Child,
        timeout: Duration,
    ) -> ShimResult<Self> {
        listener.set_nonblocking(true)?;
        let deadline = Instant::now() + timeout;
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    return Ok(Self { stream });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if child.try_wait()?.is_some() {
                        return Err(ShimError::PeerDied);
                    }
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "device process never connected",
                        )
                        .into());
                    }
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Transport for UnixTransport {
    fn send(&mut self, frame: &[u8]) -> ShimResult<()> {
        write_frame(&mut self.stream, frame)?;
        Ok(())
    }

    fn recv(&mut self) -> ShimResult<Vec<u8>> {
        read_frame(&mut self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    // Exercise the framing over a real socketpair without any subprocess.
    #[test]
    fn frames_cross_a_unix_stream_intact() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut shim = UnixTransport { stream: a };

        let peer = std::thread::spawn(move || {
            let mut stream = b;
            let payload = read_frame(&mut stream).unwrap();
            assert_eq!(payload, b"ping");
            write_frame(&mut stream, b"pong").unwrap();
        });

        shim.send(b"ping").unwrap();
        assert_eq!(shim.recv().unwrap(), b"pong");
        peer.join().unwrap();
    }

    #[test]
    fn recv_reports_a_closed_stream() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut shim = UnixTransport { stream: a };
        drop(b);
        assert!(shim.recv().is_err());
    }

    #[test]
    fn garbage_on_the_wire_is_a_protocol_error() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut shim = UnixTransport { stream: a };
        // Oversized length prefix.
        b.write_all(&u32::MAX.to_le_bytes()).unwrap();
        assert!(matches!(shim.recv(), Err(ShimError::Protocol(_))));

        // Drain whatever the shim never sent: nothing.
        let mut scratch = [0u8; 1];
        b.set_nonblocking(true).unwrap();
        assert!(b.read(&mut scratch).is_err());
    }
}
