//! Lifecycle of one device process and the channel to it.
//!
//! A [`Session`] owns the transport, the child handle (when a real
//! process was spawned) and the on-disk run directory. Sequence and
//! run-directory counters live here so the device layer never has to
//! coordinate them.

use crate::error::{ShimError, ShimResult};
use crate::protocol::{calls, Transport};
use crate::session::channel::UnixTransport;
use crate::session::signals;
use std::fs;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

/// How long the spawned process gets to connect back to us.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Settle time granted to a real child after the close handshake, so it
/// can finish flushing run-directory outputs before cleanup.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Everything needed to launch the device process.
pub struct SpawnOptions {
    /// Executable to launch.
    pub simulator: PathBuf,
    /// Run directory created for this device; the socket and all
    /// per-binary subdirectories live under it.
    pub device_dir: PathBuf,
    /// Distinguishes concurrent sessions sharing a simulator build.
    pub session_id: u32,
    /// Launch with kernel-debug instrumentation enabled.
    pub debug: bool,
}

/// One live connection to a device process (or an injected stand-in).
pub struct Session {
    transport: Box<dyn Transport>,
    child: Option<Child>,
    socket_path: Option<PathBuf>,
    device_dir: PathBuf,
    binary_counter: u32,
    request_counter: u64,
}

impl Session {
    /// Builds a session over an already-connected transport. Used for
    /// the loopback peer and by tests.
    pub fn with_transport(transport: Box<dyn Transport>, device_dir: PathBuf) -> ShimResult<Self> {
        fs::create_dir_all(&device_dir)?;
        Ok(Self {
            transport,
            child: None,
            socket_path: None,
            device_dir,
            binary_counter: 0,
            request_counter: 0,
        })
    }

    /// Launches the device process and waits for it to connect.
    ///
    /// # Errors
    /// `Io` if the run directory or socket cannot be set up or the
    /// executable fails to launch; `PeerDied` if the child exits before
    /// connecting.
    pub fn spawn(opts: &SpawnOptions) -> ShimResult<Self> {
        fs::create_dir_all(&opts.device_dir)?;
        let socket_path = opts.device_dir.join("channel.sock");
        // A stale socket from a crashed prior run would make bind fail.
        let _ = fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;

        let mut cmd = Command::new(&opts.simulator);
        cmd.arg(&socket_path)
            .arg(&opts.device_dir)
            .env("SWEMU_SESSION_ID", opts.session_id.to_string())
            .current_dir(&opts.device_dir)
            .stdin(Stdio::null());
        if opts.debug {
            cmd.arg("--kernel-debug");
        }
        log::info!(
            "launching {} for session {}",
            opts.simulator.display(),
            opts.session_id
        );
        let mut child = cmd.spawn()?;
        signals::watch_child(child.id(), &opts.device_dir);

        let transport = match UnixTransport::accept(&listener, &mut child, CONNECT_TIMEOUT) {
            Ok(t) => t,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = fs::remove_file(&socket_path);
                return Err(e);
            }
        };

        Ok(Self {
            transport: Box::new(transport),
            child: Some(child),
            socket_path: Some(socket_path),
            device_dir: opts.device_dir.clone(),
            binary_counter: 0,
            request_counter: 0,
        })
    }

    #[must_use]
    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }

    /// Runs one channel operation. When the operation fails and the
    /// device process turns out to have died abnormally, this is
    /// process-fatal: diagnostics for all live sessions are flushed and
    /// the host exits non-zero.
    pub fn rpc<T>(
        &mut self,
        op: impl FnOnce(&mut dyn Transport) -> ShimResult<T>,
    ) -> ShimResult<T> {
        match op(self.transport.as_mut()) {
            Err(e) => {
                if let Some(status) = self.abnormal_child_exit() {
                    log::error!("device process died abnormally ({status}): {e}");
                    signals::fatal_peer_exit(status);
                }
                Err(e)
            }
            ok => ok,
        }
    }

    /// Reaps the child if it already exited with a non-success status.
    /// A clean exit (or no child at all, as with the loopback peer)
    /// returns `None`.
    fn abnormal_child_exit(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) if !status.success() => {
                self.child = None;
                Some(status)
            }
            _ => None,
        }
    }

    /// Next non-zero request tag. Zero is reserved as the blocking
    /// marker on queue submissions.
    pub fn next_request(&mut self) -> u64 {
        self.request_counter += 1;
        self.request_counter
    }

    /// Creates and returns the numbered run subdirectory for the next
    /// loaded binary.
    pub fn next_binary_dir(&mut self) -> ShimResult<PathBuf> {
        let dir = self
            .device_dir
            .join(format!("binary_{}", self.binary_counter));
        self.binary_counter += 1;
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Orderly teardown: close handshake, reap the child, remove the
    /// socket, and delete the run directory unless asked to keep it.
    pub fn shutdown(mut self, keep_rundir: bool) -> ShimResult<()> {
        // Best effort; the peer may already be gone.
        if let Err(e) = calls::close_device(self.transport.as_mut()) {
            log::debug!("close handshake failed: {e}");
        }

        let had_child = self.child.is_some();
        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) if !status.success() => {
                    // A crash rather than a clean exit is fatal to the
                    // whole host, after the diagnostics flush.
                    signals::unwatch_child(child.id());
                    log::error!("device process crashed during shutdown ({status})");
                    signals::fatal_peer_exit(status);
                }
                Ok(status) => log::debug!("device process exited: {status}"),
                Err(e) => log::warn!("waiting for device process failed: {e}"),
            }
            signals::unwatch_child(child.id());
        }
        if let Some(socket) = self.socket_path.take() {
            let _ = fs::remove_file(&socket);
        }
        if had_child {
            std::thread::sleep(SHUTDOWN_GRACE);
        }
        if keep_rundir {
            log::info!("keeping run directory {}", self.device_dir.display());
        } else {
            fs::remove_dir_all(&self.device_dir).map_err(ShimError::Io)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::loopback::LoopbackTransport;

    #[test]
    fn request_tags_start_at_one_and_increase() {
        let dir = tempfile::tempdir().unwrap();
        let (t, _peer) = LoopbackTransport::new();
        let mut session =
            Session::with_transport(Box::new(t), dir.path().join("device_0")).unwrap();
        assert_eq!(session.next_request(), 1);
        assert_eq!(session.next_request(), 2);
    }

    #[test]
    fn binary_dirs_are_numbered_in_load_order() {
        let dir = tempfile::tempdir().unwrap();
        let (t, _peer) = LoopbackTransport::new();
        let mut session =
            Session::with_transport(Box::new(t), dir.path().join("device_0")).unwrap();

        let first = session.next_binary_dir().unwrap();
        let second = session.next_binary_dir().unwrap();
        assert!(first.ends_with("binary_0"));
        assert!(second.ends_with("binary_1"));
        assert!(first.is_dir() && second.is_dir());
    }

    #[test]
    fn shutdown_removes_the_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let device_dir = dir.path().join("device_0");
        let (t, peer) = LoopbackTransport::new();
        let session = Session::with_transport(Box::new(t), device_dir.clone()).unwrap();

        session.shutdown(false).unwrap();
        assert!(!device_dir.exists());
        assert!(peer.lock().unwrap().closed);
    }

    #[test]
    fn shutdown_can_keep_the_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let device_dir = dir.path().join("device_0");
        let (t, _peer) = LoopbackTransport::new();
        let session = Session::with_transport(Box::new(t), device_dir.clone()).unwrap();

        session.shutdown(true).unwrap();
        assert!(device_dir.exists());
    }

    #[test]
    fn abnormal_child_exit_is_detected_and_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let (t, _peer) = LoopbackTransport::new();
        let mut session =
            Session::with_transport(Box::new(t), dir.path().join("device_0")).unwrap();
        session.child = Some(Command::new("false").spawn().unwrap());

        // Give the child a moment to exit.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(status) = session.abnormal_child_exit() {
                assert!(!status.success());
                break;
            }
            assert!(std::time::Instant::now() < deadline, "child never exited");
            std::thread::sleep(Duration::from_millis(10));
        }
        // Reaped: a second check finds nothing.
        assert!(session.abnormal_child_exit().is_none());
    }

    #[test]
    fn clean_child_exit_is_not_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let (t, _peer) = LoopbackTransport::new();
        let mut session =
            Session::with_transport(Box::new(t), dir.path().join("device_0")).unwrap();
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().unwrap();
        session.child = Some(child);

        assert!(session.abnormal_child_exit().is_none());
        session.child = None;
    }

    #[test]
    fn rpc_errors_pass_through_without_a_child() {
        let dir = tempfile::tempdir().unwrap();
        let (t, _peer) = LoopbackTransport::new();
        let mut session =
            Session::with_transport(Box::new(t), dir.path().join("device_0")).unwrap();

        let err = session
            .rpc(|_| Err::<(), _>(ShimError::ChannelClosed))
            .unwrap_err();
        assert!(matches!(err, ShimError::ChannelClosed));
    }

    #[test]
    fn spawn_reports_a_missing_simulator() {
        let dir = tempfile::tempdir().unwrap();
        let opts = SpawnOptions {
            simulator: dir.path().join("no-such-simulator"),
            device_dir: dir.path().join("device_0"),
            session_id: 0,
            debug: false,
        };
        assert!(matches!(Session::spawn(&opts), Err(ShimError::Io(_))));
    }
}
