//! Process-wide crash and child-exit diagnostics.
//!
//! Handlers are installed once, the first time a device process is
//! spawned. Fatal signals emit a short notice naming the live run
//! directories (so their contents can be inspected post-mortem), then
//! re-raise with the previously installed disposition. The handlers do
//! no allocation; the run-directory list is rendered into a fixed
//! buffer whenever the watch registry changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, Once, OnceLock, PoisonError};

const FATAL_SIGNALS: [libc::c_int; 3] = [libc::SIGSEGV, libc::SIGFPE, libc::SIGABRT];

/// Pre-rendered, async-signal-safe notice text.
static NOTICE: Mutex<Vec<u8>> = Mutex::new(Vec::new());
static NOTICE_LEN: AtomicUsize = AtomicUsize::new(0);

/// Set by SIGUSR1; polled by callers that want an on-demand state dump.
static DUMP_REQUESTED: AtomicBool = AtomicBool::new(false);

static INSTALL: Once = Once::new();

fn registry() -> &'static Mutex<HashMap<u32, PathBuf>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u32, PathBuf>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn render_notice() {
    let reg = registry().lock().unwrap_or_else(PoisonError::into_inner);
    let mut text = Vec::with_capacity(256);
    text.extend_from_slice(b"fatal signal caught; device run directories:\n");
    for dir in reg.values() {
        text.extend_from_slice(b"  ");
        text.extend_from_slice(dir.as_os_str().as_encoded_bytes());
        text.push(b'\n');
    }
    let len = text.len();
    *NOTICE.lock().unwrap_or_else(PoisonError::into_inner) = text;
    NOTICE_LEN.store(len, Ordering::Release);
}

extern "C" fn on_fatal(sig: libc::c_int) {
    // Only write(2) and signal re-raising below: both async-signal-safe.
    let len = NOTICE_LEN.load(Ordering::Acquire);
    if len > 0 {
        if let Ok(notice) = NOTICE.try_lock() {
            unsafe {
                libc::write(libc::STDERR_FILENO, notice.as_ptr().cast(), len);
            }
        }
    }
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

extern "C" fn on_usr1(_sig: libc::c_int) {
    DUMP_REQUESTED.store(true, Ordering::Release);
}

extern "C" fn on_chld(_sig: libc::c_int) {
    // Children are reaped by their owning session; nothing to do here
    // beyond preventing SIG_IGN from discarding the status.
}

fn install() {
    INSTALL.call_once(|| unsafe {
        for sig in FATAL_SIGNALS {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_fatal as usize;
            libc::sigaction(sig, &action, std::ptr::null_mut());
        }
        let mut usr1: libc::sigaction = std::mem::zeroed();
        usr1.sa_sigaction = on_usr1 as usize;
        libc::sigaction(libc::SIGUSR1, &usr1, std::ptr::null_mut());

        let mut chld: libc::sigaction = std::mem::zeroed();
        chld.sa_sigaction = on_chld as usize;
        libc::sigaction(libc::SIGCHLD, &chld, std::ptr::null_mut());
    });
}

/// Registers a spawned device process for crash diagnostics.
pub fn watch_child(pid: u32, device_dir: &Path) {
    install();
    registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(pid, device_dir.to_path_buf());
    render_notice();
}

/// Drops a reaped child from the registry.
pub fn unwatch_child(pid: u32) {
    registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&pid);
    render_notice();
}

/// Consumes a pending SIGUSR1 dump request, if any arrived.
pub fn take_dump_request() -> bool {
    DUMP_REQUESTED.swap(false, Ordering::AcqRel)
}

/// Process-fatal path for an abnormal device-process exit: emit the
/// diagnostics notice naming every live session's run directory, then
/// terminate the host with a non-zero status. A crash in one simulated
/// device must not silently lose the siblings' output.
pub fn fatal_peer_exit(status: std::process::ExitStatus) -> ! {
    use std::io::Write;

    let notice = NOTICE.lock().unwrap_or_else(PoisonError::into_inner);
    let mut stderr = std::io::stderr().lock();
    let _ = stderr.write_all(&notice);
    let _ = writeln!(stderr, "device process exited abnormally: {status}");
    std::process::exit(status.code().unwrap_or(1).max(1));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_watched_children() {
        watch_child(424_242, Path::new("/tmp/devices/device_7"));
        {
            let notice = NOTICE.lock().unwrap();
            let text = String::from_utf8_lossy(&notice);
            assert!(text.contains("device_7"));
        }
        unwatch_child(424_242);
        let notice = NOTICE.lock().unwrap();
        assert!(!String::from_utf8_lossy(&notice).contains("device_7"));
    }

    #[test]
    fn dump_request_flag_is_consumed_once() {
        DUMP_REQUESTED.store(true, Ordering::Release);
        assert!(take_dump_request());
        assert!(!take_dump_request());
    }
}
