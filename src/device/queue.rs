//! Outstanding streaming requests and completion polling.

use crate::error::ShimResult;
use crate::protocol::{calls, Transport};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Pause between completion scans. The peer cannot push completions, so
/// polling re-queries it; the pause keeps that from becoming a spin.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// One in-flight non-blocking streaming request.
pub struct StreamingRequest {
    /// Non-zero tag carried on the wire.
    pub seq: u64,
    /// Opaque caller context, returned with the completion.
    pub context: u64,
    /// Buffer address -> length spans covered by the request.
    pub spans: BTreeMap<u64, u64>,
}

/// An observed completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub context: u64,
    pub nbytes: u64,
}

/// Tracks non-blocking streaming requests for one device.
#[derive(Default)]
pub struct QueueManager {
    outstanding: Vec<StreamingRequest>,
}

impl QueueManager {
    pub fn track(&mut self, request: StreamingRequest) {
        self.outstanding.push(request);
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Collects between `min` and `max` completions, never blocking past
    /// `timeout`.
    ///
    /// Each scan queries the peer once per outstanding request and moves
    /// completed records into the result. Returns early once `min`
    /// completions are in hand; on timeout it returns whatever completed,
    /// which may be fewer than `min` (including none).
    ///
    /// # Errors
    /// Transport errors abort the poll; already-collected completions are
    /// lost with their records, so callers treat this as fatal for the
    /// queue.
    pub fn poll(
        &mut self,
        transport: &mut dyn Transport,
        min: usize,
        max: usize,
        timeout: Duration,
    ) -> ShimResult<Vec<Completion>> {
        let deadline = Instant::now() + timeout;
        let mut done = Vec::new();

        loop {
            let mut i = 0;
            while i < self.outstanding.len() && done.len() < max {
                let req = &self.outstanding[i];
                let nbytes = calls::poll_completion(transport, req.seq, &req.spans)?;
                if nbytes > 0 {
                    let req = self.outstanding.swap_remove(i);
                    done.push(Completion {
                        context: req.context,
                        nbytes,
                    });
                } else {
                    i += 1;
                }
            }

            if done.len() >= min || done.len() >= max {
                return Ok(done);
            }
            // Nothing left that could ever complete.
            if self.outstanding.is_empty() {
                return Ok(done);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(done);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LoopbackTransport;

    fn submit(t: &mut dyn Transport, queue: u64, seq: u64, data: &[u8]) -> StreamingRequest {
        calls::write_queue(t, queue, seq, data, false).unwrap();
        let mut spans = BTreeMap::new();
        spans.insert(data.as_ptr() as u64, data.len() as u64);
        StreamingRequest {
            seq,
            context: seq * 100,
            spans,
        }
    }

    #[test]
    fn poll_returns_min_completions_without_waiting_for_the_rest() {
        let (mut t, peer) = LoopbackTransport::new();
        let q = calls::create_queue(&mut t, true).unwrap();
        let mut mgr = QueueManager::default();

        // Two complete immediately, three stay parked.
        mgr.track(submit(&mut t, q, 1, b"aa"));
        mgr.track(submit(&mut t, q, 2, b"bbb"));
        peer.lock().unwrap().hold_completions(true);
        for seq in 3..=5 {
            mgr.track(submit(&mut t, q, seq, b"cccc"));
        }

        let done = mgr
            .poll(&mut t, 2, 4, Duration::from_secs(5))
            .unwrap();
        assert_eq!(done.len(), 2);
        assert_eq!(mgr.outstanding(), 3);

        let contexts: Vec<u64> = done.iter().map(|c| c.context).collect();
        assert!(contexts.contains(&100) && contexts.contains(&200));
    }

    #[test]
    fn poll_never_blocks_past_its_timeout() {
        let (mut t, peer) = LoopbackTransport::new();
        let q = calls::create_queue(&mut t, true).unwrap();
        let mut mgr = QueueManager::default();

        peer.lock().unwrap().hold_completions(true);
        mgr.track(submit(&mut t, q, 1, b"never"));

        let start = Instant::now();
        let done = mgr
            .poll(&mut t, 1, 4, Duration::from_millis(50))
            .unwrap();
        assert!(done.is_empty());
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(mgr.outstanding(), 1);
    }

    #[test]
    fn max_caps_a_surplus_of_completions() {
        let (mut t, _peer) = LoopbackTransport::new();
        let q = calls::create_queue(&mut t, true).unwrap();
        let mut mgr = QueueManager::default();

        for seq in 1..=6 {
            mgr.track(submit(&mut t, q, seq, b"x"));
        }
        let done = mgr
            .poll(&mut t, 1, 4, Duration::from_secs(1))
            .unwrap();
        assert_eq!(done.len(), 4);
        assert_eq!(mgr.outstanding(), 2);
    }

    #[test]
    fn poll_with_nothing_outstanding_returns_immediately() {
        let (mut t, _peer) = LoopbackTransport::new();
        let mut mgr = QueueManager::default();
        let done = mgr
            .poll(&mut t, 1, 4, Duration::from_secs(30))
            .unwrap();
        assert!(done.is_empty());
    }
}
