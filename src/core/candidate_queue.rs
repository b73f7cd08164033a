//
// Copyright 2024 the worldvoice authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Accumulator for locally gathered ICE candidates.
//!
//! Candidates arrive on the media engine's threads before the server has
//! acknowledged the session; they are buffered here and flushed in one FIFO
//! batch once the remote answer is accepted, then in small batches as
//! gathered. The drain is the only correctness-bearing operation: a
//! separate count-then-act read would race.

use std::sync::Arc;

use crate::core::voice_mutex::VoiceMutex;
use crate::webrtc::peer_connection::IceCandidate;

#[derive(Clone)]
pub struct CandidateQueue {
    candidates: Arc<VoiceMutex<Vec<IceCandidate>>>,
}

impl Default for CandidateQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self {
            candidates: Arc::new(VoiceMutex::new(Vec::new(), "candidate_queue")),
        }
    }

    /// Safe from any thread; never blocks beyond the internal lock.
    pub fn enqueue(&self, candidate: IceCandidate) {
        match self.candidates.lock() {
            Ok(mut candidates) => candidates.push(candidate),
            Err(err) => error!("can't buffer ICE candidate: {}", err),
        }
    }

    /// Atomically empties the queue and returns its contents in FIFO
    /// order. Empty when empty; never an error.
    pub fn drain_all(&self) -> Vec<IceCandidate> {
        match self.candidates.lock() {
            Ok(mut candidates) => std::mem::take(&mut *candidates),
            Err(err) => {
                error!("can't drain ICE candidates: {}", err);
                Vec::new()
            }
        }
    }

    /// Diagnostics only; never gate a send on this.
    pub fn len(&self) -> usize {
        self.candidates.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: i32) -> IceCandidate {
        IceCandidate::new("audio".to_string(), 0, format!("candidate:{n} 1 udp 1 10.0.0.1 {n} typ host"))
    }

    #[test]
    fn drain_preserves_fifo_order() {
        let queue = CandidateQueue::new();
        for n in 0..5 {
            queue.enqueue(candidate(n));
        }
        let drained = queue.drain_all();
        assert_eq!(5, drained.len());
        for (n, c) in drained.iter().enumerate() {
            assert!(c.sdp.starts_with(&format!("candidate:{n} ")));
        }
    }

    #[test]
    fn drain_empties_and_repeats_harmlessly() {
        let queue = CandidateQueue::new();
        queue.enqueue(candidate(1));
        assert_eq!(1, queue.drain_all().len());
        assert!(queue.drain_all().is_empty());
        assert!(queue.drain_all().is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn enqueue_from_many_threads() {
        let queue = CandidateQueue::new();
        let mut handles = Vec::new();
        for t in 0..4 {
            let queue = queue.clone();
            handles.push(std::thread::spawn(move || {
                for n in 0..25 {
                    queue.enqueue(candidate(t * 100 + n));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(100, queue.drain_all().len());
    }
}
