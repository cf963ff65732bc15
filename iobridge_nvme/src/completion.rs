/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Completion correlation
//!
//! Every submitted command carries an [`IoCompletion`]: a status pair that
//! reads as pending (`sct == -1`) until the command finishes, the caller's
//! command id, and a shared [`CompletionSink`]. When the provider's poller
//! finishes the command, the status is written verbatim and the id is
//! appended to the sink. One `process_completions` call can therefore surface
//! any number of finished ids, in poll order, each with its own status.
//!
//! The sink has a fixed capacity. Ids arriving past it are counted, never
//! written; [`CompletionSink::overflowed`] makes the truncation observable.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

use crate::nvme_primitives::CompletionStatus;

/// Status code type of a command that has not completed.
pub const PENDING_SCT: i32 = -1;

#[derive(Debug, Default)]
struct SinkState {
    ids: Vec<u64>,
    overflowed: usize,
}

/// Fixed-capacity output array of completed command ids.
#[derive(Debug)]
pub struct CompletionSink {
    capacity: usize,
    state: Mutex<SinkState>,
}

impl CompletionSink {
    /// A sink holding at most `capacity` ids between drains.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            state: Mutex::new(SinkState {
                ids: Vec::with_capacity(capacity),
                overflowed: 0,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of ids the sink holds before counting overflow.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `id` at the running index.
    pub fn record(&self, id: u64) {
        let mut state = self.state();
        if state.ids.len() < self.capacity {
            state.ids.push(id);
        } else {
            state.overflowed += 1;
            tracing::warn!(
                "completion sink full ({} ids), dropping id {}",
                self.capacity,
                id
            );
        }
    }

    /// Number of ids recorded since the last drain.
    pub fn len(&self) -> usize {
        self.state().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids that arrived while the sink was full, since the last drain.
    pub fn overflowed(&self) -> usize {
        self.state().overflowed
    }

    /// Takes the recorded ids, in completion order, and resets the index and
    /// the overflow count.
    pub fn drain(&self) -> Vec<u64> {
        let mut state = self.state();
        state.overflowed = 0;
        std::mem::replace(&mut state.ids, Vec::with_capacity(self.capacity))
    }
}

/// Completion record of one submitted command.
#[derive(Debug)]
pub struct IoCompletion {
    id: u64,
    sct: AtomicI32,
    sc: AtomicI32,
    sink: Arc<CompletionSink>,
}

impl IoCompletion {
    /// A pending record for command `id`, reporting into `sink`.
    pub fn new(id: u64, sink: &Arc<CompletionSink>) -> Arc<Self> {
        Arc::new(Self {
            id,
            sct: AtomicI32::new(PENDING_SCT),
            sc: AtomicI32::new(0),
            sink: Arc::clone(sink),
        })
    }

    /// Caller-chosen command id reported to the sink.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The sink this record reports into.
    pub fn sink(&self) -> &Arc<CompletionSink> {
        &self.sink
    }

    /// Whether the command has completed.
    pub fn is_done(&self) -> bool {
        self.sct.load(Ordering::Acquire) != PENDING_SCT
    }

    /// Final status, or `None` while the command is pending.
    pub fn status(&self) -> Option<CompletionStatus> {
        let sct = self.sct.load(Ordering::Acquire);
        if sct == PENDING_SCT {
            return None;
        }
        Some(CompletionStatus {
            sct,
            sc: self.sc.load(Ordering::Relaxed),
        })
    }

    /// Records the native completion. The status code is published before
    /// the status code type, so a reader that sees a final type sees the
    /// matching code.
    pub fn complete(&self, status: CompletionStatus) {
        if status.is_error() {
            tracing::debug!("command {} failed: {}", self.id, status);
        }
        self.sc.store(status.sc, Ordering::Relaxed);
        self.sct.store(status.sct, Ordering::Release);
        self.sink.record(self.id);
    }

    /// Marks the record pending again so it can carry another submission.
    pub fn reset(&self) {
        self.sct.store(PENDING_SCT, Ordering::Release);
        self.sc.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvme_primitives::generic_status;

    #[test]
    fn test_complete_publishes_status_and_id() {
        let sink = CompletionSink::new(4);
        let io = IoCompletion::new(7, &sink);
        assert!(!io.is_done());
        assert_eq!(io.status(), None);

        io.complete(CompletionStatus::generic(generic_status::LBA_OUT_OF_RANGE));
        assert!(io.is_done());
        let status = io.status().unwrap();
        assert_eq!((status.sct, status.sc), (0, 0x80));
        assert!(status.is_error());
        assert_eq!(sink.drain(), vec![7]);
        assert!(sink.is_empty());

        io.reset();
        assert_eq!(io.status(), None);
    }

    #[test]
    fn test_overflow_is_counted_not_written() {
        let sink = CompletionSink::new(2);
        for id in 1..=5 {
            IoCompletion::new(id, &sink).complete(CompletionStatus::SUCCESS);
        }
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.overflowed(), 3);
        assert_eq!(sink.drain(), vec![1, 2]);
        assert_eq!(sink.overflowed(), 0);
    }

    #[test]
    fn test_zero_capacity_sink() {
        let sink = CompletionSink::new(0);
        IoCompletion::new(1, &sink).complete(CompletionStatus::SUCCESS);
        assert_eq!(sink.len(), 0);
        assert_eq!(sink.overflowed(), 1);
    }
}
