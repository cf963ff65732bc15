/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::RawFd;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use iobridge::BridgeError;
use nix::errno::Errno;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;

/// A FIFO whose eventfd is readable exactly while the queue is non-empty.
///
/// The eventfd runs in semaphore mode and its counter always equals the queue
/// length: every push writes one, every pop reads one, both under the queue
/// lock.
pub(crate) struct EventQueue<T> {
    fd: EventFd,
    items: Mutex<VecDeque<T>>,
}

impl<T> EventQueue<T> {
    pub(crate) fn new() -> Result<Self, BridgeError> {
        let fd = EventFd::from_flags(EfdFlags::EFD_SEMAPHORE | EfdFlags::EFD_CLOEXEC)
            .map_err(|e| BridgeError::errno("eventfd", e))?;
        Ok(Self {
            fd,
            items: Mutex::new(VecDeque::new()),
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_fd().as_raw_fd()
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, item: T) {
        let mut items = self.items();
        if let Err(err) = self.fd.write(1) {
            tracing::error!("failed to signal event queue: {}", err);
            return;
        }
        items.push_back(item);
    }

    /// Makes the descriptor readable with nothing queued, as seen by a poller
    /// that loses the event to another one between its wait and its fetch.
    #[cfg(test)]
    pub(crate) fn wake(&self) {
        let _items = self.items();
        if let Err(err) = self.fd.write(1) {
            tracing::error!("failed to signal event queue: {}", err);
        }
    }

    /// Takes the oldest item, or fails with `EAGAIN` when empty.
    pub(crate) fn pop(&self) -> Result<T, BridgeError> {
        let mut items = self.items();
        let Some(item) = items.pop_front() else {
            return Err(BridgeError::errno("get_event", Errno::EAGAIN));
        };
        if let Err(err) = self.fd.read() {
            tracing::error!("event queue counter out of step: {}", err);
        }
        Ok(item)
    }

    /// Removes every item for which `drop_item` returns true and returns them.
    pub(crate) fn remove_where(&self, mut drop_item: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut items = self.items();
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(items.len());
        for item in items.drain(..) {
            if drop_item(&item) {
                removed.push(item);
            } else {
                kept.push_back(item);
            }
        }
        *items = kept;
        for _ in &removed {
            if let Err(err) = self.fd.read() {
                tracing::error!("event queue counter out of step: {}", err);
            }
        }
        removed
    }

    pub(crate) fn drain(&self) -> Vec<T> {
        self.remove_where(|_| true)
    }

    pub(crate) fn len(&self) -> usize {
        self.items().len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::event_bridge::arm_nonblocking;
    use crate::event_bridge::wait_readable;

    #[test]
    fn test_fd_tracks_queue_length() {
        let queue = EventQueue::new().unwrap();
        arm_nonblocking(queue.raw_fd()).unwrap();
        assert!(!wait_readable(queue.raw_fd(), Duration::ZERO).unwrap());

        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert!(wait_readable(queue.raw_fd(), Duration::ZERO).unwrap());
        assert_eq!(queue.pop().unwrap(), 1);

        let removed = queue.remove_where(|v| *v == 2);
        assert_eq!(removed, vec![2]);
        assert_eq!(queue.len(), 1);
        assert!(wait_readable(queue.raw_fd(), Duration::ZERO).unwrap());

        assert_eq!(queue.pop().unwrap(), 3);
        assert!(!wait_readable(queue.raw_fd(), Duration::ZERO).unwrap());
        assert_eq!(
            queue.pop().unwrap_err().status_code(),
            -(Errno::EAGAIN as i32)
        );
    }
}
