/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Bounded polling over native event descriptors.
//!
//! A channel's descriptor is switched to non-blocking mode once, when the
//! channel is created. Each poll then waits for readability up to a timeout
//! and only afterwards issues the native fetch, which returns immediately.
//! Fetched connection manager events are acknowledged by [`EventAck`] when it
//! drops, whatever happens while decoding them.

use std::os::fd::BorrowedFd;
use std::os::fd::RawFd;
use std::time::Duration;
use std::time::Instant;

use iobridge::BridgeError;
use iobridge::NativePtr;
use nix::errno::Errno;
use nix::fcntl::FcntlArg;
use nix::fcntl::OFlag;
use nix::fcntl::fcntl;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use nix::poll::poll;

use crate::provider::VerbsProvider;

/// Switches `fd` to non-blocking mode.
pub fn arm_nonblocking(fd: RawFd) -> Result<(), BridgeError> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| BridgeError::errno("fcntl(F_GETFL)", e))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| BridgeError::errno("fcntl(F_SETFL)", e))?;
    tracing::debug!("fd {} switched to non-blocking", fd);
    Ok(())
}

/// Whether `fd` is in non-blocking mode.
pub fn is_nonblocking(fd: RawFd) -> Result<bool, BridgeError> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| BridgeError::errno("fcntl(F_GETFL)", e))?;
    Ok(OFlag::from_bits_truncate(flags).contains(OFlag::O_NONBLOCK))
}

/// Waits until `fd` is readable or `timeout` elapses. Returns `false` on
/// timeout. Interrupted waits resume with the remaining time.
pub fn wait_readable(fd: RawFd, timeout: Duration) -> Result<bool, BridgeError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let millis = i32::try_from(remaining.as_millis()).unwrap_or(i32::MAX);
        let poll_timeout = PollTimeout::try_from(millis)
            .map_err(|_| BridgeError::invalid(format!("poll timeout {:?} out of range", timeout)))?;
        // SAFETY: `fd` belongs to a channel that is live for the duration of
        // the poll call.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        match poll(&mut fds, poll_timeout) {
            Ok(0) => return Ok(false),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                    return Err(BridgeError::errno("poll", Errno::EIO));
                }
                return Ok(true);
            }
            Err(Errno::EINTR) if Instant::now() < deadline => continue,
            Err(Errno::EINTR) => return Ok(false),
            Err(e) => return Err(BridgeError::errno("poll", e)),
        }
    }
}

/// Acknowledges a fetched connection manager event when dropped.
pub struct EventAck<'a, P: VerbsProvider> {
    provider: &'a P,
    event: NativePtr<P::CmEvent>,
}

impl<'a, P: VerbsProvider> EventAck<'a, P> {
    /// Takes responsibility for acknowledging `event`.
    ///
    /// # Safety
    ///
    /// `event` must have been fetched from `provider` and not yet acknowledged.
    pub unsafe fn new(provider: &'a P, event: NativePtr<P::CmEvent>) -> Self {
        Self { provider, event }
    }

    /// The event being held.
    pub fn event(&self) -> NativePtr<P::CmEvent> {
        self.event
    }
}

impl<P: VerbsProvider> Drop for EventAck<'_, P> {
    fn drop(&mut self) {
        // SAFETY: `new`'s contract: fetched, unacknowledged, and acknowledged
        // only here.
        if let Err(err) = unsafe { self.provider.ack_cm_event(self.event) } {
            tracing::error!("failed to acknowledge cm event: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;
    use std::os::fd::AsRawFd;

    use nix::sys::eventfd::EfdFlags;
    use nix::sys::eventfd::EventFd;

    use super::*;

    #[test]
    fn test_arm_nonblocking() {
        let efd = EventFd::from_flags(EfdFlags::EFD_CLOEXEC).unwrap();
        let fd = efd.as_fd().as_raw_fd();
        assert!(!is_nonblocking(fd).unwrap());
        arm_nonblocking(fd).unwrap();
        assert!(is_nonblocking(fd).unwrap());
        // Arming twice is harmless.
        arm_nonblocking(fd).unwrap();
        assert!(is_nonblocking(fd).unwrap());
    }

    #[test]
    fn test_wait_times_out_within_bounds() {
        let efd = EventFd::from_flags(EfdFlags::EFD_CLOEXEC).unwrap();
        let start = Instant::now();
        let ready = wait_readable(efd.as_fd().as_raw_fd(), Duration::from_millis(50)).unwrap();
        let elapsed = start.elapsed();
        assert!(!ready);
        assert!(elapsed >= Duration::from_millis(45), "returned early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1000), "overslept: {:?}", elapsed);
    }

    #[test]
    fn test_wait_sees_pending_event() {
        let efd = EventFd::from_flags(EfdFlags::EFD_CLOEXEC).unwrap();
        efd.write(1).unwrap();
        assert!(wait_readable(efd.as_fd().as_raw_fd(), Duration::from_millis(10)).unwrap());
        assert!(wait_readable(efd.as_fd().as_raw_fd(), Duration::ZERO).unwrap());
    }

    #[test]
    fn test_closed_fd_is_an_error() {
        assert!(arm_nonblocking(-1).is_err());
    }
}
