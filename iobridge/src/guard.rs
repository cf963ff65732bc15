/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use crate::handle::ResourceClass;

/// Reader/writer lock owned by one resource class.
///
/// Poisoning is recovered: every critical section under this guard is a
/// single map insert or remove, so a panicking holder cannot leave a torn
/// entry behind.
#[derive(Debug)]
pub struct ClassGuard<T> {
    class: ResourceClass,
    lock: RwLock<T>,
}

impl<T> ClassGuard<T> {
    /// Guards `value` on behalf of `class`.
    pub fn new(class: ResourceClass, value: T) -> Self {
        Self {
            class,
            lock: RwLock::new(value),
        }
    }

    /// The class this guard serializes.
    pub fn class(&self) -> ResourceClass {
        self.class
    }

    /// Shared access for lookups and read-only queries.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.lock.read().unwrap_or_else(|poisoned| {
            tracing::warn!("{} guard was poisoned, recovering", self.class);
            PoisonError::into_inner(poisoned)
        })
    }

    /// Exclusive access for table mutation.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.lock.write().unwrap_or_else(|poisoned| {
            tracing::warn!("{} guard was poisoned, recovering", self.class);
            PoisonError::into_inner(poisoned)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_poisoned_guard_recovers() {
        let guard = Arc::new(ClassGuard::new(ResourceClass::CompletionQueue, vec![1u32]));
        let poisoner = guard.clone();
        let _ = std::thread::spawn(move || {
            let _held = poisoner.write();
            panic!("poison the guard");
        })
        .join();
        guard.write().push(2);
        assert_eq!(*guard.read(), vec![1, 2]);
        assert_eq!(guard.class(), ResourceClass::CompletionQueue);
    }
}
