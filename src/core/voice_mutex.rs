//
// Copyright 2024 the worldvoice authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Wrapper around `std::sync::Mutex::lock()` that on error consumes the
//! poisoned mutex and returns a simple error code carrying a human
//! readable label.

use std::sync::{Mutex, MutexGuard};

use crate::common::Result;
use crate::error::VoiceError;

pub struct VoiceMutex<T: ?Sized> {
    /// Human readable label for the mutex
    label: String,
    /// The actual mutex
    mutex: Mutex<T>,
}

impl<T> VoiceMutex<T> {
    /// Creates a new VoiceMutex
    pub fn new(t: T, label: &str) -> VoiceMutex<T> {
        VoiceMutex {
            mutex: Mutex::new(t),
            label: label.to_string(),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        match self.mutex.lock() {
            Ok(v) => Ok(v),
            Err(_) => Err(VoiceError::MutexPoisoned(self.label.clone()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_mutate() {
        let mutex = VoiceMutex::new(1u32, "test");
        {
            let mut guard = mutex.lock().unwrap();
            *guard += 1;
        }
        assert_eq!(2, *mutex.lock().unwrap());
    }
}
