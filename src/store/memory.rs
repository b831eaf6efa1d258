use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use super::{Error, Info, Meta, Storage};

/// A storage engine that keeps everything in memory and never expires anything.
///
/// Every key counts as a write log key in `info`.
#[derive(Default)]
pub struct Memory {
    keys: Mutex<HashMap<Bytes, (Bytes, Meta)>>,
    closed: AtomicBool,
}

impl Memory {
    pub fn new() -> Memory {
        Memory::default()
    }
}

impl Storage for Memory {
    fn put(&self, key: Bytes, value: Bytes) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if keys.contains_key(&key) {
            return Err(Error::KeyExists);
        }

        let meta = Meta {
            written_at: SystemTime::now(),
        };
        keys.insert(key, (value, meta));
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<(Bytes, Meta), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.get(key).cloned().ok_or(Error::KeyNotFound)
    }

    fn info(&self) -> Info {
        let total = self
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len() as u64;

        Info {
            write_log_keys: total,
            total_keys: total,
            ..Info::default()
        }
    }

    fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
