//! Serial Allocator
//!
//! Hands out certificate serial numbers from the persisted counter in `<store>/serial`.
//! The counter is hex text (the format OpenSSL's `ca` uses) and holds the *next* serial.
//!
//! Allocation is read → check against ledger → persist value+1 → return, and only runs
//! while the caller holds the store-wide [`StoreLock`], an exclusive file lock (`flock(2)` on Linux) on
//! `<store>/.lock`. Two processes (or two threads with their own lock handles) can never
//! observe the same counter value.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use openssl::bn::BigNum;
use tracing::{debug, warn};

use crate::error::{CaError, Result};
use crate::store::{CaStore, STATE_FILE_MODE};

/// Counter value of a fresh store (hex).
pub const INITIAL_SERIAL: &str = "1000";

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);
const MAX_SKIPPED_SERIALS: usize = 16;

/// Exclusive lock on the store. Released on drop.
pub struct StoreLock {
    file: File,
}

impl StoreLock {
    /// Poll a non-blocking exclusive lock until it succeeds or `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(STATE_FILE_MODE)
            .open(path)?;
        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock() {
                Ok(()) => {
                    debug!(path = %path.display(), "Acquired store lock");
                    return Ok(Self { file });
                }
                Err(TryLockError::WouldBlock) => {}
                Err(TryLockError::Error(e)) if e.kind() == ErrorKind::Interrupted => {}
                Err(TryLockError::Error(e)) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Err(CaError::LockTimeout(timeout));
            }
            thread::sleep(LOCK_POLL_INTERVAL);
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        // closing the file releases the lock as well
        if let Err(e) = self.file.unlock() {
            warn!(error = %e, "Failed to release store lock");
        }
    }
}

pub struct SerialAllocator<'a> {
    store: &'a CaStore,
}

impl<'a> SerialAllocator<'a> {
    pub fn new(store: &'a CaStore) -> Self {
        Self { store }
    }

    /// Current counter value (the next serial to be handed out).
    pub fn peek(&self) -> Result<BigNum> {
        let text = fs::read_to_string(self.store.serial_path())?;
        BigNum::from_hex_str(text.trim()).map_err(|e| {
            CaError::Ledger(format!("serial counter {:?} is not hex: {}", text.trim(), e))
        })
    }

    /// Take the lock, allocate one serial, release the lock.
    pub fn next_serial(&self) -> Result<BigNum> {
        let lock = self.store.lock()?;
        self.allocate(&lock)
    }

    /// Allocate a serial while `lock` is held.
    ///
    /// Values already present in the ledger are skipped; a run of more than
    /// `MAX_SKIPPED_SERIALS` such values is reported as `SerialCollision`.
    pub fn allocate(&self, _lock: &StoreLock) -> Result<BigNum> {
        let issued = self.store.ledger().serials()?;
        let mut candidate = self.peek()?;
        let mut skipped = 0;
        loop {
            let hex = candidate
                .to_hex_str()
                .map_err(|e| CaError::Ledger(e.to_string()))?
                .to_string();
            if !issued.contains(&hex) {
                break;
            }
            skipped += 1;
            warn!(serial = %hex, "Serial counter points at an issued serial, skipping");
            if skipped > MAX_SKIPPED_SERIALS {
                return Err(CaError::SerialCollision(format!(
                    "{} consecutive serials up to {} already issued",
                    skipped, hex
                )));
            }
            candidate = increment(&candidate)?;
        }

        let next = increment(&candidate)?;
        let next_hex = next
            .to_hex_str()
            .map_err(|e| CaError::Ledger(e.to_string()))?;
        let staged = self
            .store
            .stage(self.store.path(), format!("{}\n", &*next_hex).as_bytes())?;
        staged.publish(&self.store.serial_path(), STATE_FILE_MODE)?;
        Ok(candidate)
    }
}

fn increment(value: &BigNum) -> Result<BigNum> {
    let mut next = BigNum::new().map_err(|e| CaError::Ledger(e.to_string()))?;
    let one = BigNum::from_u32(1).map_err(|e| CaError::Ledger(e.to_string()))?;
    next.checked_add(value, &one)
        .map_err(|e| CaError::Ledger(e.to_string()))?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store(timeout: Duration) -> (TempDir, CaStore) {
        let tmp = TempDir::new().unwrap();
        let store = CaStore::init(tmp.path(), timeout).unwrap();
        (tmp, store)
    }

    #[test]
    fn allocates_monotonically_from_initial_value() {
        let (_tmp, store) = store(Duration::from_secs(5));
        let allocator = store.serial_allocator();
        let first = allocator.next_serial().unwrap();
        let second = allocator.next_serial().unwrap();
        assert_eq!(&**first.to_hex_str().unwrap(), "1000");
        assert_eq!(&**second.to_hex_str().unwrap(), "1001");
        assert_eq!(fs::read_to_string(store.serial_path()).unwrap(), "1002\n");
    }

    #[test]
    fn concurrent_allocation_yields_distinct_serials() {
        let tmp = TempDir::new().unwrap();
        CaStore::init(tmp.path(), Duration::from_secs(30)).unwrap();
        let root = Arc::new(tmp.path().to_path_buf());

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let root = Arc::clone(&root);
                thread::spawn(move || {
                    let store = CaStore::open(root.as_path(), Duration::from_secs(30)).unwrap();
                    let serial = store.serial_allocator().next_serial().unwrap();
                    serial.to_hex_str().unwrap().to_string()
                })
            })
            .collect();
        let serials: HashSet<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(serials.len(), 64);

        let store = CaStore::open(root.as_path(), Duration::from_secs(5)).unwrap();
        // 0x1000 + 64 = 0x1040
        assert_eq!(&**store.serial_allocator().peek().unwrap().to_hex_str().unwrap(), "1040");
    }

    #[test]
    fn lock_times_out_while_held() {
        let (_tmp, store) = store(Duration::from_millis(100));
        let _held = store.lock().unwrap();
        let started = Instant::now();
        let err = store.lock().err().unwrap();
        assert!(matches!(err, CaError::LockTimeout(_)));
        assert!(err.is_retryable());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn lock_is_released_on_drop() {
        let (_tmp, store) = store(Duration::from_millis(100));
        drop(store.lock().unwrap());
        assert!(store.lock().is_ok());
    }

    #[test]
    fn corrupted_counter_is_reported() {
        let (_tmp, store) = store(Duration::from_secs(5));
        fs::write(store.serial_path(), "not-a-number\n").unwrap();
        assert!(matches!(
            store.serial_allocator().next_serial(),
            Err(CaError::Ledger(_))
        ));
    }
}
