//! CA Ledger
//!
//! Append-only record of every certificate issued by the store, one JSON object per line
//! in `<store>/index.jsonl`:
//!
//! ```text
//! {"serial":"1000","kind":"root","subject":{...},"issuer":"S/MIME Root CA",
//!  "issued_at":"2026-01-01T00:00:00Z","expires_at":"2036-01-01T00:00:00Z","status":"valid"}
//! ```
//!
//! Entries are appended only while the store lock is held, so file order equals serial
//! allocation order. Readers take no lock: a line is written with a single `write`, a torn
//! trailing line from a crashed writer is ignored by readers and cut off by the next append.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CaError, Result};
use crate::policy::ProfileKind;
use crate::serial::StoreLock;

/// Status as written to the ledger. `expired` is never stored, see [`CertificateStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordedStatus {
    Valid,
    Revoked,
}

/// Status of an entry at a given moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    Valid,
    Expired,
    Revoked,
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CertificateStatus::Valid => "valid",
            CertificateStatus::Expired => "expired",
            CertificateStatus::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSubject {
    pub common_name: String,
    pub email: String,
    /// File-name identifier (`ca` for the root, email local part for leaves)
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Upper-case hex, no leading zeros
    pub serial: String,
    pub kind: ProfileKind,
    pub subject: LedgerSubject,
    /// Common name of the issuing root
    pub issuer: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: RecordedStatus,
}

impl LedgerEntry {
    pub fn status_at(&self, now: DateTime<Utc>) -> CertificateStatus {
        match self.status {
            RecordedStatus::Revoked => CertificateStatus::Revoked,
            RecordedStatus::Valid if now > self.expires_at => CertificateStatus::Expired,
            RecordedStatus::Valid => CertificateStatus::Valid,
        }
    }
}

pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// All entries in commit order.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let content = fs::read_to_string(&self.path)?;
        let complete = content.ends_with('\n');
        let lines: Vec<&str> = content.lines().collect();
        let mut entries = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if index + 1 == lines.len() && !complete => {
                    warn!(error = %e, "Ignoring torn trailing ledger line");
                }
                Err(e) => {
                    return Err(CaError::Ledger(format!(
                        "{} line {}: {}",
                        self.path.display(),
                        index + 1,
                        e
                    )));
                }
            }
        }
        Ok(entries)
    }

    pub fn serials(&self) -> Result<HashSet<String>> {
        Ok(self.entries()?.into_iter().map(|e| e.serial).collect())
    }

    pub fn find_by_serial(&self, serial: &str) -> Result<Option<LedgerEntry>> {
        Ok(self.entries()?.into_iter().find(|e| e.serial == serial))
    }

    /// Most recent entry issued to `identifier`.
    pub fn latest_for_identifier(&self, identifier: &str) -> Result<Option<LedgerEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .rev()
            .find(|e| e.subject.identifier == identifier))
    }

    /// Append `entry`. Rejects a serial that is already recorded.
    pub fn append(&self, entry: &LedgerEntry, _lock: &StoreLock) -> Result<()> {
        if self.serials()?.contains(&entry.serial) {
            return Err(CaError::SerialCollision(format!(
                "serial {} is already recorded in the ledger",
                entry.serial
            )));
        }

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        // drop a torn line left by a crashed writer; we hold the lock, nobody else appends
        let content = fs::read(&self.path)?;
        let intact_len = content
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |i| i + 1);
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        if intact_len < content.len() {
            warn!(
                bytes = content.len() - intact_len,
                "Truncating torn trailing ledger line"
            );
            file.set_len(intact_len as u64)?;
        }
        file.seek(SeekFrom::Start(intact_len as u64))?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CaStore;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use tempfile::TempDir;

    fn entry(serial: &str, identifier: &str, expires_in: ChronoDuration) -> LedgerEntry {
        let issued_at = Utc::now();
        LedgerEntry {
            serial: serial.to_string(),
            kind: ProfileKind::Leaf,
            subject: LedgerSubject {
                common_name: format!("{}@example.com", identifier),
                email: format!("{}@example.com", identifier),
                identifier: identifier.to_string(),
            },
            issuer: "Test Root CA".to_string(),
            issued_at,
            expires_at: issued_at + expires_in,
            status: RecordedStatus::Valid,
        }
    }

    #[test]
    fn append_and_read_back_in_order() {
        let tmp = TempDir::new().unwrap();
        let store = CaStore::init(tmp.path(), Duration::from_secs(5)).unwrap();
        let ledger = store.ledger();
        let lock = store.lock().unwrap();

        ledger.append(&entry("1000", "alice", ChronoDuration::days(1)), &lock).unwrap();
        ledger.append(&entry("1001", "bob", ChronoDuration::days(1)), &lock).unwrap();
        ledger.append(&entry("1002", "alice", ChronoDuration::days(1)), &lock).unwrap();

        let serials: Vec<String> = ledger.entries().unwrap().into_iter().map(|e| e.serial).collect();
        assert_eq!(serials, vec!["1000", "1001", "1002"]);
        assert_eq!(
            ledger.latest_for_identifier("alice").unwrap().unwrap().serial,
            "1002"
        );
        assert!(ledger.find_by_serial("1001").unwrap().is_some());
        assert!(ledger.find_by_serial("2000").unwrap().is_none());
    }

    #[test]
    fn duplicate_serial_is_a_collision() {
        let tmp = TempDir::new().unwrap();
        let store = CaStore::init(tmp.path(), Duration::from_secs(5)).unwrap();
        let ledger = store.ledger();
        let lock = store.lock().unwrap();

        ledger.append(&entry("1000", "alice", ChronoDuration::days(1)), &lock).unwrap();
        let err = ledger
            .append(&entry("1000", "bob", ChronoDuration::days(1)), &lock)
            .unwrap_err();
        assert!(matches!(err, CaError::SerialCollision(_)));
        assert_eq!(ledger.entries().unwrap().len(), 1);
    }

    #[test]
    fn expired_is_derived_from_time() {
        let e = entry("1000", "alice", ChronoDuration::days(1));
        assert_eq!(e.status_at(Utc::now()), CertificateStatus::Valid);
        assert_eq!(
            e.status_at(e.expires_at + ChronoDuration::seconds(1)),
            CertificateStatus::Expired
        );

        let mut revoked = e.clone();
        revoked.status = RecordedStatus::Revoked;
        assert_eq!(revoked.status_at(Utc::now()), CertificateStatus::Revoked);
    }

    #[test]
    fn torn_trailing_line_is_ignored_and_truncated() {
        let tmp = TempDir::new().unwrap();
        let store = CaStore::init(tmp.path(), Duration::from_secs(5)).unwrap();
        let ledger = store.ledger();
        let lock = store.lock().unwrap();

        ledger.append(&entry("1000", "alice", ChronoDuration::days(1)), &lock).unwrap();
        let mut file = OpenOptions::new().append(true).open(store.ledger_path()).unwrap();
        file.write_all(br#"{"serial":"10"#).unwrap();
        assert_eq!(ledger.entries().unwrap().len(), 1);

        ledger.append(&entry("1001", "bob", ChronoDuration::days(1)), &lock).unwrap();
        let serials: Vec<String> = ledger.entries().unwrap().into_iter().map(|e| e.serial).collect();
        assert_eq!(serials, vec!["1000", "1001"]);
        assert!(fs::read_to_string(store.ledger_path()).unwrap().ends_with("}\n"));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&entry("1000", "alice", ChronoDuration::days(1))).unwrap();
        assert!(json.contains(r#""status":"valid""#));
        assert!(json.contains(r#""kind":"leaf""#));
    }
}
