//! CA Store
//!
//! On-disk state of one certificate authority, rooted at a single directory:
//!
//! ```text
//! <store>/
//!   private/       0700  private keys (ca.key.pem, <id>.key.pem)
//!   certs/               certificates by name (ca.cert.pem, <id>.cert.pem)
//!   newcerts/            every issued certificate by serial (<SERIAL>.pem)
//!   csr/                 certificate requests (<id>.csr.pem)
//!   bundles/       0700  PKCS#12 export bundles (<id>.p12)
//!   index.jsonl    0600  ledger
//!   serial         0600  next serial number (hex)
//!   .lock          0600  store-wide lock
//! ```
//!
//! # Staged Writes
//! Nothing is written at a final path directly. Files are first created as `.staged-*`
//! temp files (mode 0600) in their target directory and renamed into place once the ledger
//! entry for the certificate has been committed. Dropping a [`StagedFile`] removes it, so an
//! aborted issuance leaves nothing behind; leftovers from a crashed process are removed by
//! [`CaStore::sweep_stale`].

use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{CaError, Result};
use crate::ledger::Ledger;
use crate::policy::ROOT_IDENTIFIER;
use crate::serial::{SerialAllocator, StoreLock, INITIAL_SERIAL};

const PRIVATE_DIR: &str = "private";
const CERTS_DIR: &str = "certs";
const NEWCERTS_DIR: &str = "newcerts";
const CSR_DIR: &str = "csr";
const BUNDLES_DIR: &str = "bundles";
const LEDGER_FILE: &str = "index.jsonl";
const SERIAL_FILE: &str = "serial";
const LOCK_FILE: &str = ".lock";
const STAGED_PREFIX: &str = ".staged-";

pub const PRIVATE_DIR_MODE: u32 = 0o700;
pub const KEY_FILE_MODE: u32 = 0o400;
pub const CERT_FILE_MODE: u32 = 0o444;
pub const STATE_FILE_MODE: u32 = 0o600;

pub struct CaStore {
    root: PathBuf,
    lock_timeout: Duration,
}

impl CaStore {
    /// Create the store layout at `path`.
    ///
    /// The private-key area is created and chmod-ed to 0700 before anything else is written.
    pub fn init<P: AsRef<Path>>(path: P, lock_timeout: Duration) -> Result<Self> {
        let store = Self {
            root: path.as_ref().to_path_buf(),
            lock_timeout,
        };
        if store.ledger_path().exists() || store.serial_path().exists() {
            return Err(CaError::AlreadyInitialized(format!(
                "CA store at {} already has a ledger or serial counter",
                store.root.display()
            )));
        }
        fs::create_dir_all(&store.root)?;

        DirBuilder::new()
            .recursive(true)
            .mode(PRIVATE_DIR_MODE)
            .create(store.private_dir())?;
        // umask may have narrowed or the directory may predate us
        fs::set_permissions(store.private_dir(), Permissions::from_mode(PRIVATE_DIR_MODE))?;

        DirBuilder::new()
            .recursive(true)
            .mode(PRIVATE_DIR_MODE)
            .create(store.bundles_dir())?;
        for dir in [store.certs_dir(), store.newcerts_dir(), store.csr_dir()] {
            fs::create_dir_all(dir)?;
        }

        // create_new makes a racing second init fail here
        let mut serial_file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(STATE_FILE_MODE)
            .open(store.serial_path())
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(CaError::AlreadyInitialized(format!(
                    "serial counter already exists in {}",
                    store.root.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        serial_file.write_all(format!("{}\n", INITIAL_SERIAL).as_bytes())?;
        serial_file.sync_all()?;

        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(STATE_FILE_MODE)
            .open(store.ledger_path())?
            .sync_all()?;

        info!(store = %store.root.display(), "Initialized CA store");
        Ok(store)
    }

    /// Open an initialized store.
    pub fn open<P: AsRef<Path>>(path: P, lock_timeout: Duration) -> Result<Self> {
        let store = Self {
            root: path.as_ref().to_path_buf(),
            lock_timeout,
        };
        if !store.ledger_path().is_file() || !store.serial_path().is_file() {
            return Err(CaError::NotInitialized(store.root.clone()));
        }
        let mode = fs::metadata(store.private_dir())?.permissions().mode() & 0o777;
        if mode != PRIVATE_DIR_MODE {
            warn!(
                path = %store.private_dir().display(),
                mode = %format!("{:o}", mode),
                "Private key area had loose permissions, resetting to 0700"
            );
            fs::set_permissions(store.private_dir(), Permissions::from_mode(PRIVATE_DIR_MODE))?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn private_dir(&self) -> PathBuf {
        self.root.join(PRIVATE_DIR)
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.root.join(CERTS_DIR)
    }

    pub fn newcerts_dir(&self) -> PathBuf {
        self.root.join(NEWCERTS_DIR)
    }

    pub fn csr_dir(&self) -> PathBuf {
        self.root.join(CSR_DIR)
    }

    pub fn bundles_dir(&self) -> PathBuf {
        self.root.join(BUNDLES_DIR)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(LEDGER_FILE)
    }

    pub fn serial_path(&self) -> PathBuf {
        self.root.join(SERIAL_FILE)
    }

    pub fn root_key_path(&self) -> PathBuf {
        self.private_dir().join(format!("{}.key.pem", ROOT_IDENTIFIER))
    }

    pub fn root_cert_path(&self) -> PathBuf {
        self.certs_dir().join(format!("{}.cert.pem", ROOT_IDENTIFIER))
    }

    pub fn leaf_key_path(&self, identifier: &str) -> PathBuf {
        self.private_dir().join(format!("{}.key.pem", identifier))
    }

    pub fn leaf_cert_path(&self, identifier: &str) -> PathBuf {
        self.certs_dir().join(format!("{}.cert.pem", identifier))
    }

    pub fn leaf_csr_path(&self, identifier: &str) -> PathBuf {
        self.csr_dir().join(format!("{}.csr.pem", identifier))
    }

    pub fn bundle_path(&self, identifier: &str) -> PathBuf {
        self.bundles_dir().join(format!("{}.p12", identifier))
    }

    pub fn issued_cert_path(&self, serial_hex: &str) -> PathBuf {
        self.newcerts_dir().join(format!("{}.pem", serial_hex))
    }

    pub fn ledger(&self) -> Ledger {
        Ledger::new(self.ledger_path())
    }

    pub fn serial_allocator(&self) -> SerialAllocator<'_> {
        SerialAllocator::new(self)
    }

    /// Take the store-wide exclusive lock, waiting at most the configured timeout.
    pub fn lock(&self) -> Result<StoreLock> {
        StoreLock::acquire(&self.root.join(LOCK_FILE), self.lock_timeout)
    }

    pub fn has_root(&self) -> bool {
        self.root_cert_path().is_file()
    }

    pub fn load_root_certificate(&self) -> Result<X509> {
        let path = self.root_cert_path();
        if !path.is_file() {
            return Err(CaError::RootNotFound(path));
        }
        let pem = fs::read(&path)?;
        X509::from_pem(&pem).map_err(|e| {
            CaError::VerificationError(format!(
                "failed to parse root certificate {}: {}",
                path.display(),
                e
            ))
        })
    }

    pub fn load_root_key(&self) -> Result<PKey<Private>> {
        let path = self.root_key_path();
        if !path.is_file() {
            return Err(CaError::RootNotFound(path));
        }
        let pem = fs::read(&path)?;
        PKey::private_key_from_pem(&pem).map_err(|e| CaError::signing("load root key", e))
    }

    /// Write `contents` to a fresh 0600 temp file inside `dir`.
    pub fn stage(&self, dir: &Path, contents: &[u8]) -> Result<StagedFile> {
        let mut file = tempfile::Builder::new()
            .prefix(STAGED_PREFIX)
            .tempfile_in(dir)?;
        file.as_file()
            .set_permissions(Permissions::from_mode(STATE_FILE_MODE))?;
        file.write_all(contents)?;
        file.as_file().sync_all()?;
        Ok(StagedFile { file })
    }

    /// Remove `.staged-*` files left by an interrupted process. Call with the lock held.
    pub fn sweep_stale(&self, _lock: &StoreLock) -> Result<usize> {
        let mut removed = 0;
        for dir in [
            self.root.clone(),
            self.private_dir(),
            self.certs_dir(),
            self.newcerts_dir(),
            self.csr_dir(),
            self.bundles_dir(),
        ] {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let is_staged = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(STAGED_PREFIX));
                if is_staged && entry.file_type()?.is_file() {
                    fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            warn!(count = removed, "Removed stale staged files from an aborted run");
        }
        Ok(removed)
    }
}

/// A temp file waiting to be published under its final name.
pub struct StagedFile {
    file: NamedTempFile,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Set `mode` and atomically rename onto `destination`.
    pub fn publish(self, destination: &Path, mode: u32) -> Result<PathBuf> {
        self.file
            .as_file()
            .set_permissions(Permissions::from_mode(mode))?;
        self.file
            .persist(destination)
            .map_err(|e| CaError::Io(e.error))?;
        debug!(path = %destination.display(), mode = %format!("{:o}", mode), "Published");
        Ok(destination.to_path_buf())
    }
}

/// Permission bits of `path`.
pub fn file_mode(path: &Path) -> Result<u32> {
    Ok(fs::metadata(path)?.permissions().mode() & 0o777)
}
