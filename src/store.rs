//! Durable key/value state that survives daemon restarts.
//!
//! The watchdog's fault counters, restart history and last performance
//! snapshot are written through here after every mutation. The on-disk form
//! is a versioned JSON document; a backup sidecar guards against corruption
//! mid-write and file permissions are restricted to the owning user.

use ahash::AHashMap;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Current on-disk schema version.
const SCHEMA_VERSION: u32 = 1;

/// Serialized document layout. Unknown fields are ignored and missing ones
/// default, which is the whole migration policy.
#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    entries: AHashMap<String, Value>,
}

fn default_version() -> u32 {
    SCHEMA_VERSION
}

/// Persistent key/value store with write-through semantics.
///
/// Reads are served from the in-memory map; every `set` rewrites the whole
/// file under the store lock. A write failure keeps the in-memory map
/// authoritative and leaves the `.backup` sidecar as last known good.
pub struct PersistentStateStore {
    path: PathBuf,
    inner: Mutex<AHashMap<String, Value>>,
    #[cfg(test)]
    fail_next_write: std::sync::atomic::AtomicBool,
    #[cfg(feature = "encrypted-state")]
    cipher: chacha20poly1305::ChaCha20Poly1305,
}

impl PersistentStateStore {
    /// Opens the store, loading existing state from disk.
    ///
    /// Read or parse failures are logged and the store starts empty; a
    /// missing state file must never take the daemon down.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        #[cfg(feature = "encrypted-state")]
        let cipher = {
            use chacha20poly1305::{ChaCha20Poly1305, KeyInit};
            let key = load_or_create_key(&key_path(&path));
            ChaCha20Poly1305::new((&key).into())
        };
        #[cfg(not(feature = "encrypted-state"))]
        info!("state encryption not compiled in, persisting plaintext");

        let mut store = Self {
            path,
            inner: Mutex::new(AHashMap::new()),
            #[cfg(test)]
            fail_next_write: std::sync::atomic::AtomicBool::new(false),
            #[cfg(feature = "encrypted-state")]
            cipher,
        };

        match store.load_from_disk() {
            Ok(entries) => *store.inner.get_mut() = entries,
            Err(e) => warn!("could not load state from {}: {e:#}", store.path.display()),
        }
        store
    }

    fn load_from_disk(&self) -> Result<AHashMap<String, Value>> {
        let path = &self.path;
        if !path.exists() {
            info!("no state file at {}, starting fresh", path.display());
            return Ok(AHashMap::new());
        }

        let raw = fs::read(path).with_context(|| format!("reading {}", path.display()))?;

        #[cfg(feature = "encrypted-state")]
        let raw = unseal(&self.cipher, &raw)?;

        let doc: StateDocument =
            serde_json::from_slice(&raw).context("parsing state document")?;
        if doc.version > SCHEMA_VERSION {
            warn!(
                "state file version {} is newer than supported {}, loading best-effort",
                doc.version, SCHEMA_VERSION
            );
        }
        info!(
            "loaded {} state entries from {}",
            doc.entries.len(),
            path.display()
        );
        Ok(doc.entries)
    }

    /// Pure lookup from the in-memory map.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().await.get(key).cloned()
    }

    /// Typed convenience over [`get`](Self::get).
    pub async fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("state entry '{key}' has unexpected shape: {e}");
                None
            }
        }
    }

    /// Writes a key and flushes the whole map to disk.
    ///
    /// On I/O failure the in-memory value is kept and the error is returned
    /// for the caller to log; the previous file survives as `.backup`.
    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.insert(key.to_string(), value);
        self.flush_locked(&inner)
    }

    /// Flushes the current map without changing it (shutdown path).
    pub async fn flush(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        self.flush_locked(&inner)
    }

    fn flush_locked(&self, entries: &AHashMap<String, Value>) -> Result<()> {
        let doc = StateDocument {
            version: SCHEMA_VERSION,
            entries: entries.clone(),
        };
        let raw = serde_json::to_vec_pretty(&doc).context("serializing state")?;

        #[cfg(feature = "encrypted-state")]
        let raw = seal(&self.cipher, &raw)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }

        let backup = backup_path(&self.path);
        if self.path.exists() {
            fs::rename(&self.path, &backup)
                .with_context(|| format!("backing up to {}", backup.display()))?;
        }

        if let Err(e) = self.write_primary(&raw) {
            error!(
                "state write failed, last good copy kept at {}: {e:#}",
                backup.display()
            );
            return Err(e);
        }

        if backup.exists() {
            let _ = fs::remove_file(&backup);
        }
        Ok(())
    }

    /// Write step of the flush, behind a seam so tests can fail it after
    /// the backup rename happened.
    fn write_primary(&self, raw: &[u8]) -> Result<()> {
        #[cfg(test)]
        if self
            .fail_next_write
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            anyhow::bail!("injected write failure");
        }
        write_restricted(&self.path, raw)
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".backup");
    PathBuf::from(os)
}

#[cfg(feature = "encrypted-state")]
fn key_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".state_key");
    PathBuf::from(os)
}

/// Writes the file and restricts it to owner read/write.
fn write_restricted(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod 0600 {}", path.display()))?;
    }
    Ok(())
}

#[cfg(feature = "encrypted-state")]
fn load_or_create_key(path: &Path) -> [u8; 32] {
    use rand::RngCore;

    if let Ok(raw) = fs::read(path) {
        if raw.len() == 32 {
            let mut key = [0u8; 32];
            key.copy_from_slice(&raw);
            return key;
        }
        warn!("state key at {} has wrong length, regenerating", path.display());
    }

    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    if let Err(e) = write_restricted(path, &key) {
        warn!("could not persist state key: {e:#}");
    } else {
        info!("generated new state key at {}", path.display());
    }
    key
}

#[cfg(feature = "encrypted-state")]
fn seal(cipher: &chacha20poly1305::ChaCha20Poly1305, plain: &[u8]) -> Result<Vec<u8>> {
    use chacha20poly1305::aead::{Aead, AeadCore, OsRng};
    use chacha20poly1305::ChaCha20Poly1305;

    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let sealed = cipher
        .encrypt(&nonce, plain)
        .map_err(|e| anyhow::anyhow!("encrypting state: {e}"))?;
    let mut out = nonce.to_vec();
    out.extend_from_slice(&sealed);
    Ok(out)
}

#[cfg(feature = "encrypted-state")]
fn unseal(cipher: &chacha20poly1305::ChaCha20Poly1305, raw: &[u8]) -> Result<Vec<u8>> {
    use chacha20poly1305::aead::Aead;

    if raw.len() < 12 {
        anyhow::bail!("state file too short to contain a nonce");
    }
    let (nonce, sealed) = raw.split_at(12);
    cipher
        .decrypt(chacha20poly1305::Nonce::from_slice(nonce), sealed)
        .map_err(|e| anyhow::anyhow!("decrypting state: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn round_trips_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = PersistentStateStore::open(&path);
        store.set("restart_count", json!(7)).await.unwrap();
        store.set("last_reason", json!("memory leak")).await.unwrap();
        drop(store);

        let store = PersistentStateStore::open(&path);
        assert_eq!(store.get("restart_count").await, Some(json!(7)));
        assert_eq!(store.get("last_reason").await, Some(json!("memory leak")));
    }

    #[tokio::test]
    async fn starts_empty_on_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();

        let store = PersistentStateStore::open(&path);
        assert_eq!(store.get("anything").await, None);
        // And it can still write afterwards.
        store.set("k", json!(1)).await.unwrap();
    }

    #[tokio::test]
    async fn failed_write_keeps_backup_as_last_known_good() {
        use std::sync::atomic::Ordering;

        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = PersistentStateStore::open(&path);
        store.set("restart_count", json!(4)).await.unwrap();

        store.fail_next_write.store(true, Ordering::SeqCst);
        assert!(store.set("restart_count", json!(5)).await.is_err());

        // The sidecar still holds the previous document.
        let backup = fs::read(backup_path(&path)).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&backup).unwrap();
        assert_eq!(doc["entries"]["restart_count"], json!(4));

        // The in-memory map stays authoritative.
        assert_eq!(store.get("restart_count").await, Some(json!(5)));

        // The next write recovers and clears the sidecar.
        store.set("restart_count", json!(6)).await.unwrap();
        assert!(!backup_path(&path).exists());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn backup_removed_after_successful_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = PersistentStateStore::open(&path);
        store.set("a", json!(1)).await.unwrap();
        store.set("b", json!(2)).await.unwrap();

        assert!(path.exists());
        assert!(!backup_path(&path).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn state_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = PersistentStateStore::open(&path);
        store.set("a", json!(1)).await.unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn unknown_fields_are_tolerated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            br#"{"version":1,"entries":{"k":5},"future_field":true}"#,
        )
        .unwrap();

        let store = PersistentStateStore::open(&path);
        assert_eq!(store.get("k").await, Some(json!(5)));
    }

    #[tokio::test]
    async fn newer_version_loads_best_effort() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, br#"{"version":9,"entries":{"k":"v"}}"#).unwrap();

        let store = PersistentStateStore::open(&path);
        assert_eq!(store.get("k").await, Some(json!("v")));
    }

    #[tokio::test]
    async fn typed_get_falls_back_on_shape_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = PersistentStateStore::open(&path);
        store.set("n", json!("not a number")).await.unwrap();
        assert_eq!(store.get_as::<u64>("n").await, None);
        store.set("n", json!(42)).await.unwrap();
        assert_eq!(store.get_as::<u64>("n").await, Some(42));
    }
}
