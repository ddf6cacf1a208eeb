use std::{
    collections::HashMap,
    fmt,
    fs,
    io::{self, Write},
    path::Path,
    sync::{Mutex, RwLock},
};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, bail, Context, Result};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::db;

/** \brief Name of the encrypted mapping (also the table name). */
pub const PREFS_NAME: &str = "secret_shared_prefs";

/** \brief Well-known key holding the API credential. */
pub const API_KEY: &str = "apiKey";

const MASTER_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const DIGEST_DOMAIN: &[u8] = b"pocketchat/secret_shared_prefs/key";

/**
 * \brief Key/value access to secrets. Absence is `Ok(None)`, never an error.
 */
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/**
 * \brief Write the empty placeholder under `apiKey` if nothing is stored yet.
 * \return `true` when the placeholder was written.
 */
pub fn ensure_placeholder(store: &dyn CredentialStore) -> Result<bool> {
    if store.get(API_KEY)?.is_some() {
        return Ok(false);
    }
    store.set(API_KEY, "")?;
    Ok(true)
}

/**
 * \brief Provisioning step: store the real credential, replacing any previous value.
 */
pub fn provision(store: &dyn CredentialStore, api_key: &str) -> Result<()> {
    store.set(API_KEY, api_key)
}

/**
 * \brief AES-256 master key, kept in its own file next to the database.
 */
pub struct MasterKey {
    bytes: [u8; MASTER_KEY_LEN],
}

impl MasterKey {
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; MASTER_KEY_LEN];
        bytes.copy_from_slice(key.as_slice());
        Self { bytes }
    }

    /**
     * \brief Load the key file, or create it with a fresh key on first use.
     * \details The key is written to a temp file in the same directory and linked into place
     *          without clobbering, so concurrent first opens agree on one complete key.
     */
    pub fn get_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }

        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let key = Self::generate();
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("create temp key file in {}", dir.display()))?;
        tmp.write_all(&key.bytes)?;
        tmp.as_file().sync_all()?;
        restrict_permissions(tmp.path())?;

        match tmp.persist_noclobber(path) {
            Ok(_) => {
                tracing::info!(path = %path.display(), "created new master key");
                Ok(key)
            }
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                tracing::debug!(path = %path.display(), "master key created concurrently, loading it");
                Self::load(path)
            }
            Err(err) => Err(err.error)
                .with_context(|| format!("create master key {}", path.display())),
        }
    }

    fn load(path: &Path) -> Result<Self> {
        let raw =
            fs::read(path).with_context(|| format!("read master key {}", path.display()))?;
        if raw.len() != MASTER_KEY_LEN {
            bail!(
                "master key {} has {} bytes, expected {}",
                path.display(),
                raw.len(),
                MASTER_KEY_LEN
            );
        }
        let mut bytes = [0u8; MASTER_KEY_LEN];
        bytes.copy_from_slice(&raw);
        Ok(Self { bytes })
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.bytes))
    }

    /* Deterministic keyed digest so lookups work without storing key names in clear. */
    fn digest(&self, name: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(DIGEST_DOMAIN);
        hasher.update(self.bytes);
        hasher.update(name.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/**
 * \brief Encrypted key/value store backed by the `secret_shared_prefs` table.
 * \details Keys are stored as keyed SHA-256 digests, values as `nonce || AES-256-GCM ciphertext`
 *          with the digest as associated data, so a row cannot be moved to another key.
 */
pub struct EncryptedPrefs {
    conn: Mutex<Connection>,
    key: MasterKey,
}

impl EncryptedPrefs {
    /**
     * \brief Open (and migrate) the database and load or create the master key.
     */
    pub fn open(db_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let conn = db::open_db(db_path).context("open database failed")?;
        db::migrate(&conn).context("apply migrations failed")?;
        let key = MasterKey::get_or_create(key_path)?;
        Ok(Self::with_connection(conn, key))
    }

    /**
     * \brief Wrap an already migrated connection.
     */
    pub fn with_connection(conn: Connection, key: MasterKey) -> Self {
        Self {
            conn: Mutex::new(conn),
            key,
        }
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        db::migrate(&conn)?;
        Ok(Self::with_connection(conn, MasterKey::generate()))
    }

    fn encrypt(&self, digest: &str, value: &str) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .key
            .cipher()
            .encrypt(
                &nonce,
                Payload {
                    msg: value.as_bytes(),
                    aad: digest.as_bytes(),
                },
            )
            .map_err(|_| anyhow!("encrypt {} entry failed", PREFS_NAME))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    fn decrypt(&self, digest: &str, blob: &[u8]) -> Result<String> {
        if blob.len() < NONCE_LEN {
            bail!("{} entry is truncated", PREFS_NAME);
        }
        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let plain = self
            .key
            .cipher()
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: digest.as_bytes(),
                },
            )
            .map_err(|_| anyhow!("decrypt {} entry failed (wrong master key?)", PREFS_NAME))?;
        String::from_utf8(plain).context("stored secret is not valid UTF-8")
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("{} connection lock poisoned", PREFS_NAME))
    }
}

impl CredentialStore for EncryptedPrefs {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let digest = self.key.digest(key);
        let blob = {
            let conn = self.lock()?;
            db::get_secret_blob(&conn, &digest)?
        };
        blob.map(|b| self.decrypt(&digest, &b)).transpose()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let digest = self.key.digest(key);
        let blob = self.encrypt(&digest, value)?;
        let conn = self.lock()?;
        db::put_secret_blob(&conn, &digest, &blob)
    }
}

/**
 * \brief Process-local store, for embedding and tests.
 */
#[derive(Debug, Default)]
pub struct MemoryCredentials {
    inner: RwLock<HashMap<String, String>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_key(api_key: &str) -> Self {
        let store = Self::new();
        if let Ok(mut guard) = store.inner.write() {
            guard.insert(API_KEY.to_string(), api_key.to_string());
        }
        store
    }
}

impl CredentialStore for MemoryCredentials {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let guard = self
            .inner
            .read()
            .map_err(|_| anyhow!("credential map lock poisoned"))?;
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| anyhow!("credential map lock poisoned"))?;
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
