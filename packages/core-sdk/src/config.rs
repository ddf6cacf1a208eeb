use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::{
    db,
    interceptor::AuthInterceptor,
    llm::{ChatClient, DEFAULT_API_BASE},
    secrets::{self, CredentialStore, EncryptedPrefs},
    telemetry,
};

/**
 * \brief Where the app keeps its state and which API it talks to.
 */
#[derive(Debug, Clone)]
pub struct AppConfig {
    /** \brief SQLite file holding `app_config` and `secret_shared_prefs`. */
    pub db_path: PathBuf,
    /** \brief Master key file; defaults to `<db_path>.key`. */
    pub key_path: PathBuf,
    /** \brief Event log directory; `logs/` next to the database. */
    pub log_dir: PathBuf,
    pub api_base: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new(db::DEFAULT_DB_PATH, None)
    }
}

impl AppConfig {
    pub fn new(db_path: impl AsRef<Path>, api_base: Option<&str>) -> Self {
        let db_path = db_path.as_ref().to_path_buf();
        let mut key_path = db_path.clone().into_os_string();
        key_path.push(".key");
        let log_dir = db_path
            .parent()
            .map(|dir| dir.join("logs"))
            .unwrap_or_else(|| PathBuf::from("logs"));
        Self {
            key_path: PathBuf::from(key_path),
            log_dir,
            db_path,
            api_base: api_base.unwrap_or(DEFAULT_API_BASE).to_string(),
        }
    }

    /**
     * \brief Open the encrypted store and write the empty credential placeholder if none
     *        exists yet.
     */
    pub fn open_store(&self) -> Result<Arc<EncryptedPrefs>> {
        let store = EncryptedPrefs::open(&self.db_path, &self.key_path)?;
        if secrets::ensure_placeholder(&store)? {
            tracing::info!("no api key stored yet, wrote empty placeholder");
        }
        Ok(Arc::new(store))
    }

    /**
     * \brief Client wired to `store` through the auth interceptor.
     */
    pub fn chat_client(&self, store: Arc<dyn CredentialStore>) -> Result<ChatClient> {
        ChatClient::new(&self.api_base, AuthInterceptor::new(store))
    }

    /**
     * \brief Point the event log at `log_dir` and apply the saved telemetry switch.
     * \details Process-wide; call once at start-up after `open_store` has migrated the db.
     */
    pub fn init_telemetry(&self) -> Result<()> {
        telemetry::set_log_dir(&self.log_dir);
        let conn = db::open_db(&self.db_path).context("open database failed")?;
        telemetry::set_enabled(db::get_telemetry_enabled(&conn)?);
        Ok(())
    }

    pub fn set_telemetry_enabled(&self, enabled: bool) -> Result<()> {
        let conn = db::open_db(&self.db_path).context("open database failed")?;
        db::migrate(&conn)?;
        db::set_telemetry_enabled(&conn, enabled)?;
        telemetry::set_enabled(enabled);
        Ok(())
    }
}
