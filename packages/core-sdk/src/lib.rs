pub mod config;
pub mod db;
pub mod interceptor;
pub mod llm;
pub mod models;
pub mod screen;
pub mod secrets;
pub mod server;
pub mod telemetry;

/**
 * \brief Prelude with the modules and types most callers need.
 */
pub mod prelude {
    pub use crate::config::AppConfig;
    pub use crate::llm::{ChatClient, Failure, SendOutcome};
    pub use crate::screen::{ChatScreen, ChatSession, Notice, ScreenEvent};
    pub use crate::secrets::{CredentialStore, EncryptedPrefs};
    pub use crate::{db, llm, models, server, telemetry};
}
