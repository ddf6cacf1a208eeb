use std::sync::Arc;

use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::Request;

use crate::secrets::{CredentialStore, API_KEY};

/**
 * \brief Attaches `Authorization: Bearer <credential>` to outgoing requests.
 * \details Reads the store on every call and never writes to it. Never fails: a missing or
 *          unreadable credential becomes an empty bearer and the server decides.
 */
#[derive(Clone)]
pub struct AuthInterceptor {
    credentials: Arc<dyn CredentialStore>,
}

impl AuthInterceptor {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self { credentials }
    }

    /**
     * \brief Current credential; absence and read errors both yield `""`.
     */
    pub fn current_credential(&self) -> String {
        match self.credentials.get(API_KEY) {
            Ok(value) => value.unwrap_or_default(),
            Err(err) => {
                tracing::warn!("credential read failed, sending empty bearer: {:#}", err);
                String::new()
            }
        }
    }

    /**
     * \brief Return `request` with its `Authorization` header set (replacing any existing one).
     */
    pub fn intercept(&self, mut request: Request) -> Request {
        let credential = self.current_credential();
        let mut value = HeaderValue::from_bytes(format!("Bearer {}", credential).as_bytes())
            .unwrap_or_else(|_| {
                tracing::warn!("stored credential is not a valid header value, sending empty bearer");
                HeaderValue::from_static("Bearer ")
            });
        value.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, value);
        request
    }
}
