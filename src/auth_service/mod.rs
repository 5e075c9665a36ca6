//! AuthService - Registration, login and bearer-token sessions
//!
//! Tokens are opaque UUIDs held in memory; restarting the hub invalidates
//! every session and clients simply log in again. Credential storage and
//! comparison live in the state store.

use crate::error::{Error, Result};
use crate::models::UserIdentity;
use crate::state_store::StateStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// AuthService instance
pub struct AuthService {
    store: Arc<dyn StateStore>,
    /// token -> identity
    sessions: RwLock<HashMap<String, UserIdentity>>,
}

impl AuthService {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a user account. `Conflict` if the email is taken.
    pub async fn register(&self, email: &str, name: &str, password: &str) -> Result<UserIdentity> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(Error::Validation(
                "email and password are required".to_string(),
            ));
        }

        let identity = self.store.create_user(email.trim(), name, password).await?;
        tracing::info!(user_id = identity.user_id, "User registered");
        Ok(identity)
    }

    /// Verify credentials and mint a session token.
    ///
    /// Unknown email and wrong password are indistinguishable to the caller.
    pub async fn login(&self, email: &str, password: &str) -> Result<(String, UserIdentity)> {
        let record = self
            .store
            .find_user(email.trim())
            .await?
            .filter(|r| r.password == password)
            .ok_or_else(|| Error::Unauthorized("invalid email or password".to_string()))?;

        let token = Uuid::new_v4().to_string();
        self.sessions
            .write()
            .await
            .insert(token.clone(), record.identity.clone());

        tracing::info!(user_id = record.identity.user_id, "User logged in");
        Ok((token, record.identity))
    }

    /// Resolve an `Authorization` header value to an identity
    pub async fn authenticate(&self, header: Option<&str>) -> Result<UserIdentity> {
        let token = header
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or_else(|| Error::Unauthorized("missing bearer token".to_string()))?;

        self.sessions
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or_else(|| Error::Unauthorized("invalid or expired token".to_string()))
    }

    /// Drop a session; idempotent
    pub async fn logout(&self, token: &str) {
        self.sessions.write().await.remove(token);
    }
}
