//! Authenticated-user context
//!
//! Supplies the owner id stamped on new records and the bearer token used by
//! the remote client. Injected into repositories and the HTTP client; never
//! read from global state.

use std::sync::{PoisonError, RwLock};

/// Source of the current user identity
pub trait AuthContext: Send + Sync {
    /// Owner id of the signed-in user, if any
    fn current_owner_id(&self) -> Option<String>;

    /// Access token for remote calls, if any
    fn access_token(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub user_id: String,
    pub access_token: Option<String>,
}

/// In-process session updated by the login/logout flow
#[derive(Debug, Default)]
pub struct Session {
    inner: RwLock<Option<SessionInfo>>,
}

impl Session {
    /// Create a signed-out session
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session already signed in as `user_id`
    pub fn signed_in(user_id: impl Into<String>, access_token: Option<String>) -> Self {
        let session = Self::new();
        session.sign_in(user_id, access_token);
        session
    }

    pub fn sign_in(&self, user_id: impl Into<String>, access_token: Option<String>) {
        let info = SessionInfo {
            user_id: user_id.into(),
            access_token,
        };
        log::info!("Session signed in as {}", info.user_id);
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(info);
    }

    /// Replace the access token after a refresh
    pub fn set_access_token(&self, access_token: Option<String>) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(info) = guard.as_mut() {
            info.access_token = access_token;
        }
    }

    pub fn sign_out(&self) {
        log::info!("Session signed out");
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn info(&self) -> Option<SessionInfo> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl AuthContext for Session {
    fn current_owner_id(&self) -> Option<String> {
        self.info().map(|info| info.user_id)
    }

    fn access_token(&self) -> Option<String> {
        self.info().and_then(|info| info.access_token)
    }
}
