//! Authenticated session capability handed to the fetcher.
//!
//! How the credentials were obtained (password, two-factor challenge) is
//! outside this crate; a session only has to say whether it is usable and
//! survive a process restart.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::Result;

pub trait Session: Send + Sync {
    fn authenticated(&self) -> bool;

    fn save(&self, path: &Path) -> Result<()>;

    /// Load a previously saved session, `None` when there is nothing usable
    fn restore(path: &Path) -> Result<Option<Self>>
    where
        Self: Sized;

    /// `Cookie` header value to attach to remote requests
    fn cookie_header(&self) -> Option<String> {
        None
    }
}

/// Session backed by the remote service's auth cookies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieSession {
    pub auth_cookie: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub two_factor_cookie: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl CookieSession {
    pub fn new(auth_cookie: impl Into<String>) -> Self {
        Self {
            auth_cookie: auth_cookie.into(),
            ..Self::default()
        }
    }

    pub fn with_two_factor(mut self, cookie: impl Into<String>) -> Self {
        self.two_factor_cookie = Some(cookie.into());
        self
    }
}

impl Session for CookieSession {
    fn authenticated(&self) -> bool {
        !self.auth_cookie.trim().is_empty()
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        debug!(path = %path.display(), "Saved session");
        Ok(())
    }

    fn restore(path: &Path) -> Result<Option<Self>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<CookieSession>(&raw) {
            Ok(session) if session.authenticated() => Ok(Some(session)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable session file");
                Ok(None)
            }
        }
    }

    fn cookie_header(&self) -> Option<String> {
        if !self.authenticated() {
            return None;
        }
        let mut header = format!("auth={}", self.auth_cookie.trim());
        if let Some(two_factor) = &self.two_factor_cookie {
            header.push_str("; twoFactorAuth=");
            header.push_str(two_factor.trim());
        }
        Some(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");

        let session = CookieSession::new("authcookie_123").with_two_factor("tfa_456");
        session.save(&path).unwrap();

        let restored = CookieSession::restore(&path).unwrap().unwrap();
        assert_eq!(restored, session);
        assert_eq!(
            restored.cookie_header().as_deref(),
            Some("auth=authcookie_123; twoFactorAuth=tfa_456")
        );
    }

    #[test]
    fn test_restore_missing_or_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        assert!(CookieSession::restore(&path).unwrap().is_none());

        fs::write(&path, b"not json").unwrap();
        assert!(CookieSession::restore(&path).unwrap().is_none());

        CookieSession::new("   ").save(&path).unwrap();
        assert!(CookieSession::restore(&path).unwrap().is_none());
    }
}
