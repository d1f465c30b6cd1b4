//! The OAuth boundary. The OAuth 2.0 flow itself (§1 Out of scope) is an
//! external collaborator; this module only reads the access token it
//! produces from `state/session.json`.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::Error;

/// The account identity stored alongside an OAuth session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Google account id.
    pub id: String,
    /// Display label, e.g. the account's email address.
    pub label: String,
}

/// `state/session.json` — the current OAuth session, written by the
/// (externally handled) login flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthSession {
    /// Session id.
    pub id: String,
    /// Current access token.
    pub access_token: String,
    /// When `access_token` expires.
    #[serde(with = "time::serde::iso8601")]
    pub access_token_expires_at: OffsetDateTime,
    /// Long-lived refresh token.
    pub refresh_token: String,
    /// Granted OAuth scopes.
    pub scopes: Vec<String>,
    /// The authenticated account.
    pub account: Account,
}

/// Supplies the access token every Colab API Client request is
/// authenticated with. Kept as a narrow trait so the real OAuth refresh
/// flow can be swapped in later without touching the rest of the core.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// The current access token, refreshing it first if the provider knows
    /// how.
    async fn access_token(&self) -> Result<String, Error>;

    /// The authenticated account, if known.
    async fn account(&self) -> Result<Account, Error>;
}

/// Reads the access token cached at `state/session.json`. Does not perform
/// OAuth refresh itself; if the token has expired, the caller is expected
/// to prompt the user to re-run the login step (`--force-login`).
pub struct CachedTokenProvider {
    session_path: PathBuf,
}

impl CachedTokenProvider {
    /// `session_path` is typically `<config dir>/state/session.json`.
    pub fn new(session_path: impl Into<PathBuf>) -> Self {
        Self {
            session_path: session_path.into(),
        }
    }

    fn load(&self) -> Result<OAuthSession, Error> {
        let contents = fs::read_to_string(&self.session_path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::NotAuthenticated("no cached session; run with --force-login".into())
            } else {
                Error::io(self.session_path.display().to_string(), err)
            }
        })?;
        let session: OAuthSession =
            serde_json::from_str(&contents).map_err(|err| Error::json(self.session_path.display().to_string(), err))?;
        if session.access_token_expires_at <= OffsetDateTime::now_utc() {
            return Err(Error::NotAuthenticated(
                "cached session expired; run with --force-login".into(),
            ));
        }
        Ok(session)
    }

    /// Persist a freshly obtained session with mode 0600.
    pub fn save(&self, session: &OAuthSession) -> Result<(), Error> {
        if let Some(parent) = self.session_path.parent() {
            fs::create_dir_all(parent).map_err(|err| Error::io(self.session_path.display().to_string(), err))?;
        }
        let json = serde_json::to_string_pretty(session)
            .map_err(|err| Error::json(self.session_path.display().to_string(), err))?;
        fs::write(&self.session_path, json).map_err(|err| Error::io(self.session_path.display().to_string(), err))?;
        restrict_permissions(&self.session_path)
    }
}

#[async_trait]
impl TokenProvider for CachedTokenProvider {
    async fn access_token(&self) -> Result<String, Error> {
        Ok(self.load()?.access_token)
    }

    async fn account(&self) -> Result<Account, Error> {
        Ok(self.load()?.account)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)
        .map_err(|err| Error::io(path.display().to_string(), err))?
        .permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms).map_err(|err| Error::io(path.display().to_string(), err))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), Error> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;
    use tempfile::tempdir;

    fn sample_session() -> OAuthSession {
        OAuthSession {
            id: "sess-1".into(),
            access_token: "tok-abc".into(),
            access_token_expires_at: OffsetDateTime::now_utc() + Duration::hours(1),
            refresh_token: "refresh-abc".into(),
            scopes: vec!["openid".into()],
            account: Account {
                id: "acct-1".into(),
                label: "user@example.com".into(),
            },
        }
    }

    #[tokio::test]
    async fn reports_not_authenticated_when_missing() {
        let dir = tempdir().unwrap();
        let provider = CachedTokenProvider::new(dir.path().join("session.json"));
        let err = provider.access_token().await.unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated(_)));
    }

    #[tokio::test]
    async fn round_trips_saved_session() {
        let dir = tempdir().unwrap();
        let provider = CachedTokenProvider::new(dir.path().join("session.json"));
        provider.save(&sample_session()).unwrap();

        assert_eq!(provider.access_token().await.unwrap(), "tok-abc");
        assert_eq!(provider.account().await.unwrap().label, "user@example.com");
    }

    #[tokio::test]
    async fn reports_not_authenticated_when_expired() {
        let dir = tempdir().unwrap();
        let provider = CachedTokenProvider::new(dir.path().join("session.json"));
        let mut session = sample_session();
        session.access_token_expires_at = OffsetDateTime::now_utc() - Duration::minutes(1);
        provider.save(&session).unwrap();

        let err = provider.access_token().await.unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated(_)));
    }
}
