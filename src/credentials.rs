//! Credential store shared by the REST gateway and stream connections.
//!
//! The store is an explicit object injected into both transports rather than
//! ambient global state. Mutations happen only through the login, refresh,
//! and logout paths, and each mutation persists the full record atomically
//! when a backing file is configured.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Active authentication mode. Exactly one is in effect at any time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Bearer access token with a refresh token.
    Jwt,
    /// Opaque token plus server-side session id (LDAP-backed logins).
    Session,
    /// Unauthenticated.
    #[default]
    None,
}

/// Snapshot of the stored credential fields.
#[derive(Clone, Default)]
pub struct Credentials {
    /// Access token sent as `Authorization: Bearer <token>`.
    pub access_token: Option<SecretString>,
    /// Refresh token used to renew an expired access token.
    pub refresh_token: Option<SecretString>,
    /// Session id sent as `X-Session-ID`.
    pub session_id: Option<String>,
    /// Which of the fields above is authoritative.
    pub mode: AuthMode,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &self.access_token.is_some())
            .field("refresh_token", &self.refresh_token.is_some())
            .field("session_id", &self.session_id.is_some())
            .field("mode", &self.mode)
            .finish()
    }
}

/// On-disk record. Field names match the storage keys used by earlier
/// releases, so existing credential files keep loading.
#[derive(Serialize, Deserialize)]
struct PersistedCredentials {
    auth_token: Option<String>,
    refresh_token: Option<String>,
    session_id: Option<String>,
    #[serde(default)]
    auth_mode: AuthMode,
}

/// Errors produced when loading or persisting the credential file.
#[derive(Debug, Error)]
pub enum CredentialStoreError {
    /// Backing file could not be read.
    #[error("failed to read credential file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Backing file could not be written.
    #[error("failed to write credential file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Backing file exists but does not hold a valid credential record.
    #[error("credential file {path} is not valid: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Cloneable, thread-safe holder for the process credentials.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    state: RwLock<Credentials>,
    path: Option<PathBuf>,
}

impl CredentialStore {
    /// Creates a volatile store with no backing file.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(Credentials::default()),
                path: None,
            }),
        }
    }

    /// Opens a store backed by `path`, loading the persisted record when the
    /// file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CredentialStoreError> {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read(&path) {
            Ok(bytes) => {
                let record: PersistedCredentials = serde_json::from_slice(&bytes)
                    .map_err(|source| CredentialStoreError::Malformed {
                        path: path.clone(),
                        source,
                    })?;
                Credentials {
                    access_token: record.auth_token.map(SecretString::new),
                    refresh_token: record.refresh_token.map(SecretString::new),
                    session_id: record.session_id,
                    mode: record.auth_mode,
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Credentials::default(),
            Err(source) => return Err(CredentialStoreError::Read { path, source }),
        };

        Ok(Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(state),
                path: Some(path),
            }),
        })
    }

    /// Stores JWT credentials and switches the active mode to [`AuthMode::Jwt`].
    ///
    /// Any previous session id is dropped so exactly one mode is observable.
    pub fn set_jwt(
        &self,
        access_token: SecretString,
        refresh_token: SecretString,
    ) -> Result<(), CredentialStoreError> {
        self.mutate(|state| {
            state.access_token = Some(access_token);
            state.refresh_token = Some(refresh_token);
            state.session_id = None;
            state.mode = AuthMode::Jwt;
        })
    }

    /// Stores session credentials and switches the active mode to
    /// [`AuthMode::Session`]. Any previous refresh token is dropped.
    pub fn set_session(
        &self,
        access_token: SecretString,
        session_id: impl Into<String>,
    ) -> Result<(), CredentialStoreError> {
        let session_id = session_id.into();
        self.mutate(|state| {
            state.access_token = Some(access_token);
            state.refresh_token = None;
            state.session_id = Some(session_id);
            state.mode = AuthMode::Session;
        })
    }

    /// Removes all fields and resets the mode to [`AuthMode::None`].
    pub fn clear(&self) -> Result<(), CredentialStoreError> {
        self.mutate(|state| *state = Credentials::default())
    }

    /// Returns a consistent copy of the current credentials.
    pub fn snapshot(&self) -> Credentials {
        self.inner
            .state
            .read()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    fn mutate(
        &self,
        apply: impl FnOnce(&mut Credentials),
    ) -> Result<(), CredentialStoreError> {
        let mut state = match self.inner.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut state);
        self.persist(&state)
    }

    /// Writes the record via a temp file + rename so a concurrent reader of
    /// the file never observes a partial record.
    fn persist(&self, state: &Credentials) -> Result<(), CredentialStoreError> {
        let Some(path) = self.inner.path.as_ref() else {
            return Ok(());
        };

        let record = PersistedCredentials {
            auth_token: state
                .access_token
                .as_ref()
                .map(|token| token.expose_secret().clone()),
            refresh_token: state
                .refresh_token
                .as_ref()
                .map(|token| token.expose_secret().clone()),
            session_id: state.session_id.clone(),
            auth_mode: state.mode,
        };
        let bytes = serde_json::to_vec_pretty(&record).map_err(|source| {
            CredentialStoreError::Malformed {
                path: path.clone(),
                source,
            }
        })?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(|source| CredentialStoreError::Write {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(|source| CredentialStoreError::Write {
            path: path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use secrecy::{ExposeSecret, SecretString};

    use super::{AuthMode, CredentialStore};

    fn secret(value: &str) -> SecretString {
        SecretString::new(value.to_string())
    }

    #[test]
    fn starts_unauthenticated() {
        let store = CredentialStore::in_memory();
        let creds = store.snapshot();
        assert_eq!(creds.mode, AuthMode::None);
        assert!(creds.access_token.is_none());
        assert!(creds.refresh_token.is_none());
        assert!(creds.session_id.is_none());
    }

    #[test]
    fn set_jwt_drops_previous_session_id() {
        let store = CredentialStore::in_memory();
        store
            .set_session(secret("ldap-token"), "sess-1")
            .expect("set session");
        store
            .set_jwt(secret("access"), secret("refresh"))
            .expect("set jwt");

        let creds = store.snapshot();
        assert_eq!(creds.mode, AuthMode::Jwt);
        assert_eq!(creds.access_token.unwrap().expose_secret(), "access");
        assert_eq!(creds.refresh_token.unwrap().expose_secret(), "refresh");
        assert!(creds.session_id.is_none());
    }

    #[test]
    fn set_session_drops_previous_refresh_token() {
        let store = CredentialStore::in_memory();
        store
            .set_jwt(secret("access"), secret("refresh"))
            .expect("set jwt");
        store
            .set_session(secret("ldap-token"), "sess-1")
            .expect("set session");

        let creds = store.snapshot();
        assert_eq!(creds.mode, AuthMode::Session);
        assert!(creds.refresh_token.is_none());
        assert_eq!(creds.session_id.as_deref(), Some("sess-1"));
    }

    #[test]
    fn clear_removes_every_field() {
        let store = CredentialStore::in_memory();
        store
            .set_jwt(secret("access"), secret("refresh"))
            .expect("set jwt");
        store.clear().expect("clear");

        let creds = store.snapshot();
        assert_eq!(creds.mode, AuthMode::None);
        assert!(creds.access_token.is_none());
        assert!(creds.refresh_token.is_none());
        assert!(creds.session_id.is_none());
    }

    #[test]
    fn persisted_record_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("credentials.json");

        let store = CredentialStore::open(&path).expect("open empty store");
        store
            .set_jwt(secret("access"), secret("refresh"))
            .expect("set jwt");
        drop(store);

        let reopened = CredentialStore::open(&path).expect("reopen store");
        let creds = reopened.snapshot();
        assert_eq!(creds.mode, AuthMode::Jwt);
        assert_eq!(creds.access_token.unwrap().expose_secret(), "access");
        assert_eq!(creds.refresh_token.unwrap().expose_secret(), "refresh");
    }

    #[test]
    fn clear_persists_the_empty_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("credentials.json");

        let store = CredentialStore::open(&path).expect("open store");
        store
            .set_session(secret("token"), "sess-9")
            .expect("set session");
        store.clear().expect("clear");
        drop(store);

        let reopened = CredentialStore::open(&path).expect("reopen store");
        assert_eq!(reopened.snapshot().mode, AuthMode::None);
    }

    #[test]
    fn missing_file_opens_as_unauthenticated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            CredentialStore::open(dir.path().join("absent.json")).expect("open missing file");
        assert_eq!(store.snapshot().mode, AuthMode::None);
    }
}
