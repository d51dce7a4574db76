use crate::error::SessionError;
use crate::identity::Identity;
use directories::BaseDirs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const RENEW_AT_KEY: &str = "renew_at";
pub const IDENTITY_KEY: &str = "identity";
pub const SESSION_COOKIE_KEY: &str = "session_cookie";

/// Durable string key/value storage that survives restarts. Writes replace the
/// whole value; there is no merge.
pub trait ScheduleStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SessionError>;
    fn set(&self, key: &str, value: &str) -> Result<(), SessionError>;
    fn remove(&self, key: &str) -> Result<(), SessionError>;
}

/// In-memory adapter for tests and early wiring.
#[derive(Debug, Default)]
pub struct MemoryScheduleStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ScheduleStore for MemoryScheduleStore {
    fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SessionError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SessionError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    entries: BTreeMap<String, String>,
}

/// TOML file with user-only permissions. Every read goes back to disk so a
/// value written by another process is picked up.
#[derive(Debug)]
pub struct FileScheduleStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileScheduleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn default_path() -> Result<PathBuf, SessionError> {
        let base = BaseDirs::new()
            .ok_or_else(|| SessionError::Config("unable to determine home directory".into()))?;
        Ok(base.home_dir().join(".beach").join("session.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<StoreFile, SessionError> {
        if !self.path.exists() {
            return Ok(StoreFile::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(toml::from_str(&raw)?)
    }

    fn save(&self, contents: &StoreFile) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let serialized = toml::to_string_pretty(contents)?;
        let staging = self.path.with_extension("toml.tmp");
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&staging)?;
        file.write_all(serialized.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&staging, &self.path)?;
        Ok(())
    }

    fn update(&self, apply: impl FnOnce(&mut StoreFile)) -> Result<(), SessionError> {
        let _guard = self.write_lock.lock();
        let mut contents = self.load()?;
        apply(&mut contents);
        self.save(&contents)
    }
}

impl ScheduleStore for FileScheduleStore {
    fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        Ok(self.load()?.entries.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SessionError> {
        self.update(|contents| {
            contents.entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), SessionError> {
        if !self.path.exists() {
            return Ok(());
        }
        self.update(|contents| {
            contents.entries.remove(key);
        })
    }
}

/// Typed view over a [`ScheduleStore`]: the renewal deadline (epoch
/// milliseconds as a decimal string), the identity snapshot (JSON) and the
/// credential cookie in `Cookie` header form.
#[derive(Clone)]
pub struct PersistedSchedule {
    store: Arc<dyn ScheduleStore>,
}

impl PersistedSchedule {
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self { store }
    }

    pub fn renew_at(&self) -> Option<i64> {
        let raw = match self.store.get(RENEW_AT_KEY) {
            Ok(raw) => raw?,
            Err(err) => {
                tracing::warn!(target: "beach::session", error = %err, "failed to read renewal deadline");
                return None;
            }
        };
        match raw.trim().parse::<i64>() {
            Ok(deadline) => Some(deadline),
            Err(err) => {
                tracing::warn!(
                    target: "beach::session",
                    error = %err,
                    value = %raw,
                    "discarding unparsable renewal deadline"
                );
                if let Err(err) = self.store.remove(RENEW_AT_KEY) {
                    tracing::warn!(target: "beach::session", error = %err, "failed to remove renewal deadline");
                }
                None
            }
        }
    }

    pub fn set_renew_at(&self, deadline_ms: i64) -> Result<(), SessionError> {
        self.store.set(RENEW_AT_KEY, &deadline_ms.to_string())
    }

    pub fn clear_renew_at(&self) -> Result<(), SessionError> {
        self.store.remove(RENEW_AT_KEY)
    }

    pub fn identity_snapshot(&self) -> Option<Identity> {
        let raw = match self.store.get(IDENTITY_KEY) {
            Ok(raw) => raw?,
            Err(err) => {
                tracing::warn!(target: "beach::session", error = %err, "failed to read identity snapshot");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(identity) => Some(identity),
            Err(err) => {
                tracing::warn!(target: "beach::session", error = %err, "ignoring unreadable identity snapshot");
                None
            }
        }
    }

    pub fn set_identity_snapshot(&self, identity: &Identity) -> Result<(), SessionError> {
        let serialized = serde_json::to_string(identity)?;
        self.store.set(IDENTITY_KEY, &serialized)
    }

    pub fn clear_identity_snapshot(&self) -> Result<(), SessionError> {
        self.store.remove(IDENTITY_KEY)
    }

    pub fn session_cookies(&self) -> Option<String> {
        match self.store.get(SESSION_COOKIE_KEY) {
            Ok(raw) => raw.filter(|value| !value.trim().is_empty()),
            Err(err) => {
                tracing::warn!(target: "beach::session", error = %err, "failed to read session cookie");
                None
            }
        }
    }

    pub fn set_session_cookies(&self, header: &str) -> Result<(), SessionError> {
        self.store.set(SESSION_COOKIE_KEY, header)
    }

    pub fn clear_session_cookies(&self) -> Result<(), SessionError> {
        self.store.remove(SESSION_COOKIE_KEY)
    }

    /// Removes every entry, attempting each even if an earlier one fails.
    pub fn clear(&self) -> Result<(), SessionError> {
        let deadline = self.clear_renew_at();
        let snapshot = self.clear_identity_snapshot();
        let cookies = self.clear_session_cookies();
        deadline.and(snapshot).and(cookies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            id: "u-7".into(),
            email: "grace@example.com".into(),
            display_name: "Grace".into(),
            role: "editor".into(),
        }
    }

    fn scratch_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("beach-session-{}", uuid::Uuid::new_v4()))
            .join("session.toml")
    }

    #[test]
    fn deadline_is_stored_as_epoch_millis_string() {
        let store = MemoryScheduleStore::new();
        let schedule = PersistedSchedule::new(store.clone());
        assert_eq!(schedule.renew_at(), None);
        schedule.set_renew_at(1_700_000_900_000).unwrap();
        assert_eq!(
            store.get(RENEW_AT_KEY).unwrap().as_deref(),
            Some("1700000900000")
        );
        assert_eq!(schedule.renew_at(), Some(1_700_000_900_000));
        schedule.clear_renew_at().unwrap();
        assert_eq!(schedule.renew_at(), None);
    }

    #[test]
    fn garbage_deadline_is_dropped() {
        let store = MemoryScheduleStore::new();
        store.set(RENEW_AT_KEY, "soon").unwrap();
        let schedule = PersistedSchedule::new(store.clone());
        assert_eq!(schedule.renew_at(), None);
        assert_eq!(store.get(RENEW_AT_KEY).unwrap(), None);
    }

    #[test]
    fn identity_snapshot_round_trips_and_clears() {
        let schedule = PersistedSchedule::new(MemoryScheduleStore::new());
        schedule.set_identity_snapshot(&identity()).unwrap();
        schedule.set_renew_at(42).unwrap();
        schedule.set_session_cookies("beach_sid=abc").unwrap();
        assert_eq!(schedule.identity_snapshot(), Some(identity()));
        assert_eq!(schedule.session_cookies().as_deref(), Some("beach_sid=abc"));
        schedule.clear().unwrap();
        assert_eq!(schedule.identity_snapshot(), None);
        assert_eq!(schedule.renew_at(), None);
        assert_eq!(schedule.session_cookies(), None);
    }

    #[test]
    fn file_store_persists_across_instances() {
        let path = scratch_path();
        let first = PersistedSchedule::new(Arc::new(FileScheduleStore::new(&path)));
        first.set_renew_at(123_456).unwrap();
        first.set_identity_snapshot(&identity()).unwrap();

        let reopened = PersistedSchedule::new(Arc::new(FileScheduleStore::new(&path)));
        assert_eq!(reopened.renew_at(), Some(123_456));
        assert_eq!(reopened.identity_snapshot(), Some(identity()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        reopened.clear().unwrap();
        assert_eq!(first.renew_at(), None);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn file_store_readers_see_external_writes() {
        let path = scratch_path();
        let reader = FileScheduleStore::new(&path);
        let writer = FileScheduleStore::new(&path);
        assert_eq!(reader.get(RENEW_AT_KEY).unwrap(), None);
        writer.set(RENEW_AT_KEY, "99").unwrap();
        assert_eq!(reader.get(RENEW_AT_KEY).unwrap().as_deref(), Some("99"));
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn removing_from_missing_file_is_a_no_op() {
        let store = FileScheduleStore::new(scratch_path());
        store.remove(RENEW_AT_KEY).unwrap();
        assert!(!store.path().exists());
    }
}
