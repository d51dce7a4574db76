use crate::error::SessionError;
use crate::route::RoutePolicy;
use crate::store::FileScheduleStore;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const DEFAULT_API_BASE: &str = "http://127.0.0.1:8080/api/";
const DEFAULT_WATCHDOG_SECS: u64 = 30;
const DEFAULT_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub api_base: Url,
    pub watchdog_period: Duration,
    pub request_timeout: Duration,
    pub routes: RoutePolicy,
    pub store_path: Option<PathBuf>,
}

impl SessionConfig {
    pub fn from_env() -> Result<Self, SessionError> {
        let api_base = env::var("BEACH_SESSION_API").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        let api_base = parse_api_base(&api_base)
            .map_err(|err| SessionError::Config(format!("invalid BEACH_SESSION_API: {err}")))?;

        let watchdog_secs = env::var("BEACH_SESSION_WATCHDOG_SECS")
            .ok()
            .and_then(|val| val.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_WATCHDOG_SECS)
            .max(1);
        let timeout_secs = env::var("BEACH_SESSION_TIMEOUT_SECS")
            .ok()
            .and_then(|val| val.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let mut routes = RoutePolicy::default();
        if let Some(path) = env::var("BEACH_SESSION_SIGN_IN_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
        {
            routes.sign_in_path = path.trim().to_string();
        }
        if let Ok(raw) = env::var("BEACH_SESSION_PROTECTED") {
            routes.protected_prefixes = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        let store_path = env::var("BEACH_SESSION_STORE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            api_base,
            watchdog_period: Duration::from_secs(watchdog_secs),
            request_timeout: Duration::from_secs(timeout_secs),
            routes,
            store_path,
        })
    }

    /// Explicit store path, or the per-user default under `~/.beach`.
    pub fn resolve_store_path(&self) -> Result<PathBuf, SessionError> {
        match &self.store_path {
            Some(path) => Ok(path.clone()),
            None => FileScheduleStore::default_path(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base: Url::parse(DEFAULT_API_BASE).expect("default api base is a valid url"),
            watchdog_period: Duration::from_secs(DEFAULT_WATCHDOG_SECS),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            routes: RoutePolicy::default(),
            store_path: None,
        }
    }
}

/// Parses the API base and makes sure it ends with `/` so that endpoint paths
/// join underneath it instead of replacing its last segment.
pub fn parse_api_base(raw: &str) -> Result<Url, url::ParseError> {
    let trimmed = raw.trim();
    if trimmed.ends_with('/') {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("{trimmed}/"))
    }
}
