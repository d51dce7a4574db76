use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::identity::Identity;
use crate::store::PersistedSchedule;
use async_trait::async_trait;
use auth_bus::UnauthorizedBus;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use url::Url;

#[derive(Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoginGrant {
    /// Seconds until the credential should be renewed.
    pub refresh_in: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RefreshGrant {
    pub refresh_in: u64,
}

/// Calls the session layer needs from the server.
///
/// Implementations that carry the user's credential must publish on the
/// [`UnauthorizedBus`] when `refresh` or `me` is rejected, before returning
/// [`SessionError::Unauthorized`].
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<LoginGrant, SessionError>;
    async fn refresh(&self) -> Result<RefreshGrant, SessionError>;
    async fn logout(&self) -> Result<(), SessionError>;
    async fn me(&self) -> Result<Identity, SessionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Login,
    Authenticated,
    Logout,
}

/// HTTP adapter. The credential lives in a cookie jar; with
/// [`with_persisted_cookies`](Self::with_persisted_cookies) the jar is also
/// written to the schedule store so another process can resume the session.
#[derive(Clone)]
pub struct HttpAuthApi {
    client: Client,
    base: Url,
    bus: UnauthorizedBus,
    jar: Arc<Jar>,
    persisted: Option<PersistedSchedule>,
}

impl HttpAuthApi {
    pub fn new(config: &SessionConfig, bus: UnauthorizedBus) -> Result<Self, SessionError> {
        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .cookie_provider(jar.clone())
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| SessionError::Config(err.to_string()))?;
        Ok(Self {
            client,
            base: config.api_base.clone(),
            bus,
            jar,
            persisted: None,
        })
    }

    /// Loads any saved credential cookie into the jar and saves the jar after
    /// every login and renewal.
    pub fn with_persisted_cookies(mut self, schedule: PersistedSchedule) -> Self {
        if let Some(saved) = schedule.session_cookies() {
            let mut restored = 0usize;
            for pair in saved.split(';').map(str::trim).filter(|pair| !pair.is_empty()) {
                self.jar.add_cookie_str(&format!("{pair}; Path=/"), &self.base);
                restored += 1;
            }
            tracing::debug!(target: "beach::session::api", restored, "restored persisted session cookies");
        }
        self.persisted = Some(schedule);
        self
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    // Last step of a call; nothing awaits between this write and the return.
    fn persist_cookies(&self) {
        let Some(schedule) = &self.persisted else {
            return;
        };
        let header = self
            .jar
            .cookies(&self.base)
            .and_then(|value| value.to_str().ok().map(str::to_owned));
        let result = match header {
            Some(header) => schedule.set_session_cookies(&header),
            None => schedule.clear_session_cookies(),
        };
        if let Err(err) = result {
            tracing::warn!(target: "beach::session::api", error = %err, "failed to persist session cookie");
        }
    }

    fn url(&self, path: &str) -> Result<Url, SessionError> {
        self.base
            .join(path)
            .map_err(|err| SessionError::Config(format!("invalid api path '{path}': {err}")))
    }

    async fn check(&self, response: Response, kind: CallKind) -> Result<Response, SessionError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let err = classify(status, kind, body);
        if matches!(err, SessionError::Unauthorized) && kind == CallKind::Authenticated {
            tracing::debug!(target: "beach::session::api", %status, "authenticated request rejected");
            self.bus.publish();
        }
        Err(err)
    }
}

fn classify(status: StatusCode, kind: CallKind, body: String) -> SessionError {
    match (kind, status) {
        (
            CallKind::Login,
            StatusCode::BAD_REQUEST
            | StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::UNPROCESSABLE_ENTITY,
        ) => SessionError::InvalidCredentials,
        (_, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => SessionError::Unauthorized,
        (_, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS) => SessionError::Server {
            status: status.as_u16(),
            body,
        },
        (_, status) if status.is_server_error() => SessionError::Server {
            status: status.as_u16(),
            body,
        },
        (_, status) => SessionError::Unexpected(format!("status {status}: {body}")),
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn login(&self, credentials: &Credentials) -> Result<LoginGrant, SessionError> {
        let url = self.url("auth/login")?;
        let response = self.client.post(url).json(credentials).send().await?;
        let response = self.check(response, CallKind::Login).await?;
        let grant: LoginGrant = response.json().await?;
        self.persist_cookies();
        Ok(grant)
    }

    async fn refresh(&self) -> Result<RefreshGrant, SessionError> {
        let url = self.url("auth/refresh")?;
        let response = self.client.post(url).send().await?;
        let response = self.check(response, CallKind::Authenticated).await?;
        let grant: RefreshGrant = response.json().await?;
        self.persist_cookies();
        Ok(grant)
    }

    async fn logout(&self) -> Result<(), SessionError> {
        let url = self.url("auth/logout")?;
        let response = self.client.post(url).send().await?;
        self.check(response, CallKind::Logout).await?;
        Ok(())
    }

    async fn me(&self) -> Result<Identity, SessionError> {
        let url = self.url("identity/me")?;
        let response = self.client.get(url).send().await?;
        let response = self.check(response, CallKind::Authenticated).await?;
        Ok(response.json().await?)
    }
}
