use std::path::PathBuf;
use std::sync::Arc;

use beach_session::clock::{format_epoch_ms, Clock, SystemClock};
use beach_session::config::parse_api_base;
use beach_session::{
    Credentials, FileScheduleStore, HttpAuthApi, Navigator, PersistedSchedule, ScheduleStore,
    Session, SessionConfig, SessionCoordinator, SessionError, UnauthorizedBus,
};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cli::{Cli, Command, RunArgs, StatusArgs};
use crate::logging::InitError;

const PASSWORD_ENV: &str = "BEACH_PASS_PASSWORD";

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("logging initialization failed: {0}")]
    Logging(#[from] InitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no saved session; pass --email to sign in")]
    NotSignedIn,
    #[error("session ended: the server no longer accepts this session")]
    SessionLost,
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::InvalidArgument(_) => 2,
            CliError::NotSignedIn | CliError::SessionLost => 3,
            CliError::Session(SessionError::InvalidCredentials) => 4,
            _ => 1,
        }
    }
}

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let config = resolve_config(&cli)?;
    match cli.command {
        Command::Run(args) => keep_alive(config, args).await,
        Command::Status(args) => status(&config, args),
        Command::Forget => forget(&config),
    }
}

fn resolve_config(cli: &Cli) -> Result<SessionConfig, CliError> {
    let mut config = SessionConfig::from_env()?;
    if let Some(raw) = cli.api_url.as_deref() {
        config.api_base = parse_api_base(raw)
            .map_err(|err| CliError::InvalidArgument(format!("--api-url '{raw}': {err}")))?;
    }
    if let Some(path) = cli.store.clone() {
        config.store_path = Some(path);
    }
    Ok(config)
}

fn open_schedule(config: &SessionConfig) -> Result<(PathBuf, PersistedSchedule), CliError> {
    let path = config.resolve_store_path()?;
    let store = Arc::new(FileScheduleStore::new(path.clone()));
    Ok((path, PersistedSchedule::new(store)))
}

async fn keep_alive(config: SessionConfig, args: RunArgs) -> Result<(), CliError> {
    let credentials = match args.email.as_deref() {
        Some(email) => Some(Credentials::new(email, read_password(email)?)),
        None => None,
    };

    let path = config.resolve_store_path()?;
    let store: Arc<dyn ScheduleStore> = Arc::new(FileScheduleStore::new(path.clone()));
    let schedule = PersistedSchedule::new(store.clone());
    if credentials.is_none() && schedule.session_cookies().is_none() {
        return Err(CliError::NotSignedIn);
    }

    let bus = UnauthorizedBus::new();
    let api = Arc::new(HttpAuthApi::new(&config, bus.clone())?.with_persisted_cookies(schedule));
    let navigator = Arc::new(TerminalNavigator::new(args.location.clone()));
    info!(
        target: "beach_pass",
        api = %config.api_base,
        store = %path.display(),
        "starting session"
    );

    let coordinator = SessionCoordinator::builder(api)
        .config(&config)
        .store(store)
        .navigator(navigator)
        .bus(bus)
        .start()
        .await;
    let mut sessions = coordinator.subscribe();

    if let Some(credentials) = credentials {
        if let Err(err) = coordinator.sign_in(&credentials).await {
            coordinator.shutdown();
            return Err(err.into());
        }
    }

    let current = sessions.borrow_and_update().clone();
    if !current.is_authenticated() {
        coordinator.shutdown();
        return Err(CliError::NotSignedIn);
    }
    report(&coordinator, &current);

    let mut foreground = Foreground::listen()?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            changed = sessions.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = sessions.borrow_and_update().clone();
                if !current.is_authenticated() {
                    warn!(target: "beach_pass", "session lost");
                    coordinator.shutdown();
                    return Err(CliError::SessionLost);
                }
                report(&coordinator, &current);
            }
            _ = foreground.recv() => {
                let outcome = coordinator.resync().await;
                info!(target: "beach_pass", ?outcome, "resumed; schedule resynced");
            }
            _ = &mut ctrl_c => {
                if args.sign_out_on_exit {
                    info!(target: "beach_pass", "signing out before exit");
                    coordinator.sign_out().await;
                }
                break;
            }
        }
    }

    coordinator.shutdown();
    Ok(())
}

fn report(coordinator: &SessionCoordinator, session: &Session) {
    let Some(identity) = session.identity.as_ref() else {
        return;
    };
    let renew_at = coordinator
        .renew_at()
        .map(format_epoch_ms)
        .unwrap_or_else(|| "-".into());
    info!(
        target: "beach_pass",
        email = %identity.email,
        role = %identity.role,
        renew_at = %renew_at,
        "signed in as {}",
        identity.display_name
    );
}

fn read_password(email: &str) -> Result<String, CliError> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        if !password.is_empty() {
            debug!(target: "beach_pass", "using password from {PASSWORD_ENV}");
            return Ok(password);
        }
    }
    let password = rpassword::prompt_password(format!("Password for {email}: "))?;
    if password.is_empty() {
        return Err(CliError::InvalidArgument("empty password".into()));
    }
    Ok(password)
}

fn status(config: &SessionConfig, args: StatusArgs) -> Result<(), CliError> {
    let (path, schedule) = open_schedule(config)?;
    let renew_at = schedule.renew_at();
    let identity = schedule.identity_snapshot();
    let has_cookie = schedule.session_cookies().is_some();

    if args.json {
        let value = serde_json::json!({
            "store": path.display().to_string(),
            "renew_at": renew_at,
            "identity": identity,
            "credential_saved": has_cookie,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&value).map_err(SessionError::from)?
        );
        return Ok(());
    }

    println!("Store: {}", path.display());
    match renew_at {
        Some(deadline) => {
            let remaining_ms = deadline - SystemClock.now_ms();
            let when = if remaining_ms > 0 {
                format!("in {}s", remaining_ms / 1_000)
            } else {
                format!("overdue by {}s", -remaining_ms / 1_000)
            };
            println!("Renewal due: {} ({when})", format_epoch_ms(deadline));
        }
        None => println!("Renewal due: none scheduled"),
    }
    match identity {
        Some(identity) => {
            println!("Identity: {} <{}>", identity.display_name, identity.email);
            println!("  Role: {}", identity.role);
        }
        None => println!("Identity: none cached"),
    }
    println!(
        "Credential: {}",
        if has_cookie { "saved" } else { "none" }
    );
    Ok(())
}

fn forget(config: &SessionConfig) -> Result<(), CliError> {
    let (path, schedule) = open_schedule(config)?;
    schedule.clear()?;
    println!("Cleared persisted session state in {}.", path.display());
    Ok(())
}

/// Stands in for browser navigation: there is nothing to render, so moves
/// are logged and remembered.
struct TerminalNavigator {
    location: Mutex<String>,
}

impl TerminalNavigator {
    fn new(location: String) -> Self {
        Self {
            location: Mutex::new(location),
        }
    }
}

impl Navigator for TerminalNavigator {
    fn current_location(&self) -> String {
        self.location.lock().clone()
    }

    fn navigate(&self, to: &str) {
        info!(target: "beach_pass", to, "redirected");
        *self.location.lock() = to.to_string();
    }
}

/// Delivers a signal when the process is continued after a stop (`SIGCONT`),
/// the terminal equivalent of a page becoming visible again.
struct Foreground {
    #[cfg(unix)]
    signal: tokio::signal::unix::Signal,
}

impl Foreground {
    #[cfg(unix)]
    fn listen() -> Result<Self, CliError> {
        use tokio::signal::unix::{signal, SignalKind};
        let signal = signal(SignalKind::from_raw(libc::SIGCONT))?;
        Ok(Self { signal })
    }

    #[cfg(not(unix))]
    fn listen() -> Result<Self, CliError> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn recv(&mut self) -> Option<()> {
        self.signal.recv().await
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> Option<()> {
        std::future::pending().await
    }
}
