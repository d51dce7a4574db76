use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "beach-pass",
    about = "Keep a Beach session signed in and its credential renewed",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long = "api-url",
        global = true,
        env = "BEACH_SESSION_API",
        value_name = "URL",
        help = "Base URL of the session API (defaults to http://127.0.0.1:8080/api/)"
    )]
    pub api_url: Option<String>,

    #[arg(
        long = "store",
        global = true,
        env = "BEACH_SESSION_STORE",
        value_name = "PATH",
        help = "File holding the persisted renewal deadline and identity snapshot"
    )]
    pub store: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "BEACH_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "BEACH_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sign in (or resume) and keep the session alive until interrupted
    Run(RunArgs),
    /// Show the persisted renewal deadline and cached identity
    Status(StatusArgs),
    /// Remove the persisted renewal deadline and cached identity
    Forget,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    #[arg(
        long,
        value_name = "EMAIL",
        help = "Sign in with this account; the password is read from BEACH_PASS_PASSWORD or prompted"
    )]
    pub email: Option<String>,

    #[arg(
        long = "sign-out-on-exit",
        help = "Sign out on the server before exiting on Ctrl-C"
    )]
    pub sign_out_on_exit: bool,

    #[arg(
        long,
        value_name = "PATH",
        default_value = "/dashboard",
        help = "Location reported to the session layer when deciding whether to redirect"
    )]
    pub location: String,
}

#[derive(Args, Debug, Default)]
pub struct StatusArgs {
    #[arg(long, help = "Print the persisted state as JSON")]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "beach-pass",
            "run",
            "--email",
            "ada@example.com",
            "--sign-out-on-exit",
            "--api-url",
            "http://localhost:9000/api",
            "--log-level",
            "debug",
        ])
        .expect("parse");
        assert_eq!(cli.api_url.as_deref(), Some("http://localhost:9000/api"));
        assert_eq!(cli.logging.level, LogLevel::Debug);
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.email.as_deref(), Some("ada@example.com"));
                assert!(args.sign_out_on_exit);
                assert_eq!(args.location, "/dashboard");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn status_takes_a_store_override() {
        let cli = Cli::try_parse_from(["beach-pass", "--store", "/tmp/s.toml", "status"])
            .expect("parse");
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/s.toml")));
        assert!(matches!(cli.command, Command::Status(StatusArgs { json: false })));
    }
}
