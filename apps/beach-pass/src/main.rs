mod cli;
mod commands;
mod logging;

use std::process::ExitCode;

use clap::Parser;

#[tokio::main]
async fn main() -> ExitCode {
    // .env values act as defaults for the env-backed flags below.
    let dotenv = dotenvy::dotenv();
    let cli = cli::Cli::parse();

    if let Err(err) = logging::init(&cli.logging.to_config()) {
        eprintln!("⚠️  {}", commands::CliError::from(err));
    }
    if let Some(err) = unreadable_dotenv(&dotenv) {
        tracing::warn!(target: "beach_pass", error = %err, "ignoring unreadable .env");
    }

    match commands::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("❌ {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

/// A missing `.env` is normal; anything else is worth reporting.
fn unreadable_dotenv<T>(result: &dotenvy::Result<T>) -> Option<&dotenvy::Error> {
    match result {
        Err(err) if !err.not_found() => Some(err),
        _ => None,
    }
}
