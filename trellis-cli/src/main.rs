use clap::Parser;

use trellis_core::error::{ConfigError, StoreError, SyncError, UpstreamError};

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "trellis",
    version,
    about = "Sync issue-tracker and source-control activity into a cross-referenced graph"
)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,
}

/// Map a failure to the process exit code.
///
///   0  success
///   1  general/unknown error
///   2  configuration error (file, pattern, credential)
///   4  database error
///   5  upstream API error (auth, rate limit, HTTP status)
///   10 pass completed with record-level errors
fn classify_exit_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<commands::sync::PartialSync>().is_some() {
        return 10;
    }

    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<SyncError>() {
            return match e {
                SyncError::Config(_) => 2,
                SyncError::Store(_) => 4,
                SyncError::Upstream(_) => 5,
                SyncError::Malformed(_) => 1,
            };
        }
        if cause.is::<ConfigError>() {
            return 2;
        }
        if cause.is::<StoreError>() {
            return 4;
        }
        if cause.is::<UpstreamError>() {
            return 5;
        }
    }

    let lower = format!("{err:#}").to_lowercase();
    if lower.contains("config") || lower.contains("credential") {
        2
    } else if lower.contains("database") || lower.contains("sqlite") {
        4
    } else if lower.contains("api") || lower.contains("rate limit") {
        5
    } else {
        1
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (_, 0) => "warn",
        (_, 1) => "info",
        (_, 2) => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: Failed to create runtime: {e}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(commands::run(cli.command, cli.quiet)) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(classify_exit_code(&e));
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn exit_code_partial_sync() {
        let err = anyhow::Error::new(commands::sync::PartialSync { errors: 3 });
        assert_eq!(classify_exit_code(&err), 10);
    }

    #[test]
    fn exit_code_typed_config_error() {
        let err = Err::<(), _>(ConfigError::MissingCredential("GITHUB_TOKEN".into()))
            .context("Cannot resolve credentials")
            .unwrap_err();
        assert_eq!(classify_exit_code(&err), 2);
    }

    #[test]
    fn exit_code_wrapped_sync_errors() {
        let store = anyhow::Error::new(SyncError::from(StoreError::NodeNotFound("7".into())));
        assert_eq!(classify_exit_code(&store), 4);

        let upstream = anyhow::Error::new(SyncError::from(UpstreamError::Auth("401".into())))
            .context("Sync pass failed");
        assert_eq!(classify_exit_code(&upstream), 5);
    }

    #[test]
    fn exit_code_database_message() {
        let err = anyhow::anyhow!("Cannot open database: /tmp/trellis.db");
        assert_eq!(classify_exit_code(&err), 4);
    }

    #[test]
    fn exit_code_general() {
        let err = anyhow::anyhow!("Something unexpected happened");
        assert_eq!(classify_exit_code(&err), 1);
    }
}
