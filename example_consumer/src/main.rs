//! Example consumer: a service built on pgcrud.
//!
//! Run from repo root: `cargo run -p example-consumer -- [command]` (`--help` lists them).
//!
//! Commands:
//!   serve              apply pending migrations, then serve CRUD routes (default)
//!   migrate            apply pending migrations
//!   migrate --clear    empty the ledger and re-apply every script (destructive)
//!   migrate --reset    drop all tables and re-apply every script (destructive)
//!   rollback           roll back the most recent migration
//!   status             show applied, pending and drifted migrations

use clap::{Parser, Subcommand};
use pgcrud::{app, connect_pool, init_tracing, AppState, Migrator, Settings};
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Debug, Parser)]
#[command(name = "example-consumer")]
#[command(about = "Generic CRUD service and migration tool over PostgreSQL")]
#[command(version)]
struct Cli {
    /// Defaults to `serve`
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, PartialEq, Subcommand)]
enum Command {
    /// Apply pending migrations, then serve CRUD routes
    Serve,

    /// Apply pending migrations
    Migrate {
        /// Empty the ledger and re-apply every script (destructive)
        #[arg(long, conflicts_with = "reset")]
        clear: bool,

        /// Drop all tables and re-apply every script (destructive)
        #[arg(long)]
        reset: bool,
    },

    /// Roll back the most recent migration
    Rollback,

    /// Show applied, pending and drifted migrations
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("pgcrud=info,example_consumer=info");
    let command = Cli::parse().command.unwrap_or(Command::Serve);
    let settings = Settings::from_env()?;
    tracing::debug!(?settings, "loaded settings");
    let pool = connect_pool(&settings).await?;

    match command {
        Command::Serve => {
            let state = AppState::new(pool.clone(), &settings);
            let report = Migrator::from_settings(pool, &settings)
                .with_cache(Arc::clone(&state.schema))
                .apply()
                .await?;
            tracing::info!(
                version = report.current_version,
                applied = report.applied.len(),
                "schema ready"
            );
            let listener = TcpListener::bind(&settings.bind_addr).await?;
            tracing::info!("listening on http://{}", listener.local_addr()?);
            axum::serve(listener, app(state)).await?;
        }
        Command::Migrate {
            clear: false,
            reset: false,
        } => {
            let report = Migrator::from_settings(pool, &settings).apply().await?;
            println!("applied {:?}; now at version {}", report.applied, report.current_version);
        }
        Command::Migrate { clear: true, .. } => {
            let report = Migrator::from_settings(pool, &settings).clear().await?;
            println!("ledger cleared; applied {:?}; now at version {}", report.applied, report.current_version);
        }
        Command::Migrate { reset: true, .. } => {
            let report = Migrator::from_settings(pool, &settings).reset().await?;
            println!("schema reset; applied {:?}; now at version {}", report.applied, report.current_version);
        }
        Command::Rollback => match Migrator::from_settings(pool, &settings).rollback_last().await? {
            Some(version) => println!("rolled back version {}", version),
            None => println!("nothing to roll back"),
        },
        Command::Status => {
            let status = Migrator::from_settings(pool, &settings).status().await?;
            println!("current version: {}", status.current_version);
            for record in &status.applied {
                let mark = if status.drifted.contains(&record.version) {
                    " (DRIFTED)"
                } else if status.missing.contains(&record.version) {
                    " (SCRIPT MISSING)"
                } else {
                    ""
                };
                println!("  applied {:>6} {} at {}{}", record.version, record.description, record.applied_at, mark);
            }
            for pending in &status.pending {
                println!("  pending {:>6} {}", pending.version, pending.name);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Option<Command>, clap::Error> {
        Cli::try_parse_from(std::iter::once("example-consumer").chain(args.iter().copied()))
            .map(|cli| cli.command)
    }

    #[test]
    fn commands_parse() {
        assert_eq!(parse(&[]).unwrap(), None);
        assert_eq!(parse(&["serve"]).unwrap(), Some(Command::Serve));
        assert_eq!(
            parse(&["migrate", "--reset"]).unwrap(),
            Some(Command::Migrate {
                clear: false,
                reset: true
            })
        );
        assert_eq!(parse(&["status"]).unwrap(), Some(Command::Status));
    }

    #[test]
    fn clear_and_reset_are_exclusive() {
        let err = parse(&["migrate", "--reset", "--clear"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
        assert!(parse(&["migrate", "--force"]).is_err());
    }
}
