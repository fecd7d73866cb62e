//! `reliefops`: operator tooling for the inventory ledger.
//!
//! Connects to Postgres (`DATABASE_URL` or `--database-url`) and prints JSON on
//! stdout; logs go to stderr.

use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};

use reliefops_infra::LedgerConfig;
use reliefops_observability::LogFormat;

mod commands;

/// ReliefOps inventory ledger tools.
#[derive(Debug, Parser)]
#[command(name = "reliefops", about = "Inventory ledger operator commands")]
struct Cli {
    /// Postgres connection string; overrides DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Log output format (json or pretty).
    #[arg(long, global = true, default_value = "json")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply the ledger schema.
    Migrate,

    /// List inventory transactions, newest first.
    Transactions(commands::TransactionsArgs),

    /// Replay the ledger and compare it with stored resource quantities.
    ///
    /// Exits with status 1 when any resource has drifted.
    Reconcile {
        /// Only this resource.
        #[arg(long)]
        resource_id: Option<reliefops_core::ResourceId>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    reliefops_observability::init_with(cli.log_format);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = LedgerConfig::from_env().context("reading configuration")?;
    if cli.database_url.is_some() {
        config.database_url = cli.database_url;
    }
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL is not set (or pass --database-url)")?;

    let pool = sqlx::PgPool::connect(&database_url)
        .await
        .context("connecting to Postgres")?;

    match cli.command {
        Command::Migrate => {
            commands::migrate(&pool).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Transactions(args) => {
            let ledger = commands::ledger(pool, config);
            commands::transactions(&ledger, args).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Reconcile { resource_id } => {
            let ledger = commands::ledger(pool, config);
            let consistent = commands::reconcile(&ledger, resource_id).await?;
            Ok(if consistent {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transaction_filters() {
        let resource_id = reliefops_core::ResourceId::new();
        let cli = Cli::try_parse_from([
            "reliefops",
            "--log-format",
            "pretty",
            "transactions",
            "--resource-id",
            &resource_id.to_string(),
            "--type",
            "fulfillment",
            "--limit",
            "20",
        ])
        .unwrap();

        assert_eq!(cli.log_format, LogFormat::Pretty);
        match cli.command {
            Command::Transactions(args) => {
                assert_eq!(args.resource_id, Some(resource_id));
                assert_eq!(
                    args.transaction_type,
                    Some(reliefops_inventory::TransactionType::Fulfillment)
                );
                assert_eq!(args.limit, Some(20));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_transaction_type() {
        assert!(Cli::try_parse_from(["reliefops", "transactions", "--type", "gift"]).is_err());
    }
}
