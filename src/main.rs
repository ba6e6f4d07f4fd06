//! crmcore command-line driver.
//!
//! Every subcommand prints JSON on stdout. Logs go to stderr (`RUST_LOG`,
//! default `info`). Failures print an `ErrorReport` on stderr and exit 1.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crmcore_lib::config::{load_config, load_config_from};
use crmcore_lib::db::ContactDb;
use crmcore_lib::error::{CoreError, ErrorReport};
use crmcore_lib::matching::{detect_duplicates, duplicates_for_contact};
use crmcore_lib::merge::{merge_group, preview_merge};
use crmcore_lib::scoring::{
    load_rule_set, recompute_contact, reset_rule_set, run_batch_recompute, save_rule_set,
    RecomputeOptions,
};
use crmcore_lib::store::SqliteStore;

#[derive(Parser, Debug)]
#[command(name = "crmcore")]
#[command(about = "Duplicate detection, contact merging and engagement scoring")]
#[command(version)]
struct Cli {
    /// Organization to operate on
    #[arg(long, env = "CRMCORE_ORG")]
    org: String,

    /// SQLite database path (overrides the config file)
    #[arg(long, env = "CRMCORE_DB")]
    db: Option<PathBuf>,

    /// Config file (default: ~/.crmcore/config.json)
    #[arg(long, env = "CRMCORE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List duplicate groups, or the group containing one contact
    Duplicates {
        #[arg(long)]
        contact: Option<String>,
    },
    /// Merge a duplicate group into its primary contact
    Merge {
        /// Group id as printed by `duplicates`
        group_id: String,
        /// Surviving contact (default: earliest created member)
        #[arg(long)]
        primary: Option<String>,
        /// Print the merged primary without writing anything
        #[arg(long)]
        preview: bool,
    },
    /// Recompute engagement scores for every contact
    Recompute {
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Recompute one contact's engagement score
    Score { contact_id: String },
    /// Inspect or edit the scoring rules
    Rules {
        #[command(subcommand)]
        action: RulesCommand,
    },
}

#[derive(Subcommand, Debug)]
enum RulesCommand {
    List,
    SetPoints {
        rule_id: String,
        #[arg(allow_negative_numbers = true)]
        points: i64,
    },
    Toggle {
        rule_id: String,
        #[arg(long, action = ArgAction::Set)]
        enabled: bool,
    },
    Reset,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CoreError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| CoreError::Validation(format!("Failed to encode output: {e}")))?;
    println!("{json}");
    Ok(())
}

async fn run(cli: Cli) -> Result<(), CoreError> {
    let mut config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if let Some(db) = cli.db {
        config.database_path = Some(db);
    }

    let db = ContactDb::open_configured(config.database_path.as_deref())?;
    let store = SqliteStore::new(db, config.store_timeout());
    let org = cli.org.as_str();

    match cli.command {
        Command::Duplicates { contact: None } => print_json(&detect_duplicates(&store, org).await?),
        Command::Duplicates {
            contact: Some(contact_id),
        } => print_json(&duplicates_for_contact(&store, org, &contact_id).await?),
        Command::Merge {
            group_id,
            primary,
            preview,
        } => {
            let group = detect_duplicates(&store, org)
                .await?
                .into_iter()
                .find(|g| g.id == group_id)
                .ok_or_else(|| CoreError::NotFound(format!("duplicate group {group_id}")))?;
            if preview {
                print_json(&preview_merge(&store, org, &group, primary.as_deref()).await?)
            } else {
                print_json(&merge_group(&store, org, &group, primary.as_deref()).await?)
            }
        }
        Command::Recompute { batch_size } => {
            if let Some(size) = batch_size {
                config.batch_size = size;
            }
            config.validate()?;
            let rules = Arc::new(load_rule_set(&store, org).await?);

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("Interrupted, finishing the current batch");
                    on_interrupt.cancel();
                }
            });

            let summary = run_batch_recompute(
                Arc::new(store),
                org,
                rules,
                Utc::now(),
                RecomputeOptions::from_config(&config),
                &cancel,
            )
            .await?;
            print_json(&summary)?;
            summary.ensure_complete()
        }
        Command::Score { contact_id } => {
            let rules = load_rule_set(&store, org).await?;
            print_json(&recompute_contact(&store, org, &contact_id, &rules, Utc::now()).await?)
        }
        Command::Rules { action } => match action {
            RulesCommand::List => print_json(&load_rule_set(&store, org).await?),
            RulesCommand::SetPoints { rule_id, points } => {
                let mut set = load_rule_set(&store, org).await?;
                set.set_points(&rule_id, points)?;
                save_rule_set(&store, org, &mut set).await?;
                print_json(&set)
            }
            RulesCommand::Toggle { rule_id, enabled } => {
                let mut set = load_rule_set(&store, org).await?;
                set.set_enabled(&rule_id, enabled)?;
                save_rule_set(&store, org, &mut set).await?;
                print_json(&set)
            }
            RulesCommand::Reset => print_json(&reset_rule_set(&store, org).await?),
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            match serde_json::to_string_pretty(&ErrorReport::from(&err)) {
                Ok(report) => eprintln!("{report}"),
                Err(_) => eprintln!("{err}"),
            }
            ExitCode::FAILURE
        }
    }
}
