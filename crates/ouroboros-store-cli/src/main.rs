//! ouroboros-store CLI
//!
//! One-shot access to any store backend: open, run one command, close.

use clap::{Parser, Subcommand};
use ouroboros_store::{BackendConfig, BulkOperation, Database};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "ouroboros-store")]
#[command(about = "Key-value access to ouroboros-store backends")]
struct Args {
    /// Backend name (memory, disk, kvserver, redis). Falls back to STORE_BACKEND
    #[arg(short, long)]
    backend: Option<String>,

    /// Backend options as a JSON object. Falls back to STORE_SETTINGS
    #[arg(short, long)]
    settings: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the value stored under KEY
    Get { key: String },

    /// Store VALUE under KEY
    Set { key: String, value: String },

    /// Delete KEY
    Rm { key: String },

    /// List keys matching "namespace:*"
    Keys {
        pattern: String,

        /// Drop keys matching this pattern (e.g. "*:*:*")
        #[arg(short, long)]
        exclude: Option<String>,
    },

    /// Apply a JSON array of {"op": "set"|"remove", "key", "value"} entries
    Bulk { file: PathBuf },
}

#[derive(Deserialize, Debug)]
#[serde(tag = "op", rename_all = "lowercase")]
enum BulkEntry {
    Set { key: String, value: serde_json::Value },
    Remove { key: String },
}

impl From<BulkEntry> for BulkOperation {
    fn from(entry: BulkEntry) -> Self {
        match entry {
            // Strings are stored as-is, anything else as its JSON text
            BulkEntry::Set {
                key,
                value: serde_json::Value::String(text),
            } => BulkOperation::set(key, text),
            BulkEntry::Set { key, value } => BulkOperation::set(key, value.to_string()),
            BulkEntry::Remove { key } => BulkOperation::remove(key),
        }
    }
}

fn backend_config(args: &Args) -> Result<BackendConfig, Box<dyn std::error::Error>> {
    let settings = args
        .settings
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?
        .unwrap_or(serde_json::Value::Null);

    let config = match &args.backend {
        Some(name) => BackendConfig::from_settings(name, settings)?,
        None if args.settings.is_some() => {
            let name = std::env::var("STORE_BACKEND").unwrap_or_else(|_| "memory".to_string());
            BackendConfig::from_settings(&name, settings)?
        }
        None => BackendConfig::from_env()?,
    };
    Ok(config)
}

/// Run one command, returning the process exit code
async fn run(db: &Database, command: Command) -> Result<i32, Box<dyn std::error::Error>> {
    match command {
        Command::Get { key } => match db.get(&key).await? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => {
                eprintln!("(nil)");
                return Ok(1);
            }
        },
        Command::Set { key, value } => db.set(&key, value).await?,
        Command::Rm { key } => db.remove(&key).await?,
        Command::Keys { pattern, exclude } => {
            for key in db.find_keys(&pattern, exclude.as_deref()).await? {
                println!("{}", key);
            }
        }
        Command::Bulk { file } => {
            let raw = std::fs::read(&file)?;
            let entries: Vec<BulkEntry> = serde_json::from_slice(&raw)?;
            let ops: Vec<BulkOperation> = entries.into_iter().map(Into::into).collect();
            let report = db.do_bulk(ops).await.inspect_err(|e| {
                if let Some(applied) = e.applied() {
                    eprintln!("{} operations committed before the failure", applied);
                }
            })?;
            println!(
                "{} operations applied ({:?})",
                report.operations, report.atomicity
            );
        }
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = backend_config(&args)?;
    debug!("Using {} backend: {:?}", config.backend_type(), config);

    let db = Database::new(config.backend_type())?;
    db.init_with(config).await?;

    let result = run(&db, args.command).await;
    db.close().await?;
    let code = result?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_entries_parse() {
        let raw = r#"[
            {"op": "set", "key": "user:1", "value": "ada"},
            {"op": "set", "key": "user:2", "value": {"name": "grace"}},
            {"op": "remove", "key": "user:3"}
        ]"#;
        let entries: Vec<BulkEntry> = serde_json::from_str(raw).unwrap();
        let ops: Vec<BulkOperation> = entries.into_iter().map(Into::into).collect();

        assert_eq!(ops[0], BulkOperation::set("user:1", "ada"));
        assert_eq!(ops[1], BulkOperation::set("user:2", r#"{"name":"grace"}"#));
        assert_eq!(ops[2], BulkOperation::remove("user:3"));
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "ouroboros-store",
            "--backend",
            "disk",
            "--settings",
            r#"{"directory": "/tmp/store"}"#,
            "keys",
            "pad:*",
            "--exclude",
            "*:*:*",
        ])
        .unwrap();

        let config = backend_config(&args).unwrap();
        assert_eq!(config.backend_type(), "disk");
        match args.command {
            Command::Keys { pattern, exclude } => {
                assert_eq!(pattern, "pad:*");
                assert_eq!(exclude.as_deref(), Some("*:*:*"));
            }
            other => panic!("Expected keys command, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_settings_json() {
        let args =
            Args::try_parse_from(["ouroboros-store", "-b", "memory", "-s", "{oops", "get", "k"])
                .unwrap();
        assert!(backend_config(&args).is_err());
    }

    #[tokio::test]
    async fn test_run_against_memory() {
        let db = Database::new("memory").unwrap();
        db.init(serde_json::Value::Null).await.unwrap();

        let code = run(
            &db,
            Command::Set {
                key: "user:1".to_string(),
                value: "ada".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(code, 0);
        assert_eq!(db.get("user:1").await.unwrap(), Some(b"ada".to_vec()));

        run(&db, Command::Rm { key: "user:1".to_string() }).await.unwrap();
        let code = run(&db, Command::Get { key: "user:1".to_string() }).await.unwrap();
        assert_eq!(code, 1);
        db.close().await.unwrap();
    }
}
