// ABOUTME: Entry point for the revkv binary.
// ABOUTME: Parses CLI arguments, initializes tracing, and runs KV commands against a SQLite-backed store.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use revkv_core::Error;
use revkv_log::SqlLog;
use revkv_sqlite::SqliteDialect;
use revkv_store::LogStructured;

#[derive(Parser, Debug)]
#[command(name = "revkv", version, about = "Revision-ordered key-value store over SQLite")]
struct Cli {
    /// Path to the SQLite database file
    #[arg(long, default_value = "revkv.db", global = true)]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a key, creating it or replacing its current value
    Put {
        key: String,
        value: String,

        /// Lease in seconds; the key expires this long after its last write
        #[arg(long, default_value = "0")]
        lease: i64,
    },

    /// Read a key, optionally at a historical revision
    Get {
        key: String,

        /// Revision to read at (0 = current)
        #[arg(long, default_value = "0")]
        revision: i64,
    },

    /// Delete a key
    Delete {
        key: String,

        /// Only delete if the key is at this revision (0 = unconditional)
        #[arg(long, default_value = "0")]
        revision: i64,
    },

    /// List keys under a prefix
    List {
        prefix: String,

        /// Maximum number of keys to return (0 = all)
        #[arg(long, default_value = "0")]
        limit: i64,

        /// Revision to list at (0 = current)
        #[arg(long, default_value = "0")]
        revision: i64,
    },

    /// Stream changes under a prefix until interrupted
    Watch {
        prefix: String,

        /// Revision to start from, inclusive (0 = all retained history)
        #[arg(long, default_value = "0")]
        revision: i64,
    },

    /// Compact history, keeping only the latest row per key below the floor
    Compact {
        /// Compact up to this revision; defaults to a safety margin
        /// below the current revision
        revision: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "revkv=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    let dialect = Arc::new(SqliteDialect::open(&cli.db)?);
    let store = LogStructured::new(SqlLog::new(dialect));
    store.start().await?;

    let result = run(&store, cli.command).await;
    store.stop().await;
    result
}

async fn run(store: &LogStructured<SqlLog>, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Put { key, value, lease } => {
            let rev = put(store, &key, value.as_bytes(), lease).await?;
            println!("{rev}");
        }
        Commands::Get { key, revision } => {
            let (_, kv) = store.get(&key, revision).await?;
            match kv {
                Some(kv) => println!("{}", serde_json::to_string_pretty(&kv)?),
                None => anyhow::bail!("key not found: {key}"),
            }
        }
        Commands::Delete { key, revision } => {
            let (rev, _, deleted) = store.delete(&key, revision).await?;
            if !deleted {
                anyhow::bail!("delete refused: {key} is at revision {rev}");
            }
            println!("{rev}");
        }
        Commands::List {
            prefix,
            limit,
            revision,
        } => {
            let (rev, kvs) = store.list(&prefix, "", limit, revision).await?;
            tracing::info!(rev, count = kvs.len(), "listed {prefix}");
            println!("{}", serde_json::to_string_pretty(&kvs)?);
        }
        Commands::Watch { prefix, revision } => {
            let mut events = store.watch(&prefix, revision).await;
            loop {
                tokio::select! {
                    batch = events.recv() => match batch {
                        Some(batch) => {
                            for event in batch {
                                println!("{}", serde_json::to_string(&event)?);
                            }
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Commands::Compact { revision } => {
            let cursor = match revision {
                Some(revision) => store.log().compact_to(revision).await?,
                None => store.log().compact_once().await?,
            };
            println!("{cursor}");
        }
    }
    Ok(())
}

/// Create the key, or replace its value at whatever revision it is
/// currently at. Loops on lost races so concurrent writers all land.
async fn put(
    store: &LogStructured<SqlLog>,
    key: &str,
    value: &[u8],
    lease: i64,
) -> anyhow::Result<i64> {
    loop {
        match store.create(key, value, lease).await {
            Ok(rev) => return Ok(rev),
            Err(Error::KeyExists) => {}
            Err(err) => return Err(err.into()),
        }

        let (_, kv) = store.get(key, 0).await?;
        let Some(kv) = kv else {
            // deleted between attempts; retry the create
            continue;
        };
        let (rev, _, updated) = store.update(key, value, kv.mod_revision, lease).await?;
        if updated {
            return Ok(rev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_put_with_lease() {
        let cli = Cli::try_parse_from(["revkv", "put", "/a", "v", "--lease", "5"]).unwrap();
        match cli.command {
            Commands::Put { key, value, lease } => {
                assert_eq!(key, "/a");
                assert_eq!(value, "v");
                assert_eq!(lease, 5);
            }
            _ => panic!("expected put"),
        }
    }

    #[test]
    fn parses_compact_with_and_without_revision() {
        let cli = Cli::try_parse_from(["revkv", "compact", "42"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Compact { revision: Some(42) }
        ));

        let cli = Cli::try_parse_from(["revkv", "compact"]).unwrap();
        assert!(matches!(cli.command, Commands::Compact { revision: None }));
    }

    #[test]
    fn db_flag_applies_after_a_subcommand() {
        let cli = Cli::try_parse_from(["revkv", "get", "/a", "--db", "x.db"]).unwrap();
        assert_eq!(cli.db, PathBuf::from("x.db"));
    }
}
