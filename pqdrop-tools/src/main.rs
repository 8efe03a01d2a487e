//! PQDROP management tools
//!
//! Inspect and groom persisted resume state, and generate handshake keypairs
//! for diagnostics. Resume state lives in a plain directory, one file per
//! key, so it can be shipped or inspected with ordinary tools.

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use pqdrop_core::kex::HybridKeyPair;
use pqdrop_core::resume::{KvStore, ResumeManager};
use pqdrop_core::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// PQDROP Tools - resume-state and key utilities
#[derive(Parser)]
#[command(name = "pqdrop-tools")]
#[command(about = "PQDROP management and utility tools")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a hybrid handshake keypair and write the public half
    Keygen {
        /// Output path for the hex-encoded combined public key
        #[arg(long)]
        output: PathBuf,
    },

    /// List resumable transfers in a state directory
    InspectResume {
        /// Resume state directory
        #[arg(long)]
        store: PathBuf,
    },

    /// Delete records past their retention window
    Purge {
        /// Resume state directory
        #[arg(long)]
        store: PathBuf,
    },
}

/// One file per key under a root directory
///
/// Keys are slash-separated (`resume/<id>`, `chunk/<id>/<index>`) and map
/// directly to nested paths.
pub struct DirKvStore {
    root: PathBuf,
}

impl DirKvStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(Error::Storage(format!("invalid store key {:?}", key)));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl KvStore for DirKvStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        Ok(keys)
    }
}

#[derive(Serialize)]
struct ResumeSummary {
    transfer_id: String,
    file_name: String,
    size: u64,
    chunks_done: u32,
    chunks_total: u32,
    generation: u32,
    updated_at: String,
}

#[derive(Serialize)]
struct KeygenSummary {
    public_key_file: String,
    combined_public_key_len: usize,
}

fn open_store(dir: &Path) -> ResumeManager {
    ResumeManager::new(Arc::new(DirKvStore::new(dir)))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Keygen { output } => {
            let keypair = HybridKeyPair::generate();
            let public = keypair.combined_public();
            tokio::fs::write(&output, hex::encode(&public))
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            let summary = KeygenSummary {
                public_key_file: output.display().to_string(),
                combined_public_key_len: public.len(),
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Commands::InspectResume { store } => {
            if !store.is_dir() {
                bail!("{} is not a directory", store.display());
            }
            let manager = open_store(&store);
            let records = manager.list_resumable().await?;
            let summaries: Vec<ResumeSummary> = records
                .iter()
                .map(|record| ResumeSummary {
                    transfer_id: record.transfer_id.to_string(),
                    file_name: if record.metadata.name_encrypted {
                        format!("<sealed, {} bytes>", record.metadata.name.len())
                    } else {
                        String::from_utf8_lossy(&record.metadata.name).into_owned()
                    },
                    size: record.metadata.size,
                    chunks_done: record.bitmap.count(),
                    chunks_total: record.bitmap.total_chunks(),
                    generation: record.generation,
                    updated_at: record.updated_at.to_rfc3339(),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }

        Commands::Purge { store } => {
            if !store.is_dir() {
                bail!("{} is not a directory", store.display());
            }
            let manager = open_store(&store);
            let purged = manager.purge_expired().await?;
            println!("{}", serde_json::json!({ "purged": purged }));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    run(Cli::parse()).await
}
