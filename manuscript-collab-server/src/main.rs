use anyhow::{bail, Context, Result};
use clap::Parser;
use manuscript_collab::storage::StoreError;
use manuscript_collab::{CollabError, CollabServer, ManuscriptId, ServerConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "manuscript-collab-server")]
#[command(about = "Real-time collaborative manuscript editing server")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration file
    #[arg(short, long)]
    bind: Option<String>,

    /// RocksDB directory; without one manuscripts live in memory only
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Create a manuscript from a text file before serving: ID=FILE
    #[arg(long, value_name = "ID=FILE")]
    seed: Vec<String>,
}

fn parse_seed(seed: &str) -> Result<(ManuscriptId, PathBuf)> {
    match seed.split_once('=') {
        Some((id, file)) if !id.is_empty() && !file.is_empty() => {
            Ok((ManuscriptId::new(id), PathBuf::from(file)))
        }
        _ => bail!("invalid --seed {seed:?}, expected ID=FILE"),
    }
}

fn load_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_toml_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = &cli.bind {
        config.bind_addr = bind.clone();
    }
    if let Some(storage) = &cli.storage {
        config.storage_path = Some(storage.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let seeds = cli
        .seed
        .iter()
        .map(|s| parse_seed(s))
        .collect::<Result<Vec<_>>>()?;

    let server = CollabServer::new(config).context("opening manuscript store")?;
    for (id, file) in seeds {
        let content = std::fs::read_to_string(&file)
            .with_context(|| format!("reading seed {}", file.display()))?;
        match server.service().create_manuscript(&id, &content) {
            Ok(()) => log::info!("Seeded {id} from {}", file.display()),
            Err(CollabError::PersistenceFailure(StoreError::AlreadyExists(_))) => {
                log::info!("Manuscript {id} already stored, seed skipped");
            }
            Err(e) => return Err(e).with_context(|| format!("seeding {id}")),
        }
    }

    log::info!("Starting manuscript collaboration server on {}", server.bind_addr());
    server.run().await.map_err(|e| anyhow::anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seed() {
        let (id, file) = parse_seed("novel=drafts/novel.txt").unwrap();
        assert_eq!(id.as_str(), "novel");
        assert_eq!(file, PathBuf::from("drafts/novel.txt"));
        assert!(parse_seed("novel").is_err());
        assert!(parse_seed("=file").is_err());
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from([
            "manuscript-collab-server",
            "--bind",
            "0.0.0.0:7000",
            "--storage",
            "/tmp/ms-db",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/ms-db")));
        assert_eq!(config.max_sessions_per_manuscript, 50);
    }
}
