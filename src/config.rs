use crate::services::layout::StoragePaths;
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub tmp_dir: Option<PathBuf>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "d3: filesystem-backed S3-compatible object store")]
pub struct Args {
    /// Host to bind to (overrides D3_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides D3_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Storage root holding d3.yaml and buckets/ (overrides D3_DATA_DIR)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Staging and bin area, must be on the same filesystem as the data
    /// dir (overrides D3_TMP_DIR, defaults to <data-dir>/tmp)
    #[arg(long)]
    pub tmp_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::merge(Args::parse())
    }

    fn merge(args: Args) -> Result<Self> {
        let env_host = env::var("D3_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("D3_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing D3_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading D3_PORT"),
        };
        let env_data = env::var_os("D3_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
        let env_tmp = env::var_os("D3_TMP_DIR").map(PathBuf::from);

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            data_dir: args.data_dir.unwrap_or(env_data),
            tmp_dir: args.tmp_dir.or(env_tmp),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn storage_paths(&self) -> StoragePaths {
        StoragePaths::new(self.data_dir.clone(), self.tmp_dir.clone())
    }
}
