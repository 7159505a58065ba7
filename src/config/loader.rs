use std::path::Path;

use config::{Config, Environment as EnvSource, File, FileFormat};
use eyre::{Context, Result};

use crate::{config::models::ServerConfig, core::entities::StoreSeed};

/// Prefix of environment variables overriding file settings,
/// e.g. `PORTICO__LOGGING__LEVEL=debug`.
pub const ENV_PREFIX: &str = "PORTICO";

fn format_for(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml,
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))
}

/// Load server configuration from a file, with environment overrides.
pub async fn load_config(config_path: &str) -> Result<ServerConfig> {
    load_config_sync(config_path)
}

/// Load server configuration synchronously.
///
/// A missing file is not an error: defaults plus environment overrides apply.
pub fn load_config_sync(config_path: &str) -> Result<ServerConfig> {
    let path = Path::new(config_path);

    let settings = Config::builder()
        .add_source(File::new(path_str(path)?, format_for(path)).required(false))
        .add_source(
            EnvSource::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", path.display()))?;

    settings
        .try_deserialize::<ServerConfig>()
        .with_context(|| format!("Failed to deserialize config from {}", path.display()))
}

/// Load an administrative document set (gateways and routes) from a file.
pub fn load_seed_file(seed_path: &Path) -> Result<StoreSeed> {
    let settings = Config::builder()
        .add_source(File::new(path_str(seed_path)?, format_for(seed_path)))
        .build()
        .with_context(|| format!("Failed to read seed file {}", seed_path.display()))?;

    settings
        .try_deserialize::<StoreSeed>()
        .with_context(|| format!("Failed to parse seed file {}", seed_path.display()))
}
