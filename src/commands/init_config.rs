use anyhow::{Context, Result};
use bigbro::config::{self, AdmissionConfig};
use std::path::PathBuf;
use tracing::info;

/// Write a config file holding the default settings.
pub fn handle_init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(config::config_path);

    if path.exists() && !force {
        anyhow::bail!(
            "Config file {:?} already exists (use --force to overwrite)",
            path
        );
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    AdmissionConfig::default().save(&path)?;
    info!("Wrote default config to {:?}", path);
    Ok(())
}
