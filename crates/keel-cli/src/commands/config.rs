//! Config command implementations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::output::{print_error, print_info, print_success, print_warning};
use keel_core::config::{self, ServerConfig};

fn resolve(config_path: Option<&PathBuf>) -> PathBuf {
    config_path.cloned().unwrap_or_else(config::default_config_path)
}

/// Load the server configuration, falling back to defaults when absent
pub fn load_server_config(config_path: Option<&PathBuf>) -> Result<ServerConfig> {
    let path = resolve(config_path);
    if path.exists() {
        config::load_config(&path).with_context(|| format!("Failed to load config from {:?}", path))
    } else if config_path.is_some() {
        anyhow::bail!("Config file not found: {:?}", path)
    } else {
        tracing::debug!("No config at {:?}, using defaults", path);
        Ok(ServerConfig::default())
    }
}

/// Show the configuration file, or the defaults when there is none
pub fn config_show(config_path: Option<&PathBuf>) -> Result<()> {
    let path = resolve(config_path);

    if !path.exists() {
        print_warning(&format!("No configuration file found at {:?}", path));
        print_info("Effective defaults:");
        println!();
        println!("{}", render(&ServerConfig::default())?);
        return Ok(());
    }

    let config: ServerConfig = config::load_config(&path)
        .with_context(|| format!("Failed to load config from {:?}", path))?;

    print_info(&format!("Configuration file: {:?}", path));
    println!();
    println!("{}", render(&config)?);

    if let Err(e) = config.validate() {
        print_warning(&format!("Configuration will be rejected by keeld: {}", e));
    }
    Ok(())
}

pub fn config_path(config_path: Option<&PathBuf>) {
    println!("{}", resolve(config_path).display());
}

/// Write a default configuration file
pub fn config_init(config_path: Option<&PathBuf>, force: bool) -> Result<bool> {
    let path = resolve(config_path);

    if path.exists() && !force {
        print_error(&format!("Config file already exists: {:?}", path));
        print_info("Use --force to overwrite");
        return Ok(false);
    }

    write_default(&path)?;
    print_success(&format!("Created configuration file: {:?}", path));
    Ok(true)
}

fn write_default(path: &Path) -> Result<()> {
    config::save_config(path, &ServerConfig::default())
        .with_context(|| format!("Failed to write config file: {:?}", path))
}

fn render(config: &ServerConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to render configuration")
}
