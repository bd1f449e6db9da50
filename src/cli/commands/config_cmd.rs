//! Live configuration commands.

use anyhow::{bail, Context};
use console::style;

use harvester::config::Settings;
use harvester::runtime_config::{keys, ConfigStore};

use crate::cli::helpers::open_stores;

fn check_key(key: &str) -> anyhow::Result<()> {
    if !keys::ALL.contains(&key) {
        bail!(
            "Unknown config key '{}'. Known keys: {}",
            key,
            keys::ALL.join(", ")
        );
    }
    Ok(())
}

fn is_secret(key: &str) -> bool {
    matches!(
        key,
        keys::GEMINI_KEY | keys::PROXY_PASSWORD | keys::WEBHOOK_TOKEN
    )
}

fn masked(key: &str, value: &str) -> String {
    if !is_secret(key) {
        return value.to_string();
    }
    let visible: String = value.chars().take(4).collect();
    format!("{}****", visible)
}

pub async fn cmd_config_get(settings: &Settings, key: Option<&str>) -> anyhow::Result<()> {
    if let Some(key) = key {
        check_key(key)?;
    }
    let stores = open_stores(settings).await?;
    let wanted: Vec<&str> = match key {
        Some(key) => vec![key],
        None => keys::ALL.to_vec(),
    };

    for key in wanted {
        let value = stores
            .config
            .get(key)
            .await
            .with_context(|| format!("Failed to read config key {}", key))?;
        match value {
            Some(v) if !v.is_empty() => println!("{:<18} {}", key, masked(key, &v)),
            _ => println!("{:<18} {}", key, style("(static default)").dim()),
        }
    }
    Ok(())
}

pub async fn cmd_config_set(settings: &Settings, key: &str, value: &str) -> anyhow::Result<()> {
    check_key(key)?;
    if matches!(key, keys::PROXY_HTTP_PORT | keys::PROXY_SOCKS_PORT) && value.parse::<u16>().is_err()
    {
        bail!("{} must be a port number, got '{}'", key, value);
    }
    let stores = open_stores(settings).await?;
    stores
        .config
        .set(key, value)
        .await
        .with_context(|| format!("Failed to set config key {}", key))?;
    println!(
        "{} {} = {} (applies to the next batch)",
        style("✓").green(),
        key,
        masked(key, value)
    );
    Ok(())
}

pub async fn cmd_config_unset(settings: &Settings, key: &str) -> anyhow::Result<()> {
    check_key(key)?;
    let stores = open_stores(settings).await?;
    stores
        .config
        .delete(key)
        .await
        .with_context(|| format!("Failed to unset config key {}", key))?;
    println!("{} {} unset", style("✓").green(), key);
    Ok(())
}
