use std::path::Path;

use log::{info, warn};
use toml_edit::{value, DocumentMut, Item, Table};

use crate::config::{sanitize_config, Config};

fn ensure_section_table(document: &mut DocumentMut, key: &str) {
    let root = document.as_table_mut();
    let should_replace = !matches!(root.get(key), Some(item) if item.is_table());
    if should_replace {
        root.insert(key, Item::Table(Table::new()));
    }
}

fn set_table_value_preserving_decor(table: &mut Table, key: &str, item: Item) {
    let existing_value_decor = table
        .get(key)
        .and_then(|current| current.as_value().map(|value| value.decor().clone()));
    table[key] = item;
    if let Some(existing_value_decor) = existing_value_decor {
        if let Some(next_value) = table[key].as_value_mut() {
            *next_value.decor_mut() = existing_value_decor;
        }
    }
}

/// Rewrites `sync.current_user` in `existing_text`, leaving comments and layout intact.
pub fn set_current_user_with_preserved_comments(
    existing_text: &str,
    user: &str,
) -> Result<String, String> {
    let mut document = existing_text
        .parse::<DocumentMut>()
        .map_err(|err| format!("failed to parse existing config as TOML document: {}", err))?;
    ensure_section_table(&mut document, "sync");
    let sync = document["sync"]
        .as_table_mut()
        .ok_or_else(|| "sync should be a table".to_string())?;
    set_table_value_preserving_decor(sync, "current_user", value(user));
    Ok(document.to_string())
}

pub fn persist_current_user(path: &Path, user: &str) {
    let existing_text = std::fs::read_to_string(path).unwrap_or_default();
    let config_text = match set_current_user_with_preserved_comments(&existing_text, user) {
        Ok(updated_text) => updated_text,
        Err(err) => {
            warn!(
                "Failed to preserve config comments for {} ({}). Falling back to plain serialization.",
                path.display(),
                err
            );
            let mut config = toml::from_str::<Config>(&existing_text).unwrap_or_default();
            config.sync.current_user = Some(user.to_string());
            let Ok(plain_text) = toml::to_string(&config) else {
                log::error!("Failed to serialize config for {}", path.display());
                return;
            };
            plain_text
        }
    };

    if let Err(err) = std::fs::write(path, config_text) {
        log::error!("Failed to persist config to {}: {}", path.display(), err);
    }
}

/// Writes the default config when `path` does not exist yet.
pub fn ensure_config_file(path: &Path) -> Result<(), String> {
    if path.exists() {
        return Ok(());
    }
    info!(
        "Config file not found. Creating default config. path={}",
        path.display()
    );
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| format!("failed to create {}: {}", parent.display(), err))?;
    }
    let default_text = toml::to_string(&Config::default())
        .map_err(|err| format!("failed to serialize default config: {}", err))?;
    std::fs::write(path, default_text)
        .map_err(|err| format!("failed to write {}: {}", path.display(), err))
}

pub fn load_config_file(path: &Path) -> Config {
    let config_content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!(
                "Failed to read config file {}. Using defaults. error={}",
                path.display(),
                err
            );
            return Config::default();
        }
    };

    match toml::from_str::<Config>(&config_content) {
        Ok(config) => sanitize_config(config),
        Err(err) => {
            warn!(
                "Failed to parse config file {}. Using defaults. error={}",
                path.display(),
                err
            );
            Config::default()
        }
    }
}
