use anyhow::{Result, anyhow};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::auth::password_store;
use crate::domain::email::Protocol;
use crate::mail::Credentials;

const APP_DIR: &str = "rs_mail_ingest";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    /// Prefer the keyring (`set-password`) or `MAIL_PASSWORD` over this.
    pub password: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    pub folder: Option<String>,
    pub db_path: Option<String>,
}

impl Config {
    pub fn folder(&self) -> &str {
        self.folder.as_deref().unwrap_or("INBOX")
    }

    /// Resolve the password and build credentials, optionally overriding the protocol.
    pub fn credentials(&self, protocol: Option<Protocol>) -> Result<Credentials> {
        let protocol = protocol.unwrap_or(self.protocol);
        let password = match &self.password {
            Some(p) => p.clone(),
            None => resolve_password(
                password_store::load_password(&self.username),
                std::env::var("MAIL_PASSWORD").ok(),
            )
            .ok_or_else(|| {
                anyhow!(
                    "no password for {}: run `set-password` or export MAIL_PASSWORD",
                    self.username
                )
            })?,
        };
        Ok(Credentials {
            host: self.host.clone(),
            port: self.port.unwrap_or_else(|| protocol.default_port()),
            username: self.username.clone(),
            password,
            protocol,
        })
    }
}

/// Keyring first, then the environment. An unreachable keyring only warns.
fn resolve_password(keyring: Result<Option<String>>, env: Option<String>) -> Option<String> {
    let stored = keyring.unwrap_or_else(|e| {
        warn!("keyring unavailable ({e}), falling back to MAIL_PASSWORD");
        None
    });
    stored.or(env)
}

fn config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or_else(|| anyhow!("no config dir available"))?
        .join(APP_DIR))
}

pub fn config_path() -> Result<PathBuf> {
    let mut p = config_dir()?;
    fs::create_dir_all(&p)?;
    p.push("config.toml");
    Ok(p)
}

pub fn default_db_path() -> Result<PathBuf> {
    let mut p = config_dir()?;
    fs::create_dir_all(&p)?;
    p.push("mail.db");
    Ok(p)
}

pub fn load_config() -> Result<Config> {
    let path = config_path()?;
    if !path.exists() {
        // create a template config for users to edit
        let sample = Config {
            host: "imap.example.com".to_string(),
            port: None,
            username: "you@example.com".to_string(),
            password: None,
            protocol: Protocol::Imap,
            folder: Some("INBOX".to_string()),
            db_path: None,
        };
        let tom = toml::to_string_pretty(&sample)?;
        fs::write(&path, tom)?;
        return Err(anyhow!(
            "Created template config at {}: edit it and run again",
            path.display()
        ));
    }
    let s = fs::read_to_string(path)?;
    parse_config(&s)
}

pub fn parse_config(s: &str) -> Result<Config> {
    Ok(toml::from_str(s)?)
}

pub fn resolve_db_path(cfg: &Config) -> Result<PathBuf> {
    if let Some(p) = &cfg.db_path {
        Ok(PathBuf::from(p))
    } else {
        default_db_path()
    }
}
