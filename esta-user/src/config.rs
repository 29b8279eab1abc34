use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProviderConfig {
    pub pid: Option<PathBuf>,

    /// ActiveSync + Autodiscover over HTTPS.
    pub eas: Option<EasConfig>,
    /// Plaintext HTTP listener, for use behind a reverse proxy.
    pub eas_unsecure: Option<EasUnsecureConfig>,

    pub smtp: Option<SmtpConfig>,

    #[serde(default)]
    pub autodiscover: AutodiscoverConfig,

    /// Where sync-state, device and OOF snapshots are written.
    /// `DATABASE_URL` overrides it.
    pub state_dir: PathBuf,

    /// Reserved for session-token signing; `SECRET_KEY` overrides it.
    pub secret_key: Option<String>,

    pub users: LoginStaticConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EasConfig {
    pub bind_addr: SocketAddr,
    pub certs: PathBuf,
    pub key: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EasUnsecureConfig {
    pub bind_addr: SocketAddr,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SmtpConfig {
    /// Port 25 listener.
    pub mta_bind_addr: Option<SocketAddr>,
    /// Port 587 listener (STARTTLS when a certificate is configured).
    pub submission_bind_addr: Option<SocketAddr>,
    /// Port 465 listener; only started when a certificate is configured.
    pub submission_tls_bind_addr: Option<SocketAddr>,
    pub hostname: String,
    pub certs: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AutodiscoverConfig {
    /// Mail domain, the part clients type after `@`.
    pub domain: String,
    /// Host that serves ActiveSync and OWA URLs.
    pub hostname: String,
}

impl Default for AutodiscoverConfig {
    fn default() -> Self {
        Self {
            domain: "example.tld".to_string(),
            hostname: "mail.example.tld".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginStaticConfig {
    pub user_list: PathBuf,
}

/// One account in the user-list file, keyed by email address.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserEntry {
    pub password: String,

    #[serde(default = "default_true")]
    pub active: bool,

    pub display_name: Option<String>,
}

pub type UserList = HashMap<String, UserEntry>;

fn default_true() -> bool {
    true
}

impl ProviderConfig {
    /// Environment variables documented by the deployment guide take
    /// precedence over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(domain) = std::env::var("DOMAIN") {
            self.autodiscover.domain = domain;
        }
        if let Ok(hostname) = std::env::var("HOSTNAME") {
            self.autodiscover.hostname = hostname;
        }
        if let Ok(secret) = std::env::var("SECRET_KEY") {
            self.secret_key = Some(secret);
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.state_dir = PathBuf::from(url.strip_prefix("file://").unwrap_or(&url));
        }
    }
}

pub fn read_config<T: serde::de::DeserializeOwned>(config_file: PathBuf) -> Result<T> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(config_file.as_path())?;

    let mut config = String::new();
    file.read_to_string(&mut config)?;

    Ok(toml::from_str(&config)?)
}

pub fn write_config<T: Serialize>(config_file: PathBuf, config: &T) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(config_file.as_path())?;

    file.write_all(toml::to_string(config)?.as_bytes())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_entry_active_defaults_to_true() {
        let ulist: UserList = toml::from_str(
            r#"
            ["alice@example.tld"]
            password = "$argon2id$..."

            ["bob@example.tld"]
            password = "$argon2id$..."
            active = false
            "#,
        )
        .unwrap();
        assert!(ulist["alice@example.tld"].active);
        assert!(!ulist["bob@example.tld"].active);
    }
}
