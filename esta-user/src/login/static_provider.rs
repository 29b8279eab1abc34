use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use crate::config::*;
use crate::login::*;

pub struct ContextualUserEntry {
    pub email: String,
    pub config: UserEntry,
}

#[derive(Default)]
pub struct UserDatabase {
    users: HashMap<String, Arc<ContextualUserEntry>>,
}

pub struct StaticLoginProvider {
    user_db: watch::Receiver<UserDatabase>,
}

pub async fn update_user_list(config: PathBuf, up: watch::Sender<UserDatabase>) -> Result<()> {
    let mut stream = signal(SignalKind::user_defined1())
        .expect("failed to install SIGUSR1 signal handler for reload");

    loop {
        let ulist: UserList = match read_config(config.clone()) {
            Ok(x) => x,
            Err(e) => {
                tracing::warn!(path=%config.as_path().to_string_lossy(), error=%e, "Unable to load user list");
                stream.recv().await;
                continue;
            }
        };

        let users = ulist
            .into_iter()
            .map(|(email, config)| {
                (
                    email.clone(),
                    Arc::new(ContextualUserEntry { email, config }),
                )
            })
            .collect::<HashMap<_, _>>();

        tracing::info!("{} users loaded", users.len());
        up.send(UserDatabase { users })
            .context("update user db config")?;
        stream.recv().await;
        tracing::info!("Received SIGUSR1, reloading");
    }
}

impl StaticLoginProvider {
    pub async fn new(config: LoginStaticConfig) -> Result<Self> {
        let (tx, mut rx) = watch::channel(UserDatabase::default());

        tokio::spawn(update_user_list(config.user_list, tx));
        rx.changed().await?;

        Ok(Self { user_db: rx })
    }

    /// Provider over a fixed list, for `--dev` mode and tests. Passwords
    /// are given in clear and hashed on the spot.
    pub fn from_clear_entries(entries: &[(&str, &str)]) -> Result<Self> {
        let users = entries
            .iter()
            .map(|(email, password)| {
                Ok((
                    email.to_string(),
                    Arc::new(ContextualUserEntry {
                        email: email.to_string(),
                        config: UserEntry {
                            password: hash_password(password)?,
                            active: true,
                            display_name: None,
                        },
                    }),
                ))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        let (tx, rx) = watch::channel(UserDatabase { users });
        drop(tx);
        Ok(Self { user_db: rx })
    }
}

#[async_trait]
impl LoginProvider for StaticLoginProvider {
    async fn login(&self, username: &str, password: &str) -> Result<UserProfile> {
        tracing::debug!(user=%username, "login");
        let user = {
            let user_db = self.user_db.borrow();
            match user_db.users.get(username) {
                None => bail!("User {} does not exist", username),
                Some(u) => u.clone(),
            }
        };

        if !user.config.active {
            bail!("Account {} is disabled", username);
        }

        tracing::debug!(user=%username, "verify password");
        if !verify_password(password, &user.config.password)? {
            bail!("Wrong password");
        }

        Ok(UserProfile {
            email: user.email.clone(),
            display_name: user.config.display_name.clone(),
        })
    }

    async fn lookup(&self, email: &str) -> Result<UserProfile> {
        let user = {
            let user_db = self.user_db.borrow();
            match user_db.users.get(email) {
                None => bail!("Email {} does not exist", email),
                Some(u) => u.clone(),
            }
        };
        if !user.config.active {
            bail!("Account {} is disabled", email);
        }

        Ok(UserProfile {
            email: user.email.clone(),
            display_name: user.config.display_name.clone(),
        })
    }
}
