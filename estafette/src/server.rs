use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::try_join;
use rustls_pemfile::{certs, private_key};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use esta_proto::eas::{self, EasEngine};
use esta_proto::smtp::SmtpServer;
use esta_store::mail::store::MailStore;
use esta_store::notify::ChangeBus;
use esta_store::oof::OofRegistry;
use esta_user::config::*;
use esta_user::login::static_provider::StaticLoginProvider;
use esta_user::login::ArcLoginProvider;

pub struct Server {
    eas_unsecure: Option<eas::Server>,
    eas_secure: Option<eas::Server>,
    smtp_servers: Vec<Arc<SmtpServer>>,
    pid_file: Option<PathBuf>,
}

impl Server {
    pub async fn from_config(config: ProviderConfig) -> Result<Self> {
        let login: ArcLoginProvider =
            Arc::new(StaticLoginProvider::new(config.users.clone()).await?);
        Self::build(config, login).await
    }

    /// `--dev`: a demo account instead of a user-list file.
    pub async fn from_dev_config(config: ProviderConfig) -> Result<Self> {
        let login: ArcLoginProvider = Arc::new(StaticLoginProvider::from_clear_entries(&[(
            "alice@example.tld",
            "hunter2",
        )])?);
        tracing::info!("dev mode: account alice@example.tld / hunter2");
        Self::build(config, login).await
    }

    async fn build(config: ProviderConfig, login: ArcLoginProvider) -> Result<Self> {
        std::fs::create_dir_all(&config.state_dir)?;

        let bus = ChangeBus::new();
        let store = MailStore::new(bus);
        let oof = Arc::new(OofRegistry::with_snapshot(config.state_dir.join("oof.bin")));

        let engine = EasEngine::new(
            login.clone(),
            store.clone(),
            oof.clone(),
            config.autodiscover.clone(),
            Some(config.state_dir.clone()),
        );

        let eas_unsecure = config
            .eas_unsecure
            .map(|c| eas::new_unsecure(c, engine.clone()));
        let eas_secure = match config.eas {
            Some(c) => Some(eas::new(c, engine.clone())?),
            None => None,
        };

        let mut smtp_servers = Vec::new();
        if let Some(smtp) = config.smtp {
            let acceptor = match (&smtp.certs, &smtp.key) {
                (Some(certs), Some(key)) => Some(tls_acceptor(certs, key)?),
                _ => None,
            };
            if let Some(addr) = smtp.mta_bind_addr {
                smtp_servers.push(SmtpServer::new(
                    addr,
                    smtp.hostname.clone(),
                    login.clone(),
                    store.clone(),
                    oof.clone(),
                    acceptor.clone(),
                    false,
                ));
            }
            if let Some(addr) = smtp.submission_bind_addr {
                smtp_servers.push(SmtpServer::new(
                    addr,
                    smtp.hostname.clone(),
                    login.clone(),
                    store.clone(),
                    oof.clone(),
                    acceptor.clone(),
                    false,
                ));
            }
            if let Some(addr) = smtp.submission_tls_bind_addr {
                match &acceptor {
                    Some(_) => smtp_servers.push(SmtpServer::new(
                        addr,
                        smtp.hostname.clone(),
                        login.clone(),
                        store.clone(),
                        oof.clone(),
                        acceptor.clone(),
                        true,
                    )),
                    None => {
                        tracing::warn!("implicit-TLS submission configured without certificates, listener skipped")
                    }
                }
            }
        }

        Ok(Self {
            eas_unsecure,
            eas_secure,
            smtp_servers,
            pid_file: config.pid,
        })
    }

    pub async fn run(self) -> Result<()> {
        let pid = std::process::id();
        tracing::info!(pid = pid, "starting Estafette");
        if let Some(path) = &self.pid_file {
            std::fs::write(path, pid.to_string())?;
        }

        let exit_signal = watch_exit_signals();

        let eas_unsecure = self.eas_unsecure;
        let eas_secure = self.eas_secure;
        let smtp_servers = self.smtp_servers;

        try_join!(
            async {
                match eas_unsecure {
                    Some(server) => server.run(exit_signal.clone()).await,
                    None => Ok(()),
                }
            },
            async {
                match eas_secure {
                    Some(server) => server.run(exit_signal.clone()).await,
                    None => Ok(()),
                }
            },
            async {
                for result in futures::future::join_all(
                    smtp_servers
                        .iter()
                        .map(|server| server.run(exit_signal.clone())),
                )
                .await
                {
                    result?;
                }
                Ok(())
            },
        )?;

        Ok(())
    }
}

fn watch_exit_signals() -> watch::Receiver<bool> {
    let (send_cancel, watch_cancel) = watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM signal handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received CTRL+C, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
        let _ = send_cancel.send(true);
    });
    watch_cancel
}

fn tls_acceptor(certs_path: &PathBuf, key_path: &PathBuf) -> Result<TlsAcceptor> {
    let loaded_certs = certs(&mut std::io::BufReader::new(std::fs::File::open(
        certs_path,
    )?))
    .collect::<Result<Vec<_>, _>>()?;
    let loaded_key = private_key(&mut std::io::BufReader::new(std::fs::File::open(
        key_path,
    )?))?
    .ok_or(anyhow!("no private key found"))?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(loaded_certs, loaded_key)?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
