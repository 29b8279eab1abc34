//! SMTP ingest: the MTA (25) and submission (587/465) listeners.
//!
//! Messages for local recipients are persisted through the mail store,
//! which publishes the change event that wakes Ping long-polls. The OOF
//! registry is consulted after delivery; auto-replies to local senders
//! are themselves delivered through the store.

use std::net::SocketAddr;
use std::{pin::Pin, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use duplexify::Duplex;
use futures::{io, stream, AsyncRead, AsyncReadExt, AsyncWrite, StreamExt};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};

use futures::stream::FuturesUnordered;
use smtp_message::{Email, EscapedDataReader, Reply, ReplyCode};
use smtp_server::{reply, Config, ConnectionMetadata, Decision, IsAlreadyTls, MailMetadata};

use esta_store::mail::store::{Envelope, MailStore};
use esta_store::mail::compose_plain_mail;
use esta_store::oof::OofRegistry;
use esta_user::login::ArcLoginProvider;

pub struct SmtpServer {
    bind_addr: SocketAddr,
    hostname: String,
    login_provider: ArcLoginProvider,
    store: Arc<MailStore>,
    oof: Arc<OofRegistry>,
    tls: Option<TlsAcceptor>,
    /// 465-style: TLS is negotiated before the first SMTP byte.
    implicit_tls: bool,
}

impl SmtpServer {
    pub fn new(
        bind_addr: SocketAddr,
        hostname: String,
        login_provider: ArcLoginProvider,
        store: Arc<MailStore>,
        oof: Arc<OofRegistry>,
        tls: Option<TlsAcceptor>,
        implicit_tls: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            bind_addr,
            hostname,
            login_provider,
            store,
            oof,
            tls,
            implicit_tls,
        })
    }

    pub async fn run(self: &Arc<Self>, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        tracing::info!(
            "SMTP server listening on {:#} (implicit_tls={})",
            self.bind_addr,
            self.implicit_tls
        );

        let mut connections = FuturesUnordered::new();

        while !*must_exit.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            let (socket, remote_addr) = select! {
                a = tcp.accept() => a?,
                _ = wait_conn_finished => continue,
                _ = must_exit.changed() => continue,
            };

            let server = self.clone();
            let conn = tokio::spawn(async move {
                if server.implicit_tls {
                    let Some(acceptor) = server.tls.clone() else {
                        tracing::error!("implicit-TLS listener without an acceptor");
                        return;
                    };
                    match acceptor.accept(socket).await {
                        Ok(stream) => {
                            let _ = smtp_server::interact(
                                stream.compat(),
                                IsAlreadyTls::Yes,
                                Conn { remote_addr },
                                server.clone(),
                            )
                            .await;
                        }
                        Err(e) => tracing::warn!(err=?e, "TLS accept failed"),
                    }
                } else {
                    let _ = smtp_server::interact(
                        socket.compat(),
                        IsAlreadyTls::No,
                        Conn { remote_addr },
                        server.clone(),
                    )
                    .await;
                }
            });

            connections.push(conn);
        }
        drop(tcp);

        tracing::info!("SMTP server shutting down, draining remaining connections...");
        while connections.next().await.is_some() {}

        Ok(())
    }
}

// ----

pub struct Conn {
    #[allow(dead_code)]
    remote_addr: SocketAddr,
}

pub struct Message {
    to: Vec<String>,
}

#[async_trait]
impl Config for SmtpServer {
    type Protocol = smtp_server::protocol::Smtp;

    type ConnectionUserMeta = Conn;
    type MailUserMeta = Message;

    fn hostname(&self, _conn_meta: &ConnectionMetadata<Conn>) -> &str {
        &self.hostname
    }

    async fn new_mail(&self, _conn_meta: &mut ConnectionMetadata<Conn>) -> Message {
        Message { to: vec![] }
    }

    async fn tls_accept<IO>(
        &self,
        io: IO,
        _conn_meta: &mut ConnectionMetadata<Conn>,
    ) -> io::Result<Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>>
    where
        IO: Send + AsyncRead + AsyncWrite,
    {
        let Some(acceptor) = self.tls.clone() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "STARTTLS is not configured on this listener",
            ));
        };

        let tokio_io = Box::pin(io).compat();
        let tls_stream = acceptor.accept(tokio_io).await?;
        let (read_half, write_half) = tls_stream.compat().split();
        Ok(Duplex::new(
            Box::pin(read_half) as Pin<Box<dyn Send + AsyncRead>>,
            Box::pin(write_half) as Pin<Box<dyn Send + AsyncWrite>>,
        ))
    }

    async fn filter_from(
        &self,
        from: Option<Email>,
        _meta: &mut MailMetadata<Message>,
        _conn_meta: &mut ConnectionMetadata<Conn>,
    ) -> Decision<Option<Email>> {
        Decision::Accept {
            reply: reply::okay_from().convert(),
            res: from,
        }
    }

    async fn filter_to(
        &self,
        to: Email,
        meta: &mut MailMetadata<Message>,
        _conn_meta: &mut ConnectionMetadata<Conn>,
    ) -> Decision<Email> {
        let to_str = match to.hostname.as_ref() {
            Some(h) => format!("{}@{}", to.localpart, h),
            None => to.localpart.to_string(),
        };
        match self.login_provider.lookup(&to_str).await {
            Ok(profile) => {
                meta.user.to.push(profile.email);
                Decision::Accept {
                    reply: reply::okay_to().convert(),
                    res: to,
                }
            }
            Err(e) => Decision::Reject {
                reply: Reply {
                    code: ReplyCode::POLICY_REASON,
                    ecode: None,
                    text: vec![smtp_message::MaybeUtf8::Utf8(e.to_string())],
                },
            },
        }
    }

    async fn handle_mail<'resp, R>(
        &'resp self,
        reader: &mut EscapedDataReader<'_, R>,
        meta: MailMetadata<Message>,
        _conn_meta: &'resp mut ConnectionMetadata<Conn>,
    ) -> Pin<Box<dyn futures::Stream<Item = Decision<()>> + Send + 'resp>>
    where
        R: Send + Unpin + AsyncRead,
    {
        let err_response_stream = |meta: MailMetadata<Message>, msg: String| {
            Box::pin(
                stream::iter(meta.user.to.into_iter()).map(move |_| Decision::Reject {
                    reply: Reply {
                        code: ReplyCode::POLICY_REASON,
                        ecode: None,
                        text: vec![smtp_message::MaybeUtf8::Utf8(msg.clone())],
                    },
                }),
            )
        };

        let mut text = Vec::new();
        if reader.read_to_end(&mut text).await.is_err() {
            return err_response_stream(meta, "io error".into());
        }
        reader.complete();

        let from = meta.from.as_ref().map(|e| match e.hostname.as_ref() {
            Some(h) => format!("{}@{}", e.localpart, h),
            None => e.localpart.to_string(),
        });
        let envelope = Envelope {
            from: from.clone(),
            to: meta.user.to.clone(),
        };

        let ids = self.store.ingest(&text, &envelope);
        tracing::info!(
            from = from.as_deref().unwrap_or("<>"),
            rcpts = envelope.to.len(),
            ids = ?ids,
            "message ingested"
        );

        self.send_oof_replies(&envelope).await;

        Box::pin(stream::iter(meta.user.to.into_iter()).map(move |_| Decision::Accept {
            reply: reply::okay_mail().convert(),
            res: (),
        }))
    }
}

impl SmtpServer {
    /// Absence auto-replies, one per (absent recipient, sender), delivered
    /// only when the sender is a mailbox we host.
    async fn send_oof_replies(&self, envelope: &Envelope) {
        let Some(sender) = envelope.from.as_deref() else {
            return;
        };
        // Never answer bounces or our own notifications.
        if sender.is_empty() || sender.starts_with("postmaster@") {
            return;
        }
        for rcpt in &envelope.to {
            let Some(reply_text) = self.oof.auto_reply(rcpt, sender) else {
                continue;
            };
            if self.login_provider.lookup(sender).await.is_err() {
                tracing::debug!(sender=%sender, "OOF reply to foreign sender skipped");
                continue;
            }
            let reply_mail = compose_plain_mail(
                rcpt,
                sender,
                "Automatic reply: out of office",
                &reply_text,
            );
            self.store.ingest(
                &reply_mail,
                &Envelope {
                    from: Some(rcpt.clone()),
                    to: vec![sender.to_string()],
                },
            );
            tracing::debug!(user=%rcpt, sender=%sender, "OOF auto-reply delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use esta_store::mail;
    use esta_store::notify::ChangeBus;
    use esta_store::oof::{OofMessage, OofSettings, OofState};
    use esta_user::login::static_provider::StaticLoginProvider;

    const ALICE: &str = "alice@example.tld";
    const BOB: &str = "bob@example.tld";

    fn server() -> Arc<SmtpServer> {
        let login: ArcLoginProvider = Arc::new(
            StaticLoginProvider::from_clear_entries(&[(ALICE, "pw"), (BOB, "pw")]).unwrap(),
        );
        let store = MailStore::new(ChangeBus::new());
        SmtpServer::new(
            "127.0.0.1:0".parse().unwrap(),
            "mail.example.tld".to_string(),
            login,
            store,
            Arc::new(OofRegistry::new()),
            None,
            false,
        )
    }

    #[tokio::test]
    async fn oof_reply_reaches_a_local_sender() {
        let server = server();
        server
            .oof
            .set(
                ALICE,
                OofSettings {
                    state: OofState::Enabled,
                    internal: OofMessage {
                        enabled: true,
                        reply: "on leave".into(),
                        body_type: "Text".into(),
                    },
                    ..OofSettings::default()
                },
            )
            .unwrap();

        let envelope = Envelope {
            from: Some(BOB.to_string()),
            to: vec![ALICE.to_string()],
        };
        server.send_oof_replies(&envelope).await;

        let bob_inbox = server.store.list_emails(BOB, mail::INBOX, 0, 10);
        assert_eq!(bob_inbox.len(), 1);
        assert!(bob_inbox[0].subject.contains("Automatic reply"));

        // A second message from the same sender stays quiet.
        server.send_oof_replies(&envelope).await;
        assert_eq!(server.store.list_emails(BOB, mail::INBOX, 0, 10).len(), 1);
    }

    #[tokio::test]
    async fn no_oof_reply_to_foreign_senders() {
        let server = server();
        server
            .oof
            .set(
                ALICE,
                OofSettings {
                    state: OofState::Enabled,
                    internal: OofMessage {
                        enabled: true,
                        reply: "on leave".into(),
                        body_type: "Text".into(),
                    },
                    external_audience: esta_store::oof::ExternalAudience::All,
                    external_unknown: OofMessage {
                        enabled: true,
                        reply: "on leave".into(),
                        body_type: "Text".into(),
                    },
                    ..OofSettings::default()
                },
            )
            .unwrap();

        let envelope = Envelope {
            from: Some("stranger@elsewhere.example".to_string()),
            to: vec![ALICE.to_string()],
        };
        server.send_oof_replies(&envelope).await;
        // The reply decision fired, but there is no local mailbox to
        // deliver it to.
        assert_eq!(server.store.list_emails(ALICE, mail::SENT, 0, 10).len(), 0);
    }
}
