//! The ActiveSync HTTP front-end: accept loop, Basic authentication,
//! provisioning gate, command dispatch and the per-request log line.

pub mod body;
pub mod compose;
pub mod device;
pub mod estimate;
pub mod folder_sync;
pub mod itemops;
pub mod moveitems;
pub mod ping;
pub mod provision;
pub mod search;
pub mod settings;
pub mod state;
pub mod strategy;
pub mod sync;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use base64::Engine;
use futures::stream::{FuturesUnordered, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body as _, Bytes, Incoming};
use hyper::rt::{Read, Write};
use hyper::server::conn::http1 as http;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls_pemfile::{certs, private_key};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use esta_store::mail::store::MailStore;
use esta_store::oof::OofRegistry;
use esta_user::config::{AutodiscoverConfig, EasConfig, EasUnsecureConfig};
use esta_user::login::{ArcLoginProvider, UserProfile};
use esta_wbxml as wbxml;
use esta_wbxml::{pages, Element};

use crate::autodiscover;
use crate::eas::device::DeviceRegistry;
use crate::eas::state::SyncStateRegistry;
use crate::eas::strategy::ClientStrategy;

/// Advertised verbatim in Options and on every response. 14.1 only: a
/// version in this list is a promise the whole command set keeps.
pub const PROTOCOL_VERSIONS: &str = "14.1";
pub const PROTOCOL_COMMANDS: &str =
    "Sync,FolderSync,Provision,Options,Ping,ItemOperations,GetItemEstimate,SendMail,SmartForward,SmartReply,Settings";
pub const SERVER_VERSION: &str = "14.1";

const NORMAL_DEADLINE: Duration = Duration::from_secs(60);
/// Ping gets `heartbeat + 30s`; this is the outer backstop at max heartbeat.
const PING_DEADLINE: Duration = Duration::from_secs(3540 + 30);
const MAX_REQUEST_BODY: usize = 32 << 20;

/// Commands a device may issue before (or while re-) provisioning.
const GATE_EXEMPT: &[&str] = &["Provision", "Ping", "Options"];

/// Everything the handlers share, one per process.
pub struct EasEngine {
    pub login: ArcLoginProvider,
    pub store: Arc<MailStore>,
    pub oof: Arc<OofRegistry>,
    pub devices: DeviceRegistry,
    pub sync_states: SyncStateRegistry,
    pub autodiscover: AutodiscoverConfig,
}

impl EasEngine {
    pub fn new(
        login: ArcLoginProvider,
        store: Arc<MailStore>,
        oof: Arc<OofRegistry>,
        autodiscover: AutodiscoverConfig,
        state_dir: Option<PathBuf>,
    ) -> Arc<Self> {
        let devices = match &state_dir {
            Some(dir) => DeviceRegistry::with_snapshot(dir.join("devices.bin")),
            None => DeviceRegistry::new(),
        };
        Arc::new(Self {
            login,
            store,
            oof,
            devices,
            sync_states: SyncStateRegistry::new(state_dir),
            autodiscover,
        })
    }

    pub fn bus(&self) -> Arc<esta_store::notify::ChangeBus> {
        self.store.change_bus()
    }
}

/// Per-request facts, resolved once at the top of the handler.
pub struct RequestContext {
    pub user: UserProfile,
    pub device_id: String,
    pub device_type: String,
    pub user_agent: String,
    pub protocol_version: String,
    pub policy_key_header: Option<u32>,
    pub strategy: &'static ClientStrategy,
}

/// Fields the command handlers contribute to the request log line.
#[derive(Default)]
pub struct RequestLog {
    pub sync_key_in: Option<String>,
    pub sync_key_out: Option<String>,
    pub status: Option<String>,
}

pub enum CommandOutcome {
    Wbxml(Vec<u8>),
    /// HTTP 200 with no body (SendMail family).
    Empty,
    /// Client protocol error that has no per-command status shape.
    BadRequest(&'static str),
}

// ---- server shell, in the shape of the other listeners

pub struct Server {
    bind_addr: SocketAddr,
    engine: Arc<EasEngine>,
    tls: Option<TlsAcceptor>,
}

pub fn new_unsecure(config: EasUnsecureConfig, engine: Arc<EasEngine>) -> Server {
    Server {
        bind_addr: config.bind_addr,
        engine,
        tls: None,
    }
}

pub fn new(config: EasConfig, engine: Arc<EasEngine>) -> Result<Server> {
    let loaded_certs = certs(&mut std::io::BufReader::new(std::fs::File::open(
        config.certs,
    )?))
    .collect::<Result<Vec<_>, _>>()?;
    let loaded_key = private_key(&mut std::io::BufReader::new(std::fs::File::open(
        config.key,
    )?))?
    .ok_or(anyhow!("no private key found"))?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(loaded_certs, loaded_key)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    Ok(Server {
        bind_addr: config.bind_addr,
        engine,
        tls: Some(acceptor),
    })
}

trait Stream: Read + Write + Send + Unpin {}
impl<T: Unpin + AsyncRead + AsyncWrite + Send> Stream for TokioIo<T> {}

impl Server {
    pub async fn run(self: Self, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        tracing::info!("EAS server listening on {:#}", self.bind_addr);

        let mut connections = FuturesUnordered::new();
        while !*must_exit.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            let (socket, remote_addr) = tokio::select! {
                a = tcp.accept() => a?,
                _ = wait_conn_finished => continue,
                _ = must_exit.changed() => continue,
            };
            tracing::debug!("EAS: accepted connection from {}", remote_addr);
            let stream = match self.build_stream(socket).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(err=?e, "TLS acceptor failed");
                    continue;
                }
            };

            let engine = self.engine.clone();
            let conn = tokio::spawn(async move {
                match http::Builder::new()
                    .serve_connection(
                        stream,
                        service_fn(move |req: Request<Incoming>| {
                            let engine = engine.clone();
                            async move {
                                let resp = handle_request(engine, req).await;
                                Ok::<_, std::convert::Infallible>(resp)
                            }
                        }),
                    )
                    .await
                {
                    Err(e) => tracing::warn!(err=?e, "connection failed"),
                    Ok(()) => tracing::trace!("connection terminated with success"),
                }
            });
            connections.push(conn);
        }
        drop(tcp);

        tracing::info!("EAS server shutting down, draining remaining connections...");
        while connections.next().await.is_some() {}

        Ok(())
    }

    async fn build_stream(&self, socket: TcpStream) -> Result<Box<dyn Stream>> {
        match self.tls.clone() {
            Some(acceptor) => {
                let stream = acceptor.accept(socket).await?;
                Ok(Box::new(TokioIo::new(stream)))
            }
            None => Ok(Box::new(TokioIo::new(socket))),
        }
    }
}

// ---- routing

pub async fn handle_request(engine: Arc<EasEngine>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_ascii_lowercase();

    let result = if path == "/microsoft-server-activesync" {
        activesync(engine, req).await
    } else if path == "/autodiscover/autodiscover.xml" {
        autodiscover::handle_xml(engine, req).await
    } else if path.starts_with("/autodiscover/autodiscover.json") {
        autodiscover::handle_json(engine, req).await
    } else {
        plain_response(404, "Resource not found")
    };

    match result {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(err=?e, "request handler failed");
            status_only(500)
        }
    }
}

/// Basic-auth check shared by ActiveSync and Autodiscover.
pub async fn authenticate(
    engine: &EasEngine,
    req: &Request<Incoming>,
) -> Result<Result<UserProfile, Response<Full<Bytes>>>> {
    let auth_val = match req.headers().get(hyper::header::AUTHORIZATION) {
        Some(hv) => hv.to_str()?,
        None => {
            tracing::debug!("missing authorization field");
            return Ok(Err(challenge_response()?));
        }
    };

    let b64_creds_maybe_padded = match auth_val.split_once(' ') {
        Some(("Basic", b64)) => b64,
        _ => {
            tracing::debug!("unsupported authorization field");
            return Ok(Err(plain_response(400, "Unsupported Authorization field")?));
        }
    };

    // authorization is theoretically padded, but be liberal in what we accept
    let b64_creds_clean = b64_creds_maybe_padded.trim_end_matches('=');
    let creds = base64::engine::general_purpose::STANDARD_NO_PAD.decode(b64_creds_clean)?;
    let str_creds = std::str::from_utf8(&creds)?;
    let (username, password) = str_creds
        .split_once(':')
        .ok_or(anyhow!("missing colon in Authorization value"))?;

    match engine.login.login(username, password).await {
        Ok(profile) => Ok(Ok(profile)),
        Err(_) => {
            tracing::info!(user=%username, "wrong credentials");
            Ok(Err(challenge_response()?))
        }
    }
}

async fn activesync(
    engine: Arc<EasEngine>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    let profile = match authenticate(&engine, &req).await? {
        Ok(profile) => profile,
        Err(resp) => return Ok(resp),
    };

    let protocol_version = header_string(&req, "MS-ASProtocolVersion").unwrap_or_else(|| "14.1".into());

    if req.method() == hyper::Method::OPTIONS {
        return options_response(&protocol_version);
    }
    if req.method() != hyper::Method::POST {
        return Ok(plain_response(405, "Method not allowed")?);
    }

    let cmd = match query_param(&req, "Cmd") {
        Some(cmd) => cmd,
        None => return Ok(plain_response(400, "Missing Cmd parameter")?),
    };
    let device_id = match query_param(&req, "DeviceId") {
        Some(id) => id,
        None => return Ok(plain_response(400, "Missing DeviceId parameter")?),
    };
    let device_type = query_param(&req, "DeviceType").unwrap_or_default();
    let user_agent = header_string(&req, "User-Agent").unwrap_or_default();
    let policy_key_header = header_string(&req, "X-MS-PolicyKey").and_then(|v| v.parse::<u32>().ok());

    let device = engine
        .devices
        .upsert(&profile.email, &device_id, &device_type, &user_agent);

    let ctx = RequestContext {
        user: profile,
        device_id,
        device_type,
        user_agent: user_agent.clone(),
        protocol_version,
        policy_key_header,
        strategy: ClientStrategy::detect(&user_agent, &device.device_type),
    };

    // The provisioning gate. `X-MS-PolicyKey: 0` is what unprovisioned
    // devices send; it never opens the gate.
    if !GATE_EXEMPT.contains(&cmd.as_str()) && !device.policy_gate(ctx.policy_key_header) {
        tracing::debug!(user=%ctx.user.email, device=%ctx.device_id, cmd=%cmd, "provisioning required");
        let body = provision::provision_required_body()?;
        return wbxml_response(&ctx, 449, body);
    }

    let started = Instant::now();
    let raw_body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| anyhow!("failed to read request body: {}", e))?
        .to_bytes();
    if raw_body.len() > MAX_REQUEST_BODY {
        return Ok(plain_response(400, "Request body too large")?);
    }

    if tracing::enabled!(tracing::Level::DEBUG) && !raw_body.is_empty() {
        tracing::debug!(cmd=%cmd, "request wbxml:\n{}", wbxml::pretty_hex(&raw_body));
    }

    // Distinguish a broken envelope (HTTP 400, no body) from broken inner
    // content (per-command protocol-error status, HTTP 200). The SendMail
    // family also accepts a raw `message/rfc822` body.
    let doc = if raw_body.is_empty() {
        None
    } else if !envelope_looks_sane(&raw_body) {
        if !matches!(cmd.as_str(), "SendMail" | "SmartForward" | "SmartReply") {
            return Ok(status_only(400));
        }
        None
    } else {
        match wbxml::decode(&raw_body) {
            Ok(doc) => Some(doc),
            Err(e) => {
                tracing::debug!(cmd=%cmd, err=%e, "malformed request wbxml");
                return match protocol_error_response(&cmd) {
                    Some(bytes) => wbxml_response(&ctx, 200, bytes),
                    None => Ok(status_only(400)),
                };
            }
        }
    };

    let mut log = RequestLog::default();
    let deadline = if cmd == "Ping" { PING_DEADLINE } else { NORMAL_DEADLINE };
    let outcome = match tokio::time::timeout(
        deadline,
        dispatch(&engine, &ctx, &cmd, doc.as_ref(), &raw_body, &mut log),
    )
    .await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            tracing::error!(user=%ctx.user.email, cmd=%cmd, err=?e, "command handler failed");
            return Ok(status_only(500));
        }
        Err(_) => {
            tracing::error!(user=%ctx.user.email, cmd=%cmd, "command deadline exceeded");
            return Ok(status_only(500));
        }
    };

    let response = match outcome {
        CommandOutcome::Wbxml(bytes) => {
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(cmd=%cmd, "response wbxml:\n{}", wbxml::pretty_hex(&bytes));
            }
            wbxml_response(&ctx, 200, bytes)?
        }
        CommandOutcome::Empty => empty_ok_response(&ctx)?,
        CommandOutcome::BadRequest(msg) => plain_response(400, msg)?,
    };

    tracing::info!(
        user = %ctx.user.email,
        device = %ctx.device_id,
        cmd = %cmd,
        sync_key_in = log.sync_key_in.as_deref().unwrap_or("-"),
        sync_key_out = log.sync_key_out.as_deref().unwrap_or("-"),
        status = log.status.as_deref().unwrap_or("-"),
        bytes = response.body().size_hint().exact().unwrap_or(0),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "eas request"
    );

    Ok(response)
}

async fn dispatch(
    engine: &Arc<EasEngine>,
    ctx: &RequestContext,
    cmd: &str,
    doc: Option<&Element>,
    raw_body: &[u8],
    log: &mut RequestLog,
) -> Result<CommandOutcome> {
    match cmd {
        "Sync" => sync::handle(engine, ctx, doc, log).await,
        "FolderSync" => folder_sync::handle(engine, ctx, doc, log).await,
        "Provision" => provision::handle(engine, ctx, doc, log).await,
        "Ping" => ping::handle(engine, ctx, doc, log).await,
        "Settings" => settings::handle(engine, ctx, doc, log).await,
        "GetItemEstimate" => estimate::handle(engine, ctx, doc, log).await,
        "ItemOperations" => itemops::handle(engine, ctx, doc, log).await,
        "MoveItems" => moveitems::handle(engine, ctx, doc, log).await,
        "Search" => search::handle(engine, ctx, doc, log).await,
        "SendMail" | "SmartForward" | "SmartReply" => {
            compose::handle(engine, ctx, cmd, doc, raw_body, log).await
        }
        _ => {
            tracing::debug!(cmd=%cmd, "unknown command");
            Ok(CommandOutcome::BadRequest("Unknown command"))
        }
    }
}

/// The WBXML header is four fixed bytes; anything else means the payload
/// is not WBXML at all (spam scanners, probes) and gets a bare 400.
fn envelope_looks_sane(raw: &[u8]) -> bool {
    raw.len() >= 4 && (0x01..=0x03).contains(&raw[0]) && raw[1] == wbxml::PUBLIC_ID
}

/// A minimal protocol-error document in the vocabulary of the failed
/// command, HTTP 200, so the client retries instead of alarming the user.
fn protocol_error_response(cmd: &str) -> Option<Vec<u8>> {
    let doc = match cmd {
        "Sync" => Element::new(pages::AIRSYNC, "Sync").str("Status", "4"),
        "FolderSync" => Element::new(pages::FOLDERS, "FolderSync").str("Status", "10"),
        "Ping" => Element::new(pages::PING, "Ping").str("Status", "4"),
        "Provision" => Element::new(pages::PROVISION, "Provision").str("Status", "4"),
        "Settings" => Element::new(pages::SETTINGS, "Settings").str("Status", "2"),
        "GetItemEstimate" => Element::new(pages::ESTIMATE, "GetItemEstimate").str("Status", "2"),
        "ItemOperations" => Element::new(pages::ITEMOPS, "ItemOperations").str("Status", "2"),
        "MoveItems" => Element::new(pages::MOVE, "MoveItems").str("Status", "2"),
        "Search" => Element::new(pages::SEARCH, "Search").str("Status", "2"),
        _ => return None,
    };
    wbxml::encode(&doc).ok()
}

// ---- small helpers shared by the command modules

/// `ServerId` strings are `{collection_id}:{email_id}`, stable across
/// sessions and parseable back into the pair.
pub fn format_server_id(collection_id: &str, email_id: u64) -> String {
    format!("{}:{}", collection_id, email_id)
}

pub fn parse_server_id(server_id: &str) -> Option<(String, u64)> {
    let (collection, id) = server_id.split_once(':')?;
    Some((collection.to_string(), id.parse().ok()?))
}

fn query_param(req: &Request<Incoming>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    for pair in query.split('&') {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k.eq_ignore_ascii_case(name) {
            return Some(percent_decode(v));
        }
    }
    None
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hi = (bytes[i + 1] as char).to_digit(16);
                let lo = (bytes[i + 2] as char).to_digit(16);
                match (hi, lo) {
                    (Some(h), Some(l)) => {
                        out.push((h * 16 + l) as u8);
                        i += 3;
                    }
                    _ => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn header_string(req: &Request<Incoming>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// ---- response builders

pub fn plain_response(status: u16, body: &'static str) -> Result<Response<Full<Bytes>>> {
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from(body)))?)
}

pub fn status_only(status: u16) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("static response must build")
}

fn challenge_response() -> Result<Response<Full<Bytes>>> {
    Ok(Response::builder()
        .status(401)
        .header("WWW-Authenticate", "Basic realm=\"Estafette\"")
        .body(Full::new(Bytes::from("Authentication required")))?)
}

fn common_headers(
    builder: hyper::http::response::Builder,
    protocol_version: &str,
) -> hyper::http::response::Builder {
    builder
        .header("MS-ASProtocolVersions", PROTOCOL_VERSIONS)
        .header("MS-ASProtocolCommands", PROTOCOL_COMMANDS)
        .header("MS-Server-ActiveSync", SERVER_VERSION)
        .header("MS-ASProtocolVersion", protocol_version.to_string())
        .header("Cache-Control", "private, no-cache")
}

fn wbxml_response(
    ctx: &RequestContext,
    status: u16,
    bytes: Vec<u8>,
) -> Result<Response<Full<Bytes>>> {
    Ok(common_headers(Response::builder().status(status), &ctx.protocol_version)
        .header("Content-Type", "application/vnd.ms-sync.wbxml")
        .body(Full::new(Bytes::from(bytes)))?)
}

fn empty_ok_response(ctx: &RequestContext) -> Result<Response<Full<Bytes>>> {
    Ok(common_headers(Response::builder().status(200), &ctx.protocol_version)
        .body(Full::new(Bytes::new()))?)
}

fn options_response(protocol_version: &str) -> Result<Response<Full<Bytes>>> {
    Ok(common_headers(Response::builder().status(200), protocol_version)
        .header("Allow", "OPTIONS,POST")
        .header("Public", "OPTIONS,POST")
        .body(Full::new(Bytes::new()))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_id_roundtrip() {
        let id = format_server_id("1", 42);
        assert_eq!(id, "1:42");
        assert_eq!(parse_server_id(&id), Some(("1".to_string(), 42)));
        assert_eq!(parse_server_id("nonsense"), None);
        assert_eq!(parse_server_id("1:notanumber"), None);
    }

    #[test]
    fn envelope_sanity() {
        assert!(envelope_looks_sane(&[0x03, 0x01, 0x6A, 0x00]));
        assert!(!envelope_looks_sane(b"<?xml version=\"1.0\"?>"));
        assert!(!envelope_looks_sane(&[0x03]));
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("a%40b.c"), "a@b.c");
        assert_eq!(percent_decode("a+b"), "a b");
        assert_eq!(percent_decode("plain"), "plain");
    }

    #[test]
    fn protocol_error_documents_decode() {
        for cmd in ["Sync", "FolderSync", "Ping", "Provision", "Settings"] {
            let bytes = protocol_error_response(cmd).unwrap();
            let doc = esta_wbxml::decode(&bytes).unwrap();
            assert!(doc.child("Status").is_some());
        }
    }
}
