//! The relay: a small HTTP/1.1 server that plays sounds and shows
//! notifications on behalf of remote sessions.
//!
//! Routes:
//!   GET  /health               200 "ok"
//!   GET  /play?category=<name> plays a clip from the local active pack
//!   POST /notify               JSON `{title, body}`, shows a notification
//!
//! One task per connection, one request per connection (`Connection: close`).
//! There is no authentication, so the listener refuses public addresses.
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::category::Category;
use crate::config::Config;
use crate::event::RelayEvent;
use crate::pipeline::Dispatcher;
use crate::state;

pub const MAX_HEADER_BYTES: usize = 8 * 1024;
pub const MAX_BODY_BYTES: usize = 64 * 1024;
/// Bound on reading one whole request.
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Refuses anything that is not loopback, private or link-local, so the
/// unauthenticated relay is never exposed on a public interface.
pub fn check_bind_addr(ip: IpAddr) -> Result<()> {
    let allowed = match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            // fe80::/10 link-local, fc00::/7 unique-local.
            v6.is_loopback() || (first & 0xffc0) == 0xfe80 || (first & 0xfe00) == 0xfc00
        }
    };
    if !allowed {
        bail!("Refusing to bind the relay to {ip}: only loopback, private or link-local addresses are allowed");
    }
    Ok(())
}

/// Everything a request handler needs. Shared by all connection tasks.
pub struct RelayContext {
    dispatcher: Arc<Dispatcher>,
    /// Swapped by the daemon loop on config reload.
    config: Arc<RwLock<Config>>,
    state_path: PathBuf,
    /// Serializes the load-play-save cycle on `state.json`.
    play_lock: Mutex<()>,
    events: mpsc::Sender<RelayEvent>,
}

impl RelayContext {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        config: Arc<RwLock<Config>>,
        state_path: PathBuf,
        events: mpsc::Sender<RelayEvent>,
    ) -> Self {
        Self {
            dispatcher,
            config,
            state_path,
            play_lock: Mutex::new(()),
            events,
        }
    }
}

pub struct RelayServer {
    listener: TcpListener,
    ctx: Arc<RelayContext>,
}

impl RelayServer {
    pub async fn bind(addr: SocketAddr, ctx: Arc<RelayContext>) -> Result<Self> {
        check_bind_addr(addr.ip())?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind relay to {addr}"))?;
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read relay listener address")
    }

    /// Accept loop. Runs until the task is dropped.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("Relay connection from {peer}");
                    tokio::spawn(handle_connection(stream, Arc::clone(&self.ctx)));
                }
                Err(e) => {
                    warn!("Failed to accept relay connection: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Request {
    method: String,
    target: String,
    body: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
struct Response {
    status: u16,
    body: String,
}

impl Response {
    fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    fn ok() -> Self {
        Self::new(200, "ok")
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        _ => "Internal Server Error",
    }
}

async fn handle_connection(mut stream: TcpStream, ctx: Arc<RelayContext>) {
    let response = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut stream)).await {
        Ok(Ok(request)) => route(&ctx, request).await,
        Ok(Err(rejection)) => rejection,
        Err(_) => Response::new(408, "request timeout"),
    };
    if let Err(e) = write_response(&mut stream, &response).await {
        debug!("Failed to write relay response: {e}");
    }
    let _ = stream.shutdown().await;
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Request, Response> {
    let bad_request = || Response::new(400, "bad request");
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() >= MAX_HEADER_BYTES {
            return Err(Response::new(431, "headers too large"));
        }
        let n = stream.read(&mut chunk).await.map_err(|_| bad_request())?;
        if n == 0 {
            return Err(bad_request());
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    if header_end > MAX_HEADER_BYTES {
        return Err(Response::new(431, "headers too large"));
    }

    let head = std::str::from_utf8(&buf[..header_end]).map_err(|_| bad_request())?;
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let (Some(method), Some(target), Some(version)) =
        (request_line.next(), request_line.next(), request_line.next())
    else {
        return Err(bad_request());
    };
    if !version.starts_with("HTTP/1.") {
        return Err(bad_request());
    }

    let mut content_length = 0usize;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return Err(bad_request());
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            content_length = value.trim().parse().map_err(|_| bad_request())?;
        }
    }
    if content_length > MAX_BODY_BYTES {
        return Err(Response::new(413, "body too large"));
    }

    let method = method.to_string();
    let target = target.to_string();
    let mut body = buf.split_off(header_end + 4);
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.map_err(|_| bad_request())?;
        if n == 0 {
            return Err(bad_request());
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Request {
        method,
        target,
        body,
    })
}

async fn write_response<S: AsyncWrite + Unpin>(stream: &mut S, response: &Response) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        reason_phrase(response.status),
        response.body.len(),
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(response.body.as_bytes()).await?;
    stream.flush().await
}

async fn route(ctx: &RelayContext, request: Request) -> Response {
    if !request.target.starts_with('/') {
        return Response::new(400, "bad request target");
    }
    let Ok(url) = Url::parse(&format!("http://relay{}", request.target)) else {
        return Response::new(400, "bad request target");
    };
    match (url.path(), request.method.as_str()) {
        ("/health", "GET") => Response::ok(),
        ("/play", "GET") => handle_play(ctx, &url).await,
        ("/notify", "POST") => handle_notify(ctx, &request.body).await,
        ("/health" | "/play" | "/notify", _) => Response::new(405, "method not allowed"),
        _ => Response::new(404, "not found"),
    }
}

async fn handle_play(ctx: &RelayContext, url: &Url) -> Response {
    let Some(raw) = url
        .query_pairs()
        .find(|(k, _)| k == "category")
        .map(|(_, v)| v.into_owned())
    else {
        return Response::new(400, "missing category");
    };
    let category: Category = match raw.parse() {
        Ok(c) => c,
        Err(e) => return Response::new(400, format!("{e}")),
    };

    {
        let _guard = ctx.play_lock.lock().await;
        let config = ctx.config.read().await.clone();
        let mut state = state::load(&ctx.state_path);
        if config.enabled && !state.paused && config.is_category_enabled(category) {
            if ctx.dispatcher.play_local(category, &config, &mut state).is_some() {
                state::save_or_warn(&ctx.state_path, &state);
            }
        } else {
            debug!("Relay skipping {category}: disabled or paused");
        }
    }

    let _ = ctx.events.send(RelayEvent::Served(Some(category))).await;
    Response::ok()
}

#[derive(Deserialize)]
struct NotifyRequest {
    title: String,
    body: String,
}

async fn handle_notify(ctx: &RelayContext, body: &[u8]) -> Response {
    let request: NotifyRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return Response::new(400, format!("invalid notify payload: {e}")),
    };
    let config = ctx.config.read().await.clone();
    if config.desktop_notifications {
        let delivered = ctx
            .dispatcher
            .notify_local(&request.title, &request.body, &config);
        if !delivered {
            info!("{}: {}", request.title, request.body);
        }
    }
    let _ = ctx.events.send(RelayEvent::Served(None)).await;
    Response::ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayMode;
    use crate::packs::tests::write_pack;
    use crate::paths::Paths;
    use crate::pipeline::doubles::{RecordingNotifier, RecordingPlayer};
    use crate::relay::RelayClient;
    use crate::state::SessionState;
    use serde_json::json;

    // ── check_bind_addr ───────────────────────────────────────────────────────

    #[test]
    fn allows_loopback_private_and_link_local() {
        for ip in ["127.0.0.1", "10.0.0.4", "172.17.0.1", "192.168.1.20", "169.254.3.4", "::1", "fe80::1", "fd00::7"] {
            assert!(check_bind_addr(ip.parse().unwrap()).is_ok(), "{ip} should be allowed");
        }
    }

    #[test]
    fn refuses_public_and_wildcard() {
        for ip in ["0.0.0.0", "8.8.8.8", "172.32.0.1", "::", "2001:db8::1"] {
            assert!(check_bind_addr(ip.parse().unwrap()).is_err(), "{ip} should be refused");
        }
    }

    // ── read_request ──────────────────────────────────────────────────────────

    async fn parse(raw: &[u8]) -> Result<Request, Response> {
        let mut reader = raw;
        read_request(&mut reader).await
    }

    #[tokio::test]
    async fn parses_request_line_and_body() {
        let req = parse(b"POST /notify HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello").await.unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.target, "/notify");
        assert_eq!(req.body, b"hello");
    }

    #[tokio::test]
    async fn ignores_bytes_past_content_length() {
        let req = parse(b"GET /health HTTP/1.1\r\n\r\ntrailing").await.unwrap();
        assert!(req.body.is_empty());
    }

    #[tokio::test]
    async fn rejects_malformed_request_line() {
        assert_eq!(parse(b"GARBAGE\r\n\r\n").await.unwrap_err().status, 400);
        assert_eq!(parse(b"GET / SPDY/3\r\n\r\n").await.unwrap_err().status, 400);
    }

    #[tokio::test]
    async fn rejects_truncated_body() {
        let err = parse(b"POST /notify HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc").await.unwrap_err();
        assert_eq!(err.status, 400);
    }

    #[tokio::test]
    async fn rejects_oversized_headers_and_body() {
        let mut huge = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        huge.extend(std::iter::repeat(b'a').take(MAX_HEADER_BYTES));
        huge.extend_from_slice(b"\r\n\r\n");
        assert_eq!(parse(&huge).await.unwrap_err().status, 431);

        let big_body = format!("POST /notify HTTP/1.1\r\nContent-Length: {}\r\n\r\n", MAX_BODY_BYTES + 1);
        assert_eq!(parse(big_body.as_bytes()).await.unwrap_err().status, 413);
    }

    // ── end to end ────────────────────────────────────────────────────────────

    struct Harness {
        _dir: tempfile::TempDir,
        paths: Paths,
        base: String,
        player: Arc<RecordingPlayer>,
        notifier: Arc<RecordingNotifier>,
        config: Arc<RwLock<Config>>,
        events: mpsc::Receiver<RelayEvent>,
    }

    async fn start_relay() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::at(dir.path());
        write_pack(
            &paths.packs_dir(),
            "peon",
            json!({
                "name": "peon",
                "categories": { "task.complete": { "sounds": [{ "file": "done.wav" }] } }
            }),
        );
        let player = Arc::new(RecordingPlayer::default());
        let notifier = Arc::new(RecordingNotifier::new(true));
        let dispatcher = Arc::new(Dispatcher::new(player.clone(), notifier.clone(), paths.clone()));
        let config = Arc::new(RwLock::new(Config {
            relay_mode: RelayMode::Local,
            ..Config::default()
        }));
        let (tx, events) = mpsc::channel(16);
        let ctx = Arc::new(RelayContext::new(dispatcher, Arc::clone(&config), paths.state_file(), tx));
        let server = RelayServer::bind("127.0.0.1:0".parse().unwrap(), ctx).await.unwrap();
        let base = format!("http://{}", server.local_addr().unwrap());
        tokio::spawn(server.run());
        Harness {
            _dir: dir,
            paths,
            base,
            player,
            notifier,
            config,
            events,
        }
    }

    #[tokio::test]
    async fn bind_refuses_public_address() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::at(dir.path());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(RecordingPlayer::default()),
            Arc::new(RecordingNotifier::new(true)),
            paths.clone(),
        ));
        let (tx, _rx) = mpsc::channel(1);
        let ctx = Arc::new(RelayContext::new(
            dispatcher,
            Arc::new(RwLock::new(Config::default())),
            paths.state_file(),
            tx,
        ));
        assert!(RelayServer::bind("0.0.0.0:0".parse().unwrap(), ctx).await.is_err());
    }

    #[tokio::test]
    async fn health_play_and_notify_round_trip() {
        let mut h = start_relay().await;
        let client = RelayClient::new();

        assert!(client.health(&h.base).await);

        assert!(client.play_category(&h.base, Category::TaskComplete).await);
        assert_eq!(h.player.played().len(), 1);
        let state = state::load(&h.paths.state_file());
        assert_eq!(state.last_played_for(Category::TaskComplete), Some("done.wav"));
        assert!(matches!(h.events.recv().await, Some(RelayEvent::Served(Some(Category::TaskComplete)))));

        assert!(client.notify(&h.base, "soundcue · api", "Task complete").await);
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "soundcue · api");
        assert_eq!(sent[0].1, "Task complete");
        assert!(matches!(h.events.recv().await, Some(RelayEvent::Served(None))));
    }

    #[tokio::test]
    async fn play_honours_relay_side_pause_and_toggles() {
        let h = start_relay().await;
        let client = RelayClient::new();

        state::save(
            &h.paths.state_file(),
            &SessionState {
                paused: true,
                ..SessionState::default()
            },
        )
        .unwrap();
        assert!(client.play_category(&h.base, Category::TaskComplete).await);
        assert!(h.player.played().is_empty());

        state::save(&h.paths.state_file(), &SessionState::default()).unwrap();
        h.config
            .write()
            .await
            .categories
            .insert(Category::TaskComplete, false);
        assert!(client.play_category(&h.base, Category::TaskComplete).await);
        assert!(h.player.played().is_empty());
    }

    #[tokio::test]
    async fn rejects_bad_requests_with_status_codes() {
        let h = start_relay().await;
        let http = reqwest::Client::new();

        let status = |r: reqwest::Response| r.status().as_u16();
        let get = |path: &str| http.get(format!("{}{path}", h.base)).send();

        assert_eq!(status(get("/play?category=nope").await.unwrap()), 400);
        assert_eq!(status(get("/play").await.unwrap()), 400);
        assert_eq!(status(get("/notify").await.unwrap()), 405);
        assert_eq!(status(get("/elsewhere").await.unwrap()), 404);

        let resp = http
            .post(format!("{}/notify", h.base))
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(status(resp), 400);

        let resp = http.post(format!("{}/health", h.base)).send().await.unwrap();
        assert_eq!(status(resp), 405);

        assert!(h.player.played().is_empty());
        assert!(h.notifier.sent().is_empty());
    }
}
