//! WebSocket and HTTP front door
//!
//! One listener serves both. A connection whose request head asks for a
//! WebSocket upgrade becomes a peer session, anything else is answered as a
//! single HTTP request and closed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use peerbook_core::{ErrorCode, Peer, PeerbookError, Result, StatusMessage};

use crate::hub::SessionHandle;
use crate::messages::SignalMessage;
use crate::notifier::PresenceNotifier;
use crate::Broker;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

/// How long a new session may take to send its `register` frame
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between sweeps of expired tokens and rate-limit keys
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

const PEEK_LIMIT: usize = 2048;
const PEEK_ATTEMPTS: usize = 5;
const PEEK_RETRY: Duration = Duration::from_millis(10);
const MAX_HTTP_REQUEST: usize = 16 * 1024;

/// Broker server
pub struct PeerbookServer {
    broker: Arc<Broker>,
}

impl PeerbookServer {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    /// Bind `addr` and serve until the listener fails
    pub async fn serve(&self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Peerbook listening on {}", addr);

        // Expired keys are invisible already, this only reclaims space
        let broker = self.broker.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(PURGE_INTERVAL).await;
                match blocking(&broker, |b| b.store.purge_expired()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!("Failed to purge expired keys: {}", e),
                    Err(e) => error!("Purge task failed: {}", e),
                }
            }
        });

        self.run(listener).await
    }

    /// Accept connections from an already bound listener
    pub async fn run(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let broker = self.broker.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, broker).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    /// Live session count (for monitoring)
    pub fn session_count(&self) -> usize {
        self.broker.hub.session_count()
    }
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    broker: Arc<Broker>,
) -> std::result::Result<(), BoxError> {
    let head = peek_head(&stream).await?;
    if is_websocket_upgrade(&head) {
        handle_websocket(stream, peer_addr, broker).await
    } else {
        handle_http_request(&mut stream, &broker).await
    }
}

/// Run store-backed work on the blocking pool
async fn blocking<T, F>(broker: &Arc<Broker>, work: F) -> std::result::Result<T, BoxError>
where
    F: FnOnce(&Broker) -> T + Send + 'static,
    T: Send + 'static,
{
    let broker = broker.clone();
    Ok(tokio::task::spawn_blocking(move || work(&broker)).await?)
}

/// Peek at the request head without consuming it
async fn peek_head(stream: &TcpStream) -> std::io::Result<String> {
    let mut buf = vec![0u8; PEEK_LIMIT];
    let mut n = 0;
    for _ in 0..PEEK_ATTEMPTS {
        n = stream.peek(&mut buf).await?;
        if n == 0 || n == buf.len() || buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        tokio::time::sleep(PEEK_RETRY).await;
    }
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

/// Case-insensitive lookup of a header in a raw request head
fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines()
        .skip(1)
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
}

fn is_websocket_upgrade(head: &str) -> bool {
    header(head, "upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// A parsed HTTP request: query and form parameters merged, query first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub params: HashMap<String, String>,
}

impl HttpRequest {
    pub fn parse(raw: &str) -> Option<Self> {
        let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
        let mut request_line = head.lines().next()?.split_whitespace();
        let method = request_line.next()?.to_ascii_uppercase();
        let target = request_line.next()?;
        let (path, query) = target.split_once('?').unwrap_or((target, ""));

        let mut params: HashMap<String, String> =
            form_urlencoded::parse(query.as_bytes()).into_owned().collect();
        let is_form = header(head, "content-type")
            .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));
        if is_form {
            for (key, value) in form_urlencoded::parse(body.as_bytes()).into_owned() {
                params.entry(key).or_insert(value);
            }
        }

        Some(Self {
            method,
            path: path.to_string(),
            params,
        })
    }

    /// A non-empty parameter
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Read one request: the head, then as much body as Content-Length announces
async fn read_http_request(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]);
            let body_len = header(&head, "content-length")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + body_len {
                break;
            }
        }
        if buf.len() >= MAX_HTTP_REQUEST {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn handle_http_request(
    stream: &mut TcpStream,
    broker: &Arc<Broker>,
) -> std::result::Result<(), BoxError> {
    let raw = read_http_request(stream).await?;
    let (status, body) = match HttpRequest::parse(&raw) {
        Some(request) => {
            debug!("HTTP {} {}", request.method, request.path);
            blocking(broker, move |b| route(b, &request)).await?
        }
        None => (400, json!({"error": "malformed request"}).to_string()),
    };

    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason_phrase(status),
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        _ => "Internal Server Error",
    }
}

/// Dispatch one HTTP request to the broker
pub fn route(broker: &Broker, request: &HttpRequest) -> (u16, String) {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => (
            200,
            json!({
                "status": "healthy",
                "sessions": broker.hub.session_count(),
            })
            .to_string(),
        ),
        ("POST", "/iceservers") => ice_servers(broker, request),
        ("POST", "/verify") => verify(broker, request),
        (_, "/health" | "/iceservers" | "/verify") => {
            (405, json!({"error": "method not allowed"}).to_string())
        }
        _ => (404, json!({"error": "not found"}).to_string()),
    }
}

fn reject(code: ErrorCode, message: impl Into<String>) -> (u16, String) {
    let message: String = message.into();
    (
        code.http_status(),
        json!({"error": code, "message": message}).to_string(),
    )
}

fn failure(e: &PeerbookError) -> (u16, String) {
    if e.code().http_status() >= 500 {
        error!("Request failed: {}", e);
    }
    reject(e.code(), e.to_string())
}

fn ice_servers(broker: &Broker, request: &HttpRequest) -> (u16, String) {
    let Some(email) = request.param("email") else {
        return reject(ErrorCode::InvalidInput, "missing email");
    };
    match broker.ice.ice_servers_for(email) {
        Ok(servers) => match serde_json::to_string(&servers) {
            Ok(body) => (200, body),
            Err(e) => failure(&PeerbookError::Internal(e.to_string())),
        },
        Err(e) => failure(&e),
    }
}

/// Redeem an emailed token to verify a peer of the token's user
fn verify(broker: &Broker, request: &HttpRequest) -> (u16, String) {
    let (Some(token), Some(fp)) = (request.param("token"), request.param("fp")) else {
        return reject(ErrorCode::InvalidInput, "token and fp are required");
    };

    let email = match broker.tokens.redeem_token(token) {
        Ok(email) => email,
        Err(PeerbookError::NotFound(_)) => {
            return reject(ErrorCode::Unauthorized, "invalid or expired token")
        }
        Err(e) => return failure(&e),
    };
    // Peer sets are keyed by user id, or by email for users without one
    let user = match broker.users.user_id(&email) {
        Ok(id) => id,
        Err(PeerbookError::NotFound(_)) => email.clone(),
        Err(e) => return failure(&e),
    };
    let peer = match broker.directory.get_peer(fp) {
        Ok(peer) => peer,
        Err(e) => return failure(&e),
    };
    if peer.user != user {
        warn!("Token for {} used on peer {} of {:?}", email, fp, peer.user);
        return reject(
            ErrorCode::Unauthorized,
            format!("peer {fp} does not belong to {email}"),
        );
    }

    if let Err(e) = broker.verification.verify_peer(fp, true) {
        return failure(&e);
    }
    if let Err(e) = broker.tokens.invalidate_token(token) {
        warn!("Failed to delete used token: {}", e);
    }
    (200, json!({"fp": fp, "verified": true}).to_string())
}

// ---------------------------------------------------------------------------
// WebSocket sessions
// ---------------------------------------------------------------------------

async fn handle_websocket(
    stream: TcpStream,
    peer_addr: SocketAddr,
    broker: Arc<Broker>,
) -> std::result::Result<(), BoxError> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let first = match tokio::time::timeout(REGISTER_TIMEOUT, next_text(&mut ws_receiver)).await {
        Ok(Some(text)) => text,
        Ok(None) => return Ok(()),
        Err(_) => {
            debug!("{} did not register in time", peer_addr);
            let timeout = SignalMessage::error(ErrorCode::InvalidInput, "register timeout");
            send_direct(&mut ws_sender, &timeout).await?;
            return Ok(());
        }
    };

    let registered = match SignalMessage::from_json(&first) {
        Ok(SignalMessage::Register {
            fp,
            name,
            kind,
            user,
        }) => blocking(&broker, move |b| register_peer(b, fp, name, kind, user)).await?,
        Ok(_) => Err(PeerbookError::invalid("the first message must be a register")),
        Err(e) => Err(PeerbookError::invalid(format!("invalid JSON: {e}"))),
    };
    let peer = match registered {
        Ok(peer) => peer,
        Err(e) => {
            warn!("Registration from {} rejected: {}", peer_addr, e);
            send_direct(&mut ws_sender, &SignalMessage::from(&e)).await?;
            return Ok(());
        }
    };

    let fp = peer.fp.clone();
    let SessionHandle { id, tx, mut rx } = broker.hub.register(&fp, &peer.user, peer.verified);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to encode {:?}: {}", message, e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let hello = blocking(&broker, move |b| {
        if let Err(e) = b.verification.set_online(&peer.fp, true) {
            error!("Failed to mark {} online: {}", peer.fp, e);
        }
        greeting(b, &peer)
    })
    .await;
    match hello {
        Ok(messages) => {
            for message in messages {
                let _ = tx.send(message);
            }
        }
        Err(e) => error!("Failed to greet {}: {}", fp, e),
    }
    info!("Peer {} connected from {} (session {})", fp, peer_addr, id);

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error from {}: {:?}", fp, e);
                break;
            }
        };

        let reply = match SignalMessage::from_json(&text) {
            Ok(message) => {
                let source = fp.clone();
                match blocking(&broker, move |b| handle_message(b, &source, message)).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!("Failed to handle a frame from {}: {}", fp, e);
                        break;
                    }
                }
            }
            Err(e) => Some(SignalMessage::error(
                ErrorCode::InvalidInput,
                format!("Invalid JSON: {}", e),
            )),
        };
        if let Some(reply) = reply {
            if tx.send(reply).is_err() {
                break;
            }
        }
    }

    if broker.hub.unregister(&fp, id) {
        let offline = fp.clone();
        match blocking(&broker, move |b| b.verification.set_online(&offline, false)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to mark {} offline: {}", fp, e),
            Err(e) => error!("Offline task for {} failed: {}", fp, e),
        }
    } else {
        debug!("Session {} of {} was replaced, presence left alone", id, fp);
    }
    drop(tx);
    let _ = writer.await;

    info!("Peer {} disconnected", fp);
    Ok(())
}

async fn next_text(receiver: &mut WsReceiver) -> Option<String> {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn send_direct(
    sender: &mut WsSender,
    message: &SignalMessage,
) -> std::result::Result<(), BoxError> {
    sender.send(Message::Text(message.to_json()?)).await?;
    Ok(())
}

/// Store the registering peer, creating it when unknown
///
/// A known peer keeps its verification. An unclaimed peer is claimed by
/// the user it registers with; a claimed one cannot change hands here.
fn register_peer(
    broker: &Broker,
    fp: String,
    name: String,
    kind: String,
    user: String,
) -> Result<Peer> {
    if fp.is_empty() {
        return Err(PeerbookError::invalid("peer fingerprint is empty"));
    }

    match broker.directory.get_peer(&fp) {
        Ok(mut peer) => {
            if !user.is_empty() && peer.user != user {
                peer.user = user;
                if !name.is_empty() {
                    peer.name = name;
                }
                broker.directory.add_peer(&peer)?;
            } else if !name.is_empty() && name != peer.name {
                broker.directory.rename_peer(&fp, &name)?;
                peer.name = name;
            }
            Ok(peer)
        }
        Err(PeerbookError::NotFound(_)) => {
            let peer = Peer::new(fp, name, user, kind, broker.store.clock().now());
            broker.directory.add_peer(&peer)?;
            Ok(peer)
        }
        Err(e) => Err(e),
    }
}

/// First messages of a session: its status, plus the peer list if verified
///
/// Also refreshes the session's verification mark with the stored flag.
fn greeting(broker: &Broker, peer: &Peer) -> Vec<SignalMessage> {
    let verified = broker.verification.is_verified(&peer.fp);
    broker.hub.mark_verified(&peer.fp, verified);
    if !verified {
        return vec![SignalMessage::status(StatusMessage::unverified())];
    }

    let mut messages = vec![SignalMessage::status(StatusMessage::verified())];
    if !peer.user.is_empty() {
        match broker.directory.users_peers(&peer.user) {
            Ok(peers) => messages.push(SignalMessage::Peers { peers }),
            Err(e) => warn!("Failed to list peers of {}: {}", peer.user, e),
        }
    }
    messages
}

/// Handle a frame of a registered session
fn handle_message(broker: &Broker, fp: &str, msg: SignalMessage) -> Option<SignalMessage> {
    match msg {
        SignalMessage::Offer { target, offer } => relay(broker, fp, &target, |from| {
            SignalMessage::OfferFrom {
                source_name: from.name,
                source_fp: from.fp,
                offer,
            }
        }),

        SignalMessage::Answer { target, answer } => relay(broker, fp, &target, |from| {
            SignalMessage::AnswerFrom {
                source_name: from.name,
                source_fp: from.fp,
                answer,
            }
        }),

        SignalMessage::Ping { timestamp } => Some(SignalMessage::Pong { timestamp }),

        SignalMessage::Register { .. } => Some(SignalMessage::error(
            ErrorCode::InvalidInput,
            "Already registered",
        )),

        _ => Some(SignalMessage::error(
            ErrorCode::InvalidInput,
            "Unhandled message type",
        )),
    }
}

/// Forward an offer or answer once the pair passes the trust gate
fn relay(
    broker: &Broker,
    source: &str,
    target: &str,
    build: impl FnOnce(Peer) -> SignalMessage,
) -> Option<SignalMessage> {
    match broker.verification.authorize_relay(source, target) {
        Ok((from, _)) => {
            if broker.hub.notify_session(target, build(from)) {
                debug!("Relayed {} -> {}", source, target);
                None
            } else {
                Some(SignalMessage::error(
                    ErrorCode::NotFound,
                    format!("peer {target} is offline"),
                ))
            }
        }
        Err(PeerbookError::InvalidInput(reason)) => {
            warn!("Relay {} -> {} refused: {}", source, target, reason);
            Some(SignalMessage::error(ErrorCode::Unauthorized, reason))
        }
        Err(e) => Some(SignalMessage::from(&e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_broker;
    use peerbook_core::IceServer;
    use tokio_tungstenite::{connect_async, MaybeTlsStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn request(method: &str, target: &str) -> HttpRequest {
        HttpRequest::parse(&format!("{method} {target} HTTP/1.1\r\nHost: x\r\n\r\n")).unwrap()
    }

    fn add_peer(broker: &Broker, fp: &str, user: &str) {
        broker
            .directory
            .add_peer(&Peer::new(fp, fp, user, "terminal7", 0))
            .unwrap();
    }

    #[test]
    fn test_parse_request() {
        let raw = "POST /verify?token=a%2Bb&fp=fp1 HTTP/1.1\r\nHost: x\r\n\r\n";
        let request = HttpRequest::parse(raw).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/verify");
        assert_eq!(request.param("token"), Some("a+b"));
        assert_eq!(request.param("fp"), Some("fp1"));
        assert_eq!(request.param("missing"), None);
    }

    #[test]
    fn test_parse_form_body() {
        let raw = "POST /iceservers HTTP/1.1\r\n\
                   Content-Type: application/x-www-form-urlencoded\r\n\
                   Content-Length: 15\r\n\r\n\
                   email=a%40b.com";
        let request = HttpRequest::parse(raw).unwrap();
        assert_eq!(request.param("email"), Some("a@b.com"));
        assert!(HttpRequest::parse("").is_none());
    }

    #[test]
    fn test_websocket_detection() {
        let upgrade = "GET / HTTP/1.1\r\nHost: x\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n\r\n";
        assert!(is_websocket_upgrade(upgrade));
        assert!(!is_websocket_upgrade("GET /health HTTP/1.1\r\nHost: x\r\n\r\n"));
    }

    #[test]
    fn test_health_route() {
        let (broker, _) = test_broker();
        let (status, body) = route(&broker, &request("GET", "/health"));
        assert_eq!(status, 200);
        assert!(body.contains("healthy"));

        assert_eq!(route(&broker, &request("POST", "/health")).0, 405);
        assert_eq!(route(&broker, &request("GET", "/nope")).0, 404);
    }

    #[test]
    fn test_ice_servers_route() {
        let (broker, _) = test_broker();
        assert_eq!(route(&broker, &request("POST", "/iceservers")).0, 400);

        let (status, body) = route(&broker, &request("POST", "/iceservers?email=a@b.com"));
        assert_eq!(status, 404);
        assert!(body.contains("no_ice_servers"));

        broker
            .ice
            .put_ice_server("relay", &IceServer::new("turn:relay.example.com", true))
            .unwrap();
        let (status, body) = route(&broker, &request("POST", "/iceservers?email=a@b.com"));
        assert_eq!(status, 200);
        let servers: Vec<IceServer> = serde_json::from_str(&body).unwrap();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].username.starts_with("a@b.com:"));
        assert!(!servers[0].credential.is_empty());
    }

    #[test]
    fn test_verify_route() {
        let (broker, _) = test_broker();
        let id = broker.users.add_user("a@b.com").unwrap();
        add_peer(&broker, "fp1", &id);
        add_peer(&broker, "fp2", "someone-else");
        let token = broker.tokens.create_token("a@b.com").unwrap();
        let target = |fp: &str| {
            let query: String = form_urlencoded::Serializer::new(String::new())
                .append_pair("token", &token)
                .append_pair("fp", fp)
                .finish();
            request("POST", &format!("/verify?{query}"))
        };

        assert_eq!(route(&broker, &request("POST", "/verify?fp=fp1")).0, 400);
        assert_eq!(route(&broker, &request("POST", "/verify?token=bad&fp=fp1")).0, 401);
        assert_eq!(route(&broker, &target("fp2")).0, 401);
        assert!(!broker.verification.is_verified("fp2"));

        assert_eq!(route(&broker, &target("fp1")).0, 200);
        assert!(broker.verification.is_verified("fp1"));

        // The token is gone once used
        assert_eq!(route(&broker, &target("fp1")).0, 401);
    }

    #[test]
    fn test_register_peer() {
        let (broker, _) = test_broker();

        let peer = register_peer(&broker, "fp1".into(), "laptop".into(), "terminal7".into(), "".into())
            .unwrap();
        assert!(peer.user.is_empty());
        assert!(broker.directory.user_fingerprints("u1").unwrap().is_empty());

        // Claimed on a later registration, renamed on the next
        register_peer(&broker, "fp1".into(), "".into(), "".into(), "u1".into()).unwrap();
        assert!(broker.directory.user_fingerprints("u1").unwrap().contains("fp1"));
        let peer = register_peer(&broker, "fp1".into(), "desk".into(), "".into(), "u1".into())
            .unwrap();
        assert_eq!(peer.name, "desk");
        assert_eq!(broker.directory.get_peer("fp1").unwrap().name, "desk");

        assert!(register_peer(&broker, "fp1".into(), "".into(), "".into(), "u2".into()).is_err());
        assert!(register_peer(&broker, "".into(), "".into(), "".into(), "u1".into()).is_err());
    }

    #[test]
    fn test_relay_requires_trust() {
        let (broker, _) = test_broker();
        add_peer(&broker, "fp1", "u1");
        add_peer(&broker, "fp2", "u1");
        let offer = || SignalMessage::Offer {
            target: "fp2".into(),
            offer: "sdp".into(),
        };

        let reply = handle_message(&broker, "fp1", offer());
        assert!(matches!(
            reply,
            Some(SignalMessage::Error { code: ErrorCode::Unauthorized, .. })
        ));

        broker.verification.verify_peer("fp1", true).unwrap();
        broker.verification.verify_peer("fp2", true).unwrap();
        // Trusted but not connected
        assert!(matches!(
            handle_message(&broker, "fp1", offer()),
            Some(SignalMessage::Error { code: ErrorCode::NotFound, .. })
        ));

        let mut session = broker.hub.register("fp2", "u1", true);
        assert_eq!(handle_message(&broker, "fp1", offer()), None);
        assert_eq!(
            session.rx.try_recv().unwrap(),
            SignalMessage::OfferFrom {
                source_name: "fp1".into(),
                source_fp: "fp1".into(),
                offer: "sdp".into(),
            }
        );

        assert_eq!(
            handle_message(&broker, "fp1", SignalMessage::Ping { timestamp: 9 }),
            Some(SignalMessage::Pong { timestamp: 9 })
        );
    }

    #[test]
    fn test_greeting_refreshes_verification_mark() {
        let (broker, _) = test_broker();
        add_peer(&broker, "fp1", "u1");
        add_peer(&broker, "fp2", "u1");
        let mut watcher = broker.hub.register("fp2", "u1", false);

        let peer = broker.directory.get_peer("fp2").unwrap();
        assert_eq!(
            greeting(&broker, &peer),
            vec![SignalMessage::status(StatusMessage::unverified())]
        );
        broker.verification.set_online("fp1", true).unwrap();
        assert!(watcher.rx.try_recv().is_err());

        broker
            .directory
            .set_fields("fp2", &[("verified", peerbook_core::flag(true))])
            .unwrap();
        assert_eq!(greeting(&broker, &peer).len(), 2);
        broker.verification.set_online("fp1", false).unwrap();
        assert!(matches!(
            watcher.rx.try_recv().unwrap(),
            SignalMessage::PeerUpdate(update) if update.fp == "fp1" && !update.online
        ));
    }

    async fn start(broker: Arc<Broker>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = PeerbookServer::new(broker);
        tokio::spawn(async move { server.run(listener).await });
        addr
    }

    async fn recv(client: &mut Client) -> SignalMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .unwrap();
            if let Message::Text(text) = frame {
                return SignalMessage::from_json(&text).unwrap();
            }
        }
    }

    async fn recv_status(client: &mut Client) -> u16 {
        loop {
            if let SignalMessage::Status(status) = recv(client).await {
                return status.code;
            }
        }
    }

    #[tokio::test]
    async fn test_health_over_tcp() {
        let (broker, _) = test_broker();
        let addr = start(broker).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains(r#""sessions":0"#));
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (broker, _) = test_broker();
        let addr = start(broker.clone()).await;

        let (mut client, _) = tokio_test::assert_ok!(connect_async(format!("ws://{addr}/")).await);
        let register = SignalMessage::Register {
            fp: "fp1".into(),
            name: "laptop".into(),
            kind: "terminal7".into(),
            user: "u1".into(),
        };
        client
            .send(Message::Text(register.to_json().unwrap()))
            .await
            .unwrap();

        assert_eq!(recv_status(&mut client).await, 401);
        assert!(broker.directory.get_peer("fp1").unwrap().online);
        assert!(broker.hub.is_online("fp1"));

        broker.verification.verify_peer("fp1", true).unwrap();
        assert_eq!(recv_status(&mut client).await, 200);
        match recv(&mut client).await {
            SignalMessage::Peers { peers } => assert_eq!(peers[0].fp, "fp1"),
            other => panic!("expected peer list, got {:?}", other),
        }

        client.close(None).await.unwrap();
        for _ in 0..100 {
            if !broker.hub.is_online("fp1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!broker.hub.is_online("fp1"));
        assert!(!broker.directory.get_peer("fp1").unwrap().online);
    }

    #[tokio::test]
    async fn test_unverified_session_hears_no_presence() {
        let (broker, _) = test_broker();
        add_peer(&broker, "fp2", "u1");
        let addr = start(broker.clone()).await;

        let (mut client, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        let register = SignalMessage::Register {
            fp: "fp1".into(),
            name: "laptop".into(),
            kind: "terminal7".into(),
            user: "u1".into(),
        };
        client
            .send(Message::Text(register.to_json().unwrap()))
            .await
            .unwrap();
        assert_eq!(recv_status(&mut client).await, 401);

        // A sibling's presence is withheld until fp1 is verified
        broker.verification.set_online("fp2", true).unwrap();
        client
            .send(Message::Text(
                SignalMessage::Ping { timestamp: 7 }.to_json().unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(recv(&mut client).await, SignalMessage::Pong { timestamp: 7 });

        broker.verification.verify_peer("fp1", true).unwrap();
        assert_eq!(recv_status(&mut client).await, 200);
        broker.verification.set_online("fp2", false).unwrap();
        loop {
            if let SignalMessage::PeerUpdate(update) = recv(&mut client).await {
                if update.fp == "fp2" {
                    assert!(!update.online);
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_first_frame_must_register() {
        let (broker, _) = test_broker();
        let addr = start(broker.clone()).await;

        let (mut client, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        client
            .send(Message::Text(
                SignalMessage::Ping { timestamp: 1 }.to_json().unwrap(),
            ))
            .await
            .unwrap();
        assert!(matches!(
            recv(&mut client).await,
            SignalMessage::Error { code: ErrorCode::InvalidInput, .. }
        ));
        assert_eq!(broker.hub.session_count(), 0);
    }
}
