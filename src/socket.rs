//! Terminal WebSocket adapter.
//!
//! Protocol helpers (attach command, handshake latch, close classification)
//! are kept apart from the tungstenite transport so they can be unit-tested
//! without a relay.
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tracing::{debug, info, warn};

use crate::session::{Credentials, TERM_TYPE, TerminalSettings};
use crate::signing::SignedAuthorization;
use crate::urls::TERMINAL_SUB_PROTOCOL;

pub type SocketId = u64;

pub const CLOSE_NORMAL: u16 = 1000;
/// Relay close code for rejected SSH credentials or authorization.
pub const CLOSE_AUTHENTICATION_FAILURE: u16 = 4000;
/// Reported when this side asked for the close; never a far-side clean close.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Reported locally when the connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

// ── Attach handshake ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AttachSshData<'a> {
    authorization: &'a str,
    #[serde(rename = "authorization-date")]
    authorization_date: u64,
    username: &'a str,
    password: &'a str,
    term: &'a str,
    cols: u16,
    lines: u16,
}

#[derive(Debug, Serialize)]
struct AttachSshMessage<'a> {
    cmd: &'a str,
    data: AttachSshData<'a>,
}

/// Build the first frame sent on a terminal socket.
///
/// Missing credentials are sent as empty strings; the relay rejects them with
/// an authentication-failure close.
pub fn attach_ssh_command(
    auth: &SignedAuthorization,
    credentials: Option<&Credentials>,
    settings: TerminalSettings,
) -> String {
    let (username, password) = credentials
        .map(|c| (c.username.as_str(), c.password.as_str()))
        .unwrap_or(("", ""));
    let msg = AttachSshMessage {
        cmd: "attach-ssh",
        data: AttachSshData {
            authorization: &auth.header,
            authorization_date: auth.date_millis,
            username,
            password,
            term: TERM_TYPE,
            cols: settings.cols,
            lines: settings.lines,
        },
    };
    // Serializing borrowed strings and integers cannot fail.
    serde_json::to_string(&msg).unwrap_or_default()
}

/// Per-socket latch: only the first inbound frame is read as the handshake reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Handshake {
    #[default]
    AwaitingHandshake,
    Attached,
    Rejected,
}

/// What to do with one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDisposition {
    /// Handshake accepted: attach the terminal from now on.
    Attach,
    /// Handshake refused: report the raw reply and close.
    Reject(String),
    /// Opaque terminal bytes.
    Terminal(Vec<u8>),
    /// Frame after a rejection, dropped.
    Ignore,
}

impl Handshake {
    pub fn on_frame(&mut self, payload: &[u8]) -> FrameDisposition {
        match self {
            Handshake::Attached => FrameDisposition::Terminal(payload.to_vec()),
            Handshake::Rejected => FrameDisposition::Ignore,
            Handshake::AwaitingHandshake => {
                let accepted = serde_json::from_slice::<Value>(payload)
                    .ok()
                    .and_then(|v| v.get("success").and_then(Value::as_bool))
                    .unwrap_or(false);
                if accepted {
                    *self = Handshake::Attached;
                    FrameDisposition::Attach
                } else {
                    *self = Handshake::Rejected;
                    FrameDisposition::Reject(String::from_utf8_lossy(payload).to_string())
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Normal,
    AuthenticationFailure,
    Other,
}

pub fn classify_close(code: u16) -> CloseKind {
    match code {
        CLOSE_NORMAL => CloseKind::Normal,
        CLOSE_AUTHENTICATION_FAILURE => CloseKind::AuthenticationFailure,
        _ => CloseKind::Other,
    }
}

// ── Transport ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Opened,
    Message(Vec<u8>),
    Closed { code: u16, reason: String },
}

#[derive(Debug)]
enum SocketCommand {
    Send(String),
    Close,
}

/// Handle to a spawned terminal socket. Dropping it closes the writer side.
pub struct SocketHandle {
    tx: mpsc::UnboundedSender<SocketCommand>,
}

impl SocketHandle {
    pub fn send_text(&self, text: String) {
        if self.tx.send(SocketCommand::Send(text)).is_err() {
            debug!("terminal socket writer already gone");
        }
    }

    pub fn close(&self) {
        let _ = self.tx.send(SocketCommand::Close);
    }
}

/// Open `url` with the terminal sub-protocol and pump events into `sink`.
///
/// `sink` always receives exactly one `Closed` event, including when the
/// connection cannot be established.
pub fn spawn_socket<F>(url: String, sink: F) -> SocketHandle
where
    F: Fn(SocketEvent) + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_socket(url, rx, sink));
    SocketHandle { tx }
}

async fn run_socket<F>(url: String, mut commands: mpsc::UnboundedReceiver<SocketCommand>, sink: F)
where
    F: Fn(SocketEvent) + Send + Sync + 'static,
{
    let mut request = match url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            warn!("invalid terminal socket URL {}: {}", url, e);
            sink(SocketEvent::Closed {
                code: CLOSE_ABNORMAL,
                reason: e.to_string(),
            });
            return;
        }
    };
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(TERMINAL_SUB_PROTOCOL),
    );

    let ws = match tokio_tungstenite::connect_async(request).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!("terminal socket connect to {} failed: {}", url, e);
            sink(SocketEvent::Closed {
                code: CLOSE_ABNORMAL,
                reason: e.to_string(),
            });
            return;
        }
    };
    info!("terminal socket open: {}", url);
    sink(SocketEvent::Opened);

    let (mut write, mut read) = ws.split();
    let (code, reason) = loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(SocketCommand::Send(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        break (CLOSE_ABNORMAL, e.to_string());
                    }
                }
                Some(SocketCommand::Close) | None => {
                    let frame = CloseFrame {
                        code: WsCloseCode::Normal,
                        reason: "".into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    break (CLOSE_NO_STATUS, String::new());
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => sink(SocketEvent::Message(text.into_bytes())),
                Some(Ok(Message::Binary(bytes))) => sink(SocketEvent::Message(bytes)),
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(f) => (u16::from(f.code), f.reason.to_string()),
                        None => (CLOSE_NORMAL, String::new()),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break (CLOSE_ABNORMAL, e.to_string()),
                None => break (CLOSE_ABNORMAL, "connection dropped".to_string()),
            },
        }
    };
    debug!(code, "terminal socket closed: {}", reason);
    sink(SocketEvent::Closed { code, reason });
}
