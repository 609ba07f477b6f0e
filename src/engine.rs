//! Session protocol engine.
//!
//! One engine owns the relay session, the SSH credentials and the terminal
//! socket slot. It performs no I/O: callers invoke the user actions and feed
//! [`Event`]s in, then drain the [`Effect`]s it produced and carry them out.
//! Every response, timer and socket event is tagged so that anything arriving
//! after a reset or for a superseded socket is dropped.
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{ApiError, AuthStyle, SignedRequest, decode_success, is_success};
use crate::gating::Controls;
use crate::instruction::{POLL_INTERVAL, PollOutcome, classify_poll_reply};
use crate::scheduler::Scheduler;
use crate::session::{Credentials, Session, SessionData, TerminalSettings};
use crate::signing::{FORM_CONTENT_TYPE, HttpMethod, Signer};
use crate::socket::{
    CloseKind, FrameDisposition, Handshake, SocketEvent, SocketId, attach_ssh_command,
    classify_close,
};
use crate::terminal::text;
use crate::urls::{START_REMOTE_SSH_TOPIC, STOP_REMOTE_SSH_TOPIC, UrlHelper};

/// Settle delay before stopping a declined session and before resetting after a stop.
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    AwaitingCredentials,
    CreatingSession,
    StartingRemoteSession,
    WaitingForDeviceConnect,
    /// Relay session up and node connected, no terminal socket.
    Ready,
    Attaching,
    Live,
    StoppingSession,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    CreateSession,
    StartSession,
    PollInstruction,
    StopSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTag {
    pub kind: RequestKind,
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Poll,
    StopAfterDecline,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    pub kind: TimerKind,
    pub epoch: u64,
}

#[derive(Debug)]
pub enum Event {
    Response {
        tag: RequestTag,
        result: Result<Value, ApiError>,
    },
    Timer(Timer),
    Socket {
        id: SocketId,
        event: SocketEvent,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogOutcome {
    Login(Credentials),
    /// Establish the relay session only (setup GUI), no SSH login.
    SkipLogin,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Write(String),
    ClearTerminal,
    PromptCredentials,
    Request { tag: RequestTag, request: SignedRequest },
    OpenSocket { id: SocketId, url: String },
    SendSocket { id: SocketId, text: String },
    CloseSocket { id: SocketId },
    AttachTerminal { id: SocketId },
    DetachTerminal { id: SocketId },
    /// Shell output for the local terminal.
    TerminalData(Vec<u8>),
    OpenSetupGui { url: String },
    ControlsChanged(Controls),
}

#[derive(Debug)]
struct SocketSlot {
    id: SocketId,
    handshake: Handshake,
}

pub struct Engine {
    state: EngineState,
    /// State to return to when the credential dialog is dismissed.
    resume_state: EngineState,
    signer: Option<Box<dyn Signer + Send>>,
    urls: UrlHelper,
    settings: TerminalSettings,
    session: Option<Session>,
    credentials: Option<Credentials>,
    socket: Option<SocketSlot>,
    next_socket_id: SocketId,
    epoch: u64,
    poll_in_flight: bool,
    controls: Controls,
    effects: Vec<Effect>,
    scheduler: Box<dyn Scheduler>,
}

impl Engine {
    pub fn new(urls: UrlHelper, settings: TerminalSettings, scheduler: Box<dyn Scheduler>) -> Self {
        Self {
            state: EngineState::Idle,
            resume_state: EngineState::Idle,
            signer: None,
            urls,
            settings,
            session: None,
            credentials: None,
            socket: None,
            next_socket_id: 1,
            epoch: 0,
            poll_in_flight: false,
            controls: Controls::NONE,
            effects: Vec::new(),
            scheduler,
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn controls(&self) -> Controls {
        let remote_ready = self.session.as_ref().is_some_and(|s| s.remote_ready);
        Controls::project(self.state, self.session.is_some(), remote_ready)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn settings(&self) -> TerminalSettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: TerminalSettings) {
        self.settings = settings;
    }

    /// Whether terminal input should go to the shell.
    pub fn is_attached(&self) -> bool {
        self.state == EngineState::Live
            && self
                .socket
                .as_ref()
                .is_some_and(|s| s.handshake == Handshake::Attached)
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    // ── User actions ──────────────────────────────────────────────────────

    /// Write the greeting banner.
    pub fn start(&mut self) {
        self.write(text::greeting());
        self.sync_controls();
    }

    /// Connect control: remember the signer and ask for SSH credentials.
    pub fn connect(&mut self, signer: Box<dyn Signer + Send>) -> bool {
        if !self.controls().connect {
            debug!(state = ?self.state, "connect ignored");
            return false;
        }
        info!("connect using token {}", signer.token_id());
        self.signer = Some(signer);
        self.resume_state = self.state;
        self.state = EngineState::AwaitingCredentials;
        self.effects.push(Effect::PromptCredentials);
        self.sync_controls();
        true
    }

    pub fn credentials_dialog_closed(&mut self, outcome: DialogOutcome) {
        if self.state != EngineState::AwaitingCredentials {
            debug!(state = ?self.state, "dialog result ignored");
            return;
        }
        match outcome {
            DialogOutcome::Cancelled => {
                self.state = self.resume_state;
            }
            DialogOutcome::Login(creds) => {
                self.credentials = Some(creds);
                if self.session.is_none() {
                    self.create_session();
                } else if self.socket.is_none() {
                    // Re-use the existing session.
                    self.write(text::NEWLINE.to_string());
                    self.connect_websocket();
                } else {
                    self.state = self.resume_state;
                }
            }
            DialogOutcome::SkipLogin => {
                self.credentials = None;
                if self.session.is_none() {
                    self.create_session();
                } else {
                    self.state = self.resume_state;
                }
            }
        }
        self.sync_controls();
    }

    /// End control: stop the session if one exists, otherwise reset.
    pub fn end(&mut self) {
        if self.session.is_some() {
            self.stop_session();
        } else if self.state != EngineState::StoppingSession {
            self.reset();
        }
        self.sync_controls();
    }

    pub fn launch_setup_gui(&mut self) {
        if !self.controls().setup_gui {
            return;
        }
        if let Some(session) = &self.session {
            let url = self.urls.http_proxy_url(&session.session_id);
            info!("opening setup GUI {}", url);
            self.effects.push(Effect::OpenSetupGui { url });
        }
    }

    /// Forward local keystrokes to the attached shell.
    pub fn send_input(&mut self, input: String) {
        if !self.is_attached() {
            return;
        }
        if let Some(slot) = &self.socket {
            self.effects.push(Effect::SendSocket {
                id: slot.id,
                text: input,
            });
        }
    }

    // ── Events ────────────────────────────────────────────────────────────

    pub fn handle(&mut self, event: Event) {
        match event {
            Event::Response { tag, result } => {
                if tag.epoch != self.epoch {
                    debug!(?tag, epoch = self.epoch, "stale response dropped");
                } else {
                    match tag.kind {
                        RequestKind::CreateSession => self.on_create_response(result),
                        RequestKind::StartSession => self.on_start_response(result),
                        RequestKind::PollInstruction => self.on_poll_response(result),
                        RequestKind::StopSession => self.on_stop_response(result),
                    }
                }
            }
            Event::Timer(timer) => {
                if timer.epoch != self.epoch {
                    debug!(?timer, epoch = self.epoch, "stale timer dropped");
                } else {
                    match timer.kind {
                        TimerKind::Poll => self.poll(),
                        TimerKind::StopAfterDecline => {
                            if self.session.is_some() {
                                self.stop_session();
                            }
                        }
                        TimerKind::Reset => self.reset(),
                    }
                }
            }
            Event::Socket { id, event } => {
                if self.socket.as_ref().map(|s| s.id) != Some(id) {
                    debug!(id, ?event, "event for superseded socket dropped");
                } else {
                    match event {
                        SocketEvent::Opened => self.on_socket_open(id),
                        SocketEvent::Message(payload) => self.on_socket_message(id, &payload),
                        SocketEvent::Closed { code, reason } => self.on_socket_close(id, code, &reason),
                    }
                }
            }
        }
        self.sync_controls();
    }

    // ── Session protocol ──────────────────────────────────────────────────

    fn create_session(&mut self) {
        self.epoch += 1;
        self.state = EngineState::CreatingSession;
        self.write(text::CREATING_SESSION.to_string());
        let proof_url = self.urls.view_pending_instructions_url();
        let url = self.urls.create_session_url();
        match self.presigned(HttpMethod::Get, &proof_url, None, url) {
            Ok(request) => self.request(RequestKind::CreateSession, request),
            Err(message) => self.fail_attempt("Failed to get request new SSH session", &message),
        }
    }

    fn on_create_response(&mut self, result: Result<Value, ApiError>) {
        if self.state != EngineState::CreatingSession {
            return;
        }
        let data = match result.and_then(|v| decode_success::<SessionData>(&v)) {
            Ok(data) if !data.session_id.is_empty() => data,
            Ok(_) => {
                warn!("create session response missing sessionId");
                self.fail_attempt("Failed to get request new SSH session", "missing sessionId");
                return;
            }
            Err(e) => {
                warn!("Failed to create session: {}", e);
                self.fail_attempt("Failed to get request new SSH session", &e.to_string());
                return;
            }
        };
        info!("Created session {}", data.session_id);
        self.write(text::success());
        self.session = Some(Session::from_data(&data));
        self.start_session();
    }

    fn start_session(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let params = session.instruction_parameters();
        let proof_url = self.urls.queue_instruction_url(START_REMOTE_SSH_TOPIC, &params);
        let url = self.urls.start_session_url(&session.session_id);
        self.state = EngineState::StartingRemoteSession;
        self.write(text::STARTING_REMOTE.to_string());
        match self.presigned(HttpMethod::Post, &proof_url, Some(FORM_CONTENT_TYPE), url) {
            Ok(request) => self.request(RequestKind::StartSession, request),
            Err(message) => self.fail_attempt("Failed to start SSH session", &message),
        }
    }

    fn on_start_response(&mut self, result: Result<Value, ApiError>) {
        if self.state != EngineState::StartingRemoteSession {
            return;
        }
        let data = match result.and_then(|v| decode_success::<SessionData>(&v)) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to start session: {}", e);
                self.fail_attempt("Failed to start SSH session", &e.to_string());
                return;
            }
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.update_from(&data);
        if session.start_instruction_id.is_none() {
            warn!("start session response missing startInstructionId");
            self.fail_attempt("Failed to start SSH session", "missing startInstructionId");
            return;
        }
        info!("Started session {}", data.session_id);
        self.write(text::success());
        self.state = EngineState::WaitingForDeviceConnect;
        self.write(text::WAITING_FOR_NODE.to_string());
        self.poll();
    }

    fn poll(&mut self) {
        if self.state != EngineState::WaitingForDeviceConnect || self.poll_in_flight {
            return;
        }
        let Some(instruction_id) = self.session.as_ref().and_then(|s| s.start_instruction_id) else {
            return;
        };
        let url = self.urls.view_instruction_url(instruction_id);
        let signed = match &self.signer {
            Some(signer) => signer.sign(HttpMethod::Get, &url, None).map_err(|e| e.to_string()),
            None => Err("no API token".to_string()),
        };
        match signed {
            Ok(auth) => {
                self.poll_in_flight = true;
                self.request(
                    RequestKind::PollInstruction,
                    SignedRequest {
                        method: HttpMethod::Get,
                        url,
                        auth,
                        style: AuthStyle::Direct,
                    },
                );
            }
            Err(message) => self.fail_poll(&message),
        }
    }

    fn on_poll_response(&mut self, result: Result<Value, ApiError>) {
        self.poll_in_flight = false;
        if self.state != EngineState::WaitingForDeviceConnect || self.session.is_none() {
            return;
        }
        match result.and_then(|v| classify_poll_reply(&v)) {
            Ok(PollOutcome::Completed) => {
                info!("StartRemoteSsh instruction completed");
                self.write(" ".to_string());
                self.write(text::success());
                if let Some(session) = self.session.as_mut() {
                    session.remote_ready = true;
                }
                self.write(text::setup_hint());
                if self.credentials.is_some() {
                    self.connect_websocket();
                } else {
                    self.write(text::connect_hint());
                    self.state = EngineState::Ready;
                }
            }
            Ok(PollOutcome::Declined) => {
                warn!("StartRemoteSsh instruction declined");
                self.write(" ".to_string());
                self.write(text::failed());
                self.schedule(TimerKind::StopAfterDecline, SETTLE_DELAY);
            }
            Ok(PollOutcome::Pending(state)) => {
                debug!(%state, "StartRemoteSsh instruction pending");
                self.write(text::POLL_TICK.to_string());
                self.schedule(TimerKind::Poll, POLL_INTERVAL);
            }
            Err(e) => {
                warn!("Failed to query StartRemoteSsh instruction: {}", e);
                self.fail_poll(&e.to_string());
            }
        }
    }

    fn fail_poll(&mut self, message: &str) {
        self.write(" ".to_string());
        self.fail_attempt(
            "Failed to get SolarNode remote SSH session start status",
            message,
        );
    }

    fn stop_session(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.stop_requested {
            return;
        }
        session.stop_requested = true;
        let params = session.instruction_parameters();
        let url = self.urls.stop_session_url(&session.session_id);

        if self.socket.is_some() {
            self.teardown_socket();
            self.write(text::NEWLINE.to_string());
        }
        self.state = EngineState::StoppingSession;
        self.write(text::STOPPING_REMOTE.to_string());
        let proof_url = self.urls.queue_instruction_url(STOP_REMOTE_SSH_TOPIC, &params);
        match self.presigned(HttpMethod::Post, &proof_url, Some(FORM_CONTENT_TYPE), url) {
            Ok(request) => self.request(RequestKind::StopSession, request),
            Err(message) => {
                warn!("Failed to stop session: {}", message);
                self.write(text::failed());
                self.schedule(TimerKind::Reset, SETTLE_DELAY);
            }
        }
    }

    fn on_stop_response(&mut self, result: Result<Value, ApiError>) {
        if self.state != EngineState::StoppingSession {
            return;
        }
        match result {
            Ok(v) if is_success(&v) => {
                if let Some(session) = &self.session {
                    info!("Stopped session {}", session.session_id);
                }
                self.write(text::success());
            }
            Ok(v) => {
                warn!("Failed to stop session: {}", v);
                self.write(text::failed());
            }
            Err(e) => {
                warn!("Failed to stop session: {}", e);
                self.write(text::failed());
            }
        }
        self.schedule(TimerKind::Reset, SETTLE_DELAY);
    }

    /// Drop all session state and return to a fresh greeting.
    fn reset(&mut self) {
        info!("resetting");
        self.teardown_socket();
        self.session = None;
        self.credentials = None;
        self.poll_in_flight = false;
        self.epoch += 1;
        self.effects.push(Effect::ClearTerminal);
        self.write(text::greeting());
        self.state = EngineState::Idle;
    }

    /// End the current create/start/poll attempt. The relay expires the
    /// abandoned session on its own.
    fn fail_attempt(&mut self, context: &str, message: &str) {
        self.write(text::failed());
        self.write(text::error_line(&format!("{}: {}", context, message)));
        self.teardown_socket();
        self.session = None;
        self.credentials = None;
        self.poll_in_flight = false;
        self.epoch += 1;
        self.state = EngineState::Failed;
    }

    // ── Terminal socket ───────────────────────────────────────────────────

    fn connect_websocket(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let url = self.urls.terminal_websocket_url(&session.session_id);
        self.teardown_socket();
        self.write(text::ATTACHING.to_string());
        let id = self.next_socket_id;
        self.next_socket_id += 1;
        self.socket = Some(SocketSlot {
            id,
            handshake: Handshake::AwaitingHandshake,
        });
        self.state = EngineState::Attaching;
        info!(id, "opening terminal socket {}", url);
        self.effects.push(Effect::OpenSocket { id, url });
    }

    fn on_socket_open(&mut self, id: SocketId) {
        // Credentials are spent by this attempt whatever happens next.
        let credentials = self.credentials.take();
        let url = self.urls.view_node_metadata_url();
        let signed = match &self.signer {
            Some(signer) => signer.sign(HttpMethod::Get, &url, None).map_err(|e| e.to_string()),
            None => Err("no API token".to_string()),
        };
        match signed {
            Ok(auth) => {
                let text = attach_ssh_command(&auth, credentials.as_ref(), self.settings);
                self.effects.push(Effect::SendSocket { id, text });
            }
            Err(message) => {
                self.write(text::failed());
                self.write(text::error_line(&format!(
                    "Failed to attach to SSH session: {}",
                    message
                )));
                self.effects.push(Effect::CloseSocket { id });
            }
        }
    }

    fn on_socket_message(&mut self, id: SocketId, payload: &[u8]) {
        let Some(slot) = self.socket.as_mut() else {
            return;
        };
        match slot.handshake.on_frame(payload) {
            FrameDisposition::Attach => {
                info!(id, "attached to SSH session");
                self.write(text::success());
                self.effects.push(Effect::AttachTerminal { id });
                self.state = EngineState::Live;
            }
            FrameDisposition::Reject(reply) => {
                warn!(id, "attach rejected: {}", reply);
                self.write(text::failed());
                self.write(text::error_line(&format!(
                    "Failed to attach to SSH session: {}",
                    reply
                )));
                self.effects.push(Effect::CloseSocket { id });
            }
            FrameDisposition::Terminal(bytes) => self.effects.push(Effect::TerminalData(bytes)),
            FrameDisposition::Ignore => {}
        }
    }

    fn on_socket_close(&mut self, id: SocketId, code: u16, reason: &str) {
        info!(id, code, "ws close: reason = {}", reason);
        self.socket = None;
        // Spent even when the socket never opened.
        self.credentials = None;
        self.effects.push(Effect::DetachTerminal { id });
        match classify_close(code) {
            CloseKind::Normal => {
                self.write(text::NEWLINE.to_string());
                self.write(text::reconnect_hint());
                self.state = if self.session.is_some() {
                    EngineState::Ready
                } else {
                    EngineState::Failed
                };
            }
            CloseKind::AuthenticationFailure => {
                self.write(text::failed());
                if !reason.is_empty() {
                    self.write(text::error_line(reason));
                }
                self.state = EngineState::Failed;
            }
            CloseKind::Other => {
                self.write(text::connection_closed(reason));
                self.state = EngineState::Failed;
            }
        }
    }

    /// Detach and close the current socket, if any.
    fn teardown_socket(&mut self) {
        if let Some(slot) = self.socket.take() {
            self.effects.push(Effect::DetachTerminal { id: slot.id });
            self.effects.push(Effect::CloseSocket { id: slot.id });
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────

    /// Sign `proof_url` and wrap it as a pre-signed GET to the relay `url`.
    fn presigned(
        &self,
        method: HttpMethod,
        proof_url: &str,
        content_type: Option<&str>,
        url: String,
    ) -> Result<SignedRequest, String> {
        let signer = self.signer.as_ref().ok_or_else(|| "no API token".to_string())?;
        let auth = signer
            .sign(method, proof_url, content_type)
            .map_err(|e| e.to_string())?;
        Ok(SignedRequest {
            method: HttpMethod::Get,
            url,
            auth,
            style: AuthStyle::PreSigned,
        })
    }

    fn request(&mut self, kind: RequestKind, request: SignedRequest) {
        let tag = RequestTag {
            kind,
            epoch: self.epoch,
        };
        debug!(?tag, "Requesting {} {}", request.method.as_str(), request.url);
        self.effects.push(Effect::Request { tag, request });
    }

    fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.scheduler.schedule_after(
            delay,
            Timer {
                kind,
                epoch: self.epoch,
            },
        );
    }

    fn write(&mut self, text: String) {
        self.effects.push(Effect::Write(text));
    }

    fn sync_controls(&mut self) {
        let controls = self.controls();
        if controls != self.controls {
            self.controls = controls;
            debug!(state = ?self.state, %controls, "controls changed");
            self.effects.push(Effect::ControlsChanged(controls));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use crate::signing::{SignError, SignedAuthorization};
    use std::sync::{Arc, Mutex};

    /// Records every signed URL and returns a fixed authorization.
    #[derive(Clone, Default)]
    struct FakeSigner {
        signed: Arc<Mutex<Vec<(HttpMethod, String, Option<String>)>>>,
    }

    impl Signer for FakeSigner {
        fn token_id(&self) -> &str {
            "test-token"
        }

        fn sign(
            &self,
            method: HttpMethod,
            url: &str,
            content_type: Option<&str>,
        ) -> Result<SignedAuthorization, SignError> {
            self.signed
                .lock()
                .unwrap()
                .push((method, url.to_string(), content_type.map(str::to_string)));
            Ok(SignedAuthorization {
                header: format!("SNWS2 Credential=test-token,SignedHeaders=host;x-sn-date,Signature={}", url.len()),
                date_header: "Tue, 15 Nov 1994 08:12:31 GMT".to_string(),
                date_millis: 784887151000,
            })
        }
    }

    struct Harness {
        engine: Engine,
        sched: ManualScheduler,
        signer: FakeSigner,
        effects: Vec<Effect>,
    }

    impl Harness {
        fn new() -> Self {
            let sched = ManualScheduler::new();
            let mut engine = Engine::new(
                UrlHelper::new(251),
                TerminalSettings::default(),
                Box::new(sched.clone()),
            );
            engine.start();
            let mut h = Self {
                engine,
                sched,
                signer: FakeSigner::default(),
                effects: Vec::new(),
            };
            h.drain();
            h
        }

        fn drain(&mut self) -> Vec<Effect> {
            let new = self.engine.take_effects();
            self.effects.extend(new.clone());
            new
        }

        fn connect(&mut self, outcome: DialogOutcome) -> Vec<Effect> {
            assert!(self.engine.connect(Box::new(self.signer.clone())));
            let mut out = self.drain();
            self.engine.credentials_dialog_closed(outcome);
            out.extend(self.drain());
            out
        }

        fn respond(&mut self, kind: RequestKind, json: &str) -> Vec<Effect> {
            let tag = self.last_tag(kind);
            let value = serde_json::from_str(json).unwrap();
            self.engine.handle(Event::Response {
                tag,
                result: Ok(value),
            });
            self.drain()
        }

        fn respond_err(&mut self, kind: RequestKind, err: ApiError) -> Vec<Effect> {
            let tag = self.last_tag(kind);
            self.engine.handle(Event::Response {
                tag,
                result: Err(err),
            });
            self.drain()
        }

        fn advance(&mut self, by: Duration) -> Vec<Effect> {
            for timer in self.sched.advance(by) {
                self.engine.handle(Event::Timer(timer));
            }
            self.drain()
        }

        fn socket(&mut self, id: SocketId, event: SocketEvent) -> Vec<Effect> {
            self.engine.handle(Event::Socket { id, event });
            self.drain()
        }

        fn last_tag(&self, kind: RequestKind) -> RequestTag {
            self.effects
                .iter()
                .rev()
                .find_map(|e| match e {
                    Effect::Request { tag, .. } if tag.kind == kind => Some(*tag),
                    _ => None,
                })
                .unwrap_or_else(|| panic!("no {:?} request issued", kind))
        }

        fn requests(&self, kind: RequestKind) -> Vec<SignedRequest> {
            self.effects
                .iter()
                .filter_map(|e| match e {
                    Effect::Request { tag, request } if tag.kind == kind => Some(request.clone()),
                    _ => None,
                })
                .collect()
        }

        fn output(&self) -> String {
            self.effects
                .iter()
                .filter_map(|e| match e {
                    Effect::Write(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect()
        }

        fn opened_sockets(&self) -> Vec<(SocketId, String)> {
            self.effects
                .iter()
                .filter_map(|e| match e {
                    Effect::OpenSocket { id, url } => Some((*id, url.clone())),
                    _ => None,
                })
                .collect()
        }

        /// Create and start succeed; the engine is then waiting on the node.
        fn establish(&mut self, outcome: DialogOutcome) {
            self.connect(outcome);
            self.respond(RequestKind::CreateSession, CREATED);
            self.respond(RequestKind::StartSession, STARTED);
            assert_eq!(self.engine.state(), EngineState::WaitingForDeviceConnect);
        }

        /// Session established, node connected, socket attached.
        fn live(&mut self) -> SocketId {
            self.establish(login());
            self.respond(RequestKind::PollInstruction, COMPLETED);
            let id = self.opened_sockets().last().unwrap().0;
            self.socket(id, SocketEvent::Opened);
            self.socket(id, SocketEvent::Message(READY.to_vec()));
            assert_eq!(self.engine.state(), EngineState::Live);
            id
        }
    }

    const CREATED: &str = r#"{"success":true,"data":{"sessionId":"s-1","created":1,"nodeId":251,"host":"ssh.solarnetwork.net","port":8022,"reversePort":50123}}"#;
    const STARTED: &str = r#"{"success":true,"data":{"sessionId":"s-1","startInstructionId":77,"host":"ssh.solarnetwork.net","port":8022,"reversePort":50123}}"#;
    const QUEUED: &str = r#"{"success":true,"data":{"id":77,"state":"Queued"}}"#;
    const EXECUTING: &str = r#"{"success":true,"data":{"id":77,"state":"Executing"}}"#;
    const COMPLETED: &str = r#"{"success":true,"data":{"id":77,"state":"Completed"}}"#;
    const DECLINED: &str = r#"{"success":true,"data":{"id":77,"state":"Declined"}}"#;
    const STOPPED: &str = r#"{"success":true}"#;
    const READY: &[u8] = br#"{"success":true,"message":"Ready to attach"}"#;

    fn login() -> DialogOutcome {
        DialogOutcome::Login(Credentials::new("solar", "hunter2"))
    }

    fn controls(connect: bool, setup_gui: bool, end: bool) -> Controls {
        Controls {
            connect,
            setup_gui,
            end,
        }
    }

    #[test]
    fn start_writes_greeting_and_enables_connect() {
        let sched = ManualScheduler::new();
        let mut engine = Engine::new(UrlHelper::new(1), TerminalSettings::default(), Box::new(sched));
        engine.start();
        let effects = engine.take_effects();
        assert_eq!(effects[0], Effect::Write(text::greeting()));
        assert_eq!(effects[1], Effect::ControlsChanged(controls(true, false, false)));
    }

    #[test]
    fn connect_prompts_for_credentials() {
        let mut h = Harness::new();
        assert!(h.engine.connect(Box::new(h.signer.clone())));
        assert_eq!(h.engine.state(), EngineState::AwaitingCredentials);
        let effects = h.drain();
        assert!(effects.contains(&Effect::PromptCredentials));
        assert!(effects.contains(&Effect::ControlsChanged(Controls::NONE)));
        // No second connect while the dialog is open.
        assert!(!h.engine.connect(Box::new(h.signer.clone())));
    }

    #[test]
    fn cancelled_dialog_issues_nothing_and_returns_to_idle() {
        let mut h = Harness::new();
        h.connect(DialogOutcome::Cancelled);
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert_eq!(h.engine.controls(), controls(true, false, false));
        assert!(h.requests(RequestKind::CreateSession).is_empty());
    }

    #[test]
    fn login_creates_session_with_presigned_proof() {
        let mut h = Harness::new();
        h.connect(login());
        assert_eq!(h.engine.state(), EngineState::CreatingSession);
        assert!(h.engine.has_credentials());
        let req = &h.requests(RequestKind::CreateSession)[0];
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(
            req.url,
            "https://ssh.solarnetwork.net:8443/api/v1/ssh/session/new?nodeId=251"
        );
        assert_eq!(req.style, AuthStyle::PreSigned);
        let signed = h.signer.signed.lock().unwrap();
        assert_eq!(signed[0].0, HttpMethod::Get);
        assert!(signed[0].1.ends_with("/instr/viewPending?nodeId=251"));
        assert!(h.output().contains(text::CREATING_SESSION));
    }

    #[test]
    fn create_failure_reenables_connect_without_start() {
        let mut h = Harness::new();
        h.connect(login());
        h.respond(RequestKind::CreateSession, r#"{"success":false,"message":"Node not found"}"#);
        assert_eq!(h.engine.state(), EngineState::Failed);
        assert_eq!(h.engine.controls(), controls(true, false, false));
        assert!(h.requests(RequestKind::StartSession).is_empty());
        assert!(h.engine.session().is_none());
        assert!(h.output().contains("Failed to get request new SSH session: Node not found"));
    }

    #[test]
    fn create_transport_error_is_reported() {
        let mut h = Harness::new();
        h.connect(login());
        h.respond_err(RequestKind::CreateSession, ApiError::Transport("connection refused".into()));
        assert_eq!(h.engine.state(), EngineState::Failed);
        assert!(h.output().contains(&text::failed()));
        assert!(h.output().contains("connection refused"));
        assert!(h.requests(RequestKind::StartSession).is_empty());
    }

    #[test]
    fn create_without_session_id_fails() {
        let mut h = Harness::new();
        h.connect(login());
        h.respond(RequestKind::CreateSession, r#"{"success":true,"data":{"sessionId":""}}"#);
        assert_eq!(h.engine.state(), EngineState::Failed);
        assert!(h.requests(RequestKind::StartSession).is_empty());
    }

    #[test]
    fn start_presigns_instruction_with_session_coordinates() {
        let mut h = Harness::new();
        h.connect(login());
        h.respond(RequestKind::CreateSession, CREATED);
        assert_eq!(h.engine.state(), EngineState::StartingRemoteSession);
        let req = &h.requests(RequestKind::StartSession)[0];
        assert_eq!(req.method, HttpMethod::Get);
        assert!(req.url.ends_with("/api/v1/ssh/session/s-1/start"));
        let signed = h.signer.signed.lock().unwrap();
        let (method, url, ct) = &signed[1];
        assert_eq!(*method, HttpMethod::Post);
        assert_eq!(ct.as_deref(), Some(FORM_CONTENT_TYPE));
        assert!(url.contains("topic=StartRemoteSsh"));
        assert!(url.contains("parameters%5B0%5D.value=ssh.solarnetwork.net"));
        assert!(url.contains("parameters%5B1%5D.value=s-1"));
        assert!(url.contains("parameters%5B2%5D.value=8022"));
        assert!(url.contains("parameters%5B3%5D.value=50123"));
    }

    #[test]
    fn start_success_enables_end_and_polls_directly() {
        let mut h = Harness::new();
        h.establish(login());
        assert_eq!(h.engine.controls(), controls(false, false, true));
        assert_eq!(h.engine.session().unwrap().start_instruction_id, Some(77));
        let polls = h.requests(RequestKind::PollInstruction);
        assert_eq!(polls.len(), 1);
        assert_eq!(polls[0].style, AuthStyle::Direct);
        assert!(polls[0].url.ends_with("/instr/view?id=77"));
        assert!(h.output().contains(text::WAITING_FOR_NODE));
    }

    #[test]
    fn start_failure_clears_session() {
        let mut h = Harness::new();
        h.connect(login());
        h.respond(RequestKind::CreateSession, CREATED);
        h.respond_err(
            RequestKind::StartSession,
            ApiError::Status {
                status: 500,
                body: "boom".into(),
            },
        );
        assert_eq!(h.engine.state(), EngineState::Failed);
        assert!(h.engine.session().is_none());
        assert_eq!(h.engine.controls(), controls(true, false, false));
        assert!(h.requests(RequestKind::PollInstruction).is_empty());
    }

    #[test]
    fn pending_polls_reschedule_once_after_fifteen_seconds() {
        let mut h = Harness::new();
        h.establish(login());
        let before = h.output();
        for reply in [QUEUED, EXECUTING, r#"{"success":true,"data":{"state":"Mystery"}}"#] {
            h.respond(RequestKind::PollInstruction, reply);
            let pending = h.sched.pending();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].0, POLL_INTERVAL);
            assert_eq!(pending[0].1.kind, TimerKind::Poll);
            let polls_before = h.requests(RequestKind::PollInstruction).len();
            assert!(h.advance(Duration::from_secs(14)).is_empty());
            h.advance(Duration::from_secs(1));
            assert_eq!(h.requests(RequestKind::PollInstruction).len(), polls_before + 1);
        }
        assert_eq!(&h.output()[before.len()..], "...");
    }

    #[test]
    fn only_one_poll_in_flight() {
        let mut h = Harness::new();
        h.establish(login());
        // A duplicate timer while the first poll is outstanding does nothing.
        let epoch = h.last_tag(RequestKind::PollInstruction).epoch;
        h.engine.handle(Event::Timer(Timer {
            kind: TimerKind::Poll,
            epoch,
        }));
        h.drain();
        assert_eq!(h.requests(RequestKind::PollInstruction).len(), 1);
    }

    #[test]
    fn completed_without_credentials_waits_for_connect() {
        let mut h = Harness::new();
        h.establish(DialogOutcome::SkipLogin);
        h.respond(RequestKind::PollInstruction, QUEUED);
        h.advance(POLL_INTERVAL);
        h.respond(RequestKind::PollInstruction, QUEUED);
        h.advance(POLL_INTERVAL);
        h.respond(RequestKind::PollInstruction, COMPLETED);

        assert_eq!(h.engine.state(), EngineState::Ready);
        assert_eq!(h.engine.controls(), controls(true, true, true));
        assert!(h.opened_sockets().is_empty());
        assert!(h.engine.session().unwrap().remote_ready);
        let out = h.output();
        assert!(out.contains(&format!("..{}", " ")));
        assert!(out.contains("to view the SolarNode setup GUI."));
        assert!(out.contains("to connect via SSH."));
    }

    #[test]
    fn completed_with_credentials_attaches_to_session() {
        let mut h = Harness::new();
        h.establish(login());
        h.respond(RequestKind::PollInstruction, COMPLETED);
        assert_eq!(h.engine.state(), EngineState::Attaching);
        let sockets = h.opened_sockets();
        assert_eq!(sockets.len(), 1);
        assert_eq!(sockets[0].1, "wss://ssh.solarnetwork.net:8443/ssh?sessionId=s-1");
        let c = h.engine.controls();
        assert!(c.setup_gui && c.end);
        assert!(!c.connect, "connect must stay disabled while attaching");
    }

    #[test]
    fn decline_stops_exactly_once_after_one_second() {
        let mut h = Harness::new();
        h.establish(login());
        h.respond(RequestKind::PollInstruction, DECLINED);
        assert!(h.output().ends_with(&format!(" {}", text::failed())));
        assert!(h.requests(RequestKind::StopSession).is_empty());
        h.advance(Duration::from_millis(999));
        assert!(h.requests(RequestKind::StopSession).is_empty());
        h.advance(Duration::from_millis(1));
        assert_eq!(h.requests(RequestKind::StopSession).len(), 1);
        assert_eq!(h.engine.state(), EngineState::StoppingSession);

        // A user end in between does not issue a second stop.
        h.engine.end();
        h.drain();
        h.advance(Duration::from_secs(30));
        assert_eq!(h.requests(RequestKind::StopSession).len(), 1);
    }

    #[test]
    fn user_end_during_decline_delay_stops_once() {
        let mut h = Harness::new();
        h.establish(login());
        h.respond(RequestKind::PollInstruction, DECLINED);
        h.engine.end();
        h.drain();
        h.advance(SETTLE_DELAY);
        assert_eq!(h.requests(RequestKind::StopSession).len(), 1);
    }

    #[test]
    fn stop_presigns_stop_instruction() {
        let mut h = Harness::new();
        h.establish(login());
        h.engine.end();
        h.drain();
        let req = &h.requests(RequestKind::StopSession)[0];
        assert!(req.url.ends_with("/api/v1/ssh/session/s-1/stop"));
        let signed = h.signer.signed.lock().unwrap();
        let (method, url, _) = signed.last().unwrap();
        assert_eq!(*method, HttpMethod::Post);
        assert!(url.contains("topic=StopRemoteSsh"));
    }

    #[test]
    fn stop_success_resets_exactly_once_after_one_second() {
        let mut h = Harness::new();
        h.live();
        h.engine.end();
        h.drain();
        h.respond(RequestKind::StopSession, STOPPED);
        assert!(h.output().ends_with(&text::success()));
        assert!(h.engine.session().is_some());

        let effects = h.advance(SETTLE_DELAY);
        assert_eq!(effects.iter().filter(|e| **e == Effect::ClearTerminal).count(), 1);
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert!(h.engine.session().is_none());
        assert!(!h.engine.has_credentials());
        assert_eq!(h.engine.controls(), controls(true, false, false));
        assert!(h.output().ends_with(&text::greeting()));
        assert!(h.advance(Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn stop_failure_still_resets() {
        let mut h = Harness::new();
        h.establish(DialogOutcome::SkipLogin);
        h.engine.end();
        h.drain();
        h.respond_err(RequestKind::StopSession, ApiError::Transport("offline".into()));
        assert!(h.output().ends_with(&text::failed()));
        assert_eq!(h.engine.state(), EngineState::StoppingSession);
        h.advance(SETTLE_DELAY);
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert!(h.engine.session().is_none());
    }

    #[test]
    fn end_while_live_tears_down_socket_first() {
        let mut h = Harness::new();
        let id = h.live();
        h.engine.end();
        let effects = h.drain();
        let detach = effects.iter().position(|e| *e == Effect::DetachTerminal { id });
        let close = effects.iter().position(|e| *e == Effect::CloseSocket { id });
        let stop = effects
            .iter()
            .position(|e| matches!(e, Effect::Request { tag, .. } if tag.kind == RequestKind::StopSession));
        assert!(detach.unwrap() < close.unwrap());
        assert!(close.unwrap() < stop.unwrap());
        assert!(!h.engine.is_attached());
    }

    #[test]
    fn poll_after_reset_is_a_noop() {
        let mut h = Harness::new();
        h.establish(login());
        h.respond(RequestKind::PollInstruction, QUEUED);
        // Stop and reset while the next poll is still scheduled.
        h.engine.end();
        h.drain();
        h.respond(RequestKind::StopSession, STOPPED);
        h.advance(SETTLE_DELAY);
        assert_eq!(h.engine.state(), EngineState::Idle);
        let polls = h.requests(RequestKind::PollInstruction).len();
        h.advance(POLL_INTERVAL);
        assert_eq!(h.requests(RequestKind::PollInstruction).len(), polls);
    }

    #[test]
    fn stale_poll_response_is_ignored() {
        let mut h = Harness::new();
        h.establish(login());
        let stale = h.last_tag(RequestKind::PollInstruction);
        h.engine.end();
        h.drain();
        h.respond(RequestKind::StopSession, STOPPED);
        h.advance(SETTLE_DELAY);
        h.engine.handle(Event::Response {
            tag: stale,
            result: Ok(serde_json::from_str(COMPLETED).unwrap()),
        });
        h.drain();
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert!(h.opened_sockets().is_empty());
    }

    #[test]
    fn poll_transport_error_fails_without_retry() {
        let mut h = Harness::new();
        h.establish(login());
        h.respond_err(RequestKind::PollInstruction, ApiError::Transport("timed out".into()));
        assert_eq!(h.engine.state(), EngineState::Failed);
        assert!(h.sched.pending().is_empty());
        assert!(
            h.output()
                .contains("Failed to get SolarNode remote SSH session start status: timed out")
        );
        assert_eq!(h.engine.controls(), controls(true, false, false));
    }

    #[test]
    fn socket_open_sends_attach_and_clears_credentials() {
        let mut h = Harness::new();
        h.establish(login());
        h.respond(RequestKind::PollInstruction, COMPLETED);
        assert!(h.engine.has_credentials());
        let id = h.opened_sockets()[0].0;
        let effects = h.socket(id, SocketEvent::Opened);
        assert!(!h.engine.has_credentials());
        let text = effects
            .iter()
            .find_map(|e| match e {
                Effect::SendSocket { id: sid, text } if *sid == id => Some(text.clone()),
                _ => None,
            })
            .unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["cmd"], "attach-ssh");
        assert_eq!(v["data"]["username"], "solar");
        assert_eq!(v["data"]["password"], "hunter2");
        assert_eq!(v["data"]["authorization-date"], 784887151000u64);
        assert_eq!(v["data"]["cols"], 100);
        assert_eq!(v["data"]["lines"], 24);
        let signed = h.signer.signed.lock().unwrap();
        assert!(signed.last().unwrap().1.ends_with("/nodes/meta/251"));
    }

    #[test]
    fn handshake_reply_attaches_and_later_frames_are_terminal_data() {
        let mut h = Harness::new();
        let id = h.live();
        assert!(h.engine.is_attached());
        assert!(h.effects.contains(&Effect::AttachTerminal { id }));
        let effects = h.socket(id, SocketEvent::Message(br#"{"success":false}"#.to_vec()));
        assert_eq!(effects, vec![Effect::TerminalData(br#"{"success":false}"#.to_vec())]);
        assert_eq!(h.engine.state(), EngineState::Live);
    }

    #[test]
    fn handshake_rejection_closes_socket_keeping_session() {
        let mut h = Harness::new();
        h.establish(login());
        h.respond(RequestKind::PollInstruction, COMPLETED);
        let id = h.opened_sockets()[0].0;
        h.socket(id, SocketEvent::Opened);
        let effects = h.socket(id, SocketEvent::Message(br#"{"success":false,"message":"denied"}"#.to_vec()));
        assert!(effects.contains(&Effect::CloseSocket { id }));
        assert!(h.output().contains(r#"Failed to attach to SSH session: {"success":false,"message":"denied"}"#));
        h.socket(
            id,
            SocketEvent::Closed {
                code: 1006,
                reason: "rejected".into(),
            },
        );
        assert!(h.engine.session().is_some());
        assert_eq!(h.engine.controls(), controls(true, true, true));
    }

    #[test]
    fn socket_failing_before_open_clears_credentials() {
        let mut h = Harness::new();
        h.establish(login());
        h.respond(RequestKind::PollInstruction, COMPLETED);
        assert!(h.engine.has_credentials());
        let id = h.opened_sockets()[0].0;
        h.socket(
            id,
            SocketEvent::Closed {
                code: 1006,
                reason: "refused".into(),
            },
        );
        assert!(!h.engine.has_credentials());
        assert_eq!(h.engine.state(), EngineState::Failed);
        assert!(h.output().contains("Connection closed: refused"));

        // A later connect that is cancelled must not revive the old login.
        h.connect(DialogOutcome::Cancelled);
        assert!(!h.engine.has_credentials());
    }

    #[test]
    fn rejected_handshake_then_local_close_is_not_a_clean_close() {
        let mut h = Harness::new();
        h.establish(login());
        h.respond(RequestKind::PollInstruction, COMPLETED);
        let id = h.opened_sockets()[0].0;
        h.socket(id, SocketEvent::Opened);
        h.socket(id, SocketEvent::Message(br#"{"success":false}"#.to_vec()));
        h.socket(
            id,
            SocketEvent::Closed {
                code: crate::socket::CLOSE_NO_STATUS,
                reason: String::new(),
            },
        );
        assert_eq!(h.engine.state(), EngineState::Failed);
        assert!(h.output().ends_with(&text::connection_closed("")));
        assert!(!h.output().contains("to reconnect via SSH."));
        assert!(h.engine.session().is_some());
    }

    #[test]
    fn normal_close_shows_reconnect_hint_and_keeps_session() {
        let mut h = Harness::new();
        let id = h.live();
        h.socket(
            id,
            SocketEvent::Closed {
                code: 1000,
                reason: String::new(),
            },
        );
        assert!(h.output().contains("to reconnect via SSH."));
        assert!(h.engine.session().is_some());
        assert_eq!(h.engine.state(), EngineState::Ready);
        assert_eq!(h.engine.controls(), controls(true, true, true));
        assert!(h.requests(RequestKind::StopSession).is_empty());
    }

    #[test]
    fn authentication_failure_close_shows_reason() {
        let mut h = Harness::new();
        let id = h.live();
        h.socket(
            id,
            SocketEvent::Closed {
                code: 4000,
                reason: "bad creds".into(),
            },
        );
        let out = h.output();
        assert!(out.contains(&text::error_line("bad creds")));
        assert!(out.contains("bad creds"));
        assert_eq!(h.engine.controls(), controls(true, true, true));
        assert!(h.engine.session().is_some());
    }

    #[test]
    fn other_close_forwards_raw_reason() {
        let mut h = Harness::new();
        let id = h.live();
        h.socket(
            id,
            SocketEvent::Closed {
                code: 1011,
                reason: "internal error".into(),
            },
        );
        assert!(h.output().contains("Connection closed: internal error"));
        assert_eq!(h.engine.state(), EngineState::Failed);
        assert!(h.engine.session().is_some());
    }

    #[test]
    fn reconnect_reuses_existing_session() {
        let mut h = Harness::new();
        let first = h.live();
        h.socket(
            first,
            SocketEvent::Closed {
                code: 1000,
                reason: String::new(),
            },
        );
        h.connect(DialogOutcome::Login(Credentials::new("solar", "again")));
        assert_eq!(h.engine.state(), EngineState::Attaching);
        assert_eq!(h.requests(RequestKind::CreateSession).len(), 1);
        let sockets = h.opened_sockets();
        assert_eq!(sockets.len(), 2);
        assert_ne!(sockets[1].0, first);

        // Late events from the first socket are ignored.
        let effects = h.socket(first, SocketEvent::Message(b"junk".to_vec()));
        assert!(effects.is_empty());
    }

    #[test]
    fn cancel_on_ready_returns_to_ready() {
        let mut h = Harness::new();
        h.establish(DialogOutcome::SkipLogin);
        h.respond(RequestKind::PollInstruction, COMPLETED);
        h.connect(DialogOutcome::Cancelled);
        assert_eq!(h.engine.state(), EngineState::Ready);
        assert_eq!(h.engine.controls(), controls(true, true, true));
        assert!(h.opened_sockets().is_empty());
    }

    #[test]
    fn input_only_reaches_attached_socket() {
        let mut h = Harness::new();
        h.engine.send_input("ls\r".into());
        assert!(h.drain().is_empty());
        let id = h.live();
        h.engine.send_input("ls\r".into());
        assert_eq!(
            h.drain(),
            vec![Effect::SendSocket {
                id,
                text: "ls\r".into()
            }]
        );
    }

    #[test]
    fn setup_gui_opens_proxy_url_once_ready() {
        let mut h = Harness::new();
        h.establish(DialogOutcome::SkipLogin);
        h.engine.launch_setup_gui();
        assert!(h.drain().is_empty());
        h.respond(RequestKind::PollInstruction, COMPLETED);
        h.engine.launch_setup_gui();
        assert_eq!(
            h.drain(),
            vec![Effect::OpenSetupGui {
                url: "https://ssh.solarnetwork.net:8443/nodeproxy/s-1/".into()
            }]
        );
    }

    #[test]
    fn end_without_session_resets() {
        let mut h = Harness::new();
        h.connect(login());
        h.respond(RequestKind::CreateSession, r#"{"success":false}"#);
        h.engine.end();
        let effects = h.drain();
        assert!(effects.contains(&Effect::ClearTerminal));
        assert_eq!(h.engine.state(), EngineState::Idle);
    }
}
