//! Interactive session driver.
//!
//! Owns the TTY, the HTTP client and the live sockets, executes the effects
//! the engine emits, and feeds responses, timers, socket events and key
//! presses back into it from a single task.
use anyhow::Result;
use crossterm::event::{Event as TermEvent, EventStream, KeyEvent, KeyEventKind};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::api::HttpClient;
use crate::engine::{Effect, Engine, EngineState, Event};
use crate::scheduler::TokioScheduler;
use crate::session::TerminalSettings;
use crate::signing::Snws2Signer;
use crate::socket::{SocketHandle, SocketId, spawn_socket};
use crate::terminal::form::{CredentialForm, FormStep};
use crate::terminal::keys::{ChordReader, Command, KeyAction};
use crate::terminal::{TerminalSink, Tty, text};
use crate::time_sync::TimeSync;
use crate::urls::UrlHelper;

/// Upper bound on waiting for the stop request when quitting.
const QUIT_GRACE: Duration = Duration::from_secs(5);

pub struct SessionOptions {
    pub urls: UrlHelper,
    pub settings: TerminalSettings,
    pub token: String,
    pub secret: String,
}

struct Driver<S: TerminalSink> {
    engine: Engine,
    tty: S,
    http: HttpClient,
    events: mpsc::UnboundedSender<Event>,
    sockets: HashMap<SocketId, SocketHandle>,
    attached: Option<SocketId>,
    form: Option<CredentialForm>,
    chords: ChordReader,
    token: String,
    secret: String,
    clock: TimeSync,
    quit_deadline: Option<Instant>,
}

pub async fn run_session(options: SessionOptions) -> Result<()> {
    let mut clock = TimeSync::new();
    if let Err(e) = clock.sync(&options.urls.sn_base_url()).await {
        warn!("clock sync with SolarNet failed: {}", e);
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let engine = Engine::new(
        options.urls,
        options.settings,
        Box::new(TokioScheduler::new(tx.clone())),
    );
    let mut driver = Driver::new(
        engine,
        Tty::open()?,
        HttpClient::new()?,
        tx,
        options.token,
        options.secret,
        clock,
    );

    driver.engine.start();
    driver.apply_effects()?;
    driver.tty.write_str(&text::connect_hint())?;

    let mut keys = EventStream::new();
    loop {
        let deadline = driver.quit_deadline;
        tokio::select! {
            Some(event) = rx.recv() => {
                driver.engine.handle(event);
                driver.apply_effects()?;
            }
            key = keys.next() => match key {
                Some(Ok(TermEvent::Key(key))) if key.kind != KeyEventKind::Release => {
                    driver.on_key(key);
                    driver.apply_effects()?;
                }
                Some(Ok(TermEvent::Resize(cols, lines))) => {
                    driver.engine.set_settings(TerminalSettings::new(Some(cols), Some(lines)));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("terminal input error: {}", e);
                    break;
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                warn!("stop did not finish before quitting");
                break;
            }
        }
        if driver.quit_deadline.is_some() && driver.engine.session().is_none() {
            break;
        }
    }

    for (_, socket) in driver.sockets.drain() {
        socket.close();
    }
    info!("session driver exiting");
    Ok(())
}

impl<S: TerminalSink> Driver<S> {
    fn new(
        engine: Engine,
        tty: S,
        http: HttpClient,
        events: mpsc::UnboundedSender<Event>,
        token: String,
        secret: String,
        clock: TimeSync,
    ) -> Self {
        Self {
            engine,
            tty,
            http,
            events,
            sockets: HashMap::new(),
            attached: None,
            form: None,
            chords: ChordReader::new(),
            token,
            secret,
            clock,
            quit_deadline: None,
        }
    }

    fn on_key(&mut self, key: KeyEvent) {
        if let Some(form) = self.form.as_mut() {
            match form.feed(key) {
                FormStep::Echo(echo) => {
                    if !echo.is_empty() {
                        let _ = self.tty.write_str(&echo);
                    }
                }
                FormStep::Done(outcome) => {
                    self.form = None;
                    let _ = self.tty.write_str(text::NEWLINE);
                    self.engine.credentials_dialog_closed(outcome);
                }
            }
            return;
        }

        match self.chords.feed(key, self.engine.is_attached()) {
            KeyAction::Command(Command::Connect) => {
                let signer = Snws2Signer::new(self.token.clone(), self.secret.clone())
                    .with_clock(self.clock);
                self.engine.connect(Box::new(signer));
            }
            KeyAction::Command(Command::SetupGui) => self.engine.launch_setup_gui(),
            KeyAction::Command(Command::End) => {
                if self.engine.controls().end {
                    self.engine.end();
                }
            }
            KeyAction::Command(Command::Quit) => self.quit(),
            KeyAction::Input(input) => self.engine.send_input(input),
            KeyAction::None => {}
        }
    }

    /// Stop any live session first, as closing the page would.
    fn quit(&mut self) {
        if self.quit_deadline.is_some() {
            return;
        }
        self.quit_deadline = Some(Instant::now() + QUIT_GRACE);
        if self.engine.session().is_some() && self.engine.state() != EngineState::StoppingSession {
            self.engine.end();
        }
    }

    fn apply_effects(&mut self) -> Result<()> {
        for effect in self.engine.take_effects() {
            self.apply(effect)?;
        }
        Ok(())
    }

    fn apply(&mut self, effect: Effect) -> Result<()> {
        match effect {
            Effect::Write(s) => self.tty.write_str(&s)?,
            Effect::ClearTerminal => self.tty.clear()?,
            Effect::PromptCredentials => {
                let (form, prompt) = CredentialForm::open();
                self.form = Some(form);
                self.tty.write_str(&prompt)?;
            }
            Effect::Request { tag, request } => {
                let http = self.http.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = http.execute(&request).await;
                    if events.send(Event::Response { tag, result }).is_err() {
                        debug!(?tag, "event loop gone, response dropped");
                    }
                });
            }
            Effect::OpenSocket { id, url } => {
                let events = self.events.clone();
                let handle = spawn_socket(url, move |event| {
                    let _ = events.send(Event::Socket { id, event });
                });
                self.sockets.insert(id, handle);
            }
            Effect::SendSocket { id, text } => match self.sockets.get(&id) {
                Some(socket) => socket.send_text(text),
                None => debug!(id, "send on unknown socket"),
            },
            Effect::CloseSocket { id } => {
                if let Some(socket) = self.sockets.remove(&id) {
                    socket.close();
                }
            }
            Effect::AttachTerminal { id } => self.attached = Some(id),
            Effect::DetachTerminal { id } => {
                if self.attached == Some(id) {
                    self.attached = None;
                }
            }
            Effect::TerminalData(bytes) => {
                if self.attached.is_some() {
                    self.tty.write_bytes(&bytes)?;
                }
            }
            Effect::OpenSetupGui { url } => {
                if let Err(e) = open_url(&url) {
                    warn!("could not open browser: {}", e);
                    self.tty.write_str(&text::line(&format!("Open {} in a browser.", url)))?;
                }
            }
            Effect::ControlsChanged(controls) => self.tty.show_controls(controls)?,
        }
        Ok(())
    }
}

/// Open a URL in the system browser; a later call replaces the target page.
pub fn open_url(url: &str) -> Result<()> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(url).spawn()?;
    }
    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open").arg(url).spawn()?;
    }
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd")
            .args(["/c", "start", url])
            .spawn()?;
    }
    Ok(())
}
