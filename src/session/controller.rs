//! Session controller
//!
//! Owns the current session and everything attached to it: device streams,
//! the capture task, the playback timeline and the retry timer. All state
//! changes happen on the task that drives the controller; transport, device
//! and timer callbacks only post events back to it.
//!
//! Every connection attempt gets a new generation number. Events from older
//! attempts (late closes, stray messages, slow connects) are dropped, which
//! is what keeps an explicit `end()` from ever triggering a reconnect.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::retry::{RetryDecision, RetryManager, RetryPolicy};
use super::state::{AvatarState, ConnectionState, Snapshot, Transcript};
use super::tools::{self, ToolRouter};
use crate::canvas::{BoardCommand, SharedBoard};
use crate::config::{Config, clamp_volume};
use crate::live::{
    Connector, LinkEnvelope, LinkEvent, LinkSender, LiveSession, ServerMessage, SessionSetup,
};
use crate::setup::CredentialProvider;
use crate::voice::{
    AudioBuffer, AudioInput, AudioOutput, CapturePipeline, DeviceHandle, OutputGraph,
    PlaybackScheduler, SourceId,
};
use crate::{Error, Result, codec};

/// Banner after a transport error
pub const LINK_DISTURBANCE: &str = "Link disturbance.";

/// Banner after the remote side closed the session
pub const REBOOTING_LINK: &str = "Rebooting link...";

/// Banner after a failed connect
pub const BRIDGE_FAILURE: &str = "Bridge failure.";

/// Banner once reconnect attempts are used up
pub const CRITICAL_FAILURE: &str = "Critical failure.";

/// Captured frames buffered between the device and the pipeline
const FRAME_QUEUE: usize = 32;

/// Level meter refresh period
const METER_INTERVAL: Duration = Duration::from_millis(16);

/// Longest a session may take to close before it is abandoned
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// User commands accepted by the controller loop
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    End,
    ToggleMute,
    SetMuted(bool),
    SetVolume(f32),
    /// Close signal from the board renderer
    CloseBoard,
    /// End the call and stop the loop
    Shutdown,
}

/// Events posted back to the controller by its own tasks and callbacks
enum Internal {
    Connected {
        generation: u64,
        result: Result<Arc<dyn LiveSession>>,
    },
    RetryDue {
        generation: u64,
    },
    SourceEnded(SourceId),
    TranscriptExpired {
        revision: u64,
    },
}

/// Controller settings
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub setup: SessionSetup,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub retry: RetryPolicy,
    pub transcript_linger: Duration,
    pub volume: f32,
}

impl ControllerConfig {
    /// Derive controller settings from the loaded configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            setup: SessionSetup {
                model: config.live.model.clone(),
                voice: config.live.voice.clone(),
                system_instruction: config.live.system_instruction.clone(),
                tools: tools::declarations(),
            },
            input_sample_rate: config.audio.input_sample_rate,
            output_sample_rate: config.audio.output_sample_rate,
            retry: config.retry.clone(),
            transcript_linger: config.transcript_linger,
            volume: config.audio.volume,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Everything owned by one connection attempt
#[derive(Default)]
struct Attempt {
    session: Option<Arc<dyn LiveSession>>,
    mic: Option<DeviceHandle>,
    speaker: Option<DeviceHandle>,
    capture_task: Option<JoinHandle<()>>,
    connect_task: Option<JoinHandle<()>>,
    /// Link events that arrived before the session handle
    early: VecDeque<LinkEvent>,
}

/// Drives one voice call at a time
pub struct SessionController {
    config: ControllerConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    input: Arc<dyn AudioInput>,
    output: Arc<dyn AudioOutput>,
    board: SharedBoard,
    router: ToolRouter,
    scheduler: PlaybackScheduler,
    retry: RetryManager,
    muted: Arc<AtomicBool>,
    bound: watch::Sender<Option<Arc<dyn LiveSession>>>,
    attempt: Attempt,
    generation: u64,
    attempt_id: Uuid,
    /// Current attempt already failed; its remaining events are ignored
    dead: bool,
    thinking: bool,
    transcript_revision: u64,
    linger_task: Option<JoinHandle<()>>,
    state: Snapshot,
    snapshot_tx: watch::Sender<Snapshot>,
    link_tx: mpsc::UnboundedSender<LinkEnvelope>,
    link_rx: mpsc::UnboundedReceiver<LinkEnvelope>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("generation", &self.generation)
            .field("attempt_id", &self.attempt_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Create an idle controller
    #[must_use]
    pub fn new(
        config: ControllerConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        input: Arc<dyn AudioInput>,
        output: Arc<dyn AudioOutput>,
        board: SharedBoard,
    ) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let volume = clamp_volume(config.volume);
        let mut graph = OutputGraph::new(config.output_sample_rate, volume);
        let ended_tx = internal_tx.clone();
        graph.set_on_ended(Box::new(move |id| {
            let _ = ended_tx.send(Internal::SourceEnded(id));
        }));

        let state = Snapshot {
            volume,
            ..Snapshot::default()
        };
        let (snapshot_tx, _) = watch::channel(state.clone());
        let (bound, _) = watch::channel(None);

        Self {
            retry: RetryManager::new(config.retry.clone()),
            config,
            connector,
            credentials,
            input,
            output,
            router: ToolRouter::new(board.clone()),
            board,
            scheduler: PlaybackScheduler::new(graph.shared()),
            muted: Arc::new(AtomicBool::new(false)),
            bound,
            attempt: Attempt::default(),
            generation: 0,
            attempt_id: Uuid::nil(),
            dead: false,
            thinking: false,
            transcript_revision: 0,
            linger_task: None,
            state,
            snapshot_tx,
            link_tx,
            link_rx,
            internal_tx,
            internal_rx,
        }
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Current state
    #[must_use]
    pub const fn snapshot(&self) -> &Snapshot {
        &self.state
    }

    /// The playback timeline
    #[must_use]
    pub const fn playback(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    /// Generation of the current connection attempt
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a reconnect timer is armed
    #[must_use]
    pub fn retry_pending(&self) -> bool {
        self.retry.is_pending()
    }

    // -- commands -----------------------------------------------------------

    /// Apply one user command; returns false on `Shutdown`
    pub async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start => self.start().await,
            Command::End => self.end().await,
            Command::ToggleMute => {
                let muted = !self.muted.fetch_xor(true, Ordering::Relaxed);
                self.set_muted_state(muted);
            }
            Command::SetMuted(muted) => {
                self.muted.store(muted, Ordering::Relaxed);
                self.set_muted_state(muted);
            }
            Command::SetVolume(volume) => {
                let volume = clamp_volume(volume);
                self.scheduler.set_volume(volume);
                self.state.volume = volume;
                self.publish();
            }
            Command::CloseBoard => {
                self.board.lock().await.hide();
                self.state.board_visible = false;
                self.publish();
            }
            Command::Shutdown => {
                self.end().await;
                return false;
            }
        }
        true
    }

    /// Begin a call
    ///
    /// A call that is already started is left alone. Without a credential the
    /// provider is asked for one first; if it still has none the call does not
    /// start and the reason is shown in the status banner.
    pub async fn start(&mut self) {
        if self.state.started {
            tracing::debug!("start ignored, call already started");
            return;
        }

        self.retry.clear();
        self.state.retry_attempt = 0;

        if !self.credentials.has_credential() {
            if let Err(e) = self.credentials.prompt().await {
                tracing::warn!(error = %e, "credential prompt failed");
            }
        }
        if !self.credentials.has_credential() {
            let error = Error::Config("no API key configured".to_string());
            tracing::warn!(error = %error, "call not started");
            self.state.status = Some(error.to_string());
            self.publish();
            return;
        }

        self.state.started = true;
        self.state.status = None;
        self.begin_attempt().await;
    }

    /// End the call
    ///
    /// Cancels any pending reconnect, closes the session, releases both
    /// devices, stops playback and clears the transcript and board.
    pub async fn end(&mut self) {
        let was_started = self.state.started;

        self.retry.clear();
        self.generation += 1;
        self.dead = true;
        self.teardown_attempt().await;
        self.scheduler.shutdown();
        self.cancel_linger();

        self.state.started = false;
        self.set_connection(ConnectionState::Idle);
        self.state.avatar = AvatarState::Idle;
        self.thinking = false;
        self.state.transcript = None;
        self.state.retry_attempt = 0;
        self.state.level = 0.0;

        self.board.lock().await.hide();
        self.state.board_visible = false;

        self.publish();
        if was_started {
            tracing::info!("call ended");
        }
    }

    // -- event loop -----------------------------------------------------------

    /// Run until `Shutdown` or until the command channel closes
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut board_rx = self.board.lock().await.subscribe();
        let mut meter = tokio::time::interval(METER_INTERVAL);
        meter.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(envelope) = self.link_rx.recv() => {
                    self.handle_link(envelope).await;
                }
                Some(event) = self.internal_rx.recv() => {
                    self.handle_internal(event).await;
                }
                Ok(command) = board_rx.recv() => {
                    let visible = matches!(command, BoardCommand::Show { .. });
                    if self.state.board_visible != visible {
                        self.state.board_visible = visible;
                        self.publish();
                    }
                }
                _ = meter.tick() => {
                    if self.refresh_level() {
                        self.publish();
                    }
                }
            }
        }

        self.end().await;
        tracing::info!("session controller stopped");
    }

    /// Handle one event that is already queued, without waiting
    ///
    /// Returns false when nothing was queued. Hosts that drive the controller
    /// from their own loop call this instead of `run`.
    pub async fn poll_pending(&mut self) -> bool {
        if let Ok(envelope) = self.link_rx.try_recv() {
            self.handle_link(envelope).await;
        } else if let Ok(event) = self.internal_rx.try_recv() {
            self.handle_internal(event).await;
        } else {
            return false;
        }
        true
    }

    /// Sample the output level; returns whether it changed
    ///
    /// The meter only runs while speaking and reads zero otherwise.
    pub fn refresh_level(&mut self) -> bool {
        let level = if self.state.avatar == AvatarState::Speaking {
            self.scheduler.level()
        } else {
            0.0
        };

        let changed = (level - self.state.level).abs() > f32::EPSILON;
        self.state.level = level;
        changed
    }

    // -- attempts -------------------------------------------------------------

    async fn begin_attempt(&mut self) {
        self.teardown_attempt().await;

        self.generation += 1;
        self.attempt_id = Uuid::new_v4();
        self.dead = false;
        self.set_connection(ConnectionState::Connecting);

        tracing::info!(
            attempt_id = %self.attempt_id,
            generation = self.generation,
            retry = self.retry.attempt(),
            "connecting"
        );

        let Some(credential) = self.credentials.credential() else {
            self.fail_fatal(Error::Config("no API key configured".to_string()))
                .await;
            return;
        };

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let mic = match self.input.open(frame_tx) {
            Ok(handle) => handle,
            Err(e) => {
                self.fail_fatal(e).await;
                return;
            }
        };
        self.attempt.mic = Some(mic);

        let speaker = match self.output.open(self.scheduler.graph().clone()) {
            Ok(handle) => handle,
            Err(e) => {
                self.fail_fatal(e).await;
                return;
            }
        };
        self.attempt.speaker = Some(speaker);

        let pipeline = CapturePipeline::new(
            self.muted.clone(),
            self.bound.subscribe(),
            self.config.input_sample_rate,
        );
        self.attempt.capture_task = Some(tokio::spawn(pipeline.run(frame_rx)));

        let connector = self.connector.clone();
        let setup = self.config.setup.clone();
        let link = LinkSender::new(self.generation, self.link_tx.clone());
        let internal = self.internal_tx.clone();
        let generation = self.generation;
        self.attempt.connect_task = Some(tokio::spawn(async move {
            let result = connector.connect(&setup, &credential, link).await;
            let _ = internal.send(Internal::Connected { generation, result });
        }));

        self.publish();
    }

    /// Release everything the current attempt holds
    ///
    /// Devices are released before the session is closed; the close itself is
    /// bounded.
    async fn teardown_attempt(&mut self) {
        self.bound.send_replace(None);
        self.attempt.early.clear();

        if let Some(task) = self.attempt.connect_task.take() {
            task.abort();
        }
        if let Some(mut mic) = self.attempt.mic.take() {
            mic.stop();
        }
        if let Some(task) = self.attempt.capture_task.take() {
            task.abort();
        }

        self.scheduler.interrupt_all();

        if let Some(mut speaker) = self.attempt.speaker.take() {
            speaker.stop();
        }

        if let Some(session) = self.attempt.session.take() {
            // Closing an already broken session is expected to fail
            match tokio::time::timeout(SESSION_CLOSE_TIMEOUT, session.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "session close failed"),
                Err(_) => tracing::warn!(
                    attempt_id = %self.attempt_id,
                    "session close timed out, abandoning it"
                ),
            }
        }
    }

    /// Failure that must not be retried: back to not-started
    async fn fail_fatal(&mut self, error: Error) {
        tracing::error!(attempt_id = %self.attempt_id, error = %error, "session start failed");

        self.retry.clear();
        self.generation += 1;
        self.dead = true;
        self.teardown_attempt().await;

        self.state.started = false;
        self.set_connection(ConnectionState::Idle);
        self.state.avatar = AvatarState::Idle;
        self.thinking = false;
        self.state.retry_attempt = 0;
        self.state.status = Some(error.to_string());
        self.publish();
    }

    /// Qualifying session failure: hand over to the retry manager
    async fn on_failure(&mut self, next: ConnectionState, banner: &str) {
        if !self.state.started {
            return;
        }

        self.dead = true;
        self.set_connection(next);
        self.state.avatar = AvatarState::Idle;
        self.thinking = false;
        self.teardown_attempt().await;

        match self.retry.on_failure() {
            RetryDecision::Retry { attempt, delay } => {
                let max = self.retry.policy().max_attempts;
                self.state.status = Some(format!("{banner} [{attempt}/{max}]"));
                self.state.retry_attempt = attempt;
                self.retry.schedule(
                    delay,
                    self.internal_tx.clone(),
                    Internal::RetryDue {
                        generation: self.generation,
                    },
                );
                tracing::warn!(
                    attempt_id = %self.attempt_id,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "{banner} reconnect scheduled"
                );
            }
            RetryDecision::Exhausted => {
                self.state.status = Some(CRITICAL_FAILURE.to_string());
                self.state.started = false;
                tracing::error!(attempt_id = %self.attempt_id, "reconnect attempts exhausted");
            }
        }

        self.publish();
    }

    // -- dispatch -------------------------------------------------------------

    async fn handle_link(&mut self, envelope: LinkEnvelope) {
        if envelope.generation != self.generation || self.dead {
            tracing::trace!(generation = envelope.generation, "stale link event ignored");
            return;
        }

        match envelope.event {
            LinkEvent::Error(reason) => {
                tracing::warn!(attempt_id = %self.attempt_id, reason = %reason, "link error");
                self.on_failure(ConnectionState::Errored, LINK_DISTURBANCE)
                    .await;
            }
            LinkEvent::Closed(reason) => {
                tracing::info!(attempt_id = %self.attempt_id, reason = ?reason, "link closed");
                self.on_failure(ConnectionState::Closed, REBOOTING_LINK).await;
            }
            event if self.attempt.session.is_none() => self.attempt.early.push_back(event),
            event => self.apply(event).await,
        }
    }

    /// Apply an open or message event to a session whose handle is known
    async fn apply(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened => self.on_open(),
            LinkEvent::Message(message) => self.on_message(&message).await,
            LinkEvent::Error(_) | LinkEvent::Closed(_) => {}
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Connected { generation, result } => {
                self.on_connected(generation, result).await;
            }
            Internal::RetryDue { generation } => {
                if generation == self.generation && self.state.started {
                    self.begin_attempt().await;
                }
            }
            Internal::SourceEnded(id) => {
                if self.scheduler.on_source_ended(id) && self.state.avatar == AvatarState::Speaking
                {
                    self.state.avatar = AvatarState::Listening;
                    self.state.level = 0.0;
                    self.publish();
                }
            }
            Internal::TranscriptExpired { revision } => {
                if revision == self.transcript_revision && self.state.transcript.is_some() {
                    self.state.transcript = None;
                    self.publish();
                }
            }
        }
    }

    async fn on_connected(&mut self, generation: u64, result: Result<Arc<dyn LiveSession>>) {
        if generation != self.generation || self.dead {
            if let Ok(session) = result {
                tokio::spawn(async move {
                    let _ = session.close().await;
                });
            }
            return;
        }

        match result {
            Ok(session) => {
                self.attempt.session = Some(session);
                while let Some(event) = self.attempt.early.pop_front() {
                    self.apply(event).await;
                    if self.dead {
                        break;
                    }
                }
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(attempt_id = %self.attempt_id, error = %e, "connect failed");
                self.on_failure(ConnectionState::Errored, BRIDGE_FAILURE).await;
            }
            Err(e) => self.fail_fatal(e).await,
        }
    }

    fn on_open(&mut self) {
        self.set_connection(ConnectionState::Open);
        self.state.status = None;
        self.state.avatar = AvatarState::Listening;
        self.retry.reset();
        self.state.retry_attempt = 0;

        // Frames start flowing into this session from here on
        self.bound.send_replace(self.attempt.session.clone());

        tracing::info!(attempt_id = %self.attempt_id, "link open");
        self.publish();
    }

    async fn on_message(&mut self, message: &ServerMessage) {
        // Each call is acknowledged before the next one runs
        for call in message.function_calls() {
            match self.router.dispatch(call).await {
                Ok(ack) => {
                    if let Some(session) = &self.attempt.session {
                        if let Err(e) = session.send_tool_response(ack).await {
                            tracing::warn!(id = %call.id, error = %e, "tool response failed");
                        }
                    }
                }
                Err(e) => tracing::debug!(id = %call.id, error = %e, "tool call ignored"),
            }
        }

        if let Some(text) = message.input_transcription() {
            self.state.transcript = Some(Transcript::user(text));
            self.state.avatar = AvatarState::Thinking;
            self.thinking = true;
            self.transcript_revision += 1;
        }

        if let Some(text) = message.output_transcription() {
            let previous = self.state.transcript.as_ref();
            self.state.transcript = Some(Transcript::append_ai(previous, text));
            self.transcript_revision += 1;
        }

        if message.is_turn_complete() {
            self.thinking = false;
            self.schedule_linger();
        }

        if let Some(data) = message.audio_data() {
            match self.decode_chunk(data) {
                Ok(buffer) => {
                    self.scheduler.schedule_chunk(buffer);
                    self.state.avatar = AvatarState::Speaking;
                    self.thinking = false;
                }
                Err(e) => tracing::debug!(error = %e, "audio chunk dropped"),
            }
        }

        if message.is_interrupted() {
            self.scheduler.interrupt_all();
            self.state.avatar = AvatarState::Listening;
            self.thinking = false;
            self.state.transcript = None;
            self.transcript_revision += 1;
            self.cancel_linger();
        }

        self.state.board_visible = self.router.board_visible().await;
        self.publish();
    }

    fn decode_chunk(&self, data: &str) -> Result<AudioBuffer> {
        let bytes = codec::decode_bytes(data)?;
        AudioBuffer::from_pcm16(&bytes, 1, self.config.output_sample_rate)
    }

    // -- helpers ------------------------------------------------------------

    fn schedule_linger(&mut self) {
        self.cancel_linger();

        let revision = self.transcript_revision;
        let linger = self.config.transcript_linger;
        let tx = self.internal_tx.clone();
        self.linger_task = Some(tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            let _ = tx.send(Internal::TranscriptExpired { revision });
        }));
    }

    fn cancel_linger(&mut self) {
        if let Some(task) = self.linger_task.take() {
            task.abort();
        }
    }

    fn set_muted_state(&mut self, muted: bool) {
        self.state.muted = muted;
        tracing::debug!(muted, "microphone mute changed");
        self.publish();
    }

    /// Move the connection state, refusing illegal transitions
    fn set_connection(&mut self, next: ConnectionState) {
        let current = self.state.connection;
        if current == next {
            return;
        }
        if current.can_transition(next) {
            tracing::debug!(from = %current, to = %next, "connection state");
            self.state.connection = next;
        } else {
            tracing::warn!(from = %current, to = %next, "illegal connection transition ignored");
        }
    }

    fn publish(&mut self) {
        self.state.processing =
            self.state.connection == ConnectionState::Connecting || self.thinking;
        self.snapshot_tx.send_replace(self.state.clone());
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.cancel_linger();
        if let Some(task) = self.attempt.connect_task.take() {
            task.abort();
        }
        if let Some(task) = self.attempt.capture_task.take() {
            task.abort();
        }
    }
}
