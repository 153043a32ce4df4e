//! Shared test utilities
//!
//! In-process fakes for the remote session, audio devices and credential
//! provider, so controller tests need neither hardware nor network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use neural_link::canvas::SharedBoard;
use neural_link::live::{
    Connector, FunctionResponse, LinkSender, LiveSession, ServerMessage, SessionSetup,
};
use neural_link::session::{ControllerConfig, RetryPolicy, SessionController};
use neural_link::setup::CredentialProvider;
use neural_link::voice::{AudioFrame, AudioInput, AudioOutput, DeviceHandle, SharedGraph};
use neural_link::{Board, Error, Result};
use secrecy::SecretString;
use tokio::sync::mpsc;

/// Output rate used by every controller test
pub const OUTPUT_RATE: u32 = 24000;

/// Scheduler turns `settle` grants spawned tasks before giving up
const IDLE_YIELDS: usize = 8;

/// Lock a test mutex
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap()
}

// -- live session -------------------------------------------------------------

/// Records everything the controller sends
#[derive(Default)]
pub struct FakeSession {
    pub audio: Mutex<Vec<(String, String)>>,
    pub tool_responses: Mutex<Vec<FunctionResponse>>,
    pub closes: AtomicU64,
    /// `close` never resolves, like a peer that stopped reading
    pub stall_close: bool,
}

impl FakeSession {
    pub fn audio_count(&self) -> usize {
        lock(&self.audio).len()
    }

    pub fn responses(&self) -> Vec<FunctionResponse> {
        lock(&self.tool_responses).clone()
    }

    pub fn close_count(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LiveSession for FakeSession {
    async fn send_audio(&self, data: String, mime_type: &str) -> Result<()> {
        lock(&self.audio).push((data, mime_type.to_string()));
        Ok(())
    }

    async fn send_tool_response(&self, response: FunctionResponse) -> Result<()> {
        lock(&self.tool_responses).push(response);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.stall_close {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// What the next `connect` call does
pub enum ConnectOutcome {
    Succeed,
    Fail(Error),
}

/// Hands out `FakeSession`s and keeps each attempt's link sender
#[derive(Default)]
pub struct FakeConnector {
    outcomes: Mutex<VecDeque<ConnectOutcome>>,
    links: Mutex<Vec<LinkSender>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    setups: Mutex<Vec<SessionSetup>>,
    stall_close: AtomicBool,
}

impl FakeConnector {
    /// Queue outcomes; once empty every connect succeeds
    pub fn push_outcome(&self, outcome: ConnectOutcome) {
        lock(&self.outcomes).push_back(outcome);
    }

    /// Sessions opened from now on never finish closing
    pub fn stall_closes(&self) {
        self.stall_close.store(true, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.setups).len()
    }

    pub fn last_setup(&self) -> Option<SessionSetup> {
        lock(&self.setups).last().cloned()
    }

    /// Link sender of the most recent attempt
    pub fn link(&self) -> LinkSender {
        lock(&self.links).last().cloned().expect("no connect yet")
    }

    /// Session of the most recent successful attempt
    pub fn session(&self) -> Arc<FakeSession> {
        lock(&self.sessions).last().cloned().expect("no session yet")
    }

    /// Complete the handshake of the most recent attempt
    pub fn open(&self) {
        assert!(self.link().opened());
    }

    /// Deliver a JSON frame to the most recent attempt
    pub fn deliver(&self, json: serde_json::Value) {
        let message = ServerMessage::parse(json.to_string().as_bytes()).unwrap();
        assert!(self.link().message(message));
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        setup: &SessionSetup,
        _credential: &SecretString,
        link: LinkSender,
    ) -> Result<Arc<dyn LiveSession>> {
        lock(&self.setups).push(setup.clone());
        lock(&self.links).push(link);

        let outcome = lock(&self.outcomes)
            .pop_front()
            .unwrap_or(ConnectOutcome::Succeed);
        match outcome {
            ConnectOutcome::Succeed => {
                let session = Arc::new(FakeSession {
                    stall_close: self.stall_close.load(Ordering::SeqCst),
                    ..FakeSession::default()
                });
                lock(&self.sessions).push(session.clone());
                Ok(session)
            }
            ConnectOutcome::Fail(e) => Err(e),
        }
    }
}

// -- devices ------------------------------------------------------------------

/// Microphone that produces frames on demand
#[derive(Default)]
pub struct FakeInput {
    frames: Mutex<Option<mpsc::Sender<AudioFrame>>>,
    opens: AtomicU64,
    releases: Arc<AtomicU64>,
    sequence: AtomicU64,
    deny: bool,
}

impl FakeInput {
    /// A microphone the user refuses access to
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// How many opened microphones were released again
    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    /// Capture one frame of constant samples
    pub fn capture(&self, value: f32) {
        let sender = lock(&self.frames).clone().expect("microphone not open");
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        sender
            .try_send(AudioFrame {
                sequence,
                samples: vec![value; 2048],
            })
            .unwrap();
    }
}

impl AudioInput for FakeInput {
    fn open(&self, frames: mpsc::Sender<AudioFrame>) -> Result<DeviceHandle> {
        if self.deny {
            return Err(Error::MediaAccess("permission denied".to_string()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        *lock(&self.frames) = Some(frames);
        let releases = self.releases.clone();
        Ok(DeviceHandle::with_release(move || {
            releases.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

/// Speaker that never renders on its own; tests drive the graph clock
#[derive(Default)]
pub struct FakeOutput {
    graph: Mutex<Option<SharedGraph>>,
}

impl FakeOutput {
    pub fn graph(&self) -> SharedGraph {
        lock(&self.graph).clone().expect("speaker not open")
    }
}

impl AudioOutput for FakeOutput {
    fn open(&self, graph: SharedGraph) -> Result<DeviceHandle> {
        *lock(&self.graph) = Some(graph);
        Ok(DeviceHandle::detached())
    }
}

// -- credentials ---------------------------------------------------------------

/// Credential provider with a fixed answer
pub struct FakeCredentials {
    key: Mutex<Option<SecretString>>,
    /// Key handed out when prompted
    on_prompt: Option<String>,
    pub prompts: AtomicU64,
}

impl FakeCredentials {
    pub fn with_key() -> Self {
        Self {
            key: Mutex::new(Some(SecretString::from("test-key".to_string()))),
            on_prompt: None,
            prompts: AtomicU64::new(0),
        }
    }

    pub fn missing() -> Self {
        Self {
            key: Mutex::new(None),
            on_prompt: None,
            prompts: AtomicU64::new(0),
        }
    }

    pub fn prompted(key: &str) -> Self {
        Self {
            key: Mutex::new(None),
            on_prompt: Some(key.to_string()),
            prompts: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    fn has_credential(&self) -> bool {
        lock(&self.key).is_some()
    }

    async fn prompt(&self) -> Result<()> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        match &self.on_prompt {
            Some(key) => {
                *lock(&self.key) = Some(SecretString::from(key.clone()));
                Ok(())
            }
            None => Err(Error::Config("prompt dismissed".to_string())),
        }
    }

    fn credential(&self) -> Option<SecretString> {
        lock(&self.key).clone()
    }
}

// -- harness ------------------------------------------------------------------

/// Controller wired to fakes
pub struct Harness {
    pub controller: SessionController,
    pub connector: Arc<FakeConnector>,
    pub input: Arc<FakeInput>,
    pub output: Arc<FakeOutput>,
    pub credentials: Arc<FakeCredentials>,
    pub board: SharedBoard,
}

/// Controller settings with short, predictable timings
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        output_sample_rate: OUTPUT_RATE,
        retry: RetryPolicy::default(),
        transcript_linger: Duration::from_secs(3),
        volume: 0.8,
        ..ControllerConfig::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with(FakeInput::default(), FakeCredentials::with_key())
    }

    pub fn with(input: FakeInput, credentials: FakeCredentials) -> Self {
        let connector = Arc::new(FakeConnector::default());
        let input = Arc::new(input);
        let output = Arc::new(FakeOutput::default());
        let credentials = Arc::new(credentials);
        let board = Board::shared();

        let controller = SessionController::new(
            test_config(),
            connector.clone(),
            credentials.clone(),
            input.clone(),
            output.clone(),
            board.clone(),
        );

        Self {
            controller,
            connector,
            input,
            output,
            credentials,
            board,
        }
    }

    /// Start the call and complete the handshake
    pub async fn open(&mut self) {
        self.controller.start().await;
        self.settle().await;
        self.connector.open();
        self.settle().await;
    }

    /// Deliver a frame and process it
    pub async fn deliver(&mut self, json: serde_json::Value) {
        self.connector.deliver(json);
        self.settle().await;
    }

    /// Handle every event that becomes ready, giving spawned tasks a chance to run
    ///
    /// Returns how many events were handled.
    pub async fn settle(&mut self) -> usize {
        let mut handled = 0;
        let mut idle = 0;

        while idle <= IDLE_YIELDS {
            tokio::task::yield_now().await;
            if self.controller.poll_pending().await {
                handled += 1;
                idle = 0;
            } else {
                idle += 1;
            }
        }

        handled
    }

    /// Advance the output clock by rendering `seconds` of audio
    pub fn render(&self, seconds: f64) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let frames = (seconds * f64::from(OUTPUT_RATE)).round() as usize;
        let mut out = vec![0.0f32; frames];
        neural_link::voice::lock_graph(self.controller.playback().graph()).render(&mut out, 1);
    }
}

/// Base64 of `seconds` of mono 16-bit PCM at the output rate
pub fn pcm_chunk(seconds: f64) -> String {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let frames = (seconds * f64::from(OUTPUT_RATE)).round() as usize;
    let samples = vec![0.25f32; frames];
    neural_link::codec::encode_bytes(&neural_link::codec::float_to_pcm16(&samples))
}

/// A frame carrying one audio chunk
pub fn audio_message(seconds: f64) -> serde_json::Value {
    serde_json::json!({
        "serverContent": {
            "modelTurn": {
                "parts": [{
                    "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": pcm_chunk(seconds) }
                }]
            }
        }
    })
}
