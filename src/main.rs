use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;
use tracing_subscriber::EnvFilter;

use neural_link::api::BoardServer;
use neural_link::session::ControllerConfig;
use neural_link::voice::{
    AudioBuffer, AudioInput, AudioOutput, CpalInput, CpalOutput, OutputGraph,
    PLAYBACK_SAMPLE_RATE, PlaybackScheduler, samples_to_wav,
};
use neural_link::{
    Board, Command, Config, ConfigCredentials, CredentialProvider, GeminiConnector,
    SessionController, Snapshot,
};

/// Neural Link - real-time voice link to a conversational AI
#[derive(Parser)]
#[command(name = "neural-link", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Start the call immediately
    #[arg(long)]
    autostart: bool,

    /// Don't serve the board page
    #[arg(long)]
    no_board: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Cmd {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Write the captured audio to a WAV file
        #[arg(short, long)]
        record: Option<PathBuf>,
    },
    /// Test speaker output
    TestSpeaker,
    /// Interactive first-run setup
    Setup,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,neural_link=info",
        1 => "info,neural_link=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(cmd) = cli.command {
        return match cmd {
            Cmd::TestMic { duration, record } => test_mic(duration, record).await,
            Cmd::TestSpeaker => test_speaker().await,
            Cmd::Setup => neural_link::setup::run_setup(),
        };
    }

    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    let credentials = ConfigCredentials::new(
        config.api_key.clone(),
        config.config_path.clone(),
        true,
    );

    // Ask before the key reader owns stdin
    if !credentials.has_credential() {
        if let Err(e) = credentials.prompt().await {
            tracing::warn!(error = %e, "no credential, run `neural-link setup`");
        }
    }

    let board = Board::shared();
    let board_server = (config.board.enabled && !cli.no_board)
        .then(|| BoardServer::new(board.clone(), config.board.port).spawn());

    let connector = GeminiConnector::new(&config.live.endpoint)?;
    let input = CpalInput::new(config.audio.input_sample_rate, config.audio.frame_size);

    // The key reader owns stdin from here on; a missing key becomes a banner
    let controller = SessionController::new(
        ControllerConfig::from_config(&config),
        Arc::new(connector),
        Arc::new(credentials.non_interactive()),
        Arc::new(input),
        Arc::new(CpalOutput),
        board,
    );

    let mut snapshots = WatchStream::new(controller.subscribe());
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let controller_task = tokio::spawn(controller.run(cmd_rx));

    let mut keys = spawn_key_reader();
    print_help();

    if cli.autostart {
        cmd_tx.send(Command::Start).await?;
    }

    let mut last = Snapshot::default();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
            key = keys.recv() => {
                let Some(key) = key else { break };
                let command = match key {
                    's' => Command::Start,
                    'e' => Command::End,
                    'm' => Command::ToggleMute,
                    '+' => Command::SetVolume(last.volume + 0.1),
                    '-' => Command::SetVolume(last.volume - 0.1),
                    'c' => Command::CloseBoard,
                    'q' => break,
                    _ => {
                        print_help();
                        continue;
                    }
                };
                if cmd_tx.send(command).await.is_err() {
                    break;
                }
            }
            Some(snapshot) = snapshots.next() => {
                print_changes(&last, &snapshot);
                last = snapshot;
            }
        }
    }

    let _ = cmd_tx.send(Command::Shutdown).await;
    controller_task.await?;

    if let Some(server) = board_server {
        server.abort();
    }

    Ok(())
}

/// Read single-key commands from stdin lines
///
/// Runs on a plain thread; a blocked read must not hold up runtime shutdown.
fn spawn_key_reader() -> mpsc::Receiver<char> {
    let (tx, rx) = mpsc::channel(8);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            for key in line.trim().chars() {
                if tx.blocking_send(key).is_err() {
                    return;
                }
            }
        }
    });
    rx
}

fn print_help() {
    println!("keys: [s]tart  [e]nd  [m]ute  [+/-] volume  [c]lose board  [q]uit");
}

fn print_changes(prev: &Snapshot, next: &Snapshot) {
    if prev.connection != next.connection {
        println!("link: {}", next.connection);
    }
    if prev.avatar != next.avatar {
        println!("core: {}", next.avatar);
    }
    if prev.status != next.status {
        if let Some(status) = &next.status {
            println!("!! {status}");
        }
    }
    if prev.transcript != next.transcript {
        if let Some(t) = &next.transcript {
            println!("{:?}: {}", t.speaker, t.text);
        }
    }
    if prev.muted != next.muted {
        println!("mic: {}", if next.muted { "muted" } else { "live" });
    }
    if (prev.volume - next.volume).abs() > f32::EPSILON {
        println!("volume: {:.0}%", next.volume * 100.0);
    }
    if prev.board_visible != next.board_visible {
        println!("board: {}", if next.board_visible { "shown" } else { "hidden" });
    }
}

/// Test microphone input
async fn test_mic(duration: u64, record: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let input = CpalInput::default();
    let (tx, mut rx) = mpsc::channel(64);
    let mut handle = input.open(tx)?;

    println!("Frames: 16000 Hz mono");
    println!("---");

    let mut recorded = Vec::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;

    for i in 0..duration {
        let mut second = Vec::new();
        loop {
            tokio::select! {
                _ = ticker.tick() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => second.extend_from_slice(&frame.samples),
                    None => break,
                },
            }
        }

        let energy = calculate_rms(&second);
        let peak = second.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );

        if record.is_some() {
            recorded.extend(second);
        }
    }

    handle.stop();

    if let Some(path) = record {
        let wav = samples_to_wav(&recorded, neural_link::voice::SAMPLE_RATE)?;
        std::fs::write(&path, wav)?;
        println!("\nRecorded {} samples to {}", recorded.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Test speaker output with a sine wave through the playback scheduler
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let graph = OutputGraph::new(PLAYBACK_SAMPLE_RATE, 0.8).shared();
    let mut scheduler = PlaybackScheduler::new(graph.clone());
    let mut handle = CpalOutput.open(graph)?;

    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let rate = PLAYBACK_SAMPLE_RATE as f32;

    // Two one-second chunks back to back exercise gapless scheduling
    for chunk in 0..2u32 {
        #[allow(clippy::cast_precision_loss)]
        let samples: Vec<f32> = (0..PLAYBACK_SAMPLE_RATE)
            .map(|i| {
                let t = (chunk * PLAYBACK_SAMPLE_RATE + i) as f32 / rate;
                (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
            })
            .collect();
        let scheduled = scheduler.schedule_chunk(AudioBuffer::mono(samples, PLAYBACK_SAMPLE_RATE));
        println!(
            "chunk {} scheduled at {:.2}s for {:.2}s",
            chunk + 1,
            scheduled.start,
            scheduled.duration
        );
    }

    tokio::time::sleep(Duration::from_millis(2200)).await;
    scheduler.shutdown();
    handle.stop();

    println!("Done! Did you hear the tone?");
    Ok(())
}
