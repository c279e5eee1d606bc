use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use venue_voice::api::ApiServer;
use venue_voice::bridge::{CartPublisher, HttpBroadcastBridge, NoopPublisher};
use venue_voice::session::{SessionComponents, SessionController};
use venue_voice::tools::HttpToolDispatcher;
use venue_voice::transport::{
    CredentialProvider, HttpCredentialProvider, StaticCredential, WebSocketConnector,
};
use venue_voice::voice::{
    CpalMicrophone, HttpSynthesizer, Lane, MicrophoneSource, SegmentRecognizer, SpeakerOutput,
    SpeechSynthesizer, Transcriber, calculate_energy,
};
use venue_voice::wake::{TerminationPhrases, WakeWordTable};
use venue_voice::Config;

/// Venue Voice - hands-free ordering assistant
#[derive(Parser)]
#[command(name = "venue-voice", version, about)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, env = "VENUE_CONFIG")]
    config: Option<PathBuf>,

    /// Control API port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Wait for a start request instead of listening immediately
    #[arg(long)]
    no_autostart: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test local filler speech
    TestTts {
        /// Text to speak
        #[arg(default_value = "One moment while I check that for you.")]
        text: String,
    },
    /// Check a transcript against the wake table and termination phrases
    WakeCheck {
        /// Transcript to test
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let filter = match cli.verbose {
        0 => "info,venue_voice=info",
        1 => "info,venue_voice=debug",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.api.port = port;
    }

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestTts { text } => test_tts(&config, &text).await,
            Command::WakeCheck { text } => {
                wake_check(&config, &text);
                Ok(())
            }
        };
    }

    serve(config, !cli.no_autostart).await
}

/// Run the orchestrator until Ctrl-C
async fn serve(config: Config, autostart: bool) -> anyhow::Result<()> {
    tracing::info!(
        model = %config.realtime.model,
        tools = %config.tools.base_url,
        bridge = config.bridge.url.is_some(),
        "starting venue voice"
    );

    let components = build_components(&config)?;
    let (controller, session) = SessionController::new(&config, components);
    let controller = tokio::spawn(controller.run());

    let api = ApiServer::new(session.clone(), config.api.port).spawn();

    if autostart {
        session.start()?;
        tracing::info!("venue voice ready, listening for the wake phrase");
    } else {
        tracing::info!("venue voice ready, waiting for a start request");
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            tracing::info!("shutting down");
        }
        result = api => {
            // The control API only returns on error
            result.context("control API task panicked")??;
        }
    }

    session.shutdown()?;
    controller.await.context("session controller panicked")?;
    Ok(())
}

fn build_components(config: &Config) -> anyhow::Result<SessionComponents> {
    let microphone: Arc<dyn MicrophoneSource> = Arc::new(CpalMicrophone::new()?);
    // Filler and remote replies mix on one device but clear independently
    let speaker = SpeakerOutput::new()?;

    let transcriber = Arc::new(Transcriber::new(&config.speech)?);
    let recognizer = SegmentRecognizer::new(Arc::clone(&microphone), transcriber);
    let synthesizer = HttpSynthesizer::new(&config.speech, Arc::new(speaker.lane(Lane::Filler)))?;

    let credentials: Arc<dyn CredentialProvider> =
        match (&config.realtime.credential_url, &config.realtime.api_key) {
            (Some(url), _) => Arc::new(HttpCredentialProvider::new(url.clone())),
            (None, Some(key)) => Arc::new(StaticCredential::new(key.clone())),
            (None, None) => anyhow::bail!(
                "no realtime credential configured; set OPENAI_API_KEY or VENUE_CREDENTIAL_URL"
            ),
        };

    let connector = WebSocketConnector::new(&config.realtime.url, &config.realtime.model)
        .with_output(Arc::new(speaker.lane(Lane::Remote)));

    let publisher: Arc<dyn CartPublisher> = match &config.bridge.url {
        Some(url) => Arc::new(HttpBroadcastBridge::new(url.clone())),
        None => Arc::new(NoopPublisher),
    };

    Ok(SessionComponents {
        recognizer: Box::new(recognizer),
        microphone,
        connector: Arc::new(connector),
        credentials,
        synthesizer: Arc::new(synthesizer),
        dispatcher: Arc::new(HttpToolDispatcher::new(&config.tools)),
        publisher,
    })
}

/// Print a live level meter from the microphone
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let microphone = CpalMicrophone::new()?;
    let mut lease = microphone.open()?;
    let mut frames = lease
        .take_frames()
        .context("microphone lease has no frame stream")?;

    let mut second = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.tick().await;
    let mut elapsed = 0;

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => second.extend(frame),
                None => break,
            },
            _ = tick.tick() => {
                elapsed += 1;
                let energy = calculate_energy(&second);
                let peak = second.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let meter_len = (energy * 100.0).min(50.0) as usize;
                let meter = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);
                println!("[{elapsed:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]");

                second.clear();
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
            }
        }
    }

    lease.release();
    println!("\nMicrophone test complete!");
    Ok(())
}

/// Speak one sentence through the filler synthesizer
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Speaking: {text}");
    let speaker = SpeakerOutput::new()?;
    let synthesizer = HttpSynthesizer::new(&config.speech, Arc::new(speaker.lane(Lane::Filler)))?;
    synthesizer.speak(text).await?;
    println!("Done.");
    Ok(())
}

fn wake_check(config: &Config, text: &str) {
    let table = WakeWordTable::from_config(&config.wake);
    let termination = TerminationPhrases::from_config(&config.wake);

    match table.find_match(text) {
        Some(wake) => println!("wake: matched {:?} via {:?}", wake.canonical, wake.variant),
        None => println!("wake: no match"),
    }
    match termination.find(text) {
        Some(phrase) => println!("termination: matched {phrase:?}"),
        None => println!("termination: no match"),
    }
}
