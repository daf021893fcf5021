use std::io::IsTerminal;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bible_voice::api::ApiServer;
use bible_voice::config::ConfigStore;
use bible_voice::voice::{AudioCapture, SpeechDispatcher, SpeechHandle, calculate_energy};
use bible_voice::{Config, Daemon, console};

/// Bible Voice - say "hey bible" and ask for a story
#[derive(Parser)]
#[command(name = "bible-voice", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test the speech command
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Interactive first-run setup
    Setup,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let filter = match cli.verbose {
        0 => "info,bible_voice=info",
        1 => "info,bible_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
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
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestTts { text } => test_tts(&text).await,
            Command::Setup => bible_voice::setup::run_setup(),
        };
    }

    let store = ConfigStore::default_location()
        .unwrap_or_else(|| ConfigStore::new(".config/bible-voice/config.toml"));
    let config = Config::load_from(&store)?;
    tracing::debug!(?config, "loaded configuration");

    if config.requires_setup {
        tracing::warn!(
            path = %store.path().display(),
            "no API key yet - run `bible-voice setup` or submit one from the browser"
        );
    }

    let server = config.server.clone();
    let daemon = Daemon::new(config, store);
    let handle = daemon.handle();

    if server.enabled {
        let api = ApiServer::new(handle.clone(), &server);
        tokio::spawn(async move {
            if let Err(e) = api.run().await {
                tracing::error!(error = %e, "websocket bridge stopped");
            }
        });
    }

    if std::io::stdin().is_terminal() {
        let console_handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = console::run(console_handle).await {
                tracing::warn!(error = %e, "console input closed");
            }
        });
    }

    tracing::info!("bible voice ready - press Enter or use the browser to start listening");

    daemon
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::new()?;
    capture.start()?;

    let sample_rate = capture.sample_rate();
    println!("Sample rate: {sample_rate} Hz");
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.peek_buffer();
        let energy = calculate_energy(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );

        capture.clear_buffer();
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check your input device and its level.");

    Ok(())
}

/// Speak `text` with the configured command
async fn test_tts(text: &str) -> anyhow::Result<()> {
    let config = Config::load()?;
    let command = config.voice.speak_command.clone();
    println!("Speaking with `{} -f <file>`...", command.program);

    let dispatcher = SpeechDispatcher::new(command, config.voice.interrupt_grace)?;
    let mut job = dispatcher.spawn(text)?;
    job.wait().await?;

    println!("Done. If you heard nothing, check `speak_command` in the config file.");
    Ok(())
}
