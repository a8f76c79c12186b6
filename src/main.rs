use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lockin_voice::channels::PullChannel;
use lockin_voice::daemon::load_phrases;
use lockin_voice::feedback::LatestFeedback;
use lockin_voice::voice::{ElevenLabsSynthesizer, SpeakerOutput, SpeechPlayer};
use lockin_voice::{Config, Daemon};

/// Lock In - speaks productivity feedback out loud
#[derive(Parser)]
#[command(name = "lockin", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/lockin/config.toml)
    #[arg(short, long, env = "LOCKIN_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Receive feedback without speaking it
    #[arg(long)]
    no_speech: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Synthesize and play one utterance
    Say {
        /// Text to speak
        #[arg(default_value = "Lock in!")]
        text: String,
    },
    /// List phrase table categories
    Phrases,
    /// Fetch the latest feedback once
    Poll,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,lockin_voice=info",
        1 => "info,lockin_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref()).context("invalid configuration")?;
    if cli.no_speech {
        config.disable_speech();
    }

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Say { text } => say(&config, &text).await,
            Command::Phrases => {
                list_phrases(&config);
                Ok(())
            }
            Command::Poll => poll(&config).await,
        };
    }

    tracing::info!(
        backend = %config.backend.url,
        speech_enabled = config.speech.enabled,
        "starting lockin"
    );

    Daemon::new(config).run().await?;
    Ok(())
}

async fn say(config: &Config, text: &str) -> anyhow::Result<()> {
    let api_key = config
        .voice
        .api_key
        .as_deref()
        .context("ELEVENLABS_API_KEY is not set")?;

    let synthesizer = ElevenLabsSynthesizer::new(api_key, config.voice.voice_id.as_str())?
        .with_base_url(config.voice.base_url.as_str())
        .with_model(config.voice.model_id.as_str())
        .with_settings(config.voice.settings);
    let player = SpeechPlayer::new(Arc::new(synthesizer), Arc::new(SpeakerOutput::new()));

    player.speak(text).await?;
    player.wait_finished().await;
    Ok(())
}

fn list_phrases(config: &Config) {
    let table = load_phrases(config);
    for (category, count) in table.categories() {
        println!("{category:<12} {count}");
    }
}

async fn poll(config: &Config) -> anyhow::Result<()> {
    let channel = PullChannel::new(
        reqwest::Client::new(),
        config.backend.poll_url.as_str(),
        LatestFeedback::new(),
    );

    match channel.poll_once().await? {
        Some(event) => println!("{}", serde_json::to_string_pretty(&event)?),
        None => println!("no new feedback"),
    }
    Ok(())
}
