use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use empath_gateway::api::ApiServerBuilder;
use empath_gateway::providers::{Embedder, rag};
use empath_gateway::{Config, Pipeline, PipelineConfig, Providers, SessionManager};

/// Empath - streaming voice-chat gateway
#[derive(Parser)]
#[command(name = "empath", version, about)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(short, long, env = "EMPATH_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(long, env = "EMPATH_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Synthesize text to a WAV file
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
        /// Output file
        #[arg(short, long, default_value = "tts_test.wav")]
        output: PathBuf,
    },
    /// Transcribe an audio file
    Transcribe {
        /// Audio file (wav, mp3, webm, ...)
        file: PathBuf,
    },
    /// Embed a newline-delimited text file into a retrieval index
    BuildIndex {
        /// Text file, one passage per line
        texts: PathBuf,
        /// Index file to write
        #[arg(short, long)]
        output: PathBuf,
        /// Passages per embeddings request
        #[arg(long, default_value = "64")]
        batch_size: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,empath_gateway=info",
        1 => "info,empath_gateway=debug",
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
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestTts { text, output } => test_tts(&config, &text, &output).await,
            Command::Transcribe { file } => transcribe(&config, &file).await,
            Command::BuildIndex {
                texts,
                output,
                batch_size,
            } => build_index(&config, &texts, &output, batch_size).await,
        };
    }

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        tts = ?config.tts.provider,
        "starting empath gateway"
    );

    let sessions = SessionManager::in_memory(&config.session.temp_dir, config.session.expiry)?;
    let sweeper = sessions.spawn_sweeper(config.session.sweep_interval);

    let pipeline = Pipeline::new(
        Providers::from_config(&config),
        sessions,
        PipelineConfig::from_config(&config),
    );

    let server = ApiServerBuilder::new(pipeline)
        .host(config.server.host.clone())
        .port(config.server.port)
        .max_body_bytes(config.session.max_audio_bytes)
        .build();

    // Run until interrupted
    server.run(shutdown_signal()).await?;
    sweeper.abort();

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutdown requested");
    }
}

fn pipeline_for(config: &Config) -> anyhow::Result<Pipeline> {
    let sessions = SessionManager::in_memory(&config.session.temp_dir, config.session.expiry)?;
    Ok(Pipeline::new(
        Providers::from_config(config),
        sessions,
        PipelineConfig::from_config(config),
    ))
}

/// Synthesize `text` and write it as WAV
async fn test_tts(config: &Config, text: &str, output: &Path) -> anyhow::Result<()> {
    println!("Testing TTS ({:?}) with text: \"{text}\"\n", config.tts.provider);

    let synthesizer = pipeline_for(config)?.synthesizer()?;
    let wav = synthesizer.synthesize_text(text).await?;
    tokio::fs::write(output, &wav).await?;

    println!("Wrote {} bytes to {}", wav.len(), output.display());
    Ok(())
}

/// Transcribe an audio file and print the text
async fn transcribe(config: &Config, file: &Path) -> anyhow::Result<()> {
    let audio = tokio::fs::read(file).await?;
    let file_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("audio.wav");

    let text = pipeline_for(config)?.transcribe(audio, file_name).await?;
    println!("{text}");
    Ok(())
}

/// Build a retrieval index from a text file
async fn build_index(
    config: &Config,
    texts: &Path,
    output: &Path,
    batch_size: usize,
) -> anyhow::Result<()> {
    let api_key = config
        .rag
        .api_key
        .clone()
        .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY is required to build an index"))?;

    let embedder = Embedder::new(
        reqwest::Client::new(),
        &config.rag.base_url,
        api_key,
        &config.rag.embedding_model,
    );

    let text = tokio::fs::read_to_string(texts).await?;
    let index = rag::build_index(&embedder, &text, batch_size.max(1)).await?;
    index.save(output)?;

    println!(
        "Indexed {} passages ({} dims) into {}",
        index.len(),
        index.dimension,
        output.display()
    );
    Ok(())
}
