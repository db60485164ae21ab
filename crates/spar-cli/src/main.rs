//! Spar CLI - simulated voice-practice pipeline
//!
//! Usage:
//!   spar init                 Write a default spar.toml
//!   spar serve                Serve the HTTP API with in-process workers
//!   spar worker               Run a standalone worker loop
//!   spar packs                List the builtin content packs

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use spar_core::{CoachingNote, Emotion, SparConfig};
use spar_llm::ChatClient;
use spar_pipeline::{
    default_worker_id, AnalysisRequest, CoachingAnalyst, FsAudioStore, Ops, Pipeline,
    TemplateAnalyst, Worker,
};
use spar_policy::{LineRewriter, PackLibrary};
use spar_speech::{SpeechGateway, SpeechInput};
use spar_store::MemoryStore;

#[derive(Parser)]
#[command(name = "spar")]
#[command(author, version, about = "Simulated voice-practice pipeline")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file
    #[arg(long, global = true, default_value = "spar.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,

    /// Serve the HTTP API, with workers in the same process
    Serve {
        /// Number of in-process worker loops
        #[arg(short = 'n', long, default_value = "1")]
        workers: usize,

        /// Directory for stored turn audio
        #[arg(long, default_value = "data/audio")]
        audio_dir: PathBuf,
    },

    /// Run a worker loop without the HTTP API
    Worker {
        /// Directory for stored turn audio
        #[arg(long, default_value = "data/audio")]
        audio_dir: PathBuf,

        /// Process one claim round and exit
        #[arg(long)]
        once: bool,
    },

    /// List the builtin content packs
    Packs,
}

/// Bridges the chat client into the policy engine's rewrite seam.
struct ChatRewriter {
    client: Arc<ChatClient>,
}

#[async_trait]
impl LineRewriter for ChatRewriter {
    async fn rewrite(
        &self,
        text: &str,
        emotion: Emotion,
        context: &str,
    ) -> spar_core::Result<String> {
        self.client.rewrite_line(text, emotion, context).await
    }
}

/// Bridges the chat client into the analysis stage.
struct ChatAnalyst {
    client: Arc<ChatClient>,
}

#[async_trait]
impl CoachingAnalyst for ChatAnalyst {
    async fn analyze(&self, request: &AnalysisRequest<'_>) -> spar_core::Result<CoachingNote> {
        self.client
            .coach_turn(
                request.objective,
                request.history,
                request.counterpart_text,
                request.operator_text,
            )
            .await
    }
}

struct Runtime {
    ops: Arc<Ops>,
    pipeline: Arc<Pipeline>,
    config: SparConfig,
}

/// Wire providers into a pipeline. Credentials come from the environment
/// variables named in the config; anything missing degrades to the
/// no-provider path rather than failing startup.
fn build_runtime(config: SparConfig, audio_dir: PathBuf) -> Runtime {
    let store = Arc::new(MemoryStore::new());
    let audio = Arc::new(FsAudioStore::new(audio_dir, "/audio"));
    let packs = Arc::new(PackLibrary::builtin());

    let gateway = Arc::new(SpeechGateway::new(&config.speech));
    let speech_input = SpeechInput::from_gateway(gateway.clone(), &config.speech);

    let chat = Arc::new(ChatClient::new(&config.llm));
    let analyst: Arc<dyn CoachingAnalyst> = if chat.has_credentials() {
        Arc::new(ChatAnalyst {
            client: chat.clone(),
        })
    } else {
        info!("no generative credential set, coaching uses pack templates");
        Arc::new(TemplateAnalyst::new(packs.clone()))
    };

    let mut pipeline = Pipeline::new(store, audio, speech_input, analyst, packs, &config)
        .with_synthesizer(gateway);
    if chat.has_credentials() {
        pipeline = pipeline.with_rewriter(Arc::new(ChatRewriter { client: chat }));
    }
    let pipeline = Arc::new(pipeline);
    let ops = Arc::new(Ops::new(pipeline.clone(), config.clone()));

    Runtime {
        ops,
        pipeline,
        config,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init => cmd_init(cli.config),
        Commands::Serve { workers, audio_dir } => cmd_serve(cli.config, workers, audio_dir).await,
        Commands::Worker { audio_dir, once } => cmd_worker(cli.config, audio_dir, once).await,
        Commands::Packs => cmd_packs(),
    }
}

fn cmd_init(path: PathBuf) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists, not overwriting", path.display());
    }
    SparConfig::write_default(&path).context("Failed to write default config")?;
    println!("Wrote {}", path.display());
    println!("Edit the provider sections, then run `spar serve`.");
    Ok(())
}

async fn cmd_serve(config_path: PathBuf, workers: usize, audio_dir: PathBuf) -> Result<()> {
    let config = SparConfig::load_or_default(&config_path)?;
    let runtime = build_runtime(config, audio_dir);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker_handles = Vec::new();
    for n in 0..workers.max(1) {
        let worker = Worker::new(
            runtime.pipeline.clone(),
            runtime.config.worker.clone(),
            format!("{}.{}", default_worker_id(), n),
        );
        let rx = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move { worker.run(rx).await }));
    }

    let server = tokio::spawn(spar_server::serve(runtime.ops.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("worker exited with error: {}", e),
            Err(e) => warn!("worker task panicked: {}", e),
        }
    }
    server.abort();
    Ok(())
}

async fn cmd_worker(config_path: PathBuf, audio_dir: PathBuf, once: bool) -> Result<()> {
    let config = SparConfig::load_or_default(&config_path)?;
    let run_once = once || config.worker.run_once;
    let runtime = build_runtime(config, audio_dir);

    let worker = Worker::new(
        runtime.pipeline.clone(),
        runtime.config.worker.clone(),
        default_worker_id(),
    );

    if run_once {
        let processed = worker.run_once().await?;
        println!("Processed {} job(s)", processed);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    match handle.await {
        Ok(result) => result?,
        Err(e) => warn!("worker task panicked: {}", e),
    }
    Ok(())
}

fn cmd_packs() -> Result<()> {
    let packs = PackLibrary::builtin();
    for pack in packs.categories() {
        println!("{} - {}", pack.category_id, pack.name);
        println!("  objective: {}", pack.objective);
        println!(
            "  {} intent(s), {} line(s), {} opening(s), {} coaching template(s)",
            pack.intents.len(),
            pack.lines.len(),
            pack.openings.len(),
            pack.coaching_templates.len()
        );
    }
    Ok(())
}
