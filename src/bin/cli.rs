//! Smart-Fork CLI
//!
//! Command-line interface over the indexer, registry, and orchestrator.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use smart_fork::embedding::{create_encoder, Embedder, EmbeddingCache};
use smart_fork::error::Result;
use smart_fork::indexer::BackgroundIndexer;
use smart_fork::orchestrator::{QueryFilter, SearchOrchestrator};
use smart_fork::registry::SessionRegistry;
use smart_fork::scorer::Scorer;
use smart_fork::setup::{InterruptFlag, SetupEngine};
use smart_fork::storage::VectorIndex;
use smart_fork::SmartForkConfig;

#[derive(Parser)]
#[command(name = "smart-fork")]
#[command(about = "Search and resume prior conversational sessions")]
#[command(version)]
struct Cli {
    /// Root directory containing session transcripts
    #[arg(long, env = "SMART_FORK_SESSION_ROOT")]
    session_root: PathBuf,

    /// Path to a TOML configuration file
    #[arg(long, env = "SMART_FORK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run (or resume) the initial full scan of the session root
    Setup,
    /// Index a single session file synchronously
    Index {
        /// Path to the session file
        path: PathBuf,
    },
    /// Search prior sessions for a query
    Search {
        query: String,
        /// Maximum sessions to return
        #[arg(short, long)]
        top_n: Option<usize>,
        /// Restrict to a project tag
        #[arg(short, long)]
        project: Option<String>,
    },
    /// Start the background watcher and block until interrupted
    Watch,
    /// Show registry and index statistics
    Stats,
}

fn load_config(path: Option<&PathBuf>) -> Result<SmartForkConfig> {
    let config = match path {
        Some(p) => SmartForkConfig::load_from_file(p)?,
        None => SmartForkConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

struct Engines {
    indexer: Arc<BackgroundIndexer>,
    vector_index: Arc<VectorIndex>,
    registry: Arc<SessionRegistry>,
    config: SmartForkConfig,
}

fn build_engines(config: SmartForkConfig) -> Result<Engines> {
    let storage_dir = config.storage_dir_expanded();
    std::fs::create_dir_all(&storage_dir)?;

    let api_key = std::env::var("OPENAI_API_KEY").ok();
    let embedding_config = config.embedding.clone();
    let cache = EmbeddingCache::open(&storage_dir.join("embedding_cache/cache.json"));
    let embedder = Arc::new(Embedder::new(
        embedding_config.clone(),
        config.memory.max_memory_mb,
        cache,
        Box::new(move || create_encoder(&embedding_config, api_key.clone()).expect("embedding encoder")),
    ));

    let vector_index = Arc::new(VectorIndex::open(&storage_dir, config.embedding.dimension)?);
    let registry = Arc::new(SessionRegistry::open(&storage_dir.join("session-registry.json")));

    let indexer = Arc::new(BackgroundIndexer::new(
        embedder,
        vector_index.clone(),
        registry.clone(),
        config.chunking.clone(),
        config.indexing.clone(),
    ));

    Ok(Engines {
        indexer,
        vector_index,
        registry,
        config,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let engines = build_engines(config)?;

    match cli.command {
        Commands::Setup => {
            let storage_dir = engines.config.storage_dir_expanded();
            let setup = SetupEngine::new(storage_dir);
            let interrupt = InterruptFlag::new();

            {
                let interrupt = interrupt.clone();
                ctrlc_handler(move || interrupt.stop());
            }

            let outcome = setup.run(&engines.indexer, &cli.session_root, &interrupt, |processed, total| {
                println!("indexed {processed}/{total}");
            })?;

            if outcome.interrupted {
                println!("setup interrupted at {}/{} files; re-run to resume", outcome.processed_files, outcome.total_files);
            } else {
                println!("setup complete: {} files indexed", outcome.processed_files);
            }
        }

        Commands::Index { path } => {
            let outcome = engines.indexer.index_file(&path)?;
            println!(
                "indexed session {} ({} chunks, {} messages)",
                outcome.session_id, outcome.chunks_added, outcome.message_count
            );
        }

        Commands::Search { query, top_n, project } => {
            let storage_dir = engines.config.storage_dir_expanded();
            let api_key = std::env::var("OPENAI_API_KEY").ok();
            let embedding_config = engines.config.embedding.clone();
            let cache = EmbeddingCache::open(&storage_dir.join("embedding_cache/cache.json"));
            let embedder = Embedder::new(
                embedding_config.clone(),
                engines.config.memory.max_memory_mb,
                cache,
                Box::new(move || create_encoder(&embedding_config, api_key.clone()).expect("embedding encoder")),
            );
            let vector_index = VectorIndex::open(&storage_dir, engines.config.embedding.dimension)?;
            let orchestrator = SearchOrchestrator::new(
                embedder,
                vector_index,
                engines.registry.clone(),
                Scorer::from_search_config(&engines.config.search),
                engines.config.search.clone(),
            );

            let results = orchestrator.search(&query, top_n, QueryFilter { project })?;

            if results.is_empty() {
                println!("no matching sessions");
            } else {
                for (rank, result) in results.iter().enumerate() {
                    println!(
                        "{}. session {} (score {:.3})",
                        rank + 1,
                        result.session_id,
                        result.score.final_score
                    );
                    println!("   resume: {}", result.resume_terminal_cmd);
                    println!("   fork:   {}", result.resume_in_session_cmd);
                    println!("   {}", result.preview);
                }
            }
        }

        Commands::Watch => {
            engines.indexer.start(cli.session_root.clone())?;
            println!("watching {} (ctrl-c to stop)", cli.session_root.display());

            let running = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
            {
                let running = running.clone();
                ctrlc_handler(move || running.store(false, std::sync::atomic::Ordering::SeqCst));
            }
            while running.load(std::sync::atomic::Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
            engines.indexer.stop();
        }

        Commands::Stats => {
            let registry_stats = engines.registry.stats();
            let index_stats = engines.vector_index.stats()?;
            println!("sessions:  {}", registry_stats.total_sessions);
            println!("messages:  {}", registry_stats.total_messages);
            println!("chunks:    {}", registry_stats.total_chunks);
            println!("vectors:   {}", index_stats.total_chunks);
        }
    }

    Ok(())
}

/// Install a Ctrl-C handler on a dedicated single-threaded runtime, so
/// `setup`/`watch` can stay plain synchronous loops (spec §4.10 "user
/// interrupt", §4.8 "Cancellation").
fn ctrlc_handler(on_interrupt: impl FnOnce() + Send + 'static) {
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("ctrl-c runtime");
        rt.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_interrupt();
            }
        });
    });
}
