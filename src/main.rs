//! # Recall CLI (`recall`)
//!
//! The `recall` binary drives the service and its pipelines:
//!
//! | Command | Description |
//! |---------|-------------|
//! | `recall init` | Create the SQLite database and run schema migrations |
//! | `recall serve` | Start the HTTP service and push channel |
//! | `recall sync <source> --user <id>` | Run one ingestion sync to completion |
//! | `recall embed pending` | Embed one batch of flagged documents |
//! | `recall embed drain` | Embed until no flagged documents remain |
//! | `recall search "<query>" --user <id>` | Debug retrieval from the terminal |
//!
//! Configuration comes from the environment (a `.env` file is loaded at
//! startup). The process exits non-zero when the database cannot be
//! bootstrapped; otherwise it runs until interrupted, draining background
//! tasks before closing the listener.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use recall::bus::ProgressBus;
use recall::chat::ChatService;
use recall::config::Config;
use recall::connector::ConnectorRegistry;
use recall::connector_email::EmailConnector;
use recall::credentials::CredentialStore;
use recall::embed_pipeline::EmbeddingPipeline;
use recall::embedding::HttpEmbedder;
use recall::llm::HttpLlm;
use recall::models::DocumentSource;
use recall::rag::RagPipeline;
use recall::ranker::RankOptions;
use recall::server::{build_router, AppState};
use recall::store::DocumentStore;
use recall::sync::{SyncCoordinator, SyncMode};
use recall::vector_search::{SearchOptions, VectorSearch};
use recall::{db, migrate, query};

#[derive(Parser)]
#[command(
    name = "recall",
    about = "Personal retrieval-augmented question answering over your own data",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and run schema migrations.
    Init,
    /// Start the HTTP service.
    Serve,
    /// Run one sync for a source and wait for it to finish.
    Sync {
        /// Source to sync: email, calendar, or music.
        source: String,
        /// Owning user id.
        #[arg(long)]
        user: String,
        /// Resume from the last successful cursor instead of a full run.
        #[arg(long)]
        incremental: bool,
        /// Only fetch records on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,
    },
    /// Embedding maintenance.
    Embed {
        #[command(subcommand)]
        command: EmbedCommands,
    },
    /// Run retrieval from the terminal (debugging aid).
    Search {
        query: String,
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Print the per-signal scoring breakdown.
        #[arg(long)]
        explain: bool,
    },
}

#[derive(Subcommand)]
enum EmbedCommands {
    /// Embed one batch of flagged documents.
    Pending {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Embed until no flagged documents remain.
    Drain,
}

/// Long-lived services constructed once at startup and shared by
/// reference; no hidden globals.
struct Services {
    store: DocumentStore,
    coordinator: Arc<SyncCoordinator>,
    pipeline: Arc<EmbeddingPipeline>,
    chat: Arc<ChatService>,
    search: Arc<VectorSearch>,
    bus: ProgressBus,
}

async fn build_services(config: &Config) -> anyhow::Result<Services> {
    let pool = db::connect(&config.db)
        .await
        .context("database bootstrap failed")?;
    migrate::run_migrations(&pool)
        .await
        .context("database migrations failed")?;

    let store = DocumentStore::new(pool.clone());
    let credentials = CredentialStore::new(pool);
    let bus = ProgressBus::new();

    let embedder = Arc::new(
        HttpEmbedder::new(&config.embedding).context("embedding provider init failed")?,
    );
    let pipeline = Arc::new(EmbeddingPipeline::new(
        store.clone(),
        embedder.clone(),
        bus.clone(),
        config.embedding.batch_size,
    ));

    let mut connectors = ConnectorRegistry::new();
    connectors.register(Arc::new(EmailConnector::new(&config.email, credentials)));

    let coordinator = Arc::new(SyncCoordinator::new(
        store.clone(),
        connectors,
        Arc::clone(&pipeline),
        bus.clone(),
    ));

    let search = Arc::new(VectorSearch::new(store.clone(), embedder));
    let rag = Arc::new(RagPipeline::new(
        Arc::clone(&search),
        config.retrieval.clone(),
        bus.clone(),
    ));
    let llm = Arc::new(HttpLlm::new(&config.llm).context("llm provider init failed")?);
    let chat = Arc::new(ChatService::new(
        store.clone(),
        rag,
        llm,
        bus.clone(),
    ));

    Ok(Services {
        store,
        coordinator,
        pipeline,
        chat,
        search,
        bus,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("configuration error")?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config.db)
                .await
                .context("database bootstrap failed")?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("database initialized at {}", config.db.path.display());
            Ok(())
        }
        Commands::Serve => serve(config).await,
        Commands::Sync {
            source,
            user,
            incremental,
            since,
        } => run_sync(config, &source, &user, incremental, since).await,
        Commands::Embed { command } => run_embed(config, command).await,
        Commands::Search {
            query,
            user,
            limit,
            explain,
        } => run_search(config, &query, &user, limit, explain).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let services = build_services(&config).await?;
    let shutdown = CancellationToken::new();

    // Optional periodic embedding trigger.
    if let Some(period) = config.embedding.schedule {
        let pipeline = Arc::clone(&services.pipeline);
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // immediate first tick is skipped
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = pipeline.process_pending(None).await {
                            warn!(error = %e, "scheduled embedding run failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
        info!(period_secs = period.as_secs(), "periodic embedding trigger enabled");
    }

    let state = AppState {
        config: Arc::new(config.clone()),
        store: services.store,
        coordinator: services.coordinator,
        pipeline: services.pipeline,
        chat: services.chat,
        bus: services.bus,
        shutdown: shutdown.clone(),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    info!("listening on http://{}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, draining background tasks");
            shutdown.cancel();
        })
        .await
        .context("server error")?;

    info!("server stopped");
    Ok(())
}

async fn run_sync(
    config: Config,
    source: &str,
    user: &str,
    incremental: bool,
    since: Option<String>,
) -> anyhow::Result<()> {
    let services = build_services(&config).await?;
    let source = DocumentSource::parse(source)?;
    let mode = if incremental {
        SyncMode::Incremental
    } else {
        SyncMode::Full
    };
    let since = since
        .map(|raw| {
            chrono::NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .map(|d| d.and_hms_opt(0, 0, 0).expect("valid midnight").and_utc())
                .with_context(|| format!("invalid --since date '{raw}'"))
        })
        .transpose()?;

    let cancel = CancellationToken::new();
    let sync_id = services
        .coordinator
        .start_sync(user, source, mode, since, cancel)
        .await?;
    println!("sync {source} started ({sync_id})");

    // The run happens on a background task; poll the log until terminal.
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let log = services
            .store
            .get_sync_log(&sync_id)
            .await?
            .context("sync log disappeared")?;
        if log.status.is_terminal() {
            println!("  status: {}", log.status.as_str());
            println!("  fetched: {}", log.documents_fetched);
            println!("  stored: {}", log.documents_stored);
            if let Some(error) = log.error_message {
                println!("  error: {error}");
            }
            break;
        }
    }
    Ok(())
}

async fn run_embed(config: Config, command: EmbedCommands) -> anyhow::Result<()> {
    let services = build_services(&config).await?;
    match command {
        EmbedCommands::Pending { limit } => {
            let outcome = services.pipeline.process_pending(limit).await?;
            println!("embed pending");
            println!("  embedded: {}", outcome.processed);
            println!("  failed: {}", outcome.failed);
            println!("  tokens: {}", outcome.total_tokens);
        }
        EmbedCommands::Drain => {
            let cancel = CancellationToken::new();
            let outcome = services
                .pipeline
                .drain_all_pending(None, &cancel)
                .await?;
            println!("embed drain");
            println!("  embedded: {}", outcome.processed);
            println!("  failed: {}", outcome.failed);
            println!("  tokens: {}", outcome.total_tokens);
        }
    }
    Ok(())
}

async fn run_search(
    config: Config,
    raw_query: &str,
    user: &str,
    limit: usize,
    explain: bool,
) -> anyhow::Result<()> {
    let services = build_services(&config).await?;
    let processed = query::process(raw_query)?;

    let options = SearchOptions {
        top_k: limit.max(1),
        min_similarity: config.retrieval.default_min_similarity,
        filters: recall::models::SearchFilters {
            source: processed.filters.source,
            doc_type: None,
            author: processed.filters.author.clone(),
            time_range: processed.filters.time_range.clone(),
        },
    };

    let hits = if processed.keywords.len() >= config.retrieval.hybrid_keyword_threshold {
        services
            .search
            .hybrid_search(user, raw_query, &processed.keywords, &options)
            .await?
    } else {
        services
            .search
            .search_with_expansion(user, raw_query, &options)
            .await?
    };

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    let ranker = recall::ranker::Ranker::new(&config.retrieval);
    let ranked = ranker.rank(
        hits,
        &processed,
        &RankOptions {
            diversify: true,
            diversity_threshold: None,
            intent_source: processed.intent.source(),
        },
    );

    for (i, result) in ranked.iter().enumerate() {
        let title = result.hit.title.as_deref().unwrap_or("(untitled)");
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            result.final_score,
            result.hit.source,
            title
        );
        println!("    date: {}", result.hit.timestamp.format("%Y-%m-%d"));
        println!("    id: {}", result.hit.document_id);
        if explain {
            let breakdown = ranker.explain(result);
            println!(
                "    signals: vector={:.3} recency={:.3} keyword={:.3} source={:.3} length={:.3}",
                breakdown.signals.vector,
                breakdown.signals.recency,
                breakdown.signals.keyword,
                breakdown.signals.source,
                breakdown.signals.length
            );
        }
        println!();
    }

    Ok(())
}
