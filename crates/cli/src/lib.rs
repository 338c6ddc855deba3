use anyhow::{Context as AnyhowContext, Result};
use catalog_indexer::{CatalogReconciler, JsonCatalog, SyncStats};
use catalog_search::{validate_request, QueryEngine, SearchPath};
use catalog_vector_store::{
    redact_url, EmbeddingModel, EmbeddingMode, EngineContext, IndexCapability, MemoryBackend,
    ProductStore, RedisBackend, SearchHit,
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

mod config;

pub use config::{EngineConfig, Overrides, MEMORY_URL_SCHEME};

/// Exit status for rejected search parameters.
pub const EXIT_INVALID_REQUEST: i32 = 2;

fn print_stdout(text: &str) -> Result<()> {
    use std::io::Write;

    let mut stdout = io::stdout().lock();
    if let Err(err) = stdout
        .write_all(text.as_bytes())
        .and_then(|_| stdout.write_all(b"\n"))
        .and_then(|_| stdout.flush())
    {
        if err.kind() == io::ErrorKind::BrokenPipe {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    print_stdout(&text)
}

#[derive(Parser)]
#[command(name = "catalog-search")]
#[command(about = "Semantic product search over a Redis vector store", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file
    #[arg(long, global = true, env = "CATALOG_CONFIG")]
    config: Option<PathBuf>,

    /// Record store URL (`memory://` for an in-process store)
    #[arg(long, global = true, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Embedding backend: onnx|stub
    #[arg(long, global = true, env = "CATALOG_EMBEDDING_MODE")]
    embed_mode: Option<EmbeddingMode>,

    /// Directory holding `<model_id>/model.onnx` and `<model_id>/tokenizer.json`
    #[arg(long, global = true, env = "CATALOG_MODEL_DIR")]
    model_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors (stdout is reserved for JSON)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the vector store from the catalog export
    Resync(ResyncArgs),

    /// Search products by meaning
    Search(SearchArgs),

    /// Check the record store, the vector index and the embedding model
    Doctor(DoctorArgs),
}

#[derive(Args)]
struct ResyncArgs {
    /// JSON array export of the product table (overrides `sync.catalog_path`)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Most products fetched in this run
    #[arg(long)]
    batch_cap: Option<usize>,

    /// Pretty-print JSON output
    #[arg(long)]
    pretty: bool,
}

#[derive(Args)]
struct SearchArgs {
    /// Query text
    query: String,

    /// Number of results (1-50)
    #[arg(short, long, default_value_t = 5)]
    k: usize,

    /// Resync from this catalog export before searching
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Include which path answered the query
    #[arg(long)]
    explain: bool,

    /// Pretty-print JSON output
    #[arg(long)]
    pretty: bool,
}

#[derive(Args)]
struct DoctorArgs {
    /// Output JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct ExplainedSearch<'a> {
    path: SearchPath,
    hits: &'a [SearchHit],
}

#[derive(Serialize)]
struct DoctorReport {
    store_url: String,
    store_ok: bool,
    store_error: Option<String>,
    index_name: String,
    index: Option<IndexCapability>,
    embedding_mode: EmbeddingMode,
    embedding_model: String,
    embedding_ok: bool,
    embedding_error: Option<String>,
}

impl DoctorReport {
    fn ok(&self) -> bool {
        self.store_ok
            && self.embedding_ok
            && !matches!(self.index, Some(IndexCapability::Error(_)))
    }
}

fn init_logging(cli: &Cli) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    if !cli.verbose {
        builder.filter_module("ort", log::LevelFilter::Off);
    }
    builder.target(env_logger::Target::Stderr).init();
}

/// Build the engine handle. A model that fails to load aborts startup.
async fn open_context(config: &EngineConfig) -> Result<EngineContext> {
    if config.uses_memory_store() {
        let embedder = EmbeddingModel::from_config(&config.embedding)
            .context("Failed to initialize embedding model")?;
        let store = ProductStore::new(Arc::new(MemoryBackend::new()), config.redis.index_spec());
        log::info!("Using in-process record store");
        return Ok(EngineContext::new(embedder, store));
    }
    EngineContext::connect(&config.redis, &config.embedding)
        .await
        .context("Failed to initialize search engine")
}

async fn run_resync(ctx: &EngineContext, config: &EngineConfig) -> Result<SyncStats> {
    let path = config
        .sync
        .catalog_path
        .clone()
        .context("No catalog export given (use --catalog or sync.catalog_path)")?;
    let catalog = Arc::new(JsonCatalog::load(&path).await?);
    let reconciler = CatalogReconciler::new(ctx, catalog, config.sync.clone());
    Ok(reconciler.run().await?)
}

async fn cmd_resync(args: ResyncArgs, mut config: EngineConfig) -> Result<()> {
    config.apply(Overrides {
        catalog_path: args.catalog,
        batch_cap: args.batch_cap,
        ..Overrides::default()
    });
    let ctx = open_context(&config).await?;
    let result = run_resync(&ctx, &config).await;
    ctx.shutdown();
    print_json(&result?, args.pretty)
}

async fn cmd_search(args: SearchArgs, mut config: EngineConfig) -> Result<()> {
    if let Err(err) = validate_request(&args.query, args.k) {
        eprintln!("error: {err}");
        std::process::exit(EXIT_INVALID_REQUEST);
    }

    config.apply(Overrides {
        catalog_path: args.catalog.clone(),
        ..Overrides::default()
    });
    let ctx = open_context(&config).await?;

    if args.catalog.is_some() {
        // Startup sync: a failed resync still leaves whatever is stored searchable.
        if let Err(err) = run_resync(&ctx, &config).await {
            log::error!("Resync before search failed: {err:#}");
        }
    }

    let engine = QueryEngine::new(&ctx, config.search.clone());
    let outcome = engine.search_with_path(&args.query, args.k).await;
    drop(engine);
    ctx.shutdown();

    let outcome = outcome.context("Search failed")?;
    if args.explain {
        print_json(
            &ExplainedSearch {
                path: outcome.path,
                hits: &outcome.hits,
            },
            args.pretty,
        )
    } else {
        print_json(&outcome.hits, args.pretty)
    }
}

async fn cmd_doctor(args: DoctorArgs, config: EngineConfig) -> Result<()> {
    let mut report = DoctorReport {
        store_url: redact_url(&config.redis.url),
        store_ok: false,
        store_error: None,
        index_name: config.redis.index_name.clone(),
        index: None,
        embedding_mode: config.embedding.mode,
        embedding_model: config.embedding.model_id.clone(),
        embedding_ok: false,
        embedding_error: None,
    };

    match EmbeddingModel::from_config(&config.embedding) {
        Ok(model) => match model.embed("doctor").await {
            Ok(_) => report.embedding_ok = true,
            Err(err) => report.embedding_error = Some(err.to_string()),
        },
        Err(err) => report.embedding_error = Some(err.to_string()),
    }

    let store = if config.uses_memory_store() {
        Ok(ProductStore::new(
            Arc::new(MemoryBackend::new()),
            config.redis.index_spec(),
        ))
    } else {
        RedisBackend::connect(&config.redis.url)
            .await
            .map(|backend| ProductStore::new(Arc::new(backend), config.redis.index_spec()))
    };
    match store {
        Ok(store) => match store.ping().await {
            Ok(()) => {
                report.store_ok = true;
                report.index = Some(match store.ensure_index().await {
                    Ok(capability) => capability,
                    Err(err) => IndexCapability::Error(err.to_string()),
                });
            }
            Err(err) => report.store_error = Some(err.to_string()),
        },
        Err(err) => report.store_error = Some(err.to_string()),
    }

    let ok = report.ok();
    if args.json {
        print_json(&report, true)?;
    } else {
        eprintln!("Store: {}", report.store_url);
        match &report.store_error {
            None => eprintln!("Store connection: ok"),
            Some(err) => eprintln!("Store connection: error ({err})"),
        }
        match &report.index {
            Some(IndexCapability::Supported) => {
                eprintln!("Vector index {}: supported", report.index_name)
            }
            Some(IndexCapability::Unsupported) => eprintln!(
                "Vector index {}: unsupported (searches will scan)",
                report.index_name
            ),
            Some(IndexCapability::Error(err)) => {
                eprintln!("Vector index {}: error ({err})", report.index_name)
            }
            None => eprintln!("Vector index {}: not probed", report.index_name),
        }
        eprintln!(
            "Embedding mode/model: {} / {}",
            report.embedding_mode, report.embedding_model
        );
        match &report.embedding_error {
            None => eprintln!("Embedding model: ok"),
            Some(err) => eprintln!("Embedding model: error ({err})"),
        }
    }

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

pub async fn main_entry() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let mut config = EngineConfig::load(cli.config.as_deref())?;
    config.apply(Overrides {
        redis_url: cli.redis_url.clone(),
        embed_mode: cli.embed_mode,
        model_dir: cli.model_dir.clone(),
        ..Overrides::default()
    });

    match cli.command {
        Commands::Resync(args) => cmd_resync(args, config).await,
        Commands::Search(args) => cmd_search(args, config).await,
        Commands::Doctor(args) => cmd_doctor(args, config).await,
    }
}
