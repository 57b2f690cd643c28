use std::{path::Path, sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

use stipula_app::cli::{Cli, Commands, ExtractArgs, JobsArgs, JobsCommands, WorkerArgs};
use stipula_app::config::{self, AppConfig};
use stipula_app::error::AppError;
use stipula_app::paths::AppPaths;
use stipula_app::pdf::PdfExtractor;
use stipula_app::services::{
    BlobStore, DefaultExtractionProvider, FsBlobStore, PipelineOrchestrator, PipelineRunStore,
    ReaperAction, ReaperConfig, RecordStore, ResultStore, RunStatus, Worker, build_extractor,
    reap_stale_runs,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(determine_log_level(&cli));

    if let Err(err) = run(cli).await {
        tracing::error!(error = %err, "stipula exited with an error");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn init_tracing(level: LevelFilter) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Serve(_)) => run_serve().await,
        Some(Commands::Worker(args)) => run_worker(args).await,
        Some(Commands::Extract(args)) => run_extract(args).await,
        Some(Commands::Jobs(args)) => run_jobs(args).await,
        None => {
            Cli::print_help();
            Ok(())
        }
    }
}

/// Shared storage handles behind every command.
struct AppContext {
    config: AppConfig,
    records: Arc<RecordStore>,
    runs: Arc<PipelineRunStore>,
    blob: Arc<FsBlobStore>,
}

async fn build_context() -> Result<AppContext, AppError> {
    let config = config::load()?;
    let paths = AppPaths::new(&config.storage.path)?;
    let records = Arc::new(RecordStore::open(&paths)?);
    let runs = Arc::new(PipelineRunStore::open(&paths)?);
    let blob = Arc::new(FsBlobStore::builder().paths(paths).build());

    blob.ensure_bucket(&config.storage.uploads_bucket).await?;
    blob.ensure_bucket(&config.storage.extractions_bucket)
        .await?;

    Ok(AppContext {
        config,
        records,
        runs,
        blob,
    })
}

fn build_provider(ctx: &AppContext) -> DefaultExtractionProvider {
    DefaultExtractionProvider::builder()
        .records(Arc::clone(&ctx.records))
        .runs(Arc::clone(&ctx.runs))
        .blob(Arc::clone(&ctx.blob) as Arc<dyn BlobStore>)
        .uploads_bucket(ctx.config.storage.uploads_bucket.clone())
        .max_file_size_bytes(ctx.config.pdf.max_size_bytes())
        .build()
}

fn build_orchestrator(ctx: &AppContext) -> Result<PipelineOrchestrator, AppError> {
    let pdf = PdfExtractor::builder()
        .max_size_bytes(ctx.config.pdf.max_size_bytes())
        .max_pages(ctx.config.pdf.max_pages)
        .build();
    let clauses = build_extractor(&ctx.config.llm)?;
    let result_store = ResultStore::builder()
        .blob(Arc::clone(&ctx.blob) as Arc<dyn BlobStore>)
        .records(Arc::clone(&ctx.records))
        .artifact_bucket(ctx.config.storage.extractions_bucket.clone())
        .model_name(ctx.config.llm.model.clone())
        .build();

    Ok(PipelineOrchestrator::builder()
        .text_extractor(Arc::new(pdf))
        .clause_extractor(Arc::new(clauses))
        .result_store(result_store)
        .blob(Arc::clone(&ctx.blob) as Arc<dyn BlobStore>)
        .records(Arc::clone(&ctx.records))
        .runs(Arc::clone(&ctx.runs))
        .uploads_bucket(ctx.config.storage.uploads_bucket.clone())
        .build())
}

async fn run_serve() -> Result<(), AppError> {
    let ctx = build_context().await?;
    let provider = Arc::new(build_provider(&ctx));
    stipula_server::serve(ctx.config.server.clone(), provider).await?;
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), AppError> {
    let ctx = build_context().await?;
    let orchestrator = Arc::new(build_orchestrator(&ctx)?);

    let concurrency = args
        .concurrency
        .unwrap_or(ctx.config.worker.concurrency)
        .max(1);
    let worker = Worker::builder()
        .orchestrator(orchestrator)
        .runs(Arc::clone(&ctx.runs))
        .records(Arc::clone(&ctx.records))
        .concurrency(concurrency)
        .poll_interval(Duration::from_millis(ctx.config.worker.poll_interval_ms))
        .build();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    });

    worker.run_until_shutdown(shutdown_rx).await;
    Ok(())
}

async fn run_extract(args: ExtractArgs) -> Result<(), AppError> {
    use stipula_server::ExtractionProvider;

    let ctx = build_context().await?;
    let bytes = read_input_file(&args.input)?;
    let filename = args
        .input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed.pdf".to_string());

    let provider = build_provider(&ctx);
    let accepted = provider
        .submit_document(filename, "application/pdf".to_string(), bytes.into())
        .await
        .map_err(|err| AppError::Config(err.to_string()))?;

    let orchestrator = build_orchestrator(&ctx)?;
    let report = orchestrator.run(&accepted.document_id).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if args.print_result
        && let Some(extraction) = ctx.records.get_extraction(&report.extraction_id)?
    {
        println!("{}", serde_json::to_string_pretty(&extraction.payload)?);
    }

    Ok(())
}

async fn run_jobs(args: JobsArgs) -> Result<(), AppError> {
    match args.command {
        JobsCommands::Status => jobs_status().await,
        JobsCommands::Reap => jobs_reap().await,
    }
}

async fn jobs_status() -> Result<(), AppError> {
    let ctx = build_context().await?;

    let pending = ctx.runs.count_by_status(RunStatus::Pending)?;
    let running = ctx.runs.count_by_status(RunStatus::Running)?;
    let completed = ctx.runs.count_by_status(RunStatus::Completed)?;
    let failed = ctx.runs.count_by_status(RunStatus::Failed)?;

    println!("run_status\tcount");
    println!("pending\t{pending}");
    println!("running\t{running}");
    println!("completed\t{completed}");
    println!("failed\t{failed}");

    Ok(())
}

async fn jobs_reap() -> Result<(), AppError> {
    let ctx = build_context().await?;

    let report = reap_stale_runs(&ctx.runs, &ReaperConfig::default(), ReaperAction::Both)?;
    if report.is_empty() {
        println!("no stale runs");
    } else {
        println!(
            "requeued {} run(s), failed {} run(s), skipped {}",
            report.requeued.len(),
            report.failed.len(),
            report.skipped
        );
    }

    Ok(())
}

fn read_input_file(path: &Path) -> Result<Vec<u8>, AppError> {
    std::fs::read(path).map_err(|source| AppError::Io {
        path: path.to_path_buf(),
        source,
    })
}
