use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use ragline::cli::{Cli, Commands, ConfigAction};
use ragline::collection::Collection;
use ragline::config::{Config, ConfigHandle, ConfigValidator};
use ragline::error::{RaglineError, Result};
use ragline::evaluation::{benchmark_modes, EvaluationLog, EvaluationSet, ModelEvaluator};
use ragline::ingest::{IngestEvent, IngestStatus};
use ragline::model::Document;
use ragline::retrieval::{SearchFilters, SearchMode, SearchRequest};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose);

    match cli.command {
        Commands::Serve { bind } => {
            cmd_serve(cli.config, cli.profile, bind).await?;
        }
        Commands::Ingest { paths, json } => {
            cmd_ingest(cli.config, cli.profile, &paths, json).await?;
        }
        Commands::Search {
            query,
            k,
            mode,
            weight,
            language,
            json,
        } => {
            cmd_search(cli.config, cli.profile, query, k, mode, weight, language, json).await?;
        }
        Commands::Evaluate {
            file,
            model,
            output,
            benchmark,
            json,
        } => {
            cmd_evaluate(cli.config, cli.profile, &file, model, output, benchmark, json).await?;
        }
        Commands::Rebuild => {
            let collection = open_collection(cli.config, cli.profile)?;
            let summary = collection.rebuild()?;
            println!(
                "✓ Rebuilt indexes: {} chunks, {} vectors in {} ms",
                summary.chunks, summary.vectors, summary.took_ms
            );
        }
        Commands::Stats => {
            let collection = open_collection(cli.config, cli.profile)?;
            println!("{}", to_json(&collection.stats()?)?);
        }
        Commands::Config { action } => {
            cmd_config(cli.config, cli.profile, action)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "ragline=debug" } else { "ragline=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn cmd_serve(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    bind: Option<String>,
) -> Result<()> {
    let (config, source) = load_config(config_path, profile)?;
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());

    let handle = match source {
        Some(path) => ConfigHandle::with_source(config, path),
        None => ConfigHandle::new(config),
    };
    let collection = Arc::new(Collection::open(handle)?);
    collection.warm_up().await?;

    ragline::server::serve(collection, &bind).await
}

async fn cmd_ingest(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    paths: &[PathBuf],
    json: bool,
) -> Result<()> {
    let collection = open_collection(config_path, profile)?;

    let mut files = Vec::new();
    for path in paths {
        collect_files(path, &mut files)?;
    }
    let documents = files
        .iter()
        .filter_map(|path| match read_document(path) {
            Ok(document) => Some(document),
            Err(e) => {
                tracing::warn!("Skipping {}: {}", path.display(), e);
                None
            }
        })
        .collect::<Vec<_>>();
    if documents.is_empty() {
        println!("No readable files found");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing documents in flight");
            on_interrupt.cancel();
        }
    });

    let total = documents.len();
    let mut complete = 0;
    let mut partial = 0;
    let mut failed = 0;
    let mut events = collection.ingest_stream(documents, cancel);

    while let Some(event) = events.next().await {
        if json {
            println!("{}", to_json_line(&event)?);
        }
        match &event {
            IngestEvent::Summary(summary) => {
                match summary.status {
                    IngestStatus::Complete => complete += 1,
                    IngestStatus::Partial | IngestStatus::Cancelled => partial += 1,
                }
                if !json {
                    println!(
                        "  {} v{}: {} chunks ({}){}",
                        summary.document_id,
                        summary.version,
                        summary.chunk_count,
                        summary.strategy.as_str(),
                        if summary.failed_chunk_ids.is_empty() {
                            String::new()
                        } else {
                            format!(", {} failed", summary.failed_chunk_ids.len())
                        }
                    );
                }
            }
            IngestEvent::Failed { document_id, error } => {
                failed += 1;
                if !json {
                    println!("  ✗ {}: {}", document_id, error);
                }
            }
            IngestEvent::Progress { .. } => {}
        }
    }

    if !json {
        println!(
            "✓ Ingested {}/{} documents ({} partial, {} failed)",
            complete, total, partial, failed
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_search(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    query: String,
    k: Option<usize>,
    mode: SearchMode,
    weight: Option<f32>,
    languages: Vec<String>,
    json: bool,
) -> Result<()> {
    let collection = open_collection(config_path, profile)?;

    let mut request = SearchRequest {
        k,
        ..SearchRequest::new(query, 0)
    }
    .with_mode(mode)
    .with_filters(SearchFilters {
        languages,
        ..SearchFilters::default()
    });
    if let Some(weight) = weight {
        request = request.with_semantic_weight(weight);
    }

    let response = collection.search(&request).await?;
    if json {
        println!("{}", to_json(&response)?);
        return Ok(());
    }

    if response.degraded {
        println!(
            "⚠ Degraded: {}",
            response.degraded_reason.as_deref().unwrap_or("a source failed")
        );
    }
    if response.results.is_empty() {
        println!("No results");
        return Ok(());
    }
    for result in &response.results {
        println!(
            "{:>2}. {}:{}-{} [{} {}] score {:.4}",
            result.rank,
            result.document_id,
            result.start_line,
            result.end_line,
            result.language,
            result.kind.as_str(),
            result.score
        );
        for line in result.text.lines().take(3) {
            println!("      {}", line);
        }
    }
    println!("\n{} results in {} ms", response.results.len(), response.took_ms);
    Ok(())
}

async fn cmd_evaluate(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    file: &Path,
    models: Vec<String>,
    output: Option<PathBuf>,
    benchmark: bool,
    json: bool,
) -> Result<()> {
    let (config, _) = load_config(config_path, profile)?;
    let set = EvaluationSet::load(file)?;
    let models = if models.is_empty() {
        config.embedding.models.iter().map(|m| m.id.clone()).collect()
    } else {
        models
    };

    let mut log = match &config.evaluation.log_file {
        Some(path) => EvaluationLog::open(ragline::config::expand_home(path)?)?,
        None => EvaluationLog::in_memory(),
    };
    let evaluator = ModelEvaluator::from_config(config.clone())?;
    let report = evaluator.evaluate_into(&models, &set, &mut log).await?;

    if json {
        println!("{}", to_json(&report)?);
    } else {
        println!("{}", report.to_markdown());
    }
    if let Some(path) = output {
        std::fs::write(&path, report.to_markdown()).map_err(|e| RaglineError::Io {
            source: e,
            context: format!("Failed to write report: {:?}", path),
        })?;
        println!("✓ Report written to {}", path.display());
    }

    if benchmark {
        let collection = Collection::in_memory(config.clone())?;
        for document in set.documents {
            collection.ingest(document).await?;
        }
        let queries: Vec<String> = set.queries.into_iter().map(|q| q.query).collect();
        let benchmarks = benchmark_modes(
            &collection,
            &queries,
            config.evaluation.iterations,
            config.evaluation.k,
        )
        .await;
        println!("\nSearch modes ({}):", collection.model());
        for b in benchmarks {
            println!(
                "  {:<8} avg {:.2} ms, min {:.2} ms, max {:.2} ms ({} runs, {} failed)",
                b.mode.as_str(),
                b.avg_ms,
                b.min_ms,
                b.max_ms,
                b.runs,
                b.failures
            );
        }
    }
    Ok(())
}

fn cmd_config(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    action: ConfigAction,
) -> Result<()> {
    match action {
        ConfigAction::Show { section } => {
            let (config, _) = load_config(config_path, profile)?;
            let value = toml::Value::try_from(&config)?;

            let shown = match &section {
                Some(section) => value.get(section).cloned().ok_or_else(|| {
                    RaglineError::Config(format!("Unknown configuration section: {}", section))
                })?,
                None => value,
            };
            println!("{}", toml::to_string_pretty(&shown)?);
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            // Create parent directory
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| RaglineError::Io {
                    source: e,
                    context: format!("Failed to create config directory: {:?}", parent),
                })?;
            }

            let config = Config::default();
            ConfigValidator::validate(&config)?;
            config.save(&path)?;

            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

/// Configuration and the file it came from, if any
fn load_config(
    config_path: Option<PathBuf>,
    profile: Option<String>,
) -> Result<(Config, Option<PathBuf>)> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'ragline config init' to create one."
        );
        let mut config = Config::default();
        config.apply_env_overrides();
        if let Some(profile) = profile {
            config.apply_profile(&profile)?;
        }
        ConfigValidator::validate(&config)?;
        return Ok((config, None));
    }

    let config = match profile {
        Some(profile) => Config::load_with_profile(&path, &profile)?,
        None => Config::load(&path)?,
    };
    Ok((config, Some(path)))
}

fn open_collection(config_path: Option<PathBuf>, profile: Option<String>) -> Result<Collection> {
    let (config, _) = load_config(config_path, profile)?;
    Collection::open(ConfigHandle::new(config))
}

/// Regular files under `path`, skipping hidden entries
fn collect_files(path: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| RaglineError::Io {
        source: e,
        context: format!("Cannot access {:?}", path),
    })?;
    if metadata.is_file() {
        files.push(path.to_path_buf());
        return Ok(());
    }

    let entries = std::fs::read_dir(path).map_err(|e| RaglineError::Io {
        source: e,
        context: format!("Failed to read directory: {:?}", path),
    })?;
    let mut children: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.'))
        })
        .collect();
    children.sort();
    for child in children {
        collect_files(&child, files)?;
    }
    Ok(())
}

fn read_document(path: &Path) -> Result<Document> {
    let text = std::fs::read_to_string(path).map_err(|e| RaglineError::Io {
        source: e,
        context: format!("Failed to read {:?}", path),
    })?;
    let id = path.to_string_lossy().to_string();
    Ok(Document::new(id.clone(), id, text))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| RaglineError::Json {
        source: e,
        context: "Failed to serialize output".to_string(),
    })
}

fn to_json_line<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| RaglineError::Json {
        source: e,
        context: "Failed to serialize output".to_string(),
    })
}
