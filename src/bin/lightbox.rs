//! lightbox CLI — run the upload daemon or inspect the state database.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use lightbox::alerts::AlertGate;
use lightbox::clients::convert::JpegConverter;
use lightbox::clients::describe::VisionClient;
use lightbox::clients::files::LocalFileMover;
use lightbox::clients::publish::GalleryClient;
use lightbox::clients::push::PushClient;
use lightbox::config::Config;
use lightbox::dispatch::{Dispatcher, PipelineSettings};
use lightbox::limiter::RateLimiter;
use lightbox::model::State;
use lightbox::orchestrator::Orchestrator;
use lightbox::retry::RetryPolicy;
use lightbox::store::StateStore;
use lightbox::telemetry::{TelemetryConfig, init_telemetry};
use lightbox::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "lightbox", about = "Folder-watching image upload pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the upload daemon
    Serve,
    /// Work item operations
    Work {
        #[command(subcommand)]
        action: WorkAction,
    },
}

#[derive(Subcommand)]
enum WorkAction {
    /// List work items
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        /// Maximum items to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a work item, including its audit trail
    Show {
        /// Work item id (full fingerprint or prefix)
        id: String,
    },
    /// Item counts per state
    Counts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve => cmd_serve().await,
        Command::Work { action } => {
            let config = Config::from_env()?;
            let store = StateStore::open(&config.storage.db_path)?;
            match action {
                WorkAction::List { state, limit } => cmd_work_list(&store, state, limit),
                WorkAction::Show { id } => cmd_work_show(&store, &id),
                WorkAction::Counts => cmd_work_counts(&store),
            }
        }
    }
}

async fn cmd_serve() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "lightbox".to_string(),
    })?;

    if let Some(parent) = config.storage.db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let store = Arc::new(StateStore::open(&config.storage.db_path)?);

    let publisher = Arc::new(GalleryClient::new(config.publish.clone()));
    match publisher.check_credentials().await {
        Ok(()) => info!("gallery credentials verified"),
        Err(e) => warn!(error = %e, "gallery credential check failed; uploads may not succeed"),
    }

    let analyzer = Arc::new(VisionClient::new(config.vision.clone()));
    let converter = Arc::new(JpegConverter::new(config.pipeline.jpeg_quality));
    let mover = Arc::new(LocalFileMover::new(
        config.storage.archive_root.clone(),
        config.storage.failed_root.clone(),
    ));
    let alerts = AlertGate::new(
        Arc::new(PushClient::new(config.alerts.clone())),
        config.alerts.cooldown,
    );

    let shutdown = CancellationToken::new();
    let work_cancel = CancellationToken::new();

    // Enough slack that pipeline tasks never block on reporting even while
    // the orchestrator is suspended waiting for a slot.
    let (event_tx, event_rx) =
        tokio::sync::mpsc::channel(4 * config.pipeline.max_concurrent.max(1) + 16);
    let (discovery_tx, discovery_rx) = tokio::sync::mpsc::channel(1024);

    let dispatcher = Dispatcher::new(
        config.pipeline.max_concurrent,
        analyzer,
        converter,
        publisher,
        PipelineSettings {
            step_timeout: config.pipeline.step_timeout,
            analysis_enabled: config.pipeline.analysis_enabled,
            convert_extensions: config.pipeline.convert_extensions.clone(),
            post_state: config.publish.post_state.clone(),
            common_tags: config.publish.common_tags.clone(),
        },
        event_tx,
        work_cancel.clone(),
    );

    let orchestrator = Orchestrator::new(
        store,
        RateLimiter::new(&config.limits),
        RetryPolicy::new(&config.retry),
        dispatcher,
        mover,
        alerts,
        discovery_rx,
        event_rx,
        shutdown.clone(),
        work_cancel,
        config.shutdown_grace,
    );

    let _watcher = watch::start(&config.watch, discovery_tx).await?;

    let stop = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("ctrl-c received");
        stop.cancel();
    });

    orchestrator.run().await?;
    Ok(())
}

fn cmd_work_list(
    store: &StateStore,
    state: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let states: Vec<State> = match state {
        Some(s) => vec![
            State::parse(&s).ok_or_else(|| anyhow::anyhow!("invalid state: {s}"))?,
        ],
        None => vec![
            State::Discovered,
            State::Admitted,
            State::Analyzing,
            State::Converting,
            State::Publishing,
            State::Published,
            State::Retrying,
            State::Failed,
            State::Archived,
        ],
    };

    let mut items = Vec::new();
    for s in states {
        items.extend(store.list_by_state(s)?);
    }
    items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    items.truncate(limit);

    if items.is_empty() {
        println!("No work items found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<12}  {:<10}  {:<4}  {:<40}  CREATED",
        "ID", "CATEGORY", "STATE", "ATT", "FILE"
    );
    println!("{}", "-".repeat(100));
    for item in &items {
        let file = item
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_display = if file.len() > 40 { &file[..40] } else { file.as_str() };
        println!(
            "{:<8}  {:<12}  {:<10}  {:<4}  {:<40}  {}",
            item.id.to_string(),
            item.category,
            item.state,
            item.attempt_count,
            file_display,
            item.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} item(s)", items.len());
    Ok(())
}

fn cmd_work_show(store: &StateStore, id_prefix: &str) -> anyhow::Result<()> {
    let matches = store.find_by_prefix(id_prefix)?;
    let item = match matches.len() {
        0 => anyhow::bail!("no work item matching prefix '{id_prefix}'"),
        1 => &matches[0],
        n => anyhow::bail!("{n} work items match prefix '{id_prefix}' — be more specific"),
    };

    println!("ID:         {}", item.id.as_str());
    println!("File:       {}", item.path.display());
    println!("Category:   {}", item.category);
    println!("State:      {}", item.state);
    println!("Attempts:   {}", item.attempt_count);
    println!("Size:       {} bytes", item.size);
    println!("Trace:      {}", item.trace_id);
    if let Some(kind) = item.last_error_kind {
        println!("Last error: [{kind}] {}", item.last_error.as_deref().unwrap_or("-"));
    }
    if let Some(ref post_id) = item.post_id {
        println!("Post:       {post_id}");
    }
    println!("Created:    {}", item.created_at);
    println!("Updated:    {}", item.updated_at);

    let trail = store.audit_trail(item.trace_id)?;
    if !trail.is_empty() {
        println!("---");
        for entry in trail {
            println!(
                "{}  {} -> {}",
                entry.at.format("%Y-%m-%d %H:%M:%S"),
                entry.from,
                entry.to
            );
        }
    }
    Ok(())
}

fn cmd_work_counts(store: &StateStore) -> anyhow::Result<()> {
    let counts = store.counts_by_state()?;
    if counts.is_empty() {
        println!("No work items found.");
        return Ok(());
    }
    for (state, count) in counts {
        println!("{state:<12} {count}");
    }
    Ok(())
}
