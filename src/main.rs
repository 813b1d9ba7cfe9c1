use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use screenshot_organizer_lib::{
    download::DownloadStatus, scan, scanner, App, AnalysisStatus, Config, ImageRecord,
    TracingSink,
};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "screenshot-organizer", about = "Catalog and analyze screenshots")]
struct Cli {
    /// JSON config file (defaults to ~/.config/screenshot-organizer/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Add newly found screenshots to the catalog.
    Scan,
    /// Scan, then keep watching for new screenshots and analyze them.
    Watch,
    /// List catalog entries, newest first.
    List {
        #[arg(long)]
        all: bool,
    },
    /// Show one entry and its collections.
    Show { uri: String },
    Search { query: String },
    /// Hide an entry from the catalog. The file itself is kept.
    Ignore {
        uri: String,
        #[arg(long)]
        undo: bool,
    },
    /// Analyze pending entries, or one entry again.
    Analyze {
        #[arg(long)]
        uri: Option<String>,
    },
    #[command(subcommand)]
    Collection(CollectionCommand),
    /// List known models and whether they are downloaded.
    Models,
    /// Download model weights.
    Download { model: String },
}

#[derive(Debug, Subcommand)]
enum CollectionCommand {
    Create { name: String },
    Rename { name: String, new_name: String },
    Delete { name: String },
    List,
    Show { name: String },
    Add { name: String, uris: Vec<String> },
    Remove { name: String, uris: Vec<String> },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).with_target(false).init();
}

fn print_record(record: &ImageRecord) {
    let status = match record.analysis {
        AnalysisStatus::Pending => "pending",
        AnalysisStatus::Structured => "done",
        AnalysisStatus::Fallback => "text only",
    };
    let ignored = if record.ignored { " [ignored]" } else { "" };
    println!(
        "{}  [{status}]{ignored}  {}",
        record.uri,
        record.title.as_deref().unwrap_or("(untitled)")
    );
    if !record.tags.is_empty() {
        println!("    tags: {}", record.tags.join(", "));
    }
}

fn print_progress(status: &DownloadStatus) {
    match status.fraction() {
        Some(fraction) => println!(
            "{}: {:.1}% ({} bytes) {:?}",
            status.model,
            fraction * 100.0,
            status.received,
            status.state
        ),
        None => println!("{}: {} bytes {:?}", status.model, status.received, status.state),
    }
}

fn collection_id(app: &App, name: &str) -> Result<i64> {
    app.catalog
        .find_collection(name)?
        .map(|collection| collection.id)
        .ok_or_else(|| anyhow!("no collection named {name:?}"))
}

fn run_collection(app: &App, command: CollectionCommand) -> Result<()> {
    match command {
        CollectionCommand::Create { name } => {
            let collection = app.catalog.create_collection(&name)?;
            println!("created {:?} (id {})", collection.name, collection.id);
        }
        CollectionCommand::Rename { name, new_name } => {
            let id = collection_id(app, &name)?;
            app.catalog.rename_collection(id, &new_name)?;
        }
        CollectionCommand::Delete { name } => {
            let id = collection_id(app, &name)?;
            app.catalog.delete_collection(id)?;
        }
        CollectionCommand::List => {
            for collection in app.catalog.list_collections()? {
                println!("{}  ({} screenshots)", collection.name, collection.image_count);
            }
        }
        CollectionCommand::Show { name } => {
            let id = collection_id(app, &name)?;
            for record in app.catalog.collection_images(id)? {
                print_record(&record);
            }
        }
        CollectionCommand::Add { name, uris } => {
            let id = collection_id(app, &name)?;
            for uri in uris {
                if !app.catalog.add_to_collection(id, &uri)? {
                    println!("{uri} is already in {name:?}");
                }
            }
        }
        CollectionCommand::Remove { name, uris } => {
            let id = collection_id(app, &name)?;
            for uri in uris {
                if !app.catalog.remove_from_collection(id, &uri)? {
                    println!("{uri} was not in {name:?}");
                }
            }
        }
    }
    Ok(())
}

async fn watch(app: &App) -> Result<()> {
    let pipeline = app.pipeline(Arc::new(TracingSink));
    let (scanned, analyzed) = app.catch_up(&pipeline).await?;
    println!(
        "{} screenshots, {} new, {} analyzed",
        scanned.discovered, scanned.inserted, analyzed.total
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watcher = scanner::watch(&app.config.screenshot_dirs, Arc::clone(&app.catalog), move |uri| {
        let _ = tx.send(uri);
    })?;

    loop {
        tokio::select! {
            Some(uri) = rx.recv() => {
                let outcome = pipeline.reanalyze(&uri).await?;
                info!("{} -> {:?}", outcome.uri, outcome.state);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("stopping");
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let app = App::open(config).context("opening catalog")?;

    match cli.command {
        Command::Scan => {
            let report = scan(&app.media_index(), &app.catalog)?;
            println!("{} screenshots, {} new", report.discovered, report.inserted);
        }
        Command::Watch => watch(&app).await?,
        Command::List { all } => {
            let records = if all {
                app.catalog.list_all()?
            } else {
                app.catalog.list()?
            };
            for record in &records {
                print_record(record);
            }
        }
        Command::Show { uri } => {
            let record = app
                .catalog
                .get(&uri)?
                .ok_or_else(|| anyhow!("{uri} is not in the catalog"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            let collections = app.catalog.collections_for_image(&uri)?;
            if !collections.is_empty() {
                let names: Vec<&str> = collections.iter().map(|c| c.name.as_str()).collect();
                println!("collections: {}", names.join(", "));
            }
            if record.analysis == AnalysisStatus::Fallback {
                println!("download a model to get titles and tags for this screenshot");
            }
        }
        Command::Search { query } => {
            for record in app.catalog.search(&query)? {
                print_record(&record);
            }
        }
        Command::Ignore { uri, undo } => app.catalog.set_ignored(&uri, !undo)?,
        Command::Analyze { uri } => {
            if !app.prepare_llm().await? {
                warn!("no LLM available, results will be raw text only");
            }
            let pipeline = app.pipeline(Arc::new(TracingSink));
            match uri {
                Some(uri) => {
                    let outcome = pipeline.reanalyze(&uri).await?;
                    println!("{} -> {:?}", outcome.uri, outcome.state);
                    if let Some(error) = outcome.error {
                        bail!(error);
                    }
                }
                None => {
                    let report = pipeline.run_pending().await?;
                    println!(
                        "{} analyzed: {} structured, {} text only, {} failed",
                        report.total, report.structured, report.fallback, report.failed
                    );
                }
            }
        }
        Command::Collection(command) => run_collection(&app, command)?,
        Command::Models => {
            for model in app.registry.models() {
                let state = if app.registry.is_downloaded(model) {
                    "downloaded"
                } else {
                    "not downloaded"
                };
                println!("{:<14} {:<24} {state}", model.name, model.display_name);
            }
        }
        Command::Download { model } => {
            let descriptor = app
                .registry
                .find(&model)
                .cloned()
                .ok_or_else(|| anyhow!("unknown model {model:?}"))?;
            if descriptor.needs_auth && app.config.auth_token.is_none() {
                warn!("{} usually needs an access token (HF_TOKEN)", descriptor.name);
            }
            let downloads = app.download_manager()?.with_observer(Arc::new(print_progress));
            let path = downloads.download(&descriptor).await?;
            println!("saved to {}", path.display());
        }
    }
    Ok(())
}
