//! # pagemill CLI
//!
//! The `pagemill` binary drives the document pipeline from the command
//! line: upload files, inspect their pages and extracted text, and build
//! and review chunks.
//!
//! ## Usage
//!
//! ```bash
//! pagemill --config ./config/pagemill.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pagemill init` | Create the SQLite database and run schema migrations |
//! | `pagemill upload <file>` | Store a file, render its pages and extract its text |
//! | `pagemill list` | List documents, optionally by status |
//! | `pagemill get <id>` | Show a document and its latest parsing task |
//! | `pagemill pages <id>` | List a document's page images |
//! | `pagemill text <id>` | Print extracted text, whole or per page |
//! | `pagemill reparse <id>` | Re-run page conversion and text extraction |
//! | `pagemill archive <id>` | Archive a completed or failed document |
//! | `pagemill delete <id>` | Delete a document, its files and its rows |
//! | `pagemill chunks ...` | List, auto-chunk, add, edit, remove and confirm chunks |
//!
//! Results are printed to stdout as JSON. Logs and parse progress go to
//! stderr; set `RUST_LOG` or pass `-v` for more detail.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use pagemill::app::App;
use pagemill::chunk::{ChunkParams, ChunkerKind};
use pagemill::config::{self, Config};
use pagemill::models::{ChunkStatus, ChunkUpdate, DocumentStatus, NewChunk};
use pagemill::progress::{ParseProgressReporter, ProgressMode};
use pagemill::{db, migrate};

const DEFAULT_CONFIG: &str = "./config/pagemill.toml";

/// pagemill: document ingestion, page transcription and chunking.
#[derive(Parser)]
#[command(name = "pagemill", version, about)]
struct Cli {
    /// Path to the TOML configuration file. A missing file at the default
    /// path means built-in defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Parse progress on stderr: off, human or json. Defaults to human when
    /// stderr is a terminal.
    #[arg(long, global = true)]
    progress: Option<String>,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and tables. Safe to run repeatedly.
    Init,

    /// Upload a file and wait until it is processed.
    ///
    /// The file is stored, rendered to page images and its text extracted.
    /// Prints the document as it stands when processing ends.
    Upload {
        /// File to upload (pdf, docx, xlsx, txt, md or json).
        file: PathBuf,

        /// Display name; defaults to the file name.
        #[arg(long)]
        name: Option<String>,
    },

    /// List documents, newest first.
    List {
        /// Only documents in this status.
        #[arg(long, value_parser = clap::value_parser!(DocumentStatus))]
        status: Option<DocumentStatus>,

        /// 1-based page of results.
        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long)]
        page_size: Option<u32>,
    },

    /// Show a document and its latest parsing task.
    Get {
        /// Document ID.
        id: String,
    },

    /// List a document's page images, or show one page.
    Pages {
        /// Document ID.
        id: String,

        /// Only this page number.
        #[arg(long)]
        page: Option<i64>,
    },

    /// Print a document's extracted text.
    ///
    /// Without `--page`, all page texts joined by blank lines.
    Text {
        /// Document ID.
        id: String,

        #[arg(long)]
        page: Option<i64>,
    },

    /// Re-run page conversion and text extraction and wait for them.
    Reparse {
        /// Document ID.
        id: String,
    },

    /// Archive a completed or failed document.
    Archive {
        /// Document ID.
        id: String,
    },

    /// Delete a document with its files, pages, text, chunks and tasks.
    Delete {
        /// Document ID.
        id: String,
    },

    /// Manage a document's chunks.
    Chunks {
        #[command(subcommand)]
        action: ChunkAction,
    },
}

#[derive(Subcommand)]
enum ChunkAction {
    /// List a document's chunks.
    List {
        /// Document ID.
        id: String,

        #[arg(long, value_parser = clap::value_parser!(ChunkStatus))]
        status: Option<ChunkStatus>,

        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long)]
        page_size: Option<u32>,
    },

    /// Split the document's extracted text into new PENDING chunks.
    ///
    /// Parameters left out come from `[chunking]` in the config. Prints the
    /// chunks with the tier that produced them (strict, bracketed or rule).
    Auto {
        /// Document ID.
        id: String,

        /// semantic or rule.
        #[arg(long)]
        chunker: Option<String>,

        #[arg(long)]
        chunk_size: Option<usize>,

        #[arg(long)]
        chunk_overlap: Option<usize>,

        #[arg(long)]
        min_chunk_size: Option<usize>,
    },

    /// Add a chunk by hand.
    Add {
        /// Document ID.
        id: String,

        #[arg(long)]
        content: String,

        /// 1-based source page.
        #[arg(long, default_value_t = 1)]
        page: i64,

        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Edit a chunk's content, page or tags.
    Edit {
        /// Chunk ID.
        id: String,

        #[arg(long)]
        content: Option<String>,

        #[arg(long)]
        page: Option<i64>,

        /// Replaces all tags. Repeat for several.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Remove every tag.
        #[arg(long, conflicts_with = "tags")]
        clear_tags: bool,
    },

    /// Delete a chunk.
    Rm {
        /// Chunk ID.
        id: String,
    },

    /// Confirm a PENDING chunk, or archive it with `--archive`.
    Confirm {
        /// Chunk ID.
        id: String,

        #[arg(long)]
        archive: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "pagemill=debug" } else { "pagemill=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG) {
        tracing::debug!(path = %path.display(), "no config file; using defaults");
        return Ok(Config::default());
    }
    config::load_config(path)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn progress_reporter(progress: Option<&str>) -> anyhow::Result<Arc<dyn ParseProgressReporter>> {
    let mode = match progress {
        Some(value) => match ProgressMode::parse(value) {
            Some(mode) => mode,
            None => bail!("Unknown progress mode: '{}'. Must be off, human or json.", value),
        },
        None => ProgressMode::default_for_tty(),
    };
    Ok(Arc::from(mode.reporter()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = load(&cli.config)?;

    if let Commands::Init = cli.command {
        let pool = db::connect(&cfg).await?;
        migrate::run_migrations(&pool).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let reporter = progress_reporter(cli.progress.as_deref())?;
    let app = App::open(cfg).await?;
    let documents = app.documents.clone().with_progress(reporter);

    match cli.command {
        Commands::Init => {}
        Commands::Upload { file, name } => {
            let document = documents
                .upload_path(&file, name.as_deref())
                .await
                .with_context(|| format!("Failed to upload {}", file.display()))?;
            let document = documents.wait_for_processing(&document.id).await?;
            print_json(&document)?;
        }
        Commands::List {
            status,
            page,
            page_size,
        } => {
            let listing = documents.list_documents(status, page, page_size).await?;
            print_json(&listing)?;
        }
        Commands::Get { id } => {
            let document = documents.get_document(&id).await?;
            let task = documents.latest_task(&id).await?;
            print_json(&serde_json::json!({
                "document": document,
                "latest_task": task,
            }))?;
        }
        Commands::Pages { id, page } => match page {
            Some(n) => print_json(&documents.get_page(&id, n).await?)?,
            None => print_json(&documents.list_pages(&id).await?)?,
        },
        Commands::Text { id, page } => match documents.get_parsed_text(&id, page).await? {
            Some(text) => println!("{}", text),
            None => bail!("No parsed text for document {}", id),
        },
        Commands::Reparse { id } => {
            documents.reparse_document(&id).await?;
            let document = documents.wait_for_processing(&id).await?;
            print_json(&document)?;
        }
        Commands::Archive { id } => {
            print_json(&documents.archive_document(&id).await?)?;
        }
        Commands::Delete { id } => {
            if !documents.delete_document(&id).await? {
                bail!("Document not found: {}", id);
            }
            println!("Deleted document {}", id);
        }
        Commands::Chunks { action } => run_chunks(&app, action).await?,
    }

    Ok(())
}

async fn run_chunks(app: &App, action: ChunkAction) -> anyhow::Result<()> {
    let chunks = &app.chunks;
    match action {
        ChunkAction::List {
            id,
            status,
            page,
            page_size,
        } => {
            print_json(&chunks.list_chunks(&id, status, page, page_size).await?)?;
        }
        ChunkAction::Auto {
            id,
            chunker,
            chunk_size,
            chunk_overlap,
            min_chunk_size,
        } => {
            let kind = match chunker {
                Some(name) => name.parse::<ChunkerKind>()?,
                None => chunks.default_kind(),
            };
            let defaults = chunks.default_params();
            let params = ChunkParams {
                chunk_size: chunk_size.unwrap_or(defaults.chunk_size),
                chunk_overlap: chunk_overlap.unwrap_or(defaults.chunk_overlap),
                min_chunk_size: min_chunk_size.unwrap_or(defaults.min_chunk_size),
            };
            print_json(&chunks.auto_chunk(&id, kind, params).await?)?;
        }
        ChunkAction::Add {
            id,
            content,
            page,
            tags,
        } => {
            let chunk = NewChunk {
                content,
                source_page: page,
                tags,
                ..Default::default()
            };
            print_json(&chunks.create_chunk(&id, chunk).await?)?;
        }
        ChunkAction::Edit {
            id,
            content,
            page,
            tags,
            clear_tags,
        } => {
            let tags = if clear_tags {
                Some(Vec::new())
            } else if tags.is_empty() {
                None
            } else {
                Some(tags)
            };
            let update = ChunkUpdate {
                content,
                tags,
                source_page: page,
                embedding: None,
            };
            print_json(&chunks.update_chunk(&id, update).await?)?;
        }
        ChunkAction::Rm { id } => {
            if !chunks.delete_chunk(&id).await? {
                bail!("Chunk not found: {}", id);
            }
            println!("Deleted chunk {}", id);
        }
        ChunkAction::Confirm { id, archive } => {
            let status = if archive {
                ChunkStatus::Archived
            } else {
                ChunkStatus::Confirmed
            };
            print_json(&chunks.confirm_chunk(&id, status).await?)?;
        }
    }
    Ok(())
}
