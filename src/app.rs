//! Composition root.
//!
//! [`App`] builds one [`Store`] over one pool and hands it to every service,
//! together with the completion clients and the page renderer. Tests build
//! it through [`App::with_parts`] to swap in fakes and an in-memory
//! database.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::chunks::ChunkService;
use crate::completion::{self, TextCompletion, VisionCompletion};
use crate::config::Config;
use crate::db;
use crate::documents::DocumentService;
use crate::migrate;
use crate::parsers::{ImageFormat, PageRenderer, ParserRegistry, Pdftoppm};
use crate::parsing::{ConversionSignals, TextParsingService};
use crate::semantic::SemanticChunker;
use crate::store::Store;
use crate::transcribe::Transcriber;

pub struct App {
    pub config: Arc<Config>,
    pub store: Store,
    pub documents: DocumentService,
    pub chunks: ChunkService,
    pub parsing: Arc<TextParsingService>,
}

impl App {
    /// Opens the configured database, applies migrations and wires the
    /// configured completion provider and `pdftoppm`.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;
        let (text, vision) = completion::from_config(&config.completion)
            .context("Failed to set up the completion client")?;
        let renderer = Arc::new(Pdftoppm::new(config.parsing.pdftoppm.clone()));
        Self::with_parts(config, pool, renderer, text, vision)
    }

    /// Wires the services over an already migrated pool.
    pub fn with_parts(
        config: Config,
        pool: SqlitePool,
        renderer: Arc<dyn PageRenderer>,
        text: Arc<dyn TextCompletion>,
        vision: Arc<dyn VisionCompletion>,
    ) -> Result<Self> {
        for dir in [
            &config.storage.documents_dir,
            &config.storage.pages_dir,
            &config.storage.temp_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }

        let config = Arc::new(config);
        let store = Store::new(pool);
        let parsing_config = &config.parsing;

        let parsers = ParserRegistry::new(
            parsing_config.dpi,
            ImageFormat::from_config(&parsing_config.page_format),
            renderer.clone(),
        );
        let transcriber = Arc::new(Transcriber::new(
            renderer,
            vision,
            parsing_config.dpi,
            config.completion.transcribe_prompt.clone(),
            config.storage.temp_dir.clone(),
        ));
        let parsing = Arc::new(TextParsingService::new(
            store.clone(),
            transcriber,
            Arc::new(ConversionSignals::default()),
            parsing_config,
        ));
        let documents =
            DocumentService::new(store.clone(), config.clone(), parsers, parsing.clone());

        let semantic = Arc::new(SemanticChunker::new(
            text,
            config.chunking.max_llm_input_chars,
        ));
        let chunks = ChunkService::new(
            store.clone(),
            semantic,
            config.chunking.clone(),
            config.api.clone(),
        );

        Ok(Self {
            config,
            store,
            documents,
            chunks,
            parsing,
        })
    }
}
