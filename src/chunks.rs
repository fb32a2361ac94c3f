//! Chunk management: manual CRUD, confirmation, and auto-chunking of
//! parsed text.
//!
//! `chunks_count` on the document is recomputed by the store after every
//! insert and delete.

use std::sync::Arc;

use serde::Serialize;

use crate::chunk::{ChunkParams, Chunker, ChunkerKind, RuleChunker, Tier};
use crate::config::{ApiConfig, ChunkingConfig};
use crate::error::{Error, Result};
use crate::models::{Chunk, ChunkStatus, ChunkUpdate, Listing, NewChunk};
use crate::semantic::SemanticChunker;
use crate::store::Store;

/// Chunks saved by an auto-chunk run and the least faithful tier any of
/// the document's texts fell to.
#[derive(Debug, Clone, Serialize)]
pub struct AutoChunkOutcome {
    pub tier: Tier,
    pub chunks: Vec<Chunk>,
}

pub struct ChunkService {
    store: Store,
    semantic: Arc<SemanticChunker>,
    rule: RuleChunker,
    defaults: ChunkingConfig,
    api: ApiConfig,
}

impl ChunkService {
    pub fn new(
        store: Store,
        semantic: Arc<SemanticChunker>,
        defaults: ChunkingConfig,
        api: ApiConfig,
    ) -> Self {
        Self {
            store,
            semantic,
            rule: RuleChunker,
            defaults,
            api,
        }
    }

    pub fn default_params(&self) -> ChunkParams {
        ChunkParams::from_config(&self.defaults)
    }

    pub fn default_kind(&self) -> ChunkerKind {
        self.defaults
            .default_chunker
            .parse()
            .unwrap_or(ChunkerKind::Semantic)
    }

    fn chunker(&self, kind: ChunkerKind) -> &dyn Chunker {
        match kind {
            ChunkerKind::Semantic => self.semantic.as_ref(),
            ChunkerKind::Rule => &self.rule,
        }
    }

    pub async fn create_chunk(&self, document_id: &str, chunk: NewChunk) -> Result<Chunk> {
        if chunk.content.trim().is_empty() {
            return Err(Error::InvalidArgument("chunk content must not be empty".into()));
        }
        if chunk.source_page < 1 {
            return Err(Error::InvalidArgument("source_page starts at 1".into()));
        }
        self.store.require_document(document_id).await?;
        let created = self.store.insert_chunks(document_id, &[chunk]).await?;
        created
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("Chunk", document_id))
    }

    pub async fn get_chunk(&self, id: &str) -> Result<Chunk> {
        self.store.require_chunk(id).await
    }

    pub async fn list_chunks(
        &self,
        document_id: &str,
        status: Option<ChunkStatus>,
        page: u32,
        page_size: Option<u32>,
    ) -> Result<Listing<Chunk>> {
        self.store.require_document(document_id).await?;
        let (offset, limit) = self.api.window(page, page_size);
        self.store
            .list_chunks(document_id, status, offset, limit)
            .await
    }

    pub async fn update_chunk(&self, id: &str, update: ChunkUpdate) -> Result<Chunk> {
        if update.content.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return Err(Error::InvalidArgument("chunk content must not be empty".into()));
        }
        if update.source_page.is_some_and(|p| p < 1) {
            return Err(Error::InvalidArgument("source_page starts at 1".into()));
        }
        self.store.update_chunk(id, &update).await
    }

    pub async fn delete_chunk(&self, id: &str) -> Result<bool> {
        self.store.delete_chunk(id).await
    }

    /// Moves a PENDING chunk to CONFIRMED or ARCHIVED.
    pub async fn confirm_chunk(&self, id: &str, status: ChunkStatus) -> Result<Chunk> {
        self.store.set_chunk_status(id, status).await
    }

    /// Chunks every stored text of the document and saves the result as
    /// PENDING chunks in one transaction. Page texts chunk separately so
    /// each chunk keeps its source page; whole-document text counts as
    /// page 1.
    pub async fn auto_chunk(
        &self,
        document_id: &str,
        kind: ChunkerKind,
        params: ChunkParams,
    ) -> Result<AutoChunkOutcome> {
        params.validate()?;
        self.store.require_document(document_id).await?;
        let texts = self.store.list_parsed_text(document_id).await?;
        if texts.is_empty() {
            return Err(Error::NoParsedText(document_id.to_string()));
        }

        let chunker = self.chunker(kind);
        let mut drafts = Vec::new();
        let mut tier = Tier::Strict;
        for text in &texts {
            let page = text.page_number.unwrap_or(1);
            let (page_drafts, page_tier) = chunker.chunk(&text.content, &params).await;
            tier = tier.max(page_tier);
            for draft in page_drafts {
                drafts.push(NewChunk {
                    content: draft.content,
                    source_page: draft.page.map(i64::from).unwrap_or(page),
                    start_char: draft.start_char.map(|c| c as i64),
                    end_char: draft.end_char.map(|c| c as i64),
                    tags: draft.tags,
                });
            }
        }

        let chunks = self.store.insert_chunks(document_id, &drafts).await?;
        tracing::info!(
            document_id = %document_id,
            chunker = chunker.name(),
            %tier,
            texts = texts.len(),
            chunks = chunks.len(),
            "auto-chunk finished"
        );
        Ok(AutoChunkOutcome { tier, chunks })
    }
}
