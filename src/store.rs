//! SQLite persistence for documents, pages, parsed text, chunks and tasks.
//!
//! [`Store`] is a cheap clonable handle over one [`SqlitePool`]; services
//! receive it at construction time. Every operation runs on a short-lived
//! connection and multi-statement writes run inside a single transaction,
//! so no transaction ever spans a call to an external service.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    Chunk, ChunkStatus, ChunkUpdate, Document, DocumentStatus, FileFormat, Listing, NewChunk,
    Page, ParsedText, ParsingTask, TaskStatus,
};
use crate::parsers::PageImage;

const REFRESH_CHUNKS_COUNT: &str = "UPDATE documents \
     SET chunks_count = (SELECT COUNT(*) FROM chunks WHERE document_id = ?), updated_at = ? \
     WHERE id = ?";

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ── documents ──────────────────────────────────────────────────────

    pub async fn insert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, name, file_path, file_type, file_size, status,
                                   total_pages, chunks_count, metadata_json,
                                   created_at, updated_at, parsed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.name)
        .bind(&doc.file_path)
        .bind(doc.file_type.as_str())
        .bind(doc.file_size)
        .bind(doc.status.as_str())
        .bind(doc.total_pages)
        .bind(doc.chunks_count)
        .bind(serde_json::to_string(&doc.metadata)?)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .bind(doc.parsed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(document_from_row).transpose()?)
    }

    pub async fn require_document(&self, id: &str) -> Result<Document> {
        self.get_document(id)
            .await?
            .ok_or_else(|| Error::not_found("Document", id))
    }

    /// Newest first.
    pub async fn list_documents(
        &self,
        status: Option<DocumentStatus>,
        offset: i64,
        limit: i64,
    ) -> Result<Listing<Document>> {
        let status = status.map(|s| s.as_str());
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE (? IS NULL OR status = ?)")
                .bind(status)
                .bind(status)
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query(
            "SELECT * FROM documents WHERE (? IS NULL OR status = ?) \
             ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
        )
        .bind(status)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .iter()
            .map(document_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Listing { items, total })
    }

    /// Moves a document to `next` if its current status allows it. The
    /// update is conditioned on the status that was read, so a concurrent
    /// transition makes this one fail instead of overwriting it.
    pub async fn transition_document(&self, id: &str, next: DocumentStatus) -> Result<Document> {
        let doc = self.require_document(id).await?;
        if !doc.status.can_transition_to(next) {
            return Err(invalid_document_transition(id, doc.status, next));
        }

        let now = now_ts();
        let parsed_at = if next == DocumentStatus::Completed {
            Some(now)
        } else {
            doc.parsed_at
        };
        let result = sqlx::query(
            "UPDATE documents SET status = ?, updated_at = ?, parsed_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(next.as_str())
        .bind(now)
        .bind(parsed_at)
        .bind(id)
        .bind(doc.status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.require_document(id).await?;
            return Err(invalid_document_transition(id, current.status, next));
        }
        self.require_document(id).await
    }

    /// Puts a finished document back into PROCESSING for an explicit re-parse.
    /// Page rows and extracted text are dropped so completion waits for the
    /// new run; PENDING chunks go with them, reviewed chunks stay.
    pub async fn restart_document(&self, id: &str) -> Result<Document> {
        let doc = self.require_document(id).await?;
        if !doc.status.can_reparse() {
            return Err(invalid_document_transition(
                id,
                doc.status,
                DocumentStatus::Processing,
            ));
        }
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE documents SET status = 'processing', parsed_at = NULL, total_pages = 0, \
             updated_at = ? WHERE id = ? AND status IN ('completed', 'failed')",
        )
        .bind(now_ts())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() > 0 {
            for sql in [
                "DELETE FROM document_pages WHERE document_id = ?",
                "DELETE FROM parsed_text WHERE document_id = ?",
                "DELETE FROM chunks WHERE document_id = ? AND status = 'pending'",
            ] {
                sqlx::query(sql).bind(id).execute(&mut *tx).await?;
            }
            sqlx::query(REFRESH_CHUNKS_COUNT)
                .bind(id)
                .bind(now_ts())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        if result.rows_affected() == 0 {
            let current = self.require_document(id).await?;
            return Err(invalid_document_transition(
                id,
                current.status,
                DocumentStatus::Processing,
            ));
        }
        self.require_document(id).await
    }

    /// Marks a still-running document FAILED. Returns false when the document
    /// already left PENDING/PROCESSING (or is gone).
    pub async fn mark_document_failed(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'failed', updated_at = ? \
             WHERE id = ? AND status IN ('pending', 'processing')",
        )
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Completes a document once both sibling steps are done: it is still
    /// PROCESSING, page conversion stored at least one page, and the latest
    /// parsing task finished successfully. Whichever step finishes last wins this
    /// race; the loser sees `false`.
    pub async fn try_complete_document(&self, id: &str) -> Result<bool> {
        let now = now_ts();
        let result = sqlx::query(
            r#"
            UPDATE documents SET status = 'completed', parsed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'processing' AND total_pages > 0
              AND EXISTS (SELECT 1 FROM document_pages WHERE document_id = documents.id)
              AND (SELECT status FROM parsing_tasks WHERE document_id = documents.id
                   ORDER BY created_at DESC, rowid DESC LIMIT 1) = 'completed'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Shallow-merges `extra` into the document's metadata map.
    pub async fn merge_document_metadata(
        &self,
        id: &str,
        extra: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        if extra.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let raw: Option<String> =
            sqlx::query_scalar("SELECT metadata_json FROM documents WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(raw) = raw else {
            return Err(Error::not_found("Document", id));
        };
        let mut metadata: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&raw)?;
        for (key, value) in extra {
            metadata.insert(key.clone(), value.clone());
        }
        sqlx::query("UPDATE documents SET metadata_json = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&metadata)?)
            .bind(now_ts())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Deletes the document and every child row in one transaction. Any
    /// failure rolls back the whole delete. Returns false if the id was
    /// unknown.
    pub async fn delete_document_cascade(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        for table in ["chunks", "parsed_text", "document_pages", "parsing_tasks"] {
            sqlx::query(&format!("DELETE FROM {} WHERE document_id = ?", table))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    // ── pages ──────────────────────────────────────────────────────────

    /// Stores a conversion result: pages are upserted by number, numbers
    /// beyond the new count are removed, and `total_pages` is set, all in
    /// one transaction.
    pub async fn replace_pages(&self, document_id: &str, pages: &[PageImage]) -> Result<()> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;

        for page in pages {
            sqlx::query(
                r#"
                INSERT INTO document_pages (id, document_id, page_number, image_path,
                                            width, height, format, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(document_id, page_number) DO UPDATE SET
                    image_path = excluded.image_path,
                    width = excluded.width,
                    height = excluded.height,
                    format = excluded.format
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(document_id)
            .bind(page.page_number as i64)
            .bind(page.image_path.to_string_lossy().to_string())
            .bind(page.width as i64)
            .bind(page.height as i64)
            .bind(&page.format)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM document_pages WHERE document_id = ? AND page_number > ?")
            .bind(document_id)
            .bind(pages.len() as i64)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE documents SET total_pages = ?, updated_at = ? WHERE id = ?")
            .bind(pages.len() as i64)
            .bind(now)
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_pages(&self, document_id: &str) -> Result<Vec<Page>> {
        let rows =
            sqlx::query("SELECT * FROM document_pages WHERE document_id = ? ORDER BY page_number")
                .bind(document_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .iter()
            .map(page_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub async fn get_page(&self, document_id: &str, page_number: i64) -> Result<Option<Page>> {
        let row =
            sqlx::query("SELECT * FROM document_pages WHERE document_id = ? AND page_number = ?")
                .bind(document_id)
                .bind(page_number)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.as_ref().map(page_from_row).transpose()?)
    }

    pub async fn count_pages(&self, document_id: &str) -> Result<i64> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM document_pages WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    // ── parsed text ────────────────────────────────────────────────────

    /// Replaces the text for `(document, page)`. The last write for a page
    /// number wins; writing identical content twice leaves identical rows.
    pub async fn upsert_parsed_text(
        &self,
        document_id: &str,
        page_number: Option<i64>,
        content: &str,
    ) -> Result<()> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;

        let existing: Option<(String, i64)> = sqlx::query_as(
            "SELECT id, created_at FROM parsed_text WHERE document_id = ? AND page_number IS ?",
        )
        .bind(document_id)
        .bind(page_number)
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM parsed_text WHERE document_id = ? AND page_number IS ?")
            .bind(document_id)
            .bind(page_number)
            .execute(&mut *tx)
            .await?;

        let (id, created_at) = existing.unwrap_or_else(|| (Uuid::new_v4().to_string(), now));
        sqlx::query(
            "INSERT INTO parsed_text (id, document_id, page_number, content, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(document_id)
        .bind(page_number)
        .bind(content)
        .bind(created_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Whole-document rows (NULL page) first, then pages in order.
    pub async fn list_parsed_text(&self, document_id: &str) -> Result<Vec<ParsedText>> {
        let rows = sqlx::query(
            "SELECT * FROM parsed_text WHERE document_id = ? \
             ORDER BY page_number IS NOT NULL, page_number",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(parsed_text_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub async fn count_parsed_text(&self, document_id: &str) -> Result<i64> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM parsed_text WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    // ── chunks ─────────────────────────────────────────────────────────

    /// Inserts all chunks and recomputes `chunks_count` in one transaction.
    pub async fn insert_chunks(&self, document_id: &str, chunks: &[NewChunk]) -> Result<Vec<Chunk>> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(chunks.len());

        for new in chunks {
            let chunk = Chunk {
                id: Uuid::new_v4().to_string(),
                document_id: document_id.to_string(),
                content: new.content.clone(),
                source_page: new.source_page,
                start_char: new.start_char,
                end_char: new.end_char,
                tags: new.tags.clone(),
                status: ChunkStatus::Pending,
                embedding: None,
                created_at: now,
                updated_at: now,
                confirmed_at: None,
            };
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, content, source_page, start_char, end_char,
                                    tags_json, status, embedding_json, created_at, updated_at,
                                    confirmed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, NULL)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.content)
            .bind(chunk.source_page)
            .bind(chunk.start_char)
            .bind(chunk.end_char)
            .bind(serde_json::to_string(&chunk.tags)?)
            .bind(chunk.status.as_str())
            .bind(chunk.created_at)
            .bind(chunk.updated_at)
            .execute(&mut *tx)
            .await?;
            created.push(chunk);
        }

        sqlx::query(REFRESH_CHUNKS_COUNT)
            .bind(document_id)
            .bind(now)
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(created)
    }

    pub async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(chunk_from_row).transpose()?)
    }

    pub async fn require_chunk(&self, id: &str) -> Result<Chunk> {
        self.get_chunk(id)
            .await?
            .ok_or_else(|| Error::not_found("Chunk", id))
    }

    /// Ordered by source page, then creation order.
    pub async fn list_chunks(
        &self,
        document_id: &str,
        status: Option<ChunkStatus>,
        offset: i64,
        limit: i64,
    ) -> Result<Listing<Chunk>> {
        let status = status.map(|s| s.as_str());
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE document_id = ? AND (? IS NULL OR status = ?)",
        )
        .bind(document_id)
        .bind(status)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE document_id = ? AND (? IS NULL OR status = ?) \
             ORDER BY source_page, created_at, rowid LIMIT ? OFFSET ?",
        )
        .bind(document_id)
        .bind(status)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .iter()
            .map(chunk_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Listing { items, total })
    }

    pub async fn update_chunk(&self, id: &str, update: &ChunkUpdate) -> Result<Chunk> {
        let mut chunk = self.require_chunk(id).await?;
        if let Some(content) = &update.content {
            chunk.content = content.clone();
        }
        if let Some(tags) = &update.tags {
            chunk.tags = tags.clone();
        }
        if let Some(page) = update.source_page {
            chunk.source_page = page;
        }
        if let Some(embedding) = &update.embedding {
            chunk.embedding = Some(embedding.clone());
        }
        chunk.updated_at = now_ts();

        let embedding_json = chunk
            .embedding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "UPDATE chunks SET content = ?, source_page = ?, tags_json = ?, embedding_json = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(&chunk.content)
        .bind(chunk.source_page)
        .bind(serde_json::to_string(&chunk.tags)?)
        .bind(embedding_json)
        .bind(chunk.updated_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(chunk)
    }

    /// Moves a pending chunk to a terminal status.
    pub async fn set_chunk_status(&self, id: &str, next: ChunkStatus) -> Result<Chunk> {
        let chunk = self.require_chunk(id).await?;
        if !chunk.status.can_transition_to(next) {
            return Err(invalid_chunk_transition(id, chunk.status, next));
        }
        let now = now_ts();
        let confirmed_at = (next == ChunkStatus::Confirmed).then_some(now);
        let result = sqlx::query(
            "UPDATE chunks SET status = ?, updated_at = ?, confirmed_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(next.as_str())
        .bind(now)
        .bind(confirmed_at)
        .bind(id)
        .bind(chunk.status.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let current = self.require_chunk(id).await?;
            return Err(invalid_chunk_transition(id, current.status, next));
        }
        self.require_chunk(id).await
    }

    /// Deletes one chunk and recomputes its document's count.
    pub async fn delete_chunk(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let document_id: Option<String> =
            sqlx::query_scalar("SELECT document_id FROM chunks WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(document_id) = document_id else {
            return Ok(false);
        };
        sqlx::query("DELETE FROM chunks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(REFRESH_CHUNKS_COUNT)
            .bind(&document_id)
            .bind(now_ts())
            .bind(&document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    // ── parsing tasks ──────────────────────────────────────────────────

    pub async fn create_task(&self, document_id: &str) -> Result<ParsingTask> {
        let task = ParsingTask {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            status: TaskStatus::Pending,
            progress: 0.0,
            error: None,
            created_at: now_ts(),
            completed_at: None,
        };
        sqlx::query(
            "INSERT INTO parsing_tasks (id, document_id, status, progress, error, created_at, completed_at) \
             VALUES (?, ?, ?, ?, NULL, ?, NULL)",
        )
        .bind(&task.id)
        .bind(&task.document_id)
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;
        Ok(task)
    }

    pub async fn start_task(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE parsing_tasks SET status = 'processing' WHERE id = ? AND status = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_task_progress(&self, id: &str, progress: f64) -> Result<()> {
        sqlx::query("UPDATE parsing_tasks SET progress = ? WHERE id = ?")
            .bind(progress.clamp(0.0, 1.0))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn finish_task(&self, id: &str, status: TaskStatus, error: Option<&str>) -> Result<()> {
        let progress = if status == TaskStatus::Completed { Some(1.0) } else { None };
        sqlx::query(
            "UPDATE parsing_tasks SET status = ?, error = ?, completed_at = ?, \
             progress = COALESCE(?, progress) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now_ts())
        .bind(progress)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<ParsingTask>> {
        let row = sqlx::query("SELECT * FROM parsing_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(task_from_row).transpose()?)
    }

    pub async fn latest_task(&self, document_id: &str) -> Result<Option<ParsingTask>> {
        let row = sqlx::query(
            "SELECT * FROM parsing_tasks WHERE document_id = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(task_from_row).transpose()?)
    }
}

fn invalid_document_transition(id: &str, from: DocumentStatus, to: DocumentStatus) -> Error {
    Error::InvalidTransition {
        kind: "Document",
        id: id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

fn invalid_chunk_transition(id: &str, from: ChunkStatus, to: ChunkStatus) -> Error {
    Error::InvalidTransition {
        kind: "Chunk",
        id: id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

fn decode<T: std::str::FromStr<Err = String>>(raw: &str) -> std::result::Result<T, sqlx::Error> {
    raw.parse::<T>().map_err(|e| sqlx::Error::Decode(e.into()))
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: &str) -> std::result::Result<T, sqlx::Error> {
    serde_json::from_str(raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn document_from_row(row: &SqliteRow) -> std::result::Result<Document, sqlx::Error> {
    let file_type: String = row.try_get("file_type")?;
    let status: String = row.try_get("status")?;
    let metadata_json: String = row.try_get("metadata_json")?;
    Ok(Document {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        file_path: row.try_get("file_path")?,
        file_type: decode::<FileFormat>(&file_type)?,
        file_size: row.try_get("file_size")?,
        status: decode::<DocumentStatus>(&status)?,
        total_pages: row.try_get("total_pages")?,
        chunks_count: row.try_get("chunks_count")?,
        metadata: decode_json(&metadata_json)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        parsed_at: row.try_get("parsed_at")?,
    })
}

fn page_from_row(row: &SqliteRow) -> std::result::Result<Page, sqlx::Error> {
    Ok(Page {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        page_number: row.try_get("page_number")?,
        image_path: row.try_get("image_path")?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        format: row.try_get("format")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parsed_text_from_row(row: &SqliteRow) -> std::result::Result<ParsedText, sqlx::Error> {
    Ok(ParsedText {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        page_number: row.try_get("page_number")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> std::result::Result<Chunk, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let tags_json: String = row.try_get("tags_json")?;
    let embedding_json: Option<String> = row.try_get("embedding_json")?;
    Ok(Chunk {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        content: row.try_get("content")?,
        source_page: row.try_get("source_page")?,
        start_char: row.try_get("start_char")?,
        end_char: row.try_get("end_char")?,
        tags: decode_json(&tags_json)?,
        status: decode::<ChunkStatus>(&status)?,
        embedding: embedding_json
            .as_deref()
            .map(decode_json::<Vec<f32>>)
            .transpose()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        confirmed_at: row.try_get("confirmed_at")?,
    })
}

fn task_from_row(row: &SqliteRow) -> std::result::Result<ParsingTask, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(ParsingTask {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        status: decode::<TaskStatus>(&status)?,
        progress: row.try_get("progress")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use std::path::PathBuf;

    async fn store() -> Store {
        let pool = db::connect_in_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        Store::new(pool)
    }

    fn document(id: &str, created_at: i64) -> Document {
        Document {
            id: id.to_string(),
            name: format!("{}.pdf", id),
            file_path: format!("/tmp/{}.pdf", id),
            file_type: FileFormat::Pdf,
            file_size: 10,
            status: DocumentStatus::Pending,
            total_pages: 0,
            chunks_count: 0,
            metadata: serde_json::Map::new(),
            created_at,
            updated_at: created_at,
            parsed_at: None,
        }
    }

    fn page(n: u32) -> PageImage {
        PageImage {
            page_number: n,
            image_path: PathBuf::from(format!("/tmp/p/page_{:04}.png", n)),
            width: 10,
            height: 20,
            format: "png".to_string(),
        }
    }

    #[tokio::test]
    async fn list_documents_newest_first_with_filter() {
        let store = store().await;
        store.insert_document(&document("a", 100)).await.unwrap();
        store.insert_document(&document("b", 200)).await.unwrap();
        store.transition_document("a", DocumentStatus::Processing).await.unwrap();

        let all = store.list_documents(None, 0, 10).await.unwrap();
        assert_eq!(all.total, 2);
        assert_eq!(all.items[0].id, "b");

        let processing = store
            .list_documents(Some(DocumentStatus::Processing), 0, 10)
            .await
            .unwrap();
        assert_eq!(processing.total, 1);
        assert_eq!(processing.items[0].id, "a");
    }

    #[tokio::test]
    async fn unknown_status_is_rejected_on_read() {
        let store = store().await;
        store.insert_document(&document("a", 1)).await.unwrap();
        sqlx::query("UPDATE documents SET status = 'weird' WHERE id = 'a'")
            .execute(store.pool())
            .await
            .unwrap();
        let err = store.get_document("a").await.unwrap_err();
        assert!(matches!(err, Error::Database(_)));
    }

    #[tokio::test]
    async fn invalid_transition_is_refused() {
        let store = store().await;
        store.insert_document(&document("a", 1)).await.unwrap();
        let err = store
            .transition_document("a", DocumentStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn replace_pages_trims_and_counts() {
        let store = store().await;
        store.insert_document(&document("a", 1)).await.unwrap();
        store
            .replace_pages("a", &[page(1), page(2), page(3)])
            .await
            .unwrap();
        store.replace_pages("a", &[page(1), page(2)]).await.unwrap();

        let pages = store.list_pages("a").await.unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(store.require_document("a").await.unwrap().total_pages, 2);
    }

    #[tokio::test]
    async fn completion_needs_pages_and_finished_task() {
        let store = store().await;
        store.insert_document(&document("a", 1)).await.unwrap();
        store.transition_document("a", DocumentStatus::Processing).await.unwrap();

        let task = store.create_task("a").await.unwrap();
        store.finish_task(&task.id, TaskStatus::Completed, None).await.unwrap();
        assert!(!store.try_complete_document("a").await.unwrap());

        store.replace_pages("a", &[page(1)]).await.unwrap();
        assert!(store.try_complete_document("a").await.unwrap());
        let doc = store.require_document("a").await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
        assert!(doc.parsed_at.is_some());
        assert!(!store.try_complete_document("a").await.unwrap());
    }

    #[tokio::test]
    async fn parsed_text_upsert_replaces_by_page() {
        let store = store().await;
        store.insert_document(&document("a", 1)).await.unwrap();
        store.upsert_parsed_text("a", Some(1), "one").await.unwrap();
        store.upsert_parsed_text("a", Some(1), "uno").await.unwrap();
        store.upsert_parsed_text("a", None, "whole").await.unwrap();
        store.upsert_parsed_text("a", None, "whole").await.unwrap();

        let rows = store.list_parsed_text("a").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].page_number, None);
        assert_eq!(rows[1].content, "uno");
    }

    #[tokio::test]
    async fn chunk_count_tracks_inserts_and_deletes() {
        let store = store().await;
        store.insert_document(&document("a", 1)).await.unwrap();
        let new = NewChunk {
            content: "x".into(),
            source_page: 1,
            ..Default::default()
        };
        let chunks = store
            .insert_chunks("a", &[new.clone(), new.clone(), new])
            .await
            .unwrap();
        assert_eq!(store.require_document("a").await.unwrap().chunks_count, 3);

        assert!(store.delete_chunk(&chunks[0].id).await.unwrap());
        assert!(!store.delete_chunk(&chunks[0].id).await.unwrap());
        assert_eq!(store.require_document("a").await.unwrap().chunks_count, 2);
    }

    #[tokio::test]
    async fn confirm_sets_timestamp_once() {
        let store = store().await;
        store.insert_document(&document("a", 1)).await.unwrap();
        let chunk = store
            .insert_chunks("a", &[NewChunk { content: "x".into(), source_page: 1, ..Default::default() }])
            .await
            .unwrap()
            .remove(0);

        let confirmed = store.set_chunk_status(&chunk.id, ChunkStatus::Confirmed).await.unwrap();
        assert!(confirmed.confirmed_at.is_some());
        assert!(store
            .set_chunk_status(&chunk.id, ChunkStatus::Archived)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn restart_clears_text_and_pending_chunks() {
        let store = store().await;
        store.insert_document(&document("a", 1)).await.unwrap();
        store.transition_document("a", DocumentStatus::Processing).await.unwrap();
        store.replace_pages("a", &[page(1), page(2)]).await.unwrap();
        store.upsert_parsed_text("a", Some(1), "one").await.unwrap();
        store.upsert_parsed_text("a", Some(2), "two").await.unwrap();
        let chunk = |content: &str| NewChunk {
            content: content.into(),
            source_page: 1,
            ..Default::default()
        };
        let chunks = store
            .insert_chunks("a", &[chunk("kept"), chunk("dropped")])
            .await
            .unwrap();
        store
            .set_chunk_status(&chunks[0].id, ChunkStatus::Confirmed)
            .await
            .unwrap();
        assert!(store.mark_document_failed("a").await.unwrap());

        let doc = store.restart_document("a").await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Processing);
        assert_eq!(doc.total_pages, 0);
        assert_eq!(doc.chunks_count, 1);
        assert_eq!(store.count_parsed_text("a").await.unwrap(), 0);
        assert_eq!(store.count_pages("a").await.unwrap(), 0);
        assert!(store.get_chunk(&chunks[0].id).await.unwrap().is_some());
        assert!(store.get_chunk(&chunks[1].id).await.unwrap().is_none());

        let err = store.restart_document("a").await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn cascade_delete_removes_children() {
        let store = store().await;
        store.insert_document(&document("a", 1)).await.unwrap();
        store.replace_pages("a", &[page(1)]).await.unwrap();
        store.upsert_parsed_text("a", Some(1), "t").await.unwrap();
        store.create_task("a").await.unwrap();
        store
            .insert_chunks("a", &[NewChunk { content: "x".into(), source_page: 1, ..Default::default() }])
            .await
            .unwrap();

        assert!(store.delete_document_cascade("a").await.unwrap());
        for table in ["chunks", "parsed_text", "document_pages", "parsing_tasks"] {
            let n: i64 = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {} WHERE document_id = 'a'",
                table
            ))
            .fetch_one(store.pool())
            .await
            .unwrap();
            assert_eq!(n, 0, "{} not emptied", table);
        }
        assert!(!store.delete_document_cascade("a").await.unwrap());
    }
}
