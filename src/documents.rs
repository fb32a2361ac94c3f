//! Document lifecycle: upload, page conversion, re-parse, archive, delete.
//!
//! An accepted upload is stored under `storage.documents_dir` as
//! `<id>.<ext>`, recorded PENDING, and moved to PROCESSING. Two sibling
//! steps then run in the background: page-image conversion (here) and text
//! extraction ([`TextParsingService`]). The last one to finish completes
//! the document; either one failing marks it FAILED. A document still
//! PROCESSING once both have ended is marked FAILED too.
//!
//! Page images live in `storage.pages_dir/<id>/page_NNNN.<ext>`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, ParserError, Result};
use crate::models::{Document, DocumentStatus, FileFormat, Listing, Page, ParsedText, ParsingTask};
use crate::parsers::{DocumentParser, PageImage, ParserRegistry};
use crate::parsing::{ConversionState, TextParsingService};
use crate::progress::{NoProgress, ParseProgressReporter};
use crate::store::{now_ts, Store};

const COPY_BUFFER: usize = 64 * 1024;

type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Clone)]
pub struct DocumentService {
    store: Store,
    config: Arc<Config>,
    parsers: ParserRegistry,
    parsing: Arc<TextParsingService>,
    reporter: Arc<dyn ParseProgressReporter>,
    jobs: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl DocumentService {
    pub fn new(
        store: Store,
        config: Arc<Config>,
        parsers: ParserRegistry,
        parsing: Arc<TextParsingService>,
    ) -> Self {
        Self {
            store,
            config,
            parsers,
            parsing,
            reporter: Arc::new(NoProgress),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Reports parse progress of background jobs to `reporter`.
    pub fn with_progress(mut self, reporter: Arc<dyn ParseProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn page_dir(&self, document_id: &str) -> PathBuf {
        self.config.storage.pages_dir.join(document_id)
    }

    /// Format of `filename` if it is on the allow-list.
    pub fn accepted_format(&self, filename: &str) -> Result<FileFormat> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        let format = FileFormat::from_filename(filename)
            .filter(|f| {
                self.config
                    .parsing
                    .supported_formats
                    .iter()
                    .any(|s| s == f.as_str() || *s == extension)
            })
            .ok_or_else(|| {
                Error::UnsupportedFormat(if extension.is_empty() {
                    filename.to_string()
                } else {
                    extension.clone()
                })
            })?;
        Ok(format)
    }

    /// Stores an uploaded file and starts processing it. Rejections create
    /// no row and leave no file behind.
    pub async fn upload_document<R>(
        &self,
        reader: R,
        filename: &str,
        display_name: Option<&str>,
    ) -> Result<Document>
    where
        R: AsyncRead + Unpin,
    {
        let format = self.accepted_format(filename)?;
        let id = Uuid::new_v4().to_string();
        let extension = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_else(|| format.as_str().to_string());

        let documents_dir = &self.config.storage.documents_dir;
        tokio::fs::create_dir_all(documents_dir).await?;
        let dest = documents_dir.join(format!("{}.{}", id, extension));

        let (size, sha256) = match self.store_upload(reader, &dest).await {
            Ok(stored) => stored,
            Err(e) => {
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(e);
            }
        };

        let name = display_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(filename)
            .to_string();
        let mut metadata = Metadata::new();
        metadata.insert("original_filename".into(), filename.into());
        metadata.insert("sha256".into(), sha256.into());

        let now = now_ts();
        let document = Document {
            id: id.clone(),
            name,
            file_path: dest.display().to_string(),
            file_type: format,
            file_size: size as i64,
            status: DocumentStatus::Pending,
            total_pages: 0,
            chunks_count: 0,
            metadata,
            created_at: now,
            updated_at: now,
            parsed_at: None,
        };
        if let Err(e) = self.store.insert_document(&document).await {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(e);
        }
        tracing::info!(document_id = %id, format = %format, bytes = size, "document uploaded");

        let document = self
            .store
            .transition_document(&id, DocumentStatus::Processing)
            .await?;
        self.start_processing(document.clone());
        Ok(document)
    }

    /// Uploads a file from disk, named by its file name.
    pub async fn upload_path(&self, path: &Path, display_name: Option<&str>) -> Result<Document> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidArgument(format!("not a file path: {}", path.display())))?
            .to_string();
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ParserError::unreadable(path, e))?;
        self.upload_document(file, &filename, display_name).await
    }

    /// Copies at most `max_file_size` bytes to `dest`, hashing as it goes.
    async fn store_upload<R>(&self, reader: R, dest: &Path) -> Result<(u64, String)>
    where
        R: AsyncRead + Unpin,
    {
        let limit = self.config.parsing.max_file_size;
        let mut limited = reader.take(limit + 1);
        let mut out = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut written: u64 = 0;

        loop {
            let n = limited.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            written += n as u64;
            if written > limit {
                return Err(Error::FileTooLarge { limit });
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
        }
        out.flush().await?;
        Ok((written, format!("{:x}", hasher.finalize())))
    }

    fn start_processing(&self, document: Document) {
        let signals = self.parsing.signals();
        signals.begin(&document.id);

        let this = self.clone();
        let id = document.id.clone();
        let handle = tokio::spawn(async move {
            let reporter = this.reporter.clone();
            let (converted, parsed) = tokio::join!(
                this.convert_pages(&document),
                this.parsing.parse_document(&document, reporter.as_ref())
            );
            if let Err(e) = converted {
                tracing::error!(document_id = %document.id, error = %e, "page conversion error");
            }
            match parsed {
                Ok(outcome) => {
                    tracing::debug!(document_id = %document.id, ?outcome, "parse finished")
                }
                Err(e) => tracing::error!(document_id = %document.id, error = %e, "parse error"),
            }
            signals.forget(&document.id);
            this.settle(&document.id).await;
        });
        self.jobs().insert(id, handle);
    }

    /// Both sibling steps have ended. A document neither of them completed
    /// (for instance after the parse gave up waiting for pages) can no longer
    /// leave PROCESSING on its own, so it is marked FAILED.
    async fn settle(&self, id: &str) {
        match self.store.mark_document_failed(id).await {
            Ok(true) => {
                tracing::warn!(document_id = %id, "processing ended without completing; document failed")
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(document_id = %id, error = %e, "could not settle document status")
            }
        }
    }

    /// Waits for the background processing of a document, if any, and
    /// returns its current row.
    pub async fn wait_for_processing(&self, id: &str) -> Result<Document> {
        let handle = self.jobs().remove(id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(document_id = %id, error = %e, "processing job ended abnormally");
            }
        }
        self.store.require_document(id).await
    }

    async fn convert_pages(&self, document: &Document) -> Result<()> {
        match self.convert_pages_inner(document).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.conversion_failed(document, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn convert_pages_inner(&self, document: &Document) -> Result<()> {
        let parser: Arc<dyn DocumentParser> = Arc::from(self.parsers.parser_for(document.file_type));
        let file = PathBuf::from(&document.file_path);
        let out_dir = self.page_dir(&document.id);

        let converted = {
            let parser = parser.clone();
            let file = file.clone();
            tokio::task::spawn_blocking(move || -> std::result::Result<Vec<PageImage>, ParserError> {
                if out_dir.exists() {
                    let _ = std::fs::remove_dir_all(&out_dir);
                }
                parser.convert_to_images(&file, &out_dir)
            })
            .await
        };

        let images = match converted {
            Ok(Ok(images)) if !images.is_empty() => images,
            Ok(Ok(_)) => {
                self.conversion_failed(document, "conversion produced no pages").await;
                return Ok(());
            }
            Ok(Err(e)) => {
                self.conversion_failed(document, &e.to_string()).await;
                return Ok(());
            }
            Err(e) => {
                self.conversion_failed(document, &format!("conversion task failed: {}", e))
                    .await;
                return Ok(());
            }
        };

        self.store.replace_pages(&document.id, &images).await?;
        let pages = images.len() as u32;
        tracing::info!(document_id = %document.id, pages, "page images stored");

        let mut metadata = match tokio::task::spawn_blocking(move || parser.parse(&file)).await {
            Ok(Ok(parsed)) => parsed.metadata,
            Ok(Err(e)) => {
                tracing::debug!(document_id = %document.id, error = %e, "no parser metadata");
                Metadata::new()
            }
            Err(e) => {
                tracing::debug!(document_id = %document.id, error = %e, "parser metadata task failed");
                Metadata::new()
            }
        };
        metadata.insert(
            "page_format".into(),
            images[0].format.clone().into(),
        );
        self.store
            .merge_document_metadata(&document.id, &metadata)
            .await?;

        self.parsing
            .signals()
            .finish(&document.id, ConversionState::Done { pages });
        if self.store.try_complete_document(&document.id).await? {
            tracing::info!(document_id = %document.id, "document completed");
        }
        Ok(())
    }

    async fn conversion_failed(&self, document: &Document, reason: &str) {
        tracing::warn!(document_id = %document.id, reason, "page conversion failed");
        self.parsing
            .signals()
            .finish(&document.id, ConversionState::Failed);
        let mut metadata = Metadata::new();
        metadata.insert("conversion_error".into(), reason.into());
        if let Err(e) = self.store.merge_document_metadata(&document.id, &metadata).await {
            tracing::warn!(document_id = %document.id, error = %e, "could not record conversion error");
        }
        if let Err(e) = self.store.mark_document_failed(&document.id).await {
            tracing::error!(document_id = %document.id, error = %e, "could not mark document failed");
        }
    }

    pub async fn get_document(&self, id: &str) -> Result<Document> {
        self.store.require_document(id).await
    }

    pub async fn list_documents(
        &self,
        status: Option<DocumentStatus>,
        page: u32,
        page_size: Option<u32>,
    ) -> Result<Listing<Document>> {
        let (offset, limit) = self.config.api.window(page, page_size);
        self.store.list_documents(status, offset, limit).await
    }

    pub async fn list_pages(&self, id: &str) -> Result<Vec<Page>> {
        self.store.require_document(id).await?;
        self.store.list_pages(id).await
    }

    pub async fn get_page(&self, id: &str, page_number: i64) -> Result<Page> {
        self.store
            .get_page(id, page_number)
            .await?
            .ok_or_else(|| Error::not_found("Page", format!("{}#{}", id, page_number)))
    }

    /// Text of one page, or of the whole document when `page` is `None`
    /// (page texts joined by a blank line). `None` when nothing is stored.
    pub async fn get_parsed_text(&self, id: &str, page: Option<i64>) -> Result<Option<String>> {
        self.store.require_document(id).await?;
        let rows = self.store.list_parsed_text(id).await?;
        Ok(match page {
            Some(n) => rows
                .into_iter()
                .find(|r| r.page_number == Some(n))
                .map(|r| r.content),
            None if rows.is_empty() => None,
            None => Some(
                rows.iter()
                    .map(|r| r.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            ),
        })
    }

    pub async fn list_parsed_text_pages(&self, id: &str) -> Result<Vec<ParsedText>> {
        self.store.require_document(id).await?;
        self.store.list_parsed_text(id).await
    }

    pub async fn latest_task(&self, id: &str) -> Result<Option<ParsingTask>> {
        self.store.latest_task(id).await
    }

    pub async fn get_parsing_task(&self, task_id: &str) -> Result<ParsingTask> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::not_found("ParsingTask", task_id))
    }

    pub async fn archive_document(&self, id: &str) -> Result<Document> {
        let document = self
            .store
            .transition_document(id, DocumentStatus::Archived)
            .await?;
        tracing::info!(document_id = %id, "document archived");
        Ok(document)
    }

    /// Re-runs conversion and text extraction for a COMPLETED or FAILED
    /// document.
    pub async fn reparse_document(&self, id: &str) -> Result<Document> {
        let document = self.store.restart_document(id).await?;
        tracing::info!(document_id = %id, "re-parse started");
        self.start_processing(document.clone());
        Ok(document)
    }

    /// Deletes the source file and page images (best effort), then the
    /// document and all its rows in one transaction.
    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        let Some(document) = self.store.get_document(id).await? else {
            return Ok(false);
        };
        let job = self.jobs().remove(id);
        if let Some(job) = job {
            job.abort();
        }
        self.parsing.signals().forget(id);

        if let Err(e) = tokio::fs::remove_file(&document.file_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(document_id = %id, error = %e, "could not delete source file");
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(self.page_dir(id)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(document_id = %id, error = %e, "could not delete page images");
            }
        }

        let deleted = self.store.delete_document_cascade(id).await?;
        tracing::info!(document_id = %id, "document deleted");
        Ok(deleted)
    }
}
