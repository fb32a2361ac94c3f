//! Text extraction for one document at a time, bounded system-wide.
//!
//! A parse holds a document permit for its whole run; at most
//! `max_concurrent_documents` parses run at once. Each run is tracked by a
//! [`ParsingTask`](crate::models::ParsingTask).
//!
//! PDFs are transcribed page by page through a [`WorkerPool`] of
//! `max_concurrent_pages` workers. Transcription needs the page count from
//! image conversion, which runs as a sibling task; the parse waits for it
//! through [`ConversionSignals`] and a database poll, bounded by
//! `page_wait_secs`. Giving up only fails the task: the document's status is
//! settled by the processing job once conversion has ended too.
//!
//! Every other format is normalized to Markdown in one pass and stored as
//! whole-document text.
//!
//! The document reaches COMPLETED only through
//! [`Store::try_complete_document`], called by whichever of the two sibling
//! steps finishes last.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::clean::{clean_transcript, dedup_lines};
use crate::config::ParsingConfig;
use crate::error::Result;
use crate::markdown::to_markdown;
use crate::models::{Document, DocumentStatus, TaskStatus};
use crate::pool::WorkerPool;
use crate::progress::{ParseProgressEvent, ParseProgressReporter};
use crate::store::Store;
use crate::transcribe::Transcriber;

/// State of a document's page-image conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionState {
    Running,
    Done { pages: u32 },
    Failed,
}

/// Per-document completion signals from image conversion to text
/// extraction.
#[derive(Default)]
pub struct ConversionSignals {
    channels: Mutex<HashMap<String, watch::Sender<ConversionState>>>,
}

impl ConversionSignals {
    fn channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, watch::Sender<ConversionState>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks a conversion as running, replacing any earlier state.
    pub fn begin(&self, document_id: &str) {
        let mut channels = self.channels();
        match channels.get(document_id) {
            Some(tx) => {
                tx.send_replace(ConversionState::Running);
            }
            None => {
                let (tx, _rx) = watch::channel(ConversionState::Running);
                channels.insert(document_id.to_string(), tx);
            }
        }
    }

    pub fn finish(&self, document_id: &str, state: ConversionState) {
        if let Some(tx) = self.channels().get(document_id) {
            tx.send_replace(state);
        }
    }

    pub fn subscribe(&self, document_id: &str) -> Option<watch::Receiver<ConversionState>> {
        self.channels().get(document_id).map(|tx| tx.subscribe())
    }

    pub fn forget(&self, document_id: &str) {
        self.channels().remove(document_id);
    }
}

/// How a parse run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// Text stored and the document is COMPLETED.
    Completed,
    /// Text stored; page conversion is still running and will complete it.
    AwaitingImages,
    /// No page images appeared in time. The document status is unchanged.
    PagesTimedOut,
    /// The document was marked FAILED.
    Failed(String),
}

pub struct TextParsingService {
    store: Store,
    transcriber: Arc<Transcriber>,
    signals: Arc<ConversionSignals>,
    documents: Arc<Semaphore>,
    max_concurrent_pages: usize,
    page_wait: Duration,
    page_poll: Duration,
}

impl TextParsingService {
    pub fn new(
        store: Store,
        transcriber: Arc<Transcriber>,
        signals: Arc<ConversionSignals>,
        config: &ParsingConfig,
    ) -> Self {
        Self {
            store,
            transcriber,
            signals,
            documents: Arc::new(Semaphore::new(config.max_concurrent_documents.max(1))),
            max_concurrent_pages: config.max_concurrent_pages.max(1),
            page_wait: Duration::from_secs(config.page_wait_secs),
            page_poll: Duration::from_millis(config.page_poll_millis.max(1)),
        }
    }

    pub fn signals(&self) -> Arc<ConversionSignals> {
        self.signals.clone()
    }

    /// Runs [`parse_document`](Self::parse_document) in the background.
    pub fn spawn_parse(
        self: &Arc<Self>,
        document: Document,
        reporter: Arc<dyn ParseProgressReporter>,
    ) -> JoinHandle<Result<ParseOutcome>> {
        let this = self.clone();
        tokio::spawn(async move { this.parse_document(&document, reporter.as_ref()).await })
    }

    /// Extracts and stores the document's text. A database error fails the
    /// task and the document before it is returned.
    pub async fn parse_document(
        &self,
        document: &Document,
        reporter: &dyn ParseProgressReporter,
    ) -> Result<ParseOutcome> {
        let _permit = self.documents.acquire().await.ok();

        let task = self.store.create_task(&document.id).await?;
        self.store.start_task(&task.id).await?;
        tracing::info!(
            document_id = %document.id,
            task_id = %task.id,
            format = %document.file_type,
            "parse started"
        );

        let outcome = match self.run(document, &task.id, reporter).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(document_id = %document.id, error = %e, "parse failed");
                let message = e.to_string();
                if let Err(e) = self
                    .store
                    .finish_task(&task.id, TaskStatus::Failed, Some(&message))
                    .await
                {
                    tracing::error!(task_id = %task.id, error = %e, "could not record task failure");
                }
                if let Err(e) = self.store.mark_document_failed(&document.id).await {
                    tracing::error!(document_id = %document.id, error = %e, "could not mark document failed");
                }
                return Err(e);
            }
        };

        let status = match &outcome {
            ParseOutcome::Completed => DocumentStatus::Completed,
            ParseOutcome::AwaitingImages | ParseOutcome::PagesTimedOut => DocumentStatus::Processing,
            ParseOutcome::Failed(_) => DocumentStatus::Failed,
        };
        reporter.report(ParseProgressEvent::Finished {
            document_id: document.id.clone(),
            status,
        });
        Ok(outcome)
    }

    async fn run(
        &self,
        document: &Document,
        task_id: &str,
        reporter: &dyn ParseProgressReporter,
    ) -> Result<ParseOutcome> {
        let file = PathBuf::from(&document.file_path);

        let stored_any = if document.file_type.is_paginated() {
            reporter.report(ParseProgressEvent::WaitingForPages {
                document_id: document.id.clone(),
            });
            let Some(total) = self.wait_for_pages(&document.id).await? else {
                tracing::warn!(
                    document_id = %document.id,
                    wait_secs = self.page_wait.as_secs(),
                    "no page images appeared; parse abandoned"
                );
                self.store
                    .finish_task(task_id, TaskStatus::Failed, Some("timed out waiting for page images"))
                    .await?;
                reporter.report(ParseProgressEvent::PagesTimedOut {
                    document_id: document.id.clone(),
                    waited_secs: self.page_wait.as_secs(),
                });
                return Ok(ParseOutcome::PagesTimedOut);
            };
            self.transcribe_pages(document, file, total, task_id, reporter)
                .await?
        } else {
            self.normalize(document, file).await?
        };

        if !stored_any {
            let reason = "no text could be extracted".to_string();
            self.store
                .finish_task(task_id, TaskStatus::Failed, Some(&reason))
                .await?;
            self.store.mark_document_failed(&document.id).await?;
            tracing::warn!(document_id = %document.id, "{}", reason);
            return Ok(ParseOutcome::Failed(reason));
        }

        self.store
            .finish_task(task_id, TaskStatus::Completed, None)
            .await?;
        if self.store.try_complete_document(&document.id).await? {
            tracing::info!(document_id = %document.id, "document completed");
            Ok(ParseOutcome::Completed)
        } else {
            tracing::info!(document_id = %document.id, "text stored; waiting for page images");
            Ok(ParseOutcome::AwaitingImages)
        }
    }

    /// Page count once conversion has stored pages, or `None` when it failed
    /// or the wait ran out.
    async fn wait_for_pages(&self, document_id: &str) -> Result<Option<u32>> {
        let deadline = Instant::now() + self.page_wait;
        let mut signal = self.signals.subscribe(document_id);

        loop {
            let count = self.store.count_pages(document_id).await?;
            if count > 0 {
                return Ok(Some(count as u32));
            }
            if let Some(rx) = &signal {
                if *rx.borrow() == ConversionState::Failed {
                    return Ok(None);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = self.page_poll.min(deadline - now);
            let mut closed = false;
            match signal.as_mut() {
                Some(rx) => {
                    if let Ok(Err(_)) = tokio::time::timeout(nap, rx.changed()).await {
                        closed = true;
                    }
                }
                None => tokio::time::sleep(nap).await,
            }
            if closed {
                signal = None;
            }
        }
    }

    /// Transcribes every page through the page pool. Returns whether any
    /// page produced text.
    async fn transcribe_pages(
        &self,
        document: &Document,
        file: PathBuf,
        total: u32,
        task_id: &str,
        reporter: &dyn ParseProgressReporter,
    ) -> Result<bool> {
        let mut pool = WorkerPool::new(self.max_concurrent_pages);
        for page in 1..=total {
            let transcriber = self.transcriber.clone();
            let file = file.clone();
            pool.submit(async move { (page, transcriber.transcribe_page(&file, page, None).await) });
        }

        let mut done: u64 = 0;
        let mut stored_any = false;
        while let Some(joined) = pool.next_completed().await {
            done += 1;
            let (page, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(document_id = %document.id, error = %e, "page worker died");
                    continue;
                }
            };

            match result {
                Ok(raw) => {
                    let text = dedup_lines(&clean_transcript(&raw));
                    if text.is_empty() {
                        tracing::debug!(document_id = %document.id, page, "page has no text");
                    } else {
                        self.store
                            .upsert_parsed_text(&document.id, Some(page as i64), &text)
                            .await?;
                        stored_any = true;
                    }
                }
                Err(marker) => {
                    tracing::warn!(document_id = %document.id, page, error = %marker, "page left without text");
                }
            }

            self.store
                .set_task_progress(task_id, done as f64 / total as f64)
                .await?;
            reporter.report(ParseProgressEvent::Page {
                document_id: document.id.clone(),
                page,
                done,
                total: total as u64,
            });
        }
        Ok(stored_any)
    }

    /// One Markdown pass for non-paginated formats, stored as whole-document
    /// text. Returns whether it produced text; a parser failure counts as
    /// no text.
    async fn normalize(&self, document: &Document, file: PathBuf) -> Result<bool> {
        let format = document.file_type;
        let converted = tokio::task::spawn_blocking(move || to_markdown(&file, format)).await;

        let markdown = match converted {
            Ok(Ok(markdown)) => markdown,
            Ok(Err(e)) => {
                tracing::warn!(document_id = %document.id, error = %e, "markdown conversion failed");
                return Ok(false);
            }
            Err(e) => {
                tracing::warn!(document_id = %document.id, error = %e, "markdown conversion panicked");
                return Ok(false);
            }
        };

        let text = markdown.trim();
        if text.is_empty() {
            return Ok(false);
        }
        self.store
            .upsert_parsed_text(&document.id, None, text)
            .await?;
        Ok(true)
    }
}
