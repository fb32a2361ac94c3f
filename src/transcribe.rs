//! PDF page transcription through a vision completion service.
//!
//! A page is rendered to PNG, sent with an instruction, and the service's
//! cumulative stream is turned into increments by [`DeltaTracker`]. Each
//! event is cleaned with [`clean_transcript`] before diffing, so the
//! increments concatenate to clean Markdown.
//!
//! Any failure ends the stream with one [`ERROR_MARKER`]-prefixed item.
//! Nothing is retried.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};

use crate::clean::clean_transcript;
use crate::completion::VisionCompletion;
use crate::parsers::{page_file_name, PageRenderer};

pub const DEFAULT_TRANSCRIBE_PROMPT: &str = "Extract all text from this page image and output it as Markdown. \
Preserve the original structure: headings, paragraphs, lists and tables. \
Output only the page content, without explanations or code fences.";

pub const ERROR_MARKER: &str = "[error]";

pub fn is_error_marker(fragment: &str) -> bool {
    fragment.starts_with(ERROR_MARKER)
}

/// Converts cumulative snapshots into increments.
///
/// A snapshot that extends the emitted text yields the new suffix. A
/// shorter one is noise and yields nothing. One that diverges restarts the
/// output and yields the whole snapshot.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    emitted: String,
}

impl DeltaTracker {
    pub fn push(&mut self, snapshot: &str) -> Option<String> {
        if snapshot.is_empty() {
            return None;
        }
        if !self.emitted.is_empty() && snapshot.starts_with(&self.emitted) {
            let delta = &snapshot[self.emitted.len()..];
            if delta.is_empty() {
                return None;
            }
            let delta = delta.to_string();
            self.emitted = snapshot.to_string();
            return Some(delta);
        }
        if snapshot.len() < self.emitted.len() {
            return None;
        }
        self.emitted = snapshot.to_string();
        Some(snapshot.to_string())
    }

    pub fn text(&self) -> &str {
        &self.emitted
    }
}

pub struct Transcriber {
    renderer: Arc<dyn PageRenderer>,
    vision: Arc<dyn VisionCompletion>,
    dpi: u32,
    prompt: String,
    scratch_dir: PathBuf,
}

impl Transcriber {
    pub fn new(
        renderer: Arc<dyn PageRenderer>,
        vision: Arc<dyn VisionCompletion>,
        dpi: u32,
        prompt: Option<String>,
        scratch_dir: PathBuf,
    ) -> Self {
        Self {
            renderer,
            vision,
            dpi,
            prompt: prompt.unwrap_or_else(|| DEFAULT_TRANSCRIBE_PROMPT.to_string()),
            scratch_dir,
        }
    }

    /// Streams the transcription of one page as increments. Each call
    /// issues a fresh request.
    pub fn transcribe_page_stream(
        &self,
        file: &Path,
        page_number: u32,
        prompt: Option<&str>,
    ) -> BoxStream<'static, String> {
        let renderer = self.renderer.clone();
        let vision = self.vision.clone();
        let dpi = self.dpi;
        let file = file.to_path_buf();
        let scratch_dir = self.scratch_dir.clone();
        let instruction = prompt.unwrap_or(self.prompt.as_str()).to_string();

        async_stream::stream! {
            let image = match render_png(renderer, file, page_number, dpi, scratch_dir).await {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!(page = page_number, error = %e, "page render failed");
                    yield format!("{} {}", ERROR_MARKER, e);
                    return;
                }
            };

            let mut events = vision.stream_image(image, instruction);
            let mut tracker = DeltaTracker::default();
            while let Some(event) = events.next().await {
                match event {
                    Ok(snapshot) => {
                        if let Some(delta) = tracker.push(&clean_transcript(&snapshot)) {
                            yield delta;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(page = page_number, error = %e, "transcription failed");
                        yield format!("{} {}", ERROR_MARKER, e);
                        return;
                    }
                }
            }
        }
        .boxed()
    }

    /// Collects a page's stream. `Err` carries the error marker text.
    pub async fn transcribe_page(
        &self,
        file: &Path,
        page_number: u32,
        prompt: Option<&str>,
    ) -> Result<String, String> {
        let mut stream = self.transcribe_page_stream(file, page_number, prompt);
        let mut text = String::new();
        while let Some(fragment) = stream.next().await {
            if is_error_marker(&fragment) {
                return Err(fragment);
            }
            text.push_str(&fragment);
        }
        Ok(text)
    }
}

/// Renders one page into a private temp dir and returns the PNG bytes.
async fn render_png(
    renderer: Arc<dyn PageRenderer>,
    file: PathBuf,
    page_number: u32,
    dpi: u32,
    scratch_dir: PathBuf,
) -> anyhow::Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
        std::fs::create_dir_all(&scratch_dir)?;
        let dir = tempfile::TempDir::new_in(&scratch_dir)?;
        let dest = dir.path().join(page_file_name(page_number, "png"));
        renderer.render_page(&file, page_number, dpi, &dest)?;
        Ok(std::fs::read(&dest)?)
    })
    .await?
}
