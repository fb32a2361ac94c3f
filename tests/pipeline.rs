use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use lopdf::{Dictionary, Object, Stream};
use tempfile::TempDir;

use pagemill::app::App;
use pagemill::chunk::{ChunkParams, ChunkerKind, Tier};
use pagemill::completion::{DisabledClient, VisionCompletion};
use pagemill::config::Config;
use pagemill::error::{CompletionError, ParserError};
use pagemill::models::{
    ChunkStatus, Document, DocumentStatus, FileFormat, NewChunk, TaskStatus,
};
use pagemill::parsers::{ImageFormat, PageRenderer, ParserRegistry};
use pagemill::parsing::ParseOutcome;
use pagemill::progress::NoProgress;
use pagemill::{db, migrate, Error};

/// Writes a 1-pixel-high image whose width is the page number, so the
/// fake vision client can tell pages apart.
struct PagedRenderer;

impl PageRenderer for PagedRenderer {
    fn render_page(
        &self,
        _file: &Path,
        page_number: u32,
        _dpi: u32,
        dest: &Path,
    ) -> Result<(), ParserError> {
        image::RgbImage::new(page_number, 1)
            .save(dest)
            .map_err(|e| ParserError::invalid("pdf", e))
    }
}

/// Renders like [`PagedRenderer`], but too slowly for a short page wait.
struct SlowRenderer(Duration);

impl PageRenderer for SlowRenderer {
    fn render_page(
        &self,
        file: &Path,
        page_number: u32,
        dpi: u32,
        dest: &Path,
    ) -> Result<(), ParserError> {
        std::thread::sleep(self.0);
        PagedRenderer.render_page(file, page_number, dpi, dest)
    }
}

struct BrokenRenderer;

impl PageRenderer for BrokenRenderer {
    fn render_page(&self, _: &Path, _: u32, _: u32, _: &Path) -> Result<(), ParserError> {
        Err(ParserError::invalid("pdf", "renderer unavailable"))
    }
}

/// Streams "Alpha" for page 1 and "Beta" for page 2 as cumulative events.
struct PageVision;

impl VisionCompletion for PageVision {
    fn stream_image(
        &self,
        image_png: Vec<u8>,
        _instruction: String,
    ) -> BoxStream<'static, Result<String, CompletionError>> {
        let width = image::load_from_memory(&image_png)
            .map(|img| img.width())
            .unwrap_or(0);
        let events = match width {
            1 => vec!["Al", "Alpha"],
            2 => vec!["Be", "Beta"],
            _ => vec![],
        };
        stream::iter(events.into_iter().map(|s| Ok(s.to_string()))).boxed()
    }
}

fn test_config(root: &Path) -> Config {
    let mut config = Config::rooted_at(root);
    config.completion.provider = "disabled".into();
    config.parsing.page_wait_secs = 10;
    config.parsing.page_poll_millis = 20;
    config
}

async fn build_app(config: Config, renderer: Arc<dyn PageRenderer>) -> App {
    let pool = db::connect_in_memory().await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    App::with_parts(
        config,
        pool,
        renderer,
        Arc::new(DisabledClient),
        Arc::new(PageVision),
    )
    .unwrap()
}

fn write_pdf(path: &Path, pages: usize) {
    let mut doc = lopdf::Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let mut kids = Vec::new();
    for _ in 0..pages {
        let content_id = doc.add_object(Stream::new(Dictionary::new(), Vec::new()));
        let mut page = Dictionary::new();
        page.set("Type", Object::Name(b"Page".to_vec()));
        page.set("Parent", Object::Reference(pages_id));
        page.set("Contents", Object::Reference(content_id));
        page.set("Resources", Object::Dictionary(Dictionary::new()));
        kids.push(Object::Reference(doc.add_object(page)));
    }

    let mut tree = Dictionary::new();
    tree.set("Type", Object::Name(b"Pages".to_vec()));
    tree.set("Count", Object::Integer(pages as i64));
    tree.set("Kids", Object::Array(kids));
    tree.set(
        "MediaBox",
        Object::Array(vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(595),
            Object::Integer(842),
        ]),
    );
    doc.objects.insert(pages_id, Object::Dictionary(tree));

    let mut catalog = Dictionary::new();
    catalog.set("Type", Object::Name(b"Catalog".to_vec()));
    catalog.set("Pages", Object::Reference(pages_id));
    let catalog_id = doc.add_object(catalog);
    doc.trailer.set("Root", Object::Reference(catalog_id));

    doc.save(path).unwrap();
}

fn write_docx(path: &Path, paragraphs: &[&str]) {
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
        .collect();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{}</w:body></w:document>"#,
        body
    );
    let mut zip = zip::ZipWriter::new(fs::File::create(path).unwrap());
    zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
        .unwrap();
    zip.write_all(xml.as_bytes()).unwrap();
    zip.finish().unwrap();
}

fn write_xlsx(path: &Path, sheets: usize) {
    let mut zip = zip::ZipWriter::new(fs::File::create(path).unwrap());
    for n in 1..=sheets {
        let xml = format!(
            r#"<worksheet><sheetData><row r="1"><c r="A1"><v>{}</v></c><c r="B1"><v>2</v></c></row></sheetData></worksheet>"#,
            n
        );
        zip.start_file(
            format!("xl/worksheets/sheet{}.xml", n),
            zip::write::SimpleFileOptions::default(),
        )
        .unwrap();
        zip.write_all(xml.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

async fn count_rows(app: &App, table: &str, document_id: &str) -> i64 {
    sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {} WHERE document_id = ?",
        table
    ))
    .bind(document_id)
    .fetch_one(app.store.pool())
    .await
    .unwrap()
}

async fn upload_text(app: &App, dir: &Path, name: &str, content: &str) -> Document {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    let doc = app.documents.upload_path(&path, None).await.unwrap();
    app.documents.wait_for_processing(&doc.id).await.unwrap()
}

#[tokio::test]
async fn pdf_pages_transcribe_and_rule_fallback_chunks_per_page() {
    let tmp = TempDir::new().unwrap();
    let app = build_app(test_config(tmp.path()), Arc::new(PagedRenderer)).await;

    let pdf = tmp.path().join("two.pdf");
    write_pdf(&pdf, 2);
    let uploaded = app
        .documents
        .upload_path(&pdf, Some("Two pages"))
        .await
        .unwrap();
    assert_eq!(uploaded.status, DocumentStatus::Processing);
    assert_eq!(uploaded.name, "Two pages");

    let doc = app.documents.wait_for_processing(&uploaded.id).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(doc.total_pages, 2);
    assert!(doc.parsed_at.is_some());
    assert_eq!(doc.metadata["original_filename"], "two.pdf");
    assert_eq!(doc.metadata["page_format"], "png");

    let pages = app.documents.list_pages(&doc.id).await.unwrap();
    assert_eq!(pages.len(), 2);
    assert!(pages[1].image_path.ends_with("page_0002.png"));
    assert!(Path::new(&pages[0].image_path).exists());

    assert_eq!(
        app.documents.get_parsed_text(&doc.id, Some(1)).await.unwrap(),
        Some("Alpha".to_string())
    );
    assert_eq!(
        app.documents.get_parsed_text(&doc.id, Some(2)).await.unwrap(),
        Some("Beta".to_string())
    );
    assert_eq!(
        app.documents.get_parsed_text(&doc.id, None).await.unwrap(),
        Some("Alpha\n\nBeta".to_string())
    );

    let task = app.documents.latest_task(&doc.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!((task.progress - 1.0).abs() < f64::EPSILON);
    let fetched = app.documents.get_parsing_task(&task.id).await.unwrap();
    assert_eq!(fetched.document_id, doc.id);
    assert_eq!(fetched.status, TaskStatus::Completed);
    assert!(matches!(
        app.documents.get_parsing_task("no-such-task").await.unwrap_err(),
        Error::NotFound { kind: "ParsingTask", .. }
    ));

    // the completion client is disabled, so the semantic chunker falls back
    let params = ChunkParams {
        chunk_size: 100,
        chunk_overlap: 10,
        min_chunk_size: 20,
    };
    let outcome = app
        .chunks
        .auto_chunk(&doc.id, ChunkerKind::Semantic, params)
        .await
        .unwrap();
    assert_eq!(outcome.tier, Tier::Rule);
    let chunks = outcome.chunks;
    let mut found: Vec<(String, i64)> = chunks
        .iter()
        .map(|c| (c.content.clone(), c.source_page))
        .collect();
    found.sort();
    assert_eq!(
        found,
        vec![("Alpha".to_string(), 1), ("Beta".to_string(), 2)]
    );
    assert!(chunks.iter().all(|c| c.status == ChunkStatus::Pending));

    let doc = app.documents.get_document(&doc.id).await.unwrap();
    assert_eq!(doc.chunks_count, 2);
}

#[tokio::test]
async fn unsupported_extension_creates_nothing() {
    let tmp = TempDir::new().unwrap();
    let app = build_app(test_config(tmp.path()), Arc::new(PagedRenderer)).await;

    let err = app
        .documents
        .upload_document(&b"MZ binary"[..], "setup.exe", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat(ref ext) if ext == "exe"));
    assert!(err.is_rejection());

    let listing = app.documents.list_documents(None, 1, None).await.unwrap();
    assert_eq!(listing.total, 0);
    assert_eq!(
        fs::read_dir(&app.config.storage.documents_dir).unwrap().count(),
        0
    );
}

#[tokio::test]
async fn oversize_upload_is_rejected_and_removed() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.parsing.max_file_size = 10;
    let app = build_app(config, Arc::new(PagedRenderer)).await;

    let err = app
        .documents
        .upload_document(&b"eleven byte"[..], "notes.txt", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FileTooLarge { limit: 10 }));

    // exactly at the ceiling is fine
    let doc = app
        .documents
        .upload_document(&b"ten bytes!"[..], "notes.txt", None)
        .await
        .unwrap();
    assert_eq!(doc.file_size, 10);

    let listing = app.documents.list_documents(None, 1, None).await.unwrap();
    assert_eq!(listing.total, 1);
    assert_eq!(
        fs::read_dir(&app.config.storage.documents_dir).unwrap().count(),
        1
    );
    app.documents.wait_for_processing(&doc.id).await.unwrap();
}

#[tokio::test]
async fn text_upload_completes_with_whole_document_text() {
    let tmp = TempDir::new().unwrap();
    let app = build_app(test_config(tmp.path()), Arc::new(PagedRenderer)).await;

    let doc = upload_text(&app, tmp.path(), "notes.md", "# Notes\n\nFirst line.\n").await;
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(doc.file_type, FileFormat::Md);
    assert_eq!(doc.total_pages, 1);
    assert_eq!(doc.metadata["sha256"].as_str().unwrap().len(), 64);

    let texts = app.documents.list_parsed_text_pages(&doc.id).await.unwrap();
    assert_eq!(texts.len(), 1);
    assert_eq!(texts[0].page_number, None);
    assert!(texts[0].content.contains("# Notes"));

    assert!(app.documents.get_page(&doc.id, 1).await.is_ok());
    assert!(matches!(
        app.documents.get_page(&doc.id, 2).await.unwrap_err(),
        Error::NotFound { kind: "Page", .. }
    ));
}

#[tokio::test]
async fn delete_removes_rows_and_page_directory() {
    let tmp = TempDir::new().unwrap();
    let app = build_app(test_config(tmp.path()), Arc::new(PagedRenderer)).await;

    let doc = upload_text(&app, tmp.path(), "long.txt", &"A line of text.\n".repeat(40)).await;
    assert_eq!(doc.status, DocumentStatus::Completed);
    app.chunks
        .auto_chunk(
            &doc.id,
            ChunkerKind::Rule,
            ChunkParams {
                chunk_size: 200,
                chunk_overlap: 20,
                min_chunk_size: 50,
            },
        )
        .await
        .unwrap();

    let page_dir = app.config.storage.pages_dir.join(&doc.id);
    assert!(page_dir.is_dir());
    assert!(count_rows(&app, "chunks", &doc.id).await > 1);
    assert!(count_rows(&app, "document_pages", &doc.id).await > 0);

    assert!(app.documents.delete_document(&doc.id).await.unwrap());

    for table in ["chunks", "document_pages", "parsed_text", "parsing_tasks"] {
        assert_eq!(count_rows(&app, table, &doc.id).await, 0, "{} rows remain", table);
    }
    assert!(!page_dir.exists());
    assert!(!Path::new(&doc.file_path).exists());
    assert!(matches!(
        app.documents.get_document(&doc.id).await.unwrap_err(),
        Error::NotFound { .. }
    ));
    assert!(!app.documents.delete_document(&doc.id).await.unwrap());
}

#[tokio::test]
async fn chunks_count_tracks_creates_and_deletes() {
    let tmp = TempDir::new().unwrap();
    let app = build_app(test_config(tmp.path()), Arc::new(PagedRenderer)).await;
    let doc = upload_text(&app, tmp.path(), "a.txt", "Some text worth chunking.").await;

    let mut ids = Vec::new();
    for n in 1..=3 {
        let chunk = app
            .chunks
            .create_chunk(
                &doc.id,
                NewChunk {
                    content: format!("chunk {}", n),
                    source_page: 1,
                    tags: vec!["manual".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        ids.push(chunk.id);
    }
    app.chunks
        .auto_chunk(&doc.id, ChunkerKind::Rule, app.chunks.default_params())
        .await
        .unwrap();
    assert!(app.chunks.delete_chunk(&ids[0]).await.unwrap());
    assert!(!app.chunks.delete_chunk(&ids[0]).await.unwrap());

    let doc = app.documents.get_document(&doc.id).await.unwrap();
    assert_eq!(doc.chunks_count, count_rows(&app, "chunks", &doc.id).await);
    assert_eq!(doc.chunks_count, 3);

    let confirmed = app
        .chunks
        .confirm_chunk(&ids[1], ChunkStatus::Confirmed)
        .await
        .unwrap();
    assert!(confirmed.confirmed_at.is_some());
    assert!(app
        .chunks
        .confirm_chunk(&ids[1], ChunkStatus::Archived)
        .await
        .is_err());

    let pending = app
        .chunks
        .list_chunks(&doc.id, Some(ChunkStatus::Pending), 1, None)
        .await
        .unwrap();
    assert_eq!(pending.total, 2);
}

#[tokio::test]
async fn auto_chunk_without_text_is_recoverable() {
    let tmp = TempDir::new().unwrap();
    let app = build_app(test_config(tmp.path()), Arc::new(PagedRenderer)).await;
    let doc = pending_pdf(&app, tmp.path()).await;

    let err = app
        .chunks
        .auto_chunk(&doc.id, ChunkerKind::Rule, app.chunks.default_params())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoParsedText(_)));
}

#[tokio::test]
async fn reparse_replaces_text_with_identical_content() {
    let tmp = TempDir::new().unwrap();
    let app = build_app(test_config(tmp.path()), Arc::new(PagedRenderer)).await;
    let doc = upload_text(&app, tmp.path(), "same.txt", "Stable input.\nSecond line.\n").await;
    let before = app.documents.get_parsed_text(&doc.id, None).await.unwrap();

    let reviewed = app
        .chunks
        .create_chunk(
            &doc.id,
            NewChunk {
                content: "Reviewed".into(),
                source_page: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    app.chunks
        .confirm_chunk(&reviewed.id, ChunkStatus::Confirmed)
        .await
        .unwrap();
    app.chunks
        .auto_chunk(&doc.id, ChunkerKind::Rule, app.chunks.default_params())
        .await
        .unwrap();
    assert!(count_rows(&app, "chunks", &doc.id).await > 1);

    let restarted = app.documents.reparse_document(&doc.id).await.unwrap();
    assert_eq!(restarted.status, DocumentStatus::Processing);
    let doc = app.documents.wait_for_processing(&doc.id).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);

    let after = app.documents.get_parsed_text(&doc.id, None).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(app.store.count_parsed_text(&doc.id).await.unwrap(), 1);
    assert_eq!(count_rows(&app, "parsing_tasks", &doc.id).await, 2);

    // pending chunks of the old text are gone, reviewed ones stay
    let chunks = app.chunks.list_chunks(&doc.id, None, 1, None).await.unwrap();
    assert_eq!(chunks.total, 1);
    assert_eq!(chunks.items[0].id, reviewed.id);
    assert_eq!(doc.chunks_count, 1);

    let archived = app.documents.archive_document(&doc.id).await.unwrap();
    assert_eq!(archived.status, DocumentStatus::Archived);
    assert!(matches!(
        app.documents.reparse_document(&doc.id).await.unwrap_err(),
        Error::InvalidTransition { .. }
    ));
}

/// A PDF row in PROCESSING with no conversion running.
async fn pending_pdf(app: &App, dir: &Path) -> Document {
    let file = dir.join("orphan.pdf");
    write_pdf(&file, 1);
    let doc = Document {
        id: "orphan".into(),
        name: "orphan.pdf".into(),
        file_path: file.display().to_string(),
        file_type: FileFormat::Pdf,
        file_size: fs::metadata(&file).unwrap().len() as i64,
        status: DocumentStatus::Pending,
        total_pages: 0,
        chunks_count: 0,
        metadata: Default::default(),
        created_at: 0,
        updated_at: 0,
        parsed_at: None,
    };
    app.store.insert_document(&doc).await.unwrap();
    app.store
        .transition_document(&doc.id, DocumentStatus::Processing)
        .await
        .unwrap()
}

#[tokio::test]
async fn page_wait_timeout_fails_only_the_task() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.parsing.page_wait_secs = 0;
    let app = build_app(config, Arc::new(PagedRenderer)).await;
    let doc = pending_pdf(&app, tmp.path()).await;

    let outcome = app.parsing.parse_document(&doc, &NoProgress).await.unwrap();
    assert_eq!(outcome, ParseOutcome::PagesTimedOut);

    let task = app.documents.latest_task(&doc.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("timed out"));
    let doc = app.documents.get_document(&doc.id).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Processing);
}

#[tokio::test]
async fn slow_conversion_after_page_wait_fails_the_document() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.parsing.page_wait_secs = 1;
    let app = build_app(config, Arc::new(SlowRenderer(Duration::from_millis(1500)))).await;

    let pdf = tmp.path().join("slow.pdf");
    write_pdf(&pdf, 1);
    let doc = app.documents.upload_path(&pdf, None).await.unwrap();
    let doc = app.documents.wait_for_processing(&doc.id).await.unwrap();

    // conversion stored its pages, but the parse had already given up
    assert_eq!(doc.status, DocumentStatus::Failed);
    assert_eq!(doc.total_pages, 1);
    let task = app.documents.latest_task(&doc.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("timed out"));

    let restarted = app.documents.reparse_document(&doc.id).await.unwrap();
    assert_eq!(restarted.status, DocumentStatus::Processing);
    let doc = app.documents.wait_for_processing(&doc.id).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);
    assert_eq!(count_rows(&app, "parsing_tasks", &doc.id).await, 2);
}

#[tokio::test]
async fn failed_conversion_fails_the_document() {
    let tmp = TempDir::new().unwrap();
    let app = build_app(test_config(tmp.path()), Arc::new(BrokenRenderer)).await;

    let pdf = tmp.path().join("broken.pdf");
    write_pdf(&pdf, 1);
    let doc = app.documents.upload_path(&pdf, None).await.unwrap();
    let doc = app.documents.wait_for_processing(&doc.id).await.unwrap();

    assert_eq!(doc.status, DocumentStatus::Failed);
    assert!(doc.metadata["conversion_error"]
        .as_str()
        .unwrap()
        .contains("renderer unavailable"));
    assert_eq!(app.documents.get_parsed_text(&doc.id, None).await.unwrap(), None);

    // failed documents can be archived
    let doc = app.documents.archive_document(&doc.id).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Archived);
}

#[test]
fn parse_and_conversion_agree_on_page_count() {
    let tmp = TempDir::new().unwrap();
    let registry = ParserRegistry::new(72, ImageFormat::Png, Arc::new(PagedRenderer));

    let long_text: String = (0..400).map(|i| format!("line number {}\n", i)).collect();
    let json = serde_json::json!({ "items": (0..300).collect::<Vec<_>>() }).to_string();
    let fixtures: Vec<(FileFormat, PathBuf)> = vec![
        (FileFormat::Txt, tmp.path().join("long.txt")),
        (FileFormat::Md, tmp.path().join("short.md")),
        (FileFormat::Json, tmp.path().join("data.json")),
        (FileFormat::Docx, tmp.path().join("doc.docx")),
        (FileFormat::Xlsx, tmp.path().join("book.xlsx")),
    ];
    fs::write(&fixtures[0].1, &long_text).unwrap();
    fs::write(&fixtures[1].1, "# Title\n\nBody.\n").unwrap();
    fs::write(&fixtures[2].1, json).unwrap();
    write_docx(&fixtures[3].1, &["Heading", "A paragraph.", "Another one."]);
    write_xlsx(&fixtures[4].1, 3);

    for (format, file) in &fixtures {
        let parser = registry.parser_for(*format);
        let parsed = parser.parse(file).unwrap();
        let out = tmp.path().join(format!("out-{}", format));
        let images = parser.convert_to_images(file, &out).unwrap();
        let total = parser.total_pages(file).unwrap();

        assert_eq!(parsed.pages.len() as u32, total, "{} parse", format);
        assert_eq!(images.len() as u32, total, "{} images", format);
        assert!(total >= 1, "{} has pages", format);
        for (i, image) in images.iter().enumerate() {
            assert_eq!(image.page_number, i as u32 + 1);
            assert!(image.image_path.exists());
        }
    }

    let pdf = tmp.path().join("three.pdf");
    write_pdf(&pdf, 3);
    let parser = registry.parser_for(FileFormat::Pdf);
    let images = parser.convert_to_images(&pdf, &tmp.path().join("out-pdf")).unwrap();
    assert_eq!(parser.total_pages(&pdf).unwrap(), 3);
    assert_eq!(images.len(), 3);
    assert_eq!(images[2].width, 3);
}
