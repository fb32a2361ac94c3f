//! TOML configuration.
//!
//! Every section is optional; missing keys fall back to the defaults below so
//! that an empty file yields a working local setup under `./data/pagemill`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub parsing: ParsingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/pagemill/pagemill.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Uploaded source files.
    #[serde(default = "default_documents_dir")]
    pub documents_dir: PathBuf,
    /// One sub-directory per document holding rendered page images.
    #[serde(default = "default_pages_dir")]
    pub pages_dir: PathBuf,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            documents_dir: default_documents_dir(),
            pages_dir: default_pages_dir(),
            temp_dir: default_temp_dir(),
        }
    }
}

fn default_documents_dir() -> PathBuf {
    PathBuf::from("./data/pagemill/documents")
}
fn default_pages_dir() -> PathBuf {
    PathBuf::from("./data/pagemill/pages")
}
fn default_temp_dir() -> PathBuf {
    PathBuf::from("./data/pagemill/temp")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ParsingConfig {
    #[serde(default = "default_supported_formats")]
    pub supported_formats: Vec<String>,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    #[serde(default = "default_page_format")]
    pub page_format: String,
    #[serde(default = "default_concurrency")]
    pub max_concurrent_documents: usize,
    #[serde(default = "default_concurrency")]
    pub max_concurrent_pages: usize,
    /// Upper bound on how long PDF transcription waits for page images.
    #[serde(default = "default_page_wait_secs")]
    pub page_wait_secs: u64,
    #[serde(default = "default_page_poll_millis")]
    pub page_poll_millis: u64,
    #[serde(default = "default_pdftoppm")]
    pub pdftoppm: PathBuf,
}

impl Default for ParsingConfig {
    fn default() -> Self {
        Self {
            supported_formats: default_supported_formats(),
            max_file_size: default_max_file_size(),
            dpi: default_dpi(),
            page_format: default_page_format(),
            max_concurrent_documents: default_concurrency(),
            max_concurrent_pages: default_concurrency(),
            page_wait_secs: default_page_wait_secs(),
            page_poll_millis: default_page_poll_millis(),
            pdftoppm: default_pdftoppm(),
        }
    }
}

fn default_supported_formats() -> Vec<String> {
    ["pdf", "docx", "xlsx", "txt", "md", "json"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}
fn default_dpi() -> u32 {
    150
}
fn default_page_format() -> String {
    "png".to_string()
}
fn default_concurrency() -> usize {
    3
}
fn default_page_wait_secs() -> u64 {
    60
}
fn default_page_poll_millis() -> u64 {
    2000
}
fn default_pdftoppm() -> PathBuf {
    PathBuf::from("pdftoppm")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    #[serde(default = "default_chunker")]
    pub default_chunker: String,
    /// Cap on the sanitized text sent to the completion service.
    #[serde(default = "default_max_llm_input_chars")]
    pub max_llm_input_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_size: default_min_chunk_size(),
            default_chunker: default_chunker(),
            max_llm_input_chars: default_max_llm_input_chars(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_min_chunk_size() -> usize {
    100
}
fn default_chunker() -> String {
    "semantic".to_string()
}
fn default_max_llm_input_chars() -> usize {
    20_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_text_model")]
    pub text_model: String,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub transcribe_prompt: Option<String>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            text_model: default_text_model(),
            vision_model: default_vision_model(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            transcribe_prompt: None,
        }
    }
}

fn default_provider() -> String {
    "dashscope".to_string()
}
fn default_base_url() -> String {
    "https://dashscope.aliyuncs.com".to_string()
}
fn default_text_model() -> String {
    "qwen-max".to_string()
}
fn default_vision_model() -> String {
    "qwen-vl-max".to_string()
}
fn default_api_key_env() -> String {
    "DASHSCOPE_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    2048
}

impl CompletionConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// API key from the configured environment variable, if set and non-blank.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

fn default_page_size() -> u32 {
    20
}
fn default_max_page_size() -> u32 {
    100
}

impl ApiConfig {
    /// Offset and limit for 1-based `page`. A missing or zero page size
    /// uses the default; larger sizes are capped.
    pub fn window(&self, page: u32, page_size: Option<u32>) -> (i64, i64) {
        let size = page_size
            .filter(|&s| s > 0)
            .unwrap_or(self.default_page_size)
            .min(self.max_page_size)
            .max(1) as i64;
        let page = page.max(1) as i64;
        ((page - 1) * size, size)
    }
}

impl Config {
    /// Places the database and every storage directory under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        let mut config = Config::default();
        config.db.path = root.join("pagemill.sqlite");
        config.storage.documents_dir = root.join("documents");
        config.storage.pages_dir = root.join("pages");
        config.storage.temp_dir = root.join("temp");
        config
    }

    pub fn validate(&self) -> Result<()> {
        let chunking = &self.chunking;
        if chunking.chunk_size == 0 {
            bail!("chunking.chunk_size must be > 0");
        }
        if chunking.chunk_overlap >= chunking.chunk_size {
            bail!("chunking.chunk_overlap must be < chunking.chunk_size");
        }
        if chunking.min_chunk_size > chunking.chunk_size {
            bail!("chunking.min_chunk_size must be <= chunking.chunk_size");
        }
        match chunking.default_chunker.as_str() {
            "semantic" | "rule" => {}
            other => bail!(
                "Unknown chunker: '{}'. Must be semantic or rule.",
                other
            ),
        }

        let parsing = &self.parsing;
        if parsing.max_file_size == 0 {
            bail!("parsing.max_file_size must be > 0");
        }
        if parsing.dpi == 0 {
            bail!("parsing.dpi must be > 0");
        }
        if parsing.max_concurrent_documents == 0 || parsing.max_concurrent_pages == 0 {
            bail!("parsing concurrency limits must be >= 1");
        }
        if parsing.supported_formats.is_empty() {
            bail!("parsing.supported_formats must not be empty");
        }
        match parsing.page_format.as_str() {
            "png" | "jpg" | "jpeg" => {}
            other => bail!(
                "Unknown page_format: '{}'. Must be png or jpg.",
                other
            ),
        }

        match self.completion.provider.as_str() {
            "disabled" | "dashscope" => {}
            other => bail!(
                "Unknown completion provider: '{}'. Must be disabled or dashscope.",
                other
            ),
        }

        if self.api.default_page_size == 0 || self.api.max_page_size == 0 {
            bail!("api page sizes must be >= 1");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
