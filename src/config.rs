//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.
//! Comma-separated list variables (categories, extensions, tags) follow the
//! usual convention: empty entries are dropped, whitespace trimmed.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Root of the upload area; each subdirectory is a category.
    pub root: PathBuf,
    /// Explicit category list. None means discover subdirectories.
    pub categories: Option<Vec<String>>,
    /// Accepted file extensions, lowercased, with leading dot.
    pub extensions: Vec<String>,
    /// How long a file must stay quiet before it counts as fully written.
    pub settle: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Minimum delay between consecutive admissions.
    pub upload_delay: Duration,
    pub burst_limit: u32,
    pub burst_window: Duration,
    pub hourly_limit: u32,
    pub daily_limit: u32,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_concurrent: usize,
    pub step_timeout: Duration,
    /// Extensions re-encoded to JPEG before upload.
    pub convert_extensions: Vec<String>,
    pub jpeg_quality: u8,
    pub analysis_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub api_base: String,
    pub token: SecretString,
    /// Collection (blog) posts are published into.
    pub collection: String,
    /// published | draft | queue | private
    pub post_state: String,
    pub common_tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub api_base: String,
    pub api_key: SecretString,
    pub model: String,
    pub prompt: String,
    /// Appended verbatim after the generated description, if set.
    pub append_text: String,
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub api_base: String,
    pub api_token: Option<SecretString>,
    pub user_key: Option<SecretString>,
    /// Per-error-kind notification cooldown.
    pub cooldown: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// SQLite state database.
    pub db_path: PathBuf,
    /// Where published originals end up.
    pub archive_root: PathBuf,
    /// Where abandoned files end up.
    pub failed_root: PathBuf,
}

#[derive(Debug)]
pub struct Config {
    pub watch: WatchConfig,
    pub limits: RateLimitConfig,
    pub retry: RetryConfig,
    pub pipeline: PipelineConfig,
    pub publish: PublishConfig,
    pub vision: VisionConfig,
    pub alerts: AlertConfig,
    pub storage: StorageConfig,
    pub shutdown_grace: Duration,
    pub otel_endpoint: Option<String>,
}

const DEFAULT_EXTENSIONS: &str = ".jpg,.jpeg,.png,.gif,.webp,.bmp,.tiff,.tif";
const DEFAULT_CONVERT: &str = ".bmp,.tiff,.tif,.webp";

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            watch: WatchConfig {
                root: PathBuf::from(var_or("UPLOAD_ROOT", "./data/upload")),
                categories: std::env::var("CATEGORIES").ok().map(|v| parse_list(&v)),
                extensions: parse_ext_list(&var_or("FILE_EXTENSIONS", DEFAULT_EXTENSIONS)),
                settle: secs_f64_var("FILE_SETTLE_SECS", 0.5)?,
            },
            limits: RateLimitConfig {
                upload_delay: secs_f64_var("UPLOAD_DELAY", 5.0)?,
                burst_limit: parse_var("BURST_LIMIT", 5u32)?,
                burst_window: secs_f64_var("BURST_WINDOW_SECS", 60.0)?,
                hourly_limit: parse_var("MAX_UPLOADS_PER_HOUR", 100u32)?,
                daily_limit: parse_var("MAX_UPLOADS_PER_DAY", 1000u32)?,
            },
            retry: RetryConfig {
                max_attempts: parse_var("RETRY_ATTEMPTS", 3u32)?,
                base_delay: secs_f64_var("RETRY_DELAY", 10.0)?,
                max_delay: secs_f64_var("RETRY_MAX_DELAY", 300.0)?,
            },
            pipeline: PipelineConfig {
                max_concurrent: parse_var("MAX_CONCURRENT_UPLOADS", 3usize)?,
                step_timeout: secs_f64_var("STEP_TIMEOUT_SECS", 120.0)?,
                convert_extensions: parse_ext_list(&var_or("CONVERT_FORMATS", DEFAULT_CONVERT)),
                jpeg_quality: parse_var("CONVERSION_QUALITY", 95u8)?,
                analysis_enabled: bool_var("ENABLE_IMAGE_ANALYSIS", false),
            },
            publish: PublishConfig {
                api_base: var_or("GALLERY_API_BASE", "https://api.gallery.example"),
                token: SecretString::from(required_var("GALLERY_TOKEN")?),
                collection: required_var("GALLERY_COLLECTION")?,
                post_state: var_or("POST_STATE", "published"),
                common_tags: parse_list(&var_or("COMMON_TAGS", "")),
            },
            vision: VisionConfig {
                api_base: var_or("VISION_API_BASE", "https://api.vision.example"),
                api_key: SecretString::from(var_or("VISION_API_KEY", "")),
                model: var_or("VISION_MODEL", "captioner-small"),
                prompt: var_or(
                    "VISION_PROMPT",
                    "Describe this image in 1-2 concise sentences. Focus on the visual \
                     elements, not any text the image contains.",
                ),
                append_text: var_or("DESCRIPTION_APPEND_TEXT", ""),
            },
            alerts: AlertConfig {
                api_base: var_or("PUSH_API_BASE", "https://api.pushover.net"),
                api_token: std::env::var("PUSH_API_TOKEN").ok().map(SecretString::from),
                user_key: std::env::var("PUSH_USER_KEY").ok().map(SecretString::from),
                cooldown: secs_f64_var("ALERT_COOLDOWN_SECS", 300.0)?,
            },
            storage: StorageConfig {
                db_path: PathBuf::from(var_or("STATE_DB", "./data/lightbox.db")),
                archive_root: PathBuf::from(var_or("ARCHIVE_ROOT", "./data/archive")),
                failed_root: PathBuf::from(var_or("FAILED_ROOT", "./data/failed")),
            },
            shutdown_grace: secs_f64_var("SHUTDOWN_GRACE_SECS", 30.0)?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{name}: cannot parse {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn secs_f64_var(name: &str, default: f64) -> Result<Duration> {
    let secs: f64 = parse_var(name, default)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(Error::Config(format!("{name}: must be a non-negative number")));
    }
    Ok(Duration::from_secs_f64(secs))
}

fn bool_var(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Comma-separated list, trimmed, empties dropped.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Extension list: lowercased, leading dot enforced.
fn parse_ext_list(raw: &str) -> Vec<String> {
    parse_list(raw)
        .into_iter()
        .map(|s| {
            let s = s.to_lowercase();
            if s.starts_with('.') { s } else { format!(".{s}") }
        })
        .collect()
}
