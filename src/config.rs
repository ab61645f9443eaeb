//! Configuration management with serde serialization/deserialization
//!
//! This module holds the service configuration (renderer, directories,
//! readiness tunables, storage, workers) and the per-capture
//! [`CaptureOptions`], whose `Default` impl is the single source of capture
//! defaults.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CaptureError;
use crate::presets::Preset;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub const MIN_WIDTH: u32 = 100;
pub const MAX_WIDTH: u32 = 3840;
pub const MIN_HEIGHT: u32 = 100;
pub const MAX_HEIGHT: u32 = 2160;
pub const MIN_TIMEOUT_MS: u64 = 5_000;
pub const MAX_TIMEOUT_MS: u64 = 120_000;

/// Main configuration structure for the capture service
///
/// Every field has a default, so a JSON config file only needs to name the
/// settings it changes.
///
/// # Examples
///
/// ```rust
/// use page_capture::Config;
///
/// let config = Config {
///     worker_concurrency: 2,
///     ..Default::default()
/// };
/// assert!(page_capture::validate_config(&config).is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Headless browser settings
    pub renderer: RendererConfig,

    /// Directory finished artifacts are written to (default: `uploads`)
    ///
    /// Files here are served under `/uploads/{file_name}` when they are not
    /// handed off to cloud storage.
    pub uploads_dir: PathBuf,

    /// Directory for raw captures before transformation (default: `temp`)
    pub temp_dir: PathBuf,

    /// Defaults applied to captures that do not override them
    pub capture_defaults: CaptureOptions,

    /// Rendering-completion heuristic tunables
    pub readiness: ReadinessConfig,

    /// Domains refused by the URL validator, matched exactly or as a suffix
    pub blacklisted_domains: Vec<String>,

    /// Cloud object storage hand-off
    pub storage: StorageConfig,

    /// Age after which leftover `temp_*` files are swept (default: 1 hour)
    pub temp_max_age: Duration,

    /// Number of background workers used by batch processing (default: CPU count)
    pub worker_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            renderer: RendererConfig::default(),
            uploads_dir: PathBuf::from("uploads"),
            temp_dir: PathBuf::from("temp"),
            capture_defaults: CaptureOptions::default(),
            readiness: ReadinessConfig::default(),
            blacklisted_domains: crate::url_validator::DEFAULT_BLACKLIST
                .iter()
                .map(|domain| domain.to_string())
                .collect(),
            storage: StorageConfig::default(),
            temp_max_age: Duration::from_secs(60 * 60),
            worker_concurrency: num_cpus::get().max(1),
        }
    }
}

impl Config {
    /// Apply the environment overrides understood by the service:
    /// `USE_CLOUD_STORAGE`, `AWS_S3_BUCKET` and `AWS_S3_REGION`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(flag) = lookup("USE_CLOUD_STORAGE") {
            self.storage.enabled = flag.trim().eq_ignore_ascii_case("true");
        }
        if let Some(bucket) = lookup("AWS_S3_BUCKET").filter(|v| !v.is_empty()) {
            self.storage.bucket = bucket;
        }
        if let Some(region) = lookup("AWS_S3_REGION").filter(|v| !v.is_empty()) {
            self.storage.region = region;
        }
    }
}

/// Headless browser settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// User-Agent sent with every navigation (default: desktop Chrome 120)
    pub user_agent: String,

    /// Upper bound on browser start-up (default: 30 seconds)
    pub launch_timeout: Duration,

    /// Upper bound on the liveness probe run before reusing the browser
    pub probe_timeout: Duration,

    /// Extra command-line flags appended after the built-in set
    pub extra_args: Vec<String>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            launch_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
            extra_args: Vec::new(),
        }
    }
}

/// Tunables for the rendering-completion heuristic
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Share of the job timeout the heuristic may spend (default: 0.5)
    pub budget_fraction: f64,

    /// How long to wait for `document.readyState === "complete"`
    pub load_ceiling: Duration,

    /// Interval between load-state polls
    pub poll_interval: Duration,

    /// Per-image wait ceiling (default: 5 seconds)
    pub image_ceiling: Duration,

    /// Wait ceiling for `document.fonts.ready`
    pub font_ceiling: Duration,

    /// Length of a mutation-free window that counts as settled (default: 500ms)
    pub quiescence_window: Duration,

    /// Hard ceiling on the mutation-quiescence wait (default: 3 seconds)
    pub mutation_ceiling: Duration,

    /// Flat wait used when any heuristic step errors (default: 2 seconds)
    pub fallback_wait: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            budget_fraction: 0.5,
            load_ceiling: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            image_ceiling: Duration::from_secs(5),
            font_ceiling: Duration::from_secs(3),
            quiescence_window: Duration::from_millis(500),
            mutation_ceiling: Duration::from_secs(3),
            fallback_wait: Duration::from_secs(2),
        }
    }
}

/// Cloud object storage settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores
    pub endpoint: Option<String>,
    /// Base used to build public artifact URLs; defaults to the virtual-hosted bucket URL
    pub public_base_url: Option<String>,
    pub cache_control: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bucket: "page-capture-artifacts".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
            public_base_url: None,
            cache_control: "max-age=31536000, public".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn public_base_url(&self) -> String {
        match &self.public_base_url {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("https://{}.s3.{}.amazonaws.com", self.bucket, self.region),
        }
    }
}

/// Output image formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    #[serde(rename = "jpg", alias = "jpeg")]
    Jpeg,
    Webp,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Webp => "webp",
        }
    }

    /// File extension, also the last segment of storage keys.
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
        }
    }

    /// Lossy formats honor the quality setting.
    pub fn is_lossy(&self) -> bool {
        !matches!(self, ImageFormat::Png)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpg" | "jpeg" => Ok(ImageFormat::Jpeg),
            "webp" => Ok(ImageFormat::Webp),
            other => Err(CaptureError::Validation(format!(
                "format must be one of png, jpg, jpeg, webp (got {other})"
            ))),
        }
    }
}

/// Device profile used to size the viewport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Desktop,
    Mobile,
    Tablet,
}

impl FromStr for Device {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "desktop" => Ok(Device::Desktop),
            "mobile" => Ok(Device::Mobile),
            "tablet" => Ok(Device::Tablet),
            other => Err(CaptureError::Validation(format!(
                "device must be one of desktop, mobile, tablet (got {other})"
            ))),
        }
    }
}

/// Options for a single capture
///
/// `Default` carries every capture default; [`CaptureOptions::validated`]
/// checks ranges and resolves a preset into concrete dimensions.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaptureOptions {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    /// Encoder quality for lossy formats, 1-100
    pub quality: u8,
    pub full_page: bool,
    pub device: Device,
    pub preset: Option<Preset>,
    /// Bound on navigation plus readiness, 5000-120000 ms
    pub timeout_ms: u64,
    pub optimize: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            format: ImageFormat::Png,
            width: 1200,
            height: 800,
            quality: 90,
            full_page: false,
            device: Device::Desktop,
            preset: None,
            timeout_ms: 30_000,
            optimize: true,
        }
    }
}

impl CaptureOptions {
    pub fn validated(mut self) -> Result<Self, CaptureError> {
        if let Some(preset) = self.preset {
            let spec = preset.spec();
            self.width = spec.width;
            self.height = spec.height;
        }

        if !(MIN_WIDTH..=MAX_WIDTH).contains(&self.width) {
            return Err(CaptureError::Validation(format!(
                "width must be between {MIN_WIDTH} and {MAX_WIDTH}"
            )));
        }
        if !(MIN_HEIGHT..=MAX_HEIGHT).contains(&self.height) {
            return Err(CaptureError::Validation(format!(
                "height must be between {MIN_HEIGHT} and {MAX_HEIGHT}"
            )));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(CaptureError::Validation(
                "quality must be between 1 and 100".to_string(),
            ));
        }
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&self.timeout_ms) {
            return Err(CaptureError::Validation(format!(
                "timeout must be between {MIN_TIMEOUT_MS} and {MAX_TIMEOUT_MS} ms"
            )));
        }

        Ok(self)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn viewport(&self) -> ViewportSpec {
        match self.preset {
            Some(preset) => ViewportSpec::for_preset(preset),
            None => ViewportSpec::for_device(self.device, self.width, self.height),
        }
    }
}

/// Browser viewport used for one render context
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ViewportSpec {
    pub width: u32,
    pub height: u32,

    /// Device pixel ratio; values above 1.0 produce proportionally larger images
    pub device_scale_factor: f64,

    pub mobile: bool,
    pub has_touch: bool,
}

impl Default for ViewportSpec {
    fn default() -> Self {
        Self {
            width: 1200,
            height: 800,
            device_scale_factor: 1.0,
            mobile: false,
            has_touch: false,
        }
    }
}

impl ViewportSpec {
    /// Mobile and tablet profiles clamp the requested size to the device
    /// bounds and enable touch emulation.
    pub fn for_device(device: Device, width: u32, height: u32) -> Self {
        match device {
            Device::Desktop => Self {
                width,
                height,
                ..Default::default()
            },
            Device::Mobile => Self {
                width: width.min(375),
                height: height.min(667),
                device_scale_factor: 1.0,
                mobile: true,
                has_touch: true,
            },
            Device::Tablet => Self {
                width: width.min(768),
                height: height.min(1024),
                device_scale_factor: 1.0,
                mobile: true,
                has_touch: true,
            },
        }
    }

    pub fn for_preset(preset: Preset) -> Self {
        let spec = preset.spec();
        let mobile = spec.emulates_mobile();
        Self {
            width: spec.width,
            height: spec.height,
            device_scale_factor: spec.device_scale_factor,
            mobile,
            has_touch: mobile,
        }
    }
}

/// Chrome command-line flags for headless capture
///
/// `profile_id` keeps each launched browser in its own user-data directory so
/// a relaunch never collides with a profile lock left by a dead process.
pub fn get_chrome_args(config: &RendererConfig, profile_id: u64) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), profile_id);
    let profile_root = std::env::temp_dir();

    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--no-zygote".to_string(),
        "--mute-audio".to_string(),
        "--hide-scrollbars".to_string(),
        format!(
            "--user-data-dir={}",
            profile_root
                .join(format!("page-capture-chromium-{unique_id}"))
                .display()
        ),
    ];

    args.extend(config.extra_args.iter().cloned());
    args
}

/// Reject configurations the service cannot run with.
pub fn validate_config(config: &Config) -> Result<(), CaptureError> {
    if config.uploads_dir.as_os_str().is_empty() {
        return Err(CaptureError::Configuration(
            "uploads_dir must not be empty".to_string(),
        ));
    }
    if config.temp_dir.as_os_str().is_empty() {
        return Err(CaptureError::Configuration(
            "temp_dir must not be empty".to_string(),
        ));
    }
    if config.renderer.launch_timeout.is_zero() || config.renderer.probe_timeout.is_zero() {
        return Err(CaptureError::Configuration(
            "renderer timeouts must be greater than zero".to_string(),
        ));
    }
    let fraction = config.readiness.budget_fraction;
    if !(fraction > 0.0 && fraction <= 1.0) {
        return Err(CaptureError::Configuration(format!(
            "readiness.budget_fraction must be in (0, 1], got {fraction}"
        )));
    }
    if config.readiness.poll_interval.is_zero() {
        return Err(CaptureError::Configuration(
            "readiness.poll_interval must be greater than zero".to_string(),
        ));
    }
    if config.temp_max_age.is_zero() {
        return Err(CaptureError::Configuration(
            "temp_max_age must be greater than zero".to_string(),
        ));
    }
    if config.worker_concurrency == 0 {
        return Err(CaptureError::Configuration(
            "worker_concurrency must be at least 1".to_string(),
        ));
    }
    if config.storage.enabled && config.storage.bucket.trim().is_empty() {
        return Err(CaptureError::Configuration(
            "storage.bucket is required when cloud storage is enabled".to_string(),
        ));
    }
    config.capture_defaults.clone().validated()?;
    Ok(())
}
