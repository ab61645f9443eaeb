use crate::{
    format_duration, BatchProcessor, CaptureOptions, CaptureService, Config, Device, HealthChecker,
    ImageFormat, InMemoryJobRepository, InMemoryUsageRepository, JobOrchestrator, Metrics, Preset,
    ProcessOutcome, ProgressTracker, StorageAdapter,
};
use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "page-capture")]
#[command(about = "Capture web pages as optimized images")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Directory for finished artifacts")]
    pub uploads_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Serve Prometheus metrics on this port")]
    pub metrics_port: Option<u16>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,
}

/// Capture options shared by every command that renders a page.
#[derive(Args, Debug, Clone, Default)]
pub struct CaptureArgs {
    #[arg(long, help = "Output format (png, jpg, webp)")]
    pub format: Option<ImageFormat>,

    #[arg(long, help = "Viewport width (100-3840)")]
    pub width: Option<u32>,

    #[arg(long, help = "Viewport height (100-2160)")]
    pub height: Option<u32>,

    #[arg(long, help = "Quality for lossy formats (1-100)")]
    pub quality: Option<u8>,

    #[arg(long, help = "Capture the full scrollable page")]
    pub full_page: bool,

    #[arg(long, help = "Device profile (desktop, mobile, tablet)")]
    pub device: Option<Device>,

    #[arg(long, help = "Named size preset, overrides width and height")]
    pub preset: Option<Preset>,

    #[arg(long, help = "Page load timeout in milliseconds (5000-120000)")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Keep the raw capture instead of re-encoding it")]
    pub no_optimize: bool,
}

impl CaptureArgs {
    /// Apply the flags that were given on top of `defaults`.
    pub fn apply(&self, defaults: &CaptureOptions) -> CaptureOptions {
        let mut options = defaults.clone();
        if let Some(format) = self.format {
            options.format = format;
        }
        if let Some(width) = self.width {
            options.width = width;
        }
        if let Some(height) = self.height {
            options.height = height;
        }
        if let Some(quality) = self.quality {
            options.quality = quality;
        }
        if self.full_page {
            options.full_page = true;
        }
        if let Some(device) = self.device {
            options.device = device;
        }
        if self.preset.is_some() {
            options.preset = self.preset;
        }
        if let Some(timeout) = self.timeout {
            options.timeout_ms = timeout;
        }
        if self.no_optimize {
            options.optimize = false;
        }
        options
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture one URL directly, without creating a job
    Capture {
        #[arg(short, long, help = "URL to capture")]
        url: String,

        #[arg(short, long, help = "Also copy the artifact to this path")]
        output: Option<PathBuf>,

        #[command(flatten)]
        capture: CaptureArgs,
    },

    /// Create a capture job and process it to completion
    Job {
        #[arg(short, long, help = "URL to capture")]
        url: String,

        #[arg(long, default_value = "cli", help = "Owner recorded on the job")]
        owner: String,

        #[command(flatten)]
        capture: CaptureArgs,
    },

    /// Capture every URL listed in a file through the worker pool
    Batch {
        #[arg(short, long, help = "Input file containing URLs (one per line)")]
        input: PathBuf,

        #[arg(long, default_value = "cli", help = "Owner recorded on the jobs")]
        owner: String,

        #[arg(short, long, help = "Concurrent captures (defaults to worker_concurrency)")]
        concurrency: Option<usize>,

        #[arg(long, help = "Progress reporting interval in seconds")]
        progress_interval: Option<u64>,

        #[command(flatten)]
        capture: CaptureArgs,
    },

    /// List the size presets by category
    Presets,

    /// Check whether a URL passes the safety rules
    CheckUrl {
        #[arg(short, long, help = "URL to check")]
        url: String,
    },

    /// Validate a configuration file
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        file: PathBuf,
    },

    /// Show renderer, storage and temp directory health
    Health,
}

pub struct CliRunner {
    pub config: Config,
    pub service: Arc<CaptureService>,
    pub orchestrator: Arc<JobOrchestrator>,
    pub storage: Option<StorageAdapter>,
}

impl CliRunner {
    /// Wire the pipeline. Nothing is launched until a command captures.
    pub fn new(config: Config, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        let storage = StorageAdapter::from_config(&config.storage)
            .context("failed to configure cloud storage")?;
        let service = Arc::new(CaptureService::with_chromium(config.clone(), metrics)?);
        let orchestrator = Arc::new(JobOrchestrator::new(
            service.clone(),
            Arc::new(InMemoryJobRepository::new()),
            Arc::new(InMemoryUsageRepository::new()),
            storage.clone(),
        ));

        Ok(Self {
            config,
            service,
            orchestrator,
            storage,
        })
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Capture {
                url,
                output,
                capture,
            } => self.run_capture(&url, output, &capture).await,
            Commands::Job {
                url,
                owner,
                capture,
            } => self.run_job(&url, &owner, &capture).await,
            Commands::Batch {
                input,
                owner,
                concurrency,
                progress_interval,
                capture,
            } => {
                self.run_batch(&input, &owner, concurrency, progress_interval, &capture)
                    .await
            }
            Commands::Presets => {
                print_presets();
                Ok(())
            }
            Commands::CheckUrl { url } => self.check_url(&url),
            Commands::Validate { file } => validate_config_file(&file).await,
            Commands::Health => self.show_health().await,
        }
    }

    pub async fn run_capture(
        &self,
        url: &str,
        output: Option<PathBuf>,
        capture: &CaptureArgs,
    ) -> anyhow::Result<()> {
        info!("Capturing: {}", url);
        let options = capture.apply(&self.config.capture_defaults);
        let artifact = self.orchestrator.capture_direct(url, options).await?;

        if let (Some(output), Some(local_path)) = (&output, &artifact.local_path) {
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::copy(local_path, output).await?;
            info!("Artifact copied to: {}", output.display());
        }

        println!("Capture finished:");
        println!("  URL: {url}");
        if let Some(path) = &artifact.local_path {
            println!("  File: {}", path.display());
        }
        println!("  Format: {}", artifact.format);
        println!("  Dimensions: {}", artifact.dimensions());
        println!(
            "  Size: {} (raw {})",
            crate::format_bytes(artifact.byte_size),
            crate::format_bytes(artifact.original_byte_size)
        );
        Ok(())
    }

    pub async fn run_job(&self, url: &str, owner: &str, capture: &CaptureArgs) -> anyhow::Result<()> {
        let options = capture.apply(&self.config.capture_defaults);
        let job = self.orchestrator.create_job(owner, url, options).await?;
        let outcome = self.orchestrator.process_job(job.id, owner).await?;

        let stored = self.orchestrator.get_job(job.id, owner).await?;
        println!("{}", serde_json::to_string_pretty(&stored)?);

        match outcome {
            ProcessOutcome::Completed(_) => Ok(()),
            ProcessOutcome::Failed { message, .. } => bail!("job {} failed: {}", job.id, message),
        }
    }

    pub async fn run_batch(
        &self,
        input: &Path,
        owner: &str,
        concurrency: Option<usize>,
        progress_interval: Option<u64>,
        capture: &CaptureArgs,
    ) -> anyhow::Result<()> {
        let urls = read_urls_from_file(input).await?;
        info!("Loaded {} URLs from {}", urls.len(), input.display());

        let options = capture.apply(&self.config.capture_defaults);
        let concurrency = concurrency.unwrap_or(self.config.worker_concurrency);
        let tracker = Arc::new(ProgressTracker::new(urls.len()));

        let reporter = progress_interval.map(|secs| {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs.max(1)));
                while !tracker.is_complete() {
                    interval.tick().await;
                    let progress = tracker.get_progress();
                    println!(
                        "Progress: {}/{} ({:.1}%) - Success: {}, Errors: {}, Rate: {:.1}/s, Elapsed: {}, ETA: {}",
                        progress.completed,
                        progress.total,
                        progress.completed as f64 / progress.total.max(1) as f64 * 100.0,
                        progress.success,
                        progress.errors,
                        progress.rate,
                        format_duration(progress.elapsed),
                        progress.eta.map(format_duration).unwrap_or_else(|| "-".to_string())
                    );
                }
            })
        });

        let mut processor = BatchProcessor::new(concurrency, self.orchestrator.clone())
            .with_progress(tracker.clone());
        let entries = processor.process_urls(owner, urls, options).await;
        processor.close().await;
        if let Some(reporter) = reporter {
            reporter.abort();
        }

        let mut failed = 0;
        for entry in &entries {
            match &entry.result {
                Ok(ProcessOutcome::Completed(artifact)) => {
                    println!("OK    {} -> {}", entry.url, artifact.location().unwrap_or("-"))
                }
                Ok(ProcessOutcome::Failed { message, .. }) => {
                    failed += 1;
                    println!("FAIL  {} ({})", entry.url, message);
                }
                Err(e) => {
                    failed += 1;
                    println!("SKIP  {} ({})", entry.url, e.user_message());
                }
            }
        }

        let stats = processor.get_stats();
        info!(
            "Batch completed in {}. Processed: {}, Captured: {}, Failed: {}",
            format_duration(tracker.get_progress().elapsed),
            stats.total_processed,
            entries.len() - failed,
            failed
        );
        if failed > 0 {
            warn!("{} of {} URLs were not captured", failed, entries.len());
        }
        Ok(())
    }

    pub fn check_url(&self, url: &str) -> anyhow::Result<()> {
        match self.service.validator().validate(url) {
            Ok(parsed) => {
                println!("{parsed} is safe to capture");
                Ok(())
            }
            Err(e) => bail!("{url} rejected: {e}"),
        }
    }

    pub async fn show_health(&self) -> anyhow::Result<()> {
        let status = HealthChecker::new(self.service.clone(), self.storage.clone())
            .check_system_health()
            .await;

        println!("System Health Check");
        println!("===================");
        println!("Overall: {:?}", status.overall);
        println!("Renderer: {:?} ({:?})", status.renderer, status.renderer_status);
        println!(
            "  Capture failure rate: {:.1}%",
            status.capture_failure_rate * 100.0
        );
        match status.storage_reachable {
            Some(reachable) => println!("Storage: {:?} (reachable: {reachable})", status.storage),
            None => println!("Storage: disabled, artifacts stay local"),
        }
        println!(
            "Temp files: {:?} ({} stale)",
            status.temp_files, status.stale_temp_files
        );
        Ok(())
    }
}

pub fn print_presets() {
    for (category, presets) in Preset::grouped() {
        println!("{}:", category.as_str());
        for spec in presets {
            println!(
                "  {:<18} {:>4}x{:<4} @{}x",
                spec.name, spec.width, spec.height, spec.device_scale_factor
            );
        }
    }
}

pub async fn validate_config_file(path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration: {}", path.display());

    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: Config = serde_json::from_str(&content).context("invalid configuration JSON")?;
    crate::validate_config(&config)?;

    println!("Configuration is valid:");
    println!("  Uploads dir: {}", config.uploads_dir.display());
    println!("  Temp dir: {}", config.temp_dir.display());
    println!(
        "  Default capture: {} {}x{} q{}",
        config.capture_defaults.format,
        config.capture_defaults.width,
        config.capture_defaults.height,
        config.capture_defaults.quality
    );
    println!("  Blacklisted domains: {}", config.blacklisted_domains.len());
    println!(
        "  Cloud storage: {}",
        if config.storage.enabled {
            config.storage.bucket.as_str()
        } else {
            "disabled"
        }
    );
    Ok(())
}

pub async fn read_urls_from_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(parse_url_list(&content))
}

/// One URL per line; blank lines and `#` comments are skipped.
pub fn parse_url_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Install the fmt subscriber. `RUST_LOG` wins over `verbose` when set.
pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}
