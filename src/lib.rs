//! # Page Capture
//!
//! Turns a URL into an optimized image. A capture job moves through
//! `pending → processing → completed | failed`: the URL is checked against
//! SSRF rules, a single shared headless Chrome renders the page in a fresh
//! context, a bounded readiness heuristic waits for images, fonts, DOM
//! quiescence and framework hydration, and the capture is re-encoded and
//! optionally uploaded to S3-compatible storage.
//!
//! ## Pipeline
//!
//! | Stage | Module | Notes |
//! |-------|--------|-------|
//! | URL safety | [`url_validator`] | Runs before anything is allocated |
//! | Renderer lifecycle | [`renderer`], [`browser`] | Lazy, single-flight launch; relaunch on disconnect |
//! | Readiness | [`readiness`] | Every step capped; script errors fall back to a flat wait |
//! | Capture | [`capture_service`] | Context closed and temp file removed on every exit path |
//! | Optimization | [`image_transform`] | Never grows the file, never changes format |
//! | Storage | [`storage`] | Upload failure keeps the local artifact |
//! | Job lifecycle | [`orchestrator`] | Compare-and-set entry into processing |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use page_capture::{
//!     CaptureOptions, CaptureService, Config, ImageFormat, InMemoryJobRepository,
//!     InMemoryUsageRepository, JobOrchestrator, Metrics,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let service = Arc::new(CaptureService::with_chromium(config, Arc::new(Metrics::new()))?);
//!     let orchestrator = JobOrchestrator::new(
//!         service.clone(),
//!         Arc::new(InMemoryJobRepository::new()),
//!         Arc::new(InMemoryUsageRepository::new()),
//!         None,
//!     );
//!
//!     let options = CaptureOptions {
//!         format: ImageFormat::Webp,
//!         ..Default::default()
//!     };
//!     let job = orchestrator.create_job("user-1", "https://example.com", options).await?;
//!     let outcome = orchestrator.process_job(job.id, "user-1").await?;
//!     println!("Completed: {}", outcome.is_completed());
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! page-capture capture --url https://example.com --format webp --preset desktop-fhd
//! page-capture batch --input urls.txt --concurrency 4 --progress-interval 5
//! page-capture check-url --url http://192.168.1.1/
//! ```

/// Configuration, capture options and browser arguments
pub mod config;

/// Error types and user-facing messages
pub mod error;

/// Named viewport presets
pub mod presets;

/// SSRF protection for capture targets
pub mod url_validator;

/// Jobs, artifacts and usage records
pub mod job;

/// Persistence ports and in-memory implementations
pub mod repository;

/// Renderer traits and the shared renderer controller
pub mod renderer;

/// Chrome implementation of the renderer traits
pub mod browser;

/// Rendering-completion heuristic
pub mod readiness;

/// Image re-encoding
pub mod image_transform;

/// Cloud storage port and adapter
pub mod storage;

/// Single-URL capture pipeline
pub mod capture_service;

/// Job state machine
pub mod orchestrator;

/// Background job processing
pub mod worker;

/// Command-line interface implementation
pub mod cli;

/// Performance metrics collection and export
pub mod metrics;

/// Health checks for renderer, storage and temp files
pub mod health;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod testing;


pub use browser::ChromiumLauncher;
pub use capture_service::{CaptureService, LocalArtifact};
pub use cli::*;
pub use config::*;
pub use error::*;
pub use health::*;
pub use image_transform::TransformOutput;
pub use job::*;
pub use metrics::*;
pub use orchestrator::{JobOrchestrator, CANCELLED_MESSAGE};
pub use presets::{Preset, PresetCategory, PresetSpec};
pub use readiness::{Framework, ReadinessReport, ReadinessStep};
pub use renderer::*;
pub use repository::*;
pub use storage::{
    generate_thumbnail_key, ObjectStorage, ObjectStoreBackend, StorageAdapter, StorageError,
    UploadOutcome,
};
pub use url_validator::{UnsafeUrlError, UrlValidator};
pub use utils::*;
pub use worker::*;
