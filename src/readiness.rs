//! Rendering-completion heuristic
//!
//! Decides when a navigated page is visually complete enough to capture.
//! Every step is bounded by its own ceiling and by the overall budget; any
//! script error abandons the remaining steps in favor of a flat wait. The
//! heuristic never fails a capture.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ReadinessConfig;
use crate::error::CaptureError;
use crate::renderer::RenderContext;

const LOAD_STATE_SCRIPT: &str = "document.readyState";

const IMAGES_SCRIPT: &str = r#"(() => {
  const ceiling = __IMAGE_CEILING_MS__;
  const pending = Array.from(document.images).filter(img => !img.complete);
  return Promise.all(pending.map(img => new Promise(resolve => {
    const timer = setTimeout(resolve, ceiling);
    const done = () => { clearTimeout(timer); resolve(); };
    img.addEventListener('load', done, { once: true });
    img.addEventListener('error', done, { once: true });
  }))).then(() => pending.length);
})()"#;

const FONTS_SCRIPT: &str =
    "document.fonts ? document.fonts.ready.then(() => document.fonts.size) : 0";

const QUIESCENCE_SCRIPT: &str = r#"new Promise(resolve => {
  const quiet = __QUIET_MS__;
  const ceiling = __CEILING_MS__;
  let timer = null;
  let hard = null;
  let observer = null;
  const finish = settled => {
    if (observer) observer.disconnect();
    clearTimeout(timer);
    clearTimeout(hard);
    resolve(settled);
  };
  observer = new MutationObserver(() => {
    clearTimeout(timer);
    timer = setTimeout(() => finish(true), quiet);
  });
  observer.observe(document.documentElement || document, {
    childList: true, subtree: true, attributes: true, characterData: true
  });
  timer = setTimeout(() => finish(true), quiet);
  hard = setTimeout(() => finish(false), ceiling);
})"#;

const FRAMEWORK_SCRIPT: &str = r#"(() => {
  const found = [];
  if (window.__NEXT_DATA__ || document.getElementById('__next')) found.push('nextjs');
  if (window.__NUXT__ || document.getElementById('__nuxt')) found.push('nuxt');
  if (window.ng || document.querySelector('[ng-version]')) found.push('angular');
  if (window.React || document.querySelector('[data-reactroot], [data-reactid]')) found.push('react');
  if (window.Vue || document.querySelector('[data-v-app], [data-server-rendered]')) found.push('vue');
  if (document.querySelector('[class*="svelte-"]')) found.push('svelte');
  return found;
})()"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    React,
    Vue,
    Svelte,
    Angular,
    NextJs,
    Nuxt,
}

impl Framework {
    fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "react" => Some(Framework::React),
            "vue" => Some(Framework::Vue),
            "svelte" => Some(Framework::Svelte),
            "angular" => Some(Framework::Angular),
            "nextjs" => Some(Framework::NextJs),
            "nuxt" => Some(Framework::Nuxt),
            _ => None,
        }
    }

    /// Extra settle time after the DOM goes quiet. Frameworks that hydrate
    /// after first paint get longer.
    pub fn settle_delay(&self) -> Duration {
        match self {
            Framework::Svelte => Duration::from_millis(300),
            Framework::React | Framework::Vue => Duration::from_millis(500),
            Framework::Angular => Duration::from_millis(1000),
            Framework::NextJs | Framework::Nuxt => Duration::from_millis(1500),
        }
    }
}

/// Longest settle delay among the detected frameworks.
pub fn settle_delay(frameworks: &[Framework]) -> Duration {
    frameworks
        .iter()
        .map(Framework::settle_delay)
        .max()
        .unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessStep {
    LoadState,
    Images,
    Fonts,
    DomQuiescence,
    Frameworks,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReadinessReport {
    /// Steps that finished before their ceiling.
    pub completed: Vec<ReadinessStep>,
    /// Steps cut short by their ceiling or by the budget.
    pub capped: Vec<ReadinessStep>,
    pub frameworks: Vec<Framework>,
    pub fell_back: bool,
    pub elapsed: Duration,
}

enum StepResult {
    Done(serde_json::Value),
    Capped,
}

struct Budget {
    started: Instant,
    deadline: Instant,
}

impl Budget {
    fn new(total: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started + total,
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn exhausted(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// Wait until the page in `context` looks rendered, spending at most `budget`.
pub async fn wait_until_ready(
    context: &dyn RenderContext,
    config: &ReadinessConfig,
    budget: Duration,
) -> ReadinessReport {
    let budget = Budget::new(budget);
    let mut report = ReadinessReport::default();

    if let Err(e) = run_steps(context, config, &budget, &mut report).await {
        warn!("Readiness check failed, using fallback wait: {}", e);
        report.fell_back = true;
        let wait = config.fallback_wait.min(budget.remaining());
        tokio::time::sleep(wait).await;
    }

    report.elapsed = budget.started.elapsed();
    debug!(
        elapsed_ms = report.elapsed.as_millis() as u64,
        fell_back = report.fell_back,
        frameworks = ?report.frameworks,
        "Readiness check finished"
    );
    report
}

async fn run_steps(
    context: &dyn RenderContext,
    config: &ReadinessConfig,
    budget: &Budget,
    report: &mut ReadinessReport,
) -> Result<(), CaptureError> {
    wait_for_load_state(context, config, budget, report).await?;

    let images = IMAGES_SCRIPT.replace(
        "__IMAGE_CEILING_MS__",
        &config.image_ceiling.as_millis().to_string(),
    );
    // Per-image ceilings run concurrently inside the page; the step ceiling
    // adds slack for the round trip.
    let images_ceiling = config.image_ceiling + Duration::from_millis(250);
    run_step(context, ReadinessStep::Images, &images, images_ceiling, budget, report).await?;

    run_step(context, ReadinessStep::Fonts, FONTS_SCRIPT, config.font_ceiling, budget, report)
        .await?;

    let quiescence = QUIESCENCE_SCRIPT
        .replace("__QUIET_MS__", &config.quiescence_window.as_millis().to_string())
        .replace("__CEILING_MS__", &config.mutation_ceiling.as_millis().to_string());
    let quiescence_ceiling = config.mutation_ceiling + Duration::from_millis(250);
    run_step(
        context,
        ReadinessStep::DomQuiescence,
        &quiescence,
        quiescence_ceiling,
        budget,
        report,
    )
    .await?;

    if let StepResult::Done(value) = run_step(
        context,
        ReadinessStep::Frameworks,
        FRAMEWORK_SCRIPT,
        config.load_ceiling,
        budget,
        report,
    )
    .await?
    {
        report.frameworks = parse_frameworks(&value);
        let delay = settle_delay(&report.frameworks).min(budget.remaining());
        if !delay.is_zero() {
            debug!(frameworks = ?report.frameworks, delay_ms = delay.as_millis() as u64, "Waiting for framework hydration");
            tokio::time::sleep(delay).await;
        }
    }

    Ok(())
}

async fn wait_for_load_state(
    context: &dyn RenderContext,
    config: &ReadinessConfig,
    budget: &Budget,
    report: &mut ReadinessReport,
) -> Result<(), CaptureError> {
    let ceiling = Instant::now() + config.load_ceiling.min(budget.remaining());
    loop {
        let remaining = ceiling.saturating_duration_since(Instant::now());
        let state = match tokio::time::timeout(remaining, context.evaluate(LOAD_STATE_SCRIPT)).await
        {
            Ok(state) => state?,
            Err(_) => serde_json::Value::Null,
        };
        if state.as_str() == Some("complete") {
            report.completed.push(ReadinessStep::LoadState);
            return Ok(());
        }
        let remaining = ceiling.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            report.capped.push(ReadinessStep::LoadState);
            return Ok(());
        }
        tokio::time::sleep(config.poll_interval.min(remaining)).await;
    }
}

async fn run_step(
    context: &dyn RenderContext,
    step: ReadinessStep,
    script: &str,
    ceiling: Duration,
    budget: &Budget,
    report: &mut ReadinessReport,
) -> Result<StepResult, CaptureError> {
    if budget.exhausted() {
        report.capped.push(step);
        return Ok(StepResult::Capped);
    }

    match tokio::time::timeout(ceiling.min(budget.remaining()), context.evaluate(script)).await {
        Ok(result) => {
            let value = result?;
            report.completed.push(step);
            Ok(StepResult::Done(value))
        }
        Err(_) => {
            debug!(?step, "Readiness step reached its ceiling");
            report.capped.push(step);
            Ok(StepResult::Capped)
        }
    }
}

fn parse_frameworks(value: &serde_json::Value) -> Vec<Framework> {
    value
        .as_array()
        .map(|markers| {
            markers
                .iter()
                .filter_map(serde_json::Value::as_str)
                .filter_map(Framework::from_marker)
                .collect()
        })
        .unwrap_or_default()
}
