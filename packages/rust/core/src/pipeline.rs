//! Entry operations: `prepare_socios` (fetch + normalize the registry) and
//! `run_pipeline` (roster → enrichment → partitioned output).
//!
//! Every failure is wrapped in [`EgressosError::Stage`] naming the stage that
//! failed and how many items it had processed. Persisted outputs are only
//! replaced after a stage fully succeeds.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tracing::{info, instrument, warn};

use egressos_fetcher::{FetchRequest, Fetcher};
use egressos_registry::{Normalizer, PrepareOutcome};
use egressos_shared::{AppConfig, EgressosError, FetchConfig, IdentityHasher, Month, Result};

use crate::enrichment::{self, EnrichOptions, EnrichmentReport, RegistryIndex};
use crate::roster;
use crate::writer::{self, WriteReport};

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when `prepare_socios` completes.
    fn socios_done(&self, report: &PrepareSociosReport);
    /// Called when `run_pipeline` completes.
    fn pipeline_done(&self, report: &PipelineReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn socios_done(&self, _report: &PrepareSociosReport) {}
    fn pipeline_done(&self, _report: &PipelineReport) {}
}

// ---------------------------------------------------------------------------
// prepare_socios
// ---------------------------------------------------------------------------

/// Per-run overrides for `prepare_socios`. `None` falls back to the config.
#[derive(Debug, Clone, Default)]
pub struct PrepareSociosOptions {
    pub month: Option<Month>,
    pub max_files: Option<i64>,
    pub prefixes: Option<Vec<String>>,
    /// Renormalize even if the archives are unchanged.
    pub force: bool,
}

/// Result of `prepare_socios`.
#[derive(Debug)]
pub struct PrepareSociosReport {
    pub month: Month,
    /// Partner archives fed to the normalizer.
    pub archives: Vec<PathBuf>,
    /// Archives reused from a previous download.
    pub cached: usize,
    pub outcome: PrepareOutcome,
    pub elapsed: Duration,
}

/// Download the partner archives of a publication month and normalize them
/// into the silver datasets.
#[instrument(skip_all, fields(month = ?options.month, force = options.force))]
pub async fn prepare_socios(
    config: &AppConfig,
    options: &PrepareSociosOptions,
    hasher: &IdentityHasher,
    progress: &dyn ProgressReporter,
) -> Result<PrepareSociosReport> {
    let start = Instant::now();

    // --- Phase 1: Fetch ---
    progress.phase("Downloading registry archives");
    let fetcher = Fetcher::new(FetchConfig::from(config)).map_err(|e| e.at_stage("fetch", 0))?;
    let request = FetchRequest {
        month: options.month.clone(),
        max_files: options.max_files.unwrap_or(config.registry.max_files),
        prefixes: options
            .prefixes
            .clone()
            .unwrap_or_else(|| config.registry.prefixes.clone()),
        raw_dir: PathBuf::from(&config.paths.raw_dir),
    };
    let fetched = fetcher
        .fetch(&request)
        .await
        .map_err(|e| e.at_stage("fetch", 0))?;

    if !fetched.failed.is_empty() {
        let names: Vec<&str> = fetched.failed.iter().map(|(name, _)| name.as_str()).collect();
        warn!(failed = ?names, "registry archives missing, keeping previous outputs");
        return Err(EgressosError::Network(format!(
            "{} archive(s) failed to download: {}",
            names.len(),
            names.join(", ")
        ))
        .at_stage("fetch", fetched.files.len()));
    }

    let archives: Vec<PathBuf> = fetched
        .files
        .iter()
        .filter(|path| egressos_registry::is_partner_archive(path))
        .cloned()
        .collect();
    let skipped = fetched.files.len() - archives.len();
    if skipped > 0 {
        info!(skipped, "non-partner archives ignored");
    }

    // --- Phase 2: Normalize ---
    progress.phase("Normalizing partner registry");
    let silver = PathBuf::from(&config.paths.silver_dir);
    let normalizer = Normalizer::new(
        hasher.clone(),
        config.registry.join_key,
        config.registry.max_malformed_ratio,
    );
    let outcome = egressos_registry::prepare(
        &normalizer,
        &archives,
        &silver,
        Some(&fetched.month),
        options.force,
    )
    .map_err(|e| e.at_stage("normalize", archives.len()))?;

    let report = PrepareSociosReport {
        month: fetched.month,
        archives,
        cached: fetched.cached,
        outcome,
        elapsed: start.elapsed(),
    };

    info!(
        month = %report.month,
        archives = report.archives.len(),
        cached = report.cached,
        distinct_ids = report.outcome.manifest.distinct_ids,
        reused = report.outcome.reused,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "prepare-socios completed"
    );

    progress.socios_done(&report);
    Ok(report)
}

// ---------------------------------------------------------------------------
// run_pipeline
// ---------------------------------------------------------------------------

/// Inputs of an enrichment run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Alumni roster spreadsheet.
    pub roster: PathBuf,
    /// Reference date for ages.
    pub as_of: NaiveDate,
}

/// Result of `run_pipeline`.
#[derive(Debug)]
pub struct PipelineReport {
    pub enrichment: EnrichmentReport,
    pub output: WriteReport,
    pub elapsed: Duration,
}

/// Enrich the roster against the silver registry and replace the gold
/// dataset.
#[instrument(skip_all, fields(roster = %options.roster.display(), as_of = %options.as_of))]
pub async fn run_pipeline(
    config: &AppConfig,
    options: &PipelineOptions,
    hasher: &IdentityHasher,
    progress: &dyn ProgressReporter,
) -> Result<PipelineReport> {
    let start = Instant::now();

    progress.phase("Reading alumni roster");
    let roster = roster::load_roster(&options.roster).map_err(|e| e.at_stage("roster", 0))?;
    info!(rows = roster.len(), "roster loaded");

    progress.phase("Loading partner registry");
    let index = RegistryIndex::load(Path::new(&config.paths.silver_dir))
        .map_err(|e| e.at_stage("registry", roster.len()))?;

    progress.phase("Enriching records");
    let enrich_options = EnrichOptions {
        as_of: options.as_of,
        brackets: config.output.age_bracket_bounds.clone(),
        join_key: config.registry.join_key,
        name_match_threshold: config.registry.name_match_threshold,
    };
    let enriched = enrichment::enrich(&roster, index.as_ref(), hasher, &enrich_options)
        .map_err(|e| e.at_stage("enrich", roster.len()))?;

    progress.phase("Writing enriched dataset");
    let output = writer::write(
        &enriched.records,
        Path::new(&config.paths.gold_dir),
        &config.output.dataset_name,
        enriched.report.is_degraded(),
    )
    .map_err(|e| e.at_stage("write", enriched.records.len()))?;

    let report = PipelineReport {
        enrichment: enriched.report,
        output,
        elapsed: start.elapsed(),
    };

    info!(
        rows = report.enrichment.rows,
        founders = report.enrichment.founders,
        degraded = report.enrichment.is_degraded(),
        path = %report.output.dataset_dir.display(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "pipeline completed"
    );

    progress.pipeline_done(&report);
    Ok(report)
}
