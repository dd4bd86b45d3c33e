//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use egressos_core::pipeline::{
    PipelineOptions, PipelineReport, PrepareSociosOptions, PrepareSociosReport, ProgressReporter,
};
use egressos_shared::{
    AppConfig, IdentityHasher, Month, init_config, load_config, load_config_from,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// egressos: flag alumni who are founders or partners of Brazilian companies.
#[derive(Parser)]
#[command(
    name = "egressos",
    version,
    about = "Enrich the alumni roster with a founder/partner flag from the CNPJ partner registry.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.egressos/egressos.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Download and normalize the partner registry.
    PrepareSocios(SociosArgs),

    /// Enrich the alumni roster and rewrite the output dataset.
    Pipeline(PipelineArgs),

    /// prepare-socios followed by pipeline.
    Run {
        #[command(flatten)]
        socios: SociosArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Registry selection flags.
#[derive(Args, Debug, Clone)]
pub(crate) struct SociosArgs {
    /// Publication month (YYYY-MM). Defaults to the latest published.
    #[arg(long, env = "SOCIOS_MONTH")]
    pub month: Option<Month>,

    /// Maximum archives to download; negative means all.
    #[arg(long, env = "SOCIOS_MAX_FILES", allow_negative_numbers = true)]
    pub max_files: Option<i64>,

    /// Archive name prefix to download (repeatable, or comma-separated).
    #[arg(long = "prefix", env = "SOCIOS_DOWNLOAD_PREFIXES", value_delimiter = ',')]
    pub prefixes: Vec<String>,

    /// Renormalize even if the archives are unchanged.
    #[arg(long)]
    pub force: bool,
}

/// Roster flags.
#[derive(Args, Debug, Clone)]
pub(crate) struct PipelineArgs {
    /// Alumni roster spreadsheet (xlsx, xls, ods or csv).
    #[arg(long, env = "EGRESSO_EXCEL_FILE")]
    pub excel: Option<PathBuf>,

    /// Reference date for ages (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    pub as_of: Option<NaiveDate>,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "egressos=info",
        1 => "egressos=debug",
        _ => "egressos=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone();
    match cli.command {
        Command::PrepareSocios(args) => {
            let config = resolve_config(config_path.as_ref())?;
            cmd_prepare_socios(&config, &args).await
        }
        Command::Pipeline(args) => {
            let config = resolve_config(config_path.as_ref())?;
            cmd_pipeline(&config, &args).await
        }
        Command::Run { socios, pipeline } => {
            let config = resolve_config(config_path.as_ref())?;
            cmd_prepare_socios(&config, &socios).await?;
            cmd_pipeline(&config, &pipeline).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path.as_ref()),
        },
    }
}

fn resolve_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

fn hasher(config: &AppConfig) -> Result<IdentityHasher> {
    IdentityHasher::from_env(&config.privacy.salt_env).map_err(|e| {
        eyre!(
            "{e}; export {} with the pseudonymization salt",
            config.privacy.salt_env
        )
    })
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_prepare_socios(config: &AppConfig, args: &SociosArgs) -> Result<()> {
    let hasher = hasher(config)?;
    let options = PrepareSociosOptions {
        month: args.month.clone(),
        max_files: args.max_files,
        prefixes: (!args.prefixes.is_empty()).then(|| args.prefixes.clone()),
        force: args.force,
    };

    info!(
        month = ?options.month,
        max_files = ?options.max_files,
        force = options.force,
        "preparing partner registry"
    );

    let reporter = CliProgress::new();
    let result =
        egressos_core::pipeline::prepare_socios(config, &options, &hasher, &reporter).await;
    reporter.clear();
    let report = result?;

    let manifest = &report.outcome.manifest;
    println!();
    println!("  Partner registry ready.");
    println!("  Month:     {}", report.month);
    println!(
        "  Archives:  {} ({} cached)",
        report.archives.len(),
        report.cached
    );
    println!("  Rows:      {}", manifest.rows_read);
    println!("  Malformed: {}", manifest.malformed_rows);
    println!("  Partners:  {}", manifest.distinct_ids);
    println!(
        "  Reused:    {}",
        if report.outcome.reused { "yes" } else { "no" }
    );
    println!("  Path:      {}", config.paths.silver_dir);
    println!("  Time:      {:.1}s", report.elapsed.as_secs_f64());
    println!();

    Ok(())
}

async fn cmd_pipeline(config: &AppConfig, args: &PipelineArgs) -> Result<()> {
    let hasher = hasher(config)?;
    let roster = args
        .excel
        .clone()
        .or_else(|| config.paths.roster_file.as_ref().map(PathBuf::from))
        .ok_or_else(|| {
            eyre!("no roster given: pass --excel, set EGRESSO_EXCEL_FILE or [paths] roster_file")
        })?;
    let options = PipelineOptions {
        roster,
        as_of: args
            .as_of
            .unwrap_or_else(|| chrono::Local::now().date_naive()),
    };

    info!(
        roster = %options.roster.display(),
        as_of = %options.as_of,
        "running enrichment pipeline"
    );

    let reporter = CliProgress::new();
    let result = egressos_core::pipeline::run_pipeline(config, &options, &hasher, &reporter).await;
    reporter.clear();
    let report = result?;

    let enrichment = &report.enrichment;
    println!();
    println!("  Enriched dataset written.");
    println!("  Records:        {}", enrichment.rows);
    println!("  Founders:       {}", enrichment.founders);
    println!("  Name matches:   {}", enrichment.name_matches);
    println!("  No identifier:  {}", enrichment.missing_identifiers);
    println!("  Unknown age:    {}", enrichment.unknown_ages);
    for (bracket, count) in &report.output.partitions {
        println!("    {bracket:>8}: {count}");
    }
    for warning in &enrichment.warnings {
        println!("  Warning:        {warning}");
    }
    println!("  Path:           {}", report.output.dataset_dir.display());
    println!("  Time:           {:.1}s", report.elapsed.as_secs_f64());
    println!();

    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&PathBuf>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn clear(&self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn socios_done(&self, _report: &PrepareSociosReport) {
        self.spinner.finish_and_clear();
    }

    fn pipeline_done(&self, _report: &PipelineReport) {
        self.spinner.finish_and_clear();
    }
}
