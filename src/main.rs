use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use cohort_trend_pipeline::config::{
    PipelineConfig, DEFAULT_DEBOUNCE_MS, DEFAULT_MAX_PAGES, DEFAULT_PAGE_DELAY_MS,
    DEFAULT_PAGE_SIZE, DEFAULT_REQUEST_TIMEOUT_SECS,
};
use cohort_trend_pipeline::report;
use cohort_trend_pipeline::service::{CsvEvaluationService, EvaluationService, HttpEvaluationService};
use cohort_trend_pipeline::{Facet, FilterState, Orchestrator, Pipeline, ScopeConstraint};

#[derive(Parser)]
#[command(name = "cohort-trends")]
#[command(about = "Cluster performance and income trends for household evaluations", long_about = None)]
struct Cli {
    /// Serve records from a CSV extract instead of the evaluation API
    #[arg(long, global = true)]
    records_csv: Option<PathBuf>,
    /// Restrict every query to a single region
    #[arg(long, global = true)]
    scope_region: Option<String>,
    #[arg(long, global = true, default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    timeout_secs: u64,
    #[arg(long, global = true, default_value_t = DEFAULT_PAGE_DELAY_MS)]
    page_delay_ms: u64,
    /// Records requested per page when the bulk request comes back empty
    #[arg(long, global = true, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: usize,
    /// Page ceiling for one collection
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_PAGES)]
    max_pages: usize,
    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn config(&self) -> PipelineConfig {
        let config = PipelineConfig::default()
            .with_request_timeout_secs(self.timeout_secs)
            .with_page_delay_ms(self.page_delay_ms)
            .with_page_size(self.page_size)
            .with_max_pages(self.max_pages);
        match &self.command {
            Commands::Watch { debounce_ms } => config.with_debounce_ms(*debounce_ms),
            _ => config,
        }
    }
}

#[derive(Args, Debug, Default)]
struct FacetArgs {
    #[arg(long, value_delimiter = ',')]
    cohort: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    cycle: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    evaluation_month: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    region: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    district: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    cluster: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    village: Vec<String>,
}

impl FacetArgs {
    fn filters(&self) -> FilterState {
        let selections = [
            (Facet::Cohort, &self.cohort),
            (Facet::Cycle, &self.cycle),
            (Facet::EvaluationMonth, &self.evaluation_month),
            (Facet::Region, &self.region),
            (Facet::District, &self.district),
            (Facet::Cluster, &self.cluster),
            (Facet::Village, &self.village),
        ];

        // Top-down, so each selection survives the cascade of the ones above it.
        let mut filters = FilterState::new();
        for (facet, values) in selections {
            if !values.is_empty() {
                filters.set(facet, values.iter().cloned());
            }
        }
        filters
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one collection cycle and write a markdown report
    Snapshot {
        #[command(flatten)]
        facets: FacetArgs,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
        /// Also print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the facet values available under a selection
    Options {
        #[command(flatten)]
        facets: FacetArgs,
    },
    /// Read `facet=v1,v2` lines from stdin and print every published snapshot
    Watch {
        #[arg(long, default_value_t = DEFAULT_DEBOUNCE_MS)]
        debounce_ms: u64,
    },
}

fn build_service(cli: &Cli, config: &PipelineConfig) -> anyhow::Result<Arc<dyn EvaluationService>> {
    if let Some(path) = &cli.records_csv {
        let service = CsvEvaluationService::from_path(path)
            .with_context(|| format!("failed to load records from {}", path.display()))?;
        return Ok(Arc::new(service));
    }

    let base_url = std::env::var("EVAL_API_URL")
        .context("EVAL_API_URL must be set to the evaluation service base URL (or pass --records-csv)")?;
    let service = HttpEvaluationService::new(&base_url, config)
        .context("failed to build the evaluation service client")?;
    Ok(Arc::new(service))
}

fn parse_change(line: &str) -> anyhow::Result<(Facet, Vec<String>)> {
    let (facet, values) = line
        .split_once('=')
        .with_context(|| format!("expected `facet=value,...`, got `{line}`"))?;
    let facet: Facet = facet.parse()?;
    let values = values.split(',').map(|value| value.trim().to_string()).collect();
    Ok((facet, values))
}

async fn watch(orchestrator: Orchestrator) -> anyhow::Result<()> {
    let _printer = orchestrator.on_snapshot(|snapshot| {
        println!(
            "[generation {}] {}: {} households, {} buckets, {} trends ({})",
            snapshot.generation,
            snapshot.filters,
            snapshot.record_count,
            snapshot.buckets.len(),
            snapshot.trends.len(),
            snapshot.completeness
        );
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_change(line) {
            Ok((facet, values)) => orchestrator.on_filter_change(facet, values),
            Err(err) => eprintln!("{err:#}"),
        }
    }

    while orchestrator.is_loading() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // Let the printer observe the final publish.
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let config = cli.config();

    let service = build_service(&cli, &config)?;
    let scope = cli
        .scope_region
        .as_ref()
        .map(|region| ScopeConstraint::new(Facet::Region, region.clone()));

    match &cli.command {
        Commands::Snapshot { facets, out, json } => {
            let pipeline = Pipeline::new(service, scope, config);
            let snapshot = pipeline
                .run_once(&facets.filters())
                .await
                .context("collection failed")?;

            if *json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            let report = report::build_report(&snapshot, pipeline.scope());
            std::fs::write(out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Options { facets } => {
            let pipeline = Pipeline::new(service, scope, config);
            let options = pipeline
                .filter_options(&facets.filters())
                .await
                .context("failed to fetch filter options")?;

            println!("Cohorts: {}", options.cohorts.join(", "));
            println!("Cycles: {}", options.cycles.join(", "));
            let months: Vec<String> = options
                .evaluation_months
                .iter()
                .map(|month| month.to_string())
                .collect();
            println!("Evaluation months: {}", months.join(", "));
            println!("Regions: {}", options.regions.join(", "));
            println!("Districts: {}", options.districts.join(", "));
            println!("Clusters: {}", options.clusters.join(", "));
            println!("Villages: {}", options.villages.join(", "));
        }
        Commands::Watch { .. } => {
            let orchestrator = Orchestrator::new(service, scope, config);
            watch(orchestrator).await?;
        }
    }

    Ok(())
}
