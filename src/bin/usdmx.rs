use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use unicef_sdmx::models::{DataflowId, IndicatorCode, YearRange};
use unicef_sdmx::resolver::FallbackTable;
use unicef_sdmx::{
    FetchEngine, FetchRequest, FetchResult, Filters, IndicatorResolver, SchemaKeyBuilder,
    Settings, storage,
};

#[derive(Parser, Debug)]
#[command(
    name = "usdmx",
    version,
    about = "Resolve, key and fetch UNICEF SDMX indicators with dataflow fallback"
)]
struct Cli {
    /// JSON settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding indicators.yaml and dataflows/ (overrides settings).
    #[arg(long, global = true)]
    metadata_dir: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch data for an indicator (or a whole dataflow with --dataflow alone).
    Get(GetArgs),
    /// Show the candidate dataflows for an indicator.
    Resolve(ResolveArgs),
    /// Print the query key for an indicator in one dataflow.
    Key(KeyArgs),
    /// Search the local indicator catalog by code or name.
    Search(SearchArgs),
    /// Report whether the local catalog is older than the allowed age.
    Stale(StaleArgs),
}

#[derive(ValueEnum, Clone, Debug)]
enum OutFormat {
    Csv,
    Json,
}

#[derive(Args, Debug)]
struct FilterArgs {
    /// Dimension filter DIM=VALUE (repeatable; join codes with '+').
    #[arg(short, long = "filter", value_name = "DIM=VALUE")]
    filters: Vec<String>,
    /// Empty segments for every disaggregation instead of totals.
    #[arg(long, default_value_t = false)]
    all_disaggregations: bool,
}

#[derive(Args, Debug)]
struct GetArgs {
    /// Indicator code (e.g., CME_MRY0T4).
    #[arg(short, long)]
    indicator: Option<String>,
    /// Dataflow to try first; alone, exports the whole dataflow.
    #[arg(long)]
    dataflow: Option<String>,
    #[command(flatten)]
    filter: FilterArgs,
    /// Year (YYYY) or range (YYYY:YYYY, YYYY:, :YYYY)
    #[arg(short = 'y', long)]
    years: Option<String>,
    /// Save results to file (format inferred by --format or extension).
    #[arg(long)]
    out: Option<PathBuf>,
    /// Output format (csv or json). If omitted, inferred from --out extension.
    #[arg(long, value_enum)]
    format: Option<OutFormat>,
    /// Print the attempt history as JSON to stdout.
    #[arg(long, default_value_t = false)]
    attempts: bool,
}

#[derive(Args, Debug)]
struct ResolveArgs {
    indicator: String,
    #[arg(long)]
    dataflow: Option<String>,
}

#[derive(Args, Debug)]
struct KeyArgs {
    indicator: String,
    #[arg(long)]
    dataflow: String,
    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Args, Debug)]
struct SearchArgs {
    query: String,
    /// Maximum number of matches to print.
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Args, Debug)]
struct StaleArgs {
    /// Maximum catalog age in days (default from settings).
    #[arg(long)]
    max_age_days: Option<u32>,
}

fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(x) if x.is_finite() => {
            // Format up to 4 decimals, then trim trailing zeros and trailing dot.
            let s = format!("{:.4}", x);
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        }
        _ => "NA".to_string(),
    }
}

fn parse_filters(args: &FilterArgs) -> Result<Filters> {
    let mut filters = Filters::new();
    for raw in &args.filters {
        let (dim, value) = raw
            .split_once('=')
            .with_context(|| format!("invalid --filter {raw:?}, expected DIM=VALUE"))?;
        filters.set(dim, value)?;
    }
    Ok(filters)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(dir) = cli.metadata_dir {
        settings.metadata_dir = dir;
    }
    match cli.cmd {
        Command::Get(args) => cmd_get(&settings, args),
        Command::Resolve(args) => cmd_resolve(&settings, args),
        Command::Key(args) => cmd_key(&settings, args),
        Command::Search(args) => cmd_search(&settings, args),
        Command::Stale(args) => cmd_stale(&settings, args),
    }
}

fn cmd_get(settings: &Settings, args: GetArgs) -> Result<()> {
    let store = settings.metadata_store();
    let engine = FetchEngine::new(&store, settings.transport()?, settings.fetch_options())
        .with_fallback_table(FallbackTable::load(&store)?);
    let years = args
        .years
        .as_deref()
        .map(str::parse::<YearRange>)
        .transpose()?;
    let dataflow = args
        .dataflow
        .as_deref()
        .map(str::parse::<DataflowId>)
        .transpose()?;

    let result: FetchResult = match (args.indicator.as_deref(), dataflow) {
        (Some(code), dataflow) => {
            let mut request = FetchRequest::new(code.parse::<IndicatorCode>()?)
                .filters(parse_filters(&args.filter)?)
                .all_disaggregations(args.filter.all_disaggregations);
            request.dataflow = dataflow;
            request.years = years;
            engine.fetch(&request)?
        }
        (None, Some(dataflow)) => engine.fetch_dataflow(&dataflow, years)?,
        (None, None) => anyhow::bail!("either --indicator or --dataflow is required"),
    };

    for attempt in &result.attempts {
        eprintln!(
            "{} [{}] {:?}: {} rows in {} pages",
            attempt.dataflow, attempt.key, attempt.outcome, attempt.rows, attempt.pages
        );
        for warning in &attempt.warnings {
            eprintln!("  warning: {warning}");
        }
    }
    if args.attempts {
        println!("{}", serde_json::to_string_pretty(&result.attempts)?);
    }

    if let Some(path) = args.out.as_ref() {
        let fmt = match args.format {
            Some(OutFormat::Csv) => "csv",
            Some(OutFormat::Json) => "json",
            None => path.extension().and_then(|e| e.to_str()).unwrap_or("csv"),
        }
        .to_ascii_lowercase();
        match fmt.as_str() {
            "csv" => storage::save_csv(&result, path)?,
            "json" => storage::save_json(&result.observations(), path)?,
            other => anyhow::bail!("unsupported format: {}", other),
        }
        eprintln!("Saved {} rows to {}", result.row_count(), path.display());
    } else if !args.attempts {
        for obs in result.observations() {
            println!(
                "{}\t{}\t{}\t{}",
                obs.ref_area,
                obs.indicator,
                obs.time_period,
                fmt_opt(obs.value)
            );
        }
    }
    Ok(())
}

fn cmd_resolve(settings: &Settings, args: ResolveArgs) -> Result<()> {
    let store = settings.metadata_store();
    let resolver = IndicatorResolver::with_table(&store, FallbackTable::load(&store)?);
    let code: IndicatorCode = args.indicator.parse()?;
    let dataflow = args
        .dataflow
        .as_deref()
        .map(str::parse::<DataflowId>)
        .transpose()?;
    let sequence = resolver.resolve_with_override(&code, dataflow.as_ref())?;
    println!("{code} ({:?})", sequence.source);
    for (i, flow) in sequence.iter().enumerate() {
        println!("{:>3}. {flow}", i + 1);
    }
    Ok(())
}

fn cmd_key(settings: &Settings, args: KeyArgs) -> Result<()> {
    let store = settings.metadata_store();
    let code: IndicatorCode = args.indicator.parse()?;
    let dataflow: DataflowId = args.dataflow.parse()?;
    let request = FetchRequest::new(code)
        .filters(parse_filters(&args.filter)?)
        .all_disaggregations(args.filter.all_disaggregations);
    let built = SchemaKeyBuilder::new(&store).build(
        &request.indicator,
        &dataflow,
        &request.filters,
        request.mode(),
    )?;
    println!("{}", built.key);
    for warning in &built.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(())
}

fn cmd_search(settings: &Settings, args: SearchArgs) -> Result<()> {
    let store = settings.metadata_store();
    let hits = store.search_indicators(&args.query)?;
    if hits.is_empty() {
        eprintln!("no indicators match {:?}", args.query);
    }
    for record in hits.iter().take(args.limit) {
        let flows = record
            .dataflows
            .iter()
            .map(|d| d.as_str())
            .collect::<Vec<_>>()
            .join(",");
        println!("{}\t{}\t{}", record.code, record.name, flows);
    }
    Ok(())
}

fn cmd_stale(settings: &Settings, args: StaleArgs) -> Result<()> {
    let store = settings.metadata_store();
    let max_age = args.max_age_days.unwrap_or(settings.cache_max_age_days);
    let path = store.layout().indicators_path();
    if store.is_stale(&path, max_age)? {
        log::warn!(
            "{} is missing or older than {max_age} days; resolution may use outdated dataflows",
            path.display()
        );
        println!("stale");
    } else {
        println!("fresh");
    }
    Ok(())
}
