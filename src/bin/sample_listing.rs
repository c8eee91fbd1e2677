use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Report};
use tracing_subscriber::EnvFilter;

use sample_listing::config::{ConfigLoader, ResolvedConfig};
use sample_listing::domain::{ColumnKey, RowKey};
use sample_listing::error::ListingError;
use sample_listing::export::{default_export_path, export_csv};
use sample_listing::filter::ColumnFilterArg;
use sample_listing::listing::{Listing, ListingUpdate, LoadReport, RefreshDecision};
use sample_listing::output::{
    ExportResult, FetchMissingResult, JsonOutput, OutputMode, RefreshResult, ShowResult,
    render_page,
};
use sample_listing::refresh::Trigger;
use sample_listing::remote::{FetchReport, MaterialHttpClient};
use sample_listing::scope::{Prefilter, RoleFilter};
use sample_listing::tui::Tui;
use sample_listing::view::ListingView;

#[derive(Parser)]
#[command(name = "sample-listing")]
#[command(about = "Deduplicated sample listing over local research-data snapshots")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(long, global = true, help = "Path to sample-listing.json")]
    config: Option<String>,

    #[arg(long, global = true, default_value_t = 300, help = "Seconds to wait for background work")]
    wait_secs: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Print one page of the listing")]
    Show(ShowArgs),
    #[command(about = "Write every filtered row of the visible columns to CSV")]
    Export(ExportArgs),
    #[command(about = "Rebuild the listing from the snapshots and update the cache")]
    Refresh(PrefilterArgs),
    #[command(about = "Fetch samples for subgroups with unresolved entries")]
    FetchMissing(PrefilterArgs),
    #[command(about = "Remove one sample (subgroup/sample) from the snapshot and the cache")]
    Purge(PurgeArgs),
    #[command(about = "Browse the listing interactively")]
    Browse(PrefilterArgs),
}

#[derive(Args, Clone, Default)]
struct PrefilterArgs {
    #[arg(long, value_enum, default_value_t = RoleFilter::OwnerAssistant)]
    role: RoleFilter,

    #[arg(long)]
    subgroup: Option<String>,

    #[arg(long)]
    grant: Option<String>,
}

impl PrefilterArgs {
    fn prefilter(&self) -> Prefilter {
        Prefilter {
            role: self.role,
            subgroup_id: self.subgroup.clone(),
            grant_number: self.grant.clone(),
        }
    }
}

#[derive(Args)]
struct ViewArgs {
    #[arg(long = "filter", value_name = "COLUMN=TEXT")]
    filters: Vec<ColumnFilterArg>,

    #[arg(long = "range", value_name = "COLUMN=MIN..MAX", value_parser = parse_range)]
    ranges: Vec<ColumnFilterArg>,

    #[arg(long = "show-column", value_name = "COLUMN")]
    show_columns: Vec<ColumnKey>,

    #[arg(long = "hide-column", value_name = "COLUMN")]
    hide_columns: Vec<ColumnKey>,

    #[arg(long, help = "Use cached rows without waiting for a refresh")]
    cached: bool,
}

impl ViewArgs {
    fn apply(&self, view: &mut ListingView) {
        for column in &self.show_columns {
            view.set_column_visible(*column, true);
        }
        for column in &self.hide_columns {
            view.set_column_visible(*column, false);
        }
        for filter in self.filters.iter().chain(&self.ranges) {
            view.apply_filter(filter);
        }
    }
}

#[derive(Args)]
struct ShowArgs {
    #[command(flatten)]
    prefilter: PrefilterArgs,

    #[command(flatten)]
    view: ViewArgs,

    #[arg(long, default_value_t = 1)]
    page: usize,

    #[arg(long, help = "Rows per page; 0 shows everything")]
    page_size: Option<usize>,
}

#[derive(Args)]
struct ExportArgs {
    #[command(flatten)]
    prefilter: PrefilterArgs,

    #[command(flatten)]
    view: ViewArgs,

    #[arg(long, short, help = "Target file; defaults to sample_listing_<timestamp>.csv")]
    output: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct PurgeArgs {
    key: RowKey,
}

fn parse_range(value: &str) -> Result<ColumnFilterArg, ListingError> {
    ColumnFilterArg::parse_range(value)
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<ListingError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ListingError) -> u8 {
    match error {
        ListingError::SampleNotFound(_) | ListingError::InvalidRowKey(_) => 2,
        ListingError::InvalidFilter(_) | ListingError::UnknownColumn(_) => 2,
        ListingError::MaterialHttp(_)
        | ListingError::MaterialStatus { .. }
        | ListingError::RefreshFailed(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let config = ConfigLoader::resolve(cli.config.as_deref()).map_err(Report::new)?;
    let wait = Duration::from_secs(cli.wait_secs);

    match cli.command {
        Some(Commands::Show(args)) => run_show(args, config, wait, output_mode),
        Some(Commands::Export(args)) => run_export(args, config, wait, output_mode),
        Some(Commands::Refresh(args)) => run_refresh(args, config, wait, output_mode),
        Some(Commands::FetchMissing(args)) => run_fetch_missing(args, config, wait, output_mode),
        Some(Commands::Purge(args)) => run_purge(args, config, output_mode),
        Some(Commands::Browse(args)) => run_browse(args, config),
        None => match output_mode {
            OutputMode::Interactive => run_browse(PrefilterArgs::default(), config),
            OutputMode::NonInteractive => Err(Report::msg(
                "command required (try `sample-listing --help`)",
            )),
        },
    }
}

fn listing(config: ResolvedConfig, prefilter: Prefilter) -> miette::Result<Listing<MaterialHttpClient>> {
    let client = MaterialHttpClient::new(Some(&config.material_api_base)).map_err(Report::new)?;
    Ok(Listing::new(config, client).with_prefilter(prefilter))
}

fn run_show(
    args: ShowArgs,
    config: ResolvedConfig,
    wait: Duration,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let mut listing = listing(config, args.prefilter.prefilter())?;
    let (load, missing) = load_listing(&mut listing, args.view.cached, wait)?;

    let view = listing.view_mut();
    args.view.apply(view);
    if let Some(page_size) = args.page_size {
        view.set_page_size(page_size);
    }
    view.set_page(args.page);

    let result = ShowResult {
        load,
        missing,
        page: view.snapshot(),
    };
    match output_mode {
        OutputMode::Interactive => {
            print!("{}", render_page(&result.page));
            if !result.missing.is_empty() {
                println!(
                    "{} subgroups have unresolved samples; run `sample-listing fetch-missing`",
                    result.missing.len()
                );
            }
        }
        OutputMode::NonInteractive => JsonOutput::print_show(&result).into_diagnostic()?,
    }
    Ok(())
}

fn run_export(
    args: ExportArgs,
    config: ResolvedConfig,
    wait: Duration,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let mut listing = listing(config, args.prefilter.prefilter())?;
    let (load, _) = load_listing(&mut listing, args.view.cached, wait)?;

    let view = listing.view_mut();
    args.view.apply(view);
    let path = args.output.unwrap_or_else(default_export_path);
    let rows = export_csv(view, &path).map_err(Report::new)?;

    let result = ExportResult {
        load,
        path: path.to_string(),
        rows,
    };
    match output_mode {
        OutputMode::Interactive => println!("exported {} rows to {}", result.rows, result.path),
        OutputMode::NonInteractive => JsonOutput::print_export(&result).into_diagnostic()?,
    }
    Ok(())
}

/// Loads the listing and, unless `cached`, waits for the background refresh.
/// Returns the subgroups still holding unresolved samples.
fn load_listing(
    listing: &mut Listing<MaterialHttpClient>,
    cached: bool,
    wait: Duration,
) -> miette::Result<(LoadReport, Vec<String>)> {
    let load = listing
        .load(Trigger::Background, false, &JsonOutput)
        .map_err(Report::new)?;
    let mut missing = Vec::new();
    if !cached {
        for update in listing.wait_idle(wait, &JsonOutput) {
            if let ListingUpdate::Refreshed { missing: pending, .. } = update {
                missing = pending;
            }
        }
    }
    Ok((load, missing))
}

fn run_refresh(
    args: PrefilterArgs,
    config: ResolvedConfig,
    wait: Duration,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let mut listing = listing(config, args.prefilter())?;
    let load = listing.refresh(&JsonOutput).map_err(Report::new)?;

    let mut missing = Vec::new();
    let mut cache_error = None;
    for update in listing.wait_idle(wait, &JsonOutput) {
        match update {
            ListingUpdate::RefreshFailed {
                trigger: Trigger::User,
                error,
                ..
            } => return Err(Report::new(error)),
            ListingUpdate::Refreshed { missing: pending, .. } => missing = pending,
            ListingUpdate::CacheWriteFailed { error } => cache_error = Some(error),
            _ => {}
        }
    }

    let result = RefreshResult {
        load,
        rows: listing.view().table().rows().len(),
        missing,
        cache_error,
    };
    match output_mode {
        OutputMode::Interactive => {
            println!("listing refreshed: {} rows (scope {})", result.rows, result.load.scope);
            if let Some(error) = &result.cache_error {
                println!("cache not saved: {error}");
            }
            if !result.missing.is_empty() {
                println!("unresolved subgroups: {}", result.missing.join(", "));
            }
        }
        OutputMode::NonInteractive => JsonOutput::print_refresh(&result).into_diagnostic()?,
    }
    Ok(())
}

fn run_fetch_missing(
    args: PrefilterArgs,
    config: ResolvedConfig,
    wait: Duration,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let mut listing = listing(config, args.prefilter())?;
    listing
        .load(Trigger::Background, false, &JsonOutput)
        .map_err(Report::new)?;
    let mut report = FetchReport::default();
    collect_fetch_reports(listing.wait_idle(wait, &JsonOutput), &mut report);

    let decision = listing.fetch_missing(&JsonOutput).map_err(Report::new)?;
    if decision != RefreshDecision::Skipped {
        collect_fetch_reports(listing.wait_idle(wait, &JsonOutput), &mut report);
    }

    let result = FetchMissingResult {
        decision,
        report,
        rows: listing.view().table().rows().len(),
    };
    match output_mode {
        OutputMode::Interactive => {
            println!("{}", result.report.message());
            for failed in &result.report.failed {
                println!("  {}: {}", failed.subgroup_id, failed.reason);
            }
        }
        OutputMode::NonInteractive => JsonOutput::print_fetch(&result).into_diagnostic()?,
    }
    Ok(())
}

fn collect_fetch_reports(updates: Vec<ListingUpdate>, into: &mut FetchReport) {
    for update in updates {
        if let ListingUpdate::MissingFetched(report) = update {
            into.succeeded.extend(report.succeeded);
            into.failed.extend(report.failed);
        }
    }
}

fn run_purge(args: PurgeArgs, config: ResolvedConfig, output_mode: OutputMode) -> miette::Result<()> {
    let mut listing = listing(config, Prefilter::default())?;
    let result = listing.purge_sample(&args.key, &JsonOutput).map_err(Report::new)?;
    match output_mode {
        OutputMode::Interactive => println!(
            "purged {} (snapshot: {}, cache: {})",
            result.key, result.snapshot_removed, result.cache_removed
        ),
        OutputMode::NonInteractive => JsonOutput::print_purge(&result).into_diagnostic()?,
    }
    Ok(())
}

fn run_browse(args: PrefilterArgs, config: ResolvedConfig) -> miette::Result<()> {
    let prefilter = args.prefilter();
    let mut listing = listing(config, prefilter.clone())?;
    let mut tui = Tui::new();
    tui.browse(&mut listing, prefilter)
}
