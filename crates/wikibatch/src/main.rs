use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wikibatch_core::config::load_config;
use wikibatch_core::executor::{ExecuteOptions, ExecuteReport};
use wikibatch_core::intake::{IntakeOutcome, IntakeReport};
use wikibatch_core::migrate::{migrate_store, pending_migration_count};
use wikibatch_core::pipeline::Pipeline;
use wikibatch_core::resolver::ResolveReport;
use wikibatch_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, ensure_runtime_ready,
    init_layout, inspect_runtime, normalize_for_display, resolve_paths,
};
use wikibatch_core::wiki::{MediaWikiClient, MediaWikiClientConfig};

#[derive(Debug, Parser)]
#[command(
    name = "wikibatch",
    version,
    about = "Resumable bulk wiki-edit pipeline: intake, resolve, execute"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(long, global = true, help = "Print stage reports as JSON")]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
    json: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
            json: cli.json,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create .wikibatch/ and write the default config")]
    Init(InitArgs),
    #[command(about = "List configured request families")]
    Families,
    #[command(about = "Scan a family's request page and store new requests")]
    Intake(FamilyArgs),
    #[command(about = "Compute the page set of every pending request")]
    Resolve(FamilyArgs),
    #[command(about = "Apply edits to a batch of pending pages")]
    Execute(ExecuteArgs),
    #[command(about = "Run intake, resolve and execute for one family")]
    Run(ExecuteArgs),
    #[command(about = "Show per-request progress")]
    Status(StatusArgs),
    Db(DbArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config.toml")]
    force: bool,
}

#[derive(Debug, Args)]
struct FamilyArgs {
    #[arg(short, long, value_name = "NAME", help = "Family name from config.toml")]
    family: String,
}

#[derive(Debug, Args)]
struct ExecuteArgs {
    #[command(flatten)]
    family: FamilyArgs,
    #[arg(long, help = "Mutate pages and report changes without saving")]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[arg(short, long, value_name = "NAME", help = "Limit to one family")]
    family: Option<String>,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    #[command(about = "Bring family stores up to the latest schema")]
    Migrate(StatusArgs),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Commands::Init(args) => run_init(&runtime, args),
        Commands::Families => run_families(&runtime),
        Commands::Intake(args) => run_intake(&runtime, &args.family),
        Commands::Resolve(args) => run_resolve(&runtime, &args.family),
        Commands::Execute(args) => run_execute(&runtime, args),
        Commands::Run(args) => run_all(&runtime, args),
        Commands::Status(args) => run_status(&runtime, args),
        Commands::Db(DbArgs {
            command: DbSubcommand::Migrate(args),
        }) => run_db_migrate(&runtime, args),
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, &InitOptions { force: args.force })?;

    println!("Initialized wikibatch runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("data_dir: {}", normalize_for_display(&paths.data_dir));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_families(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, pipeline) = load_pipeline(runtime)?;
    let families = pipeline.families();

    println!("families");
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("families.count: {}", families.len());
    for family in families {
        println!(
            "family: {} type={} page={} store={} ({})",
            family.name,
            family.request_type,
            family.request_page,
            family.store_path,
            if family.store_exists { "found" } else { "missing" }
        );
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_intake(runtime: &RuntimeOptions, family: &str) -> Result<()> {
    let (paths, pipeline) = load_pipeline(runtime)?;
    let mut client = connect(&pipeline, true)?;
    let report = pipeline.intake(family, &mut client)?;
    if runtime.json {
        return print_json(&report);
    }

    println!("intake");
    println!("family: {family}");
    print_intake(&report);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_resolve(runtime: &RuntimeOptions, family: &str) -> Result<()> {
    let (paths, pipeline) = load_pipeline(runtime)?;
    let mut client = connect(&pipeline, false)?;
    let report = pipeline.resolve(family, &mut client)?;
    if runtime.json {
        return print_json(&report);
    }

    println!("resolve");
    println!("family: {family}");
    print_resolve(&report);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_execute(runtime: &RuntimeOptions, args: ExecuteArgs) -> Result<()> {
    let (paths, pipeline) = load_pipeline(runtime)?;
    let mut client = connect(&pipeline, !args.dry_run)?;
    let report = pipeline.execute(
        &args.family.family,
        &mut client,
        &ExecuteOptions {
            dry_run: args.dry_run,
        },
    )?;
    if runtime.json {
        return print_json(&report);
    }

    println!("execute");
    println!("family: {}", args.family.family);
    print_execute(&report);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_all(runtime: &RuntimeOptions, args: ExecuteArgs) -> Result<()> {
    let (paths, pipeline) = load_pipeline(runtime)?;
    let mut client = connect(&pipeline, true)?;
    let report = pipeline.run(
        &args.family.family,
        &mut client,
        &ExecuteOptions {
            dry_run: args.dry_run,
        },
    )?;
    if runtime.json {
        return print_json(&report);
    }

    println!("run");
    println!("family: {}", report.family);
    println!("\n[intake]");
    print_intake(&report.intake);
    println!("\n[resolve]");
    print_resolve(&report.resolve);
    println!("\n[execute]");
    print_execute(&report.execute);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions, args: StatusArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    let config = load_config(&paths.config_path)?;
    let pipeline = Pipeline::new(paths.clone(), config);
    if runtime.json {
        let reports = selected_families(&pipeline, args.family.as_deref())?
            .iter()
            .map(|family| pipeline.status(family))
            .collect::<Result<Vec<_>>>()?;
        return print_json(&reports);
    }

    println!("runtime status");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("stores: {}", status.family_stores.join(", "));
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }

    for family in selected_families(&pipeline, args.family.as_deref())? {
        let report = pipeline.status(&family)?;
        println!("\n[{}]", report.family);
        println!("request_type: {}", report.request_type);
        println!(
            "store: {} ({})",
            report.store_path,
            if report.store_exists { "found" } else { "missing" }
        );
        println!("requests.count: {}", report.requests.len());
        println!("requests.done: {}", report.done_count());
        for item in &report.requests {
            let request = &item.request;
            println!(
                "request: #{} {} -> {} status={} pages={}/{} done={}",
                request.id,
                pipeline
                    .namespaces()
                    .full_title(request.from_namespace, &request.from_title),
                request
                    .to_title
                    .as_deref()
                    .map(|title| pipeline.namespaces().full_title(
                        request.to_namespace.unwrap_or(request.from_namespace),
                        title
                    ))
                    .unwrap_or_else(|| "<none>".to_string()),
                request.status.as_str(),
                item.completed_pages,
                item.total_pages,
                format_flag(item.done)
            );
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions, args: StatusArgs) -> Result<()> {
    let (paths, pipeline) = load_pipeline(runtime)?;

    println!("db migrate");
    println!("data_dir: {}", normalize_for_display(&paths.data_dir));
    for family in selected_families(&pipeline, args.family.as_deref())? {
        let db_path = paths.family_db_path(&family);
        let pending = pending_migration_count(&db_path)?;
        let report = migrate_store(&db_path)
            .with_context(|| format!("failed to migrate store for family {family}"))?;
        println!(
            "family: {family} pending={pending} applied={} version={}",
            report.applied.len(),
            report.current_version
        );
        for migration in &report.applied {
            println!("  applied: v{:03}_{}", migration.version, migration.name);
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn selected_families(pipeline: &Pipeline, family: Option<&str>) -> Result<Vec<String>> {
    match family {
        Some(name) => {
            pipeline.family(name)?;
            Ok(vec![name.to_string()])
        }
        None => Ok(pipeline.config().families.keys().cloned().collect()),
    }
}

fn load_pipeline(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, Pipeline)> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready(&paths, &status)?;
    let config = load_config(&paths.config_path)?;
    if config.families.is_empty() {
        bail!(
            "no families configured in {}",
            normalize_for_display(&paths.config_path)
        );
    }
    Ok((paths.clone(), Pipeline::new(paths, config)))
}

fn connect(pipeline: &Pipeline, write: bool) -> Result<MediaWikiClient> {
    let mut client = MediaWikiClient::new(MediaWikiClientConfig::from_config(pipeline.config()))?;
    if write {
        if client.login_from_env()? {
            info!("logged in from WIKI_BOT_USER");
        } else {
            warn!("WIKI_BOT_USER/WIKI_BOT_PASS not set, editing anonymously");
        }
    }
    Ok(client)
}

fn print_intake(report: &IntakeReport) {
    println!("request_page: {}", report.request_page);
    println!("editor: {}", report.editor.as_deref().unwrap_or("<unknown>"));
    match &report.outcome {
        IntakeOutcome::Idle => println!("outcome: idle"),
        IntakeOutcome::Accepted { request_ids } => {
            println!("outcome: accepted");
            println!("requests.created: {}", request_ids.len());
        }
        IntakeOutcome::Relocated { talk_page, reason } => {
            println!("outcome: relocated");
            println!("talk_page: {talk_page}");
            println!("reason: {reason}");
        }
    }
}

fn print_resolve(report: &ResolveReport) {
    println!("requests.pending: {}", report.pending);
    println!("requests.resolved: {}", report.resolved);
    println!("requests.empty: {}", report.empty);
    println!("pages.recorded: {}", report.pages_recorded);
    print_errors(&report.errors);
}

fn print_execute(report: &ExecuteReport) {
    println!("dry_run: {}", report.dry_run);
    println!("requests: {}", report.requests);
    println!("pages.saved: {}", report.saved);
    println!("pages.unchanged: {}", report.unchanged);
    println!("pages.missing: {}", report.missing);
    if report.dry_run {
        println!("pages.would_save: {}", report.would_save);
    }
    println!("pages.failed: {}", report.failed);
    println!("requests.finished: {}", report.finished_requests.len());
    for page in &report.pages {
        println!(
            "page: {} {} +{} -{}",
            page.action.as_str(),
            page.title,
            page.inserted_lines,
            page.deleted_lines
        );
    }
    println!("request_count: {}", report.request_count);
    print_errors(&report.errors);
}

fn print_json<T: Serialize>(report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

fn print_errors(errors: &[String]) {
    if errors.is_empty() {
        return;
    }
    println!("errors:");
    for error in errors {
        println!("  - {error}");
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
