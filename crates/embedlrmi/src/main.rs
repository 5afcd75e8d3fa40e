use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use embedlrmi_core::config::{Settings, load_config};
use embedlrmi_core::gateway::{CACHE_NAMESPACE, MetadataGateway, first_node, url_fingerprint};
use embedlrmi_core::hooks::{
    HEAD_ITEM_NAME, HtmlBuffer, PageContext, on_before_page_display, on_perform_action,
    sidebar_link, toolbox_link,
};
use embedlrmi_core::migrate::{pending_migration_count, run_migrations};
use embedlrmi_core::provider::HttpProvider;
use embedlrmi_core::resolver::resolve;
use embedlrmi_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    normalize_for_display, resolve_paths,
};
use embedlrmi_core::sqlite_store::SqliteStore;
use embedlrmi_core::{Error, hooks};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Parser)]
#[command(
    name = "embedlrmi",
    version,
    about = "Fetch, cache and inspect LRMI metadata for wiki pages"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<std::path::PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<std::path::PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<std::path::PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Enable debug logging on stderr")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<std::path::PathBuf>,
    data_dir: Option<std::path::PathBuf>,
    config: Option<std::path::PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create .embedlrmi/ and a starter config.toml")]
    Init(InitArgs),
    #[command(about = "Print the canonical URL and cache key for a page URL")]
    Resolve(UrlArgs),
    #[command(about = "Look up metadata for a page URL, using the cache")]
    Fetch(UrlArgs),
    #[command(about = "Print the JSON-LD head item a page would receive")]
    Show(UrlArgs),
    #[command(about = "Print the action=lrmi HTML view for a page")]
    Render(UrlArgs),
    #[command(about = "Drop the cached entry for a page URL")]
    Invalidate(UrlArgs),
    #[command(about = "Remove every cached LRMI entry")]
    Purge,
    Status,
    Db(DbArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config.toml")]
    force: bool,
}

#[derive(Debug, Args)]
struct UrlArgs {
    #[arg(help = "Full page URL as the wiki reports it")]
    url: String,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Migrate,
    Stats,
    #[command(about = "Delete expired cache rows")]
    Prune,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    initialize_logging(cli.verbose)?;
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Resolve(UrlArgs { url })) => run_resolve(&runtime, &url),
        Some(Commands::Fetch(UrlArgs { url })) => run_fetch(&runtime, &url),
        Some(Commands::Show(UrlArgs { url })) => run_show(&runtime, &url),
        Some(Commands::Render(UrlArgs { url })) => run_render(&runtime, &url),
        Some(Commands::Invalidate(UrlArgs { url })) => run_invalidate(&runtime, &url),
        Some(Commands::Purge) => run_purge(&runtime),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Migrate => run_db_migrate(&runtime),
            DbSubcommand::Stats => run_db_stats(&runtime),
            DbSubcommand::Prune => run_db_prune(&runtime),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn initialize_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, args.force)?;

    println!("Initialized embedlrmi runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_resolve(runtime: &RuntimeOptions, url: &str) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let rules = config.rewrite_rules();
    let canonical = resolve(url, &rules);

    println!("raw_url: {url}");
    println!("rules: {}", rules.len());
    println!("canonical_url: {canonical}");
    println!("cache_key: {CACHE_NAMESPACE}:{}", url_fingerprint(&canonical));
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_fetch(runtime: &RuntimeOptions, url: &str) -> Result<()> {
    let (paths, settings, gateway) = open_gateway(runtime)?;
    let canonical = gateway.canonical_url(url);

    println!("endpoint: {}", settings.endpoint);
    println!("canonical_url: {canonical}");
    println!("cache_key: {}", gateway.cache_key(&canonical));
    println!("ttl_seconds: {}", gateway.ttl_seconds());
    match gateway.fetch_metadata(&canonical) {
        Some(payload) => {
            println!("has_nodes: {}", format_flag(first_node(&payload).is_some()));
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        None => println!("metadata: <none> (provider unavailable or response not JSON)"),
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_show(runtime: &RuntimeOptions, url: &str) -> Result<()> {
    let (paths, _settings, gateway) = open_gateway(runtime)?;
    let page = content_page(url);
    let mut out = HtmlBuffer::default();
    on_before_page_display(&gateway, &page, &mut out);

    match out.head_items.iter().find(|(name, _)| name == HEAD_ITEM_NAME) {
        Some((name, markup)) => {
            println!("head_item: {name}");
            println!("{markup}");
        }
        None => println!("head_item: <none>"),
    }
    for link in [toolbox_link(&page), sidebar_link(&page)].into_iter().flatten() {
        println!("link.{}: {} -> {}", link.id, link.text, link.href);
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_render(runtime: &RuntimeOptions, url: &str) -> Result<()> {
    let (paths, _settings, gateway) = open_gateway(runtime)?;
    let mut out = HtmlBuffer::default();
    on_perform_action(&gateway, &content_page(url), hooks::VIEW_ACTION, &mut out);
    println!("title: {}", out.title.as_deref().unwrap_or("<none>"));
    println!("robots: {}", out.robot_policy.as_deref().unwrap_or("<none>"));
    println!("{}", out.body);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_invalidate(runtime: &RuntimeOptions, url: &str) -> Result<()> {
    let (paths, _settings, gateway) = open_gateway(runtime)?;
    let canonical = gateway.canonical_url(url);
    gateway.invalidate(&canonical);

    println!("canonical_url: {canonical}");
    println!("cache_key: {}", gateway.cache_key(&canonical));
    println!("invalidated: yes");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_purge(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, _settings, gateway) = open_gateway(runtime)?;
    match gateway.purge_all() {
        Ok(removed) => println!("purged_entries: {removed}"),
        Err(Error::PurgeUnsupported) => bail!("the configured cache store cannot purge"),
        Err(error) => return Err(error).context("failed to purge LRMI cache"),
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    let config = load_config(&paths.config_path)?;

    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("config_exists: {}", format_flag(status.config_exists));
    match config.settings() {
        Ok(settings) => print_settings(&settings),
        Err(error) => println!("settings: <invalid> ({error})"),
    }
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let pending = pending_migration_count(&paths)?;
    let report = run_migrations(&paths)?;

    println!("db migrate");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("pending_before: {pending}");
    if report.applied.is_empty() {
        println!("applied: <none>");
    } else {
        for migration in &report.applied {
            println!("applied: v{:03}_{}", migration.version, migration.name);
        }
    }
    println!("current_version: {}", report.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;

    println!("db stats");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("db_exists: {}", format_flag(status.db_exists));
    if status.db_exists {
        let store = open_store(&paths)?;
        let stats = store.stats()?;
        println!("cache.entries: {}", stats.entries);
        println!("cache.expired: {}", stats.expired);
    } else {
        println!("cache.storage: <not created> (run `embedlrmi db migrate`)");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_prune(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let store = open_store(&paths)?;
    let removed = store.prune_expired()?;

    println!("db prune");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("removed_expired: {removed}");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn open_store(paths: &ResolvedPaths) -> Result<SqliteStore> {
    SqliteStore::open(&paths.db_path)
        .with_context(|| format!("failed to open cache at {}", paths.db_path.display()))
}

fn open_gateway(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, Settings, MetadataGateway)> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let settings = config.settings()?;
    let store = Arc::new(open_store(&paths)?);
    let provider = Arc::new(HttpProvider::from_settings(&settings)?);
    let gateway = MetadataGateway::from_settings(&settings, store, provider);
    Ok((paths, settings, gateway))
}

fn content_page(url: &str) -> PageContext {
    PageContext {
        full_url: url.to_string(),
        local_url: url.to_string(),
        is_content_page: true,
    }
}

fn print_settings(settings: &Settings) {
    println!("settings.endpoint: {}", settings.endpoint);
    println!("settings.rewrite_rules: {}", settings.rewrite_rules.len());
    println!("settings.cache_expiry_secs: {}", settings.cache_expiry_secs);
    println!(
        "settings.http_timeout_ms: {}",
        settings.http_timeout.as_millis()
    );
    println!("settings.user_agent: {}", settings.user_agent);
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

fn normalize_path(path: &Path) -> String {
    normalize_for_display(path)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
