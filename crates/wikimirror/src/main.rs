use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use wikimirror_core::config::{MirrorConfig, WikiConfigPatch, load_config, patch_wiki_config};
use wikimirror_core::remote::{ConfluenceClient, ConfluenceClientConfig};
use wikimirror_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, ensure_runtime_ready_for_sync,
    init_layout, inspect_runtime, normalize_for_display, resolve_paths,
};
use wikimirror_core::sync::{
    PullOptions, PushOptions, SyncContext, SyncProgress, diff_pages, pull, push, status,
};
use wikimirror_core::vcs::{GitCli, LogOptions, VersionControl};

#[derive(Debug, Parser)]
#[command(
    name = "wikimirror",
    version,
    about = "Mirror a wiki page tree into a git-tracked Markdown directory"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print results as JSON")]
    json: bool,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    json: bool,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            json: cli.json,
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Pull(PullArgs),
    Push(PushArgs),
    Status(StatusArgs),
    Diff,
    Log(LogArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing .wikimirror/config.toml")]
    force: bool,
    #[arg(long, help = "Skip writing .wikimirror/config.toml")]
    no_config: bool,
    #[arg(long, value_name = "URL", help = "Set [wiki].base_url")]
    base_url: Option<String>,
    #[arg(long, value_name = "KEY", help = "Set [wiki].space_key")]
    space_key: Option<String>,
    #[arg(long, value_name = "ID", help = "Set [wiki].root_page_id")]
    root_page_id: Option<String>,
}

#[derive(Debug, Args)]
struct PullArgs {
    #[arg(long, help = "Overwrite locally modified pages")]
    force: bool,
    #[arg(long, help = "Commit every remote version with its original author")]
    history: bool,
    #[arg(long, value_name = "NAME", help = "Create and switch to a branch before writing")]
    branch: Option<String>,
}

#[derive(Debug, Args)]
struct PushArgs {
    #[arg(long, help = "Report what would change without touching the wiki")]
    dry_run: bool,
    #[arg(short = 'm', long, value_name = "MESSAGE", help = "Revision comment for updates")]
    message: Option<String>,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[arg(long, help = "Include unified diffs for changed pages")]
    diff: bool,
}

#[derive(Debug, Args)]
struct LogArgs {
    #[arg(short = 'n', long, value_name = "N", default_value_t = 20)]
    max_count: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Pull(args)) => run_pull(&runtime, args),
        Some(Commands::Push(args)) => run_push(&runtime, args),
        Some(Commands::Status(args)) => run_status(&runtime, args),
        Some(Commands::Diff) => run_diff(&runtime),
        Some(Commands::Log(args)) => run_log(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;
    let patched = patch_wiki_config(
        &paths.config_path,
        &WikiConfigPatch {
            set_base_url: args.base_url,
            set_space_key: args.space_key,
            set_root_page_id: args.root_page_id,
        },
    )?;
    let git_created = GitCli::new(&paths.project_root)
        .init_repository()
        .context("failed to initialize git repository")?;

    println!("Initialized wikimirror runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("content_dir: {}", normalize_for_display(&paths.content_dir));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("patched_config: {patched}");
    println!("wrote_gitignore: {}", report.wrote_gitignore);
    println!("git_initialized: {}", format_flag(git_created));
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_pull(runtime: &RuntimeOptions, args: PullArgs) -> Result<()> {
    let session = open_session(runtime)?;
    let options = PullOptions {
        force: args.force,
        replay_history: args.history || session.config.replay_history(),
        branch: args.branch,
        cancel: None,
    };
    let mut client = session.client()?;
    let mut vcs = GitCli::new(&session.paths.project_root);
    let result = pull(
        session.context()?,
        &mut client,
        &mut vcs,
        &options,
        &mut report_progress,
    )?;

    if runtime.json {
        return print_json(&result);
    }
    println!("pull");
    println!("project_root: {}", normalize_for_display(&session.paths.project_root));
    println!("pulled: {}", result.pulled);
    println!("unchanged: {}", result.unchanged);
    println!("skipped: {}", result.skipped);
    println!("commits: {}", result.commits);
    println!("cancelled: {}", format_flag(result.cancelled));
    println!("requests: {}", result.request_count);
    for page in &result.pages {
        println!("page.{}: {} ({})", page.action, page.path, page.status.as_str());
    }
    print_errors(&result.errors);
    print_diagnostics(runtime, &session.paths);
    Ok(())
}

fn run_push(runtime: &RuntimeOptions, args: PushArgs) -> Result<()> {
    let session = open_session(runtime)?;
    let options = PushOptions {
        dry_run: args.dry_run,
        message: args.message,
    };
    let mut client = session.client()?;
    let mut vcs = GitCli::new(&session.paths.project_root);
    let result = push(
        session.context()?,
        &mut client,
        &mut vcs,
        &options,
        &mut report_progress,
    )?;

    if runtime.json {
        return print_json(&result);
    }
    println!("push{}", if result.dry_run { " (dry run)" } else { "" });
    println!("project_root: {}", normalize_for_display(&session.paths.project_root));
    println!("pushed: {}", result.pushed);
    println!("created: {}", result.created);
    println!("updated: {}", result.updated);
    println!("deleted: {}", result.deleted);
    println!("requests: {}", result.request_count);
    for action in &result.actions {
        println!("action.{}: {}", action.action.as_str(), action.path);
    }
    print_errors(&result.errors);
    print_diagnostics(runtime, &session.paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions, args: StatusArgs) -> Result<()> {
    let session = open_session(runtime)?;
    let mut client = session.client()?;
    let result = status(session.context()?, &mut client)?;
    let diffs = if args.diff {
        diff_pages(session.context()?, &mut client)?
    } else {
        Vec::new()
    };

    if runtime.json {
        #[derive(Serialize)]
        struct StatusOutput<'a> {
            #[serde(flatten)]
            status: &'a wikimirror_core::sync::StatusResult,
            diffs: &'a [wikimirror_core::sync::PageDiff],
        }
        return print_json(&StatusOutput {
            status: &result,
            diffs: &diffs,
        });
    }
    println!("status");
    println!("project_root: {}", normalize_for_display(&session.paths.project_root));
    println!("synced: {}", result.synced);
    println!("local_modified: {}", result.local_modified);
    println!("remote_modified: {}", result.remote_modified);
    println!("conflicts: {}", result.conflicts);
    println!("local_only: {}", result.local_only);
    println!("remote_only: {}", result.remote_only);
    for file in &result.files {
        println!("file.{}: {}", file.status.as_str(), file.path);
    }
    for diff in &diffs {
        print!("{}", diff.diff);
    }
    print_errors(&result.errors);
    print_diagnostics(runtime, &session.paths);
    Ok(())
}

fn run_diff(runtime: &RuntimeOptions) -> Result<()> {
    let session = open_session(runtime)?;
    let mut client = session.client()?;
    let diffs = diff_pages(session.context()?, &mut client)?;

    if runtime.json {
        return print_json(&diffs);
    }
    if diffs.is_empty() {
        println!("diff: <none>");
    }
    for diff in &diffs {
        print!("{}", diff.diff);
    }
    Ok(())
}

fn run_log(runtime: &RuntimeOptions, args: LogArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let vcs = GitCli::new(&paths.project_root);
    let commits = vcs.log(&LogOptions {
        max_count: Some(args.max_count),
        path: Some(paths.relative_to_root(&paths.content_dir)),
    })?;

    if runtime.json {
        return print_json(&commits);
    }
    if commits.is_empty() {
        println!("log: <empty>");
    }
    for commit in &commits {
        let short = commit.hash.get(..10).unwrap_or(&commit.hash);
        let subject = commit.message.lines().next().unwrap_or_default();
        println!(
            "{short} {} {} <{}> {subject}",
            commit.date.format("%Y-%m-%d %H:%M"),
            commit.author,
            commit.email
        );
    }
    Ok(())
}

/// Everything a sync command needs after the layout checks passed.
struct Session {
    paths: ResolvedPaths,
    config: MirrorConfig,
}

impl Session {
    fn client(&self) -> Result<ConfluenceClient> {
        ConfluenceClient::new(ConfluenceClientConfig::from_config(&self.config))
            .context("failed to create wiki client")
    }

    fn context(&self) -> Result<SyncContext> {
        let Some(root_page_id) = self.config.root_page_id() else {
            bail!("no root page configured; set WIKI_ROOT_PAGE_ID or [wiki].root_page_id");
        };
        let context = SyncContext::load(self.paths.clone(), root_page_id)
            .context("failed to scan local pages")?;
        Ok(context.with_author_email_domain(self.config.author_email_domain()))
    }
}

fn open_session(runtime: &RuntimeOptions) -> Result<Session> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths);
    ensure_runtime_ready_for_sync(&paths, &status)?;
    let config = load_config(&paths.config_path)?;
    Ok(Session { paths, config })
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    let paths = resolve_paths(&context, &overrides)?;
    tracing::debug!(project_root = %normalize_for_display(&paths.project_root), "resolved runtime paths");
    Ok(paths)
}

fn report_progress(progress: &SyncProgress) {
    eprintln!(
        "[{}] {}/{} {}",
        progress.operation, progress.completed, progress.total, progress.title
    );
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_errors(errors: &[String]) {
    if errors.is_empty() {
        return;
    }
    println!("errors: {}", errors.len());
    for error in errors {
        println!("  - {error}");
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
