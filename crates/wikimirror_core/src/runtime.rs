use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::{DEFAULT_CONTENT_DIR, load_config};

pub const STATE_DIR_NAME: &str = ".wikimirror";
pub const LEDGER_FILENAME: &str = "sync.db";

const GITIGNORE_ENTRY: &str = ".wikimirror/sync.db*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub content_dir: PathBuf,
    pub state_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub content_source: ValueSource,
    pub config_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub content_dir_exists: bool,
    pub state_dir_exists: bool,
    pub db_exists: bool,
    pub config_exists: bool,
    pub git_initialized: bool,
    pub warnings: Vec<String>,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ncontent_dir={} ({})\ndb_path={}\nconfig_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.content_dir),
            self.content_source.as_str(),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }

    /// Path relative to the project root with forward slashes.
    pub fn relative_to_root(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.project_root).unwrap_or(path);
        normalize_for_display(relative)
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> RuntimeStatus {
    let project_root_exists = paths.project_root.exists();
    let content_dir_exists = paths.content_dir.exists();
    let state_dir_exists = paths.state_dir.exists();
    let db_exists = paths.db_path.exists();
    let config_exists = paths.config_path.exists();
    let git_initialized = paths.project_root.join(".git").exists();

    let mut warnings = Vec::new();
    if !content_dir_exists {
        warnings.push(format!(
            "{} is missing; run `wikimirror init` before sync commands",
            normalize_for_display(&paths.content_dir)
        ));
    }
    if !state_dir_exists {
        warnings
            .push(".wikimirror/ is missing; run `wikimirror init` before sync commands".to_string());
    }
    if !git_initialized {
        warnings.push("project root is not a git repository".to_string());
    }

    RuntimeStatus {
        project_root_exists,
        content_dir_exists,
        state_dir_exists,
        db_exists,
        config_exists,
        git_initialized,
        warnings,
    }
}

pub fn ensure_runtime_ready_for_sync(paths: &ResolvedPaths, status: &RuntimeStatus) -> Result<()> {
    if !status.content_dir_exists || !status.state_dir_exists {
        bail!(
            "Runtime layout is not initialized for sync.\nMissing required paths:\n  - {}\n  - {}\nRun: wikimirror init --project-root {}",
            if status.content_dir_exists {
                "content dir (ok)"
            } else {
                "content dir (missing)"
            },
            if status.state_dir_exists {
                ".wikimirror/ (ok)"
            } else {
                ".wikimirror/ (missing)"
            },
            normalize_for_display(&paths.project_root)
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
    pub wrote_gitignore: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env)
        .context("failed to resolve project root")?;
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (
            absolutize(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = lookup_env("WIKIMIRROR_CONFIG") {
        (
            absolutize(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("config.toml"), ValueSource::Default)
    };

    let config = load_config(&config_path)?;
    let (content_dir, content_source) = match config.sync.content_dir.as_deref() {
        Some(dir) if !dir.trim().is_empty() => (
            absolutize(Path::new(dir.trim()), &project_root),
            ValueSource::Config,
        ),
        _ => (project_root.join(DEFAULT_CONTENT_DIR), ValueSource::Default),
    };
    if !content_dir.starts_with(&project_root) {
        bail!(
            "content directory must live inside the project root: {}",
            normalize_for_display(&content_dir)
        );
    }

    Ok(ResolvedPaths {
        db_path: state_dir.join(LEDGER_FILENAME),
        project_root,
        content_dir,
        state_dir,
        config_path,
        root_source,
        content_source,
        config_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();

    for dir in [&paths.content_dir, &paths.state_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = if options.materialize_config {
        write_text_file(
            &paths.config_path,
            &render_materialized_config(paths),
            options.force,
        )?
    } else {
        false
    };

    let wrote_gitignore = ensure_gitignore_entry(&paths.project_root)?;

    Ok(InitReport {
        created_dirs,
        wrote_config,
        wrote_gitignore,
    })
}

pub fn render_materialized_config(paths: &ResolvedPaths) -> String {
    let content_dir = paths.relative_to_root(&paths.content_dir);
    format!(
        "# wikimirror configuration (materialized by `wikimirror init`)\n# Credentials are read from WIKI_USER and WIKI_API_TOKEN (environment or .env).\n\n[wiki]\n# base_url = \"https://your-site.atlassian.net/wiki\"\n# space_key = \"DOCS\"\n# root_page_id = \"123456\"\n# user_agent = \"wikimirror/0.1\"\n\n[sync]\nreplay_history = false\n# author_email_domain = \"example.com\"\ncontent_dir = \"{content_dir}\"\n",
    )
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> Result<(PathBuf, ValueSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return Ok((absolutize(path, &context.cwd), ValueSource::Flag));
    }

    if let Some(value) = lookup_env("WIKIMIRROR_PROJECT_ROOT") {
        return Ok((
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        ));
    }

    let root = detect_project_root_heuristic(&context.cwd, context.executable_dir.as_deref());
    Ok((root, ValueSource::Heuristic))
}

fn detect_project_root_heuristic(cwd: &Path, executable_dir: Option<&Path>) -> PathBuf {
    let mut seen = HashSet::new();
    for candidate in candidate_roots(cwd, executable_dir) {
        let key = normalize_for_display(&candidate);
        if !seen.insert(key) {
            continue;
        }
        if candidate.join(STATE_DIR_NAME).is_dir() {
            return candidate;
        }
    }
    cwd.to_path_buf()
}

fn candidate_roots(cwd: &Path, executable_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut out = ancestors(cwd);
    if let Some(exe_dir) = executable_dir {
        out.extend(ancestors(exe_dir));
    }
    out
}

fn ancestors(path: &Path) -> Vec<PathBuf> {
    path.ancestors().map(Path::to_path_buf).collect()
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

/// Keep the ledger database out of version control.
fn ensure_gitignore_entry(project_root: &Path) -> Result<bool> {
    let path = project_root.join(".gitignore");
    let existing = if path.exists() {
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?
    } else {
        String::new()
    };
    if existing.lines().any(|line| line.trim() == GITIGNORE_ENTRY) {
        return Ok(false);
    }

    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(GITIGNORE_ENTRY);
    updated.push('\n');
    fs::write(&path, updated).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
