use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const STATE_DIR_NAME: &str = ".embedlrmi";
pub const DB_FILENAME: &str = "lrmi-cache.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ndata_dir={} ({})\ndb_path={}\nconfig_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub state_dir_exists: bool,
    pub data_dir_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let state_dir_exists = paths.state_dir.exists();
    let data_dir_exists = paths.data_dir.exists();
    let config_exists = paths.config_path.exists();
    let db_exists = paths.db_path.exists();
    let db_size_bytes = if db_exists {
        let metadata = fs::metadata(&paths.db_path)
            .with_context(|| format!("failed to inspect {}", paths.db_path.display()))?;
        Some(metadata.len())
    } else {
        None
    };

    let mut warnings = Vec::new();
    if !config_exists {
        warnings.push(format!(
            "{} is missing; set EMBEDLRMI_ENDPOINT or run `embedlrmi init`",
            normalize_for_display(&paths.config_path)
        ));
    }
    if !db_exists {
        warnings.push("cache database not created yet; it is created on first fetch".to_string());
    }

    Ok(RuntimeStatus {
        state_dir_exists,
        data_dir_exists,
        db_exists,
        db_size_bytes,
        config_exists,
        warnings,
    })
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn init_layout(paths: &ResolvedPaths, force: bool) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    for dir in [&paths.state_dir, &paths.data_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = write_text_file(&paths.config_path, MATERIALIZED_CONFIG, force)?;
    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

const MATERIALIZED_CONFIG: &str = "# embedlrmi configuration (materialized by `embedlrmi init`)\n\n[lrmi]\n# Repository search endpoint queried with the canonical page URL. Required.\n# endpoint = \"https://repository.example.org/edu-sharing/rest/search/v1/queries/-home-/-default-/lrmi\"\n# Seconds a provider answer stays cached (0 = no expiry).\ncache_expiry = 2592000\nhttp_timeout_ms = 5000\n# user_agent = \"embedlrmi/0.2\"\n\n# Rewrites applied to the page URL, in order. A missing `to` entry deletes the match.\n[lrmi.url_replacements]\nfrom = []\nto = []\n";

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

pub(crate) fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env);
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (data_dir, data_source) = if let Some(path) = overrides.data_dir.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("EMBEDLRMI_DATA_DIR")) {
        (absolutize(Path::new(&value), &project_root), ValueSource::Env)
    } else {
        (state_dir.join("data"), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("EMBEDLRMI_CONFIG")) {
        (absolutize(Path::new(&value), &project_root), ValueSource::Env)
    } else {
        (state_dir.join("config.toml"), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        db_path: data_dir.join(DB_FILENAME),
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }
    if let Some(value) = non_empty(lookup_env("EMBEDLRMI_PROJECT_ROOT")) {
        return (absolutize(Path::new(&value), &context.cwd), ValueSource::Env);
    }
    (detect_project_root(&context.cwd), ValueSource::Heuristic)
}

/// Nearest ancestor of `cwd` that already holds a state directory, else `cwd` itself.
fn detect_project_root(cwd: &Path) -> PathBuf {
    let mut seen = HashSet::new();
    for candidate in cwd.ancestors() {
        if !seen.insert(candidate.to_path_buf()) {
            continue;
        }
        if candidate.join(STATE_DIR_NAME).is_dir() {
            return candidate.to_path_buf();
        }
    }
    cwd.to_path_buf()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
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

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
