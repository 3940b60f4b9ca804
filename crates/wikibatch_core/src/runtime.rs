use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub const STATE_DIR_NAME: &str = ".wikibatch";
pub const CONFIG_FILENAME: &str = "config.toml";

const EMBEDDED_CONFIG_TEMPLATE: &str = include_str!("../config/default-config.toml");

const ENV_PROJECT_ROOT: &str = "WIKIBATCH_PROJECT_ROOT";
const ENV_DATA_DIR: &str = "WIKIBATCH_DATA_DIR";
const ENV_CONFIG: &str = "WIKIBATCH_CONFIG";

/// Where a resolved path came from, reported by `--diagnostics`.
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
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        Ok(Self {
            cwd: env::current_dir().context("failed to read current directory")?,
            executable_dir: env::current_exe()
                .ok()
                .and_then(|path| path.parent().map(Path::to_path_buf)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    /// Every family owns exactly one store file under the data directory.
    pub fn family_db_path(&self, family: &str) -> PathBuf {
        self.data_dir.join(format!("{}.db", store_file_stem(family)))
    }

    pub fn diagnostics(&self) -> String {
        [
            ("project_root", &self.project_root, Some(self.root_source)),
            ("state_dir", &self.state_dir, None),
            ("data_dir", &self.data_dir, Some(self.data_source)),
            ("config_path", &self.config_path, Some(self.config_source)),
        ]
        .iter()
        .map(|(key, path, source)| match source {
            Some(source) => format!("{key}={} ({})", normalize_for_display(path), source.as_str()),
            None => format!("{key}={}", normalize_for_display(path)),
        })
        .collect::<Vec<_>>()
        .join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub state_dir_exists: bool,
    pub data_dir_exists: bool,
    pub config_exists: bool,
    /// Family names that already have a store file.
    pub family_stores: Vec<String>,
    pub warnings: Vec<String>,
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let data_dir_exists = paths.data_dir.is_dir();
    let family_stores = if data_dir_exists {
        list_family_stores(&paths.data_dir)?
    } else {
        Vec::new()
    };

    let status = RuntimeStatus {
        project_root_exists: paths.project_root.exists(),
        state_dir_exists: paths.state_dir.exists(),
        data_dir_exists,
        config_exists: paths.config_path.exists(),
        family_stores,
        warnings: Vec::new(),
    };
    let mut warnings = Vec::new();
    if !status.state_dir_exists {
        warnings.push(format!(
            "{STATE_DIR_NAME}/ is missing; run `wikibatch init` before pipeline commands"
        ));
    }
    if !status.config_exists {
        warnings.push(format!(
            "{} is missing; no families are configured",
            normalize_for_display(&paths.config_path)
        ));
    }
    Ok(RuntimeStatus { warnings, ..status })
}

fn list_family_stores(data_dir: &Path) -> Result<Vec<String>> {
    let entries =
        fs::read_dir(data_dir).with_context(|| format!("failed to list {}", data_dir.display()))?;
    let mut stores = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to list {}", data_dir.display()))?
            .path();
        if path.extension().is_some_and(|ext| ext == "db")
            && let Some(stem) = path.file_stem()
        {
            stores.push(stem.to_string_lossy().into_owned());
        }
    }
    stores.sort();
    Ok(stores)
}

/// Pipeline commands refuse to run until `init` has created the state dir and config.
pub fn ensure_runtime_ready(paths: &ResolvedPaths, status: &RuntimeStatus) -> Result<()> {
    if status.state_dir_exists && status.config_exists {
        return Ok(());
    }
    let mark = |present: bool| if present { "ok" } else { "missing" };
    bail!(
        "wikibatch is not initialized in {root}\n  - {STATE_DIR_NAME}/ ({})\n  - {CONFIG_FILENAME} ({})\nRun: wikibatch init --project-root {root}",
        mark(status.state_dir_exists),
        mark(status.config_exists),
        root = normalize_for_display(&paths.project_root),
    );
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

/// Root: flag > env > nearest ancestor holding `.wikibatch/config.toml` > cwd.
/// Data dir and config: flag > env > default under the state dir, relative to the root.
fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = match pick_override(
        overrides.project_root.as_deref(),
        ENV_PROJECT_ROOT,
        &lookup_env,
    ) {
        Some((path, source)) => (anchor(&path, &context.cwd), source),
        None => (find_project_root(context), ValueSource::Heuristic),
    };
    if project_root.as_os_str().is_empty() {
        bail!("failed to resolve project root");
    }
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (data_dir, data_source) =
        match pick_override(overrides.data_dir.as_deref(), ENV_DATA_DIR, &lookup_env) {
            Some((path, source)) => (anchor(&path, &project_root), source),
            None => (state_dir.join("data"), ValueSource::Default),
        };
    let (config_path, config_source) =
        match pick_override(overrides.config.as_deref(), ENV_CONFIG, &lookup_env) {
            Some((path, source)) => (anchor(&path, &project_root), source),
            None => (state_dir.join(CONFIG_FILENAME), ValueSource::Default),
        };

    Ok(ResolvedPaths {
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
}

fn pick_override<F>(flag: Option<&Path>, env_key: &str, lookup_env: &F) -> Option<(PathBuf, ValueSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = flag {
        return Some((path.to_path_buf(), ValueSource::Flag));
    }
    lookup_env(env_key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(|value| (PathBuf::from(value), ValueSource::Env))
}

fn find_project_root(context: &ResolutionContext) -> PathBuf {
    let marker = Path::new(STATE_DIR_NAME).join(CONFIG_FILENAME);
    context
        .cwd
        .ancestors()
        .chain(context.executable_dir.iter().flat_map(|dir| dir.ancestors()))
        .find(|candidate| candidate.join(&marker).is_file())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| context.cwd.clone())
}

fn anchor(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    for dir in [&paths.state_dir, &paths.data_dir] {
        if dir.exists() {
            continue;
        }
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        created_dirs.push(dir.clone());
    }

    let wrote_config = if paths.config_path.exists() && !options.force {
        false
    } else {
        if let Some(parent) = paths.config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&paths.config_path, EMBEDDED_CONFIG_TEMPLATE)
            .with_context(|| format!("failed to write {}", paths.config_path.display()))?;
        true
    };

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn embedded_config_template() -> &'static str {
    EMBEDDED_CONFIG_TEMPLATE
}

/// Family names become file stems; anything outside `[A-Za-z0-9_-]` turns into `_`.
fn store_file_stem(family: &str) -> String {
    let stem: String = family
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "default".to_string()
    } else {
        stem
    }
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
