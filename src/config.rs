//! Configuration loading.
//!
//! Two layers: the main file (`--config`, default `./config/harvest.toml`)
//! with `[db]`, `[server]`, `[runner]` and `[components]`, and a directory
//! tree of component files, each holding `[collectors.<n>]`,
//! `[harvesters.<n>]` and `[handlers.<n>]` tables.
//!
//! A component's full name is `<file stem>_<n>`. References inside a file
//! (`source`, `dependencies`, and reference-valued settings) resolve within
//! the same file unless they contain a dot: `other.n` means `other_n`.

use anyhow::{bail, Context, Result};
use mobility_harvester_core::component::{ParamSpec, Role};
use mobility_harvester_core::graph::NodeDecl;
use mobility_harvester_core::incremental::{DependencyPlan, HarvestPlan};
use mobility_harvester_core::models::PayloadKind;
use mobility_harvester_core::range::{Schedule, SourceRange};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub components: ComponentsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Client addresses allowed to query handlers. `localhost` matches any
    /// loopback address, `*` allows everyone.
    #[serde(default = "default_allowed_hosts")]
    pub allowed_hosts: Vec<String>,
}

fn default_bind() -> String {
    "127.0.0.1:8888".to_string()
}

fn default_allowed_hosts() -> Vec<String> {
    vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            allowed_hosts: default_allowed_hosts(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    /// Stop the whole process when any collector fails.
    #[serde(default)]
    pub fail_fast: bool,
    /// Sleep between harvester steps that made no progress.
    #[serde(default = "default_backoff")]
    pub harvester_backoff_secs: u64,
}

fn default_backoff() -> u64 {
    5
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            fail_fast: false,
            harvester_backoff_secs: default_backoff(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ComponentsConfig {
    #[serde(default = "default_components_dir")]
    pub dir: PathBuf,
}

fn default_components_dir() -> PathBuf {
    PathBuf::from("./configuration")
}

impl Default for ComponentsConfig {
    fn default() -> Self {
        Self {
            dir: default_components_dir(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.db.path.as_os_str().is_empty() {
        bail!("db.path must not be empty");
    }

    if config.server.bind.parse::<SocketAddr>().is_err() {
        bail!(
            "server.bind must be an address like 127.0.0.1:8888, got '{}'",
            config.server.bind
        );
    }

    if config.runner.harvester_backoff_secs == 0 {
        bail!("runner.harvester_backoff_secs must be >= 1");
    }

    Ok(config)
}

// ═══════════════════════════════════════════════════════════════════════
// Component files
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, Default)]
struct ComponentFile {
    #[serde(default)]
    collectors: BTreeMap<String, ComponentEntry>,
    #[serde(default)]
    harvesters: BTreeMap<String, ComponentEntry>,
    #[serde(default)]
    handlers: BTreeMap<String, ComponentEntry>,
}

/// `source_range` is either a row count or a duration string.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum RangeValue {
    Count(i64),
    Text(String),
}

/// One `[<role>.<n>]` table as written.
#[derive(Debug, Deserialize, Clone)]
struct ComponentEntry {
    implementation: String,
    #[serde(default = "default_data_type")]
    data_type: PayloadKind,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    source_range: Option<RangeValue>,
    #[serde(default = "default_strict")]
    source_range_strict: bool,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    dependencies_limit: Option<Vec<i64>>,
    #[serde(default)]
    multiple_results: bool,
    #[serde(default)]
    schedule: Option<String>,
    #[serde(default)]
    query_parameters: BTreeMap<String, String>,
    #[serde(default)]
    fail_fast: Option<bool>,
    #[serde(flatten)]
    settings: toml::Table,
}

fn default_data_type() -> PayloadKind {
    PayloadKind::Json
}

fn default_strict() -> bool {
    true
}

/// A fully resolved component declaration.
#[derive(Debug, Clone)]
pub struct ComponentSpec {
    /// Full name, `<file stem>_<n>`; also the name of its collection.
    pub name: String,
    /// Stem of the file it was declared in.
    pub file_stem: String,
    pub role: Role,
    pub implementation: String,
    pub kind: PayloadKind,
    /// Full name of the upstream component (harvesters only).
    pub source: Option<String>,
    pub source_range: SourceRange,
    pub strict: bool,
    pub dependencies: Vec<DependencyPlan>,
    pub multiple_results: bool,
    pub schedule: Option<Schedule>,
    pub query_parameters: BTreeMap<String, ParamSpec>,
    pub fail_fast: Option<bool>,
    /// Every other key of the entry, for the implementation factory.
    pub settings: toml::Table,
}

/// Resolve `reference` as written in the file with stem `file_stem`.
pub fn resolve_reference(file_stem: &str, reference: &str) -> String {
    if reference.contains('.') {
        reference.replace('.', "_")
    } else {
        format!("{file_stem}_{reference}")
    }
}

impl ComponentSpec {
    /// Resolve a reference relative to this component's file.
    pub fn resolve(&self, reference: &str) -> String {
        resolve_reference(&self.file_stem, reference)
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }

    /// A string setting that names another component, resolved.
    pub fn setting_reference(&self, key: &str) -> Option<String> {
        self.setting_str(key).map(|r| self.resolve(r))
    }

    pub fn node_decl(&self) -> NodeDecl {
        NodeDecl {
            name: self.name.clone(),
            role: self.role,
            source: self.source.clone(),
            dependencies: self.dependencies.iter().map(|d| d.name.clone()).collect(),
        }
    }

    /// The step description for a harvester; `None` for other roles.
    pub fn harvest_plan(&self) -> Option<HarvestPlan> {
        if self.role != Role::Harvester {
            return None;
        }
        Some(HarvestPlan {
            name: self.name.clone(),
            kind: self.kind,
            source: self.source.clone()?,
            source_range: self.source_range,
            strict: self.strict,
            dependencies: self.dependencies.clone(),
            multiple_results: self.multiple_results,
        })
    }
}

/// Parse one component file. `file_stem` prefixes every name.
pub fn parse_component_file(file_stem: &str, content: &str) -> Result<Vec<ComponentSpec>> {
    let file: ComponentFile = toml::from_str(content)
        .with_context(|| format!("Failed to parse component file '{}'", file_stem))?;

    let mut specs = Vec::new();
    for (role, entries) in [
        (Role::Collector, file.collectors),
        (Role::Harvester, file.harvesters),
        (Role::Handler, file.handlers),
    ] {
        for (name, entry) in entries {
            let spec = resolve_entry(file_stem, &name, role, entry)
                .with_context(|| format!("Invalid {} '{}' in '{}'", role, name, file_stem))?;
            specs.push(spec);
        }
    }
    Ok(specs)
}

fn resolve_entry(
    file_stem: &str,
    name: &str,
    role: Role,
    entry: ComponentEntry,
) -> Result<ComponentSpec> {
    if name.contains('.') {
        bail!("component names must not contain '.'");
    }

    match role {
        Role::Collector => {
            if entry.source.is_some() {
                bail!("collectors take no source");
            }
            if entry.schedule.is_none() {
                bail!("collectors need a schedule");
            }
        }
        Role::Harvester => {
            if entry.source.is_none() {
                bail!("harvesters need a source");
            }
        }
        Role::Handler => {
            if entry.source.is_some() {
                bail!("handlers take no source; name the collection in a setting");
            }
        }
    }
    if role != Role::Collector && entry.fail_fast.is_some() {
        bail!("fail_fast only applies to collectors");
    }
    if role != Role::Handler && !entry.query_parameters.is_empty() {
        bail!("query_parameters only apply to handlers");
    }
    if role != Role::Harvester && !entry.dependencies.is_empty() {
        bail!("only harvesters have dependencies");
    }

    let source_range = match entry.source_range {
        None => SourceRange::default(),
        Some(RangeValue::Count(n)) => SourceRange::from_count(n)?,
        Some(RangeValue::Text(text)) => text.parse()?,
    };

    let limits = match entry.dependencies_limit {
        None => vec![1; entry.dependencies.len()],
        Some(limits) => {
            if limits.len() != entry.dependencies.len() {
                bail!(
                    "dependencies_limit has {} entries for {} dependencies",
                    limits.len(),
                    entry.dependencies.len()
                );
            }
            limits
        }
    };
    let dependencies = entry
        .dependencies
        .iter()
        .zip(limits)
        .map(|(dep, limit)| {
            let limit = u32::try_from(limit)
                .ok()
                .filter(|l| *l >= 1)
                .with_context(|| format!("dependencies_limit for '{}' must be >= 1", dep))?;
            Ok::<_, anyhow::Error>(DependencyPlan {
                name: resolve_reference(file_stem, dep),
                limit,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let schedule = entry
        .schedule
        .as_deref()
        .map(str::parse::<Schedule>)
        .transpose()?;

    let query_parameters = entry
        .query_parameters
        .iter()
        .map(|(param, ty)| Ok::<_, anyhow::Error>((param.clone(), ty.parse::<ParamSpec>()?)))
        .collect::<Result<BTreeMap<_, _>>>()?;

    Ok(ComponentSpec {
        name: format!("{file_stem}_{name}"),
        file_stem: file_stem.to_string(),
        role,
        implementation: entry.implementation,
        kind: entry.data_type,
        source: entry.source.map(|s| resolve_reference(file_stem, &s)),
        source_range,
        strict: entry.source_range_strict,
        dependencies,
        multiple_results: entry.multiple_results,
        schedule,
        query_parameters,
        fail_fast: entry.fail_fast,
        settings: entry.settings,
    })
}

/// Load every `*.toml` under `dir`, recursively, in file-name order.
pub fn load_components(dir: &Path) -> Result<Vec<ComponentSpec>> {
    if !dir.is_dir() {
        bail!("Components directory does not exist: {}", dir.display());
    }

    let mut specs = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("toml")
        {
            continue;
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .with_context(|| format!("Component file name is not UTF-8: {}", path.display()))?;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read component file: {}", path.display()))?;
        specs.extend(parse_component_file(stem, &content)?);
    }
    Ok(specs)
}
