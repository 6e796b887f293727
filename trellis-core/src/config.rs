use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::patterns::{PatternDef, PatternSet};

/// Top-level Trellis configuration, matching `trellis.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrellisConfig {
    #[serde(default)]
    pub tracker: TrackerSection,
    #[serde(default)]
    pub source_control: SourceControlSection,
    #[serde(default)]
    pub patterns: PatternsSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub sync: SyncSection,
}

impl TrellisConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.display().to_string())
            } else {
                ConfigError::Parse(format!("{}: {e}", path.display()))
            }
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tracker.page_size == 0 || self.source_control.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.sync.fetch_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "sync.fetch_concurrency must be at least 1".into(),
            ));
        }
        if !self.tracker.projects.is_empty() && self.tracker.base_url.is_empty() {
            return Err(ConfigError::Invalid(
                "tracker.base_url is required when projects are configured".into(),
            ));
        }
        Ok(())
    }

    /// Compile every pattern table, failing on the first invalid regex.
    pub fn compile_patterns(&self) -> Result<CompiledPatterns, ConfigError> {
        CompiledPatterns::compile(&self.patterns)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSection {
    /// Base URL of the issue tracker, e.g. `https://issues.example.com`.
    pub base_url: String,
    /// Project keys to synchronize.
    pub projects: Vec<String>,
    /// Environment variable holding the account name for basic auth.
    pub username_env: String,
    /// Environment variable holding the API token.
    pub token_env: String,
    /// How far back recently-closed candidates are fetched.
    pub closed_lookback_days: u32,
    pub page_size: u32,
    /// Sleep between consecutive page requests.
    pub page_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            projects: Vec::new(),
            username_env: "TRELLIS_TRACKER_USER".to_string(),
            token_env: "TRELLIS_TRACKER_TOKEN".to_string(),
            closed_lookback_days: 7,
            page_size: 100,
            page_delay_ms: 1000,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceControlSection {
    pub api_base: String,
    pub token_env: String,
    /// `category → [org/repo, ...]`.
    pub repositories: BTreeMap<String, Vec<String>>,
    /// Organizations sampled each pass: their most recently updated
    /// repositories join the pass under the `collections` category.
    pub collection_orgs: Vec<String>,
    /// Repositories sampled per organization.
    pub collection_repo_limit: u32,
    /// Issues kept per sampled repository.
    pub collection_issue_limit: u32,
    /// Records carrying any of these labels are dropped before upsert.
    pub labels_exclude: Vec<String>,
    /// Default activity watermark when no checkpoint exists.
    pub updated_since_hours: u32,
    pub page_size: u32,
    /// Sleep between consecutive page requests.
    pub rate_limit_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for SourceControlSection {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
            repositories: BTreeMap::new(),
            collection_orgs: Vec::new(),
            collection_repo_limit: 10,
            collection_issue_limit: 10,
            labels_exclude: Vec::new(),
            updated_since_hours: 24,
            page_size: 100,
            rate_limit_delay_ms: 1000,
            timeout_secs: 30,
        }
    }
}

impl TrackerSection {
    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }
}

impl SourceControlSection {
    /// Category given to repositories found through `collection_orgs`.
    pub const COLLECTIONS: &'static str = "collections";

    /// Whether any source-control query is configured at all.
    pub fn is_configured(&self) -> bool {
        !self.repositories.is_empty() || !self.collection_orgs.is_empty()
    }

    /// Every configured repository paired with its category, in config order.
    pub fn all_repositories(&self) -> Vec<(String, String)> {
        self.repositories
            .iter()
            .flat_map(|(category, repos)| {
                repos
                    .iter()
                    .map(move |repo| (repo.clone(), category.clone()))
            })
            .collect()
    }

    /// Category for a repository, falling back to a name heuristic.
    pub fn category_of(&self, full_name: &str) -> String {
        for (category, repos) in &self.repositories {
            if repos.iter().any(|r| r == full_name) {
                return category.clone();
            }
        }
        if full_name.contains("ansible-collections") {
            Self::COLLECTIONS.to_string()
        } else {
            "other".to_string()
        }
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }
}

/// Raw pattern tables. Authoring these is up to the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternsSection {
    pub tracker_keys: Vec<PatternDef>,
    pub activity_refs: Vec<PatternDef>,
    /// Matched case-insensitively; results are lower-cased.
    pub technologies: Vec<PatternDef>,
    /// `component → [keyword, ...]`.
    pub components: BTreeMap<String, Vec<String>>,
}

impl Default for PatternsSection {
    fn default() -> Self {
        let plain = |p: &str| PatternDef::Plain(p.to_string());
        let keywords = |ks: &[&str]| ks.iter().map(|k| (*k).to_string()).collect::<Vec<_>>();
        Self {
            tracker_keys: vec![
                plain(r"[A-Z]+-\d+"),
                plain(r"JIRA[:\s]+([A-Z]+-\d+)"),
                plain(r"jira\..*?([A-Z]+-\d+)"),
            ],
            activity_refs: vec![
                plain(r"#(\d+)"),
                plain(r"github\.com/[\w.-]+/[\w.-]+/(?:issues|pull)/(\d+)"),
                plain(r"GH[:\s]+#?(\d+)"),
            ],
            technologies: vec![
                plain(r"\b(ansible|python|kubernetes|openshift|docker|podman)\b"),
                plain(r"\b(terraform|helm|yaml|json|api)\b"),
                plain(r"\b(automation|devops|ci/cd|pipeline)\b"),
            ],
            components: BTreeMap::from([
                (
                    "automation-platform".to_string(),
                    keywords(&["ansible", "automation", "aap"]),
                ),
                (
                    "container-platform".to_string(),
                    keywords(&["kubernetes", "openshift", "k8s"]),
                ),
                (
                    "ci-cd".to_string(),
                    keywords(&["pipeline", "ci/cd", "jenkins", "tekton"]),
                ),
                (
                    "infrastructure".to_string(),
                    keywords(&["terraform", "infrastructure", "iac"]),
                ),
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: u32,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 4000,
            multiplier: 2,
            max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// Keep recently-closed items that an open item still mentions.
    pub include_closed_with_open_deps: bool,
    /// Upstream fetches in flight at once during the fetch stage.
    pub fetch_concurrency: usize,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            include_closed_with_open_deps: true,
            fetch_concurrency: 4,
        }
    }
}

// ── Compiled patterns ──────────────────────────────────────────────

/// Immutable, compiled form of [`PatternsSection`], built once per process
/// and handed to the resolver.
#[derive(Debug, Clone)]
pub struct CompiledPatterns {
    pub tracker_keys: PatternSet,
    pub activity_refs: PatternSet,
    pub technologies: PatternSet,
    /// Lower-cased component name with lower-cased keywords.
    pub components: Vec<(String, Vec<String>)>,
}

impl CompiledPatterns {
    pub fn compile(section: &PatternsSection) -> Result<Self, ConfigError> {
        Ok(Self {
            tracker_keys: PatternSet::compile(&section.tracker_keys, false)?,
            activity_refs: PatternSet::compile(&section.activity_refs, false)?,
            technologies: PatternSet::compile(&section.technologies, true)?,
            components: section
                .components
                .iter()
                .map(|(name, keywords)| {
                    (
                        name.to_lowercase(),
                        keywords.iter().map(|k| k.to_lowercase()).collect(),
                    )
                })
                .collect(),
        })
    }

    /// Component names whose keywords occur in `text` (which must be lower-cased).
    pub fn components_in(&self, lowered: &str) -> Vec<&str> {
        self.components
            .iter()
            .filter(|(_, keywords)| keywords.iter().any(|k| lowered.contains(k.as_str())))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

impl Default for CompiledPatterns {
    fn default() -> Self {
        // Built-in tables are fixed literals that always compile.
        Self::compile(&PatternsSection::default()).expect("built-in patterns compile")
    }
}

// ── Credentials ────────────────────────────────────────────────────

/// Secrets resolved from the environment variables named in the config.
#[derive(Clone, Default)]
pub struct Credentials {
    pub tracker_username: Option<String>,
    pub tracker_token: Option<String>,
    pub forge_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("tracker_username", &self.tracker_username)
            .field("tracker_token", &self.tracker_token.as_ref().map(|_| "***"))
            .field("forge_token", &self.forge_token.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Credentials {
    pub fn from_env(config: &TrellisConfig) -> Result<Self, ConfigError> {
        Self::resolve(config, |name| std::env::var(name).ok())
    }

    /// Resolve credentials through `lookup`. Only sources that are actually
    /// configured require their variables.
    pub fn resolve(
        config: &TrellisConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let require = |name: &str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ConfigError::MissingCredential(name.to_string()))
        };

        let mut creds = Self::default();
        if !config.tracker.projects.is_empty() {
            creds.tracker_token = Some(require(&config.tracker.token_env)?);
            creds.tracker_username = lookup(&config.tracker.username_env).filter(|v| !v.is_empty());
        }
        if config.source_control.is_configured() {
            creds.forge_token = Some(require(&config.source_control.token_env)?);
        }
        Ok(creds)
    }
}
