use anyhow::{bail, Context, Result};
use globset::Glob;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "vecsync.toml";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub namespace: NamespaceConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            pattern: default_pattern(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_pattern() -> String {
    "**/*.md".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NamespaceConfig {
    /// Explicit namespace key. Derived from the environment when unset.
    #[serde(default)]
    pub key: Option<String>,
    /// Display name for a newly created index. Defaults to the key.
    #[serde(default)]
    pub index_name: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            page_size: default_page_size(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    5
}
fn default_page_size() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutorConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// Exit non-zero when any individual item failed.
    #[serde(default)]
    pub fail_on_item_errors: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_secs: default_poll_timeout_secs(),
            fail_on_item_errors: false,
        }
    }
}

fn default_concurrency() -> usize {
    8
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_poll_timeout_secs() -> u64 {
    300
}

impl ExecutorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

/// Values given on the command line that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub root: Option<PathBuf>,
    pub pattern: Option<String>,
    pub namespace: Option<String>,
    pub concurrency: Option<usize>,
    pub fail_on_item_errors: bool,
}

impl Config {
    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(root) = &overrides.root {
            self.source.root = root.clone();
        }
        if let Some(pattern) = &overrides.pattern {
            self.source.pattern = pattern.clone();
        }
        if let Some(namespace) = &overrides.namespace {
            self.namespace.key = Some(namespace.clone());
        }
        if let Some(concurrency) = overrides.concurrency {
            self.executor.concurrency = concurrency;
        }
        if overrides.fail_on_item_errors {
            self.executor.fail_on_item_errors = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        Glob::new(&self.source.pattern)
            .with_context(|| format!("Invalid source.pattern '{}'", self.source.pattern))?;
        for pattern in &self.source.exclude_globs {
            Glob::new(pattern)
                .with_context(|| format!("Invalid source.exclude_globs entry '{}'", pattern))?;
        }

        if let Some(key) = &self.namespace.key {
            if key.trim().is_empty() {
                bail!("namespace.key must not be empty");
            }
            if key.contains('/') {
                bail!("namespace.key must not contain '/': '{}'", key);
            }
        }

        if !(1..=100).contains(&self.remote.page_size) {
            bail!("remote.page_size must be in [1, 100]");
        }
        if self.remote.api_key_env.trim().is_empty() {
            bail!("remote.api_key_env must not be empty");
        }

        if self.executor.concurrency == 0 {
            bail!("executor.concurrency must be >= 1");
        }
        if self.executor.poll_interval_ms == 0 {
            bail!("executor.poll_interval_ms must be > 0");
        }
        if self.executor.poll_timeout() < self.executor.poll_interval() {
            bail!("executor.poll_timeout_secs must not be shorter than poll_interval_ms");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

/// Load `path` when given, else `./vecsync.toml` when present, else defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config(path),
        None => {
            let fallback = Path::new(DEFAULT_CONFIG_FILE);
            if fallback.exists() {
                load_config(fallback)
            } else {
                tracing::debug!("no config file, using defaults");
                Ok(Config::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.source.pattern, "**/*.md");
        assert_eq!(config.executor.concurrency, 8);
        assert_eq!(config.remote.page_size, 100);
        assert!(!config.executor.fail_on_item_errors);
        assert!(config.namespace.key.is_none());
    }

    #[test]
    fn parses_all_sections() {
        let config: Config = toml::from_str(
            r#"
[source]
root = "docs"
pattern = "**/*.{md,txt}"
exclude_globs = ["drafts/**"]

[namespace]
key = "acme-handbook"
index_name = "Acme handbook"

[remote]
base_url = "http://localhost:8080/v1"
page_size = 20

[executor]
concurrency = 2
poll_interval_ms = 10
poll_timeout_secs = 1
fail_on_item_errors = true
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.source.root, PathBuf::from("docs"));
        assert_eq!(config.namespace.key.as_deref(), Some("acme-handbook"));
        assert_eq!(config.remote.page_size, 20);
        assert_eq!(config.executor.poll_interval(), Duration::from_millis(10));
        assert!(config.executor.fail_on_item_errors);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = Config::default();
        config.executor.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.namespace.key = Some("a/b".into());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.source.pattern = "[".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.executor.poll_interval_ms = 5_000;
        config.executor.poll_timeout_secs = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_section_is_an_error() {
        assert!(toml::from_str::<Config>("[db]\npath = \"x\"").is_err());
    }

    #[test]
    fn overrides_take_precedence() {
        let mut config = Config::default();
        config.apply_overrides(&Overrides {
            pattern: Some("**/*.txt".into()),
            namespace: Some("ns".into()),
            concurrency: Some(3),
            fail_on_item_errors: true,
            ..Default::default()
        });
        assert_eq!(config.source.pattern, "**/*.txt");
        assert_eq!(config.namespace.key.as_deref(), Some("ns"));
        assert_eq!(config.executor.concurrency, 3);
        assert!(config.executor.fail_on_item_errors);
    }
}
