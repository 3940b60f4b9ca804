use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::namespace::{NS_MAIN, NamespaceTable};
use crate::strategy::RequestType;

pub const DEFAULT_USER_AGENT: &str = "wikibatch/0.1";
pub const DEFAULT_MIN_EDITS: u64 = 3000;
pub const DEFAULT_REQUEST_BATCH: usize = 10;
pub const DEFAULT_PAGE_BATCH: usize = 100;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BatchConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub replica: ReplicaSection,
    #[serde(default)]
    pub intake: IntakeSection,
    #[serde(default)]
    pub families: BTreeMap<String, FamilyConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
    pub bot_user: Option<String>,
    #[serde(default)]
    pub custom_namespaces: Vec<CustomNamespace>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CustomNamespace {
    pub name: String,
    pub id: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ReplicaSection {
    pub path: Option<PathBuf>,
}

/// Text shared by every family's request page.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct IntakeSection {
    pub header: String,
    pub relocation_heading: String,
    pub attribution: String,
    pub consumed_summary: String,
    pub relocation_summary: String,
}

impl Default for IntakeSection {
    fn default() -> Self {
        Self {
            header: "{{Bot requests header}}\n".to_string(),
            relocation_heading: "== Unprocessed request from $user ==".to_string(),
            attribution: "Moved from [[$page]]; submitted by [[User:$user|$user]]. ~~~~".to_string(),
            consumed_summary: "Requests received".to_string(),
            relocation_summary: "Moving unprocessable request to the talk page".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FamilyConfig {
    pub request_type: RequestType,
    pub request_page: String,
    pub pattern: String,
    #[serde(default = "default_min_edits")]
    pub min_edits: u64,
    pub required_group: Option<String>,
    pub default_from_namespace: Option<i32>,
    pub default_to_namespace: Option<i32>,
    #[serde(default = "default_request_batch")]
    pub request_batch: usize,
    #[serde(default = "default_page_batch")]
    pub page_batch: usize,
    #[serde(default = "default_summary")]
    pub summary: String,
    pub embedding_template: Option<String>,
    #[serde(default = "default_backlink_namespaces")]
    pub backlink_namespaces: Vec<i32>,
}

fn default_min_edits() -> u64 {
    DEFAULT_MIN_EDITS
}

fn default_request_batch() -> usize {
    DEFAULT_REQUEST_BATCH
}

fn default_page_batch() -> usize {
    DEFAULT_PAGE_BATCH
}

fn default_summary() -> String {
    "Bot: $from → $to (requested at [[$page]], v$version)".to_string()
}

fn default_backlink_namespaces() -> Vec<i32> {
    vec![NS_MAIN]
}

impl FamilyConfig {
    pub fn compiled_pattern(&self) -> Result<Regex> {
        Regex::new(&self.pattern).with_context(|| format!("invalid pattern {}", self.pattern))
    }

    fn validate(&self, name: &str, namespaces: &NamespaceTable) -> Result<()> {
        if self.request_page.trim().is_empty() {
            bail!("family {name}: request_page cannot be empty");
        }
        // Unprocessable requests are relocated to the talk page.
        let (page_namespace, _) = namespaces.split_title(&self.request_page);
        if page_namespace % 2 != 0 {
            bail!(
                "family {name}: request_page {} has no talk page to relocate requests to",
                self.request_page
            );
        }
        if self.pattern.trim().is_empty() {
            bail!("family {name}: pattern cannot be empty");
        }
        let pattern = self
            .compiled_pattern()
            .with_context(|| format!("family {name}: pattern does not compile"))?;
        if !pattern.capture_names().flatten().any(|group| group == "source") {
            bail!("family {name}: pattern must define a `source` named group");
        }
        if self.request_batch == 0 || self.page_batch == 0 {
            bail!("family {name}: request_batch and page_batch must be positive");
        }
        Ok(())
    }
}

impl BatchConfig {
    /// Resolve the wiki API URL: env WIKI_API_URL > config > None.
    pub fn api_url_owned(&self) -> Option<String> {
        env_override("WIKI_API_URL").or_else(|| self.wiki.api_url.clone())
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("WIKI_USER_AGENT")
            .or_else(|| self.wiki.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Account the pipeline edits as: env WIKI_BOT_USER > config.
    pub fn bot_user(&self) -> Option<String> {
        env_override("WIKI_BOT_USER").or_else(|| self.wiki.bot_user.clone())
    }

    pub fn namespaces(&self) -> NamespaceTable {
        NamespaceTable::new(&self.wiki.custom_namespaces)
    }

    pub fn family(&self, name: &str) -> Result<&FamilyConfig> {
        self.families.get(name).ok_or_else(|| {
            let known = self.families.keys().cloned().collect::<Vec<_>>().join(", ");
            anyhow!("unknown family `{name}` (configured: {known})")
        })
    }

    /// Replica path resolved against the project root.
    pub fn replica_path(&self, project_root: &Path) -> Option<PathBuf> {
        self.replica.path.as_ref().map(|path| {
            if path.is_absolute() {
                path.clone()
            } else {
                project_root.join(path)
            }
        })
    }

    pub fn validate(&self) -> Result<()> {
        let namespaces = self.namespaces();
        for (name, family) in &self.families {
            family.validate(name, &namespaces)?;
        }
        Ok(())
    }
}

fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Load, parse and validate the config. Returns default if the file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<BatchConfig> {
    if !config_path.exists() {
        return Ok(BatchConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: BatchConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    parsed
        .validate()
        .with_context(|| format!("invalid config {}", config_path.display()))?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
[wiki]
api_url = "https://example.wiki/api.php"
user_agent = "test-agent/1.0"
bot_user = "BatchBot"

[[wiki.custom_namespaces]]
name = "Lore"
id = 3000

[replica]
path = "replica.db"

[intake]
header = "{{Header}}\n"

[families.templates]
request_type = "replace_template"
request_page = "Project:Template requests"
pattern = '^\*\s*\[\[:Template:(?P<source>[^\]]+)\]\]\s*->\s*\[\[:Template:(?P<destination>[^\]]+)\]\]'
default_from_namespace = 10
default_to_namespace = 10
page_batch = 250
"#;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, content).expect("write config");
        (temp, config_path)
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert!(config.wiki.api_url.is_none());
        assert!(config.families.is_empty());
    }

    #[test]
    fn load_config_parses_all_sections() {
        let (temp, config_path) = write_config(SAMPLE);
        let config = load_config(&config_path).expect("load config");

        assert_eq!(
            config.wiki.api_url.as_deref(),
            Some("https://example.wiki/api.php")
        );
        assert_eq!(config.wiki.bot_user.as_deref(), Some("BatchBot"));
        assert_eq!(config.intake.header, "{{Header}}\n");
        assert_eq!(
            config.intake.consumed_summary,
            IntakeSection::default().consumed_summary
        );
        assert_eq!(
            config.replica_path(temp.path()),
            Some(temp.path().join("replica.db"))
        );

        let family = config.family("templates").expect("family");
        assert_eq!(family.request_type, RequestType::ReplaceTemplate);
        assert_eq!(family.min_edits, DEFAULT_MIN_EDITS);
        assert_eq!(family.request_batch, DEFAULT_REQUEST_BATCH);
        assert_eq!(family.page_batch, 250);
        assert_eq!(family.backlink_namespaces, vec![NS_MAIN]);
        assert_eq!(config.namespaces().id_for_label("Lore"), Some(3000));
    }

    #[test]
    fn unknown_family_lists_configured_names() {
        let (_temp, config_path) = write_config(SAMPLE);
        let config = load_config(&config_path).expect("load config");
        let err = config.family("nope").expect_err("must fail");
        assert!(err.to_string().contains("templates"));
    }

    #[test]
    fn unknown_request_type_is_rejected() {
        let (_temp, config_path) = write_config(
            r#"
[families.bad]
request_type = "rewrite_everything"
request_page = "Project:Requests"
pattern = '(?P<source>.+)'
"#,
        );
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn pattern_without_source_group_is_rejected() {
        let (_temp, config_path) = write_config(
            r#"
[families.bad]
request_type = "move_category"
request_page = "Project:Requests"
pattern = '(?P<destination>.+)'
"#,
        );
        let error = load_config(&config_path).expect_err("must fail");
        assert!(format!("{error:#}").contains("`source` named group"));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let (_temp, config_path) = write_config(
            r#"
[families.bad]
request_type = "move_category"
request_page = "Project:Requests"
pattern = '(?P<source>.+)'
page_batch = 0
"#,
        );
        let error = load_config(&config_path).expect_err("must fail");
        assert!(format!("{error:#}").contains("must be positive"));
    }

    #[test]
    fn talk_page_request_page_is_rejected() {
        let (_temp, config_path) = write_config(
            r#"
[families.bad]
request_type = "move_category"
request_page = "Project talk:Requests"
pattern = '(?P<source>.+)'
"#,
        );
        let error = load_config(&config_path).expect_err("must fail");
        assert!(format!("{error:#}").contains("no talk page"));
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let (_temp, config_path) = write_config("[wiki\napi_url = \"oops\"");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn default_user_agent() {
        let config = BatchConfig::default();
        if env::var("WIKI_USER_AGENT").is_err() {
            assert_eq!(config.user_agent(), DEFAULT_USER_AGENT);
        }
    }

    #[test]
    fn embedded_template_parses_and_validates() {
        let config: BatchConfig =
            toml::from_str(crate::runtime::embedded_config_template()).expect("parse template");
        config.validate().expect("validate template");
        assert!(!config.families.is_empty());
    }
}
