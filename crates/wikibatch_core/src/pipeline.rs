//! Family-level wiring of the three stages.
//!
//! Each stage opens the family's store fresh, does one bounded batch and returns a
//! report. Stages never share state except through row status in the store.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::config::{BatchConfig, FamilyConfig};
use crate::executor::{ExecuteOptions, ExecuteReport, execute_family};
use crate::intake::{IntakeReport, run_intake};
use crate::namespace::NamespaceTable;
use crate::replica::{FanOutSource, SqliteReplica};
use crate::resolver::{ResolveReport, resolve_family};
use crate::runtime::{ResolvedPaths, normalize_for_display};
use crate::store::{RequestProgress, Store};
use crate::strategy::{RequestType, StrategyTable};
use crate::wiki::{WikiReadApi, WikiWriteApi};

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub family: String,
    pub intake: IntakeReport,
    pub resolve: ResolveReport,
    pub execute: ExecuteReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub family: String,
    pub request_type: RequestType,
    pub store_path: String,
    pub store_exists: bool,
    pub requests: Vec<RequestProgress>,
}

impl StatusReport {
    pub fn done_count(&self) -> usize {
        self.requests.iter().filter(|item| item.done).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FamilySummary {
    pub name: String,
    pub request_type: RequestType,
    pub request_page: String,
    pub store_path: String,
    pub store_exists: bool,
}

/// Configured pipeline: paths, config, namespace table and strategy table, built once per process.
pub struct Pipeline {
    paths: ResolvedPaths,
    config: BatchConfig,
    namespaces: NamespaceTable,
    strategies: StrategyTable,
}

impl Pipeline {
    pub fn new(paths: ResolvedPaths, config: BatchConfig) -> Self {
        let namespaces = config.namespaces();
        Self {
            paths,
            config,
            namespaces,
            strategies: StrategyTable::standard(),
        }
    }

    pub fn paths(&self) -> &ResolvedPaths {
        &self.paths
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn namespaces(&self) -> &NamespaceTable {
        &self.namespaces
    }

    pub fn family(&self, name: &str) -> Result<&FamilyConfig> {
        self.config.family(name)
    }

    pub fn open_store(&self, family: &str) -> Result<Store> {
        self.config.family(family)?;
        let path = self.paths.family_db_path(family);
        Store::open(&path).with_context(|| format!("failed to open store for family {family}"))
    }

    fn open_replica(&self) -> Result<Option<SqliteReplica>> {
        match self.config.replica_path(&self.paths.project_root) {
            Some(path) => Ok(Some(SqliteReplica::open(&path)?)),
            None => Ok(None),
        }
    }

    pub fn intake<W: WikiWriteApi + ?Sized>(&self, family: &str, wiki: &mut W) -> Result<IntakeReport> {
        let config = self.config.family(family)?;
        let mut store = self.open_store(family)?;
        run_intake(
            &mut store,
            wiki,
            family,
            config,
            &self.config.intake,
            &self.namespaces,
        )
    }

    pub fn resolve<W: WikiReadApi + ?Sized>(&self, family: &str, wiki: &mut W) -> Result<ResolveReport> {
        let config = self.config.family(family)?;
        let mut store = self.open_store(family)?;
        let mut replica = self.open_replica()?;
        if replica.is_none() {
            info!(family, "no replica configured, fanning out through the wiki API");
        }
        resolve_family(
            &mut store,
            wiki,
            replica.as_mut().map(|replica| replica as &mut dyn FanOutSource),
            family,
            config,
            &self.namespaces,
            &self.strategies,
        )
    }

    pub fn execute<W: WikiWriteApi + ?Sized>(
        &self,
        family: &str,
        wiki: &mut W,
        options: &ExecuteOptions,
    ) -> Result<ExecuteReport> {
        let config = self.config.family(family)?;
        let mut store = self.open_store(family)?;
        execute_family(
            &mut store,
            wiki,
            family,
            config,
            &self.namespaces,
            &self.strategies,
            options,
        )
    }

    /// Intake, resolve and execute one family in sequence.
    pub fn run<W: WikiWriteApi + ?Sized>(
        &self,
        family: &str,
        wiki: &mut W,
        options: &ExecuteOptions,
    ) -> Result<RunReport> {
        let intake = self.intake(family, wiki)?;
        let resolve = self.resolve(family, wiki)?;
        let execute = self.execute(family, wiki, options)?;
        Ok(RunReport {
            family: family.to_string(),
            intake,
            resolve,
            execute,
        })
    }

    /// Per-request progress with the fan-in check recomputed from page rows.
    pub fn status(&self, family: &str) -> Result<StatusReport> {
        let config = self.config.family(family)?;
        let path = self.paths.family_db_path(family);
        let store_exists = path.exists();
        let requests = if store_exists {
            self.open_store(family)?.progress(Some(config.request_type))?
        } else {
            Vec::new()
        };
        Ok(StatusReport {
            family: family.to_string(),
            request_type: config.request_type,
            store_path: normalize_for_display(&path),
            store_exists,
            requests,
        })
    }

    pub fn families(&self) -> Vec<FamilySummary> {
        self.config
            .families
            .iter()
            .map(|(name, family)| {
                let path = self.paths.family_db_path(name);
                FamilySummary {
                    name: name.clone(),
                    request_type: family.request_type,
                    request_page: family.request_page.clone(),
                    store_exists: path.exists(),
                    store_path: normalize_for_display(&path),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::tempdir;

    use super::*;
    use crate::config::IntakeSection;
    use crate::intake::IntakeOutcome;
    use crate::namespace::{NS_MAIN, NS_TEMPLATE};
    use crate::runtime::ValueSource;
    use crate::store::PageRef;
    use crate::wiki::mock::MockWiki;

    fn paths(root: &std::path::Path) -> ResolvedPaths {
        let state_dir = root.join(".wikibatch");
        ResolvedPaths {
            project_root: root.to_path_buf(),
            data_dir: state_dir.join("data"),
            config_path: state_dir.join("config.toml"),
            state_dir,
            root_source: ValueSource::Flag,
            data_source: ValueSource::Default,
            config_source: ValueSource::Default,
        }
    }

    fn config() -> BatchConfig {
        let family = FamilyConfig {
            request_type: RequestType::ReplaceTemplate,
            request_page: "Project:Template requests".to_string(),
            pattern: r"^\*\s*\{\{tl\|(?P<source>[^}]+)\}\}\s*->\s*\{\{tl\|(?P<destination>[^}]+)\}\}"
                .to_string(),
            min_edits: 100,
            required_group: None,
            default_from_namespace: Some(NS_TEMPLATE),
            default_to_namespace: Some(NS_TEMPLATE),
            request_batch: 10,
            page_batch: 100,
            summary: "Bot: $from → $to".to_string(),
            embedding_template: None,
            backlink_namespaces: vec![NS_MAIN],
        };
        BatchConfig {
            intake: IntakeSection {
                header: "{{Header}}\n".to_string(),
                ..IntakeSection::default()
            },
            families: BTreeMap::from([("templates".to_string(), family)]),
            ..BatchConfig::default()
        }
    }

    #[test]
    fn run_drives_a_submission_through_every_stage() {
        let temp = tempdir().expect("tempdir");
        let pipeline = Pipeline::new(paths(temp.path()), config());
        let mut wiki = MockWiki::default()
            .with_page(
                "Project:Template requests",
                "{{Header}}\n* {{tl|Old}} -> {{tl|New}}\n",
            )
            .with_editor("Project:Template requests", "Veteran", 500)
            .with_page("Template:Old", "old")
            .with_page("Template:New", "new")
            .with_page("Alpha", "{{Old}} alpha");
        wiki.transclusions.insert(
            "Template:Old".to_string(),
            vec![PageRef::new(NS_MAIN, "Alpha")],
        );

        let report = pipeline
            .run("templates", &mut wiki, &ExecuteOptions::default())
            .expect("run");
        assert!(matches!(report.intake.outcome, IntakeOutcome::Accepted { .. }));
        assert_eq!(report.resolve.pages_recorded, 1);
        assert_eq!(report.execute.saved, 1);
        assert_eq!(wiki.pages["Alpha"], "{{New}} alpha");

        let status = pipeline.status("templates").expect("status");
        assert!(status.store_exists);
        assert_eq!(status.requests.len(), 1);
        assert_eq!(status.done_count(), 1);
    }

    #[test]
    fn status_without_store_is_empty() {
        let temp = tempdir().expect("tempdir");
        let pipeline = Pipeline::new(paths(temp.path()), config());
        let status = pipeline.status("templates").expect("status");
        assert!(!status.store_exists);
        assert!(status.requests.is_empty());
        assert!(!temp.path().join(".wikibatch/data/templates.db").exists());
    }

    #[test]
    fn unknown_family_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let pipeline = Pipeline::new(paths(temp.path()), config());
        let error = pipeline.open_store("nope").expect_err("must fail");
        assert!(error.to_string().contains("templates"));
    }

    #[test]
    fn configured_replica_must_exist() {
        let temp = tempdir().expect("tempdir");
        let mut config = config();
        config.replica.path = Some("replica.db".into());
        let pipeline = Pipeline::new(paths(temp.path()), config);
        assert!(pipeline.resolve("templates", &mut MockWiki::default()).is_err());

        let families = pipeline.families();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].request_type, RequestType::ReplaceTemplate);
    }
}
