use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Result, bail};
use tempfile::tempdir;
use wikibatch_core::config::{BatchConfig, FamilyConfig, IntakeSection};
use wikibatch_core::executor::{ExecuteOptions, execute_family};
use wikibatch_core::intake::{IntakeOutcome, RelocationReason, run_intake};
use wikibatch_core::namespace::{NS_CATEGORY, NS_MAIN, NS_TEMPLATE, NamespaceTable};
use wikibatch_core::pipeline::Pipeline;
use wikibatch_core::resolver::resolve_family;
use wikibatch_core::runtime::{InitOptions, PathOverrides, ResolutionContext, init_layout, resolve_paths};
use wikibatch_core::store::{NewRequest, PageRef, Status, Store};
use wikibatch_core::strategy::{RequestType, StrategyTable};
use wikibatch_core::wiki::{WikiReadApi, WikiWriteApi};

#[derive(Default)]
struct FakeWiki {
    pages: BTreeMap<String, String>,
    transclusions: BTreeMap<String, Vec<PageRef>>,
    editors: BTreeMap<String, String>,
    edit_counts: BTreeMap<String, u64>,
    groups: BTreeMap<String, BTreeSet<String>>,
    failing_saves: BTreeSet<String>,
    saved: Vec<String>,
    requests: usize,
}

impl WikiReadApi for FakeWiki {
    fn page_id(&mut self, title: &str) -> Result<Option<i64>> {
        self.requests += 1;
        Ok(self.pages.contains_key(title).then_some(1))
    }

    fn get_text(&mut self, title: &str) -> Result<Option<String>> {
        self.requests += 1;
        Ok(self.pages.get(title).cloned())
    }

    fn members_of(&mut self, _category: &str) -> Result<Vec<PageRef>> {
        self.requests += 1;
        Ok(Vec::new())
    }

    fn transclusions_of(&mut self, template: &str) -> Result<Vec<PageRef>> {
        self.requests += 1;
        Ok(self.transclusions.get(template).cloned().unwrap_or_default())
    }

    fn backlinks_of(&mut self, _title: &str, _namespaces: &[i32]) -> Result<Vec<PageRef>> {
        self.requests += 1;
        Ok(Vec::new())
    }

    fn file_usage(&mut self, _file: &str) -> Result<Vec<PageRef>> {
        self.requests += 1;
        Ok(Vec::new())
    }

    fn last_non_automated_editor(&mut self, title: &str) -> Result<Option<String>> {
        self.requests += 1;
        Ok(self.editors.get(title).cloned())
    }

    fn edit_count(&mut self, user: &str) -> Result<u64> {
        self.requests += 1;
        Ok(self.edit_counts.get(user).copied().unwrap_or(0))
    }

    fn groups_of(&mut self, user: &str) -> Result<BTreeSet<String>> {
        self.requests += 1;
        Ok(self.groups.get(user).cloned().unwrap_or_default())
    }

    fn request_count(&self) -> usize {
        self.requests
    }
}

impl WikiWriteApi for FakeWiki {
    fn login(&mut self, _username: &str, _password: &str) -> Result<()> {
        Ok(())
    }

    fn save(&mut self, title: &str, text: &str, _summary: &str) -> Result<()> {
        self.requests += 1;
        if self.failing_saves.contains(title) {
            bail!("HTTP 503 while saving {title}");
        }
        self.pages.insert(title.to_string(), text.to_string());
        self.saved.push(title.to_string());
        Ok(())
    }
}

const REQUEST_PAGE: &str = "Project:Template replacements";
const TALK_PAGE: &str = "Project talk:Template replacements";
const HEADER: &str = "{{Bot requests header}}\n";

fn template_family() -> FamilyConfig {
    FamilyConfig {
        request_type: RequestType::ReplaceTemplate,
        request_page: REQUEST_PAGE.to_string(),
        pattern: r"^\*\s*\{\{tl\|(?P<source>[^}]+)\}\}\s*->\s*\{\{tl\|(?P<destination>[^}]+)\}\}"
            .to_string(),
        min_edits: 3000,
        required_group: None,
        default_from_namespace: Some(NS_TEMPLATE),
        default_to_namespace: Some(NS_TEMPLATE),
        request_batch: 10,
        page_batch: 100,
        summary: "Bot: $from → $to".to_string(),
        embedding_template: None,
        backlink_namespaces: vec![NS_MAIN],
    }
}

fn open_store(dir: &Path) -> Store {
    Store::open(&dir.join("templates.db")).expect("open store")
}

#[test]
fn two_page_request_finishes_only_after_the_failed_page_is_retried() {
    let temp = tempdir().expect("tempdir");
    let mut store = open_store(temp.path());
    let family = template_family();
    let namespaces = NamespaceTable::default();
    let strategies = StrategyTable::standard();

    let ids = store
        .insert_requests(&[NewRequest {
            from_title: "X".to_string(),
            from_namespace: NS_TEMPLATE,
            to_title: Some("Y".to_string()),
            to_namespace: Some(NS_TEMPLATE),
            request_type: RequestType::ReplaceTemplate,
            extra: None,
        }])
        .expect("insert");
    let request_id = ids[0];

    let mut wiki = FakeWiki::default();
    for (title, text) in [
        ("Template:X", "x"),
        ("Template:Y", "y"),
        ("P1", "{{X}} first"),
        ("Category:P2", "{{X}} second"),
    ] {
        wiki.pages.insert(title.to_string(), text.to_string());
    }
    wiki.transclusions.insert(
        "Template:X".to_string(),
        vec![PageRef::new(NS_MAIN, "P1"), PageRef::new(NS_CATEGORY, "P2")],
    );
    wiki.failing_saves.insert("Category:P2".to_string());

    let resolved = resolve_family(
        &mut store,
        &mut wiki,
        None,
        "templates",
        &family,
        &namespaces,
        &strategies,
    )
    .expect("resolve");
    assert_eq!(resolved.pages_recorded, 2);
    let request = store.get_request(request_id).expect("get").expect("request");
    assert_eq!(request.status, Status::Received);
    assert!(
        store
            .pages_for_request(request_id)
            .expect("pages")
            .iter()
            .all(|page| page.status == Status::Pending)
    );

    let first = execute_family(
        &mut store,
        &mut wiki,
        "templates",
        &family,
        &namespaces,
        &strategies,
        &ExecuteOptions::default(),
    )
    .expect("first execute");
    assert_eq!(first.saved, 1);
    assert_eq!(first.failed, 1);
    assert!(!store.is_request_done(request_id).expect("done"));

    wiki.failing_saves.clear();
    wiki.saved.clear();
    let second = execute_family(
        &mut store,
        &mut wiki,
        "templates",
        &family,
        &namespaces,
        &strategies,
        &ExecuteOptions::default(),
    )
    .expect("second execute");
    assert_eq!(wiki.saved, vec!["Category:P2".to_string()]);
    assert_eq!(second.saved, 1);
    assert!(store.is_request_done(request_id).expect("done"));
    assert_eq!(wiki.pages["P1"], "{{Y}} first");
    assert_eq!(wiki.pages["Category:P2"], "{{Y}} second");

    let progress = store.progress(Some(RequestType::ReplaceTemplate)).expect("progress");
    assert_eq!(progress[0].total_pages, 2);
    assert_eq!(progress[0].completed_pages, 2);
    assert!(progress[0].done);
}

#[test]
fn unauthorized_submitter_is_relocated_without_creating_requests() {
    let temp = tempdir().expect("tempdir");
    let mut store = open_store(temp.path());
    let body = "* {{tl|Old}} -> {{tl|New}}\n* {{tl|Other}} -> {{tl|Else}}\n";

    let mut wiki = FakeWiki::default();
    wiki.pages
        .insert(REQUEST_PAGE.to_string(), format!("{HEADER}{body}"));
    wiki.editors
        .insert(REQUEST_PAGE.to_string(), "Newcomer".to_string());
    wiki.edit_counts.insert("Newcomer".to_string(), 2999);

    let report = run_intake(
        &mut store,
        &mut wiki,
        "templates",
        &template_family(),
        &IntakeSection::default(),
        &NamespaceTable::default(),
    )
    .expect("intake");

    assert_eq!(
        report.outcome,
        IntakeOutcome::Relocated {
            talk_page: TALK_PAGE.to_string(),
            reason: RelocationReason::InsufficientEdits {
                edits: 2999,
                required: 3000,
            },
        }
    );
    assert!(store.progress(None).expect("progress").is_empty());
    assert_eq!(wiki.pages[REQUEST_PAGE], HEADER);
    let talk = &wiki.pages[TALK_PAGE];
    assert!(talk.contains(body));
    assert!(talk.contains("Newcomer"));
}

#[test]
fn initialized_project_runs_a_family_end_to_end() {
    let temp = tempdir().expect("tempdir");
    let context = ResolutionContext {
        cwd: temp.path().to_path_buf(),
        executable_dir: None,
    };
    let overrides = PathOverrides {
        project_root: Some(temp.path().to_path_buf()),
        ..PathOverrides::default()
    };
    let paths = resolve_paths(&context, &overrides).expect("paths");
    init_layout(&paths, &InitOptions::default()).expect("init");

    let config = BatchConfig {
        families: BTreeMap::from([("templates".to_string(), template_family())]),
        ..BatchConfig::default()
    };
    let pipeline = Pipeline::new(paths, config);

    let mut wiki = FakeWiki::default();
    wiki.pages.insert(
        REQUEST_PAGE.to_string(),
        format!("{HEADER}* {{{{tl|Old}}}} -> {{{{tl|New}}}}\n"),
    );
    wiki.editors
        .insert(REQUEST_PAGE.to_string(), "Veteran".to_string());
    wiki.edit_counts.insert("Veteran".to_string(), 12_000);
    wiki.pages.insert("Template:Old".to_string(), "old".to_string());
    wiki.pages.insert("Template:New".to_string(), "new".to_string());
    wiki.pages
        .insert("Article".to_string(), "{{Old|x=1}}".to_string());
    wiki.transclusions.insert(
        "Template:Old".to_string(),
        vec![PageRef::new(NS_MAIN, "Article")],
    );

    let report = pipeline
        .run("templates", &mut wiki, &ExecuteOptions::default())
        .expect("run");
    assert!(matches!(report.intake.outcome, IntakeOutcome::Accepted { .. }));
    assert_eq!(report.resolve.resolved, 1);
    assert_eq!(report.execute.saved, 1);
    assert_eq!(wiki.pages["Article"], "{{New|x=1}}");
    assert_eq!(wiki.pages[REQUEST_PAGE], HEADER);

    let status = pipeline.status("templates").expect("status");
    assert_eq!(status.done_count(), 1);

    let again = pipeline
        .run("templates", &mut wiki, &ExecuteOptions::default())
        .expect("second run");
    assert_eq!(again.intake.outcome, IntakeOutcome::Idle);
    assert_eq!(again.resolve.pending, 0);
    assert_eq!(again.execute.requests, 0);
}
