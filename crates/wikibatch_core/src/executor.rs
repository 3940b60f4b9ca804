use anyhow::{Context, Result};
use serde::Serialize;
use similar::{ChangeTag, TextDiff};
use tracing::{debug, info, instrument, warn};

use crate::config::FamilyConfig;
use crate::mutate::{MutationInput, PageMutator, ensure_changed_text};
use crate::namespace::NamespaceTable;
use crate::store::{Page, Request, Store};
use crate::strategy::StrategyTable;
use crate::wiki::WikiWriteApi;

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageAction {
    Saved,
    Unchanged,
    Missing,
    WouldSave,
    Failed,
}

impl PageAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Saved => "saved",
            Self::Unchanged => "unchanged",
            Self::Missing => "missing",
            Self::WouldSave => "would_save",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PageResult {
    pub request_id: i64,
    pub page_id: i64,
    pub title: String,
    pub action: PageAction,
    pub inserted_lines: usize,
    pub deleted_lines: usize,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecuteReport {
    pub dry_run: bool,
    pub requests: usize,
    pub saved: usize,
    pub unchanged: usize,
    pub missing: usize,
    pub would_save: usize,
    pub failed: usize,
    pub finished_requests: Vec<i64>,
    pub pages: Vec<PageResult>,
    pub errors: Vec<String>,
    pub request_count: usize,
}

struct PageChange {
    action: PageAction,
    inserted_lines: usize,
    deleted_lines: usize,
}

impl PageChange {
    fn without_diff(action: PageAction) -> Self {
        Self {
            action,
            inserted_lines: 0,
            deleted_lines: 0,
        }
    }
}

/// Apply one family's mutation to a bounded batch of PENDING pages.
///
/// A page is marked COMPLETED only after load, mutate and save all succeed.
/// Any failure leaves it PENDING for the next run and moves on to the next page.
#[instrument(skip_all, fields(family = %family_name))]
pub fn execute_family<W: WikiWriteApi + ?Sized>(
    store: &mut Store,
    wiki: &mut W,
    family_name: &str,
    family: &FamilyConfig,
    namespaces: &NamespaceTable,
    strategies: &StrategyTable,
    options: &ExecuteOptions,
) -> Result<ExecuteReport> {
    let mutator = strategies.get(family.request_type)?.mutator.as_ref();
    let requests = store.active_requests(family.request_type, family.request_batch)?;
    let mut report = ExecuteReport {
        dry_run: options.dry_run,
        requests: requests.len(),
        ..ExecuteReport::default()
    };

    for request in &requests {
        let summary = render_summary(family, request, namespaces);
        let pages = match store.pending_pages(request.id, family.page_batch) {
            Ok(pages) => pages,
            Err(error) => {
                warn!(request = request.id, "failed to load pending pages: {error:?}");
                report.errors.push(format!("request {}: {error:#}", request.id));
                continue;
            }
        };
        for page in pages {
            let title = namespaces.full_title(page.namespace, &page.title);
            let outcome = process_page(
                wiki, mutator, request, &page, &title, family, namespaces, &summary, options,
            )
            .and_then(|change| {
                if !options.dry_run {
                    store.complete_page(page.id)?;
                }
                Ok(change)
            });

            let (change, detail) = match outcome {
                Ok(change) => (change, None),
                Err(error) => {
                    warn!(request = request.id, page = %title, "page failed, leaving it pending: {error:?}");
                    report.errors.push(format!("{title}: {error:#}"));
                    (PageChange::without_diff(PageAction::Failed), Some(format!("{error:#}")))
                }
            };
            match change.action {
                PageAction::Saved => report.saved += 1,
                PageAction::Unchanged => report.unchanged += 1,
                PageAction::Missing => report.missing += 1,
                PageAction::WouldSave => report.would_save += 1,
                PageAction::Failed => report.failed += 1,
            }
            report.pages.push(PageResult {
                request_id: request.id,
                page_id: page.id,
                title,
                action: change.action,
                inserted_lines: change.inserted_lines,
                deleted_lines: change.deleted_lines,
                detail,
            });
        }

        if options.dry_run {
            continue;
        }
        let finished = store.is_request_done(request.id).and_then(|done| {
            if done {
                store.stamp_completed_at(request.id)?;
            }
            Ok(done)
        });
        match finished {
            Ok(true) => {
                info!(request = request.id, "request finished");
                report.finished_requests.push(request.id);
            }
            Ok(false) => {}
            Err(error) => {
                warn!(request = request.id, "failed to finish request: {error:?}");
                report.errors.push(format!("request {}: {error:#}", request.id));
            }
        }
    }

    report.request_count = wiki.request_count();
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn process_page<W: WikiWriteApi + ?Sized>(
    wiki: &mut W,
    mutator: &dyn PageMutator,
    request: &Request,
    page: &Page,
    title: &str,
    family: &FamilyConfig,
    namespaces: &NamespaceTable,
    summary: &str,
    options: &ExecuteOptions,
) -> Result<PageChange> {
    let Some(text) = wiki
        .get_text(title)
        .with_context(|| format!("failed to load {title}"))?
    else {
        debug!(page = %title, "page no longer exists");
        return Ok(PageChange::without_diff(PageAction::Missing));
    };

    let updated = mutator
        .mutate(&MutationInput {
            text: &text,
            request,
            namespaces,
            embedding_template: family.embedding_template.as_deref(),
        })
        .with_context(|| format!("failed to apply {} to {title}", request.request_type))?;
    if !ensure_changed_text(&text, &updated)? {
        debug!(page = %title, page_id = page.id, "nothing to change");
        return Ok(PageChange::without_diff(PageAction::Unchanged));
    }

    let (inserted_lines, deleted_lines) = line_stats(&text, &updated);
    if options.dry_run {
        return Ok(PageChange {
            action: PageAction::WouldSave,
            inserted_lines,
            deleted_lines,
        });
    }

    wiki.save(title, &updated, summary)
        .with_context(|| format!("failed to save {title}"))?;
    info!(page = %title, inserted_lines, deleted_lines, "saved page");
    Ok(PageChange {
        action: PageAction::Saved,
        inserted_lines,
        deleted_lines,
    })
}

/// Fill `$from`, `$to`, `$page` and `$version` in the family's summary template.
/// `$from` and `$to` expand to full titles, namespace prefix included.
pub fn render_summary(family: &FamilyConfig, request: &Request, namespaces: &NamespaceTable) -> String {
    let from = namespaces.full_title(request.from_namespace, &request.from_title);
    let to = match request.to_title.as_deref() {
        Some(title) => namespaces.full_title(
            request.to_namespace.unwrap_or(request.from_namespace),
            title,
        ),
        None => String::new(),
    };
    family
        .summary
        .replace("$from", &from)
        .replace("$to", &to)
        .replace("$page", &family.request_page)
        .replace("$version", env!("CARGO_PKG_VERSION"))
}

fn line_stats(old: &str, new: &str) -> (usize, usize) {
    let diff = TextDiff::from_lines(old, new);
    let mut inserted = 0;
    let mut deleted = 0;
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => inserted += 1,
            ChangeTag::Delete => deleted += 1,
            ChangeTag::Equal => {}
        }
    }
    (inserted, deleted)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::namespace::{NS_CATEGORY, NS_MAIN, NS_TEMPLATE};
    use crate::store::{NewRequest, PageRef, Status};
    use crate::strategy::RequestType;
    use crate::wiki::mock::MockWiki;

    fn family() -> FamilyConfig {
        FamilyConfig {
            request_type: RequestType::ReplaceTemplate,
            request_page: "Project:Template requests".to_string(),
            pattern: r"(?P<source>.+)".to_string(),
            min_edits: 3000,
            required_group: None,
            default_from_namespace: Some(NS_TEMPLATE),
            default_to_namespace: Some(NS_TEMPLATE),
            request_batch: 10,
            page_batch: 100,
            summary: "Bot: $from → $to ([[$page]], v$version)".to_string(),
            embedding_template: None,
            backlink_namespaces: vec![NS_MAIN],
        }
    }

    fn resolved_store(pages: &[PageRef]) -> (tempfile::TempDir, Store, i64) {
        let temp = tempdir().expect("tempdir");
        let mut store = Store::open(&temp.path().join("family.db")).expect("open store");
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
        store.record_fan_out(ids[0], pages).expect("fan out");
        (temp, store, ids[0])
    }

    fn execute(store: &mut Store, wiki: &mut MockWiki, dry_run: bool) -> ExecuteReport {
        execute_family(
            store,
            wiki,
            "templates",
            &family(),
            &NamespaceTable::default(),
            &StrategyTable::standard(),
            &ExecuteOptions { dry_run },
        )
        .expect("execute")
    }

    fn status_of(store: &Store, request_id: i64, title: &str) -> Status {
        store
            .pages_for_request(request_id)
            .expect("pages")
            .into_iter()
            .find(|page| page.title == title)
            .expect("page")
            .status
    }

    #[test]
    fn failed_save_leaves_page_pending_until_next_run() {
        let (_temp, mut store, request_id) = resolved_store(&[
            PageRef::new(NS_MAIN, "P1"),
            PageRef::new(NS_CATEGORY, "P2"),
        ]);
        let mut wiki = MockWiki::default()
            .with_page("P1", "{{X}} text")
            .with_page("Category:P2", "{{X|a=1}}");
        wiki.fail_saves.insert("Category:P2".to_string());

        let first = execute(&mut store, &mut wiki, false);
        assert_eq!(first.saved, 1);
        assert_eq!(first.failed, 1);
        assert_eq!(first.errors.len(), 1);
        assert_eq!(status_of(&store, request_id, "P1"), Status::Completed);
        assert_eq!(status_of(&store, request_id, "P2"), Status::Pending);
        assert!(!store.is_request_done(request_id).expect("done"));
        assert_eq!(wiki.pages["P1"], "{{Y}} text");

        wiki.fail_saves.clear();
        wiki.saves.clear();
        let second = execute(&mut store, &mut wiki, false);
        assert_eq!(second.saved, 1);
        assert_eq!(wiki.saves.len(), 1);
        assert_eq!(wiki.saves[0].0, "Category:P2");
        assert!(store.is_request_done(request_id).expect("done"));
        assert_eq!(second.finished_requests, vec![request_id]);
    }

    #[test]
    fn missing_and_unchanged_pages_complete_without_saving() {
        let (_temp, mut store, request_id) = resolved_store(&[
            PageRef::new(NS_MAIN, "Gone"),
            PageRef::new(NS_MAIN, "Clean"),
        ]);
        let mut wiki = MockWiki::default().with_page("Clean", "no templates here");

        let report = execute(&mut store, &mut wiki, false);
        assert_eq!(report.missing, 1);
        assert_eq!(report.unchanged, 1);
        assert!(wiki.saves.is_empty());
        assert!(store.is_request_done(request_id).expect("done"));
        let request = store.get_request(request_id).expect("get").expect("request");
        assert!(request.completed_at.is_some());
    }

    #[test]
    fn dry_run_reports_changes_without_side_effects() {
        let (_temp, mut store, request_id) =
            resolved_store(&[PageRef::new(NS_MAIN, "P1")]);
        let mut wiki = MockWiki::default().with_page("P1", "{{X}}\nbody\n");

        let report = execute(&mut store, &mut wiki, true);
        assert!(report.dry_run);
        assert_eq!(report.would_save, 1);
        assert_eq!(report.pages[0].inserted_lines, 1);
        assert_eq!(report.pages[0].deleted_lines, 1);
        assert!(wiki.saves.is_empty());
        assert_eq!(status_of(&store, request_id, "P1"), Status::Pending);
    }

    #[test]
    fn load_failure_is_isolated_to_its_page() {
        let (_temp, mut store, request_id) = resolved_store(&[
            PageRef::new(NS_MAIN, "Broken"),
            PageRef::new(NS_MAIN, "Fine"),
        ]);
        let mut wiki = MockWiki::default()
            .with_page("Broken", "{{X}}")
            .with_page("Fine", "{{X}}");
        wiki.fail_reads.insert("Broken".to_string());

        let report = execute(&mut store, &mut wiki, false);
        assert_eq!(report.failed, 1);
        assert_eq!(report.saved, 1);
        assert_eq!(status_of(&store, request_id, "Broken"), Status::Pending);
        assert_eq!(status_of(&store, request_id, "Fine"), Status::Completed);
    }

    #[test]
    fn page_batch_bounds_each_run() {
        let (_temp, mut store, _request_id) = resolved_store(&[
            PageRef::new(NS_MAIN, "A"),
            PageRef::new(NS_MAIN, "B"),
            PageRef::new(NS_MAIN, "C"),
        ]);
        let mut wiki = MockWiki::default()
            .with_page("A", "{{X}}")
            .with_page("B", "{{X}}")
            .with_page("C", "{{X}}");
        let mut config = family();
        config.page_batch = 2;

        let report = execute_family(
            &mut store,
            &mut wiki,
            "templates",
            &config,
            &NamespaceTable::default(),
            &StrategyTable::standard(),
            &ExecuteOptions::default(),
        )
        .expect("execute");
        assert_eq!(report.saved, 2);
        assert!(report.finished_requests.is_empty());
    }

    #[test]
    fn store_failure_on_one_request_does_not_stop_the_others() {
        let temp = tempdir().expect("tempdir");
        let mut store = Store::open(&temp.path().join("family.db")).expect("open store");
        let new = |from: &str| NewRequest {
            from_title: from.to_string(),
            from_namespace: NS_TEMPLATE,
            to_title: Some("Y".to_string()),
            to_namespace: Some(NS_TEMPLATE),
            request_type: RequestType::ReplaceTemplate,
            extra: None,
        };
        let ids = store.insert_requests(&[new("X"), new("X")]).expect("insert");
        store
            .record_fan_out(ids[0], &[PageRef::new(NS_MAIN, "P1")])
            .expect("fan out");
        store
            .record_fan_out(ids[1], &[PageRef::new(NS_MAIN, "P2")])
            .expect("fan out");
        store
            .execute_batch(&format!(
                "CREATE TRIGGER reject_stamp BEFORE UPDATE OF completed_at ON requests
                 WHEN NEW.id = {}
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
                ids[0]
            ))
            .expect("trigger");
        let mut wiki = MockWiki::default()
            .with_page("P1", "{{X}}")
            .with_page("P2", "{{X}}");

        let report = execute(&mut store, &mut wiki, false);
        assert_eq!(report.saved, 2);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with(&format!("request {}:", ids[0])));
        assert_eq!(report.finished_requests, vec![ids[1]]);
        assert_eq!(status_of(&store, ids[0], "P1"), Status::Completed);
    }

    #[test]
    fn embedded_family_summaries_carry_one_namespace_prefix() {
        let config: crate::config::BatchConfig =
            toml::from_str(crate::runtime::embedded_config_template()).expect("parse template");
        let namespaces = config.namespaces();
        for (name, family) in &config.families {
            let from_namespace = family.default_from_namespace.unwrap_or(NS_MAIN);
            let to_namespace = family.default_to_namespace.unwrap_or(from_namespace);
            let request = Request {
                id: 1,
                from_title: "Sample".to_string(),
                from_namespace,
                to_title: Some("Other".to_string()),
                to_namespace: Some(to_namespace),
                request_type: family.request_type,
                extra: None,
                status: Status::Received,
                create_date: 0,
                update_date: 0,
                completed_at: None,
            };
            let summary = render_summary(family, &request, &namespaces);

            for full in [
                namespaces.full_title(from_namespace, "Sample"),
                namespaces.full_title(to_namespace, "Other"),
            ] {
                assert!(summary.contains(&full), "{name}: {summary}");
                let prefix = full.split_once(':').map(|(prefix, _)| prefix);
                if let Some(prefix) = prefix {
                    assert!(
                        !summary.contains(&format!("{prefix}:{prefix}:")),
                        "{name}: {summary}"
                    );
                }
            }
        }
    }

    #[test]
    fn summary_names_both_identities() {
        let (_temp, store, request_id) = resolved_store(&[]);
        let request = store.get_request(request_id).expect("get").expect("request");
        let summary = render_summary(&family(), &request, &NamespaceTable::default());
        assert!(summary.starts_with("Bot: Template:X → Template:Y ([[Project:Template requests]], v"));
        assert!(summary.ends_with(&format!("v{})", env!("CARGO_PKG_VERSION"))));
    }
}
