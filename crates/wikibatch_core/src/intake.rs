use std::fmt;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::{FamilyConfig, IntakeSection};
use crate::namespace::{NS_MAIN, NamespaceTable};
use crate::scanner::{RequestScanner, ScanResult};
use crate::store::{NewRequest, Store};
use crate::wiki::WikiWriteApi;
use crate::wikitext::{is_blank, strip_header_once};

/// The request page of one family, loaded once per intake run.
pub struct RequestsPage<'a, W: WikiWriteApi + ?Sized> {
    wiki: &'a mut W,
    title: String,
    header: String,
    text: String,
    editor: Option<String>,
}

impl<'a, W: WikiWriteApi + ?Sized> RequestsPage<'a, W> {
    pub fn load(wiki: &'a mut W, title: &str, header: &str) -> Result<Self> {
        let text = wiki
            .get_text(title)
            .with_context(|| format!("failed to load request page {title}"))?
            .unwrap_or_default();
        let editor = wiki
            .last_non_automated_editor(title)
            .with_context(|| format!("failed to read history of {title}"))?;
        Ok(Self {
            wiki,
            title: title.to_string(),
            header: header.to_string(),
            text,
            editor,
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn editor(&self) -> Option<&str> {
        self.editor.as_deref()
    }

    /// True when the last non-automated editor has at least `minimum` edits.
    pub fn check_user_edits(&mut self, minimum: u64) -> Result<bool> {
        Ok(self.editor_edit_count()?.is_some_and(|count| count >= minimum))
    }

    /// Edit count of the last non-automated editor, one wiki query per call.
    pub fn editor_edit_count(&mut self) -> Result<Option<u64>> {
        match self.editor.as_deref() {
            Some(user) => Ok(Some(self.wiki.edit_count(user)?)),
            None => Ok(None),
        }
    }

    pub fn check_user_groups(&mut self, group: &str) -> Result<bool> {
        match self.editor.as_deref() {
            Some(user) => Ok(self.wiki.groups_of(user)?.contains(group)),
            None => Ok(false),
        }
    }

    /// Page text with the shared header removed once.
    pub fn get_page_text(&self) -> String {
        strip_header_once(&self.text, &self.header)
    }

    /// Reset the page to the bare header so the same lines are never scanned twice.
    pub fn start_request(&mut self, summary: &str) -> Result<()> {
        self.wiki
            .save(&self.title, &self.header, summary)
            .with_context(|| format!("failed to clear request page {}", self.title))?;
        self.text = self.header.clone();
        Ok(())
    }

    /// Append the submission to `talk_title` with an attribution line, then clear the page.
    pub fn move_to_talk_page(
        &mut self,
        talk_title: &str,
        intake: &IntakeSection,
    ) -> Result<()> {
        let user = self.editor.clone().unwrap_or_else(|| "unknown".to_string());
        let body = self.get_page_text();
        let existing = self
            .wiki
            .get_text(talk_title)
            .with_context(|| format!("failed to load talk page {talk_title}"))?
            .unwrap_or_default();

        let mut talk = existing.trim_end().to_string();
        if !talk.is_empty() {
            talk.push_str("\n\n");
        }
        talk.push_str(&fill_intake_tokens(&intake.relocation_heading, &user, &self.title));
        talk.push('\n');
        talk.push_str(&body);
        if !body.ends_with('\n') {
            talk.push('\n');
        }
        talk.push_str(&fill_intake_tokens(&intake.attribution, &user, &self.title));
        talk.push('\n');

        self.wiki
            .save(talk_title, &talk, &intake.relocation_summary)
            .with_context(|| format!("failed to write talk page {talk_title}"))?;
        self.start_request(&intake.relocation_summary)
    }
}

fn fill_intake_tokens(template: &str, user: &str, page: &str) -> String {
    template.replace("$user", user).replace("$page", page)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RelocationReason {
    UnknownEditor,
    InsufficientEdits { edits: u64, required: u64 },
    MissingGroup { group: String },
    NoMatches,
}

impl fmt::Display for RelocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownEditor => f.write_str("no non-automated editor found"),
            Self::InsufficientEdits { edits, required } => {
                write!(f, "editor has {edits} edits, {required} required")
            }
            Self::MissingGroup { group } => write!(f, "editor is not in group {group}"),
            Self::NoMatches => f.write_str("no request lines matched"),
        }
    }
}

/// Terminal result of one intake run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IntakeOutcome {
    /// Nothing but the header on the page.
    Idle,
    Accepted { request_ids: Vec<i64> },
    Relocated {
        talk_page: String,
        reason: RelocationReason,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct IntakeReport {
    pub request_page: String,
    pub editor: Option<String>,
    pub scanned_lines: usize,
    pub outcome: IntakeOutcome,
}

/// Authorize, scan and persist the submissions on one family's request page.
#[instrument(skip_all, fields(family = %family_name))]
pub fn run_intake<W: WikiWriteApi + ?Sized>(
    store: &mut Store,
    wiki: &mut W,
    family_name: &str,
    family: &FamilyConfig,
    intake: &IntakeSection,
    namespaces: &NamespaceTable,
) -> Result<IntakeReport> {
    let mut scanner = RequestScanner::new(family.compiled_pattern()?);
    let (page_namespace, page_title) = namespaces.split_title(&family.request_page);
    let request_page = namespaces.full_title(page_namespace, &page_title);
    let talk_page = namespaces.talk_title(page_namespace, &page_title);

    let mut page = RequestsPage::load(wiki, &request_page, &intake.header)?;
    let body = page.get_page_text();
    let editor = page.editor().map(ToString::to_string);
    let report = |scanned_lines: usize, outcome: IntakeOutcome| IntakeReport {
        request_page: request_page.clone(),
        editor: editor.clone(),
        scanned_lines,
        outcome,
    };

    if is_blank(&body) {
        info!(page = %request_page, "request page is empty");
        return Ok(report(0, IntakeOutcome::Idle));
    }

    if let Some(reason) = authorization_failure(&mut page, family)? {
        warn!(page = %request_page, editor = ?editor, %reason, "relocating unauthorized submission");
        page.move_to_talk_page(&talk_page, intake)?;
        return Ok(report(0, IntakeOutcome::Relocated { talk_page, reason }));
    }

    let results = scanner.scan(&body).to_vec();
    if !scanner.have_requests() {
        let reason = RelocationReason::NoMatches;
        warn!(page = %request_page, editor = ?editor, %reason, "relocating unparsable submission");
        page.move_to_talk_page(&talk_page, intake)?;
        return Ok(report(0, IntakeOutcome::Relocated { talk_page, reason }));
    }

    let batch: Vec<NewRequest> = results
        .iter()
        .map(|result| build_request(result, family, namespaces))
        .collect();

    page.start_request(&intake.consumed_summary)?;
    let request_ids = store.insert_requests(&batch).with_context(|| {
        format!(
            "failed to persist {} requests from {request_page} after clearing it",
            batch.len()
        )
    })?;
    info!(page = %request_page, requests = request_ids.len(), "accepted requests");

    Ok(report(results.len(), IntakeOutcome::Accepted { request_ids }))
}

fn authorization_failure<W: WikiWriteApi + ?Sized>(
    page: &mut RequestsPage<'_, W>,
    family: &FamilyConfig,
) -> Result<Option<RelocationReason>> {
    let Some(edits) = page.editor_edit_count()? else {
        return Ok(Some(RelocationReason::UnknownEditor));
    };
    if edits < family.min_edits {
        return Ok(Some(RelocationReason::InsufficientEdits {
            edits,
            required: family.min_edits,
        }));
    }
    if let Some(group) = family.required_group.as_deref()
        && !page.check_user_groups(group)?
    {
        return Ok(Some(RelocationReason::MissingGroup {
            group: group.to_string(),
        }));
    }
    Ok(None)
}

/// Map scanned groups to a request row.
pub fn build_request(
    result: &ScanResult,
    family: &FamilyConfig,
    namespaces: &NamespaceTable,
) -> NewRequest {
    let group = |name: &str| {
        result
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    };

    let (from_namespace, from_title) = resolve_identity(
        group("source").unwrap_or_default(),
        group("namespace_source"),
        family.default_from_namespace,
        namespaces,
    );
    let destination = group("destination").map(|title| {
        resolve_identity(
            title,
            group("namespace_destination"),
            family.default_to_namespace,
            namespaces,
        )
    });

    NewRequest {
        from_title,
        from_namespace,
        to_namespace: destination.as_ref().map(|(namespace, _)| *namespace),
        to_title: destination.map(|(_, title)| title),
        request_type: family.request_type,
        extra: group("extra").map(ToString::to_string),
    }
}

/// Namespace comes from the captured label, then a title prefix, then the family default.
fn resolve_identity(
    title: &str,
    label: Option<&str>,
    default_namespace: Option<i32>,
    namespaces: &NamespaceTable,
) -> (i32, String) {
    if let Some(label) = label {
        return match namespaces.id_for_label(label) {
            Some(namespace) => (namespace, crate::namespace::normalize_title(title)),
            None => namespaces.split_title(&format!("{label}:{title}")),
        };
    }
    let (namespace, bare) = namespaces.split_title(title);
    if namespace != NS_MAIN {
        return (namespace, bare);
    }
    (default_namespace.unwrap_or(NS_MAIN), bare)
}
