use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::FamilyConfig;
use crate::mutate::DEFAULT_PORTAL_TEMPLATE;
use crate::namespace::{NS_CATEGORY, NS_TEMPLATE, NamespaceTable};
use crate::replica::{ApiFanOut, FanOutSource};
use crate::store::{PageRef, Request, Store};
use crate::strategy::{FanOut, StrategyTable};
use crate::wiki::WikiReadApi;
use crate::wikitext::outbound_pages;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolveReport {
    pub pending: usize,
    pub resolved: usize,
    pub empty: usize,
    pub pages_recorded: usize,
    pub errors: Vec<String>,
}

/// Resolve every PENDING request of one family.
///
/// Link-table queries go to `replica` when one is configured and to the wiki API
/// otherwise. A request whose fan-out fails stays PENDING and is retried next run.
#[instrument(skip_all, fields(family = %family_name))]
pub fn resolve_family<W: WikiReadApi + ?Sized>(
    store: &mut Store,
    wiki: &mut W,
    mut replica: Option<&mut dyn FanOutSource>,
    family_name: &str,
    family: &FamilyConfig,
    namespaces: &NamespaceTable,
    strategies: &StrategyTable,
) -> Result<ResolveReport> {
    let fan_out = strategies.get(family.request_type)?.fan_out;
    let requests = store.pending_requests(family.request_type)?;
    let mut report = ResolveReport {
        pending: requests.len(),
        ..ResolveReport::default()
    };

    for request in &requests {
        let outcome = request_pages(
            wiki,
            replica
                .as_mut()
                .map(|source| &mut **source as &mut dyn FanOutSource),
            fan_out,
            request,
            family,
            namespaces,
        )
        .and_then(|pages| {
            let count = store.record_fan_out(request.id, &pages)?;
            if count == 0 {
                store.stamp_completed_at(request.id)?;
            }
            Ok(count)
        });

        match outcome {
            Ok(count) => {
                info!(request = request.id, branch = fan_out.as_str(), pages = count, "resolved request");
                if count == 0 {
                    report.empty += 1;
                }
                report.resolved += 1;
                report.pages_recorded += count;
            }
            Err(error) => {
                warn!(request = request.id, "failed to resolve request: {error:?}");
                report
                    .errors
                    .push(format!("request {}: {error:#}", request.id));
            }
        }
    }

    Ok(report)
}

/// Full page set of one request. Missing source or destination pages yield an empty set.
pub fn request_pages<W: WikiReadApi + ?Sized>(
    wiki: &mut W,
    replica: Option<&mut dyn FanOutSource>,
    fan_out: FanOut,
    request: &Request,
    family: &FamilyConfig,
    namespaces: &NamespaceTable,
) -> Result<Vec<PageRef>> {
    if fan_out == FanOut::SelfContained {
        return self_contained_pages(wiki, request, namespaces);
    }
    match replica {
        Some(source) => scoped_pages(source, fan_out, request, family),
        None => {
            let mut api = ApiFanOut::new(wiki, namespaces, &family.backlink_namespaces);
            scoped_pages(&mut api, fan_out, request, family)
        }
    }
}

fn scoped_pages(
    source: &mut dyn FanOutSource,
    fan_out: FanOut,
    request: &Request,
    family: &FamilyConfig,
) -> Result<Vec<PageRef>> {
    if source.page_id(request.from_namespace, &request.from_title)?.is_none() {
        warn!(request = request.id, title = %request.from_title, "source page no longer exists");
        return Ok(Vec::new());
    }
    if let Some((namespace, title)) = destination(request)
        && source.page_id(namespace, title)?.is_none()
    {
        warn!(request = request.id, %title, "destination page no longer exists");
        return Ok(Vec::new());
    }

    let pages = match fan_out {
        FanOut::TemplateScope if request.from_namespace == NS_TEMPLATE => {
            source.transclusions(&request.from_title, request.extra.as_deref())?
        }
        FanOut::TemplateScope => source.transclusions(required_destination(request)?, None)?,
        FanOut::CategoryScope if request.from_namespace == NS_CATEGORY => {
            source.category_members(&request.from_title)?
        }
        FanOut::CategoryScope => source.category_members(required_destination(request)?)?,
        FanOut::PortalScope => {
            let embedding = request
                .extra
                .as_deref()
                .or(family.embedding_template.as_deref())
                .unwrap_or(DEFAULT_PORTAL_TEMPLATE);
            source.portal_candidates(
                embedding,
                &request.from_title,
                required_destination(request)?,
            )?
        }
        FanOut::BacklinkScope => source.backlinks(
            request.from_namespace,
            &request.from_title,
            &family.backlink_namespaces,
        )?,
        FanOut::FileScope => source.file_usage(&request.from_title)?,
        FanOut::SelfContained => bail!("self-contained requests are not resolved through link tables"),
    };
    Ok(pages)
}

fn self_contained_pages<W: WikiReadApi + ?Sized>(
    wiki: &mut W,
    request: &Request,
    namespaces: &NamespaceTable,
) -> Result<Vec<PageRef>> {
    let source = namespaces.full_title(request.from_namespace, &request.from_title);
    if let Some((namespace, title)) = destination(request)
        && !wiki.page_exists(&namespaces.full_title(namespace, title))?
    {
        warn!(request = request.id, %title, "destination page no longer exists");
        return Ok(Vec::new());
    }
    let Some(text) = wiki
        .get_text(&source)
        .with_context(|| format!("failed to load {source}"))?
    else {
        warn!(request = request.id, title = %source, "source page no longer exists");
        return Ok(Vec::new());
    };

    Ok(
        outbound_pages(&text, namespaces, request.from_namespace, &request.from_title)
            .into_iter()
            .map(|(namespace, title)| PageRef::new(namespace, title))
            .collect(),
    )
}

fn destination(request: &Request) -> Option<(i32, &str)> {
    let title = request.to_title.as_deref()?;
    if title.trim().is_empty() {
        return None;
    }
    Some((request.to_namespace.unwrap_or(request.from_namespace), title))
}

fn required_destination(request: &Request) -> Result<&str> {
    match destination(request) {
        Some((_, title)) => Ok(title),
        None => bail!("request {} has no destination", request.id),
    }
}
