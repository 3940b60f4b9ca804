//! Text mutations applied by the executor, one per request type.
//!
//! Each mutator receives the live page text and the owning request and returns the
//! new text. Returning the input unchanged means "nothing to do".

use anyhow::{Context, Result, bail};
use regex::{Captures, Regex};

use crate::namespace::{NS_CATEGORY, NS_FILE, NS_MAIN, NS_PORTAL, NamespaceTable};
use crate::store::Request;

pub const DEFAULT_PORTAL_TEMPLATE: &str = "Portal";

pub struct MutationInput<'a> {
    pub text: &'a str,
    pub request: &'a Request,
    pub namespaces: &'a NamespaceTable,
    /// Portal bar template when the request does not name one.
    pub embedding_template: Option<&'a str>,
}

impl MutationInput<'_> {
    fn destination(&self) -> Result<&str> {
        self.request
            .to_title
            .as_deref()
            .filter(|title| !title.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("request {} has no destination", self.request.id))
    }
}

pub trait PageMutator: Send + Sync {
    fn mutate(&self, input: &MutationInput<'_>) -> Result<String>;
}

/// `{{A|...}}` becomes `{{B|...}}`.
pub struct RenameTemplate;

impl PageMutator for RenameTemplate {
    fn mutate(&self, input: &MutationInput<'_>) -> Result<String> {
        let destination = input.destination()?;
        let pattern = Regex::new(&format!(
            r"(\{{\{{\s*)(?:[Tt]emplate\s*:\s*)?{}(\s*(?:\||\}}\}}))",
            title_pattern(&input.request.from_title)
        ))
        .context("failed to build template pattern")?;
        Ok(pattern
            .replace_all(input.text, |caps: &Captures<'_>| {
                format!("{}{}{}", &caps[1], destination, &caps[2])
            })
            .into_owned())
    }
}

/// Adds `[[Category:source]]` unless the page already carries it.
pub struct InsertCategory;

impl PageMutator for InsertCategory {
    fn mutate(&self, input: &MutationInput<'_>) -> Result<String> {
        let category = &input.request.from_title;
        let prefix = category_prefix(input.namespaces);
        if category_tag_regex(input.namespaces, category)?.is_match(input.text) {
            return Ok(input.text.to_string());
        }
        let mut out = input.text.trim_end().to_string();
        out.push_str(&format!("\n[[{prefix}:{category}]]\n"));
        Ok(out)
    }
}

/// `[[Category:A|key]]` becomes `[[Category:B|key]]`.
pub struct RenameCategoryTag;

impl PageMutator for RenameCategoryTag {
    fn mutate(&self, input: &MutationInput<'_>) -> Result<String> {
        let destination = input.destination()?;
        let prefix = category_prefix(input.namespaces);
        let pattern = category_tag_regex(input.namespaces, &input.request.from_title)?;
        let target_present = category_tag_regex(input.namespaces, destination)?.is_match(input.text);

        let mut replaced_once = false;
        let out = pattern.replace_all(input.text, |caps: &Captures<'_>| {
            if target_present || replaced_once {
                return String::new();
            }
            replaced_once = true;
            let sort_key = caps.name("sort").map_or("", |m| m.as_str());
            format!("[[{prefix}:{destination}{sort_key}]]")
        });
        Ok(out.into_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateSide {
    Source,
    Destination,
}

/// Puts `{{name}}` at the top of the page unless it is already transcluded.
pub struct PrependTemplate(pub TemplateSide);

impl PageMutator for PrependTemplate {
    fn mutate(&self, input: &MutationInput<'_>) -> Result<String> {
        let name = match self.0 {
            TemplateSide::Source => input.request.from_title.as_str(),
            TemplateSide::Destination => input.destination()?,
        };
        let present = Regex::new(&format!(
            r"\{{\{{\s*(?:[Tt]emplate\s*:\s*)?{}\s*(?:\||\}}\}})",
            title_pattern(name)
        ))
        .context("failed to build template pattern")?;
        if present.is_match(input.text) {
            return Ok(input.text.to_string());
        }
        Ok(format!("{{{{{name}}}}}\n{}", input.text))
    }
}

/// Adds the destination portal next to the source portal in the portal bar template.
pub struct AddToPortalBar;

impl PageMutator for AddToPortalBar {
    fn mutate(&self, input: &MutationInput<'_>) -> Result<String> {
        let destination = input.destination()?;
        let template = input
            .request
            .extra
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .or(input.embedding_template)
            .unwrap_or(DEFAULT_PORTAL_TEMPLATE);
        let bar = Regex::new(&format!(
            r"\{{\{{\s*(?:[Tt]emplate\s*:\s*)?{}\s*(?P<args>\|[^{{}}]*)?\}}\}}",
            title_pattern(template)
        ))
        .context("failed to build portal bar pattern")?;

        let source = normalize_arg(&input.request.from_title);
        let destination_key = normalize_arg(destination);
        let mut added = false;
        let out = bar.replace_all(input.text, |caps: &Captures<'_>| {
            let whole = caps[0].to_string();
            if added {
                return whole;
            }
            let args: Vec<String> = caps
                .name("args")
                .map(|m| m.as_str())
                .unwrap_or("")
                .split('|')
                .skip(1)
                .map(normalize_arg)
                .collect();
            if !args.contains(&source) || args.contains(&destination_key) {
                return whole;
            }
            added = true;
            let body = whole.trim_end_matches('}').trim_end();
            format!("{body}|{destination}}}}}")
        });
        Ok(out.into_owned())
    }
}

/// `[[A]]`, `[[A|label]]` and `[[A#section]]` point to B, keeping what readers see.
pub struct RewriteLinks;

impl PageMutator for RewriteLinks {
    fn mutate(&self, input: &MutationInput<'_>) -> Result<String> {
        let destination = input.destination()?;
        let request = input.request;
        let source_prefix = namespace_prefix_pattern(input.namespaces, request.from_namespace);
        let pattern = Regex::new(&format!(
            r"\[\[(?P<colon>\s*:)?\s*{}(?P<name>{})\s*(?P<fragment>#[^\]|]*)?(?P<label>\|[^\]]*)?\]\]",
            source_prefix,
            title_pattern(&request.from_title)
        ))
        .context("failed to build link pattern")?;

        let target = input.namespaces.full_title(
            request.to_namespace.unwrap_or(request.from_namespace),
            destination,
        );
        Ok(pattern
            .replace_all(input.text, |caps: &Captures<'_>| {
                let colon = if caps.name("colon").is_some() { ":" } else { "" };
                let fragment = caps.name("fragment").map_or("", |m| m.as_str());
                let label = match caps.name("label") {
                    Some(label) => label.as_str().to_string(),
                    None => {
                        let shown = caps[0]
                            .trim_start_matches("[[")
                            .trim_end_matches("]]")
                            .trim_start_matches(':')
                            .to_string();
                        format!("|{shown}")
                    }
                };
                format!("[[{colon}{target}{fragment}{label}]]")
            })
            .into_owned())
    }
}

/// Swaps the file name wherever the source file is referenced.
pub struct SubstituteFileName;

impl PageMutator for SubstituteFileName {
    fn mutate(&self, input: &MutationInput<'_>) -> Result<String> {
        let destination = input.destination()?;
        let prefix = namespace_prefix_pattern(input.namespaces, NS_FILE);
        let pattern = Regex::new(&format!(
            r"(?m)(?P<pre>{}|=\s*|^)(?P<name>{})(?P<post>\s*(?:\||\]\]|\}}\}}|$))",
            prefix,
            title_pattern(&input.request.from_title)
        ))
        .context("failed to build file pattern")?;
        Ok(pattern
            .replace_all(input.text, |caps: &Captures<'_>| {
                format!("{}{}{}", &caps["pre"], destination, &caps["post"])
            })
            .into_owned())
    }
}

/// Regex fragment matching a title with a case-insensitive first letter and `_`/space equivalence.
pub fn title_pattern(title: &str) -> String {
    let trimmed = title.trim();
    let mut chars = trimmed.chars();
    let Some(first) = chars.next() else {
        return String::new();
    };
    let mut out = String::new();
    let upper: String = first.to_uppercase().collect();
    let lower: String = first.to_lowercase().collect();
    if upper != lower {
        out.push_str(&format!(
            "(?:{}|{})",
            regex::escape(&upper),
            regex::escape(&lower)
        ));
    } else {
        out.push_str(&regex::escape(&first.to_string()));
    }
    let words: Vec<String> = chars.as_str().split([' ', '_']).map(regex::escape).collect();
    out.push_str(&words.join("[ _]+"));
    out
}

fn category_prefix(namespaces: &NamespaceTable) -> &str {
    namespaces.prefix_for(NS_CATEGORY).unwrap_or("Category")
}

fn category_tag_regex(namespaces: &NamespaceTable, category: &str) -> Result<Regex> {
    Regex::new(&format!(
        r"\[\[\s*{}(?P<name>{})\s*(?P<sort>\|[^\]]*)?\]\]",
        namespace_prefix_pattern(namespaces, NS_CATEGORY),
        title_pattern(category)
    ))
    .with_context(|| format!("failed to build category pattern for {category}"))
}

/// `Prefix:` matcher for a namespace; empty for the main namespace.
fn namespace_prefix_pattern(namespaces: &NamespaceTable, namespace: i32) -> String {
    if namespace == NS_MAIN {
        return String::new();
    }
    let mut labels = vec![namespaces.prefix_for(namespace).unwrap_or("").to_string()];
    if namespace == NS_FILE {
        labels.push("Image".to_string());
    }
    if namespace == NS_PORTAL && labels[0].is_empty() {
        labels[0] = "Portal".to_string();
    }
    let alternatives = labels
        .iter()
        .filter(|label| !label.is_empty())
        .map(|label| format!("(?i:{})", title_pattern(label)))
        .collect::<Vec<_>>()
        .join("|");
    format!(r"(?:(?:{alternatives})\s*:\s*)")
}

fn normalize_arg(value: &str) -> String {
    crate::namespace::normalize_title(value)
}

pub fn ensure_changed_text(old: &str, new: &str) -> Result<bool> {
    if new.trim().is_empty() && !old.trim().is_empty() {
        bail!("mutation would blank the page");
    }
    Ok(old != new)
}
