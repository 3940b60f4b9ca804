use std::collections::BTreeSet;

use crate::namespace::{NS_CATEGORY, NamespaceTable};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiLink {
    pub namespace: i32,
    pub title: String,
    pub leading_colon: bool,
}

/// Every `[[...]]` target in `content`, in order of appearance.
pub fn extract_wikilinks(content: &str, namespaces: &NamespaceTable) -> Vec<WikiLink> {
    let bytes = content.as_bytes();
    let mut out = Vec::new();
    let mut cursor = 0usize;

    while cursor + 1 < bytes.len() {
        if bytes[cursor] == b'[' && bytes[cursor + 1] == b'[' {
            let start = cursor + 2;
            let mut end = start;
            while end + 1 < bytes.len() {
                if bytes[end] == b']' && bytes[end + 1] == b']' {
                    break;
                }
                end += 1;
            }
            if end + 1 >= bytes.len() {
                break;
            }

            if let Some(link) = parse_wikilink(&content[start..end], namespaces) {
                out.push(link);
            }
            cursor = end + 2;
            continue;
        }
        cursor += 1;
    }

    out
}

fn parse_wikilink(inner: &str, namespaces: &NamespaceTable) -> Option<WikiLink> {
    let mut target = inner.split('|').next().unwrap_or("").trim();

    let mut leading_colon = false;
    while let Some(stripped) = target.strip_prefix(':') {
        leading_colon = true;
        target = stripped.trim_start();
    }
    if let Some((without_fragment, _)) = target.split_once('#') {
        target = without_fragment.trim_end();
    }
    if target.is_empty()
        || target.starts_with("http://")
        || target.starts_with("https://")
        || target.starts_with("//")
    {
        return None;
    }

    let (namespace, title) = namespaces.split_title(target);
    if title.is_empty() {
        return None;
    }
    Some(WikiLink {
        namespace,
        title,
        leading_colon,
    })
}

/// Distinct outbound page links of a page, skipping category links and self links.
pub fn outbound_pages(
    content: &str,
    namespaces: &NamespaceTable,
    own_namespace: i32,
    own_title: &str,
) -> Vec<(i32, String)> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for link in extract_wikilinks(content, namespaces) {
        if link.namespace == NS_CATEGORY {
            continue;
        }
        if link.namespace == own_namespace && link.title == own_title {
            continue;
        }
        let key = (link.namespace, link.title);
        if seen.insert(key.clone()) {
            out.push(key);
        }
    }
    out
}

/// Remove the first occurrence of `header` from `text`, ignoring the header's trailing
/// whitespace (the wiki trims it on save) and the line break that followed it.
pub fn strip_header_once(text: &str, header: &str) -> String {
    let header = header.trim_end();
    if header.is_empty() {
        return text.to_string();
    }
    let Some(at) = text.find(header) else {
        return text.to_string();
    };
    let rest = &text[at + header.len()..];
    let rest = rest
        .strip_prefix("\r\n")
        .or_else(|| rest.strip_prefix('\n'))
        .unwrap_or(rest);
    format!("{}{rest}", &text[..at])
}

pub fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}
