use std::collections::BTreeMap;

use crate::config::CustomNamespace;

pub const NS_MAIN: i32 = 0;
pub const NS_TALK: i32 = 1;
pub const NS_USER: i32 = 2;
pub const NS_USER_TALK: i32 = 3;
pub const NS_PROJECT: i32 = 4;
pub const NS_FILE: i32 = 6;
pub const NS_MEDIAWIKI: i32 = 8;
pub const NS_TEMPLATE: i32 = 10;
pub const NS_HELP: i32 = 12;
pub const NS_CATEGORY: i32 = 14;
pub const NS_PORTAL: i32 = 100;
pub const NS_MODULE: i32 = 828;

const STANDARD_NAMESPACES: &[(i32, &str)] = &[
    (NS_TALK, "Talk"),
    (NS_USER, "User"),
    (NS_USER_TALK, "User talk"),
    (NS_PROJECT, "Project"),
    (5, "Project talk"),
    (NS_FILE, "File"),
    (7, "File talk"),
    (NS_MEDIAWIKI, "MediaWiki"),
    (9, "MediaWiki talk"),
    (NS_TEMPLATE, "Template"),
    (11, "Template talk"),
    (NS_HELP, "Help"),
    (13, "Help talk"),
    (NS_CATEGORY, "Category"),
    (15, "Category talk"),
    (NS_PORTAL, "Portal"),
    (101, "Portal talk"),
    (NS_MODULE, "Module"),
    (829, "Module talk"),
];

const STANDARD_ALIASES: &[(&str, i32)] = &[("Image", NS_FILE), ("Media", NS_FILE), ("WP", NS_PROJECT)];

/// Namespace ids and labels known to one wiki.
#[derive(Debug, Clone)]
pub struct NamespaceTable {
    names: BTreeMap<i32, String>,
    by_label: BTreeMap<String, i32>,
}

impl Default for NamespaceTable {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl NamespaceTable {
    pub fn new(custom: &[CustomNamespace]) -> Self {
        let mut table = Self {
            names: BTreeMap::new(),
            by_label: BTreeMap::new(),
        };
        for (id, name) in STANDARD_NAMESPACES {
            table.insert(*id, name);
        }
        for (alias, id) in STANDARD_ALIASES {
            table.by_label.insert(label_key(alias), *id);
        }
        for namespace in custom {
            if namespace.name.trim().is_empty() {
                continue;
            }
            table.insert(namespace.id, namespace.name.trim());
        }
        table
    }

    fn insert(&mut self, id: i32, name: &str) {
        self.names.insert(id, name.to_string());
        self.by_label.insert(label_key(name), id);
    }

    /// Map a captured label such as `Template` or `category` to its id.
    /// An empty label means the main namespace.
    pub fn id_for_label(&self, label: &str) -> Option<i32> {
        let key = label_key(label);
        if key.is_empty() {
            return Some(NS_MAIN);
        }
        self.by_label.get(&key).copied()
    }

    pub fn prefix_for(&self, namespace: i32) -> Option<&str> {
        self.names.get(&namespace).map(String::as_str)
    }

    /// Full display title, e.g. `Template:Foo`.
    pub fn full_title(&self, namespace: i32, title: &str) -> String {
        match self.prefix_for(namespace) {
            Some(prefix) if namespace != NS_MAIN => format!("{prefix}:{title}"),
            _ => title.to_string(),
        }
    }

    /// Split `Template:Foo` into `(10, "Foo")`. Unknown prefixes stay in the main namespace.
    pub fn split_title(&self, full: &str) -> (i32, String) {
        let normalized = normalize_title(full);
        if let Some((prefix, rest)) = normalized.split_once(':')
            && let Some(id) = self.by_label.get(&label_key(prefix))
            && !rest.trim().is_empty()
        {
            return (*id, normalize_title(rest));
        }
        (NS_MAIN, normalized)
    }

    pub fn talk_namespace(namespace: i32) -> i32 {
        if namespace % 2 == 0 {
            namespace + 1
        } else {
            namespace
        }
    }

    pub fn talk_title(&self, namespace: i32, title: &str) -> String {
        let talk = Self::talk_namespace(namespace);
        match self.prefix_for(talk) {
            Some(prefix) => format!("{prefix}:{title}"),
            None => format!("Talk:{title}"),
        }
    }
}

fn label_key(label: &str) -> String {
    normalize_title(label).to_ascii_lowercase()
}

/// Underscores become spaces, runs of whitespace collapse and the first letter is uppercased.
pub fn normalize_title(value: &str) -> String {
    let collapsed = value
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let mut chars = collapsed.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Database form of a title: spaces become underscores.
pub fn db_key(title: &str) -> String {
    normalize_title(title).replace(' ', "_")
}
