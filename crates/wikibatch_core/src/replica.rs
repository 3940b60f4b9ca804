use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OpenFlags, OptionalExtension, ToSql, named_params};

use crate::namespace::{NS_CATEGORY, NS_FILE, NS_PORTAL, NS_TEMPLATE, NamespaceTable, db_key};
use crate::store::PageRef;
use crate::wiki::WikiReadApi;

/// Link-table queries the resolver fans out through. Titles are bare (no namespace prefix).
pub trait FanOutSource {
    fn page_id(&mut self, namespace: i32, title: &str) -> Result<Option<i64>>;
    /// Transcluders of a template, optionally restricted to members of `within_category`.
    fn transclusions(&mut self, template: &str, within_category: Option<&str>)
    -> Result<Vec<PageRef>>;
    fn category_members(&mut self, category: &str) -> Result<Vec<PageRef>>;
    /// Transcluders of `embedding` linking portal `source` but not portal `destination`.
    fn portal_candidates(
        &mut self,
        embedding: &str,
        source: &str,
        destination: &str,
    ) -> Result<Vec<PageRef>>;
    fn backlinks(&mut self, namespace: i32, title: &str, namespaces: &[i32])
    -> Result<Vec<PageRef>>;
    fn file_usage(&mut self, file: &str) -> Result<Vec<PageRef>>;
}

const PAGE_ID_SQL: &str = "SELECT page_id FROM page
     WHERE page_namespace = :namespace AND page_title = :title";

const TRANSCLUSIONS_SQL: &str = "SELECT p.page_namespace, p.page_title
     FROM templatelinks tl
     JOIN page p ON p.page_id = tl.tl_from
     WHERE tl.tl_namespace = :template_namespace AND tl.tl_title = :template
     ORDER BY p.page_namespace, p.page_title";

const TRANSCLUSIONS_IN_CATEGORY_SQL: &str = "SELECT p.page_namespace, p.page_title
     FROM templatelinks tl
     JOIN page p ON p.page_id = tl.tl_from
     WHERE tl.tl_namespace = :template_namespace AND tl.tl_title = :template
       AND EXISTS (
           SELECT 1 FROM categorylinks cl
           WHERE cl.cl_from = p.page_id AND cl.cl_to = :category
       )
     ORDER BY p.page_namespace, p.page_title";

const CATEGORY_MEMBERS_SQL: &str = "SELECT p.page_namespace, p.page_title
     FROM categorylinks cl
     JOIN page p ON p.page_id = cl.cl_from
     WHERE cl.cl_to = :category
     ORDER BY p.page_namespace, p.page_title";

const PORTAL_CANDIDATES_SQL: &str = "SELECT p.page_namespace, p.page_title
     FROM page p
     WHERE EXISTS (
           SELECT 1 FROM templatelinks tl
           WHERE tl.tl_from = p.page_id
             AND tl.tl_namespace = :template_namespace AND tl.tl_title = :embedding
       )
       AND EXISTS (
           SELECT 1 FROM pagelinks pl
           WHERE pl.pl_from = p.page_id
             AND pl.pl_namespace = :portal_namespace AND pl.pl_title = :source
       )
       AND NOT EXISTS (
           SELECT 1 FROM pagelinks pl
           WHERE pl.pl_from = p.page_id
             AND pl.pl_namespace = :portal_namespace AND pl.pl_title = :destination
       )
     ORDER BY p.page_namespace, p.page_title";

const BACKLINKS_SQL: &str = "SELECT p.page_namespace, p.page_title
     FROM pagelinks pl
     JOIN page p ON p.page_id = pl.pl_from
     WHERE pl.pl_namespace = :namespace AND pl.pl_title = :title
     ORDER BY p.page_namespace, p.page_title";

const FILE_USAGE_SQL: &str = "SELECT p.page_namespace, p.page_title
     FROM imagelinks il
     JOIN page p ON p.page_id = il.il_from
     WHERE il.il_to = :file
     ORDER BY p.page_namespace, p.page_title";

/// Read-only SQLite copy of the wiki's link tables.
pub struct SqliteReplica {
    connection: Connection,
}

impl SqliteReplica {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("replica database not found: {}", path.display());
        }
        let connection = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("failed to open replica {}", path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        Ok(Self { connection })
    }

    #[cfg(test)]
    pub(crate) fn from_connection(connection: Connection) -> Self {
        Self { connection }
    }

    fn select_pages(
        &self,
        name: &str,
        sql: &str,
        params: &[(&str, &dyn ToSql)],
    ) -> Result<Vec<PageRef>> {
        let mut statement = self
            .connection
            .prepare(sql)
            .with_context(|| format!("failed to prepare {name} query"))?;
        let rows = statement
            .query_map(params, |row| {
                Ok(PageRef::new(
                    row.get::<_, i32>(0)?,
                    row.get::<_, String>(1)?.replace('_', " "),
                ))
            })
            .with_context(|| format!("failed to run {name} query"))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.with_context(|| format!("failed to decode {name} row"))?);
        }
        Ok(out)
    }
}

impl FanOutSource for SqliteReplica {
    fn page_id(&mut self, namespace: i32, title: &str) -> Result<Option<i64>> {
        self.connection
            .query_row(
                PAGE_ID_SQL,
                named_params! { ":namespace": namespace, ":title": db_key(title) },
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to look up page id for {title}"))
    }

    fn transclusions(
        &mut self,
        template: &str,
        within_category: Option<&str>,
    ) -> Result<Vec<PageRef>> {
        let template = db_key(template);
        match within_category {
            Some(category) => self.select_pages(
                "transclusions_in_category",
                TRANSCLUSIONS_IN_CATEGORY_SQL,
                named_params! {
                    ":template_namespace": NS_TEMPLATE,
                    ":template": template,
                    ":category": db_key(category),
                },
            ),
            None => self.select_pages(
                "transclusions",
                TRANSCLUSIONS_SQL,
                named_params! { ":template_namespace": NS_TEMPLATE, ":template": template },
            ),
        }
    }

    fn category_members(&mut self, category: &str) -> Result<Vec<PageRef>> {
        self.select_pages(
            "category_members",
            CATEGORY_MEMBERS_SQL,
            named_params! { ":category": db_key(category) },
        )
    }

    fn portal_candidates(
        &mut self,
        embedding: &str,
        source: &str,
        destination: &str,
    ) -> Result<Vec<PageRef>> {
        self.select_pages(
            "portal_candidates",
            PORTAL_CANDIDATES_SQL,
            named_params! {
                ":template_namespace": NS_TEMPLATE,
                ":embedding": db_key(embedding),
                ":portal_namespace": NS_PORTAL,
                ":source": db_key(source),
                ":destination": db_key(destination),
            },
        )
    }

    fn backlinks(
        &mut self,
        namespace: i32,
        title: &str,
        namespaces: &[i32],
    ) -> Result<Vec<PageRef>> {
        let pages = self.select_pages(
            "backlinks",
            BACKLINKS_SQL,
            named_params! { ":namespace": namespace, ":title": db_key(title) },
        )?;
        Ok(pages
            .into_iter()
            .filter(|page| namespaces.contains(&page.namespace))
            .collect())
    }

    fn file_usage(&mut self, file: &str) -> Result<Vec<PageRef>> {
        self.select_pages(
            "file_usage",
            FILE_USAGE_SQL,
            named_params! { ":file": db_key(file) },
        )
    }
}

/// Fan-out through the live wiki API when no replica is configured.
pub struct ApiFanOut<'a, W: WikiReadApi + ?Sized> {
    wiki: &'a mut W,
    namespaces: &'a NamespaceTable,
    /// Namespaces searched when intersecting portal backlinks.
    portal_namespaces: &'a [i32],
}

impl<'a, W: WikiReadApi + ?Sized> ApiFanOut<'a, W> {
    pub fn new(wiki: &'a mut W, namespaces: &'a NamespaceTable, portal_namespaces: &'a [i32]) -> Self {
        Self {
            wiki,
            namespaces,
            portal_namespaces,
        }
    }
}

impl<W: WikiReadApi + ?Sized> FanOutSource for ApiFanOut<'_, W> {
    fn page_id(&mut self, namespace: i32, title: &str) -> Result<Option<i64>> {
        let full = self.namespaces.full_title(namespace, title);
        self.wiki.page_id(&full)
    }

    fn transclusions(
        &mut self,
        template: &str,
        within_category: Option<&str>,
    ) -> Result<Vec<PageRef>> {
        let full = self.namespaces.full_title(NS_TEMPLATE, template);
        let pages = self.wiki.transclusions_of(&full)?;
        let Some(category) = within_category else {
            return Ok(pages);
        };
        let members: BTreeSet<PageRef> = self
            .wiki
            .members_of(&self.namespaces.full_title(NS_CATEGORY, category))?
            .into_iter()
            .collect();
        Ok(pages
            .into_iter()
            .filter(|page| members.contains(page))
            .collect())
    }

    fn category_members(&mut self, category: &str) -> Result<Vec<PageRef>> {
        let full = self.namespaces.full_title(NS_CATEGORY, category);
        self.wiki.members_of(&full)
    }

    fn portal_candidates(
        &mut self,
        embedding: &str,
        source: &str,
        destination: &str,
    ) -> Result<Vec<PageRef>> {
        let embedders: BTreeSet<PageRef> = self
            .wiki
            .transclusions_of(&self.namespaces.full_title(NS_TEMPLATE, embedding))?
            .into_iter()
            .collect();
        let already_linked: BTreeSet<PageRef> = self
            .wiki
            .backlinks_of(
                &self.namespaces.full_title(NS_PORTAL, destination),
                self.portal_namespaces,
            )?
            .into_iter()
            .collect();
        let linking_source = self.wiki.backlinks_of(
            &self.namespaces.full_title(NS_PORTAL, source),
            self.portal_namespaces,
        )?;
        Ok(linking_source
            .into_iter()
            .filter(|page| embedders.contains(page) && !already_linked.contains(page))
            .collect())
    }

    fn backlinks(
        &mut self,
        namespace: i32,
        title: &str,
        namespaces: &[i32],
    ) -> Result<Vec<PageRef>> {
        let full = self.namespaces.full_title(namespace, title);
        self.wiki.backlinks_of(&full, namespaces)
    }

    fn file_usage(&mut self, file: &str) -> Result<Vec<PageRef>> {
        let full = self.namespaces.full_title(NS_FILE, file);
        self.wiki.file_usage(&full)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use rusqlite::{Connection, params};

    use crate::namespace::NS_TEMPLATE;

    pub(crate) const REPLICA_SCHEMA: &str = "
        CREATE TABLE page (
            page_id INTEGER PRIMARY KEY,
            page_namespace INTEGER NOT NULL,
            page_title TEXT NOT NULL
        );
        CREATE TABLE templatelinks (tl_from INTEGER, tl_namespace INTEGER, tl_title TEXT);
        CREATE TABLE categorylinks (cl_from INTEGER, cl_to TEXT);
        CREATE TABLE pagelinks (pl_from INTEGER, pl_namespace INTEGER, pl_title TEXT);
        CREATE TABLE imagelinks (il_from INTEGER, il_to TEXT);
    ";

    pub(crate) fn replica_connection() -> Connection {
        let connection = Connection::open_in_memory().expect("open replica");
        connection
            .execute_batch(REPLICA_SCHEMA)
            .expect("create replica schema");
        connection
    }

    pub(crate) fn add_page(connection: &Connection, id: i64, namespace: i32, title: &str) {
        connection
            .execute(
                "INSERT INTO page (page_id, page_namespace, page_title) VALUES (?1, ?2, ?3)",
                params![id, namespace, title],
            )
            .expect("insert page");
    }

    pub(crate) fn add_transclusion(connection: &Connection, from: i64, template: &str) {
        connection
            .execute(
                "INSERT INTO templatelinks (tl_from, tl_namespace, tl_title) VALUES (?1, ?2, ?3)",
                params![from, NS_TEMPLATE, template],
            )
            .expect("insert templatelink");
    }

    pub(crate) fn add_category(connection: &Connection, from: i64, category: &str) {
        connection
            .execute(
                "INSERT INTO categorylinks (cl_from, cl_to) VALUES (?1, ?2)",
                params![from, category],
            )
            .expect("insert categorylink");
    }

    pub(crate) fn add_link(connection: &Connection, from: i64, namespace: i32, title: &str) {
        connection
            .execute(
                "INSERT INTO pagelinks (pl_from, pl_namespace, pl_title) VALUES (?1, ?2, ?3)",
                params![from, namespace, title],
            )
            .expect("insert pagelink");
    }

    pub(crate) fn add_image(connection: &Connection, from: i64, file: &str) {
        connection
            .execute(
                "INSERT INTO imagelinks (il_from, il_to) VALUES (?1, ?2)",
                params![from, file],
            )
            .expect("insert imagelink");
    }
}
