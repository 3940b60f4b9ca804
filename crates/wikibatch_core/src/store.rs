use std::collections::BTreeSet;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::migrate::{ensure_db_parent, open_connection, run_migrations};
use crate::strategy::RequestType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Received,
    Completed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Received => "received",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "received" => Some(Self::Received),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// A request as captured by intake, before it has an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRequest {
    pub from_title: String,
    pub from_namespace: i32,
    pub to_title: Option<String>,
    pub to_namespace: Option<i32>,
    pub request_type: RequestType,
    pub extra: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub id: i64,
    pub from_title: String,
    pub from_namespace: i32,
    pub to_title: Option<String>,
    pub to_namespace: Option<i32>,
    pub request_type: RequestType,
    pub extra: Option<String>,
    pub status: Status,
    pub create_date: i64,
    pub update_date: i64,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub id: i64,
    pub title: String,
    pub namespace: i32,
    pub status: Status,
    pub request_id: i64,
    pub create_date: i64,
    pub update_date: i64,
    pub extra: Option<String>,
}

/// Identity of one wiki page produced by a fan-out.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PageRef {
    pub namespace: i32,
    pub title: String,
}

impl PageRef {
    pub fn new(namespace: i32, title: impl Into<String>) -> Self {
        Self {
            namespace,
            title: title.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestProgress {
    pub request: Request,
    pub total_pages: usize,
    pub completed_pages: usize,
    pub done: bool,
}

/// One family's request/page store.
#[derive(Debug)]
pub struct Store {
    connection: Connection,
}

const REQUEST_COLUMNS: &str = "id, from_title, from_namespace, to_title, to_namespace, request_type, extra, status, create_date, update_date, completed_at";
const PAGE_COLUMNS: &str =
    "id, title, namespace, status, request_id, create_date, update_date, extra";

impl Store {
    /// Open (creating if needed) the store file and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self> {
        ensure_db_parent(path)?;
        let mut connection = open_connection(path)?;
        run_migrations(&mut connection)
            .with_context(|| format!("failed to migrate {}", path.display()))?;
        Ok(Self { connection })
    }

    /// Insert a whole intake batch; either every row lands or none does.
    pub fn insert_requests(&mut self, requests: &[NewRequest]) -> Result<Vec<i64>> {
        let now = unix_timestamp()?;
        let transaction = self
            .connection
            .transaction()
            .context("failed to start request insert transaction")?;
        let mut ids = Vec::with_capacity(requests.len());
        {
            let mut statement = transaction
                .prepare(
                    "INSERT INTO requests (
                        from_title, from_namespace, to_title, to_namespace,
                        request_type, extra, status, create_date, update_date
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)",
                )
                .context("failed to prepare request insert")?;
            for request in requests {
                statement
                    .execute(params![
                        request.from_title,
                        request.from_namespace,
                        request.to_title,
                        request.to_namespace,
                        request.request_type.as_str(),
                        request.extra,
                        now,
                    ])
                    .with_context(|| format!("failed to insert request for {}", request.from_title))?;
                ids.push(transaction.last_insert_rowid());
            }
        }
        transaction
            .commit()
            .context("failed to commit request insert transaction")?;
        Ok(ids)
    }

    pub fn get_request(&self, request_id: i64) -> Result<Option<Request>> {
        self.connection
            .query_row(
                &format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"),
                [request_id],
                decode_request,
            )
            .optional()
            .with_context(|| format!("failed to load request {request_id}"))?
            .transpose()
    }

    /// PENDING requests of one type, oldest first.
    pub fn pending_requests(&self, request_type: RequestType) -> Result<Vec<Request>> {
        self.query_requests(
            &format!(
                "SELECT {REQUEST_COLUMNS} FROM requests
                 WHERE request_type = ?1 AND status = 'pending'
                 ORDER BY id ASC"
            ),
            params![request_type.as_str()],
        )
    }

    /// Persist the full page set of a request and flip it to RECEIVED in one transaction.
    /// Duplicate page identities collapse to one row. Returns the number of rows written.
    pub fn record_fan_out(&mut self, request_id: i64, pages: &[PageRef]) -> Result<usize> {
        let now = unix_timestamp()?;
        let unique: BTreeSet<&PageRef> = pages.iter().collect();
        let transaction = self
            .connection
            .transaction()
            .context("failed to start fan-out transaction")?;

        let flipped = transaction
            .execute(
                "UPDATE requests SET status = 'received', update_date = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![request_id, now],
            )
            .with_context(|| format!("failed to mark request {request_id} received"))?;
        if flipped == 0 {
            bail!("request {request_id} is not pending");
        }

        {
            let mut statement = transaction
                .prepare(
                    "INSERT INTO pages (title, namespace, status, request_id, create_date, update_date)
                     VALUES (?1, ?2, 'pending', ?3, ?4, ?4)",
                )
                .context("failed to prepare page insert")?;
            for page in &unique {
                statement
                    .execute(params![page.title, page.namespace, request_id, now])
                    .with_context(|| {
                        format!("failed to insert page {} for request {request_id}", page.title)
                    })?;
            }
        }

        transaction
            .commit()
            .context("failed to commit fan-out transaction")?;
        Ok(unique.len())
    }

    /// RECEIVED requests of one type that still own at least one PENDING page.
    pub fn active_requests(&self, request_type: RequestType, limit: usize) -> Result<Vec<Request>> {
        self.query_requests(
            &format!(
                "SELECT {REQUEST_COLUMNS} FROM requests r
                 WHERE r.request_type = ?1
                   AND r.status = 'received'
                   AND EXISTS (
                       SELECT 1 FROM pages p
                       WHERE p.request_id = r.id AND p.status = 'pending'
                   )
                 ORDER BY r.id ASC
                 LIMIT ?2"
            ),
            params![request_type.as_str(), sql_limit(limit)?],
        )
    }

    pub fn pending_pages(&self, request_id: i64, limit: usize) -> Result<Vec<Page>> {
        self.query_pages(
            &format!(
                "SELECT {PAGE_COLUMNS} FROM pages
                 WHERE request_id = ?1 AND status = 'pending'
                 ORDER BY id ASC
                 LIMIT ?2"
            ),
            params![request_id, sql_limit(limit)?],
        )
    }

    pub fn pages_for_request(&self, request_id: i64) -> Result<Vec<Page>> {
        self.query_pages(
            &format!("SELECT {PAGE_COLUMNS} FROM pages WHERE request_id = ?1 ORDER BY id ASC"),
            params![request_id],
        )
    }

    pub fn complete_page(&self, page_id: i64) -> Result<()> {
        let now = unix_timestamp()?;
        let updated = self
            .connection
            .execute(
                "UPDATE pages SET status = 'completed', update_date = ?2 WHERE id = ?1",
                params![page_id, now],
            )
            .with_context(|| format!("failed to complete page {page_id}"))?;
        if updated == 0 {
            bail!("page {page_id} does not exist");
        }
        Ok(())
    }

    /// A resolved request is done when all of its pages are COMPLETED.
    /// Always recomputed from page rows; `completed_at` is never consulted.
    pub fn is_request_done(&self, request_id: i64) -> Result<bool> {
        let (status, total, completed): (String, i64, i64) = self
            .connection
            .query_row(
                "SELECT r.status,
                        COUNT(p.id),
                        COALESCE(SUM(CASE WHEN p.status = 'completed' THEN 1 ELSE 0 END), 0)
                 FROM requests r
                 LEFT JOIN pages p ON p.request_id = r.id
                 WHERE r.id = ?1
                 GROUP BY r.id",
                [request_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .with_context(|| format!("failed to count pages of request {request_id}"))?
            .ok_or_else(|| anyhow!("request {request_id} does not exist"))?;
        Ok(status != Status::Pending.as_str() && total == completed)
    }

    /// Record the time a request finished. Returns false when it was already stamped.
    pub fn stamp_completed_at(&self, request_id: i64) -> Result<bool> {
        let now = unix_timestamp()?;
        let updated = self
            .connection
            .execute(
                "UPDATE requests SET completed_at = ?2 WHERE id = ?1 AND completed_at IS NULL",
                params![request_id, now],
            )
            .with_context(|| format!("failed to stamp completion of request {request_id}"))?;
        Ok(updated > 0)
    }

    pub fn progress(&self, request_type: Option<RequestType>) -> Result<Vec<RequestProgress>> {
        let requests = match request_type {
            Some(kind) => self.query_requests(
                &format!(
                    "SELECT {REQUEST_COLUMNS} FROM requests WHERE request_type = ?1 ORDER BY id ASC"
                ),
                params![kind.as_str()],
            )?,
            None => self.query_requests(
                &format!("SELECT {REQUEST_COLUMNS} FROM requests ORDER BY id ASC"),
                params![],
            )?,
        };

        let mut statement = self
            .connection
            .prepare(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0)
                 FROM pages WHERE request_id = ?1",
            )
            .context("failed to prepare progress query")?;

        let mut out = Vec::with_capacity(requests.len());
        for request in requests {
            let (total, completed): (i64, i64) = statement
                .query_row([request.id], |row| Ok((row.get(0)?, row.get(1)?)))
                .with_context(|| format!("failed to count pages of request {}", request.id))?;
            let done = request.status != Status::Pending && total == completed;
            out.push(RequestProgress {
                request,
                total_pages: usize::try_from(total).context("page count is negative")?,
                completed_pages: usize::try_from(completed).context("page count is negative")?,
                done,
            });
        }
        Ok(out)
    }

    /// Delete a request; its pages go with it.
    pub fn delete_request(&self, request_id: i64) -> Result<bool> {
        let deleted = self
            .connection
            .execute("DELETE FROM requests WHERE id = ?1", [request_id])
            .with_context(|| format!("failed to delete request {request_id}"))?;
        Ok(deleted > 0)
    }

    fn query_requests(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Request>> {
        let mut statement = self
            .connection
            .prepare(sql)
            .context("failed to prepare request query")?;
        let rows = statement
            .query_map(params, decode_request)
            .context("failed to run request query")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode request row")??);
        }
        Ok(out)
    }

    fn query_pages(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Page>> {
        let mut statement = self
            .connection
            .prepare(sql)
            .context("failed to prepare page query")?;
        let rows = statement
            .query_map(params, decode_page)
            .context("failed to run page query")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode page row")??);
        }
        Ok(out)
    }
}

fn decode_request(row: &Row<'_>) -> rusqlite::Result<Result<Request>> {
    let request_type: String = row.get(5)?;
    let status: String = row.get(7)?;
    let id: i64 = row.get(0)?;
    let from_title: String = row.get(1)?;
    let from_namespace: i32 = row.get(2)?;
    let to_title: Option<String> = row.get(3)?;
    let to_namespace: Option<i32> = row.get(4)?;
    let extra: Option<String> = row.get(6)?;
    let create_date: i64 = row.get(8)?;
    let update_date: i64 = row.get(9)?;
    let completed_at: Option<i64> = row.get(10)?;

    Ok((|| {
        Ok(Request {
            id,
            from_title,
            from_namespace,
            to_title,
            to_namespace,
            request_type: RequestType::parse(&request_type)
                .ok_or_else(|| anyhow!("request {id} has unknown type {request_type}"))?,
            extra,
            status: Status::parse(&status)
                .ok_or_else(|| anyhow!("request {id} has unknown status {status}"))?,
            create_date,
            update_date,
            completed_at,
        })
    })())
}

fn decode_page(row: &Row<'_>) -> rusqlite::Result<Result<Page>> {
    let id: i64 = row.get(0)?;
    let status: String = row.get(3)?;
    let page = Page {
        id,
        title: row.get(1)?,
        namespace: row.get(2)?,
        status: Status::Pending,
        request_id: row.get(4)?,
        create_date: row.get(5)?,
        update_date: row.get(6)?,
        extra: row.get(7)?,
    };
    Ok(match Status::parse(&status) {
        Some(status) => Ok(Page { status, ..page }),
        None => Err(anyhow!("page {id} has unknown status {status}")),
    })
}

fn sql_limit(limit: usize) -> Result<i64> {
    i64::try_from(limit).context("batch limit does not fit into i64")
}

pub(crate) fn unix_timestamp() -> Result<i64> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?
        .as_secs();
    i64::try_from(seconds).context("timestamp does not fit into i64")
}

#[cfg(test)]
impl Store {
    /// Raw SQL against the store file, used to install failure triggers.
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.connection
            .execute_batch(sql)
            .context("failed to run store SQL")
    }
}
