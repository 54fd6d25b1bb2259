//! Reading tagged statements back out of `pg_stat_activity`.

use sea_orm::{ConnectionTrait, DbBackend, DbErr, FromQueryResult, QueryResult, Statement};
use serde::Serialize;

use crate::codec::{self, DecodeError, Metadata};
use crate::connection::TaggedConnection;
use crate::cursor::TaggedCursor;
use crate::id::CorrelationId;

/// Session snapshot query. Everything but `pid` is cast to text so rows decode
/// the same way across server versions.
pub const ACTIVITY_QUERY: &str = "select pid, \
     datname::text as datname, \
     usename::text as usename, \
     application_name::text as application_name, \
     client_addr::text as client_addr, \
     backend_start::text as backend_start, \
     xact_start::text as xact_start, \
     query_start::text as query_start, \
     state_change::text as state_change, \
     wait_event_type::text as wait_event_type, \
     wait_event::text as wait_event, \
     state::text as state, \
     backend_type::text as backend_type, \
     query::text as query \
     from pg_catalog.pg_stat_activity";

/// One row of `pg_stat_activity` as the server reported it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionActivity {
    pub pid: i32,
    pub datname: Option<String>,
    pub usename: Option<String>,
    pub application_name: Option<String>,
    pub client_addr: Option<String>,
    pub backend_start: Option<String>,
    pub xact_start: Option<String>,
    pub query_start: Option<String>,
    pub state_change: Option<String>,
    pub wait_event_type: Option<String>,
    pub wait_event: Option<String>,
    pub state: Option<String>,
    pub backend_type: Option<String>,
    /// Raw statement text, tag included.
    pub query: Option<String>,
}

impl FromQueryResult for SessionActivity {
    fn from_query_result(res: &QueryResult, pre: &str) -> Result<Self, DbErr> {
        Ok(Self {
            pid: res.try_get(pre, "pid")?,
            datname: res.try_get(pre, "datname")?,
            usename: res.try_get(pre, "usename")?,
            application_name: res.try_get(pre, "application_name")?,
            client_addr: res.try_get(pre, "client_addr")?,
            backend_start: res.try_get(pre, "backend_start")?,
            xact_start: res.try_get(pre, "xact_start")?,
            query_start: res.try_get(pre, "query_start")?,
            state_change: res.try_get(pre, "state_change")?,
            wait_event_type: res.try_get(pre, "wait_event_type")?,
            wait_event: res.try_get(pre, "wait_event")?,
            state: res.try_get(pre, "state")?,
            backend_type: res.try_get(pre, "backend_type")?,
            query: res.try_get(pre, "query")?,
        })
    }
}

/// A session row with its tag decoded.
///
/// `app_metadata` and `query` are `None` when the statement carries no
/// readable tag; `db_metadata` is always present.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InspectedRow {
    pub app_metadata: Option<Metadata>,
    /// Statement text with the tag removed.
    pub query: Option<String>,
    pub db_metadata: SessionActivity,
}

/// Lists what every session on the server is running, with decoded tags.
#[derive(Debug)]
pub struct QueryInspector<'c> {
    connection: &'c TaggedConnection,
}

impl<'c> QueryInspector<'c> {
    pub fn new(connection: &'c TaggedConnection) -> Self {
        Self { connection }
    }

    /// Snapshot session activity through a new cursor.
    pub async fn inspect(&self) -> Result<Inspection, DbErr> {
        let cursor = self.connection.cursor();
        self.inspect_with(&cursor).await
    }

    /// Snapshot session activity through `cursor`.
    ///
    /// The snapshot sees its own statement; rows tagged with `cursor`'s id
    /// are left out of the result.
    pub async fn inspect_with(&self, cursor: &TaggedCursor<'_>) -> Result<Inspection, DbErr> {
        let stmt = Statement::from_string(DbBackend::Postgres, ACTIVITY_QUERY);
        let rows = cursor
            .query_all(stmt)
            .await?
            .iter()
            .map(|row| SessionActivity::from_query_result(row, ""))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            cursor_id = %cursor.id(),
            sessions = rows.len(),
            "Fetched session activity"
        );
        Ok(Inspection::new(cursor.id().clone(), rows))
    }
}

/// One pass over a session snapshot, decoding tags as rows are pulled.
#[derive(Debug)]
pub struct Inspection {
    own_cursor_id: CorrelationId,
    rows: std::vec::IntoIter<SessionActivity>,
}

impl Inspection {
    pub fn new(own_cursor_id: CorrelationId, rows: Vec<SessionActivity>) -> Self {
        Self {
            own_cursor_id,
            rows: rows.into_iter(),
        }
    }
}

/// Whether `metadata` was written by the cursor running the snapshot.
fn is_own(own_cursor_id: &CorrelationId, metadata: &Metadata) -> bool {
    metadata
        .get("cursor_id")
        .and_then(|id| id.as_str())
        .is_some_and(|id| own_cursor_id == id)
}

impl Iterator for Inspection {
    type Item = InspectedRow;

    fn next(&mut self) -> Option<InspectedRow> {
        for activity in self.rows.by_ref() {
            let decoded = match activity.query.as_deref().map(codec::decode) {
                Some(Ok(decoded)) => Some(decoded),
                Some(Err(DecodeError::MalformedJson(e))) => {
                    tracing::debug!(pid = activity.pid, error = %e, "Unreadable query tag");
                    None
                }
                Some(Err(DecodeError::NotFound)) | None => None,
            };

            let (app_metadata, query) = match decoded {
                Some((metadata, _)) if is_own(&self.own_cursor_id, &metadata) => {
                    tracing::debug!(pid = activity.pid, "Skipping own session activity query");
                    continue;
                }
                Some((metadata, query)) => (Some(metadata), Some(query)),
                None => (None, None),
            };

            return Some(InspectedRow {
                app_metadata,
                query,
                db_metadata: activity,
            });
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.rows.size_hint().1)
    }
}
