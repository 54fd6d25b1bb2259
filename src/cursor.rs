//! Tagged cursor: rewrites every statement before it reaches the driver.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use once_cell::sync::{Lazy, OnceCell};
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DbBackend, DbErr, ExecResult, QueryResult, QueryStream,
    Statement, StreamTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{field, Instrument, Span};

use crate::codec::{self, Metadata};
use crate::config::TaggingConfig;
use crate::context::{ContextProvider, ContextType};
use crate::id::CorrelationId;

/// OS user of this process.
static OS_USER: Lazy<String> = Lazy::new(|| resolve_os_user(|name| std::env::var(name).ok()));

/// First non-empty login variable, then the account of the process uid, then
/// `"unknown"`.
fn resolve_os_user(env: impl Fn(&str) -> Option<String>) -> String {
    ["LOGNAME", "USER", "LNAME", "USERNAME"]
        .into_iter()
        .filter_map(|name| env(name))
        .find(|value| !value.is_empty())
        .or_else(|| whoami::fallible::username().ok())
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Metadata attached to every statement a [`TaggedCursor`] executes.
///
/// Serializes with the keys `cursor_id`, `connection_id`, `client_pid`,
/// `os_user`, `web_request_id`, `job_id` and `context_type`; absent ambient
/// ids are emitted as `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub cursor_id: CorrelationId,
    pub connection_id: CorrelationId,
    pub client_pid: u32,
    pub os_user: String,
    pub web_request_id: Option<CorrelationId>,
    pub job_id: Option<CorrelationId>,
    pub context_type: ContextType,
}

impl QueryMetadata {
    /// Interpret decoded metadata as emitted by a tagged cursor.
    ///
    /// Fails for tags written by other tools or older formats.
    pub fn from_metadata(metadata: &Metadata) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(metadata.clone()))
    }
}

/// A statement executor bound to one [`TaggedConnection`](crate::TaggedConnection).
///
/// Every statement run through the cursor's [`ConnectionTrait`] methods carries
/// a metadata comment naming this cursor, its connection, the issuing process
/// and whatever request or job the context provider reports at execution time.
/// Parameters are forwarded untouched and driver errors are returned as-is.
///
/// A cursor, like the connection it borrows, is meant for one task at a time.
#[derive(Debug)]
pub struct TaggedCursor<'c> {
    inner: &'c DatabaseConnection,
    config: &'c TaggingConfig,
    connection_id: CorrelationId,
    context: Arc<dyn ContextProvider>,
    id: OnceCell<CorrelationId>,
}

impl<'c> TaggedCursor<'c> {
    pub(crate) fn new(
        inner: &'c DatabaseConnection,
        config: &'c TaggingConfig,
        connection_id: CorrelationId,
        context: Arc<dyn ContextProvider>,
    ) -> Self {
        Self {
            inner,
            config,
            connection_id,
            context,
            id: OnceCell::new(),
        }
    }

    /// This cursor's id, minted on first access.
    pub fn id(&self) -> &CorrelationId {
        self.id.get_or_init(CorrelationId::new)
    }

    #[cfg(test)]
    pub(crate) fn with_id(self, id: CorrelationId) -> Self {
        let _ = self.id.set(id);
        self
    }

    /// Id of the connection that created this cursor.
    pub fn connection_id(&self) -> &CorrelationId {
        &self.connection_id
    }

    /// Metadata for a statement executed right now.
    pub fn metadata(&self) -> QueryMetadata {
        QueryMetadata {
            cursor_id: self.id().clone(),
            connection_id: self.connection_id.clone(),
            client_pid: std::process::id(),
            os_user: OS_USER.clone(),
            web_request_id: self.context.current_web_request_id(),
            job_id: self.context.current_job_id(),
            context_type: self.context.current_context_type(),
        }
    }

    /// The text this cursor would send for `sql`.
    pub fn tag(&self, sql: &str) -> Result<String, DbErr> {
        encode(sql, &self.metadata())
    }

    /// Tag `sql` and open the span the statement runs in.
    fn prepare(&self, sql: &str) -> Result<(String, Span), DbErr> {
        let metadata = self.metadata();
        let tagged = encode(sql, &metadata)?;
        let span = self.create_span(&metadata, &tagged);
        Ok((tagged, span))
    }

    /// Tag `stmt` and open a row stream on the underlying connection.
    pub(crate) async fn open_stream(&self, mut stmt: Statement) -> Result<QueryStream, DbErr> {
        let (tagged, span) = self.prepare(&stmt.sql)?;
        stmt.sql = tagged;
        let start = Instant::now();

        let result = self.inner.stream(stmt).instrument(span.clone()).await;

        // Rows are not counted for streams.
        self.record_result(&span, &result, start, None);

        result
    }

    fn create_span(&self, metadata: &QueryMetadata, tagged: &str) -> Span {
        let span = tracing::info_span!(
            "db.query",
            db.system = %db_system(self.inner.get_database_backend()),
            db.cursor_id = %metadata.cursor_id,
            db.connection_id = %metadata.connection_id,
            correlation.context_type = %metadata.context_type,
            correlation.web_request_id = field::Empty,
            correlation.job_id = field::Empty,
            db.statement = field::Empty,
            db.rows_affected = field::Empty,
            db.duration_ms = field::Empty,
            otel.status_code = field::Empty,
            error.message = field::Empty,
            slow_query = field::Empty,
        );

        if let Some(id) = &metadata.web_request_id {
            span.record("correlation.web_request_id", id.as_str());
        }
        if let Some(id) = &metadata.job_id {
            span.record("correlation.job_id", id.as_str());
        }
        if self.config.log_statements {
            span.record("db.statement", tagged);
        }

        span
    }

    fn record_result<T, E: std::fmt::Display>(
        &self,
        span: &Span,
        result: &Result<T, E>,
        start: Instant,
        row_count: Option<u64>,
    ) {
        let elapsed = start.elapsed();
        let duration_ms = elapsed.as_millis() as i64;
        span.record("db.duration_ms", duration_ms);

        if let Some(count) = row_count {
            span.record("db.rows_affected", count);
        }

        if elapsed > self.config.slow_query_threshold {
            span.record("slow_query", true);
            tracing::warn!(
                parent: span,
                duration_ms = duration_ms,
                threshold_ms = self.config.slow_query_threshold.as_millis() as i64,
                "Slow query detected"
            );
        }

        match result {
            Ok(_) => {
                span.record("otel.status_code", "OK");
            }
            Err(e) => {
                span.record("otel.status_code", "ERROR");
                span.record("error.message", e.to_string().as_str());
                tracing::error!(parent: span, error = %e, "Database query failed");
            }
        }
    }
}

fn encode(sql: &str, metadata: &QueryMetadata) -> Result<String, DbErr> {
    codec::encode(sql, metadata)
        .map_err(|e| DbErr::Custom(format!("failed to tag statement: {e}")))
}

fn db_system(backend: DbBackend) -> &'static str {
    match backend {
        DbBackend::Postgres => "postgresql",
        DbBackend::MySql => "mysql",
        DbBackend::Sqlite => "sqlite",
    }
}

#[async_trait]
impl<'c> ConnectionTrait for TaggedCursor<'c> {
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, mut stmt: Statement) -> Result<ExecResult, DbErr> {
        let (tagged, span) = self.prepare(&stmt.sql)?;
        stmt.sql = tagged;
        let start = Instant::now();

        let result = self.inner.execute(stmt).instrument(span.clone()).await;

        let row_count = result.as_ref().ok().map(|r| r.rows_affected());
        self.record_result(&span, &result, start, row_count);

        result
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        let (tagged, span) = self.prepare(sql)?;
        let start = Instant::now();

        let result = self
            .inner
            .execute_unprepared(&tagged)
            .instrument(span.clone())
            .await;

        let row_count = result.as_ref().ok().map(|r| r.rows_affected());
        self.record_result(&span, &result, start, row_count);

        result
    }

    async fn query_one(&self, mut stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        let (tagged, span) = self.prepare(&stmt.sql)?;
        stmt.sql = tagged;
        let start = Instant::now();

        let result = self.inner.query_one(stmt).instrument(span.clone()).await;

        let row_count = result.as_ref().ok().map(|row| u64::from(row.is_some()));
        self.record_result(&span, &result, start, row_count);

        result
    }

    async fn query_all(&self, mut stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        let (tagged, span) = self.prepare(&stmt.sql)?;
        stmt.sql = tagged;
        let start = Instant::now();

        let result = self.inner.query_all(stmt).instrument(span.clone()).await;

        let row_count = result.as_ref().ok().map(|rows| rows.len() as u64);
        self.record_result(&span, &result, start, row_count);

        result
    }

    fn support_returning(&self) -> bool {
        self.inner.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.inner.is_mock_connection()
    }
}

impl<'c> StreamTrait for TaggedCursor<'c> {
    type Stream<'a> = QueryStream
    where
        Self: 'a;

    fn stream<'a>(
        &'a self,
        stmt: Statement,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Stream<'a>, DbErr>> + 'a + Send>> {
        Box::pin(self.open_stream(stmt))
    }
}
