//! Tagged database connection wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use sea_orm::{
    ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr, ExecResult, QueryResult,
    QueryStream, Statement, StreamTrait,
};

use crate::config::{ConnectConfig, TaggingConfig};
use crate::context::{ContextProvider, CorrelationContext};
use crate::cursor::TaggedCursor;
use crate::error::Error;
use crate::id::CorrelationId;

/// A tagging wrapper around SeaORM's `DatabaseConnection`.
///
/// The connection carries its own correlation id and hands out
/// [`TaggedCursor`]s that stamp it into every statement they run. It also
/// implements `ConnectionTrait` and `StreamTrait` itself, running each
/// statement through a fresh cursor, so it can be passed anywhere SeaORM expects a connection.
///
/// Ambient ids come from the [`ContextProvider`] given with
/// [`with_context`](Self::with_context); without one the connection reports
/// an idle interactive context.
///
/// # Example
///
/// ```rust,ignore
/// use sea_orm_correlation::{ConnectConfig, CorrelationContext, TaggedConnection};
///
/// let conn = TaggedConnection::connect(&ConnectConfig::from_env()?).await?;
///
/// // inside a request handler
/// let cursor = conn.cursor_with_context(CorrelationContext::web(request_id));
/// let users = Users::find().all(&cursor).await?;
///
/// conn.close().await?;
/// ```
///
/// Like the driver connection underneath, a tagged connection serves one
/// caller at a time.
#[derive(Debug)]
pub struct TaggedConnection {
    inner: DatabaseConnection,
    config: Arc<TaggingConfig>,
    context: Arc<dyn ContextProvider>,
    id: OnceCell<CorrelationId>,
}

impl TaggedConnection {
    /// Create a new tagged connection with the given configuration.
    pub fn new(connection: DatabaseConnection, config: TaggingConfig) -> Self {
        Self {
            inner: connection,
            config: Arc::new(config),
            context: Arc::new(CorrelationContext::interactive()),
            id: OnceCell::new(),
        }
    }

    /// Create a new tagged connection with default configuration.
    pub fn wrap(connection: DatabaseConnection) -> Self {
        Self::new(connection, TaggingConfig::default())
    }

    /// Open a single-session connection described by `config`.
    pub async fn connect(config: &ConnectConfig) -> Result<Self, Error> {
        Self::connect_with(
            config,
            TaggingConfig::default(),
            Arc::new(CorrelationContext::interactive()),
        )
        .await
    }

    /// Open a connection with explicit tagging settings and context provider.
    ///
    /// Driver failures (authentication, unreachable host, ...) come back as
    /// [`Error::Db`] carrying the driver's error unchanged.
    pub async fn connect_with(
        config: &ConnectConfig,
        tagging: TaggingConfig,
        context: Arc<dyn ContextProvider>,
    ) -> Result<Self, Error> {
        let options = config.connect_options()?;
        tracing::debug!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            "Opening tagged connection"
        );
        let inner = Database::connect(options).await?;

        let connection = Self {
            inner,
            config: Arc::new(tagging),
            context,
            id: OnceCell::new(),
        };
        tracing::info!(
            connection_id = %connection.id(),
            database = %config.database,
            "Tagged connection established"
        );
        Ok(connection)
    }

    /// Replace the context provider used by cursors created from now on.
    pub fn with_context(mut self, provider: impl ContextProvider + 'static) -> Self {
        self.context = Arc::new(provider);
        self
    }

    /// This connection's id, minted on first access.
    pub fn id(&self) -> &CorrelationId {
        self.id.get_or_init(CorrelationId::new)
    }

    /// New cursor reporting this connection's context provider.
    pub fn cursor(&self) -> TaggedCursor<'_> {
        TaggedCursor::new(
            &self.inner,
            &self.config,
            self.id().clone(),
            Arc::clone(&self.context),
        )
    }

    /// New cursor reporting `provider` instead of the connection's default.
    pub fn cursor_with_context(
        &self,
        provider: impl ContextProvider + 'static,
    ) -> TaggedCursor<'_> {
        TaggedCursor::new(&self.inner, &self.config, self.id().clone(), Arc::new(provider))
    }

    /// Get a reference to the underlying `DatabaseConnection`.
    ///
    /// Statements issued on it directly are not tagged.
    pub fn inner(&self) -> &DatabaseConnection {
        &self.inner
    }

    pub fn config(&self) -> &TaggingConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<dyn ContextProvider> {
        &self.context
    }

    /// Consume the wrapper and return the inner `DatabaseConnection`.
    pub fn into_inner(self) -> DatabaseConnection {
        self.inner
    }

    /// Close the server session.
    ///
    /// Dropping the connection also releases it; `close` reports failures.
    pub async fn close(self) -> Result<(), DbErr> {
        let id = self.id().clone();
        self.inner.close().await?;
        tracing::debug!(connection_id = %id, "Tagged connection closed");
        Ok(())
    }
}

impl From<DatabaseConnection> for TaggedConnection {
    fn from(connection: DatabaseConnection) -> Self {
        Self::wrap(connection)
    }
}

impl AsRef<DatabaseConnection> for TaggedConnection {
    fn as_ref(&self) -> &DatabaseConnection {
        &self.inner
    }
}

#[async_trait]
impl ConnectionTrait for TaggedConnection {
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        self.cursor().execute(stmt).await
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        self.cursor().execute_unprepared(sql).await
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        self.cursor().query_one(stmt).await
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        self.cursor().query_all(stmt).await
    }

    fn support_returning(&self) -> bool {
        self.inner.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.inner.is_mock_connection()
    }
}

impl StreamTrait for TaggedConnection {
    type Stream<'a> = QueryStream;

    fn stream<'a>(
        &'a self,
        stmt: Statement,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Stream<'a>, DbErr>> + 'a + Send>> {
        Box::pin(async move { self.cursor().open_stream(stmt).await })
    }
}

/// Extension trait for easy wrapping of database connections.
pub trait TaggingExt {
    /// Wrap this connection with statement tagging.
    fn with_tagging(self) -> TaggedConnection;

    /// Wrap this connection with custom tagging configuration.
    fn with_tagging_config(self, config: TaggingConfig) -> TaggedConnection;
}

impl TaggingExt for DatabaseConnection {
    fn with_tagging(self) -> TaggedConnection {
        TaggedConnection::wrap(self)
    }

    fn with_tagging_config(self, config: TaggingConfig) -> TaggedConnection {
        TaggedConnection::new(self, config)
    }
}
