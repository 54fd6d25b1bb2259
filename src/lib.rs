//! # sea-orm-correlation
//!
//! Correlation tagging for SeaORM database operations.
//!
//! Every statement executed through a [`TaggedConnection`] or one of its
//! [`TaggedCursor`]s carries a SQL comment holding the ids of the cursor, the
//! connection, the issuing process and the web request or background job it
//! ran for. The database exposes that text in `pg_stat_activity`, and
//! [`QueryInspector`] reads it back, so a slow or stuck statement on the server
//! can be traced to the request that sent it.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sea_orm_correlation::prelude::*;
//!
//! let conn = TaggedConnection::connect(&ConnectConfig::from_env()?).await?;
//!
//! // One cursor per request, carrying that request's id
//! let cursor = conn.cursor_with_context(CorrelationContext::web(request_id));
//! let users = Users::find().all(&cursor).await?;
//!
//! // Elsewhere: who is running what right now?
//! for row in QueryInspector::new(&conn).inspect().await? {
//!     println!("{:?} {:?}", row.app_metadata, row.query);
//! }
//! ```
//!
//! ## Wire Format
//!
//! ```text
//! select * from t;  /* __META_START:{"cursor_id": "abc", "context_type": "WEB"}:META_END__ */
//! ```
//!
//! | Key | Description |
//! |-----|-------------|
//! | `cursor_id` | Id of the cursor that ran the statement |
//! | `connection_id` | Id of the connection that created the cursor |
//! | `client_pid` | OS process id of the client |
//! | `os_user` | OS user of the client |
//! | `web_request_id` | Current web request, or `null` |
//! | `job_id` | Current background job, or `null` |
//! | `context_type` | `WEB`, `JOB` or `INTERACTIVE` |

pub mod codec;
mod config;
mod connection;
mod context;
mod cursor;
mod error;
mod id;
mod inspect;

pub use codec::{DecodeError, Metadata};
pub use config::{
    ConfigError, ConnectConfig, ConnectionRegistry, ConnectionRegistryBuilder, TaggingConfig,
};
pub use connection::{TaggedConnection, TaggingExt};
pub use context::{ContextProvider, ContextType, CorrelationContext, CONTEXT_TYPE_ENV};
pub use cursor::{QueryMetadata, TaggedCursor};
pub use error::Error;
pub use id::CorrelationId;
pub use inspect::{InspectedRow, Inspection, QueryInspector, SessionActivity, ACTIVITY_QUERY};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        ConnectConfig, ContextProvider, ContextType, CorrelationContext, CorrelationId,
        QueryInspector, TaggedConnection, TaggedCursor, TaggingConfig, TaggingExt,
    };
}
