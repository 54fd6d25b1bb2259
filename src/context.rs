//! Ambient correlation context.
//!
//! The web and job frameworks own the notion of "the current request" and
//! "the current task". This module only describes what the tagging layer
//! reads from them. Providers are handed to connections and cursors
//! explicitly; nothing here looks up global or thread-local state.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::id::CorrelationId;

/// Environment variable consulted by [`ContextType::from_env`].
pub const CONTEXT_TYPE_ENV: &str = "CORRELATION_CONTEXT_TYPE";

/// Kind of process issuing queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContextType {
    /// A web server handling requests.
    Web,
    /// A background job worker.
    Job,
    /// A shell, script or anything else.
    #[default]
    Interactive,
}

impl ContextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Web => "WEB",
            ContextType::Job => "JOB",
            ContextType::Interactive => "INTERACTIVE",
        }
    }

    /// Read the process-wide context type from [`CONTEXT_TYPE_ENV`].
    ///
    /// Unset or empty means [`ContextType::Interactive`].
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONTEXT_TYPE_ENV) {
            Ok(value) if !value.trim().is_empty() => value.parse(),
            _ => Ok(ContextType::default()),
        }
    }
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "WEB" => Ok(ContextType::Web),
            "JOB" => Ok(ContextType::Job),
            "INTERACTIVE" => Ok(ContextType::Interactive),
            _ => Err(ConfigError::InvalidContextType(s.to_owned())),
        }
    }
}

/// Source of the ambient identifiers attached to every tagged statement.
///
/// Lookups are read-only and cheap; they run once per executed statement.
pub trait ContextProvider: fmt::Debug + Send + Sync {
    /// Id of the web request being served, if any.
    fn current_web_request_id(&self) -> Option<CorrelationId>;

    /// Id of the background job being run, if any.
    fn current_job_id(&self) -> Option<CorrelationId>;

    fn current_context_type(&self) -> ContextType;
}

impl<P: ContextProvider + ?Sized> ContextProvider for Arc<P> {
    fn current_web_request_id(&self) -> Option<CorrelationId> {
        (**self).current_web_request_id()
    }

    fn current_job_id(&self) -> Option<CorrelationId> {
        (**self).current_job_id()
    }

    fn current_context_type(&self) -> ContextType {
        (**self).current_context_type()
    }
}

/// A fixed snapshot of the ambient context.
///
/// Web handlers build one per request, job runners one per task:
///
/// ```rust
/// use sea_orm_correlation::{ContextProvider, ContextType, CorrelationContext};
///
/// let ctx = CorrelationContext::web("req-42");
/// assert_eq!(ctx.current_context_type(), ContextType::Web);
/// assert_eq!(ctx.current_web_request_id().unwrap().as_str(), "req-42");
/// assert!(ctx.current_job_id().is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationContext {
    pub context_type: ContextType,
    pub web_request_id: Option<CorrelationId>,
    pub job_id: Option<CorrelationId>,
}

impl CorrelationContext {
    /// No request or job in scope.
    pub fn interactive() -> Self {
        Self::default()
    }

    pub fn web(request_id: impl Into<CorrelationId>) -> Self {
        Self {
            context_type: ContextType::Web,
            web_request_id: Some(request_id.into()),
            job_id: None,
        }
    }

    pub fn job(job_id: impl Into<CorrelationId>) -> Self {
        Self {
            context_type: ContextType::Job,
            web_request_id: None,
            job_id: Some(job_id.into()),
        }
    }

    /// Context of the given type with no ids in scope, e.g. a web worker
    /// between requests.
    pub fn idle(context_type: ContextType) -> Self {
        Self {
            context_type,
            ..Self::default()
        }
    }

    /// Idle context for the type configured in the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        ContextType::from_env().map(Self::idle)
    }
}

impl ContextProvider for CorrelationContext {
    fn current_web_request_id(&self) -> Option<CorrelationId> {
        self.web_request_id.clone()
    }

    fn current_job_id(&self) -> Option<CorrelationId> {
        self.job_id.clone()
    }

    fn current_context_type(&self) -> ContextType {
        self.context_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_context_type() {
        assert_eq!("web".parse::<ContextType>().unwrap(), ContextType::Web);
        assert_eq!(" JOB ".parse::<ContextType>().unwrap(), ContextType::Job);
        assert_eq!(
            "Interactive".parse::<ContextType>().unwrap(),
            ContextType::Interactive
        );
        assert!(matches!(
            "celery".parse::<ContextType>(),
            Err(ConfigError::InvalidContextType(v)) if v == "celery"
        ));
    }

    #[test]
    fn test_context_type_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&ContextType::Web).unwrap(), "\"WEB\"");
        assert_eq!(ContextType::Interactive.to_string(), "INTERACTIVE");
    }

    #[test]
    fn test_job_context() {
        let ctx = CorrelationContext::job("task-7");
        assert_eq!(ctx.current_context_type(), ContextType::Job);
        assert_eq!(ctx.current_job_id(), Some(CorrelationId::from("task-7")));
        assert_eq!(ctx.current_web_request_id(), None);
    }

    #[test]
    fn test_idle_context_has_no_ids() {
        let ctx = CorrelationContext::idle(ContextType::Web);
        assert_eq!(ctx.current_context_type(), ContextType::Web);
        assert!(ctx.current_web_request_id().is_none());
        assert!(ctx.current_job_id().is_none());
    }

    #[test]
    fn test_arc_provider_delegates() {
        let shared: Arc<dyn ContextProvider> = Arc::new(CorrelationContext::web("r1"));
        assert_eq!(shared.current_context_type(), ContextType::Web);
        assert_eq!(shared.current_web_request_id().unwrap(), "r1");
    }

    // The only test touching CONTEXT_TYPE_ENV; all cases run in sequence here.
    #[test]
    fn test_context_type_from_env() {
        std::env::remove_var(CONTEXT_TYPE_ENV);
        assert_eq!(ContextType::from_env().unwrap(), ContextType::Interactive);

        std::env::set_var(CONTEXT_TYPE_ENV, "");
        assert_eq!(ContextType::from_env().unwrap(), ContextType::Interactive);

        std::env::set_var(CONTEXT_TYPE_ENV, "job");
        assert_eq!(ContextType::from_env().unwrap(), ContextType::Job);
        let ctx = CorrelationContext::from_env().unwrap();
        assert_eq!(ctx.current_context_type(), ContextType::Job);
        assert!(ctx.current_job_id().is_none());

        std::env::set_var(CONTEXT_TYPE_ENV, "cron");
        let result = ContextType::from_env();
        std::env::remove_var(CONTEXT_TYPE_ENV);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidContextType(value)) if value == "cron"
        ));
    }
}
