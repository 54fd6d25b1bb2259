//! Crate-level error for operations that mix configuration and database work.
//!
//! Statement execution never uses this type: database failures surface as
//! SeaORM's [`DbErr`] exactly as the driver reported them.

use sea_orm::DbErr;

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbErr),
}
