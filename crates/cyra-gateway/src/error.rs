//! Error type for gateway assembly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid plan catalog: {0}")]
  Catalog(#[from] cyra_core::error::CatalogError),

  #[error("failed to build HTTP client: {0}")]
  Http(#[from] reqwest::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
