//! Persistent [`CatalogSink`](crate::catalog::CatalogSink) implementations.

#[cfg(feature = "csv")]
pub mod csv;
