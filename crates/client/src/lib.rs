//! HTTP data source for quire.
//!
//! This crate provides a JSON-over-HTTP client whose failures are
//! classified into the engine's error taxonomy, and a [`Fetcher`](quire_core::Fetcher)
//! implementation that plugs it into cached queries.

pub mod fetch;

pub use fetch::{HttpClient, HttpFetcher, UrlError, canonicalize};
