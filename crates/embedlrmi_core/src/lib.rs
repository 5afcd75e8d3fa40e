//! LRMI metadata lookup for wiki pages: canonical URL rewriting, a TTL cache with
//! coalesced fetches over an HTTP repository search, and the hooks a wiki host calls.

pub mod config;
pub mod error;
pub mod gateway;
pub mod hooks;
pub mod migrate;
pub mod provider;
pub mod render;
pub mod resolver;
pub mod runtime;
pub mod sqlite_store;
pub mod store;

pub use error::{Error, Result};
