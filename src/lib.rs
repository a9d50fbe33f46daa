//! # rttp-gateway
//!
//! An async HTTP/1.1 caching gateway built on Tokio.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rttp_gateway::cache::{CacheOptions, Esi, HttpCache, Store, UpstreamOrigin};
//! use rttp_gateway::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Store::open("/var/cache/rttp").await?;
//!     let cache = HttpCache::new(
//!         UpstreamOrigin::new("127.0.0.1:3000"),
//!         store,
//!         CacheOptions::from_json(r#"{"default_ttl": 30}"#)?,
//!     )
//!     .with_esi(Esi::default());
//!     let cache = Arc::new(cache);
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server
//!         .run(move |req| {
//!             let cache = Arc::clone(&cache);
//!             async move { cache.respond(req).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

// ── Protocol and transport ────────────────────────────────────────────────────
pub mod http;
pub mod server;

// ── Caching gateway ───────────────────────────────────────────────────────────
pub mod cache;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheError, CacheOptions, HttpCache, Store};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};
