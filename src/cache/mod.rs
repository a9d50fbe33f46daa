//! HTTP caching gateway.
//!
//! [`HttpCache`] sits between clients and an [`Origin`] and applies the shared
//! cache rules of RFC 9111:
//!
//! - fresh stored responses are served without contacting the origin
//! - stale ones are revalidated with conditional requests, behind a per-key
//!   lock so that concurrent requests do not all hit the origin
//! - unsafe methods expire what is stored for their URI
//! - optional [`Esi`] processing assembles pages from cached fragments
//!
//! Responses live in a [`Store`] on disk: variant metadata per URI plus
//! content-addressed bodies shared between variants.

pub mod error;
pub mod esi;
pub mod gateway;
pub mod options;
pub mod origin;
pub mod store;
pub mod trace;

pub use error::{CacheError, StoreError};
pub use esi::Esi;
pub use gateway::{HttpCache, TRACE_HEADER};
pub use options::CacheOptions;
pub use origin::{Origin, OriginError, UpstreamOrigin};
pub use store::{Lock, Store};
pub use trace::Trace;
