//! Cluster-backed stories for the syncer
//!
//! - `sync_stories`: Services and EndpointSlices created, updated and
//!   cleaned up through the real API server with server-side apply
//! - `route_stories`: HTTPRoutes, which need the Gateway API CRDs installed
//!
//! ```bash
//! cargo test --test kind -- --ignored
//! cargo test --test kind route_stories -- --ignored --nocapture
//! ```

mod helpers;
mod route_stories;
mod sync_stories;
