//! HTTP API for shelfmark-sd
//!
//! Pure reads over the reconciled catalog; no reconciliation or provider
//! calls happen on the request path.

pub mod health;
pub mod series;

pub use health::health_routes;
pub use series::series_routes;
