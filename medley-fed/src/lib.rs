//! # medley-fed
//!
//! Federated music search: one query fans out to many independent sources,
//! each behind the [`Engine`] contract, under a shared rate limiter and
//! response cache. Per-source results are normalized and then reconciled
//! into ranked canonical entities within a hard latency deadline.
//!
//! Pipeline: [`Dispatcher`] → cache → [`RateLimiter`] → engines →
//! [`Normalizer`] → [`Reconciler`] → [`AggregateResponse`].

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod engines;
pub mod error;
pub mod normalize;
pub mod ratelimit;
pub mod reconcile;
pub mod store;
pub mod types;

pub use cache::ResponseCache;
pub use config::FederationConfig;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use engine::{Engine, Registry};
pub use error::{LimiterError, RegistryError, SearchError, StoreError};
pub use normalize::Normalizer;
pub use ratelimit::RateLimiter;
pub use reconcile::Reconciler;
pub use store::SharedStore;
pub use types::*;
