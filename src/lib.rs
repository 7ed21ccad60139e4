//! Larder - Incremental Artifact Cache
//!
//! Embeds a build-system-style cache in applications: caches declare their
//! inputs at runtime, artifacts are stored content-addressed on disk, and
//! stale caches refresh automatically on a prioritized worker pool.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod goal;
pub mod hub;
pub mod identity;
pub mod ledger;
pub mod reactive;
mod scheduler;
mod stability;
pub mod store;
mod trigger;

pub use config::DepotConfig;
pub use context::{LinkContext, SupplyContext};
pub use engine::{CacheDefinition, CacheHandle};
pub use error::{LarderError, LarderResult};
pub use goal::Goal;
pub use hub::Depot;
pub use identity::{CacheIdentity, CachePolicy, RefreshMode};
pub use ledger::{FrozenLedger, InputLedger};
pub use store::{Artifact, Snapshot};
