//! Persistence orchestration for one blackboard agent.
//!
//! [`PersistenceEngine`] gathers what its registered clients changed, writes
//! it as a numbered delta to one of its storage media, and on startup
//! replays the newest consistent set of deltas to rebuild the working set.
//!
//! Every few deltas a full delta replaces the chain on a medium; the chain it
//! supersedes is deleted and its first delta is kept as an archive. With
//! several media the engine persists at their combined frequency and moves
//! to another medium whenever it starts a new full delta.
//!
//! # Modules
//!
//! - [`engine`] -- persist, rehydrate, and media controls
//! - [`client`] -- the [`PersistenceClient`] contract and envelopes
//! - [`config`] -- [`PersistenceConfig`], loaded from TOML
//! - [`schedule`] -- per-medium persistence times
//! - [`rehydration`] -- candidate sets and their replay order
//! - [`protection`] -- optional encryption hook
//! - [`control`] -- runtime control names and ranges
//! - [`metrics`] -- per-persist metrics

pub mod client;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod protection;
pub mod rehydration;
pub mod schedule;

pub use client::{Action, Envelope, EnvelopeTuple, PersistenceClient, PersistenceItem, RehydrationData};
pub use config::{
    PersistenceConfig, DRIFT_THRESHOLD, DUMMY_MEDIUM_NAME, MAX_CONSOLIDATION_PERIOD, MAX_PERSISTENCE_INTERVAL,
    MIN_CONSOLIDATION_PERIOD, MIN_PERSISTENCE_INTERVAL,
};
pub use control::{
    control_range, ControlRange, CONTROL_ARCHIVE_COUNT, CONTROL_CONSOLIDATION_PERIOD, CONTROL_INTERVAL,
    MEDIA_CONTROLS,
};
pub use engine::{PersistenceEngine, PersistenceSnapshot};
pub use error::{PersistError, Result};
pub use metrics::{MetricsSnapshot, MetricsTotals, PersistenceMetric, PersistenceMetrics, MAX_RECENT_METRICS};
pub use protection::{DataProtection, KeyEnvelope};
pub use rehydration::{sort_for_replay, RehydrationSet};
pub use schedule::MediumSlot;
