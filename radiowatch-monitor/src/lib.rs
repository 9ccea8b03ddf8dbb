//! Radiowatch Monitor
//!
//! Radio airplay detection pipeline. For every active station, each polling
//! cycle fetches a bounded stream sample, classifies it as music or not,
//! identifies the track through a cascade of recognition sources, folds the
//! result into the station's play session, and aggregates finalized plays
//! into per-entity statistics and time-bucket rollups.

pub mod analysis;
pub mod config;
pub mod db;
pub mod fetch;
pub mod orchestrator;
pub mod recognition;
pub mod session;
pub mod stats;

pub use config::MonitorConfig;
pub use orchestrator::StationOrchestrator;
