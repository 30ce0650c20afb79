//! Core domain types and traits for the assetforge job orchestrator.
//!
//! This crate contains:
//! - Job identifiers and the job lifecycle state machine
//! - Generation and style-pack training payloads
//! - The `GenerationProvider` trait implemented by backend adapters
//! - Progress events, broadcast topics and live-channel messages
//! - Submission validation

pub mod error;
pub mod event;
pub mod generation;
pub mod id;
pub mod job;
pub mod provider;
pub mod validation;

pub use error::{Error, Result};
pub use id::{ConnectionId, JobId};
