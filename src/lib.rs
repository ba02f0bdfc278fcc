//! Turnstile - Per-Client Request Admission Control
//!
//! This crate implements an in-process, fixed-window rate limiter that sits
//! in front of an HTTP-serving pipeline. For each inbound request it decides
//! whether to admit it or reject it with a retry delay, tracking per-client
//! usage in a concurrent in-memory store and evicting idle state with a
//! background reaper.
//!
//! The crate is deliberately single-process: counters live in local memory
//! and vanish on restart. Horizontally scaled deployments need a distributed
//! backing store shared by every replica; this crate does not provide one.

pub mod admission;
pub mod config;
pub mod error;

pub use admission::{AdmissionController, Decision, QuotaSnapshot, RejectionBody, RequestInfo};
pub use config::AdmissionConfig;
pub use error::{Result, TurnstileError};
