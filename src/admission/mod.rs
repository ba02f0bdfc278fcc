//! Admission control logic and state management.

mod controller;
mod reaper;
mod request;
mod window;

pub use controller::{
    headers, AdmissionController, AdmissionControllerBuilder, Decision, QuotaSnapshot,
    RejectionBody,
};
pub use request::{default_key_extractor, KeyExtractor, RequestInfo, SkipPredicate, UNKNOWN_KEY};
pub use window::Window;
