//! The Link-Layer Support resolver (spec.md §4.3-§4.4): the aging
//! resolution cache and the single-threaded worker loop that drives it.

pub mod cache;
pub mod worker;

pub use cache::{HoldResult, HoldStatus, Source};
pub use worker::{IfaceTag, LlsCommand, LlsWorker};
