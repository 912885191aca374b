//! Producer-facing admission: validates send requests and places them on
//! the delivery queue, and answers queue status and dead-letter operations.

#![warn(clippy::unwrap_used)]

pub mod service;
pub mod validation;

pub use service::QueueAdmissionService;
