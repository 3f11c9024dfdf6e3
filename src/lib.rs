//! # lightbox
//!
//! Watches a folder of images and drives each new file through an
//! analyze -> convert -> publish pipeline against a remote gallery,
//! under multi-window rate limits, bounded concurrency, and a bounded
//! retry policy.
//!
//! The decision-making core is the state store (compare-and-transition
//! lifecycle records), the admission controller, the retry policy, the
//! dispatcher, and the orchestrator loop. Everything that touches the
//! outside world — discovery, captioning, re-encoding, uploading, file
//! moves, notifications — sits behind the traits in [`clients`].

pub mod alerts;
pub mod clients;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod limiter;
pub mod model;
pub mod orchestrator;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod watch;
