#![allow(
    clippy::module_name_repetitions,
    clippy::cast_sign_loss,
    rustdoc::broken_intra_doc_links
)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![deny(unused_must_use)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! A time-scheduled FX execution engine that drives a broker's OpenAPI from a
//! pre-declared plan of trades: OAuth session keeping, market entries with
//! attached stop-loss/take-profit brackets, fill confirmation over the ENS
//! streaming channel (with a REST audit fallback), timed exits, and
//! crash-safe per-day recovery.
//!
//! To run a plan end to end, refer to [`crate::engine::Engine`].
//!
//! To use the REST broker client on its own, refer to [`crate::rest`].

pub mod config;
#[cfg(all(feature = "rest", feature = "streaming"))]
pub mod engine;
#[cfg(all(feature = "rest", feature = "streaming"))]
pub mod ens;
pub mod error;
pub mod notify;
pub mod prelude;
#[cfg(feature = "rest")]
pub mod rest;
pub mod scheduler;
pub mod state;
pub mod trade;
#[cfg(all(feature = "rest", feature = "streaming"))]
pub mod waiters;
