#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Observability: Prometheus metrics registration.

pub mod metrics;
