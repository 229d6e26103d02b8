#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Replicated state: the service catalog, its write-ahead log, and the
//! byte-level persistence helpers they share.

pub mod catalog;
pub mod wal;
