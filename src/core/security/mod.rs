#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Node identity and key-at-rest protection.

pub mod identity;
