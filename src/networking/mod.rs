#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Networking: the bounded on-disk peer book consulted by gossip fanout and
//! the admin peer-management routes.

pub mod peer_book;
