// Copyright (c) 2026 Myco
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]

//! Fixed-capacity byte strings used everywhere a record field must stay on the
//! stack: no heap allocation to hold a name, an address, or an artifact URI.

use std::fmt;
use std::str;

use serde::de::{Error as DeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors constructing a [`BoundedString`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BoundedStringError {
    /// Input exceeds the fixed capacity `N`.
    #[error("value exceeds capacity")]
    TooLong,
    /// Input is not valid UTF-8.
    #[error("value is not valid utf-8")]
    NotUtf8,
}

/// A UTF-8 string stored in a fixed `N`-byte buffer, null-padded.
///
/// `N` must fit in a `u8` (capacity <= 255), which covers every bounded field
/// in the data model (names <= 64B, addresses <= 64B, artifact URIs <= 192B).
#[derive(Clone, Copy)]
pub struct BoundedString<const N: usize> {
    buf: [u8; N],
    len: u8,
}

impl<const N: usize> BoundedString<N> {
    /// Empty string.
    pub const fn empty() -> Self {
        Self { buf: [0u8; N], len: 0 }
    }

    /// Construct from a `&str`, rejecting anything over capacity.
    pub fn new(s: &str) -> Result<Self, BoundedStringError> {
        if s.len() > N || s.len() > u8::MAX as usize {
            return Err(BoundedStringError::TooLong);
        }
        let mut buf = [0u8; N];
        buf[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self { buf, len: s.len() as u8 })
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        // Invariant: only ever constructed from valid UTF-8 of length `len`.
        str::from_utf8(&self.buf[..self.len as usize]).unwrap_or("")
    }

    /// Borrow the occupied bytes (no padding).
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    /// Capacity in bytes.
    pub const fn capacity() -> usize {
        N
    }

    /// Occupied length in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<const N: usize> Default for BoundedString<N> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const N: usize> PartialEq for BoundedString<N> {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}
impl<const N: usize> Eq for BoundedString<N> {}

impl<const N: usize> PartialOrd for BoundedString<N> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<const N: usize> Ord for BoundedString<N> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}
impl<const N: usize> std::hash::Hash for BoundedString<N> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl<const N: usize> fmt::Debug for BoundedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}
impl<const N: usize> fmt::Display for BoundedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.as_str(), f)
    }
}

impl<const N: usize> TryFrom<&str> for BoundedString<N> {
    type Error = BoundedStringError;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl<const N: usize> Serialize for BoundedString<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

struct BoundedStringVisitor<const N: usize>;

impl<'de, const N: usize> Visitor<'de> for BoundedStringVisitor<N> {
    type Value = BoundedString<N>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a string of at most {N} bytes")
    }

    fn visit_str<E: DeError>(self, v: &str) -> Result<Self::Value, E> {
        BoundedString::new(v).map_err(|_| E::custom("string exceeds bounded capacity"))
    }
}

impl<'de, const N: usize> Deserialize<'de> for BoundedString<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(BoundedStringVisitor::<N>)
    }
}
