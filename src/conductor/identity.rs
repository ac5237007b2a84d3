//! Nonce-qualified identities
//!
//! Every entity a run creates on the conductor is named `logical-nonce` on the
//! wire so that repeated runs inside one long-lived process never collide. The
//! pairing is computed in exactly one place ([`qualify`]) and resolved back
//! through an [`IdentityTable`] rather than by splitting strings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Per-conductor run counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Nonce(u64);

impl Nonce {
    /// Create a nonce starting at `value`
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw counter value
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The nonce of the following run
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical id paired with the nonce of the run that created it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedId {
    logical: String,
    nonce: Nonce,
}

impl QualifiedId {
    /// Logical (author-facing) id
    pub fn logical(&self) -> &str {
        &self.logical
    }

    /// Nonce of the creating run
    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    /// Id as sent on the wire
    pub fn wire(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for QualifiedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.logical, self.nonce)
    }
}

/// Pair a logical id with a nonce
pub fn qualify(logical: &str, nonce: Nonce) -> QualifiedId {
    QualifiedId {
        logical: logical.to_string(),
        nonce,
    }
}

/// Uniqueness token sent as a DNA's `uuid` so each install gets its own identity
///
/// An explicit salt is kept and suffixed; without one the nonce alone is used.
pub fn uniqueness_token(salt: Option<&str>, nonce: Nonce) -> String {
    match salt.map(str::trim).filter(|salt| !salt.is_empty()) {
        Some(salt) => format!("{salt}-{nonce}"),
        None => nonce.to_string(),
    }
}

/// Bidirectional lookup between logical ids and the wire ids issued for them
///
/// Wire ids are never forgotten: a late signal from an earlier run still maps
/// back to its logical instance.
#[derive(Debug, Clone, Default)]
pub struct IdentityTable {
    by_wire: HashMap<String, QualifiedId>,
    current: HashMap<String, QualifiedId>,
}

impl IdentityTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` as the current wire identity of its logical id
    pub fn register(&mut self, id: &QualifiedId) {
        self.by_wire.insert(id.wire(), id.clone());
        self.current.insert(id.logical.clone(), id.clone());
    }

    /// Logical id a wire id was issued for
    pub fn logical_of(&self, wire: &str) -> Option<&str> {
        self.by_wire.get(wire).map(QualifiedId::logical)
    }

    /// True if `wire` is the latest identity of its logical id
    pub fn is_current(&self, wire: &str) -> bool {
        self.by_wire
            .get(wire)
            .and_then(|id| self.current.get(&id.logical))
            .is_some_and(|current| current.wire() == wire)
    }

    /// Number of wire ids ever issued
    pub fn len(&self) -> usize {
        self.by_wire.len()
    }

    /// True if nothing has been registered
    pub fn is_empty(&self) -> bool {
        self.by_wire.is_empty()
    }
}
