//! Input ledger: per-refresh record of declared dependencies and parameters
//!
//! Every linking pass records into a fresh [`InputLedger`]: scalar parameters
//! (memoized and stringified at record time) and dependency caches together
//! with the snapshot hash observed for each. Freezing produces a
//! [`FrozenLedger`] with a canonical fingerprint; a frozen ledger never
//! changes again, even if the dependencies it observed do. Staleness is
//! detected by re-linking and comparing fingerprints, never by mutating old
//! ledgers.
//!
//! Recording the same key twice with a different value is a signal, not an
//! error: the ledger keeps the first value and raises its inconsistency flag.

use std::collections::BTreeMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::identity::CacheIdentity;

/// Observed snapshot hash of one dependency (`None` = dependency was empty)
pub type DependencyHash = Option<String>;

/// Mutable ledger, recording until frozen
#[derive(Debug, Default)]
pub struct InputLedger {
    parameters: BTreeMap<String, String>,
    dependencies: BTreeMap<CacheIdentity, DependencyHash>,
    inconsistent: bool,
}

impl InputLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a parameter, computing its value at most once per ledger.
    ///
    /// The first call for a key invokes the supplier and memoizes the
    /// stringified value; later calls return the memoized value without
    /// re-invoking the supplier.
    pub fn parameter<F>(&mut self, key: &str, supplier: F) -> String
    where
        F: FnOnce() -> String,
    {
        if let Some(value) = self.parameters.get(key) {
            return value.clone();
        }
        let value = supplier();
        self.parameters.insert(key.to_string(), value.clone());
        value
    }

    /// Record a parameter with an explicit value.
    ///
    /// A differing value for an already-recorded key taints the ledger
    /// instead of failing; the first value wins.
    pub fn record_parameter(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string();
        match self.parameters.get(key) {
            None => {
                self.parameters.insert(key.to_string(), value);
            }
            Some(existing) if *existing != value => self.taint(),
            Some(_) => {}
        }
    }

    /// Record a dependency and the snapshot hash observed for it.
    ///
    /// Re-recording with a differing hash taints the ledger; the first
    /// observation wins.
    pub fn record_dependency(&mut self, identity: CacheIdentity, hash: DependencyHash) {
        match self.dependencies.get(&identity) {
            None => {
                self.dependencies.insert(identity, hash);
            }
            Some(existing) if *existing != hash => self.taint(),
            Some(_) => {}
        }
    }

    /// Flag the ledger as inconsistent
    pub fn taint(&mut self) {
        self.inconsistent = true;
    }

    /// Whether conflicting values were recorded
    pub fn inconsistent(&self) -> bool {
        self.inconsistent
    }

    /// Dependencies recorded so far
    pub fn dependencies(&self) -> &BTreeMap<CacheIdentity, DependencyHash> {
        &self.dependencies
    }

    /// Whether any recorded dependency was empty at record time
    pub fn has_empty_dependency(&self) -> bool {
        self.dependencies.values().any(Option::is_none)
    }

    /// Freeze the ledger, computing the canonical fingerprint
    pub fn freeze(self) -> FrozenLedger {
        let fingerprint = fingerprint_of(&self);
        FrozenLedger {
            parameters: self.parameters,
            dependencies: self.dependencies,
            inconsistent: self.inconsistent,
            fingerprint,
        }
    }
}

/// Immutable ledger with a precomputed canonical fingerprint
#[derive(Debug)]
pub struct FrozenLedger {
    parameters: BTreeMap<String, String>,
    dependencies: BTreeMap<CacheIdentity, DependencyHash>,
    inconsistent: bool,
    fingerprint: String,
}

impl FrozenLedger {
    /// Frozen ledger of a cache with no inputs at all
    pub fn empty() -> Arc<Self> {
        Arc::new(InputLedger::new().freeze())
    }

    /// Canonical fingerprint of all recorded inputs
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Recorded dependencies and their observed hashes
    pub fn dependencies(&self) -> &BTreeMap<CacheIdentity, DependencyHash> {
        &self.dependencies
    }

    /// Memoized value of a declared parameter
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Observed hash of a declared dependency.
    ///
    /// Outer `None` means the dependency was never declared; inner `None`
    /// means it was declared but empty.
    pub fn dependency(&self, identity: &CacheIdentity) -> Option<&DependencyHash> {
        self.dependencies.get(identity)
    }

    /// Whether conflicting values were recorded before freezing
    pub fn inconsistent(&self) -> bool {
        self.inconsistent
    }
}

/// Canonical, sort-ordered serialization of ledger contents.
///
/// `BTreeMap` iteration makes the ordering independent of record order, which
/// is what makes the fingerprint order-independent.
fn canonical_text(ledger: &InputLedger) -> String {
    let mut text = String::new();
    if ledger.inconsistent {
        text.push_str("[inconsistent]\n");
    }
    for (key, value) in &ledger.parameters {
        text.push_str(key);
        text.push('=');
        text.push_str(value);
        text.push('\n');
    }
    for (identity, hash) in &ledger.dependencies {
        text.push_str(&identity.qualified());
        text.push('=');
        text.push_str(hash.as_deref().unwrap_or("empty"));
        text.push('\n');
    }
    text
}

fn fingerprint_of(ledger: &InputLedger) -> String {
    let digest = Sha256::digest(canonical_text(ledger).as_bytes());
    hex::encode(digest)
}
