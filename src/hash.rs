//! Content fingerprints for templates.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 of a value's JSON serialization, as 64 lowercase hex characters.
///
/// Map-typed fields must use ordered maps (`BTreeMap`/`BTreeSet`) for the
/// output to be deterministic.
pub fn compute_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&json);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_ordered_maps_hash_identically() {
        let mut a = BTreeMap::new();
        a.insert("b", 2);
        a.insert("a", 1);
        let mut b = BTreeMap::new();
        b.insert("a", 1);
        b.insert("b", 2);
        let ha = compute_hash(&a).unwrap();
        assert_eq!(ha, compute_hash(&b).unwrap());
        assert_eq!(ha.len(), 64);
    }
}
