//! Consistent-hash continuum
//!
//! Each backend is placed at [`VIRTUAL_NODES`] pseudo-random points on a
//! 64-bit circle, hashed from `"<name>-<i>"` with xxh3. A key is owned by the
//! first point clockwise from the key's own hash. Adding or removing one
//! backend only moves the keys whose owning point belonged to it.

use std::collections::BTreeMap;
use xxhash_rust::xxh3::xxh3_64;

use crate::constants::ring::VIRTUAL_NODES;
use crate::types::BackendId;

/// Hash used for both keys and virtual points
#[must_use]
#[inline]
pub fn hash_key(key: &str) -> u64 {
    xxh3_64(key.as_bytes())
}

/// Ordered set of virtual points
#[derive(Debug, Clone, Default)]
pub struct Continuum {
    points: BTreeMap<u64, BackendId>,
}

impl Continuum {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a backend's virtual points
    ///
    /// On the (astronomically unlikely) event of a point collision the
    /// backend with the lower id keeps the point, so placement does not
    /// depend on insertion order.
    pub fn add(&mut self, id: BackendId, name: &str) {
        for i in 0..VIRTUAL_NODES {
            let point = hash_key(&format!("{name}-{i}"));
            self.points
                .entry(point)
                .and_modify(|owner| *owner = (*owner).min(id))
                .or_insert(id);
        }
    }

    /// Remove every point owned by `id`
    pub fn remove(&mut self, id: BackendId) {
        self.points.retain(|_, owner| *owner != id);
    }

    /// Whether `id` currently owns any points
    #[must_use]
    pub fn contains(&self, id: BackendId) -> bool {
        self.points.values().any(|owner| *owner == id)
    }

    /// Backend owning `key`, `None` when the continuum is empty
    #[must_use]
    pub fn locate(&self, key: &str) -> Option<BackendId> {
        let hash = hash_key(key);
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, id)| *id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of virtual points
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn continuum(names: &[&str]) -> Continuum {
        let mut c = Continuum::new();
        for (i, name) in names.iter().enumerate() {
            c.add(BackendId::from_index(i), name);
        }
        c
    }

    #[test]
    fn test_empty_continuum_locates_nothing() {
        assert_eq!(Continuum::new().locate("full.cpu"), None);
    }

    #[test]
    fn test_single_backend_owns_everything() {
        let c = continuum(&["memory://a"]);
        assert_eq!(c.len(), VIRTUAL_NODES);
        for key in ["a", "b", "full.cpu.load", ""] {
            assert_eq!(c.locate(key), Some(BackendId::from_index(0)));
        }
    }

    #[test]
    fn test_remove_drops_points() {
        let mut c = continuum(&["memory://a", "memory://b"]);
        assert!(c.contains(BackendId::from_index(1)));
        c.remove(BackendId::from_index(1));
        assert!(!c.contains(BackendId::from_index(1)));
        assert_eq!(c.len(), VIRTUAL_NODES);
        assert_eq!(c.locate("anything"), Some(BackendId::from_index(0)));
    }

    #[test]
    fn test_distribution_is_roughly_even() {
        let c = continuum(&["memory://a", "memory://b", "memory://c", "memory://d"]);
        let mut counts = [0usize; 4];
        for i in 0..20_000 {
            let id = c.locate(&format!("full.metric.{i}")).unwrap();
            counts[id.as_index()] += 1;
        }
        // 5000 expected each; virtual nodes keep the spread well inside 2x
        for count in counts {
            assert!((2_500..=10_000).contains(&count), "skewed: {counts:?}");
        }
    }

    proptest! {
        #[test]
        fn prop_removing_a_backend_only_moves_its_keys(
            keys in prop::collection::vec("[a-z.]{1,24}", 1..200),
            victim in 0usize..4,
        ) {
            let names = ["tcp://h1:6379", "tcp://h2:6379", "tcp://h3:6379", "tcp://h4:6379"];
            let full = continuum(&names);
            let mut reduced = full.clone();
            reduced.remove(BackendId::from_index(victim));

            for key in &keys {
                let before = full.locate(key).unwrap();
                let after = reduced.locate(key).unwrap();
                if before.as_index() != victim {
                    prop_assert_eq!(before, after);
                } else {
                    prop_assert_ne!(after.as_index(), victim);
                }
            }
        }

        #[test]
        fn prop_readding_restores_routing(
            keys in prop::collection::vec("[a-z0-9.]{1,24}", 1..200),
            victim in 0usize..3,
        ) {
            let names = ["memory://x", "memory://y", "memory://z"];
            let original = continuum(&names);
            let mut churned = original.clone();
            churned.remove(BackendId::from_index(victim));
            churned.add(BackendId::from_index(victim), names[victim]);

            for key in &keys {
                prop_assert_eq!(original.locate(key), churned.locate(key));
            }
        }

        #[test]
        fn prop_insertion_order_does_not_matter(
            keys in prop::collection::vec("[a-z0-9.]{1,24}", 1..100),
        ) {
            let forward = continuum(&["memory://p", "memory://q"]);
            let mut backward = Continuum::new();
            backward.add(BackendId::from_index(1), "memory://q");
            backward.add(BackendId::from_index(0), "memory://p");
            for key in &keys {
                prop_assert_eq!(forward.locate(key), backward.locate(key));
            }
        }
    }
}
