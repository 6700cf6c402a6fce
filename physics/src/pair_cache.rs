use crate::{
    broadphase::ProxyHandle,
    error::{PhysicsError, PhysicsResult},
};
use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::BuildHasherDefault,
};

/// Unordered pair of proxies, stored with the lower handle first so `(a, b)` and `(b, a)` are
/// the same key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollisionPair {
    pub a: ProxyHandle,
    pub b: ProxyHandle,
}

impl CollisionPair {
    pub fn new(a: ProxyHandle, b: ProxyHandle) -> Self {
        if a <= b {
            Self { a, b }
        } else {
            Self { a: b, b: a }
        }
    }

    pub fn contains(&self, proxy: ProxyHandle) -> bool {
        self.a == proxy || self.b == proxy
    }
}

#[derive(Clone, Debug)]
pub struct OverlappingPair<T> {
    pub proxies: CollisionPair,
    /// Narrow phase data owned by the pair, handed to the cleanup callback on removal.
    pub internal_info: Option<T>,
    /// Set by narrow phase once it has processed the pair this step.
    pub processed: bool,
}

// a fixed hasher keeps lookups reproducible from run to run
type PairHasher = BuildHasherDefault<DefaultHasher>;

pub type PairCleanup<T> = Box<dyn FnMut(CollisionPair, Option<T>) + Send>;

/// Deduplicated store of the broadphase's current candidate pairs.
///
/// Pairs are kept densely packed and removal swaps the last pair into the hole, so iteration
/// order changes as pairs come and go.
pub struct OverlappingPairCache<T> {
    pairs: Vec<OverlappingPair<T>>,
    lookup: HashMap<CollisionPair, usize, PairHasher>,
    cleanup: Option<PairCleanup<T>>,
    max_pairs: Option<usize>,
}

impl<T> Default for OverlappingPairCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OverlappingPairCache<T> {
    pub fn new() -> Self {
        Self {
            pairs: Vec::new(),
            lookup: HashMap::default(),
            cleanup: None,
            max_pairs: None,
        }
    }

    pub fn with_capacity_limit(max_pairs: Option<usize>) -> Self {
        Self {
            max_pairs,
            ..Self::new()
        }
    }

    /// Registers the callback invoked with a pair's payload whenever that pair is removed.
    pub fn set_cleanup_callback(&mut self, cleanup: impl FnMut(CollisionPair, Option<T>) + Send + 'static) {
        self.cleanup = Some(Box::new(cleanup));
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn contains_pair(&self, a: ProxyHandle, b: ProxyHandle) -> bool {
        self.lookup.contains_key(&CollisionPair::new(a, b))
    }

    /// Returns the pair for `a` and `b`, creating it with no payload if it does not exist yet.
    pub fn add_pair(&mut self, a: ProxyHandle, b: ProxyHandle) -> PhysicsResult<&mut OverlappingPair<T>> {
        if a == b {
            return Err(PhysicsError::SelfPair(a));
        }

        let key = CollisionPair::new(a, b);
        let index = match self.lookup.get(&key) {
            Some(&index) => index,
            None => {
                if let Some(max_pairs) = self.max_pairs {
                    if self.pairs.len() >= max_pairs {
                        return Err(PhysicsError::PairCapacityExceeded(max_pairs));
                    }
                }
                let index = self.pairs.len();
                self.pairs.push(OverlappingPair {
                    proxies: key,
                    internal_info: None,
                    processed: false,
                });
                self.lookup.insert(key, index);
                log::trace!("pair added {:?} {:?}", key.a, key.b);
                index
            }
        };
        Ok(&mut self.pairs[index])
    }

    pub fn find_pair(&self, a: ProxyHandle, b: ProxyHandle) -> Option<&OverlappingPair<T>> {
        let index = *self.lookup.get(&CollisionPair::new(a, b))?;
        self.pairs.get(index)
    }

    pub fn find_pair_mut(&mut self, a: ProxyHandle, b: ProxyHandle) -> Option<&mut OverlappingPair<T>> {
        let index = *self.lookup.get(&CollisionPair::new(a, b))?;
        self.pairs.get_mut(index)
    }

    /// Removes the pair and runs the cleanup callback. Removing a missing pair does nothing.
    pub fn remove_pair(&mut self, a: ProxyHandle, b: ProxyHandle) -> bool {
        match self.lookup.get(&CollisionPair::new(a, b)) {
            Some(&index) => {
                self.remove_at(index);
                true
            }
            None => false,
        }
    }

    /// Removes every pair referencing `proxy`, returns how many were removed.
    pub fn remove_pairs_containing_proxy(&mut self, proxy: ProxyHandle) -> usize {
        let mut removed = 0;
        let mut index = self.pairs.len();
        while index > 0 {
            index -= 1;
            if self.pairs[index].proxies.contains(proxy) {
                self.remove_at(index);
                removed += 1;
            }
        }
        removed
    }

    /// Removes every pair, running the cleanup callback for each.
    pub fn clear(&mut self) {
        while !self.pairs.is_empty() {
            self.remove_at(self.pairs.len() - 1);
        }
    }

    pub(crate) fn pair_at(&self, index: usize) -> &OverlappingPair<T> {
        &self.pairs[index]
    }

    pub(crate) fn remove_at(&mut self, index: usize) {
        let pair = self.pairs.swap_remove(index);
        self.lookup.remove(&pair.proxies);
        if let Some(moved) = self.pairs.get(index) {
            self.lookup.insert(moved.proxies, index);
        }
        log::trace!("pair removed {:?} {:?}", pair.proxies.a, pair.proxies.b);
        if let Some(cleanup) = self.cleanup.as_mut() {
            cleanup(pair.proxies, pair.internal_info);
        }
    }

    pub fn iter(&self) -> core::slice::Iter<OverlappingPair<T>> {
        self.pairs.iter()
    }

    pub fn iter_mut(&mut self) -> core::slice::IterMut<OverlappingPair<T>> {
        self.pairs.iter_mut()
    }
}
