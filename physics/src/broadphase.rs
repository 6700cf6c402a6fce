use crate::{
    bounds::Bounds,
    config::BroadphaseConfig,
    dbvt::{Dbvt, NodeHandle},
    error::{PhysicsError, PhysicsResult},
    pair_cache::{CollisionPair, OverlappingPair, OverlappingPairCache},
};
use glam::Vec3;

/// Number of collide calls a proxy may go without moving before it is demoted to the fixed set.
pub const STAGE_COUNT: usize = 2;
const FIXED_STAGE: usize = STAGE_COUNT;

const DYNAMIC_SET: usize = 0;
const FIXED_SET: usize = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyHandle(pub u32);

impl ProxyHandle {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProxySet {
    Dynamic,
    Fixed,
}

/// Group and mask bits, two proxies pair only if each one's group is in the other's mask.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CollisionFilter {
    pub group: u32,
    pub mask: u32,
}

impl CollisionFilter {
    pub const ALL: Self = Self {
        group: u32::MAX,
        mask: u32::MAX,
    };

    pub fn new(group: u32, mask: u32) -> Self {
        Self { group, mask }
    }

    #[inline]
    pub fn collides_with(&self, other: &Self) -> bool {
        (self.group & other.mask) != 0 && (other.group & self.mask) != 0
    }
}

impl Default for CollisionFilter {
    fn default() -> Self {
        Self::ALL
    }
}

#[derive(Clone, Debug)]
pub struct Proxy<U> {
    bounds: Bounds,
    filter: CollisionFilter,
    user: U,
    leaf: NodeHandle,
    stage: usize,
    stage_slot: usize,
}

impl<U: Copy> Proxy<U> {
    /// The bounds last supplied for this proxy, without margin.
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn filter(&self) -> CollisionFilter {
        self.filter
    }

    pub fn user(&self) -> U {
        self.user
    }

    pub fn set(&self) -> ProxySet {
        if self.stage == FIXED_STAGE {
            ProxySet::Fixed
        } else {
            ProxySet::Dynamic
        }
    }

    fn tree_index(&self) -> usize {
        match self.set() {
            ProxySet::Dynamic => DYNAMIC_SET,
            ProxySet::Fixed => FIXED_SET,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct BroadphaseStats {
    /// `set_aabb` calls on dynamic proxies.
    pub updates_call: u64,
    /// How many of those actually re-inserted a leaf.
    pub updates_done: u64,
    /// Pairs created since the previous collide call.
    pub new_pairs: usize,
    pub pair_count: usize,
    pub dynamic_proxies: usize,
    pub fixed_proxies: usize,
}

impl BroadphaseStats {
    pub fn updates_ratio(&self) -> f32 {
        if self.updates_call == 0 {
            0.0
        } else {
            self.updates_done as f32 / self.updates_call as f32
        }
    }
}

/// Broadphase built on two dynamic trees, one for moving proxies and one for resting ones.
///
/// `U` is the user payload stored on each proxy (a back-reference to the owner) and `T` the
/// narrow phase payload stored on each overlapping pair.
pub struct Broadphase<U, T> {
    sets: [Dbvt<ProxyHandle>; 2],
    proxies: Vec<Option<Proxy<U>>>,
    free_proxies: Vec<ProxyHandle>,
    proxy_count: usize,
    stages: [Vec<ProxyHandle>; STAGE_COUNT + 1],
    stage_current: usize,
    pair_cache: OverlappingPairCache<T>,
    config: BroadphaseConfig,
    fixed_left: usize,
    new_pairs: usize,
    cleanup_index: usize,
    needs_cleanup: bool,
    updates_call: u64,
    updates_done: u64,
    candidates: Vec<(ProxyHandle, ProxyHandle)>,
}

impl<U: Copy, T> Broadphase<U, T> {
    pub fn new(config: BroadphaseConfig) -> PhysicsResult<Self> {
        config.validate()?;
        Ok(Self {
            sets: [Dbvt::new(), Dbvt::new()],
            proxies: Vec::new(),
            free_proxies: Vec::new(),
            proxy_count: 0,
            stages: Default::default(),
            stage_current: 0,
            pair_cache: OverlappingPairCache::with_capacity_limit(config.max_pairs),
            config,
            fixed_left: 0,
            new_pairs: 1,
            cleanup_index: 0,
            needs_cleanup: true,
            updates_call: 0,
            updates_done: 0,
            candidates: Vec::new(),
        })
    }

    pub fn config(&self) -> &BroadphaseConfig {
        &self.config
    }

    pub fn proxy(&self, handle: ProxyHandle) -> Option<&Proxy<U>> {
        self.proxies.get(handle.index())?.as_ref()
    }

    fn proxy_mut(&mut self, handle: ProxyHandle) -> PhysicsResult<&mut Proxy<U>> {
        self.proxies
            .get_mut(handle.index())
            .and_then(Option::as_mut)
            .ok_or(PhysicsError::UnknownProxy(handle))
    }

    pub fn proxy_set(&self, handle: ProxyHandle) -> Option<ProxySet> {
        self.proxy(handle).map(Proxy::set)
    }

    /// The bounds stored in the proxy's tree leaf, margin and prediction included.
    pub fn fat_bounds(&self, handle: ProxyHandle) -> Option<Bounds> {
        let proxy = self.proxy(handle)?;
        self.sets[proxy.tree_index()].bounds_of(proxy.leaf)
    }

    pub fn proxy_count(&self) -> usize {
        self.proxy_count
    }

    /// Adds a proxy to the dynamic set.
    pub fn create_proxy(&mut self, bounds: Bounds, filter: CollisionFilter, user: U) -> PhysicsResult<ProxyHandle> {
        self.create_proxy_in(bounds, filter, user, DYNAMIC_SET)
    }

    /// Adds a proxy straight to the fixed set, for bodies that are not expected to move.
    pub fn create_static_proxy(&mut self, bounds: Bounds, filter: CollisionFilter, user: U) -> PhysicsResult<ProxyHandle> {
        self.create_proxy_in(bounds, filter, user, FIXED_SET)
    }

    fn create_proxy_in(&mut self, bounds: Bounds, filter: CollisionFilter, user: U, set: usize) -> PhysicsResult<ProxyHandle> {
        check_bounds(&bounds)?;
        if let Some(max_proxies) = self.config.max_proxies {
            if self.proxy_count >= max_proxies {
                return Err(PhysicsError::ProxyCapacityExceeded(max_proxies));
            }
        }

        let handle = match self.free_proxies.pop() {
            Some(handle) => handle,
            None => {
                self.proxies.push(None);
                ProxyHandle(self.proxies.len() as u32 - 1)
            }
        };

        let leaf = self.sets[set].insert(bounds.expanded(self.config.margin), handle);
        let stage = if set == FIXED_SET {
            FIXED_STAGE
        } else {
            self.stage_current
        };
        self.proxies[handle.index()] = Some(Proxy {
            bounds,
            filter,
            user,
            leaf,
            stage,
            stage_slot: 0,
        });
        self.proxy_count += 1;
        self.link_stage(handle, stage);

        if !self.config.deferred_collide {
            if let Err(e) = self.collide_proxy(handle) {
                // no half-registered proxy is left behind
                self.destroy_proxy(handle)?;
                return Err(e);
            }
        }
        Ok(handle)
    }

    /// Removes a proxy and every pair that references it, returning its user payload.
    pub fn destroy_proxy(&mut self, handle: ProxyHandle) -> PhysicsResult<U> {
        let proxy = self.proxy(handle).ok_or(PhysicsError::UnknownProxy(handle))?;
        let (set, leaf, user) = (proxy.tree_index(), proxy.leaf, proxy.user);

        self.sets[set].remove(leaf);
        self.unlink_stage(handle);
        self.proxies[handle.index()] = None;
        self.free_proxies.push(handle);
        self.proxy_count -= 1;

        self.pair_cache.remove_pairs_containing_proxy(handle);
        Ok(user)
    }

    /// Moves a proxy. Cheap while the new bounds stay inside the stored leaf bounds.
    pub fn set_aabb(&mut self, handle: ProxyHandle, bounds: Bounds) -> PhysicsResult<()> {
        check_bounds(&bounds)?;
        let margin = self.config.margin;
        let prediction = self.config.prediction;
        let stage_current = self.stage_current;

        let proxy = self.proxy_mut(handle)?;
        let (old_bounds, leaf, set) = (proxy.bounds, proxy.leaf, proxy.tree_index());
        proxy.bounds = bounds;

        let do_collide = if set == FIXED_SET {
            // a resting proxy started moving again
            self.sets[FIXED_SET].remove(leaf);
            let leaf = self.sets[DYNAMIC_SET].insert(bounds.expanded(margin), handle);
            self.proxy_mut(handle)?.leaf = leaf;
            true
        } else {
            self.updates_call += 1;
            let tree = &mut self.sets[DYNAMIC_SET];
            let velocity = if tree.bounds_of(leaf).map_or(false, |fat| fat.intersects(&bounds)) {
                let mut velocity = bounds.half_extents() * prediction;
                let delta = bounds.mins - old_bounds.mins;
                velocity = Vec3::select(delta.cmplt(Vec3::ZERO), -velocity, velocity);
                velocity
            } else {
                // teleported, no point predicting
                Vec3::ZERO
            };
            let updated = tree.update(leaf, bounds, velocity, margin);
            if updated {
                self.updates_done += 1;
            }
            updated
        };

        self.unlink_stage(handle);
        self.link_stage(handle, stage_current);

        if do_collide {
            self.needs_cleanup = true;
            if !self.config.deferred_collide {
                self.collide_proxy(handle)?;
            }
        }
        Ok(())
    }

    fn link_stage(&mut self, handle: ProxyHandle, stage: usize) {
        let slot = self.stages[stage].len();
        self.stages[stage].push(handle);
        if let Some(proxy) = self.proxies[handle.index()].as_mut() {
            proxy.stage = stage;
            proxy.stage_slot = slot;
        }
    }

    fn unlink_stage(&mut self, handle: ProxyHandle) {
        let (stage, slot) = match self.proxy(handle) {
            Some(proxy) => (proxy.stage, proxy.stage_slot),
            None => return,
        };
        let list = &mut self.stages[stage];
        list.swap_remove(slot);
        if let Some(&moved) = list.get(slot) {
            if let Some(proxy) = self.proxies[moved.index()].as_mut() {
                proxy.stage_slot = slot;
            }
        }
    }

    // finds the pairs of a single proxy against both trees
    fn collide_proxy(&mut self, handle: ProxyHandle) -> PhysicsResult<()> {
        let proxy = self.proxy(handle).ok_or(PhysicsError::UnknownProxy(handle))?;
        let set = proxy.set();
        let fat = self.sets[proxy.tree_index()]
            .bounds_of(proxy.leaf)
            .ok_or(PhysicsError::UnknownProxy(handle))?;

        let mut candidates = std::mem::take(&mut self.candidates);
        candidates.clear();
        self.sets[DYNAMIC_SET].collide_tv(&fat, |other| {
            if other != handle {
                candidates.push((handle, other));
            }
        });
        if set == ProxySet::Dynamic {
            self.sets[FIXED_SET].collide_tv(&fat, |other| candidates.push((handle, other)));
        }

        let result = self.add_candidates(&candidates);
        self.candidates = candidates;
        result
    }

    fn add_candidates(&mut self, candidates: &[(ProxyHandle, ProxyHandle)]) -> PhysicsResult<()> {
        for &(a, b) in candidates {
            let collides = match (self.proxy(a), self.proxy(b)) {
                (Some(pa), Some(pb)) => a != b && pa.filter.collides_with(&pb.filter),
                _ => false,
            };
            if collides && !self.pair_cache.contains_pair(a, b) {
                self.pair_cache.add_pair(a, b)?;
                self.new_pairs += 1;
            }
        }
        Ok(())
    }

    /// Brings the pair cache up to date for this step.
    ///
    /// Demotes proxies that have not moved for `STAGE_COUNT` calls to the fixed set, finds
    /// dynamic-dynamic and dynamic-fixed pairs when collision is deferred, and removes cached
    /// pairs whose stored bounds no longer overlap.
    pub fn calculate_overlapping_pairs(&mut self) -> PhysicsResult<()> {
        // spread tree optimisation over the steps
        let dynamic_passes =
            1 + (self.sets[DYNAMIC_SET].leaf_count() * self.config.dynamic_update_percent as usize) / 100;
        self.sets[DYNAMIC_SET].optimize_incremental(dynamic_passes);
        if self.fixed_left > 0 {
            let fixed_passes =
                1 + (self.sets[FIXED_SET].leaf_count() * self.config.fixed_update_percent as usize) / 100;
            self.sets[FIXED_SET].optimize_incremental(fixed_passes);
            self.fixed_left = self.fixed_left.saturating_sub(fixed_passes);
        }

        // proxies that were not touched for a full stage cycle come to rest in the fixed set
        self.stage_current = (self.stage_current + 1) % STAGE_COUNT;
        let resting = std::mem::take(&mut self.stages[self.stage_current]);
        if !resting.is_empty() {
            for &handle in &resting {
                let margin = self.config.margin;
                let (leaf, bounds) = match self.proxy(handle) {
                    Some(proxy) => (proxy.leaf, proxy.bounds),
                    None => continue,
                };
                self.sets[DYNAMIC_SET].remove(leaf);
                let leaf = self.sets[FIXED_SET].insert(bounds.expanded(margin), handle);
                self.proxy_mut(handle)?.leaf = leaf;
                self.link_stage(handle, FIXED_STAGE);
            }
            log::debug!("{} proxies moved to the fixed set", resting.len());
            self.fixed_left = self.sets[FIXED_SET].leaf_count();
            self.needs_cleanup = true;
        }

        if self.config.deferred_collide {
            let mut candidates = std::mem::take(&mut self.candidates);
            candidates.clear();
            self.sets[DYNAMIC_SET].collide_tt(&self.sets[FIXED_SET], |a, b| candidates.push((a, b)));
            self.sets[DYNAMIC_SET].collide_self(|a, b| candidates.push((a, b)));
            let result = self.add_candidates(&candidates);
            self.candidates = candidates;
            result?;
            self.needs_cleanup = true;
        }

        if self.needs_cleanup || self.config.cleanup_percent < 100 {
            self.cleanup_pairs();
        }

        log::debug!(
            "broadphase: {} pairs ({} new), {} dynamic, {} fixed, update ratio {:.2}",
            self.pair_cache.len(),
            self.new_pairs,
            self.sets[DYNAMIC_SET].leaf_count(),
            self.sets[FIXED_SET].leaf_count(),
            self.stats().updates_ratio()
        );

        self.new_pairs = 1;
        self.needs_cleanup = false;
        Ok(())
    }

    // round robin check of cached pairs, removing the ones that separated
    fn cleanup_pairs(&mut self) {
        let count = self.pair_cache.len();
        if count == 0 {
            self.cleanup_index = 0;
            return;
        }

        let mut budget = usize::min(
            count,
            usize::max(self.new_pairs, (count * self.config.cleanup_percent as usize) / 100),
        );
        let mut checked = 0;
        while checked < budget && !self.pair_cache.is_empty() {
            let index = (self.cleanup_index + checked) % self.pair_cache.len();
            let pair = self.pair_cache.pair_at(index).proxies;
            if self.pair_overlaps(pair) {
                checked += 1;
            } else {
                self.pair_cache.remove_at(index);
                budget -= 1;
            }
        }

        self.cleanup_index = if self.pair_cache.is_empty() {
            0
        } else {
            (self.cleanup_index + checked) % self.pair_cache.len()
        };
    }

    fn pair_overlaps(&self, pair: CollisionPair) -> bool {
        match (self.fat_bounds(pair.a), self.fat_bounds(pair.b)) {
            (Some(a), Some(b)) => a.intersects(&b),
            _ => false,
        }
    }

    /// Reports every proxy whose stored bounds overlap `bounds`.
    pub fn aabb_query(&self, bounds: &Bounds, mut callback: impl FnMut(ProxyHandle)) {
        for set in &self.sets {
            set.collide_tv(bounds, &mut callback);
        }
    }

    /// Bounds enclosing every proxy, `None` when empty.
    pub fn broadphase_bounds(&self) -> Option<Bounds> {
        match (self.sets[DYNAMIC_SET].root_bounds(), self.sets[FIXED_SET].root_bounds()) {
            (Some(a), Some(b)) => Some(a.union(&b)),
            (a, b) => a.or(b),
        }
    }

    /// Full rebuild of both trees.
    pub fn optimize(&mut self) {
        for set in self.sets.iter_mut() {
            set.optimize_top_down();
        }
    }

    pub fn pair_cache(&self) -> &OverlappingPairCache<T> {
        &self.pair_cache
    }

    /// Pairs removed through this reference still run the cleanup callback.
    pub fn pair_cache_mut(&mut self) -> &mut OverlappingPairCache<T> {
        &mut self.pair_cache
    }

    pub fn set_pair_cleanup_callback(&mut self, cleanup: impl FnMut(CollisionPair, Option<T>) + Send + 'static) {
        self.pair_cache.set_cleanup_callback(cleanup);
    }

    /// Every cached pair with both proxies' user payloads, for narrow phase to fill in.
    pub fn pairs_mut(&mut self) -> impl Iterator<Item = (U, U, &mut OverlappingPair<T>)> + '_ {
        let proxies = &self.proxies;
        self.pair_cache.iter_mut().filter_map(move |pair| {
            let a = proxies.get(pair.proxies.a.index())?.as_ref()?.user;
            let b = proxies.get(pair.proxies.b.index())?.as_ref()?.user;
            Some((a, b, pair))
        })
    }

    pub fn stats(&self) -> BroadphaseStats {
        BroadphaseStats {
            updates_call: self.updates_call,
            updates_done: self.updates_done,
            new_pairs: self.new_pairs,
            pair_count: self.pair_cache.len(),
            dynamic_proxies: self.sets[DYNAMIC_SET].leaf_count(),
            fixed_proxies: self.sets[FIXED_SET].leaf_count(),
        }
    }

    pub fn validate(&self) -> bool {
        self.sets.iter().all(Dbvt::validate)
    }
}

fn check_bounds(bounds: &Bounds) -> PhysicsResult<()> {
    if bounds.is_valid() {
        Ok(())
    } else {
        Err(PhysicsError::InvalidBounds {
            mins: bounds.mins,
            maxs: bounds.maxs,
        })
    }
}
