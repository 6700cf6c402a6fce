use crate::body::{BodyArena, BodyHandle};

/// Bodies connected through contacts or joints, solved as one batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Island {
    /// Dynamic bodies, sorted by handle.
    pub bodies: Vec<BodyHandle>,
    /// Indices into the manifold list passed to `build_islands`.
    pub manifolds: Vec<usize>,
    /// Indices into the constraint list passed to `build_islands`.
    pub constraints: Vec<usize>,
}

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        // path halving
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, x: usize, y: usize) {
        let root_x = self.find(x);
        let root_y = self.find(y);
        if root_x == root_y {
            return;
        }

        match self.rank[root_x].cmp(&self.rank[root_y]) {
            std::cmp::Ordering::Less => self.parent[root_x] = root_y,
            std::cmp::Ordering::Greater => self.parent[root_y] = root_x,
            std::cmp::Ordering::Equal => {
                self.parent[root_y] = root_x;
                self.rank[root_x] += 1;
            }
        }
    }
}

/// Groups the bodies referenced by `manifolds` and `constraints` (as body pairs) into islands.
///
/// Static bodies never join two islands together. Pairs between two static bodies, or with
/// unknown handles, belong to no island. Islands are ordered by their lowest body handle so the
/// result does not depend on hashing.
pub fn build_islands(
    bodies: &BodyArena,
    manifolds: &[(BodyHandle, BodyHandle)],
    constraints: &[(BodyHandle, BodyHandle)],
) -> Vec<Island> {
    let is_dynamic = |handle: BodyHandle| {
        bodies
            .get_body(handle)
            .map_or(false, |body| !body.has_infinite_mass())
    };

    let mut uf = UnionFind::new(bodies.slot_count());
    for &(a, b) in manifolds.iter().chain(constraints) {
        if is_dynamic(a) && is_dynamic(b) {
            uf.union(a.index(), b.index());
        }
    }

    // the island of a pair is the island of whichever of its bodies is dynamic
    let mut island_of_root = vec![usize::MAX; bodies.slot_count()];
    let mut islands: Vec<Island> = Vec::new();
    let root_of_pair = |uf: &mut UnionFind, (a, b): (BodyHandle, BodyHandle)| {
        let body = if is_dynamic(a) {
            a
        } else if is_dynamic(b) {
            b
        } else {
            return None;
        };
        Some(uf.find(body.index()))
    };

    for handle in bodies.handles() {
        if !is_dynamic(*handle) {
            continue;
        }
        let root = uf.find(handle.index());
        if island_of_root[root] == usize::MAX {
            island_of_root[root] = islands.len();
            islands.push(Island::default());
        }
        islands[island_of_root[root]].bodies.push(*handle);
    }

    for (index, &pair) in manifolds.iter().enumerate() {
        if let Some(root) = root_of_pair(&mut uf, pair) {
            islands[island_of_root[root]].manifolds.push(index);
        }
    }
    for (index, &pair) in constraints.iter().enumerate() {
        if let Some(root) = root_of_pair(&mut uf, pair) {
            islands[island_of_root[root]].constraints.push(index);
        }
    }

    // lone bodies have nothing to solve
    islands.retain(|island| !island.manifolds.is_empty() || !island.constraints.is_empty());
    islands
}
