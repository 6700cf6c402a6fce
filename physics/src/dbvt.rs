use crate::bounds::Bounds;
use glam::Vec3;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(u32);

impl NodeHandle {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Copy, Clone, Debug)]
enum NodeKind<T> {
    Leaf(T),
    Internal([NodeHandle; 2]),
    Free,
}

#[derive(Copy, Clone, Debug)]
struct Node<T> {
    bounds: Bounds,
    parent: Option<NodeHandle>,
    kind: NodeKind<T>,
}

/// Dynamic bounding volume tree.
///
/// Nodes live in an index stable pool, a leaf keeps its handle for as long as it is in the tree
/// and is only re-parented when its bounds change. Internal nodes always have two children and
/// bounds equal to the union of their children.
#[derive(Clone, Debug)]
pub struct Dbvt<T> {
    nodes: Vec<Node<T>>,
    free: Vec<NodeHandle>,
    root: Option<NodeHandle>,
    leaves: usize,
    opath: u32,
}

impl<T: Copy> Default for Dbvt<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> Dbvt<T> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
            leaves: 0,
            opath: 0,
        }
    }

    pub fn root(&self) -> Option<NodeHandle> {
        self.root
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Bounds of a live node, `None` for freed or unknown handles.
    pub fn bounds_of(&self, handle: NodeHandle) -> Option<Bounds> {
        match self.nodes.get(handle.index()) {
            Some(node) if !matches!(node.kind, NodeKind::Free) => Some(node.bounds),
            _ => None,
        }
    }

    fn node_bounds(&self, handle: NodeHandle) -> Bounds {
        self.nodes[handle.index()].bounds
    }

    /// Bounds of the whole tree.
    pub fn root_bounds(&self) -> Option<Bounds> {
        self.root.map(|root| self.node_bounds(root))
    }

    /// The payload of a leaf, `None` for internal or freed nodes.
    pub fn data(&self, handle: NodeHandle) -> Option<T> {
        match self.nodes.get(handle.index()).map(|node| node.kind) {
            Some(NodeKind::Leaf(data)) => Some(data),
            _ => None,
        }
    }

    pub fn is_leaf(&self, handle: NodeHandle) -> bool {
        matches!(self.nodes.get(handle.index()).map(|node| node.kind), Some(NodeKind::Leaf(_)))
    }

    fn children(&self, handle: NodeHandle) -> Option<[NodeHandle; 2]> {
        match self.nodes[handle.index()].kind {
            NodeKind::Internal(children) => Some(children),
            _ => None,
        }
    }

    fn alloc_node(&mut self, bounds: Bounds, parent: Option<NodeHandle>, kind: NodeKind<T>) -> NodeHandle {
        let node = Node {
            bounds,
            parent,
            kind,
        };
        if let Some(handle) = self.free.pop() {
            self.nodes[handle.index()] = node;
            handle
        } else {
            let handle = NodeHandle(self.nodes.len() as u32);
            self.nodes.push(node);
            handle
        }
    }

    fn free_node(&mut self, handle: NodeHandle) {
        let node = &mut self.nodes[handle.index()];
        node.kind = NodeKind::Free;
        node.parent = None;
        self.free.push(handle);
    }

    pub fn insert(&mut self, bounds: Bounds, data: T) -> NodeHandle {
        let leaf = self.alloc_node(bounds, None, NodeKind::Leaf(data));
        self.insert_leaf(leaf);
        self.leaves += 1;
        leaf
    }

    /// Removes a leaf and returns its payload.
    pub fn remove(&mut self, leaf: NodeHandle) -> Option<T> {
        let data = self.data(leaf)?;
        self.remove_leaf(leaf);
        self.free_node(leaf);
        self.leaves -= 1;
        Some(data)
    }

    /// Updates a leaf for a body whose tight bounds are now `bounds`.
    ///
    /// Returns false without touching the tree while the stored bounds still contain `bounds`
    /// grown by `margin`. Otherwise the leaf is re-inserted with the margin plus `velocity`
    /// prediction applied. Handles that are not leaves of this tree are ignored.
    pub fn update(&mut self, leaf: NodeHandle, bounds: Bounds, velocity: Vec3, margin: f32) -> bool {
        if !self.is_leaf(leaf) {
            return false;
        }
        let expanded = bounds.expanded(margin);
        if self.node_bounds(leaf).contains(&expanded) {
            return false;
        }
        self.update_bounds(leaf, expanded.signed_expanded(velocity));
        true
    }

    /// Re-inserts a leaf with exactly `bounds`. Returns false for handles that are not leaves.
    pub fn update_bounds(&mut self, leaf: NodeHandle, bounds: Bounds) -> bool {
        if !self.is_leaf(leaf) {
            return false;
        }
        self.remove_leaf(leaf);
        self.nodes[leaf.index()].bounds = bounds;
        self.insert_leaf(leaf);
        true
    }

    fn insert_leaf(&mut self, leaf: NodeHandle) {
        let root = match self.root {
            Some(root) => root,
            None => {
                self.nodes[leaf.index()].parent = None;
                self.root = Some(leaf);
                return;
            }
        };

        let leaf_bounds = self.node_bounds(leaf);

        // walk down picking the child that grows the least
        let mut sibling = root;
        while let Some([c0, c1]) = self.children(sibling) {
            let b0 = self.node_bounds(c0);
            let b1 = self.node_bounds(c1);
            let cost0 = b0.union(&leaf_bounds).surface_area() - b0.surface_area();
            let cost1 = b1.union(&leaf_bounds).surface_area() - b1.surface_area();
            sibling = if cost0 <= cost1 { c0 } else { c1 };
        }

        let prev = self.nodes[sibling.index()].parent;
        let parent_bounds = self.node_bounds(sibling).union(&leaf_bounds);
        let parent = self.alloc_node(parent_bounds, prev, NodeKind::Internal([sibling, leaf]));
        self.nodes[sibling.index()].parent = Some(parent);
        self.nodes[leaf.index()].parent = Some(parent);

        if let Some(prev) = prev {
            self.replace_child(prev, sibling, parent);
            self.refit_from(prev);
        } else {
            self.root = Some(parent);
        }
    }

    fn remove_leaf(&mut self, leaf: NodeHandle) {
        if self.root == Some(leaf) {
            self.root = None;
            return;
        }

        let parent = match self.nodes[leaf.index()].parent {
            Some(parent) => parent,
            None => return,
        };
        let sibling = match self.children(parent) {
            Some([c0, c1]) => {
                if c0 == leaf {
                    c1
                } else {
                    c0
                }
            }
            None => return,
        };

        // the parent now has a single child, collapse it into the grandparent
        let grand_parent = self.nodes[parent.index()].parent;
        self.free_node(parent);
        self.nodes[leaf.index()].parent = None;
        self.nodes[sibling.index()].parent = grand_parent;

        if let Some(grand_parent) = grand_parent {
            self.replace_child(grand_parent, parent, sibling);
            self.refit_from(grand_parent);
        } else {
            self.root = Some(sibling);
        }
    }

    fn replace_child(&mut self, parent: NodeHandle, old: NodeHandle, new: NodeHandle) {
        if let NodeKind::Internal(children) = &mut self.nodes[parent.index()].kind {
            for child in children.iter_mut() {
                if *child == old {
                    *child = new;
                }
            }
        }
    }

    // recompute bounds up the tree, stopping once a node is unchanged
    fn refit_from(&mut self, start: NodeHandle) {
        let mut current = Some(start);
        while let Some(node) = current {
            let [c0, c1] = match self.children(node) {
                Some(children) => children,
                None => break,
            };
            let bounds = self.node_bounds(c0).union(&self.node_bounds(c1));
            if bounds == self.node_bounds(node) {
                break;
            }
            self.nodes[node.index()].bounds = bounds;
            current = self.nodes[node.index()].parent;
        }
    }

    /// Reports every leaf whose bounds overlap `bounds`.
    pub fn collide_tv(&self, bounds: &Bounds, mut callback: impl FnMut(T)) {
        let mut stack = Vec::with_capacity(64);
        stack.extend(self.root);
        while let Some(node) = stack.pop() {
            let n = &self.nodes[node.index()];
            if !n.bounds.intersects(bounds) {
                continue;
            }
            match n.kind {
                NodeKind::Leaf(data) => callback(data),
                NodeKind::Internal([c0, c1]) => {
                    stack.push(c0);
                    stack.push(c1);
                }
                NodeKind::Free => {}
            }
        }
    }

    /// Reports every overlapping pair of leaves between this tree and `other`.
    pub fn collide_tt<U: Copy>(&self, other: &Dbvt<U>, mut callback: impl FnMut(T, U)) {
        let (root_a, root_b) = match (self.root, other.root) {
            (Some(a), Some(b)) => (a, b),
            _ => return,
        };

        let mut stack = Vec::with_capacity(128);
        stack.push((root_a, root_b));
        while let Some((a, b)) = stack.pop() {
            let na = &self.nodes[a.index()];
            let nb = &other.nodes[b.index()];
            if !na.bounds.intersects(&nb.bounds) {
                continue;
            }
            match (na.kind, nb.kind) {
                (NodeKind::Leaf(da), NodeKind::Leaf(db)) => callback(da, db),
                (NodeKind::Leaf(_), NodeKind::Internal([b0, b1])) => {
                    stack.push((a, b0));
                    stack.push((a, b1));
                }
                (NodeKind::Internal([a0, a1]), NodeKind::Leaf(_)) => {
                    stack.push((a0, b));
                    stack.push((a1, b));
                }
                (NodeKind::Internal([a0, a1]), NodeKind::Internal([b0, b1])) => {
                    // descend into the larger volume
                    if na.bounds.surface_area() >= nb.bounds.surface_area() {
                        stack.push((a0, b));
                        stack.push((a1, b));
                    } else {
                        stack.push((a, b0));
                        stack.push((a, b1));
                    }
                }
                _ => {}
            }
        }
    }

    /// Reports every overlapping pair of distinct leaves in this tree exactly once.
    pub fn collide_self(&self, mut callback: impl FnMut(T, T)) {
        let root = match self.root {
            Some(root) => root,
            None => return,
        };

        let mut stack = Vec::with_capacity(128);
        stack.push((root, root));
        while let Some((a, b)) = stack.pop() {
            let na = &self.nodes[a.index()];
            if a == b {
                if let NodeKind::Internal([c0, c1]) = na.kind {
                    stack.push((c0, c0));
                    stack.push((c1, c1));
                    stack.push((c0, c1));
                }
                continue;
            }

            let nb = &self.nodes[b.index()];
            if !na.bounds.intersects(&nb.bounds) {
                continue;
            }
            match (na.kind, nb.kind) {
                (NodeKind::Leaf(da), NodeKind::Leaf(db)) => callback(da, db),
                (NodeKind::Leaf(_), NodeKind::Internal([b0, b1])) => {
                    stack.push((a, b0));
                    stack.push((a, b1));
                }
                (NodeKind::Internal([a0, a1]), NodeKind::Leaf(_)) => {
                    stack.push((a0, b));
                    stack.push((a1, b));
                }
                (NodeKind::Internal([a0, a1]), NodeKind::Internal([b0, b1])) => {
                    if na.bounds.surface_area() >= nb.bounds.surface_area() {
                        stack.push((a0, b));
                        stack.push((a1, b));
                    } else {
                        stack.push((a, b0));
                        stack.push((a, b1));
                    }
                }
                _ => {}
            }
        }
    }

    /// Re-inserts `passes` leaves, picked by walking a rotating bit path from the root.
    pub fn optimize_incremental(&mut self, passes: usize) {
        for _ in 0..passes {
            let mut node = match self.root {
                Some(root) => root,
                None => return,
            };
            let mut bit = 0;
            while let Some(children) = self.children(node) {
                node = children[((self.opath >> bit) & 1) as usize];
                bit = (bit + 1) & (u32::BITS - 1);
            }
            let bounds = self.node_bounds(node);
            self.update_bounds(node, bounds);
            self.opath = self.opath.wrapping_add(1);
        }
    }

    /// Rebuilds all internal nodes with a median split along the widest centroid axis.
    pub fn optimize_top_down(&mut self) {
        if self.leaves < 2 {
            return;
        }

        let mut leaves = Vec::with_capacity(self.leaves);
        for index in 0..self.nodes.len() {
            match self.nodes[index].kind {
                NodeKind::Leaf(_) => leaves.push(NodeHandle(index as u32)),
                NodeKind::Internal(_) => self.free_node(NodeHandle(index as u32)),
                NodeKind::Free => {}
            }
        }

        let root = self.build_top_down(&mut leaves, None);
        self.root = Some(root);
    }

    fn build_top_down(&mut self, leaves: &mut [NodeHandle], parent: Option<NodeHandle>) -> NodeHandle {
        if leaves.len() == 1 {
            self.nodes[leaves[0].index()].parent = parent;
            return leaves[0];
        }

        let mut centers = Bounds::new();
        for leaf in leaves.iter() {
            centers.expand_by_point(self.node_bounds(*leaf).center());
        }
        let width = centers.width();
        let axis = if width.x >= width.y && width.x >= width.z {
            0
        } else if width.y >= width.z {
            1
        } else {
            2
        };

        leaves.sort_unstable_by(|a, b| {
            let ca = self.node_bounds(*a).center()[axis];
            let cb = self.node_bounds(*b).center()[axis];
            ca.total_cmp(&cb)
        });

        let node = self.alloc_node(Bounds::new(), parent, NodeKind::Free);
        let mid = leaves.len() / 2;
        let (left, right) = leaves.split_at_mut(mid);
        let c0 = self.build_top_down(left, Some(node));
        let c1 = self.build_top_down(right, Some(node));
        let bounds = self.node_bounds(c0).union(&self.node_bounds(c1));
        let n = &mut self.nodes[node.index()];
        n.kind = NodeKind::Internal([c0, c1]);
        n.bounds = bounds;
        node
    }

    pub fn max_depth(&self) -> usize {
        let mut depth = 0;
        let mut stack = Vec::new();
        stack.extend(self.root.map(|root| (root, 1)));
        while let Some((node, d)) = stack.pop() {
            depth = depth.max(d);
            if let Some([c0, c1]) = self.children(node) {
                stack.push((c0, d + 1));
                stack.push((c1, d + 1));
            }
        }
        depth
    }

    /// Checks the structural invariants, used by tests.
    pub fn validate(&self) -> bool {
        let root = match self.root {
            Some(root) => root,
            None => return self.leaves == 0,
        };
        if self.nodes[root.index()].parent.is_some() {
            return false;
        }

        let mut leaves = 0;
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            let n = &self.nodes[node.index()];
            match n.kind {
                NodeKind::Leaf(_) => leaves += 1,
                NodeKind::Internal([c0, c1]) => {
                    let union = self.node_bounds(c0).union(&self.node_bounds(c1));
                    if union != n.bounds {
                        return false;
                    }
                    if self.nodes[c0.index()].parent != Some(node)
                        || self.nodes[c1.index()].parent != Some(node)
                    {
                        return false;
                    }
                    stack.push(c0);
                    stack.push(c1);
                }
                NodeKind::Free => return false,
            }
        }
        leaves == self.leaves
    }
}
