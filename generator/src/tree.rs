use std::sync::atomic::{AtomicU64, Ordering};

use la_arena::{Arena, Idx};

use crate::symbol::Symbol;

/// Position of a node inside one tree's arena.
pub(crate) type Slot = Idx<Node>;

/// Handle to a node of one particular [`Tree`].
///
/// Ids carry the identity of the tree they were taken from, so a tree
/// rejects ids of other trees, of its clones, and of its own state before
/// the last [`Tree::compact`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    tree: u64,
    slot: Slot,
}

static NEXT_TREE: AtomicU64 = AtomicU64::new(0);

fn next_tree_id() -> u64 {
    NEXT_TREE.fetch_add(1, Ordering::Relaxed)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum NodeKind {
    NonTerminal(Symbol),
    Terminal,
}

/// One vertex of a derivation tree.
///
/// Children are owned by exactly one parent; `parent` is a plain back
/// reference and never keeps anything alive.
#[derive(Clone, Debug)]
pub struct Node {
    pub kind: NodeKind,
    /// Bytes of a terminal literal, or of a termination-pool leaf.
    pub value: Option<Vec<u8>>,
    pub(crate) children: Vec<Slot>,
    pub(crate) parent: Option<Slot>,
    /// Index of the production this node was expanded with. `None` for
    /// terminals and for leaves taken from the termination pool.
    pub alternative: Option<usize>,
    /// Nonterminal nodes in this subtree, itself included.
    pub non_term_count: usize,
    /// Direct children sharing this node's symbol.
    pub self_recursive_children: usize,
}

impl Node {
    pub(crate) fn terminal(value: Vec<u8>, parent: Option<Slot>) -> Self {
        Self {
            kind: NodeKind::Terminal,
            value: Some(value),
            children: Vec::new(),
            parent,
            alternative: None,
            non_term_count: 0,
            self_recursive_children: 0,
        }
    }

    /// A nonterminal that stands for itself through a literal value.
    pub(crate) fn leaf(symbol: Symbol, value: Vec<u8>, parent: Option<Slot>) -> Self {
        Self {
            kind: NodeKind::NonTerminal(symbol),
            value: Some(value),
            children: Vec::new(),
            parent,
            alternative: None,
            non_term_count: 1,
            self_recursive_children: 0,
        }
    }

    pub(crate) fn interior(symbol: Symbol, alternative: usize, parent: Option<Slot>) -> Self {
        Self {
            kind: NodeKind::NonTerminal(symbol),
            value: None,
            children: Vec::new(),
            parent,
            alternative: Some(alternative),
            non_term_count: 1,
            self_recursive_children: 0,
        }
    }

    pub fn symbol(&self) -> Option<Symbol> {
        match self.kind {
            NodeKind::NonTerminal(s) => Some(s),
            NodeKind::Terminal => None,
        }
    }

    pub fn is_non_terminal(&self) -> bool {
        matches!(self.kind, NodeKind::NonTerminal(_))
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Recompute the derived counters of `id` from its children.
pub(crate) fn update_counts(arena: &mut Arena<Node>, id: Slot) {
    let node = &arena[id];
    let sym = node.symbol();
    let mut count = usize::from(node.is_non_terminal());
    let mut recursive = 0;
    for c in node.children.iter() {
        let child = &arena[*c];
        count += child.non_term_count;
        if sym.is_some() && child.symbol() == sym {
            recursive += 1;
        }
    }
    let node = &mut arena[id];
    node.non_term_count = count;
    node.self_recursive_children = recursive;
}

/// Deep-copy the subtree at `id` from `src` into `dst`, hanging it under
/// `parent`. Counters are recomputed on the copy.
pub(crate) fn copy_into(
    src: &Arena<Node>,
    id: Slot,
    dst: &mut Arena<Node>,
    parent: Option<Slot>,
) -> Slot {
    let n = &src[id];
    let new_id = dst.alloc(Node {
        kind: n.kind,
        value: n.value.clone(),
        children: Vec::with_capacity(n.children.len()),
        parent,
        alternative: n.alternative,
        non_term_count: 0,
        self_recursive_children: 0,
    });
    for c in n.children.iter() {
        let copied = copy_into(src, *c, dst, Some(new_id));
        dst[new_id].children.push(copied);
    }
    update_counts(dst, new_id);
    new_id
}

/// A derivation tree: every node reachable from `root` is exclusively owned
/// by this tree.
#[derive(Debug)]
pub struct Tree {
    id: u64,
    arena: Arena<Node>,
    root: Slot,
    max_depth: usize,
    /// Serialized form, valid until the next structural change.
    pub(crate) data: Option<Vec<u8>>,
}

impl Tree {
    pub(crate) fn from_parts(arena: Arena<Node>, root: Slot, max_depth: usize) -> Self {
        Self {
            id: next_tree_id(),
            arena,
            root,
            max_depth,
            data: None,
        }
    }

    /// A tree made of a single `symbol` node holding `bytes` verbatim.
    pub fn opaque(symbol: Symbol, bytes: Vec<u8>) -> Self {
        let mut arena = Arena::new();
        let root = arena.alloc(Node::leaf(symbol, bytes, None));
        Self::from_parts(arena, root, 0)
    }

    pub(crate) fn node_id(&self, slot: Slot) -> NodeId {
        NodeId {
            tree: self.id,
            slot,
        }
    }

    /// The arena slot of `id`, if `id` was issued by this tree.
    fn slot(&self, id: NodeId) -> Option<Slot> {
        let in_bounds = (u32::from(id.slot.into_raw()) as usize) < self.arena.len();
        (id.tree == self.id && in_bounds).then_some(id.slot)
    }

    fn expect_slot(&self, id: NodeId) -> Slot {
        match self.slot(id) {
            Some(s) => s,
            None => panic!("{id:?} does not belong to tree {}", self.id),
        }
    }

    pub fn root(&self) -> NodeId {
        self.node_id(self.root)
    }

    /// Panics if `id` belongs to another tree.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.arena[self.expect_slot(id)]
    }

    pub fn symbol(&self, id: NodeId) -> Option<Symbol> {
        self.node(id).symbol()
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.node(id).children.iter().map(move |c| self.node_id(*c))
    }

    /// Depth bound the tree was generated with.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub(crate) fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub(crate) fn arena_mut(&mut self) -> &mut Arena<Node> {
        &mut self.arena
    }

    /// Number of nonterminal nodes in the tree.
    pub fn size(&self) -> usize {
        self.arena[self.root].non_term_count
    }

    /// Nonterminal count obtained by walking the tree instead of reading the
    /// cached counters.
    pub fn count_non_terminals(&self) -> usize {
        self.preorder()
            .filter(|id| self.node(*id).is_non_terminal())
            .count()
    }

    /// Height of the tree; a lone root has depth 0.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut st = vec![(self.root, 0)];
        while let Some((id, d)) = st.pop() {
            deepest = deepest.max(d);
            st.extend(self.arena[id].children.iter().map(|c| (*c, d + 1)));
        }
        deepest
    }

    pub fn preorder(&self) -> Preorder<'_> {
        Preorder {
            tree: self,
            stack: vec![self.root],
        }
    }

    /// All nodes deriving `symbol`, in pre-order.
    pub fn find(&self, symbol: Symbol) -> Vec<NodeId> {
        self.preorder()
            .filter(|id| self.symbol(*id) == Some(symbol))
            .collect()
    }

    /// Whether `id` is currently attached to this tree.
    pub fn contains(&self, id: NodeId) -> bool {
        match self.slot(id) {
            Some(slot) => self.attached(slot),
            None => false,
        }
    }

    fn attached(&self, mut cur: Slot) -> bool {
        loop {
            if cur == self.root {
                return true;
            }
            match self.arena[cur].parent {
                Some(p) if self.arena[p].children.contains(&cur) => cur = p,
                _ => return false,
            }
        }
    }

    /// Deep copy of the subtree at `id` as a standalone tree.
    #[cfg(test)]
    pub(crate) fn copy_subtree(&self, id: NodeId) -> Tree {
        let mut arena = Arena::new();
        let root = copy_into(&self.arena, self.expect_slot(id), &mut arena, None);
        Tree::from_parts(arena, root, self.max_depth)
    }

    /// Copy the subtree at `id` of `other` into this tree's storage. The copy
    /// is detached until handed to [`Tree::replace_subnode`].
    pub fn graft(&mut self, other: &Tree, id: NodeId) -> NodeId {
        let slot = copy_into(&other.arena, other.expect_slot(id), &mut self.arena, None);
        self.node_id(slot)
    }

    /// Put the detached node `new` in the slot `old` occupies, or make it the
    /// root if `old` is the root. `old` is detached but stays allocated until
    /// [`Tree::compact`]. Returns `false`, changing nothing, if `old` is not
    /// attached to this tree or `new` is not a detached node of it.
    pub fn replace_subnode(&mut self, old: NodeId, new: NodeId) -> bool {
        let (Some(old), Some(new)) = (self.slot(old), self.slot(new)) else {
            return false;
        };
        if !self.attached(old) || new == self.root || self.arena[new].parent.is_some() {
            return false;
        }

        self.data = None;

        let Some(parent) = self.arena[old].parent else {
            self.root = new;
            return true;
        };

        let Some(pos) = self.arena[parent].children.iter().position(|c| *c == old) else {
            return false;
        };
        self.arena[parent].children[pos] = new;
        self.arena[new].parent = Some(parent);
        self.arena[old].parent = None;

        let old_count = self.arena[old].non_term_count;
        let new_count = self.arena[new].non_term_count;
        update_counts(&mut self.arena, parent);
        let mut cur = self.arena[parent].parent;
        while let Some(a) = cur {
            let node = &mut self.arena[a];
            node.non_term_count = node.non_term_count + new_count - old_count;
            cur = node.parent;
        }
        true
    }

    /// Drop every node no longer reachable from the root. Outstanding
    /// `NodeId`s are invalidated.
    pub fn compact(&mut self) {
        let mut arena = Arena::new();
        let root = copy_into(&self.arena, self.root, &mut arena, None);
        self.id = next_tree_id();
        self.arena = arena;
        self.root = root;
    }

    /// Number of allocated nodes, including detached ones awaiting
    /// [`Tree::compact`].
    pub fn allocated(&self) -> usize {
        self.arena.len()
    }

    /// Verify parent links and counters. Meant for tests and debugging.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.arena[self.root].parent.is_some() {
            return Err("root has a parent".into());
        }
        let mut seen = vec![false; self.arena.len()];
        let mut st = vec![self.root];
        while let Some(id) = st.pop() {
            let i = u32::from(id.into_raw()) as usize;
            if seen[i] {
                return Err(format!("node {i} reachable twice"));
            }
            seen[i] = true;

            let n = &self.arena[id];
            st.extend(n.children.iter().copied());
            for c in n.children.iter() {
                if self.arena[*c].parent != Some(id) {
                    return Err(format!("child of node {i} has a stale parent link"));
                }
            }
            let expected = usize::from(n.is_non_terminal())
                + n.children
                    .iter()
                    .map(|c| self.arena[*c].non_term_count)
                    .sum::<usize>();
            if n.non_term_count != expected {
                return Err(format!(
                    "node {i} counts {} nonterminals, expected {expected}",
                    n.non_term_count
                ));
            }
            let recursive = n
                .children
                .iter()
                .filter(|c| n.symbol().is_some() && self.arena[**c].symbol() == n.symbol())
                .count();
            if n.self_recursive_children != recursive {
                return Err(format!("node {i} has a wrong recursion count"));
            }
        }
        Ok(())
    }
}

impl Clone for Tree {
    fn clone(&self) -> Self {
        let mut arena = Arena::new();
        let root = copy_into(&self.arena, self.root, &mut arena, None);
        Self {
            data: self.data.clone(),
            ..Self::from_parts(arena, root, self.max_depth)
        }
    }
}

/// Structural equality: symbols, values and children in order. Cached
/// serializations and generation bounds are ignored.
impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        let mut st = vec![(self.root, other.root)];
        while let Some((a, b)) = st.pop() {
            let (na, nb) = (&self.arena[a], &other.arena[b]);
            if na.kind != nb.kind || na.value != nb.value || na.children.len() != nb.children.len() {
                return false;
            }
            st.extend(na.children.iter().copied().zip(nb.children.iter().copied()));
        }
        true
    }
}

impl Eq for Tree {}

pub struct Preorder<'t> {
    tree: &'t Tree,
    stack: Vec<Slot>,
}

impl Iterator for Preorder<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.stack.pop()?;
        self.stack
            .extend(self.tree.arena[id].children.iter().rev().copied());
        Some(self.tree.node_id(id))
    }
}

#[cfg(test)]
mod tests {
    use la_arena::RawIdx;

    use super::*;
    use crate::symbol::SymbolTable;

    // object -> "{" ws "}", ws -> " " ws | <pool "">
    fn sample(st: &mut SymbolTable) -> Tree {
        let object = st.intern("object");
        let ws = st.intern("ws");

        let mut arena = Arena::new();
        let root = arena.alloc(Node::interior(object, 0, None));
        let open = arena.alloc(Node::terminal(b"{".to_vec(), Some(root)));
        let ws1 = arena.alloc(Node::interior(ws, 1, Some(root)));
        let close = arena.alloc(Node::terminal(b"}".to_vec(), Some(root)));
        let space = arena.alloc(Node::terminal(b" ".to_vec(), Some(ws1)));
        let ws2 = arena.alloc(Node::leaf(ws, Vec::new(), Some(ws1)));
        arena[ws1].children = vec![space, ws2];
        arena[root].children = vec![open, ws1, close];
        update_counts(&mut arena, ws1);
        update_counts(&mut arena, root);
        Tree::from_parts(arena, root, 3)
    }

    fn detached(t: &mut Tree, node: Node) -> NodeId {
        let slot = t.arena_mut().alloc(node);
        t.node_id(slot)
    }

    #[test]
    fn counts_follow_children() {
        let mut st = SymbolTable::new();
        let t = sample(&mut st);
        assert_eq!(t.size(), 3);
        assert_eq!(t.count_non_terminals(), 3);
        assert_eq!(t.depth(), 2);
        let ws = st.lookup("ws").unwrap();
        let found = t.find(ws);
        assert_eq!(found.len(), 2);
        assert_eq!(t.node(found[0]).self_recursive_children, 1);
        t.check_invariants().unwrap();
    }

    #[test]
    fn clone_is_deep_and_equal() {
        let mut st = SymbolTable::new();
        let t = sample(&mut st);
        let mut c = t.clone();
        assert_eq!(t, c);

        let ws = st.lookup("ws").unwrap();
        let inner = c.find(ws)[1];
        let replacement = detached(&mut c, Node::leaf(ws, b"\n".to_vec(), None));
        assert!(c.replace_subnode(inner, replacement));
        assert_ne!(t, c);
        assert_eq!(t.node(t.find(ws)[1]).value.as_deref(), Some(&b""[..]));
        t.check_invariants().unwrap();
        c.check_invariants().unwrap();
    }

    #[test]
    fn replace_updates_ancestor_counts() {
        let mut st = SymbolTable::new();
        let mut t = sample(&mut st);
        let object = st.lookup("object").unwrap();
        let ws = st.lookup("ws").unwrap();

        // Swap the outer ws for a two-level chain.
        let outer = t.find(ws)[0];
        let mut other = t.copy_subtree(outer);
        let other_root = other.root();
        let inner = other.find(ws)[1];
        let deeper = other.copy_subtree(other_root);
        let grafted = other.graft(&deeper, deeper.root());
        assert!(other.replace_subnode(inner, grafted));
        other.compact();
        assert_eq!(other.size(), 3);

        let new = t.graft(&other, other.root());
        assert!(t.replace_subnode(outer, new));
        assert_eq!(t.size(), 4);
        assert_eq!(t.symbol(t.root()), Some(object));
        t.check_invariants().unwrap();
    }

    #[test]
    fn replace_root() {
        let mut st = SymbolTable::new();
        let mut t = sample(&mut st);
        let object = st.lookup("object").unwrap();
        let leaf = detached(&mut t, Node::leaf(object, b"{}".to_vec(), None));
        let old_root = t.root();
        assert!(t.replace_subnode(old_root, leaf));
        assert_eq!(t.root(), leaf);
        assert_eq!(t.size(), 1);
        assert!(!t.contains(old_root));

        t.compact();
        assert_eq!(t.allocated(), 1);
        t.check_invariants().unwrap();
    }

    #[test]
    fn replace_rejects_foreign_nodes() {
        let mut st = SymbolTable::new();
        let mut t = sample(&mut st);
        let ws = st.lookup("ws").unwrap();
        let outer = t.find(ws)[0];
        let inner = t.find(ws)[1];

        let bogus = t.node_id(Idx::from_raw(RawIdx::from(1000u32)));
        let leaf = detached(&mut t, Node::leaf(ws, Vec::new(), None));
        assert!(!t.contains(bogus));
        assert!(!t.replace_subnode(bogus, leaf));

        // Already attached nodes can't be placed a second time.
        assert!(!t.replace_subnode(outer, inner));

        // A detached node is no longer part of the tree.
        assert!(t.replace_subnode(inner, leaf));
        let other = detached(&mut t, Node::leaf(ws, Vec::new(), None));
        assert!(!t.replace_subnode(inner, other));
        t.check_invariants().unwrap();
    }

    #[test]
    fn ids_of_other_trees_are_rejected() {
        let mut st = SymbolTable::new();
        let mut a = sample(&mut st);
        let b = sample(&mut st);
        let ws = st.lookup("ws").unwrap();
        let before = a.clone();

        // Same shape, so every slot of `b` is in range and attached in `a`.
        let foreign = b.find(ws)[0];
        assert!(b.contains(foreign));
        assert!(!a.contains(foreign));
        let leaf = detached(&mut a, Node::leaf(ws, Vec::new(), None));
        assert!(!a.replace_subnode(foreign, leaf));
        assert!(!a.replace_subnode(a.root(), b.root()));
        assert_eq!(a, before);

        // Clones are separate trees too.
        let c = a.clone();
        assert!(!a.contains(c.root()));
        assert!(c.contains(c.root()));
    }

    #[test]
    fn compact_invalidates_ids() {
        let mut st = SymbolTable::new();
        let mut t = sample(&mut st);
        let ws = st.lookup("ws").unwrap();
        let stale = t.find(ws)[0];
        t.compact();
        assert!(!t.contains(stale));
        assert!(t.contains(t.find(ws)[0]));
    }

    #[test]
    fn opaque_tree_is_single_node() {
        let mut st = SymbolTable::new();
        let start = st.intern("start");
        let t = Tree::opaque(start, b"raw".to_vec());
        assert_eq!(t.size(), 1);
        assert_eq!(t.depth(), 0);
        assert!(t.node(t.root()).is_leaf());
    }
}
