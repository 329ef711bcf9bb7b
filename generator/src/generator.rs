use la_arena::Arena;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::grammar::{Grammar, Item, Rule};
use crate::symbol::Symbol;
use crate::tree::{update_counts, Node, Slot, Tree};

/// Everything a generation run mutates: the random source and the bounds of
/// the tree currently being built. One state per worker; nothing is shared.
pub struct GeneratorState<R: Rng = StdRng> {
    pub rng: R,
    max_depth: usize,
    emitted: usize,
}

impl<R: Rng> GeneratorState<R> {
    pub fn new(rng: R) -> Self {
        Self {
            rng,
            max_depth: 0,
            emitted: 0,
        }
    }

    fn begin(&mut self, max_depth: usize) {
        self.max_depth = max_depth;
        self.emitted = 0;
    }

    /// Nodes allocated by the most recent generation call.
    pub fn emitted(&self) -> usize {
        self.emitted
    }
}

impl GeneratorState<StdRng> {
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }
}

#[derive(Debug, Copy, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Bounds for the depth drawn by `generate_tree` and by mutations.
    pub min_depth: usize,
    pub max_depth: usize,
    /// Past this many nodes every nonterminal is cut off as if the depth
    /// bound had been hit.
    pub node_limit: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            min_depth: 1,
            max_depth: 15,
            node_limit: 50_000,
        }
    }
}

/// How to pick the production for the node being expanded.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Choice {
    Any,
    Forced(usize),
    Except(usize),
}

/// Table-driven recursive-descent generator.
///
/// A node at depth `d` is expanded through one of its productions while
/// `d < max_depth`; from there on it becomes a leaf holding one of its
/// termination-pool strings. The root sits at depth 0, so a bound of 0 yields
/// a single pool leaf.
#[derive(Clone, Copy)]
pub struct Generator<'g> {
    grammar: &'g Grammar,
    config: GeneratorConfig,
}

impl<'g> Generator<'g> {
    pub fn new(grammar: &'g Grammar) -> Self {
        Self::with_config(grammar, GeneratorConfig::default())
    }

    pub fn with_config(grammar: &'g Grammar, config: GeneratorConfig) -> Self {
        Self { grammar, config }
    }

    pub fn grammar(&self) -> &'g Grammar {
        self.grammar
    }

    /// Draw a depth bound from the configured range.
    pub fn draw_depth<R: Rng>(&self, state: &mut GeneratorState<R>) -> usize {
        let hi = self.config.max_depth;
        let lo = self.config.min_depth.min(hi);
        state.rng.random_range(lo..=hi)
    }

    /// A fresh tree for the start symbol with a newly drawn depth bound.
    pub fn generate_tree<R: Rng>(&self, state: &mut GeneratorState<R>) -> Tree {
        let max_depth = self.draw_depth(state);
        self.generate(self.grammar.start(), max_depth, state)
    }

    pub fn generate<R: Rng>(
        &self,
        symbol: Symbol,
        max_depth: usize,
        state: &mut GeneratorState<R>,
    ) -> Tree {
        self.build(symbol, Choice::Any, max_depth, state)
    }

    /// Like [`Generator::generate`], but the root is expanded with
    /// `alternative`. The choice is moot when `max_depth` is 0.
    ///
    /// Panics if `symbol` has no such alternative.
    pub fn generate_with<R: Rng>(
        &self,
        symbol: Symbol,
        alternative: usize,
        max_depth: usize,
        state: &mut GeneratorState<R>,
    ) -> Tree {
        assert!(
            alternative < self.grammar.rule(symbol).alternatives.len(),
            "`{}` has no alternative {alternative}",
            self.grammar.name(symbol)
        );
        self.build(symbol, Choice::Forced(alternative), max_depth, state)
    }

    /// Like [`Generator::generate`], but the root avoids `excluded` whenever
    /// the rule offers anything else.
    pub fn generate_excluding<R: Rng>(
        &self,
        symbol: Symbol,
        excluded: usize,
        max_depth: usize,
        state: &mut GeneratorState<R>,
    ) -> Tree {
        self.build(symbol, Choice::Except(excluded), max_depth, state)
    }

    fn build<R: Rng>(
        &self,
        symbol: Symbol,
        choice: Choice,
        max_depth: usize,
        state: &mut GeneratorState<R>,
    ) -> Tree {
        let mut arena = Arena::new();
        let root = self.generate_into(&mut arena, symbol, choice, max_depth, state);
        let tree = Tree::from_parts(arena, root, max_depth);
        tracing::trace!(
            symbol = self.grammar.name(symbol),
            max_depth,
            nodes = state.emitted,
            size = tree.size(),
            "generated tree"
        );
        tree
    }

    /// Generate a detached subtree into an existing arena.
    pub(crate) fn generate_into<R: Rng>(
        &self,
        arena: &mut Arena<Node>,
        symbol: Symbol,
        choice: Choice,
        max_depth: usize,
        state: &mut GeneratorState<R>,
    ) -> Slot {
        state.begin(max_depth);
        self.expand(arena, symbol, None, 0, choice, state)
    }

    fn expand<R: Rng>(
        &self,
        arena: &mut Arena<Node>,
        symbol: Symbol,
        parent: Option<Slot>,
        depth: usize,
        choice: Choice,
        state: &mut GeneratorState<R>,
    ) -> Slot {
        let rule = self.grammar.rule(symbol);
        state.emitted += 1;

        if depth >= state.max_depth || state.emitted > self.config.node_limit {
            let i = state.rng.random_range(0..rule.pool.len());
            return arena.alloc(Node::leaf(symbol, rule.pool[i].clone(), parent));
        }

        let alternative = choose(rule, choice, &mut state.rng);
        let id = arena.alloc(Node::interior(symbol, alternative, parent));
        for item in rule.alternatives[alternative].iter() {
            let child = match item {
                Item::Literal(bytes) => {
                    state.emitted += 1;
                    arena.alloc(Node::terminal(bytes.clone(), Some(id)))
                }
                Item::NonTerminal(s) => {
                    self.expand(arena, *s, Some(id), depth + 1, Choice::Any, state)
                }
            };
            arena[id].children.push(child);
        }
        update_counts(arena, id);
        id
    }
}

fn choose<R: Rng>(rule: &Rule, choice: Choice, rng: &mut R) -> usize {
    let n = rule.alternatives.len();
    match choice {
        Choice::Forced(i) => i,
        Choice::Except(e) if n > 1 && e < n => {
            let i = rng.random_range(0..n - 1);
            if i >= e {
                i + 1
            } else {
                i
            }
        }
        _ => rng.random_range(0..n),
    }
}
