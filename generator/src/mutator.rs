use std::collections::HashSet;

use rand::Rng;
use serde::Deserialize;
use thiserror::Error;

use crate::generator::{Choice, Generator, GeneratorConfig, GeneratorState};
use crate::grammar::Grammar;
use crate::symbol::Symbol;
use crate::tree::{NodeId, Tree};

/// A Mutator derives a new value from an existing one, leaving the input
/// untouched.
pub trait Mutator<T, C> {
    fn mutate(&self, obj: &T, context: &mut C) -> T;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("the trees have no nonterminal symbol in common")]
    NoMatchingSymbol,

    #[error("node is not part of the tree")]
    NodeNotInTree,

    #[error("terminal nodes cannot be spliced")]
    TerminalNode,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Strategy {
    Random,
    Rule,
    Recursive,
}

#[derive(Debug, Copy, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MutationConfig {
    pub generator: GeneratorConfig,
    /// Relative odds of each strategy in [`TreeMutator::havoc`].
    pub random_weight: u32,
    pub rule_weight: u32,
    pub recursive_weight: u32,
    /// Bounds on the number of rounds of a recursive mutation.
    pub min_rounds: usize,
    pub max_rounds: usize,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            generator: GeneratorConfig::default(),
            random_weight: 4,
            rule_weight: 4,
            recursive_weight: 1,
            min_rounds: 2,
            max_rounds: 8,
        }
    }
}

/// Uniformly pick a nonterminal node of `tree`.
///
/// A single draw `r` in `[0, size)` is walked down the tree: the current node
/// takes the first slot and each child the next `non_term_count` slots, so
/// every nonterminal is hit with probability `1 / size`.
pub fn pick_node<R: Rng>(tree: &Tree, rng: &mut R) -> NodeId {
    let mut cur = tree.root();
    if tree.size() == 0 {
        return cur;
    }
    let mut r = rng.random_range(0..tree.size());
    loop {
        if r == 0 {
            return cur;
        }
        r -= 1;

        let mut next = None;
        for c in tree.children(cur) {
            let w = tree.node(c).non_term_count;
            if r < w {
                next = Some(c);
                break;
            }
            r -= w;
        }
        match next {
            Some(c) => cur = c,
            None => return cur,
        }
    }
}

pub struct TreeMutator<'g> {
    generator: Generator<'g>,
    config: MutationConfig,
}

impl<'g> TreeMutator<'g> {
    pub fn new(grammar: &'g Grammar) -> Self {
        Self::with_config(grammar, MutationConfig::default())
    }

    pub fn with_config(grammar: &'g Grammar, config: MutationConfig) -> Self {
        Self {
            generator: Generator::with_config(grammar, config.generator),
            config,
        }
    }

    pub fn generator(&self) -> &Generator<'g> {
        &self.generator
    }

    fn name(&self, sym: Symbol) -> &str {
        self.generator.grammar().name(sym)
    }

    /// Regenerate the subtree of one uniformly picked node with a fresh depth
    /// bound.
    pub fn random_mutation<R: Rng>(&self, tree: &Tree, state: &mut GeneratorState<R>) -> Tree {
        let mut out = tree.clone();
        let node = pick_node(&out, &mut state.rng);
        self.regenerate(&mut out, node, Choice::Any, state);
        out
    }

    /// Like [`TreeMutator::random_mutation`], but the new subtree starts with a
    /// production other than the one the picked node was built with.
    pub fn rule_mutation<R: Rng>(&self, tree: &Tree, state: &mut GeneratorState<R>) -> Tree {
        let mut out = tree.clone();
        let node = pick_node(&out, &mut state.rng);
        let choice = match out.node(node).alternative {
            Some(alt) => Choice::Except(alt),
            None => Choice::Any,
        };
        self.regenerate(&mut out, node, choice, state);
        out
    }

    /// `n` random mutations, each applied to the previous result.
    pub fn recursive_mutation<R: Rng>(
        &self,
        tree: &Tree,
        n: usize,
        state: &mut GeneratorState<R>,
    ) -> Tree {
        let mut out = tree.clone();
        for _ in 0..n {
            out = self.random_mutation(&out, state);
        }
        out
    }

    /// Replace a uniformly picked node of `a` with a copy of a node of `b`
    /// deriving the same symbol. When the picked symbol never occurs in `b`,
    /// the pick is redrawn among the nodes of `a` whose symbol does.
    pub fn splicing_mutation<R: Rng>(
        &self,
        a: &Tree,
        b: &Tree,
        rng: &mut R,
    ) -> Result<Tree, MutationError> {
        let picked = pick_node(a, rng);
        let in_donor: HashSet<Symbol> = b.preorder().filter_map(|id| b.symbol(id)).collect();

        let target = match a.symbol(picked) {
            Some(s) if in_donor.contains(&s) => picked,
            _ => {
                let candidates: Vec<NodeId> = a
                    .preorder()
                    .filter(|id| a.symbol(*id).is_some_and(|s| in_donor.contains(&s)))
                    .collect();
                if candidates.is_empty() {
                    return Err(MutationError::NoMatchingSymbol);
                }
                candidates[rng.random_range(0..candidates.len())]
            }
        };
        self.splice_at(a, target, b, rng)
    }

    /// Replace `node` of `a` with a copy of a random node of `b` with the same
    /// symbol. Neither input is modified.
    pub fn splice_at<R: Rng>(
        &self,
        a: &Tree,
        node: NodeId,
        b: &Tree,
        rng: &mut R,
    ) -> Result<Tree, MutationError> {
        if !a.contains(node) {
            return Err(MutationError::NodeNotInTree);
        }
        let symbol = a.symbol(node).ok_or(MutationError::TerminalNode)?;
        let matches = b.find(symbol);
        if matches.is_empty() {
            return Err(MutationError::NoMatchingSymbol);
        }
        let donor = matches[rng.random_range(0..matches.len())];

        // The clone is laid out afresh; locate `node` in it by position.
        let position = a
            .preorder()
            .position(|id| id == node)
            .ok_or(MutationError::NodeNotInTree)?;
        let mut out = a.clone();
        let target = out
            .preorder()
            .nth(position)
            .ok_or(MutationError::NodeNotInTree)?;

        let new = out.graft(b, donor);
        if !out.replace_subnode(target, new) {
            return Err(MutationError::NodeNotInTree);
        }
        out.compact();
        tracing::debug!(symbol = self.name(symbol), size = out.size(), "spliced subtree");
        Ok(out)
    }

    /// Pick a strategy by the configured weights and apply it.
    pub fn havoc<R: Rng>(&self, tree: &Tree, state: &mut GeneratorState<R>) -> (Strategy, Tree) {
        let strategy = self.pick_strategy(&mut state.rng);
        let out = match strategy {
            Strategy::Random => self.random_mutation(tree, state),
            Strategy::Rule => self.rule_mutation(tree, state),
            Strategy::Recursive => {
                let hi = self.config.max_rounds;
                let lo = self.config.min_rounds.min(hi);
                let n = state.rng.random_range(lo..=hi);
                self.recursive_mutation(tree, n, state)
            }
        };
        (strategy, out)
    }

    fn pick_strategy<R: Rng>(&self, rng: &mut R) -> Strategy {
        let random = u64::from(self.config.random_weight);
        let rule = u64::from(self.config.rule_weight);
        let total = random + rule + u64::from(self.config.recursive_weight);
        if total == 0 {
            return Strategy::Random;
        }
        let r = rng.random_range(0..total);
        if r < random {
            Strategy::Random
        } else if r < random + rule {
            Strategy::Rule
        } else {
            Strategy::Recursive
        }
    }

    fn regenerate<R: Rng>(
        &self,
        tree: &mut Tree,
        node: NodeId,
        choice: Choice,
        state: &mut GeneratorState<R>,
    ) {
        // pick_node never yields a terminal unless the whole tree is one.
        let Some(symbol) = tree.symbol(node) else {
            return;
        };
        let max_depth = self.generator.draw_depth(state);
        let slot = self
            .generator
            .generate_into(tree.arena_mut(), symbol, choice, max_depth, state);
        let new = tree.node_id(slot);
        let replaced = tree.replace_subnode(node, new);
        debug_assert!(replaced, "picked node must belong to the tree");
        tree.compact();
        tracing::debug!(
            symbol = self.name(symbol),
            max_depth,
            size = tree.size(),
            "regenerated subtree"
        );
    }
}

impl<R: Rng> Mutator<Tree, GeneratorState<R>> for TreeMutator<'_> {
    fn mutate(&self, obj: &Tree, context: &mut GeneratorState<R>) -> Tree {
        self.havoc(obj, context).1
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::grammar::{GrammarDef, ItemDef, RuleDef};

    fn json_tree_of_size(g: &Grammar, lo: usize, hi: usize) -> Tree {
        let gen = Generator::new(g);
        let mut state = GeneratorState::seeded(0);
        loop {
            let t = gen.generate(g.start(), 8, &mut state);
            if (lo..=hi).contains(&t.size()) {
                return t;
            }
        }
    }

    #[test]
    fn pick_node_is_uniform() {
        let g = Grammar::json();
        let t = json_tree_of_size(&g, 15, 40);
        let n = t.size();
        let mut state = GeneratorState::seeded(1);

        let trials = 100_000;
        let mut hits: HashMap<NodeId, usize> = HashMap::new();
        for _ in 0..trials {
            let id = pick_node(&t, &mut state.rng);
            assert!(t.node(id).is_non_terminal());
            *hits.entry(id).or_default() += 1;
        }

        assert_eq!(hits.len(), n);
        let expected = trials as f64 / n as f64;
        for (_, count) in hits {
            let ratio = count as f64 / expected;
            assert!((0.85..1.15).contains(&ratio), "ratio {ratio}");
        }
    }

    #[test]
    fn pick_node_on_lone_root() {
        let g = Grammar::json();
        let t = Tree::opaque(g.start(), b"null".to_vec());
        let mut state = GeneratorState::seeded(2);
        for _ in 0..10 {
            assert_eq!(pick_node(&t, &mut state.rng), t.root());
        }
    }

    #[test]
    fn random_mutation_keeps_input() {
        let g = Grammar::json();
        let m = TreeMutator::new(&g);
        let mut state = GeneratorState::seeded(3);
        let original = m.generator().generate_tree(&mut state);
        let snapshot = original.clone();

        let mut changed = 0;
        for _ in 0..100 {
            let mutated = m.random_mutation(&original, &mut state);
            mutated.check_invariants().unwrap();
            assert_eq!(mutated.allocated(), mutated.preorder().count());
            assert_eq!(mutated.symbol(mutated.root()), Some(g.start()));
            if mutated != original {
                changed += 1;
            }
        }
        assert_eq!(original, snapshot);
        assert!(changed > 30, "only {changed} of 100 mutations changed the tree");
    }

    #[test]
    fn random_mutation_of_lone_root() {
        let g = Grammar::json();
        let m = TreeMutator::new(&g);
        let mut state = GeneratorState::seeded(4);
        let t = Tree::opaque(g.start(), b"true".to_vec());
        let mutated = m.random_mutation(&t, &mut state);
        assert_eq!(mutated.symbol(mutated.root()), Some(g.start()));
        mutated.check_invariants().unwrap();
    }

    #[test]
    fn rule_mutation_switches_production() {
        let g = Grammar::from_def(
            GrammarDef::new("letter").rule(
                RuleDef::new("letter")
                    .alt([ItemDef::lit("x")])
                    .alt([ItemDef::lit("y")])
                    .alt([ItemDef::lit("z")])
                    .pool(["x"]),
            ),
        )
        .unwrap();
        let m = TreeMutator::new(&g);
        let mut state = GeneratorState::seeded(5);
        for _ in 0..30 {
            let mut t = m.generator().generate(g.start(), 1, &mut state);
            let before = t.node(t.root()).alternative.unwrap();
            let mut mutated = m.rule_mutation(&t, &mut state);
            assert_ne!(mutated.node(mutated.root()).alternative, Some(before));
            assert_ne!(mutated.unparse(), t.unparse());
        }
    }

    #[test]
    fn splicing_between_json_trees() {
        let g = Grammar::json();
        let m = TreeMutator::new(&g);
        let mut state = GeneratorState::seeded(6);
        for _ in 0..50 {
            let a = m.generator().generate_tree(&mut state);
            let b = m.generator().generate_tree(&mut state);
            let a_before = a.clone();
            let spliced = m.splicing_mutation(&a, &b, &mut state.rng).unwrap();
            spliced.check_invariants().unwrap();
            assert_eq!(spliced.symbol(spliced.root()), Some(g.start()));
            assert_eq!(a, a_before);
        }
    }

    #[test]
    fn splicing_whole_root() {
        let g = Grammar::json();
        let m = TreeMutator::new(&g);
        let mut state = GeneratorState::seeded(7);
        let a = m.generator().generate(g.start(), 6, &mut state);
        let b = Tree::opaque(g.start(), b"[1,2]".to_vec());
        let spliced = m.splicing_mutation(&a, &b, &mut state.rng).unwrap();
        assert_eq!(spliced, b);
    }

    #[test]
    fn splicing_without_common_symbol_fails() {
        let g = Grammar::json();
        let m = TreeMutator::new(&g);
        let mut state = GeneratorState::seeded(8);
        let ws = g.symbol("ws").unwrap();
        let value = g.symbol("value").unwrap();
        let a = Tree::opaque(ws, b" ".to_vec());
        let b = Tree::opaque(value, b"1".to_vec());
        assert_eq!(
            m.splicing_mutation(&a, &b, &mut state.rng),
            Err(MutationError::NoMatchingSymbol)
        );

        // A symbol present in `a` but absent from `b`.
        let string = g.symbol("string").unwrap();
        let tree = m.generator().generate_with(string, 0, 2, &mut state);
        assert_eq!(
            m.splice_at(&tree, tree.root(), &b, &mut state.rng),
            Err(MutationError::NoMatchingSymbol)
        );
    }

    #[test]
    fn splice_at_rejects_foreign_node() {
        let g = Grammar::json();
        let m = TreeMutator::new(&g);
        let mut state = GeneratorState::seeded(9);
        let a = m.generator().generate(g.start(), 6, &mut state);
        let b = m.generator().generate(g.start(), 6, &mut state);
        let before = a.clone();

        // Both trees start with start -> json -> element, so these slots are
        // in range and attached in either tree.
        for foreign in b.preorder().take(3) {
            assert!(!a.contains(foreign));
            assert_eq!(
                m.splice_at(&a, foreign, &b, &mut state.rng),
                Err(MutationError::NodeNotInTree)
            );
        }
        assert_eq!(a, before);

        let own = a.preorder().nth(1).unwrap();
        assert!(m.splice_at(&a, own, &b, &mut state.rng).is_ok());
    }

    #[test]
    fn recursive_mutation_rounds() {
        let g = Grammar::json();
        let m = TreeMutator::new(&g);
        let mut state = GeneratorState::seeded(10);
        let t = m.generator().generate_tree(&mut state);
        assert_eq!(m.recursive_mutation(&t, 0, &mut state), t);
        let mutated = m.recursive_mutation(&t, 5, &mut state);
        mutated.check_invariants().unwrap();
    }

    #[test]
    fn huge_weights_do_not_overflow() {
        let g = Grammar::json();
        let config = MutationConfig {
            random_weight: u32::MAX,
            rule_weight: u32::MAX,
            recursive_weight: u32::MAX,
            ..MutationConfig::default()
        };
        let m = TreeMutator::with_config(&g, config);
        let mut state = GeneratorState::seeded(12);
        let mut seen = HashSet::new();
        for _ in 0..60 {
            seen.insert(m.pick_strategy(&mut state.rng));
        }
        assert_eq!(seen.len(), 3);

        let t = m.generator().generate_tree(&mut state);
        m.havoc(&t, &mut state).1.check_invariants().unwrap();
    }

    #[test]
    fn havoc_respects_weights() {
        let g = Grammar::json();
        let config = MutationConfig {
            random_weight: 0,
            rule_weight: 1,
            recursive_weight: 0,
            ..MutationConfig::default()
        };
        let m = TreeMutator::with_config(&g, config);
        let mut state = GeneratorState::seeded(11);
        let t = m.generator().generate_tree(&mut state);
        for _ in 0..10 {
            let (strategy, out) = m.havoc(&t, &mut state);
            assert_eq!(strategy, Strategy::Rule);
            out.check_invariants().unwrap();
        }
        let out = m.mutate(&t, &mut state);
        out.check_invariants().unwrap();
    }
}
