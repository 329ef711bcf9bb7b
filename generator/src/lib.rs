//! Grammar-driven test-case generation and mutation.
//!
//! A [`Grammar`] table drives a [`Generator`] that builds derivation
//! [`Tree`]s; a [`TreeMutator`] derives new trees from existing ones, and
//! trees turn into bytes through [`Tree::unparse`] and back through a
//! [`Parser`]. All randomness flows through an explicit [`GeneratorState`],
//! so runs are reproducible from a seed and independent workers never share
//! state.

mod emit;
mod generator;
mod grammar;
mod mutator;
mod parse;
mod symbol;
mod tree;

pub use crate::emit::{Emit, Emitter};
pub use crate::generator::{Generator, GeneratorConfig, GeneratorState};
pub use crate::grammar::{
    Alternative, Grammar, GrammarDef, GrammarError, Item, ItemDef, Rule, RuleDef,
};
pub use crate::mutator::{
    pick_node, MutationConfig, MutationError, Mutator, Strategy, TreeMutator,
};
pub use crate::parse::{Fidelity, ParseConfig, ParseError, Parsed, Parser};
pub use crate::symbol::{Symbol, SymbolTable};
pub use crate::tree::{Node, NodeId, NodeKind, Preorder, Tree};

pub fn generate_with_config(grammar: &Grammar, config: GeneratorConfig, seed: u64) -> Vec<u8> {
    let g = Generator::with_config(grammar, config);
    let mut t = g.generate_tree(&mut GeneratorState::seeded(seed));
    t.unparse().to_vec()
}

/// One JSON document from the bundled grammar.
pub fn generate(seed: u64) -> Vec<u8> {
    generate_with_config(&Grammar::json(), GeneratorConfig::default(), seed)
}
