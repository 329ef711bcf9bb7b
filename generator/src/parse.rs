//! Reconstruction of derivation trees from raw bytes.
//!
//! Parsing runs in two passes. A memoized recognizer first computes, for
//! every `(symbol, offset)` it visits, the set of offsets where a derivation
//! of that symbol can end. A second pass then rebuilds one derivation that
//! spans the whole input, preferring productions in grammar order and falling
//! back to termination-pool strings, which the generator may leave in place
//! of any nonterminal.
//!
//! Left-recursive cycles are cut when they are re-entered at the same offset,
//! so grammars relying on them only parse partially. [`Parser::parse_or_wrap`]
//! covers those cases by wrapping the input in a single opaque node.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use la_arena::Arena;
use serde::Deserialize;
use thiserror::Error;

use crate::grammar::{Grammar, Item};
use crate::symbol::Symbol;
use crate::tree::{update_counts, Node, Slot, Tree};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("input does not derive from the grammar (matched up to byte {offset})")]
    NoDerivation { offset: usize },

    #[error("input is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },

    #[error("derivation nests deeper than {0} levels")]
    TooDeep(usize),

    #[error("gave up after {0} steps")]
    BudgetExhausted(usize),
}

#[derive(Debug, Copy, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ParseConfig {
    /// Longest input attempted, in bytes.
    pub max_len: usize,
    /// Deepest nesting of rule applications. Right-recursive list rules nest
    /// once per element: each further JSON array element costs three levels,
    /// so the default stops somewhat above 300 elements per array and the
    /// input falls back to an opaque tree.
    pub max_depth: usize,
    /// Recognizer steps before giving up.
    pub step_limit: usize,
}

impl Default for ParseConfig {
    fn default() -> Self {
        Self {
            max_len: 64 * 1024,
            max_depth: 1024,
            step_limit: 10_000_000,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fidelity {
    /// Every byte is accounted for by a derivation under the grammar.
    Full,
    /// The input sits verbatim in a single start-symbol node.
    Opaque,
}

#[derive(Debug)]
pub struct Parsed {
    pub tree: Tree,
    pub fidelity: Fidelity,
    /// Why a full parse was not possible.
    pub error: Option<ParseError>,
}

pub struct Parser<'g> {
    grammar: &'g Grammar,
    config: ParseConfig,
}

impl<'g> Parser<'g> {
    pub fn new(grammar: &'g Grammar) -> Self {
        Self::with_config(grammar, ParseConfig::default())
    }

    pub fn with_config(grammar: &'g Grammar, config: ParseConfig) -> Self {
        Self { grammar, config }
    }

    /// Derive `input` from the start symbol.
    pub fn parse(&self, input: &[u8]) -> Result<Tree, ParseError> {
        self.parse_symbol(self.grammar.start(), input)
    }

    /// Derive `input` from `symbol`.
    pub fn parse_symbol(&self, symbol: Symbol, input: &[u8]) -> Result<Tree, ParseError> {
        if input.len() > self.config.max_len {
            return Err(ParseError::TooLong {
                len: input.len(),
                max: self.config.max_len,
            });
        }

        let mut r = Recognizer {
            grammar: self.grammar,
            input,
            config: self.config,
            memo: HashMap::new(),
            active: HashSet::new(),
            building: HashSet::new(),
            steps: 0,
            depth: 0,
            furthest: 0,
        };

        if !r.ends(symbol, 0)?.contains(&input.len()) {
            return Err(ParseError::NoDerivation { offset: r.furthest });
        }

        let mut arena = Arena::new();
        let Some(root) = r.build(&mut arena, symbol, 0, input.len(), None)? else {
            return Err(ParseError::NoDerivation { offset: r.furthest });
        };

        // Abandoned attempts leave unreachable nodes behind.
        let mut tree = Tree::from_parts(arena, root, 0);
        tree.compact();
        let depth = tree.depth();
        tracing::trace!(len = input.len(), steps = r.steps, size = tree.size(), "parsed input");
        Ok(tree.with_max_depth(depth))
    }

    /// Parse `input`, or wrap it unparsed if no derivation can be found.
    pub fn parse_or_wrap(&self, input: &[u8]) -> Parsed {
        match self.parse(input) {
            Ok(tree) => Parsed {
                tree,
                fidelity: Fidelity::Full,
                error: None,
            },
            Err(e) => {
                tracing::debug!(error = %e, len = input.len(), "falling back to opaque tree");
                Parsed {
                    tree: Tree::opaque(self.grammar.start(), input.to_vec()),
                    fidelity: Fidelity::Opaque,
                    error: Some(e),
                }
            }
        }
    }
}

struct Recognizer<'g, 'i> {
    grammar: &'g Grammar,
    input: &'i [u8],
    config: ParseConfig,
    /// End offsets reachable from `(symbol, start)`, ascending.
    memo: HashMap<(Symbol, usize), Rc<Vec<usize>>>,
    active: HashSet<(Symbol, usize)>,
    building: HashSet<(Symbol, usize, usize)>,
    steps: usize,
    depth: usize,
    furthest: usize,
}

impl Recognizer<'_, '_> {
    fn step(&mut self) -> Result<(), ParseError> {
        self.steps += 1;
        if self.steps > self.config.step_limit {
            return Err(ParseError::BudgetExhausted(self.config.step_limit));
        }
        Ok(())
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > self.config.max_depth {
            return Err(ParseError::TooDeep(self.config.max_depth));
        }
        Ok(())
    }

    fn matches(&mut self, lit: &[u8], pos: usize) -> bool {
        let ok = self.input[pos..].starts_with(lit);
        if ok {
            self.furthest = self.furthest.max(pos + lit.len());
        }
        ok
    }

    fn ends(&mut self, symbol: Symbol, pos: usize) -> Result<Rc<Vec<usize>>, ParseError> {
        if let Some(e) = self.memo.get(&(symbol, pos)) {
            return Ok(Rc::clone(e));
        }
        if !self.active.insert((symbol, pos)) {
            return Ok(Rc::new(Vec::new()));
        }
        self.enter()?;

        let grammar = self.grammar;
        let rule = grammar.rule(symbol);
        let mut out = BTreeSet::new();
        for alt in rule.alternatives.iter() {
            out.extend(self.seq_ends(alt, pos)?);
        }
        for p in rule.pool.iter() {
            if self.matches(p, pos) {
                out.insert(pos + p.len());
            }
        }

        self.depth -= 1;
        self.active.remove(&(symbol, pos));
        let ends = Rc::new(out.into_iter().collect::<Vec<_>>());
        self.memo.insert((symbol, pos), Rc::clone(&ends));
        Ok(ends)
    }

    fn seq_ends(&mut self, items: &[Item], pos: usize) -> Result<BTreeSet<usize>, ParseError> {
        let mut cur = BTreeSet::from([pos]);
        for item in items {
            let mut next = BTreeSet::new();
            for p in cur {
                self.step()?;
                match item {
                    Item::Literal(lit) => {
                        if self.matches(lit, p) {
                            next.insert(p + lit.len());
                        }
                    }
                    Item::NonTerminal(s) => next.extend(self.ends(*s, p)?.iter().copied()),
                }
            }
            if next.is_empty() {
                return Ok(next);
            }
            cur = next;
        }
        Ok(cur)
    }

    /// Find offsets splitting `input[pos..end]` over `items`.
    fn split(
        &mut self,
        items: &[Item],
        pos: usize,
        end: usize,
        out: &mut Vec<(usize, usize)>,
    ) -> Result<bool, ParseError> {
        self.step()?;
        let Some((first, rest)) = items.split_first() else {
            return Ok(pos == end);
        };
        match first {
            Item::Literal(lit) => {
                if pos + lit.len() <= end && self.input[pos..].starts_with(lit) {
                    out.push((pos, pos + lit.len()));
                    if self.split(rest, pos + lit.len(), end, out)? {
                        return Ok(true);
                    }
                    out.pop();
                }
            }
            Item::NonTerminal(s) => {
                let ends = self.ends(*s, pos)?;
                for e in ends.iter().rev().copied().filter(|e| *e <= end) {
                    out.push((pos, e));
                    if self.split(rest, e, end, out)? {
                        return Ok(true);
                    }
                    out.pop();
                }
            }
        }
        Ok(false)
    }

    fn build(
        &mut self,
        arena: &mut Arena<Node>,
        symbol: Symbol,
        start: usize,
        end: usize,
        parent: Option<Slot>,
    ) -> Result<Option<Slot>, ParseError> {
        if !self.building.insert((symbol, start, end)) {
            return Ok(None);
        }
        self.enter()?;

        let grammar = self.grammar;
        let rule = grammar.rule(symbol);
        let mut found = None;

        'alternatives: for (i, alt) in rule.alternatives.iter().enumerate() {
            let mut spans = Vec::with_capacity(alt.len());
            if !self.split(alt, start, end, &mut spans)? {
                continue;
            }
            let id = arena.alloc(Node::interior(symbol, i, parent));
            for (item, (s, e)) in alt.iter().zip(spans) {
                let child = match item {
                    Item::Literal(lit) => arena.alloc(Node::terminal(lit.clone(), Some(id))),
                    Item::NonTerminal(n) => match self.build(arena, *n, s, e, Some(id))? {
                        Some(c) => c,
                        None => continue 'alternatives,
                    },
                };
                arena[id].children.push(child);
            }
            update_counts(arena, id);
            found = Some(id);
            break;
        }

        if found.is_none() {
            let span = &self.input[start..end];
            if rule.pool.iter().any(|p| p.as_slice() == span) {
                found = Some(arena.alloc(Node::leaf(symbol, span.to_vec(), parent)));
            }
        }

        self.depth -= 1;
        self.building.remove(&(symbol, start, end));
        Ok(found)
    }
}
