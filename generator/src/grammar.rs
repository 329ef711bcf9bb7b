//! Grammar tables.
//!
//! A grammar is plain data: every nonterminal has an ordered list of
//! production alternatives and a termination pool of literal strings that the
//! generator falls back to once its depth bound is exceeded. Grammars are
//! either deserialized from TOML or assembled in code through [`GrammarDef`],
//! and are validated once when they are built. A [`Grammar`] that exists is
//! always usable for generation.

use std::collections::HashSet;

use serde::Deserialize;
use thiserror::Error;

use crate::symbol::{Symbol, SymbolTable};

const JSON_GRAMMAR: &str = include_str!("../grammars/json.toml");

#[derive(Debug, Error)]
pub enum GrammarError {
    #[error("grammar defines no rules")]
    NoRules,

    #[error("start symbol `{0}` has no rule")]
    MissingStart(String),

    #[error("rule `{0}` is defined more than once")]
    DuplicateRule(String),

    #[error("rule `{0}` has no production alternatives")]
    NoAlternatives(String),

    #[error("rule `{0}` has an empty termination pool")]
    EmptyPool(String),

    #[error("rule `{rule}` refers to undefined nonterminal `{name}`")]
    UndefinedSymbol { rule: String, name: String },

    #[error("invalid grammar file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// One symbol on the right-hand side of a production.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Item {
    Literal(Vec<u8>),
    NonTerminal(Symbol),
}

pub type Alternative = Vec<Item>;

#[derive(Clone, Debug)]
pub struct Rule {
    pub alternatives: Vec<Alternative>,
    pub pool: Vec<Vec<u8>>,
}

/// Unvalidated, name-based grammar description.
#[derive(Clone, Debug, Deserialize)]
pub struct GrammarDef {
    pub start: String,
    #[serde(rename = "rule", default)]
    pub rules: Vec<RuleDef>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuleDef {
    pub name: String,
    #[serde(default)]
    pub alternatives: Vec<Vec<ItemDef>>,
    #[serde(default)]
    pub pool: Vec<String>,
}

/// In TOML a bare string names a nonterminal and `{ lit = "..." }` is a
/// terminal literal.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ItemDef {
    Ref(String),
    Literal { lit: String },
}

impl ItemDef {
    pub fn sym(name: &str) -> Self {
        ItemDef::Ref(name.to_owned())
    }

    pub fn lit(s: &str) -> Self {
        ItemDef::Literal { lit: s.to_owned() }
    }
}

impl GrammarDef {
    pub fn new(start: &str) -> Self {
        Self {
            start: start.to_owned(),
            rules: Vec::new(),
        }
    }

    pub fn rule(mut self, rule: RuleDef) -> Self {
        self.rules.push(rule);
        self
    }
}

impl RuleDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            alternatives: Vec::new(),
            pool: Vec::new(),
        }
    }

    pub fn alt(mut self, items: impl IntoIterator<Item = ItemDef>) -> Self {
        self.alternatives.push(items.into_iter().collect());
        self
    }

    /// Add the empty production.
    pub fn epsilon(mut self) -> Self {
        self.alternatives.push(Vec::new());
        self
    }

    pub fn pool<'a>(mut self, entries: impl IntoIterator<Item = &'a str>) -> Self {
        self.pool.extend(entries.into_iter().map(str::to_owned));
        self
    }
}

/// A validated grammar table, indexed by [`Symbol`].
#[derive(Clone, Debug)]
pub struct Grammar {
    symbols: SymbolTable,
    rules: Vec<Rule>,
    start: Symbol,
}

impl Grammar {
    pub fn from_def(def: GrammarDef) -> Result<Self, GrammarError> {
        if def.rules.is_empty() {
            return Err(GrammarError::NoRules);
        }

        // Intern every rule name first so references may point forward.
        let mut symbols = SymbolTable::new();
        for r in def.rules.iter() {
            if symbols.lookup(&r.name).is_some() {
                return Err(GrammarError::DuplicateRule(r.name.clone()));
            }
            symbols.intern(&r.name);
        }

        let start = symbols
            .lookup(&def.start)
            .ok_or_else(|| GrammarError::MissingStart(def.start.clone()))?;

        let mut rules = Vec::with_capacity(def.rules.len());
        for r in def.rules {
            if r.alternatives.is_empty() {
                return Err(GrammarError::NoAlternatives(r.name));
            }
            if r.pool.is_empty() {
                return Err(GrammarError::EmptyPool(r.name));
            }

            let mut alternatives = Vec::with_capacity(r.alternatives.len());
            for alt in r.alternatives.iter() {
                let mut items = Vec::with_capacity(alt.len());
                for item in alt {
                    items.push(match item {
                        ItemDef::Literal { lit } => Item::Literal(lit.clone().into_bytes()),
                        ItemDef::Ref(name) => match symbols.lookup(name) {
                            Some(s) => Item::NonTerminal(s),
                            None => {
                                return Err(GrammarError::UndefinedSymbol {
                                    rule: r.name,
                                    name: name.clone(),
                                })
                            }
                        },
                    });
                }
                alternatives.push(items);
            }

            rules.push(Rule {
                alternatives,
                pool: r.pool.into_iter().map(String::into_bytes).collect(),
            });
        }

        let grammar = Self {
            symbols,
            rules,
            start,
        };
        tracing::debug!(
            rules = grammar.rules.len(),
            start = grammar.name(start),
            "loaded grammar"
        );
        Ok(grammar)
    }

    pub fn from_toml(s: &str) -> Result<Self, GrammarError> {
        let def: GrammarDef = toml::from_str(s)?;
        Self::from_def(def)
    }

    /// The bundled JSON grammar.
    pub fn json() -> Self {
        Self::from_toml(JSON_GRAMMAR).expect("bundled JSON grammar is valid")
    }

    pub fn start(&self) -> Symbol {
        self.start
    }

    pub fn rule(&self, sym: Symbol) -> &Rule {
        &self.rules[sym.index()]
    }

    pub fn name(&self, sym: Symbol) -> &str {
        self.symbols.name(sym)
    }

    pub fn symbol(&self, name: &str) -> Option<Symbol> {
        self.symbols.lookup(name)
    }

    pub fn symbols(&self) -> impl Iterator<Item = Symbol> + '_ {
        self.symbols.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Nonterminals reachable from `from`, including itself.
    pub fn reachable(&self, from: Symbol) -> HashSet<Symbol> {
        let mut seen = HashSet::from([from]);
        let mut st = vec![from];
        while let Some(s) = st.pop() {
            for alt in self.rule(s).alternatives.iter() {
                for item in alt {
                    if let Item::NonTerminal(n) = item {
                        if seen.insert(*n) {
                            st.push(*n);
                        }
                    }
                }
            }
        }
        seen
    }

    /// Rules that no derivation from the start symbol can reach.
    pub fn unreachable(&self) -> Vec<Symbol> {
        let live = self.reachable(self.start);
        self.symbols().filter(|s| !live.contains(s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_grammar() -> GrammarDef {
        GrammarDef::new("object")
            .rule(
                RuleDef::new("object")
                    .alt([ItemDef::lit("{"), ItemDef::sym("ws"), ItemDef::lit("}")])
                    .pool(["{}"]),
            )
            .rule(
                RuleDef::new("ws")
                    .epsilon()
                    .alt([ItemDef::lit(" "), ItemDef::sym("ws")])
                    .pool([""]),
            )
    }

    #[test]
    fn builds_from_def() {
        let g = Grammar::from_def(object_grammar()).unwrap();
        let object = g.symbol("object").unwrap();
        let ws = g.symbol("ws").unwrap();
        assert_eq!(g.start(), object);
        assert_eq!(g.rule(object).alternatives.len(), 1);
        assert_eq!(
            g.rule(object).alternatives[0][1],
            Item::NonTerminal(ws)
        );
        assert_eq!(g.rule(ws).pool, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn rejects_empty_pool() {
        let def = GrammarDef::new("a").rule(RuleDef::new("a").alt([ItemDef::lit("x")]));
        assert!(matches!(
            Grammar::from_def(def),
            Err(GrammarError::EmptyPool(name)) if name == "a"
        ));
    }

    #[test]
    fn rejects_rule_without_alternatives() {
        let def = GrammarDef::new("a").rule(RuleDef::new("a").pool(["x"]));
        assert!(matches!(
            Grammar::from_def(def),
            Err(GrammarError::NoAlternatives(_))
        ));
    }

    #[test]
    fn rejects_undefined_reference() {
        let def = GrammarDef::new("a").rule(
            RuleDef::new("a")
                .alt([ItemDef::sym("missing")])
                .pool(["x"]),
        );
        assert!(matches!(
            Grammar::from_def(def),
            Err(GrammarError::UndefinedSymbol { name, .. }) if name == "missing"
        ));
    }

    #[test]
    fn rejects_missing_start_and_duplicates() {
        let def = GrammarDef::new("b").rule(RuleDef::new("a").epsilon().pool([""]));
        assert!(matches!(
            Grammar::from_def(def),
            Err(GrammarError::MissingStart(_))
        ));

        let def = GrammarDef::new("a")
            .rule(RuleDef::new("a").epsilon().pool([""]))
            .rule(RuleDef::new("a").epsilon().pool([""]));
        assert!(matches!(
            Grammar::from_def(def),
            Err(GrammarError::DuplicateRule(_))
        ));

        assert!(matches!(
            Grammar::from_def(GrammarDef::new("a")),
            Err(GrammarError::NoRules)
        ));
    }

    #[test]
    fn parses_toml_items() {
        let g = Grammar::from_toml(
            r#"
            start = "pair"

            [[rule]]
            name = "pair"
            alternatives = [[{ lit = "(" }, "atom", { lit = "," }, "atom", { lit = ")" }]]
            pool = ["()"]

            [[rule]]
            name = "atom"
            alternatives = [[{ lit = "a" }], [{ lit = "b" }], ["pair"]]
            pool = ["a"]
            "#,
        )
        .unwrap();
        let pair = g.symbol("pair").unwrap();
        let atom = g.symbol("atom").unwrap();
        assert_eq!(g.rule(pair).alternatives[0].len(), 5);
        assert_eq!(g.rule(pair).alternatives[0][3], Item::NonTerminal(atom));
        assert_eq!(g.rule(atom).alternatives[2], vec![Item::NonTerminal(pair)]);
    }

    #[test]
    fn finds_unreachable_rules() {
        let def = object_grammar().rule(RuleDef::new("orphan").alt([ItemDef::sym("ws")]).pool([""]));
        let g = Grammar::from_def(def).unwrap();
        let orphan = g.symbol("orphan").unwrap();
        assert_eq!(g.unreachable(), vec![orphan]);
        assert!(g.reachable(orphan).contains(&g.symbol("ws").unwrap()));
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(matches!(
            Grammar::from_toml("start = "),
            Err(GrammarError::Toml(_))
        ));
    }

    #[test]
    fn bundled_json_grammar_is_valid() {
        let g = Grammar::json();
        assert_eq!(g.name(g.start()), "start");
        assert_eq!(g.len(), 30);
        let character = g.symbol("character").unwrap();
        assert_eq!(g.rule(character).alternatives.len(), 94);
        assert_eq!(g.reachable(g.start()).len(), g.len());
        assert!(g.unreachable().is_empty());
    }
}
