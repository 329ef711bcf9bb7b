use std::collections::HashMap;

/// Interned name of a nonterminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(usize);

impl Symbol {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Rule names, numbered in order of first appearance.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    names: Vec<String>,
    by_name: HashMap<String, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The symbol for `name`, numbering it if it is new.
    pub fn intern(&mut self, name: &str) -> Symbol {
        if let Some(s) = self.lookup(name) {
            return s;
        }
        let sym = Symbol(self.names.len());
        self.names.push(name.to_owned());
        self.by_name.insert(name.to_owned(), sym);
        sym
    }

    pub fn name(&self, sym: Symbol) -> &str {
        &self.names[sym.0]
    }

    pub fn lookup(&self, name: &str) -> Option<Symbol> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Symbol> {
        (0..self.names.len()).map(Symbol)
    }
}
