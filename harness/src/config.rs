use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use gramfuzz::{Grammar, MutationConfig, ParseConfig};
use serde::Deserialize;
use tracing::warn;

/// Contents of the `--config` file. Every table is optional.
///
/// ```toml
/// [mutation]
/// rule_weight = 2
///
/// [mutation.generator]
/// max_depth = 10
///
/// [parse]
/// max_len = 4096
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mutation: MutationConfig,
    pub parse: ParseConfig,
    /// Odds of splicing two seeds instead of mutating one.
    pub p_splice: Option<f64>,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }
}

pub fn load_grammar(path: Option<&Path>) -> Result<Grammar> {
    let Some(path) = path else {
        return Ok(Grammar::json());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read grammar {}", path.display()))?;
    let grammar = Grammar::from_toml(&text)
        .with_context(|| format!("invalid grammar {}", path.display()))?;
    for sym in grammar.unreachable() {
        warn!("rule `{}` is unreachable from `{}`", grammar.name(sym), grammar.name(grammar.start()));
    }
    Ok(grammar)
}
