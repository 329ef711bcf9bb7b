use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gramfuzz::{Fidelity, Generator, GeneratorState, Grammar, Tree, TreeMutator};
use rand::Rng;
use similar::TextDiff;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod run;

use crate::config::{load_grammar, Config};
use crate::run::run;

#[derive(Parser, Debug)]
#[command(name = "gramfuzz-harness", about = "Grammar-based test case generation")]
struct Cli {
    /// Path to a .toml grammar; defaults to the bundled JSON grammar
    #[arg(short, long, value_name = "FILE", global = true)]
    grammar: Option<PathBuf>,
    /// Path to .toml configuration for the mutator
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
    /// Seed for the random source; drawn at random if absent
    #[arg(short, long, global = true)]
    seed: Option<u64>,
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write freshly generated test cases
    Gen {
        /// Output directory
        out: PathBuf,
        /// Number of test cases
        #[arg(short, long, default_value_t = 100)]
        num_trials: usize,
    },
    /// Mutate seed files into new test cases
    Mutate {
        /// Output directory
        out: PathBuf,
        /// Seed inputs
        #[arg(required = true)]
        seeds: Vec<PathBuf>,
        #[arg(short, long, default_value_t = 100)]
        num_trials: usize,
        /// Odds of splicing two seeds instead of mutating one
        #[arg(long)]
        p_splice: Option<f64>,
    },
    /// Run a target on generated or mutated test cases
    Run {
        /// Path to target script under test
        target: PathBuf,
        /// Output path for failures
        out: PathBuf,
        /// Path to gold script to compare outputs against
        #[arg(long)]
        gold: Option<PathBuf>,
        /// Seed inputs to mutate; cases are generated from scratch if absent
        #[arg(long)]
        seeds: Vec<PathBuf>,
        #[arg(short, long, default_value_t = 100)]
        num_trials: usize,
        /// How long to wait before timing out the run
        #[arg(short, long)]
        timeout: Option<u64>,
        #[arg(long)]
        p_splice: Option<f64>,
    },
}

/// Where test cases come from: fresh generation, or mutation of a corpus.
struct Source<'g> {
    mutator: TreeMutator<'g>,
    corpus: Vec<Tree>,
    p_splice: f64,
}

impl<'g> Source<'g> {
    fn new(grammar: &'g Grammar, config: &Config, seeds: &[PathBuf], p_splice: Option<f64>) -> Result<Self> {
        let parser = gramfuzz::Parser::with_config(grammar, config.parse);
        let mut corpus = Vec::with_capacity(seeds.len());
        for path in seeds {
            let bytes = fs::read(path).with_context(|| format!("failed to read seed {}", path.display()))?;
            let parsed = parser.parse_or_wrap(&bytes);
            if parsed.fidelity == Fidelity::Opaque {
                warn!(
                    "{} kept opaque: {}",
                    path.display(),
                    parsed.error.map(|e| e.to_string()).unwrap_or_default()
                );
            }
            corpus.push(parsed.tree);
        }
        Ok(Self {
            mutator: TreeMutator::with_config(grammar, config.mutation),
            corpus,
            p_splice: p_splice.or(config.p_splice).unwrap_or(0.1).clamp(0.0, 1.0),
        })
    }

    fn generator(&self) -> &Generator<'g> {
        self.mutator.generator()
    }

    fn next(&self, state: &mut GeneratorState) -> Tree {
        if self.corpus.is_empty() {
            return self.generator().generate_tree(state);
        }
        let a = &self.corpus[state.rng.random_range(0..self.corpus.len())];
        if self.corpus.len() > 1 && state.rng.random_bool(self.p_splice) {
            let b = &self.corpus[state.rng.random_range(0..self.corpus.len())];
            match self.mutator.splicing_mutation(a, b, &mut state.rng) {
                Ok(t) => return t,
                Err(e) => debug!("splice failed: {e}"),
            }
        }
        let (strategy, t) = self.mutator.havoc(a, state);
        debug!(?strategy, size = t.size(), "mutated seed");
        t
    }
}

fn write_case(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let path = dir.join(name);
    fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

fn produce(source: &Source<'_>, state: &mut GeneratorState, out: &Path, num_trials: usize) -> Result<()> {
    fs::create_dir_all(out)?;
    for n in 0..num_trials {
        let mut t = source.next(state);
        write_case(out, &format!("case-{n:06}.bin"), t.unparse())?;
    }
    info!("Wrote {} test cases to {}", num_trials, out.display());
    Ok(())
}

#[derive(Default)]
struct Tally {
    hangs: usize,
    crashes: usize,
    exits: usize,
    mismatches: usize,
}

fn trial(
    n: usize,
    test_case: &[u8],
    target: &Path,
    gold: Option<&Path>,
    timeout: Option<u64>,
    failures: &Path,
    tally: &mut Tally,
) -> Result<()> {
    let us = run(target, test_case, timeout)?;
    if !us.terminated() {
        tally.hangs += 1;
        return write_case(failures, &format!("hang-{n:06}.bin"), test_case);
    }
    if us.crashed() {
        tally.crashes += 1;
        return write_case(failures, &format!("crash-{n:06}.bin"), test_case);
    }

    let Some(gold) = gold else {
        if !us.succeeded() {
            tally.exits += 1;
            return write_case(failures, &format!("exit-{n:06}.bin"), test_case);
        }
        return Ok(());
    };
    let them = run(gold, test_case, timeout)?;
    if !them.terminated() {
        // Nothing to compare against.
        return Ok(());
    }

    let ours = String::from_utf8_lossy(&us.output);
    let theirs = String::from_utf8_lossy(&them.output);
    let diff = TextDiff::from_lines(theirs.as_ref(), ours.as_ref());
    // 1.0 => complete match
    if diff.ratio() != 1.0 || us.status != them.status {
        tally.mismatches += 1;
        write_case(failures, &format!("mismatch-{n:06}.bin"), test_case)?;
        let report = diff.unified_diff().header("gold", "target").to_string();
        write_case(failures, &format!("mismatch-{n:06}.diff"), report.as_bytes())?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    let grammar = load_grammar(cli.grammar.as_deref())?;
    let config = Config::load(cli.config.as_deref())?;
    let seed = cli.seed.unwrap_or_else(rand::random);
    info!("Using seed {seed}");
    let mut state = GeneratorState::seeded(seed);

    match cli.command {
        Command::Gen { out, num_trials } => {
            let source = Source::new(&grammar, &config, &[], None)?;
            produce(&source, &mut state, &out, num_trials)
        }
        Command::Mutate {
            out,
            seeds,
            num_trials,
            p_splice,
        } => {
            let source = Source::new(&grammar, &config, &seeds, p_splice)?;
            produce(&source, &mut state, &out, num_trials)
        }
        Command::Run {
            target,
            out,
            gold,
            seeds,
            num_trials,
            timeout,
            p_splice,
        } => {
            let source = Source::new(&grammar, &config, &seeds, p_splice)?;
            let failures = out.join("failures");
            fs::create_dir_all(&failures)?;

            let mut tally = Tally::default();
            for n in 0..num_trials {
                let mut t = source.next(&mut state);
                trial(
                    n,
                    t.unparse(),
                    &target,
                    gold.as_deref(),
                    timeout,
                    &failures,
                    &mut tally,
                )?;
            }
            info!(
                "Ran {} test cases: {} hangs, {} crashes, {} failed exits, {} mismatches",
                num_trials, tally.hangs, tally.crashes, tally.exits, tally.mismatches
            );
            Ok(())
        }
    }
}
