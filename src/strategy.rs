//! Built-in [`MoveStrategy`] implementations and the name -> constructor table players pick
//! them from at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use rand::Rng;

use crate::game_interface::{Move, MoveStrategy, Side};

/// Always plays the same move.
#[derive(Debug, Clone, Copy)]
pub struct FixedStrategy(pub Move);

impl MoveStrategy for FixedStrategy {
    fn decide(&self, _game_id: &str, _round: u32, _side: Side, _history: &[Move]) -> anyhow::Result<Move> {
        Ok(self.0)
    }
}

/// Uniformly random move in `min..=max`.
#[derive(Debug, Clone, Copy)]
pub struct RandomStrategy {
    min: Move,
    max: Move,
}

impl RandomStrategy {
    /// Random strategy over an inclusive range.
    pub fn new(min: Move, max: Move) -> anyhow::Result<Self> {
        if min > max {
            bail!("empty move range {min}..={max}");
        }
        Ok(Self { min, max })
    }
}

impl MoveStrategy for RandomStrategy {
    fn decide(&self, _game_id: &str, _round: u32, _side: Side, _history: &[Move]) -> anyhow::Result<Move> {
        Ok(rand::thread_rng().gen_range(self.min..=self.max))
    }
}

/// Plays a fixed sequence of moves, one per round, wrapping around.
#[derive(Debug, Clone)]
pub struct CycleStrategy {
    moves: Vec<Move>,
}

impl CycleStrategy {
    /// Cycle over `moves`, starting with the first one in round 1.
    pub fn new(moves: Vec<Move>) -> anyhow::Result<Self> {
        if moves.is_empty() {
            bail!("a cycle needs at least one move");
        }
        Ok(Self { moves })
    }
}

impl MoveStrategy for CycleStrategy {
    fn decide(&self, _game_id: &str, round: u32, _side: Side, _history: &[Move]) -> anyhow::Result<Move> {
        let i = (round.max(1) - 1) as usize % self.moves.len();
        Ok(self.moves[i])
    }
}

type Constructor = fn(&str) -> anyhow::Result<Arc<dyn MoveStrategy>>;

/// Explicit registration table of strategies, built once at startup.
///
/// Names map to constructors taking a free-form argument string, e.g. `"fixed"` with `"3"`.
pub struct StrategyRegistry {
    constructors: BTreeMap<&'static str, Constructor>,
}

impl StrategyRegistry {
    /// Empty table.
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Table holding the built-in strategies (`cycle`, `fixed`, `random`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("fixed", |arg: &str| -> anyhow::Result<Arc<dyn MoveStrategy>> {
            let value = arg
                .trim()
                .parse::<Move>()
                .with_context(|| format!("'fixed' expects a move, got '{arg}'"))?;
            Ok(Arc::new(FixedStrategy(value)))
        });
        registry.register("random", |arg: &str| -> anyhow::Result<Arc<dyn MoveStrategy>> {
            let (min, max) = match arg.trim() {
                "" => (1, 5),
                range => {
                    let (min, max) = range
                        .split_once("..=")
                        .with_context(|| format!("'random' expects 'min..=max', got '{range}'"))?;
                    (min.trim().parse::<Move>()?, max.trim().parse::<Move>()?)
                }
            };
            Ok(Arc::new(RandomStrategy::new(min, max)?))
        });
        registry.register("cycle", |arg: &str| -> anyhow::Result<Arc<dyn MoveStrategy>> {
            let moves = arg
                .split(',')
                .map(|m| m.trim().parse::<Move>())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("'cycle' expects comma separated moves, got '{arg}'"))?;
            Ok(Arc::new(CycleStrategy::new(moves)?))
        });
        registry
    }

    /// Add or replace a strategy.
    pub fn register(&mut self, name: &'static str, constructor: Constructor) {
        self.constructors.insert(name, constructor);
    }

    /// Instantiate a strategy by name.
    pub fn create(&self, name: &str, arg: &str) -> anyhow::Result<Arc<dyn MoveStrategy>> {
        let constructor = self
            .constructors
            .get(name)
            .with_context(|| format!("unknown strategy '{name}'"))?;
        constructor(arg)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        self.constructors.keys().copied().collect()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
