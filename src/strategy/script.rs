use anyhow::{anyhow, Result};
use rhai::{Array, Dynamic, Engine, ImmutableString, Scope, AST};

use super::Signal;
use crate::market::series::OhlcvSeries;

/// Operation budget per bar evaluation. Generated strategies are small
/// window computations; anything hitting this limit is runaway.
const MAX_OPERATIONS_PER_BAR: u64 = 200_000;

/// A candidate's `code_blob` compiled into an executable capability.
///
/// The blob is a script for the embedded interpreter. Its top-level
/// expression is evaluated once per bar with the read-only column arrays
/// `open`, `high`, `low`, `close`, `volume`, the bar index `i` and the bar
/// count `n` in scope, and must yield one of `"open_long"`, `"open_short"`,
/// `"close"`, `"hold"`.
///
/// The interpreter has no filesystem, network or environment access, and
/// each bar evaluation runs under an operation budget. Nothing prevents a
/// script from indexing past `i` — empirical lookahead detection is the
/// shuffle tester's job, not the sandbox's.
pub struct ScriptStrategy {
    ast: AST,
}

impl ScriptStrategy {
    pub fn compile(code: &str) -> Result<Self> {
        let engine = sandboxed_engine();
        let ast = engine
            .compile(code)
            .map_err(|e| anyhow!("strategy failed to compile: {e}"))?;
        Ok(Self { ast })
    }

    /// Evaluate the strategy over every bar of `series`, one signal per bar.
    /// Deterministic: identical code and series always yield the identical
    /// signal sequence.
    pub fn signals(&self, series: &OhlcvSeries) -> Result<Vec<Signal>> {
        let engine = sandboxed_engine();
        let mut scope = Scope::new();
        scope.push_constant("open", to_array(&series.open));
        scope.push_constant("high", to_array(&series.high));
        scope.push_constant("low", to_array(&series.low));
        scope.push_constant("close", to_array(&series.close));
        scope.push_constant("volume", to_array(&series.volume));
        scope.push_constant("n", series.len() as i64);
        scope.push("i", 0i64);
        let base = scope.len();

        let mut signals = Vec::with_capacity(series.len());
        for i in 0..series.len() {
            scope.set_value("i", i as i64);
            let value = engine
                .eval_ast_with_scope::<ImmutableString>(&mut scope, &self.ast)
                .map_err(|e| anyhow!("strategy evaluation failed at bar {i}: {e}"))?;
            scope.rewind(base);
            signals.push(parse_signal(&value, i)?);
        }
        Ok(signals)
    }
}

fn sandboxed_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS_PER_BAR);
    engine.set_max_call_levels(16);
    engine.set_max_expr_depths(64, 64);
    engine.set_max_string_size(4_096);
    engine
}

fn to_array(values: &[f64]) -> Array {
    values.iter().map(|&v| Dynamic::from_float(v)).collect()
}

fn parse_signal(value: &str, bar: usize) -> Result<Signal> {
    match value {
        "open_long" => Ok(Signal::OpenLong),
        "open_short" => Ok(Signal::OpenShort),
        "close" => Ok(Signal::Close),
        "hold" => Ok(Signal::Hold),
        other => Err(anyhow!("unknown signal {other:?} at bar {bar}")),
    }
}
