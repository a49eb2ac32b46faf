//! Prompt-processing / text-generation throughput measurement in the style
//! of `llama-bench`, run against the prepared session.

use super::session::SessionState;
use super::{Engine, InferenceBackend, InferenceSession};
use crate::error::{BridgeError, Result};
use std::time::Instant;
use tracing::{debug, info};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
// The engine lock is held for the whole run.
const MAX_BENCH_REPETITIONS: i32 = 100;

impl<B: InferenceBackend> Engine<B> {
    /// Run `nr` rounds of a `pp`-token prompt pass and a `tg`-token
    /// generation pass and report tokens/second as a markdown table.
    ///
    /// The conversation is wiped afterwards: the KV cache is cleared and the
    /// position is back at zero.
    pub fn bench(&mut self, pp: i32, tg: i32, pl: i32, nr: i32) -> Result<String> {
        let result = self.bench_inner(pp, tg, pl, nr);
        self.track(result)
    }

    fn bench_inner(&mut self, pp: i32, tg: i32, pl: i32, nr: i32) -> Result<String> {
        if !self.backend.is_initialized() {
            return Err(BridgeError::BackendNotInitialized);
        }
        let summary = &self.model.as_ref().ok_or(BridgeError::NoModelLoaded)?.summary;
        let state = self.session.as_mut().ok_or(BridgeError::NotPrepared)?;

        if pp <= 0 || tg <= 0 || nr <= 0 {
            return Err(BridgeError::InvalidArgument(format!(
                "pp, tg and nr must be positive (pp={}, tg={}, nr={})",
                pp, tg, nr
            )));
        }
        if nr > MAX_BENCH_REPETITIONS {
            return Err(BridgeError::InvalidArgument(format!(
                "nr must not exceed {} (nr={})",
                MAX_BENCH_REPETITIONS, nr
            )));
        }
        if pl != 1 {
            return Err(BridgeError::InvalidArgument(format!(
                "only a single sequence is supported (pl={})",
                pl
            )));
        }
        let n_ctx = state.n_ctx();
        let longest = pp.max(tg) as usize;
        if longest > n_ctx as usize {
            return Err(BridgeError::ContextOverflow {
                needed: longest,
                available: n_ctx as usize,
                n_ctx,
            });
        }

        info!("Benchmarking: pp={}, tg={}, pl={}, nr={}", pp, tg, pl, nr);
        let outcome = run_rounds(state, pp, tg, nr);
        state.reset();
        let (pp_rates, tg_rates) = outcome?;

        let (pp_mean, pp_std) = mean_and_stddev(&pp_rates);
        let (tg_mean, tg_std) = mean_and_stddev(&tg_rates);
        info!(
            "Bench done: pp {:.2} ± {:.2} t/s, tg {:.2} ± {:.2} t/s",
            pp_mean, pp_std, tg_mean, tg_std
        );

        let label = summary.label();
        let size = format!("{:.2} GiB", summary.file_size as f64 / GIB);
        let params = format!("{:.2} B", summary.n_params as f64 / 1e9);
        let backend = self.backend.name();

        let mut table = String::new();
        table.push_str("| model | size | params | backend | test | t/s |\n");
        table.push_str("| --- | ---: | ---: | --- | --- | ---: |\n");
        table.push_str(&format!(
            "| {} | {} | {} | {} | pp {} | {:.2} ± {:.2} |\n",
            label, size, params, backend, pp, pp_mean, pp_std
        ));
        table.push_str(&format!(
            "| {} | {} | {} | {} | tg {} | {:.2} ± {:.2} |\n",
            label, size, params, backend, tg, tg_mean, tg_std
        ));
        Ok(table)
    }
}

fn run_rounds<S: InferenceSession>(
    state: &mut SessionState<S>,
    pp: i32,
    tg: i32,
    nr: i32,
) -> Result<(Vec<f64>, Vec<f64>)> {
    let n_batch = state.n_batch();
    let mut pp_rates = Vec::with_capacity(nr as usize);
    let mut tg_rates = Vec::with_capacity(nr as usize);

    for round in 0..nr {
        state.reset();
        let started = Instant::now();
        for i in 0..pp {
            let last = i == pp - 1;
            state.session.batch_add(0, i, last)?;
            if last || state.session.batch_len() >= n_batch {
                state.session.decode()?;
            }
        }
        let pp_rate = pp as f64 / elapsed_secs(started);

        state.reset();
        let started = Instant::now();
        for i in 0..tg {
            state.session.batch_add(0, i, true)?;
            state.session.decode()?;
        }
        let tg_rate = tg as f64 / elapsed_secs(started);

        debug!(
            "Bench round {}: pp {:.2} t/s, tg {:.2} t/s",
            round + 1,
            pp_rate,
            tg_rate
        );
        pp_rates.push(pp_rate);
        tg_rates.push(tg_rate);
    }

    Ok((pp_rates, tg_rates))
}

fn elapsed_secs(started: Instant) -> f64 {
    started.elapsed().as_secs_f64().max(f64::EPSILON)
}

/// Mean and sample standard deviation.
fn mean_and_stddev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::super::fake::{FakeBackend, FakeControl};
    use super::*;
    use common::EngineConfig;

    fn prepared() -> (Engine<FakeBackend>, FakeControl) {
        let control = FakeControl::default();
        let mut engine = Engine::new(FakeBackend::new(control.clone()));
        engine
            .init(EngineConfig {
                n_ctx: 32,
                n_batch: 8,
                validate_model: false,
                ..Default::default()
            })
            .unwrap();
        engine.load("/models/tiny.gguf").unwrap();
        engine.prepare().unwrap();
        (engine, control)
    }

    #[test]
    fn test_bench_reports_both_tests() {
        let (mut engine, control) = prepared();
        let report = engine.bench(10, 3, 1, 2).unwrap();

        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("| model |"));
        assert!(lines[2].contains("| pp 10 |"));
        assert!(lines[3].contains("| tg 3 |"));
        assert!(lines[2].contains("| fake |"));
        assert!(lines[2].contains("tiny.gguf"));

        // Per round: pp in chunks of 8 + 2, then three single-token decodes.
        let state = control.state();
        let sizes: Vec<usize> = state.decoded.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![8, 2, 1, 1, 1, 8, 2, 1, 1, 1]);
        // Two resets per round plus the final one.
        assert_eq!(state.kv_clears, 5);
    }

    #[test]
    fn test_bench_leaves_fresh_conversation() {
        let (mut engine, _control) = prepared();
        engine.process_user_prompt("hello", 0).unwrap();
        engine.bench(4, 4, 1, 1).unwrap();

        assert_eq!(engine.status().position, 0);
        assert_eq!(engine.next_token(), Err(BridgeError::NoPendingLogits));
    }

    #[test]
    fn test_bench_rejects_bad_arguments() {
        let (mut engine, _control) = prepared();
        assert!(matches!(
            engine.bench(0, 4, 1, 1),
            Err(BridgeError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.bench(4, 4, 2, 1),
            Err(BridgeError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.bench(64, 4, 1, 1),
            Err(BridgeError::ContextOverflow { needed: 64, .. })
        ));
    }

    #[test]
    fn test_bench_caps_repetitions() {
        let (mut engine, control) = prepared();
        assert!(matches!(
            engine.bench(4, 4, 1, i32::MAX),
            Err(BridgeError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.bench(4, 4, 1, MAX_BENCH_REPETITIONS + 1),
            Err(BridgeError::InvalidArgument(_))
        ));
        assert!(control.state().decoded.is_empty());

        engine.bench(4, 4, 1, MAX_BENCH_REPETITIONS).unwrap();
        assert_eq!(
            control.state().decoded.len(),
            MAX_BENCH_REPETITIONS as usize * 5
        );
    }

    #[test]
    fn test_bench_requires_session() {
        let control = FakeControl::default();
        let mut engine = Engine::new(FakeBackend::new(control));
        engine.init(EngineConfig::default()).unwrap();
        assert_eq!(engine.bench(8, 8, 1, 1), Err(BridgeError::NoModelLoaded));
    }

    #[test]
    fn test_mean_and_stddev() {
        assert_eq!(mean_and_stddev(&[]), (0.0, 0.0));
        assert_eq!(mean_and_stddev(&[5.0]), (5.0, 0.0));
        let (mean, std) = mean_and_stddev(&[1.0, 3.0]);
        assert!((mean - 2.0).abs() < 1e-9);
        assert!((std - 2f64.sqrt()).abs() < 1e-9);
    }
}
