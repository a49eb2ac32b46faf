use ai_chat::engine::Engine;
use ai_chat::llama_wrapper::LlamaCppBackend;
use ai_chat::util::cmd::{chatml_prompt, Args, DEFAULT_SYSTEM_PROMPT};
use ai_chat::util::init_logging;
use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::Write;
use std::time::Instant;
use tracing::info;

fn main() -> Result<()> {
    init_logging();

    let args = Args::parse();
    let config = args.engine_config()?;

    let mut engine = Engine::new(LlamaCppBackend::new());
    engine.init(config)?;
    engine.load(&args.model)?;
    engine.prepare()?;

    let result = if args.bench {
        run_bench(&mut engine, &args)
    } else {
        run_chat(&mut engine, &args)
    };

    engine.shutdown();
    result
}

fn run_bench(engine: &mut Engine<LlamaCppBackend>, args: &Args) -> Result<()> {
    let report = engine.bench(args.pp, args.tg, 1, args.nr)?;
    println!("{}", report);
    Ok(())
}

fn run_chat(engine: &mut Engine<LlamaCppBackend>, args: &Args) -> Result<()> {
    let user = args
        .prompt
        .as_deref()
        .ok_or_else(|| anyhow!("--prompt is required"))?;

    if args.chatml {
        let system = args.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT);
        engine.process_user_prompt(&chatml_prompt(system, user), args.n_predict)?;
    } else {
        if let Some(system) = &args.system_prompt {
            engine.process_system_prompt(system)?;
        }
        engine.process_user_prompt(user, args.n_predict)?;
    }

    let started = Instant::now();
    let mut pieces = 0usize;
    let mut stdout = std::io::stdout().lock();
    while let Some(piece) = engine.next_token()? {
        stdout.write_all(piece.as_bytes())?;
        stdout.flush()?;
        pieces += 1;
    }
    writeln!(stdout)?;

    let elapsed = started.elapsed().as_secs_f64();
    info!(
        "Generated {} pieces in {:.2}s ({:.2} t/s), context position {}",
        pieces,
        elapsed,
        pieces as f64 / elapsed.max(f64::EPSILON),
        engine.status().position
    );
    Ok(())
}
