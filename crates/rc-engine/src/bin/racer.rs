use std::sync::Arc;

use anyhow::Context;
use rc_engine::{FunctionExecutor, Preset, Scenario, SmboBuilder, SmboEvent, TargetExecutor};
use rc_types::{ConfigSpace, TrialOutcome, TrialRequest};
use tracing_subscriber::EnvFilter;

fn parameter(request: &TrialRequest, name: &str) -> f64 {
    request
        .config
        .get(name)
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0)
}

fn branin(request: &TrialRequest) -> f64 {
    let x0 = parameter(request, "x0");
    let x1 = parameter(request, "x1");
    let pi = std::f64::consts::PI;
    let b = 5.1 / (4.0 * pi * pi);
    let c = 5.0 / pi;
    let t = 1.0 / (8.0 * pi);
    (x1 - b * x0 * x0 + c * x0 - 6.0).powi(2) + 10.0 * (1.0 - t) * x0.cos() + 10.0
}

fn sphere(request: &TrialRequest) -> f64 {
    request
        .config
        .values()
        .values()
        .filter_map(|v| v.as_f64())
        .map(|v| v * v)
        .sum()
}

fn builtin_scenario() -> Scenario {
    let space = ConfigSpace::new()
        .add_float("x0", -5.0, 10.0)
        .add_float("x1", 0.0, 15.0);
    Scenario::new(space)
        .with_name("branin")
        .with_deterministic(true)
        .with_n_trials(60)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut scenario = match std::env::var("RACER_SCENARIO") {
        Ok(path) => Scenario::from_file(&path)
            .with_context(|| format!("loading scenario from {path}"))?,
        Err(_) => builtin_scenario(),
    };
    if let Ok(dir) = std::env::var("RACER_OUTPUT") {
        scenario = scenario.with_output_directory(dir);
    }
    let preset = match std::env::var("RACER_PRESET") {
        Ok(name) => Preset::from_name(&name)?,
        Err(_) => Preset::BlackBox,
    };
    let target = std::env::var("RACER_TARGET").unwrap_or_else(|_| "branin".to_string());
    let executor: Arc<dyn TargetExecutor> = match target.as_str() {
        "branin" => Arc::new(FunctionExecutor::new(|r: &TrialRequest| {
            Ok(TrialOutcome::success(branin(r), 0.0))
        })),
        "sphere" => Arc::new(FunctionExecutor::new(|r: &TrialRequest| {
            Ok(TrialOutcome::success(sphere(r), 0.0))
        })),
        other => anyhow::bail!("unknown target '{other}', expected branin or sphere"),
    };

    let (sender, receiver) = crossbeam_channel::unbounded();
    let reporter = std::thread::spawn(move || {
        for event in receiver {
            match event {
                SmboEvent::IncumbentChanged {
                    config_id,
                    cost,
                    trials_finished,
                } => println!("[{trials_finished:>5}] incumbent #{config_id} cost {cost:.6}"),
                SmboEvent::Terminated { reason, .. } => println!("finished: {reason}"),
                _ => {}
            }
        }
    });

    let smbo = SmboBuilder::new(scenario)
        .with_preset(preset)
        .with_event_sender(sender)
        .build(executor)?;
    let outcome = smbo.run().await?;
    if reporter.join().is_err() {
        anyhow::bail!("event reporter panicked");
    }

    match (&outcome.incumbent, outcome.incumbent_cost) {
        (Some(config), Some(cost)) => println!("incumbent {config} with cost {cost:.6}"),
        _ => println!("no incumbent found"),
    }
    println!(
        "{} trials ({} crashed, {} capped) in {:.2}s",
        outcome.stats.trials_finished,
        outcome.stats.crashed,
        outcome.stats.capped,
        outcome.stats.wallclock_seconds
    );
    Ok(())
}
