//! A toy training script.
//!
//! Run with `cargo run --example train -- --lr=0.05 --epochs=5` from inside a
//! git checkout. Set `BUDDY_DEBUG=1` to skip the run id prompt.

use expbuddy::params::ExtraModule;
use expbuddy::{logging, BuddyConfig, DeployOptions, Dispatcher, Environment, ParameterBlock, RenderedFigure, Registry, RunStatus, Scope};

fn main() -> anyhow::Result<()> {
    let _guard = logging::init(None);

    let scope = Scope::from_names(["device"]);
    let declared = ParameterBlock::open(&scope)
        .bind("lr", 0.01)
        .bind("epochs", 3)
        .bind("batch_size", 32)
        .bind("optimizer", "sgd")
        .bind("device", "cpu")
        .bind("_", 0)
        .bind_callable("schedule")
        .extra_module(ExtraModule::new("model.mlp").attr("hidden", 128).attr("dropout", 0.1))
        .close();

    let mut registry = Registry::new();
    let params = registry.register_from_env(declared)?.clone();

    let cwd = std::env::current_dir()?;
    let config = BuddyConfig::load(&cwd)?;
    let env = Environment::capture(&config.job_id_var)?;
    let mut reporter = Dispatcher::new(config).deploy_or_exit(&params, &env, &DeployOptions::local())?;

    let lr = params.get("lr").and_then(|v| v.as_f64()).unwrap_or(0.01);
    let epochs = params.get("epochs").and_then(|v| v.as_f64()).unwrap_or(3.0) as u64;

    let mut weight = 5.0_f64;
    for _ in 0..epochs {
        for _ in 0..100 {
            let step = reporter.step();
            let grad = 2.0 * weight;
            weight -= lr * grad;
            reporter.log_scalar("train/loss", weight * weight, step)?;
        }
        let step = reporter.global_step();
        let samples: Vec<f64> = (0..256).map(|i| weight + (i as f64 - 128.0) / 64.0).collect();
        reporter.log_histogram("train/weights", samples, step)?;
    }

    let svg = format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="120" height="20"><text y="15">w={weight:.4}</text></svg>"#
    );
    reporter.log_figure("summary", RenderedFigure::new("svg", svg.into_bytes()), reporter.global_step(), true)?;

    reporter.finish(RunStatus::Finished)?;
    Ok(())
}
