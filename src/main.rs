use std::panic;
use std::sync::Arc;

use algorunner::{
    config::{CommandLineOptions, PipelineConfig},
    core::{
        domain::{
            ExecutionConfig, ParameterConfiguration, ProblemInstance, ProblemInstanceSeedPair,
            RunConfig,
        },
        pipeline::builder::PipelineBuilder,
        traits::evaluator::evaluate,
    },
};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: algorunner <executable> <cutoff> <instance>...";

/// Runs the default configuration of a target algorithm once per instance
/// and prints the result lines.
#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    let mut args = std::env::args().skip(1);
    let (Some(executable), Some(cutoff)) = (args.next(), args.next()) else {
        return Err(USAGE.into());
    };
    let cutoff: f64 = cutoff.parse()?;
    let instances: Vec<String> = args.collect();
    if instances.is_empty() {
        return Err(USAGE.into());
    }

    let options = CommandLineOptions::from_env()?;
    let config = PipelineConfig::from_env()?;
    let execution = Arc::new(ExecutionConfig::new(
        executable,
        std::env::current_dir()?,
        false,
        cutoff,
    ));
    let parameters = Arc::new(ParameterConfiguration::new(Vec::<(String, String)>::new()));

    let runs = instances
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let instance = Arc::new(ProblemInstance::new(name.as_str(), i as u32 + 1));
            RunConfig::new(
                ProblemInstanceSeedPair::new(instance, i as i64 + 1),
                cutoff,
                parameters.clone(),
                execution.clone(),
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let evaluator = PipelineBuilder::new(config, options).build()?;
    tracing::info!("Evaluating {} run(s)", runs.len());
    let results = evaluate(evaluator.as_ref(), runs, None).await?;

    for result in &results {
        println!(
            "{}: {}",
            result.run_config().instance().name,
            result.result_line()
        );
    }

    evaluator.shutdown();
    evaluator.wait_for_outstanding().await;
    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
