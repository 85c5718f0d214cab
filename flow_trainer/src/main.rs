use std::env;

use anyhow::Context;
use log::info;

use flow_trainer::RunConfig;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let path = env::args()
        .nth(1)
        .context("usage: flow_trainer <config.json>")?;

    let world_size = match env::var("WORLD_SIZE") {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("WORLD_SIZE must be a number, got {raw}"))?,
        Err(_) => 1,
    };

    let config = RunConfig::from_file(&path).with_context(|| format!("reading config {path}"))?;
    let steps = flow_trainer::run(config, world_size)?;

    info!(steps = steps; "run finished");
    Ok(())
}
