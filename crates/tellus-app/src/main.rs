use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{self, Value as JsonValue};
use std::{fs, path::Path, path::PathBuf};
use tellus_core::{TellusConfig, WorldState};
use tracing::{debug, info, warn};

fn main() -> Result<()> {
    let cli = AppCli::parse();
    init_tracing();
    let config = compose_config(&cli)?;
    run_simulation(&cli, config)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[derive(Parser, Debug)]
#[command(name = "tellus", version, about = "Tellus world simulation shell")]
struct AppCli {
    /// Number of ticks to simulate.
    #[arg(long, default_value_t = 1_000)]
    ticks: u64,
    /// Grid width in cells.
    #[arg(long, default_value_t = 192)]
    width: u32,
    /// Grid height in cells.
    #[arg(long, default_value_t = 192)]
    height: u32,
    /// Layered JSON configuration files applied in order.
    #[arg(long = "config", value_name = "FILE", env = "TELLUS_CONFIG", value_delimiter = ';')]
    config_layers: Vec<PathBuf>,
    /// RNG seed override for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,
    /// Ticks between logged summaries.
    #[arg(long = "log-every", default_value_t = 100)]
    log_every: u32,
}

fn compose_config(cli: &AppCli) -> Result<TellusConfig> {
    let base = TellusConfig {
        summary_interval: cli.log_every.max(1),
        history_capacity: 64,
        ..TellusConfig::default()
    };
    let mut config = apply_config_layers(base, &cli.config_layers)?;
    if let Some(seed) = cli.seed {
        config.rng_seed = Some(seed);
    }
    Ok(config)
}

fn apply_config_layers(base: TellusConfig, layers: &[PathBuf]) -> Result<TellusConfig> {
    if layers.is_empty() {
        return Ok(base);
    }

    let mut merged = serde_json::to_value(&base).expect("serialize base config");
    for path in layers {
        let layer_value = load_config_layer(path)?;
        info!(layer = %path.display(), "Applying configuration layer");
        merge_layer(&mut merged, layer_value);
    }

    serde_json::from_value(merged)
        .map_err(|err| anyhow::anyhow!("failed to deserialize merged configuration: {err}"))
}

fn load_config_layer(path: &Path) -> Result<JsonValue> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration layer {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse JSON config layer {}", path.display()))
}

fn merge_layer(base: &mut JsonValue, layer: JsonValue) {
    match (base, layer) {
        (JsonValue::Object(base_map), JsonValue::Object(layer_map)) => {
            for (key, value) in layer_map {
                if let Some(existing) = base_map.get_mut(&key) {
                    merge_layer(existing, value);
                } else {
                    base_map.insert(key, value);
                }
            }
        }
        (target, value) => {
            *target = value;
        }
    }
}

fn run_simulation(cli: &AppCli, config: TellusConfig) -> Result<()> {
    if config.rng_seed.is_none() {
        debug!("No rng_seed configured; this run will not be reproducible");
    }
    let mut world = WorldState::new(cli.width, cli.height, config)
        .map_err(|err| anyhow::anyhow!("failed to construct world: {err}"))?;
    info!(
        width = cli.width,
        height = cli.height,
        ticks = cli.ticks,
        "Starting Tellus simulation"
    );

    for _ in 0..cli.ticks {
        let events = world.step();
        if events.humans_spawned {
            info!(tick = events.tick.0, "Humans settled the world");
        }
        if let Some(species) = events.species_spawned {
            debug!(tick = events.tick.0, species, "New species appeared");
        }
        if events.cycle_rolled {
            info!(tick = events.tick.0, cycle = world.cycle(), "Cycle rolled");
        }
        if events.summary_flushed
            && let Some(summary) = world.history().last()
        {
            info!(
                tick = summary.tick.0,
                land = summary.land_cells,
                alpha = summary.alpha_cells,
                beta = summary.beta_cells,
                settlements = summary.settlements,
                species = summary.species,
                migrants = summary.migrants,
                mean_temp = summary.mean_temperature,
                "Summary"
            );
        }
    }

    if let Some(summary) = world.history().last() {
        info!(
            tick = summary.tick.0,
            land = summary.land_cells,
            settlements = summary.settlements,
            species = summary.species,
            "Simulation complete"
        );
    } else {
        warn!("Simulation finished without any summaries");
    }
    Ok(())
}
