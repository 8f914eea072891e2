//! The glyphbots daemon: runs the evolution engine in the background and
//! serves the JSON control surface until a `stop` command arrives.

use std::io::Write as _;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use glyphbots_app::ControlServer;
use glyphbots_core::{
    AnalyzerConfig, EngineConfig, Environment, EnvironmentConfig, EvolutionEngine, VmConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "glyphbots-app", version, about = "Glyphbots evolution daemon")]
struct AppCli {
    /// Layered TOML configuration files applied in order.
    #[arg(
        long = "config",
        value_name = "FILE",
        action = ArgAction::Append,
        env = "GLYPHBOTS_CONFIG",
        value_delimiter = ';'
    )]
    config_layers: Vec<PathBuf>,
    /// Address for the control server.
    #[arg(long, env = "GLYPHBOTS_LISTEN", default_value = "127.0.0.1:7878")]
    listen: String,
    /// Directory for checkpoints, backups, and phenotype snapshots.
    #[arg(long, value_name = "DIR", env = "GLYPHBOTS_SAVE_DIR")]
    save_dir: Option<PathBuf>,
    /// Seed for reproducible runs.
    #[arg(long, env = "GLYPHBOTS_SEED")]
    seed: Option<u64>,
    /// Stop after this many generations (0 runs forever).
    #[arg(long, value_name = "N", env = "GLYPHBOTS_MAX_GENERATIONS")]
    max_generations: Option<u64>,
}

/// The four config records under one roof, as they appear in config files.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct AppConfig {
    environment: EnvironmentConfig,
    vm: VmConfig,
    analyzer: AnalyzerConfig,
    engine: EngineConfig,
}

fn main() -> Result<()> {
    let cli = AppCli::parse();
    init_tracing();

    let config = compose_config(&cli)?;
    info!(
        population = config.environment.initial_population,
        canvas_width = config.vm.image_width,
        canvas_height = config.vm.image_height,
        save_dir = %config.engine.save_directory.display(),
        "starting glyphbots daemon"
    );

    let environment = Arc::new(Environment::new(
        config.environment,
        config.vm,
        config.analyzer,
    ));
    let save_directory = config.engine.save_directory.clone();
    let engine = Arc::new(EvolutionEngine::new(environment, config.engine.clone()));
    if !engine.start() {
        bail!("evolution engine failed to start");
    }

    let listener = TcpListener::bind(&cli.listen)
        .with_context(|| format!("binding control server to {}", cli.listen))?;

    // Bounded runs should exit on their own: once the worker reaches
    // max_generations, poke the accept loop with a stop command.
    if config.engine.max_generations > 0 {
        let watcher = Arc::clone(&engine);
        let addr = listener.local_addr().context("listener address")?;
        thread::spawn(move || {
            watcher.wait_for_completion(0);
            if let Ok(mut stream) = TcpStream::connect(addr) {
                let _ = stream.write_all(b"{\"command\": \"stop\"}\n");
            }
        });
    }

    ControlServer::new(Arc::clone(&engine), save_directory).serve(listener)?;
    engine.stop();
    info!("daemon exiting");
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn compose_config(cli: &AppCli) -> Result<AppConfig> {
    let mut config = apply_config_layers(AppConfig::default(), &cli.config_layers)?;
    if let Some(seed) = cli.seed {
        config.environment.rng_seed = Some(seed);
    }
    if let Some(save_dir) = &cli.save_dir {
        config.engine.save_directory = save_dir.clone();
    }
    if let Some(max_generations) = cli.max_generations {
        config.engine.max_generations = max_generations;
    }
    Ok(config)
}

/// Merges each TOML layer onto the serialized defaults, so layers only need
/// to name the knobs they change.
fn apply_config_layers(base: AppConfig, layers: &[PathBuf]) -> Result<AppConfig> {
    if layers.is_empty() {
        return Ok(base);
    }

    let mut merged = serde_json::to_value(&base).context("serialize base config")?;
    for path in layers {
        let layer = load_config_layer(path)?;
        info!(layer = %path.display(), "applying configuration layer");
        merge_layer(&mut merged, layer);
    }
    serde_json::from_value(merged).context("deserialize merged configuration")
}

fn load_config_layer(path: &Path) -> Result<JsonValue> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading configuration layer {}", path.display()))?;
    let parsed: toml::Value = toml::from_str(&contents)
        .with_context(|| format!("parsing TOML configuration layer {}", path.display()))?;
    serde_json::to_value(parsed).context("converting TOML layer to JSON")
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
