use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use trace_topology::config::BoardDescription;
use trace_topology::engine::Engine;
use trace_topology::options::{paths, MemoryOptionStore};
use trace_topology::sim::{RecordingLifecycle, SimulatedTarget};

/// Dry run a board description against a simulated target.
#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    /// Board description (YAML).
    #[clap(long, parse(from_os_str))]
    board: PathBuf,

    /// Session options (YAML, keyed by option path).
    #[clap(long, parse(from_os_str))]
    options: Option<PathBuf>,

    /// Switch to this capture mode after connecting.
    #[clap(long)]
    mode: Option<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let yaml = std::fs::read_to_string(&args.board)
        .with_context(|| format!("Reading {}", args.board.display()))?;
    let board = BoardDescription::from_yaml(&yaml).context("Parsing the board description")?;
    let (topology, config) = board.resolve()?;
    println!("Board {}: {} devices", board.name, topology.nodes().count());

    let mut options = match &args.options {
        Some(path) => {
            let yaml = std::fs::read_to_string(path)
                .with_context(|| format!("Reading {}", path.display()))?;
            MemoryOptionStore::from_yaml(&yaml).context("Parsing the options")?
        }
        None => MemoryOptionStore::new(),
    };

    let mut engine = Engine::new(
        topology,
        config,
        SimulatedTarget::new(),
        RecordingLifecycle::new(),
    )?;

    for mode in engine.modes() {
        let names: Vec<&str> = engine
            .get_managed_devices(mode)
            .into_iter()
            .map(|device| engine.topology().name(device))
            .collect();
        println!("Mode {}: {}", mode, names.join(", "));
    }

    engine.apply_initial_options(&options)?;
    engine.connect().context("Connecting")?;

    let chain: Vec<&str> = engine
        .trace_chain()
        .into_iter()
        .map(|device| engine.topology().name(device))
        .collect();
    println!("Capturing in mode {} through [{}]", engine.mode(), chain.join(", "));

    if let Some(mode) = &args.mode {
        options.set(paths::TRACE_CAPTURE, mode.as_str());
        engine.apply_dynamic_options(&options)?;
        println!("Switched to mode {}", engine.mode());
    }

    engine.disconnect()?;

    for event in engine.lifecycle().events() {
        println!("{:?}", event);
    }
    println!("{} register writes", engine.access().write_count());

    Ok(())
}
