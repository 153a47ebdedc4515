use clap::Parser;
use crossbeam_channel::unbounded;
use env_logger::Env;
use log::{error, info, LevelFilter};
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use raman_sweep::{
    expand_range, load_config_or_default, AppConfig, Bench, ChannelDataset, ChannelSet, Datalog,
    DatasetSink, HardwareBench, RamanError, RepetitionManager, RunParams, SessionCommand,
    SimBench, TickStatus,
};

/// Swept-source Raman measurement console
#[derive(Parser, Debug)]
#[command(name = "raman-console")]
#[command(about = "Wavelength-swept SPAD measurement runner", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Experiment name used for dataset files
    #[arg(short, long, default_value = "untitled")]
    experiment: String,

    /// Sample medium recorded in the metadata
    #[arg(long, default_value = "")]
    medium: String,

    /// Free-text notes recorded in the metadata
    #[arg(long, default_value = "")]
    notes: String,

    /// First target wavelength [nm]
    #[arg(long, default_value_t = 795.0)]
    start: f64,

    /// Last target wavelength, inclusive [nm]
    #[arg(long, default_value_t = 805.0)]
    stop: f64,

    /// Wavelength step [nm]
    #[arg(long, default_value_t = 1.0)]
    step: f64,

    /// Exposure time per repetition [s]
    #[arg(long, default_value_t = 10)]
    integration: u64,

    /// Repetitions per wavelength per channel
    #[arg(long, default_value_t = 3)]
    repetitions: usize,

    /// Datasets to produce; 0 runs until Ctrl+C
    #[arg(long, default_value_t = 1)]
    passes: u32,

    /// Run against the simulated bench instead of hardware
    #[arg(long)]
    simulate: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config_or_default(args.config.as_deref());

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.console.verbosity.clone());
    initialize_logging(&log_level);

    let targets = expand_range(args.start, args.stop, args.step);
    if targets.is_empty() {
        return Err("empty wavelength range".into());
    }
    info!(
        "=== Raman sweep console: {} ({} targets, {}..{} nm) ===",
        args.experiment,
        targets.len(),
        args.start,
        args.stop
    );

    let (bench, channels) = connect_bench(&args, &config)?;
    info!(
        "connected detectors: {}",
        channels
            .detectors()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );

    let sink = DirectorySink::new(PathBuf::from(&config.console.working_directory))?;
    let (commands, command_rx) = unbounded();
    setup_shutdown_handler(commands.clone());

    let tick_interval = Duration::from_millis(config.console.prog_interval_ms);
    let mut manager = RepetitionManager::new(bench, Box::new(sink), channels, config, command_rx);
    let progress = manager.progress();

    commands.send(SessionCommand::Begin(RunParams {
        experiment_name: args.experiment,
        medium: args.medium,
        notes: args.notes,
        targets,
        integration: Duration::from_secs(args.integration),
        repetitions: args.repetitions,
        passes: (args.passes > 0).then_some(args.passes),
    }))?;

    let mut last_reported = 0;
    loop {
        match manager.tick() {
            Ok(TickStatus::Done) => break,
            Ok(TickStatus::PassFinished) => {
                let snapshot = progress.read();
                info!("pass {} finished", snapshot.pass_seq.saturating_sub(1));
            }
            Ok(TickStatus::Working) => {
                let snapshot = progress.read();
                if snapshot.samples_done != last_reported {
                    last_reported = snapshot.samples_done;
                    info!(
                        "progress: {}/{} samples, {:.0} s exposed, wavelength {:?}",
                        snapshot.samples_done,
                        snapshot.samples_total,
                        snapshot.elapsed_exposure_s,
                        snapshot.current_wavelength_nm,
                    );
                }
            }
            Ok(TickStatus::Idle) => thread::sleep(tick_interval),
            Err(e) => {
                error!("session error: {e}");
                return Err(e.into());
            }
        }
    }

    info!("run complete");
    Ok(())
}

fn connect_bench(
    args: &Args,
    config: &AppConfig,
) -> Result<(Box<dyn Bench>, ChannelSet), Box<dyn std::error::Error>> {
    if args.simulate || config.console.simulate {
        info!("simulated bench");
        return Ok((Box::new(SimBench::new()), SimBench::channel_set()));
    }
    let (bench, channels) = HardwareBench::connect(config)?;
    Ok((Box::new(bench), channels))
}

/// Ctrl+C requests a stop; the session finalizes whatever partial data
/// exists before the loop exits.
fn setup_shutdown_handler(commands: crossbeam_channel::Sender<SessionCommand>) {
    let result = ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping after the current exposure");
        let _ = commands.send(SessionCommand::Stop);
    });
    if let Err(e) = result {
        error!("could not install Ctrl+C handler: {e}");
    }
}

/// Writes finalized datasets into the working directory: one counts file
/// and one power file per detector plus the run log.
struct DirectorySink {
    directory: PathBuf,
}

impl DirectorySink {
    fn new(directory: PathBuf) -> Result<Self, RamanError> {
        fs::create_dir_all(&directory)
            .map_err(|e| RamanError::io(e, format!("creating {}", directory.display())))?;
        Ok(DirectorySink { directory })
    }

    fn file_stem(name: &str, detector: &str) -> String {
        let safe: String = detector
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        format!("{name}_{safe}")
    }
}

impl DatasetSink for DirectorySink {
    fn export(
        &mut self,
        name: &str,
        datasets: &[ChannelDataset],
        log: &Datalog,
    ) -> Result<(), RamanError> {
        for dataset in datasets {
            let stem = Self::file_stem(name, &dataset.detector.0);
            let counts_path = self.directory.join(format!("{stem}.spad"));
            fs::write(&counts_path, dataset.counts.render())
                .map_err(|e| RamanError::Export(format!("{}: {e}", counts_path.display())))?;
            let powers_path = self.directory.join(format!("{stem}.power"));
            fs::write(&powers_path, dataset.powers.render())
                .map_err(|e| RamanError::Export(format!("{}: {e}", powers_path.display())))?;
        }
        log.save(&self.directory.join(format!("{name}.log")))?;
        info!("exported {} dataset(s) as {name}", datasets.len());
        Ok(())
    }
}

fn initialize_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        other => {
            eprintln!("Warning: invalid log level '{other}', using 'info'");
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}
