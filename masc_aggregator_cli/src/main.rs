//! # masc_aggregator_cli
//!
//! Part of the masc_aggregator crate family.
//!
//! Command line application which runs the MASC aggregation from a YAML configuration.
//!
//! ## Use
//!
//! Make a template configuration with
//!
//! ```bash
//! masc_aggregator_cli -p config.yml new
//! ```
//!
//! Edit the paths and thresholds, then run with
//!
//! ```bash
//! masc_aggregator_cli -p config.yml
//! ```
//!
//! Progress is shown on the terminal. Detailed processing messages go to `masc_aggregator.log` in
//! the working directory.
use clap::{Arg, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};

use libmasc_aggregator::config::Config;
use libmasc_aggregator::process::process;
use libmasc_aggregator::worker_status::{Phase, WorkerStatus};

const LOG_FILE: &str = "./masc_aggregator.log";

fn make_template_config(path: &Path) -> Result<(), String> {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).map_err(|e| e.to_string())?;
    let mut file = File::create(path).map_err(|e| e.to_string())?;
    file.write_all(yaml_str.as_bytes())
        .map_err(|e| e.to_string())
}

/// Route the library's messages to a log file
fn setup_file_logger() -> Result<(), spdlog::Error> {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from(LOG_FILE))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()?,
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .build()?,
    );
    spdlog::set_default_logger(logger);
    Ok(())
}

fn make_bar(pb_manager: &MultiProgress, message: String, color: &str) -> ProgressBar {
    let bar = pb_manager.add(ProgressBar::new(100));
    let template = format!("{{msg:>12}} [{{bar:40.{color}}}] {{pos:>3}}%");
    if let Ok(style) = ProgressStyle::with_template(&template) {
        bar.set_style(style);
    }
    bar.set_message(message);
    bar
}

fn main() {
    // Create a cli
    let matches = Command::new("masc_aggregator_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .required(true)
                .help("Path to the configuration file"),
        )
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    if let Err(e) = LogWrapper::new(pb_manager.clone(), logger).try_init() {
        eprintln!("Could not create logging/progress: {e}");
        return;
    }
    if let Err(e) = setup_file_logger() {
        log::error!("Could not create log file {LOG_FILE}: {e}");
        return;
    }

    // Parse the cli
    let Some(config_path) = matches.get_one::<String>("path").map(PathBuf::from) else {
        log::error!("A configuration path is required");
        return;
    };

    if let Some(("new", _)) = matches.subcommand() {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        match make_template_config(&config_path) {
            Ok(()) => log::info!("Done."),
            Err(e) => log::error!("Could not write template config: {e}"),
        }
        return;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    log::info!("Config successfully loaded.");
    log::info!("Input Path: {}", config.input_path.to_string_lossy());
    log::info!("Output Path: {}", config.output_path.to_string_lossy());
    log::info!(
        "Threads: {} Particles per chunk: {}",
        config.n_threads,
        config.particles_per_chunk
    );
    log::info!("Bin width: {}", config.time_binning.bin_width);

    // Setup the progress bars
    let worker_bars: Vec<ProgressBar> = (0..config.n_threads)
        .map(|id| make_bar(&pb_manager, format!("Worker {id}"), "cyan"))
        .collect();
    let bin_bar = make_bar(&pb_manager, String::from("Time bins"), "magenta");

    let (tx, rx) = mpsc::channel::<WorkerStatus>();
    // Spawn the task!
    let handle = std::thread::spawn(move || process(config, tx));

    loop {
        std::thread::sleep(std::time::Duration::from_millis(200));
        for status in rx.try_iter() {
            let position = (status.progress * 100.0) as u64;
            match status.phase {
                Phase::Particles => {
                    if let Some(bar) = worker_bars.get(status.worker_id) {
                        bar.set_position(position);
                    }
                }
                Phase::TimeBins => bin_bar.set_position(position),
            }
        }

        if handle.is_finished() {
            match handle.join() {
                Ok(result) => match result {
                    Ok(summary) => {
                        log::info!(
                            "Aggregated {} of {} particles into {} time bins",
                            summary.particles_aggregated,
                            summary.particles_read,
                            summary.time_bins
                        );
                        if summary.writer_gaps > 0 {
                            log::warn!(
                                "{} output payloads were missing, see {LOG_FILE}",
                                summary.writer_gaps
                            );
                        }
                    }
                    Err(e) => log::error!("Processing failed with error: {e}"),
                },
                Err(_) => log::error!("Failed to join processing task!"),
            }
            break;
        }
    }

    for bar in worker_bars {
        bar.finish();
    }
    bin_bar.finish();

    log::info!("Done.");
}
