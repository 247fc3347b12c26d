//! # daq_buffer_cli
//!
//! Part of the daq_buffer crate family.
//!
//! Runs the event assembly pipeline against the in-memory driver, fed by the frame emulator,
//! and reports its status once per second.
//!
//! ## Use
//!
//! Make a template configuration with
//!
//! ```bash
//! daq_buffer_cli new -p config.yml
//! ```
//!
//! then run with
//!
//! ```bash
//! daq_buffer_cli -p config.yml
//! ```
//!
//! The run lasts `run_seconds` seconds, or forever if that field is `null`. A log file
//! `daq_buffer.log` is written to the working directory.
use clap::{Arg, Command};
use human_bytes::human_bytes;
use indicatif::ProgressBar;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use libdaq_buffer::config::Config;
use libdaq_buffer::counters::BufferStatus;
use libdaq_buffer::daq_buffer::DaqBuffer;
use libdaq_buffer::emulator::Emulator;
use libdaq_buffer::memory_driver::MemoryDriver;

fn make_template_config(path: &Path) {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).unwrap();
    let mut file = File::create(path).expect("Could create template config file!");
    file.write_all(yaml_str.as_bytes())
        .expect("Failed to write yaml data to file!");
}

fn setup_logging() {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from("./daq_buffer.log"))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()
            .expect("Could not create the log file!"),
    );
    let console_sinks = spdlog::default_logger().sinks().to_vec();
    let logger = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sinks(console_sinks)
            .sink(file_sink)
            .build()
            .expect("Could not create the logger!"),
    );
    spdlog::set_default_logger(logger);
}

fn status_message(status: &BufferStatus) -> String {
    format!(
        "rx {:.0} Hz ({:.1} Mbit/s, {}) | trg {:.1} Hz | tx {:.1} Hz ({:.1} Mbit/s) | err rx {} tx {} | short {} | drop {} | pend {}/{}",
        status.rx_rate,
        status.rx_bw,
        human_bytes(status.counters.rx_total as f64),
        status.trigger_rate,
        status.tx_rate,
        status.tx_bw,
        status.counters.rx_errors,
        status.counters.tx_errors,
        status.counters.missing_count,
        status.counters.drop_count,
        status.rx_pend,
        status.buff_count,
    )
}

fn main() {
    // Create a cli
    let matches = Command::new("daq_buffer_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .help("Path to the file"),
        )
        .get_matches();

    setup_logging();

    // Parse the cli
    let config_path = PathBuf::from(matches.get_one::<String>("path").expect("We require args"));

    if let Some(("new", _)) = matches.subcommand() {
        spdlog::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        make_template_config(&config_path);
        spdlog::info!("Done.");
        return;
    }

    // Load our config
    spdlog::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            spdlog::error!("{e}");
            return;
        }
    };
    spdlog::info!("Config successfully loaded.");
    spdlog::info!(
        "Buffers: {} x {}",
        config.buffer_count,
        human_bytes(config.buffer_size as f64)
    );
    spdlog::info!("Run mode: {:?}", config.run_mode);
    spdlog::info!(
        "Window: {} ticks before, {} ticks after",
        config.pretrigger,
        config.posttrigger
    );

    let driver = Arc::new(MemoryDriver::new(config.buffer_count, config.buffer_size));
    let mut daq = match DaqBuffer::new(config.clone(), driver.clone()) {
        Ok(daq) => daq,
        Err(e) => {
            spdlog::error!("{e}");
            return;
        }
    };
    if let Err(e) = daq.open() {
        spdlog::error!("{e}");
        return;
    }
    daq.set_run_mode(config.run_mode);
    if let Some(address) = &config.tx_address {
        match daq.enable_tx(address, config.tx_port) {
            Ok(()) => spdlog::info!("Sending events to {}:{}", address, config.tx_port),
            Err(e) => spdlog::error!("{e}"),
        }
    }
    daq.start_run();

    let mut emulator = if config.emulator.enabled {
        match Emulator::start(driver.clone(), config.emulator.clone()) {
            Ok(emulator) => Some(emulator),
            Err(e) => {
                spdlog::error!("{e}");
                None
            }
        }
    } else {
        None
    };

    let pb = ProgressBar::new_spinner();
    let started = Instant::now();
    loop {
        std::thread::sleep(Duration::from_secs(1));
        let status = daq.status();
        pb.set_message(status_message(&status));
        pb.tick();

        if let Some(seconds) = config.run_seconds {
            if started.elapsed() >= Duration::from_secs(seconds) {
                break;
            }
        }
    }

    if let Some(emulator) = emulator.as_mut() {
        emulator.stop();
    }
    daq.close();

    let status = daq.status();
    pb.finish_with_message(status_message(&status));
    spdlog::info!(
        "Received {} frames ({}), sent {} events ({}), {} triggers",
        status.counters.rx_count,
        human_bytes(status.counters.rx_total as f64),
        status.counters.tx_count,
        human_bytes(status.counters.tx_total as f64),
        status.counters.triggers
    );
    spdlog::info!("Done.");
}
