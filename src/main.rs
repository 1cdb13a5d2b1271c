//! CLI entry point (ambient; grounded in the teacher's `main.rs`/
//! `nfc_service_cli`/`read_nfc_data_cli`/`write_nfc_data_cli`). `serve` wires
//! the Lifecycle Manager, Reader Loop and WebSocket transport together the
//! way the teacher's `main` does; `read`/`write` are one-shot CLI commands
//! useful without the websocket transport running.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use log::{error, info};

use nfc_agent::classifier;
use nfc_agent::clock::SystemClock;
use nfc_agent::config::AgentConfig;
use nfc_agent::lifecycle::{DeviceLifecycleManager, PcscOpener};
use nfc_agent::reader_loop::ReaderLoop;
use nfc_agent::reader_manager;
use nfc_agent::tags::TagOps;

#[derive(Debug, Parser)]
#[command(author, version, about = "NFC reader agent", long_about = None)]
struct Cli {
    #[arg(long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the WebSocket-fronted reader loop (default).
    Serve,
    /// One-shot read of whatever tag is currently presented.
    Read,
    /// One-shot write of hex-encoded NDEF payload bytes to the presented tag.
    Write {
        #[arg(value_name = "HEX_DATA")]
        data: String,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_serve(config),
        Command::Read => run_read(config),
        Command::Write { data } => run_write(config, &data),
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(AgentConfig::from_reader(File::open(path)?)?),
        None => Ok(AgentConfig::default()),
    }
}

fn run_serve(config: AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let context = reader_manager::establish_context()?;
    let opener = Box::new(PcscOpener { context });
    let clock = Arc::new(SystemClock::new());
    let manager = Arc::new(DeviceLifecycleManager::with_tuning(
        opener,
        config.reader.clone(),
        clock.clone(),
        config.tuning,
    ));
    let reader_loop = Arc::new(ReaderLoop::new(manager, clock, config.mode));

    let (_stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    let loop_handle = {
        let reader_loop = reader_loop.clone();
        std::thread::spawn(move || reader_loop.run(&stop_rx))
    };

    info!("serving on {}:{}", config.ws_bind_addr, config.ws_port);
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(nfc_agent::ws::start_server(
        reader_loop,
        config.ws_bind_addr,
        config.ws_port,
    ));

    let _ = loop_handle.join();
    Ok(())
}

fn run_read(config: AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let shared = open_shared_device(&config)?;
    let atr = shared.lock().expect("device mutex poisoned").atr().to_vec();
    match classifier::classify(&shared, &atr)? {
        Some(tag) => println!("{}", hex::encode(tag.read_data()?)),
        None => println!("unsupported tag"),
    }
    Ok(())
}

fn run_write(config: AgentConfig, hex_data: &str) -> Result<(), Box<dyn std::error::Error>> {
    let data = hex::decode(hex_data)?;
    let shared = open_shared_device(&config)?;
    let atr = shared.lock().expect("device mutex poisoned").atr().to_vec();
    match classifier::classify(&shared, &atr)? {
        Some(tag) => {
            tag.write_data(&data)?;
            println!("write ok");
        }
        None => println!("unsupported tag"),
    }
    Ok(())
}

fn open_shared_device(
    config: &AgentConfig,
) -> Result<Arc<Mutex<nfc_agent::device::DeviceSession>>, Box<dyn std::error::Error>> {
    let context = reader_manager::establish_context()?;
    let device = reader_manager::open(&context, &config.reader)?;
    Ok(Arc::new(Mutex::new(device)))
}
