use chrono::NaiveDateTime;
use clap::Parser;
use log::{debug, error, info};
use pumplink::{
    build_timeline, parse_capture, FinalizeContext, ImportConfig, PumpError, RecordDecoder,
    SimulatorOptions,
};
use std::fs;
use std::path::PathBuf;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "pumplink")]
#[command(about = "Rebuild an insulin pump event timeline from a captured history download")]
struct Args {
    /// Import configuration (JSON)
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    /// History capture, one `<kind> <device-index> <hex bytes>` line per record
    #[arg(long, value_name = "FILE")]
    capture: PathBuf,

    /// Pump clock at readout, e.g. 2015-06-20T10:15:00
    #[arg(long)]
    settings_time: Option<NaiveDateTime>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(path: &PathBuf) -> pumplink::Result<ImportConfig> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn run(args: &Args, config: &ImportConfig) -> pumplink::Result<()> {
    let decoder = RecordDecoder::for_profile(&config.device);
    let capture = fs::read_to_string(&args.capture)?;
    let records = parse_capture(&capture, &decoder)?;
    info!(
        "Decoded {} records from {}",
        records.len(),
        args.capture.display()
    );

    let context = FinalizeContext {
        settings_time: args.settings_time,
        schedule: None,
    };
    let events = build_timeline(records, SimulatorOptions::from(config), &context)?;
    info!("Rebuilt {} events", events.len());

    println!("{}", serde_json::to_string_pretty(&events)?);
    Ok(())
}

fn main() {
    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Cannot read {}: {}", args.config.display(), e);
            std::process::exit(2);
        }
    };

    let level = if args.verbose || config.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    debug!("Import configuration: {:?}", config);

    if let Err(e) = run(&args, &config) {
        error!("{}", e);
        let code = match e {
            PumpError::Io(_) => 2,
            _ => 1,
        };
        eprintln!("{}", e.user_message());
        std::process::exit(code);
    }
}
