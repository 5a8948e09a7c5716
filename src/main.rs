use bounce_sweeper::job::{run_job, JobOptions};
use bounce_sweeper::lock::LockService;
use bounce_sweeper::Config;
use bounce_sweeper::db;
use clap::{Arg, Command};
use log::LevelFilter;
use std::process;

fn main() {
    let matches = Command::new("bounce-sweeper")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Scheduled bounce-processing job: download, classify and act on undeliverable mail")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/bounce-sweeper.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("protocol")
                .short('p')
                .long("protocol")
                .value_name("PROTOCOL")
                .help("Mailbox protocol to download bounces with (pop or mbox)")
                .default_value("pop"),
        )
        .arg(
            Arg::new("rules-batch-size")
                .long("rules-batch-size")
                .value_name("N")
                .help("Batch size for the advanced rule processing loop")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("purge-unprocessed")
                .long("purge-unprocessed")
                .help("Delete bounces that could not be classified at all, after all passes")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test")
                .short('t')
                .long("test")
                .help("Test mode: leave mailbox messages in place for manual inspection")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("force")
                .short('f')
                .long("force")
                .help("Force takeover of the processing lock, terminating the current holder")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches.get_one::<String>("config").unwrap();
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    let options = JobOptions {
        protocol: matches.get_one::<String>("protocol").unwrap().clone(),
        purge_unprocessed: matches.get_flag("purge-unprocessed"),
        rules_batch_size: matches
            .get_one::<String>("rules-batch-size")
            .and_then(|s| s.parse().ok())
            .unwrap_or(config.rules_batch_size),
        test_mode: matches.get_flag("test"),
    };
    let force = matches.get_flag("force");

    process::exit(run(&config, &options, force));
}

fn run(config: &Config, options: &JobOptions, force: bool) -> i32 {
    let db = match db::open(&config.database_path) {
        Ok(db) => db,
        Err(e) => {
            log::error!("{e:?}");
            eprintln!("Error opening database: {e}");
            return 1;
        }
    };

    let lock_service = LockService::new(db.clone());
    let guard = match lock_service.acquire(&config.lock_name, force) {
        Ok(Some(guard)) => guard,
        Ok(None) => {
            if force {
                eprintln!("Could not take over the bounce processing lock");
                return 1;
            }
            // Another run is active; that is expected, not a failure.
            println!("Bounce processing is already running, skipping this run");
            return 0;
        }
        Err(e) => {
            log::error!("{e:?}");
            eprintln!("Error acquiring processing lock: {e}");
            return 1;
        }
    };

    // The guard also releases on drop, covering the error paths below.
    let code = match run_job(db, config, options) {
        Ok(summary) => {
            println!("{}", summary.render());
            0
        }
        Err(e) => {
            log::error!("Bounce processing failed: {e:?}");
            eprintln!("Bounce processing failed: {e}");
            1
        }
    };
    guard.release();
    code
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}
