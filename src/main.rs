//! tinymq - a lightweight single-threaded MQTT 5.0 broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{error, info};

use tinymq::config::Config;
use tinymq::metrics::BrokerMetrics;
use tinymq::prometheus;
use tinymq::server::Server;

struct Args {
    config_path: String,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = "tinymq.toml".to_string();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                if i + 1 < args.len() {
                    config_path = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("Error: -c requires a file path");
                    std::process::exit(1);
                }
            }
            "-h" | "--help" => {
                println!("tinymq - Lightweight MQTT 5.0 broker");
                println!();
                println!("Usage: tinymq [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <FILE>     Config file path (default: tinymq.toml)");
                println!("  -h, --help              Show this help message");
                println!();
                println!("Configuration:");
                println!("  Config file uses TOML format. All settings can be overridden");
                println!("  with environment variables using TINYMQ__ prefix:");
                println!();
                println!("  TINYMQ__SERVER__BIND=0.0.0.0:1884");
                println!("  TINYMQ__LIMITS__MAX_PACKET_SIZE=2097152");
                println!("  TINYMQ__PROMETHEUS__ENABLED=true");
                println!("  TINYMQ__LOG__LEVEL=debug");
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                eprintln!("Use --help for usage information");
                std::process::exit(1);
            }
        }
    }

    Args { config_path }
}

fn main() {
    let args = parse_args();

    let config = match Config::load(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.log.level),
    )
    .init();

    let start_time = Instant::now();
    let config = Arc::new(config);
    let metrics = Arc::new(BrokerMetrics::new());

    // SIGINT/SIGTERM clear the flag; the loop exits on its next tick.
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("termination signal received");
            running.store(false, Ordering::Relaxed);
        }) {
            error!("failed to install signal handler: {}", e);
            std::process::exit(1);
        }
    }

    if config.prometheus.enabled {
        prometheus::start_metrics_server(config.prometheus.bind, metrics.clone(), start_time);
    }

    let mut server = match Server::new(config, metrics, running) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to start server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        error!("server error: {}", e);
        std::process::exit(1);
    }

    info!("tinymq stopped");
}
