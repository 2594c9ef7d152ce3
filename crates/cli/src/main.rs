use std::io;
use std::path::PathBuf;

use clap::Parser;
use raop_core::{RaopConfig, RaopServer};

#[derive(Parser)]
#[command(name = "raop-receiver", about = "Standalone AirPlay-1 (RAOP) RTSP receiver")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address the RTSP listener binds to, overriding the config file.
    #[arg(long)]
    bind: Option<String>,

    /// TCP port the RTSP listener binds to, overriding the config file.
    #[arg(long, short)]
    port: Option<u16>,

    /// Digest auth password, overriding the config file.
    #[arg(long)]
    password: Option<String>,
}

fn load_config(args: &Args) -> RaopConfig {
    let mut config = match &args.config {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(text) => RaopConfig::from_toml(&text).unwrap_or_else(|e| {
                eprintln!("failed to parse {}: {e}", path.display());
                std::process::exit(1);
            }),
            Err(e) => {
                eprintln!("failed to read {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => RaopConfig::default(),
    };

    if let Some(bind) = &args.bind {
        config.bind_address = bind.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.password.is_some() {
        config.password = args.password.clone();
    }

    config
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = load_config(&args);
    let bind_address = config.bind_address.clone();
    let port = config.port;

    let server = match RaopServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("failed to build server: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.start() {
        eprintln!("failed to start server: {e}");
        std::process::exit(1);
    }

    println!("RAOP receiver listening on {bind_address}:{port} — press Enter to stop");
    let mut input = String::new();
    let _ = io::stdin().read_line(&mut input);

    if let Err(e) = server.stop() {
        eprintln!("failed to stop server cleanly: {e}");
    }
}
