use clap::Parser;
use log::{error, info};

use noteflow::{initialize_logger, App, Cli, Config, RecordStore};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    initialize_logger(cli.verbose);
    info!("Application starting up");

    let config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                eprintln!("Error: {}", e);
                std::process::exit(2);
            }
        },
        None => Config::default(),
    };
    let config = match cli.data_dir {
        Some(dir) => Config {
            data_dir: dir,
            ..config
        },
        None => config,
    };

    let store = RecordStore::new(config);
    let app = App::new(store.clone());
    let result = app.run(cli.command).await;
    store.close().await;

    if let Err(e) = result {
        error!("Command failed: {}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    info!("Application shutting down");
}
