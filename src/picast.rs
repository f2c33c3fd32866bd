use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};

mod log;
mod utils;

use camstream::config::Config;

#[derive(Parser)]
#[command(name = "picast", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Extra config file layered on top of the defaults (.toml or .ini)
    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve,
    /// Take one still, save it, transfer it and print the report
    Capture,
    /// Send an already saved still to the configured remote host
    Upload { file: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let cfg: Config = match camstream::utils::load("picast", args.config.clone()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    log::set(format!(
        "picast={level},camstream={level},transfer={level},tower_http=info",
        level = cfg.log.level
    ));

    warn!("set log level: {}", cfg.log.level);
    debug!("load config: {:?}", cfg);

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let save_path = camstream::utils::save_path("picast", args.config.as_deref());
            serve(cfg, save_path).await
        }
        Commands::Capture => capture(cfg).await,
        Commands::Upload { file } => upload(cfg, file).await,
    }
}

async fn serve(cfg: Config, save_path: PathBuf) -> ExitCode {
    let listener = match tokio::net::TcpListener::bind(&cfg.http.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!("bind to {} failed: {}", &cfg.http.listen, e);
            return ExitCode::FAILURE;
        }
    };
    info!("server listening on : {}", &cfg.http.listen);

    if let Err(e) = camstream::serve(cfg, save_path, listener, utils::shutdown_signal()).await {
        error!("server error: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!("Server shutdown");
    ExitCode::SUCCESS
}

async fn capture(cfg: Config) -> ExitCode {
    match camstream::capture_once(cfg).await {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("failed to print report: {}", e),
            }
            if report.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("capture failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn upload(cfg: Config, file: PathBuf) -> ExitCode {
    match camstream::upload_file(cfg, &file).await {
        Ok(receipt) => {
            info!(
                "uploaded {} to {}:{} ({} bytes)",
                file.display(),
                receipt.host,
                receipt.remote_path,
                receipt.bytes
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("upload of {} failed: {:#}", file.display(), e);
            ExitCode::FAILURE
        }
    }
}
