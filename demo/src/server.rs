use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vaultshare_sdk::Server;

#[derive(Debug, Parser)]
#[command(name = "vaultshare-server")]
#[command(about = "Host a workspace file-sharing server", long_about = None)]
struct Cli {
    #[arg(
        short,
        long,
        default_value = "127.0.0.1:7878",
        help = "Address to listen on"
    )]
    address: String,
    #[arg(
        short,
        long,
        default_value = "vaultshare-data",
        help = "Server data directory"
    )]
    data: PathBuf,
    #[arg(short, long, help = "PEM certificate chain")]
    certificate: PathBuf,
    #[arg(short, long, help = "PEM private key")]
    key: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vaultshare_demo=info,vaultshare_sdk=info".into()),
        )
        .init();

    let args = Cli::parse();
    let server = match Server::bind(&args.address, &args.data, &args.certificate, &args.key).await
    {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("could not start: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                tracing::error!("server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }
}
