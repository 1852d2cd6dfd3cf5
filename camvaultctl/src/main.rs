use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = camvaultctl::Cli::parse();
    let filter = EnvFilter::try_new(&cli.loglevel)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = camvaultctl::run(cli).await {
        eprintln!("erro: {err}");
        std::process::exit(1);
    }
}
