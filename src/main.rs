use sitewalker::cli::{Cli, Commands};
use sitewalker::config::Config;
use sitewalker::coordinator::new_walk;
use sitewalker::url_norm::normalize_url_string;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse_args();

    match cli.command {
        Commands::Start { config } => {
            let cfg = Config::from_json_file(&config)?;
            tracing::info!(config = %config.display(), "using config file");

            let (coord, job) = new_walk(&cfg)?;
            let job_id = job.id().to_string();

            coord.start_job(&job_id).await?;
            coord.shutdown().await?;

            println!("crawl {}: {}", job_id, job.status());
            println!("  urls finished: {}", job.finished_count());
            if let Some(err) = job.error() {
                println!("  error: {}", err);
            }
        }

        Commands::Normalize { url } => {
            println!("{}", normalize_url_string(&url)?);
        }
    }

    Ok(())
}
