use anyhow::Result;
use clap::Parser;
use serializd_relay::config;
use serializd_relay::db;
use serializd_relay::discord::DiscordClient;
use serializd_relay::pipeline::dispatch::Dispatcher;
use serializd_relay::pipeline::retry::RetryPolicy;
use serializd_relay::pipeline::{PollSettings, Poller};
use serializd_relay::serializd::SerializdClient;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/relay.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let timeout = Duration::from_secs(cfg.app.request_timeout_seconds);
    let diary = Arc::new(SerializdClient::with_base_url(
        reqwest::Url::parse(&cfg.serializd.base_url)?,
        timeout,
    ));
    let sink = Arc::new(DiscordClient::new(cfg.discord.bot_token.clone(), timeout));

    let dispatcher = Dispatcher::new(
        sink,
        Duration::from_millis(cfg.app.send_spacing_ms),
        RetryPolicy {
            max_attempts: cfg.app.send_retry_max_attempts,
            base_delay: Duration::from_millis(cfg.app.fetch_retry_base_delay_ms),
            max_delay: Duration::from_millis(cfg.app.fetch_retry_max_delay_ms),
        },
    );

    let poller = Poller::new(pool, diary, dispatcher, PollSettings::from_config(&cfg));

    info!("starting diary relay");
    poller.run(cfg.poll_interval()).await;

    Ok(())
}
