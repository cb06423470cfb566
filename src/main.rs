//! Stratum Pool Client - Main Application
//!
//! Connects to a Stratum v1 pool and keeps a simulated share stream flowing
//! until interrupted.

use stratum_pool_client::{
    config::LogLevel, Config, PoolEvent, Result, StratumPoolClient, APP_NAME, APP_VERSION,
};

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load and validate configuration
    let config = Config::load().await?;

    init_tracing(config.log_level);

    if config.print_config {
        print_configuration(&config)?;
        return Ok(());
    }

    let (pool_url, identifier) = config.pool()?;

    info!("Starting {} v{}", APP_NAME, APP_VERSION);
    info!(
        "Configuration: pool={}, identifier={}, worker={}, hash_rate={}",
        pool_url,
        identifier,
        config.worker_name,
        config.hash_rate()?
    );

    let (mut client, mut events) = StratumPoolClient::new(config.client_config()?)?;

    match client.connect(pool_url, identifier, &config.worker_name).await {
        Ok(()) => {}
        // The connection task keeps retrying in the background
        Err(e) if e.is_retryable() => {
            warn!(category = e.category(), "Initial connection failed: {}", e)
        }
        Err(e) => return Err(e),
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                let given_up = matches!(event, PoolEvent::MaxReconnectAttemptsReached { .. });
                log_event(&event);
                if given_up {
                    break;
                }
            }
        }
    }

    let shares = client.disconnect().await.shares;

    info!(
        "Shares: {} submitted, {} accepted, {} rejected",
        shares.submitted, shares.accepted, shares.rejected
    );
    Ok(())
}

/// Initialize tracing; `RUST_LOG` overrides the configured level
fn init_tracing(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn log_event(event: &PoolEvent) {
    match event {
        PoolEvent::Subscribed {
            extranonce1,
            extranonce2_size,
        } => info!(
            "Subscribed (extranonce1={}, extranonce2_size={})",
            extranonce1, extranonce2_size
        ),
        PoolEvent::Authorized => info!("Worker authorized"),
        PoolEvent::AuthorizationFailed { error } => {
            error!("Authorization failed: {}", describe(error.as_ref()))
        }
        PoolEvent::NewJob(job) => info!(
            "New job {} (difficulty {}, clean={})",
            job.id, job.difficulty, job.clean_jobs
        ),
        PoolEvent::DifficultyChanged(difficulty) => info!("Difficulty set to {}", difficulty),
        PoolEvent::ShareSubmitted {
            job_id, difficulty, ..
        } => info!("Submitted share for job {} at difficulty {}", job_id, difficulty),
        PoolEvent::ShareResult {
            job_id,
            accepted: true,
            ..
        } => info!("Share for job {} accepted", job_id),
        PoolEvent::ShareResult { job_id, error, .. } => {
            warn!("Share for job {} rejected: {}", job_id, describe(error.as_ref()))
        }
        PoolEvent::SocketError(message) => warn!("Socket error: {}", message),
        PoolEvent::Disconnected => warn!("Disconnected from pool"),
        PoolEvent::Reconnecting { attempt, delay } => {
            info!("Reconnecting in {:?} (attempt {})", delay, attempt)
        }
        PoolEvent::MaxReconnectAttemptsReached { attempts } => {
            error!("Giving up after {} reconnect attempts", attempts)
        }
    }
}

fn describe(error: Option<&serde_json::Value>) -> String {
    error.map_or_else(|| "no reason given".to_string(), |e| e.to_string())
}

/// Print current configuration
fn print_configuration(config: &Config) -> Result<()> {
    let config_yaml = serde_yaml::to_string(config)?;
    println!("{}", config_yaml);
    Ok(())
}
