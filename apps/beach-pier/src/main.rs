use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use beach_pier::{
    auth::{Authenticator, SharedSecretAuthenticator},
    config::{Cli, Command, IssueTokenArgs, ServerConfig},
    ids::random_key,
    metrics::PrometheusSink,
    routes::{router, AppState},
    telemetry::Telemetry,
};
use clap::Parser;
use tokio::signal;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(250);
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = Telemetry::init(&cli.log_level, cli.log_format)?;

    if let Some(Command::IssueToken(args)) = cli.command {
        return issue_token(args);
    }

    let config = ServerConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        instance_id = %config.instance_id,
        insecure = config.insecure,
        mcu_api = config.enable_mcu_api,
        "starting beach-pier"
    );
    run(config, &telemetry).await
}

fn issue_token(args: IssueTokenArgs) -> Result<()> {
    let token = SharedSecretAuthenticator::new(&args.secret)
        .issue(
            &args.subject,
            args.name.as_deref(),
            Duration::from_secs(args.ttl_secs),
        )
        .context("failed to issue token")?;
    println!("{token}");
    Ok(())
}

async fn run(config: ServerConfig, telemetry: &Telemetry) -> Result<()> {
    let secret = match &config.token_secret {
        Some(secret) => secret.clone(),
        None => {
            warn!("no token secret configured; relay tokens are only valid for this process");
            random_key(32)
        }
    };
    let authenticator: Arc<dyn Authenticator> = Arc::new(SharedSecretAuthenticator::new(secret));

    let root = CancellationToken::new();
    let state = AppState::new(
        &config,
        authenticator,
        Arc::new(PrometheusSink),
        Some(telemetry.metrics_handle()),
        root.clone(),
    );
    let sweepers = state.spawn_sweepers();

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-pier listening on {}", config.listen_addr);

    let stop_accepting = CancellationToken::new();
    let app = router(state.clone());
    let stopped = stop_accepting.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(stopped.cancelled_owned())
            .await
    });

    let _ = signal::ctrl_c().await;
    info!(
        active = state.active_connections(),
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; draining connections"
    );
    stop_accepting.cancel();
    state.begin_drain();
    drain(&state, config.shutdown_grace).await;

    root.cancel();
    for sweeper in sweepers {
        sweeper.abort();
    }
    match timeout(SERVER_STOP_TIMEOUT, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => warn!(error = %err, "server exited with error"),
        Ok(Err(err)) => warn!(error = %err, "server task failed"),
        Err(_) => warn!("server did not stop in time"),
    }
    info!("shutdown complete");
    Ok(())
}

/// Waits until every connection is gone, a second interrupt arrives or
/// `grace` elapses, whichever comes first.
async fn drain(state: &AppState, grace: Duration) {
    let deadline = sleep(grace);
    tokio::pin!(deadline);
    let mut poll = interval(DRAIN_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                warn!("second interrupt received; closing connections now");
                return;
            }
            _ = &mut deadline => {
                warn!(active = state.active_connections(), "shutdown grace period elapsed");
                return;
            }
            _ = poll.tick() => {
                if state.active_connections() == 0 {
                    info!("all connections drained");
                    return;
                }
            }
        }
    }
}
