use anyhow::{Context, Result};
use scanner::{Scanner, config};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = config::load()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(
        mode = ?cfg.scan.mode,
        start = ?cfg.scan.start_block,
        end = ?cfg.scan.end_block,
        contracts = cfg.scan.contracts.len(),
        endpoints = cfg.endpoints.len(),
        store = %cfg.storage.directory.display(),
        "scanner starting"
    );

    let mut scanner = Scanner::from_config(&cfg).await?;
    let shutdown = CancellationToken::new();

    let mut join_set: JoinSet<Result<u64>> = JoinSet::new();
    {
        let shutdown = shutdown.clone();
        join_set.spawn(async move { scanner.run(&shutdown).await });
    }

    let mut outcome: Option<Result<u64>> = None;
    tokio::select! {
        res = shutdown_signal() => {
            res?;
            tracing::info!("shutdown requested, saving");
        }
        res = join_set.join_next() => {
            if let Some(res) = res {
                outcome = Some(res.context("scan task panicked")?);
            }
        }
    }

    shutdown.cancel();
    while let Some(res) = join_set.join_next().await {
        outcome.get_or_insert(res.context("scan task panicked")?);
    }

    match outcome {
        Some(Ok(latest)) => {
            tracing::info!(latest, "scan finished");
            Ok(())
        }
        Some(Err(err)) => Err(err),
        None => Ok(()),
    }
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("ctrl-c")?;
        Ok(())
    }
}
