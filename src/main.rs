use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::{stream, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use throttled_transform::{Config, ThrottledStreamExt, Throttler};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::load()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    // Logs go to stderr so stdout only carries results
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("throttled_transform={}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!(
        "Configuration: qps={}, work_delay={:?}",
        config.qps,
        config.work_delay
    );

    // Repeated lines are answered from here without using the rate budget
    let cache: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
    let lookup = cache.clone();
    let work_delay = config.work_delay;

    let throttler = Throttler::builder()
        .config(config.throttler_config()?)
        .bypass(move |line: &String| {
            lookup
                .lock()
                .ok()
                .and_then(|cache| cache.get(line).cloned())
        })
        .transform_async(move |line: String| {
            let cache = cache.clone();
            async move {
                tokio::time::sleep(work_delay).await;
                let result = line.to_uppercase();
                if let Ok(mut cache) = cache.lock() {
                    cache.insert(line, result.clone());
                }
                Ok(result)
            }
        })
        .build()?;

    let lines = BufReader::new(tokio::io::stdin()).lines();
    let input = stream::unfold(lines, |mut lines| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((line, lines)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to read input: {}", e);
                None
            }
        }
    });

    let started = Instant::now();
    let mut results = input.throttled(throttler.clone());
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            next = results.next() => match next {
                Some(Ok(value)) => println!("{}\t{}", started.elapsed().as_millis(), value),
                Some(Err(e)) => tracing::error!("Item failed: {}", e),
                None => break,
            },
            _ = &mut shutdown => {
                tracing::info!("Received shutdown signal, dropping queued items");
                throttler.shutdown();
                break;
            }
        }
    }

    let metrics = throttler.metrics();
    tracing::info!("Final metrics: {}", serde_json::to_string(&metrics)?);

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
