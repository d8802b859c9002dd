use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tabletime::club::ClubManager;
use tabletime::config::ClubConfig;
use tabletime::observability;
use tabletime::wire;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("no SIGTERM handler ({e}), waiting for ctrl-c only");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tabletime=info")),
        )
        .init();

    let metrics_port: Option<u16> = env_parse("TABLETIME_METRICS_PORT");
    observability::init(metrics_port)?;

    let port = std::env::var("TABLETIME_PORT").unwrap_or_else(|_| "5433".into());
    let bind = std::env::var("TABLETIME_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("TABLETIME_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let password = std::env::var("TABLETIME_PASSWORD").unwrap_or_else(|_| "tabletime".into());
    let max_connections: usize = env_parse("TABLETIME_MAX_CONNECTIONS").unwrap_or(256);
    let compact_threshold: u64 = env_parse("TABLETIME_COMPACT_THRESHOLD").unwrap_or(1000);

    let tls_cert = std::env::var("TABLETIME_TLS_CERT").ok();
    let tls_key = std::env::var("TABLETIME_TLS_KEY").ok();
    let tls_acceptor =
        tabletime::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    let config = ClubConfig::from_env();

    std::fs::create_dir_all(&data_dir)?;

    let clubs = Arc::new(ClubManager::new(
        PathBuf::from(&data_dir),
        compact_threshold,
        config.clone(),
    ));
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("tabletime listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  hours: {:02}:{:02}-{:02}:{:02} UTC{:+}min, step {}min, primary location {}",
        config.open_minute / 60,
        config.open_minute % 60,
        config.close_minute / 60,
        config.close_minute % 60,
        config.utc_offset_minutes,
        config.step_minutes,
        config.primary_location,
    );

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let clubs = clubs.clone();
                let pw = password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, clubs, pw, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("tabletime stopped");
    Ok(())
}
