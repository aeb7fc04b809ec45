use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use ptsched::directory::InMemoryDirectory;
use ptsched::engine::Engine;
use ptsched::policy::SchedulingPolicy;
use ptsched::{maintenance, wire};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("PTSCHED_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    ptsched::observability::init(metrics_port)?;

    let port = std::env::var("PTSCHED_PORT").unwrap_or_else(|_| "5433".into());
    let bind = std::env::var("PTSCHED_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("PTSCHED_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let password = std::env::var("PTSCHED_PASSWORD").unwrap_or_else(|_| "ptsched".into());
    let max_connections: usize = std::env::var("PTSCHED_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(256);
    let compact_threshold: u64 = std::env::var("PTSCHED_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    let tls_acceptor = ptsched::tls::acceptor_from_env()?;
    let policy = SchedulingPolicy::from_env()?;

    std::fs::create_dir_all(&data_dir)?;

    let directory = Arc::new(InMemoryDirectory::new());
    let wal_path = PathBuf::from(&data_dir).join("ptsched.wal");
    let engine = Arc::new(Engine::new(wal_path, directory.clone(), policy)?);
    tokio::spawn(maintenance::run_compactor(
        engine.clone(),
        compact_threshold,
        Duration::from_secs(30),
    ));

    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("ptsched listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!(
        "  policy: reserve {}/{}/{}, open buffer {}",
        policy.reserve_30, policy.reserve_60, policy.reserve_90, policy.open_buffer
    );
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections.
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
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
                        metrics::counter!(ptsched::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(ptsched::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(ptsched::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let directory = directory.clone();
                let pw = password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, directory, pw, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(ptsched::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
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
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("ptsched stopped");
    Ok(())
}
