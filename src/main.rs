use goule::app::{PKG_NAME, VERSION};
use goule::config::ConfigStore;
use goule::Goule;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// How often expired admin sessions are dropped
const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("goule=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("goule.json"));

    let store = ConfigStore::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&store);

    let app = Goule::new(store);
    if let Err(e) = app.start().await {
        error!(error = %e, "Failed to start");
        app.shutdown().await;
        return Err(e.into());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let purge_handle = tokio::spawn(session_purge_loop(Arc::clone(&app), shutdown_rx));

    wait_for_signal().await;

    let _ = shutdown_tx.send(true);
    let _ = purge_handle.await;

    info!("Stopping listeners and services...");
    app.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

async fn session_purge_loop(app: Arc<Goule>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(SESSION_PURGE_INTERVAL) => {
                app.sessions().purge_expired();
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn print_startup_banner(store: &ConfigStore) {
    let config = store.config();
    info!(name = PKG_NAME, version = VERSION, "Starting goule");
    info!(
        path = %store.path().display(),
        http_enabled = config.http.enabled,
        http_port = config.http.port,
        https_enabled = config.https.enabled,
        https_port = config.https.port,
        named_certificates = config.tls.named.len(),
        admin_rules = config.admin.rules.len(),
        "Server configuration"
    );
    for service in &config.services {
        let autolaunch = service.executables.iter().filter(|e| e.autolaunch).count();
        info!(
            service = %service.name,
            rules = service.forward_rules.len(),
            executables = service.executables.len(),
            autolaunch,
            "Configured service"
        );
    }
    if config.admin.password_hash.is_empty() {
        info!("No admin password set; every admin login will be rejected");
    }
}
