use anyhow::{Context, Result};
use minecraft_host_proxy::{DEFAULT_CONFIG_PATH, ProxyConfig, ProxyServer, load_config};
use std::{
    env,
    io::{self, BufRead},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const CONSOLE_BACKLOG: usize = 16;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);

    let config = load_config(&config_path)?;
    info!(
        config_file = %config_path.display(),
        listen_ip = %config.ip_address,
        listen_port = config.port,
        servers = config.servers.len(),
        "Configuration loaded"
    );

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;

    let server = Arc::new(ProxyServer::from_config(&config));
    let accept_loop = tokio::spawn(Arc::clone(&server).serve(listener));

    run_console(&server, &config_path, &config).await;

    info!("Waiting for proxy to stop");
    server.stop(config.shutdown_timeout()).await;
    accept_loop.await.context("Accept loop panicked")??;

    info!("Proxy has stopped");
    Ok(())
}

/// Reads console lines on a plain thread. Tokio's stdin blocks runtime
/// shutdown while a read is pending, whereas this thread is simply abandoned
/// when `main` returns.
fn spawn_console_reader<R>(source: R) -> mpsc::Receiver<io::Result<String>>
where
    R: BufRead + Send + 'static,
{
    let (lines_tx, lines_rx) = mpsc::channel(CONSOLE_BACKLOG);

    thread::spawn(move || {
        for line in source.lines() {
            let failed = line.is_err();
            if lines_tx.blocking_send(line).is_err() || failed {
                break;
            }
        }
    });

    lines_rx
}

/// Handles `reload` and `stop` typed on stdin until a stop is requested,
/// stdin closes, or Ctrl-C is pressed.
async fn run_console(server: &ProxyServer, config_path: &Path, config: &ProxyConfig) {
    let mut lines = spawn_console_reader(io::BufReader::new(io::stdin()));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                return;
            }
            line = lines.recv() => match line {
                Some(Ok(line)) => match line.trim().to_lowercase().as_str() {
                    "" => {}
                    "reload" => reload(server, config_path, config),
                    "stop" => return,
                    other => error!(
                        command = other,
                        "Invalid command. Valid commands include: reload, stop"
                    ),
                },
                Some(Err(e)) => {
                    error!(error = %e, "Failed to read console input");
                    return;
                }
                None => {
                    info!("Console closed");
                    return;
                }
            },
        }
    }
}

fn reload(server: &ProxyServer, config_path: &Path, running: &ProxyConfig) {
    match server.reload_from(config_path) {
        Ok(updated) => {
            if updated.listen_addr() != running.listen_addr() {
                warn!(
                    listen_addr = %running.listen_addr(),
                    configured_addr = %updated.listen_addr(),
                    "Listen address changes take effect after a restart"
                );
            }
            info!(
                servers = updated.servers.len(),
                "Proxy configuration updated"
            );
        }
        Err(e) => error!(
            error = %format!("{e:#}"),
            "New proxy configuration was invalid, keeping current routes"
        ),
    }
}
