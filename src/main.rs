mod chain_client;
mod commitment;
mod config;
mod http;
mod locale;
mod monitor;
mod networks;
mod push;
mod scheduler;
mod store;
mod supervisor;

use config::Config;
use networks::NetworkId;
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::process;
use std::sync::Mutex;
use std::time;

// We always log on stdout, it'll be piped if we are daemonized.
fn setup_logger(log_level: log::LevelFilter) -> Result<(), fern::InitError> {
    let dispatcher = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                time::SystemTime::now()
                    .duration_since(time::UNIX_EPOCH)
                    .unwrap_or_else(|e| {
                        println!("Can't get time since epoch: '{}'. Using a dummy value.", e);
                        time::Duration::from_secs(0)
                    })
                    .as_secs(),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log_level);

    dispatcher.chain(std::io::stdout()).apply()?;
    Ok(())
}

fn create_datadir(path: &std::path::Path) -> std::io::Result<()> {
    fs::DirBuilder::new().recursive(true).create(path)
}

/// Logs a backtrace on panic instead of letting it go to stderr unattended, since we run
/// detached from a terminal as often as not.
fn setup_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = backtrace::Backtrace::new();
        log::error!("Panic: {}\n{:?}", info, backtrace);
    }));
}

#[tokio::main]
async fn main() {
    let config = Config::from_args().unwrap_or_else(|e| {
        eprintln!("Error parsing configuration: {}", e);
        process::exit(1);
    });

    setup_logger(config.log_level).unwrap_or_else(|e| {
        eprintln!("Error setting up logger: {}", e);
        process::exit(1);
    });

    setup_panic_hook();

    log::info!(
        "Starting watchtower for networks: {:?}",
        config.enabled_networks
    );

    create_datadir(&config.db_folder).unwrap_or_else(|e| {
        log::error!("Error creating db folder '{:?}': {}", config.db_folder, e);
        process::exit(1);
    });

    let supervisor = supervisor::Supervisor::start(&config).unwrap_or_else(|e| {
        log::error!("Error starting monitors: {}", e);
        process::exit(1);
    });

    let mut http_stores: HashMap<NetworkId, Mutex<store::Store>> = HashMap::new();
    for &network in &config.enabled_networks {
        match store::Store::open(&config.db_folder, network) {
            Ok(s) => {
                http_stores.insert(network, Mutex::new(s));
            }
            Err(e) => {
                log::error!("Error opening store for HTTP surface on '{}': {}", network, e);
                process::exit(1);
            }
        }
    }

    let app_state = http::AppState::new(http_stores, config.db_folder.clone(), config.with_commitments);
    let app = http::router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = std::net::TcpListener::bind(addr).unwrap_or_else(|e| {
        log::error!("Error binding HTTP listener on {}: {}", addr, e);
        process::exit(1);
    });
    let bound_addr = listener.local_addr().expect("a bound listener has a local address");
    log::info!("Listening for HTTP requests on {}", bound_addr);

    axum::Server::from_tcp(listener)
        .expect("converting a bound std TcpListener cannot fail")
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|e| {
            log::error!("HTTP server error: {}", e);
        });

    log::info!("Shutting down, waiting for in-flight monitor cycles to complete");
    supervisor.stop();
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C signal handler");
}
