#[allow(dead_code)]
mod access_control;
#[allow(dead_code)]
mod address;
#[allow(dead_code)]
mod auth;
#[allow(dead_code)]
mod config;
#[allow(dead_code)]
mod connection;
#[allow(dead_code)]
mod error;
#[allow(dead_code)]
mod error_pages;
#[allow(dead_code)]
mod host;
#[allow(dead_code)]
mod listen;
#[allow(dead_code)]
mod log_writer;
#[allow(dead_code)]
mod request;
#[allow(dead_code)]
mod router;
#[allow(dead_code)]
mod server;
#[allow(dead_code)]
mod static_files;
#[allow(dead_code)]
mod tls;

use config::AppConfig;
use error::StartupError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tls::TlsRuntime;

const CONFIGS_DIR: &str = "/etc/vhttpd";

/// `vhttpd [CONFIG_DIR]`, else `$VHTTPD_CONFIG`, else the built-in default.
fn configs_dir() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VHTTPD_CONFIG").ok())
        .unwrap_or_else(|| CONFIGS_DIR.to_string())
}

/// Poll for SIGINT/SIGTERM and raise `shutdown` once one arrives.
fn spawn_signal_watcher(shutdown: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        static STOP_RECEIVED: AtomicBool = AtomicBool::new(false);

        unsafe {
            libc::signal(libc::SIGINT, stop_handler as *const () as libc::sighandler_t);
            libc::signal(libc::SIGTERM, stop_handler as *const () as libc::sighandler_t);
        }

        loop {
            std::thread::sleep(Duration::from_secs(1));
            if STOP_RECEIVED.load(Ordering::SeqCst) {
                log::info!("Stop signal received, shutting down...");
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
        }

        extern "C" fn stop_handler(_sig: libc::c_int) {
            STOP_RECEIVED.store(true, Ordering::SeqCst);
        }
    });
}

fn run() -> Result<(), StartupError> {
    let dir = configs_dir();
    let config = AppConfig::load(&dir)?;
    log::info!(
        "Loaded {} with {} virtual hosts",
        dir,
        config.hosts.len()
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(StartupError::Runtime)?;

    let mut server = config.build_server(TlsRuntime::new())?;
    let (log_tx, log_rx) = log_writer::create_log_channel();
    server.set_log_sender(log_tx);
    let log_task = rt.spawn(log_writer::run_log_writer(log_rx));

    server.start()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_watcher(shutdown.clone());

    if let Err(e) = rt.block_on(server.run(shutdown)) {
        log::error!("Accept loops failed: {}", e);
    }
    server.stop();

    // Workers still draining hold log senders; do not wait on them forever.
    if rt
        .block_on(async { tokio::time::timeout(Duration::from_secs(5), log_task).await })
        .is_err()
    {
        log::warn!("Access log writer did not finish in time");
    }
    rt.shutdown_timeout(Duration::from_secs(5));
    Ok(())
}

fn main() {
    env_logger::init();
    log::info!("vhttpd starting...");

    if let Err(e) = run() {
        log::error!("{}", e);
        std::process::exit(1);
    }
    log::info!("vhttpd stopped");
}
