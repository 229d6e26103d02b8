#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Myco node entrypoint (systemd-friendly). Loads [`myco::node::config::Settings`]
//! from the environment, bootstraps a node, and runs the synchronous tick loop
//! on a dedicated thread while the admin HTTP surface serves on the tokio runtime.

use tracing::{error, info};

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .compact()
        .try_init();

    let settings = match myco::node::config::Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let admin_addr: std::net::SocketAddr = match settings.admin_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("invalid MYCO_ADMIN_ADDR: {e}");
            std::process::exit(1);
        }
    };

    let (node, handle) = match myco::node::bootstrap(settings) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("node bootstrap failed: {e}");
            std::process::exit(1);
        }
    };

    let metrics = node.metrics();

    info!(node = %node.node_id(), admin = %admin_addr, "myco node starting");

    let tick_thread = std::thread::spawn(move || {
        if let Err(e) = node.run() {
            error!(?e, "tick loop exited with error");
        }
    });

    if let Err(e) = myco::admin::serve(admin_addr, handle, metrics).await {
        error!(?e, "admin surface exited with error");
    }

    let _ = tick_thread.join();
}
