//! Boilerplate shared by the bots in this workspace: logging setup,
//! the async runtime, and waiting for the process to be told to stop.

use std::future::Future;

/// Initialize logging and run `closure` to completion in a multi-threaded async runtime.
///
/// Logging filters are taken from the environment variable `RUST_LOG`, or from
/// `default_filter` if it's unset. This uses the crate [pretty_env_logger][] internally,
/// see its documentation for the filter syntax.
///
/// Timestamps are omitted when running as a systemd service, since journald adds its own.
///
/// [pretty_env_logger]: https://docs.rs/pretty_env_logger
///
/// # Panics
///
/// Panics if the async runtime can't be created.
pub fn start_everything(default_filter: &str, closure: impl Future<Output = ()>) {
    let filters = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());

    let running_as_systemd_service = std::env::var_os("JOURNAL_STREAM").is_some();

    let mut builder = match running_as_systemd_service {
        true => pretty_env_logger::formatted_builder(),
        false => pretty_env_logger::formatted_timed_builder(),
    };

    builder.parse_filters(&filters);

    if builder.try_init().is_err() {
        log::error!("Tried to init logger twice!");
    }

    log::info!("hi");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build the async runtime!")
        .block_on(closure);
}

/// Resolves once the process is asked to stop, either with Ctrl+C or, on Unix, with `SIGTERM`
/// (which is what systemd and container runtimes send).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Got Ctrl+C."),
        _ = terminate => log::info!("Got SIGTERM."),
    }
}
