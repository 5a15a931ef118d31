use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a SIGTERM/SIGINT handler for coordinator teardown.
///
/// The first signal cancels the returned token; the server loop reacts by
/// killing its indexer children, saving the file-id table, and removing the
/// socket file. A second signal exits the process on the spot, skipping all
/// of that.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, tearing down the coordinator");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, tearing down the coordinator");
            }
        }
        token_clone.cancel();

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::warn!("Second signal, exiting without saving state");
        std::process::exit(1);
    });

    token
}
