use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancels `cancellation` on ctrl-c (and SIGTERM on unix). Returns early when something else
/// cancels the token first.
pub async fn detect_shutdown(cancellation: CancellationToken) {
    select! {
        _ = cancellation.cancelled() => return,
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received ctrl-c, shutting down"),
            Err(e) => {
                warn!("Can't listen for ctrl-c: {e:?}");
                cancellation.cancelled().await;
                return;
            }
        },
        _ = terminate() => info!("Received SIGTERM, shutting down"),
    };
    cancellation.cancel();
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!("Can't listen for SIGTERM: {e:?}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
