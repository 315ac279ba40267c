//! Graceful shutdown on OS termination signals.

/// Resolves when the server should begin shutting down. On Unix this is
/// SIGINT or SIGTERM; elsewhere Ctrl+C only. Intended for
/// `axum::serve(..).with_graceful_shutdown()`.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for SIGINT: {e}");
        }
    };

    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!("failed to listen for SIGTERM: {e}");
                    ctrl_c.await;
                    return;
                }
            };

        tokio::select! {
            () = ctrl_c => tracing::info!("received SIGINT, shutting down"),
            _ = terminate.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        tracing::info!("received Ctrl+C, shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `axum::serve` requires a `Send` future with unit output.
    #[test]
    fn signal_future_is_send() {
        fn assert_send<T: std::future::Future<Output = ()> + Send>(_: T) {}
        assert_send(shutdown_signal());
    }
}
