//! Runtime helpers shared by the listening servers.

use std::future::Future;

use tokio::sync::watch;

/// Drive `serve` until it finishes or the shutdown channel signals.
///
/// A receiver that is already signalled (or whose sender is gone) stops the
/// server before `serve` is polled at all, so a late-started listener never
/// binds after shutdown began.
pub async fn serve_until_shutdown<E>(
    serve: impl Future<Output = Result<(), E>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), E> {
    let stop = async move {
        if !*shutdown_rx.borrow_and_update() {
            let _ = shutdown_rx.changed().await;
        }
    };
    tokio::select! {
        biased;
        () = stop => Ok(()),
        result = serve => result,
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[tokio::test]
    async fn already_signalled_receiver_stops_before_serving() {
        let (_tx, rx) = watch::channel(true);
        let served = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = std::sync::Arc::clone(&served);

        let result: Result<(), io::Error> = serve_until_shutdown(
            async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                std::future::pending().await
            },
            rx,
        )
        .await;

        assert!(result.is_ok());
        assert!(!served.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn signal_stops_a_running_server() {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(serve_until_shutdown(
            std::future::pending::<Result<(), io::Error>>(),
            rx,
        ));

        tx.send(true).expect("send shutdown");
        let result = task.await.expect("join");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn server_errors_pass_through() {
        let (_tx, rx) = watch::channel(false);
        let result = serve_until_shutdown(
            async { Err::<(), _>(io::Error::other("bind failed")) },
            rx,
        )
        .await;

        assert_eq!(result.expect_err("error").to_string(), "bind failed");
    }
}
