use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::sync::oneshot;

/// Create a linked handle/signal pair. Every background loop owns a signal;
/// dropping the handle fires it, so teardown is deterministic: drop the
/// handles and the loops exit at their next suspension point.
pub fn shutdown_signal() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = oneshot::channel();

    (ShutdownHandle { _tx: tx }, ShutdownSignal { rx })
}

pub struct ShutdownHandle {
    _tx: oneshot::Sender<()>,
}

pub struct ShutdownSignal {
    rx: oneshot::Receiver<()>,
}

impl Future for ShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let rx = Pin::new(&mut self.rx);
        // Sent value and dropped sender both mean "stop".
        let _: Result<(), oneshot::error::RecvError> = ready!(rx.poll(cx));
        Poll::Ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    #[tokio::test]
    async fn signal_fires_when_handle_drops() {
        let (handle, mut signal) = shutdown_signal();

        tokio::time::timeout(Duration::from_millis(10), &mut signal)
            .await
            .expect_err("signal should not fire while handle is alive");

        drop(handle);
        tokio::time::timeout(Duration::from_millis(100), &mut signal)
            .await
            .expect("signal should fire once handle drops");
    }

    #[tokio::test]
    async fn dropped_handle_completes_pending_wait() {
        let (handle, signal) = shutdown_signal();
        let waiter = tokio::spawn(signal);
        drop(handle);
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("signal should fire")
            .expect("waiter task should not panic");
    }
}
