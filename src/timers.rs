use crate::shutdown::ShutdownSignal;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub(crate) use time::{Clock, RealClock};
#[cfg(test)]
pub(crate) use time::mocked_clock;

/// Run `tick` every `period` until the shutdown signal fires. The first
/// tick happens one full period after spawn; a slow tick delays the next
/// one rather than piling up.
pub(crate) fn spawn_ticker<C, F, Fut>(
    period: tokio::time::Duration,
    mut clock: C,
    mut shutdown: ShutdownSignal,
    mut tick: F,
) -> JoinHandle<()>
where
    C: Clock + Send + Sync + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut next_tick: Instant = clock.now() + period;
        loop {
            tokio::select! {
                _ = &mut shutdown => return,
                _ = clock.sleep_until(next_tick) => {
                    tick().await;
                    next_tick = clock.now() + period;
                }
            }
        }
    })
}

mod time {
    use tokio::sync::watch;
    use tokio::time::Instant;

    #[async_trait::async_trait]
    pub trait Clock: Clone {
        fn now(&self) -> Instant;
        async fn sleep_until(&mut self, deadline: Instant);
    }

    #[derive(Copy, Clone)]
    pub struct RealClock;

    #[async_trait::async_trait]
    impl Clock for RealClock {
        fn now(&self) -> Instant {
            Instant::now()
        }

        async fn sleep_until(&mut self, deadline: Instant) {
            tokio::time::sleep_until(deadline).await;
        }
    }

    #[cfg(test)]
    pub fn mocked_clock() -> (MockClock, MockClockController) {
        let now = Instant::now();
        let (tx, rx) = watch::channel(now);

        (
            MockClock { current_time: rx },
            MockClockController { current_time: tx },
        )
    }

    #[cfg(test)]
    #[derive(Clone)]
    pub struct MockClock {
        current_time: watch::Receiver<Instant>,
    }

    #[cfg(test)]
    #[async_trait::async_trait]
    impl Clock for MockClock {
        fn now(&self) -> Instant {
            *self.current_time.borrow()
        }

        async fn sleep_until(&mut self, deadline: Instant) {
            loop {
                if *self.current_time.borrow() >= deadline {
                    return;
                }

                self.current_time.changed().await.expect("MockClockController dropped");
            }
        }
    }

    /// Advance mock time in increments no larger than the granularity you
    /// want to observe, much like a real clock.
    #[cfg(test)]
    pub struct MockClockController {
        current_time: watch::Sender<Instant>,
    }

    #[cfg(test)]
    impl MockClockController {
        pub fn advance(&mut self, duration: tokio::time::Duration) {
            let new_now = *self.current_time.borrow() + duration;
            self.current_time.send(new_now).expect("MockClock dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use tokio::sync::mpsc;
    use tokio::time::Duration;

    #[tokio::test]
    async fn ticker_fires_once_per_period() {
        let period = Duration::from_millis(500);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (mock_clock, mut controller) = mocked_clock();
        let (shutdown_handle, shutdown_signal) = shutdown::shutdown_signal();

        let _task = spawn_ticker(period, mock_clock, shutdown_signal, move || {
            let tx = tx.clone();
            async move {
                tx.send(()).expect("test receiver dropped");
            }
        });

        // Nothing before the first period elapses.
        tokio::time::timeout(Duration::from_millis(20), rx.recv())
            .await
            .expect_err("no tick expected yet");

        for _ in 0..3 {
            controller.advance(period);
            tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("tick expected")
                .expect("channel open");
            tokio::time::timeout(Duration::from_millis(20), rx.recv())
                .await
                .expect_err("only one tick per period");
        }

        drop(shutdown_handle);
    }

    #[tokio::test]
    async fn ticker_stops_on_shutdown() {
        let period = Duration::from_millis(100);
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let (mock_clock, mut controller) = mocked_clock();
        let (shutdown_handle, shutdown_signal) = shutdown::shutdown_signal();

        let task = spawn_ticker(period, mock_clock, shutdown_signal, move || {
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
            }
        });

        drop(shutdown_handle);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("ticker task should exit")
            .expect("ticker task should not panic");

        controller.advance(period * 3);
        // The closure (and with it the only sender) died with the task.
        assert!(rx.recv().await.is_none(), "no ticks after shutdown");
    }
}
