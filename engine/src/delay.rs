//! A delay [`Future`] that can be stopped and restarted from the beginning;
//! backs every timer the recovery machinery owns (`lanFirstTimer`,
//! `softTimer`, `hardTimer`, the connecting watchdog, the DC recovery timer).

use std::{cell::RefCell, future::Future, rc::Rc, time::Duration};

use futures::{
    channel::oneshot,
    future,
    future::{AbortHandle, FutureExt as _},
};

type FutureResolver = Rc<RefCell<Option<oneshot::Sender<()>>>>;

/// Returns a [`Future`] that resolves after `delay`, plus a
/// [`ResettableDelayHandle`] to stop or restart it. If `is_stopped` the
/// timer is not armed until the first [`ResettableDelayHandle::reset`] call.
pub fn resettable_delay_for(
    delay: Duration,
    is_stopped: bool,
) -> (impl Future<Output = ()>, ResettableDelayHandle) {
    ResettableDelayHandle::new(delay, is_stopped)
}

/// Handle controlling a [`resettable_delay_for`] timer.
#[derive(Debug)]
pub struct ResettableDelayHandle {
    /// `None` once the timer future has resolved.
    future_resolver: FutureResolver,
    timeout: Duration,
    abort_handle: RefCell<AbortHandle>,
}

impl ResettableDelayHandle {
    /// Stops the timer; the delay future will never resolve unless
    /// [`reset`](Self::reset) is called again.
    pub fn stop(&self) {
        self.abort_handle.borrow().abort();
    }

    /// Restarts the countdown from the beginning.
    pub fn reset(&self) {
        self.abort_handle.borrow().abort();
        self.spawn_timer();
    }

    fn new(timeout: Duration, is_stopped: bool) -> (impl Future<Output = ()>, Self) {
        let (tx, rx) = oneshot::channel();
        let tx = Rc::new(RefCell::new(Some(tx)));

        let (abort, _) = AbortHandle::new_pair();
        let this = Self {
            future_resolver: tx,
            abort_handle: RefCell::new(abort),
            timeout,
        };
        if !is_stopped {
            this.spawn_timer();
        }

        let delay_fut = async move {
            if rx.await.is_err() {
                future::pending::<()>().await;
            }
        };

        (delay_fut, this)
    }

    fn spawn_timer(&self) {
        let future_resolver = Rc::clone(&self.future_resolver);
        let timeout = self.timeout;
        let (fut, abort) = future::abortable(async move {
            tokio::time::sleep(timeout).await;
            if let Some(resolver) = future_resolver.borrow_mut().take() {
                let _ = resolver.send(());
            }
        });
        tokio::task::spawn_local(fut.map(drop));

        self.abort_handle.replace(abort);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::resettable_delay_for;

    #[tokio::test]
    async fn fires_after_delay() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (fut, _handle) = resettable_delay_for(Duration::from_millis(5), false);
                fut.await;
            })
            .await;
    }

    #[tokio::test]
    async fn stop_prevents_resolution() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (fut, handle) = resettable_delay_for(Duration::from_millis(5), false);
                handle.stop();
                let raced = futures::future::select(
                    Box::pin(fut),
                    Box::pin(tokio::time::sleep(Duration::from_millis(20))),
                )
                .await;
                assert!(matches!(raced, futures::future::Either::Right(_)));
            })
            .await;
    }

    #[tokio::test]
    async fn reset_restarts_the_countdown() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (fut, handle) = resettable_delay_for(Duration::from_millis(10), false);
                tokio::time::sleep(Duration::from_millis(5)).await;
                handle.reset();
                let started = tokio::time::Instant::now();
                fut.await;
                assert!(started.elapsed() >= Duration::from_millis(10));
            })
            .await;
    }
}
