//! A `Cell`-like container whose mutations can be observed.

use std::cell::RefCell;

use futures::{
    channel::mpsc,
    future::LocalBoxFuture,
    stream::{LocalBoxStream, StreamExt as _},
};

/// Error returned by [`ObservableCell::when`] and
/// [`ObservableCell::when_eq`] when the cell was dropped before the awaited
/// condition became true.
#[derive(Clone, Copy, Debug, Eq, PartialEq, derive_more::Display)]
#[display(fmt = "ObservableCell was dropped before the value changed")]
pub struct DroppedError;

/// `Cell`-like container that broadcasts every write to its subscribers.
///
/// Unlike a general-purpose reactive field, this container only tracks the
/// *current value* and a list of live subscriber channels; there is no
/// guarded-mutation/progress-tracking machinery, since the session engine
/// only ever stores small `Copy` enums and integers in it (lifecycle phase,
/// ICE phase, peer generation).
pub struct ObservableCell<D> {
    value: RefCell<D>,
    subs: RefCell<Vec<mpsc::UnboundedSender<D>>>,
}

impl<D> ObservableCell<D>
where
    D: Clone + 'static,
{
    /// Creates a new cell holding `value`.
    #[inline]
    #[must_use]
    pub fn new(value: D) -> Self {
        Self {
            value: RefCell::new(value),
            subs: RefCell::new(Vec::new()),
        }
    }

    /// Returns a clone of the current value.
    #[inline]
    pub fn get_cloned(&self) -> D {
        self.value.borrow().clone()
    }

    /// Returns a [`Stream`] yielding the current value immediately, then
    /// every subsequent update.
    ///
    /// [`Stream`]: futures::Stream
    pub fn subscribe(&self) -> LocalBoxStream<'static, D> {
        let (tx, rx) = mpsc::unbounded();
        let _ = tx.unbounded_send(self.value.borrow().clone());
        self.subs.borrow_mut().push(tx);
        Box::pin(rx)
    }

    /// Sets a new value and notifies every live subscriber.
    pub fn set(&self, new_value: D) {
        *self.value.borrow_mut() = new_value.clone();
        self.subs
            .borrow_mut()
            .retain(|sub| sub.unbounded_send(new_value.clone()).is_ok());
    }

    /// Resolves once the value satisfies `pred`, checking the current value
    /// first.
    pub fn when<F>(&self, pred: F) -> LocalBoxFuture<'static, Result<(), DroppedError>>
    where
        F: Fn(&D) -> bool + 'static,
    {
        if pred(&self.value.borrow()) {
            return Box::pin(futures::future::ok(()));
        }
        let mut updates = self.subscribe();
        Box::pin(async move {
            while let Some(v) = updates.next().await {
                if pred(&v) {
                    return Ok(());
                }
            }
            Err(DroppedError)
        })
    }
}

impl<D> ObservableCell<D>
where
    D: Copy + 'static,
{
    /// Returns a copy of the current value.
    #[inline]
    pub fn get(&self) -> D {
        *self.value.borrow()
    }
}

impl<D> ObservableCell<D>
where
    D: Clone + PartialEq + 'static,
{
    /// Resolves once the value becomes equal to `should_be`, checking the
    /// current value first.
    pub fn when_eq(&self, should_be: D) -> LocalBoxFuture<'static, Result<(), DroppedError>> {
        self.when(move |v| *v == should_be)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt as _;

    use super::*;

    #[tokio::test]
    async fn subscribe_replays_current_value_then_updates() {
        let cell = ObservableCell::new(1u8);
        let mut sub = cell.subscribe();
        assert_eq!(sub.next().await, Some(1));
        cell.set(2);
        assert_eq!(sub.next().await, Some(2));
    }

    #[tokio::test]
    async fn when_eq_resolves_immediately_if_already_equal() {
        let cell = ObservableCell::new(5i32);
        cell.when_eq(5).await.unwrap();
    }

    #[tokio::test]
    async fn when_eq_resolves_on_future_update() {
        let cell = ObservableCell::new(0u8);
        let wait = cell.when_eq(3);
        cell.set(1);
        cell.set(3);
        wait.await.unwrap();
    }

    #[tokio::test]
    async fn when_drops_stale_subscribers() {
        let cell = ObservableCell::new(0u8);
        {
            let _sub = cell.subscribe();
        }
        cell.set(1);
        assert_eq!(cell.get(), 1);
    }
}
