//! A value produced asynchronously after its consumers were constructed.
//!
//! Services frequently depend on a handle another service produces during
//! startup (the embedded store's client, a bound listener's address). The
//! setter half is handed to the producer, the value half to consumers, and
//! `get` parks until the value exists. No deadlock is possible as long as
//! the producer runs on its own task.

use tokio::sync::watch;

pub struct AsyncValueSetter<T> {
    sender: watch::Sender<Option<T>>,
}

impl<T> AsyncValueSetter<T> {
    /// Publishes the value. Consumers blocked in [`AsyncValue::get`] wake up.
    /// Publishing again replaces the value for future readers.
    pub fn set(&self, value: T) {
        // Receivers may have been dropped; nothing to deliver then.
        let _ = self.sender.send(Some(value));
    }
}

#[derive(Clone)]
pub struct AsyncValue<T> {
    receiver: watch::Receiver<Option<T>>,
}

impl<T: Clone> AsyncValue<T> {
    /// Creates the producer/consumer pair.
    pub fn channel() -> (AsyncValueSetter<T>, Self) {
        let (sender, receiver) = watch::channel(None);
        (AsyncValueSetter { sender }, Self { receiver })
    }

    /// Waits until the producer published the value. Returns `None` if the
    /// producer was dropped without publishing.
    pub async fn get(&self) -> Option<T> {
        let mut receiver = self.receiver.clone();
        let value = receiver.wait_for(Option::is_some).await.ok()?;
        value.clone()
    }

    /// The value if it is already there; never waits.
    pub fn try_get(&self) -> Option<T> {
        self.receiver.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_waits_for_the_producer() {
        let (setter, value) = AsyncValue::<u32>::channel();

        let consumer = tokio::spawn({
            let value = value.clone();
            async move { value.get().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(value.try_get(), None);

        setter.set(42);
        assert_eq!(consumer.await.unwrap(), Some(42));
        assert_eq!(value.try_get(), Some(42));
    }

    #[tokio::test]
    async fn dropped_producer_unblocks_consumers() {
        let (setter, value) = AsyncValue::<u32>::channel();
        drop(setter);
        assert_eq!(value.get().await, None);
    }
}
