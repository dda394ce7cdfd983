//! Single-node queue driver backed by process memory.
//!
//! Visibility is tracked with [`tokio::time::Instant`] so tests can drive
//! lease expiry with a paused clock.

use std::time::Duration;

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};
use uuid::Uuid;

use crate::{MessageHandle, MessageQueue, OperationMessage, QueueError};

#[derive(Debug)]
struct Slot {
    message: OperationMessage,
    next_visible: Instant,
    receipt: Option<Uuid>,
}

impl Slot {
    fn is_visible(&self, now: Instant) -> bool {
        self.next_visible <= now
    }
}

#[derive(Default)]
pub struct InMemoryQueue {
    slots: Mutex<Vec<Slot>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages still in the queue, visible or not.
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn enqueue(&self, message: OperationMessage) -> Result<(), QueueError> {
        let mut slots = self.slots.lock().await;
        slots.push(Slot {
            message,
            next_visible: Instant::now(),
            receipt: None,
        });
        Ok(())
    }

    async fn dequeue(
        &self,
        lease: Duration,
    ) -> Result<Option<(OperationMessage, MessageHandle)>, QueueError> {
        let mut slots = self.slots.lock().await;
        let now = Instant::now();

        let Some(slot) = slots.iter_mut().find(|slot| slot.is_visible(now)) else {
            return Ok(None);
        };

        let receipt = Uuid::new_v4();
        slot.next_visible = now + lease;
        slot.receipt = Some(receipt);
        slot.message.dequeue_count += 1;

        Ok(Some((
            slot.message.clone(),
            MessageHandle {
                message_id: slot.message.message_id,
                receipt,
            },
        )))
    }

    async fn extend(&self, handle: &MessageHandle, lease: Duration) -> Result<(), QueueError> {
        let mut slots = self.slots.lock().await;
        let slot = find_leased(&mut slots, handle)?;
        slot.next_visible = Instant::now() + lease;
        Ok(())
    }

    async fn complete(&self, handle: &MessageHandle) -> Result<(), QueueError> {
        let mut slots = self.slots.lock().await;
        find_leased(&mut slots, handle)?;
        slots.retain(|slot| slot.message.message_id != handle.message_id);
        Ok(())
    }

    async fn abandon(
        &self,
        handle: &MessageHandle,
        delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        let mut slots = self.slots.lock().await;
        let slot = find_leased(&mut slots, handle)?;
        slot.next_visible = Instant::now() + delay.unwrap_or_default();
        slot.receipt = None;
        Ok(())
    }
}

fn find_leased<'a>(
    slots: &'a mut [Slot],
    handle: &MessageHandle,
) -> Result<&'a mut Slot, QueueError> {
    let slot = slots
        .iter_mut()
        .find(|slot| slot.message.message_id == handle.message_id)
        .ok_or(QueueError::MessageNotFound {
            message_id: handle.message_id,
        })?;
    // A different receipt means the lease expired and another consumer has
    // since claimed the message.
    if slot.receipt != Some(handle.receipt) {
        return Err(QueueError::LeaseLost {
            message_id: handle.message_id,
        });
    }
    Ok(slot)
}
