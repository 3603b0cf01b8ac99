//! Per-type reply mailboxes shared by the receiver task and callers.
//!
//! The protocol carries no request ids, so the reply *type* is the
//! correlation key: at most one request of a type may be waiting at a time,
//! and each type has one slot holding the most recent decoded reply.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use ikvm_core::protocol::codec::ProtocolError;
use ikvm_core::protocol::messages::{MessageType, Reply};
use tokio::sync::Notify;
use tokio::time::{self, Instant};

/// What a slot holds: a decoded reply or the error decoding it produced.
pub type SlotValue = Result<Reply, ProtocolError>;

/// Why [`Slots::wait`] returned without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline passed first.
    Timeout,
    /// The session tore down first.
    Closed,
}

/// [`Slots::begin`] refused to start a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginError {
    /// A request for this reply type is already waiting.
    InFlight(MessageType),
    /// The session has torn down.
    Closed,
}

#[derive(Default)]
struct SlotState {
    values: HashMap<MessageType, SlotValue>,
    in_flight: HashSet<MessageType>,
    closed: bool,
}

#[derive(Default)]
pub struct Slots {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl Slots {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        // A panic while holding this lock cannot leave the maps half-updated,
        // so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks a request for `kind` as in flight and clears its slot.
    ///
    /// The returned guard releases the mark when dropped, whether the request
    /// completed, timed out or was cancelled.
    pub fn begin(&self, kind: MessageType) -> Result<InFlight<'_>, BeginError> {
        let mut state = self.lock();
        if state.closed {
            return Err(BeginError::Closed);
        }
        if !state.in_flight.insert(kind) {
            return Err(BeginError::InFlight(kind));
        }
        state.values.remove(&kind);
        Ok(InFlight { slots: self, kind })
    }

    /// Stores `value` in the slot for `kind`, replacing any unread value, and
    /// wakes every waiter.
    pub fn publish(&self, kind: MessageType, value: SlotValue) {
        self.lock().values.insert(kind, value);
        self.notify.notify_waiters();
    }

    /// Removes and returns the value in the slot for `kind`.
    pub fn take(&self, kind: MessageType) -> Option<SlotValue> {
        self.lock().values.remove(&kind)
    }

    /// Waits until the slot for `kind` is filled, the session closes, or
    /// `deadline` passes.  The value is removed from the slot.
    pub async fn wait(&self, kind: MessageType, deadline: Instant) -> Result<SlotValue, WaitError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a publish between the check and the
            // await is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(value) = state.values.remove(&kind) {
                    return Ok(value);
                }
                if state.closed {
                    return Err(WaitError::Closed);
                }
            }

            if time::timeout_at(deadline, notified).await.is_err() {
                return Err(WaitError::Timeout);
            }
        }
    }

    /// Refuses new requests and wakes every waiter with [`WaitError::Closed`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Holds the in-flight mark for one reply type.
pub struct InFlight<'a> {
    slots: &'a Slots,
    kind: MessageType,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.slots.lock().in_flight.remove(&self.kind);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ikvm_core::protocol::messages::StatusReply;
    use std::sync::Arc;
    use std::time::Duration;

    fn ok_status(kind: MessageType) -> SlotValue {
        Ok(Reply::from_status(kind, StatusReply::Success).unwrap())
    }

    #[tokio::test]
    async fn test_wait_returns_published_value() {
        // Arrange
        let slots = Arc::new(Slots::new());
        let _guard = slots.begin(MessageType::OpenUartRes).unwrap();
        let publisher = Arc::clone(&slots);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(MessageType::OpenUartRes, ok_status(MessageType::OpenUartRes));
        });

        // Act
        let value = slots
            .wait(MessageType::OpenUartRes, Instant::now() + Duration::from_secs(2))
            .await;

        // Assert
        assert_eq!(value, Ok(ok_status(MessageType::OpenUartRes)));
        assert!(slots.take(MessageType::OpenUartRes).is_none(), "wait consumes the value");
    }

    #[tokio::test]
    async fn test_wait_ignores_other_types() {
        let slots = Slots::new();
        slots.publish(MessageType::SendKeyRes, ok_status(MessageType::SendKeyRes));

        let value = slots
            .wait(MessageType::SendAtxRes, Instant::now() + Duration::from_millis(50))
            .await;

        assert_eq!(value, Err(WaitError::Timeout));
        assert!(slots.take(MessageType::SendKeyRes).is_some());
    }

    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let slots = Arc::new(Slots::new());
        let closer = Arc::clone(&slots);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });

        let value = slots
            .wait(MessageType::ListCapRes, Instant::now() + Duration::from_secs(5))
            .await;

        assert_eq!(value, Err(WaitError::Closed));
    }

    #[test]
    fn test_second_begin_of_same_type_is_refused() {
        let slots = Slots::new();
        let guard = slots.begin(MessageType::ListUartRes).unwrap();

        assert_eq!(
            slots.begin(MessageType::ListUartRes).err(),
            Some(BeginError::InFlight(MessageType::ListUartRes))
        );
        assert!(slots.begin(MessageType::ListCapRes).is_ok(), "other types are independent");

        drop(guard);
        assert!(slots.begin(MessageType::ListUartRes).is_ok());
    }

    #[test]
    fn test_begin_clears_stale_value() {
        let slots = Slots::new();
        slots.publish(MessageType::RunMjpgRes, ok_status(MessageType::RunMjpgRes));

        let _guard = slots.begin(MessageType::RunMjpgRes).unwrap();

        assert!(slots.take(MessageType::RunMjpgRes).is_none());
    }

    #[test]
    fn test_begin_after_close_is_refused() {
        let slots = Slots::new();
        slots.close();
        assert!(slots.is_closed());
        assert_eq!(slots.begin(MessageType::ListCapRes).err(), Some(BeginError::Closed));
    }

    #[test]
    fn test_publish_replaces_unread_value() {
        let slots = Slots::new();
        slots.publish(MessageType::SendMouseRes, Err(ProtocolError::InvalidStatusCode(0xAA)));
        slots.publish(MessageType::SendMouseRes, ok_status(MessageType::SendMouseRes));

        assert_eq!(
            slots.take(MessageType::SendMouseRes),
            Some(ok_status(MessageType::SendMouseRes))
        );
        assert_eq!(slots.take(MessageType::SendMouseRes), None);
    }
}
