use bytes::Bytes;
use std::sync::Mutex;
use tokio::sync::Notify;

/// One encoded JPEG image. Cloning shares the underlying buffer, so a
/// reader keeps a complete frame even after the slot has moved on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.0
    }
}

#[derive(Default)]
struct Slot {
    frame: Option<Frame>,
    sequence: u64,
}

/// Single-slot, latest-value broadcast of camera frames.
///
/// `publish` never waits on readers. Readers that fall behind skip straight
/// to the newest frame.
#[derive(Default)]
pub struct FrameBroadcaster {
    slot: Mutex<Slot>,
    notify: Notify,
}

impl FrameBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `frame` as the current one and wake every waiting reader.
    /// Returns the new sequence number.
    pub fn publish(&self, frame: impl Into<Bytes>) -> u64 {
        let frame = Frame::new(frame);
        let sequence = {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            slot.frame = Some(frame);
            slot.sequence += 1;
            slot.sequence
        };
        self.notify.notify_waiters();
        sequence
    }

    /// Wait until a frame newer than `last_seen` exists and return it along
    /// with its sequence number. Pending forever if nothing is ever published.
    pub async fn wait_next(&self, last_seen: u64) -> (Frame, u64) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a publish in between still wakes us
            notified.as_mut().enable();

            if let Some(found) = self.newer_than(last_seen) {
                return found;
            }
            notified.await;
        }
    }

    /// Latest frame and its sequence number, without waiting
    pub fn current_snapshot(&self) -> Option<(Frame, u64)> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.frame.clone().map(|frame| (frame, slot.sequence))
    }

    pub fn sequence(&self) -> u64 {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).sequence
    }

    fn newer_than(&self, last_seen: u64) -> Option<(Frame, u64)> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match &slot.frame {
            Some(frame) if slot.sequence > last_seen => Some((frame.clone(), slot.sequence)),
            _ => None,
        }
    }
}
