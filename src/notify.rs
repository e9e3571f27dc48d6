use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{DateRange, Source};

const CHANNEL_CAPACITY: usize = 256;

/// Something worth telling a guest or the admin about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Booked {
        /// Property group slug. `None` for a single-unit booking.
        group: Option<String>,
        unit_ids: Vec<Ulid>,
        range: DateRange,
        guest_name: String,
        guest_email: String,
    },
    ManualBlock {
        unit_id: Ulid,
        range: DateRange,
        source: Source,
        note: String,
    },
}

/// Fire-and-forget broadcast of notices. Sending never fails and never blocks
/// the state change that produced the notice.
pub struct NotifyHub {
    sender: broadcast::Sender<Notice>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, notice: Notice) {
        if self.sender.send(notice).is_err() {
            tracing::debug!("notice dropped: no subscribers");
        }
    }
}
