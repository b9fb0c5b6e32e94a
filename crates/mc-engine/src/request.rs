//! Pending swap request slot
//!
//! Depth-one mailbox between the protocol machine (producer) and the swap
//! coordinator (consumer). An offer only lands while the slot is empty, so
//! hot-key repeats arriving while a request is being serviced are dropped.
//! The consumer peeks, and clears the slot only once the request is fully
//! handled.

use std::sync::atomic::{AtomicU8, Ordering};

use mc_protocol::SwapRequest;
use tokio::sync::Notify;

const EMPTY: u8 = 0;

#[derive(Debug, Default)]
pub struct RequestSlot {
    pending: AtomicU8,
    notify: Notify,
}

impl RequestSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a request; returns false if one is already pending
    pub fn offer(&self, request: SwapRequest) -> bool {
        let accepted = self
            .pending
            .compare_exchange(EMPTY, request.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if accepted {
            self.notify.notify_one();
        }
        accepted
    }

    /// The pending request, left in place
    pub fn peek(&self) -> Option<SwapRequest> {
        SwapRequest::try_from(self.pending.load(Ordering::Acquire)).ok()
    }

    /// Retire the pending request
    pub fn clear(&self) {
        self.pending.store(EMPTY, Ordering::Release);
    }

    /// Wait until a request is offered
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
