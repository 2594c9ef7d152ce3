//! In-process metadata hub, for consumers embedded in the same process
//! (tests, the CLI's own logger) rather than an external pipe or socket.
//! Any number of local subscribers can attach a [`BoundedQueue`] and
//! receive every package broadcast through the hub.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::queue::BoundedQueue;

use super::{MetadataPackage, MetadataSink};

/// Broadcasts metadata to every currently-subscribed local consumer.
#[derive(Default)]
pub struct HubSink {
    subscribers: Mutex<Vec<Arc<BoundedQueue<MetadataPackage>>>>,
}

impl HubSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new subscriber queue and return the handle to read from.
    pub fn subscribe(&self) -> Arc<BoundedQueue<MetadataPackage>> {
        let queue = Arc::new(BoundedQueue::new(crate::queue::DEFAULT_CAPACITY));
        self.subscribers.lock().push(queue.clone());
        queue
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl MetadataSink for HubSink {
    fn try_enqueue(&self, pkg: MetadataPackage) -> Result<(), MetadataPackage> {
        let subscribers = self.subscribers.lock();
        // Offer to every subscriber independently; a full subscriber queue
        // drops the item for that subscriber only, matching the
        // drop-newest policy of every other sink.
        for subscriber in subscribers.iter() {
            let _ = subscriber.add_item(pkg.clone(), false);
        }
        Ok(())
    }
}
