//! One queue per storage path, shared by every handle opened on it.

use agentsync_queue::{PersistentQueue, QueueResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

static QUEUES: Mutex<BTreeMap<String, Weak<PersistentQueue>>> = Mutex::new(BTreeMap::new());

/// Returns the live queue for `path`, opening it if no handle holds one.
///
/// The queue closes when the last handle using it is destroyed.
pub(crate) fn shared_queue(path: &str) -> QueueResult<Arc<PersistentQueue>> {
    let mut queues = QUEUES.lock();
    queues.retain(|_, queue| queue.strong_count() > 0);

    if let Some(queue) = queues.get(path).and_then(Weak::upgrade) {
        return Ok(queue);
    }

    let queue = Arc::new(PersistentQueue::open(path)?);
    queues.insert(path.to_string(), Arc::downgrade(&queue));
    Ok(queue)
}
