use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Job identifier. Allocated from 1 upwards and never reused, so a deleted
/// id can never be observed again.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, PartialOrd, Ord,
    Serialize,
)]
pub struct JobId(pub u64);

/// Job priority. Larger values are more urgent.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, PartialOrd, Ord,
    Serialize,
)]
pub struct Pri(pub u64);

/// Insertion sequence number: a process-wide serial used as the secondary
/// heap key so equal-priority jobs come out in put order. Jobs returned to
/// a queue by abort take a fresh sequence number.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct Seq(pub u64);

/// Identifies one client connection for the lifetime of the process.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ClientId(pub u64);

#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub pri: Pri,
    pub queue: String,
    pub payload: Value,
    /// The client currently working this job, if any. A job with a worker
    /// is never eligible from any heap.
    pub worker: Option<ClientId>,
}

/// Snapshot of a job handed to a client, either from a direct `get` or
/// through a waiter's handoff slot.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub id: JobId,
    pub pri: Pri,
    pub queue: String,
    pub payload: Value,
}

impl Job {
    pub fn delivery(&self) -> Delivery {
        Delivery {
            id: self.id,
            pri: self.pri,
            queue: self.queue.clone(),
            payload: self.payload.clone(),
        }
    }
}
