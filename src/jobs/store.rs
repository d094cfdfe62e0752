use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use super::job::{ClientId, Delivery, Job, JobId, Pri, Seq};
use super::queue::{Entry, Queue};

/// Identifies a pending `get wait=true`. Queues reference waiters by id
/// only; the registry in [JobStore] owns the waiter itself, so removing the
/// registry entry is enough to make every queue-side reference stale.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct WaiterId(u64);

#[derive(Debug)]
struct Waiter {
    queues: Vec<String>,
    tx: oneshot::Sender<Delivery>,
}

/// The single per-process job store. All operations run under one logical
/// lock (see [SharedStore]); nothing here blocks or awaits.
#[derive(Debug, Default)]
pub struct JobStore {
    next_job: u64,
    next_seq: u64,
    next_waiter: u64,
    jobs: HashMap<JobId, Job>,
    queues: HashMap<String, Queue>,
    waiters: HashMap<WaiterId, Waiter>,
    owned: HashMap<ClientId, HashSet<JobId>>,
}

pub type SharedStore = Arc<Mutex<JobStore>>;

pub fn shared() -> SharedStore {
    Arc::new(Mutex::new(JobStore::new()))
}

impl JobStore {
    pub fn new() -> Self {
        Default::default()
    }

    fn next_seq(&mut self) -> Seq {
        let seq = Seq(self.next_seq);
        self.next_seq += 1;
        seq
    }

    /// Inserts a new job, handing it straight to a registered waiter when
    /// one exists, otherwise enqueueing it. Returns the fresh id.
    pub fn put(&mut self, queue: &str, pri: Pri, payload: Value) -> JobId {
        self.next_job += 1;
        let id = JobId(self.next_job);

        self.jobs.insert(
            id,
            Job {
                id,
                pri,
                queue: queue.to_owned(),
                payload,
                worker: None,
            },
        );

        debug!(id = id.0, queue, pri = pri.0, "put");

        if !self.hand_to_waiter(id) {
            self.push_ready(id);
        }

        id
    }

    /// Pops the best job across the named queues and assigns it to
    /// `client`. Returns None when every named queue is empty once stale
    /// entries are discarded.
    pub fn try_get(
        &mut self,
        queue_names: &[String],
        client: ClientId,
    ) -> Option<Delivery> {
        let mut best: Option<(Pri, Seq, &str)> = None;

        for name in queue_names {
            let Some(queue) = self.queues.get_mut(name) else {
                continue;
            };

            // Lazy cleanup: drop stale entries off the top before peeking.
            while let Some(top) = queue.heap.peek() {
                let stale = match self.jobs.get(&top.id) {
                    Some(job) => job.worker.is_some(),
                    None => true,
                };
                if !stale {
                    break;
                }
                queue.heap.pop();
            }

            let Some(top) = queue.heap.peek() else {
                continue;
            };

            // Highest priority wins; the older entry breaks ties.
            let better = match best {
                Some((pri, seq, _)) => {
                    top.pri > pri || (top.pri == pri && top.seq < seq)
                },
                None => true,
            };
            if better {
                best = Some((top.pri, top.seq, name.as_str()));
            }
        }

        let (_, _, name) = best?;
        let name = name.to_owned();

        // The winning heap is non-empty: `best` was recorded from its top
        // and nothing since has removed entries.
        let entry = self.queues.get_mut(&name).and_then(|q| q.heap.pop())?;
        self.prune_queue(&name);

        self.assign(entry.id, client)
    }

    /// Registers a waiter for `client` across `queue_names`, returning the
    /// handoff slot it will be woken through.
    pub fn register_waiter(
        &mut self,
        client: ClientId,
        queue_names: &[String],
    ) -> (WaiterId, oneshot::Receiver<Delivery>) {
        self.next_waiter += 1;
        let wid = WaiterId(self.next_waiter);
        let (tx, rx) = oneshot::channel();

        for name in queue_names {
            self.queues.entry(name.clone()).or_default().waiters.insert(wid);
        }
        self.waiters.insert(
            wid,
            Waiter {
                queues: queue_names.to_vec(),
                tx,
            },
        );

        debug!(waiter = wid.0, client = client.0, "waiter registered");

        (wid, rx)
    }

    /// Removes a waiter that is giving up (client EOF or shutdown).
    ///
    /// Returns false when the waiter had already been woken: a delivery is
    /// then sitting in the caller's receiver and must be passed back via
    /// [JobStore::requeue] under the same lock hold.
    pub fn cancel_waiter(&mut self, wid: WaiterId) -> bool {
        match self.waiters.remove(&wid) {
            Some(waiter) => {
                let queues = waiter.queues;
                self.deregister(wid, &queues);
                true
            },
            None => false,
        }
    }

    /// Records that `client` received a delivery through its waiter. A job
    /// deleted while in transit is left unrecorded, so a later abort of it
    /// reports no-job.
    pub fn record_delivery(&mut self, client: ClientId, id: JobId) {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.worker = Some(client);
            self.owned.entry(client).or_default().insert(id);
        }
    }

    /// Puts an undeliverable in-transit job back: to another waiter if one
    /// is registered, otherwise onto its queue's heap.
    pub fn requeue(&mut self, id: JobId) {
        let eligible =
            self.jobs.get(&id).map(|j| j.worker.is_none()).unwrap_or(false);
        if !eligible {
            return;
        }
        if !self.hand_to_waiter(id) {
            self.push_ready(id);
        }
    }

    /// Deletes a job in any state. Returns false for an unknown or already
    /// deleted id. Heap entries referencing the id become stale in place.
    pub fn delete(&mut self, id: JobId) -> bool {
        let Some(mut job) = self.jobs.remove(&id) else {
            return false;
        };
        if let Some(worker) = job.worker.take() {
            if let Some(owned) = self.owned.get_mut(&worker) {
                owned.remove(&id);
            }
        }
        debug!(id = id.0, "deleted");
        true
    }

    /// Returns a job held by `client` to its queue. Fails (false) when the
    /// id is unknown, deleted, or held by someone else.
    pub fn abort(&mut self, id: JobId, client: ClientId) -> bool {
        let Some(job) = self.jobs.get_mut(&id) else {
            return false;
        };
        if job.worker != Some(client) {
            return false;
        }
        job.worker = None;
        if let Some(owned) = self.owned.get_mut(&client) {
            owned.remove(&id);
        }

        debug!(id = id.0, client = client.0, "aborted");

        if !self.hand_to_waiter(id) {
            self.push_ready(id);
        }
        true
    }

    /// Reclaims every job the client still holds, exactly as if the client
    /// had aborted each one before disconnecting. Jobs deleted concurrently
    /// by other clients are skipped.
    pub fn client_disconnected(&mut self, client: ClientId) {
        let Some(ids) = self.owned.remove(&client) else {
            return;
        };
        for id in ids {
            match self.jobs.get_mut(&id) {
                Some(job) if job.worker == Some(client) => {
                    job.worker = None;
                },
                // Deleted (or somehow re-owned) since: nothing to reclaim.
                _ => continue,
            }
            debug!(id = id.0, client = client.0, "reclaimed on disconnect");
            if !self.hand_to_waiter(id) {
                self.push_ready(id);
            }
        }
    }

    /// Assigns a popped job to a client and snapshots it for the response.
    fn assign(&mut self, id: JobId, client: ClientId) -> Option<Delivery> {
        let job = self.jobs.get_mut(&id)?;
        job.worker = Some(client);
        let delivery = job.delivery();
        self.owned.entry(client).or_default().insert(id);
        Some(delivery)
    }

    fn push_ready(&mut self, id: JobId) {
        let seq = self.next_seq();
        let Some(job) = self.jobs.get(&id) else {
            return;
        };
        let entry = Entry {
            pri: job.pri,
            seq,
            id,
        };
        self.queues.entry(job.queue.clone()).or_default().heap.push(entry);
    }

    /// Offers the job to a live waiter on its queue. Stale waiter ids and
    /// waiters whose receiver is gone are reaped along the way. Returns
    /// true once a handoff succeeds.
    fn hand_to_waiter(&mut self, id: JobId) -> bool {
        let Some(job) = self.jobs.get(&id) else {
            return false;
        };
        let name = job.queue.clone();
        let delivery = job.delivery();

        loop {
            let wid = match self.queues.get_mut(&name) {
                Some(queue) => {
                    match queue.waiters.iter().next().copied() {
                        Some(wid) => {
                            queue.waiters.remove(&wid);
                            wid
                        },
                        None => break,
                    }
                },
                None => return false,
            };

            // A queue-side id with no registry entry is a leftover from a
            // waiter woken or cancelled through another queue.
            let Some(waiter) = self.waiters.remove(&wid) else {
                continue;
            };
            let queues = waiter.queues;
            self.deregister(wid, &queues);

            if waiter.tx.send(delivery.clone()).is_ok() {
                debug!(id = id.0, waiter = wid.0, "handed to waiter");
                return true;
            }
            // Receiver dropped without cancelling: client died. Keep
            // scanning.
        }

        self.prune_queue(&name);
        false
    }

    /// Drops `wid` from every queue it was registered on.
    fn deregister(&mut self, wid: WaiterId, queue_names: &[String]) {
        for name in queue_names {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.waiters.remove(&wid);
            }
            self.prune_queue(name);
        }
    }

    /// Releases a queue's map slot once nothing references it.
    fn prune_queue(&mut self, name: &str) {
        if self.queues.get(name).is_some_and(Queue::is_empty) {
            self.queues.remove(name);
        }
    }
}
