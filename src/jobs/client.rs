use std::collections::VecDeque;

use anyhow::{anyhow, Context, Result};
use futures::sink::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::oneshot;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::job::{ClientId, Delivery, JobId};
use super::store::{SharedStore, WaiterId};
use crate::wire;
use crate::wire::events::ClientEvent;
use crate::wire::protocol::{self, Request, Response};

/// First stage of a `get`: either it resolves immediately, or a waiter was
/// registered while the store lock was still held. Registration must not
/// be a separate lock acquisition: a `put` slipping between the empty
/// check and the registration would strand the waiter with its job parked
/// in the heap.
enum GetAttempt {
    Got(Delivery),
    Empty,
    Parked(WaiterId, oneshot::Receiver<Delivery>),
}

enum Wait {
    Delivered(Delivery),
    Gone,
    Failed(anyhow::Error),
}

/// Serves one client connection until EOF, protocol-fatal error, or
/// shutdown. On the way out, every job the client still holds is aborted
/// back to its queue and any outstanding waiter is cancelled.
#[instrument(name = "client_loop", skip_all, fields(client = client.0))]
pub async fn run<T>(
    conn: T,
    store: SharedStore,
    client: ClientId,
    cancel: CancellationToken,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    debug!("accepted connection");

    let mut framed = wire::framed(conn);
    // Request lines that arrived while a blocked get held the connection;
    // they are served, in order, once the wait resolves.
    let mut backlog: VecDeque<ClientEvent> = VecDeque::new();

    let conn_result = 'conn: loop {
        let evt = match backlog.pop_front() {
            Some(evt) => evt,
            None => select! {
                x = framed.next() => match x {
                    None => {
                        debug!("connection dropped");
                        break Ok(());
                    },
                    Some(Ok(evt)) => evt,
                    Some(Err(e)) => break Err(e.into()),
                },
                _ = cancel.cancelled() => break Ok(()),
            },
        };

        let resp = match evt {
            ClientEvent::Discarded => continue,
            ClientEvent::Overlong => Response::Error {
                message: "request line too long".to_owned(),
            },
            ClientEvent::Line(line) => match protocol::parse_request(&line) {
                Err(error) => Response::Error {
                    message: error.to_string(),
                },
                Ok(Request::Put { queue, pri, job }) => {
                    let id = store.lock().put(&queue, pri, job);
                    Response::Inserted { id }
                },
                Ok(Request::Delete { id }) => {
                    match store.lock().delete(id) {
                        true => Response::Done,
                        false => Response::NoJob,
                    }
                },
                Ok(Request::Abort { id }) => {
                    match store.lock().abort(id, client) {
                        true => Response::Done,
                        false => Response::NoJob,
                    }
                },
                Ok(Request::Get { queues, wait }) => {
                    let attempt = {
                        let mut locked = store.lock();
                        match locked.try_get(&queues, client) {
                            Some(d) => GetAttempt::Got(d),
                            None if !wait => GetAttempt::Empty,
                            None => {
                                let (wid, rx) =
                                    locked.register_waiter(client, &queues);
                                GetAttempt::Parked(wid, rx)
                            },
                        }
                    };

                    match attempt {
                        GetAttempt::Got(d) => Response::Delivered(d),
                        GetAttempt::Empty => Response::NoJob,
                        GetAttempt::Parked(wid, mut rx) => {
                            let outcome = loop {
                                select! {
                                    r = &mut rx => break match r {
                                        Ok(d) => Wait::Delivered(d),
                                        // The store never drops a live
                                        // waiter's sender without sending.
                                        Err(_) => Wait::Failed(anyhow!(
                                            "waiter slot dropped by store"
                                        )),
                                    },
                                    x = framed.next() => match x {
                                        None => break Wait::Gone,
                                        Some(Ok(evt)) => {
                                            backlog.push_back(evt)
                                        },
                                        Some(Err(e)) => {
                                            break Wait::Failed(e.into())
                                        },
                                    },
                                    _ = cancel.cancelled() => {
                                        break Wait::Gone
                                    },
                                }
                            };

                            match outcome {
                                Wait::Delivered(d) => {
                                    store
                                        .lock()
                                        .record_delivery(client, d.id);
                                    Response::Delivered(d)
                                },
                                other => {
                                    give_up_wait(&store, wid, &mut rx);
                                    break 'conn match other {
                                        Wait::Failed(e) => Err(e),
                                        _ => Ok(()),
                                    };
                                },
                            }
                        },
                    }
                },
            },
        };

        select! {
            x = framed.send(resp) => if let Err(e) = x {
                break Err(e.into());
            },
            _ = cancel.cancelled() => break Ok(()),
        }
    };

    store.lock().client_disconnected(client);

    framed
        .into_inner()
        .shutdown()
        .await
        .context("during shutdown")?;

    conn_result
}

/// Withdraws a waiter whose client is going away. If a wake won the race,
/// the delivery is sitting in the receiver; it is re-homed under the same
/// lock hold so the job is never stranded in flight.
fn give_up_wait(
    store: &SharedStore,
    wid: WaiterId,
    rx: &mut oneshot::Receiver<Delivery>,
) {
    let mut locked = store.lock();
    if !locked.cancel_waiter(wid) {
        if let Ok(d) = rx.try_recv() {
            let JobId(id) = d.id;
            debug!(id, "requeueing delivery that raced a disconnect");
            locked.requeue(d.id);
        }
    }
}
