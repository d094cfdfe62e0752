use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::app::{Application, LineReverser};
use super::codec::{self, Packet};
use super::session::Session;
use super::TICK_INTERVAL;

/// An outbound datagram and where it goes.
pub type Outgoing = (SocketAddr, Vec<u8>);

/// The deterministic core of the server: the session table plus the
/// dispatch rules. It consumes inbound datagrams and clock ticks and
/// accumulates outbound datagrams; the async pump in [run] is the only
/// part that touches the socket.
pub struct Endpoint<A> {
    sessions: HashMap<u32, Session<A>>,
}

impl<A: Application + Default> Endpoint<A> {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn handle_datagram(
        &mut self,
        datagram: &[u8],
        peer: SocketAddr,
        now: Instant,
        out: &mut Vec<Outgoing>,
    ) {
        let packet = match codec::parse(datagram) {
            Ok(packet) => packet,
            Err(error) => {
                trace!(?error, %peer, "dropping malformed datagram");
                return;
            },
        };

        let sid = packet.session();

        if matches!(packet, Packet::Connect { .. })
            && !self.sessions.contains_key(&sid)
        {
            debug!(session = sid, %peer, "session opened");
            self.sessions
                .insert(sid, Session::new(sid, peer, A::default(), now));
        }

        let Some(session) = self.sessions.get_mut(&sid) else {
            // No state is allocated for strays, and a stray close gets no
            // reply at all.
            if !matches!(packet, Packet::Close { .. }) {
                let close = Packet::Close { session: sid };
                out.push((peer, codec::serialise(&close)));
            }
            return;
        };

        // Sessions are pinned to the address that opened them.
        if session.peer() != peer {
            return;
        }

        session.touch(now);
        match packet {
            Packet::Connect { .. } => session.on_connect(),
            Packet::Data { pos, payload, .. } => {
                session.on_data(pos, &payload, now)
            },
            Packet::Ack { length, .. } => session.on_ack(length, now),
            Packet::Close { .. } => session.on_close(),
        }

        self.flush(sid, out);
    }

    /// Sweeps every session: expiry, retransmission, and removal of the
    /// closed.
    pub fn tick(&mut self, now: Instant, out: &mut Vec<Outgoing>) {
        let mut dead = Vec::new();

        for (&sid, session) in self.sessions.iter_mut() {
            session.tick(now);
            let peer = session.peer();
            for packet in session.drain_outbox() {
                out.push((peer, codec::serialise(&packet)));
            }
            if session.is_closed() {
                dead.push(sid);
            }
        }

        for sid in dead {
            self.sessions.remove(&sid);
            debug!(session = sid, "session closed");
        }
    }

    fn flush(&mut self, sid: u32, out: &mut Vec<Outgoing>) {
        let Some(session) = self.sessions.get_mut(&sid) else {
            return;
        };

        let peer = session.peer();
        for packet in session.drain_outbox() {
            out.push((peer, codec::serialise(&packet)));
        }

        if session.is_closed() {
            self.sessions.remove(&sid);
            debug!(session = sid, "session closed");
        }
    }
}

impl<A: Application + Default> Default for Endpoint<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pumps the socket through a line-reversing endpoint until cancelled.
/// Inbound datagrams are drained as they arrive; a 10 Hz tick drives
/// retransmission and expiry.
pub async fn run(socket: UdpSocket, cancel: CancellationToken) -> Result<()> {
    info!(addr = %socket.local_addr()?, "listening");

    let mut endpoint: Endpoint<LineReverser> = Endpoint::new();
    let mut ticker = interval(TICK_INTERVAL);
    // Oversized datagrams truncate to > MAX_PACKET and fail the parse.
    let mut buf = vec![0u8; 2048];
    let mut out: Vec<Outgoing> = Vec::new();

    loop {
        out.clear();

        select! {
            recv = socket.recv_from(&mut buf) => match recv {
                Ok((len, peer)) => endpoint.handle_datagram(
                    &buf[..len],
                    peer,
                    Instant::now(),
                    &mut out,
                ),
                Err(error) => {
                    warn!(%error, "failed to receive datagram");
                    continue;
                },
            },
            _ = ticker.tick() => endpoint.tick(Instant::now(), &mut out),
            _ = cancel.cancelled() => return Ok(()),
        }

        for (peer, datagram) in &out {
            if let Err(error) = socket.send_to(datagram, peer).await {
                warn!(%error, %peer, "failed to send datagram");
            }
        }
    }
}
