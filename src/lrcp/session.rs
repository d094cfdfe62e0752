use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use tokio::time::Instant;

use super::app::Application;
use super::codec::{escaped_len, Packet};
use super::{
    DUP_ACK_DEBOUNCE, MAX_PACKET, RETRANSMIT_TIMEOUT, SEND_WINDOW,
    SESSION_EXPIRY,
};

/// Per-peer transport state machine.
///
/// Sessions are deterministic: the caller supplies the clock, inbound
/// packets arrive through the `on_*` handlers, and outbound packets
/// accumulate in an outbox the endpoint drains. Nothing here touches a
/// socket.
pub struct Session<A> {
    id: u32,
    peer: SocketAddr,
    app: A,
    /// Contiguous bytes accepted from the peer. Never decreases.
    bytes_received: u64,
    /// Bytes the peer has confirmed receiving. Never decreases.
    bytes_acked: u64,
    /// Application output not yet acknowledged, indexed from `bytes_acked`.
    tx_buffer: BytesMut,
    /// Received bytes the application has not yet consumed.
    rx_buffer: BytesMut,
    last_activity: Instant,
    last_retransmit: Instant,
    closed: bool,
    outbox: Vec<Packet>,
}

impl<A: Application> Session<A> {
    pub fn new(id: u32, peer: SocketAddr, app: A, now: Instant) -> Self {
        Self {
            id,
            peer,
            app,
            bytes_received: 0,
            bytes_acked: 0,
            tx_buffer: BytesMut::new(),
            rx_buffer: BytesMut::new(),
            last_activity: now,
            last_retransmit: now,
            closed: false,
            outbox: Vec::new(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Records peer liveness. Called for every valid packet from the bound
    /// address.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Hands the accumulated outbound packets to the endpoint.
    pub fn drain_outbox(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.outbox)
    }

    /// Duplicate connects just re-ack the current receive position.
    pub fn on_connect(&mut self) {
        self.send_ack();
    }

    /// Accepts strictly in-order data; anything else (gap or duplicate)
    /// re-acks the current position and drops the payload.
    pub fn on_data(&mut self, pos: u64, payload: &[u8], now: Instant) {
        if pos == self.bytes_received {
            self.bytes_received += payload.len() as u64;
            self.rx_buffer.extend_from_slice(payload);
            self.send_ack();

            self.app.consume(&mut self.rx_buffer, &mut self.tx_buffer);
            if !self.tx_buffer.is_empty() {
                self.transmit_pending(now);
            }
        } else {
            self.send_ack();
        }
    }

    pub fn on_ack(&mut self, length: u64, now: Instant) {
        let total_sent = self.bytes_acked + self.tx_buffer.len() as u64;

        if length > total_sent {
            // The peer acked bytes that were never sent: unrecoverable.
            self.close();
        } else if length > self.bytes_acked {
            // Panic safety: length - bytes_acked <= tx_buffer.len() from
            // the total_sent check above.
            self.tx_buffer.advance((length - self.bytes_acked) as usize);
            self.bytes_acked = length;

            self.last_retransmit = now;
            if !self.tx_buffer.is_empty() {
                self.transmit_pending(now);
            }
        } else {
            // Duplicate ack: the peer is missing data. Resend, debounced
            // so an ack burst doesn't multiply the retransmissions.
            if !self.tx_buffer.is_empty()
                && now.duration_since(self.last_retransmit) > DUP_ACK_DEBOUNCE
            {
                self.transmit_pending(now);
            }
        }
    }

    pub fn on_close(&mut self) {
        self.close();
    }

    /// Replies `close` (once) and marks the session for removal.
    pub fn close(&mut self) {
        if !self.closed {
            self.outbox.push(Packet::Close { session: self.id });
            self.closed = true;
        }
    }

    /// Periodic housekeeping: expire dead peers, retransmit stale data.
    pub fn tick(&mut self, now: Instant) {
        if now.duration_since(self.last_activity) > SESSION_EXPIRY {
            // Expiry is silent: no close packet.
            self.closed = true;
            return;
        }

        if !self.tx_buffer.is_empty()
            && now.duration_since(self.last_retransmit) > RETRANSMIT_TIMEOUT
        {
            self.transmit_pending(now);
        }
    }

    fn send_ack(&mut self) {
        self.outbox.push(Packet::Ack {
            session: self.id,
            length: self.bytes_received,
        });
    }

    /// Emits everything unacked, from the head of the buffer, as a burst
    /// of data packets.
    ///
    /// Pipelining: packets may start anywhere within the first
    /// [SEND_WINDOW] bytes past the last ack. Each packet greedily packs
    /// raw bytes against its own header, costing the escaped bytes double,
    /// so the serialised datagram lands within [MAX_PACKET].
    fn transmit_pending(&mut self, now: Instant) {
        let total = self.tx_buffer.len();
        let mut offset = 0;

        while offset < total && offset < SEND_WINDOW {
            let pos = self.bytes_acked + offset as u64;
            let header_len = format!("/data/{}/{}/", self.id, pos).len();
            let Some(available) = MAX_PACKET.checked_sub(header_len + 1)
            else {
                break;
            };

            let mut cost = 0;
            let mut end = offset;
            while end < total {
                let c = escaped_len(self.tx_buffer[end]);
                if cost + c > available {
                    break;
                }
                cost += c;
                end += 1;
            }
            if end == offset {
                break;
            }

            self.outbox.push(Packet::Data {
                session: self.id,
                pos,
                payload: Bytes::copy_from_slice(&self.tx_buffer[offset..end]),
            });
            offset = end;
        }

        self.last_retransmit = now;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::app::LineReverser;
    use super::super::codec::serialise;
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn session(now: Instant) -> Session<LineReverser> {
        Session::new(12345, addr(), LineReverser, now)
    }

    fn ack(length: u64) -> Packet {
        Packet::Ack {
            session: 12345,
            length,
        }
    }

    fn data(pos: u64, payload: &[u8]) -> Packet {
        Packet::Data {
            session: 12345,
            pos,
            payload: payload.to_owned().into(),
        }
    }

    #[test]
    fn connect_is_idempotent() {
        let now = Instant::now();
        let mut s = session(now);

        s.on_connect();
        s.on_connect();
        assert_eq!(s.drain_outbox(), [ack(0), ack(0)]);
    }

    #[test]
    fn reverses_a_line_end_to_end() {
        let now = Instant::now();
        let mut s = session(now);

        s.on_data(0, b"hello\n", now);
        assert_eq!(s.drain_outbox(), [ack(6), data(0, b"olleh\n")]);

        // The peer acks everything: nothing left to retransmit.
        s.on_ack(6, now);
        assert!(s.drain_outbox().is_empty());
        s.tick(now + RETRANSMIT_TIMEOUT + Duration::from_millis(100));
        assert!(s.drain_outbox().is_empty());
    }

    #[test]
    fn line_split_across_packets() {
        let now = Instant::now();
        let mut s = session(now);

        s.on_data(0, b"abc", now);
        assert_eq!(s.drain_outbox(), [ack(3)]);

        s.on_data(3, b"d\n", now);
        assert_eq!(s.drain_outbox(), [ack(5), data(0, b"dcba\n")]);
    }

    #[test]
    fn gap_reacks_current_position() {
        let now = Instant::now();
        let mut s = session(now);

        s.on_data(5, b"xyz", now);
        assert_eq!(s.drain_outbox(), [ack(0)]);
    }

    #[test]
    fn duplicate_data_reacks_without_reprocessing() {
        let now = Instant::now();
        let mut s = session(now);

        s.on_data(0, b"ab\n", now);
        s.drain_outbox();

        s.on_data(0, b"ab\n", now);
        assert_eq!(s.drain_outbox(), [ack(3)]);
    }

    #[test]
    fn ack_beyond_total_sent_closes() {
        let now = Instant::now();
        let mut s = session(now);

        s.on_ack(1, now);
        assert!(s.is_closed());
        assert_eq!(
            s.drain_outbox(),
            [Packet::Close { session: 12345 }],
        );
    }

    #[test]
    fn partial_ack_resends_the_remainder() {
        let now = Instant::now();
        let mut s = session(now);

        s.on_data(0, b"hello\n", now);
        s.drain_outbox();

        s.on_ack(3, now);
        assert_eq!(s.drain_outbox(), [data(3, b"eh\n")]);
    }

    #[test]
    fn duplicate_ack_retransmits_after_debounce() {
        let now = Instant::now();
        let mut s = session(now);

        s.on_data(0, b"hi\n", now);
        s.drain_outbox();

        // Within the debounce: ignored.
        s.on_ack(0, now + Duration::from_millis(100));
        assert!(s.drain_outbox().is_empty());

        // Past it: the unacked bytes go out again.
        let later = now + Duration::from_millis(300);
        s.on_ack(0, later);
        assert_eq!(s.drain_outbox(), [data(0, b"ih\n")]);

        // And the debounce restarts from the retransmission.
        s.on_ack(0, later + Duration::from_millis(100));
        assert!(s.drain_outbox().is_empty());
    }

    #[test]
    fn retransmit_timer_fires_until_acked() {
        let now = Instant::now();
        let mut s = session(now);

        s.on_data(0, b"hi\n", now);
        s.drain_outbox();

        s.tick(now + Duration::from_secs(1));
        assert!(s.drain_outbox().is_empty());

        let later = now + RETRANSMIT_TIMEOUT + Duration::from_millis(100);
        s.tick(later);
        assert_eq!(s.drain_outbox(), [data(0, b"ih\n")]);

        s.on_ack(3, later);
        s.tick(later + RETRANSMIT_TIMEOUT + Duration::from_millis(100));
        assert!(s.drain_outbox().is_empty());
    }

    #[test]
    fn expiry_is_silent() {
        let now = Instant::now();
        let mut s = session(now);

        s.on_data(0, b"hi\n", now);
        s.drain_outbox();

        s.tick(now + SESSION_EXPIRY + Duration::from_millis(100));
        assert!(s.is_closed());
        assert!(s.drain_outbox().is_empty());
    }

    #[test]
    fn activity_defers_expiry() {
        let now = Instant::now();
        let mut s = session(now);

        let mid = now + Duration::from_secs(50);
        s.touch(mid);
        s.tick(now + SESSION_EXPIRY + Duration::from_millis(100));
        assert!(!s.is_closed());

        s.tick(mid + SESSION_EXPIRY + Duration::from_millis(100));
        assert!(s.is_closed());
    }

    #[test]
    fn close_replies_once_and_closes() {
        let now = Instant::now();
        let mut s = session(now);

        s.on_close();
        s.on_close();
        assert!(s.is_closed());
        assert_eq!(
            s.drain_outbox(),
            [Packet::Close { session: 12345 }],
        );
    }

    #[test]
    fn long_line_is_windowed_into_capped_packets() {
        let now = Instant::now();
        let mut s = session(now);

        let mut line = vec![b'a'; 5000];
        line.push(b'\n');
        s.on_data(0, &line, now);

        let out = s.drain_outbox();
        assert_eq!(out[0], ack(5001));

        let mut covered = Vec::new();
        let mut next_pos = 0;
        for pkt in &out[1..] {
            let Packet::Data { pos, payload, .. } = pkt else {
                panic!("expected data, got {pkt:?}");
            };
            // Contiguous burst, every frame within the wire cap, each
            // packet starting inside the window.
            assert_eq!(*pos, next_pos);
            assert!(*pos < SEND_WINDOW as u64);
            assert!(serialise(pkt).len() <= MAX_PACKET);
            next_pos += payload.len() as u64;
            covered.extend_from_slice(payload);
        }

        // The burst stops at the window, not the end of the buffer.
        assert!(covered.len() >= SEND_WINDOW);
        assert!((covered.len() as u64) < 5001);

        let reversed: Vec<u8> = {
            let mut v = vec![b'a'; 5000];
            v.push(b'\n');
            v
        };
        assert_eq!(covered, reversed[..covered.len()]);
    }

    #[test]
    fn escaped_bytes_count_double_when_packing() {
        let now = Instant::now();
        let mut s = session(now);

        let mut line = vec![b'/'; 1200];
        line.push(b'\n');
        s.on_data(0, &line, now);

        let out = s.drain_outbox();
        for pkt in &out[1..] {
            let Packet::Data { payload, .. } = pkt else {
                panic!("expected data, got {pkt:?}");
            };
            assert!(serialise(pkt).len() <= MAX_PACKET);
            // Escaping halves the per-packet capacity.
            assert!(payload.len() < 500);
        }
    }
}
