use std::time::Duration;

pub mod app;
pub mod codec;
pub mod server;
pub mod session;

/// LRCP messages must be smaller than 1000 bytes.
pub const MAX_PACKET: usize = 999;

/// Exclusive upper bound on every numeric field (session ids, positions,
/// lengths): 2^31.
pub const MAX_NUMERIC: u64 = 1 << 31;

/// How long unacked data may sit before being retransmitted.
pub const RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Sessions with no valid peer traffic for this long are silently dropped.
pub const SESSION_EXPIRY: Duration = Duration::from_secs(60);

/// Maximum bytes in flight beyond the last ack. Roughly 4-5 full packets.
pub const SEND_WINDOW: usize = 4000;

/// A duplicate ack within this interval of the last (re)transmission does
/// not trigger another one.
pub const DUP_ACK_DEBOUNCE: Duration = Duration::from_millis(200);

/// Cadence of the retransmission/expiry sweep.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);
