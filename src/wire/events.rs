use bytes::Bytes;

/// An event produced by the request-line decoder.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClientEvent {
    /// A complete request line with the trailing newline stripped.
    Line(Bytes),
    /// A line exceeded the length cap and is being thrown away. Reported
    /// once per offending line so the client gets a single error response.
    Overlong,
    /// A chunk of an overlong line was consumed while resynchronising.
    Discarded,
}
