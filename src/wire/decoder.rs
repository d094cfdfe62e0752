use std::io;

use bytes::Buf;
use tokio_util::codec;

use super::events::ClientEvent;

/// The most bytes a single request line may span, including its payload.
/// Anything longer earns an error response and is discarded wholesale.
pub const MAX_LINE: usize = 1 << 20;

/// A decoder for a stream of newline-delimited request lines.
///
/// Unlike a plain lines codec, an overlong line is not a connection-fatal
/// framing error: the protocol requires the connection to stay open, so
/// the decoder reports the line once as [ClientEvent::Overlong] and then
/// discards input until the next newline resynchronises the stream.
#[derive(Debug, Default)]
pub enum Decoder {
    #[default]
    Line,
    DiscardToNewline,
}

impl codec::Decoder for Decoder {
    type Item = ClientEvent;

    type Error = io::Error;

    fn decode(
        &mut self,
        src: &mut bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        match *self {
            Decoder::Line => {
                // A conforming line must terminate within MAX_LINE + 1
                // bytes, so there is no need to scan past that.
                match src
                    .iter()
                    .take(MAX_LINE + 1)
                    .position(|&b| b == b'\n')
                {
                    Some(idx) => {
                        // Panic safety: split_to/advance panic unless
                        // src.len() >= idx + 1, which position guarantees.
                        let line = src.split_to(idx);
                        src.advance(1); // discards the \n left in the buffer

                        Ok(Some(ClientEvent::Line(line.freeze())))
                    },
                    None => {
                        if src.len() > MAX_LINE {
                            *self = Self::DiscardToNewline;
                            Ok(Some(ClientEvent::Overlong))
                        } else {
                            // The newline may still arrive.
                            Ok(None)
                        }
                    },
                }
            },
            Decoder::DiscardToNewline => {
                if src.is_empty() {
                    return Ok(None);
                }

                match src.iter().position(|&b| b == b'\n') {
                    Some(idx) => {
                        // Panic safety: advance panics unless
                        // src.len() >= idx + 1, guaranteed by position.
                        src.advance(idx + 1);
                        *self = Self::Line;
                    },
                    None => src.advance(src.len()),
                }

                // Ok(None) not suitable here due to end of stream semantics
                Ok(Some(ClientEvent::Discarded))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use io::ErrorKind;
    use tokio_stream::StreamExt;
    use tokio_util::codec::FramedRead;

    use super::*;

    fn line(l: &[u8]) -> ClientEvent {
        ClientEvent::Line(l.to_owned().into())
    }

    #[tokio::test]
    async fn test_normal() {
        let stream: Vec<u8> =
            b"{\"request\":\"get\",\"queues\":[]}\n\n{\"a\":1}\n".into();

        let decoder: Decoder = Default::default();
        let mut framed = FramedRead::new(stream.as_ref(), decoder);

        assert_eq!(
            framed.next().await.unwrap().unwrap(),
            line(br#"{"request":"get","queues":[]}"#),
        );
        assert_eq!(framed.next().await.unwrap().unwrap(), line(b""));
        assert_eq!(framed.next().await.unwrap().unwrap(), line(br#"{"a":1}"#));

        // End of stream should be OK
        assert!(framed.next().await.is_none());
    }

    // Lines are reassembled across arbitrary read boundaries
    #[tokio::test]
    async fn test_split_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(b"{\"a\":")
            .read(b"1}\nxy")
            .read(b"z\n")
            .build();

        let mut framed = FramedRead::new(mock, Decoder::default());

        assert_eq!(framed.next().await.unwrap().unwrap(), line(br#"{"a":1}"#));
        assert_eq!(framed.next().await.unwrap().unwrap(), line(b"xyz"));
        assert!(framed.next().await.is_none());
    }

    // Test an early EOS with an unterminated line
    #[tokio::test]
    async fn test_eos() {
        let stream: Vec<u8> = b"{\"a\":1}\n{\"b\"".into();

        let decoder: Decoder = Default::default();
        let mut framed = FramedRead::new(stream.as_ref(), decoder);

        assert_eq!(framed.next().await.unwrap().unwrap(), line(br#"{"a":1}"#));

        let err = framed.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);

        assert!(framed.next().await.is_none());
    }

    // Test recovery after a line over the cap
    #[tokio::test]
    async fn test_overlong_recovery() {
        let mut stream = vec![b'x'; MAX_LINE + 8];
        stream.extend_from_slice(b"\n{\"ok\":1}\n");

        let decoder: Decoder = Default::default();
        let mut framed = FramedRead::new(stream.as_ref(), decoder);

        assert_eq!(
            framed.next().await.unwrap().unwrap(),
            ClientEvent::Overlong,
        );

        // The oversized line drains as one or more Discarded chunks,
        // depending on how the reads land.
        let mut evt = framed.next().await.unwrap().unwrap();
        assert_eq!(evt, ClientEvent::Discarded);
        while evt == ClientEvent::Discarded {
            evt = framed.next().await.unwrap().unwrap();
        }

        assert_eq!(evt, line(br#"{"ok":1}"#));

        assert!(framed.next().await.is_none());
    }

    // A line of exactly MAX_LINE bytes is still accepted
    #[tokio::test]
    async fn test_line_at_cap() {
        let mut stream = vec![b'y'; MAX_LINE];
        stream.push(b'\n');

        let decoder: Decoder = Default::default();
        let mut framed = FramedRead::new(stream.as_ref(), decoder);

        match framed.next().await.unwrap().unwrap() {
            ClientEvent::Line(l) => assert_eq!(l.len(), MAX_LINE),
            other => panic!("expected Line, got {other:?}"),
        }

        assert!(framed.next().await.is_none());
    }
}
