use bytes::{BufMut, BytesMut};

/// The byte-stream consumer layered on top of a session.
///
/// The session hands over its receive buffer whenever new in-order bytes
/// arrive; the application takes any complete units it can and appends its
/// output to `tx`, which the session then transmits and retransmits until
/// acknowledged. Anything incomplete must be left in `rx`.
pub trait Application {
    fn consume(&mut self, rx: &mut BytesMut, tx: &mut BytesMut);
}

/// Reverses each newline-terminated line. Bytes are reversed as raw bytes;
/// there is no line length limit.
#[derive(Debug, Default)]
pub struct LineReverser;

impl Application for LineReverser {
    fn consume(&mut self, rx: &mut BytesMut, tx: &mut BytesMut) {
        while let Some(idx) = rx.iter().position(|&b| b == b'\n') {
            let line = rx.split_to(idx + 1);

            tx.reserve(line.len());
            // Everything before the newline, back to front.
            for &b in line[..line.len() - 1].iter().rev() {
                tx.put_u8(b);
            }
            tx.put_u8(b'\n');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consume(rx: &[u8]) -> (BytesMut, BytesMut) {
        let mut rx = BytesMut::from(rx);
        let mut tx = BytesMut::new();
        LineReverser.consume(&mut rx, &mut tx);
        (rx, tx)
    }

    #[test]
    fn reverses_complete_lines() {
        let (rx, tx) = consume(b"hello\nworld\n");
        assert_eq!(&rx[..], b"");
        assert_eq!(&tx[..], b"olleh\ndlrow\n");
    }

    #[test]
    fn keeps_incomplete_tail() {
        let (rx, tx) = consume(b"abc\nde");
        assert_eq!(&rx[..], b"de");
        assert_eq!(&tx[..], b"cba\n");
    }

    #[test]
    fn no_newline_no_output() {
        let (rx, tx) = consume(b"abc");
        assert_eq!(&rx[..], b"abc");
        assert_eq!(&tx[..], b"");
    }

    #[test]
    fn empty_line_round_trips() {
        let (_, tx) = consume(b"\n");
        assert_eq!(&tx[..], b"\n");
    }

    #[test]
    fn reverses_raw_bytes() {
        let (_, tx) = consume(b"a\x01\x7f\n");
        assert_eq!(&tx[..], b"\x7f\x01a\n");
    }
}
