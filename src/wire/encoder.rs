use std::{error, fmt, io};

use bytes::BufMut;
use serde_json::json;
use tokio_util::codec;

use super::protocol::Response;

// An encoder producing one JSON object per line per response
#[derive(Debug, Default)]
pub struct Encoder {}

impl codec::Encoder<Response> for Encoder {
    type Error = Error;

    fn encode(
        &mut self,
        item: Response,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        let value = match item {
            Response::Inserted { id } => json!({"status": "ok", "id": id}),
            Response::Delivered(d) => json!({
                "status": "ok",
                "id": d.id,
                "pri": d.pri,
                "queue": d.queue,
                "job": d.payload,
            }),
            Response::Done => json!({"status": "ok"}),
            Response::NoJob => json!({"status": "no-job"}),
            Response::Error { message } => {
                json!({"status": "error", "error": message})
            },
        };

        let encoded = serde_json::to_vec(&value)?;

        // "{encoded}\n"
        dst.reserve(encoded.len() + 1);
        dst.extend(encoded);
        dst.put_u8(b'\n');

        Ok(())
    }
}

#[derive(Debug)]
pub enum Error {
    IO(io::Error),
    Serde(serde_json::Error),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::IO(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}
