use serde::Deserialize;
use serde_json::Value;

use crate::jobs::job::{Delivery, JobId, Pri};

/// A request sent by the client, one JSON object per line, dispatched on
/// its `request` field. Unknown fields are ignored; a missing or
/// ill-typed required field fails the parse.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "request", rename_all = "lowercase")]
pub enum Request {
    /// Inserts a job into a queue.
    ///
    /// On the wire: `{"request":"put","queue":q,"pri":n,"job":…}`
    Put { queue: String, pri: Pri, job: Value },
    /// Retrieves the highest-priority job across the named queues,
    /// optionally blocking until one exists.
    ///
    /// On the wire: `{"request":"get","queues":[…],"wait":bool?}`
    Get {
        queues: Vec<String>,
        #[serde(default)]
        wait: bool,
    },
    /// Deletes a job in any state, whoever holds it.
    ///
    /// On the wire: `{"request":"delete","id":n}`
    Delete { id: JobId },
    /// Returns a job held by this client to its queue.
    ///
    /// On the wire: `{"request":"abort","id":n}`
    Abort { id: JobId },
}

/// Parses one request line. The error carries serde_json's message, which
/// goes back to the client verbatim in an error response.
pub fn parse_request(line: &[u8]) -> Result<Request, serde_json::Error> {
    serde_json::from_slice(line)
}

/// All possible response types. Every response is one JSON object with a
/// `status` of `ok`, `no-job`, or `error`.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// In response to a `put`: the job was created with the given id.
    ///
    /// On the wire: `{"status":"ok","id":n}`
    Inserted { id: JobId },
    /// In response to a `get`: a job was assigned to this client.
    ///
    /// On the wire: `{"status":"ok","id":n,"pri":n,"queue":q,"job":…}`
    Delivered(Delivery),
    /// In response to a `delete` or `abort`: success.
    ///
    /// On the wire: `{"status":"ok"}`
    Done,
    /// The job doesn't exist, isn't held by this client, or every polled
    /// queue was empty without `wait`.
    ///
    /// On the wire: `{"status":"no-job"}`
    NoJob,
    /// The request was structurally invalid. The connection stays open.
    ///
    /// On the wire: `{"status":"error","error":msg}`
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_each_request() {
        assert_eq!(
            parse_request(br#"{"request":"put","queue":"q","pri":1,"job":{"x":1}}"#)
                .unwrap(),
            Request::Put {
                queue: "q".into(),
                pri: Pri(1),
                job: json!({"x": 1}),
            },
        );
        assert_eq!(
            parse_request(br#"{"request":"get","queues":["a","b"]}"#).unwrap(),
            Request::Get {
                queues: vec!["a".into(), "b".into()],
                wait: false,
            },
        );
        assert_eq!(
            parse_request(br#"{"request":"get","queues":[],"wait":true}"#)
                .unwrap(),
            Request::Get {
                queues: vec![],
                wait: true,
            },
        );
        assert_eq!(
            parse_request(br#"{"request":"delete","id":42}"#).unwrap(),
            Request::Delete { id: JobId(42) },
        );
        assert_eq!(
            parse_request(br#"{"request":"abort","id":7}"#).unwrap(),
            Request::Abort { id: JobId(7) },
        );
    }

    #[test]
    fn ignores_unknown_fields() {
        assert_eq!(
            parse_request(br#"{"request":"delete","id":1,"extra":true}"#)
                .unwrap(),
            Request::Delete { id: JobId(1) },
        );
    }

    #[test]
    fn rejects_malformed_requests() {
        // Bad JSON entirely.
        assert!(parse_request(b"{nope").is_err());
        // Unknown request type.
        assert!(parse_request(br#"{"request":"frobnicate"}"#).is_err());
        // Missing required fields.
        assert!(parse_request(br#"{"request":"put","queue":"q"}"#).is_err());
        assert!(parse_request(br#"{"request":"get"}"#).is_err());
        // Negative priority.
        assert!(parse_request(
            br#"{"request":"put","queue":"q","pri":-1,"job":null}"#
        )
        .is_err());
        // Fractional priority.
        assert!(parse_request(
            br#"{"request":"put","queue":"q","pri":1.5,"job":null}"#
        )
        .is_err());
        // Wrong queues type.
        assert!(
            parse_request(br#"{"request":"get","queues":"q"}"#).is_err()
        );
        assert!(
            parse_request(br#"{"request":"get","queues":[1]}"#).is_err()
        );
        // Wrong wait type.
        assert!(parse_request(
            br#"{"request":"get","queues":["q"],"wait":1}"#
        )
        .is_err());
    }
}
