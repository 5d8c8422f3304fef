//! Newline-delimited JSON codec for worker communication.
//!
//! Wraps LinesCodec and adds serde_json serialization. Works over any
//! AsyncRead/AsyncWrite (pipes, sockets, etc).
//!
//! A line that fails to parse as JSON is logged and skipped inside the
//! decoder: each line is independently delimited, so one bad frame must not
//! corrupt the ones that follow.

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Upper bound on a single frame. Extraction results can be large, but an
/// unbounded line would let a misbehaving worker exhaust memory.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Codec framing one JSON value per line.
pub struct JsonLinesCodec {
    inner: LinesCodec,
}

impl Default for JsonLinesCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonLinesCodec {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        }
    }
}

fn into_io(err: LinesCodecError) -> io::Error {
    match err {
        LinesCodecError::MaxLineLengthExceeded => io::Error::new(
            io::ErrorKind::InvalidData,
            "worker emitted a line exceeding the frame limit",
        ),
        LinesCodecError::Io(e) => e,
    }
}

impl Decoder for JsonLinesCodec {
    type Item = serde_json::Value;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src).map_err(into_io)? {
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str(line) {
                        Ok(value) => return Ok(Some(value)),
                        Err(e) => {
                            let preview: String = line.chars().take(200).collect();
                            tracing::warn!(
                                error = %e,
                                line = %preview,
                                "discarding malformed frame from worker"
                            );
                            continue;
                        }
                    }
                }
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<serde_json::Value> for JsonLinesCodec {
    type Error = io::Error;

    fn encode(&mut self, item: serde_json::Value, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "encoding frame");
        self.inner.encode(json, dst).map_err(into_io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrip_single_frame() {
        let mut codec = JsonLinesCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(json!({"action": "health_check", "id": "r1"}), &mut buf).unwrap();
        assert!(buf.ends_with(b"\n"));

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded["action"], "health_check");
        assert_eq!(decoded["id"], "r1");
    }

    #[test]
    fn malformed_line_is_skipped_without_breaking_framing() {
        let mut codec = JsonLinesCodec::new();
        let mut buf = BytesMut::from("not json at all\n{\"status\":\"model_loaded\"}\n");

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded["status"], "model_loaded");
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut codec = JsonLinesCodec::new();
        let mut buf = BytesMut::from("\n   \n{\"status\":\"ok\"}\n");

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded["status"], "ok");
    }

    #[test]
    fn partial_line_waits_for_more_data() {
        let mut codec = JsonLinesCodec::new();
        let mut buf = BytesMut::from("{\"status\":");

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\"ok\"}\n");
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded["status"], "ok");
    }
}
