use futures_core::Stream;
use futures_util::StreamExt;
use std::pin::Pin;
use tokio_util::bytes::Bytes;

use crate::api::error::ApiError;

/// Synthetic first line carrying the transport status code, emitted before
/// any protocol line so consumers can react to non-success responses.
pub const STATUS_LINE_PREFIX: &str = "@status:";

pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, ApiError>> + Send>>;

/// Decode a transport byte stream into protocol lines.
///
/// Fragments that span multiple reads are carried over until a terminator is
/// seen; both CRLF and LF terminate a line. Unterminated trailing bytes are
/// flushed as a final line when the transport completes.
pub fn decode_lines<S, E>(status: u16, byte_stream: S) -> LineStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    Box::pin(async_stream::try_stream! {
        yield format!("{STATUS_LINE_PREFIX}{status}");

        let mut carry: Vec<u8> = Vec::new();
        tokio::pin!(byte_stream);

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| ApiError::stream(e.to_string()))?;
            carry.extend_from_slice(&chunk);

            while let Some(pos) = carry.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = carry.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                yield String::from_utf8_lossy(&line).into_owned();
            }
        }

        if !carry.is_empty() {
            yield String::from_utf8_lossy(&carry).into_owned();
        }
    })
}

/// Parse the synthetic status line, if this is one.
pub fn parse_status_line(line: &str) -> Option<u16> {
    line.strip_prefix(STATUS_LINE_PREFIX)
        .and_then(|rest| rest.trim().parse().ok())
}
