//! Byte stream → log lines.

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why a pump returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// The stop token fired.
    Stopped,
    /// The source ended (EOF or read error).
    Exhausted,
}

/// Consume a stream of bytes, split into lines and hand each to `on_line`.
/// Flushes the last partial line on end.
pub async fn pump_lines<S, E, F>(stream: S, stop: &CancellationToken, mut on_line: F) -> PumpEnd
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
    F: FnMut(&str),
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = BytesMut::new();
    let end = loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break PumpEnd::Stopped,
            next = stream.next() => {
                match next {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line = buf.split_to(pos);
                            let _ = buf.split_to(1); // drop '\n'
                            emit_line(&line, &mut on_line);
                        }
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "log stream read error; treating as end of stream");
                        break PumpEnd::Exhausted;
                    }
                    None => break PumpEnd::Exhausted,
                }
            }
        }
    };
    if !buf.is_empty() {
        emit_line(&buf, &mut on_line);
    }
    end
}

fn emit_line<F: FnMut(&str)>(raw: &[u8], on_line: &mut F) {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    on_line(&String::from_utf8_lossy(raw));
}

/// Split a leading RFC 3339 timestamp (as written with `timestamps=true`) off a line.
pub fn split_timestamp(line: &str) -> (Option<DateTime<Utc>>, &str) {
    if let Some((head, rest)) = line.split_once(' ') {
        if let Ok(ts) = DateTime::parse_from_rfc3339(head) {
            return (Some(ts.with_timezone(&Utc)), rest);
        }
    }
    (None, line)
}
