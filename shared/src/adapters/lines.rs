//! Line reassembly for streamed HTTP bodies.
//!
//! TCP chunk boundaries do not line up with protocol lines: one chunk may
//! carry several lines, and a line (or a UTF-8 code point) may be split across
//! chunks. `LineBuffer` keeps only the bytes of the line still being received.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Pop the next complete line, without its `\n` / `\r\n` terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let newline = self.pending.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Take an unterminated trailing line once the body has ended.
    pub fn take_remaining(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Turn a byte stream into a stream of lines. The first transport error is
/// forwarded and ends the stream.
pub fn lines<S, E>(bytes: S) -> impl Stream<Item = Result<String, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    async_stream::stream! {
        let mut buffer = LineBuffer::new();
        let mut bytes = Box::pin(bytes);

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    buffer.push(&chunk);
                    while let Some(line) = buffer.next_line() {
                        yield Ok(line);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        if let Some(rest) = buffer.take_remaining() {
            yield Ok(rest);
        }
    }
}

/// Strip an SSE `data:` field prefix. Returns `None` for other SSE fields
/// (`event:`, `id:`, `retry:`, comments).
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[test]
    fn test_multiple_lines_per_chunk() {
        let mut buffer = LineBuffer::new();
        buffer.push(b"data: one\r\ndata: two\npartial");

        assert_eq!(buffer.next_line().as_deref(), Some("data: one"));
        assert_eq!(buffer.next_line().as_deref(), Some("data: two"));
        assert_eq!(buffer.next_line(), None);
        assert_eq!(buffer.take_remaining().as_deref(), Some("partial"));
        assert_eq!(buffer.take_remaining(), None);
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let text = "héllo\n".as_bytes();
        let mut buffer = LineBuffer::new();
        buffer.push(&text[..2]);
        assert_eq!(buffer.next_line(), None);
        buffer.push(&text[2..]);
        assert_eq!(buffer.next_line().as_deref(), Some("héllo"));
    }

    #[tokio::test]
    async fn test_lines_stream_reassembles() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"data: {\"a\":")),
            Ok(Bytes::from_static(b"1}\n\ndata: [DONE]")),
        ];
        let collected: Vec<_> = lines(stream::iter(chunks)).collect().await;

        assert_eq!(
            collected,
            vec![
                Ok("data: {\"a\":1}".to_string()),
                Ok(String::new()),
                Ok("data: [DONE]".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_lines_stream_stops_on_error() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"first\nsecond")),
            Err("connection reset".to_string()),
            Ok(Bytes::from_static(b"never\n")),
        ];
        let collected: Vec<_> = lines(stream::iter(chunks)).collect().await;

        assert_eq!(
            collected,
            vec![Ok("first".to_string()), Err("connection reset".to_string())]
        );
    }

    #[test]
    fn test_sse_data() {
        assert_eq!(sse_data("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(sse_data("data:[DONE]"), Some("[DONE]"));
        assert_eq!(sse_data("event: message"), None);
        assert_eq!(sse_data(": keep-alive"), None);
    }
}
