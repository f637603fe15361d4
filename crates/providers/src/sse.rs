//! Shared SSE plumbing for the provider adapters.
//!
//! Both protocols arrive as `text/event-stream`: blocks separated by a
//! blank line, each carrying optional `event:` and one or more `data:`
//! lines.  [`drain_frames`] cuts complete blocks out of a growing buffer;
//! [`sse_response_stream`] turns a `reqwest::Response` into a
//! [`BoxStream`] by feeding every frame to a protocol-specific parser.

use crate::util::from_reqwest;
use rb_domain::error::Result;
use rb_domain::stream::{BoxStream, StreamEvent};

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

/// Pull every complete frame out of `buffer`, leaving any trailing partial
/// block in place.  Frames without data (comments, keep-alives) are dropped.
/// `\r\n` line endings are normalised first.
pub(crate) fn drain_frames(buffer: &mut String) -> Vec<SseFrame> {
    if buffer.contains('\r') {
        *buffer = buffer.replace("\r\n", "\n");
    }

    let mut frames = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos + 2).collect();

        let mut event = None;
        let mut data: Vec<&str> = Vec::new();
        for line in block.lines() {
            if let Some(v) = line.strip_prefix("event:") {
                event = Some(v.trim().to_string());
            } else if let Some(v) = line.strip_prefix("data:") {
                data.push(v.strip_prefix(' ').unwrap_or(v));
            }
        }

        let data = data.join("\n");
        if !data.trim().is_empty() {
            frames.push(SseFrame { event, data: data.trim().to_string() });
        }
    }
    frames
}

/// Decode `chunk` onto `buffer`.  A multibyte character cut off at the end
/// of a chunk is held in `carry` until the next chunk completes it;
/// invalid bytes elsewhere become U+FFFD.
pub(crate) fn push_utf8(buffer: &mut String, carry: &mut Vec<u8>, chunk: &[u8]) {
    carry.extend_from_slice(chunk);
    let mut rest: &[u8] = carry;
    let mut kept = Vec::new();
    loop {
        match std::str::from_utf8(rest) {
            Ok(text) => {
                buffer.push_str(text);
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                buffer.push_str(&String::from_utf8_lossy(valid));
                match e.error_len() {
                    None => {
                        kept = after.to_vec();
                        break;
                    }
                    Some(len) => {
                        buffer.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                    }
                }
            }
        }
    }
    *carry = kept;
}

/// Build a [`BoxStream`] from an SSE response and a parser closure.
///
/// The closure is `FnMut` because the chat-completions parser keeps
/// tool-call assembly state across frames.  When the body closes the
/// remaining buffer is flushed, and a `Completed` event is synthesised if
/// the parser never produced one.  A transport error ends the stream
/// without a synthetic `Completed`.
pub(crate) fn sse_response_stream<F>(
    response: reqwest::Response,
    mut parse: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&SseFrame) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut carry: Vec<u8> = Vec::new();
        let mut finished = false;

        loop {
            let frames = match response.chunk().await {
                Ok(Some(bytes)) => {
                    push_utf8(&mut buffer, &mut carry, &bytes);
                    drain_frames(&mut buffer)
                }
                Ok(None) => {
                    buffer.push_str(&String::from_utf8_lossy(&carry));
                    carry.clear();
                    if buffer.trim().is_empty() {
                        break;
                    }
                    buffer.push_str("\n\n");
                    let tail = drain_frames(&mut buffer);
                    buffer.clear();
                    tail
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    finished = true;
                    break;
                }
            };

            for frame in &frames {
                for event in parse(frame) {
                    if matches!(&event, Ok(StreamEvent::Completed { .. }) | Ok(StreamEvent::Error { .. })) {
                        finished = true;
                    }
                    yield event;
                }
            }
        }

        if !finished {
            yield Ok(StreamEvent::Completed {
                response_id: None,
                usage: None,
                finish_reason: Some("stop".into()),
            });
        }
    };

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_event_with_data() {
        let mut buf = String::from(
            "event: response.output_text.delta\ndata: {\"delta\":\"Hi\"}\n\n",
        );
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("response.output_text.delta"));
        assert_eq!(frames[0].data, "{\"delta\":\"Hi\"}");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_block_waits_for_more_bytes() {
        let mut buf = String::from("data: one\n\ndata: tw");
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(buf, "data: tw");

        buf.push_str("o\n\n");
        let frames = drain_frames(&mut buf);
        assert_eq!(frames[0].data, "two");
        assert!(buf.is_empty());
    }

    #[test]
    fn crlf_and_multiline_data() {
        let mut buf = String::from("data: a\r\ndata: b\r\n\r\n");
        let frames = drain_frames(&mut buf);
        assert_eq!(frames[0].data, "a\nb");
        assert!(frames[0].event.is_none());
    }

    #[test]
    fn character_split_across_chunks_survives() {
        let body = "data: {\"t\":\"café\"}\n\n".as_bytes();
        let cut = body.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let mut buf = String::new();
        let mut carry = Vec::new();

        push_utf8(&mut buf, &mut carry, &body[..cut]);
        assert!(drain_frames(&mut buf).is_empty());
        assert_eq!(carry, vec![0xC3]);

        push_utf8(&mut buf, &mut carry, &body[cut..]);
        let frames = drain_frames(&mut buf);
        assert_eq!(frames[0].data, "{\"t\":\"café\"}");
        assert!(carry.is_empty());
    }

    #[test]
    fn emoji_fed_one_byte_at_a_time() {
        let mut buf = String::new();
        let mut carry = Vec::new();
        for byte in "hi 👋".as_bytes() {
            push_utf8(&mut buf, &mut carry, std::slice::from_ref(byte));
        }
        assert_eq!(buf, "hi 👋");
        assert!(carry.is_empty());
    }

    #[test]
    fn invalid_bytes_are_replaced_not_held() {
        let mut buf = String::new();
        let mut carry = Vec::new();
        push_utf8(&mut buf, &mut carry, b"a\xFFb");
        assert_eq!(buf, "a\u{FFFD}b");
        assert!(carry.is_empty());
    }

    #[test]
    fn comments_and_empty_data_are_skipped() {
        let mut buf = String::from(": keep-alive\n\ndata:\n\nid: 7\nretry: 100\ndata: [DONE]\n\n");
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "[DONE]");
    }
}
