use bytes::BytesMut;
use tracing::trace;

use crate::protocol::response::Response;

/// Incremental framing of the control connection's byte stream into
///  [`Response`]s (RFC 959 §4.2).
///
/// The parser buffers partial input across chunk boundaries, so the emitted
///  sequence is independent of how the stream happens to be split into
///  reads. Line terminators are `\r\n` on the wire, but a bare `\n` is
///  accepted as well. A line that does not frame a reply while no
///  multi-line reply is open is discarded - resilience over strictness.
pub struct ResponseParser {
    buf: BytesMut,
    multiline: Option<MultilineReply>,
}

/// A reply opened by `nnn-...` collects body lines until `nnn ...` closes it.
///  Body lines may start with anything, including other digit sequences.
struct MultilineReply {
    code: u16,
    lines: Vec<String>,
}

enum Separator {
    /// `nnn rest` - single-line reply, or terminator of a multi-line reply
    Space,
    /// `nnn-rest` - first line of a multi-line reply
    Dash,
    /// bare `nnn` - some servers send the code alone
    None,
}

impl ResponseParser {
    pub fn new() -> ResponseParser {
        ResponseParser {
            buf: BytesMut::new(),
            multiline: None,
        }
    }

    /// Consume a chunk; returns the responses it completed, in server order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Response> {
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw = self.buf.split_to(pos + 1);
            let mut line = &raw[..raw.len() - 1];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            self.handle_line(line, &mut out);
        }
        out
    }

    fn handle_line(&mut self, line: String, out: &mut Vec<Response>) {
        if let Some(multiline) = &mut self.multiline {
            let terminator_rest = match split_reply_line(&line) {
                Some((code, Separator::Space, rest)) if code == multiline.code => {
                    Some(rest.to_string())
                }
                _ => None,
            };
            match terminator_rest {
                Some(rest) => {
                    multiline.lines.push(rest);
                    let completed = self.multiline.take().expect("multi-line state checked above");
                    out.push(Response {
                        code: completed.code,
                        text: completed.lines.join("\n"),
                    });
                }
                None => multiline.lines.push(line),
            }
            return;
        }

        match split_reply_line(&line) {
            Some((code, Separator::Space, rest)) => out.push(Response {
                code,
                text: rest.to_string(),
            }),
            Some((code, Separator::None, _)) => out.push(Response {
                code,
                text: String::new(),
            }),
            Some((code, Separator::Dash, rest)) => {
                self.multiline = Some(MultilineReply {
                    code,
                    lines: vec![rest.to_string()],
                });
            }
            None => trace!("discarding unframed line on the control connection: {:?}", line),
        }
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        ResponseParser::new()
    }
}

fn split_reply_line(line: &str) -> Option<(u16, Separator, &str)> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let code = line[..3].parse().ok()?;
    match bytes.get(3) {
        None => Some((code, Separator::None, "")),
        Some(b' ') => Some((code, Separator::Space, &line[4..])),
        Some(b'-') => Some((code, Separator::Dash, &line[4..])),
        Some(_) => None,
    }
}
