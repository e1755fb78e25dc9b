//! `tokio_util::codec::{Decoder, Encoder}` implementation for the wire
//! command protocol, driven through a `Framed<TcpStream, ProtocolCodec>`.

use bytes::{Buf, BufMut, BytesMut};
use log::warn;
use tokio_util::codec::{Decoder, Encoder};

use super::{Command, Headers, Verb};

/// Safety bound on a header block (command line + header lines) so a peer
/// can't force unbounded buffering by never sending the terminating blank
/// line.
const MAX_HEADER_BLOCK: usize = 16 * 1024;

/// Safety bound on a single `M`/`D` body. Matches
/// [`crate::message::MAX_MESSAGE_LEN`]; data chunks are normally far
/// smaller (spec §4.8's `ChunkSize`, 4 KiB).
const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

enum DecodeState {
    AwaitingHeader,
    AwaitingBody {
        verb: Verb,
        args: String,
        headers: Headers,
        length: usize,
    },
    /// An unrecognized verb carried a `length` header: its body is read
    /// and discarded rather than torn down as a parse error (spec §4.7:
    /// "Unknown verbs are logged and, if a `length` header is present,
    /// the body is consumed and discarded").
    SkippingBody {
        length: usize,
    },
}

pub struct ProtocolCodec {
    state: DecodeState,
}

impl Default for ProtocolCodec {
    fn default() -> Self {
        Self {
            state: DecodeState::AwaitingHeader,
        }
    }
}

impl ProtocolCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Parses a buffered header block. The verb is `None` when the leading
/// letter isn't recognized — the caller logs and skips rather than
/// treating this as a parse error (spec §4.7).
fn parse_header_block(text: &str) -> Result<(Option<Verb>, String, Headers), std::io::Error> {
    let mut lines = text.split("\r\n");
    let command_line = lines.next().unwrap_or_default();
    let (verb_char, args) = command_line.split_at(command_line.len().min(1));
    let verb = verb_char.as_bytes().first().and_then(|&b| Verb::from_letter(b));
    let args = args.trim_start().to_string();

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| bad_data(format!("malformed header line {:?}", line)))?;
        headers.insert(name.trim(), value.trim());
    }
    Ok((verb, args, headers))
}

fn bad_data(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())
}

fn build_command(verb: Verb, args: String, headers: Headers, body: Vec<u8>) -> Result<Command, std::io::Error> {
    match verb {
        Verb::Hello => Ok(Command::Hello {
            remote_peering: args,
            headers,
        }),
        Verb::Auth => Ok(Command::Auth { hash: args, headers }),
        Verb::KeepAlive => {
            let nonce: u32 = args
                .trim()
                .parse()
                .map_err(|_| bad_data(format!("bad keep-alive nonce {:?}", args)))?;
            Ok(Command::KeepAlive { nonce })
        }
        Verb::Message => Ok(Command::Message { headers, body }),
        Verb::RequestNoData | Verb::RequestWithData => {
            let mut parts = args.splitn(2, ' ');
            let req_id: u64 = parts
                .next()
                .unwrap_or_default()
                .parse()
                .map_err(|_| bad_data("bad request id"))?;
            let target = parts.next().unwrap_or_default().to_string();
            Ok(Command::Request {
                req_id,
                target,
                is_data: verb == Verb::RequestWithData,
                headers,
            })
        }
        Verb::Response => {
            let mut parts = args.split(' ');
            let req_id: u64 = parts
                .next()
                .unwrap_or_default()
                .parse()
                .map_err(|_| bad_data("bad response request id"))?;
            let status: i32 = parts
                .next()
                .unwrap_or_default()
                .parse()
                .map_err(|_| bad_data("bad response status"))?;
            let channel: u64 = parts
                .next()
                .unwrap_or("0")
                .parse()
                .map_err(|_| bad_data("bad response channel"))?;
            Ok(Command::Response {
                req_id,
                status,
                channel,
                headers,
            })
        }
        Verb::Data => {
            let channel: u64 = args
                .trim()
                .parse()
                .map_err(|_| bad_data("bad data channel"))?;
            Ok(Command::Data { channel, body })
        }
        Verb::Error => {
            let mut parts = args.split(' ');
            let channel: u64 = parts
                .next()
                .unwrap_or_default()
                .parse()
                .map_err(|_| bad_data("bad error channel"))?;
            let status: i32 = parts
                .next()
                .unwrap_or_default()
                .parse()
                .map_err(|_| bad_data("bad error status"))?;
            Ok(Command::Error { channel, status })
        }
        Verb::Cancel => {
            let channel: u64 = args
                .trim()
                .parse()
                .map_err(|_| bad_data("bad cancel channel"))?;
            Ok(Command::Cancel { channel })
        }
    }
}

impl Decoder for ProtocolCodec {
    type Item = Command;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, Self::Error> {
        loop {
            match &self.state {
                DecodeState::AwaitingHeader => {
                    let pos = src.windows(4).position(|w| w == b"\r\n\r\n");
                    let pos = match pos {
                        Some(p) => p,
                        None => {
                            if src.len() > MAX_HEADER_BLOCK {
                                return Err(bad_data("header block exceeds size limit"));
                            }
                            return Ok(None);
                        }
                    };
                    let text = std::str::from_utf8(&src[..pos])
                        .map_err(|_| bad_data("non-utf8 header block"))?
                        .to_string();
                    let (verb, args, headers) = parse_header_block(&text)?;
                    src.advance(pos + 4);

                    let verb = match verb {
                        Some(verb) => verb,
                        None => {
                            warn!("unknown verb in line {:?}, skipping", text.lines().next().unwrap_or_default());
                            match headers.get_u64("length") {
                                Some(length) => {
                                    let length = length as usize;
                                    if length > MAX_BODY_LEN {
                                        return Err(bad_data("body exceeds size limit"));
                                    }
                                    self.state = DecodeState::SkippingBody { length };
                                    continue;
                                }
                                None => continue,
                            }
                        }
                    };

                    if verb.carries_body() {
                        let length = headers
                            .get_u64("length")
                            .ok_or_else(|| bad_data("missing length header"))?
                            as usize;
                        if length > MAX_BODY_LEN {
                            return Err(bad_data("body exceeds size limit"));
                        }
                        self.state = DecodeState::AwaitingBody {
                            verb,
                            args,
                            headers,
                            length,
                        };
                        // fall through to the AwaitingBody arm on next loop
                        continue;
                    }

                    return Ok(Some(build_command(verb, args, headers, Vec::new())?));
                }
                DecodeState::AwaitingBody { length, .. } => {
                    if src.len() < *length {
                        src.reserve(*length - src.len());
                        return Ok(None);
                    }
                    let body = src.split_to(*length).to_vec();
                    let (verb, args, headers, _) = match std::mem::replace(
                        &mut self.state,
                        DecodeState::AwaitingHeader,
                    ) {
                        DecodeState::AwaitingBody {
                            verb,
                            args,
                            headers,
                            length,
                        } => (verb, args, headers, length),
                        _ => unreachable!(),
                    };
                    return Ok(Some(build_command(verb, args, headers, body)?));
                }
                DecodeState::SkippingBody { length } => {
                    let length = *length;
                    if src.len() < length {
                        src.reserve(length - src.len());
                        return Ok(None);
                    }
                    src.advance(length);
                    self.state = DecodeState::AwaitingHeader;
                    continue;
                }
            }
        }
    }
}

fn write_line(dst: &mut BytesMut, verb: u8, args: &str) {
    dst.put_u8(verb);
    dst.put_u8(b' ');
    dst.extend_from_slice(args.as_bytes());
    dst.extend_from_slice(b"\r\n");
}

fn write_headers(dst: &mut BytesMut, headers: &Headers) {
    for (name, value) in headers.iter() {
        dst.extend_from_slice(name.as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
    dst.extend_from_slice(b"\r\n");
}

impl Encoder<Command> for ProtocolCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Command::Hello {
                remote_peering,
                headers,
            } => {
                write_line(dst, Verb::Hello.letter(), &remote_peering);
                write_headers(dst, &headers);
            }
            Command::Auth { hash, headers } => {
                write_line(dst, Verb::Auth.letter(), &hash);
                write_headers(dst, &headers);
            }
            Command::KeepAlive { nonce } => {
                write_line(dst, Verb::KeepAlive.letter(), &nonce.to_string());
                dst.extend_from_slice(b"\r\n");
            }
            Command::Message { mut headers, body } => {
                headers.insert("length", body.len().to_string());
                write_line(dst, Verb::Message.letter(), "");
                write_headers(dst, &headers);
                dst.extend_from_slice(&body);
            }
            Command::Request {
                req_id,
                target,
                is_data,
                headers,
            } => {
                let verb = if is_data { Verb::RequestWithData } else { Verb::RequestNoData };
                write_line(dst, verb.letter(), &format!("{} {}", req_id, target));
                write_headers(dst, &headers);
            }
            Command::Response {
                req_id,
                status,
                channel,
                headers,
            } => {
                write_line(
                    dst,
                    Verb::Response.letter(),
                    &format!("{} {} {}", req_id, status, channel),
                );
                write_headers(dst, &headers);
            }
            Command::Data { channel, body } => {
                let mut headers = Headers::new();
                headers.insert("length", body.len().to_string());
                write_line(dst, Verb::Data.letter(), &channel.to_string());
                write_headers(dst, &headers);
                dst.extend_from_slice(&body);
            }
            Command::Error { channel, status } => {
                write_line(dst, Verb::Error.letter(), &format!("{} {}", channel, status));
                dst.extend_from_slice(b"\r\n");
            }
            Command::Cancel { channel } => {
                write_line(dst, Verb::Cancel.letter(), &channel.to_string());
                dst.extend_from_slice(b"\r\n");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip(cmd: Command) -> Command {
        let mut codec = ProtocolCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(cmd, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn keep_alive_roundtrips() {
        let got = roundtrip(Command::KeepAlive { nonce: 42 });
        assert_eq!(got, Command::KeepAlive { nonce: 42 });
    }

    #[test]
    fn hello_with_headers_roundtrips() {
        let mut headers = Headers::new();
        headers.insert("Application", "teapotnet");
        headers.insert("Nonce", "deadbeef");
        let got = roundtrip(Command::Hello {
            remote_peering: "abc123".to_string(),
            headers: headers.clone(),
        });
        match got {
            Command::Hello { remote_peering, headers: got_headers } => {
                assert_eq!(remote_peering, "abc123");
                assert_eq!(got_headers.get("application"), Some("teapotnet"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn message_body_roundtrips() {
        let got = roundtrip(Command::Message {
            headers: Headers::new(),
            body: b"hello world".to_vec(),
        });
        match got {
            Command::Message { body, .. } => assert_eq!(body, b"hello world"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn data_zero_length_is_eof_marker() {
        let got = roundtrip(Command::Data {
            channel: 5,
            body: Vec::new(),
        });
        match got {
            Command::Data { channel, body } => {
                assert_eq!(channel, 5);
                assert!(body.is_empty());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn decode_waits_for_full_body_across_partial_reads() {
        let mut codec = ProtocolCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Command::Data {
                    channel: 1,
                    body: vec![9u8; 10],
                },
                &mut buf,
            )
            .unwrap();

        // Split the encoded frame to simulate a partial TCP read.
        let mut first_half = buf.split_to(buf.len() - 4);
        assert!(codec.decode(&mut first_half).unwrap().is_none());

        let mut rest = first_half;
        rest.extend_from_slice(&buf);
        let got = codec.decode(&mut rest).unwrap().unwrap();
        match got {
            Command::Data { body, .. } => assert_eq!(body, vec![9u8; 10]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn request_request_with_data_flag_roundtrips() {
        let got = roundtrip(Command::Request {
            req_id: 7,
            target: "file:/doc.txt".to_string(),
            is_data: true,
            headers: Headers::new(),
        });
        match got {
            Command::Request { req_id, target, is_data, .. } => {
                assert_eq!(req_id, 7);
                assert_eq!(target, "file:/doc.txt");
                assert!(is_data);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_verb_body_is_skipped_and_next_frame_still_decodes() {
        let mut codec = ProtocolCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"Z foo\r\nlength: 5\r\n\r\nHELLO");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        codec.encode(Command::KeepAlive { nonce: 9 }, &mut buf).unwrap();
        let got = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(got, Command::KeepAlive { nonce: 9 });
    }

    #[test]
    fn unknown_verb_without_length_header_is_skipped() {
        let mut codec = ProtocolCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"Z foo\r\n\r\n");
        codec.encode(Command::KeepAlive { nonce: 3 }, &mut buf).unwrap();
        let got = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(got, Command::KeepAlive { nonce: 3 });
    }
}
