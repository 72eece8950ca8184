//! Frame Codec: pure encode/decode for request, response, and tunnel
//! frames. No I/O lives here; `stream_engine` and `direct_engine` own the
//! socket/queue plumbing around it.

use std::io::{self, ErrorKind, IoSlice};

use bytes::Bytes;
use http::{HeaderName, HeaderValue, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BridgeError, LimitKind, Result};

pub const PROTOCOL_VERSION: u8 = 1;

pub const REQUEST_INLINE: u8 = 1;
pub const RESPONSE_INLINE: u8 = 2;
pub const REQUEST_START: u8 = 3;
pub const REQUEST_CHUNK: u8 = 4;
pub const REQUEST_END: u8 = 5;
pub const RESPONSE_START: u8 = 6;
pub const RESPONSE_CHUNK: u8 = 7;
pub const RESPONSE_END: u8 = 8;
pub const TUNNEL_CHUNK: u8 = 9;
pub const TUNNEL_CLOSE: u8 = 10;
pub const REQUEST_INLINE_TOKENIZED: u8 = 11;
pub const RESPONSE_INLINE_TOKENIZED: u8 = 12;
pub const REQUEST_START_TOKENIZED: u8 = 13;
pub const RESPONSE_START_TOKENIZED: u8 = 14;

pub const HEADER_NAME_LITERAL_TOKEN: u16 = 0xFFFF;

/// Frame payload kind, discriminated from the version+type prefix alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    RequestInline { tokenized: bool },
    RequestStart { tokenized: bool },
    RequestChunk,
    RequestEnd,
    ResponseInline { tokenized: bool },
    ResponseStart { tokenized: bool },
    ResponseChunk,
    ResponseEnd,
    TunnelChunk,
    TunnelClose,
}

/// Classifies a decoded payload's frame kind from its version+type prefix,
/// without touching the rest of the body.
pub fn classify(payload: &[u8]) -> Result<FrameKind> {
    if payload.len() < 2 {
        return Err(BridgeError::Malformed("truncated bridge payload".into()));
    }
    let version = payload[0];
    if version != PROTOCOL_VERSION {
        return Err(BridgeError::Malformed(format!(
            "unsupported bridge protocol version: {version}"
        )));
    }
    let kind = match payload[1] {
        REQUEST_INLINE => FrameKind::RequestInline { tokenized: false },
        REQUEST_INLINE_TOKENIZED => FrameKind::RequestInline { tokenized: true },
        REQUEST_START => FrameKind::RequestStart { tokenized: false },
        REQUEST_START_TOKENIZED => FrameKind::RequestStart { tokenized: true },
        REQUEST_CHUNK => FrameKind::RequestChunk,
        REQUEST_END => FrameKind::RequestEnd,
        RESPONSE_INLINE => FrameKind::ResponseInline { tokenized: false },
        RESPONSE_INLINE_TOKENIZED => FrameKind::ResponseInline { tokenized: true },
        RESPONSE_START => FrameKind::ResponseStart { tokenized: false },
        RESPONSE_START_TOKENIZED => FrameKind::ResponseStart { tokenized: true },
        RESPONSE_CHUNK => FrameKind::ResponseChunk,
        RESPONSE_END => FrameKind::ResponseEnd,
        TUNNEL_CHUNK => FrameKind::TunnelChunk,
        TUNNEL_CLOSE => FrameKind::TunnelClose,
        other => {
            return Err(BridgeError::Malformed(format!(
                "unknown bridge frame type: {other}"
            )))
        }
    };
    Ok(kind)
}

/// Maps a lowercase header name to its compact bridge token. Callers are
/// expected to have already lowercased via `HeaderName`'s own invariant.
pub fn header_name_token(name: &str) -> Option<u16> {
    let token = match name {
        "host" => 0,
        "connection" => 1,
        "user-agent" => 2,
        "accept" => 3,
        "accept-encoding" => 4,
        "accept-language" => 5,
        "content-type" => 6,
        "content-length" => 7,
        "transfer-encoding" => 8,
        "cookie" => 9,
        "set-cookie" => 10,
        "cache-control" => 11,
        "pragma" => 12,
        "upgrade" => 13,
        "authorization" => 14,
        "origin" => 15,
        "referer" => 16,
        "location" => 17,
        "server" => 18,
        "date" => 19,
        "x-forwarded-for" => 20,
        "x-forwarded-proto" => 21,
        "x-forwarded-host" => 22,
        "x-forwarded-port" => 23,
        "x-request-id" => 24,
        "sec-websocket-key" => 25,
        "sec-websocket-version" => 26,
        "sec-websocket-protocol" => 27,
        "sec-websocket-extensions" => 28,
        _ => return None,
    };
    Some(token)
}

/// Reverse of [`header_name_token`].
pub fn header_name_from_token(token: u16) -> Option<HeaderName> {
    use http::header;
    match token {
        0 => Some(header::HOST),
        1 => Some(header::CONNECTION),
        2 => Some(header::USER_AGENT),
        3 => Some(header::ACCEPT),
        4 => Some(header::ACCEPT_ENCODING),
        5 => Some(header::ACCEPT_LANGUAGE),
        6 => Some(header::CONTENT_TYPE),
        7 => Some(header::CONTENT_LENGTH),
        8 => Some(header::TRANSFER_ENCODING),
        9 => Some(header::COOKIE),
        10 => Some(header::SET_COOKIE),
        11 => Some(header::CACHE_CONTROL),
        12 => Some(header::PRAGMA),
        13 => Some(header::UPGRADE),
        14 => Some(header::AUTHORIZATION),
        15 => Some(header::ORIGIN),
        16 => Some(header::REFERER),
        17 => Some(header::LOCATION),
        18 => Some(header::SERVER),
        19 => Some(header::DATE),
        20 => Some(HeaderName::from_static("x-forwarded-for")),
        21 => Some(HeaderName::from_static("x-forwarded-proto")),
        22 => Some(HeaderName::from_static("x-forwarded-host")),
        23 => Some(HeaderName::from_static("x-forwarded-port")),
        24 => Some(HeaderName::from_static("x-request-id")),
        25 => Some(HeaderName::from_static("sec-websocket-key")),
        26 => Some(HeaderName::from_static("sec-websocket-version")),
        27 => Some(HeaderName::from_static("sec-websocket-protocol")),
        28 => Some(HeaderName::from_static("sec-websocket-extensions")),
        _ => None,
    }
}

/// One decoded header pair. The name is resolved eagerly (cheap: either a
/// known static `HeaderName` or one more slice into the payload); the
/// value stays as a raw byte slice until a caller asks for a string view.
#[derive(Debug, Clone)]
pub struct HeaderField {
    pub name: HeaderName,
    pub value: Bytes,
}

/// Owned request head, materialized lazily from a decoded view.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    pub query: String,
    pub protocol: String,
    pub headers: Vec<HeaderField>,
}

/// Zero-copy view over a decoded `RequestInline`/`RequestStart` payload.
/// Field accessors validate UTF-8 lazily and per-field, as required.
pub struct RequestView<'a> {
    pub method: &'a [u8],
    pub scheme: &'a [u8],
    pub authority: &'a [u8],
    pub path: &'a [u8],
    pub query: &'a [u8],
    pub protocol: &'a [u8],
    pub headers: Vec<(HeaderName, &'a [u8])>,
    pub body: &'a [u8],
}

impl<'a> RequestView<'a> {
    pub fn method(&self) -> Result<&'a str> {
        str_field(self.method)
    }
    pub fn scheme(&self) -> Result<&'a str> {
        str_field(self.scheme)
    }
    pub fn authority(&self) -> Result<&'a str> {
        str_field(self.authority)
    }
    pub fn path(&self) -> Result<&'a str> {
        str_field(self.path)
    }
    pub fn query(&self) -> Result<&'a str> {
        str_field(self.query)
    }
    pub fn protocol(&self) -> Result<&'a str> {
        str_field(self.protocol)
    }

    pub fn to_owned_head(&self) -> Result<RequestHead> {
        let mut headers = Vec::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            headers.push(HeaderField {
                name: name.clone(),
                value: Bytes::copy_from_slice(value),
            });
        }
        Ok(RequestHead {
            method: self.method()?.to_string(),
            scheme: self.scheme()?.to_string(),
            authority: self.authority()?.to_string(),
            path: self.path()?.to_string(),
            query: self.query()?.to_string(),
            protocol: self.protocol()?.to_string(),
            headers,
        })
    }
}

fn str_field(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|e| BridgeError::Malformed(e.to_string()))
}

/// Owned response head.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: Vec<HeaderField>,
}

// ---------------------------------------------------------------------
// Encoders
// ---------------------------------------------------------------------

pub fn encode_request_inline(head: &RequestHead, body: &[u8]) -> Result<Vec<u8>> {
    let mut writer = ByteWriter::new();
    writer.reserve(256 + head.headers.len() * 32 + body.len());
    writer.put_u8(PROTOCOL_VERSION);
    writer.put_u8(REQUEST_INLINE_TOKENIZED);
    encode_request_fields(&mut writer, head)?;
    writer.put_bytes(body)?;
    Ok(writer.into_inner())
}

pub fn encode_request_start(head: &RequestHead) -> Result<Vec<u8>> {
    let mut writer = ByteWriter::new();
    writer.reserve(256 + head.headers.len() * 32);
    writer.put_u8(PROTOCOL_VERSION);
    writer.put_u8(REQUEST_START_TOKENIZED);
    encode_request_fields(&mut writer, head)?;
    Ok(writer.into_inner())
}

fn encode_request_fields(writer: &mut ByteWriter, head: &RequestHead) -> Result<()> {
    writer.put_string(&head.method)?;
    writer.put_string(&head.scheme)?;
    writer.put_string(&head.authority)?;
    writer.put_string(&head.path)?;
    writer.put_string(&head.query)?;
    writer.put_string(&head.protocol)?;
    encode_headers(writer, &head.headers)
}

pub fn encode_request_chunk(chunk: &[u8]) -> Result<Vec<u8>> {
    encode_chunk_payload(REQUEST_CHUNK, chunk)
}

pub fn encode_request_end() -> Vec<u8> {
    vec![PROTOCOL_VERSION, REQUEST_END]
}

pub fn encode_response_inline(status: StatusCode, headers: &[HeaderField], body: &[u8]) -> Result<Vec<u8>> {
    let mut writer = ByteWriter::new();
    writer.reserve(64 + headers.len() * 32 + body.len());
    writer.put_u8(PROTOCOL_VERSION);
    writer.put_u8(RESPONSE_INLINE_TOKENIZED);
    writer.put_u16(status.as_u16());
    encode_headers(&mut writer, headers)?;
    writer.put_bytes(body)?;
    Ok(writer.into_inner())
}

pub fn encode_response_start(status: StatusCode, headers: &[HeaderField]) -> Result<Vec<u8>> {
    let mut writer = ByteWriter::new();
    writer.reserve(64 + headers.len() * 32);
    writer.put_u8(PROTOCOL_VERSION);
    writer.put_u8(RESPONSE_START_TOKENIZED);
    writer.put_u16(status.as_u16());
    encode_headers(&mut writer, headers)?;
    Ok(writer.into_inner())
}

pub fn encode_response_chunk(chunk: &[u8]) -> Result<Vec<u8>> {
    encode_chunk_payload(RESPONSE_CHUNK, chunk)
}

pub fn encode_response_end() -> Vec<u8> {
    vec![PROTOCOL_VERSION, RESPONSE_END]
}

pub fn encode_tunnel_chunk(chunk: &[u8]) -> Result<Vec<u8>> {
    encode_chunk_payload(TUNNEL_CHUNK, chunk)
}

pub fn encode_tunnel_close() -> Vec<u8> {
    vec![PROTOCOL_VERSION, TUNNEL_CLOSE]
}

fn encode_chunk_payload(frame_type: u8, chunk: &[u8]) -> Result<Vec<u8>> {
    let mut writer = ByteWriter::new();
    writer.reserve(6 + chunk.len());
    writer.put_u8(PROTOCOL_VERSION);
    writer.put_u8(frame_type);
    writer.put_bytes(chunk)?;
    Ok(writer.into_inner())
}

fn encode_headers(writer: &mut ByteWriter, headers: &[HeaderField]) -> Result<()> {
    if headers.is_empty() {
        writer.put_u32(0);
        return Ok(());
    }
    let count_pos = writer.reserve_u32();
    let mut count: u32 = 0;
    for field in headers {
        count = count
            .checked_add(1)
            .ok_or_else(|| BridgeError::Malformed("too many bridge headers".into()))?;
        write_header_name(writer, field.name.as_str())?;
        writer.put_bytes(&field.value)?;
    }
    writer.patch_u32(count_pos, count);
    Ok(())
}

fn write_header_name(writer: &mut ByteWriter, name: &str) -> Result<()> {
    if let Some(token) = header_name_token(name) {
        writer.put_u16(token);
        return Ok(());
    }
    writer.put_u16(HEADER_NAME_LITERAL_TOKEN);
    writer.put_string(name)
}

// ---------------------------------------------------------------------
// Decoders
// ---------------------------------------------------------------------

pub fn decode_request_view(payload: &[u8]) -> Result<RequestView<'_>> {
    let mut reader = ByteReader::new(payload);
    let version = reader.get_u8()?;
    check_version(version)?;
    let frame_type = reader.get_u8()?;
    let tokenized = match frame_type {
        REQUEST_INLINE => false,
        REQUEST_INLINE_TOKENIZED | REQUEST_START_TOKENIZED => true,
        REQUEST_START => false,
        other => {
            return Err(BridgeError::ProtocolViolation(format!(
                "not a request frame: {other}"
            )))
        }
    };
    let has_body = matches!(frame_type, REQUEST_INLINE | REQUEST_INLINE_TOKENIZED);

    let method = reader.get_bytes()?;
    let scheme = reader.get_bytes()?;
    let authority = reader.get_bytes()?;
    let path = reader.get_bytes()?;
    let query = reader.get_bytes()?;
    let protocol = reader.get_bytes()?;
    let headers = decode_header_list(&mut reader, tokenized)?;
    let body = if has_body { reader.get_bytes()? } else { &[] };
    reader.ensure_done()?;

    Ok(RequestView {
        method,
        scheme,
        authority,
        path,
        query,
        protocol,
        headers,
        body,
    })
}

pub fn decode_request_chunk(payload: &[u8]) -> Result<&[u8]> {
    let mut reader = ByteReader::new(payload);
    let version = reader.get_u8()?;
    check_version(version)?;
    let frame_type = reader.get_u8()?;
    if frame_type != REQUEST_CHUNK {
        return Err(BridgeError::ProtocolViolation(format!(
            "expected request chunk frame, got {frame_type}"
        )));
    }
    let chunk = reader.get_bytes()?;
    reader.ensure_done()?;
    Ok(chunk)
}

pub fn decode_request_end(payload: &[u8]) -> Result<()> {
    let mut reader = ByteReader::new(payload);
    let version = reader.get_u8()?;
    check_version(version)?;
    let frame_type = reader.get_u8()?;
    if frame_type != REQUEST_END {
        return Err(BridgeError::ProtocolViolation(format!(
            "expected request end frame, got {frame_type}"
        )));
    }
    reader.ensure_done()
}

pub fn decode_response_inline(payload: &[u8]) -> Result<(StatusCode, Vec<HeaderField>, Bytes)> {
    let mut reader = ByteReader::new(payload);
    let version = reader.get_u8()?;
    check_version(version)?;
    let frame_type = reader.get_u8()?;
    let tokenized = match frame_type {
        RESPONSE_INLINE => false,
        RESPONSE_INLINE_TOKENIZED => true,
        other => {
            return Err(BridgeError::ProtocolViolation(format!(
                "expected response inline frame, got {other}"
            )))
        }
    };
    let status = decode_status(&mut reader)?;
    let headers = decode_owned_header_list(&mut reader, tokenized)?;
    let body = reader.get_bytes()?;
    reader.ensure_done()?;
    Ok((status, headers, Bytes::copy_from_slice(body)))
}

pub fn decode_response_start(payload: &[u8]) -> Result<(StatusCode, Vec<HeaderField>)> {
    let mut reader = ByteReader::new(payload);
    let version = reader.get_u8()?;
    check_version(version)?;
    let frame_type = reader.get_u8()?;
    let tokenized = match frame_type {
        RESPONSE_START => false,
        RESPONSE_START_TOKENIZED => true,
        other => {
            return Err(BridgeError::ProtocolViolation(format!(
                "expected response start frame, got {other}"
            )))
        }
    };
    let status = decode_status(&mut reader)?;
    let headers = decode_owned_header_list(&mut reader, tokenized)?;
    reader.ensure_done()?;
    Ok((status, headers))
}

pub fn decode_response_chunk(payload: &[u8]) -> Result<Bytes> {
    let mut reader = ByteReader::new(payload);
    let version = reader.get_u8()?;
    check_version(version)?;
    let frame_type = reader.get_u8()?;
    if frame_type != RESPONSE_CHUNK {
        return Err(BridgeError::ProtocolViolation(format!(
            "expected response chunk frame, got {frame_type}"
        )));
    }
    let chunk = reader.get_bytes()?;
    reader.ensure_done()?;
    Ok(Bytes::copy_from_slice(chunk))
}

pub fn decode_response_end(payload: &[u8]) -> Result<()> {
    let mut reader = ByteReader::new(payload);
    let version = reader.get_u8()?;
    check_version(version)?;
    let frame_type = reader.get_u8()?;
    if frame_type != RESPONSE_END {
        return Err(BridgeError::ProtocolViolation(format!(
            "expected response end frame, got {frame_type}"
        )));
    }
    reader.ensure_done()
}

pub fn decode_tunnel_chunk(payload: &[u8]) -> Result<Bytes> {
    let mut reader = ByteReader::new(payload);
    let version = reader.get_u8()?;
    check_version(version)?;
    let frame_type = reader.get_u8()?;
    if frame_type != TUNNEL_CHUNK {
        return Err(BridgeError::ProtocolViolation(format!(
            "expected tunnel chunk frame, got {frame_type}"
        )));
    }
    let chunk = reader.get_bytes()?;
    reader.ensure_done()?;
    Ok(Bytes::copy_from_slice(chunk))
}

pub fn decode_tunnel_close(payload: &[u8]) -> Result<()> {
    let mut reader = ByteReader::new(payload);
    let version = reader.get_u8()?;
    check_version(version)?;
    let frame_type = reader.get_u8()?;
    if frame_type != TUNNEL_CLOSE {
        return Err(BridgeError::ProtocolViolation(format!(
            "expected tunnel close frame, got {frame_type}"
        )));
    }
    reader.ensure_done()
}

fn decode_status(reader: &mut ByteReader<'_>) -> Result<StatusCode> {
    let raw = reader.get_u16()?;
    StatusCode::from_u16(raw).map_err(|_| BridgeError::Malformed(format!("invalid status code: {raw}")))
}

fn decode_header_list<'a>(
    reader: &mut ByteReader<'a>,
    tokenized: bool,
) -> Result<Vec<(HeaderName, &'a [u8])>> {
    let count = reader.get_u32()? as usize;
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let Some(name) = decode_header_name(reader, tokenized)? else {
            reader.get_bytes()?;
            continue;
        };
        let value = reader.get_bytes()?;
        headers.push((name, value));
    }
    Ok(headers)
}

fn decode_owned_header_list(reader: &mut ByteReader<'_>, tokenized: bool) -> Result<Vec<HeaderField>> {
    let count = reader.get_u32()? as usize;
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let Some(name) = decode_header_name(reader, tokenized)? else {
            reader.get_bytes()?;
            continue;
        };
        let value = reader.get_bytes()?;
        let Ok(value) = HeaderValue::from_bytes(value) else {
            continue;
        };
        headers.push(HeaderField {
            name,
            value: Bytes::copy_from_slice(value.as_bytes()),
        });
    }
    Ok(headers)
}

fn decode_header_name(reader: &mut ByteReader<'_>, tokenized: bool) -> Result<Option<HeaderName>> {
    if !tokenized {
        let name = reader.get_bytes()?;
        return Ok(HeaderName::from_bytes(name).ok());
    }
    let token = reader.get_u16()?;
    if token == HEADER_NAME_LITERAL_TOKEN {
        let name = reader.get_bytes()?;
        return Ok(HeaderName::from_bytes(name).ok());
    }
    let name = header_name_from_token(token)
        .ok_or_else(|| BridgeError::Malformed(format!("invalid header name token: {token}")))?;
    Ok(Some(name))
}

fn check_version(version: u8) -> Result<()> {
    if version != PROTOCOL_VERSION {
        return Err(BridgeError::Malformed(format!(
            "unsupported bridge protocol version: {version}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Stream framing: length-prefixed read/write with coalescing
// ---------------------------------------------------------------------

/// Writes one length-prefixed frame, coalescing small payloads into a
/// single `write`, and using vectored writes for larger ones.
pub async fn write_frame<S: AsyncWrite + Unpin + ?Sized>(
    socket: &mut S,
    payload: &[u8],
    frame_limit: usize,
    coalesce_threshold: usize,
) -> Result<()> {
    if payload.len() > frame_limit {
        return Err(BridgeError::LimitExceeded {
            kind: LimitKind::Frame,
            size: payload.len(),
            limit: frame_limit,
        });
    }
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| BridgeError::Malformed("frame length does not fit u32".into()))?;
    let header = payload_len.to_be_bytes();
    if payload.is_empty() {
        socket.write_all(&header).await?;
        return Ok(());
    }
    if payload.len() <= coalesce_threshold {
        let mut out = Vec::with_capacity(4 + payload.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(payload);
        socket.write_all(&out).await?;
        return Ok(());
    }
    write_all_vectored(socket, &[&header, payload]).await?;
    Ok(())
}

/// Writes a chunk frame (request-chunk, response-chunk, or tunnel-chunk),
/// applying the same coalescing policy as [`write_frame`] but keeping the
/// 6-byte prefix+header separate from the chunk body above the threshold.
pub async fn write_chunk_frame<S: AsyncWrite + Unpin + ?Sized>(
    socket: &mut S,
    frame_type: u8,
    chunk: &[u8],
    frame_limit: usize,
    coalesce_threshold: usize,
) -> Result<()> {
    let chunk_len = u32::try_from(chunk.len())
        .map_err(|_| BridgeError::Malformed("chunk length does not fit u32".into()))?;
    let payload_len = 6usize
        .checked_add(chunk.len())
        .ok_or_else(|| BridgeError::Malformed("frame length overflow".into()))?;
    if payload_len > frame_limit {
        return Err(BridgeError::LimitExceeded {
            kind: LimitKind::Frame,
            size: payload_len,
            limit: frame_limit,
        });
    }
    let payload_len = u32::try_from(payload_len).expect("checked above");
    let header = payload_len.to_be_bytes();
    let mut prefix = [0_u8; 6];
    prefix[0] = PROTOCOL_VERSION;
    prefix[1] = frame_type;
    prefix[2..6].copy_from_slice(&chunk_len.to_be_bytes());

    if payload_len as usize <= coalesce_threshold {
        let mut out = Vec::with_capacity(10 + chunk.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&prefix);
        out.extend_from_slice(chunk);
        socket.write_all(&out).await?;
        return Ok(());
    }
    if chunk.is_empty() {
        write_all_vectored(socket, &[&header, &prefix]).await?;
        return Ok(());
    }
    write_all_vectored(socket, &[&header, &prefix, chunk]).await?;
    Ok(())
}

async fn write_all_vectored<S: AsyncWrite + Unpin + ?Sized>(
    socket: &mut S,
    buffers: &[&[u8]],
) -> io::Result<()> {
    let mut index = 0usize;
    let mut offset = 0usize;

    while index < buffers.len() {
        while index < buffers.len() && offset == buffers[index].len() {
            index += 1;
            offset = 0;
        }
        if index >= buffers.len() {
            break;
        }

        let remaining_buffers = buffers.len() - index;
        let written = if remaining_buffers <= 3 {
            let mut io_slices = [IoSlice::new(&[]), IoSlice::new(&[]), IoSlice::new(&[])];
            io_slices[0] = IoSlice::new(&buffers[index][offset..]);
            let mut slice_len = 1usize;
            if remaining_buffers >= 2 {
                io_slices[1] = IoSlice::new(buffers[index + 1]);
                slice_len = 2;
            }
            if remaining_buffers >= 3 {
                io_slices[2] = IoSlice::new(buffers[index + 2]);
                slice_len = 3;
            }
            socket.write_vectored(&io_slices[..slice_len]).await?
        } else {
            let mut io_slices = Vec::with_capacity(remaining_buffers);
            io_slices.push(IoSlice::new(&buffers[index][offset..]));
            for buffer in &buffers[(index + 1)..] {
                io_slices.push(IoSlice::new(buffer));
            }
            socket.write_vectored(&io_slices).await?
        };
        if written == 0 {
            return Err(io::Error::new(ErrorKind::WriteZero, "failed to write bridge frame bytes"));
        }

        let mut remaining = written;
        while index < buffers.len() && remaining > 0 {
            let available = buffers[index].len() - offset;
            if remaining < available {
                offset += remaining;
                remaining = 0;
            } else {
                remaining -= available;
                index += 1;
                offset = 0;
            }
        }
    }

    Ok(())
}

/// Reads one length-prefixed frame into a reused buffer. Returns `false`
/// on clean EOF before any bytes of a new frame are read.
pub async fn read_frame_reuse<S: AsyncRead + Unpin + ?Sized>(
    socket: &mut S,
    payload: &mut Vec<u8>,
    frame_limit: usize,
) -> Result<bool> {
    let mut header = [0_u8; 4];
    let mut read = 0;
    while read < header.len() {
        let n = socket.read(&mut header[read..]).await?;
        if n == 0 {
            if read == 0 {
                return Ok(false);
            }
            return Err(BridgeError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "connection closed while reading frame header",
            )));
        }
        read += n;
    }

    let payload_len = u32::from_be_bytes(header) as usize;
    if payload_len > frame_limit {
        return Err(BridgeError::LimitExceeded {
            kind: LimitKind::Frame,
            size: payload_len,
            limit: frame_limit,
        });
    }

    payload.resize(payload_len, 0);
    let mut read = 0;
    while read < payload_len {
        let n = socket.read(&mut payload[read..payload_len]).await?;
        if n == 0 {
            return Err(BridgeError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "connection ended before frame payload completed",
            )));
        }
        read += n;
    }
    Ok(true)
}

pub async fn read_frame<S: AsyncRead + Unpin + ?Sized>(
    socket: &mut S,
    frame_limit: usize,
) -> Result<Option<Vec<u8>>> {
    let mut payload = Vec::new();
    if !read_frame_reuse(socket, &mut payload, frame_limit).await? {
        return Ok(None);
    }
    Ok(Some(payload))
}

// ---------------------------------------------------------------------
// Minimal binary codec primitives
// ---------------------------------------------------------------------

struct ByteWriter {
    bytes: Vec<u8>,
}

impl ByteWriter {
    fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    fn reserve(&mut self, additional: usize) {
        self.bytes.reserve(additional);
    }

    fn reserve_u32(&mut self) -> usize {
        let pos = self.bytes.len();
        self.bytes.extend_from_slice(&0_u32.to_be_bytes());
        pos
    }

    fn patch_u32(&mut self, pos: usize, value: u32) {
        self.bytes[pos..pos + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn into_inner(self) -> Vec<u8> {
        self.bytes
    }

    fn put_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    fn put_u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    fn put_string(&mut self, value: &str) -> Result<()> {
        self.put_bytes(value.as_bytes())
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| BridgeError::Malformed("field length does not fit u32".into()))?;
        self.put_u32(len);
        self.bytes.extend_from_slice(bytes);
        Ok(())
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get_exact(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16> {
        let b = self.get_exact(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn get_u32(&mut self) -> Result<u32> {
        let b = self.get_exact(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.get_exact(len)
    }

    fn ensure_done(&self) -> Result<()> {
        if self.offset == self.bytes.len() {
            return Ok(());
        }
        Err(BridgeError::Malformed(format!(
            "unexpected trailing bridge payload bytes: {}",
            self.bytes.len() - self.offset
        )))
    }

    fn get_exact(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.offset + len > self.bytes.len() {
            return Err(BridgeError::Malformed("truncated bridge payload".into()));
        }
        let start = self.offset;
        self.offset += len;
        Ok(&self.bytes[start..start + len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_head() -> RequestHead {
        RequestHead {
            method: "GET".into(),
            scheme: "http".into(),
            authority: "x".into(),
            path: "/ping".into(),
            query: "".into(),
            protocol: "1.1".into(),
            headers: vec![HeaderField {
                name: HeaderName::from_static("x-request-id"),
                value: Bytes::from_static(b"abc"),
            }],
        }
    }

    #[test]
    fn request_inline_round_trip() {
        let head = sample_head();
        let encoded = encode_request_inline(&head, b"pong").unwrap();
        let view = decode_request_view(&encoded).unwrap();
        assert_eq!(view.method().unwrap(), "GET");
        assert_eq!(view.authority().unwrap(), "x");
        assert_eq!(view.path().unwrap(), "/ping");
        assert_eq!(view.body, b"pong");
        assert_eq!(view.headers.len(), 1);
        assert_eq!(view.headers[0].0, HeaderName::from_static("x-request-id"));
    }

    #[test]
    fn request_start_has_no_body() {
        let head = sample_head();
        let encoded = encode_request_start(&head).unwrap();
        let view = decode_request_view(&encoded).unwrap();
        assert!(view.body.is_empty());
    }

    #[test]
    fn header_case_preserved_via_literal_token() {
        let mut head = sample_head();
        head.headers = vec![HeaderField {
            name: HeaderName::from_bytes(b"x-custom-header").unwrap(),
            value: Bytes::from_static(b"Value"),
        }];
        let encoded = encode_request_inline(&head, b"").unwrap();
        let view = decode_request_view(&encoded).unwrap();
        assert_eq!(view.headers[0].0.as_str(), "x-custom-header");
        assert_eq!(view.headers[0].1, b"Value");
    }

    #[test]
    fn response_round_trip() {
        let headers = vec![HeaderField {
            name: HeaderName::from_static("content-type"),
            value: Bytes::from_static(b"text/plain; charset=utf-8"),
        }];
        let encoded = encode_response_inline(StatusCode::OK, &headers, b"pong").unwrap();
        let (status, headers, body) = decode_response_inline(&encoded).unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[0].name, HeaderName::from_static("content-type"));
        assert_eq!(&body[..], b"pong");
    }

    #[test]
    fn classify_identifies_every_frame_kind() {
        assert!(matches!(
            classify(&encode_request_end()).unwrap(),
            FrameKind::RequestEnd
        ));
        assert!(matches!(
            classify(&encode_response_end()).unwrap(),
            FrameKind::ResponseEnd
        ));
        assert!(matches!(
            classify(&encode_tunnel_close()).unwrap(),
            FrameKind::TunnelClose
        ));
        assert!(matches!(
            classify(&encode_request_chunk(b"ab").unwrap()).unwrap(),
            FrameKind::RequestChunk
        ));
    }

    #[test]
    fn truncated_frame_is_malformed() {
        let err = decode_request_view(&[PROTOCOL_VERSION]).unwrap_err();
        assert!(matches!(err, BridgeError::Malformed(_)));
    }

    #[test]
    fn oversized_declared_length_does_not_allocate_proportionally() {
        // A declared body length far beyond the actual buffer must fail
        // fast on bounds-check rather than attempting to allocate it.
        let mut payload = vec![PROTOCOL_VERSION, REQUEST_CHUNK];
        payload.extend_from_slice(&u32::MAX.to_be_bytes());
        let err = decode_request_chunk(&payload).unwrap_err();
        assert!(matches!(err, BridgeError::Malformed(_)));
    }

    #[tokio::test]
    async fn frame_round_trips_over_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let payload = encode_request_end();
        write_frame(&mut a, &payload, 64 * 1024 * 1024, 4096).await.unwrap();
        let read_back = read_frame(&mut b, 64 * 1024 * 1024).await.unwrap().unwrap();
        assert_eq!(read_back, payload);
    }

    #[tokio::test]
    async fn chunk_frame_above_coalesce_threshold_round_trips() {
        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        let chunk = vec![7_u8; 8192];
        write_chunk_frame(&mut a, REQUEST_CHUNK, &chunk, 64 * 1024 * 1024, 4096)
            .await
            .unwrap();
        let payload = read_frame(&mut b, 64 * 1024 * 1024).await.unwrap().unwrap();
        let decoded = decode_request_chunk(&payload).unwrap();
        assert_eq!(decoded, chunk.as_slice());
    }
}
