//! HTTP response framing for long-lived chunked streams
//!
//! ```text
//! HTTP/1.1 200 OK\r\n
//! Content-type: application/octet-stream\r\n
//! Transfer-Encoding: chunked\r\n
//! \r\n
//! <HEX-LEN>\r\n<payload>\r\n
//! <HEX-LEN>\r\n<payload>\r\n
//! 0\r\n\r\n
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::config::MimeType;

const HTTP_200_OK: &str = "HTTP/1.1 200 OK";
const CONTENT_TYPE: &str = "Content-type: ";
const ENC_CHUNKED: &str = "Transfer-Encoding: chunked";
const CRLF: &str = "\r\n";

/// Zero-length chunk marking the end of the body
pub const END_CHUNK: &[u8] = b"0\r\n\r\n";

/// Response header sent once before the first chunk
pub fn http_response(mimetype: MimeType) -> String {
    let mut response = String::with_capacity(96);

    response.push_str(HTTP_200_OK);
    response.push_str(CRLF);
    if let Some(mime) = mimetype.as_str() {
        response.push_str(CONTENT_TYPE);
        response.push_str(mime);
        response.push_str(CRLF);
    }
    response.push_str(ENC_CHUNKED);
    response.push_str(CRLF);
    response.push_str(CRLF);

    response
}

/// Frame `payload` as one chunk: `<HEX-LEN>\r\n<payload>\r\n`
///
/// An empty payload yields [`END_CHUNK`].
pub fn encode_chunk(payload: &[u8]) -> Bytes {
    if payload.is_empty() {
        return Bytes::from_static(END_CHUNK);
    }

    let header = format!("{:X}{}", payload.len(), CRLF);
    let mut buf = BytesMut::with_capacity(header.len() + payload.len() + CRLF.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    buf.put_slice(CRLF.as_bytes());
    buf.freeze()
}
