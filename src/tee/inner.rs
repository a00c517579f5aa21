//! Inner (decrypted) request and response of the VAU channel
//!
//! Request plaintext, single spaces between the fields:
//!
//! ```text
//! 1 <access token> <request id, hex> <response key, hex> <HTTP request>
//! ```
//!
//! Response plaintext:
//!
//! ```text
//! 1 <request id, hex> <HTTP status line and headers>\r\n\r\n<body>
//! ```

use crate::crypto::SymmetricKey;
use crate::error::{HttpStatus, Result, VauError};
use std::fmt;
use zeroize::Zeroizing;

/// Version tag of the inner request and response
pub const INNER_VERSION: &str = "1";
/// Length of the response key a client must send
pub const RESPONSE_KEY_LENGTH: usize = 16;

const HEADER_END: &[u8] = b"\r\n\r\n";

fn next_field<'a>(rest: &mut &'a [u8], name: &str) -> Result<&'a [u8]> {
    let end = rest
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| VauError::Protocol(format!("inner request has no {}", name)))?;
    let field = &rest[..end];
    if field.is_empty() {
        return Err(VauError::Protocol(format!("inner request has an empty {}", name)));
    }
    *rest = &rest[end + 1..];
    Ok(field)
}

fn decode_hex(field: &[u8], name: &str) -> Result<Vec<u8>> {
    hex::decode(field).map_err(|_| VauError::Protocol(format!("{} is not valid hex", name)))
}

/// Decrypted VAU request
pub struct InnerRequest {
    authentication_token: Zeroizing<String>,
    request_id: Vec<u8>,
    response_key: SymmetricKey,
    http_request: Zeroizing<Vec<u8>>,
}

impl InnerRequest {
    /// Parse the inner plaintext. Any deviation from the layout, a version
    /// other than "1" or a response key that is not 128 bit fails with
    /// [`VauError::Protocol`].
    pub fn parse(plaintext: &[u8]) -> Result<Self> {
        let mut rest = plaintext;

        let version = next_field(&mut rest, "version")?;
        if version != INNER_VERSION.as_bytes() {
            return Err(VauError::Protocol(format!(
                "unsupported inner request version '{}'",
                String::from_utf8_lossy(version)
            )));
        }

        let token = next_field(&mut rest, "access token")?;
        let token = std::str::from_utf8(token)
            .map_err(|_| VauError::Protocol("access token is not UTF-8".into()))?;

        let request_id = decode_hex(next_field(&mut rest, "request id")?, "request id")?;

        let key_bytes = Zeroizing::new(decode_hex(
            next_field(&mut rest, "response key")?,
            "response key",
        )?);
        if key_bytes.len() != RESPONSE_KEY_LENGTH {
            return Err(VauError::Protocol(format!(
                "response key has {} bytes, expected {}",
                key_bytes.len(),
                RESPONSE_KEY_LENGTH
            )));
        }
        let response_key = SymmetricKey::from_slice(&key_bytes)
            .map_err(|e| VauError::Protocol(e.to_string()))?;

        Ok(Self {
            authentication_token: Zeroizing::new(token.to_string()),
            request_id,
            response_key,
            http_request: Zeroizing::new(rest.to_vec()),
        })
    }

    /// Build the plaintext of a request; the inverse of [`InnerRequest::parse`]
    pub fn serialize(
        authentication_token: &str,
        request_id: &[u8],
        response_key: &SymmetricKey,
        http_request: &[u8],
    ) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(
            authentication_token.len() + 2 * (request_id.len() + response_key.len()) + http_request.len() + 8,
        ));
        out.extend_from_slice(INNER_VERSION.as_bytes());
        out.push(b' ');
        out.extend_from_slice(authentication_token.as_bytes());
        out.push(b' ');
        out.extend_from_slice(hex::encode(request_id).as_bytes());
        out.push(b' ');
        out.extend_from_slice(Zeroizing::new(hex::encode(response_key.as_bytes())).as_bytes());
        out.push(b' ');
        out.extend_from_slice(http_request);
        out
    }

    pub fn authentication_token(&self) -> &str {
        &self.authentication_token
    }

    pub fn request_id(&self) -> &[u8] {
        &self.request_id
    }

    pub fn response_key(&self) -> &SymmetricKey {
        &self.response_key
    }

    pub fn http_request(&self) -> &[u8] {
        &self.http_request
    }

    /// Split the embedded HTTP request at the first blank line
    pub fn split_header_and_body(&self) -> Result<(&[u8], &[u8])> {
        let pos = find(&self.http_request, HEADER_END)
            .ok_or_else(|| VauError::Protocol("embedded HTTP request has no header end".into()))?;
        Ok((
            &self.http_request[..pos],
            &self.http_request[pos + HEADER_END.len()..],
        ))
    }

    /// First line of the embedded HTTP request, e.g. `GET /Task HTTP/1.1`
    pub fn request_line(&self) -> Option<&str> {
        let (header, _) = self.split_header_and_body().ok()?;
        let line = header.split(|&b| b == b'\n').next()?;
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        std::str::from_utf8(line).ok().filter(|l| !l.is_empty())
    }
}

impl fmt::Debug for InnerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InnerRequest")
            .field("request_id", &hex::encode(&self.request_id))
            .field("authentication_token", &"<redacted>")
            .field("response_key", &self.response_key)
            .field("http_request_len", &self.http_request.len())
            .finish()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Inner HTTP response before encryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerResponse {
    pub status: HttpStatus,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl InnerResponse {
    pub fn new(status: HttpStatus) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialise for encryption. `Content-Length` is always recomputed.
    pub fn serialize(&self, request_id: &[u8]) -> Zeroizing<Vec<u8>> {
        let mut head = format!(
            "{} {} HTTP/1.1 {}\r\n",
            INNER_VERSION,
            hex::encode(request_id),
            self.status
        );
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));

        let mut out = Zeroizing::new(head.into_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse a serialised response, returning the request id it answers
    pub fn parse(plaintext: &[u8]) -> Result<(Vec<u8>, Self)> {
        let mut rest = plaintext;
        let version = next_field(&mut rest, "version")?;
        if version != INNER_VERSION.as_bytes() {
            return Err(VauError::Protocol("unsupported inner response version".into()));
        }
        let request_id = decode_hex(next_field(&mut rest, "request id")?, "request id")?;

        let header_end = find(rest, HEADER_END)
            .ok_or_else(|| VauError::Protocol("inner response has no header end".into()))?;
        let header = std::str::from_utf8(&rest[..header_end])
            .map_err(|_| VauError::Protocol("inner response header is not UTF-8".into()))?;
        let body = rest[header_end + HEADER_END.len()..].to_vec();

        let mut lines = header.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let code = status_line
            .split(' ')
            .nth(1)
            .and_then(|c| c.parse::<u16>().ok())
            .and_then(HttpStatus::from_code)
            .ok_or_else(|| VauError::Protocol(format!("bad status line '{}'", status_line)))?;

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| VauError::Protocol(format!("bad header line '{}'", line)))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok((
            request_id,
            Self {
                status: code,
                headers,
                body,
            },
        ))
    }
}
