//! Delimiter-free reassembly of JSON-RPC messages from a byte stream.
//!
//! The wire format carries one JSON value per logical message with no outer
//! framing, so message boundaries have to be recovered from JSON's own token
//! structure. [`JsonTokenizer`] lexes bytes into [`JsonToken`]s with a
//! one-slot pushback, and [`MessageReassembler`] walks the token stream to
//! rebuild the minimal text of the next complete top-level value. No semantic
//! validation happens here; the output is structurally balanced JSON text for
//! a downstream parse.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Errors from tokenizing or reassembling the inbound stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("end of stream inside a JSON value")]
    UnexpectedEof,

    #[error("unexpected byte {0:#04x} in JSON stream")]
    UnexpectedByte(u8),

    #[error("unexpected token in JSON stream: {0:?}")]
    UnexpectedToken(JsonToken),

    #[error("invalid UTF-8 in JSON string")]
    InvalidUtf8,

    #[error("invalid escape sequence in JSON string")]
    InvalidEscape,
}

/// A lexical JSON token.
///
/// Property names are distinguished from string values so a consumer can
/// peek a token, decide how to handle it, and push it back without tracking
/// object context itself.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonToken {
    ObjectStart,
    ObjectEnd,
    ArrayStart,
    ArrayEnd,
    PropertyName(String),
    String(String),
    Number(String),
    Boolean(bool),
    Null,
}

#[derive(Debug)]
enum Container {
    Object { next_is_name: bool },
    Array,
}

/// Pull-based token source over an async byte reader.
///
/// Supports reading the next token and pushing back exactly one token.
pub struct JsonTokenizer<R> {
    reader: R,
    pushed: Option<JsonToken>,
    containers: Vec<Container>,
}

impl<R: AsyncBufRead + Unpin> JsonTokenizer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pushed: None,
            containers: Vec::new(),
        }
    }

    /// Return a token to the front of the stream. At most one token can be
    /// outstanding; pushing a second overwrites the first.
    pub fn push_back(&mut self, token: JsonToken) {
        self.pushed = Some(token);
    }

    /// Read the next token. `Ok(None)` means the stream ended cleanly at a
    /// token boundary (connection closed).
    pub async fn next_token(&mut self) -> Result<Option<JsonToken>, StreamError> {
        if let Some(token) = self.pushed.take() {
            return Ok(Some(token));
        }

        let byte = loop {
            match self.next_byte().await? {
                // Whitespace and the separators are structural noise at the
                // token level; pairing is the reassembler's job.
                Some(b' ' | b'\t' | b'\r' | b'\n' | b',' | b':') => continue,
                Some(byte) => break byte,
                None => return Ok(None),
            }
        };

        let token = match byte {
            b'{' => {
                self.containers.push(Container::Object { next_is_name: true });
                JsonToken::ObjectStart
            }
            b'}' => {
                self.containers.pop();
                self.value_done();
                JsonToken::ObjectEnd
            }
            b'[' => {
                self.containers.push(Container::Array);
                JsonToken::ArrayStart
            }
            b']' => {
                self.containers.pop();
                self.value_done();
                JsonToken::ArrayEnd
            }
            b'"' => {
                let text = self.read_string().await?;
                if let Some(Container::Object { next_is_name: next @ true }) =
                    self.containers.last_mut()
                {
                    *next = false;
                    JsonToken::PropertyName(text)
                } else {
                    self.value_done();
                    JsonToken::String(text)
                }
            }
            b'-' | b'0'..=b'9' => {
                let literal = self.read_number(byte).await?;
                self.value_done();
                JsonToken::Number(literal)
            }
            b't' => {
                self.read_literal(b"rue").await?;
                self.value_done();
                JsonToken::Boolean(true)
            }
            b'f' => {
                self.read_literal(b"alse").await?;
                self.value_done();
                JsonToken::Boolean(false)
            }
            b'n' => {
                self.read_literal(b"ull").await?;
                self.value_done();
                JsonToken::Null
            }
            other => return Err(StreamError::UnexpectedByte(other)),
        };

        Ok(Some(token))
    }

    /// A value just completed at the current nesting level; if the enclosing
    /// container is an object, the next string there is a property name.
    fn value_done(&mut self) {
        if let Some(Container::Object { next_is_name }) = self.containers.last_mut() {
            *next_is_name = true;
        }
    }

    async fn next_byte(&mut self) -> Result<Option<u8>, StreamError> {
        let buf = self.reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(None);
        }
        let byte = buf[0];
        self.reader.consume(1);
        Ok(Some(byte))
    }

    async fn next_byte_or_eof(&mut self) -> Result<u8, StreamError> {
        self.next_byte().await?.ok_or(StreamError::UnexpectedEof)
    }

    async fn peek_byte(&mut self) -> Result<Option<u8>, StreamError> {
        let buf = self.reader.fill_buf().await?;
        Ok(buf.first().copied())
    }

    /// Read a string body (the opening quote was already consumed), decoding
    /// escape sequences.
    async fn read_string(&mut self) -> Result<String, StreamError> {
        let mut bytes = Vec::new();
        loop {
            match self.next_byte_or_eof().await? {
                b'"' => break,
                b'\\' => match self.next_byte_or_eof().await? {
                    b'"' => bytes.push(b'"'),
                    b'\\' => bytes.push(b'\\'),
                    b'/' => bytes.push(b'/'),
                    b'b' => bytes.push(0x08),
                    b'f' => bytes.push(0x0c),
                    b'n' => bytes.push(b'\n'),
                    b'r' => bytes.push(b'\r'),
                    b't' => bytes.push(b'\t'),
                    b'u' => {
                        let ch = self.read_unicode_escape().await?;
                        let mut utf8 = [0u8; 4];
                        bytes.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
                    }
                    _ => return Err(StreamError::InvalidEscape),
                },
                other => bytes.push(other),
            }
        }
        String::from_utf8(bytes).map_err(|_| StreamError::InvalidUtf8)
    }

    /// Decode a `\uXXXX` escape, pairing surrogates when needed. The leading
    /// `\u` was already consumed.
    async fn read_unicode_escape(&mut self) -> Result<char, StreamError> {
        let high = self.read_hex4().await?;
        if (0xD800..=0xDBFF).contains(&high) {
            // High surrogate: the low half must follow immediately.
            if self.next_byte_or_eof().await? != b'\\' || self.next_byte_or_eof().await? != b'u' {
                return Err(StreamError::InvalidEscape);
            }
            let low = self.read_hex4().await?;
            if !(0xDC00..=0xDFFF).contains(&low) {
                return Err(StreamError::InvalidEscape);
            }
            let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
            char::from_u32(code).ok_or(StreamError::InvalidEscape)
        } else {
            char::from_u32(high).ok_or(StreamError::InvalidEscape)
        }
    }

    async fn read_hex4(&mut self) -> Result<u32, StreamError> {
        let mut value = 0u32;
        for _ in 0..4 {
            let byte = self.next_byte_or_eof().await?;
            let digit = (byte as char)
                .to_digit(16)
                .ok_or(StreamError::InvalidEscape)?;
            value = value * 16 + digit;
        }
        Ok(value)
    }

    /// Read a number literal's remaining bytes; the first byte is passed in.
    async fn read_number(&mut self, first: u8) -> Result<String, StreamError> {
        let mut literal = vec![first];
        while let Some(byte) = self.peek_byte().await? {
            match byte {
                b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E' => {
                    literal.push(byte);
                    self.reader.consume(1);
                }
                _ => break,
            }
        }
        String::from_utf8(literal).map_err(|_| StreamError::InvalidUtf8)
    }

    /// Consume the tail of a keyword literal (`true`/`false`/`null`).
    async fn read_literal(&mut self, tail: &[u8]) -> Result<(), StreamError> {
        for &expected in tail {
            let byte = self.next_byte_or_eof().await?;
            if byte != expected {
                return Err(StreamError::UnexpectedByte(byte));
            }
        }
        Ok(())
    }
}

/// Reconstructs the minimal JSON text of one complete top-level value per
/// call, from a [`JsonTokenizer`].
pub struct MessageReassembler<R> {
    tokens: JsonTokenizer<R>,
}

type ReassembleFuture<'a> = Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send + 'a>>;

impl<R: AsyncBufRead + Unpin + Send> MessageReassembler<R> {
    pub fn new(reader: R) -> Self {
        Self {
            tokens: JsonTokenizer::new(reader),
        }
    }

    /// The next complete message, or `None` when the stream ended at a
    /// message boundary. EOF inside a value is an error.
    pub async fn next_message(&mut self) -> Result<Option<String>, StreamError> {
        let Some(token) = self.tokens.next_token().await? else {
            return Ok(None);
        };
        let mut out = String::new();
        self.reassemble_value(token, &mut out).await?;
        Ok(Some(out))
    }

    fn reassemble_value<'a>(&'a mut self, token: JsonToken, out: &'a mut String) -> ReassembleFuture<'a> {
        Box::pin(async move {
            match token {
                JsonToken::String(text) => {
                    write_json_string(out, &text);
                    Ok(())
                }
                JsonToken::Number(literal) => {
                    out.push_str(&literal);
                    Ok(())
                }
                JsonToken::Boolean(flag) => {
                    out.push_str(if flag { "true" } else { "false" });
                    Ok(())
                }
                JsonToken::Null => {
                    out.push_str("null");
                    Ok(())
                }
                JsonToken::ArrayStart => self.reassemble_array(out).await,
                JsonToken::ObjectStart => self.reassemble_object(out).await,
                other => Err(StreamError::UnexpectedToken(other)),
            }
        })
    }

    async fn reassemble_array(&mut self, out: &mut String) -> Result<(), StreamError> {
        out.push('[');
        let mut first = true;
        loop {
            let token = self
                .tokens
                .next_token()
                .await?
                .ok_or(StreamError::UnexpectedEof)?;
            match token {
                JsonToken::ArrayEnd => break,
                JsonToken::ObjectEnd | JsonToken::PropertyName(_) => {
                    // Not an element: hand it back and treat the array as done.
                    self.tokens.push_back(token);
                    break;
                }
                element => {
                    if !first {
                        out.push(',');
                    }
                    first = false;
                    self.reassemble_value(element, out).await?;
                }
            }
        }
        out.push(']');
        Ok(())
    }

    async fn reassemble_object(&mut self, out: &mut String) -> Result<(), StreamError> {
        out.push('{');
        let mut first = true;
        loop {
            let token = self
                .tokens
                .next_token()
                .await?
                .ok_or(StreamError::UnexpectedEof)?;
            let name = match token {
                JsonToken::ObjectEnd => break,
                JsonToken::PropertyName(name) => name,
                other => {
                    // Not a property: hand it back and treat the object as done.
                    self.tokens.push_back(other);
                    break;
                }
            };

            if !first {
                out.push(',');
            }
            first = false;
            write_json_string(out, &name);
            out.push(':');

            let value = self
                .tokens
                .next_token()
                .await?
                .ok_or(StreamError::UnexpectedEof)?;
            self.reassemble_value(value, out).await?;
        }
        out.push('}');
        Ok(())
    }
}

/// Append a JSON-escaped string literal.
fn write_json_string(out: &mut String, text: &str) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
