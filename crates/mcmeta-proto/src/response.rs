use std::io::BufRead;

use bytes::Bytes;
use tracing::debug;

use crate::{Flag, ProtoError};

/// Two-letter response codes plus the three free-form error lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// `HD`: success without a value.
    Success,
    /// `VA <size>`: success, a value frame follows.
    Value,
    /// `EN`: get miss.
    Miss,
    /// `NS`: not stored.
    NotStored,
    /// `EX`: cas mismatch, item exists.
    Exists,
    /// `NF`: not found (delete / arithmetic).
    NotFound,
    /// `MN`: no-op echo.
    NoOp,
    /// `ME`: debug metadata line.
    Debug,
    /// `SERVER_ERROR <msg>`
    ServerError,
    /// `CLIENT_ERROR <msg>`
    ClientError,
    /// `ERROR [<msg>]`
    Error,
}

impl Status {
    fn from_token(token: &[u8]) -> Option<Self> {
        Some(match token {
            b"HD" => Status::Success,
            b"VA" => Status::Value,
            b"EN" => Status::Miss,
            b"NS" => Status::NotStored,
            b"EX" => Status::Exists,
            b"NF" => Status::NotFound,
            b"MN" => Status::NoOp,
            b"ME" => Status::Debug,
            b"SERVER_ERROR" => Status::ServerError,
            b"CLIENT_ERROR" => Status::ClientError,
            b"ERROR" => Status::Error,
            _ => return None,
        })
    }

    /// True for the three free-form error lines.
    pub fn is_error_line(self) -> bool {
        matches!(self, Status::ServerError | Status::ClientError | Status::Error)
    }
}

/// One parsed response frame.
#[derive(Clone, Debug)]
pub struct Response {
    pub status: Status,
    pub flags: Vec<Flag>,
    pub value: Option<Bytes>,
    /// Error-line text, or the raw remainder of an `ME` line.
    pub message: Option<String>,
}

impl Response {
    /// Last occurrence wins for duplicated flags.
    pub fn flag(&self, letter: u8) -> Option<&Flag> {
        self.flags.iter().rev().find(|f| f.letter() == letter)
    }

    /// The echoed `O` opaque token, if any.
    pub fn opaque(&self) -> Option<&[u8]> {
        self.flag(b'O').map(Flag::token)
    }

    /// The echoed `k` key, if any.
    pub fn key(&self) -> Option<&[u8]> {
        self.flag(b'k').map(Flag::token)
    }

    pub fn cas(&self) -> Option<u64> {
        self.numeric_flag(b'c')
    }

    pub fn size(&self) -> Option<u64> {
        self.numeric_flag(b's')
    }

    pub fn client_flags(&self) -> Option<u32> {
        self.numeric_flag(b'f')
    }

    pub fn ttl(&self) -> Option<i64> {
        self.numeric_flag(b't')
    }

    fn numeric_flag<T: std::str::FromStr>(&self, letter: u8) -> Option<T> {
        let token = self.flag(letter)?.token();
        std::str::from_utf8(token).ok()?.parse().ok()
    }
}

/// Reads one response frame from a buffered reader.
///
/// For `VA` the exact advertised number of value bytes plus a CRLF
/// terminator are consumed before returning; a short read or a missing
/// terminator leaves the stream unusable and is reported as a framing error.
pub fn read_response(reader: &mut impl BufRead) -> Result<Response, ProtoError> {
    let line = read_line(reader)?;
    let mut tokens = line.split(|&b| b == b' ');
    let leading = tokens.next().unwrap_or_default();

    let Some(status) = Status::from_token(leading) else {
        debug!(token = %String::from_utf8_lossy(leading), "unknown leading response token");
        return Err(ProtoError::UnexpectedToken(String::from_utf8_lossy(leading).into_owned()));
    };

    match status {
        Status::Value => {
            let size_token = tokens.next().unwrap_or_default();
            let size: usize = std::str::from_utf8(size_token)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    ProtoError::BadValueSize(String::from_utf8_lossy(size_token).into_owned())
                })?;
            let flags = parse_flags(tokens)?;
            let value = read_value(reader, size)?;
            Ok(Response { status, flags, value: Some(value), message: None })
        }
        Status::Debug => {
            // `ME <key> <k=v> ...`: not single-letter flags, kept raw.
            let message = remainder_of(&line);
            Ok(Response { status, flags: Vec::new(), value: None, message })
        }
        Status::ServerError | Status::ClientError | Status::Error => {
            // An opaque echoed at the end of an error line still correlates.
            let flags = tokens.filter_map(|t| try_parse_opaque(t)).collect();
            let message = remainder_of(&line);
            Ok(Response { status, flags, value: None, message })
        }
        _ => {
            let flags = parse_flags(tokens)?;
            Ok(Response { status, flags, value: None, message: None })
        }
    }
}

fn read_line(reader: &mut impl BufRead) -> Result<Vec<u8>, ProtoError> {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line)?;
    if n == 0 {
        return Err(ProtoError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    if !line.ends_with(b"\r\n") {
        return Err(ProtoError::MalformedLine(String::from_utf8_lossy(&line).into_owned()));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn read_value(reader: &mut impl BufRead, size: usize) -> Result<Bytes, ProtoError> {
    let mut value = vec![0u8; size];
    let mut got = 0;
    while got < size {
        let n = reader.read(&mut value[got..])?;
        if n == 0 {
            return Err(ProtoError::ShortValueRead { wanted: size, got });
        }
        got += n;
    }

    let mut terminator = [0u8; 2];
    let mut got = 0;
    while got < 2 {
        let n = reader.read(&mut terminator[got..])?;
        if n == 0 {
            return Err(ProtoError::MissingTerminator);
        }
        got += n;
    }
    if terminator != *b"\r\n" {
        return Err(ProtoError::MissingTerminator);
    }
    Ok(Bytes::from(value))
}

fn parse_flags<'a>(tokens: impl Iterator<Item = &'a [u8]>) -> Result<Vec<Flag>, ProtoError> {
    tokens.map(Flag::parse).collect()
}

fn try_parse_opaque(token: &[u8]) -> Option<Flag> {
    match token.split_first() {
        Some((b'O', rest)) if !rest.is_empty() && rest.iter().all(u8::is_ascii_digit) => {
            Some(Flag::opaque(rest.to_vec()))
        }
        _ => None,
    }
}

fn remainder_of(line: &[u8]) -> Option<String> {
    line.iter()
        .position(|&b| b == b' ')
        .map(|at| String::from_utf8_lossy(&line[at + 1..]).into_owned())
}
