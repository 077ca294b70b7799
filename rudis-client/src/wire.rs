//! # Wire Encoding and Parsing
//!
//! Purpose: Encode inline command lines and parse RESP responses without
//! external dependencies, keeping allocations under control.
//!
//! Commands travel as one space-separated line; an argument containing
//! whitespace (or nothing at all) is wrapped in quotes, which the server's
//! tokenizer strips. Responses are RESP-framed.

use std::io::BufRead;

use crate::client::{ClientError, ClientResult};

/// RESP response value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays.
    Array(Vec<RespValue>),
}

/// Encodes one inline command line into the provided buffer.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(b' ');
        }
        if needs_quoting(arg) {
            let quote = if arg.contains(&b'"') { b'\'' } else { b'"' };
            out.push(quote);
            out.extend_from_slice(arg);
            out.push(quote);
        } else {
            out.extend_from_slice(arg);
        }
    }
    out.push(b'\n');
}

fn needs_quoting(arg: &[u8]) -> bool {
    arg.is_empty() || arg.iter().any(|b| *b == b' ' || *b == b'\t')
}

/// Reads one RESP value from the buffered reader.
pub fn read_response<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> ClientResult<RespValue> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(ClientError::Protocol);
    }

    match line_buf[0] {
        b'+' => Ok(RespValue::Simple(line_buf[1..].to_vec())),
        b'-' => Ok(RespValue::Error(line_buf[1..].to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_bulk_len(reader, len, line_buf)
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_array_len(reader, len, line_buf)
        }
        _ => Err(ClientError::Protocol),
    }
}

fn parse_bulk_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> ClientResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Bulk(None));
    }
    let len = len as usize;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != [b'\r', b'\n'] {
        return Err(ClientError::Protocol);
    }

    line_buf.clear();
    Ok(RespValue::Bulk(Some(data)))
}

fn parse_array_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> ClientResult<RespValue> {
    if len <= 0 {
        return Ok(RespValue::Array(Vec::new()));
    }

    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        items.push(read_response(reader, line_buf)?);
    }
    Ok(RespValue::Array(items))
}

/// Reads a line, tolerating both `\r\n` and the bare `\n` the greeting uses.
pub fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(ClientError::Protocol);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(())
}

fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    if data.is_empty() {
        return Err(ClientError::Protocol);
    }
    let mut negative = false;
    let mut idx = 0;
    if data[0] == b'-' {
        negative = true;
        idx = 1;
    }

    let mut value: i64 = 0;
    while idx < data.len() {
        let b = data[idx];
        if !b.is_ascii_digit() {
            return Err(ClientError::Protocol);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        idx += 1;
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encodes_inline_command() {
        let mut buf = Vec::new();
        encode_command(&[b"GET", b"key"], &mut buf);
        assert_eq!(&buf, b"GET key\n");
    }

    #[test]
    fn quotes_arguments_with_spaces() {
        let mut buf = Vec::new();
        encode_command(&[b"SET", b"key", b"two words"], &mut buf);
        assert_eq!(&buf, b"SET key \"two words\"\n");

        buf.clear();
        encode_command(&[b"SET", b"key", b""], &mut buf);
        assert_eq!(&buf, b"SET key \"\"\n");
    }

    #[test]
    fn parses_simple_string() {
        let mut reader = Cursor::new(b"+OK\r\n".to_vec());
        let mut line = Vec::new();
        let resp = read_response(&mut reader, &mut line).unwrap();
        assert_eq!(resp, RespValue::Simple(b"OK".to_vec()));
    }

    #[test]
    fn parses_bulk_string() {
        let mut reader = Cursor::new(b"$5\r\nhello\r\n".to_vec());
        let mut line = Vec::new();
        let resp = read_response(&mut reader, &mut line).unwrap();
        assert_eq!(resp, RespValue::Bulk(Some(b"hello".to_vec())));
    }

    #[test]
    fn parses_null_bulk_string() {
        let mut reader = Cursor::new(b"$-1\r\n".to_vec());
        let mut line = Vec::new();
        let resp = read_response(&mut reader, &mut line).unwrap();
        assert_eq!(resp, RespValue::Bulk(None));
    }

    #[test]
    fn parses_integer_and_error() {
        let mut reader = Cursor::new(b":42\r\n-ERR bad\r\n".to_vec());
        let mut line = Vec::new();
        assert_eq!(
            read_response(&mut reader, &mut line).unwrap(),
            RespValue::Integer(42)
        );
        assert_eq!(
            read_response(&mut reader, &mut line).unwrap(),
            RespValue::Error(b"ERR bad".to_vec())
        );
    }

    #[test]
    fn parses_array_of_bulks() {
        let mut reader = Cursor::new(b"*2\r\n$1\r\na\r\n$1\r\nb\r\n".to_vec());
        let mut line = Vec::new();
        let resp = read_response(&mut reader, &mut line).unwrap();
        assert_eq!(
            resp,
            RespValue::Array(vec![
                RespValue::Bulk(Some(b"a".to_vec())),
                RespValue::Bulk(Some(b"b".to_vec())),
            ])
        );
    }

    #[test]
    fn read_line_accepts_bare_newline() {
        let mut reader = Cursor::new(b"+OK Welcome\n".to_vec());
        let mut line = Vec::new();
        read_line(&mut reader, &mut line).unwrap();
        assert_eq!(line, b"+OK Welcome");
    }
}
