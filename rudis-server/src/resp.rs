//! # Wire Codec
//!
//! Purpose: Tokenize inbound command lines and build RESP-framed replies.
//!
//! Inbound commands are single LF-terminated lines with whitespace-separated
//! arguments; single or double quotes group an argument containing spaces.
//! The tokenizer retains the outer quotes — the dispatcher strips them with
//! [`unquote`] — so handlers can distinguish a quoted empty string from a
//! missing argument.
//!
//! Replies use RESP framing: `+` simple, `-` error, `:` integer, `$` bulk
//! (with `$-1\r\n` for absent), `*` array.

use rudis_common::{RudisError, RudisResult};

/// Splits a command line into tokens, keeping surrounding quotes.
pub fn tokenize(line: &[u8]) -> RudisResult<Vec<Vec<u8>>> {
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        if b == b' ' || b == b'\t' || b == b'\r' {
            i += 1;
            continue;
        }
        if b == b'"' || b == b'\'' {
            let quote = b;
            let start = i;
            i += 1;
            while i < line.len() && line[i] != quote {
                i += 1;
            }
            if i >= line.len() {
                return Err(RudisError::Protocol("unterminated quote".to_string()));
            }
            i += 1; // consume the closing quote
            tokens.push(line[start..i].to_vec());
        } else {
            let start = i;
            while i < line.len() && line[i] != b' ' && line[i] != b'\t' && line[i] != b'\r' {
                i += 1;
            }
            tokens.push(line[start..i].to_vec());
        }
    }
    Ok(tokens)
}

/// Strips one layer of matching outer quotes, preserving the bytes inside.
pub fn unquote(token: &[u8]) -> &[u8] {
    if token.len() >= 2 {
        let first = token[0];
        let last = token[token.len() - 1];
        if first == last && (first == b'"' || first == b'\'') {
            return &token[1..token.len() - 1];
        }
    }
    token
}

pub fn simple(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 3);
    buf.push(b'+');
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn error(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 3);
    buf.push(b'-');
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn integer(value: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(b':');
    buf.extend_from_slice(value.to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn bulk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 16);
    buf.push(b'$');
    buf.extend_from_slice(data.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn null_bulk() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

/// Array of bulk strings.
pub fn array<I, T>(items: I) -> Vec<u8>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let items: Vec<T> = items.into_iter().collect();
    let mut buf = Vec::new();
    buf.push(b'*');
    buf.extend_from_slice(items.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    for item in items {
        buf.extend_from_slice(&bulk(item.as_ref()));
    }
    buf
}

/// Renders a sorted-set score the way `ZSCORE`/`WITHSCORES` replies expect:
/// integral scores keep a trailing `.0`.
pub fn format_score(score: f64) -> String {
    format!("{score:?}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_plain_arguments() {
        let tokens = tokenize(b"SET key value").unwrap();
        assert_eq!(tokens, vec![b"SET".to_vec(), b"key".to_vec(), b"value".to_vec()]);
    }

    #[test]
    fn quotes_group_and_are_retained() {
        let tokens = tokenize(b"SET key \"a b c\"").unwrap();
        assert_eq!(tokens[2], b"\"a b c\"".to_vec());
        assert_eq!(unquote(&tokens[2]), b"a b c");

        let tokens = tokenize(b"ECHO 'single quoted'").unwrap();
        assert_eq!(unquote(&tokens[1]), b"single quoted");
    }

    #[test]
    fn unterminated_quote_is_a_protocol_error() {
        assert!(tokenize(b"SET key \"oops").is_err());
    }

    #[test]
    fn repeated_whitespace_collapses() {
        let tokens = tokenize(b"  DEL   a  b\r").unwrap();
        assert_eq!(tokens, vec![b"DEL".to_vec(), b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn unquote_leaves_bare_tokens_alone() {
        assert_eq!(unquote(b"plain"), b"plain");
        assert_eq!(unquote(b"\"\""), b"");
        assert_eq!(unquote(b"'"), b"'");
    }

    #[test]
    fn reply_frames_are_bit_exact() {
        assert_eq!(simple("OK"), b"+OK\r\n".to_vec());
        assert_eq!(error("ERR nope"), b"-ERR nope\r\n".to_vec());
        assert_eq!(integer(-2), b":-2\r\n".to_vec());
        assert_eq!(bulk(b"bar"), b"$3\r\nbar\r\n".to_vec());
        assert_eq!(null_bulk(), b"$-1\r\n".to_vec());
        assert_eq!(
            array([b"c".as_ref(), b"b".as_ref(), b"a".as_ref()]),
            b"*3\r\n$1\r\nc\r\n$1\r\nb\r\n$1\r\na\r\n".to_vec()
        );
        assert_eq!(array::<_, &[u8]>([]), b"*0\r\n".to_vec());
    }

    #[test]
    fn scores_render_with_decimal_point() {
        assert_eq!(format_score(1.0), "1.0");
        assert_eq!(format_score(2.5), "2.5");
        assert_eq!(format_score(-3.0), "-3.0");
    }
}
