//! RESP2 wire codec
//!
//! Requests are always sent as an array of bulk strings. Replies are parsed
//! into [`RespValue`] without recursion: nested arrays are assembled on an
//! explicit stack so a deeply nested reply cannot blow the task's stack.
//!
//! ```text
//! +OK\r\n                      simple string
//! -ERR message\r\n             error
//! :42\r\n                      integer
//! $5\r\nhello\r\n              bulk string ($-1 = nil)
//! *2\r\n$1\r\na\r\n$1\r\nb\r\n array (*-1 = nil)
//! ```

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::StoreError;

/// Largest bulk string accepted from a backend (512 MiB, Redis' own limit)
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// A parsed RESP2 reply
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Short type name, used in error messages
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Simple(_) => "simple-string",
            Self::Error(_) => "error",
            Self::Integer(_) => "integer",
            Self::Bulk(None) => "nil",
            Self::Bulk(Some(_)) => "bulk-string",
            Self::Array(None) => "nil-array",
            Self::Array(Some(_)) => "array",
        }
    }

    /// Turn an error reply into `Err`, pass everything else through
    pub fn into_result(self) -> Result<Self, StoreError> {
        match self {
            Self::Error(message) => Err(StoreError::Server(message)),
            other => Ok(other),
        }
    }
}

/// Encode a command as a RESP array of bulk strings
#[must_use]
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let payload: usize = args.iter().map(|a| a.len() + 16).sum();
    let mut out = Vec::with_capacity(16 + payload);
    out.push(b'*');
    out.extend_from_slice(args.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        out.extend_from_slice(arg.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Read one CRLF-terminated header line, without the terminator
async fn read_line<R>(reader: &mut R) -> Result<Vec<u8>, StoreError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(32);
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(StoreError::Io(std::io::Error::from(
            std::io::ErrorKind::UnexpectedEof,
        )));
    }
    if !line.ends_with(b"\r\n") {
        return Err(StoreError::Protocol(format!(
            "reply line not CRLF terminated: {:?}",
            String::from_utf8_lossy(&line)
        )));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn parse_int(raw: &[u8]) -> Result<i64, StoreError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            StoreError::Protocol(format!(
                "invalid integer in reply: {:?}",
                String::from_utf8_lossy(raw)
            ))
        })
}

/// Read one complete reply from the stream
pub async fn read_value<R>(reader: &mut R) -> Result<RespValue, StoreError>
where
    R: AsyncBufRead + Unpin,
{
    // (expected length, collected items) for each array still being filled
    let mut stack: Vec<(usize, Vec<RespValue>)> = Vec::new();

    loop {
        let line = read_line(reader).await?;
        let Some((&marker, rest)) = line.split_first() else {
            return Err(StoreError::Protocol("empty reply line".into()));
        };

        let mut value = match marker {
            b'+' => RespValue::Simple(String::from_utf8_lossy(rest).into_owned()),
            b'-' => RespValue::Error(String::from_utf8_lossy(rest).into_owned()),
            b':' => RespValue::Integer(parse_int(rest)?),
            b'$' => {
                let len = parse_int(rest)?;
                if len < 0 {
                    RespValue::Bulk(None)
                } else {
                    let len = len as usize;
                    if len > MAX_BULK_LEN {
                        return Err(StoreError::Protocol(format!(
                            "bulk string of {} bytes exceeds limit",
                            len
                        )));
                    }
                    let mut data = vec![0u8; len + 2];
                    reader.read_exact(&mut data).await?;
                    if !data.ends_with(b"\r\n") {
                        return Err(StoreError::Protocol(
                            "bulk string not CRLF terminated".into(),
                        ));
                    }
                    data.truncate(len);
                    RespValue::Bulk(Some(data))
                }
            }
            b'*' => {
                let len = parse_int(rest)?;
                if len < 0 {
                    RespValue::Array(None)
                } else if len == 0 {
                    RespValue::Array(Some(Vec::new()))
                } else {
                    let len = len as usize;
                    stack.push((len, Vec::with_capacity(len.min(1024))));
                    continue;
                }
            }
            other => {
                return Err(StoreError::Protocol(format!(
                    "unknown reply marker {:?}",
                    other as char
                )));
            }
        };

        // Fold the finished value into its parent arrays
        loop {
            match stack.pop() {
                None => return Ok(value),
                Some((expected, mut items)) => {
                    items.push(value);
                    if items.len() < expected {
                        stack.push((expected, items));
                        break;
                    }
                    value = RespValue::Array(Some(items));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(bytes: &[u8]) -> Result<RespValue, StoreError> {
        let mut reader = bytes;
        read_value(&mut reader).await
    }

    #[test]
    fn test_encode_command() {
        let encoded = encode_command(&[b"SET", b"key", b"value"]);
        assert_eq!(
            encoded,
            b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n".to_vec()
        );
    }

    #[test]
    fn test_encode_binary_argument() {
        let encoded = encode_command(&[b"APPEND", b"k", &[0x92, 0x00, 0x0d, 0x0a]]);
        assert_eq!(
            encoded,
            b"*3\r\n$6\r\nAPPEND\r\n$1\r\nk\r\n$4\r\n\x92\x00\r\n\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_parse_simple_and_error() {
        assert_eq!(
            parse(b"+OK\r\n").await.unwrap(),
            RespValue::Simple("OK".into())
        );
        assert_eq!(
            parse(b"-ERR bad\r\n").await.unwrap(),
            RespValue::Error("ERR bad".into())
        );
    }

    #[tokio::test]
    async fn test_parse_integer() {
        assert_eq!(parse(b":-12\r\n").await.unwrap(), RespValue::Integer(-12));
        assert!(matches!(
            parse(b":abc\r\n").await,
            Err(StoreError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_parse_bulk() {
        assert_eq!(
            parse(b"$5\r\nhello\r\n").await.unwrap(),
            RespValue::Bulk(Some(b"hello".to_vec()))
        );
        assert_eq!(parse(b"$-1\r\n").await.unwrap(), RespValue::Bulk(None));
        // payload may itself contain CRLF
        assert_eq!(
            parse(b"$4\r\na\r\nb\r\n").await.unwrap(),
            RespValue::Bulk(Some(b"a\r\nb".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_parse_nested_array() {
        let value = parse(b"*2\r\n*2\r\n:1\r\n$-1\r\n+x\r\n").await.unwrap();
        assert_eq!(
            value,
            RespValue::Array(Some(vec![
                RespValue::Array(Some(vec![RespValue::Integer(1), RespValue::Bulk(None)])),
                RespValue::Simple("x".into()),
            ]))
        );
    }

    #[tokio::test]
    async fn test_parse_empty_and_nil_arrays() {
        assert_eq!(parse(b"*0\r\n").await.unwrap(), RespValue::Array(Some(vec![])));
        assert_eq!(parse(b"*-1\r\n").await.unwrap(), RespValue::Array(None));
    }

    #[tokio::test]
    async fn test_parse_truncated_stream() {
        assert!(matches!(parse(b"$5\r\nhel").await, Err(StoreError::Io(_))));
        assert!(matches!(parse(b"").await, Err(StoreError::Io(_))));
    }

    #[tokio::test]
    async fn test_parse_rejects_unknown_marker() {
        assert!(matches!(
            parse(b"?what\r\n").await,
            Err(StoreError::Protocol(_))
        ));
    }

    #[test]
    fn test_into_result() {
        assert!(RespValue::Error("ERR".into()).into_result().is_err());
        assert!(RespValue::Integer(1).into_result().is_ok());
    }
}
