//! The control-protocol envelope: one JSON object per message, newline
//! framed. `attach` is the only request type after which the connection
//! switches from framed envelopes to a raw byte stream (§6).

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Request {
    pub fn new(kind: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            kind: kind.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub output: String,
}

impl Response {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            message: String::new(),
            output: output.into(),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: message.into(),
            output: String::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, Status::Error)
    }
}

/// Read one newline-delimited JSON envelope from `reader`.
///
/// Returns `Ok(None)` on a clean EOF before any bytes arrive (peer closed).
pub async fn read_envelope<T, R>(reader: &mut BufReader<R>) -> std::io::Result<Option<T>>
where
    T: for<'de> Deserialize<'de>,
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    let value = serde_json::from_str(line.trim_end())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Write one envelope, newline terminated, and flush.
pub async fn write_envelope<T, W>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    T: Serialize,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_request_and_response() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut server_read, mut server_write) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);

        let req = Request::new("ps", vec![]);
        write_envelope(&mut client_write, &req).await.unwrap();

        let mut reader = BufReader::new(&mut server_read);
        let got: Request = read_envelope(&mut reader).await.unwrap().unwrap();
        assert_eq!(got.kind, "ps");

        let resp = Response::ok("NAME PID UPTIME\n");
        write_envelope(&mut server_write, &resp).await.unwrap();
    }

    #[test]
    fn response_serializes_with_expected_field_names() {
        let resp = Response::err("boom");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["message"], "boom");
    }
}
