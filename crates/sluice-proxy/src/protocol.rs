//! Tagged frame codec shared by clients, the proxy and backends.
//!
//! # Frame layout
//!
//! ```text
//! [tag: 1 byte] [len: u32 big-endian, payload length] [payload: len bytes]
//! ```
//!
//! Request and row payloads are opaque to the proxy. Only the startup
//! frame and the `ReadyForQuery` status byte are interpreted.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, ProxyResult};

/// Largest payload accepted in either direction.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Tag byte plus length prefix.
pub const HEADER_LEN: usize = 5;

pub mod tag {
    pub const STARTUP: u8 = b'S';
    pub const QUERY: u8 = b'Q';
    pub const TERMINATE: u8 = b'X';
    pub const AUTH_OK: u8 = b'R';
    pub const ROW_DESCRIPTION: u8 = b'T';
    pub const DATA_ROW: u8 = b'D';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const ERROR: u8 = b'E';
    pub const READY_FOR_QUERY: u8 = b'Z';
}

/// Unit-of-work status carried by `ReadyForQuery`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    /// No unit of work open.
    Idle,
    /// Inside a unit of work.
    InTransaction,
    /// Inside a failed unit of work.
    Failed,
}

impl TxStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            TxStatus::Idle => b'I',
            TxStatus::InTransaction => b'T',
            TxStatus::Failed => b'F',
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'I' => Some(TxStatus::Idle),
            b'T' => Some(TxStatus::InTransaction),
            b'F' => Some(TxStatus::Failed),
            _ => None,
        }
    }
}

/// One decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Startup {
        user: String,
        database: String,
        password: String,
    },
    Query(Vec<u8>),
    Terminate,
    AuthOk,
    /// Column names.
    RowDescription(Vec<String>),
    DataRow(Vec<u8>),
    CommandComplete(String),
    Error(String),
    ReadyForQuery(TxStatus),
}

impl Frame {
    /// A request carrying `text`.
    pub fn query(text: &str) -> Self {
        Frame::Query(text.as_bytes().to_vec())
    }

    /// A data row of tab-separated text values.
    pub fn text_row<S: AsRef<str>>(values: &[S]) -> Self {
        let joined: Vec<&str> = values.iter().map(|v| v.as_ref()).collect();
        Frame::DataRow(joined.join("\t").into_bytes())
    }

    pub fn tag(&self) -> u8 {
        match self {
            Frame::Startup { .. } => tag::STARTUP,
            Frame::Query(_) => tag::QUERY,
            Frame::Terminate => tag::TERMINATE,
            Frame::AuthOk => tag::AUTH_OK,
            Frame::RowDescription(_) => tag::ROW_DESCRIPTION,
            Frame::DataRow(_) => tag::DATA_ROW,
            Frame::CommandComplete(_) => tag::COMMAND_COMPLETE,
            Frame::Error(_) => tag::ERROR,
            Frame::ReadyForQuery(_) => tag::READY_FOR_QUERY,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Frame::Startup {
                user,
                database,
                password,
            } => {
                let mut out = Vec::with_capacity(user.len() + database.len() + password.len() + 3);
                for field in [user, database, password] {
                    out.extend_from_slice(field.as_bytes());
                    out.push(0);
                }
                out
            }
            Frame::Query(bytes) | Frame::DataRow(bytes) => bytes.clone(),
            Frame::Terminate | Frame::AuthOk => Vec::new(),
            Frame::RowDescription(columns) => columns.join("\t").into_bytes(),
            Frame::CommandComplete(text) | Frame::Error(text) => text.as_bytes().to_vec(),
            Frame::ReadyForQuery(status) => vec![status.as_byte()],
        }
    }

    /// Serialized bytes, header included.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(self.tag());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// Build a frame from its tag and payload.
    pub fn decode(tag: u8, payload: Vec<u8>) -> ProxyResult<Self> {
        let frame = match tag {
            tag::STARTUP => {
                let mut fields = payload.split(|b| *b == 0);
                let mut next = |name: &str| -> ProxyResult<String> {
                    let raw = fields
                        .next()
                        .ok_or_else(|| ProxyError::protocol(format!("startup frame missing {name}")))?;
                    String::from_utf8(raw.to_vec())
                        .map_err(|_| ProxyError::protocol(format!("startup {name} is not UTF-8")))
                };
                let user = next("user")?;
                let database = next("database")?;
                let password = next("password")?;
                if !payload.ends_with(&[0]) {
                    return Err(ProxyError::protocol("startup frame is not NUL-terminated"));
                }
                if user.is_empty() || database.is_empty() {
                    return Err(ProxyError::protocol("startup frame needs user and database"));
                }
                Frame::Startup {
                    user,
                    database,
                    password,
                }
            }
            tag::QUERY => Frame::Query(payload),
            tag::TERMINATE => Frame::Terminate,
            tag::AUTH_OK => Frame::AuthOk,
            tag::ROW_DESCRIPTION => {
                let text = utf8(payload, "row description")?;
                if text.is_empty() {
                    Frame::RowDescription(Vec::new())
                } else {
                    Frame::RowDescription(text.split('\t').map(str::to_string).collect())
                }
            }
            tag::DATA_ROW => Frame::DataRow(payload),
            tag::COMMAND_COMPLETE => Frame::CommandComplete(utf8(payload, "command tag")?),
            tag::ERROR => Frame::Error(utf8(payload, "error message")?),
            tag::READY_FOR_QUERY => match payload.as_slice() {
                [b] => Frame::ReadyForQuery(TxStatus::from_byte(*b).ok_or_else(|| {
                    ProxyError::protocol(format!("unknown ready-for-query status {:?}", *b as char))
                })?),
                _ => return Err(ProxyError::protocol("ready-for-query payload must be 1 byte")),
            },
            other => {
                return Err(ProxyError::protocol(format!(
                    "unknown frame tag {:?}",
                    other as char
                )));
            }
        };
        Ok(frame)
    }
}

fn utf8(payload: Vec<u8>, what: &str) -> ProxyResult<String> {
    String::from_utf8(payload).map_err(|_| ProxyError::protocol(format!("{what} is not UTF-8")))
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> ProxyResult<Option<Frame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    let first = reader.read(&mut header[..1]).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..]).await?;

    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(ProxyError::protocol(format!(
            "frame payload of {len} bytes exceeds {MAX_PAYLOAD}"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Frame::decode(header[0], payload).map(Some)
}

/// Write one frame and flush. Returns the bytes written.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> ProxyResult<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = frame.encode();
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(bytes.len())
}

/// Write several frames with a single flush.
pub async fn write_frames<W>(writer: &mut W, frames: &[Frame]) -> ProxyResult<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut bytes = Vec::new();
    for frame in frames {
        bytes.extend_from_slice(&frame.encode());
    }
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(bytes.len())
}
