//! Framed JSON-RPC control channel.
//!
//! After the `"RPC\0"` preamble both directions exchange JSON messages
//! with a 4-byte big-endian length prefix. Lengths outside
//! `1..=MAX_MESSAGE_BYTES` abort the connection. A connection serves
//! calls strictly sequentially; the client holds one mutex across the
//! send and receive of a call.

use crate::error::{ProbeError, Result};
use common::{ErrorCode, RpcError, RpcRequest, RpcResponse, MAX_MESSAGE_BYTES, RPC_PREAMBLE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Read one length-prefixed JSON message.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<serde_json::Value> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    if len == 0 || len > MAX_MESSAGE_BYTES {
        return Err(ProbeError::Protocol(format!(
            "Message length {} outside 1..={}",
            len, MAX_MESSAGE_BYTES
        )));
    }

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;
    Ok(serde_json::from_slice(&data)?)
}

/// Write one length-prefixed JSON message.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: &serde_json::Value,
) -> Result<()> {
    let data = serde_json::to_vec(value)?;
    if data.len() as u32 > MAX_MESSAGE_BYTES {
        return Err(ProbeError::Protocol(format!(
            "Refusing to send {} byte message",
            data.len()
        )));
    }
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// A server-side method failure, answered as a JSON-RPC error while the
/// connection stays alive.
#[derive(Debug, Clone)]
pub struct RpcFailure {
    pub code: ErrorCode,
    pub detail: Option<String>,
}

impl RpcFailure {
    pub fn new(code: ErrorCode) -> Self {
        Self { code, detail: None }
    }

    pub fn with(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: Some(detail.into()),
        }
    }

    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.code.code(),
            message: match &self.detail {
                Some(d) => format!("{}: {}", self.code.message(), d),
                None => self.code.message().to_string(),
            },
            data: None,
        }
    }
}

impl From<serde_json::Error> for RpcFailure {
    fn from(e: serde_json::Error) -> Self {
        RpcFailure::with(ErrorCode::InvalidParams, e.to_string())
    }
}

/// Client side of the control channel. One outstanding call at a time;
/// the stream mutex is held across send and receive, bounded by the
/// per-call deadline.
pub struct RpcClient {
    stream: Mutex<TcpStream>,
    next_id: AtomicU64,
    call_timeout: Duration,
}

impl RpcClient {
    /// Dial the control connection and send the protocol preamble.
    pub async fn connect(
        addr: std::net::SocketAddr,
        dial_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Self> {
        let mut stream = tokio::time::timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProbeError::Timeout(format!("dial {}", addr)))??;
        stream.set_nodelay(true)?;
        stream.write_all(&RPC_PREAMBLE).await?;
        stream.flush().await?;

        Ok(Self {
            stream: Mutex::new(stream),
            next_id: AtomicU64::new(1),
            call_timeout,
        })
    }

    /// Issue one call and wait for its response.
    pub async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(method, params, id);

        let mut stream = self.stream.lock().await;
        let response = tokio::time::timeout(self.call_timeout, async {
            write_message(&mut *stream, &serde_json::to_value(&request)?).await?;
            read_message(&mut *stream).await
        })
        .await
        .map_err(|_| ProbeError::Timeout(format!("call {}", method)))??;
        drop(stream);

        let response: RpcResponse = serde_json::from_value(response)?;
        if response.id != id {
            return Err(ProbeError::Protocol(format!(
                "Response id {} does not match request id {}",
                response.id, id
            )));
        }
        if let Some(err) = response.error {
            return Err(ProbeError::from_rpc(err));
        }
        response
            .result
            .ok_or_else(|| ProbeError::Protocol("Response carries neither result nor error".into()))
    }

    /// Typed convenience wrapper around [`RpcClient::call`].
    pub async fn call_as<P: serde::Serialize, R: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<R> {
        let result = self.call(method, serde_json::to_value(params)?).await?;
        Ok(serde_json::from_value(result)?)
    }
}
