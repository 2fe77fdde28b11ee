//! Framing and message types of the time-series engine protocol.
//!
//! Every frame is a 4-byte big-endian body length followed by a bincode body.
//! A request carries an echo tag that the engine copies into each response frame;
//! record responses may span several frames, the last one flagged `is_final`.

use crate::error::{GilesError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are rejected before allocation.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Status code of a successful response.
pub const STATUS_OK: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub time: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    InsertValues { uuid: [u8; 16], sync: bool, values: Vec<RawRecord> },
    QueryStandardValues { uuid: [u8; 16], start: i64, end: i64 },
    QueryNearestValue { uuid: [u8; 16], time: i64, backward: bool },
    DeleteValues { uuid: [u8; 16], start: i64, end: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub echo_tag: u64,
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    Void,
    Records,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub echo_tag: u64,
    pub status_code: u32,
    pub which: ResponseKind,
    pub records: Vec<RawRecord>,
    pub is_final: bool,
}

impl Response {
    pub fn void(echo_tag: u64) -> Self {
        Self { echo_tag, status_code: STATUS_OK, which: ResponseKind::Void, records: Vec::new(), is_final: true }
    }

    pub fn records(echo_tag: u64, records: Vec<RawRecord>, is_final: bool) -> Self {
        Self { echo_tag, status_code: STATUS_OK, which: ResponseKind::Records, records, is_final }
    }

    pub fn error(echo_tag: u64, status_code: u32) -> Self {
        Self { echo_tag, status_code, which: ResponseKind::Void, records: Vec::new(), is_final: true }
    }
}

/// Serializes `message` into `buf`, replacing its contents.
pub fn encode_into<T: Serialize>(message: &T, buf: &mut Vec<u8>) -> Result<()> {
    buf.clear();
    bincode::serialize_into(&mut *buf, message)?;
    Ok(())
}

pub fn decode<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(body)?)
}

/// Writes one length-prefixed frame and flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    if body.len() > MAX_FRAME_LEN {
        return Err(GilesError::Codec(format!("frame of {} bytes exceeds limit", body.len())));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame into `buf`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> Result<()> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(GilesError::Codec(format!("frame of {} bytes exceeds limit", len)));
    }
    buf.resize(len, 0);
    reader.read_exact(buf).await?;
    Ok(())
}

/// Reusable frame buffers, so inserts do not allocate per flush.
pub struct FramePool {
    buffers: Mutex<Vec<Vec<u8>>>,
    retain: usize,
    frame_capacity: usize,
}

impl FramePool {
    pub fn new(retain: usize, frame_capacity: usize) -> Self {
        let buffers = (0..retain).map(|_| Vec::with_capacity(frame_capacity)).collect();
        Self { buffers: Mutex::new(buffers), retain, frame_capacity }
    }

    pub fn take(&self) -> Vec<u8> {
        let reused = match self.buffers.lock() {
            Ok(mut buffers) => buffers.pop(),
            Err(_) => None,
        };
        reused.unwrap_or_else(|| Vec::with_capacity(self.frame_capacity))
    }

    pub fn give(&self, mut buf: Vec<u8>) {
        buf.clear();
        if let Ok(mut buffers) = self.buffers.lock() {
            if buffers.len() < self.retain {
                buffers.push(buf);
            }
        }
    }

    pub fn idle(&self) -> usize {
        self.buffers.lock().map(|b| b.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let request = Request {
            echo_tag: 9,
            command: Command::QueryNearestValue { uuid: [7; 16], time: 42, backward: true },
        };
        let mut body = Vec::new();
        encode_into(&request, &mut body).unwrap();
        write_frame(&mut client, &body).await.unwrap();

        let mut received = Vec::new();
        read_frame(&mut server, &mut received).await.unwrap();
        let decoded: Request = decode(&received).unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32((MAX_FRAME_LEN + 1) as u32).await.unwrap();
        let mut buf = Vec::new();
        assert!(matches!(read_frame(&mut server, &mut buf).await, Err(GilesError::Codec(_))));
    }

    #[test]
    fn test_frame_pool_reuses_buffers() {
        let pool = FramePool::new(2, 128);
        let a = pool.take();
        let b = pool.take();
        let c = pool.take();
        assert_eq!(pool.idle(), 0);
        pool.give(a);
        pool.give(b);
        pool.give(c);
        assert_eq!(pool.idle(), 2);
        assert!(pool.take().capacity() >= 128);
    }
}
