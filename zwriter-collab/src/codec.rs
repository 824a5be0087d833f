//! Frame codec: size limits and optional LZ4 compression.
//!
//! Which framing a connection uses is decided by the WebSocket sub-protocol
//! negotiated during the handshake:
//! ```text
//! zwriter-sync.v1       frame = message
//! zwriter-sync.v1+lz4   frame = flag(u8) │ body
//!                         flag 0 → body is the message
//!                         flag 1 → body is LZ4 (u32 LE size prefix + block)
//! ```
//! Bodies shorter than the compression threshold are sent raw so small
//! awareness updates do not pay the LZ4 overhead.

use zwriter_crdt::DecodeError;

use crate::error::CollabError;
use crate::protocol::SyncMessage;

pub const SUBPROTOCOL_PLAIN: &str = "zwriter-sync.v1";
pub const SUBPROTOCOL_LZ4: &str = "zwriter-sync.v1+lz4";

/// Value a client puts in `Sec-WebSocket-Protocol`, preferred first.
pub const OFFERED_SUBPROTOCOLS: &str = "zwriter-sync.v1+lz4, zwriter-sync.v1";

const FLAG_RAW: u8 = 0;
const FLAG_LZ4: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lz4 { threshold: usize },
}

/// Pick the sub-protocol to answer a client's `Sec-WebSocket-Protocol` offer with.
///
/// Returns `None` when nothing we speak was offered.
pub fn negotiate(offered: Option<&str>) -> Option<&'static str> {
    let offered: Vec<&str> = offered?.split(',').map(str::trim).collect();
    if offered.contains(&SUBPROTOCOL_LZ4) {
        Some(SUBPROTOCOL_LZ4)
    } else if offered.contains(&SUBPROTOCOL_PLAIN) {
        Some(SUBPROTOCOL_PLAIN)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    compression: Compression,
    max_message_size: usize,
}

impl FrameCodec {
    pub fn new(compression: Compression, max_message_size: usize) -> Self {
        Self {
            compression,
            max_message_size,
        }
    }

    /// Codec for the negotiated sub-protocol (`None` = plain framing).
    pub fn for_subprotocol(
        subprotocol: Option<&str>,
        compression_threshold: usize,
        max_message_size: usize,
    ) -> Self {
        let compression = match subprotocol {
            Some(SUBPROTOCOL_LZ4) => Compression::Lz4 {
                threshold: compression_threshold,
            },
            _ => Compression::None,
        };
        Self::new(compression, max_message_size)
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Wrap an encoded message body into a frame.
    pub fn encode(&self, body: &[u8]) -> Vec<u8> {
        match self.compression {
            Compression::None => body.to_vec(),
            Compression::Lz4 { threshold } if body.len() >= threshold => {
                let compressed = lz4_flex::compress_prepend_size(body);
                let mut frame = Vec::with_capacity(compressed.len() + 1);
                frame.push(FLAG_LZ4);
                frame.extend_from_slice(&compressed);
                frame
            }
            Compression::Lz4 { .. } => {
                let mut frame = Vec::with_capacity(body.len() + 1);
                frame.push(FLAG_RAW);
                frame.extend_from_slice(body);
                frame
            }
        }
    }

    /// Unwrap a frame into the message body, enforcing the size limit on
    /// both the frame and the decompressed body.
    pub fn decode(&self, frame: &[u8]) -> Result<Vec<u8>, CollabError> {
        self.check_size(frame.len())?;
        match self.compression {
            Compression::None => Ok(frame.to_vec()),
            Compression::Lz4 { .. } => match frame.split_first() {
                Some((&FLAG_RAW, body)) => Ok(body.to_vec()),
                Some((&FLAG_LZ4, body)) => {
                    let declared = body
                        .get(..4)
                        .and_then(|prefix| prefix.try_into().ok())
                        .map(u32::from_le_bytes)
                        .ok_or_else(|| malformed("truncated lz4 size prefix"))?;
                    self.check_size(declared as usize)?;
                    lz4_flex::decompress_size_prepended(body)
                        .map_err(|e| malformed(&format!("lz4: {e}")))
                }
                Some((flag, _)) => Err(malformed(&format!("unknown frame flag {flag}"))),
                None => Err(malformed("empty frame")),
            },
        }
    }

    pub fn encode_message(&self, msg: &SyncMessage) -> Result<Vec<u8>, CollabError> {
        Ok(self.encode(&msg.encode()?))
    }

    pub fn decode_message(&self, frame: &[u8]) -> Result<SyncMessage, CollabError> {
        let body = self.decode(frame)?;
        Ok(SyncMessage::decode(&body)?)
    }

    fn check_size(&self, size: usize) -> Result<(), CollabError> {
        if size > self.max_message_size {
            return Err(CollabError::CapacityExceeded {
                size,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }
}

fn malformed(reason: &str) -> CollabError {
    CollabError::Decode(DecodeError::Malformed(reason.to_string()))
}
