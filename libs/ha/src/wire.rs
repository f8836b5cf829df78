//! Peer framing: 4-byte big-endian length, 1-byte message type, 32-byte
//! HMAC-SHA256 tag over type+payload, then the serialized payload. Both
//! sides share a pre-configured secret; a frame that fails the tag check
//! tears the connection down.
use std::net::Ipv4Addr;

use config::Role;
use hmac::{Hmac, Mac};
use lease_store::{ConflictRecord, Lease};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::HaError;

pub const PROTOCOL_VERSION: u16 = 1;

const TAG_LEN: usize = 32;
/// a full snapshot chunk stays well under this
const MAX_FRAME: usize = 4 * 1024 * 1024;

type HmacSha256 = Hmac<Sha256>;

/// one lease table change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseDelta {
    Put(Lease),
    Delete(Ipv4Addr),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    Hello {
        role: Role,
        server_id: String,
        version: u16,
    },
    Heartbeat {
        seq: u64,
    },
    LeaseUpdate {
        deltas: Vec<LeaseDelta>,
    },
    ConflictUpdate {
        records: Vec<ConflictRecord>,
    },
    ConfigSync {
        section: String,
        bytes: Vec<u8>,
    },
    FullConfigSync {
        sections: Vec<(String, Vec<u8>)>,
    },
    SnapshotRequest,
    SnapshotChunk {
        leases: Vec<Lease>,
        conflicts: Vec<ConflictRecord>,
        fin: bool,
    },
    FailoverDeclare,
    Bye,
}

impl PeerMessage {
    pub fn type_byte(&self) -> u8 {
        match self {
            PeerMessage::Hello { .. } => 1,
            PeerMessage::Heartbeat { .. } => 2,
            PeerMessage::LeaseUpdate { .. } => 3,
            PeerMessage::ConflictUpdate { .. } => 4,
            PeerMessage::ConfigSync { .. } => 5,
            PeerMessage::FullConfigSync { .. } => 6,
            PeerMessage::SnapshotRequest => 7,
            PeerMessage::SnapshotChunk { .. } => 8,
            PeerMessage::FailoverDeclare => 9,
            PeerMessage::Bye => 10,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::Hello { .. } => "hello",
            PeerMessage::Heartbeat { .. } => "heartbeat",
            PeerMessage::LeaseUpdate { .. } => "lease_update",
            PeerMessage::ConflictUpdate { .. } => "conflict_update",
            PeerMessage::ConfigSync { .. } => "config_sync",
            PeerMessage::FullConfigSync { .. } => "full_config_sync",
            PeerMessage::SnapshotRequest => "snapshot_request",
            PeerMessage::SnapshotChunk { .. } => "snapshot_chunk",
            PeerMessage::FailoverDeclare => "failover_declare",
            PeerMessage::Bye => "bye",
        }
    }
}

/// Stateless encoder/decoder bound to the shared secret.
#[derive(Clone)]
pub struct FrameCodec {
    secret: Vec<u8>,
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec").finish()
    }
}

impl FrameCodec {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        // new_from_slice accepts any key length
        HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size")
    }

    pub fn encode(&self, msg: &PeerMessage) -> Result<Vec<u8>, HaError> {
        let payload = serde_json::to_vec(msg)?;
        let type_byte = msg.type_byte();

        let mut mac = self.mac();
        mac.update(&[type_byte]);
        mac.update(&payload);
        let tag = mac.finalize().into_bytes();

        let body_len = 1 + TAG_LEN + payload.len();
        if body_len > MAX_FRAME {
            return Err(HaError::FrameTooLarge(body_len));
        }
        let mut frame = Vec::with_capacity(4 + body_len);
        frame.extend_from_slice(&(body_len as u32).to_be_bytes());
        frame.push(type_byte);
        frame.extend_from_slice(&tag);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn decode(&self, body: &[u8]) -> Result<PeerMessage, HaError> {
        if body.len() < 1 + TAG_LEN {
            return Err(HaError::Auth);
        }
        let type_byte = body[0];
        let tag = &body[1..1 + TAG_LEN];
        let payload = &body[1 + TAG_LEN..];

        let mut mac = self.mac();
        mac.update(&[type_byte]);
        mac.update(payload);
        mac.verify_slice(tag).map_err(|_| HaError::Auth)?;

        let msg: PeerMessage = serde_json::from_slice(payload)?;
        if msg.type_byte() != type_byte {
            return Err(HaError::Auth);
        }
        Ok(msg)
    }

    pub async fn write_frame<W: AsyncWrite + Unpin>(
        &self,
        w: &mut W,
        msg: &PeerMessage,
    ) -> Result<(), HaError> {
        let frame = self.encode(msg)?;
        w.write_all(&frame).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn read_frame<R: AsyncRead + Unpin>(&self, r: &mut R) -> Result<PeerMessage, HaError> {
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME {
            return Err(HaError::FrameTooLarge(len));
        }
        let mut body = vec![0u8; len];
        r.read_exact(&mut body).await?;
        self.decode(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::new("swordfish")
    }

    #[test]
    fn roundtrip_all_types() {
        let c = codec();
        let msgs = vec![
            PeerMessage::Hello {
                role: Role::Primary,
                server_id: "athena-1".into(),
                version: PROTOCOL_VERSION,
            },
            PeerMessage::Heartbeat { seq: 42 },
            PeerMessage::LeaseUpdate {
                deltas: vec![LeaseDelta::Delete([10, 0, 0, 7].into())],
            },
            PeerMessage::ConfigSync {
                section: "subnets".into(),
                bytes: b"[]".to_vec(),
            },
            PeerMessage::SnapshotRequest,
            PeerMessage::SnapshotChunk {
                leases: vec![],
                conflicts: vec![],
                fin: true,
            },
            PeerMessage::FailoverDeclare,
            PeerMessage::Bye,
        ];
        for msg in msgs {
            let frame = c.encode(&msg).unwrap();
            let body = &frame[4..];
            assert_eq!(body[0], msg.type_byte());
            assert_eq!(c.decode(body).unwrap(), msg);
        }
    }

    #[test]
    fn tampered_frame_rejected() {
        let c = codec();
        let mut frame = c.encode(&PeerMessage::Heartbeat { seq: 1 }).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(c.decode(&frame[4..]), Err(HaError::Auth)));
    }

    #[test]
    fn wrong_secret_rejected() {
        let frame = codec().encode(&PeerMessage::Bye).unwrap();
        let other = FrameCodec::new("not-swordfish");
        assert!(matches!(other.decode(&frame[4..]), Err(HaError::Auth)));
    }

    #[test]
    fn mismatched_type_byte_rejected() {
        let c = codec();
        let mut frame = c.encode(&PeerMessage::Bye).unwrap();
        // flip the declared type; tag was computed over the original
        frame[4] = PeerMessage::SnapshotRequest.type_byte();
        assert!(matches!(c.decode(&frame[4..]), Err(HaError::Auth)));
    }

    #[tokio::test]
    async fn async_frame_io() {
        let c = codec();
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = PeerMessage::Heartbeat { seq: 7 };
        c.write_frame(&mut a, &msg).await.unwrap();
        assert_eq!(c.read_frame(&mut b).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let c = codec();
        let (mut a, mut b) = tokio::io::duplex(64);
        let bogus = ((MAX_FRAME + 1) as u32).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &bogus)
            .await
            .unwrap();
        assert!(matches!(
            c.read_frame(&mut b).await,
            Err(HaError::FrameTooLarge(_))
        ));
    }
}
