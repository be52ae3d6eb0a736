//! On-wire framing for the FailOverCache protocol: length-prefixed,
//! little-endian, CRC-guarded frames over a plain TCP stream.
//!
//! Frame: `op:u8 | payload_len:u32 | payload | crc32:u32` (crc32 over
//! `payload` only). An entry within an `AddEntries`/`GetEntries` payload is
//! `cl:u64 | lba:u64 | len:u32 | bytes`.

use crate::types::ClusterLocation;
use crc::crc32::{self, Hasher32};
use snafu::Snafu;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Register = 0x01,
    Unregister = 0x02,
    AddEntries = 0x03,
    GetEntries = 0x04,
    Flush = 0x05,
    Clear = 0x06,
    GetSCORange = 0x07,
    RemoveUpTo = 0x08,
    GetSCO = 0x09,
    Ok = 0x00,
    Err = 0xff,
}

impl Opcode {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0x00 => Opcode::Ok,
            0x01 => Opcode::Register,
            0x02 => Opcode::Unregister,
            0x03 => Opcode::AddEntries,
            0x04 => Opcode::GetEntries,
            0x05 => Opcode::Flush,
            0x06 => Opcode::Clear,
            0x07 => Opcode::GetSCORange,
            0x08 => Opcode::RemoveUpTo,
            0x09 => Opcode::GetSCO,
            0xff => Opcode::Err,
            _ => return None,
        })
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum WireError {
    #[snafu(display("I/O error: {message}"))]
    Io { message: String },
    #[snafu(display("unrecognised opcode {opcode:#x}"))]
    BadOpcode { opcode: u8 },
    #[snafu(display("crc mismatch: frame corrupted in transit"))]
    CrcMismatch,
    #[snafu(display("malformed payload: {message}"))]
    Malformed { message: String },
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        WireError::Io {
            message: e.to_string(),
        }
    }
}

fn crc32_of(bytes: &[u8]) -> u32 {
    let mut digest = crc32::Digest::new(crc32::IEEE);
    digest.write(bytes);
    digest.sum32()
}

pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    op: Opcode,
    payload: &[u8],
) -> Result<(), WireError> {
    w.write_u8(op as u8).await?;
    w.write_u32_le(payload.len() as u32).await?;
    w.write_all(payload).await?;
    w.write_u32_le(crc32_of(payload)).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncReadExt + Unpin>(
    r: &mut R,
) -> Result<(Opcode, Vec<u8>), WireError> {
    let op_byte = r.read_u8().await?;
    let op = Opcode::from_u8(op_byte).ok_or(WireError::BadOpcode { opcode: op_byte })?;
    let len = r.read_u32_le().await? as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    let crc = r.read_u32_le().await?;
    if crc32_of(&payload) != crc {
        return Err(WireError::CrcMismatch);
    }
    Ok((op, payload))
}

/// One FailOverCache entry: a single cluster write, as streamed by
/// `AddEntries`/`GetEntries`/`GetSCO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocEntry {
    pub cl: ClusterLocation,
    pub lba: u64,
    pub bytes: Vec<u8>,
}

pub fn encode_entries(entries: &[FocEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for e in entries {
        out.extend_from_slice(&e.cl.to_bits().to_le_bytes());
        out.extend_from_slice(&e.lba.to_le_bytes());
        out.extend_from_slice(&(e.bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&e.bytes);
    }
    out
}

pub fn decode_entries(mut bytes: &[u8]) -> Result<Vec<FocEntry>, WireError> {
    let mut out = vec![];
    while !bytes.is_empty() {
        if bytes.len() < 20 {
            return Err(WireError::Malformed {
                message: "truncated entry header".to_string(),
            });
        }
        let cl = ClusterLocation::from_bits(u64::from_le_bytes(
            bytes[0 .. 8].try_into().unwrap(),
        ));
        let lba = u64::from_le_bytes(bytes[8 .. 16].try_into().unwrap());
        let len = u32::from_le_bytes(bytes[16 .. 20].try_into().unwrap()) as usize;
        bytes = &bytes[20 ..];
        if bytes.len() < len {
            return Err(WireError::Malformed {
                message: "truncated entry body".to_string(),
            });
        }
        out.push(FocEntry {
            cl,
            lba,
            bytes: bytes[.. len].to_vec(),
        });
        bytes = &bytes[len ..];
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct RegisterPayload {
    pub namespace: String,
    pub cluster_size: u32,
    pub owner_tag: u64,
}

pub fn encode_register(p: &RegisterPayload) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&p.owner_tag.to_le_bytes());
    out.extend_from_slice(&p.cluster_size.to_le_bytes());
    out.extend_from_slice(p.namespace.as_bytes());
    out
}

pub fn decode_register(bytes: &[u8]) -> Result<RegisterPayload, WireError> {
    if bytes.len() < 12 {
        return Err(WireError::Malformed {
            message: "short register payload".to_string(),
        });
    }
    let owner_tag = u64::from_le_bytes(bytes[0 .. 8].try_into().unwrap());
    let cluster_size = u32::from_le_bytes(bytes[8 .. 12].try_into().unwrap());
    let namespace = String::from_utf8_lossy(&bytes[12 ..]).to_string();
    Ok(RegisterPayload {
        namespace,
        cluster_size,
        owner_tag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_roundtrip() {
        let entries = vec![
            FocEntry {
                cl: ClusterLocation::new(1, 0),
                lba: 0,
                bytes: vec![1, 2, 3],
            },
            FocEntry {
                cl: ClusterLocation::new(1, 1),
                lba: 1,
                bytes: vec![],
            },
        ];
        let bytes = encode_entries(&entries);
        assert_eq!(decode_entries(&bytes).unwrap(), entries);
    }

    #[test]
    fn register_payload_roundtrip() {
        let p = RegisterPayload {
            namespace: "ns0".to_string(),
            cluster_size: 4096,
            owner_tag: 7,
        };
        let bytes = encode_register(&p);
        let back = decode_register(&bytes).unwrap();
        assert_eq!(back.namespace, p.namespace);
        assert_eq!(back.cluster_size, p.cluster_size);
        assert_eq!(back.owner_tag, p.owner_tag);
    }

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, Opcode::AddEntries, b"hello").await.unwrap();
        let (op, payload) = read_frame(&mut b).await.unwrap();
        assert_eq!(op, Opcode::AddEntries);
        assert_eq!(payload, b"hello");
    }
}
