//! Framed wire format used by the TCP transport.
//!
//! Every frame starts with a fixed 32-byte little-endian header:
//!
//! ```text
//! 0..4    magic "INCC"
//! 4       version
//! 5       kind (0 hello, 1 data, 2 abort)
//! 6       dtype code
//! 7       reserved
//! 8..16   seq
//! 16..20  step
//! 20..24  aux
//! 24..32  payload length in bytes
//! ```
//!
//! Hello frames carry the sender's rank in `aux` and its world size in `seq`.
//! Abort frames carry the failing rank in `aux` and a UTF-8 reason payload.
//! Data payloads are the tensor's elements, each little-endian.

use bytemuck::Pod;
use candle_core::{DType, Device, Tensor, WithDType};
use half::{bf16, f16};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::distributed::types::MessageTag;
use crate::utils::error::{CollectiveError, Result};

pub const MAGIC: [u8; 4] = *b"INCC";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 32;
/// Refuse frames claiming more than this many payload bytes.
pub const MAX_PAYLOAD: u64 = 1 << 34;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Hello = 0,
    Data = 1,
    Abort = 2,
}

impl FrameKind {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(FrameKind::Hello),
            1 => Ok(FrameKind::Data),
            2 => Ok(FrameKind::Abort),
            other => Err(CollectiveError::Io(format!("unknown frame kind {}", other))),
        }
    }
}

pub fn dtype_code(dtype: DType) -> Result<u8> {
    match dtype {
        DType::U8 => Ok(0),
        DType::U32 => Ok(1),
        DType::I64 => Ok(2),
        DType::BF16 => Ok(3),
        DType::F16 => Ok(4),
        DType::F32 => Ok(5),
        DType::F64 => Ok(6),
        #[allow(unreachable_patterns)]
        other => Err(CollectiveError::InvalidArgument(format!("{:?} has no wire encoding", other))),
    }
}

pub fn dtype_from_code(code: u8) -> Result<DType> {
    match code {
        0 => Ok(DType::U8),
        1 => Ok(DType::U32),
        2 => Ok(DType::I64),
        3 => Ok(DType::BF16),
        4 => Ok(DType::F16),
        5 => Ok(DType::F32),
        6 => Ok(DType::F64),
        other => Err(CollectiveError::Io(format!("unknown dtype code {}", other))),
    }
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub dtype: u8,
    pub seq: u64,
    pub step: u32,
    pub aux: u32,
    pub payload_len: u64,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = VERSION;
        buf[5] = self.kind as u8;
        buf[6] = self.dtype;
        buf[8..16].copy_from_slice(&self.seq.to_le_bytes());
        buf[16..20].copy_from_slice(&self.step.to_le_bytes());
        buf[20..24].copy_from_slice(&self.aux.to_le_bytes());
        buf[24..32].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        if buf[0..4] != MAGIC {
            return Err(CollectiveError::Io("bad frame magic".to_string()));
        }
        if buf[4] != VERSION {
            return Err(CollectiveError::Io(format!("unsupported wire version {}", buf[4])));
        }
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(b)
        };
        let u32_at = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[at..at + 4]);
            u32::from_le_bytes(b)
        };
        let header = Self {
            kind: FrameKind::from_u8(buf[5])?,
            dtype: buf[6],
            seq: u64_at(8),
            step: u32_at(16),
            aux: u32_at(20),
            payload_len: u64_at(24),
        };
        if header.payload_len > MAX_PAYLOAD {
            return Err(CollectiveError::Io(format!(
                "frame payload of {} bytes exceeds limit",
                header.payload_len
            )));
        }
        Ok(header)
    }
}

/// A complete message on the wire.
#[derive(Debug, Clone)]
pub enum Frame {
    Hello { rank: usize, world_size: usize },
    Data { tag: MessageTag, dtype: DType, payload: Vec<u8> },
    Abort { seq: u64, origin: usize, reason: String },
}

impl Frame {
    /// Serialize a tensor into a data frame.
    pub fn data(tag: MessageTag, tensor: &Tensor) -> Result<Self> {
        Ok(Frame::Data { tag, dtype: tensor.dtype(), payload: tensor_to_bytes(tensor)? })
    }

    fn header(&self) -> Result<FrameHeader> {
        Ok(match self {
            Frame::Hello { rank, world_size } => FrameHeader {
                kind: FrameKind::Hello,
                dtype: 0,
                seq: *world_size as u64,
                step: 0,
                aux: *rank as u32,
                payload_len: 0,
            },
            Frame::Data { tag, dtype, payload } => FrameHeader {
                kind: FrameKind::Data,
                dtype: dtype_code(*dtype)?,
                seq: tag.seq,
                step: tag.step,
                aux: 0,
                payload_len: payload.len() as u64,
            },
            Frame::Abort { seq, origin, reason } => FrameHeader {
                kind: FrameKind::Abort,
                dtype: 0,
                seq: *seq,
                step: 0,
                aux: *origin as u32,
                payload_len: reason.len() as u64,
            },
        })
    }

    fn payload(&self) -> &[u8] {
        match self {
            Frame::Hello { .. } => &[],
            Frame::Data { payload, .. } => payload,
            Frame::Abort { reason, .. } => reason.as_bytes(),
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.header()?.encode()).await?;
        writer.write_all(self.payload()).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut raw = [0u8; HEADER_LEN];
        reader.read_exact(&mut raw).await?;
        let header = FrameHeader::decode(&raw)?;
        let mut payload = vec![0u8; header.payload_len as usize];
        reader.read_exact(&mut payload).await?;

        match header.kind {
            FrameKind::Hello => Ok(Frame::Hello {
                rank: header.aux as usize,
                world_size: header.seq as usize,
            }),
            FrameKind::Data => Ok(Frame::Data {
                tag: MessageTag::new(header.seq, header.step),
                dtype: dtype_from_code(header.dtype)?,
                payload,
            }),
            FrameKind::Abort => Ok(Frame::Abort {
                seq: header.seq,
                origin: header.aux as usize,
                reason: String::from_utf8_lossy(&payload).into_owned(),
            }),
        }
    }
}

/// Swap each `width`-byte element between host and little-endian order.
/// A no-op on little-endian hosts.
fn swap_to_little_endian(bytes: &mut [u8], width: usize) {
    if cfg!(target_endian = "big") && width > 1 {
        bytes.chunks_exact_mut(width).for_each(<[u8]>::reverse);
    }
}

fn pod_bytes<T: WithDType + Pod>(tensor: &Tensor) -> Result<Vec<u8>> {
    let values = tensor.to_vec1::<T>()?;
    let mut bytes = bytemuck::cast_slice(&values).to_vec();
    swap_to_little_endian(&mut bytes, std::mem::size_of::<T>());
    Ok(bytes)
}

/// Little-endian bytes of a tensor's elements. Copies through host memory.
/// The byte order does not depend on the host.
pub fn tensor_to_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    let flat = tensor.flatten_all()?;
    match flat.dtype() {
        DType::U8 => Ok(flat.to_vec1::<u8>()?),
        DType::U32 => pod_bytes::<u32>(&flat),
        DType::I64 => pod_bytes::<i64>(&flat),
        DType::BF16 => pod_bytes::<bf16>(&flat),
        DType::F16 => pod_bytes::<f16>(&flat),
        DType::F32 => pod_bytes::<f32>(&flat),
        DType::F64 => pod_bytes::<f64>(&flat),
        #[allow(unreachable_patterns)]
        other => Err(CollectiveError::InvalidArgument(format!("{:?} has no wire encoding", other))),
    }
}

fn from_pod<T: WithDType + Pod>(bytes: &[u8]) -> Result<Tensor> {
    let width = std::mem::size_of::<T>();
    if bytes.len() % width != 0 {
        return Err(CollectiveError::ShapeMismatch(format!(
            "{} payload bytes is not a whole number of {}-byte elements",
            bytes.len(),
            width
        )));
    }
    // Copy into an aligned buffer; the payload slice has no alignment guarantee.
    let mut values = vec![T::zeroed(); bytes.len() / width];
    let raw = bytemuck::cast_slice_mut::<T, u8>(&mut values);
    raw.copy_from_slice(bytes);
    swap_to_little_endian(raw, width);
    let n = values.len();
    Ok(Tensor::from_vec(values, n, &Device::Cpu)?)
}

/// Rebuild a host tensor from `tensor_to_bytes` output.
pub fn tensor_from_bytes(bytes: &[u8], dtype: DType) -> Result<Tensor> {
    match dtype {
        DType::U8 => Ok(Tensor::from_vec(bytes.to_vec(), bytes.len(), &Device::Cpu)?),
        DType::U32 => from_pod::<u32>(bytes),
        DType::I64 => from_pod::<i64>(bytes),
        DType::BF16 => from_pod::<bf16>(bytes),
        DType::F16 => from_pod::<f16>(bytes),
        DType::F32 => from_pod::<f32>(bytes),
        DType::F64 => from_pod::<f64>(bytes),
        #[allow(unreachable_patterns)]
        other => Err(CollectiveError::InvalidArgument(format!("{:?} has no wire encoding", other))),
    }
}
