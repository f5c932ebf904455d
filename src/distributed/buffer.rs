//! Device buffers, staging and the scratch pool.
//!
//! A [`DeviceBuffer`] is a caller-owned, contiguous 1-D tensor. Clones share
//! storage, so results written by the engine land in the caller's memory.
//! Scratch buffers are leased from a pool keyed by `(dtype, count, location)`
//! and go back to the pool when the lease is dropped.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use candle_core::{DType, Device, DeviceLocation, Tensor, WithDType};
use tracing::{debug, warn};

use crate::utils::error::{CollectiveError, Result};
use crate::utils::metrics;

/// Where a buffer's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Host,
    Device { ordinal: usize },
}

impl Location {
    pub fn of(device: &Device) -> Self {
        match device.location() {
            DeviceLocation::Cpu => Location::Host,
            DeviceLocation::Cuda { gpu_id } => Location::Device { ordinal: gpu_id },
            DeviceLocation::Metal { gpu_id } => Location::Device { ordinal: gpu_id },
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Location::Host)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Host => write!(f, "host"),
            Location::Device { ordinal } => write!(f, "device:{}", ordinal),
        }
    }
}

/// Typed, sized, located memory handle supplied by the caller.
#[derive(Clone)]
pub struct DeviceBuffer {
    tensor: Tensor,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("dtype", &self.element_type())
            .field("count", &self.element_count())
            .field("location", &self.location())
            .finish()
    }
}

impl DeviceBuffer {
    /// Wrap a contiguous tensor. The buffer is a flattened view sharing the
    /// tensor's storage.
    pub fn new(tensor: &Tensor) -> Result<Self> {
        if !tensor.is_contiguous() {
            return Err(CollectiveError::InvalidArgument(
                "collective buffers must be contiguous".to_string(),
            ));
        }
        Ok(Self { tensor: tensor.flatten_all()? })
    }

    pub fn zeros(dtype: DType, count: usize, device: &Device) -> Result<Self> {
        Ok(Self { tensor: Tensor::zeros(count, dtype, device)? })
    }

    pub fn from_vec<T: WithDType>(data: Vec<T>, device: &Device) -> Result<Self> {
        let n = data.len();
        Ok(Self { tensor: Tensor::from_vec(data, n, device)? })
    }

    pub fn element_type(&self) -> DType {
        self.tensor.dtype()
    }

    pub fn element_count(&self) -> usize {
        self.tensor.elem_count()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.element_count() * self.element_type().size_in_bytes()
    }

    pub fn location(&self) -> Location {
        Location::of(self.tensor.device())
    }

    pub fn device(&self) -> &Device {
        self.tensor.device()
    }

    /// The flattened tensor view of this buffer.
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn to_vec<T: WithDType>(&self) -> Result<Vec<T>> {
        Ok(self.tensor.to_vec1::<T>()?)
    }

    /// Whether both handles refer to the same caller buffer.
    pub fn aliases(&self, other: &DeviceBuffer) -> bool {
        self.tensor.id() == other.tensor.id()
    }

    /// Overwrite `src.elem_count()` elements starting at `offset`, staging
    /// through host memory when `src` lives elsewhere.
    pub(crate) fn write_at(&self, src: &Tensor, offset: usize) -> Result<()> {
        if src.elem_count() == 0 {
            return Ok(());
        }
        if offset + src.elem_count() > self.element_count() {
            return Err(CollectiveError::SizeMismatch {
                expected: self.element_count(),
                actual: offset + src.elem_count(),
            });
        }
        let src = land_on(src, self.tensor.device())?;
        self.tensor.slice_set(&src.contiguous()?, 0, offset)?;
        Ok(())
    }
}

/// Move a tensor onto `device`, counting a host-staged copy when it has to
/// change location.
pub(crate) fn land_on(tensor: &Tensor, device: &Device) -> Result<Tensor> {
    if tensor.device().same_device(device) {
        Ok(tensor.clone())
    } else {
        metrics::record_host_staged_copy();
        Ok(tensor.to_device(device)?)
    }
}

/// Independent copy of `tensor` with exactly its own elements.
pub(crate) fn owned_copy(tensor: &Tensor) -> Result<Tensor> {
    let out = Tensor::zeros(tensor.elem_count(), tensor.dtype(), tensor.device())?;
    if tensor.elem_count() > 0 {
        out.slice_set(&tensor.flatten_all()?.contiguous()?, 0, 0)?;
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ScratchKey {
    dtype: DType,
    count: usize,
    location: Location,
}

impl ScratchKey {
    fn bytes(&self) -> usize {
        self.count * self.dtype.size_in_bytes()
    }
}

struct PooledTensor {
    id: u64,
    tensor: Tensor,
}

#[derive(Default)]
struct PoolState {
    idle: HashMap<ScratchKey, Vec<PooledTensor>>,
    in_use: HashSet<u64>,
    resident_bytes: usize,
    next_id: u64,
    stats: PoolStats,
}

impl PoolState {
    fn idle_bytes(&self) -> usize {
        self.idle
            .iter()
            .map(|(key, entries)| key.bytes() * entries.len())
            .sum()
    }

    /// Drop every idle entry, returning the bytes released.
    fn compact(&mut self) -> usize {
        let released = self.idle_bytes();
        self.idle.clear();
        self.resident_bytes -= released;
        self.stats.compactions += 1;
        released
    }
}

/// Counters describing pool behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocations: u64,
    pub reuses: u64,
    pub compactions: u64,
    pub in_use: usize,
    pub idle: usize,
    pub resident_bytes: usize,
    /// Leases handed out while the same buffer was still leased. Always zero
    /// unless the pool is broken.
    pub double_allocations: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PoolShared {
    state: Mutex<PoolState>,
    max_bytes: usize,
}

/// Pool of reusable scratch tensors shared by the collectives of one group.
#[derive(Clone)]
pub struct ScratchPool {
    shared: Arc<PoolShared>,
}

impl ScratchPool {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState::default()),
                max_bytes,
            }),
        }
    }

    /// Lease a scratch tensor allocated on `device`.
    ///
    /// When the new buffer would push resident memory past the limit the
    /// pool drops its idle entries and tries once more before failing.
    pub fn lease(&self, dtype: DType, count: usize, device: &Device) -> Result<ScratchLease> {
        let key = ScratchKey { dtype, count, location: Location::of(device) };

        let id = {
            let mut state = lock(&self.shared.state);
            if let Some(entry) = state.idle.get_mut(&key).and_then(|entries| entries.pop()) {
                if !state.in_use.insert(entry.id) {
                    state.stats.double_allocations += 1;
                    return Err(CollectiveError::Allocation(format!(
                        "scratch buffer {} leased twice",
                        entry.id
                    )));
                }
                state.stats.reuses += 1;
                metrics::record_scratch_lease(true);
                return Ok(ScratchLease {
                    key,
                    entry,
                    pool: self.shared.clone(),
                });
            }

            let bytes = key.bytes();
            if state.resident_bytes + bytes > self.shared.max_bytes {
                let released = state.compact();
                metrics::record_scratch_resident_delta(-(released as i64));
                debug!(released, "Compacted scratch pool");
                if state.resident_bytes + bytes > self.shared.max_bytes {
                    warn!(
                        requested = bytes,
                        resident = state.resident_bytes,
                        limit = self.shared.max_bytes,
                        "Scratch pool exhausted"
                    );
                    return Err(CollectiveError::Allocation(format!(
                        "scratch request of {} bytes exceeds pool limit ({} of {} bytes resident)",
                        bytes, state.resident_bytes, self.shared.max_bytes
                    )));
                }
            }
            // Reserve before allocating outside the lock.
            state.resident_bytes += bytes;
            let id = state.next_id;
            state.next_id += 1;
            state.in_use.insert(id);
            state.stats.allocations += 1;
            id
        };

        match Tensor::zeros(count, dtype, device) {
            Ok(tensor) => {
                metrics::record_scratch_lease(false);
                metrics::record_scratch_resident_delta(key.bytes() as i64);
                Ok(ScratchLease {
                    key,
                    entry: PooledTensor { id, tensor },
                    pool: self.shared.clone(),
                })
            }
            Err(e) => {
                let mut state = lock(&self.shared.state);
                state.resident_bytes -= key.bytes();
                state.in_use.remove(&id);
                Err(CollectiveError::Allocation(e.to_string()))
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.shared.state);
        PoolStats {
            in_use: state.in_use.len(),
            idle: state.idle.values().map(Vec::len).sum(),
            resident_bytes: state.resident_bytes,
            ..state.stats
        }
    }

    /// Release every idle buffer.
    pub fn compact(&self) {
        let released = lock(&self.shared.state).compact();
        metrics::record_scratch_resident_delta(-(released as i64));
    }
}

/// Exclusive use of one pooled scratch tensor.
pub struct ScratchLease {
    key: ScratchKey,
    entry: PooledTensor,
    pool: Arc<PoolShared>,
}

impl ScratchLease {
    pub fn tensor(&self) -> &Tensor {
        &self.entry.tensor
    }

    pub fn id(&self) -> u64 {
        self.entry.id
    }
}

impl std::fmt::Debug for ScratchLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchLease")
            .field("key", &self.key)
            .field("id", &self.entry.id)
            .finish_non_exhaustive()
    }
}

impl Drop for ScratchLease {
    fn drop(&mut self) {
        // The pool keeps a handle to the same storage; ours goes with the lease.
        let entry = PooledTensor { id: self.entry.id, tensor: self.entry.tensor.clone() };
        let mut state = lock(&self.pool.state);
        state.in_use.remove(&entry.id);
        state.idle.entry(self.key).or_default().push(entry);
    }
}

/// Staging between host and the compute device, plus the scratch pool.
pub struct BufferManager {
    compute: Device,
    pool: ScratchPool,
}

impl BufferManager {
    pub fn new(compute: Device, max_pool_bytes: usize) -> Self {
        Self { compute, pool: ScratchPool::new(max_pool_bytes) }
    }

    /// Device the engine reduces on. `Device::Cpu` for the CPU reference path.
    pub fn compute_device(&self) -> &Device {
        &self.compute
    }

    pub fn compute_location(&self) -> Location {
        Location::of(&self.compute)
    }

    /// Copy a buffer onto the compute device.
    pub fn stage_to_device(&self, buffer: &DeviceBuffer) -> Result<DeviceBuffer> {
        self.stage(buffer, &self.compute.clone())
    }

    /// Copy a buffer into host memory.
    pub fn stage_to_host(&self, buffer: &DeviceBuffer) -> Result<DeviceBuffer> {
        self.stage(buffer, &Device::Cpu)
    }

    fn stage(&self, buffer: &DeviceBuffer, target: &Device) -> Result<DeviceBuffer> {
        let tensor = if buffer.device().same_device(target) {
            owned_copy(buffer.tensor())?
        } else {
            metrics::record_host_staged_copy();
            buffer.tensor().to_device(target)?
        };
        Ok(DeviceBuffer { tensor })
    }

    /// Lease scratch memory at `location`.
    pub fn allocate_scratch(&self, dtype: DType, count: usize, location: Location) -> Result<ScratchLease> {
        let device = match location {
            Location::Host => Device::Cpu,
            loc if loc == self.compute_location() => self.compute.clone(),
            loc => {
                return Err(CollectiveError::Allocation(format!(
                    "no device handle for {} (compute device is {})",
                    loc,
                    self.compute_location()
                )))
            }
        };
        self.pool.lease(dtype, count, &device)
    }

    pub fn pool(&self) -> &ScratchPool {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_shares_caller_storage() -> Result<()> {
        let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], (2, 2), &Device::Cpu)?;
        let buf = DeviceBuffer::new(&t)?;
        assert_eq!(buf.element_count(), 4);
        assert_eq!(buf.location(), Location::Host);

        let patch = Tensor::from_vec(vec![9.0f32, 8.0], 2, &Device::Cpu)?;
        buf.write_at(&patch, 1)?;
        assert_eq!(t.flatten_all()?.to_vec1::<f32>()?, vec![1.0, 9.0, 8.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_non_contiguous_rejected() -> Result<()> {
        let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], (2, 2), &Device::Cpu)?.t()?;
        assert!(matches!(DeviceBuffer::new(&t), Err(CollectiveError::InvalidArgument(_))));
        Ok(())
    }

    #[test]
    fn test_write_past_end_is_size_mismatch() -> Result<()> {
        let buf = DeviceBuffer::zeros(DType::F32, 2, &Device::Cpu)?;
        let src = Tensor::zeros(3, DType::F32, &Device::Cpu)?;
        assert!(matches!(buf.write_at(&src, 0), Err(CollectiveError::SizeMismatch { .. })));
        Ok(())
    }

    #[test]
    fn test_owned_copy_is_independent() -> Result<()> {
        let buf = DeviceBuffer::from_vec(vec![1u32, 2, 3, 4], &Device::Cpu)?;
        let view = buf.tensor().narrow(0, 1, 2)?;
        let copy = owned_copy(&view)?;
        buf.write_at(&Tensor::from_vec(vec![7u32, 7], 2, &Device::Cpu)?, 1)?;
        assert_eq!(copy.to_vec1::<u32>()?, vec![2, 3]);
        Ok(())
    }

    #[test]
    fn test_scratch_reuse_by_shape() -> Result<()> {
        let manager = BufferManager::new(Device::Cpu, 1 << 20);
        let first_id = {
            let lease = manager.allocate_scratch(DType::F32, 16, Location::Host)?;
            lease.id()
        };
        let again = manager.allocate_scratch(DType::F32, 16, Location::Host)?;
        assert_eq!(again.id(), first_id);

        let other_shape = manager.allocate_scratch(DType::F32, 32, Location::Host)?;
        assert_ne!(other_shape.id(), first_id);

        let stats = manager.pool_stats();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.reuses, 1);
        assert_eq!(stats.in_use, 2);
        Ok(())
    }

    #[test]
    fn test_released_lease_returns_its_storage() -> Result<()> {
        let manager = BufferManager::new(Device::Cpu, 1 << 20);
        let first_id = {
            let lease = manager.allocate_scratch(DType::F32, 4, Location::Host)?;
            lease.tensor().slice_set(&Tensor::new(&[7f32, 7., 7., 7.], &Device::Cpu)?, 0, 0)?;
            lease.id()
        };
        assert_eq!(manager.pool_stats().idle, 1);

        let again = manager.allocate_scratch(DType::F32, 4, Location::Host)?;
        assert_eq!(again.id(), first_id);
        assert_eq!(again.tensor().to_vec1::<f32>()?, vec![7.0; 4]);
        Ok(())
    }

    #[test]
    fn test_concurrent_leases_never_share() -> Result<()> {
        let manager = BufferManager::new(Device::Cpu, 1 << 20);
        let a = manager.allocate_scratch(DType::I64, 8, Location::Host)?;
        let b = manager.allocate_scratch(DType::I64, 8, Location::Host)?;
        assert_ne!(a.id(), b.id());
        drop(a);
        drop(b);
        let stats = manager.pool_stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.double_allocations, 0);
        Ok(())
    }

    #[test]
    fn test_exhaustion_compacts_then_fails() -> Result<()> {
        // Room for exactly 16 f32 elements.
        let manager = BufferManager::new(Device::Cpu, 64);
        drop(manager.allocate_scratch(DType::F32, 8, Location::Host)?);
        drop(manager.allocate_scratch(DType::F32, 4, Location::Host)?);

        // Needs the idle entries to be dropped first.
        let big = manager.allocate_scratch(DType::F32, 16, Location::Host)?;
        assert_eq!(manager.pool_stats().compactions, 1);
        assert_eq!(manager.pool_stats().resident_bytes, 64);

        let err = manager.allocate_scratch(DType::F32, 1, Location::Host).unwrap_err();
        assert!(matches!(err, CollectiveError::Allocation(_)));
        drop(big);
        Ok(())
    }

    #[test]
    fn test_staging_roundtrip_on_cpu() -> Result<()> {
        let manager = BufferManager::new(Device::Cpu, 1 << 20);
        let host = DeviceBuffer::from_vec(vec![1.5f64, 2.5], &Device::Cpu)?;
        let staged = manager.stage_to_device(&host)?;
        assert!(!staged.aliases(&host));
        let back = manager.stage_to_host(&staged)?;
        assert_eq!(back.to_vec::<f64>()?, vec![1.5, 2.5]);
        Ok(())
    }

    #[test]
    fn test_unknown_device_location_rejected() {
        let manager = BufferManager::new(Device::Cpu, 1 << 20);
        let err = manager
            .allocate_scratch(DType::F32, 4, Location::Device { ordinal: 3 })
            .unwrap_err();
        assert!(matches!(err, CollectiveError::Allocation(_)));
    }
}
