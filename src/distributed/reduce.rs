//! Reduction operator registry.
//!
//! Every combine function is element-wise over two tensors of identical dtype
//! and length. The ring and tree algorithms reorder partial reductions across
//! ranks, so registered functions must be associative and commutative.

use std::collections::HashMap;
use std::fmt;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::utils::error::{CollectiveError, Result};

/// Element-wise reduction applied by all-reduce and reduce-scatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceOp {
    Sum,
    Product,
    Max,
    Min,
    /// Non-zero is true; results are 0 or 1. `U8` only.
    LogicalAnd,
    /// Non-zero is true; results are 0 or 1. `U8` only.
    LogicalOr,
    /// Sum, then divided by the number of contributors. Float dtypes only.
    Avg,
    /// Keeps the left operand. Used by barrier.
    Nop,
}

impl ReduceOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Product => "product",
            ReduceOp::Max => "max",
            ReduceOp::Min => "min",
            ReduceOp::LogicalAnd => "logical_and",
            ReduceOp::LogicalOr => "logical_or",
            ReduceOp::Avg => "avg",
            ReduceOp::Nop => "nop",
        }
    }
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signature of a registered combine function.
pub type CombineFn = fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>;

const ALL_DTYPES: [DType; 7] = [
    DType::U8,
    DType::U32,
    DType::I64,
    DType::BF16,
    DType::F16,
    DType::F32,
    DType::F64,
];

fn is_float(dtype: DType) -> bool {
    matches!(dtype, DType::BF16 | DType::F16 | DType::F32 | DType::F64)
}

fn sum(a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
    a.add(b)
}

fn product(a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
    a.mul(b)
}

fn max(a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
    a.maximum(b)
}

fn min(a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
    a.minimum(b)
}

fn logical_and(a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
    a.ne(0u8)?.minimum(&b.ne(0u8)?)
}

fn logical_or(a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
    a.ne(0u8)?.maximum(&b.ne(0u8)?)
}

// Fresh storage, so the result can be written back over `a`'s source.
fn nop(a: &Tensor, _b: &Tensor) -> candle_core::Result<Tensor> {
    a.copy()
}

/// Lookup table from `(op, dtype)` to a combine function.
#[derive(Clone)]
pub struct ReductionRegistry {
    table: HashMap<(ReduceOp, DType), CombineFn>,
}

impl fmt::Debug for ReductionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReductionRegistry")
            .field("entries", &self.table.len())
            .finish()
    }
}

impl Default for ReductionRegistry {
    fn default() -> Self {
        Self::with_builtin_ops()
    }
}

impl ReductionRegistry {
    /// An empty registry. Mostly useful for tests and custom op sets.
    pub fn empty() -> Self {
        Self { table: HashMap::new() }
    }

    pub fn with_builtin_ops() -> Self {
        let mut registry = Self::empty();
        for dtype in ALL_DTYPES {
            registry.register(ReduceOp::Sum, dtype, sum);
            registry.register(ReduceOp::Product, dtype, product);
            registry.register(ReduceOp::Max, dtype, max);
            registry.register(ReduceOp::Min, dtype, min);
            registry.register(ReduceOp::Nop, dtype, nop);
            if is_float(dtype) {
                registry.register(ReduceOp::Avg, dtype, sum);
            }
        }
        registry.register(ReduceOp::LogicalAnd, DType::U8, logical_and);
        registry.register(ReduceOp::LogicalOr, DType::U8, logical_or);
        registry
    }

    /// Add or replace a combine function. Registration happens before a
    /// process group is built; the engine only reads the table.
    pub fn register(&mut self, op: ReduceOp, dtype: DType, f: CombineFn) {
        self.table.insert((op, dtype), f);
    }

    pub fn supports(&self, op: ReduceOp, dtype: DType) -> bool {
        self.table.contains_key(&(op, dtype))
    }

    /// Call-time validation of an `(op, dtype)` pair.
    pub fn check(&self, op: ReduceOp, dtype: DType) -> Result<()> {
        if self.supports(op, dtype) {
            Ok(())
        } else {
            Err(CollectiveError::UnsupportedOperation { op, dtype })
        }
    }

    /// Combine two equally shaped tensors.
    pub fn combine(&self, op: ReduceOp, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let f = self
            .table
            .get(&(op, a.dtype()))
            .ok_or(CollectiveError::UnsupportedOperation { op, dtype: a.dtype() })?;
        if a.dtype() != b.dtype() {
            return Err(CollectiveError::ShapeMismatch(format!(
                "cannot combine {:?} with {:?}",
                a.dtype(),
                b.dtype()
            )));
        }
        if a.elem_count() != b.elem_count() {
            return Err(CollectiveError::SizeMismatch {
                expected: a.elem_count(),
                actual: b.elem_count(),
            });
        }
        Ok(f(a, b)?)
    }

    /// Post-processing applied once after the last combine.
    pub fn finalize(&self, op: ReduceOp, reduced: Tensor, contributors: usize) -> Result<Tensor> {
        match op {
            ReduceOp::Avg if contributors > 1 => Ok(reduced.affine(1.0 / contributors as f64, 0.0)?),
            _ => Ok(reduced),
        }
    }
}
