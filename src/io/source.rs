//! Storage-facing column interface.
//!
//! The block-oriented reader that actually fetches dataset slices from object
//! storage lives behind [`DataSource`]; the pipeline only sees typed columns.
//! [`MemorySource`] is the in-process implementation used by the CLI's granule
//! dumps and by the test suite.

use crate::error::StorageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Wire element layout of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementType {
    Int8 = 0,
    UInt8 = 1,
    Int16 = 2,
    UInt16 = 3,
    Int32 = 4,
    UInt32 = 5,
    Int64 = 6,
    UInt64 = 7,
    Float = 8,
    Double = 9,
}

impl ElementType {
    pub fn size(&self) -> usize {
        match self {
            ElementType::Int8 | ElementType::UInt8 => 1,
            ElementType::Int16 | ElementType::UInt16 => 2,
            ElementType::Int32 | ElementType::UInt32 | ElementType::Float => 4,
            ElementType::Int64 | ElementType::UInt64 | ElementType::Double => 8,
        }
    }
}

/// A materialized 1-D column slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "values")]
pub enum ArrayData {
    Int8(Vec<i8>),
    UInt8(Vec<u8>),
    Int16(Vec<i16>),
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Int64(Vec<i64>),
    UInt64(Vec<u64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

macro_rules! for_each_variant {
    ($self:expr, $v:ident => $body:expr) => {
        match $self {
            ArrayData::Int8($v) => $body,
            ArrayData::UInt8($v) => $body,
            ArrayData::Int16($v) => $body,
            ArrayData::UInt16($v) => $body,
            ArrayData::Int32($v) => $body,
            ArrayData::UInt32($v) => $body,
            ArrayData::Int64($v) => $body,
            ArrayData::UInt64($v) => $body,
            ArrayData::Float($v) => $body,
            ArrayData::Double($v) => $body,
        }
    };
}

impl ArrayData {
    pub fn len(&self) -> usize {
        for_each_variant!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            ArrayData::Int8(_) => ElementType::Int8,
            ArrayData::UInt8(_) => ElementType::UInt8,
            ArrayData::Int16(_) => ElementType::Int16,
            ArrayData::UInt16(_) => ElementType::UInt16,
            ArrayData::Int32(_) => ElementType::Int32,
            ArrayData::UInt32(_) => ElementType::UInt32,
            ArrayData::Int64(_) => ElementType::Int64,
            ArrayData::UInt64(_) => ElementType::UInt64,
            ArrayData::Float(_) => ElementType::Float,
            ArrayData::Double(_) => ElementType::Double,
        }
    }

    pub fn element_size(&self) -> usize {
        self.element_type().size()
    }

    /// Append `count` elements starting at `index` as raw native-order bytes.
    /// Returns the number of bytes written.
    pub fn serialize(&self, dest: &mut Vec<u8>, index: usize, count: usize) -> usize {
        macro_rules! put {
            ($v:expr) => {{
                let mut written = 0;
                for e in $v.iter().skip(index).take(count) {
                    dest.extend_from_slice(&e.to_ne_bytes());
                    written += std::mem::size_of_val(e);
                }
                written
            }};
        }
        for_each_variant!(self, v => put!(v))
    }

    /// Lossy numeric view of one element; used for interpolation and tests.
    pub fn get_f64(&self, index: usize) -> f64 {
        for_each_variant!(self, v => v[index] as f64)
    }

    /// Take a row slice `[first, first + count)` with `num_cols` elements per
    /// row, keeping either every column or a single one.
    fn slice_rows(&self, first: usize, count: usize, num_cols: usize, column: ColumnSel) -> ArrayData {
        macro_rules! rows {
            ($v:expr, $variant:ident) => {{
                let out = match column {
                    ColumnSel::All => $v[first * num_cols..(first + count) * num_cols].to_vec(),
                    ColumnSel::Index(c) => (first..first + count)
                        .map(|row| $v[row * num_cols + c])
                        .collect(),
                };
                ArrayData::$variant(out)
            }};
        }
        match self {
            ArrayData::Int8(v) => rows!(v, Int8),
            ArrayData::UInt8(v) => rows!(v, UInt8),
            ArrayData::Int16(v) => rows!(v, Int16),
            ArrayData::UInt16(v) => rows!(v, UInt16),
            ArrayData::Int32(v) => rows!(v, Int32),
            ArrayData::UInt32(v) => rows!(v, UInt32),
            ArrayData::Int64(v) => rows!(v, Int64),
            ArrayData::UInt64(v) => rows!(v, UInt64),
            ArrayData::Float(v) => rows!(v, Float),
            ArrayData::Double(v) => rows!(v, Double),
        }
    }
}

/// Column selection within a 2-D dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnSel {
    /// Every column, flattened row-major.
    All,
    /// A single column.
    Index(usize),
}

impl Default for ColumnSel {
    fn default() -> Self {
        ColumnSel::Index(0)
    }
}

/// Row window and column selection for one read.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadSlice {
    pub column: ColumnSel,
    pub first_row: usize,
    /// `None` reads every row from `first_row` on.
    pub num_rows: Option<usize>,
}

impl ReadSlice {
    /// Read the whole dataset, first column.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn rows(first_row: usize, num_rows: Option<usize>) -> Self {
        Self {
            column: ColumnSel::Index(0),
            first_row,
            num_rows,
        }
    }

    pub fn with_column(mut self, column: ColumnSel) -> Self {
        self.column = column;
        self
    }
}

/// The external block-oriented columnar reader.
///
/// Implementations are expected to be internally thread-safe and to
/// deduplicate block fetches across concurrent reads of one resource.
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    async fn read_array(
        &self,
        resource: &str,
        dataset: &str,
        slice: ReadSlice,
    ) -> Result<ArrayData, StorageError>;
}

/// One dataset held in memory: a flattened row-major buffer plus its width.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDataset {
    #[serde(flatten)]
    pub data: ArrayData,
    #[serde(default = "default_num_cols")]
    pub num_cols: usize,
}

fn default_num_cols() -> usize {
    1
}

/// In-memory [`DataSource`] over per-resource dataset maps.
///
/// Loadable from a serde granule dump; used by the CLI `run` subcommand and
/// throughout the test suite.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MemorySource {
    pub granules: HashMap<String, HashMap<String, MemoryDataset>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a 1-D dataset into a resource.
    pub fn insert(&mut self, resource: &str, dataset: &str, data: ArrayData) {
        self.insert_cols(resource, dataset, data, 1);
    }

    /// Insert a 2-D dataset (row-major, `num_cols` wide).
    pub fn insert_cols(&mut self, resource: &str, dataset: &str, data: ArrayData, num_cols: usize) {
        self.granules
            .entry(resource.to_string())
            .or_default()
            .insert(dataset.to_string(), MemoryDataset { data, num_cols });
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }
}

#[async_trait]
impl DataSource for MemorySource {
    async fn read_array(
        &self,
        resource: &str,
        dataset: &str,
        slice: ReadSlice,
    ) -> Result<ArrayData, StorageError> {
        let granule = self
            .granules
            .get(resource)
            .ok_or_else(|| StorageError::NotFound(resource.to_string()))?;
        let ds = granule
            .get(dataset)
            .ok_or_else(|| StorageError::NotFound(format!("{}:{}", resource, dataset)))?;

        if let ColumnSel::Index(c) = slice.column {
            if c >= ds.num_cols {
                return Err(StorageError::BadColumn {
                    dataset: dataset.to_string(),
                    column: c,
                    num_cols: ds.num_cols,
                });
            }
        }

        let total_rows = ds.data.len() / ds.num_cols;
        if slice.first_row > total_rows {
            return Err(StorageError::ReadFailed {
                dataset: dataset.to_string(),
                reason: format!("first row {} past {} rows", slice.first_row, total_rows),
            });
        }
        let count = match slice.num_rows {
            None => total_rows - slice.first_row,
            Some(n) => {
                if slice.first_row + n > total_rows {
                    return Err(StorageError::ReadFailed {
                        dataset: dataset.to_string(),
                        reason: format!(
                            "window [{}, {}) past {} rows",
                            slice.first_row,
                            slice.first_row + n,
                            total_rows
                        ),
                    });
                }
                n
            }
        };

        Ok(ds.data.slice_rows(slice.first_row, count, ds.num_cols, slice.column))
    }
}
