//! Async array handles.
//!
//! Each required dataset is launched as its own read task the moment the
//! bundle is constructed; a later `join` with a shared deadline collects the
//! results. Any read failure or deadline expiry is fatal for the beam that
//! issued it.

use crate::error::{Result, StorageError, SubsetError};
use crate::io::source::{ArrayData, DataSource, ReadSlice};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Typed view conversion out of a wire column.
///
/// Conversions are numeric casts; the storage layer is free to hand back a
/// narrower or wider type than the pipeline works in.
pub trait Element: Copy + Send + 'static {
    fn from_array(data: ArrayData) -> Vec<Self>;
}

macro_rules! impl_element {
    ($t:ty) => {
        impl Element for $t {
            fn from_array(data: ArrayData) -> Vec<Self> {
                macro_rules! cast {
                    ($v:expr) => {
                        $v.into_iter().map(|e| e as $t).collect()
                    };
                }
                match data {
                    ArrayData::Int8(v) => cast!(v),
                    ArrayData::UInt8(v) => cast!(v),
                    ArrayData::Int16(v) => cast!(v),
                    ArrayData::UInt16(v) => cast!(v),
                    ArrayData::Int32(v) => cast!(v),
                    ArrayData::UInt32(v) => cast!(v),
                    ArrayData::Int64(v) => cast!(v),
                    ArrayData::UInt64(v) => cast!(v),
                    ArrayData::Float(v) => cast!(v),
                    ArrayData::Double(v) => cast!(v),
                }
            }
        }
    };
}

impl_element!(i8);
impl_element!(u8);
impl_element!(i32);
impl_element!(u32);
impl_element!(i64);
impl_element!(f32);
impl_element!(f64);

/// An in-flight read of one dataset, resolving to a typed vector.
pub struct ArrayHandle<T: Element> {
    dataset: String,
    task: JoinHandle<std::result::Result<ArrayData, StorageError>>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Element> ArrayHandle<T> {
    /// Spawn the read. The task starts immediately.
    pub fn launch(
        source: Arc<dyn DataSource>,
        resource: &str,
        dataset: &str,
        slice: ReadSlice,
    ) -> Self {
        let resource = resource.to_string();
        let name = dataset.to_string();
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            source.read_array(&resource, &task_name, slice).await
        });
        Self {
            dataset: name,
            task,
            _marker: std::marker::PhantomData,
        }
    }

    /// Block until the read completes or `deadline` expires.
    pub async fn join(self, deadline: Instant) -> Result<Vec<T>> {
        let data = join_raw(self.task, &self.dataset, deadline).await?;
        Ok(T::from_array(data))
    }
}

/// An in-flight read kept in its wire type, for ancillary fields that are
/// serialized element-by-element rather than interpreted.
pub struct RawHandle {
    pub name: String,
    task: JoinHandle<std::result::Result<ArrayData, StorageError>>,
}

impl RawHandle {
    pub fn launch(
        source: Arc<dyn DataSource>,
        resource: &str,
        name: &str,
        dataset: &str,
        slice: ReadSlice,
    ) -> Self {
        let resource = resource.to_string();
        let dataset = dataset.to_string();
        let field = name.to_string();
        let task = tokio::spawn(async move {
            source.read_array(&resource, &dataset, slice).await
        });
        Self { name: field, task }
    }

    pub async fn join(self, deadline: Instant) -> Result<(String, ArrayData)> {
        let data = join_raw(self.task, &self.name, deadline).await?;
        Ok((self.name, data))
    }
}

async fn join_raw(
    task: JoinHandle<std::result::Result<ArrayData, StorageError>>,
    dataset: &str,
    deadline: Instant,
) -> Result<ArrayData> {
    let timeout_ms = deadline
        .saturating_duration_since(Instant::now())
        .as_millis() as u64;
    match tokio::time::timeout_at(deadline, task).await {
        Err(_) => Err(SubsetError::Timeout {
            dataset: dataset.to_string(),
            timeout_ms,
        }),
        Ok(Err(join_err)) => Err(SubsetError::Storage(StorageError::ReadFailed {
            dataset: dataset.to_string(),
            reason: format!("read task failed: {}", join_err),
        })),
        Ok(Ok(result)) => Ok(result?),
    }
}
