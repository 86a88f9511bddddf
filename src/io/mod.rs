//! Storage-facing array interface: the [`DataSource`] trait, typed column
//! data, and async handles joined against a shared deadline.

pub mod array;
pub mod source;

pub use array::{ArrayHandle, Element, RawHandle};
pub use source::{ArrayData, ColumnSel, DataSource, ElementType, MemoryDataset, MemorySource, ReadSlice};
