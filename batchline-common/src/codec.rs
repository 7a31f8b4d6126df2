//! Payload model and the two serialization protocols.
//!
//! - `obj`: arbitrary nested structured data, encoded as JSON.
//! - `numpy`: a fixed-layout numeric array. The header is a dtype byte, a rank
//!   byte and one big-endian `u64` per dimension, followed by the raw
//!   little-endian element bytes.
//!
//! Sequences (a JSON array, or an array of rank >= 1) are batchable: they can be
//! split into partitions and each element is an independent inference item.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Serialization protocol of a payload or of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolTag {
    #[default]
    Obj,
    Numpy,
}

impl ProtocolTag {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Obj => 0,
            Self::Numpy => 1,
        }
    }

    pub fn from_u8(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(Self::Obj),
            1 => Ok(Self::Numpy),
            other => Err(ProtocolError::UnknownProtocol(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Obj => "obj",
            Self::Numpy => "numpy",
        }
    }
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProtocolTag {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "obj" => Ok(Self::Obj),
            "numpy" => Ok(Self::Numpy),
            _ => Err(ProtocolError::UnknownProtocolName(s.to_string())),
        }
    }
}

/// Element type of a numeric array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    U8,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    pub fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::U8 => 0,
            Self::I32 => 1,
            Self::I64 => 2,
            Self::F32 => 3,
            Self::F64 => 4,
        }
    }

    pub fn from_u8(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(Self::U8),
            1 => Ok(Self::I32),
            2 => Ok(Self::I64),
            3 => Ok(Self::F32),
            4 => Ok(Self::F64),
            other => Err(ProtocolError::UnknownDType(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

/// Rust scalar types that can live in an [`NdArray`].
pub trait Element: Copy {
    const DTYPE: DType;
    fn put(self, buf: &mut BytesMut);
    fn take(buf: &mut &[u8]) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr, $put:ident, $get:ident) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn put(self, buf: &mut BytesMut) {
                buf.$put(self);
            }

            fn take(buf: &mut &[u8]) -> Self {
                buf.$get()
            }
        }
    };
}

impl_element!(u8, DType::U8, put_u8, get_u8);
impl_element!(i32, DType::I32, put_i32_le, get_i32_le);
impl_element!(i64, DType::I64, put_i64_le, get_i64_le);
impl_element!(f32, DType::F32, put_f32_le, get_f32_le);
impl_element!(f64, DType::F64, put_f64_le, get_f64_le);

/// Dense numeric array with a row-major little-endian buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    dtype: DType,
    shape: Vec<usize>,
    data: Bytes,
}

impl NdArray {
    /// Build an array, checking the buffer length against the shape.
    ///
    /// Rows of zero elements are only accepted when there are no rows, so the
    /// row count of a decoded array is bounded by its buffer.
    pub fn new(dtype: DType, shape: Vec<usize>, data: Bytes) -> Result<Self, ProtocolError> {
        let Some(row_elements) = checked_product(shape.get(1..).unwrap_or_default()) else {
            return Err(ProtocolError::InvalidShape(shape, "element count overflows"));
        };
        if row_elements == 0 && shape.first().is_some_and(|rows| *rows > 0) {
            return Err(ProtocolError::InvalidShape(shape, "rows without elements"));
        }
        let Some(expected) = checked_product(&shape).and_then(|n| n.checked_mul(dtype.size())) else {
            return Err(ProtocolError::InvalidShape(shape, "element count overflows"));
        };
        if expected != data.len() {
            return Err(ProtocolError::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_slice<T: Element>(shape: Vec<usize>, values: &[T]) -> Result<Self, ProtocolError> {
        let mut buf = BytesMut::with_capacity(values.len() * T::DTYPE.size());
        for v in values {
            v.put(&mut buf);
        }
        Self::new(T::DTYPE, shape, buf.freeze())
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the elements out, failing if `T` does not match the dtype.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, ProtocolError> {
        if T::DTYPE != self.dtype {
            return Err(ProtocolError::DTypeMismatch {
                actual: self.dtype.name(),
                requested: T::DTYPE.name(),
            });
        }
        let mut cursor: &[u8] = &self.data;
        let mut out = Vec::with_capacity(self.len());
        while cursor.has_remaining() {
            out.push(T::take(&mut cursor));
        }
        Ok(out)
    }

    /// Number of rows along the first axis; `None` for a scalar.
    pub fn num_rows(&self) -> Option<usize> {
        self.shape.first().copied()
    }

    fn row_bytes(&self) -> usize {
        self.shape[1..].iter().product::<usize>() * self.dtype.size()
    }

    /// Sub-array of rows `start..end` along the first axis.
    pub fn slice_rows(&self, start: usize, end: usize) -> NdArray {
        let row_bytes = self.row_bytes();
        let mut shape = self.shape.clone();
        shape[0] = end - start;
        NdArray {
            dtype: self.dtype,
            shape,
            data: self.data.slice(start * row_bytes..end * row_bytes),
        }
    }

    /// Split along the first axis into arrays of rank `ndim - 1`.
    pub fn rows(&self) -> Vec<NdArray> {
        let Some(n) = self.num_rows() else {
            return vec![self.clone()];
        };
        let row_bytes = self.row_bytes();
        let row_shape = self.shape[1..].to_vec();
        (0..n)
            .map(|i| NdArray {
                dtype: self.dtype,
                shape: row_shape.clone(),
                data: self.data.slice(i * row_bytes..(i + 1) * row_bytes),
            })
            .collect()
    }

    /// Stack equally-shaped arrays along a new first axis.
    pub fn stack(items: &[NdArray]) -> Result<NdArray, ProtocolError> {
        let first = items
            .first()
            .ok_or_else(|| ProtocolError::Incompatible("nothing to stack".to_string()))?;
        let mut buf = BytesMut::with_capacity(first.data.len() * items.len());
        for item in items {
            if item.dtype != first.dtype || item.shape != first.shape {
                return Err(ProtocolError::Incompatible(format!(
                    "array {:?}{:?} differs from {:?}{:?}",
                    item.dtype, item.shape, first.dtype, first.shape
                )));
            }
            buf.extend_from_slice(&item.data);
        }
        let mut shape = Vec::with_capacity(first.shape.len() + 1);
        shape.push(items.len());
        shape.extend_from_slice(&first.shape);
        NdArray::new(first.dtype, shape, buf.freeze())
    }

    /// Encode with the `numpy` layout.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.shape.len() * 8 + self.data.len());
        buf.put_u8(self.dtype.as_u8());
        buf.put_u8(self.shape.len() as u8);
        for dim in &self.shape {
            buf.put_u64(*dim as u64);
        }
        buf.extend_from_slice(&self.data);
        buf.freeze()
    }

    /// Decode the `numpy` layout.
    pub fn decode(mut bytes: Bytes) -> Result<Self, ProtocolError> {
        ensure_remaining(&bytes, 2)?;
        let dtype = DType::from_u8(bytes.get_u8())?;
        let ndim = bytes.get_u8() as usize;
        ensure_remaining(&bytes, ndim * 8)?;
        let mut shape = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            let dim = usize::try_from(bytes.get_u64())
                .map_err(|_| ProtocolError::InvalidShape(shape.clone(), "dimension exceeds address space"))?;
            shape.push(dim);
        }
        NdArray::new(dtype, shape, bytes)
    }
}

fn checked_product(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
}

fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed: needed - buf.remaining(),
        });
    }
    Ok(())
}

/// An inference input or output.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Object(Value),
    Array(NdArray),
}

impl Payload {
    /// Protocol this payload is encoded with.
    pub fn protocol(&self) -> ProtocolTag {
        match self {
            Self::Object(_) => ProtocolTag::Obj,
            Self::Array(_) => ProtocolTag::Numpy,
        }
    }

    /// Number of items when the payload is a batchable sequence.
    pub fn sequence_len(&self) -> Option<usize> {
        match self {
            Self::Object(Value::Array(items)) => Some(items.len()),
            Self::Object(_) => None,
            Self::Array(arr) => arr.num_rows(),
        }
    }

    /// Split a sequence into consecutive chunks of at most `batch_size` items.
    ///
    /// A non-sequence payload becomes a single chunk.
    pub fn chunks(self, batch_size: usize) -> Vec<Payload> {
        let batch_size = batch_size.max(1);
        match self {
            Self::Object(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len().div_ceil(batch_size));
                let mut iter = items.into_iter().peekable();
                while iter.peek().is_some() {
                    let chunk: Vec<Value> = iter.by_ref().take(batch_size).collect();
                    out.push(Self::Object(Value::Array(chunk)));
                }
                out
            }
            Self::Array(arr) if arr.num_rows().is_some() => {
                let n = arr.num_rows().unwrap_or(0);
                (0..n)
                    .step_by(batch_size)
                    .map(|start| Self::Array(arr.slice_rows(start, (start + batch_size).min(n))))
                    .collect()
            }
            single => vec![single],
        }
    }

    /// Individual inference items of a chunk.
    ///
    /// `batched` is false for a request that was not a sequence: the payload
    /// itself is then the single item.
    pub fn into_items(self, batched: bool) -> Vec<Payload> {
        if !batched {
            return vec![self];
        }
        match self {
            Self::Object(Value::Array(items)) => items.into_iter().map(Self::Object).collect(),
            Self::Array(arr) if arr.num_rows().is_some() => {
                arr.rows().into_iter().map(Self::Array).collect()
            }
            single => vec![single],
        }
    }

    /// Combine per-item outputs back into one sequence payload.
    ///
    /// All-array outputs are stacked; all-object outputs become a JSON list.
    pub fn collect(items: Vec<Payload>) -> Result<Payload, ProtocolError> {
        if items.is_empty() {
            return Ok(Self::Object(Value::Array(Vec::new())));
        }
        if items.iter().all(|p| matches!(p, Self::Array(_))) {
            let arrays: Vec<NdArray> = items
                .into_iter()
                .filter_map(|p| match p {
                    Self::Array(a) => Some(a),
                    Self::Object(_) => None,
                })
                .collect();
            return NdArray::stack(&arrays).map(Self::Array);
        }
        let mut values = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Self::Object(v) => values.push(v),
                Self::Array(_) => {
                    return Err(ProtocolError::Incompatible(
                        "mixed object and array outputs".to_string(),
                    ))
                }
            }
        }
        Ok(Self::Object(Value::Array(values)))
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        match self {
            Self::Object(value) => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| ProtocolError::Json(e.to_string())),
            Self::Array(arr) => Ok(arr.encode()),
        }
    }

    pub fn decode(protocol: ProtocolTag, bytes: Bytes) -> Result<Self, ProtocolError> {
        match protocol {
            ProtocolTag::Obj => serde_json::from_slice(&bytes)
                .map(Self::Object)
                .map_err(|e| ProtocolError::Json(e.to_string())),
            ProtocolTag::Numpy => NdArray::decode(bytes).map(Self::Array),
        }
    }

    pub fn as_object(&self) -> Option<&Value> {
        match self {
            Self::Object(v) => Some(v),
            Self::Array(_) => None,
        }
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            Self::Array(a) => Some(a),
            Self::Object(_) => None,
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Object(value)
    }
}

impl From<NdArray> for Payload {
    fn from(arr: NdArray) -> Self {
        Self::Array(arr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_obj_roundtrip_preserves_structure() {
        let payload = Payload::Object(json!({"text": "hi", "nested": [1, {"a": null}]}));
        let bytes = payload.encode().unwrap();
        let decoded = Payload::decode(ProtocolTag::Obj, bytes).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_numpy_roundtrip_preserves_shape_dtype_values() {
        let values: Vec<f32> = (0..6).map(|v| v as f32 * 0.5).collect();
        let arr = NdArray::from_slice(vec![2, 3], &values).unwrap();
        let decoded = NdArray::decode(arr.encode()).unwrap();
        assert_eq!(decoded.dtype(), DType::F32);
        assert_eq!(decoded.shape(), &[2, 3]);
        assert_eq!(decoded.to_vec::<f32>().unwrap(), values);
    }

    #[test]
    fn test_numpy_decode_rejects_wrong_element_count() {
        let arr = NdArray::from_slice(vec![4], &[1i32, 2, 3, 4]).unwrap();
        let mut raw = BytesMut::from(&arr.encode()[..]);
        raw.truncate(raw.len() - 4);
        let err = NdArray::decode(raw.freeze()).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::ShapeMismatch {
                expected: 16,
                actual: 12
            }
        );
    }

    fn raw_header(dtype: u8, dims: &[u64], data: &[u8]) -> Bytes {
        let mut raw = BytesMut::new();
        raw.put_u8(dtype);
        raw.put_u8(dims.len() as u8);
        for dim in dims {
            raw.put_u64(*dim);
        }
        raw.extend_from_slice(data);
        raw.freeze()
    }

    #[test]
    fn test_numpy_decode_rejects_overflowing_shape() {
        let raw = raw_header(0, &[1 << 33, 1 << 33], &[]);
        assert!(matches!(
            NdArray::decode(raw).unwrap_err(),
            ProtocolError::InvalidShape(_, "element count overflows")
        ));

        let raw = raw_header(4, &[u64::MAX / 4], &[]);
        assert!(matches!(NdArray::decode(raw).unwrap_err(), ProtocolError::InvalidShape(..)));
    }

    #[test]
    fn test_numpy_decode_rejects_rows_of_nothing() {
        let raw = raw_header(0, &[1 << 40, 0], &[]);
        assert_eq!(
            NdArray::decode(raw).unwrap_err(),
            ProtocolError::InvalidShape(vec![1 << 40, 0], "rows without elements")
        );

        let empty = NdArray::decode(raw_header(3, &[0, 3], &[])).unwrap();
        assert_eq!(Payload::Array(empty).sequence_len(), Some(0));
    }

    #[test]
    fn test_numpy_decode_rejects_unknown_dtype() {
        let raw = Bytes::from_static(&[9, 0]);
        assert_eq!(
            NdArray::decode(raw).unwrap_err(),
            ProtocolError::UnknownDType(9)
        );
    }

    #[test]
    fn test_numpy_decode_rejects_truncated_header() {
        let raw = Bytes::from_static(&[3, 2, 0, 0]);
        assert!(matches!(
            NdArray::decode(raw),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_to_vec_checks_dtype() {
        let arr = NdArray::from_slice(vec![2], &[1i64, 2]).unwrap();
        assert!(matches!(
            arr.to_vec::<f64>(),
            Err(ProtocolError::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_object_list_chunks_in_order() {
        let items: Vec<Value> = (0..25).map(|i| json!(i)).collect();
        let chunks = Payload::Object(Value::Array(items)).chunks(10);
        let sizes: Vec<usize> = chunks.iter().map(|c| c.sequence_len().unwrap()).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(chunks[2].as_object().unwrap()[0], json!(20));
    }

    #[test]
    fn test_array_chunks_along_first_axis() {
        let values: Vec<i32> = (0..14).collect();
        let arr = NdArray::from_slice(vec![7, 2], &values).unwrap();
        let chunks = Payload::Array(arr).chunks(3);
        assert_eq!(chunks.len(), 3);
        let last = chunks[2].as_array().unwrap();
        assert_eq!(last.shape(), &[1, 2]);
        assert_eq!(last.to_vec::<i32>().unwrap(), vec![12, 13]);
    }

    #[test]
    fn test_scalar_payload_is_single_chunk() {
        let chunks = Payload::Object(json!("hello")).chunks(10);
        assert_eq!(chunks, vec![Payload::Object(json!("hello"))]);
        assert_eq!(Payload::Object(json!("hello")).sequence_len(), None);
    }

    #[test]
    fn test_into_items_respects_batched_flag() {
        let list = Payload::Object(json!([1, 2, 3]));
        assert_eq!(list.clone().into_items(true).len(), 3);
        assert_eq!(list.into_items(false).len(), 1);
    }

    #[test]
    fn test_collect_stacks_arrays() {
        let rows: Vec<Payload> = (0..3)
            .map(|i| Payload::Array(NdArray::from_slice(vec![2], &[i as f64, -(i as f64)]).unwrap()))
            .collect();
        let stacked = Payload::collect(rows).unwrap();
        let arr = stacked.as_array().unwrap();
        assert_eq!(arr.shape(), &[3, 2]);
        assert_eq!(arr.to_vec::<f64>().unwrap(), vec![0.0, -0.0, 1.0, -1.0, 2.0, -2.0]);
    }

    #[test]
    fn test_collect_rejects_mixed_outputs() {
        let items = vec![
            Payload::Object(json!(1)),
            Payload::Array(NdArray::from_slice(vec![1], &[1u8]).unwrap()),
        ];
        assert!(matches!(
            Payload::collect(items),
            Err(ProtocolError::Incompatible(_))
        ));
    }

    #[test]
    fn test_protocol_tag_parsing() {
        assert_eq!("NUMPY".parse::<ProtocolTag>().unwrap(), ProtocolTag::Numpy);
        assert_eq!("obj".parse::<ProtocolTag>().unwrap(), ProtocolTag::Obj);
        assert!("json".parse::<ProtocolTag>().is_err());
        assert!(ProtocolTag::from_u8(7).is_err());
    }
}
