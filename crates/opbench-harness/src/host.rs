//! Caller-owned host tensors.
//!
//! The harness never frees host memory. Inputs are read, outputs are only
//! written when the kernel reports success.

use std::ffi::c_void;
use std::fmt;

use serde::Serialize;

use crate::dtype::{Element, ElementType};
use crate::error::HarnessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorRole {
    Input,
    Output,
}

impl fmt::Display for TensorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorRole::Input => f.write_str("input"),
            TensorRole::Output => f.write_str("output"),
        }
    }
}

/// C-ABI host descriptor: data pointer, element type tag, element count.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawTensor {
    pub data: *mut c_void,
    pub dtype: i32,
    pub len: usize,
}

impl RawTensor {
    pub fn new(data: *mut c_void, dtype: i32, len: usize) -> Self {
        Self { data, dtype, len }
    }

    /// Validate the tag and pointer and compute the byte length.
    fn describe(&self, role: TensorRole, index: usize) -> Result<(ElementType, usize), HarnessError> {
        let dtype = ElementType::from_tag(self.dtype).ok_or(HarnessError::UnsupportedType {
            role,
            index,
            tag: self.dtype,
        })?;
        let bytes = dtype.byte_size(self.len).ok_or(HarnessError::SizeOverflow {
            role,
            index,
            len: self.len,
        })?;
        if self.data.is_null() && self.len > 0 {
            return Err(HarnessError::NullBuffer {
                role,
                index,
                len: self.len,
            });
        }
        Ok((dtype, bytes))
    }
}

/// Check every descriptor, inputs first, before anything touches a device.
pub fn validate_raw(inputs: &[RawTensor], outputs: &[RawTensor]) -> Result<(), HarnessError> {
    for (index, raw) in inputs.iter().enumerate() {
        raw.describe(TensorRole::Input, index)?;
    }
    for (index, raw) in outputs.iter().enumerate() {
        raw.describe(TensorRole::Output, index)?;
    }
    Ok(())
}

/// Read-only host tensor staged as a kernel input.
#[derive(Debug, Clone, Copy)]
pub struct HostTensor<'a> {
    dtype: ElementType,
    len: usize,
    bytes: &'a [u8],
}

impl<'a> HostTensor<'a> {
    pub fn new<T: Element>(data: &'a [T]) -> Self {
        Self {
            dtype: T::TYPE,
            len: data.len(),
            bytes: bytemuck::cast_slice(data),
        }
    }

    /// # Safety
    ///
    /// `raw.data` must point to `raw.len` initialized elements of the tagged
    /// type that stay valid and unmodified for `'a`.
    pub unsafe fn from_raw(raw: &RawTensor, index: usize) -> Result<Self, HarnessError> {
        let (dtype, byte_len) = raw.describe(TensorRole::Input, index)?;
        let bytes: &'a [u8] = if byte_len == 0 {
            Default::default()
        } else {
            // SAFETY: non-null and sized per the caller contract.
            unsafe { std::slice::from_raw_parts(raw.data as *const u8, byte_len) }
        };
        Ok(Self {
            dtype,
            len: raw.len,
            bytes,
        })
    }

    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Caller-allocated host tensor that receives a kernel output.
#[derive(Debug)]
pub struct HostTensorMut<'a> {
    dtype: ElementType,
    len: usize,
    bytes: &'a mut [u8],
}

impl<'a> HostTensorMut<'a> {
    pub fn new<T: Element>(data: &'a mut [T]) -> Self {
        Self {
            dtype: T::TYPE,
            len: data.len(),
            bytes: bytemuck::cast_slice_mut(data),
        }
    }

    /// # Safety
    ///
    /// `raw.data` must point to `raw.len` writable elements of the tagged
    /// type, valid for `'a` and not aliased by any other descriptor.
    pub unsafe fn from_raw(raw: &RawTensor, index: usize) -> Result<Self, HarnessError> {
        let (dtype, byte_len) = raw.describe(TensorRole::Output, index)?;
        let bytes: &'a mut [u8] = if byte_len == 0 {
            Default::default()
        } else {
            // SAFETY: non-null, sized and unaliased per the caller contract.
            unsafe { std::slice::from_raw_parts_mut(raw.data as *mut u8, byte_len) }
        };
        Ok(Self {
            dtype,
            len: raw.len,
            bytes,
        })
    }

    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }
}

/// Host tensor that owns its storage. Used by the command line front end,
/// which builds tensors from text.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedTensor {
    dtype: ElementType,
    len: usize,
    bytes: Vec<u8>,
}

impl OwnedTensor {
    pub fn from_values<T: Element>(values: &[T]) -> Self {
        Self {
            dtype: T::TYPE,
            len: values.len(),
            bytes: bytemuck::cast_slice(values).to_vec(),
        }
    }

    /// All-zero tensor of `len` elements. `role` and `index` name the
    /// tensor in the overflow error.
    pub fn zeroed(
        dtype: ElementType,
        len: usize,
        role: TensorRole,
        index: usize,
    ) -> Result<Self, HarnessError> {
        let bytes = dtype
            .byte_size(len)
            .ok_or(HarnessError::SizeOverflow { role, index, len })?;
        Ok(Self {
            dtype,
            len,
            bytes: vec![0u8; bytes],
        })
    }

    /// Parse an input spec of the form `dtype:v1,v2,...` (e.g. `f32:1,2,3,4`).
    /// An empty value list yields a zero-length tensor.
    pub fn parse_input(spec: &str) -> Result<Self, HarnessError> {
        let (dtype, rest) = split_spec(spec)?;
        crate::with_element_type!(dtype, |T| {
            let mut values: Vec<T> = Vec::new();
            for item in rest.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let value = <T as Element>::parse_value(item).ok_or_else(|| {
                    HarnessError::InvalidTensorSpec {
                        spec: spec.to_string(),
                        reason: format!("{:?} is not a valid {}", item, dtype),
                    }
                })?;
                values.push(value);
            }
            Ok(Self::from_values(&values))
        })
    }

    /// Parse the spec of output `index`, of the form `dtype:len` (e.g. `f32:4`).
    pub fn parse_output(spec: &str, index: usize) -> Result<Self, HarnessError> {
        let (dtype, rest) = split_spec(spec)?;
        let len: usize = rest.trim().parse().map_err(|_| HarnessError::InvalidTensorSpec {
            spec: spec.to_string(),
            reason: format!("{:?} is not an element count", rest),
        })?;
        Self::zeroed(dtype, len, TensorRole::Output, index)
    }

    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_host(&self) -> HostTensor<'_> {
        HostTensor {
            dtype: self.dtype,
            len: self.len,
            bytes: &self.bytes,
        }
    }

    pub fn as_host_mut(&mut self) -> HostTensorMut<'_> {
        HostTensorMut {
            dtype: self.dtype,
            len: self.len,
            bytes: &mut self.bytes,
        }
    }

    /// Copy the contents out as `T`, or `None` if `T` is not the tensor's type.
    pub fn values<T: Element>(&self) -> Option<Vec<T>> {
        if T::TYPE != self.dtype {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(std::mem::size_of::<T>())
                .map(bytemuck::pod_read_unaligned::<T>)
                .collect(),
        )
    }

    /// Format every element as text.
    pub fn render(&self) -> Vec<String> {
        crate::with_element_type!(self.dtype, |T| {
            self.bytes
                .chunks_exact(std::mem::size_of::<T>())
                .map(|chunk| bytemuck::pod_read_unaligned::<T>(chunk).to_string())
                .collect()
        })
    }
}

fn split_spec(spec: &str) -> Result<(ElementType, &str), HarnessError> {
    let (name, rest) = spec.split_once(':').ok_or_else(|| HarnessError::InvalidTensorSpec {
        spec: spec.to_string(),
        reason: "expected <dtype>:<values>".to_string(),
    })?;
    let dtype = name
        .trim()
        .parse::<ElementType>()
        .map_err(|reason| HarnessError::InvalidTensorSpec {
            spec: spec.to_string(),
            reason,
        })?;
    Ok((dtype, rest))
}
