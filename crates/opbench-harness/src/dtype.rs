//! Element types shared with the operator code generator.
//!
//! The numeric tags are part of the contract with generated libraries and
//! must never be renumbered.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Tag the generator uses for "no type"; never accepted by the harness.
pub const TAG_UNDEFINED: i32 = 0;
/// Tag the generator uses for half precision; declared but not supported here.
pub const TAG_FLOAT16: i32 = 1;

/// Numeric kinds a tensor parameter may carry.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F32 = 2,
    F64 = 3,
    I8 = 4,
    I16 = 5,
    I32 = 6,
    I64 = 7,
    U8 = 8,
    U16 = 9,
    U32 = 10,
    U64 = 11,
}

impl ElementType {
    /// Every supported element type, in tag order.
    pub const ALL: [ElementType; 10] = [
        ElementType::F32,
        ElementType::F64,
        ElementType::I8,
        ElementType::I16,
        ElementType::I32,
        ElementType::I64,
        ElementType::U8,
        ElementType::U16,
        ElementType::U32,
        ElementType::U64,
    ];

    /// Map a raw tag to an element type. `None` for anything the harness
    /// cannot stage, including the generator's undefined and half tags.
    pub fn from_tag(tag: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }

    pub fn tag(self) -> i32 {
        self as i32
    }

    /// Size in bytes of a single element.
    pub fn size_of(self) -> usize {
        crate::with_element_type!(self, |T| std::mem::size_of::<T>())
    }

    /// Number of bytes needed to store `count` elements, or `None` on overflow.
    pub fn byte_size(self, count: usize) -> Option<usize> {
        count.checked_mul(self.size_of())
    }

    /// Short lowercase name (`f32`, `u16`, ...).
    pub fn name(self) -> &'static str {
        match self {
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
            ElementType::I8 => "i8",
            ElementType::I16 => "i16",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
            ElementType::U8 => "u8",
            ElementType::U16 => "u16",
            ElementType::U32 => "u32",
            ElementType::U64 => "u64",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ElementType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        let name = match lower.as_str() {
            "float32" | "float" => "f32",
            "float64" | "double" => "f64",
            "int8" => "i8",
            "int16" => "i16",
            "int32" => "i32",
            "int64" => "i64",
            "uint8" => "u8",
            "uint16" => "u16",
            "uint32" => "u32",
            "uint64" => "u64",
            other => other,
        };
        Self::ALL
            .into_iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| format!("unknown element type: {}", s))
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Rust primitive that backs an [`ElementType`].
pub trait Element: bytemuck::Pod + fmt::Display + sealed::Sealed {
    const TYPE: ElementType;

    /// Parse a single value from its decimal text form.
    fn parse_value(text: &str) -> Option<Self>;
}

macro_rules! impl_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Element for $ty {
                const TYPE: ElementType = ElementType::$variant;

                fn parse_value(text: &str) -> Option<Self> {
                    text.trim().parse().ok()
                }
            }
        )*
    };
}

impl_element! {
    f32 => F32,
    f64 => F64,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
}

/// Run `$body` with `$t` bound to the Rust type behind a runtime
/// [`ElementType`]. This is the one place the ten-way branch lives.
///
/// ```
/// use opbench_harness::{with_element_type, ElementType};
/// let bytes = with_element_type!(ElementType::U16, |T| std::mem::size_of::<T>() * 3);
/// assert_eq!(bytes, 6);
/// ```
#[macro_export]
macro_rules! with_element_type {
    ($dtype:expr, |$t:ident| $body:expr) => {
        match $dtype {
            $crate::ElementType::F32 => {
                type $t = f32;
                $body
            }
            $crate::ElementType::F64 => {
                type $t = f64;
                $body
            }
            $crate::ElementType::I8 => {
                type $t = i8;
                $body
            }
            $crate::ElementType::I16 => {
                type $t = i16;
                $body
            }
            $crate::ElementType::I32 => {
                type $t = i32;
                $body
            }
            $crate::ElementType::I64 => {
                type $t = i64;
                $body
            }
            $crate::ElementType::U8 => {
                type $t = u8;
                $body
            }
            $crate::ElementType::U16 => {
                type $t = u16;
                $body
            }
            $crate::ElementType::U32 => {
                type $t = u32;
                $body
            }
            $crate::ElementType::U64 => {
                type $t = u64;
                $body
            }
        }
    };
}
