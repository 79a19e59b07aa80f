//! # bespoke
//!
//! *Made-to-measure pixel format converters.*
//!
//! Off-the-rack converters never quite fit. Hand this crate the measurements
//! of your two pixel layouts — channel sizes, shifts, alpha, palette — and it
//! tailors a converter once, up front, so every row after that is a straight
//! stitch: a memcpy, a byte shuffle, a (un)premultiply pass, or a palette
//! lookup, SIMD-accelerated where the CPU allows and scalar everywhere else.
//!
//! ## Usage
//!
//! Describe the destination and source with [`FormatInfo`], build a
//! [`PixelConverter`], then call [`PixelConverter::convert`] as many times as
//! you like:
//!
//! ```
//! use bespoke::{FormatInfo, PixelConverter};
//!
//! // RGBA bytes in memory -> premultiplied BGRA (native ARGB32 words).
//! let src = FormatInfo::rgba32();
//! let dst = FormatInfo::prgb32();
//! let c = PixelConverter::init(&dst, &src, Default::default()).unwrap();
//!
//! let pixels = [0x10u8, 0x20, 0x40, 0x80]; // R, G, B, A
//! let mut out = [0u8; 4];
//! c.convert(&mut out, 4, &pixels, 4, 1, 1, None).unwrap();
//! ```
//!
//! Construction does all the validation and algorithm selection; the convert
//! call only checks the geometry of the buffers it was handed.
//!
//! ## Feature flags
//!
//! - **`std`** (default) — runtime CPU feature detection. Without it the
//!   crate is `no_std` and uses compile-time-enabled SIMD only.

#![no_std]
#![forbid(unsafe_code)]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

mod convert;
mod error;
mod format;
mod kernels;

pub use convert::{ConvertOptions, CreateFlags, PixelConverter};
pub use error::ConvertError;
pub use format::{FormatFlags, FormatInfo};
