// ---------------------------------------------------------------------------
// Converter setup and dispatch.
//
// `PixelConverter::init` inspects a destination/source descriptor pair once,
// picks the cheapest conversion strategy that applies, and bakes everything
// the row kernels need into a `ConverterData`: a function pointer plus a
// strategy-specific payload. `convert` validates arguments and calls through;
// the kernels themselves never fail.
// ---------------------------------------------------------------------------

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::ConvertError;
use crate::format::{CH_A, CH_R, FormatFlags, FormatInfo, NativeKind};
use crate::kernels;

#[cfg(target_arch = "x86_64")]
use crate::kernels::avx2;

/// Intermediate row buffer for multi-step conversions (2048 + 1024 bytes,
/// 768 native pixels).
pub(crate) const MULTI_STEP_BUFFER_SIZE: usize = 2048 + 1024;

pub(crate) type ConvertFn = fn(
    &ConverterData,
    &mut [u8],
    isize,
    &[u8],
    isize,
    usize,
    usize,
    &ConvertOptions,
);

// ===========================================================================
// Flags and options
// ===========================================================================

/// Internal converter state bits.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct InternalFlags(u8);

impl InternalFlags {
    pub(crate) const NONE: Self = Self(0);
    pub(crate) const INITIALIZED: Self = Self(0x01);
    pub(crate) const OPTIMIZED: Self = Self(0x02);
    pub(crate) const RAW_COPY: Self = Self(0x04);
    pub(crate) const MULTI_STEP: Self = Self(0x40);
    /// The payload holds a refcounted table rather than an embedded one.
    pub(crate) const DYNAMIC_DATA: Self = Self(0x80);

    #[inline]
    pub(crate) const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub(crate) fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl core::fmt::Debug for InternalFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let names: [(Self, &str); 5] = [
            (Self::INITIALIZED, "INITIALIZED"),
            (Self::OPTIMIZED, "OPTIMIZED"),
            (Self::RAW_COPY, "RAW_COPY"),
            (Self::MULTI_STEP, "MULTI_STEP"),
            (Self::DYNAMIC_DATA, "DYNAMIC_DATA"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// Setup-time switches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CreateFlags {
    /// Keep every kernel scalar even when a SIMD tier is available.
    pub disable_optimizations: bool,
    /// Only accept bit-identical descriptor pairs; anything else fails with
    /// [`ConvertError::InvalidFormat`]. A diagnostic switch.
    pub raw_copy_only: bool,
}

/// Per-call conversion options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConvertOptions {
    /// Bytes past the end of each destination row to zero-fill.
    pub gap: usize,
    /// Overrides the synthesized alpha when the source has no alpha channel.
    /// Ignored otherwise.
    pub alpha_value: Option<u8>,
}

impl ConvertOptions {
    pub const DEFAULT: Self = Self {
        gap: 0,
        alpha_value: None,
    };
}

// ===========================================================================
// Payloads
// ===========================================================================

/// Copy and copy-OR.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MemCopyData {
    pub(crate) fill_mask: u32,
    pub(crate) alpha_synth: u32,
    pub(crate) byte_swap: bool,
}

/// Palette storage, baked at the destination pixel width so narrow
/// destinations stay single-pass. Embedded tables are deep-copied on clone;
/// dynamic ones are refcount-shared.
#[derive(Clone, Debug)]
pub(crate) enum PaletteTable {
    /// Depths 1/2/4: at most 16 entries, stored inline.
    Embedded8([u8; 16]),
    Embedded16([u16; 16]),
    Embedded32([u32; 16]),
    /// Depth 8: 256 entries behind an `Arc`.
    Dynamic8(Arc<[u8]>),
    Dynamic16(Arc<[u16]>),
    Dynamic32(Arc<[u32]>),
}

#[derive(Clone, Debug)]
pub(crate) struct IndexedData {
    /// Destination alpha bits whose value was synthesized (palette had none).
    pub(crate) alpha_synth: u32,
    pub(crate) byte_swap: bool,
    pub(crate) table: PaletteTable,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct X8FromRgb32Data {
    pub(crate) bytes_per_pixel: u8,
    pub(crate) alpha_shift: u8,
    pub(crate) byte_swap: bool,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Rgb32FromX8Data {
    pub(crate) fill_mask: u32,
    pub(crate) zero_mask: u32,
    pub(crate) alpha_synth: u32,
    pub(crate) byte_swap: bool,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ShufbData {
    pub(crate) fill_mask: u32,
    pub(crate) alpha_synth: u32,
    /// Byte-shuffle control for four pixels; 0x80 selects zero.
    pub(crate) predicate: [u8; 16],
    pub(crate) src_bpp: u8,
    pub(crate) byte_swap: bool,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PremultiplyData {
    pub(crate) alpha_shift: u8,
    pub(crate) fill_mask: u32,
    pub(crate) byte_swap: bool,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct NativeFromForeignData {
    pub(crate) fill_mask: u32,
    pub(crate) alpha_synth: u32,
    pub(crate) shifts: [u8; 4],
    pub(crate) masks: [u32; 4],
    pub(crate) scale: [u32; 4],
    pub(crate) src_bpp: u8,
    pub(crate) byte_swap: bool,
    /// The destination is premultiplied and the source is not.
    pub(crate) premultiply: bool,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ForeignFromNativeData {
    pub(crate) fill_mask: u32,
    pub(crate) alpha_synth: u32,
    pub(crate) shifts: [u8; 4],
    pub(crate) masks: [u32; 4],
    pub(crate) dst_bpp: u8,
    pub(crate) byte_swap: bool,
}

#[derive(Debug)]
pub(crate) struct MultiStepContext {
    pub(crate) first: PixelConverter,
    pub(crate) second: PixelConverter,
}

#[derive(Clone, Debug)]
pub(crate) struct MultiStepData {
    pub(crate) ctx: Arc<MultiStepContext>,
}

#[derive(Clone, Debug)]
pub(crate) enum Payload {
    None,
    MemCopy(MemCopyData),
    Indexed(IndexedData),
    X8FromRgb32(X8FromRgb32Data),
    Rgb32FromX8(Rgb32FromX8Data),
    Shufb(ShufbData),
    Premultiply(PremultiplyData),
    NativeFromForeign(NativeFromForeignData),
    ForeignFromNative(ForeignFromNativeData),
    MultiStep(MultiStepData),
}

/// Everything a kernel invocation needs, fixed at setup time.
#[derive(Clone, Debug)]
pub(crate) struct ConverterData {
    pub(crate) convert_fn: ConvertFn,
    pub(crate) flags: InternalFlags,
    pub(crate) dst_depth: u8,
    pub(crate) src_depth: u8,
    pub(crate) payload: Payload,
}

impl ConverterData {
    pub(crate) fn as_mem_copy(&self) -> &MemCopyData {
        match &self.payload {
            Payload::MemCopy(p) => p,
            _ => unreachable!("payload does not match kernel"),
        }
    }

    pub(crate) fn as_indexed(&self) -> &IndexedData {
        match &self.payload {
            Payload::Indexed(p) => p,
            _ => unreachable!("payload does not match kernel"),
        }
    }

    pub(crate) fn as_x8_from_rgb32(&self) -> &X8FromRgb32Data {
        match &self.payload {
            Payload::X8FromRgb32(p) => p,
            _ => unreachable!("payload does not match kernel"),
        }
    }

    pub(crate) fn as_rgb32_from_x8(&self) -> &Rgb32FromX8Data {
        match &self.payload {
            Payload::Rgb32FromX8(p) => p,
            _ => unreachable!("payload does not match kernel"),
        }
    }

    pub(crate) fn as_shufb(&self) -> &ShufbData {
        match &self.payload {
            Payload::Shufb(p) => p,
            _ => unreachable!("payload does not match kernel"),
        }
    }

    pub(crate) fn as_premultiply(&self) -> &PremultiplyData {
        match &self.payload {
            Payload::Premultiply(p) => p,
            _ => unreachable!("payload does not match kernel"),
        }
    }

    pub(crate) fn as_native_from_foreign(&self) -> &NativeFromForeignData {
        match &self.payload {
            Payload::NativeFromForeign(p) => p,
            _ => unreachable!("payload does not match kernel"),
        }
    }

    pub(crate) fn as_foreign_from_native(&self) -> &ForeignFromNativeData {
        match &self.payload {
            Payload::ForeignFromNative(p) => p,
            _ => unreachable!("payload does not match kernel"),
        }
    }

    pub(crate) fn as_multi_step(&self) -> &MultiStepData {
        match &self.payload {
            Payload::MultiStep(p) => p,
            _ => unreachable!("payload does not match kernel"),
        }
    }
}

fn convert_noop(
    _d: &ConverterData,
    _dst: &mut [u8],
    _dst_stride: isize,
    _src: &[u8],
    _src_stride: isize,
    _width: usize,
    _height: usize,
    _options: &ConvertOptions,
) {
}

// ===========================================================================
// SIMD tier probing
// ===========================================================================

fn simd_available() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        use archmage::prelude::*;
        X64V3Token::summon().is_some()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

enum Accel {
    CopyOr,
    Shufb,
    Premultiply,
}

fn accelerate(variant: Accel, optimize: bool) -> Option<ConvertFn> {
    if !optimize {
        return None;
    }
    #[cfg(target_arch = "x86_64")]
    {
        Some(match variant {
            Accel::CopyOr => avx2::convert_copy_or_8888_v3,
            Accel::Shufb => avx2::convert_shufb_8888_v3,
            Accel::Premultiply => avx2::convert_premultiply_8888_v3,
        })
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = variant;
        None
    }
}

// ===========================================================================
// PixelConverter
// ===========================================================================

/// A compiled conversion between two pixel layouts.
///
/// Construction inspects the descriptor pair once and selects the cheapest
/// applicable strategy; each [`convert`](Self::convert) call then runs a
/// fixed kernel with no per-call format logic. Converters are cheap to
/// clone (large tables are refcount-shared) and safe to use from multiple
/// threads concurrently.
#[derive(Clone, Debug)]
pub struct PixelConverter {
    pub(crate) data: ConverterData,
}

impl PixelConverter {
    /// An uninitialized converter; [`convert`](Self::convert) fails with
    /// [`ConvertError::NotInitialized`] until [`init`](Self::init) replaces it.
    pub fn new() -> Self {
        Self {
            data: ConverterData {
                convert_fn: convert_noop,
                flags: InternalFlags::NONE,
                dst_depth: 0,
                src_depth: 0,
                payload: Payload::None,
            },
        }
    }

    /// Build a converter from `src` pixels to `dst` pixels.
    ///
    /// Fails with [`ConvertError::InvalidFormat`] when either descriptor is
    /// inconsistent or the pair is unsupported; a failed init never yields a
    /// partially initialized converter.
    pub fn init(
        dst: &FormatInfo,
        src: &FormatInfo,
        flags: CreateFlags,
    ) -> Result<Self, ConvertError> {
        Ok(Self {
            data: select(dst, src, flags)?,
        })
    }

    /// Return to the uninitialized state, releasing any shared tables.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.data.flags.contains(InternalFlags::INITIALIZED)
    }

    /// A SIMD kernel was selected for this pair.
    #[inline]
    pub fn is_optimized(&self) -> bool {
        self.data.flags.contains(InternalFlags::OPTIMIZED)
    }

    /// The two layouts are bit-identical; conversion is a row copy.
    #[inline]
    pub fn is_raw_copy(&self) -> bool {
        self.data.flags.contains(InternalFlags::RAW_COPY)
    }

    /// Conversion routes through a native 32-bit intermediate.
    #[inline]
    pub fn is_multi_step(&self) -> bool {
        self.data.flags.contains(InternalFlags::MULTI_STEP)
    }

    /// Convert a `width` × `height` region.
    ///
    /// Strides are in bytes and may be negative, meaning that image's rows
    /// are stored bottom-up. Row byte counts honor sub-byte indexed depths.
    /// All argument checks happen before any byte is written; on success the
    /// full region is converted.
    #[allow(clippy::too_many_arguments)]
    pub fn convert(
        &self,
        dst: &mut [u8],
        dst_stride: isize,
        src: &[u8],
        src_stride: isize,
        width: usize,
        height: usize,
        options: Option<&ConvertOptions>,
    ) -> Result<(), ConvertError> {
        if !self.is_initialized() {
            return Err(ConvertError::NotInitialized);
        }
        if width == 0 || height == 0 {
            return Err(ConvertError::InvalidArgument);
        }
        let opts = options.copied().unwrap_or(ConvertOptions::DEFAULT);

        let src_row = checked_row_bytes(width, self.data.src_depth)?;
        let dst_row = checked_row_bytes(width, self.data.dst_depth)?
            .checked_add(opts.gap)
            .ok_or(ConvertError::InvalidArgument)?;

        check_extent(src.len(), src_stride, src_row, height)?;
        check_extent(dst.len(), dst_stride, dst_row, height)?;

        (self.data.convert_fn)(
            &self.data, dst, dst_stride, src, src_stride, width, height, &opts,
        );
        Ok(())
    }
}

impl Default for PixelConverter {
    fn default() -> Self {
        Self::new()
    }
}

fn checked_row_bytes(width: usize, depth: u8) -> Result<usize, ConvertError> {
    let bits = width
        .checked_mul(usize::from(depth))
        .ok_or(ConvertError::InvalidArgument)?;
    Ok(bits.div_ceil(8))
}

fn check_extent(
    len: usize,
    stride: isize,
    row: usize,
    height: usize,
) -> Result<(), ConvertError> {
    let stride_abs = stride.unsigned_abs();
    if stride_abs < row {
        return Err(ConvertError::InvalidArgument);
    }
    let total = (height - 1)
        .checked_mul(stride_abs)
        .and_then(|v| v.checked_add(row))
        .ok_or(ConvertError::InvalidArgument)?;
    if len < total {
        return Err(ConvertError::InvalidArgument);
    }
    Ok(())
}

// ===========================================================================
// Strategy selection
// ===========================================================================

fn same_rgb_layout(a: &FormatInfo, b: &FormatInfo) -> bool {
    a.sizes[..3] == b.sizes[..3] && a.shifts[..3] == b.shifts[..3]
}

fn select(
    dst: &FormatInfo,
    src: &FormatInfo,
    flags: CreateFlags,
) -> Result<ConverterData, ConvertError> {
    dst.sanitize()?;
    src.sanitize()?;

    let mut out = ConverterData {
        convert_fn: kernels::convert_copy,
        flags: InternalFlags::INITIALIZED,
        dst_depth: dst.depth,
        src_depth: src.depth,
        payload: Payload::None,
    };

    // Bit-identical layouts degrade to a row copy.
    if dst == src {
        out.flags.insert(InternalFlags::RAW_COPY);
        return Ok(out);
    }
    if flags.raw_copy_only {
        return Err(ConvertError::InvalidFormat);
    }
    // Indexed and greyscale destinations would need quantization or a
    // colorimetric transform; neither belongs here.
    if dst.is_indexed() || dst.flags.contains(FormatFlags::LUM) {
        return Err(ConvertError::InvalidFormat);
    }

    let optimize = !flags.disable_optimizations && simd_available();

    // Palette expansion: single-pass for byte-multiple destinations the
    // table can be baked for; 24-bit destinations take the two-step route.
    if src.is_indexed() {
        if matches!(dst.depth, 8 | 16 | 32) {
            select_indexed(&mut out, dst, src)?;
            return Ok(out);
        }
        return select_multi_step(dst, src, flags);
    }

    // Same 32-bit container family: copy-OR and (un)premultiply.
    if dst.depth == 32
        && src.depth == 32
        && dst.byte_swap() == src.byte_swap()
        && same_rgb_layout(dst, src)
    {
        let same_alpha = dst.sizes[CH_A] == src.sizes[CH_A] && dst.shifts[CH_A] == src.shifts[CH_A];
        // The (un)premultiply kernels work on byte lanes; layouts with
        // narrower channels take the multi-step route instead.
        let byte_channels = dst.byte_map().is_some();
        if byte_channels
            && same_alpha
            && dst.has_alpha()
            && src.has_alpha()
            && dst.is_premultiplied() != src.is_premultiplied()
        {
            select_premultiply(&mut out, dst, src, dst.is_premultiplied(), optimize);
            return Ok(out);
        }
        if byte_channels && src.is_premultiplied() && !dst.has_alpha() {
            // Dropping the alpha of a premultiplied source requires the
            // colors back in straight form first.
            select_premultiply(&mut out, dst, src, false, optimize);
            return Ok(out);
        }
        if (!src.is_premultiplied() || !src.has_alpha())
            && (!src.has_alpha() || !dst.has_alpha() || same_alpha)
            && (dst.is_premultiplied() == src.is_premultiplied() || !src.has_alpha() || !dst.has_alpha())
        {
            let fill = dst.unused_bits() | (dst.used_bits() & !src.used_bits());
            let alpha_synth = if dst.has_alpha() && !src.has_alpha() {
                dst.mask(CH_A)
            } else {
                0
            };
            out.payload = Payload::MemCopy(MemCopyData {
                fill_mask: fill,
                alpha_synth,
                byte_swap: dst.byte_swap(),
            });
            out.convert_fn = kernels::convert_copy_or_8888;
            if let Some(f) = accelerate(Accel::CopyOr, optimize) {
                out.convert_fn = f;
                out.flags.insert(InternalFlags::OPTIMIZED);
            }
            return Ok(out);
        }
    }

    // Byte shuffle between byte-aligned 24/32-bit layouts.
    if dst.depth == 32
        && matches!(src.depth, 24 | 32)
        && (dst.is_premultiplied() == src.is_premultiplied() || !src.has_alpha())
        && let (Some(dmap), Some(smap)) = (dst.byte_map(), src.byte_map())
    {
        let sbpp = src.bytes_per_pixel();
        let mut predicate = [0x80u8; 16];
        let mut fill = dst.unused_bits();
        let mut alpha_synth = 0;
        for ch in 0..4 {
            match (dmap[ch], smap[ch]) {
                (Some(db), Some(sb)) => {
                    for k in 0..4 {
                        predicate[k * 4 + usize::from(db)] = (k * sbpp) as u8 + sb;
                    }
                }
                (Some(_), None) => {
                    fill |= dst.mask(ch);
                    if ch == CH_A {
                        alpha_synth = dst.mask(CH_A);
                    }
                }
                _ => {}
            }
        }
        out.payload = Payload::Shufb(ShufbData {
            fill_mask: fill,
            alpha_synth,
            predicate,
            src_bpp: sbpp as u8,
            byte_swap: dst.byte_swap(),
        });
        out.convert_fn = kernels::convert_shufb_8888;
        if sbpp == 4
            && let Some(f) = accelerate(Accel::Shufb, optimize)
        {
            out.convert_fn = f;
            out.flags.insert(InternalFlags::OPTIMIZED);
        }
        return Ok(out);
    }

    // A8 destination: plain alpha extraction.
    if dst.depth == 8
        && dst.sizes == [0, 0, 0, 8]
        && src.depth == 32
        && src.has_alpha()
        && src.byte_map().is_some()
    {
        out.payload = Payload::X8FromRgb32(X8FromRgb32Data {
            bytes_per_pixel: 4,
            alpha_shift: src.shifts[CH_A],
            byte_swap: src.byte_swap(),
        });
        out.convert_fn = kernels::convert_a8_from_8888;
        return Ok(out);
    }

    // A8/L8 source into a byte-aligned 32-bit destination. The replication
    // kernel needs a full 8-bit luma and no source alpha; narrower LUM
    // layouts (a luma nibble, greyscale-with-alpha) go through the generic
    // per-channel extraction instead.
    if src.depth == 8 && dst.depth == 32 && dst.byte_map().is_some() {
        let rgb_mask = dst.mask(0) | dst.mask(1) | dst.mask(2);
        let payload = if src.flags.contains(FormatFlags::LUM)
            && src.sizes[CH_R] == 8
            && !src.has_alpha()
        {
            Rgb32FromX8Data {
                fill_mask: dst.mask(CH_A) | dst.unused_bits(),
                zero_mask: !rgb_mask,
                alpha_synth: dst.mask(CH_A),
                byte_swap: dst.byte_swap(),
            }
        } else if src.sizes == [0, 0, 0, 8] {
            if dst.is_premultiplied() {
                // Premultiplied white: every channel carries the alpha value.
                Rgb32FromX8Data {
                    fill_mask: dst.unused_bits(),
                    zero_mask: !dst.used_bits(),
                    alpha_synth: 0,
                    byte_swap: dst.byte_swap(),
                }
            } else if dst.has_alpha() {
                Rgb32FromX8Data {
                    fill_mask: rgb_mask | dst.unused_bits(),
                    zero_mask: !dst.mask(CH_A),
                    alpha_synth: 0,
                    byte_swap: dst.byte_swap(),
                }
            } else {
                Rgb32FromX8Data {
                    fill_mask: rgb_mask | dst.unused_bits(),
                    zero_mask: u32::MAX,
                    alpha_synth: 0,
                    byte_swap: dst.byte_swap(),
                }
            }
        } else {
            // An 8-bit source with sub-byte channels goes the generic route.
            return select_generic(out, dst, src, flags);
        };
        out.payload = Payload::Rgb32FromX8(payload);
        out.convert_fn = kernels::convert_8888_from_x8;
        return Ok(out);
    }

    select_generic(out, dst, src, flags)
}

/// Generic repack through the native value order, or multi-step when neither
/// side is native.
fn select_generic(
    mut out: ConverterData,
    dst: &FormatInfo,
    src: &FormatInfo,
    flags: CreateFlags,
) -> Result<ConverterData, ConvertError> {
    if let Some(kind) = dst.native_kind() {
        let applicable = match kind {
            NativeKind::Xrgb | NativeKind::Argb => !src.is_premultiplied(),
            NativeKind::Prgb => true,
        };
        if applicable {
            let opaque = !src.has_alpha();
            out.payload = Payload::NativeFromForeign(NativeFromForeignData {
                fill_mask: 0xFF00_0000,
                alpha_synth: if kind != NativeKind::Xrgb && opaque {
                    0xFF00_0000
                } else {
                    0
                },
                shifts: src.shifts,
                masks: core::array::from_fn(|ch| src.mask(ch)),
                scale: core::array::from_fn(|ch| {
                    if src.sizes[ch] > 0 {
                        kernels::scale_factor(src.sizes[ch])
                    } else {
                        0
                    }
                }),
                src_bpp: src.bytes_per_pixel() as u8,
                byte_swap: src.byte_swap(),
                premultiply: kind == NativeKind::Prgb && !src.is_premultiplied(),
            });
            out.convert_fn = match kind {
                NativeKind::Argb => kernels::convert_argb32_from_foreign,
                NativeKind::Xrgb => kernels::convert_xrgb32_from_foreign,
                NativeKind::Prgb => kernels::convert_prgb32_from_foreign,
            };
            return Ok(out);
        }
    }

    if let Some(kind) = src.native_kind() {
        let mut masks: [u32; 4] = core::array::from_fn(|ch| dst.mask(ch));
        let mut fill = dst.unused_bits();
        let mut alpha_synth = 0;
        if dst.has_alpha() && kind == NativeKind::Xrgb {
            // The source's top byte is filler; synthesize opaque alpha.
            masks[CH_A] = 0;
            fill |= dst.mask(CH_A);
            alpha_synth = dst.mask(CH_A);
        }
        out.payload = Payload::ForeignFromNative(ForeignFromNativeData {
            fill_mask: fill,
            alpha_synth,
            shifts: dst.shifts,
            masks,
            dst_bpp: dst.bytes_per_pixel() as u8,
            byte_swap: dst.byte_swap(),
        });
        out.convert_fn = match (kind, dst.is_premultiplied()) {
            (NativeKind::Argb, true) => kernels::convert_foreign_premul_from_argb32,
            (NativeKind::Prgb, false) => kernels::convert_foreign_from_prgb32,
            _ => kernels::convert_foreign_from_argb32,
        };
        return Ok(out);
    }

    select_multi_step(dst, src, flags)
}

fn select_premultiply(
    out: &mut ConverterData,
    dst: &FormatInfo,
    src: &FormatInfo,
    premultiply: bool,
    optimize: bool,
) {
    let alpha_shift = src.shifts[CH_A];
    out.payload = Payload::Premultiply(PremultiplyData {
        alpha_shift,
        fill_mask: dst.unused_bits(),
        byte_swap: dst.byte_swap(),
    });
    out.convert_fn = if premultiply {
        kernels::convert_premultiply_8888
    } else {
        kernels::convert_unpremultiply_8888
    };
    if premultiply
        && matches!(alpha_shift, 0 | 24)
        && !dst.byte_swap()
        && let Some(f) = accelerate(Accel::Premultiply, optimize)
    {
        out.convert_fn = f;
        out.flags.insert(InternalFlags::OPTIMIZED);
    }
}

fn baked_table<T>(count: usize, f: impl Fn(usize) -> T) -> Result<Arc<[T]>, ConvertError> {
    let mut entries: Vec<T> = Vec::new();
    entries
        .try_reserve_exact(count)
        .map_err(|_| ConvertError::OutOfMemory)?;
    entries.extend((0..count).map(f));
    Ok(entries.into())
}

fn embedded_table<T: Copy + Default>(count: usize, f: impl Fn(usize) -> T) -> [T; 16] {
    let mut entries = [T::default(); 16];
    for (i, e) in entries.iter_mut().take(count).enumerate() {
        *e = f(i);
    }
    entries
}

/// Bake the palette into destination-layout pixels at the destination width.
fn select_indexed(
    out: &mut ConverterData,
    dst: &FormatInfo,
    src: &FormatInfo,
) -> Result<(), ConvertError> {
    let palette = src.palette.as_deref().unwrap_or(&[]);
    let count = 1usize << src.depth;
    let pack = |i: usize| -> u32 {
        let mut argb = palette.get(i).copied().unwrap_or(0);
        if !src.has_alpha() {
            argb |= 0xFF00_0000;
        }
        if dst.is_premultiplied() {
            argb = kernels::premultiply_px(argb, 24);
        }
        let mut packed = dst.unused_bits();
        for ch in 0..4 {
            if dst.sizes[ch] > 0 {
                let v = (argb >> kernels::NATIVE_SHIFTS[ch]) & 0xFF;
                packed |= (v >> (8 - u32::from(dst.sizes[ch]))) << dst.shifts[ch];
            }
        }
        packed
    };

    let table = if src.depth == 8 {
        out.flags.insert(InternalFlags::DYNAMIC_DATA);
        match dst.bytes_per_pixel() {
            1 => PaletteTable::Dynamic8(baked_table(count, |i| pack(i) as u8)?),
            2 => PaletteTable::Dynamic16(baked_table(count, |i| pack(i) as u16)?),
            _ => PaletteTable::Dynamic32(baked_table(count, pack)?),
        }
    } else {
        match dst.bytes_per_pixel() {
            1 => PaletteTable::Embedded8(embedded_table(count, |i| pack(i) as u8)),
            2 => PaletteTable::Embedded16(embedded_table(count, |i| pack(i) as u16)),
            _ => PaletteTable::Embedded32(embedded_table(count, pack)),
        }
    };

    out.payload = Payload::Indexed(IndexedData {
        alpha_synth: if src.has_alpha() { 0 } else { dst.mask(CH_A) },
        byte_swap: dst.byte_swap(),
        table,
    });
    out.convert_fn = if src.depth == 8 {
        kernels::convert_index8
    } else {
        kernels::convert_index_packed
    };
    Ok(())
}

/// Split an unsupported pair into foreign→native and native→foreign legs.
fn select_multi_step(
    dst: &FormatInfo,
    src: &FormatInfo,
    flags: CreateFlags,
) -> Result<ConverterData, ConvertError> {
    let mid = if src.is_premultiplied() {
        FormatInfo::prgb32()
    } else {
        FormatInfo::argb32()
    };
    let first = PixelConverter::init(&mid, src, flags)?;
    let second = PixelConverter::init(dst, &mid, flags)?;
    if first.is_multi_step() || second.is_multi_step() {
        return Err(ConvertError::InvalidFormat);
    }
    let mut f = InternalFlags::INITIALIZED;
    f.insert(InternalFlags::MULTI_STEP);
    if first.is_optimized() || second.is_optimized() {
        f.insert(InternalFlags::OPTIMIZED);
    }
    Ok(ConverterData {
        convert_fn: kernels::convert_multi_step,
        flags: f,
        dst_depth: dst.depth,
        src_depth: src.depth,
        payload: Payload::MultiStep(MultiStepData {
            ctx: Arc::new(MultiStepContext { first, second }),
        }),
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn converter(dst: &FormatInfo, src: &FormatInfo) -> PixelConverter {
        PixelConverter::init(dst, src, CreateFlags::default()).unwrap()
    }

    #[test]
    fn identical_formats_are_raw_copy() {
        let c = converter(&FormatInfo::prgb32(), &FormatInfo::prgb32());
        assert!(c.is_initialized());
        assert!(c.is_raw_copy());
        assert!(!c.is_multi_step());
    }

    #[test]
    fn raw_copy_only_rejects_everything_else() {
        let flags = CreateFlags {
            raw_copy_only: true,
            ..CreateFlags::default()
        };
        assert!(PixelConverter::init(&FormatInfo::a8(), &FormatInfo::a8(), flags).is_ok());
        assert_eq!(
            PixelConverter::init(&FormatInfo::prgb32(), &FormatInfo::argb32(), flags).unwrap_err(),
            ConvertError::InvalidFormat
        );
    }

    #[test]
    fn invalid_descriptor_rejected_at_init() {
        let bad = FormatInfo {
            depth: 8,
            flags: FormatFlags::NONE,
            sizes: [3, 3, 2, 0],
            shifts: [5, 2, 0, 0],
            palette: None,
        };
        assert_eq!(
            PixelConverter::init(&FormatInfo::prgb32(), &bad, CreateFlags::default()).unwrap_err(),
            ConvertError::InvalidFormat
        );
    }

    #[test]
    fn greyscale_destination_unsupported() {
        assert_eq!(
            PixelConverter::init(&FormatInfo::l8(), &FormatInfo::argb32(), CreateFlags::default())
                .unwrap_err(),
            ConvertError::InvalidFormat
        );
        // Identity still works.
        assert!(converter(&FormatInfo::l8(), &FormatInfo::l8()).is_raw_copy());
    }

    #[test]
    fn dynamic_table_only_for_depth_8() {
        let pal: Arc<[u32]> = vec![0xFF112233u32; 16].into();
        let c8 = converter(
            &FormatInfo::prgb32(),
            &FormatInfo::indexed(8, pal.clone(), false).unwrap(),
        );
        assert!(c8.data.flags.contains(InternalFlags::DYNAMIC_DATA));

        let c4 = converter(
            &FormatInfo::prgb32(),
            &FormatInfo::indexed(4, pal, false).unwrap(),
        );
        assert!(!c4.data.flags.contains(InternalFlags::DYNAMIC_DATA));
    }

    #[test]
    fn clones_share_dynamic_tables() {
        let pal: Arc<[u32]> = vec![0x80204060u32; 200].into();
        let c = converter(
            &FormatInfo::argb32(),
            &FormatInfo::indexed(8, pal, true).unwrap(),
        );
        let copy = c.clone();
        let (a, b) = match (&c.data.payload, &copy.data.payload) {
            (Payload::Indexed(a), Payload::Indexed(b)) => (a, b),
            other => panic!("unexpected payloads: {other:?}"),
        };
        match (&a.table, &b.table) {
            (PaletteTable::Dynamic32(ta), PaletteTable::Dynamic32(tb)) => {
                assert!(Arc::ptr_eq(ta, tb));
                assert_eq!(Arc::strong_count(ta), 2);
            }
            other => panic!("expected dynamic tables: {other:?}"),
        }
    }

    #[test]
    fn indexed_tables_bake_at_destination_width() {
        let pal: Arc<[u32]> = vec![0xFF336699u32; 16].into();
        let table_of = |dst: &FormatInfo| {
            let c = converter(dst, &FormatInfo::indexed(4, pal.clone(), false).unwrap());
            match c.data.payload {
                Payload::Indexed(p) => p.table,
                other => panic!("unexpected payload: {other:?}"),
            }
        };
        assert!(matches!(table_of(&FormatInfo::a8()), PaletteTable::Embedded8(_)));
        assert!(matches!(
            table_of(&FormatInfo::rgb565()),
            PaletteTable::Embedded16(_)
        ));
        assert!(matches!(
            table_of(&FormatInfo::prgb32()),
            PaletteTable::Embedded32(_)
        ));
    }

    #[test]
    fn multi_step_for_disjoint_foreign_pairs() {
        let c = converter(&FormatInfo::argb4444(), &FormatInfo::rgb565());
        assert!(c.is_multi_step());
    }

    #[test]
    fn convert_argument_validation() {
        let c = converter(&FormatInfo::prgb32(), &FormatInfo::xrgb32());
        let src = [0u8; 16];
        let mut dst = [0u8; 16];

        // zero dimensions
        assert_eq!(
            c.convert(&mut dst, 16, &src, 16, 0, 1, None),
            Err(ConvertError::InvalidArgument)
        );
        // stride below one row
        assert_eq!(
            c.convert(&mut dst, 8, &src, 16, 4, 1, None),
            Err(ConvertError::InvalidArgument)
        );
        // destination too short for the gap
        let gap = ConvertOptions {
            gap: 4,
            alpha_value: None,
        };
        assert_eq!(
            c.convert(&mut dst, 20, &src, 16, 4, 1, Some(&gap)),
            Err(ConvertError::InvalidArgument)
        );
        // source too short
        assert_eq!(
            c.convert(&mut dst, 16, &src[..12], 16, 4, 1, None),
            Err(ConvertError::InvalidArgument)
        );
        assert!(c.convert(&mut dst, 16, &src, 16, 4, 1, None).is_ok());
    }

    #[test]
    fn uninitialized_converter_errors() {
        let c = PixelConverter::new();
        assert!(!c.is_initialized());
        let mut dst = [0u8; 4];
        assert_eq!(
            c.convert(&mut dst, 4, &[0u8; 4], 4, 1, 1, None),
            Err(ConvertError::NotInitialized)
        );
    }

    #[test]
    fn reset_returns_to_uninitialized() {
        let mut c = converter(&FormatInfo::prgb32(), &FormatInfo::argb32());
        assert!(c.is_initialized());
        c.reset();
        assert!(!c.is_initialized());
    }

    #[test]
    fn converter_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PixelConverter>();
    }
}
