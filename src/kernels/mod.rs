// ---------------------------------------------------------------------------
// Conversion kernels.
//
// Every kernel shares one signature (`ConvertFn` in `convert`): it receives
// the converter payload, both buffers with signed strides, the region size
// and the per-call options. Validation happens before dispatch; kernels are
// infallible and always convert the full region.
//
// Scalar implementations live here. AVX2 variants (`avx2` submodule) follow
// the #[rite] row / #[arcane] strided-loop split and fall back to the scalar
// kernel when the CPU tier is absent.
// ---------------------------------------------------------------------------

use crate::convert::{ConvertOptions, ConverterData, PaletteTable};
use crate::format::{CH_A, CH_B, CH_G, CH_R};

#[cfg(target_arch = "x86_64")]
pub(crate) mod avx2;

/// Bit shift of each channel within the native ARGB32 value (R, G, B, A).
pub(crate) const NATIVE_SHIFTS: [u32; 4] = [16, 8, 0, 24];

// ===========================================================================
// Shared helpers
// ===========================================================================

/// Rounding divide by 255, exact for inputs up to 255 * 255.
#[inline(always)]
pub(crate) fn udiv255(x: u32) -> u32 {
    (x + 128 + ((x + 128) >> 8)) >> 8
}

/// Rounding `c * 255 / a` clamped to 255; transparent pixels map to zero.
#[inline(always)]
pub(crate) fn unpremul_div(c: u32, a: u32) -> u32 {
    if a == 0 {
        0
    } else {
        ((c * 255 + a / 2) / a).min(255)
    }
}

/// Fixed-point factor mapping an n-bit channel onto 0..=255.
///
/// Applied as `(v * scale + 0x8000) >> 16`, which is exact at both endpoints
/// for every supported size.
#[inline]
pub(crate) fn scale_factor(size: u8) -> u32 {
    let max = (1u32 << size) - 1;
    (255u32 << 16) / max
}

/// Byte offset of row `y`; a negative stride stores rows bottom-up.
#[inline(always)]
pub(crate) fn row_offset(stride: isize, y: usize, height: usize) -> usize {
    if stride >= 0 {
        y * (stride as usize)
    } else {
        (height - 1 - y) * stride.unsigned_abs()
    }
}

/// Bytes covered by `width` pixels at `depth` bits per pixel.
#[inline(always)]
pub(crate) fn row_bytes(width: usize, depth: u8) -> usize {
    (width * usize::from(depth)).div_ceil(8)
}

/// Zero the `gap` bytes following a destination row.
#[inline]
pub(crate) fn fill_gap(dst: &mut [u8], start: usize, gap: usize) {
    dst[start..start + gap].fill(0);
}

/// Reverse the byte order of a pixel value within `bpp` bytes.
#[inline(always)]
pub(crate) fn swap_px(v: u32, bpp: usize) -> u32 {
    match bpp {
        2 => ((v >> 8) | (v << 8)) & 0xFFFF,
        3 => ((v >> 16) & 0xFF) | (v & 0xFF00) | ((v & 0xFF) << 16),
        4 => v.swap_bytes(),
        _ => v,
    }
}

/// Read one 1/2/3/4-byte little-endian pixel, optionally byte-swapped.
#[inline(always)]
pub(crate) fn load_px(src: &[u8], bpp: usize, swap: bool) -> u32 {
    let v = match bpp {
        1 => u32::from(src[0]),
        2 => u32::from(u16::from_le_bytes([src[0], src[1]])),
        3 => u32::from(src[0]) | (u32::from(src[1]) << 8) | (u32::from(src[2]) << 16),
        _ => u32::from_le_bytes([src[0], src[1], src[2], src[3]]),
    };
    if swap { swap_px(v, bpp) } else { v }
}

/// Write one 1/2/3/4-byte pixel, optionally byte-swapped.
#[inline(always)]
pub(crate) fn store_px(dst: &mut [u8], v: u32, bpp: usize, swap: bool) {
    let v = if swap { swap_px(v, bpp) } else { v };
    let b = v.to_le_bytes();
    dst[..bpp].copy_from_slice(&b[..bpp]);
}

/// Premultiply the three color bytes of a 32-bit pixel by its alpha byte.
#[inline(always)]
pub(crate) fn premultiply_px(px: u32, alpha_shift: u32) -> u32 {
    let a = (px >> alpha_shift) & 0xFF;
    let mut out = a << alpha_shift;
    for shift in [0u32, 8, 16, 24] {
        if shift != alpha_shift {
            let c = (px >> shift) & 0xFF;
            out |= udiv255(c * a) << shift;
        }
    }
    out
}

/// Inverse of [`premultiply_px`]; zero alpha yields transparent black.
#[inline(always)]
pub(crate) fn unpremultiply_px(px: u32, alpha_shift: u32) -> u32 {
    let a = (px >> alpha_shift) & 0xFF;
    let mut out = a << alpha_shift;
    for shift in [0u32, 8, 16, 24] {
        if shift != alpha_shift {
            let c = (px >> shift) & 0xFF;
            out |= unpremul_div(c, a) << shift;
        }
    }
    out
}

/// Apply a per-call alpha override to a precomputed fill mask.
///
/// `alpha_synth` marks the destination alpha bits that carry a synthesized
/// value (the source had none). Repeating the override byte across the word
/// lands its top bits in the field for any supported alpha width.
#[inline]
pub(crate) fn effective_fill(fill: u32, alpha_synth: u32, options: &ConvertOptions) -> u32 {
    match options.alpha_value {
        Some(a) if alpha_synth != 0 => {
            (fill & !alpha_synth) | ((u32::from(a) * 0x0101_0101) & alpha_synth)
        }
        _ => fill,
    }
}

/// Keep/OR pair that rewrites synthesized alpha in an already-built pixel.
#[inline]
fn alpha_override(alpha_synth: u32, options: &ConvertOptions) -> (u32, u32) {
    match options.alpha_value {
        Some(a) if alpha_synth != 0 => (!alpha_synth, (u32::from(a) * 0x0101_0101) & alpha_synth),
        _ => (u32::MAX, 0),
    }
}

// ===========================================================================
// Copy kernels
// ===========================================================================

/// Byte-identical formats: plain row copy.
pub(crate) fn convert_copy(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let row = row_bytes(width, d.src_depth);
    for y in 0..height {
        let s0 = row_offset(src_stride, y, height);
        let d0 = row_offset(dst_stride, y, height);
        dst[d0..d0 + row].copy_from_slice(&src[s0..s0 + row]);
        fill_gap(dst, d0 + row, options.gap);
    }
}

/// Same 32-bit layout; bits the source does not provide are masked out and
/// replaced by the fill (the source may carry garbage in them).
pub(crate) fn convert_copy_or_8888(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let m = d.as_mem_copy();
    let mut fill = effective_fill(m.fill_mask, m.alpha_synth, options);
    let mut keep = !m.fill_mask;
    if m.byte_swap {
        fill = fill.swap_bytes();
        keep = keep.swap_bytes();
    }
    let row = width * 4;
    for y in 0..height {
        let s0 = row_offset(src_stride, y, height);
        let d0 = row_offset(dst_stride, y, height);
        let s_row = &src[s0..s0 + row];
        let d_row = &mut dst[d0..d0 + row];
        for (s, dpx) in s_row.chunks_exact(4).zip(d_row.chunks_exact_mut(4)) {
            let v = (u32::from_le_bytes([s[0], s[1], s[2], s[3]]) & keep) | fill;
            dpx.copy_from_slice(&v.to_le_bytes());
        }
        fill_gap(dst, d0 + row, options.gap);
    }
}

// ===========================================================================
// Single-channel kernels
// ===========================================================================

/// A8 destination: extract the alpha byte of each 32-bit source pixel.
pub(crate) fn convert_a8_from_8888(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let p = d.as_x8_from_rgb32();
    let bpp = usize::from(p.bytes_per_pixel);
    let shift = u32::from(p.alpha_shift);
    for y in 0..height {
        let s0 = row_offset(src_stride, y, height);
        let d0 = row_offset(dst_stride, y, height);
        let s_row = &src[s0..s0 + width * bpp];
        let d_row = &mut dst[d0..d0 + width];
        for (x, out) in d_row.iter_mut().enumerate() {
            *out = ((load_px(&s_row[x * bpp..], bpp, p.byte_swap) >> shift) & 0xFF) as u8;
        }
        fill_gap(dst, d0 + width, options.gap);
    }
}

/// A8/L8 source: replicate the byte, then zero and fill per the masks.
pub(crate) fn convert_8888_from_x8(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let p = d.as_rgb32_from_x8();
    let fill = effective_fill(p.fill_mask, p.alpha_synth, options);
    for y in 0..height {
        let s0 = row_offset(src_stride, y, height);
        let d0 = row_offset(dst_stride, y, height);
        let s_row = &src[s0..s0 + width];
        let d_row = &mut dst[d0..d0 + width * 4];
        for (x, &g) in s_row.iter().enumerate() {
            let v = (u32::from(g) * 0x0101_0101 & !p.zero_mask) | fill;
            store_px(&mut d_row[x * 4..], v, 4, p.byte_swap);
        }
        fill_gap(dst, d0 + width * 4, options.gap);
    }
}

// ===========================================================================
// Indexed expansion
// ===========================================================================

#[inline(always)]
fn index8_row<T: Copy + Into<u32>>(
    table: &[T],
    s_row: &[u8],
    d_row: &mut [u8],
    bpp: usize,
    swap: bool,
    keep: u32,
    or_bits: u32,
) {
    for (x, &i) in s_row.iter().enumerate() {
        let px = (table[usize::from(i)].into() & keep) | or_bits;
        store_px(&mut d_row[x * bpp..], px, bpp, swap);
    }
}

#[inline(always)]
#[allow(clippy::too_many_arguments)]
fn index_packed_row<T: Copy + Into<u32>>(
    table: &[T],
    s_row: &[u8],
    d_row: &mut [u8],
    width: usize,
    depth: usize,
    bpp: usize,
    swap: bool,
    keep: u32,
    or_bits: u32,
) {
    let index_mask = (1usize << depth) - 1;
    for x in 0..width {
        let bit = x * depth;
        let i = (usize::from(s_row[bit / 8]) >> (8 - depth - bit % 8)) & index_mask;
        let px = (table[i].into() & keep) | or_bits;
        store_px(&mut d_row[x * bpp..], px, bpp, swap);
    }
}

/// 8-bit palette indices; entries are pre-packed at the destination width.
pub(crate) fn convert_index8(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let p = d.as_indexed();
    let (keep, or_bits) = alpha_override(p.alpha_synth, options);
    let bpp = usize::from(d.dst_depth) / 8;
    for y in 0..height {
        let s0 = row_offset(src_stride, y, height);
        let d0 = row_offset(dst_stride, y, height);
        let s_row = &src[s0..s0 + width];
        let d_row = &mut dst[d0..d0 + width * bpp];
        match &p.table {
            PaletteTable::Embedded8(t) => index8_row(t, s_row, d_row, bpp, p.byte_swap, keep, or_bits),
            PaletteTable::Embedded16(t) => index8_row(t, s_row, d_row, bpp, p.byte_swap, keep, or_bits),
            PaletteTable::Embedded32(t) => index8_row(t, s_row, d_row, bpp, p.byte_swap, keep, or_bits),
            PaletteTable::Dynamic8(t) => index8_row(t, s_row, d_row, bpp, p.byte_swap, keep, or_bits),
            PaletteTable::Dynamic16(t) => index8_row(t, s_row, d_row, bpp, p.byte_swap, keep, or_bits),
            PaletteTable::Dynamic32(t) => index8_row(t, s_row, d_row, bpp, p.byte_swap, keep, or_bits),
        }
        fill_gap(dst, d0 + width * bpp, options.gap);
    }
}

/// 1/2/4-bit palette indices, MSB-first within each byte.
pub(crate) fn convert_index_packed(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let p = d.as_indexed();
    let (keep, or_bits) = alpha_override(p.alpha_synth, options);
    let depth = usize::from(d.src_depth);
    let bpp = usize::from(d.dst_depth) / 8;
    let src_row = row_bytes(width, d.src_depth);
    for y in 0..height {
        let s0 = row_offset(src_stride, y, height);
        let d0 = row_offset(dst_stride, y, height);
        let s_row = &src[s0..s0 + src_row];
        let d_row = &mut dst[d0..d0 + width * bpp];
        match &p.table {
            PaletteTable::Embedded8(t) => {
                index_packed_row(t, s_row, d_row, width, depth, bpp, p.byte_swap, keep, or_bits)
            }
            PaletteTable::Embedded16(t) => {
                index_packed_row(t, s_row, d_row, width, depth, bpp, p.byte_swap, keep, or_bits)
            }
            PaletteTable::Embedded32(t) => {
                index_packed_row(t, s_row, d_row, width, depth, bpp, p.byte_swap, keep, or_bits)
            }
            PaletteTable::Dynamic8(t) => {
                index_packed_row(t, s_row, d_row, width, depth, bpp, p.byte_swap, keep, or_bits)
            }
            PaletteTable::Dynamic16(t) => {
                index_packed_row(t, s_row, d_row, width, depth, bpp, p.byte_swap, keep, or_bits)
            }
            PaletteTable::Dynamic32(t) => {
                index_packed_row(t, s_row, d_row, width, depth, bpp, p.byte_swap, keep, or_bits)
            }
        }
        fill_gap(dst, d0 + width * bpp, options.gap);
    }
}

// ===========================================================================
// Byte shuffle
// ===========================================================================

/// Byte-aligned permutation of a 24/32-bit source into a 32-bit destination.
///
/// The first four predicate entries give each output byte's index within one
/// source pixel; 0x80 selects zero (the fill mask supplies the value).
pub(crate) fn convert_shufb_8888(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let p = d.as_shufb();
    let mut fill = effective_fill(p.fill_mask, p.alpha_synth, options);
    if p.byte_swap {
        fill = fill.swap_bytes();
    }
    let fill = fill.to_le_bytes();
    let sbpp = usize::from(p.src_bpp);
    for y in 0..height {
        let s0 = row_offset(src_stride, y, height);
        let d0 = row_offset(dst_stride, y, height);
        let s_row = &src[s0..s0 + width * sbpp];
        let d_row = &mut dst[d0..d0 + width * 4];
        for x in 0..width {
            let s = &s_row[x * sbpp..];
            let dpx = &mut d_row[x * 4..x * 4 + 4];
            for j in 0..4 {
                let sel = p.predicate[j];
                let b = if sel & 0x80 != 0 { 0 } else { s[usize::from(sel)] };
                dpx[j] = b | fill[j];
            }
        }
        fill_gap(dst, d0 + width * 4, options.gap);
    }
}

// ===========================================================================
// Premultiply / unpremultiply
// ===========================================================================

pub(crate) fn convert_premultiply_8888(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let p = d.as_premultiply();
    let shift = u32::from(p.alpha_shift);
    for y in 0..height {
        let s0 = row_offset(src_stride, y, height);
        let d0 = row_offset(dst_stride, y, height);
        let s_row = &src[s0..s0 + width * 4];
        let d_row = &mut dst[d0..d0 + width * 4];
        for x in 0..width {
            let v = load_px(&s_row[x * 4..], 4, p.byte_swap);
            let out = premultiply_px(v, shift) | p.fill_mask;
            store_px(&mut d_row[x * 4..], out, 4, p.byte_swap);
        }
        fill_gap(dst, d0 + width * 4, options.gap);
    }
}

pub(crate) fn convert_unpremultiply_8888(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let p = d.as_premultiply();
    let shift = u32::from(p.alpha_shift);
    for y in 0..height {
        let s0 = row_offset(src_stride, y, height);
        let d0 = row_offset(dst_stride, y, height);
        let s_row = &src[s0..s0 + width * 4];
        let d_row = &mut dst[d0..d0 + width * 4];
        for x in 0..width {
            let v = load_px(&s_row[x * 4..], 4, p.byte_swap);
            let out = unpremultiply_px(v, shift) | p.fill_mask;
            store_px(&mut d_row[x * 4..], out, 4, p.byte_swap);
        }
        fill_gap(dst, d0 + width * 4, options.gap);
    }
}

// ===========================================================================
// Native destination (generic unpack)
// ===========================================================================

#[inline(always)]
fn extract_scaled(raw: u32, p: &crate::convert::NativeFromForeignData, ch: usize) -> u32 {
    let v = (raw & p.masks[ch]) >> p.shifts[ch];
    (v * p.scale[ch] + 0x8000) >> 16
}

pub(crate) fn convert_argb32_from_foreign(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let p = d.as_native_from_foreign();
    let fill = effective_fill(p.fill_mask, p.alpha_synth, options);
    let a_fill = (fill >> 24) & 0xFF;
    let bpp = usize::from(p.src_bpp);
    for y in 0..height {
        let s0 = row_offset(src_stride, y, height);
        let d0 = row_offset(dst_stride, y, height);
        let s_row = &src[s0..s0 + width * bpp];
        let d_row = &mut dst[d0..d0 + width * 4];
        for x in 0..width {
            let raw = load_px(&s_row[x * bpp..], bpp, p.byte_swap);
            let r = extract_scaled(raw, p, CH_R);
            let g = extract_scaled(raw, p, CH_G);
            let b = extract_scaled(raw, p, CH_B);
            let a = if p.masks[CH_A] != 0 {
                extract_scaled(raw, p, CH_A)
            } else {
                a_fill
            };
            let out = (a << 24) | (r << 16) | (g << 8) | b;
            d_row[x * 4..x * 4 + 4].copy_from_slice(&out.to_le_bytes());
        }
        fill_gap(dst, d0 + width * 4, options.gap);
    }
}

pub(crate) fn convert_xrgb32_from_foreign(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let p = d.as_native_from_foreign();
    let bpp = usize::from(p.src_bpp);
    for y in 0..height {
        let s0 = row_offset(src_stride, y, height);
        let d0 = row_offset(dst_stride, y, height);
        let s_row = &src[s0..s0 + width * bpp];
        let d_row = &mut dst[d0..d0 + width * 4];
        for x in 0..width {
            let raw = load_px(&s_row[x * bpp..], bpp, p.byte_swap);
            let r = extract_scaled(raw, p, CH_R);
            let g = extract_scaled(raw, p, CH_G);
            let b = extract_scaled(raw, p, CH_B);
            let out = p.fill_mask | (r << 16) | (g << 8) | b;
            d_row[x * 4..x * 4 + 4].copy_from_slice(&out.to_le_bytes());
        }
        fill_gap(dst, d0 + width * 4, options.gap);
    }
}

pub(crate) fn convert_prgb32_from_foreign(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let p = d.as_native_from_foreign();
    let fill = effective_fill(p.fill_mask, p.alpha_synth, options);
    let a_fill = (fill >> 24) & 0xFF;
    let bpp = usize::from(p.src_bpp);
    for y in 0..height {
        let s0 = row_offset(src_stride, y, height);
        let d0 = row_offset(dst_stride, y, height);
        let s_row = &src[s0..s0 + width * bpp];
        let d_row = &mut dst[d0..d0 + width * 4];
        for x in 0..width {
            let raw = load_px(&s_row[x * bpp..], bpp, p.byte_swap);
            let mut r = extract_scaled(raw, p, CH_R);
            let mut g = extract_scaled(raw, p, CH_G);
            let mut b = extract_scaled(raw, p, CH_B);
            let a = if p.masks[CH_A] != 0 {
                extract_scaled(raw, p, CH_A)
            } else {
                a_fill
            };
            if p.premultiply {
                r = udiv255(r * a);
                g = udiv255(g * a);
                b = udiv255(b * a);
            }
            let out = (a << 24) | (r << 16) | (g << 8) | b;
            d_row[x * 4..x * 4 + 4].copy_from_slice(&out.to_le_bytes());
        }
        fill_gap(dst, d0 + width * 4, options.gap);
    }
}

// ===========================================================================
// Native source (generic pack)
// ===========================================================================

#[inline]
fn channel_sizes(p: &crate::convert::ForeignFromNativeData) -> [u32; 4] {
    core::array::from_fn(|ch| (p.masks[ch] >> p.shifts[ch]).count_ones())
}

#[inline(always)]
fn pack_native(p: &crate::convert::ForeignFromNativeData, sizes: &[u32; 4], px: u32) -> u32 {
    let mut out = 0u32;
    for ch in 0..4 {
        if p.masks[ch] != 0 {
            let v = (px >> NATIVE_SHIFTS[ch]) & 0xFF;
            out |= (v >> (8 - sizes[ch])) << p.shifts[ch];
        }
    }
    out
}

pub(crate) fn convert_foreign_from_argb32(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let p = d.as_foreign_from_native();
    let sizes = channel_sizes(p);
    let fill = effective_fill(p.fill_mask, p.alpha_synth, options);
    let bpp = usize::from(p.dst_bpp);
    for y in 0..height {
        let s0 = row_offset(src_stride, y, height);
        let d0 = row_offset(dst_stride, y, height);
        let s_row = &src[s0..s0 + width * 4];
        let d_row = &mut dst[d0..d0 + width * bpp];
        for x in 0..width {
            let v = u32::from_le_bytes(s_row[x * 4..x * 4 + 4].try_into().unwrap());
            store_px(&mut d_row[x * bpp..], pack_native(p, &sizes, v) | fill, bpp, p.byte_swap);
        }
        fill_gap(dst, d0 + width * bpp, options.gap);
    }
}

pub(crate) fn convert_foreign_premul_from_argb32(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let p = d.as_foreign_from_native();
    let sizes = channel_sizes(p);
    let fill = effective_fill(p.fill_mask, p.alpha_synth, options);
    let bpp = usize::from(p.dst_bpp);
    for y in 0..height {
        let s0 = row_offset(src_stride, y, height);
        let d0 = row_offset(dst_stride, y, height);
        let s_row = &src[s0..s0 + width * 4];
        let d_row = &mut dst[d0..d0 + width * bpp];
        for x in 0..width {
            let v = u32::from_le_bytes(s_row[x * 4..x * 4 + 4].try_into().unwrap());
            let v = premultiply_px(v, 24);
            store_px(&mut d_row[x * bpp..], pack_native(p, &sizes, v) | fill, bpp, p.byte_swap);
        }
        fill_gap(dst, d0 + width * bpp, options.gap);
    }
}

pub(crate) fn convert_foreign_from_prgb32(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let p = d.as_foreign_from_native();
    let sizes = channel_sizes(p);
    let fill = effective_fill(p.fill_mask, p.alpha_synth, options);
    let bpp = usize::from(p.dst_bpp);
    for y in 0..height {
        let s0 = row_offset(src_stride, y, height);
        let d0 = row_offset(dst_stride, y, height);
        let s_row = &src[s0..s0 + width * 4];
        let d_row = &mut dst[d0..d0 + width * bpp];
        for x in 0..width {
            let v = u32::from_le_bytes(s_row[x * 4..x * 4 + 4].try_into().unwrap());
            let v = unpremultiply_px(v, 24);
            store_px(&mut d_row[x * bpp..], pack_native(p, &sizes, v) | fill, bpp, p.byte_swap);
        }
        fill_gap(dst, d0 + width * bpp, options.gap);
    }
}

// ===========================================================================
// Multi-step
// ===========================================================================

/// Route through a native 32-bit intermediate in fixed-size row chunks.
///
/// The chunk length is a multiple of eight pixels so sub-byte indexed
/// sources stay byte-aligned at every chunk boundary.
pub(crate) fn convert_multi_step(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let ms = d.as_multi_step();
    let first = &ms.ctx.first.data;
    let second = &ms.ctx.second.data;
    let mut buf = [0u8; crate::convert::MULTI_STEP_BUFFER_SIZE];
    let chunk = crate::convert::MULTI_STEP_BUFFER_SIZE / 4;
    let inner = ConvertOptions {
        gap: 0,
        alpha_value: options.alpha_value,
    };
    for y in 0..height {
        let s0 = row_offset(src_stride, y, height);
        let d0 = row_offset(dst_stride, y, height);
        let mut x = 0;
        while x < width {
            let n = chunk.min(width - x);
            let s_off = s0 + x * usize::from(d.src_depth) / 8;
            let s_len = row_bytes(n, d.src_depth);
            let d_off = d0 + x * usize::from(d.dst_depth) / 8;
            let d_len = row_bytes(n, d.dst_depth);
            (first.convert_fn)(
                first,
                &mut buf[..n * 4],
                (n * 4) as isize,
                &src[s_off..s_off + s_len],
                s_len as isize,
                n,
                1,
                &inner,
            );
            (second.convert_fn)(
                second,
                &mut dst[d_off..d_off + d_len],
                d_len as isize,
                &buf[..n * 4],
                (n * 4) as isize,
                n,
                1,
                &inner,
            );
            x += n;
        }
        fill_gap(dst, d0 + row_bytes(width, d.dst_depth), options.gap);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udiv255_matches_rounded_division() {
        for a in 0..=255u32 {
            for c in 0..=255u32 {
                let x = a * c;
                assert_eq!(udiv255(x), (x + 127) / 255, "x={x}");
            }
        }
    }

    #[test]
    fn premultiply_round_trip_on_valid_pixels() {
        // Every pixel with c <= a survives unpremultiply → premultiply.
        for a in 0..=255u32 {
            for c in (0..=a).step_by(7) {
                let px = (a << 24) | (c << 16) | (c / 2 << 8) | c;
                let straight = unpremultiply_px(px, 24);
                assert_eq!(premultiply_px(straight, 24), px, "a={a} c={c}");
            }
        }
    }

    #[test]
    fn unpremultiply_zero_alpha_is_transparent_black() {
        assert_eq!(unpremultiply_px(0x00FF_33CC, 24), 0);
    }

    #[test]
    fn premultiply_transparent_clears_color() {
        assert_eq!(premultiply_px(0x00FF_FFFF, 24), 0);
    }

    #[test]
    fn scale_is_exact_at_endpoints() {
        for size in [1u8, 2, 4, 5, 6, 8] {
            let max = (1u32 << size) - 1;
            let s = scale_factor(size);
            assert_eq!((0 * s + 0x8000) >> 16, 0);
            assert_eq!((max * s + 0x8000) >> 16, 255, "size={size}");
        }
    }

    #[test]
    fn five_bit_scale_round_trips_through_eight() {
        // 5→8→5 must be lossless for all 32 values.
        let up = scale_factor(5);
        for v in 0..32u32 {
            let wide = (v * up + 0x8000) >> 16;
            assert_eq!(wide >> 3, v, "v={v}");
        }
    }

    #[test]
    fn swap_px_widths() {
        assert_eq!(swap_px(0x1122, 2), 0x2211);
        assert_eq!(swap_px(0x0011_2233, 3), 0x0033_2211);
        assert_eq!(swap_px(0x1122_3344, 4), 0x4433_2211);
    }

    #[test]
    fn row_offset_flips_for_negative_stride() {
        assert_eq!(row_offset(16, 2, 4), 32);
        assert_eq!(row_offset(-16, 0, 4), 48);
        assert_eq!(row_offset(-16, 3, 4), 0);
    }

    #[test]
    fn row_bytes_rounds_sub_byte_depths_up() {
        assert_eq!(row_bytes(3, 1), 1);
        assert_eq!(row_bytes(9, 1), 2);
        assert_eq!(row_bytes(3, 4), 2);
        assert_eq!(row_bytes(5, 32), 20);
    }

    #[test]
    fn effective_fill_overrides_only_synth_bits() {
        let opts = ConvertOptions {
            gap: 0,
            alpha_value: Some(0x40),
        };
        assert_eq!(effective_fill(0xFF00_00FF, 0xFF00_0000, &opts), 0x4000_00FF);
        assert_eq!(effective_fill(0xFF00_00FF, 0, &opts), 0xFF00_00FF);
        let default = ConvertOptions::DEFAULT;
        assert_eq!(effective_fill(0xFF00_00FF, 0xFF00_0000, &default), 0xFF00_00FF);
    }
}
