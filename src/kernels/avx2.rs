use archmage::prelude::*;
use safe_unaligned_simd::x86_64::{_mm256_loadu_si256, _mm256_storeu_si256};

use crate::convert::{ConvertOptions, ConverterData};

// ===========================================================================
// SIMD constants
// ===========================================================================

/// Replicate the trailing alpha byte across its pixel (byte 3 of each 4).
const ALPHA_REPL_TRAILING: [i8; 32] = [
    3, 3, 3, 3, 7, 7, 7, 7, 11, 11, 11, 11, 15, 15, 15, 15, 3, 3, 3, 3, 7, 7, 7, 7, 11, 11, 11,
    11, 15, 15, 15, 15,
];

/// Replicate the leading alpha byte across its pixel (byte 0 of each 4).
const ALPHA_REPL_LEADING: [i8; 32] = [
    0, 0, 0, 0, 4, 4, 4, 4, 8, 8, 8, 8, 12, 12, 12, 12, 0, 0, 0, 0, 4, 4, 4, 4, 8, 8, 8, 8, 12,
    12, 12, 12,
];

/// 0xFF at the trailing alpha byte; forces the alpha lane product to a * 255.
const ALPHA_ONES_TRAILING: [i8; 32] = [
    0, 0, 0, -1, 0, 0, 0, -1, 0, 0, 0, -1, 0, 0, 0, -1, 0, 0, 0, -1, 0, 0, 0, -1, 0, 0, 0, -1, 0,
    0, 0, -1,
];

/// 0xFF at the leading alpha byte.
const ALPHA_ONES_LEADING: [i8; 32] = [
    -1, 0, 0, 0, -1, 0, 0, 0, -1, 0, 0, 0, -1, 0, 0, 0, -1, 0, 0, 0, -1, 0, 0, 0, -1, 0, 0, 0, -1,
    0, 0, 0,
];

// ===========================================================================
// x86-64 AVX2 — rite row implementations
// ===========================================================================

#[rite]
fn copy_or_row_v3(_token: X64V3Token, src: &[u8], dst: &mut [u8], keep: u32, fill: u32) {
    let keep_v = _mm256_set1_epi32(keep as i32);
    let fill_v = _mm256_set1_epi32(fill as i32);
    let n = src.len().min(dst.len());
    let mut i = 0;
    while i + 32 <= n {
        let s: &[u8; 32] = src[i..i + 32].try_into().unwrap();
        let v = _mm256_or_si256(_mm256_and_si256(_mm256_loadu_si256(s), keep_v), fill_v);
        let d: &mut [u8; 32] = (&mut dst[i..i + 32]).try_into().unwrap();
        _mm256_storeu_si256(d, v);
        i += 32;
    }
    for (s, dpx) in src[i..].chunks_exact(4).zip(dst[i..].chunks_exact_mut(4)) {
        let v = (u32::from_le_bytes([s[0], s[1], s[2], s[3]]) & keep) | fill;
        dpx.copy_from_slice(&v.to_le_bytes());
    }
}

#[rite]
fn shufb_row_v3(_token: X64V3Token, src: &[u8], dst: &mut [u8], predicate: &[u8; 32], fill: u32) {
    let mask = _mm256_loadu_si256(predicate);
    let fill_v = _mm256_set1_epi32(fill as i32);
    let n = src.len().min(dst.len());
    let mut i = 0;
    while i + 32 <= n {
        let s: &[u8; 32] = src[i..i + 32].try_into().unwrap();
        let v = _mm256_shuffle_epi8(_mm256_loadu_si256(s), mask);
        let out = _mm256_or_si256(v, fill_v);
        let d: &mut [u8; 32] = (&mut dst[i..i + 32]).try_into().unwrap();
        _mm256_storeu_si256(d, out);
        i += 32;
    }
    let fill_b = fill.to_le_bytes();
    for (s, dpx) in src[i..].chunks_exact(4).zip(dst[i..].chunks_exact_mut(4)) {
        for j in 0..4 {
            let sel = predicate[j];
            let b = if sel & 0x80 != 0 { 0 } else { s[usize::from(sel)] };
            dpx[j] = b | fill_b[j];
        }
    }
}

#[rite]
fn premultiply_row_v3(
    _token: X64V3Token,
    src: &[u8],
    dst: &mut [u8],
    repl: &[i8; 32],
    ones: &[i8; 32],
    alpha_shift: u32,
    fill: u32,
) {
    let repl_v = _mm256_loadu_si256(repl);
    let ones_v = _mm256_loadu_si256(ones);
    let fill_v = _mm256_set1_epi32(fill as i32);
    let zero = _mm256_setzero_si256();
    let bias = _mm256_set1_epi16(0x80);
    let recip = _mm256_set1_epi16(0x0101);
    let n = src.len().min(dst.len());
    let mut i = 0;
    while i + 32 <= n {
        let s: &[u8; 32] = src[i..i + 32].try_into().unwrap();
        let x = _mm256_loadu_si256(s);
        // Multiplier: alpha replicated into every lane of its pixel.
        // Multiplicand: the pixel with the alpha byte forced to 255 so the
        // alpha lane comes out as a * 255 / 255 = a.
        let ax = _mm256_shuffle_epi8(x, repl_v);
        let y = _mm256_or_si256(x, ones_v);
        let lo = _mm256_mullo_epi16(_mm256_unpacklo_epi8(y, zero), _mm256_unpacklo_epi8(ax, zero));
        let hi = _mm256_mullo_epi16(_mm256_unpackhi_epi8(y, zero), _mm256_unpackhi_epi8(ax, zero));
        // ((v + 128) * 257) >> 16 is the rounding divide by 255.
        let lo = _mm256_mulhi_epu16(_mm256_add_epi16(lo, bias), recip);
        let hi = _mm256_mulhi_epu16(_mm256_add_epi16(hi, bias), recip);
        let out = _mm256_or_si256(_mm256_packus_epi16(lo, hi), fill_v);
        let d: &mut [u8; 32] = (&mut dst[i..i + 32]).try_into().unwrap();
        _mm256_storeu_si256(d, out);
        i += 32;
    }
    for (s, dpx) in src[i..].chunks_exact(4).zip(dst[i..].chunks_exact_mut(4)) {
        let v = u32::from_le_bytes([s[0], s[1], s[2], s[3]]);
        let out = super::premultiply_px(v, alpha_shift) | fill;
        dpx.copy_from_slice(&out.to_le_bytes());
    }
}

// ===========================================================================
// x86-64 arcane strided wrappers
// ===========================================================================

#[arcane]
fn copy_or_strided_v3(
    t: X64V3Token,
    src: &[u8],
    dst: &mut [u8],
    src_stride: isize,
    dst_stride: isize,
    width: usize,
    height: usize,
    keep: u32,
    fill: u32,
    gap: usize,
) {
    let row = width * 4;
    for y in 0..height {
        let s0 = super::row_offset(src_stride, y, height);
        let d0 = super::row_offset(dst_stride, y, height);
        copy_or_row_v3(t, &src[s0..s0 + row], &mut dst[d0..d0 + row], keep, fill);
        super::fill_gap(dst, d0 + row, gap);
    }
}

#[arcane]
fn shufb_strided_v3(
    t: X64V3Token,
    src: &[u8],
    dst: &mut [u8],
    src_stride: isize,
    dst_stride: isize,
    width: usize,
    height: usize,
    predicate: &[u8; 32],
    fill: u32,
    gap: usize,
) {
    let row = width * 4;
    for y in 0..height {
        let s0 = super::row_offset(src_stride, y, height);
        let d0 = super::row_offset(dst_stride, y, height);
        shufb_row_v3(t, &src[s0..s0 + row], &mut dst[d0..d0 + row], predicate, fill);
        super::fill_gap(dst, d0 + row, gap);
    }
}

#[arcane]
fn premultiply_strided_v3(
    t: X64V3Token,
    src: &[u8],
    dst: &mut [u8],
    src_stride: isize,
    dst_stride: isize,
    width: usize,
    height: usize,
    repl: &[i8; 32],
    ones: &[i8; 32],
    alpha_shift: u32,
    fill: u32,
    gap: usize,
) {
    let row = width * 4;
    for y in 0..height {
        let s0 = super::row_offset(src_stride, y, height);
        let d0 = super::row_offset(dst_stride, y, height);
        premultiply_row_v3(
            t,
            &src[s0..s0 + row],
            &mut dst[d0..d0 + row],
            repl,
            ones,
            alpha_shift,
            fill,
        );
        super::fill_gap(dst, d0 + row, gap);
    }
}

// ===========================================================================
// Dispatch entry points (ConvertFn signature, scalar fallback)
// ===========================================================================

pub(crate) fn convert_copy_or_8888_v3(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let Some(token) = X64V3Token::summon() else {
        return super::convert_copy_or_8888(d, dst, dst_stride, src, src_stride, width, height, options);
    };
    let m = d.as_mem_copy();
    let mut fill = super::effective_fill(m.fill_mask, m.alpha_synth, options);
    let mut keep = !m.fill_mask;
    if m.byte_swap {
        fill = fill.swap_bytes();
        keep = keep.swap_bytes();
    }
    copy_or_strided_v3(
        token, src, dst, src_stride, dst_stride, width, height, keep, fill, options.gap,
    );
}

pub(crate) fn convert_shufb_8888_v3(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let Some(token) = X64V3Token::summon() else {
        return super::convert_shufb_8888(d, dst, dst_stride, src, src_stride, width, height, options);
    };
    let p = d.as_shufb();
    debug_assert_eq!(p.src_bpp, 4);
    let mut fill = super::effective_fill(p.fill_mask, p.alpha_synth, options);
    if p.byte_swap {
        fill = fill.swap_bytes();
    }
    let mut predicate = [0u8; 32];
    for (i, b) in predicate.iter_mut().enumerate() {
        *b = p.predicate[i % 16];
    }
    shufb_strided_v3(
        token, src, dst, src_stride, dst_stride, width, height, &predicate, fill, options.gap,
    );
}

pub(crate) fn convert_premultiply_8888_v3(
    d: &ConverterData,
    dst: &mut [u8],
    dst_stride: isize,
    src: &[u8],
    src_stride: isize,
    width: usize,
    height: usize,
    options: &ConvertOptions,
) {
    let Some(token) = X64V3Token::summon() else {
        return super::convert_premultiply_8888(d, dst, dst_stride, src, src_stride, width, height, options);
    };
    let p = d.as_premultiply();
    debug_assert!(!p.byte_swap);
    let (repl, ones) = if p.alpha_shift == 0 {
        (&ALPHA_REPL_LEADING, &ALPHA_ONES_LEADING)
    } else {
        (&ALPHA_REPL_TRAILING, &ALPHA_ONES_TRAILING)
    };
    premultiply_strided_v3(
        token,
        src,
        dst,
        src_stride,
        dst_stride,
        width,
        height,
        repl,
        ones,
        u32::from(p.alpha_shift),
        p.fill_mask,
        options.gap,
    );
}
