// ---------------------------------------------------------------------------
// Pixel format descriptors.
//
// A `FormatInfo` describes one memory layout: bit depth, per-channel bit
// sizes and shifts within the logical container value, alpha convention,
// byte order, and (for indexed formats) the palette. Two of these are the
// sole input to converter setup.
// ---------------------------------------------------------------------------

use alloc::sync::Arc;

use crate::error::ConvertError;

/// Channel order inside `sizes`/`shifts`: R, G, B, A.
pub(crate) const CH_R: usize = 0;
pub(crate) const CH_G: usize = 1;
pub(crate) const CH_B: usize = 2;
pub(crate) const CH_A: usize = 3;

// ===========================================================================
// FormatFlags
// ===========================================================================

/// Bit-set of format properties.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FormatFlags(u8);

impl FormatFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Color channels are pre-scaled by the alpha fraction.
    pub const PREMULTIPLIED: Self = Self(0x01);
    /// The format carries an alpha channel (packed: `sizes[3] > 0`;
    /// indexed: palette alpha is meaningful).
    pub const ALPHA: Self = Self(0x02);
    /// Pixels are palette indices; `palette` holds ARGB32 entries.
    pub const INDEXED: Self = Self(0x04);
    /// The container is stored big-endian.
    pub const BYTE_SWAP: Self = Self(0x08);
    /// Greyscale: R, G and B alias one physical channel.
    pub const LUM: Self = Self(0x10);

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::ops::BitOr for FormatFlags {
    type Output = Self;
    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl core::fmt::Debug for FormatFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let names: [(Self, &str); 5] = [
            (Self::PREMULTIPLIED, "PREMULTIPLIED"),
            (Self::ALPHA, "ALPHA"),
            (Self::INDEXED, "INDEXED"),
            (Self::BYTE_SWAP, "BYTE_SWAP"),
            (Self::LUM, "LUM"),
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

// ===========================================================================
// FormatInfo
// ===========================================================================

/// Native 32-bit layout classification (ARGB value order, little-endian).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum NativeKind {
    /// No alpha; top byte is opaque filler.
    Xrgb,
    /// Straight (non-premultiplied) alpha.
    Argb,
    /// Premultiplied alpha.
    Prgb,
}

/// Describes one pixel memory layout.
///
/// Packed formats give per-channel bit sizes and shifts within the logical
/// container value; the container is stored little-endian unless
/// [`FormatFlags::BYTE_SWAP`] is set. Indexed formats give a palette of
/// ARGB32 (`0xAARRGGBB`) entries instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatInfo {
    /// Bits per pixel: 8/16/24/32 packed, 1/2/4/8 indexed.
    pub depth: u8,
    pub flags: FormatFlags,
    /// R, G, B, A bit sizes; 0 means the channel is absent.
    pub sizes: [u8; 4],
    /// R, G, B, A bit shifts within the container value.
    pub shifts: [u8; 4],
    /// ARGB32 entries for indexed formats; `1..=(1 << depth)` entries.
    pub palette: Option<Arc<[u32]>>,
}

/// Channel sizes the repack kernels have exact scale factors for.
const SUPPORTED_SIZES: [u8; 6] = [1, 2, 4, 5, 6, 8];

impl FormatInfo {
    /// Premultiplied ARGB32 (bytes B,G,R,A in memory). The native layout.
    pub fn prgb32() -> Self {
        Self::packed32(
            [8, 8, 8, 8],
            [16, 8, 0, 24],
            FormatFlags::ALPHA | FormatFlags::PREMULTIPLIED,
        )
    }

    /// Straight-alpha ARGB32 (bytes B,G,R,A in memory).
    pub fn argb32() -> Self {
        Self::packed32([8, 8, 8, 8], [16, 8, 0, 24], FormatFlags::ALPHA)
    }

    /// 32-bit RGB with an unused, opaque top byte (bytes B,G,R,X in memory).
    pub fn xrgb32() -> Self {
        Self::packed32([8, 8, 8, 0], [16, 8, 0, 0], FormatFlags::NONE)
    }

    /// Straight-alpha RGBA byte order (bytes R,G,B,A in memory).
    pub fn rgba32() -> Self {
        Self::packed32([8, 8, 8, 8], [0, 8, 16, 24], FormatFlags::ALPHA)
    }

    /// Premultiplied RGBA byte order.
    pub fn prgba32() -> Self {
        Self::packed32(
            [8, 8, 8, 8],
            [0, 8, 16, 24],
            FormatFlags::ALPHA | FormatFlags::PREMULTIPLIED,
        )
    }

    /// 8-bit alpha-only.
    pub fn a8() -> Self {
        Self {
            depth: 8,
            flags: FormatFlags::ALPHA,
            sizes: [0, 0, 0, 8],
            shifts: [0, 0, 0, 0],
            palette: None,
        }
    }

    /// 8-bit greyscale (R = G = B = the stored byte).
    pub fn l8() -> Self {
        Self {
            depth: 8,
            flags: FormatFlags::LUM,
            sizes: [8, 8, 8, 0],
            shifts: [0, 0, 0, 0],
            palette: None,
        }
    }

    /// 24-bit RGB, bytes R,G,B in memory.
    pub fn rgb24() -> Self {
        Self {
            depth: 24,
            flags: FormatFlags::NONE,
            sizes: [8, 8, 8, 0],
            shifts: [0, 8, 16, 0],
            palette: None,
        }
    }

    /// 24-bit RGB, bytes B,G,R in memory.
    pub fn bgr24() -> Self {
        Self {
            depth: 24,
            flags: FormatFlags::NONE,
            sizes: [8, 8, 8, 0],
            shifts: [16, 8, 0, 0],
            palette: None,
        }
    }

    /// 16-bit 5-6-5 RGB.
    pub fn rgb565() -> Self {
        Self {
            depth: 16,
            flags: FormatFlags::NONE,
            sizes: [5, 6, 5, 0],
            shifts: [11, 5, 0, 0],
            palette: None,
        }
    }

    /// 16-bit 4-4-4-4 ARGB (straight alpha).
    pub fn argb4444() -> Self {
        Self {
            depth: 16,
            flags: FormatFlags::ALPHA,
            sizes: [4, 4, 4, 4],
            shifts: [8, 4, 0, 12],
            palette: None,
        }
    }

    /// Checked constructor for an arbitrary packed layout.
    pub fn packed(
        depth: u8,
        sizes: [u8; 4],
        shifts: [u8; 4],
        flags: FormatFlags,
    ) -> Result<Self, ConvertError> {
        let info = Self {
            depth,
            flags,
            sizes,
            shifts,
            palette: None,
        };
        info.sanitize()?;
        Ok(info)
    }

    /// Checked constructor for an indexed format.
    ///
    /// `palette` entries are ARGB32; a short palette is legal and missing
    /// entries expand to transparent black. When `has_alpha` is false the
    /// palette's alpha bytes are ignored and pixels expand fully opaque.
    pub fn indexed(
        depth: u8,
        palette: Arc<[u32]>,
        has_alpha: bool,
    ) -> Result<Self, ConvertError> {
        let mut flags = FormatFlags::INDEXED;
        if has_alpha {
            flags = flags | FormatFlags::ALPHA;
        }
        let info = Self {
            depth,
            flags,
            sizes: [0; 4],
            shifts: [0; 4],
            palette: Some(palette),
        };
        info.sanitize()?;
        Ok(info)
    }

    fn packed32(sizes: [u8; 4], shifts: [u8; 4], flags: FormatFlags) -> Self {
        Self {
            depth: 32,
            flags,
            sizes,
            shifts,
            palette: None,
        }
    }

    // -- queries ------------------------------------------------------------

    #[inline]
    pub fn has_alpha(&self) -> bool {
        self.flags.contains(FormatFlags::ALPHA)
    }

    #[inline]
    pub fn is_premultiplied(&self) -> bool {
        self.flags.contains(FormatFlags::PREMULTIPLIED)
    }

    #[inline]
    pub fn is_indexed(&self) -> bool {
        self.flags.contains(FormatFlags::INDEXED)
    }

    #[inline]
    pub(crate) fn byte_swap(&self) -> bool {
        self.flags.contains(FormatFlags::BYTE_SWAP)
    }

    /// Mask of one channel within the container value (0 when absent).
    #[inline]
    pub(crate) fn mask(&self, ch: usize) -> u32 {
        if self.sizes[ch] == 0 {
            0
        } else {
            (((1u64 << self.sizes[ch]) - 1) as u32) << self.shifts[ch]
        }
    }

    /// OR of all channel masks.
    pub(crate) fn used_bits(&self) -> u32 {
        self.mask(CH_R) | self.mask(CH_G) | self.mask(CH_B) | self.mask(CH_A)
    }

    /// Container bits that belong to no channel, filled with 1s on output.
    pub(crate) fn unused_bits(&self) -> u32 {
        let container = if self.depth >= 32 {
            u32::MAX
        } else {
            (1u32 << self.depth) - 1
        };
        container & !self.used_bits()
    }

    #[inline]
    pub(crate) fn bytes_per_pixel(&self) -> usize {
        usize::from(self.depth) / 8
    }

    /// Bytes occupied by `width` pixels of this format (sub-byte indexed
    /// depths round up to whole bytes).
    #[inline]
    pub(crate) fn row_bytes(&self, width: usize) -> usize {
        (width * usize::from(self.depth)).div_ceil(8)
    }

    /// Memory byte index of each channel, when every present channel is a
    /// byte-aligned 8-bit field. `None` if any channel is not.
    pub(crate) fn byte_map(&self) -> Option<[Option<u8>; 4]> {
        if self.is_indexed() || self.depth % 8 != 0 {
            return None;
        }
        let bpp = self.bytes_per_pixel() as u8;
        let mut map = [None; 4];
        for ch in 0..4 {
            if self.sizes[ch] == 0 {
                continue;
            }
            if self.sizes[ch] != 8 || self.shifts[ch] % 8 != 0 {
                return None;
            }
            let logical = self.shifts[ch] / 8;
            map[ch] = Some(if self.byte_swap() {
                bpp - 1 - logical
            } else {
                logical
            });
        }
        Some(map)
    }

    /// Classify this format as one of the native 32-bit layouts.
    pub(crate) fn native_kind(&self) -> Option<NativeKind> {
        if self.depth != 32
            || self.is_indexed()
            || self.byte_swap()
            || self.flags.contains(FormatFlags::LUM)
        {
            return None;
        }
        if self.sizes[..3] != [8, 8, 8] || self.shifts[..3] != [16, 8, 0] {
            return None;
        }
        if !self.has_alpha() {
            return (self.sizes[CH_A] == 0).then_some(NativeKind::Xrgb);
        }
        if self.sizes[CH_A] != 8 || self.shifts[CH_A] != 24 {
            return None;
        }
        Some(if self.is_premultiplied() {
            NativeKind::Prgb
        } else {
            NativeKind::Argb
        })
    }

    // -- validation ---------------------------------------------------------

    /// Validate the descriptor. Converter setup runs this on both inputs and
    /// maps any failure to [`ConvertError::InvalidFormat`].
    pub fn sanitize(&self) -> Result<(), ConvertError> {
        if self.is_indexed() {
            return self.sanitize_indexed();
        }
        if !matches!(self.depth, 8 | 16 | 24 | 32) || self.palette.is_some() {
            return Err(ConvertError::InvalidFormat);
        }
        for &size in &self.sizes {
            if size != 0 && !SUPPORTED_SIZES.contains(&size) {
                return Err(ConvertError::InvalidFormat);
            }
        }
        let rgb_present = self.sizes[CH_R] > 0;
        if (self.sizes[CH_G] > 0) != rgb_present || (self.sizes[CH_B] > 0) != rgb_present {
            return Err(ConvertError::InvalidFormat);
        }
        let alpha_present = self.sizes[CH_A] > 0;
        if alpha_present != self.has_alpha() {
            return Err(ConvertError::InvalidFormat);
        }
        if !rgb_present && !alpha_present {
            return Err(ConvertError::InvalidFormat);
        }
        if self.is_premultiplied() && !alpha_present {
            return Err(ConvertError::InvalidFormat);
        }
        for ch in 0..4 {
            if self.sizes[ch] > 0
                && u32::from(self.shifts[ch]) + u32::from(self.sizes[ch]) > u32::from(self.depth)
            {
                return Err(ConvertError::InvalidFormat);
            }
        }
        if self.flags.contains(FormatFlags::LUM) {
            // Greyscale: R, G and B must alias the same bits.
            if !rgb_present
                || self.mask(CH_R) != self.mask(CH_G)
                || self.mask(CH_R) != self.mask(CH_B)
            {
                return Err(ConvertError::InvalidFormat);
            }
            if self.mask(CH_R) & self.mask(CH_A) != 0 {
                return Err(ConvertError::InvalidFormat);
            }
            return Ok(());
        }
        let mut seen = 0u32;
        for ch in 0..4 {
            let mask = self.mask(ch);
            if seen & mask != 0 {
                return Err(ConvertError::InvalidFormat);
            }
            seen |= mask;
        }
        Ok(())
    }

    fn sanitize_indexed(&self) -> Result<(), ConvertError> {
        if !matches!(self.depth, 1 | 2 | 4 | 8) {
            return Err(ConvertError::InvalidFormat);
        }
        if self.sizes != [0; 4] || self.shifts != [0; 4] {
            return Err(ConvertError::InvalidFormat);
        }
        if self.byte_swap()
            || self.is_premultiplied()
            || self.flags.contains(FormatFlags::LUM)
        {
            return Err(ConvertError::InvalidFormat);
        }
        let Some(palette) = &self.palette else {
            return Err(ConvertError::InvalidFormat);
        };
        let max = 1usize << self.depth;
        if palette.is_empty() || palette.len() > max {
            return Err(ConvertError::InvalidFormat);
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{vec, vec::Vec};

    #[test]
    fn builtin_formats_sanitize() {
        for f in [
            FormatInfo::prgb32(),
            FormatInfo::argb32(),
            FormatInfo::xrgb32(),
            FormatInfo::rgba32(),
            FormatInfo::prgba32(),
            FormatInfo::a8(),
            FormatInfo::l8(),
            FormatInfo::rgb24(),
            FormatInfo::bgr24(),
            FormatInfo::rgb565(),
            FormatInfo::argb4444(),
        ] {
            f.sanitize().unwrap_or_else(|e| panic!("{f:?}: {e}"));
        }
    }

    #[test]
    fn three_bit_channel_rejected() {
        // RGB332-style layouts are outside the supported channel widths.
        let err = FormatInfo::packed(8, [3, 3, 2, 0], [5, 2, 0, 0], FormatFlags::NONE);
        assert_eq!(err, Err(ConvertError::InvalidFormat));
    }

    #[test]
    fn overlapping_masks_rejected() {
        let err = FormatInfo::packed(
            16,
            [8, 8, 0, 0],
            [4, 8, 0, 0],
            FormatFlags::NONE,
        );
        assert_eq!(err, Err(ConvertError::InvalidFormat));
    }

    #[test]
    fn alpha_flag_must_match_sizes() {
        let err = FormatInfo::packed(32, [8, 8, 8, 8], [16, 8, 0, 24], FormatFlags::NONE);
        assert_eq!(err, Err(ConvertError::InvalidFormat));
        let err = FormatInfo::packed(32, [8, 8, 8, 0], [16, 8, 0, 0], FormatFlags::ALPHA);
        assert_eq!(err, Err(ConvertError::InvalidFormat));
    }

    #[test]
    fn native_kind_classification() {
        assert_eq!(FormatInfo::prgb32().native_kind(), Some(NativeKind::Prgb));
        assert_eq!(FormatInfo::argb32().native_kind(), Some(NativeKind::Argb));
        assert_eq!(FormatInfo::xrgb32().native_kind(), Some(NativeKind::Xrgb));
        assert_eq!(FormatInfo::rgba32().native_kind(), None);
        assert_eq!(FormatInfo::rgb565().native_kind(), None);
    }

    #[test]
    fn byte_map_handles_swap() {
        let rgba = FormatInfo::rgba32();
        assert_eq!(
            rgba.byte_map(),
            Some([Some(0), Some(1), Some(2), Some(3)])
        );
        let swapped = FormatInfo {
            flags: rgba.flags | FormatFlags::BYTE_SWAP,
            ..rgba
        };
        assert_eq!(
            swapped.byte_map(),
            Some([Some(3), Some(2), Some(1), Some(0)])
        );
        assert_eq!(FormatInfo::rgb565().byte_map(), None);
    }

    #[test]
    fn indexed_palette_bounds() {
        let pal: Arc<[u32]> = vec![0xFF000000u32; 4].into();
        assert!(FormatInfo::indexed(2, pal.clone(), false).is_ok());
        assert_eq!(
            FormatInfo::indexed(1, pal, false),
            Err(ConvertError::InvalidFormat)
        );
        let empty: Arc<[u32]> = Vec::<u32>::new().into();
        assert_eq!(
            FormatInfo::indexed(8, empty, false),
            Err(ConvertError::InvalidFormat)
        );
    }

    #[test]
    fn unused_bits_xrgb() {
        assert_eq!(FormatInfo::xrgb32().unused_bits(), 0xFF00_0000);
        assert_eq!(FormatInfo::rgb565().unused_bits(), 0);
        assert_eq!(FormatInfo::a8().unused_bits(), 0);
    }
}
