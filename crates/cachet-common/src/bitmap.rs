//! Fixed-width bit vectors for cache-way masks and CPU affinity sets.
//!
//! A [`Bitmap`] is backed by 32-bit words because everything downstream of
//! the kernel boundary indexes the mask in 32-bit units. The syscall
//! boundary itself uses a fixed layout of 16 × 64-bit words (1024 CPUs);
//! [`Bitmap::to_kernel_words`] and [`Bitmap::from_kernel_words`] convert
//! between the two by splitting every 64-bit word into its low and high
//! 32-bit halves.

use std::fmt;

use crate::error::{CachetError, CachetResult};

/// Number of 64-bit words in a kernel affinity mask.
pub const AFFINITY_WORDS: usize = 16;

/// Total width of a kernel affinity mask in bits.
pub const AFFINITY_BITS: usize = AFFINITY_WORDS * 64;

/// A fixed-width bit vector.
///
/// The width is set at construction and every bit access is range-checked;
/// an out-of-range index is an error, never a silent wrap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bitmap {
    width: usize,
    words: Vec<u32>,
}

impl Bitmap {
    /// Create an empty bitmap of the given width.
    #[must_use]
    pub fn new(width: usize) -> Self {
        Self {
            width,
            words: vec![0; width.div_ceil(32)],
        }
    }

    /// Create an empty bitmap sized for a kernel affinity mask.
    #[must_use]
    pub fn affinity() -> Self {
        Self::new(AFFINITY_BITS)
    }

    /// Create a bitmap with a contiguous run of set bits.
    ///
    /// # Errors
    ///
    /// Returns [`CachetError::InvalidBit`] if `offset + count` exceeds
    /// `width`.
    pub fn contiguous(width: usize, offset: usize, count: usize) -> CachetResult<Self> {
        let mut bitmap = Self::new(width);
        for index in offset..offset + count {
            bitmap.set(index)?;
        }
        Ok(bitmap)
    }

    /// The fixed width in bits.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    fn check(&self, index: usize) -> CachetResult<()> {
        if index >= self.width {
            return Err(CachetError::InvalidBit {
                index,
                width: self.width,
            });
        }
        Ok(())
    }

    /// Set the bit at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`CachetError::InvalidBit`] if `index` is out of range.
    pub fn set(&mut self, index: usize) -> CachetResult<()> {
        self.check(index)?;
        self.words[index / 32] |= 1 << (index % 32);
        Ok(())
    }

    /// Clear the bit at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`CachetError::InvalidBit`] if `index` is out of range.
    pub fn clear(&mut self, index: usize) -> CachetResult<()> {
        self.check(index)?;
        self.words[index / 32] &= !(1 << (index % 32));
        Ok(())
    }

    /// Test the bit at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`CachetError::InvalidBit`] if `index` is out of range.
    pub fn test(&self, index: usize) -> CachetResult<bool> {
        self.check(index)?;
        Ok(self.words[index / 32] & (1 << (index % 32)) != 0)
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True if no bit is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Bitwise union; the result takes the wider of the two widths.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut result = Self::new(self.width.max(other.width));
        for (index, word) in result.words.iter_mut().enumerate() {
            *word = self.words.get(index).copied().unwrap_or(0)
                | other.words.get(index).copied().unwrap_or(0);
        }
        result
    }

    /// True if any bit is set in both bitmaps.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Encode as a minimal lowercase hexadecimal string (no `0x` prefix),
    /// as the resctrl schemata format expects. The empty mask encodes as
    /// `"0"`.
    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut digits = String::with_capacity(self.words.len() * 8);
        for word in self.words.iter().rev() {
            digits.push_str(&format!("{word:08x}"));
        }
        let trimmed = digits.trim_start_matches('0');
        if trimmed.is_empty() {
            "0".to_string()
        } else {
            trimmed.to_string()
        }
    }

    /// Decode a hexadecimal mask string into a bitmap of the given width.
    /// An optional `0x` prefix is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`CachetError::InvalidMask`] for empty or non-hexadecimal
    /// input and [`CachetError::InvalidBit`] if a set bit falls outside
    /// `width`.
    pub fn from_hex(value: &str, width: usize) -> CachetResult<Self> {
        let digits = value.strip_prefix("0x").unwrap_or(value);
        if digits.is_empty() {
            return Err(CachetError::InvalidMask {
                value: value.to_string(),
            });
        }

        let padded = if digits.len() % 2 == 0 {
            digits.to_string()
        } else {
            format!("0{digits}")
        };
        let bytes = hex::decode(&padded).map_err(|_| CachetError::InvalidMask {
            value: value.to_string(),
        })?;

        let mut bitmap = Self::new(width);
        for (index, byte) in bytes.iter().rev().enumerate() {
            for offset in 0..8 {
                if byte & (1 << offset) != 0 {
                    bitmap.set(index * 8 + offset)?;
                }
            }
        }
        Ok(bitmap)
    }

    /// Pack into the fixed 16 × 64-bit kernel mask layout. Words are joined
    /// from consecutive 32-bit halves: word `i` is `words[2i]` in the low
    /// half and `words[2i + 1]` in the high half.
    #[must_use]
    pub fn to_kernel_words(&self) -> [u64; AFFINITY_WORDS] {
        let mut out = [0u64; AFFINITY_WORDS];
        for (index, half) in self.words.iter().enumerate() {
            let word = index / 2;
            if word >= AFFINITY_WORDS {
                break;
            }
            if index % 2 == 0 {
                out[word] |= u64::from(*half);
            } else {
                out[word] |= u64::from(*half) << 32;
            }
        }
        out
    }

    /// Unpack the fixed 16 × 64-bit kernel mask layout into an
    /// affinity-width bitmap, splitting every word into its low and high
    /// 32-bit halves.
    #[must_use]
    pub fn from_kernel_words(words: &[u64; AFFINITY_WORDS]) -> Self {
        let mut bitmap = Self::affinity();
        for (index, word) in words.iter().enumerate() {
            bitmap.words[index * 2] = (*word & 0xffff_ffff) as u32;
            bitmap.words[index * 2 + 1] = (*word >> 32) as u32;
        }
        bitmap
    }

    /// Parse a kernel cpu-list string (`"0-2,5"`) into a bitmap of the
    /// given width. Empty input yields an empty bitmap.
    ///
    /// # Errors
    ///
    /// Returns [`CachetError::InvalidMask`] for malformed input and
    /// [`CachetError::InvalidBit`] for CPUs outside `width`.
    pub fn from_cpulist(list: &str, width: usize) -> CachetResult<Self> {
        let mut bitmap = Self::new(width);
        for part in list.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let invalid = || CachetError::InvalidMask {
                value: list.to_string(),
            };
            if let Some((start, end)) = part.split_once('-') {
                let start: usize = start.trim().parse().map_err(|_| invalid())?;
                let end: usize = end.trim().parse().map_err(|_| invalid())?;
                if start > end {
                    return Err(invalid());
                }
                for cpu in start..=end {
                    bitmap.set(cpu)?;
                }
            } else {
                let cpu: usize = part.parse().map_err(|_| invalid())?;
                bitmap.set(cpu)?;
            }
        }
        Ok(bitmap)
    }

    /// Format as a kernel cpu-list string (`"0-2,5"`). The empty mask
    /// formats as an empty string.
    #[must_use]
    pub fn to_cpulist(&self) -> String {
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for index in 0..self.width {
            if self.words[index / 32] & (1 << (index % 32)) == 0 {
                continue;
            }
            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == index => *end = index,
                _ => ranges.push((index, index)),
            }
        }
        ranges
            .iter()
            .map(|(start, end)| {
                if start == end {
                    start.to_string()
                } else {
                    format!("{start}-{end}")
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn set_test_clear() {
        let mut bitmap = Bitmap::new(20);
        assert!(!bitmap.test(5).unwrap());
        bitmap.set(5).unwrap();
        assert!(bitmap.test(5).unwrap());
        bitmap.clear(5).unwrap();
        assert!(!bitmap.test(5).unwrap());
    }

    #[test]
    fn out_of_range_is_an_error() {
        let mut bitmap = Bitmap::new(20);
        assert!(matches!(
            bitmap.set(20),
            Err(CachetError::InvalidBit {
                index: 20,
                width: 20
            })
        ));
        assert!(bitmap.test(1024).is_err());
        assert!(bitmap.clear(usize::MAX).is_err());
    }

    // The 32/64-bit word seams are where the kernel-mask conversion has
    // historically gone wrong, so every boundary gets its own case.
    #[test]
    fn word_boundary_bits() {
        for index in [0, 31, 32, 63, 64, AFFINITY_BITS - 1] {
            let mut bitmap = Bitmap::affinity();
            bitmap.set(index).unwrap();

            let words = bitmap.to_kernel_words();
            assert_eq!(words[index / 64], 1u64 << (index % 64), "bit {index}");

            let back = Bitmap::from_kernel_words(&words);
            assert!(back.test(index).unwrap(), "bit {index}");
            assert_eq!(back.count_ones(), 1, "bit {index}");
        }
    }

    #[test]
    fn kernel_words_split_32_bit_halves() {
        let mut bitmap = Bitmap::affinity();
        bitmap.set(33).unwrap();
        // Bit 33 lives in the high half of kernel word 0, which is the
        // second 32-bit host word.
        assert_eq!(bitmap.to_kernel_words()[0], 1u64 << 33);
        assert!(Bitmap::from_kernel_words(&bitmap.to_kernel_words())
            .test(33)
            .unwrap());
    }

    #[test]
    fn count_ones_and_union() {
        let a = Bitmap::contiguous(20, 0, 4).unwrap();
        let b = Bitmap::contiguous(20, 2, 4).unwrap();
        assert_eq!(a.count_ones(), 4);
        let u = a.union(&b);
        assert_eq!(u.count_ones(), 6);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&Bitmap::contiguous(20, 10, 2).unwrap()));
    }

    #[test]
    fn contiguous_respects_width() {
        assert!(Bitmap::contiguous(20, 18, 2).is_ok());
        assert!(Bitmap::contiguous(20, 18, 3).is_err());
    }

    #[test]
    fn hex_encoding() {
        let bitmap = Bitmap::contiguous(20, 0, 4).unwrap();
        assert_eq!(bitmap.to_hex(), "f");

        let bitmap = Bitmap::contiguous(20, 4, 8).unwrap();
        assert_eq!(bitmap.to_hex(), "ff0");

        assert_eq!(Bitmap::new(20).to_hex(), "0");
    }

    #[test]
    fn hex_decoding() {
        let bitmap = Bitmap::from_hex("ff0", 20).unwrap();
        assert_eq!(bitmap.count_ones(), 8);
        assert!(!bitmap.test(3).unwrap());
        assert!(bitmap.test(4).unwrap());
        assert!(bitmap.test(11).unwrap());

        // 0x prefix accepted, case-insensitive digits.
        assert_eq!(Bitmap::from_hex("0xFF0", 20).unwrap(), bitmap);

        assert!(Bitmap::from_hex("", 20).is_err());
        assert!(Bitmap::from_hex("zz", 20).is_err());
        // A set bit beyond the width is rejected.
        assert!(Bitmap::from_hex("fffff0", 20).is_err());
    }

    #[test]
    fn cpulist_round_trip() {
        let bitmap = Bitmap::from_cpulist("0-2,5", 16).unwrap();
        assert_eq!(bitmap.count_ones(), 4);
        assert!(bitmap.test(0).unwrap());
        assert!(bitmap.test(2).unwrap());
        assert!(!bitmap.test(3).unwrap());
        assert!(bitmap.test(5).unwrap());
        assert_eq!(bitmap.to_cpulist(), "0-2,5");

        assert!(Bitmap::from_cpulist("", 16).unwrap().is_empty());
        assert_eq!(Bitmap::from_cpulist("7", 16).unwrap().to_cpulist(), "7");
        assert!(Bitmap::from_cpulist("2-1", 16).is_err());
        assert!(Bitmap::from_cpulist("x", 16).is_err());
        assert!(Bitmap::from_cpulist("99", 16).is_err());
    }

    proptest! {
        #[test]
        fn hex_round_trips(bits in proptest::collection::btree_set(0usize..64, 0..16)) {
            let mut bitmap = Bitmap::new(64);
            for bit in &bits {
                bitmap.set(*bit).unwrap();
            }
            let hex = bitmap.to_hex();
            prop_assert_eq!(Bitmap::from_hex(&hex, 64).unwrap(), bitmap.clone());
            // Minimal encodings round-trip textually too.
            prop_assert_eq!(Bitmap::from_hex(&hex, 64).unwrap().to_hex(), hex);
        }

        #[test]
        fn kernel_words_round_trip(bits in proptest::collection::btree_set(0usize..AFFINITY_BITS, 0..64)) {
            let mut bitmap = Bitmap::affinity();
            for bit in &bits {
                bitmap.set(*bit).unwrap();
            }
            prop_assert_eq!(Bitmap::from_kernel_words(&bitmap.to_kernel_words()), bitmap);
        }
    }
}
