//! Simple building-block data that can be read in one go.
//! Primitives advance the read pointer when read.

use crate::prelude::*;

pub(crate) trait SplitChecked: Sized {
    fn split_checked(&mut self, at: usize) -> Option<Self>;
}
impl<'a> SplitChecked for &'a [u8] {
    #[inline]
    fn split_checked(&mut self, at: usize) -> Option<&'a [u8]> {
        if at > self.len() {
            None
        } else {
            let (extracted, remainder) = self.split_at(at);
            *self = remainder;
            Some(extracted)
        }
    }
}

/// Implemented on integer types for reading as big-endian.
pub(crate) trait IntRead: Sized {
    /// Reads a big-endian integer.
    fn read(data: &mut &[u8]) -> StdResult<Self, &'static ErrorKind>;
}

/// Implement simple big endian integer reads.
macro_rules! impl_read_int {
    {$( $int:ty ),*} => {
        $(
            impl IntRead for $int {
                #[inline]
                fn read(raw: &mut &[u8]) -> StdResult<$int, &'static ErrorKind> {
                    let bytes = raw.split_checked(mem::size_of::<$int>())
                        .ok_or(err_invalid!("failed to read the expected integer"))?;
                    Ok(bytes.iter().fold(0, |acc, byte| {
                        acc.checked_shl(8).unwrap_or(0) | *byte as $int
                    }))
                }
            }
        )*
    }
}
impl_read_int! {u8, u16, u32}

/// Slightly restricted integers.
macro_rules! restricted_int {
    {$(#[$attr:meta])* $name:ident : $inner:tt => $bits:expr} => {
        $(#[$attr])*
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Default)]
        #[repr(transparent)]
        #[allow(non_camel_case_types)]
        pub struct $name($inner);
        impl From<$inner> for $name {
            /// Lossy conversion, loses the top bits.
            #[inline]
            fn from(raw: $inner) -> $name {
                $name::new(raw)
            }
        }
        impl From<$name> for $inner {
            #[inline]
            fn from(restricted: $name) -> $inner {
                restricted.0
            }
        }
        impl fmt::Display for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
        impl $name {
            const MASK: $inner = (1 << $bits) - 1;

            /// The maximum value that this restricted integer can hold.
            #[inline]
            pub const fn max_value() -> $name {
                $name(Self::MASK)
            }

            /// Creates a restricted int from its non-restricted counterpart by masking off the
            /// extra bits.
            #[inline]
            pub const fn new(raw: $inner) -> $name {
                $name(raw & Self::MASK)
            }

            /// Returns `Some` if the raw integer is within range of the restricted integer, and
            /// `None` otherwise.
            #[inline]
            pub fn try_from(raw: $inner) -> Option<$name> {
                if raw <= Self::MASK {
                    Some($name(raw))
                } else {
                    None
                }
            }

            /// Get the inner integer out of the wrapper.
            #[inline]
            pub fn as_int(self) -> $inner {
                self.0
            }

            #[allow(dead_code)]
            #[inline]
            pub(crate) fn check_int(raw: $inner) -> StdResult<$name, &'static ErrorKind> {
                Self::try_from(raw).ok_or_else(
                    || err_invalid!("invalid integer with top bits set")
                )
            }
        }
        impl PartialEq<$inner> for $name {
            fn eq(&self, rhs: &$inner) -> bool {
                self.as_int() == *rhs
            }
        }
        impl PartialEq<$name> for $inner {
            fn eq(&self, rhs: &$name) -> bool {
                *self == rhs.as_int()
            }
        }
    };
}
restricted_int! {
    /// A 2-bit integer, the voice and part selector of MFi records.
    u2: u8 => 2
}
restricted_int! {
    /// A 4-bit integer, used for MIDI channels.
    u4: u8 => 4
}
restricted_int! {
    /// A 6-bit integer, the width of most MFi parameters.
    u6: u8 => 6
}
restricted_int! {
    /// A 7-bit integer type.
    ///
    /// Wraps the `u8` type and ensures that the top bit is always zero.
    u7: u8 => 7
}
restricted_int! {
    /// A 14-bit integer type, as used by pitch bend and master volume.
    u14: u16 => 14
}
restricted_int! {
    /// A 15-bit integer type.
    u15: u16 => 15
}
restricted_int! {
    /// A 24-bit integer type.
    ///
    /// Wraps the `u32` type and ensures that the top 8 bits are always zero.
    u24: u32 => 24
}
impl IntRead for u24 {
    fn read(raw: &mut &[u8]) -> StdResult<u24, &'static ErrorKind> {
        let bytes = raw
            .split_checked(3)
            .ok_or(err_invalid!("failed to read u24 bytes"))?;
        Ok(u24::from(
            bytes.iter().fold(0, |acc, byte| acc << 8 | *byte as u32),
        ))
    }
}

restricted_int! {
    /// Referred to in the MIDI spec as "variable length int".
    u28: u32 => 28
}
impl u28 {
    /// Read a variable-length quantity: 7 bits per byte, most significant group first, with the
    /// top bit set on every byte but the last.
    pub(crate) fn read_varlen(raw: &mut &[u8]) -> StdResult<u28, &'static ErrorKind> {
        let mut int: u32 = 0;
        for _ in 0..4 {
            let byte = match raw.split_checked(1) {
                Some(slice) => slice[0],
                None => bail!(err_invalid!("unexpected eof while reading varlen int")),
            };
            int = int << 7 | bit_range(byte, 0..7) as u32;
            if bit_range(byte, 7..8) == 0 {
                return Ok(u28::from(int));
            }
        }
        if cfg!(feature = "strict") {
            Err(err_malformed!("varlen integer larger than 4 bytes"))
        } else {
            //Use the 4 bytes as-is
            Ok(u28::from(int))
        }
    }

    /// Write this integer as a variable-length quantity, skipping leading zero groups.
    pub(crate) fn write_varlen(&self, out: &mut Vec<u8>) {
        let int = self.as_int();
        let mut skipping = true;
        for i in (0..4).rev() {
            let byte = ((int >> (i * 7)) & 0x7F) as u8;
            if skipping && byte == 0 && i != 0 {
                //Skip these leading zeros
            } else {
                skipping = false;
                out.push(if i == 0 { byte } else { byte | 0x80 });
            }
        }
    }
}

/// Reads a slice represented in the input as a `u28` `len` followed by `len` bytes.
pub(crate) fn read_varlen_slice<'a>(raw: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = u28::read_varlen(raw)
        .context(err_invalid!("failed to read varlen slice length"))?
        .as_int();
    Ok(raw
        .split_checked(len as usize)
        .ok_or(err_invalid!("incomplete varlen slice"))?)
}

/// Write a slice represented as a varlen `u28` as its length and then the raw bytes.
pub(crate) fn write_varlen_slice(slice: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let len = u32::try_from(slice.len())
        .ok()
        .and_then(u28::try_from)
        .ok_or(err_invalid!("varlen slice exceeds 28 bits"))?;
    len.write_varlen(out);
    out.extend_from_slice(slice);
    Ok(())
}

/// Decode bytes as text, one character per byte.
///
/// MIDI text events carry no encoding information, so every byte maps to the Unicode code point
/// of the same value, which is lossless and can be reversed by `text_bytes`.
pub(crate) fn latin1(raw: &[u8]) -> String {
    raw.iter().map(|&b| char::from(b)).collect()
}

/// Reverse of `latin1`. Characters beyond one byte are replaced by `?`.
pub(crate) fn text_bytes(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

/// The order in which tracks should be laid out when playing back an SMF file.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum Format {
    /// This file should have a single track only.
    SingleTrack,
    /// This file has several tracks that should be played simultaneously.
    ///
    /// Usually the first track controls tempo and other song metadata.
    Parallel,
    /// This file has several tracks, each one a separate song.
    Sequential,
}
impl Format {
    pub(crate) fn read(raw: &mut &[u8]) -> Result<Format> {
        let format = u16::read(raw)?;
        Ok(match format {
            0 => Format::SingleTrack,
            1 => Format::Parallel,
            2 => Format::Sequential,
            _ => {
                if cfg!(feature = "strict") {
                    bail!(err_malformed!("invalid smf format"))
                }
                log::warn!("unknown smf format {}, reading as parallel", format);
                Format::Parallel
            }
        })
    }

    pub(crate) fn encode(&self) -> [u8; 2] {
        let code: u16 = match self {
            Format::SingleTrack => 0,
            Format::Parallel => 1,
            Format::Sequential => 2,
        };
        code.to_be_bytes()
    }
}

/// The timing for an SMF file.
/// This can be in ticks/beat or ticks/second.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum Timing {
    /// Specifies ticks/beat as a 15-bit integer.
    ///
    /// The length of a beat depends on the current tempo.
    Metrical(u15),
    /// Specifies ticks/second by dividing a second into frames and then into subframes.
    ///
    /// The first value is the frame rate as stored (24, 25, 29 or 30 in compliant files, where
    /// 29 stands for 29.97), the second the amount of subframes per frame.
    /// Neither is validated.
    Timecode(u8, u8),
}
impl Timing {
    pub(crate) fn read(raw: &mut &[u8]) -> Result<Timing> {
        let raw =
            u16::read(raw).context(err_invalid!("unexpected eof when reading midi timing"))?;
        if bit_range(raw, 15..16) != 0 {
            let fps = (bit_range(raw, 8..16) as u8 as i8).wrapping_neg();
            let subframe = bit_range(raw, 0..8) as u8;
            Ok(Timing::Timecode(fps as u8, subframe))
        } else {
            Ok(Timing::Metrical(u15::from(raw)))
        }
    }

    pub(crate) fn encode(&self) -> [u8; 2] {
        match self {
            Timing::Metrical(ticksperbeat) => ticksperbeat.as_int().to_be_bytes(),
            Timing::Timecode(fps, subframe) => [(*fps as i8).wrapping_neg() as u8, *subframe],
        }
    }

    /// The time spanned by `ticks` ticks, given the current tempo in microseconds per beat.
    ///
    /// Timecode timing ignores the tempo.
    pub fn span(&self, tempo: u32, ticks: u64) -> Duration {
        let nanos: u128 = match *self {
            Timing::Metrical(tpb) => {
                let tpb = u128::from(tpb.as_int().max(1));
                u128::from(tempo) * 1000 * u128::from(ticks) / tpb
            }
            Timing::Timecode(fps, subframe) => {
                let subframe = u128::from(subframe.max(1));
                let ticks = u128::from(ticks);
                match fps {
                    29 => ticks * 1_001_000_000_000 / (30_000 * subframe),
                    0 => ticks * 1_000_000_000 / subframe,
                    fps => ticks * 1_000_000_000 / (u128::from(fps) * subframe),
                }
            }
        };
        let secs = nanos / 1_000_000_000;
        Duration::new(
            u64::try_from(secs).unwrap_or(u64::MAX),
            (nanos % 1_000_000_000) as u32,
        )
    }
}
