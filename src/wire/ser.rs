//! Typed field serialization on top of the wire streams.
//!
//! Everything is little-endian and unaligned-safe; the format does not depend
//! on the host platform. Variable-length values carry an explicit `i32`
//! count prefix. Pointer-sized values are widened to `u64` on the wire; this
//! is the only width normalization in the protocol.

use anyhow::{anyhow, bail};

use crate::wire::stream::{StreamReader, StreamWriter};

pub trait WireSerialize: Sized {
    /// Writes the value. Failures surface through the writer's truncated
    /// flag, checked once after the last field.
    fn ser(&self, w: &mut StreamWriter<'_>);

    fn try_deser(r: &mut StreamReader<'_>) -> anyhow::Result<Self>;
}

/// Fixed-width element types that may appear in wire arrays.
pub trait WireScalar: WireSerialize + Copy {
    const WIRE_SIZE: usize;
}

macro_rules! wire_num {
    ($ty:ty) => {
        impl WireSerialize for $ty {
            fn ser(&self, w: &mut StreamWriter<'_>) {
                w.put_bytes(&self.to_le_bytes());
            }

            fn try_deser(r: &mut StreamReader<'_>) -> anyhow::Result<Self> {
                let block = r
                    .get_block(size_of::<$ty>())
                    .ok_or_else(|| anyhow!("wire stream truncated"))?;
                Ok(<$ty>::from_le_bytes(block.try_into().expect("block has the requested length")))
            }
        }

        impl WireScalar for $ty {
            const WIRE_SIZE: usize = size_of::<$ty>();
        }
    };
}

wire_num!(u8);
wire_num!(i8);
wire_num!(u16);
wire_num!(i16);
wire_num!(u32);
wire_num!(i32);
wire_num!(u64);
wire_num!(i64);
wire_num!(f32);
wire_num!(f64);

/// One byte on the wire, `0` or `1`.
impl WireSerialize for bool {
    fn ser(&self, w: &mut StreamWriter<'_>) {
        (if *self { 1u8 } else { 0u8 }).ser(w);
    }

    fn try_deser(r: &mut StreamReader<'_>) -> anyhow::Result<Self> {
        Ok(u8::try_deser(r)? != 0)
    }
}

impl WireSerialize for usize {
    fn ser(&self, w: &mut StreamWriter<'_>) {
        (*self as u64).ser(w);
    }

    fn try_deser(r: &mut StreamReader<'_>) -> anyhow::Result<Self> {
        let wide = u64::try_deser(r)?;
        usize::try_from(wide).map_err(|_| anyhow!("wire value {} does not fit a usize", wide))
    }
}

/// `{len: i32, bytes: len}`.
impl WireSerialize for String {
    fn ser(&self, w: &mut StreamWriter<'_>) {
        let Ok(len) = i32::try_from(self.len()) else {
            w.truncate();
            return;
        };
        len.ser(w);
        w.put_bytes(self.as_bytes());
    }

    fn try_deser(r: &mut StreamReader<'_>) -> anyhow::Result<Self> {
        let len = i32::try_deser(r)?;
        if len < 0 {
            bail!("negative string length {}", len);
        }
        let block = r
            .get_block(len as usize)
            .ok_or_else(|| anyhow!("wire stream truncated"))?;
        Ok(String::from_utf8(block.to_vec())?)
    }
}

/// `{count: i32, byte_len: i32, bytes: byte_len}` with
/// `byte_len == count * size_of::<T>()` checked on decode.
impl<T: WireScalar> WireSerialize for Vec<T> {
    fn ser(&self, w: &mut StreamWriter<'_>) {
        let Ok(count) = i32::try_from(self.len()) else {
            w.truncate();
            return;
        };
        let Some(byte_len) = (count as i64)
            .checked_mul(T::WIRE_SIZE as i64)
            .and_then(|n| i32::try_from(n).ok())
        else {
            w.truncate();
            return;
        };
        count.ser(w);
        byte_len.ser(w);
        for item in self {
            item.ser(w);
        }
    }

    fn try_deser(r: &mut StreamReader<'_>) -> anyhow::Result<Self> {
        let count = i32::try_deser(r)?;
        let byte_len = i32::try_deser(r)?;
        if count < 0 || byte_len < 0 {
            bail!("negative array header ({}, {})", count, byte_len);
        }
        if byte_len as i64 != count as i64 * T::WIRE_SIZE as i64 {
            bail!(
                "array byte length {} does not match {} elements of {} bytes",
                byte_len,
                count,
                T::WIRE_SIZE
            );
        }
        let mut result = Vec::with_capacity(count as usize);
        for _ in 0..count {
            result.push(T::try_deser(r)?);
        }
        Ok(result)
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::wire::stream::{StreamReader, StreamWriter};

    use super::*;

    fn roundtrip<T: WireSerialize + PartialEq + std::fmt::Debug>(value: T) {
        let mut buf = [0u8; 256];
        let mut w = StreamWriter::wrap(&mut buf);
        value.ser(&mut w);
        assert!(w.good());
        let used = w.used();
        let filled = w.filled().to_vec();

        let mut r = StreamReader::wrap(&filled);
        let back = T::try_deser(&mut r).unwrap();
        assert_eq!(back, value);
        assert_eq!(r.used(), used);
    }

    #[test]
    fn test_primitive_roundtrips() {
        roundtrip(0x12u8);
        roundtrip(-7i8);
        roundtrip(0xbeefu16);
        roundtrip(-12345i16);
        roundtrip(0xdeadbeefu32);
        roundtrip(i32::MIN);
        roundtrip(0x0123_4567_89ab_cdefu64);
        roundtrip(-1i64);
        roundtrip(1.25f32);
        roundtrip(-0.5f64);
        roundtrip(true);
        roundtrip(false);
        roundtrip(usize::MAX / 2);
    }

    #[rstest]
    #[case::empty("")]
    #[case::ascii("hello")]
    #[case::utf8("grüße")]
    fn test_string_roundtrip(#[case] s: &str) {
        roundtrip(s.to_string());
    }

    #[test]
    fn test_array_roundtrip() {
        roundtrip::<Vec<u16>>(vec![]);
        roundtrip(vec![1u32, 2, 3]);
        roundtrip(vec![-1i16, 0, 1]);
    }

    #[test]
    fn test_integers_are_little_endian() {
        let mut buf = [0u8; 16];
        let mut w = StreamWriter::wrap(&mut buf);
        0x1234u16.ser(&mut w);
        assert_eq!(w.filled(), &[0x34, 0x12]);
    }

    #[test]
    fn test_bool_is_one_byte() {
        let mut buf = [0u8; 16];
        let mut w = StreamWriter::wrap(&mut buf);
        true.ser(&mut w);
        false.ser(&mut w);
        assert_eq!(w.filled(), &[1, 0]);
    }

    #[test]
    fn test_string_wire_format() {
        let mut buf = [0u8; 16];
        let mut w = StreamWriter::wrap(&mut buf);
        "ab".to_string().ser(&mut w);
        assert_eq!(w.filled(), &[2, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn test_array_byte_len_mismatch_is_rejected() {
        // header claims 2 elements but 3 bytes
        let bytes = [2, 0, 0, 0, 3, 0, 0, 0, 0, 0, 0];
        let mut r = StreamReader::wrap(&bytes);
        assert!(Vec::<u16>::try_deser(&mut r).is_err());
    }

    #[test]
    fn test_truncated_decode_fails() {
        let bytes = [0x34, 0x12];
        let mut r = StreamReader::wrap(&bytes);
        assert!(u32::try_deser(&mut r).is_err());
        assert!(!r.good());
        // fail-fast: nothing readable afterwards, not even a u8
        assert!(u8::try_deser(&mut r).is_err());
    }

    #[test]
    fn test_truncated_string_decode() {
        let bytes = [5, 0, 0, 0, b'a', b'b'];
        let mut r = StreamReader::wrap(&bytes);
        assert!(String::try_deser(&mut r).is_err());
        assert!(!r.good());
    }
}
