use crate::error::{Error, Result};
use std::mem;

/// Little-endian fixed-width codec over byte buffers.
/// All on-disk structures of the log and tree pages are
/// encoded through this trait so byte order is explicit.
pub trait Serde {
    /// Serialize a u64 value to a byte slice.
    fn ser_u64(&mut self, idx: usize, val: u64) -> usize;

    /// Serialize a i64 value to a byte slice.
    fn ser_i64(&mut self, idx: usize, val: i64) -> usize;

    /// Serialize a u32 value to a byte slice.
    fn ser_u32(&mut self, idx: usize, val: u32) -> usize;

    /// Serialize a i32 value to a byte slice.
    fn ser_i32(&mut self, idx: usize, val: i32) -> usize;

    /// Serialize a u8 value to a byte slice.
    fn ser_u8(&mut self, idx: usize, val: u8) -> usize;

    /// Serialize byte slice.
    fn ser_byte_slice(&mut self, idx: usize, val: &[u8]) -> usize;

    /// Fill `len` bytes with zero.
    fn ser_zeros(&mut self, idx: usize, len: usize) -> usize;

    /// Deserialize a u64 value from a byte slice.
    fn deser_u64(&self, idx: usize) -> Result<(usize, u64)>;

    /// Deserialize a u32 value from a byte slice.
    fn deser_u32(&self, idx: usize) -> Result<(usize, u32)>;

    /// Deserialize a i32 value from a byte slice.
    fn deser_i32(&self, idx: usize) -> Result<(usize, i32)>;

    /// Deserialize a u8 value from a byte slice.
    fn deser_u8(&self, idx: usize) -> Result<(usize, u8)>;

    /// Returns a byte slice to caller for deserialization.
    fn deser(&self, idx: usize, len: usize) -> Result<(usize, &[u8])>;
}

impl Serde for [u8] {
    #[inline]
    fn ser_u64(&mut self, idx: usize, val: u64) -> usize {
        debug_assert!(idx + mem::size_of::<u64>() <= self.len());
        self[idx..idx + mem::size_of::<u64>()].copy_from_slice(&val.to_le_bytes());
        idx + mem::size_of::<u64>()
    }

    #[inline]
    fn ser_i64(&mut self, idx: usize, val: i64) -> usize {
        debug_assert!(idx + mem::size_of::<i64>() <= self.len());
        self[idx..idx + mem::size_of::<i64>()].copy_from_slice(&val.to_le_bytes());
        idx + mem::size_of::<i64>()
    }

    #[inline]
    fn ser_u32(&mut self, idx: usize, val: u32) -> usize {
        debug_assert!(idx + mem::size_of::<u32>() <= self.len());
        self[idx..idx + mem::size_of::<u32>()].copy_from_slice(&val.to_le_bytes());
        idx + mem::size_of::<u32>()
    }

    #[inline]
    fn ser_i32(&mut self, idx: usize, val: i32) -> usize {
        debug_assert!(idx + mem::size_of::<i32>() <= self.len());
        self[idx..idx + mem::size_of::<i32>()].copy_from_slice(&val.to_le_bytes());
        idx + mem::size_of::<i32>()
    }

    #[inline]
    fn ser_u8(&mut self, idx: usize, val: u8) -> usize {
        debug_assert!(idx < self.len());
        self[idx] = val;
        idx + mem::size_of::<u8>()
    }

    #[inline]
    fn ser_byte_slice(&mut self, idx: usize, val: &[u8]) -> usize {
        debug_assert!(idx + val.len() <= self.len());
        self[idx..idx + val.len()].copy_from_slice(val);
        idx + val.len()
    }

    #[inline]
    fn ser_zeros(&mut self, idx: usize, len: usize) -> usize {
        debug_assert!(idx + len <= self.len());
        self[idx..idx + len].fill(0);
        idx + len
    }

    #[inline]
    fn deser_u64(&self, idx: usize) -> Result<(usize, u64)> {
        let (idx, bytes) = self.deser(idx, mem::size_of::<u64>())?;
        Ok((idx, u64::from_le_bytes(bytes.try_into()?)))
    }

    #[inline]
    fn deser_u32(&self, idx: usize) -> Result<(usize, u32)> {
        let (idx, bytes) = self.deser(idx, mem::size_of::<u32>())?;
        Ok((idx, u32::from_le_bytes(bytes.try_into()?)))
    }

    #[inline]
    fn deser_i32(&self, idx: usize) -> Result<(usize, i32)> {
        let (idx, bytes) = self.deser(idx, mem::size_of::<i32>())?;
        Ok((idx, i32::from_le_bytes(bytes.try_into()?)))
    }

    #[inline]
    fn deser_u8(&self, idx: usize) -> Result<(usize, u8)> {
        match self.get(idx) {
            Some(v) => Ok((idx + 1, *v)),
            None => Err(Error::InvalidFormat),
        }
    }

    #[inline]
    fn deser(&self, idx: usize, len: usize) -> Result<(usize, &[u8])> {
        match self.get(idx..idx + len) {
            Some(bytes) => Ok((idx + len, bytes)),
            None => Err(Error::InvalidFormat),
        }
    }
}

pub trait Ser {
    /// length of serialized bytes.
    fn ser_len(&self) -> usize;

    /// Serialize object into fix-sized byte slice.
    /// The buffer is guaranteed to be big enough.
    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize;
}

pub trait Deser: Sized {
    /// Deserialize objects from input.
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)>;
}

/// Returns `len` rounded up to a multiple of 8.
#[inline]
pub const fn align8(len: usize) -> usize {
    (len + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct TestStruct {
        a: u8,
        b: i32,
        c: u64,
    }

    impl Ser for TestStruct {
        fn ser_len(&self) -> usize {
            1 + 4 + 8
        }

        fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
            let idx = out.ser_u8(start_idx, self.a);
            let idx = out.ser_i32(idx, self.b);
            out.ser_u64(idx, self.c)
        }
    }

    impl Deser for TestStruct {
        fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
            let (idx, a) = input.deser_u8(start_idx)?;
            let (idx, b) = input.deser_i32(idx)?;
            let (idx, c) = input.deser_u64(idx)?;
            Ok((idx, TestStruct { a, b, c }))
        }
    }

    #[test]
    fn test_struct_serde() {
        let s = TestStruct { a: 7, b: -3, c: 1 << 40 };
        let mut out = vec![0u8; s.ser_len()];
        let idx = s.ser(&mut out[..], 0);
        assert_eq!(idx, out.len());
        let (idx, res) = TestStruct::deser(&out[..], 0).unwrap();
        assert_eq!(idx, out.len());
        assert_eq!(res, s);
    }

    #[test]
    fn test_deser_out_of_bound() {
        let out = [0u8; 6];
        assert_eq!(out[..].deser_u64(0), Err(Error::InvalidFormat));
        assert_eq!(out[..].deser_u8(6), Err(Error::InvalidFormat));
        assert!(out[..].deser_i32(2).is_ok());
    }

    #[test]
    fn test_align8() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(17), 24);
    }
}
