//! Endian-aware integer reads shared by scanners and decoders.

use crate::schema::Endian;

/// Read an unsigned integer of `width` bytes (1..=8) at `offset`.
///
/// Returns `None` when the read would run past the end of `bytes`.
pub(crate) fn read_uint(bytes: &[u8], offset: usize, width: usize, endian: Endian) -> Option<u64> {
    if width == 0 || width > 8 {
        return None;
    }
    let end = offset.checked_add(width)?;
    let slice = bytes.get(offset..end)?;
    let mut buf = [0u8; 8];
    let value = match endian {
        Endian::Little => {
            buf[..width].copy_from_slice(slice);
            u64::from_le_bytes(buf)
        }
        Endian::Big => {
            buf[8 - width..].copy_from_slice(slice);
            u64::from_be_bytes(buf)
        }
    };
    Some(value)
}

/// Sign-extend the low `width` bytes of `value`.
pub(crate) fn sign_extend(value: u64, width: usize) -> i64 {
    let bits = (width * 8) as u32;
    if bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::{read_uint, sign_extend};
    use crate::schema::Endian;

    #[test]
    fn reads_both_byte_orders() {
        let bytes = [0x7F, 0x7F, 0x34, 0x12];
        assert_eq!(read_uint(&bytes, 2, 2, Endian::Little), Some(0x1234));
        assert_eq!(read_uint(&bytes, 2, 2, Endian::Big), Some(0x3412));
        assert_eq!(read_uint(&bytes, 0, 1, Endian::Big), Some(0x7F));
    }

    #[test]
    fn out_of_bounds_is_none() {
        assert_eq!(read_uint(&[1, 2], 1, 2, Endian::Little), None);
        assert_eq!(read_uint(&[1, 2], usize::MAX, 2, Endian::Little), None);
    }

    #[test]
    fn sign_extension() {
        assert_eq!(sign_extend(0xFF, 1), -1);
        assert_eq!(sign_extend(0x8000, 2), -32768);
        assert_eq!(sign_extend(0x7FFF, 2), 32767);
    }
}
