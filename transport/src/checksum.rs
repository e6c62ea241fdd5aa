use crc::{Crc, CRC_32_ISO_HDLC};

/// Packet checksums use the classic IEEE CRC-32 polynomial, carried in a fixed
/// 8-byte wire field. The checksum always covers the whole buffer with its own
/// field zeroed, so writer and verifier agree without slicing the field out.
pub const CHECKSUM_LEN: usize = 8;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn compute(buf: &[u8], field_offset: usize) -> u64 {
    let mut digest = CRC32.digest();
    digest.update(&buf[..field_offset]);
    digest.update(&[0u8; CHECKSUM_LEN]);
    digest.update(&buf[field_offset + CHECKSUM_LEN..]);
    digest.finalize() as u64
}

pub fn write(buf: &mut [u8], field_offset: usize) {
    let checksum = compute(buf, field_offset);
    buf[field_offset..field_offset + CHECKSUM_LEN].copy_from_slice(&checksum.to_be_bytes());
}

pub fn verify(buf: &[u8], field_offset: usize) -> bool {
    if buf.len() < field_offset + CHECKSUM_LEN {
        return false;
    }
    let stored = u64::from_be_bytes(
        buf[field_offset..field_offset + CHECKSUM_LEN]
            .try_into()
            .expect("fixed-width slice"),
    );
    stored == compute(buf, field_offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_verify() {
        let mut buf = vec![1, 2, 3, 0, 0, 0, 0, 0, 0, 0, 0, 4, 5, 6];
        write(&mut buf, 3);
        assert!(verify(&buf, 3));
    }

    #[test]
    fn test_verify_rejects_corruption() {
        let mut buf = vec![1, 2, 3, 0, 0, 0, 0, 0, 0, 0, 0, 4, 5, 6];
        write(&mut buf, 3);
        buf[12] ^= 0xff;
        assert!(!verify(&buf, 3));
    }

    #[test]
    fn test_verify_rejects_truncated_buffer() {
        assert!(!verify(&[0u8; 4], 3));
    }
}
