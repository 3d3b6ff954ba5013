//! Bounds-checked little-endian wire codec.
//!
//! Readers and writers take a cursor (`&mut usize`) that advances by the
//! serialized size on success and is left untouched on failure. Readers never
//! touch bytes past the supplied length.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

/// Fixed wire size of an address: tag, 16 address bytes, 2-byte port.
pub const ADDRESS_BYTES: usize = 19;

const ADDRESS_TAG_NONE: u8 = 0;
const ADDRESS_TAG_IPV4: u8 = 1;
const ADDRESS_TAG_IPV6: u8 = 2;

/// Wire codec errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer too short: need {needed} bytes at offset {offset}, have {len}")]
    TooShort {
        needed: usize,
        offset: usize,
        len: usize,
    },

    #[error("invalid address tag: {0}")]
    InvalidAddressTag(u8),

    #[error("string is not valid utf-8")]
    InvalidString,
}

fn check(buf_len: usize, index: usize, needed: usize) -> Result<(), WireError> {
    if index + needed > buf_len {
        return Err(WireError::TooShort {
            needed,
            offset: index,
            len: buf_len,
        });
    }
    Ok(())
}

macro_rules! int_codec {
    ($write:ident, $read:ident, $ty:ty) => {
        pub fn $write(buf: &mut [u8], index: &mut usize, value: $ty) -> Result<(), WireError> {
            const SIZE: usize = std::mem::size_of::<$ty>();
            check(buf.len(), *index, SIZE)?;
            buf[*index..*index + SIZE].copy_from_slice(&value.to_le_bytes());
            *index += SIZE;
            Ok(())
        }

        pub fn $read(buf: &[u8], index: &mut usize) -> Result<$ty, WireError> {
            const SIZE: usize = std::mem::size_of::<$ty>();
            check(buf.len(), *index, SIZE)?;
            let mut bytes = [0u8; SIZE];
            bytes.copy_from_slice(&buf[*index..*index + SIZE]);
            *index += SIZE;
            Ok(<$ty>::from_le_bytes(bytes))
        }
    };
}

int_codec!(write_u8, read_u8, u8);
int_codec!(write_u16, read_u16, u16);
int_codec!(write_u32, read_u32, u32);
int_codec!(write_u64, read_u64, u64);
int_codec!(write_f32, read_f32, f32);
int_codec!(write_f64, read_f64, f64);

pub fn write_bytes(buf: &mut [u8], index: &mut usize, bytes: &[u8]) -> Result<(), WireError> {
    check(buf.len(), *index, bytes.len())?;
    buf[*index..*index + bytes.len()].copy_from_slice(bytes);
    *index += bytes.len();
    Ok(())
}

pub fn read_bytes(buf: &[u8], index: &mut usize, out: &mut [u8]) -> Result<(), WireError> {
    check(buf.len(), *index, out.len())?;
    out.copy_from_slice(&buf[*index..*index + out.len()]);
    *index += out.len();
    Ok(())
}

/// Strings are a u32 length prefix followed by raw utf-8 bytes.
pub fn write_string(buf: &mut [u8], index: &mut usize, value: &str) -> Result<(), WireError> {
    check(buf.len(), *index, 4 + value.len())?;
    write_u32(buf, index, value.len() as u32)?;
    write_bytes(buf, index, value.as_bytes())?;
    Ok(())
}

pub fn read_string(buf: &[u8], index: &mut usize) -> Result<String, WireError> {
    let start = *index;
    let len = read_u32(buf, index)? as usize;
    if let Err(err) = check(buf.len(), *index, len) {
        *index = start;
        return Err(err);
    }
    let Ok(value) = std::str::from_utf8(&buf[*index..*index + len]) else {
        *index = start;
        return Err(WireError::InvalidString);
    };
    *index += len;
    Ok(value.to_owned())
}

/// Encode an endpoint into the fixed 19-byte form. `None` is 19 zero bytes.
///
/// IPv4 occupies the first four address bytes with zero padding; IPv6 is
/// written as eight little-endian segment groups.
pub fn write_address(
    buf: &mut [u8],
    index: &mut usize,
    addr: Option<SocketAddr>,
) -> Result<(), WireError> {
    check(buf.len(), *index, ADDRESS_BYTES)?;

    let out = &mut buf[*index..*index + ADDRESS_BYTES];
    out.fill(0);

    match addr {
        None => {}
        Some(SocketAddr::V4(v4)) => {
            out[0] = ADDRESS_TAG_IPV4;
            out[1..5].copy_from_slice(&v4.ip().octets());
            out[17..19].copy_from_slice(&v4.port().to_le_bytes());
        }
        Some(SocketAddr::V6(v6)) => {
            out[0] = ADDRESS_TAG_IPV6;
            for (i, group) in v6.ip().segments().iter().enumerate() {
                out[1 + i * 2..3 + i * 2].copy_from_slice(&group.to_le_bytes());
            }
            out[17..19].copy_from_slice(&v6.port().to_le_bytes());
        }
    }

    *index += ADDRESS_BYTES;
    Ok(())
}

/// Decode the fixed 19-byte address form.
pub fn read_address(buf: &[u8], index: &mut usize) -> Result<Option<SocketAddr>, WireError> {
    check(buf.len(), *index, ADDRESS_BYTES)?;

    let bytes = &buf[*index..*index + ADDRESS_BYTES];
    let port = u16::from_le_bytes([bytes[17], bytes[18]]);

    let addr = match bytes[0] {
        ADDRESS_TAG_NONE => None,
        ADDRESS_TAG_IPV4 => {
            let ip = Ipv4Addr::new(bytes[1], bytes[2], bytes[3], bytes[4]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        ADDRESS_TAG_IPV6 => {
            let mut groups = [0u16; 8];
            for (i, group) in groups.iter_mut().enumerate() {
                *group = u16::from_le_bytes([bytes[1 + i * 2], bytes[2 + i * 2]]);
            }
            let ip = Ipv6Addr::new(
                groups[0], groups[1], groups[2], groups[3], groups[4], groups[5], groups[6],
                groups[7],
            );
            Some(SocketAddr::new(IpAddr::V6(ip), port))
        }
        other => return Err(WireError::InvalidAddressTag(other)),
    };

    *index += ADDRESS_BYTES;
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trips_advance_index() {
        let mut buf = [0u8; 64];
        let mut index = 0;

        write_u8(&mut buf, &mut index, 0xAB).unwrap();
        write_u16(&mut buf, &mut index, 0xBEEF).unwrap();
        write_u32(&mut buf, &mut index, 0xDEADBEEF).unwrap();
        write_u64(&mut buf, &mut index, 0x0123_4567_89AB_CDEF).unwrap();
        write_f32(&mut buf, &mut index, 12.5).unwrap();
        write_f64(&mut buf, &mut index, -0.25).unwrap();
        assert_eq!(index, 1 + 2 + 4 + 8 + 4 + 8);

        let mut read_index = 0;
        assert_eq!(read_u8(&buf, &mut read_index).unwrap(), 0xAB);
        assert_eq!(read_u16(&buf, &mut read_index).unwrap(), 0xBEEF);
        assert_eq!(read_u32(&buf, &mut read_index).unwrap(), 0xDEADBEEF);
        assert_eq!(read_u64(&buf, &mut read_index).unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(read_f32(&buf, &mut read_index).unwrap(), 12.5);
        assert_eq!(read_f64(&buf, &mut read_index).unwrap(), -0.25);
        assert_eq!(read_index, index);
    }

    #[test]
    fn values_are_little_endian() {
        let mut buf = [0u8; 8];
        let mut index = 0;
        write_u64(&mut buf, &mut index, 1).unwrap();
        assert_eq!(buf, [1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn bounds_failures_leave_index_unchanged() {
        let mut buf = [0u8; 4];
        let mut index = 2;
        assert!(write_u64(&mut buf, &mut index, 7).is_err());
        assert_eq!(index, 2);

        let mut index = 2;
        assert!(read_u32(&buf, &mut index).is_err());
        assert_eq!(index, 2);
    }

    #[test]
    fn string_round_trip() {
        let mut buf = [0u8; 32];
        let mut index = 0;
        write_string(&mut buf, &mut index, "10.0.0.1:40000").unwrap();
        assert_eq!(index, 4 + 14);

        let mut read_index = 0;
        assert_eq!(read_string(&buf, &mut read_index).unwrap(), "10.0.0.1:40000");
        assert_eq!(read_index, index);
    }

    #[test]
    fn string_with_bogus_length_is_rejected() {
        let mut buf = [0u8; 8];
        let mut index = 0;
        write_u32(&mut buf, &mut index, 1000).unwrap();

        let mut read_index = 0;
        assert!(read_string(&buf, &mut read_index).is_err());
        assert_eq!(read_index, 0);
    }

    #[test]
    fn ipv4_address_round_trip() {
        let addr: SocketAddr = "10.0.0.2:40000".parse().unwrap();
        let mut buf = [0u8; ADDRESS_BYTES];
        let mut index = 0;
        write_address(&mut buf, &mut index, Some(addr)).unwrap();
        assert_eq!(index, ADDRESS_BYTES);

        let mut read_index = 0;
        assert_eq!(read_address(&buf, &mut read_index).unwrap(), Some(addr));
        assert_eq!(read_index, ADDRESS_BYTES);
    }

    #[test]
    fn ipv6_address_round_trip() {
        let addr: SocketAddr = "[2001:db8::42]:51000".parse().unwrap();
        let mut buf = [0u8; ADDRESS_BYTES];
        let mut index = 0;
        write_address(&mut buf, &mut index, Some(addr)).unwrap();

        let mut read_index = 0;
        assert_eq!(read_address(&buf, &mut read_index).unwrap(), Some(addr));
    }

    #[test]
    fn none_address_is_nineteen_zero_bytes() {
        let mut buf = [0xFFu8; ADDRESS_BYTES];
        let mut index = 0;
        write_address(&mut buf, &mut index, None).unwrap();
        assert_eq!(buf, [0u8; ADDRESS_BYTES]);

        let mut read_index = 0;
        assert_eq!(read_address(&buf, &mut read_index).unwrap(), None);
    }

    #[test]
    fn bad_address_tag_is_rejected() {
        let mut buf = [0u8; ADDRESS_BYTES];
        buf[0] = 9;
        let mut index = 0;
        assert_eq!(
            read_address(&buf, &mut index),
            Err(WireError::InvalidAddressTag(9))
        );
    }
}
