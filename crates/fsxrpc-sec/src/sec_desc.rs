//! Bulk security descriptor codec.
//!
//! Wire layout:
//!
//! ```text
//! +---------+------+-----+-------+-----------+---------------+
//! | version | type | svc | flags | nob (u32) | payload ...   |
//! |   u8    |  u8  | u8  |  u8   |    le     |               |
//! +---------+------+-----+-------+-----------+---------------+
//! ```
//!
//! A message from a peer of the other byte order is flagged `swabbed` by the
//! caller; `nob` is then byte-swapped before validation. `unpack` is the only
//! gate before the descriptor is trusted.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::error;

use crate::error::{SecError, SecResult};

/// The only descriptor version understood.
pub const BULK_SEC_DESC_VERSION: u8 = 0;

/// Size of the fixed header.
pub const BULK_SEC_DESC_HEADER_SIZE: usize = 8;

/// Flag: the sender hit an error while preparing the bulk.
pub const BSD_FL_ERR: u8 = 1;

/// Bulk transfer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BulkType {
    /// Default bulk.
    Default = 0,
    /// Hashed bulk.
    Hash = 1,
}

impl BulkType {
    /// One past the highest valid type.
    pub const MAX: u8 = 2;

    /// Decodes a wire value.
    pub fn from_u8(v: u8) -> SecResult<Self> {
        match v {
            0 => Ok(BulkType::Default),
            1 => Ok(BulkType::Hash),
            _ => Err(SecError::InvalidBulkType(v)),
        }
    }
}

/// Bulk service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BulkSvc {
    /// No protection.
    Null = 0,
    /// Integrity: payload carries a checksum or MIC.
    Integrity = 2,
    /// Privacy: pages are encrypted.
    Privacy = 3,
}

impl BulkSvc {
    /// Decodes a wire value. `1` (authentication only) is not a bulk service.
    pub fn from_u8(v: u8) -> SecResult<Self> {
        match v {
            0 => Ok(BulkSvc::Null),
            2 => Ok(BulkSvc::Integrity),
            3 => Ok(BulkSvc::Privacy),
            _ => Err(SecError::InvalidService(v)),
        }
    }
}

/// A decoded bulk security descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkSecDesc {
    /// Format version.
    pub version: u8,
    /// Transfer type.
    pub bulk_type: BulkType,
    /// Service level.
    pub svc: BulkSvc,
    /// `BSD_FL_*` flags.
    pub flags: u8,
    /// Bytes of bulk data covered.
    pub nob: u32,
    /// Algorithm-specific payload following the header.
    pub data: Bytes,
}

impl BulkSecDesc {
    /// A current-version descriptor with no flags.
    pub fn new(bulk_type: BulkType, svc: BulkSvc, nob: u32, data: Bytes) -> Self {
        Self {
            version: BULK_SEC_DESC_VERSION,
            bulk_type,
            svc,
            flags: 0,
            nob,
            data,
        }
    }

    /// Returns `true` if the sender flagged an error.
    pub fn has_error(&self) -> bool {
        self.flags & BSD_FL_ERR != 0
    }

    /// Encoded length.
    pub fn packed_len(&self) -> usize {
        BULK_SEC_DESC_HEADER_SIZE + self.data.len()
    }

    /// Encodes header and payload.
    pub fn pack(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.packed_len());
        buf.put_u8(self.version);
        buf.put_u8(self.bulk_type as u8);
        buf.put_u8(self.svc as u8);
        buf.put_u8(self.flags);
        buf.put_u32_le(self.nob);
        buf.put_slice(&self.data);
        buf
    }

    /// Decodes and validates a descriptor.
    ///
    /// A bad version, type or service is a protocol error and the message
    /// must be dropped. A buffer shorter than the header is
    /// `SecError::InvalidSize`, which is not a protocol error.
    pub fn unpack(buf: &[u8], swabbed: bool) -> SecResult<Self> {
        if buf.len() < BULK_SEC_DESC_HEADER_SIZE {
            error!(size = buf.len(), "invalid bulk sec desc");
            return Err(SecError::InvalidSize {
                size: buf.len(),
                expected: BULK_SEC_DESC_HEADER_SIZE,
            });
        }

        let mut cur = buf;
        let version = cur.get_u8();
        let bulk_type = cur.get_u8();
        let svc = cur.get_u8();
        let flags = cur.get_u8();
        let mut nob = cur.get_u32_le();
        if swabbed {
            nob = nob.swap_bytes();
        }

        if version != BULK_SEC_DESC_VERSION {
            error!(version, "unexpected bulk sec desc version");
            return Err(SecError::UnsupportedVersion(version));
        }
        let bulk_type = BulkType::from_u8(bulk_type).inspect_err(|_| {
            error!(bulk_type, "invalid bulk type");
        })?;
        let svc = BulkSvc::from_u8(svc).inspect_err(|_| {
            error!(svc, "invalid bulk svc");
        })?;

        Ok(Self {
            version,
            bulk_type,
            svc,
            flags,
            nob,
            data: Bytes::copy_from_slice(cur),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(version: u8, ty: u8, svc: u8) -> Vec<u8> {
        let mut v = vec![version, ty, svc, 0];
        v.extend_from_slice(&4096u32.to_le_bytes());
        v
    }

    #[test]
    fn test_pack_layout() {
        let mut desc = BulkSecDesc::new(
            BulkType::Hash,
            BulkSvc::Integrity,
            0x0102_0304,
            Bytes::from_static(b"\xaa\xbb"),
        );
        desc.flags = BSD_FL_ERR;
        let buf = desc.pack();
        assert_eq!(&buf[..], &[0, 1, 2, 1, 0x04, 0x03, 0x02, 0x01, 0xaa, 0xbb]);
        assert_eq!(buf.len(), desc.packed_len());

        let back = BulkSecDesc::unpack(&buf, false).unwrap();
        assert_eq!(back, desc);
        assert!(back.has_error());
    }

    #[test]
    fn test_unpack_accepts_known_services() {
        for svc in [0u8, 2, 3] {
            let desc = BulkSecDesc::unpack(&header(0, 0, svc), false).unwrap();
            assert_eq!(desc.svc as u8, svc);
            assert_eq!(desc.nob, 4096);
            assert!(desc.data.is_empty());
        }
    }

    #[test]
    fn test_unpack_rejects_short_buffer() {
        assert_eq!(
            BulkSecDesc::unpack(&[0, 0, 0], false),
            Err(SecError::InvalidSize {
                size: 3,
                expected: 8
            })
        );
        let err = BulkSecDesc::unpack(&[0u8; 7], false).unwrap_err();
        assert!(!err.is_protocol_error());
        let mut header = [0u8; 8];
        header[0] = 1;
        let err = BulkSecDesc::unpack(&header, false).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_unpack_rejects_version() {
        let err = BulkSecDesc::unpack(&header(1, 0, 0), false).unwrap_err();
        assert_eq!(err, SecError::UnsupportedVersion(1));
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_unpack_rejects_type() {
        assert_eq!(
            BulkSecDesc::unpack(&header(0, BulkType::MAX, 0), false),
            Err(SecError::InvalidBulkType(2))
        );
    }

    #[test]
    fn test_unpack_rejects_auth_and_unknown_svc() {
        assert_eq!(
            BulkSecDesc::unpack(&header(0, 0, 1), false),
            Err(SecError::InvalidService(1))
        );
        assert_eq!(
            BulkSecDesc::unpack(&header(0, 0, 9), false),
            Err(SecError::InvalidService(9))
        );
    }

    #[test]
    fn test_unpack_swabbed_nob() {
        let mut buf = vec![0, 1, 3, 0];
        buf.extend_from_slice(&4096u32.to_be_bytes());
        let desc = BulkSecDesc::unpack(&buf, true).unwrap();
        assert_eq!(desc.nob, 4096);
        assert_eq!(desc.svc, BulkSvc::Privacy);
        assert_eq!(BulkSecDesc::unpack(&buf, false).unwrap().nob, 4096u32.swap_bytes());
    }
}
