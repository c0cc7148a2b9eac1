use byteorder::{BigEndian, ByteOrder};
use std::fmt;

/// VXLAN header length (RFC 7348)
pub const VXLAN_HEADER_SIZE: usize = 8;

/// "VNI valid" flag, the only flag defined by RFC 7348
pub const VXLAN_FLAG_VNI: u8 = 0x08;

/// 24-bit VXLAN Network Identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Vni(u32);

impl Vni {
    pub const MAX: u32 = 0x00FF_FFFF;

    /// Build a VNI, keeping only the low 24 bits
    pub fn new(value: u32) -> Self {
        Self(value & Self::MAX)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for Vni {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for Vni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// VXLAN header
///
/// ```text
/// |R|R|R|R|I|R|R|R|            Reserved                           |
/// |                VXLAN Network Identifier (VNI) |   Reserved    |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VxlanHeader {
    pub flags: u8,
    pub vni: Vni,
}

impl VxlanHeader {
    pub fn new(vni: Vni) -> Self {
        Self {
            flags: VXLAN_FLAG_VNI,
            vni,
        }
    }

    /// Write the header into the first 8 bytes of `buf`
    pub fn write(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..4], (self.flags as u32) << 24);
        BigEndian::write_u32(&mut buf[4..8], self.vni.get() << 8);
    }

    /// Parse a header from the front of a VXLAN payload
    #[cfg(test)]
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < VXLAN_HEADER_SIZE {
            return None;
        }

        Some(Self {
            flags: data[0],
            vni: Vni::new(BigEndian::read_u32(&data[4..8]) >> 8),
        })
    }
}

/// Prepend a VXLAN header to a captured frame, producing the UDP payload to send
pub fn encapsulate(frame: &[u8], vni: Vni) -> Vec<u8> {
    let mut payload = vec![0u8; VXLAN_HEADER_SIZE + frame.len()];
    VxlanHeader::new(vni).write(&mut payload[..VXLAN_HEADER_SIZE]);
    payload[VXLAN_HEADER_SIZE..].copy_from_slice(frame);
    payload
}
