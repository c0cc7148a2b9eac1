use pcap::Linktype;
use pnet::packet::Packet;
use pnet::packet::ethernet::{EtherType, EtherTypes, EthernetPacket};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::vlan::VlanPacket;
use std::net::IpAddr;

/// Ephemeral port range (RFC 6335) used for derived source ports
pub const PORT_MIN: u16 = 49152;
pub const PORT_MAX: u16 = 65535;
pub const PORT_RANGE: u64 = (PORT_MAX - PORT_MIN) as u64 + 1;

/// Source port used when no flow can be derived from a frame
pub const FALLBACK_PORT: u16 = PORT_MAX;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// DLT_IPV4 / DLT_IPV6
const LINKTYPE_IPV4: i32 = 228;
const LINKTYPE_IPV6: i32 = 229;

/// Linux cooked capture header length and protocol offset
const SLL_HEADER_LEN: usize = 16;
const SLL_PROTOCOL_OFFSET: usize = 14;

/// How frames from a capture handle are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Ethernet,
    LinuxCooked,
    RawIp,
    Unsupported(i32),
}

impl From<Linktype> for LinkKind {
    fn from(linktype: Linktype) -> Self {
        match linktype {
            Linktype::ETHERNET => LinkKind::Ethernet,
            Linktype::LINUX_SLL => LinkKind::LinuxCooked,
            Linktype::RAW | Linktype(LINKTYPE_IPV4) | Linktype(LINKTYPE_IPV6) => LinkKind::RawIp,
            Linktype(other) => LinkKind::Unsupported(other),
        }
    }
}

/// Network-layer identity of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTuple {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
}

impl FlowTuple {
    /// Extract the flow tuple of a captured frame, `None` for non-IP or malformed frames
    pub fn from_frame(frame: &[u8], link: LinkKind) -> Option<Self> {
        match link {
            LinkKind::Ethernet => {
                let ethernet = EthernetPacket::new(frame)?;
                from_ethertype(ethernet.get_ethertype(), ethernet.payload())
            }
            LinkKind::LinuxCooked => {
                if frame.len() < SLL_HEADER_LEN {
                    return None;
                }
                let protocol = u16::from_be_bytes([
                    frame[SLL_PROTOCOL_OFFSET],
                    frame[SLL_PROTOCOL_OFFSET + 1],
                ]);
                from_ethertype(EtherType(protocol), &frame[SLL_HEADER_LEN..])
            }
            LinkKind::RawIp => match frame.first()? >> 4 {
                4 => from_ipv4(frame),
                6 => from_ipv6(frame),
                _ => None,
            },
            LinkKind::Unsupported(_) => None,
        }
    }

    /// Direction-symmetric hash: A->B and B->A produce the same value
    pub fn symmetric_hash(&self) -> u64 {
        let src = ip_octets(&self.src);
        let dst = ip_octets(&self.dst);
        let (low, high) = if src <= dst { (src, dst) } else { (dst, src) };

        let mut hash = fnv1a(FNV_OFFSET_BASIS, &[self.protocol]);
        hash = fnv1a(hash, &low);
        fnv1a(hash, &high)
    }
}

fn from_ethertype(ethertype: EtherType, payload: &[u8]) -> Option<FlowTuple> {
    match ethertype {
        EtherTypes::Ipv4 => from_ipv4(payload),
        EtherTypes::Ipv6 => from_ipv6(payload),
        // 802.1Q / 802.1ad tags, possibly stacked
        EtherTypes::Vlan | EtherTypes::PBridge | EtherTypes::QinQ => {
            let vlan = VlanPacket::new(payload)?;
            from_ethertype(vlan.get_ethertype(), vlan.payload())
        }
        _ => None,
    }
}

fn from_ipv4(data: &[u8]) -> Option<FlowTuple> {
    let ipv4 = Ipv4Packet::new(data)?;
    if ipv4.get_version() != 4 || ipv4.get_header_length() < 5 {
        return None;
    }

    Some(FlowTuple {
        src: IpAddr::V4(ipv4.get_source()),
        dst: IpAddr::V4(ipv4.get_destination()),
        protocol: ipv4.get_next_level_protocol().0,
    })
}

fn from_ipv6(data: &[u8]) -> Option<FlowTuple> {
    let ipv6 = Ipv6Packet::new(data)?;
    if ipv6.get_version() != 6 {
        return None;
    }

    Some(FlowTuple {
        src: IpAddr::V6(ipv6.get_source()),
        dst: IpAddr::V6(ipv6.get_destination()),
        protocol: ipv6.get_next_header().0,
    })
}

fn ip_octets(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Map a flow hash into the ephemeral port range
pub fn port_from_hash(hash: u64) -> u16 {
    PORT_MIN + (hash % PORT_RANGE) as u16
}

/// Derive the UDP source port for one mirrored frame.
///
/// Both directions of a flow map to the same port. Frames without a usable
/// network layer get [`FALLBACK_PORT`].
pub fn compute_source_port(frame: &[u8], link: LinkKind) -> u16 {
    match FlowTuple::from_frame(frame, link) {
        Some(flow) => port_from_hash(flow.symmetric_hash()),
        None => FALLBACK_PORT,
    }
}
