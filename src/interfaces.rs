use ipnet::IpNet;
use pcap::Device;
use std::fmt;
use std::net::IpAddr;
use tracing::{debug, info};

use crate::capture::CaptureError;

/// A host interface as seen by libpcap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDevice {
    pub name: String,
    pub description: Option<String>,
    /// Assigned addresses; `None` marks an address entry without an IP
    pub addresses: Vec<Option<IpAddr>>,
}

impl From<Device> for CaptureDevice {
    fn from(device: Device) -> Self {
        Self {
            name: device.name,
            description: device.desc,
            addresses: device.addresses.into_iter().map(|a| Some(a.addr)).collect(),
        }
    }
}

/// Why an interface is left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disqualification {
    Loopback(IpAddr),
    ControlNet(IpAddr),
    UnsetAddress,
}

impl fmt::Display for Disqualification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disqualification::Loopback(ip) => write!(f, "loopback address {}", ip),
            Disqualification::ControlNet(ip) => write!(f, "control network address {}", ip),
            Disqualification::UnsetAddress => write!(f, "unset address"),
        }
    }
}

impl CaptureDevice {
    /// Check every address; the first disqualifying one excludes the whole interface
    pub fn evaluate(&self, control_net: &IpNet) -> Result<(), Disqualification> {
        let mut verdict = Ok(());

        for addr in &self.addresses {
            let reason = match addr {
                None => Some(Disqualification::UnsetAddress),
                Some(ip) if ip.is_loopback() => Some(Disqualification::Loopback(*ip)),
                Some(ip) if control_net.contains(ip) => Some(Disqualification::ControlNet(*ip)),
                Some(_) => None,
            };

            match (addr, reason) {
                (Some(ip), None) => debug!("{} with ip {}", self.name, ip),
                (_, Some(reason)) => {
                    debug!("{} has {}, discarded", self.name, reason);
                    if verdict.is_ok() {
                        verdict = Err(reason);
                    }
                }
                (None, None) => {}
            }
        }

        verdict
    }
}

/// Enumerate every interface libpcap can capture on
pub fn discover() -> Result<Vec<CaptureDevice>, CaptureError> {
    let devices = Device::list().map_err(CaptureError::DeviceList)?;
    Ok(devices.into_iter().map(CaptureDevice::from).collect())
}

/// Capturing needs at least one discoverable interface
pub fn require_devices(devices: Vec<CaptureDevice>) -> Result<Vec<CaptureDevice>, CaptureError> {
    if devices.is_empty() {
        return Err(CaptureError::NoDevices);
    }
    Ok(devices)
}

/// Keep the interfaces that carry no loopback, control-network or unset address
pub fn qualify(devices: Vec<CaptureDevice>, control_net: &IpNet) -> Vec<CaptureDevice> {
    devices
        .into_iter()
        .filter(|device| match device.evaluate(control_net) {
            Ok(()) => true,
            Err(reason) => {
                info!("Skipping {}: {}", device.name, reason);
                false
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, addresses: &[Option<&str>]) -> CaptureDevice {
        CaptureDevice {
            name: name.to_string(),
            description: None,
            addresses: addresses
                .iter()
                .map(|a| a.map(|s| s.parse().unwrap()))
                .collect(),
        }
    }

    fn control() -> IpNet {
        "10.10.0.0/16".parse().unwrap()
    }

    #[test]
    fn test_plain_interface_included() {
        let eth0 = device("eth0", &[Some("192.0.2.10"), Some("2001:db8::10")]);
        assert_eq!(eth0.evaluate(&control()), Ok(()));
    }

    #[test]
    fn test_interface_without_addresses_included() {
        let span = device("span0", &[]);
        assert_eq!(span.evaluate(&control()), Ok(()));
    }

    #[test]
    fn test_loopback_excluded() {
        let lo = device("lo", &[Some("127.0.0.1"), Some("::1")]);
        assert_eq!(
            lo.evaluate(&control()),
            Err(Disqualification::Loopback("127.0.0.1".parse().unwrap()))
        );
    }

    #[test]
    fn test_control_address_excludes_whole_interface() {
        let mgmt = device("eth1", &[Some("192.0.2.20"), Some("10.10.3.4")]);
        assert_eq!(
            mgmt.evaluate(&control()),
            Err(Disqualification::ControlNet("10.10.3.4".parse().unwrap()))
        );
    }

    #[test]
    fn test_unset_address_excluded() {
        let odd = device("eth2", &[Some("192.0.2.30"), None]);
        assert_eq!(odd.evaluate(&control()), Err(Disqualification::UnsetAddress));
    }

    #[test]
    fn test_first_reason_reported() {
        let both = device("eth3", &[Some("10.10.0.1"), Some("127.0.0.2")]);
        assert_eq!(
            both.evaluate(&control()),
            Err(Disqualification::ControlNet("10.10.0.1".parse().unwrap()))
        );
    }

    #[test]
    fn test_address_outside_control_net() {
        let near = device("eth4", &[Some("10.11.0.1")]);
        assert_eq!(near.evaluate(&control()), Ok(()));
    }

    #[test]
    fn test_qualify_filters_list() {
        let devices = vec![
            device("lo", &[Some("127.0.0.1")]),
            device("eth0", &[Some("192.0.2.10")]),
            device("eth1", &[Some("10.10.0.5")]),
            device("eth2", &[Some("198.51.100.1"), Some("fe80::1")]),
        ];

        let names: Vec<String> = qualify(devices, &control())
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["eth0", "eth2"]);
    }

    #[test]
    fn test_no_devices_is_error() {
        let err = require_devices(Vec::new()).unwrap_err();
        assert!(matches!(err, CaptureError::NoDevices));
        assert_eq!(err.to_string(), "No devices found");
    }

    #[test]
    fn test_devices_pass_through() {
        let devices = vec![device("lo", &[Some("127.0.0.1")]), device("eth0", &[])];
        assert_eq!(require_devices(devices.clone()).unwrap(), devices);
    }

    #[test]
    fn test_ipv6_control_net() {
        let control: IpNet = "fd00:1::/64".parse().unwrap();
        let mgmt = device("eth5", &[Some("fd00:1::7")]);
        assert!(mgmt.evaluate(&control).is_err());
        let data = device("eth6", &[Some("fd00:2::7")]);
        assert!(data.evaluate(&control).is_ok());
    }
}
