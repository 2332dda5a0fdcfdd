use std::net::{IpAddr, Ipv4Addr};

/// Parsed `lxc-info -n <name>` output.
///
/// The tool prints loosely aligned `Key: value` lines; unknown keys and
/// lines without a colon are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub name: String,
    pub state: String,
    pub pid: Option<u32>,
    pub ips: Vec<IpAddr>,
}

impl ContainerInfo {
    pub fn parse(text: &str) -> Self {
        let mut info = Self::default();

        for line in text.lines() {
            // Split on the first colon only: IPv6 values contain more.
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                continue;
            }

            match key.to_ascii_lowercase().as_str() {
                "name" => info.name = value.to_string(),
                "state" => info.state = value.to_string(),
                "pid" => info.pid = value.parse().ok(),
                "ip" => {
                    if let Ok(ip) = value.parse() {
                        info.ips.push(ip);
                    }
                }
                _ => {}
            }
        }

        info
    }

    /// First routable IPv4 address reported for the container.
    pub fn first_global_ipv4(&self) -> Option<Ipv4Addr> {
        self.ips.iter().find_map(|ip| match ip {
            IpAddr::V4(v4)
                if !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified() =>
            {
                Some(*v4)
            }
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNNING: &str = "\
Name:           vps-1a2b3c4d-web
State:          RUNNING
PID:            48213
IP:             fd42:7f1c::216:3eff:fe12:3456
IP:             10.0.3.118
CPU use:        1.87 seconds
BlkIO use:      12.00 MiB
Memory use:     31.42 MiB
Link:           vethQ1x2Y3
 TX bytes:      1.20 KiB
 RX bytes:      4.81 KiB
";

    #[test]
    fn parses_state_pid_and_addresses() {
        let info = ContainerInfo::parse(RUNNING);

        assert_eq!(info.name, "vps-1a2b3c4d-web");
        assert_eq!(info.state, "RUNNING");
        assert_eq!(info.pid, Some(48213));
        assert_eq!(info.ips.len(), 2);
        assert_eq!(info.first_global_ipv4(), Some(Ipv4Addr::new(10, 0, 3, 118)));
    }

    #[test]
    fn stopped_container_has_no_address() {
        let info = ContainerInfo::parse("Name: vps-x\nState: STOPPED\n");
        assert_eq!(info.state, "STOPPED");
        assert_eq!(info.pid, None);
        assert_eq!(info.first_global_ipv4(), None);
    }

    #[test]
    fn garbage_degrades_to_empty() {
        let info = ContainerInfo::parse("no colons here\n:\nIP: not-an-ip\n");
        assert!(info.ips.is_empty());
        assert_eq!(info.state, "");
    }
}
