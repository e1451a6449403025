//! Address helpers shared by the fabrics and the connection.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};

use tracing::debug;

use crate::error::{Error, Result};

const SOCKADDR_IN6_SIZE: usize = 28;

/// Resolves `addr` to the first socket address it names.
pub fn lookup<A: ToSocketAddrs>(addr: A) -> Result<SocketAddr> {
    let mut addrs = addr
        .to_socket_addrs()
        .map_err(|err| Error::Lookup(err.to_string()))?;
    addrs
        .next()
        .ok_or_else(|| Error::Lookup("no address found".into()))
}

/// Decodes a raw `sockaddr_storage` whose family field may disagree with the
/// address bytes it carries.
///
/// Some providers report `AF_INET` for a peer whose IPv6 address is filled in
/// (bytes 8..24 non-zero), and `AF_INET6` for one whose IPv4 address is
/// filled in (bytes 4..8 non-zero). The address bytes win over the family.
pub fn sockaddr_from_raw(raw: &[u8]) -> Option<SocketAddr> {
    if raw.len() < 8 {
        return None;
    }
    let family = u16::from_ne_bytes([raw[0], raw[1]]) as i32;
    let port = u16::from_be_bytes([raw[2], raw[3]]);
    let v4 = [raw[4], raw[5], raw[6], raw[7]];
    let v6_set = raw.len() >= SOCKADDR_IN6_SIZE && raw[8..24].iter().any(|b| *b != 0);

    let family = match family {
        libc::AF_INET if v6_set => {
            debug!("address family says IPv4 but carries an IPv6 address");
            libc::AF_INET6
        }
        libc::AF_INET6 if v4 != [0; 4] => {
            debug!("address family says IPv6 but carries an IPv4 address");
            libc::AF_INET
        }
        family => family,
    };
    match family {
        libc::AF_INET => Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(v4), port))),
        libc::AF_INET6 if raw.len() >= SOCKADDR_IN6_SIZE => {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&raw[8..24]);
            let scope_id = u32::from_ne_bytes([raw[24], raw[25], raw[26], raw[27]]);
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(ip),
                port,
                0,
                scope_id,
            )))
        }
        _ => None,
    }
}

/// Numeric `host:port`, with an unspecified host replaced by the host name.
pub fn describe(addr: &SocketAddr) -> String {
    if addr.ip().is_unspecified() {
        if let Some(host) = hostname() {
            return format!("{host}:{}", addr.port());
        }
    }
    addr.to_string()
}

fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return None;
    }
    let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..len].to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(family: i32, port: u16, v4: [u8; 4], v6: [u8; 16]) -> [u8; 128] {
        let mut raw = [0u8; 128];
        raw[..2].copy_from_slice(&(family as u16).to_ne_bytes());
        raw[2..4].copy_from_slice(&port.to_be_bytes());
        raw[4..8].copy_from_slice(&v4);
        raw[8..24].copy_from_slice(&v6);
        raw
    }

    #[test]
    fn decodes_consistent_families() {
        let v4 = raw(libc::AF_INET, 4791, [10, 0, 0, 1], [0; 16]);
        assert_eq!(
            Some("10.0.0.1:4791".parse().unwrap()),
            sockaddr_from_raw(&v4)
        );
        let loopback = Ipv6Addr::LOCALHOST.octets();
        let v6 = raw(libc::AF_INET6, 80, [0; 4], loopback);
        assert_eq!(Some("[::1]:80".parse().unwrap()), sockaddr_from_raw(&v6));
    }

    #[test]
    fn address_bytes_override_family() {
        let fe80 = "fe80::1".parse::<Ipv6Addr>().unwrap().octets();
        let mislabeled_v6 = raw(libc::AF_INET, 7, [0; 4], fe80);
        assert!(matches!(
            sockaddr_from_raw(&mislabeled_v6),
            Some(SocketAddr::V6(addr)) if addr.ip().octets() == fe80
        ));
        let mislabeled_v4 = raw(libc::AF_INET6, 7, [192, 168, 1, 2], [0; 16]);
        assert_eq!(
            Some("192.168.1.2:7".parse().unwrap()),
            sockaddr_from_raw(&mislabeled_v4)
        );
        assert_eq!(None, sockaddr_from_raw(&[0; 4]));
    }

    #[test]
    fn describes_unspecified_as_hostname() {
        let addr: SocketAddr = "0.0.0.0:4791".parse().unwrap();
        let described = describe(&addr);
        assert!(described.ends_with(":4791"));
        assert_eq!("127.0.0.1:1", describe(&"127.0.0.1:1".parse().unwrap()));
        assert!(lookup("127.0.0.1:9").is_ok());
        assert!(lookup("definitely not an address").is_err());
    }
}
