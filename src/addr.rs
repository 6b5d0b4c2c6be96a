//! Address parsing, synchronous resolution, and socket address capture.
//!
//! Accepted formats: `host:port`, `host`, `:port`, `[v6-literal]:port`,
//! `[v6-literal]`, and the empty string. The port may be a service name;
//! a missing host or port falls back to the defaults.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

pub(crate) const AMQP_PORT: &str = "5672";

/// Split `addr` into host and port. An absent or empty host is `None`
/// (loopback for connects, wildcard for listens); an absent port is the
/// default AMQP port.
pub(crate) fn parse(addr: &str) -> (Option<String>, String) {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        // [v6-literal] with optional :port
        match rest.split_once(']') {
            Some((host, tail)) => {
                let port = tail.strip_prefix(':').unwrap_or("");
                (host, port)
            }
            None => (rest, ""),
        }
    } else {
        match addr.rsplit_once(':') {
            Some((host, port)) => (host, port),
            None => (addr, ""),
        }
    };
    let host = if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    };
    let port = if port.is_empty() {
        AMQP_PORT.to_string()
    } else {
        port.to_string()
    };
    (host, port)
}

/// A resolved socket address, copied out of the getaddrinfo list so no
/// libc allocation outlives the call.
#[derive(Clone, Copy)]
pub(crate) struct SockAddr {
    pub(crate) family: libc::c_int,
    pub(crate) protocol: libc::c_int,
    pub(crate) storage: libc::sockaddr_storage,
    pub(crate) len: libc::socklen_t,
}

impl SockAddr {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const libc::sockaddr_storage as *const libc::sockaddr
    }
}

/// getaddrinfo with the proactor's fixed hints: unspecified family,
/// stream sockets, v4-mapped plus addrconfig. Listeners add
/// `AI_PASSIVE | AI_ALL`. Synchronous, and called with a context mutex
/// held; an accepted trade-off.
pub(crate) fn resolve(
    host: Option<&str>,
    port: &str,
    passive: bool,
) -> io::Result<Vec<SockAddr>> {
    let chost = match host {
        Some(h) => Some(CString::new(h).map_err(|_| invalid("host contains NUL"))?),
        None => None,
    };
    let cport = CString::new(port).map_err(|_| invalid("port contains NUL"))?;

    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_STREAM;
    hints.ai_flags = libc::AI_V4MAPPED | libc::AI_ADDRCONFIG;
    if passive {
        hints.ai_flags |= libc::AI_PASSIVE | libc::AI_ALL;
    }

    let mut res: *mut libc::addrinfo = std::ptr::null_mut();
    let rc = unsafe {
        libc::getaddrinfo(
            chost.as_ref().map_or(std::ptr::null(), |h| h.as_ptr()),
            cport.as_ptr(),
            &hints,
            &mut res,
        )
    };
    if rc != 0 {
        let msg = unsafe {
            std::ffi::CStr::from_ptr(libc::gai_strerror(rc))
                .to_string_lossy()
                .into_owned()
        };
        return Err(io::Error::new(io::ErrorKind::Other, msg));
    }

    let mut out = Vec::new();
    let mut ai = res;
    while !ai.is_null() {
        let a = unsafe { &*ai };
        if !a.ai_addr.is_null() && a.ai_addrlen as usize <= std::mem::size_of::<libc::sockaddr_storage>() {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    a.ai_addr as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    a.ai_addrlen as usize,
                );
            }
            out.push(SockAddr {
                family: a.ai_family,
                protocol: a.ai_protocol,
                storage,
                len: a.ai_addrlen,
            });
        }
        ai = a.ai_next;
    }
    unsafe {
        libc::freeaddrinfo(res);
    }
    if out.is_empty() {
        return Err(invalid("no usable addresses"));
    }
    Ok(out)
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
}

/// A captured peer or local socket address.
#[derive(Clone, Copy)]
pub struct NetAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl NetAddr {
    pub(crate) fn unspecified() -> NetAddr {
        NetAddr {
            storage: unsafe { std::mem::zeroed() },
            len: 0,
        }
    }

    pub(crate) fn local_of(fd: RawFd) -> NetAddr {
        let mut na = NetAddr::unspecified();
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                fd,
                &mut na.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc == 0 {
            na.len = len;
        }
        na
    }

    pub(crate) fn peer_of(fd: RawFd) -> NetAddr {
        let mut na = NetAddr::unspecified();
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getpeername(
                fd,
                &mut na.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc == 0 {
            na.len = len;
        }
        na
    }

    /// Convert to a std socket address when the family allows it.
    pub fn to_socket_addr(&self) -> Option<std::net::SocketAddr> {
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sa = unsafe {
                    &*(&self.storage as *const libc::sockaddr_storage
                        as *const libc::sockaddr_in)
                };
                let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
                Some(std::net::SocketAddr::new(
                    std::net::IpAddr::V4(ip),
                    u16::from_be(sa.sin_port),
                ))
            }
            libc::AF_INET6 => {
                let sa = unsafe {
                    &*(&self.storage as *const libc::sockaddr_storage
                        as *const libc::sockaddr_in6)
                };
                let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
                Some(std::net::SocketAddr::new(
                    std::net::IpAddr::V6(ip),
                    u16::from_be(sa.sin6_port),
                ))
            }
            _ => None,
        }
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.len == 0 {
            return write!(f, "unknown");
        }
        const NI_MAXSERV: usize = 32;
        let mut host = [0 as libc::c_char; libc::NI_MAXHOST as usize];
        let mut port = [0 as libc::c_char; NI_MAXSERV];
        let rc = unsafe {
            libc::getnameinfo(
                &self.storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                self.len,
                host.as_mut_ptr(),
                host.len() as libc::socklen_t,
                port.as_mut_ptr(),
                port.len() as libc::socklen_t,
                libc::NI_NUMERICHOST | libc::NI_NUMERICSERV,
            )
        };
        if rc != 0 {
            return write!(f, "unknown");
        }
        let host = unsafe { std::ffi::CStr::from_ptr(host.as_ptr()) };
        let port = unsafe { std::ffi::CStr::from_ptr(port.as_ptr()) };
        write!(
            f,
            "{}:{}",
            host.to_string_lossy(),
            port.to_string_lossy()
        )
    }
}

impl fmt::Debug for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetAddr({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_and_port() {
        assert_eq!(
            parse("example.com:1234"),
            (Some("example.com".to_string()), "1234".to_string())
        );
    }

    #[test]
    fn default_port() {
        assert_eq!(
            parse("example.com"),
            (Some("example.com".to_string()), "5672".to_string())
        );
        assert_eq!(
            parse("example.com:"),
            (Some("example.com".to_string()), "5672".to_string())
        );
    }

    #[test]
    fn empty_host() {
        assert_eq!(parse(":1234"), (None, "1234".to_string()));
        assert_eq!(parse(""), (None, "5672".to_string()));
    }

    #[test]
    fn port_name() {
        assert_eq!(
            parse("broker:amqp"),
            (Some("broker".to_string()), "amqp".to_string())
        );
    }

    #[test]
    fn v6_literal() {
        assert_eq!(
            parse("[::1]:1234"),
            (Some("::1".to_string()), "1234".to_string())
        );
        assert_eq!(parse("[::1]"), (Some("::1".to_string()), "5672".to_string()));
        assert_eq!(
            parse("[fe80::1%eth0]:99"),
            (Some("fe80::1%eth0".to_string()), "99".to_string())
        );
    }

    #[test]
    fn resolve_loopback() {
        let addrs = resolve(Some("127.0.0.1"), "5672", false).unwrap();
        assert!(!addrs.is_empty());
        assert_eq!(addrs[0].family, libc::AF_INET);
    }

    #[test]
    fn resolve_passive_wildcard() {
        let addrs = resolve(None, "0", true).unwrap();
        assert!(!addrs.is_empty());
    }
}
