use std::net::{IpAddr, ToSocketAddrs};

/// Name lookups performed while enumerating a machine's own candidates.
pub trait NameService {
    /// The address this machine's own host name resolves to.
    fn local_host(&self) -> Option<IpAddr>;
    /// Reverse-resolved name for `ip`, or its literal form when it has none.
    fn canonical_name(&self, ip: IpAddr) -> String;
}

/// Uses the operating system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemNames;

impl NameService for SystemNames {
    fn local_host(&self) -> Option<IpAddr> {
        let host = local_hostname()?;
        (host.as_str(), 0)
            .to_socket_addrs()
            .ok()?
            .map(|addr| addr.ip())
            .next()
    }

    fn canonical_name(&self, ip: IpAddr) -> String {
        reverse_lookup(ip).unwrap_or_else(|| ip.to_string())
    }
}

const HOST_BUF_LEN: usize = 1025;

#[cfg(unix)]
pub fn local_hostname() -> Option<String> {
    let mut buf = [0 as libc::c_char; HOST_BUF_LEN];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let name = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    if name.is_empty() { None } else { Some(name) }
}

#[cfg(not(unix))]
pub fn local_hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

/// Reverse DNS for `ip`. `None` when no name is registered.
#[cfg(unix)]
pub fn reverse_lookup(ip: IpAddr) -> Option<String> {
    use std::mem;

    let mut host = [0 as libc::c_char; HOST_BUF_LEN];
    let rc = match ip {
        IpAddr::V4(v4) => {
            let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.octets()),
            };
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
            {
                sa.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
            }
            unsafe {
                libc::getnameinfo(
                    &sa as *const libc::sockaddr_in as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    host.as_mut_ptr(),
                    host.len() as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    libc::NI_NAMEREQD,
                )
            }
        }
        IpAddr::V6(v6) => {
            let mut sa: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_addr = libc::in6_addr {
                s6_addr: v6.octets(),
            };
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
            {
                sa.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
            }
            unsafe {
                libc::getnameinfo(
                    &sa as *const libc::sockaddr_in6 as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    host.as_mut_ptr(),
                    host.len() as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    libc::NI_NAMEREQD,
                )
            }
        }
    };
    if rc != 0 {
        return None;
    }
    let name = unsafe { std::ffi::CStr::from_ptr(host.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    if name.is_empty() { None } else { Some(name) }
}

#[cfg(not(unix))]
pub fn reverse_lookup(_ip: IpAddr) -> Option<String> {
    None
}
