//! Host network interface enumeration and per-interface queries.
//!
//! Uses the classic `SIOCGIFCONF`/`SIOCGIF*` ioctls on a throwaway IPv4
//! stream socket. Addresses are returned as host-order `u32`.

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;

use serde::Serialize;
use socket2::{Domain, Socket, Type};
use tracing::{debug, error, warn};

use crate::error::{NetError, NetResult};

/// Kernel interface name field size, terminating NUL included.
pub const IFNAMSIZ: usize = libc::IFNAMSIZ;

/// First guess at the number of configured interfaces.
const INITIAL_IFREQ_GUESS: usize = 16;

/// Raw, NUL-padded interface name as returned by `SIOCGIFCONF`.
pub(crate) type RawIfName = [u8; IFNAMSIZ];

/// State of one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InterfaceInfo {
    /// Administratively up.
    pub up: bool,
    /// IPv4 address, host byte order; zero when down.
    pub ip: u32,
    /// IPv4 netmask, host byte order; zero when down.
    pub mask: u32,
}

impl InterfaceInfo {
    /// Info reported for a down interface.
    pub const DOWN: InterfaceInfo = InterfaceInfo {
        up: false,
        ip: 0,
        mask: 0,
    };

    /// The address as an `Ipv4Addr`.
    pub fn ip_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    /// The netmask as an `Ipv4Addr`.
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask)
    }
}

#[repr(C)]
struct IfConf {
    ifc_len: libc::c_int,
    ifc_buf: *mut libc::c_char,
}

/// Upper bound on interface records fetched: one page worth of `ifreq`s.
pub fn max_enumerated_interfaces() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page = if page > 0 { page as usize } else { 4096 };
    page / mem::size_of::<libc::ifreq>()
}

/// Lists the names of all configured interfaces.
///
/// An empty list is a valid result. If more interfaces exist than
/// [`max_enumerated_interfaces`], the list is truncated with a warning.
pub fn enumerate_interfaces() -> NetResult<Vec<String>> {
    enumerate_with(max_enumerated_interfaces(), fetch_ifconf)
}

/// Grows the scratch buffer from 16 entries, doubling, until every interface
/// fits or `max_entries` is reached.
pub(crate) fn enumerate_with<F>(max_entries: usize, mut fetch: F) -> NetResult<Vec<String>>
where
    F: FnMut(usize) -> io::Result<Vec<RawIfName>>,
{
    let mut nalloc = INITIAL_IFREQ_GUESS;
    let mut toobig = false;

    let found = loop {
        if nalloc > max_entries {
            toobig = true;
            nalloc = max_entries;
            warn!(limit = nalloc, "too many interfaces: only enumerating the first {}", nalloc);
        }

        let found = fetch(nalloc).map_err(|e| {
            error!(error = %e, "error enumerating interfaces");
            NetError::IoError(e)
        })?;
        assert!(found.len() <= nalloc, "SIOCGIFCONF overran its buffer");

        if found.len() < nalloc || toobig {
            break found;
        }
        nalloc *= 2;
    };

    let mut names = Vec::with_capacity(found.len());
    for raw in &found {
        let nob = raw.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
        if nob == IFNAMSIZ {
            // no space for the terminating NUL
            let name = String::from_utf8_lossy(raw).into_owned();
            error!(name = %name, max = IFNAMSIZ, "interface name too long");
            return Err(NetError::NameTooLong {
                name,
                max: IFNAMSIZ,
            });
        }
        names.push(String::from_utf8_lossy(&raw[..nob]).into_owned());
    }
    Ok(names)
}

/// Returns up/ip/netmask for `name`.
///
/// A down interface reports zero ip and mask without further queries.
pub fn query_interface(name: &str) -> NetResult<InterfaceInfo> {
    query_with(name, |request, ifr| ioctl(request, ifr))
}

/// Runs the flags, address and netmask queries through `ioctl_fn`.
pub(crate) fn query_with<F>(name: &str, mut ioctl_fn: F) -> NetResult<InterfaceInfo>
where
    F: FnMut(u64, &mut libc::ifreq) -> io::Result<()>,
{
    let mut ifr = new_ifreq(name)?;
    ioctl_fn(libc::SIOCGIFFLAGS as u64, &mut ifr).map_err(|e| {
        error!(iface = name, error = %e, "can't get flags for interface");
        NetError::IoError(e)
    })?;

    // SAFETY: SIOCGIFFLAGS filled the flags member of the union.
    let flags = unsafe { *(&ifr.ifr_ifru as *const _ as *const libc::c_short) };
    if libc::c_int::from(flags) & libc::IFF_UP == 0 {
        debug!(iface = name, "interface down");
        return Ok(InterfaceInfo::DOWN);
    }

    let ip = query_inet(name, libc::SIOCGIFADDR as u64, &mut ioctl_fn).map_err(|e| {
        error!(iface = name, error = %e, "can't get IP address for interface");
        e
    })?;
    let mask = query_inet(name, libc::SIOCGIFNETMASK as u64, &mut ioctl_fn).map_err(|e| {
        error!(iface = name, error = %e, "can't get netmask for interface");
        e
    })?;

    Ok(InterfaceInfo { up: true, ip, mask })
}

fn query_inet<F>(name: &str, request: u64, ioctl_fn: &mut F) -> NetResult<u32>
where
    F: FnMut(u64, &mut libc::ifreq) -> io::Result<()>,
{
    let mut ifr = new_ifreq(name)?;
    // SAFETY: the union is at least as large as a sockaddr.
    unsafe {
        let sa = &mut ifr.ifr_ifru as *mut _ as *mut libc::sockaddr;
        (*sa).sa_family = libc::AF_INET as libc::sa_family_t;
    }
    ioctl_fn(request, &mut ifr)?;
    // SAFETY: the ioctl stored an AF_INET sockaddr in the union.
    let sin = unsafe { &*(&ifr.ifr_ifru as *const _ as *const libc::sockaddr_in) };
    Ok(u32::from_be(sin.sin_addr.s_addr))
}

/// Validates `name` against the kernel's fixed-size field and builds an `ifreq`.
fn new_ifreq(name: &str) -> NetResult<libc::ifreq> {
    let bytes = name.as_bytes();
    if bytes.len() >= IFNAMSIZ {
        return Err(NetError::NameTooLong {
            name: name.to_string(),
            max: IFNAMSIZ,
        });
    }
    if bytes.contains(&0) {
        return Err(NetError::InvalidArgument(format!(
            "interface name {:?} contains NUL",
            name
        )));
    }

    // SAFETY: ifreq is plain old data; all-zero is a valid value.
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, &src) in ifr.ifr_name.iter_mut().zip(bytes) {
        *dst = src as libc::c_char;
    }
    Ok(ifr)
}

fn fetch_ifconf(nalloc: usize) -> io::Result<Vec<RawIfName>> {
    // SAFETY: zeroed ifreqs are valid; the kernel writes at most ifc_len bytes.
    let mut reqs: Vec<libc::ifreq> = (0..nalloc).map(|_| unsafe { mem::zeroed() }).collect();
    let mut ifc = IfConf {
        ifc_len: (nalloc * mem::size_of::<libc::ifreq>()) as libc::c_int,
        ifc_buf: reqs.as_mut_ptr() as *mut libc::c_char,
    };
    ioctl(libc::SIOCGIFCONF as u64, &mut ifc)?;

    let nfound = ifc.ifc_len as usize / mem::size_of::<libc::ifreq>();
    Ok(reqs[..nfound.min(nalloc)]
        .iter()
        .map(|r| {
            let mut raw = [0u8; IFNAMSIZ];
            for (dst, &src) in raw.iter_mut().zip(r.ifr_name.iter()) {
                *dst = src as u8;
            }
            raw
        })
        .collect())
}

/// Issues `request` on a fresh IPv4 stream socket.
fn ioctl<T>(request: u64, arg: &mut T) -> io::Result<()> {
    let sock = Socket::new(Domain::IPV4, Type::STREAM, None).map_err(|e| {
        error!(error = %e, "can't create socket");
        e
    })?;
    // SAFETY: `arg` is the structure type `request` expects and outlives the call.
    let rc = unsafe { libc::ioctl(sock.as_raw_fd(), request as _, arg as *mut T) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
