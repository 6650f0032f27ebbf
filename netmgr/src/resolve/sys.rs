//! Blocking `getaddrinfo` binding.

use std::ffi::{CStr, CString, c_char};
use std::io;
use std::ptr;

use socket2::Domain;

use super::{AddrInfo, AddrInfoHints, AddrInfoList};
use crate::errors::ResolveError;
use crate::net_utils::sockaddr_into_std;
use crate::socket::{Protocol, ProtocolFamily, SocketType};

/// A lookup with its strings already checked for interior NULs, so it can
/// be handed to another thread.
#[derive(Debug, Clone)]
pub(crate) struct Query {
  node: Option<CString>,
  service: Option<CString>,
  hints: AddrInfoHints,
}

impl Query {
  pub(crate) fn new(
    node: Option<&str>,
    service: Option<&str>,
    hints: &AddrInfoHints,
  ) -> io::Result<Self> {
    let to_c = |what: &str, s: Option<&str>| {
      s.map(CString::new).transpose().map_err(|_| {
        io::Error::new(
          io::ErrorKind::InvalidInput,
          format!("{what} contains a NUL byte"),
        )
      })
    };
    Ok(Self {
      node: to_c("host", node)?,
      service: to_c("service", service)?,
      hints: hints.clone(),
    })
  }

  fn node_ptr(&self) -> *const c_char {
    self.node.as_deref().map_or(ptr::null(), CStr::as_ptr)
  }

  fn service_ptr(&self) -> *const c_char {
    self.service.as_deref().map_or(ptr::null(), CStr::as_ptr)
  }
}

/// One raw resolver entry, skipped when it isn't an inet stream or
/// datagram address.
///
/// # Safety
///
/// `addr` must be readable for `addr_len` bytes; `canon` must be null or a
/// NUL terminated string.
unsafe fn entry(
  family: i32,
  socket_type: i32,
  protocol: i32,
  addr: *const u8,
  addr_len: usize,
  canon: *const c_char,
) -> Option<AddrInfo> {
  let family = ProtocolFamily::from_domain(Domain::from(family));
  if family == ProtocolFamily::Unspec {
    return None;
  }
  let socket_type = SocketType::from_raw(socket_type)?;
  let addr = match unsafe { sockaddr_into_std(addr, addr_len) } {
    Ok(addr) => addr,
    Err(err) => {
      log::debug!("skipping unusable resolver entry: {err}");
      return None;
    }
  };
  let canonical_name = (!canon.is_null()).then(|| {
    // SAFETY: non-null, NUL terminated per the resolver's contract.
    unsafe { CStr::from_ptr(canon) }.to_string_lossy().into_owned()
  });

  Some(AddrInfo {
    family,
    socket_type,
    protocol: Protocol::from_raw(protocol),
    addr,
    canonical_name,
  })
}

#[cfg(unix)]
mod imp {
  use super::*;

  /// Frees the resolver's list however we leave.
  struct RawList(*mut libc::addrinfo);

  impl Drop for RawList {
    fn drop(&mut self) {
      if !self.0.is_null() {
        // SAFETY: the pointer came from a successful getaddrinfo.
        unsafe { libc::freeaddrinfo(self.0) };
      }
    }
  }

  pub(crate) fn lookup(query: &Query) -> Result<AddrInfoList, ResolveError> {
    // SAFETY: all-zero is a valid, empty hints struct.
    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = query.hints.family.raw();
    hints.ai_socktype = query.hints.socket_type.map_or(0, SocketType::raw);
    hints.ai_protocol = query.hints.protocol.map_or(0, Protocol::raw);
    if query.hints.passive {
      hints.ai_flags |= libc::AI_PASSIVE;
    }
    if query.hints.canonical_name {
      hints.ai_flags |= libc::AI_CANONNAME;
    }

    let mut res: *mut libc::addrinfo = ptr::null_mut();
    let code = unsafe {
      libc::getaddrinfo(
        query.node_ptr(),
        query.service_ptr(),
        &hints,
        &mut res,
      )
    };
    if code != 0 {
      return Err(ResolveError::from_gai(code, io::Error::last_os_error()));
    }
    let list = RawList(res);

    let mut out = Vec::new();
    let mut cur = list.0;
    while !cur.is_null() {
      // SAFETY: `cur` walks the list getaddrinfo handed us, which stays
      // alive until `list` drops.
      let ai = unsafe { &*cur };
      let info = unsafe {
        entry(
          ai.ai_family,
          ai.ai_socktype,
          ai.ai_protocol,
          ai.ai_addr.cast::<u8>(),
          ai.ai_addrlen as usize,
          ai.ai_canonname,
        )
      };
      out.extend(info);
      cur = ai.ai_next;
    }
    Ok(out)
  }
}

#[cfg(windows)]
mod imp {
  use super::*;
  use windows_sys::Win32::Networking::WinSock::{
    ADDRINFOA, AI_CANONNAME, AI_PASSIVE, WSAGetLastError, freeaddrinfo,
    getaddrinfo,
  };

  struct RawList(*mut ADDRINFOA);

  impl Drop for RawList {
    fn drop(&mut self) {
      if !self.0.is_null() {
        unsafe { freeaddrinfo(self.0) };
      }
    }
  }

  pub(crate) fn lookup(query: &Query) -> Result<AddrInfoList, ResolveError> {
    crate::net_utils::init_winsock();

    let mut hints: ADDRINFOA = unsafe { std::mem::zeroed() };
    hints.ai_family = query.hints.family.raw();
    hints.ai_socktype = query.hints.socket_type.map_or(0, SocketType::raw);
    hints.ai_protocol = query.hints.protocol.map_or(0, Protocol::raw);
    if query.hints.passive {
      hints.ai_flags |= AI_PASSIVE as i32;
    }
    if query.hints.canonical_name {
      hints.ai_flags |= AI_CANONNAME as i32;
    }

    let mut res: *mut ADDRINFOA = ptr::null_mut();
    let code = unsafe {
      getaddrinfo(
        query.node_ptr().cast(),
        query.service_ptr().cast(),
        &hints,
        &mut res,
      )
    };
    if code != 0 {
      let errno = io::Error::from_raw_os_error(unsafe { WSAGetLastError() });
      return Err(ResolveError::from_gai(code, errno));
    }
    let list = RawList(res);

    let mut out = Vec::new();
    let mut cur = list.0;
    while !cur.is_null() {
      let ai = unsafe { &*cur };
      let info = unsafe {
        entry(
          ai.ai_family,
          ai.ai_socktype,
          ai.ai_protocol,
          ai.ai_addr.cast::<u8>(),
          ai.ai_addrlen,
          ai.ai_canonname.cast::<c_char>(),
        )
      };
      out.extend(info);
      cur = ai.ai_next;
    }
    Ok(out)
  }
}

pub(crate) use imp::lookup;
