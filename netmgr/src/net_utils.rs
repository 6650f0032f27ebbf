use std::{io, mem, net::SocketAddr, ptr};

use socket2::SockAddr;

#[cfg(unix)]
const STORAGE_SIZE: usize = mem::size_of::<libc::sockaddr_storage>();
#[cfg(windows)]
const STORAGE_SIZE: usize = mem::size_of::<
  windows_sys::Win32::Networking::WinSock::SOCKADDR_STORAGE,
>();

/// Copies a native `sockaddr` of `len` bytes into a [`SocketAddr`].
///
/// Fails with `EAFNOSUPPORT`-like [`io::ErrorKind::InvalidInput`] for
/// anything that isn't IPv4 or IPv6.
///
/// # Safety
///
/// `raw` must point to at least `len` readable bytes holding a socket
/// address, as returned by the resolver or the socket layer.
pub(crate) unsafe fn sockaddr_into_std(
  raw: *const u8,
  len: usize,
) -> io::Result<SocketAddr> {
  if raw.is_null() || len > STORAGE_SIZE {
    return Err(io::Error::new(
      io::ErrorKind::InvalidInput,
      "malformed socket address",
    ));
  }

  // SAFETY: the storage handed to the closure is a zeroed sockaddr_storage,
  // at least `len` bytes by the check above. The caller guarantees `raw`
  // is readable for `len` bytes, and the regions can't overlap.
  let ((), addr) = unsafe {
    SockAddr::try_init(|storage, storage_len| {
      ptr::copy_nonoverlapping(raw, storage.cast::<u8>(), len);
      *storage_len = len as _;
      Ok(())
    })
  }?;

  addr.as_socket().ok_or_else(|| {
    io::Error::new(io::ErrorKind::InvalidInput, "not an inet address")
  })
}

/// Starts winsock once per process. Nothing here ever tears it down.
#[cfg(windows)]
pub(crate) fn init_winsock() {
  use std::sync::Once;
  use windows_sys::Win32::Networking::WinSock::{WSADATA, WSAStartup};

  static INIT: Once = Once::new();
  INIT.call_once(|| {
    // SAFETY: WSADATA is plain data, filled in by WSAStartup.
    let mut data: WSADATA = unsafe { mem::zeroed() };
    let res = unsafe { WSAStartup(0x202, &mut data) };
    if res != 0 {
      log::error!("WSAStartup failed: {}", io::Error::from_raw_os_error(res));
    }
  });
}
