//! AF_UNIX socket addresses.
//!
//! A named unix socket lives in the file system, so the path in `sun_path`
//! is a guest path like any other. Abstract and unnamed addresses, and every
//! other address family, are left alone.

use super::memory::Scratch;
use super::table::SockArg;
use super::{guest_cwd, Entry};
use crate::error::{PathError, Result};
use crate::path::Follow;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Size of `sun_path` in `struct sockaddr_un`.
pub const SUN_PATH_LEN: usize = 108;

const FAMILY_LEN: usize = std::mem::size_of::<libc::sa_family_t>();
const SOCKADDR_UN_LEN: usize = FAMILY_LEN + SUN_PATH_LEN;

const MSGHDR_LEN: usize = std::mem::size_of::<libc::msghdr>();
// msg_name is the first field, msg_namelen follows it.
const MSG_NAMELEN_OFFSET: usize = 8;

pub(crate) fn enter(entry: &mut Entry<'_>, scratch: &mut Scratch, arg: SockArg) -> Result<()> {
    match arg {
        SockArg::Direct { addr, len, follow } => {
            let args = *entry.args();
            let Some((copy, copy_len)) =
                rewrite_address(entry, scratch, args[addr], args[len], follow)?
            else {
                return Ok(());
            };
            entry.regs.set_arg(addr, copy);
            entry.regs.set_arg(len, copy_len);
            entry.pending.rewritten = true;
        }
        SockArg::Message { msg } => {
            let pointer = entry.args()[msg];
            if pointer == 0 {
                return Ok(());
            }
            let mut header = entry.memory().read_bytes(pointer, MSGHDR_LEN)?;
            let name = read_u64(&header[..MSG_NAMELEN_OFFSET]);
            let name_len = read_u32(&header[MSG_NAMELEN_OFFSET..MSG_NAMELEN_OFFSET + 4]);
            let Some((copy, copy_len)) =
                rewrite_address(entry, scratch, name, u64::from(name_len), Follow::Yes)?
            else {
                return Ok(());
            };
            header[..MSG_NAMELEN_OFFSET].copy_from_slice(&copy.to_ne_bytes());
            header[MSG_NAMELEN_OFFSET..MSG_NAMELEN_OFFSET + 4]
                .copy_from_slice(&(copy_len as u32).to_ne_bytes());
            let header_copy = scratch.push(&header)?;
            entry.regs.set_arg(msg, header_copy);
            entry.pending.rewritten = true;
        }
    }
    Ok(())
}

/// Translate the unix path of the address at `addr`. Returns the address and
/// length of the rewritten copy, or `None` when there is nothing to translate.
fn rewrite_address(
    entry: &mut Entry<'_>,
    scratch: &mut Scratch,
    addr: u64,
    len: u64,
    follow: Follow,
) -> Result<Option<(u64, u64)>> {
    if addr == 0 || len as usize <= FAMILY_LEN {
        return Ok(None);
    }
    let raw = entry.memory().read_bytes(addr, (len as usize).min(SOCKADDR_UN_LEN))?;
    let Some(guest) = unix_path(&raw) else {
        return Ok(None);
    };
    let guest = Path::new(OsStr::from_bytes(guest));
    let cwd = if guest.is_absolute() {
        PathBuf::from("/")
    } else {
        guest_cwd(entry.config, entry.pid)
    };
    let host = entry.config.paths.translate(guest, &cwd, follow)?;
    let encoded = encode_unix(host.as_os_str().as_bytes())?;
    debug!(
        pid = %entry.pid,
        path = %guest.display(),
        host = %host.display(),
        "translated socket address"
    );
    let copy = scratch.push(&encoded)?;
    entry.pending.host_paths.push(host);
    Ok(Some((copy, encoded.len() as u64)))
}

/// The file-system path an address names, or `None` for other families,
/// unnamed and abstract addresses.
fn unix_path(sockaddr: &[u8]) -> Option<&[u8]> {
    if sockaddr.len() <= FAMILY_LEN {
        return None;
    }
    let family = libc::sa_family_t::from_ne_bytes([sockaddr[0], sockaddr[1]]);
    if i32::from(family) != libc::AF_UNIX {
        return None;
    }
    let path = &sockaddr[FAMILY_LEN..];
    let end = path.iter().position(|&b| b == 0).unwrap_or(path.len());
    // A leading NUL selects the abstract namespace.
    if end == 0 {
        return None;
    }
    Some(&path[..end])
}

/// An AF_UNIX address naming `host`, NUL-terminated when it fits.
fn encode_unix(host: &[u8]) -> std::result::Result<Vec<u8>, PathError> {
    if host.len() > SUN_PATH_LEN {
        return Err(PathError::NameTooLong);
    }
    let mut out = Vec::with_capacity(SOCKADDR_UN_LEN);
    out.extend_from_slice(&(libc::AF_UNIX as libc::sa_family_t).to_ne_bytes());
    out.extend_from_slice(host);
    if host.len() < SUN_PATH_LEN {
        out.push(0);
    }
    Ok(out)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[..8]);
    u64::from_ne_bytes(word)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    u32::from_ne_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sockaddr(family: i32, path: &[u8]) -> Vec<u8> {
        let mut out = (family as libc::sa_family_t).to_ne_bytes().to_vec();
        out.extend_from_slice(path);
        out
    }

    #[test]
    fn named_unix_address() {
        let addr = sockaddr(libc::AF_UNIX, b"/run/app.sock\0");
        assert_eq!(unix_path(&addr), Some(&b"/run/app.sock"[..]));

        // The length may exclude the terminating NUL.
        let addr = sockaddr(libc::AF_UNIX, b"relative.sock");
        assert_eq!(unix_path(&addr), Some(&b"relative.sock"[..]));
    }

    #[test]
    fn addresses_left_alone() {
        assert_eq!(unix_path(&sockaddr(libc::AF_UNIX, b"\0abstract")), None);
        assert_eq!(unix_path(&sockaddr(libc::AF_UNIX, b"")), None);
        assert_eq!(unix_path(&sockaddr(libc::AF_INET, &[0, 80, 127, 0, 0, 1])), None);
        assert_eq!(unix_path(&[1]), None);
    }

    #[test]
    fn encodes_host_path() {
        let encoded = encode_unix(b"/mnt/guest/run/app.sock").unwrap();
        assert_eq!(unix_path(&encoded), Some(&b"/mnt/guest/run/app.sock"[..]));
        assert_eq!(encoded.len(), FAMILY_LEN + b"/mnt/guest/run/app.sock".len() + 1);
    }

    #[test]
    fn host_path_must_fit_sun_path() {
        let exact = vec![b'a'; SUN_PATH_LEN];
        assert_eq!(encode_unix(&exact).unwrap().len(), SOCKADDR_UN_LEN);

        let long = vec![b'a'; SUN_PATH_LEN + 1];
        assert_eq!(encode_unix(&long), Err(PathError::NameTooLong));
    }

    #[test]
    fn msghdr_layout() {
        // SAFETY: msghdr is plain old data.
        let mut header: libc::msghdr = unsafe { std::mem::zeroed() };
        header.msg_name = 0x1000 as *mut libc::c_void;
        header.msg_namelen = 42;
        // SAFETY: as above.
        let bytes = unsafe {
            std::slice::from_raw_parts(&header as *const libc::msghdr as *const u8, MSGHDR_LEN)
        };
        assert_eq!(read_u64(&bytes[..MSG_NAMELEN_OFFSET]), 0x1000);
        assert_eq!(read_u32(&bytes[MSG_NAMELEN_OFFSET..]), 42);
    }
}
