//! Thin wrappers over the extended-attribute syscalls.

// The raw libc interface; see the unsafe blocks below.
#![allow(unsafe_code)]

use std::ffi::CString;
use std::os::fd::AsRawFd;

use anyhow::Context;

use crate::Result;

fn cname(name: &str) -> Result<CString> {
    CString::new(name).context("Xattr name contains NUL")
}

/// List the xattr names on an open file, NUL-separated.
pub(crate) fn flist(fd: &impl AsRawFd) -> Result<Vec<u8>> {
    let fd = fd.as_raw_fd();
    loop {
        let sz = unsafe { libc::flistxattr(fd, std::ptr::null_mut(), 0) };
        if sz < 0 {
            return Err(std::io::Error::last_os_error()).context("flistxattr");
        }
        let mut buf = vec![0u8; sz as usize];
        let n = unsafe { libc::flistxattr(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            buf.truncate(n as usize);
            return Ok(buf);
        }
        let err = std::io::Error::last_os_error();
        // The list can legitimately grow between the two calls.
        if err.raw_os_error() != Some(libc::ERANGE) {
            return Err(err).context("flistxattr");
        }
    }
}

/// Read one xattr value from an open file.
pub(crate) fn fget(fd: &impl AsRawFd, name: &str) -> Result<Vec<u8>> {
    let fd = fd.as_raw_fd();
    let name = cname(name)?;
    loop {
        let sz = unsafe { libc::fgetxattr(fd, name.as_ptr(), std::ptr::null_mut(), 0) };
        if sz < 0 {
            return Err(std::io::Error::last_os_error()).context("fgetxattr");
        }
        let mut buf = vec![0u8; sz as usize];
        let n = unsafe { libc::fgetxattr(fd, name.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            buf.truncate(n as usize);
            return Ok(buf);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ERANGE) {
            return Err(err).context("fgetxattr");
        }
    }
}

/// Set one xattr on an open file.
pub(crate) fn fset(fd: &impl AsRawFd, name: &str, value: &[u8]) -> Result<()> {
    let fd = fd.as_raw_fd();
    let name = cname(name)?;
    let r = unsafe { libc::fsetxattr(fd, name.as_ptr(), value.as_ptr().cast(), value.len(), 0) };
    if r < 0 {
        return Err(std::io::Error::last_os_error()).context("fsetxattr");
    }
    Ok(())
}

/// Gather all (name, value) pairs on an open file, sorted by name.
pub(crate) fn fget_all(fd: &impl AsRawFd) -> Result<crate::objects::Xattrs> {
    let names = flist(fd)?;
    let mut out = Vec::new();
    for name in names.split(|&b| b == 0).filter(|s| !s.is_empty()) {
        let name_str = std::str::from_utf8(name).context("Non-UTF-8 xattr name")?;
        out.push((name.to_vec(), fget(fd, name_str)?));
    }
    out.sort();
    Ok(out)
}
