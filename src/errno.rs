//! Errno-style error values.
//!
//! The check and repair paths speak the same error language as the object
//! store underneath them: raw errno values. `Errno` wraps the `libc`
//! constants in a copyable newtype so results stay one machine word and
//! convert losslessly back into wire status codes for peer replies.

use std::fmt;

/// A raw OS error number. Always positive; the sign convention of the
/// underlying store is normalized at the trait boundary.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(i32);

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Errno>;

impl Errno {
    pub const EPERM: Errno = Errno(libc::EPERM);
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const EIO: Errno = Errno(libc::EIO);
    pub const ENXIO: Errno = Errno(libc::ENXIO);
    pub const EAGAIN: Errno = Errno(libc::EAGAIN);
    pub const ENOMEM: Errno = Errno(libc::ENOMEM);
    pub const EFAULT: Errno = Errno(libc::EFAULT);
    pub const EEXIST: Errno = Errno(libc::EEXIST);
    pub const ENODEV: Errno = Errno(libc::ENODEV);
    pub const ENOTDIR: Errno = Errno(libc::ENOTDIR);
    pub const EISDIR: Errno = Errno(libc::EISDIR);
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const ENOSPC: Errno = Errno(libc::ENOSPC);
    pub const ERANGE: Errno = Errno(libc::ERANGE);
    pub const ENODATA: Errno = Errno(libc::ENODATA);
    pub const EPROTO: Errno = Errno(libc::EPROTO);
    pub const ENOTEMPTY: Errno = Errno(libc::ENOTEMPTY);
    pub const ENOTCONN: Errno = Errno(libc::ENOTCONN);
    pub const ESHUTDOWN: Errno = Errno(libc::ESHUTDOWN);
    pub const ETIMEDOUT: Errno = Errno(libc::ETIMEDOUT);
    pub const EHOSTDOWN: Errno = Errno(libc::EHOSTDOWN);
    pub const EHOSTUNREACH: Errno = Errno(libc::EHOSTUNREACH);
    pub const EINPROGRESS: Errno = Errno(libc::EINPROGRESS);
    pub const EALREADY: Errno = Errno(libc::EALREADY);
    pub const ENOTSUP: Errno = Errno(libc::ENOTSUP);
    pub const EBADF: Errno = Errno(libc::EBADF);
    pub const ENAMETOOLONG: Errno = Errno(libc::ENAMETOOLONG);
    pub const EINTR: Errno = Errno(libc::EINTR);
    pub const EBUSY: Errno = Errno(libc::EBUSY);

    pub const fn from_raw(code: i32) -> Errno {
        Errno(if code < 0 { -code } else { code })
    }

    pub const fn code(self) -> i32 {
        self.0
    }

    /// Negative form used in wire status fields and peer replies.
    pub const fn to_wire(self) -> i32 {
        -self.0
    }

    /// A peer or lock-manager failure that marks the run `INCOMPLETE` but
    /// must not abort it.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Errno::ENOTCONN
                | Errno::ESHUTDOWN
                | Errno::ETIMEDOUT
                | Errno::EHOSTDOWN
                | Errno::EHOSTUNREACH
        )
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Errno::EPERM => "EPERM",
            Errno::ENOENT => "ENOENT",
            Errno::EIO => "EIO",
            Errno::ENXIO => "ENXIO",
            Errno::EAGAIN => "EAGAIN",
            Errno::ENOMEM => "ENOMEM",
            Errno::EFAULT => "EFAULT",
            Errno::EEXIST => "EEXIST",
            Errno::ENODEV => "ENODEV",
            Errno::ENOTDIR => "ENOTDIR",
            Errno::EISDIR => "EISDIR",
            Errno::EINVAL => "EINVAL",
            Errno::ENOSPC => "ENOSPC",
            Errno::ERANGE => "ERANGE",
            Errno::ENODATA => "ENODATA",
            Errno::EPROTO => "EPROTO",
            Errno::ENOTEMPTY => "ENOTEMPTY",
            Errno::ENOTCONN => "ENOTCONN",
            Errno::ESHUTDOWN => "ESHUTDOWN",
            Errno::ETIMEDOUT => "ETIMEDOUT",
            Errno::EHOSTDOWN => "EHOSTDOWN",
            Errno::EHOSTUNREACH => "EHOSTUNREACH",
            Errno::EINPROGRESS => "EINPROGRESS",
            Errno::EALREADY => "EALREADY",
            Errno::ENOTSUP => "ENOTSUP",
            Errno::EBADF => "EBADF",
            Errno::ENAMETOOLONG => "ENAMETOOLONG",
            Errno::EINTR => "EINTR",
            Errno::EBUSY => "EBUSY",
            _ => return None,
        })
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Errno({})", self.0),
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<Errno> for i32 {
    fn from(e: Errno) -> i32 {
        e.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_set() {
        assert!(Errno::ENOTCONN.is_transient());
        assert!(Errno::ETIMEDOUT.is_transient());
        assert!(!Errno::ENOENT.is_transient());
        assert!(!Errno::EINVAL.is_transient());
    }

    #[test]
    fn wire_form_is_negative() {
        assert_eq!(Errno::ENOENT.to_wire(), -libc::ENOENT);
        assert_eq!(Errno::from_raw(-libc::EIO), Errno::EIO);
    }
}
