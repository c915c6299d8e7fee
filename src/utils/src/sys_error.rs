use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysErrorKind {
    Libc,
    OutOfMemory,
    OutOfSwap,
    Io,
    Busy,
}

#[derive(Debug, PartialEq, Eq)]
pub struct SysError {
    code: i32,
    desc: Option<String>,
    kind: SysErrorKind,
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SysError occured with code: {} {:?} {:?}",
            self.code, self.desc, self.kind
        )
    }
}

impl std::error::Error for SysError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl SysError {
    pub fn new(code: i32) -> Self {
        Self {
            code,
            desc: None,
            kind: SysErrorKind::Libc,
        }
    }

    pub fn kind(&self) -> SysErrorKind {
        self.kind
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn no_memory() -> Self {
        Self {
            code: libc::ENOMEM,
            desc: None,
            kind: SysErrorKind::OutOfMemory,
        }
    }

    pub fn no_memory_with_msg(msg: String) -> Self {
        Self {
            code: libc::ENOMEM,
            desc: Some(msg),
            kind: SysErrorKind::OutOfMemory,
        }
    }

    pub fn out_of_swap() -> Self {
        Self {
            code: libc::ENOSPC,
            desc: Some("no free swap slot".to_string()),
            kind: SysErrorKind::OutOfSwap,
        }
    }

    pub fn io_error(msg: String) -> Self {
        Self {
            code: libc::EIO,
            desc: Some(msg),
            kind: SysErrorKind::Io,
        }
    }

    pub fn busy(msg: String) -> Self {
        Self {
            code: libc::EBUSY,
            desc: Some(msg),
            kind: SysErrorKind::Busy,
        }
    }

    pub fn is_out_of_memory(&self) -> bool {
        self.kind == SysErrorKind::OutOfMemory
    }
}

#[macro_export]
macro_rules! bail_libc {
    ($libc_code:expr) => {
        return Err(SysError::new($libc_code))
    };
}

// A violated precondition is a programming error in the caller. It is never
// reported through SysResult.
#[macro_export]
macro_rules! precondition {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            panic!("precondition violation: {}", format_args!($($arg)+));
        }
    };
}

#[macro_export]
macro_rules! precondition_failed {
    ($($arg:tt)+) => {
        panic!("precondition violation: {}", format_args!($($arg)+))
    };
}

pub type SysResult<T> = std::result::Result<T, SysError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn fails_with(code: i32) -> SysResult<()> {
        bail_libc!(code);
    }

    #[test]
    fn kinds_carry_errno() {
        for (err, code, kind) in vec![
            (SysError::no_memory(), libc::ENOMEM, SysErrorKind::OutOfMemory),
            (SysError::out_of_swap(), libc::ENOSPC, SysErrorKind::OutOfSwap),
            (
                SysError::io_error("bad slot".to_string()),
                libc::EIO,
                SysErrorKind::Io,
            ),
            (
                SysError::busy("swap off".to_string()),
                libc::EBUSY,
                SysErrorKind::Busy,
            ),
            (SysError::new(libc::EFAULT), libc::EFAULT, SysErrorKind::Libc),
        ] {
            assert_eq!(err.code(), code);
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn bail_returns_libc_error() {
        let err = fails_with(libc::EINVAL).unwrap_err();
        assert_eq!(err, SysError::new(libc::EINVAL));
        assert!(!err.is_out_of_memory());
    }

    #[test]
    #[should_panic(expected = "precondition violation: slot 3 occupied")]
    fn precondition_panics() {
        precondition!(1 + 1 == 3, "slot {} occupied", 3);
    }
}
