//! POSIX error codes reported at the block-mapping API boundary

/// Success code
pub const EOK: i32 = 0;

/// Operation not permitted
pub const EPERM: i32 = 1;

/// I/O error
pub const EIO: i32 = 5;

/// Try again
pub const EAGAIN: i32 = 11;

/// Out of memory
pub const ENOMEM: i32 = 12;

/// Invalid argument
pub const EINVAL: i32 = 22;

/// File too large
pub const EFBIG: i32 = 27;

/// No space left on device
pub const ENOSPC: i32 = 28;

/// Read-only file system
pub const EROFS: i32 = 30;

/// Result type for raw errno style callers
pub type ErrnoResult<T> = Result<T, i32>;

/// Convert error code to string description
pub const fn errno_to_str(errno: i32) -> &'static str {
    match errno {
        EOK => "Success",
        EPERM => "Operation not permitted",
        EIO => "I/O error",
        EAGAIN => "Try again",
        ENOMEM => "Out of memory",
        EINVAL => "Invalid argument",
        EFBIG => "File too large",
        ENOSPC => "No space left on device",
        EROFS => "Read-only file system",
        _ => "Unknown error",
    }
}

/// Convert errno to Result
#[inline]
pub fn errno_to_result(errno: i32) -> ErrnoResult<()> {
    if errno == EOK { Ok(()) } else { Err(errno) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_unique() {
        let codes = [EOK, EPERM, EIO, EAGAIN, ENOMEM, EINVAL, EFBIG, ENOSPC, EROFS];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_errno_to_str() {
        assert_eq!(errno_to_str(EOK), "Success");
        assert_eq!(errno_to_str(EAGAIN), "Try again");
        assert_eq!(errno_to_str(ENOSPC), "No space left on device");
        assert_eq!(errno_to_str(999), "Unknown error");
    }

    #[test]
    fn test_errno_to_result() {
        assert!(errno_to_result(EOK).is_ok());
        assert_eq!(errno_to_result(EIO).unwrap_err(), EIO);
    }
}
