use std::io;

/// Build an `io::Error` carrying a raw errno value.
///
/// The engine reports failures with the same errno values the block layer
/// would surface (`EINVAL`, `EBUSY`, `EFBIG`, ...), so control replies and
/// the per-tracer fail code stay comparable with the on-disk driver format.
pub fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Extract the errno from an `io::Error`, mapping synthetic errors to `EIO`.
pub fn code_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}
