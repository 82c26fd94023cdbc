//! The user-visible error taxonomy (spec.md §6).
//!
//! Every fallible kernel operation returns `KResult<T>`. At the syscall
//! boundary (`syscall.rs`), `Err(e)` is converted to `e.to_negative()`, the
//! non-positive return value the syscall ABI expects; `Ok(n)` becomes `n`.

/// Kernel error taxonomy. Mirrors the C original's `-ENOENT`-style codes
/// (`examples/original_source/sys/*.c`), but as a closed Rust enum instead
/// of sparse integer constants.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Error {
    Inval,
    NoMem,
    NoEnt,
    BadFd,
    MFile,
    Child,
    Pipe,
    Access,
    Io,
    NotSup,
    Busy,
    MProc,
    MThr,
    NoDataBlks,
    NoInodeBlks,
}

pub type KResult<T> = Result<T, Error>;

impl Error {
    /// The negative return value a syscall reports for this error.
    pub const fn to_negative(self) -> isize {
        -(self as isize) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_values_are_distinct_and_negative() {
        let all = [
            Error::Inval,
            Error::NoMem,
            Error::NoEnt,
            Error::BadFd,
            Error::MFile,
            Error::Child,
            Error::Pipe,
            Error::Access,
            Error::Io,
            Error::NotSup,
            Error::Busy,
            Error::MProc,
            Error::MThr,
            Error::NoDataBlks,
            Error::NoInodeBlks,
        ];
        for (i, e) in all.iter().enumerate() {
            assert!(e.to_negative() < 0);
            assert_eq!(e.to_negative(), -(i as isize) - 1);
        }
    }
}
