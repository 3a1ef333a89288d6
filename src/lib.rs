/*!
* Page-granularity tracking of CPU memory accesses.
*
* `memtrack` watches one or more memory regions and reports, per page, which
* of them were read or written since the last checkpoint, without any
* cooperation from the accessing code. It does so by handing the consumer a
* protection-locked mirror of the region and intercepting the hardware
* protection faults that accesses to the mirror raise.
*
* The entry point is [`tracker::MemoryTracker`], constructed over a
* [`os::TrapProvider`] such as [`os::unix::PosixTrapProvider`]:
*
* ```no_run
* use memtrack::{os::unix::PosixTrapProvider, tracker::MemoryTracker};
*
* let mut buf = vec![0_u8; 4096 * 4];
* let tracker = MemoryTracker::new(PosixTrapProvider::new()?)?;
*
* let mut mapped = buf.as_mut_ptr();
* tracker.track_mapped_memory(&mut mapped, buf.len())?;
* // `mapped` now points at the protection-locked mirror. All accesses
* // through it are observed; `buf` is reconciled on each drain.
* unsafe { mapped.add(4096).write(0x23) };
*
* tracker.for_each_written_cpu_page(|page, _cpu_writable| {
*     println!("written: {page:?}");
* })?;
* # Ok::<(), memtrack::Error>(())
* ```
*/
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::ptr_as_ptr
)]
#![cfg_attr(
    not(test),
    warn(
        missing_debug_implementations,
        missing_docs,
        trivial_numeric_casts,
        unused_extern_crates,
        unused_import_braces,
        unused_qualifications
    )
)]

pub mod align;
pub mod dirty;
pub mod simd;
pub mod sync;

#[cfg(unix)]
pub mod os;
#[cfg(unix)]
pub mod tracker;

#[cfg(unix)]
pub use tracker::MemoryTracker;

use core::{
    fmt::{self, Display},
    num::TryFromIntError,
};
use std::io;

#[cfg(feature = "errors_backtrace")]
/// Error Backtrace type when `errors_backtrace` feature is enabled (== [`backtrace::Backtrace`])
pub type ErrorBacktrace = backtrace::Backtrace;

#[cfg(not(feature = "errors_backtrace"))]
#[derive(Debug, Default)]
/// Empty struct to use when `errors_backtrace` is disabled
pub struct ErrorBacktrace {}
#[cfg(not(feature = "errors_backtrace"))]
impl ErrorBacktrace {
    /// Nop
    #[must_use]
    pub fn new() -> Self {
        Self {}
    }
}

#[cfg(feature = "errors_backtrace")]
fn display_error_backtrace(f: &mut fmt::Formatter, err: &ErrorBacktrace) -> fmt::Result {
    write!(f, "\nBacktrace: {err:?}")
}
#[cfg(not(feature = "errors_backtrace"))]
#[allow(clippy::unnecessary_wraps)]
fn display_error_backtrace(_f: &mut fmt::Formatter, _err: &ErrorBacktrace) -> fmt::Result {
    fmt::Result::Ok(())
}

/// Main error struct for `memtrack`
#[derive(Debug)]
pub enum Error {
    /// OS error, wrapping a [`std::io::Error`]
    OsError(io::Error, String, ErrorBacktrace),
    /// Key not in Map
    KeyNotFound(String, ErrorBacktrace),
    /// You're holding it wrong
    IllegalState(String, ErrorBacktrace),
    /// The argument passed to this method or function is not valid
    IllegalArgument(String, ErrorBacktrace),
    /// The performed action is not supported on the current platform
    Unsupported(String, ErrorBacktrace),
    /// Something else happened
    Unknown(String, ErrorBacktrace),
}

impl Error {
    /// OS error with additional message
    #[must_use]
    pub fn os_error<S>(err: io::Error, msg: S) -> Self
    where
        S: Into<String>,
    {
        Error::OsError(err, msg.into(), ErrorBacktrace::new())
    }
    /// OS error from [`io::Error::last_os_error`] with additional message
    #[must_use]
    pub fn last_os_error<S>(msg: S) -> Self
    where
        S: Into<String>,
    {
        Error::OsError(io::Error::last_os_error(), msg.into(), ErrorBacktrace::new())
    }
    /// Key not in Map
    #[must_use]
    pub fn key_not_found<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::KeyNotFound(arg.into(), ErrorBacktrace::new())
    }
    /// You're holding it wrong
    #[must_use]
    pub fn illegal_state<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalState(arg.into(), ErrorBacktrace::new())
    }
    /// The argument passed to this method or function is not valid
    #[must_use]
    pub fn illegal_argument<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalArgument(arg.into(), ErrorBacktrace::new())
    }
    /// This operation is not supported on the current architecture or platform
    #[must_use]
    pub fn unsupported<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Unsupported(arg.into(), ErrorBacktrace::new())
    }
    /// Something else happened
    #[must_use]
    pub fn unknown<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Unknown(arg.into(), ErrorBacktrace::new())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OsError(err, s, b) => {
                write!(f, "OS error: {0}: {err}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::KeyNotFound(s, b) => {
                write!(f, "Key `{0}` not found", &s)?;
                display_error_backtrace(f, b)
            }
            Self::IllegalState(s, b) => {
                write!(f, "Illegal state: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::IllegalArgument(s, b) => {
                write!(f, "Illegal argument: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::Unsupported(s, b) => {
                write!(
                    f,
                    "The operation is not supported on the current platform: {0}",
                    &s
                )?;
                display_error_backtrace(f, b)
            }
            Self::Unknown(s, b) => {
                write!(f, "Unknown error: {0}", &s)?;
                display_error_backtrace(f, b)
            }
        }
    }
}

/// Create an Error from io Error
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::os_error(err, "io error")
    }
}

#[cfg(unix)]
impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Self::os_error(io::Error::from_raw_os_error(err as i32), "nix error")
    }
}

impl From<TryFromIntError> for Error {
    fn from(err: TryFromIntError) -> Self {
        Self::illegal_state(format!("Expected conversion failed: {err:?}"))
    }
}

impl std::error::Error for Error {}
