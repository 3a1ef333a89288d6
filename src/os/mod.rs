//! Operating System specific trap plumbing, and the contract the tracking
//! engine consumes it through.
//!
//! The engine never talks to the OS directly. A [`TrapProvider`] is
//! injected at construction and supplies the page size, the installation
//! of the process-wide fault callback, raw page protection changes, and
//! the allocation of dual-mapped trackable memory blocks.

use core::{
    fmt::{self, Display, Formatter},
    ops::{BitOr, BitXor},
};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::Error;

#[cfg(unix)]
pub mod unix;

/// Page access permission bits.
///
/// Ordered by bit inclusion: `None < {Read, Write} < ReadWrite`. The
/// tracking state machine only ever adds bits on the fault path and
/// removes single bits on the drain paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Protection {
    /// No access permitted, any access faults.
    None = 0,
    /// Read permitted.
    Read = 1,
    /// Write permitted.
    Write = 2,
    /// Full access, no further fault can occur.
    ReadWrite = 3,
}

impl Protection {
    /// Builds a protection from its two permission bits.
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Protection::None,
            1 => Protection::Read,
            2 => Protection::Write,
            _ => Protection::ReadWrite,
        }
    }

    /// Returns `true` if every bit of `other` is also set in `self`.
    #[must_use]
    pub fn contains(self, other: Protection) -> bool {
        self as u8 & other as u8 == other as u8
    }

    /// Returns `true` if `self` and `other` share any permission bit.
    #[must_use]
    pub fn intersects(self, other: Protection) -> bool {
        self as u8 & other as u8 != 0
    }
}

impl BitOr for Protection {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self::from_bits(self as u8 | rhs as u8)
    }
}

impl BitXor for Protection {
    type Output = Self;

    fn bitxor(self, rhs: Self) -> Self {
        Self::from_bits(self as u8 ^ rhs as u8)
    }
}

impl Display for Protection {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Protection::None => write!(f, "---"),
            Protection::Read => write!(f, "r--"),
            Protection::Write => write!(f, "-w-"),
            Protection::ReadWrite => write!(f, "rw-"),
        }
    }
}

/// The signals a hardware protection trap can arrive as.
#[cfg(unix)]
#[derive(Debug, IntoPrimitive, TryFromPrimitive, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Signal {
    /// `SIGSEGV` signal id
    SigSegmentationFault = libc::SIGSEGV,
    /// `SIGBUS` signal id
    SigBus = libc::SIGBUS,
}

#[cfg(unix)]
impl Display for Signal {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Signal::SigSegmentationFault => write!(f, "SIGSEGV"),
            Signal::SigBus => write!(f, "SIGBUS"),
        }
    }
}

/// A memory block exposing two addresses backed by the same storage.
///
/// Writes through either address are visible through the other, but only
/// `primary` is subject to protection changes made through
/// [`TrapProvider::protect`]. The `secondary` alias lets the engine
/// inspect and modify the content without retriggering the very trap it
/// is handling.
#[derive(Debug, Clone, Copy)]
pub struct TrackableBlock {
    /// The protectable address handed out to the consumer.
    pub primary: *mut u8,
    /// The always-writable alias of the same storage.
    pub secondary: *mut u8,
    /// Size of the block in bytes, a multiple of the page size.
    pub size: usize,
}

/// The fault callback a [`TrapProvider`] dispatches protection traps to.
pub trait FaultHandler {
    /// Classifies and, if the address belongs to a tracked range, resolves
    /// a protection fault.
    ///
    /// Returns `true` when the fault was claimed and the faulting
    /// instruction may be resumed, `false` when the fault is not ours and
    /// must be forwarded to whatever handler existed before.
    ///
    /// # Safety
    ///
    /// Must only be called from the trap context of the faulting thread
    /// (or a test standing in for it). The implementation must not
    /// allocate and must not block on anything but the engine spin lock.
    unsafe fn on_fault(&mut self, fault_addr: *mut u8, access: Protection) -> bool;
}

/// The platform trap provider: one implementation per target OS,
/// injected into the engine at construction.
pub trait TrapProvider {
    /// The hardware page size.
    fn page_size(&self) -> usize;

    /// The signals the installed trap can be delivered as. The engine
    /// blocks these around every non-fault critical section.
    fn trap_signals(&self) -> &'static [Signal];

    /// Installs `handler` as the process-wide receiver for protection
    /// traps, chaining to any previously installed handler when the
    /// callback declines a fault.
    ///
    /// # Safety
    ///
    /// `handler` must stay valid and at a stable address until
    /// [`TrapProvider::uninstall`] is called.
    unsafe fn install(&mut self, handler: *mut dyn FaultHandler) -> Result<(), Error>;

    /// Removes the installed handler and restores the previous signal
    /// dispositions.
    ///
    /// # Safety
    ///
    /// In-flight faults on tracked ranges must be impossible by the time
    /// this is called.
    unsafe fn uninstall(&mut self) -> Result<(), Error>;

    /// Allocates a dual-mapped trackable block of `size` bytes, zeroed.
    /// `size` must be a multiple of the page size.
    fn allocate_trackable(&self, size: usize) -> Result<TrackableBlock, Error>;

    /// Releases a block obtained from [`TrapProvider::allocate_trackable`].
    ///
    /// # Safety
    ///
    /// `block` must come from `allocate_trackable` of this provider and
    /// must not be used afterwards.
    unsafe fn free_trackable(&self, block: TrackableBlock) -> Result<(), Error>;

    /// Applies `protection` to the page-aligned range `addr..addr + size`.
    ///
    /// # Safety
    ///
    /// The range must lie within the primary mapping of a live trackable
    /// block.
    unsafe fn protect(&self, addr: *mut u8, size: usize, protection: Protection)
        -> Result<(), Error>;

    /// [`TrapProvider::protect`] for the fault path: reports failure as a
    /// plain `bool` so the call cannot allocate.
    ///
    /// # Safety
    ///
    /// Same contract as [`TrapProvider::protect`]. Must be
    /// async-signal-safe.
    unsafe fn protect_in_trap(&self, addr: *mut u8, size: usize, protection: Protection) -> bool;
}

#[cfg(test)]
mod tests {
    use super::Protection;

    #[test]
    fn test_protection_bits() {
        assert_eq!(
            Protection::Read | Protection::Write,
            Protection::ReadWrite
        );
        assert_eq!(
            Protection::ReadWrite ^ Protection::Read,
            Protection::Write
        );
        assert!(Protection::ReadWrite.contains(Protection::Write));
        assert!(!Protection::Read.contains(Protection::Write));
        assert!(Protection::ReadWrite.intersects(Protection::Read));
        assert!(!Protection::None.intersects(Protection::ReadWrite));
        assert!(Protection::Read.contains(Protection::None));
    }

    #[test]
    fn test_protection_from_primitive() {
        for bits in 0..4_u8 {
            assert_eq!(Protection::from_bits(bits) as u8, bits);
        }
    }
}
