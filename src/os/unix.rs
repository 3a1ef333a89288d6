//! The posix [`TrapProvider`]: `sigaction`-based trap installation,
//! `mprotect` protection changes, and dual-mapped trackable blocks built
//! from two `mmap`s of one anonymous shared-memory descriptor.

use core::{
    cell::UnsafeCell,
    mem,
    ptr::{self, addr_of, addr_of_mut, NonNull},
    sync::atomic::{compiler_fence, Ordering},
};

use libc::{c_int, c_void, sigaction, siginfo_t};
use nix::sys::mman::{mprotect, ProtFlags};

use crate::{
    os::{FaultHandler, Protection, Signal, TrackableBlock, TrapProvider},
    Error,
};

/// The signals a protection trap arrives as on this platform.
#[cfg(target_vendor = "apple")]
const TRAP_SIGNALS: &[Signal] = &[Signal::SigSegmentationFault, Signal::SigBus];
/// The signals a protection trap arrives as on this platform.
#[cfg(not(target_vendor = "apple"))]
const TRAP_SIGNALS: &[Signal] = &[Signal::SigSegmentationFault];

struct HandlerHolder {
    handler: UnsafeCell<*mut dyn FaultHandler>,
}

unsafe impl Send for HandlerHolder {}

/// The process-wide fault callback. A single slot: only one tracker may
/// own the trap at a time.
static mut TRAP_HANDLER: Option<HandlerHolder> = None;

/// The actions that were installed before ours, one slot per entry of
/// [`TRAP_SIGNALS`], for chaining unclaimed faults.
static mut PREVIOUS_ACTIONS: [Option<sigaction>; 2] = [None; 2];

/// Let's get 8 mb for now.
const SIGNAL_STACK_SIZE: usize = 2 << 22;

/// To be able to handle a fault when the stack is exhausted, we need our
/// own little stack space.
static mut SIGNAL_STACK_PTR: *mut c_void = ptr::null_mut();

fn signal_slot(signal: c_int) -> Option<usize> {
    TRAP_SIGNALS
        .iter()
        .position(|trap_signal| *trap_signal as c_int == signal)
}

/// Decides which access the faulting instruction attempted.
///
/// On Linux/x86_64 the page-fault error code is in the saved context; bit
/// 1 is set for writes. On Apple aarch64 the exception syndrome carries
/// the WnR bit.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn fault_access(context: *mut c_void) -> Protection {
    const PAGE_FAULT_WRITE: i64 = 0x2;

    if context.is_null() {
        return Protection::Read;
    }
    let ucontext = context as *const libc::ucontext_t;
    let err = (*ucontext).uc_mcontext.gregs[libc::REG_ERR as usize];
    if err & PAGE_FAULT_WRITE != 0 {
        Protection::Write
    } else {
        Protection::Read
    }
}

/// Start of the machine context: the arm64 exception state.
///
/// ```c
/// _STRUCT_ARM_EXCEPTION_STATE64
/// {
///    __uint64_t far;         /* Virtual Fault Address */
///    __uint32_t esr;         /* Exception syndrome */
///    __uint32_t exception;   /* number of arm exception taken */
/// };
/// ```
#[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
#[repr(C)]
struct ArmExceptionState64 {
    far: u64,
    esr: u32,
    exception: u32,
}

#[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
unsafe fn fault_access(context: *mut c_void) -> Protection {
    // WnR bit of the data-abort syndrome
    const ESR_WNR: u32 = 1 << 6;

    if context.is_null() {
        return Protection::Read;
    }
    let ucontext = context as *const libc::ucontext_t;
    let exception_state = (*ucontext).uc_mcontext as *const ArmExceptionState64;
    if exception_state.is_null() {
        return Protection::Read;
    }
    if (*exception_state).esr & ESR_WNR != 0 {
        Protection::Write
    } else {
        Protection::Read
    }
}

/// Without a platform way to classify the access, report a read. If the
/// instruction was actually a write, the retry faults again on the
/// now-readable page and the engine's corrective escalation grants the
/// write bit on that second fault.
#[cfg(not(any(
    all(target_os = "linux", target_arch = "x86_64"),
    all(target_vendor = "apple", target_arch = "aarch64")
)))]
unsafe fn fault_access(_context: *mut c_void) -> Protection {
    Protection::Read
}

/// Entry point for every trapped signal: classify the access, hand the
/// fault to the registered engine, and forward it if the engine declines.
unsafe extern "C" fn trap_handler(signal: c_int, info: *mut siginfo_t, context: *mut c_void) {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let fault_addr = (*info).si_addr() as *mut u8;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let fault_addr = (*info).si_addr as *mut u8;

    let access = fault_access(context);
    let claimed = match &*addr_of!(TRAP_HANDLER) {
        Some(holder) => {
            let handler = &mut **holder.handler.get();
            handler.on_fault(fault_addr, access)
        }
        None => false,
    };
    if !claimed {
        forward_to_previous(signal, info, context);
    }
}

/// Forwards an unclaimed fault to whatever was installed before us.
///
/// For `SIG_DFL` the previous action is reinstalled and this returns; the
/// retried instruction faults again and the default disposition terminates
/// the process, which is the correct outcome for a genuine invalid access.
unsafe fn forward_to_previous(signal: c_int, info: *mut siginfo_t, context: *mut c_void) {
    let previous = signal_slot(signal).and_then(|slot| (*addr_of!(PREVIOUS_ACTIONS))[slot]);
    match previous {
        Some(action) if action.sa_sigaction == libc::SIG_IGN => {}
        Some(action)
            if action.sa_sigaction != libc::SIG_DFL && action.sa_flags & libc::SA_SIGINFO != 0 =>
        {
            let previous_handler: unsafe extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
                mem::transmute(action.sa_sigaction);
            previous_handler(signal, info, context);
        }
        Some(action) if action.sa_sigaction != libc::SIG_DFL => {
            let previous_handler: unsafe extern "C" fn(c_int) = mem::transmute(action.sa_sigaction);
            previous_handler(signal);
        }
        Some(action) => {
            libc::sigaction(signal, &action, ptr::null_mut());
        }
        None => {
            let mut default_action: sigaction = mem::zeroed();
            default_action.sa_sigaction = libc::SIG_DFL;
            libc::sigaction(signal, &default_action, ptr::null_mut());
        }
    }
}

/// Obtains a file descriptor whose mapping can be shared between two
/// addresses, without a name visible on any filesystem.
#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn trackable_fd() -> Result<c_int, Error> {
    let fd = libc::memfd_create(b"memtrack\0".as_ptr() as *const _, libc::MFD_CLOEXEC);
    if fd == -1 {
        return Err(Error::last_os_error("memfd_create() failed"));
    }
    Ok(fd)
}

/// Obtains a file descriptor whose mapping can be shared between two
/// addresses. The `shm_open` name is unlinked right away; the descriptor
/// keeps the storage alive until both mappings are gone.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn trackable_fd() -> Result<c_int, Error> {
    use core::sync::atomic::AtomicUsize;

    static NEXT_BLOCK_ID: AtomicUsize = AtomicUsize::new(0);

    let block_id = NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed);
    let name = format!("/memtrack-{}-{block_id}\0", std::process::id());
    let fd = libc::shm_open(
        name.as_ptr() as *const _,
        libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
        0o600,
    );
    if fd == -1 {
        return Err(Error::last_os_error(format!(
            "shm_open() failed for trackable block {name}"
        )));
    }
    libc::shm_unlink(name.as_ptr() as *const _);
    Ok(fd)
}

fn prot_flags(protection: Protection) -> ProtFlags {
    match protection {
        Protection::None => ProtFlags::PROT_NONE,
        Protection::Read => ProtFlags::PROT_READ,
        // mprotect cannot express write-without-read on common hardware; a
        // Write page is also readable there, so a read on it goes
        // unobserved until the write bit is drained.
        Protection::Write => ProtFlags::PROT_WRITE,
        Protection::ReadWrite => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
    }
}

/// The [`TrapProvider`] for posix systems.
#[derive(Debug)]
pub struct PosixTrapProvider {
    page_size: usize,
    installed: bool,
}

impl PosixTrapProvider {
    /// Creates a provider for this process. Nothing is installed yet;
    /// installation happens when an engine is constructed over it.
    pub fn new() -> Result<Self, Error> {
        // # Safety
        // Plain sysconf call.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return Err(Error::last_os_error("sysconf(_SC_PAGESIZE) failed"));
        }
        Ok(Self {
            page_size: page_size as usize,
            installed: false,
        })
    }
}

impl TrapProvider for PosixTrapProvider {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn trap_signals(&self) -> &'static [Signal] {
        TRAP_SIGNALS
    }

    unsafe fn install(&mut self, handler: *mut dyn FaultHandler) -> Result<(), Error> {
        if (*addr_of!(TRAP_HANDLER)).is_some() {
            return Err(Error::illegal_state(
                "a trap handler is already installed for this process",
            ));
        }

        // First, set up our own stack to be used during fault handling (and
        // specify `SA_ONSTACK` in `sigaction`).
        if (*addr_of!(SIGNAL_STACK_PTR)).is_null() {
            let stack = libc::malloc(SIGNAL_STACK_SIZE);
            if stack.is_null() {
                return Err(Error::unknown(format!(
                    "Failed to allocate signal stack with {SIGNAL_STACK_SIZE} bytes!"
                )));
            }
            *addr_of_mut!(SIGNAL_STACK_PTR) = stack;
        }
        let mut stack: libc::stack_t = mem::zeroed();
        stack.ss_size = SIGNAL_STACK_SIZE;
        stack.ss_sp = *addr_of!(SIGNAL_STACK_PTR);
        libc::sigaltstack(&stack, ptr::null_mut());

        let mut action: sigaction = mem::zeroed();
        libc::sigemptyset(&mut action.sa_mask);
        for signal in TRAP_SIGNALS {
            libc::sigaddset(&mut action.sa_mask, *signal as c_int);
        }
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        action.sa_sigaction = trap_handler as usize;

        ptr::write_volatile(
            addr_of_mut!(TRAP_HANDLER),
            Some(HandlerHolder {
                handler: UnsafeCell::new(handler),
            }),
        );

        for (slot, signal) in TRAP_SIGNALS.iter().enumerate() {
            let mut previous: sigaction = mem::zeroed();
            if libc::sigaction(*signal as c_int, &action, &mut previous) < 0 {
                ptr::write_volatile(addr_of_mut!(TRAP_HANDLER), None);
                return Err(Error::last_os_error(format!(
                    "Could not set up {signal} handler"
                )));
            }
            (*addr_of_mut!(PREVIOUS_ACTIONS))[slot] = Some(previous);
        }
        compiler_fence(Ordering::SeqCst);

        self.installed = true;
        log::info!("trap handler installed for {TRAP_SIGNALS:?}");
        Ok(())
    }

    unsafe fn uninstall(&mut self) -> Result<(), Error> {
        if !self.installed {
            return Ok(());
        }
        for (slot, signal) in TRAP_SIGNALS.iter().enumerate() {
            if let Some(action) = (*addr_of_mut!(PREVIOUS_ACTIONS))[slot].take() {
                if libc::sigaction(*signal as c_int, &action, ptr::null_mut()) < 0 {
                    return Err(Error::last_os_error(format!(
                        "Could not restore the previous {signal} handler"
                    )));
                }
            }
        }
        ptr::write_volatile(addr_of_mut!(TRAP_HANDLER), None);
        compiler_fence(Ordering::SeqCst);

        self.installed = false;
        log::info!("trap handler uninstalled");
        Ok(())
    }

    fn allocate_trackable(&self, size: usize) -> Result<TrackableBlock, Error> {
        if size == 0 || size % self.page_size != 0 {
            return Err(Error::illegal_argument(format!(
                "trackable block size {size} is not a multiple of the page size"
            )));
        }

        // # Safety
        // FFI calls; every error path releases what was acquired so far.
        unsafe {
            let fd = trackable_fd()?;

            if libc::ftruncate(fd, libc::off_t::try_from(size)?) != 0 {
                let err = Error::last_os_error("ftruncate() failed for trackable block");
                libc::close(fd);
                return Err(err);
            }

            let primary = libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            if primary == libc::MAP_FAILED {
                let err = Error::last_os_error("mmap() failed for primary mapping");
                libc::close(fd);
                return Err(err);
            }

            let secondary = libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            if secondary == libc::MAP_FAILED {
                let err = Error::last_os_error("mmap() failed for secondary mapping");
                libc::munmap(primary, size);
                libc::close(fd);
                return Err(err);
            }

            // The mappings keep the storage alive on their own.
            libc::close(fd);

            Ok(TrackableBlock {
                primary: primary as *mut u8,
                secondary: secondary as *mut u8,
                size,
            })
        }
    }

    unsafe fn free_trackable(&self, block: TrackableBlock) -> Result<(), Error> {
        let mut result = Ok(());
        if libc::munmap(block.primary as *mut _, block.size) != 0 {
            result = Err(Error::last_os_error("munmap() failed for primary mapping"));
        }
        if libc::munmap(block.secondary as *mut _, block.size) != 0 && result.is_ok() {
            result = Err(Error::last_os_error(
                "munmap() failed for secondary mapping",
            ));
        }
        result
    }

    unsafe fn protect(
        &self,
        addr: *mut u8,
        size: usize,
        protection: Protection,
    ) -> Result<(), Error> {
        let Some(addr) = NonNull::new(addr as *mut c_void) else {
            return Err(Error::illegal_argument("cannot protect the null page"));
        };
        mprotect(addr, size, prot_flags(protection))?;
        Ok(())
    }

    unsafe fn protect_in_trap(&self, addr: *mut u8, size: usize, protection: Protection) -> bool {
        // Raw mprotect, no error object: this runs inside the trap
        // context where allocation is off limits.
        libc::mprotect(
            addr as *mut c_void,
            size,
            prot_flags(protection).bits(),
        ) == 0
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::PosixTrapProvider;
    use crate::{
        os::{FaultHandler, Protection, TrapProvider},
        Error,
    };

    struct DeclineAll;

    impl FaultHandler for DeclineAll {
        unsafe fn on_fault(&mut self, _fault_addr: *mut u8, _access: Protection) -> bool {
            false
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_trackable_block_is_dual_mapped() -> Result<(), Error> {
        let provider = PosixTrapProvider::new()?;
        let size = 2 * provider.page_size();
        let block = provider.allocate_trackable(size)?;

        unsafe {
            block.secondary.add(provider.page_size()).write(0x5a);
            assert_eq!(block.primary.add(provider.page_size()).read(), 0x5a);

            block.primary.write(0xa5);
            assert_eq!(block.secondary.read(), 0xa5);

            provider.free_trackable(block)?;
        }
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_protect_keeps_secondary_writable() -> Result<(), Error> {
        let provider = PosixTrapProvider::new()?;
        let size = provider.page_size();
        let block = provider.allocate_trackable(size)?;

        unsafe {
            provider.protect(block.primary, size, Protection::None)?;
            // The secondary alias is unaffected by protection changes.
            block.secondary.write(0x23);
            provider.protect(block.primary, size, Protection::ReadWrite)?;
            assert_eq!(block.primary.read(), 0x23);
            provider.free_trackable(block)?;
        }
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_protect_in_trap_matches_protect() -> Result<(), Error> {
        let provider = PosixTrapProvider::new()?;
        let size = provider.page_size();
        let block = provider.allocate_trackable(size)?;

        unsafe {
            assert!(provider.protect_in_trap(block.primary, size, Protection::None));
            block.secondary.write(0x11);
            assert!(provider.protect_in_trap(block.primary, size, Protection::ReadWrite));
            assert_eq!(block.primary.read(), 0x11);

            // The null page is not mapped; failure comes back as `false`.
            assert!(!provider.protect_in_trap(core::ptr::null_mut(), size, Protection::Read));

            provider.free_trackable(block)?;
        }
        Ok(())
    }

    #[test]
    fn test_unaligned_block_size_is_rejected() -> Result<(), Error> {
        let provider = PosixTrapProvider::new()?;
        assert!(provider.allocate_trackable(1).is_err());
        assert!(provider.allocate_trackable(0).is_err());
        Ok(())
    }

    #[test]
    #[serial]
    #[cfg_attr(miri, ignore)]
    fn test_single_install_slot() -> Result<(), Error> {
        let mut handler = DeclineAll;
        let handler_ptr: *mut dyn FaultHandler = &mut handler;

        let mut provider = PosixTrapProvider::new()?;
        let mut second = PosixTrapProvider::new()?;
        unsafe {
            provider.install(handler_ptr)?;
            assert!(second.install(handler_ptr).is_err());
            provider.uninstall()?;
            // The slot is free again.
            second.install(handler_ptr)?;
            second.uninstall()?;
        }
        Ok(())
    }
}
