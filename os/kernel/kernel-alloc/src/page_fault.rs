//! # Page Fault Handler
//!
//! Decides what a page fault means and acts on it. The interrupt layer reads
//! `CR2` and the error code, then calls [`handle_page_fault`] and follows the
//! returned [`FaultResolution`]:
//!
//! 1. A VMA covers the address and the page is not present: lazily map it
//!    (zero-filled, or read from the backing file) and resume.
//! 2. A supervisor-mode access to a non-present page is always fatal.
//! 3. The address lies in the process's stack-growth window: map one page
//!    there, lower the stack base and resume.
//! 4. Anything else kills the process, or halts when there is no process or
//!    the process is a kernel task.
//!
//! The handler keeps no state of its own; every frame comes from the frame
//! allocator and every mapping goes through the [`Vmm`].

use crate::vma::{FileReadError, Vma, VmaList};
use crate::vmm::{Directory, Vmm};
use arrayvec::ArrayVec;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{VirtualAddress, VirtualPage};
use kernel_vmem::{FrameAlloc, Mmu, PageEntryBits, PhysMapper, frame_bytes, zero_frame};

/// Return addresses collected for a fatal fault report.
pub const MAX_BACKTRACE: usize = 8;

/// The error code pushed with a page fault.
///
/// Only the low five bits carry meaning for 32-bit paging without PAE; the
/// rest are kept as raw bits.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// Set for a protection violation, clear for a non-present page.
    pub present: bool,
    pub write: bool,
    /// Set when the access came from CPL 3.
    pub user: bool,
    pub reserved_bit: bool,
    pub instruction_fetch: bool,
    #[bits(27)]
    __: u32,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page (page not mapped or swapped out)"
        } else if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// A process stack that grows down on demand.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StackRegion {
    top: VirtualAddress,
    base: VirtualAddress,
    max_size: u32,
}

impl StackRegion {
    /// A stack ending (exclusively) at `top` whose lowest mapped byte is
    /// `base` and which may grow to at most `max_size` bytes.
    #[must_use]
    pub const fn new(top: VirtualAddress, base: VirtualAddress, max_size: u32) -> Self {
        Self {
            top,
            base,
            max_size,
        }
    }

    #[inline]
    #[must_use]
    pub const fn top(&self) -> VirtualAddress {
        self.top
    }

    /// Lowest currently mapped stack address.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Lowest address the stack may ever grow to.
    #[inline]
    #[must_use]
    pub const fn floor(&self) -> VirtualAddress {
        VirtualAddress::new(self.top.as_u32().saturating_sub(self.max_size))
    }

    /// Whether a non-present fault at `va` may be served by growing.
    ///
    /// Holes left above the base by earlier growth count as well.
    #[inline]
    #[must_use]
    pub const fn covers(&self, va: VirtualAddress) -> bool {
        va.as_u32() >= self.floor().as_u32() && va.as_u32() < self.top.as_u32()
    }

    const fn grown_to(&mut self, page: VirtualPage) {
        if page.base().as_u32() < self.base.as_u32() {
            self.base = page.base();
        }
    }
}

/// What the handler needs to know about the faulting process.
#[derive(Debug)]
pub struct ProcessContext<'f> {
    pub pid: u32,
    /// Kernel tasks are never terminated; their faults halt the system.
    pub kernel: bool,
    pub directory: Directory,
    pub stack: Option<StackRegion>,
    pub vmas: VmaList<'f>,
}

impl ProcessContext<'_> {
    #[must_use]
    pub const fn new(pid: u32, directory: Directory) -> Self {
        Self {
            pid,
            kernel: false,
            directory,
            stack: None,
            vmas: VmaList::new(),
        }
    }
}

/// The trap's inputs.
#[derive(Debug, Copy, Clone)]
pub struct FaultInfo {
    /// Faulting address (`CR2`).
    pub address: VirtualAddress,
    pub error: PageFaultError,
    /// Saved `EBP` of the faulting context, used for the backtrace.
    pub frame_pointer: VirtualAddress,
}

impl FaultInfo {
    #[must_use]
    pub const fn new(address: VirtualAddress, error: PageFaultError) -> Self {
        Self {
            address,
            error,
            frame_pointer: VirtualAddress::null(),
        }
    }

    #[must_use]
    pub const fn with_frame_pointer(mut self, fp: VirtualAddress) -> Self {
        self.frame_pointer = fp;
        self
    }
}

/// Why a fault could not be resolved.
#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum FaultCause {
    #[error("kernel access to a non-present page")]
    KernelNotPresent,
    #[error("no physical frame to back the page")]
    OutOfMemory,
    #[error("reading the backing file failed: {0}")]
    FileRead(#[from] FileReadError),
    #[error("no mapping policy applies")]
    Unhandled,
    #[error("fault raised while the memory manager was busy")]
    Reentrant,
    #[error("memory manager not initialized")]
    NotInitialized,
}

/// Diagnostics for an unrecoverable fault.
#[derive(Debug, Clone)]
pub struct FaultReport {
    pub address: VirtualAddress,
    pub error: PageFaultError,
    pub pid: Option<u32>,
    pub cause: FaultCause,
    /// Return addresses, innermost first.
    pub backtrace: ArrayVec<VirtualAddress, MAX_BACKTRACE>,
}

impl FaultReport {
    /// A report without a backtrace.
    #[must_use]
    pub fn new(fault: &FaultInfo, pid: Option<u32>, cause: FaultCause) -> Self {
        Self {
            address: fault.address,
            error: fault.error,
            pid,
            cause,
            backtrace: ArrayVec::new(),
        }
    }

    /// Emit the report through `log::error!`.
    pub fn log(&self) {
        log::error!(
            "PAGE FAULT at {}: {} (error {:#x}), pid {:?}: {}",
            self.address,
            self.error.explain(),
            self.error.into_bits(),
            self.pid,
            self.cause
        );
        for (i, ret) in self.backtrace.iter().enumerate() {
            log::error!("  #{i}: {ret}");
        }
    }
}

/// What the interrupt layer must do next.
#[derive(Debug, Clone)]
pub enum FaultResolution {
    /// The mapping is in place; return to the faulting instruction.
    Resume,
    /// Kill the current process and reschedule.
    TerminateProcess(FaultReport),
    /// Stop the machine.
    Halt(FaultReport),
}

impl FaultResolution {
    #[inline]
    #[must_use]
    pub const fn is_resume(&self) -> bool {
        matches!(self, Self::Resume)
    }

    #[must_use]
    pub const fn report(&self) -> Option<&FaultReport> {
        match self {
            Self::Resume => None,
            Self::TerminateProcess(r) | Self::Halt(r) => Some(r),
        }
    }
}

/// Resolve one page fault.
///
/// `process` is `None` when the fault happened before any process existed.
pub fn handle_page_fault<M, H, F>(
    vmm: &mut Vmm<M, H>,
    frames: &mut F,
    mut process: Option<&mut ProcessContext<'_>>,
    fault: &FaultInfo,
) -> FaultResolution
where
    M: PhysMapper,
    H: Mmu,
    F: FrameAlloc + ?Sized,
{
    let addr = fault.address;
    let err = fault.error;
    log::debug!("page fault at {addr}: {}", err.explain());

    if let Some(p) = process.as_deref_mut()
        && !err.present()
        && let Some(vma) = p.vmas.find(addr).copied()
    {
        return match lazy_map(vmm, frames, p.directory, &vma, addr.page()) {
            Ok(()) => FaultResolution::Resume,
            Err(cause) => fatal(vmm, Some(&*p), fault, cause),
        };
    }

    if !err.user() && !err.present() {
        return fatal(vmm, process.as_deref(), fault, FaultCause::KernelNotPresent);
    }

    if let Some(p) = process.as_deref_mut()
        && !err.present()
        && let Some(stack) = p.stack.as_mut()
        && stack.covers(addr)
    {
        let page = addr.page();
        let flags = PageEntryBits::user_rw().with_user_access(!p.kernel);
        return match vmm.map_fresh(frames, p.directory, page, flags) {
            Ok(_) => {
                stack.grown_to(page);
                log::debug!("pid {} stack grown to {}", p.pid, stack.base());
                FaultResolution::Resume
            }
            Err(_) => fatal(vmm, Some(&*p), fault, FaultCause::OutOfMemory),
        };
    }

    fatal(vmm, process.as_deref(), fault, FaultCause::Unhandled)
}

/// Populate `page` of `vma` in `dir`.
fn lazy_map<M, H, F>(
    vmm: &mut Vmm<M, H>,
    frames: &mut F,
    dir: Directory,
    vma: &Vma<'_>,
    page: VirtualPage,
) -> Result<(), FaultCause>
where
    M: PhysMapper,
    H: Mmu,
    F: FrameAlloc + ?Sized,
{
    if vmm.query(dir, page.base()).is_some() {
        return Ok(());
    }

    let frame = frames.alloc_4k().ok_or(FaultCause::OutOfMemory)?;
    zero_frame(vmm.mapper(), frame);

    if let (Some(file), Some(offset)) = (vma.file, vma.file_offset(page)) {
        // SAFETY: the frame is fresh and not mapped anywhere yet.
        let bytes = unsafe { frame_bytes(vmm.mapper(), frame) };
        if let Err(e) = file.file.read_at(offset, bytes) {
            frames.free_4k(frame);
            return Err(e.into());
        }
    }

    if vmm.map(frames, dir, page, frame, vma.prot.page_flags()).is_err() {
        frames.free_4k(frame);
        return Err(FaultCause::OutOfMemory);
    }
    log::trace!("lazily mapped {page:?} -> {frame:?}");
    Ok(())
}

fn fatal<M: PhysMapper, H: Mmu>(
    vmm: &Vmm<M, H>,
    process: Option<&ProcessContext<'_>>,
    fault: &FaultInfo,
    cause: FaultCause,
) -> FaultResolution {
    let dir = process.map_or(vmm.current_directory(), |p| p.directory);
    let mut report = FaultReport::new(fault, process.map(|p| p.pid), cause);
    report.backtrace = backtrace(vmm, dir, fault.frame_pointer);
    report.log();

    match process {
        Some(p) if !p.kernel && cause != FaultCause::KernelNotPresent => {
            FaultResolution::TerminateProcess(report)
        }
        _ => FaultResolution::Halt(report),
    }
}

/// Follow the saved frame-pointer chain (`[ebp] = caller ebp`,
/// `[ebp + 4] = return address`) through `dir`.
fn backtrace<M: PhysMapper, H: Mmu>(
    vmm: &Vmm<M, H>,
    dir: Directory,
    mut fp: VirtualAddress,
) -> ArrayVec<VirtualAddress, MAX_BACKTRACE> {
    let mut out = ArrayVec::new();
    while !fp.is_null() && !out.is_full() {
        let mut raw = [0u8; 8];
        if vmm.read_bytes(dir, fp, &mut raw).is_err() {
            break;
        }
        let [a, b, c, d, e, f, g, h] = raw;
        let next = u32::from_le_bytes([a, b, c, d]);
        let ret = u32::from_le_bytes([e, f, g, h]);
        if ret == 0 {
            break;
        }
        out.push(VirtualAddress::new(ret));
        // frames live higher up the stack; anything else is garbage
        if next <= fp.as_u32() {
            break;
        }
        fp = VirtualAddress::new(next);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_bits() {
        let e = PageFaultError::from_bits(0b110);
        assert!(!e.present());
        assert!(e.write());
        assert!(e.user());
        assert!(PageFaultError::from_bits(0b1_0001).instruction_fetch());
        // bits above the five decoded ones do not change the meaning
        assert_eq!(
            PageFaultError::from_bits(0b10_0110).explain(),
            e.explain()
        );
        assert_eq!(e.explain(), "Non-present page (page not mapped or swapped out)");
        assert_eq!(
            PageFaultError::new().with_present(true).with_write(true).explain(),
            "Write access to protected page"
        );
    }

    #[test]
    fn stack_window() {
        let s = StackRegion::new(
            VirtualAddress::new(0xC000_0000),
            VirtualAddress::new(0xBFFF_F000),
            0x0080_0000,
        );
        assert_eq!(s.floor(), VirtualAddress::new(0xBF80_0000));
        assert!(s.covers(VirtualAddress::new(0xBFFF_EFFF)));
        assert!(s.covers(VirtualAddress::new(0xBF80_0000)));
        assert!(!s.covers(VirtualAddress::new(0xBF7F_FFFF)));
        assert!(!s.covers(VirtualAddress::new(0xC000_0000)));
    }
}
