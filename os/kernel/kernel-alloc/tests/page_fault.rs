mod common;

use common::{bitmap, frame_map, paging, ram};
use kernel_alloc::{
    FaultCause, FaultInfo, FaultResolution, FileBacking, FileReadError, PageFaultError,
    ProcessContext, Protection, StackRegion, Vma, handle_page_fault,
};
use kernel_info::memory::{MAX_STACK_SIZE, USER_STACK_TOP};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vmem::PageEntryBits;

fn user_write_not_present() -> PageFaultError {
    PageFaultError::new().with_write(true).with_user(true)
}

fn user_read_not_present() -> PageFaultError {
    PageFaultError::new().with_user(true)
}

/// A file whose byte at offset `o` is `o % 251`.
struct Pattern {
    len: u64,
}

impl FileBacking for Pattern {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FileReadError> {
        let mut n = 0;
        for (i, b) in buf.iter_mut().enumerate() {
            let o = offset + i as u64;
            if o >= self.len {
                break;
            }
            *b = u8::try_from(o % 251).unwrap();
            n += 1;
        }
        Ok(n)
    }
}

struct Broken;

impl FileBacking for Broken {
    fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, FileReadError> {
        Err(FileReadError::Io)
    }
}

#[test]
fn stack_grows_one_page_below_the_base() {
    let ram = ram();
    let mut storage = bitmap();
    let (mut frames, mut vmm) = paging(&ram, &mut storage);
    let dir = vmm.create_directory(&mut frames).unwrap();

    let top = VirtualAddress::new(USER_STACK_TOP);
    let base = VirtualAddress::new(USER_STACK_TOP - PAGE_SIZE);
    vmm.map_fresh(&mut frames, dir, base.page(), PageEntryBits::user_rw())
        .unwrap();

    let mut proc = ProcessContext::new(7, dir);
    proc.stack = Some(StackRegion::new(top, base, MAX_STACK_SIZE));

    let below = VirtualAddress::new(base.as_u32() - 1);
    let fault = FaultInfo::new(below, user_write_not_present());
    let res = handle_page_fault(&mut vmm, &mut frames, Some(&mut proc), &fault);

    assert!(res.is_resume());
    assert!(vmm.query(dir, below).is_some());
    assert_eq!(proc.stack.unwrap().base(), below.page().base());
}

#[test]
fn fault_below_the_stack_floor_terminates() {
    let ram = ram();
    let mut storage = bitmap();
    let (mut frames, mut vmm) = paging(&ram, &mut storage);
    let dir = vmm.create_directory(&mut frames).unwrap();

    let top = VirtualAddress::new(USER_STACK_TOP);
    let mut proc = ProcessContext::new(9, dir);
    proc.stack = Some(StackRegion::new(top, top, MAX_STACK_SIZE));

    let addr = VirtualAddress::new(USER_STACK_TOP - MAX_STACK_SIZE - 1);
    let fault = FaultInfo::new(addr, user_write_not_present());
    match handle_page_fault(&mut vmm, &mut frames, Some(&mut proc), &fault) {
        FaultResolution::TerminateProcess(report) => {
            assert_eq!(report.pid, Some(9));
            assert_eq!(report.cause, FaultCause::Unhandled);
            assert_eq!(report.address, addr);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn anonymous_vma_is_zero_filled_on_first_touch() {
    let ram = ram();
    let mut storage = bitmap();
    let (mut frames, mut vmm) = paging(&ram, &mut storage);
    let dir = vmm.create_directory(&mut frames).unwrap();

    let start = VirtualAddress::new(0x1000_0000);
    let mut proc = ProcessContext::new(1, dir);
    proc.vmas
        .insert(Vma::anonymous(start, 3 * PAGE_SIZE, Protection::user_rw()).unwrap())
        .unwrap();

    let addr = start + PAGE_SIZE + 0x234;
    let fault = FaultInfo::new(addr, user_read_not_present());
    assert!(handle_page_fault(&mut vmm, &mut frames, Some(&mut proc), &fault).is_resume());

    assert!(vmm.query(dir, start).is_none());
    assert!(vmm.query(dir, start + 2 * PAGE_SIZE).is_none());
    let entry = vmm
        .get_entry(&mut frames, dir, addr, false)
        .unwrap()
        .unwrap();
    assert!(entry.flags().writable());
    assert!(entry.flags().user_access());

    let mut page = vec![0xFFu8; PAGE_SIZE as usize];
    vmm.read_bytes(dir, addr.page().base(), &mut page).unwrap();
    assert!(page.iter().all(|&b| b == 0));
}

#[test]
fn file_vma_reads_contents_at_the_page_offset() {
    let ram = ram();
    let mut storage = bitmap();
    let (mut frames, mut vmm) = paging(&ram, &mut storage);
    let dir = vmm.create_directory(&mut frames).unwrap();

    let file = Pattern { len: 0x1800 };
    let start = VirtualAddress::new(0x2000_0000);
    let mut proc = ProcessContext::new(2, dir);
    proc.vmas
        .insert(Vma::file_backed(start, 2 * PAGE_SIZE, Protection::user_ro(), &file, 0x800).unwrap())
        .unwrap();

    let fault = FaultInfo::new(start + 16, user_read_not_present());
    assert!(handle_page_fault(&mut vmm, &mut frames, Some(&mut proc), &fault).is_resume());
    let mut buf = [0u8; 4];
    vmm.read_bytes(dir, start, &mut buf).unwrap();
    let expect: Vec<u8> = (0x800u64..0x804).map(|o| u8::try_from(o % 251).unwrap()).collect();
    assert_eq!(&buf[..], &expect[..]);
    let entry = vmm.get_entry(&mut frames, dir, start, false).unwrap().unwrap();
    assert!(!entry.flags().writable());

    // second page starts at file offset 0x1800, which is end of file
    let fault = FaultInfo::new(start + PAGE_SIZE, user_read_not_present());
    assert!(handle_page_fault(&mut vmm, &mut frames, Some(&mut proc), &fault).is_resume());
    vmm.read_bytes(dir, start + PAGE_SIZE, &mut buf).unwrap();
    assert_eq!(buf, [0; 4]);
}

#[test]
fn failed_file_read_releases_the_frame() {
    let ram = ram();
    let mut storage = bitmap();
    let (mut frames, mut vmm) = paging(&ram, &mut storage);
    let dir = vmm.create_directory(&mut frames).unwrap();
    let start = VirtualAddress::new(0x2000_0000);
    vmm.get_entry(&mut frames, dir, start, true).unwrap();

    let file = Broken;
    let mut proc = ProcessContext::new(3, dir);
    proc.vmas
        .insert(Vma::file_backed(start, PAGE_SIZE, Protection::user_ro(), &file, 0).unwrap())
        .unwrap();

    let before = frame_map(&frames);
    let fault = FaultInfo::new(start, user_read_not_present());
    match handle_page_fault(&mut vmm, &mut frames, Some(&mut proc), &fault) {
        FaultResolution::TerminateProcess(report) => {
            assert_eq!(report.cause, FaultCause::FileRead(FileReadError::Io));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(frame_map(&frames), before);
    assert!(vmm.query(dir, start).is_none());
}

#[test]
fn lazy_mapping_without_frames_terminates() {
    let ram = ram();
    let mut storage = bitmap();
    let (mut frames, mut vmm) = paging(&ram, &mut storage);
    let dir = vmm.create_directory(&mut frames).unwrap();
    let start = VirtualAddress::new(0x1000_0000);
    let mut proc = ProcessContext::new(4, dir);
    proc.vmas
        .insert(Vma::anonymous(start, PAGE_SIZE, Protection::user_rw()).unwrap())
        .unwrap();
    while frames.allocate_frame().is_ok() {}

    let fault = FaultInfo::new(start, user_write_not_present());
    let res = handle_page_fault(&mut vmm, &mut frames, Some(&mut proc), &fault);
    assert!(matches!(
        res,
        FaultResolution::TerminateProcess(ref r) if r.cause == FaultCause::OutOfMemory
    ));

    proc.kernel = true;
    let res = handle_page_fault(&mut vmm, &mut frames, Some(&mut proc), &fault);
    assert!(matches!(res, FaultResolution::Halt(_)));
}

#[test]
fn supervisor_fault_on_absent_page_halts() {
    let ram = ram();
    let mut storage = bitmap();
    let (mut frames, mut vmm) = paging(&ram, &mut storage);
    let dir = vmm.create_directory(&mut frames).unwrap();
    let mut proc = ProcessContext::new(5, dir);
    let top = VirtualAddress::new(USER_STACK_TOP);
    proc.stack = Some(StackRegion::new(top, top, MAX_STACK_SIZE));

    let fault = FaultInfo::new(
        VirtualAddress::new(USER_STACK_TOP - 8),
        PageFaultError::new().with_write(true),
    );
    match handle_page_fault(&mut vmm, &mut frames, Some(&mut proc), &fault) {
        FaultResolution::Halt(report) => {
            assert_eq!(report.cause, FaultCause::KernelNotPresent);
            assert_eq!(report.pid, Some(5));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn without_a_process_every_unhandled_fault_halts() {
    let ram = ram();
    let mut storage = bitmap();
    let (mut frames, mut vmm) = paging(&ram, &mut storage);
    let fault = FaultInfo::new(
        VirtualAddress::new(0x0040_0000),
        PageFaultError::new().with_present(true).with_user(true),
    );
    match handle_page_fault(&mut vmm, &mut frames, None, &fault) {
        FaultResolution::Halt(report) => assert_eq!(report.pid, None),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn write_to_read_only_page_terminates() {
    let ram = ram();
    let mut storage = bitmap();
    let (mut frames, mut vmm) = paging(&ram, &mut storage);
    let dir = vmm.create_directory(&mut frames).unwrap();
    let start = VirtualAddress::new(0x1000_0000);
    let mut proc = ProcessContext::new(6, dir);
    proc.vmas
        .insert(Vma::anonymous(start, PAGE_SIZE, Protection::user_ro()).unwrap())
        .unwrap();

    let read = FaultInfo::new(start, user_read_not_present());
    assert!(handle_page_fault(&mut vmm, &mut frames, Some(&mut proc), &read).is_resume());

    let write = FaultInfo::new(start, user_write_not_present().with_present(true));
    let res = handle_page_fault(&mut vmm, &mut frames, Some(&mut proc), &write);
    assert!(matches!(res, FaultResolution::TerminateProcess(_)));
}

#[test]
fn report_carries_a_frame_pointer_backtrace() {
    let ram = ram();
    let mut storage = bitmap();
    let (mut frames, mut vmm) = paging(&ram, &mut storage);
    let dir = vmm.create_directory(&mut frames).unwrap();
    let stack = VirtualAddress::new(0x0800_0000);
    vmm.map_fresh(&mut frames, dir, stack.page(), PageEntryBits::user_rw())
        .unwrap();

    let fp0 = stack + 0x100;
    let fp1 = stack + 0x200;
    let mut frame0 = [0u8; 8];
    frame0[..4].copy_from_slice(&fp1.as_u32().to_le_bytes());
    frame0[4..].copy_from_slice(&0x0040_1000u32.to_le_bytes());
    let mut frame1 = [0u8; 8];
    frame1[4..].copy_from_slice(&0x0040_2000u32.to_le_bytes());
    vmm.write_bytes(dir, fp0, &frame0).unwrap();
    vmm.write_bytes(dir, fp1, &frame1).unwrap();

    let mut proc = ProcessContext::new(8, dir);
    let fault = FaultInfo::new(VirtualAddress::new(0x0000_0010), user_read_not_present())
        .with_frame_pointer(fp0);
    match handle_page_fault(&mut vmm, &mut frames, Some(&mut proc), &fault) {
        FaultResolution::TerminateProcess(report) => {
            assert_eq!(
                report.backtrace.as_slice(),
                &[VirtualAddress::new(0x0040_1000), VirtualAddress::new(0x0040_2000)]
            );
        }
        other => panic!("unexpected {other:?}"),
    }
}
