//! Global Descriptor Table and Task State Segment.
//!
//! Unlike the 64-bit `x86_64` crate's typed `GlobalDescriptorTable` builder,
//! the 32-bit `x86` crate only exposes raw segment descriptor bits, so this
//! table is hand-encoded the way a flat-model i386 kernel always is: one
//! null entry, flat code/data for ring 0, a TSS entry, and flat code/data
//! for ring 3.
//!
//! Layout (selector values, RPL already folded in where relevant):
//! - `0x00`: null descriptor
//! - `0x08`: kernel code (ring 0, flat 4 GiB)
//! - `0x10`: kernel data (ring 0, flat 4 GiB)
//! - `0x18`: TSS
//! - `0x20`: user data (ring 3, flat 4 GiB) -- selector `0x23` with RPL
//! - `0x28`: user code (ring 3, flat 4 GiB) -- selector `0x2B` with RPL

use core::mem::size_of;
use lazy_static::lazy_static;
use spin::Mutex;

pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
pub const TSS_SEL: u16 = 0x18;
pub const USER_DS: u16 = 0x20 | 3;
pub const USER_CS: u16 = 0x28 | 3;

const GDT_ENTRIES: usize = 6;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    const fn null() -> Self {
        GdtEntry {
            limit_low: 0,
            base_low: 0,
            base_mid: 0,
            access: 0,
            granularity: 0,
            base_high: 0,
        }
    }

    const fn flat(access: u8, gran: u8) -> Self {
        GdtEntry {
            limit_low: 0xFFFF,
            base_low: 0,
            base_mid: 0,
            access,
            granularity: 0xC0 | gran,
            base_high: 0,
        }
    }

    fn for_tss(base: u32, limit: u32) -> Self {
        GdtEntry {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_mid: ((base >> 16) & 0xFF) as u8,
            access: 0x89, // present, ring 0, 32-bit TSS (available)
            granularity: (((limit >> 16) & 0x0F) as u8) | 0x00,
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }
}

#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u32,
}

/// 32-bit Task State Segment, used only for `esp0`/`ss0` on privilege
/// transitions -- this kernel does not hardware task-switch.
#[repr(C, packed)]
pub struct Tss {
    pub link: u16,
    _r0: u16,
    pub esp0: u32,
    pub ss0: u16,
    _r1: u16,
    pub esp1: u32,
    pub ss1: u16,
    _r2: u16,
    pub esp2: u32,
    pub ss2: u16,
    _r3: u16,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u16,
    _r4: u16,
    pub cs: u16,
    _r5: u16,
    pub ss: u16,
    _r6: u16,
    pub ds: u16,
    _r7: u16,
    pub fs: u16,
    _r8: u16,
    pub gs: u16,
    _r9: u16,
    pub ldt: u16,
    _r10: u16,
    _trap: u16,
    pub iomap_base: u16,
}

impl Tss {
    const fn new() -> Self {
        // SAFETY: all-zero is a valid bit pattern for every field here.
        unsafe { core::mem::zeroed() }
    }
}

lazy_static! {
    static ref TSS: Mutex<Tss> = Mutex::new(Tss::new());
}

static mut GDT: [GdtEntry; GDT_ENTRIES] = [GdtEntry::null(); GDT_ENTRIES];

/// Install the GDT, load it, reload segment registers and `ltr`.
///
/// # Safety
///
/// Must run once, early in boot, before any interrupt or privilege
/// transition, with interrupts disabled.
pub unsafe fn init() {
    let tss_addr = {
        let tss = TSS.lock();
        &*tss as *const Tss as u32
    };

    // SAFETY: GDT is only written here, before `lgdt`, and the kernel is
    // single-threaded at this point in boot.
    unsafe {
        GDT[0] = GdtEntry::null();
        GDT[1] = GdtEntry::flat(0x9A, 0x0F); // kernel code: present, ring0, code, R/X
        GDT[2] = GdtEntry::flat(0x92, 0x0F); // kernel data: present, ring0, data, R/W
        GDT[3] = GdtEntry::for_tss(tss_addr, size_of::<Tss>() as u32 - 1);
        GDT[4] = GdtEntry::flat(0xF2, 0x0F); // user data: present, ring3, data, R/W
        GDT[5] = GdtEntry::flat(0xFA, 0x0F); // user code: present, ring3, code, R/X

        let ptr = GdtPointer {
            limit: (size_of::<[GdtEntry; GDT_ENTRIES]>() - 1) as u16,
            base: GDT.as_ptr() as u32,
        };

        core::arch::asm!(
            "lgdt [{0}]",
            "mov ax, {1:x}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            "ljmp {2}, 2f",
            "2:",
            in(reg) &ptr,
            in(reg) KERNEL_DS,
            const KERNEL_CS,
        );

        core::arch::asm!("ltr ax", in("ax") TSS_SEL);
    }
}

/// Update the ring-0 stack pointer used on the next ring3->ring0 transition
/// (interrupt, trap gate, or scheduler context switch into a new task).
/// Called with interrupts disabled.
pub fn set_kernel_stack(esp0: u32) {
    let mut tss = TSS.lock();
    tss.esp0 = esp0;
    tss.ss0 = KERNEL_DS;
}

pub fn get_kernel_stack() -> u32 {
    TSS.lock().esp0
}
