//! Binary entry shim.
//!
//! The real entry point is the `_start` assembly in
//! `corvid_kernel::arch::x86::multiboot`, pulled in by linking against
//! the library crate; it calls `multiboot_main`, which parses the
//! bootloader's info structure and calls [`corvid_kernel::kernel_main`].
//! This crate exists only to provide the panic handler a `#![no_main]`
//! binary still needs.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

extern crate corvid_kernel;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    corvid_kernel::serial_println!("[KERNEL PANIC] {}", info);
    corvid_kernel::println!("[KERNEL PANIC] {}", info);
    corvid_kernel::arch::x86::halt();
}
