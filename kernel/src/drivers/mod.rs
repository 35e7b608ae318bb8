//! Device drivers module
//!
//! Contains all device drivers including bus drivers, network drivers, and
//! device-specific drivers.

pub mod console;
pub mod input;
pub mod input_event;
pub mod keyboard;
pub mod mouse;
pub mod terminal;

pub use console::{ConsoleDevice, ConsoleDriver, SerialConsole, VgaConsole};

/// Initialize all drivers
pub fn init() {
    crate::println!("[DRIVERS] Initializing device drivers...");

    // Initialize terminal state (before console, so read paths can query it)
    terminal::init();
    console::init();
    mouse::init();

    crate::println!("[DRIVERS] Device drivers initialized");
}
