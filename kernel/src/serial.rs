//! Serial port output, used for `serial_print!`/`serial_println!` in the
//! test harness and for early boot diagnostics before the framebuffer
//! console is available.

use core::fmt;

use spin::Mutex;
use uart_16550::SerialPort as Uart16550;

pub struct SerialPort {
    inner: Uart16550,
}

impl SerialPort {
    /// # Safety
    /// `base` must be a valid, otherwise-unused serial port I/O base.
    pub unsafe fn new(base: u16) -> Self {
        // SAFETY: delegated to caller.
        let mut inner = unsafe { Uart16550::new(base) };
        inner.init();
        SerialPort { inner }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.inner.write_str(s)
    }
}

/// COM1.
pub static COM1: Mutex<Option<SerialPort>> = Mutex::new(None);

/// # Safety
/// Must run once, early in boot.
pub unsafe fn init() {
    // SAFETY: 0x3F8 is the standard COM1 I/O base on PC-compatible
    // hardware, including QEMU's default serial device.
    let port = unsafe { SerialPort::new(0x3F8) };
    *COM1.lock() = Some(port);
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_serial_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*))
    };
}

#[doc(hidden)]
pub fn _serial_print(args: fmt::Arguments) {
    use core::fmt::Write;
    let mut guard = COM1.lock();
    if let Some(port) = guard.as_mut() {
        let _ = port.write_fmt(args);
    }
}
