// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core types shared by serial port drivers and the UART hardware they drive.

#![warn(missing_docs)]

pub mod sim;
mod spec;

pub use spec::LineControlRegister;
pub use spec::LineStatusRegister;
pub use spec::ModemControlRegister;
pub use spec::ModemStatusRegister;

/// Register-level access to a UART.
///
/// Every method is a single register access. Callers are expected to
/// serialize access themselves (a driver holds its hardware lock across any
/// read-modify-write sequence); implementations must never block.
pub trait UartRegisters: Send {
    /// Reads the modem control register.
    fn read_modem_control(&mut self) -> ModemControlRegister;

    /// Writes the modem control register.
    fn write_modem_control(&mut self, value: ModemControlRegister);

    /// Reads the line control register.
    fn read_line_control(&mut self) -> LineControlRegister;

    /// Writes the line control register.
    fn write_line_control(&mut self, value: LineControlRegister);

    /// Reads the line status register. Error bits are cleared by the read.
    fn read_line_status(&mut self) -> LineStatusRegister;

    /// Reads the modem status register. Delta bits are cleared by the read.
    fn read_modem_status(&mut self) -> ModemStatusRegister;

    /// Writes one byte to the transmit holding register.
    fn write_transmit(&mut self, data: u8);

    /// Disables and re-enables all interrupt sources, which makes the UART
    /// raise any interrupt that is currently pending (most importantly
    /// transmit-holding-register-empty).
    fn kick_interrupts(&mut self);
}

impl<T: UartRegisters + ?Sized> UartRegisters for Box<T> {
    fn read_modem_control(&mut self) -> ModemControlRegister {
        (**self).read_modem_control()
    }

    fn write_modem_control(&mut self, value: ModemControlRegister) {
        (**self).write_modem_control(value)
    }

    fn read_line_control(&mut self) -> LineControlRegister {
        (**self).read_line_control()
    }

    fn write_line_control(&mut self, value: LineControlRegister) {
        (**self).write_line_control(value)
    }

    fn read_line_status(&mut self) -> LineStatusRegister {
        (**self).read_line_status()
    }

    fn read_modem_status(&mut self) -> ModemStatusRegister {
        (**self).read_modem_status()
    }

    fn write_transmit(&mut self, data: u8) {
        (**self).write_transmit(data)
    }

    fn kick_interrupts(&mut self) {
        (**self).kick_interrupts()
    }
}
