//! Serialized input channel to a wrapped process
//!
//! Every write, interrupt and interrupt-then-write goes through one mutex, so
//! concurrent callers never interleave their bytes and an interrupt is always
//! delivered before the write that follows it in the same request.

use crate::error::{ParleyError, Result};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Something that can receive an interrupt signal
pub trait SignalTarget: Send + Sync {
    fn interrupt(&self) -> Result<()>;
}

/// SIGINT to a whole process group
pub struct ProcessGroup {
    pub pgid: i32,
}

impl SignalTarget for ProcessGroup {
    fn interrupt(&self) -> Result<()> {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        killpg(Pid::from_raw(self.pgid), Signal::SIGINT).map_err(ParleyError::from)
    }
}

/// How `interrupt()` reaches the wrapped program
pub enum InterruptMethod {
    Signal(Box<dyn SignalTarget>),
    /// Bytes written to the terminal instead of a signal
    Keys(Vec<u8>),
}

/// The single write path into a session
pub struct InputChannel {
    writer: Mutex<Box<dyn Write + Send>>,
    interrupt: InterruptMethod,
    submit_delay: Duration,
    alive: Arc<AtomicBool>,
}

impl InputChannel {
    pub fn new(
        writer: Box<dyn Write + Send>,
        interrupt: InterruptMethod,
        submit_delay: Duration,
        alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            writer: Mutex::new(writer),
            interrupt,
            submit_delay,
            alive,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Write `data` followed by `submit`
    pub fn write(&self, data: &[u8], submit: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        self.ensure_alive()?;
        self.write_locked(&mut writer, data, submit)
    }

    /// Interrupt the wrapped program
    pub fn interrupt(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        self.ensure_alive()?;
        self.interrupt_locked(&mut writer)
    }

    /// Interrupt, then write, with no other writer able to slip in between
    ///
    /// If the interrupt cannot be delivered the write is not attempted.
    pub fn interrupt_then_write(&self, data: &[u8], submit: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        self.ensure_alive()?;
        self.interrupt_locked(&mut writer)?;
        self.write_locked(&mut writer, data, submit)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(ParleyError::ProcessExited)
        }
    }

    fn interrupt_locked(&self, writer: &mut Box<dyn Write + Send>) -> Result<()> {
        match &self.interrupt {
            InterruptMethod::Signal(target) => target.interrupt(),
            InterruptMethod::Keys(keys) => write_flush(writer, keys),
        }
    }

    fn write_locked(
        &self,
        writer: &mut Box<dyn Write + Send>,
        data: &[u8],
        submit: &[u8],
    ) -> Result<()> {
        write_flush(writer, data)?;
        if submit.is_empty() {
            return Ok(());
        }
        if !self.submit_delay.is_zero() {
            // TUIs that debounce pasted text need a beat before Enter
            std::thread::sleep(self.submit_delay);
        }
        write_flush(writer, submit)
    }
}

fn write_flush(writer: &mut Box<dyn Write + Send>, bytes: &[u8]) -> Result<()> {
    writer
        .write_all(bytes)
        .map_err(|e| ParleyError::pty(format!("Write error: {}", e)))?;
    writer
        .flush()
        .map_err(|e| ParleyError::pty(format!("Flush error: {}", e)))
}
