//! The host side of blocking syscalls. Everything here runs with the big lock released.

use std::{
    io::{self, Write},
    time::Duration,
};

use parking_lot::Mutex;

use super::errno;
use crate::scheduler::mailbox::Mailbox;

/// Performs the blocking part of guest syscalls on the caller's native thread.
pub trait Kernel: Send + Sync {
    fn write(&self, fd: u64, bytes: &[u8]) -> io::Result<usize>;

    /// Sleeps for `duration`; returns `true` if interrupted by a post to `mailbox`.
    fn sleep(&self, duration: Duration, mailbox: &Mailbox) -> bool {
        mailbox.sleep(duration)
    }
}

/// A syscall that must run with the big lock released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockingCall {
    Write { fd: u64, bytes: Vec<u8> },
    Sleep(Duration),
}

impl BlockingCall {
    /// Runs the call and returns the guest-visible result.
    pub fn perform(&self, kernel: &dyn Kernel, mailbox: &Mailbox) -> u64 {
        match self {
            BlockingCall::Write { fd, bytes } => match kernel.write(*fd, bytes) {
                Ok(n) => n as u64,
                Err(_) => errno::neg(errno::EIO),
            },
            BlockingCall::Sleep(duration) => {
                if kernel.sleep(*duration, mailbox) {
                    errno::neg(errno::EINTR)
                } else {
                    0
                }
            }
        }
    }
}

/// The kernel of the host process: guest `write`s go to stdout and stderr,
/// or to an in-memory buffer when captured.
#[derive(Debug, Default)]
pub struct HostKernel {
    captured: Option<Mutex<Vec<u8>>>,
}

impl HostKernel {
    pub fn stdio() -> Self {
        Self { captured: None }
    }

    /// Collects output of both streams instead of printing it.
    pub fn captured() -> Self {
        Self {
            captured: Some(Mutex::new(Vec::new())),
        }
    }

    /// The captured output so far.
    pub fn output(&self) -> Vec<u8> {
        self.captured
            .as_ref()
            .map(|buf| buf.lock().clone())
            .unwrap_or_default()
    }
}

impl Kernel for HostKernel {
    fn write(&self, fd: u64, bytes: &[u8]) -> io::Result<usize> {
        if let Some(buf) = &self.captured {
            buf.lock().extend_from_slice(bytes);
            return Ok(bytes.len());
        }
        match fd {
            1 => io::stdout().lock().write_all(bytes)?,
            2 => io::stderr().lock().write_all(bytes)?,
            _ => return Err(io::Error::from(io::ErrorKind::InvalidInput)),
        }
        Ok(bytes.len())
    }
}
