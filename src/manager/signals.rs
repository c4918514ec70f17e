//! Bridge from process-wide signals to a channel.
//!
//! The handler only writes the signal number into a pipe; a watcher thread
//! forwards it to a crossbeam channel, where the orchestrator can `select!`
//! on it next to worker events and the timeout.

use std::{
    io, mem, ptr,
    sync::{
        atomic::{AtomicI32, Ordering},
        Mutex, PoisonError,
    },
    thread,
};

use crossbeam_channel::{unbounded, Receiver};
use log::{debug, error};

/// Operator interrupt, termination, and the batch scheduler's imminent
/// preemption warning.
pub const FARM_SIGNALS: [libc::c_int; 3] = [libc::SIGINT, libc::SIGTERM, libc::SIGUSR1];

static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);
static LISTENER: Mutex<Option<Receiver<i32>>> = Mutex::new(None);

extern "C" fn on_signal(signo: libc::c_int) {
    let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Installs the handlers for [`FARM_SIGNALS`] on first use and returns the
/// channel delivering them.
pub fn listen() -> io::Result<Receiver<i32>> {
    let mut listener = LISTENER.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(rx) = listener.as_ref() {
        return Ok(rx.clone());
    }

    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let [read_fd, write_fd] = fds;

    let (tx, rx) = unbounded();
    thread::Builder::new().name("signal-watch".to_string()).spawn(move || loop {
        let mut byte = 0u8;
        let n = unsafe { libc::read(read_fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        match n {
            1 => {
                debug!("Received signal {}.", byte);
                if tx.send(byte as i32).is_err() {
                    break;
                }
            }
            -1 if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted => continue,
            _ => {
                error!("Signal pipe closed.");
                break;
            }
        }
    })?;

    PIPE_WRITE_FD.store(write_fd, Ordering::SeqCst);
    let handler: extern "C" fn(libc::c_int) = on_signal;
    for signo in FARM_SIGNALS {
        let ret = unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = handler as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signo, &action, ptr::null_mut())
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    *listener = Some(rx.clone());
    Ok(rx)
}

pub fn name(signo: i32) -> &'static str {
    match signo {
        libc::SIGINT => "SIGINT",
        libc::SIGTERM => "SIGTERM",
        libc::SIGUSR1 => "SIGUSR1",
        _ => "signal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn delivers_raised_signal() {
        let rx = listen().unwrap();
        unsafe {
            libc::raise(libc::SIGUSR1);
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(libc::SIGUSR1));
        assert_eq!(name(libc::SIGUSR1), "SIGUSR1");

        // Still installed for the next one.
        unsafe {
            libc::raise(libc::SIGUSR1);
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(libc::SIGUSR1));
    }
}
