#![allow(unsafe_code)]

use crate::time::Duration;
use std::io;
use std::os::unix::io::RawFd;

/// Wait until any of the given file descriptors becomes readable, but no
/// longer than the given timeout. With no descriptors this is a plain
/// sleep.
pub fn wait(fds: &[RawFd], duration: Option<Duration>) -> io::Result<()> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let timeout_ms = match duration {
        Some(duration) => duration.total_millis() as libc::c_int,
        None => -1, // block until something is readable
    };

    let res = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout_ms,
        )
    };
    if res == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
