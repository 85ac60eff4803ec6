//! Readiness polling over raw descriptors
//!
//! Thin wrapper around `libc::poll`. Absence of readiness is a normal
//! "try again later" outcome, reported as `None` rather than an error.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Which readiness events to ask for
#[derive(Debug, Clone, Copy, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };

    pub const READ_WRITE: Interest = Interest {
        read: true,
        write: true,
    };

    fn events(self) -> libc::c_short {
        let mut events = 0;
        if self.read {
            events |= libc::POLLIN;
        }
        if self.write {
            events |= libc::POLLOUT;
        }
        events
    }
}

/// Readiness reported for one descriptor
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// POLLERR: descriptor error condition
    pub error: bool,
    /// POLLHUP: peer hung up
    pub hangup: bool,
    /// POLLNVAL: descriptor is not open
    pub invalid: bool,
}

impl Readiness {
    fn from_revents(revents: libc::c_short) -> Self {
        Readiness {
            readable: revents & libc::POLLIN != 0,
            writable: revents & libc::POLLOUT != 0,
            error: revents & libc::POLLERR != 0,
            hangup: revents & libc::POLLHUP != 0,
            invalid: revents & libc::POLLNVAL != 0,
        }
    }

    pub fn is_broken(&self) -> bool {
        self.error || self.hangup || self.invalid
    }
}

fn timeout_ms(timeout: Duration) -> libc::c_int {
    timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
}

/// Poll a single descriptor; `None` means the timeout elapsed quietly
pub fn wait(fd: RawFd, interest: Interest, timeout: Duration) -> io::Result<Option<Readiness>> {
    let mut pollfd = libc::pollfd {
        fd,
        events: interest.events(),
        revents: 0,
    };
    loop {
        // Safety: pollfd is a valid array of length one for the duration of
        // the call
        let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms(timeout)) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if result == 0 {
            return Ok(None);
        }
        return Ok(Some(Readiness::from_revents(pollfd.revents)));
    }
}

/// Poll many descriptors with one syscall; the result is index-aligned with
/// the input. `None` means the timeout elapsed with no descriptor ready.
pub fn wait_many(
    fds: &[(RawFd, Interest)],
    timeout: Duration,
) -> io::Result<Option<Vec<Readiness>>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|(fd, interest)| libc::pollfd {
            fd: *fd,
            events: interest.events(),
            revents: 0,
        })
        .collect();
    loop {
        // Safety: the vector is a valid pollfd array for the duration of the
        // call
        let result = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if result == 0 {
            return Ok(None);
        }
        return Ok(Some(
            pollfds
                .iter()
                .map(|p| Readiness::from_revents(p.revents))
                .collect(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    #[test]
    fn test_unconnected_socket_times_out_for_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let result = wait(stream.as_raw_fd(), Interest::READ, Duration::from_millis(10)).unwrap();
        assert!(result.is_none(), "no data should be pending");
    }

    #[test]
    fn test_readable_after_peer_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        peer.write_all(b"ping").unwrap();
        peer.flush().unwrap();

        let ready = wait(stream.as_raw_fd(), Interest::READ, Duration::from_secs(1))
            .unwrap()
            .expect("peer data should wake the poll");
        assert!(ready.readable);
        assert!(!ready.is_broken());
    }

    #[test]
    fn test_wait_many_alignment() {
        let quiet_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let quiet = TcpStream::connect(quiet_listener.local_addr().unwrap()).unwrap();
        let busy = TcpStream::connect(busy_listener.local_addr().unwrap()).unwrap();
        let (_quiet_peer, _) = quiet_listener.accept().unwrap();
        let (mut busy_peer, _) = busy_listener.accept().unwrap();
        busy_peer.write_all(b"data").unwrap();

        let fds = [
            (quiet.as_raw_fd(), Interest::READ),
            (busy.as_raw_fd(), Interest::READ),
        ];
        let ready = wait_many(&fds, Duration::from_secs(1))
            .unwrap()
            .expect("one socket is readable");
        assert!(!ready[0].readable);
        assert!(ready[1].readable);
    }
}
