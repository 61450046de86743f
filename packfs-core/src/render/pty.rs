//! Pseudo-terminal channel for driving the renderer.
//!
//! `nomad-pack` only emits bold filename headings when its stdout is a
//! terminal. Each render therefore gets a fresh pty pair: the child writes to
//! the slave side and we read the transcript from the master side.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tracing::debug;

/// Terminal geometry reported to the child.
///
/// Line wrapping in the renderer depends on it, so it is fixed per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// An open pty pair. Both ends close when dropped.
#[derive(Debug)]
pub struct TerminalChannel {
    master: OwnedFd,
    slave: OwnedFd,
}

impl TerminalChannel {
    /// Allocate a pty with the given geometry.
    ///
    /// Both ends are opened close-on-exec in the same call that creates
    /// them, so a render spawned concurrently on another thread never
    /// inherits this channel's slave. Output post-processing is switched off
    /// on the slave so `\n` is not rewritten to `\r\n` in the transcript.
    pub fn open(size: TerminalSize) -> io::Result<Self> {
        let flags = libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC;

        let raw = unsafe { libc::posix_openpt(flags) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: posix_openpt returned a fresh descriptor nothing else owns.
        let master = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::grantpt(master.as_raw_fd()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::unlockpt(master.as_raw_fd()) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut name = [0 as libc::c_char; 128];
        let rc = unsafe { libc::ptsname_r(master.as_raw_fd(), name.as_mut_ptr(), name.len()) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }

        let raw = unsafe { libc::open(name.as_ptr(), flags) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: open returned a fresh descriptor nothing else owns.
        let slave = unsafe { OwnedFd::from_raw_fd(raw) };

        let winsize = libc::winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe {
            libc::ioctl(
                master.as_raw_fd(),
                libc::TIOCSWINSZ,
                &winsize as *const libc::winsize,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        disable_output_processing(&slave)?;

        Ok(Self { master, slave })
    }

    /// Geometry currently set on the terminal.
    pub fn size(&self) -> io::Result<TerminalSize> {
        let mut winsize = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe {
            libc::ioctl(
                self.master.as_raw_fd(),
                libc::TIOCGWINSZ,
                &mut winsize as *mut libc::winsize,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(TerminalSize {
            rows: winsize.ws_row,
            cols: winsize.ws_col,
        })
    }

    /// Split into (master, slave).
    pub fn into_parts(self) -> (OwnedFd, OwnedFd) {
        (self.master, self.slave)
    }
}

fn disable_output_processing(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let mut termios = std::mem::MaybeUninit::<libc::termios>::uninit();
    if unsafe { libc::tcgetattr(raw, termios.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: tcgetattr filled the struct.
    let mut termios = unsafe { termios.assume_init() };
    termios.c_oflag &= !libc::ONLCR;
    if unsafe { libc::tcsetattr(raw, libc::TCSANOW, &termios) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read the master side until every slave holder has gone away.
///
/// Linux reports a closed slave as `EIO` rather than a zero-length read;
/// both end the transcript. Invalid UTF-8 is replaced, not rejected.
pub fn read_transcript(master: OwnedFd) -> String {
    let mut file = File::from(master);
    let mut transcript = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => transcript.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if e.raw_os_error() != Some(libc::EIO) {
                    debug!(error = %e, "terminal read ended with error");
                }
                break;
            }
        }
    }

    String::from_utf8_lossy(&transcript).into_owned()
}
