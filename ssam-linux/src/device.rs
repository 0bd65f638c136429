//! Aggregator debug device: the `ioctl(2)` transport.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use ssam_core::{RawRequest, Transport, IOCTL_REQUEST};

/// Open handle to the debug device. Closed on drop.
pub struct Device {
    file: File,
}

impl Device {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        log::debug!("opened {}", path.display());
        Ok(Self { file })
    }
}

impl Transport for Device {
    fn submit(&mut self, raw: &mut RawRequest<'_>) -> io::Result<()> {
        let fd = self.file.as_raw_fd();
        let buf = raw.as_mut_bytes();

        // The buffer and the memory its descriptors point at are borrowed by `raw`
        // for the duration of the call.
        let result = unsafe { libc::ioctl(fd, IOCTL_REQUEST as _, buf.as_mut_ptr()) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
