//! Accelerator behind a Linux character device.
//!
//! Control requests map onto ioctls with magic `'S'`; completion messages are
//! read as 8-byte records; readiness comes from poll(2). The node is opened
//! non-blocking and registered with the tokio reactor so waits never block a
//! runtime thread.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::mem::size_of;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;

use crate::accel::{
    AccelError, Device, Port, RegisterLayout, Reply, Request, RequestCode, DEBUG_REGISTER_COUNT,
};
use crate::tracing::prelude::*;

const IOC_MAGIC: u64 = b'S' as u64;

const IOC_NONE: u64 = 0;
const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, nr: u64, size: usize) -> u64 {
    (dir << 30) | ((size as u64) << 16) | (IOC_MAGIC << 8) | nr
}

const PTR: usize = size_of::<*mut u8>();

/// ioctl request number for a control request.
pub const fn request_number(code: RequestCode) -> u64 {
    let nr = code as u64;
    match code {
        RequestCode::Reset | RequestCode::Start | RequestCode::Step => ioc(IOC_NONE, nr, 0),
        RequestCode::SetStateIn | RequestCode::SetPrefix | RequestCode::SetDifficultyMask => {
            ioc(IOC_WRITE, nr, PTR)
        }
        RequestCode::SetNumLeadingZeros => ioc(IOC_WRITE, nr, size_of::<u8>()),
        RequestCode::SetClockSpeed => ioc(IOC_WRITE, nr, size_of::<u32>()),
        RequestCode::GetNonceCurrent | RequestCode::GetStatus => ioc(IOC_READ, nr, PTR),
        RequestCode::GetDebugRegisters => ioc(IOC_READ | IOC_WRITE, nr, PTR),
    }
}

/// Accelerator reached through a device node.
#[derive(Debug, Clone)]
pub struct CharDevice {
    path: PathBuf,
    name: String,
    layout: RegisterLayout,
}

impl CharDevice {
    pub fn new(path: impl Into<PathBuf>, layout: RegisterLayout) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self { path, name, layout }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Device for CharDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn layout(&self) -> RegisterLayout {
        self.layout
    }

    fn open(&self) -> Result<Box<dyn Port>, AccelError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|e| match e.raw_os_error() {
                Some(libc::EBUSY) => AccelError::Busy,
                _ => AccelError::Io(e),
            })?;

        Ok(Box::new(CharDevicePort {
            fd: AsyncFd::new(file)?,
        }))
    }
}

struct CharDevicePort {
    fd: AsyncFd<File>,
}

impl CharDevicePort {
    fn raw_fd(&self) -> libc::c_int {
        self.fd.get_ref().as_raw_fd()
    }

    fn ioctl_ptr<T>(&self, code: RequestCode, arg: *mut T) -> io::Result<()> {
        // SAFETY: the fd is open for the lifetime of self and `arg` points at a
        // buffer of the size the driver copies for this request.
        let rc = unsafe { libc::ioctl(self.raw_fd(), request_number(code) as _, arg) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ioctl_value(&self, code: RequestCode, value: libc::c_ulong) -> io::Result<()> {
        // SAFETY: value-carrying requests do not dereference their argument.
        let rc = unsafe { libc::ioctl(self.raw_fd(), request_number(code) as _, value) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn read_word(&self, code: RequestCode) -> io::Result<u32> {
        let mut word: u32 = 0;
        self.ioctl_ptr(code, &mut word as *mut u32)?;
        Ok(word)
    }

    fn read_nonblocking(&self, buf: &mut [u8]) -> Result<usize, AccelError> {
        let mut file: &File = self.fd.get_ref();
        match file.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(AccelError::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(AccelError::Interrupted),
            Err(e) => Err(AccelError::Io(e)),
        }
    }
}

#[async_trait]
impl Port for CharDevicePort {
    fn request(&self, request: Request) -> Result<Reply, AccelError> {
        let code = request.code();
        match request {
            Request::Reset | Request::Start | Request::Step => {
                self.ioctl_value(code, 0)?;
            }
            Request::SetStateIn(mut bytes) | Request::SetDifficultyMask(mut bytes) => {
                self.ioctl_ptr(code, bytes.as_mut_ptr())?;
            }
            Request::SetPrefix(mut bytes) => {
                self.ioctl_ptr(code, bytes.as_mut_ptr())?;
            }
            Request::SetNumLeadingZeros(count) => {
                self.ioctl_value(code, count as libc::c_ulong)?;
            }
            Request::SetClockSpeed(mhz) => {
                self.ioctl_value(code, mhz as libc::c_ulong)?;
            }
            Request::GetStatus | Request::GetNonceCurrent => {
                return Ok(Reply::Word(self.read_word(code)?));
            }
            Request::GetDebugRegisters => {
                let mut words = vec![0u32; DEBUG_REGISTER_COUNT];
                self.ioctl_ptr(code, words.as_mut_ptr())?;
                return Ok(Reply::Registers(words));
            }
        }
        Ok(Reply::Done)
    }

    fn try_read(&self, buf: &mut [u8]) -> Result<usize, AccelError> {
        self.read_nonblocking(buf)
    }

    async fn read(&self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize, AccelError> {
        loop {
            let mut guard = tokio::select! {
                guard = self.fd.readable() => guard?,
                _ = cancel.cancelled() => return Err(AccelError::Interrupted),
            };

            match self.read_nonblocking(buf) {
                Err(AccelError::WouldBlock) => guard.clear_ready(),
                other => return other,
            }
        }
    }

    fn poll_readable(&self) -> Result<bool, AccelError> {
        let mut pfd = libc::pollfd {
            fd: self.raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd, zero timeout.
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        if rc < 0 {
            return Err(AccelError::Io(io::Error::last_os_error()));
        }
        Ok(pfd.revents & libc::POLLIN != 0)
    }

    async fn readable(&self) -> Result<(), AccelError> {
        loop {
            let mut guard = self.fd.readable().await?;
            if self.poll_readable()? {
                return Ok(());
            }
            // Readiness was stale; wait for the next edge
            trace!("Spurious readiness on accelerator node");
            guard.clear_ready();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_numbers_match_linux_encoding() {
        // _IO('S', 0)
        assert_eq!(request_number(RequestCode::Reset), 0x5300);
        // _IO('S', 11)
        assert_eq!(request_number(RequestCode::Step), 0x530b);
        // _IOW('S', 4, u8)
        assert_eq!(request_number(RequestCode::SetNumLeadingZeros), 0x4001_5304);
        // _IOW('S', 10, u32)
        assert_eq!(request_number(RequestCode::SetClockSpeed), 0x4004_530a);

        let ptr = size_of::<*mut u8>() as u64;
        // _IOR('S', 7, ptr)
        assert_eq!(
            request_number(RequestCode::GetStatus),
            (2 << 30) | (ptr << 16) | 0x5307
        );
        // _IOWR('S', 8, ptr)
        assert_eq!(
            request_number(RequestCode::GetDebugRegisters),
            (3 << 30) | (ptr << 16) | 0x5308
        );
    }

    #[tokio::test]
    async fn test_open_missing_node_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let device = CharDevice::new(dir.path().join("sha256"), RegisterLayout::Mask);
        assert!(matches!(device.open(), Err(AccelError::Io(_))));
    }
}
