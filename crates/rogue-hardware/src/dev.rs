//! Driver over a `/dev` DMA node.

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind, Read, Write},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    time::Duration,
};

use memmap2::{MmapMut, MmapOptions};
use rogue_core::{Error, Result, stream::Region};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use super::driver::{DestMask, DmaDriver, RegionTable, RxDescriptor, TxDescriptor, pack_flags, unpack_flags};

/// Request codes of the driver's ioctl interface.
///
/// The values are defined by the kernel driver; the defaults match the
/// common AXI-stream DMA driver family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverOps {
    /// Query the number of buffers
    pub get_buff_count: u64,
    /// Query the buffer size
    pub get_buff_size: u64,
    /// Return a buffer index
    pub ret_index: u64,
    /// Acquire a transmit buffer index
    pub get_index: u64,
    /// Set the destination mask
    pub set_mask_bytes: u64,
    /// Write a register
    pub write_register: u64,
    /// Read a register
    pub read_register: u64,
}

impl Default for DriverOps {
    fn default() -> Self {
        Self {
            get_buff_count: 0x1001,
            get_buff_size: 0x1002,
            ret_index: 0x1005,
            get_index: 0x1006,
            set_mask_bytes: 0x1008,
            write_register: 0x100A,
            read_register: 0x100B,
        }
    }
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct ReadData {
    data: u64,
    dest: u32,
    flags: u32,
    index: u32,
    error: u32,
    size: u32,
    is32: u32,
    ret: i32,
    pad: u32,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct WriteData {
    data: u64,
    dest: u32,
    flags: u32,
    index: u32,
    size: u32,
    is32: u32,
    pad: u32,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RegisterData {
    address: u64,
    data: u32,
    pad: u32,
}

struct Mapped(MmapMut);

impl Region for Mapped {
    fn as_slice(&self) -> &[u8] {
        &self.0
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// DMA driver reached through a device node.
#[derive(Debug)]
pub struct DevDriver {
    path: PathBuf,
    file: File,
    ops: DriverOps,
    size: usize,
    regions: RegionTable,
}

impl DevDriver {
    /// Open `path` and map every driver buffer.
    pub fn open(path: impl AsRef<Path>, ops: DriverOps) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let count = ioctl_value(&file, ops.get_buff_count, 0)? as usize;
        let size = ioctl_value(&file, ops.get_buff_size, 0)? as usize;
        if size == 0 {
            return Err(Error::Size(0));
        }

        let mut regions: Vec<Box<dyn Region>> = Vec::with_capacity(count);
        for index in 0..count {
            // SAFETY: the driver exports each buffer as its own page-aligned
            // window of the device at `index * size`. The mapping is shared
            // with the device, which only writes it while the driver owns
            // the index, and that ownership is tracked by the region table.
            let map = unsafe {
                MmapOptions::new().offset((index * size) as u64).len(size).map_mut(&file)?
            };
            regions.push(Box::new(Mapped(map)));
        }
        info!(path = %path.display(), count, size, "dma device opened");
        Ok(Self { path, file, ops, size, regions: RegionTable::new(regions) })
    }

    /// Device path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait up to `timeout` for `events` on the device.
    fn wait(&self, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd { fd: self.file.as_raw_fd(), events, revents: 0 };
        let ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: `pfd` is one valid pollfd that lives across the call.
        let ret = unsafe { libc::poll(&raw mut pfd, 1, ms) };
        if ret < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(e);
        }
        Ok(ret > 0)
    }
}

/// Issue a value-argument ioctl.
fn ioctl_value(file: &File, request: u64, value: libc::c_ulong) -> io::Result<libc::c_int> {
    // SAFETY: the descriptor is open for the lifetime of `file` and the
    // argument is passed by value.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request as _, value) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

/// Issue a pointer-argument ioctl.
fn ioctl_ptr<T>(file: &File, request: u64, arg: *mut T) -> io::Result<libc::c_int> {
    // SAFETY: the descriptor is open for the lifetime of `file`; callers
    // pass a pointer to a live value of the layout the request expects.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

impl DmaDriver for DevDriver {
    fn buffer_count(&self) -> usize {
        self.regions.len()
    }

    fn buffer_size(&self) -> usize {
        self.size
    }

    fn take_region(&self, index: u32) -> Result<Box<dyn Region>> {
        self.regions.take(index)
    }

    fn put_region(&self, index: u32, region: Box<dyn Region>) {
        self.regions.put(index, region);
    }

    fn read(&self, timeout: Duration) -> Result<Option<RxDescriptor>> {
        if !self.wait(libc::POLLIN, timeout)? {
            return Ok(None);
        }
        let mut data = ReadData::new_zeroed();
        data.is32 = u32::from(cfg!(target_pointer_width = "32"));
        let read = (&self.file).read(data.as_mut_bytes());
        match read {
            Ok(0) => Ok(None),
            Ok(_) => {
                let (first_user, last_user, cont) = unpack_flags(data.flags);
                Ok(Some(RxDescriptor {
                    index: data.index,
                    size: data.size as usize,
                    dest: data.dest,
                    first_user,
                    last_user,
                    cont,
                    error: data.error,
                }))
            },
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn tx_index(&self, timeout: Duration) -> Result<Option<u32>> {
        if !self.wait(libc::POLLOUT, timeout)? {
            return Ok(None);
        }
        match ioctl_value(&self.file, self.ops.get_index, 0) {
            Ok(index) => Ok(Some(index as u32)),
            Err(e) => {
                debug!(error = %e, "no transmit buffer");
                Ok(None)
            },
        }
    }

    fn write(&self, desc: &TxDescriptor) -> Result<()> {
        let data = WriteData {
            data: 0,
            dest: desc.dest,
            flags: pack_flags(desc.first_user, desc.last_user, desc.cont),
            index: desc.index,
            size: desc.size as u32,
            is32: u32::from(cfg!(target_pointer_width = "32")),
            pad: 0,
        };
        (&self.file).write_all(data.as_bytes())?;
        Ok(())
    }

    fn ret_index(&self, index: u32) -> Result<()> {
        ioctl_value(&self.file, self.ops.ret_index, libc::c_ulong::from(index))?;
        Ok(())
    }

    fn set_mask(&self, mask: &DestMask) -> Result<()> {
        let mut bytes = mask.as_bytes().to_vec();
        ioctl_ptr(&self.file, self.ops.set_mask_bytes, bytes.as_mut_ptr())?;
        Ok(())
    }

    fn read_register(&self, address: u64) -> Result<u32> {
        let mut reg = RegisterData { address, data: 0, pad: 0 };
        ioctl_ptr(&self.file, self.ops.read_register, &raw mut reg)?;
        Ok(reg.data)
    }

    fn write_register(&self, address: u64, value: u32) -> Result<()> {
        let mut reg = RegisterData { address, data: value, pad: 0 };
        ioctl_ptr(&self.file, self.ops.write_register, &raw mut reg)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_layouts_match_driver() {
        assert_eq!(std::mem::size_of::<ReadData>(), 40);
        assert_eq!(std::mem::size_of::<WriteData>(), 32);
        assert_eq!(std::mem::size_of::<RegisterData>(), 16);
    }

    #[test]
    fn ops_round_trip_through_cbor() {
        let ops = DriverOps { get_index: 0x2006, ..DriverOps::default() };
        let mut bytes = Vec::new();
        ciborium::into_writer(&ops, &mut bytes).unwrap();
        let back: DriverOps = ciborium::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(back, ops);
    }

    #[test]
    fn missing_device_is_an_io_error() {
        let err = DevDriver::open("/dev/rogue-no-such-dma", DriverOps::default()).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
