//! Guest-memory region installer: the SET_MEM_TABLE handler's transport
//! half. Maps each region the peer hands over, builds a coalesced guest-page
//! index for async-copy address translation, and optionally arms userfault
//! registration for postcopy live migration.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use libc::{c_void, off_t};

use crate::codec::{self, Message};

/// Above this many guest-page entries the index is kept sorted by
/// `host_phys_addr` so lookups can binary-search it; below it a linear scan
/// is cheap enough that sorting isn't worth the insert cost. Inherited from
/// the out-of-scope collaborator that actually performs lookups.
pub const BINARY_SEARCH_THRESH: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("region {0}: mmap_offset + size overflows")]
    SizeOverflow(usize),
    #[error("region {0}: fstat on backing fd failed: {1}")]
    Fstat(usize, #[source] std::io::Error),
    #[error("region {0}: block size not available")]
    NoBlockSize(usize),
    #[error("region {0}: rounded mmap_size is zero (overflow)")]
    RoundedSizeZero(usize),
    #[error("region {0}: mmap failed: {1}")]
    Mmap(usize, #[source] std::io::Error),
    #[error("region {0} is missing its backing fd")]
    MissingFd(usize),
    #[error("codec error during postcopy handshake: {0}")]
    Codec(#[from] codec::Error),
    #[error("postcopy ack had wrong request code")]
    BadPostcopyAck,
    #[error("postcopy ack carried fds, expected none")]
    PostcopyAckHadFds,
    #[error("userfaultfd registration failed for region {0}: {1}")]
    UffdRegister(usize, #[source] std::io::Error),
}

/// One guest shared-memory region, as described by a SET_MEM_TABLE entry.
pub struct MemRegion {
    pub guest_phys_addr: u64,
    pub guest_user_addr: u64,
    pub size: u64,
    pub fd: Option<OwnedFd>,
    pub mmap_addr: usize,
    pub mmap_size: usize,
    pub host_user_addr: u64,
    /// Replaces the original's `host_user_addr != 0` sentinel (see
    /// DESIGN.md): a mapping that legitimately lands at address 0 would
    /// otherwise be treated as unmapped and leaked.
    pub mapped: bool,
}

/// One descriptor as carried in a SET_MEM_TABLE payload, before installation.
pub struct RegionDescriptor {
    pub guest_phys_addr: u64,
    pub userspace_addr: u64,
    pub size: u64,
    pub mmap_offset: u64,
}

/// A single coalesced guest-physical-to-host-physical translation entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestPageEntry {
    pub guest_phys_addr: u64,
    pub host_phys_addr: u64,
    pub size: u64,
}

#[derive(Default)]
pub struct GuestMemory {
    pub regions: Vec<MemRegion>,
    pub guest_pages: Vec<GuestPageEntry>,
}

impl GuestMemory {
    /// Inserts a page-aligned slice into the index, coalescing with the
    /// previous entry when the host-physical ranges are contiguous.
    fn insert_page(&mut self, entry: GuestPageEntry) {
        if let Some(last) = self.guest_pages.last_mut() {
            if last.host_phys_addr + last.size == entry.host_phys_addr {
                last.size += entry.size;
                return;
            }
        }
        self.guest_pages.push(entry);
        if self.guest_pages.len() >= BINARY_SEARCH_THRESH {
            self.guest_pages
                .sort_by_key(|e| e.host_phys_addr);
        }
    }
}

fn fd_block_size(fd: RawFd) -> Result<u64, std::io::Error> {
    let st = nix::sys::stat::fstat(fd).map_err(std::io::Error::from)?;
    Ok(st.st_blksize as u64)
}

fn round_up(value: u64, align: u64) -> Option<u64> {
    if align == 0 {
        return Some(value);
    }
    let rem = value % align;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(align - rem)
    }
}

/// A platform primitive translating a mapped host virtual address to the
/// host-physical (IOVA) address used for async-copy translation. Real
/// implementations consult `/proc/self/pagemap` or an IOMMU map; actual
/// address translation is out of scope here, so callers supply their own.
pub trait HostIovaTranslator {
    fn translate(&self, host_virt_addr: u64, len: u64) -> u64;
}

/// Identity translator: treats host virtual address as host physical. Useful
/// for tests and for platforms without a real IOMMU translation step.
pub struct IdentityTranslator;

impl HostIovaTranslator for IdentityTranslator {
    fn translate(&self, host_virt_addr: u64, _len: u64) -> u64 {
        host_virt_addr
    }
}

pub struct InstallOptions<'a> {
    pub async_copy: bool,
    pub page_size: u64,
    pub translator: &'a dyn HostIovaTranslator,
}

/// Installs every region described by `descriptors`, consuming `fds` in
/// order (region `i`'s backing fd is `fds[i]`). Populates `mem` in place.
pub fn map_mem_regions(
    mem: &mut GuestMemory,
    descriptors: &[RegionDescriptor],
    fds: &mut Vec<Option<OwnedFd>>,
    opts: &InstallOptions,
) -> Result<(), Error> {
    for (i, desc) in descriptors.iter().enumerate() {
        let fd = fds
            .get_mut(i)
            .and_then(|slot| slot.take())
            .ok_or(Error::MissingFd(i))?;

        let mmap_offset = desc.mmap_offset;
        let raw_size = mmap_offset
            .checked_add(desc.size)
            .ok_or(Error::SizeOverflow(i))?;

        let blksize = fd_block_size(fd.as_raw_fd()).map_err(|e| Error::Fstat(i, e))?;
        if blksize == 0 {
            return Err(Error::NoBlockSize(i));
        }
        let mmap_size = round_up(raw_size, blksize).ok_or(Error::RoundedSizeZero(i))?;
        if mmap_size == 0 {
            return Err(Error::RoundedSizeZero(i));
        }

        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let mut flags = libc::MAP_SHARED;
        if opts.async_copy {
            flags |= libc::MAP_POPULATE;
        }

        let mmap_addr = unsafe {
            libc::mmap(
                std::ptr::null_mut::<c_void>(),
                mmap_size as usize,
                prot,
                flags,
                fd.as_raw_fd(),
                0 as off_t,
            )
        };
        if mmap_addr == libc::MAP_FAILED {
            return Err(Error::Mmap(i, std::io::Error::last_os_error()));
        }

        let host_user_addr = mmap_addr as u64 + mmap_offset;

        let mut region = MemRegion {
            guest_phys_addr: desc.guest_phys_addr,
            guest_user_addr: desc.userspace_addr,
            size: desc.size,
            fd: Some(fd),
            mmap_addr: mmap_addr as usize,
            mmap_size: mmap_size as usize,
            host_user_addr,
            mapped: true,
        };

        if opts.async_copy {
            insert_guest_pages(mem, &region, opts);
        }

        mem.regions.push(std::mem::replace(
            &mut region,
            MemRegion {
                guest_phys_addr: 0,
                guest_user_addr: 0,
                size: 0,
                fd: None,
                mmap_addr: 0,
                mmap_size: 0,
                host_user_addr: 0,
                mapped: false,
            },
        ));
    }
    Ok(())
}

fn insert_guest_pages(mem: &mut GuestMemory, region: &MemRegion, opts: &InstallOptions) {
    let host_phys_base = opts
        .translator
        .translate(region.host_user_addr, region.size);

    let page_size = opts.page_size.max(1);
    let mut guest_addr = region.guest_phys_addr;
    let mut host_addr = host_phys_base;
    let mut remaining = region.size;

    // First slice is shortened so every following slice starts page-aligned.
    let misalignment = host_addr % page_size;
    let first_len = if misalignment == 0 {
        page_size.min(remaining)
    } else {
        (page_size - misalignment).min(remaining)
    };

    let mut len = first_len;
    while remaining > 0 {
        let take = len.min(remaining);
        mem.insert_page(GuestPageEntry {
            guest_phys_addr: guest_addr,
            host_phys_addr: host_addr,
            size: take,
        });
        guest_addr += take;
        host_addr += take;
        remaining -= take;
        len = page_size;
    }
}

/// Unmaps every installed region and closes its backing fd.
pub fn unmap_mem_regions(mem: &mut GuestMemory) {
    for region in mem.regions.drain(..) {
        if region.mapped {
            unsafe {
                libc::munmap(region.mmap_addr as *mut c_void, region.mmap_size);
            }
        }
        // region.fd drops here, closing it.
    }
    mem.guest_pages.clear();
}

/// Rewrites `msg`'s region `userspace_addr` fields to the freshly mapped
/// `host_user_addr`, sends it back with no attached fds, then blocks waiting
/// for the peer's SET_MEM_TABLE ack before returning. Only call this when
/// `postcopy_listening` is set on the device.
pub fn postcopy_handshake(
    main_connfd: RawFd,
    set_mem_table_request: u32,
    mem: &GuestMemory,
    mut reply_payload: Vec<u8>,
    rewrite_userspace_addr: impl Fn(&mut Vec<u8>, usize, u64),
) -> Result<(), Error> {
    for (i, region) in mem.regions.iter().enumerate() {
        rewrite_userspace_addr(&mut reply_payload, i, region.host_user_addr);
    }
    let reply = Message::new(set_mem_table_request, reply_payload);
    codec::send_message(main_connfd, &reply)?;

    let ack = codec::read_message(main_connfd)?;
    if ack.request != set_mem_table_request {
        return Err(Error::BadPostcopyAck);
    }
    if !ack.fds.is_empty() {
        return Err(Error::PostcopyAckHadFds);
    }
    Ok(())
}

// --- userfaultfd registration -------------------------------------------
//
// `UFFDIO_REGISTER` isn't wrapped by `nix`; the ioctl number is computed the
// same way <linux/userfaultfd.h> does: _IOWR(UFFDIO, _UFFDIO_REGISTER, ...).

const UFFDIO_MAGIC: u8 = 0xAA;
const UFFDIO_REGISTER_NR: u8 = 0x00;

pub const UFFDIO_REGISTER_MODE_MISSING: u64 = 1 << 0;

#[repr(C)]
struct UffdioRange {
    start: u64,
    len: u64,
}

#[repr(C)]
struct UffdioRegister {
    range: UffdioRange,
    mode: u64,
    ioctls: u64,
}

nix::ioctl_readwrite!(uffdio_register_ioctl, UFFDIO_MAGIC, UFFDIO_REGISTER_NR, UffdioRegister);

/// Registers one mapped region's full mmap range with the userfaultfd
/// instance `postcopy_ufd`, in `MISSING` mode, so the peer's page faults on
/// it are delivered to the migration source.
pub fn postcopy_register_region(postcopy_ufd: RawFd, region: &MemRegion) -> Result<(), Error> {
    let mut reg = UffdioRegister {
        range: UffdioRange {
            start: region.mmap_addr as u64,
            len: region.mmap_size as u64,
        },
        mode: UFFDIO_REGISTER_MODE_MISSING,
        ioctls: 0,
    };
    let ret = unsafe { uffdio_register_ioctl(postcopy_ufd, &mut reg) };
    match ret {
        Ok(_) => Ok(()),
        Err(_) => Err(Error::UffdRegister(0, std::io::Error::last_os_error())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_contiguous_runs() {
        let mut mem = GuestMemory::default();
        mem.insert_page(GuestPageEntry {
            guest_phys_addr: 0,
            host_phys_addr: 0x1000,
            size: 0x1000,
        });
        mem.insert_page(GuestPageEntry {
            guest_phys_addr: 0x1000,
            host_phys_addr: 0x2000,
            size: 0x1000,
        });
        assert_eq!(mem.guest_pages.len(), 1);
        assert_eq!(mem.guest_pages[0].size, 0x2000);
    }

    #[test]
    fn does_not_coalesce_gaps() {
        let mut mem = GuestMemory::default();
        mem.insert_page(GuestPageEntry {
            guest_phys_addr: 0,
            host_phys_addr: 0x1000,
            size: 0x1000,
        });
        mem.insert_page(GuestPageEntry {
            guest_phys_addr: 0x2000,
            host_phys_addr: 0x4000,
            size: 0x1000,
        });
        assert_eq!(mem.guest_pages.len(), 2);
    }

    #[test]
    fn round_up_overflow_yields_none() {
        assert_eq!(round_up(u64::MAX - 1, 0x1000), None);
    }

    #[test]
    fn round_up_exact_multiple_unchanged() {
        assert_eq!(round_up(0x2000, 0x1000), Some(0x2000));
    }

    #[test]
    fn map_one_region_end_to_end() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(0x20_0000).unwrap(); // 2 MiB
        let mut fds = vec![Some(unsafe {
            OwnedFd::from_raw_fd(std::os::fd::AsRawFd::as_raw_fd(&file))
        })];
        // prevent double-close: file and the OwnedFd alias the same fd, so
        // leak `file`'s side of it.
        std::mem::forget(file);

        let descriptors = vec![RegionDescriptor {
            guest_phys_addr: 0,
            userspace_addr: 0,
            size: 0x20_0000,
            mmap_offset: 0,
        }];
        let mut mem = GuestMemory::default();
        let translator = IdentityTranslator;
        let opts = InstallOptions {
            async_copy: false,
            page_size: 0x1000,
            translator: &translator,
        };
        map_mem_regions(&mut mem, &descriptors, &mut fds, &opts).unwrap();

        assert_eq!(mem.regions.len(), 1);
        let region = &mem.regions[0];
        assert_eq!(region.host_user_addr, region.mmap_addr as u64);
        assert_eq!(region.mmap_size, 0x20_0000);

        unmap_mem_regions(&mut mem);
    }
}
