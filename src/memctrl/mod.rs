//! Physical address map and MMIO dispatch.
//!
//! The memory controller owns a sorted interval map from physical address to
//! RAM, ROM, mirror, or memory-mapped I/O. Guest accesses resolve here: RAM
//! and ROM are served straight from host memory, MMIO is delegated to the
//! owning device. Machine-specific memory controllers (HMC, Hammerhead,
//! Grackle) sit on top and populate the map from their bank registers.
//!
//! `MemCtrl` is a cheap cloneable handle over shared state; every operation
//! scopes its borrow so a dispatched device can re-enter the map, which is
//! exactly what BAR remaps and firmware memory sizing do.

pub mod hammerhead;
pub mod hmc;

pub use hammerhead::HammerheadCtrl;
pub use hmc::Hmc;

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Region type. Mirrors carry their origin's type plus `MIRROR`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionType: u32 {
        const ROM    = 1 << 0;
        const RAM    = 1 << 1;
        const MMIO   = 1 << 2;
        const MIRROR = 1 << 3;
    }
}

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("memory region 0x{0:X}..0x{1:X} already exists")]
    AlreadyExists(u32, u32),
    #[error("no memory region contains address 0x{0:X}")]
    NoSuchRegion(u32),
    #[error("partial mirror outside the origin, offset=0x{0:X}, size=0x{1:X}")]
    MirrorOutOfRange(u32, u32),
}

/// Every memory-mapped device implements this trait.
///
/// `rgn_start` is the base address the region was registered with, `offset`
/// the distance of the access from that base. Reads take `&mut self`: some
/// devices have side effects on read (interrupt acknowledge, FIFO pop).
pub trait MmioDevice {
    fn name(&self) -> &str;
    fn read(&mut self, rgn_start: u32, offset: u32, size: u32) -> u32;
    fn write(&mut self, rgn_start: u32, offset: u32, value: u32, size: u32);
}

pub type MmioRef = Rc<RefCell<dyn MmioDevice>>;

type HostMem = Rc<RefCell<Vec<u8>>>;

struct AddressMapEntry {
    start: u32,
    end: u32,
    /// Origin address for mirror regions, 0 otherwise.
    mirror: u32,
    kind: RegionType,
    mem: Option<(HostMem, u32)>,
    dev: Option<MmioRef>,
}

/// Region facts handed out by the lookup methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub start: u32,
    pub end: u32,
    pub mirror: u32,
    pub kind: RegionType,
}

struct MapState {
    address_map: Vec<AddressMapEntry>,
}

impl MapState {
    fn find_idx(&self, addr: u32) -> Option<usize> {
        self.address_map
            .iter()
            .position(|e| addr >= e.start && addr <= e.end)
    }

    /// Keep the map sorted by start address so the RAM region, which starts
    /// at zero and is requested most often, wins the first probe.
    fn insert_sorted(&mut self, entry: AddressMapEntry) {
        let pos = self
            .address_map
            .partition_point(|e| e.start < entry.start);
        self.address_map.insert(pos, entry);
    }

    /// Exact duplicates and fully contained ranges are rejected; partial
    /// overlaps are honored with a warning. HWInit probes ROM aliases whose
    /// ranges intersect real regions.
    fn check_range_free(&self, addr: u32, size: u32) -> Result<(), RegionError> {
        let end = addr + (size - 1);
        for entry in &self.address_map {
            if addr == entry.start && end == entry.end {
                log::warn!("memory region 0x{:X}..0x{:X} already exists", addr, end);
                return Err(RegionError::AlreadyExists(addr, end));
            } else if addr >= entry.start && end <= entry.end {
                log::warn!(
                    "0x{:X}..0x{:X} already exists in memory region 0x{:X}..0x{:X}",
                    addr,
                    end,
                    entry.start,
                    entry.end
                );
                return Err(RegionError::AlreadyExists(addr, end));
            } else if end >= entry.start && addr <= entry.end {
                log::warn!(
                    "0x{:X}..0x{:X} overlaps existing memory region 0x{:X}..0x{:X}",
                    addr,
                    end,
                    entry.start,
                    entry.end
                );
            }
        }
        Ok(())
    }
}

/// Shared handle to one machine's address map.
#[derive(Clone)]
pub struct MemCtrl {
    state: Rc<RefCell<MapState>>,
}

/// Alias kept for signatures that read better with an explicit "shared
/// reference" spelling.
pub type MemCtrlRef = MemCtrl;

impl MemCtrl {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(MapState {
                address_map: Vec::new(),
            })),
        }
    }

    // ── Region registration ───────────────────────────────────

    pub fn add_ram_region(&self, start_addr: u32, size: u32) -> Result<(), RegionError> {
        self.add_mem_region(start_addr, size, RegionType::RAM)
    }

    pub fn add_rom_region(&self, start_addr: u32, size: u32) -> Result<(), RegionError> {
        self.add_mem_region(start_addr, size, RegionType::ROM)
    }

    fn add_mem_region(
        &self,
        start_addr: u32,
        size: u32,
        kind: RegionType,
    ) -> Result<(), RegionError> {
        if size == 0 {
            return Err(RegionError::AlreadyExists(start_addr, start_addr));
        }
        let mut state = self.state.borrow_mut();
        state.check_range_free(start_addr, size)?;

        let end = start_addr + (size - 1);
        let mem = Rc::new(RefCell::new(vec![0u8; size as usize]));
        state.insert_sorted(AddressMapEntry {
            start: start_addr,
            end,
            mirror: 0,
            kind,
            mem: Some((mem, 0)),
            dev: None,
        });

        log::info!(
            "Added {} region 0x{:X}..0x{:X}",
            region_kind_name(kind),
            start_addr,
            end
        );
        Ok(())
    }

    pub fn add_mmio_region(
        &self,
        start_addr: u32,
        size: u32,
        dev: MmioRef,
    ) -> Result<(), RegionError> {
        let mut state = self.state.borrow_mut();
        state.check_range_free(start_addr, size)?;

        let end = start_addr + (size - 1);
        log::info!(
            "Added mmio region 0x{:X}..0x{:X} ({})",
            start_addr,
            end,
            dev.borrow().name()
        );
        state.insert_sorted(AddressMapEntry {
            start: start_addr,
            end,
            mirror: 0,
            kind: RegionType::MMIO,
            mem: None,
            dev: Some(dev),
        });
        Ok(())
    }

    pub fn remove_mmio_region(&self, start_addr: u32, size: u32, dev: &MmioRef) -> bool {
        let end = start_addr + (size - 1);
        let found = {
            let mut state = self.state.borrow_mut();
            let before = state.address_map.len();
            state.address_map.retain(|entry| {
                !(entry.start == start_addr
                    && entry.end == end
                    && entry.dev.as_ref().is_some_and(|d| Rc::ptr_eq(d, dev)))
            });
            before - state.address_map.len()
        };

        match found {
            0 => log::error!(
                "Cannot find mmio region 0x{:X}..0x{:X} ({}) to remove",
                start_addr,
                end,
                dev.borrow().name()
            ),
            1 => log::info!("Removed mmio region 0x{:X}..0x{:X}", start_addr, end),
            n => log::error!(
                "Removed {} occurrences of mmio region 0x{:X}..0x{:X}",
                n,
                start_addr,
                end
            ),
        }
        found > 0
    }

    /// Mirror the whole origin region at `start_addr`.
    pub fn add_mem_mirror(&self, start_addr: u32, dest_addr: u32) -> Result<(), RegionError> {
        self.add_mem_mirror_common(start_addr, dest_addr, 0, 0)
    }

    /// Mirror `size` bytes of the origin region starting `offset` bytes in.
    pub fn add_mem_mirror_partial(
        &self,
        start_addr: u32,
        dest_addr: u32,
        offset: u32,
        size: u32,
    ) -> Result<(), RegionError> {
        self.add_mem_mirror_common(start_addr, dest_addr, offset, size)
    }

    fn add_mem_mirror_common(
        &self,
        start_addr: u32,
        dest_addr: u32,
        offset: u32,
        size: u32,
    ) -> Result<(), RegionError> {
        let mut state = self.state.borrow_mut();
        let ref_idx = state
            .find_idx(dest_addr)
            .ok_or(RegionError::NoSuchRegion(dest_addr))?;
        let (ref_start, ref_end, ref_kind) = {
            let e = &state.address_map[ref_idx];
            (e.start, e.end, e.kind)
        };

        // use the origin's size if none was specified
        let size = if size != 0 { size } else { ref_end - ref_start + 1 };

        if ref_start + offset + (size - 1) > ref_end {
            return Err(RegionError::MirrorOutOfRange(offset, size));
        }

        let (mem, mem_offset) = state.address_map[ref_idx]
            .mem
            .clone()
            .ok_or(RegionError::NoSuchRegion(dest_addr))?;

        let end = start_addr + (size - 1);
        state.insert_sorted(AddressMapEntry {
            start: start_addr,
            end,
            mirror: dest_addr,
            kind: ref_kind | RegionType::MIRROR,
            mem: Some((mem, mem_offset + offset)),
            dev: None,
        });

        log::info!(
            "Added mirror region 0x{:X}..0x{:X} -> 0x{:X}",
            start_addr,
            end,
            dest_addr
        );
        Ok(())
    }

    /// Move a region to a new base address, keeping its size and contents.
    /// The HMC relocates its RAM bank B when the guest reprograms the bank
    /// configuration.
    pub fn relocate_region(&self, old_start: u32, new_start: u32) -> bool {
        let mut state = self.state.borrow_mut();
        let idx = match state.find_idx(old_start) {
            Some(idx) if state.address_map[idx].start == old_start => idx,
            _ => return false,
        };
        let mut entry = state.address_map.remove(idx);
        entry.end = new_start + (entry.end - entry.start);
        entry.start = new_start;
        state.insert_sorted(entry);
        true
    }

    // ── Lookup ────────────────────────────────────────────────

    pub fn find_range(&self, addr: u32) -> Option<RegionInfo> {
        let state = self.state.borrow();
        state.find_idx(addr).map(|idx| {
            let e = &state.address_map[idx];
            RegionInfo {
                start: e.start,
                end: e.end,
                mirror: e.mirror,
                kind: e.kind,
            }
        })
    }

    pub fn find_range_contains(&self, addr: u32, size: u32) -> Option<RegionInfo> {
        let end = addr + (size - 1);
        let state = self.state.borrow();
        state
            .address_map
            .iter()
            .find(|e| addr >= e.start && end <= e.end)
            .map(|e| RegionInfo {
                start: e.start,
                end: e.end,
                mirror: e.mirror,
                kind: e.kind,
            })
    }

    /// First pure ROM region, used by the machine builder to load the
    /// firmware image.
    pub fn find_rom_region(&self) -> Option<(u32, u32)> {
        let state = self.state.borrow();
        state
            .address_map
            .iter()
            .find(|e| e.kind == RegionType::ROM)
            .map(|e| (e.start, e.end))
    }

    // ── Data loading ──────────────────────────────────────────

    /// Copy `data` into the region containing `load_addr` (ROM images,
    /// preloaded RAM contents). Truncates at the region end.
    pub fn set_data(&self, load_addr: u32, data: &[u8]) -> Result<(), RegionError> {
        let state = self.state.borrow();
        let idx = state
            .find_idx(load_addr)
            .ok_or(RegionError::NoSuchRegion(load_addr))?;
        let entry = &state.address_map[idx];
        let (mem, mem_offset) = entry
            .mem
            .clone()
            .ok_or(RegionError::NoSuchRegion(load_addr))?;

        let load_offset = (load_addr - entry.start + mem_offset) as usize;
        let mut mem = mem.borrow_mut();
        let cpy_size = data.len().min(mem.len() - load_offset);
        mem[load_offset..load_offset + cpy_size].copy_from_slice(&data[..cpy_size]);
        Ok(())
    }

    // ── Guest access dispatch ─────────────────────────────────

    /// Resolve `addr` for dispatch: host memory (and byte index), or device.
    fn resolve(
        &self,
        addr: u32,
        size: u32,
        is_write: bool,
    ) -> Option<Result<(HostMem, usize), (MmioRef, u32, u32)>> {
        let state = self.state.borrow();
        let idx = match state.find_idx(addr) {
            Some(idx) => idx,
            None => {
                log::error!(
                    "{} of unmapped memory 0x{:X}",
                    if is_write { "write" } else { "read" },
                    addr
                );
                return None;
            }
        };
        let entry = &state.address_map[idx];
        if addr + (size - 1) > entry.end {
            panic!(
                "{}-byte access at 0x{:X} straddles region boundary 0x{:X}",
                size, addr, entry.end
            );
        }
        if is_write && entry.kind.intersects(RegionType::ROM) {
            log::warn!("write to ROM region at 0x{:X} ignored", addr);
            return None;
        }
        Some(match &entry.mem {
            Some((mem, mem_offset)) => Ok((
                Rc::clone(mem),
                (addr - entry.start + mem_offset) as usize,
            )),
            None => Err((
                Rc::clone(entry.dev.as_ref().unwrap()),
                entry.start,
                addr - entry.start,
            )),
        })
    }

    pub fn read(&self, addr: u32, size: u32) -> u32 {
        debug_assert!(matches!(size, 1 | 2 | 4));
        match self.resolve(addr, size, false) {
            None => 0,
            Some(Ok((mem, idx))) => {
                let mem = mem.borrow();
                match size {
                    1 => mem[idx] as u32,
                    2 => u16::from_be_bytes([mem[idx], mem[idx + 1]]) as u32,
                    _ => u32::from_be_bytes([mem[idx], mem[idx + 1], mem[idx + 2], mem[idx + 3]]),
                }
            }
            Some(Err((dev, rgn_start, offset))) => dev.borrow_mut().read(rgn_start, offset, size),
        }
    }

    pub fn write(&self, addr: u32, value: u32, size: u32) {
        debug_assert!(matches!(size, 1 | 2 | 4));
        match self.resolve(addr, size, true) {
            None => {}
            Some(Ok((mem, idx))) => {
                let mut mem = mem.borrow_mut();
                match size {
                    1 => mem[idx] = value as u8,
                    2 => mem[idx..idx + 2].copy_from_slice(&(value as u16).to_be_bytes()),
                    _ => mem[idx..idx + 4].copy_from_slice(&value.to_be_bytes()),
                }
            }
            Some(Err((dev, rgn_start, offset))) => {
                dev.borrow_mut().write(rgn_start, offset, value, size);
            }
        }
    }

    // ── DMA accessor ──────────────────────────────────────────
    //
    // DMA engines resolve guest physical addresses here. A single transfer
    // must lie within one mapped RAM/ROM region; partial mappings for one
    // descriptor are not supported.

    fn dma_region(&self, addr: u32, size: u32) -> (HostMem, usize) {
        let state = self.state.borrow();
        let end = addr + size.max(1) - 1;
        let entry = state
            .address_map
            .iter()
            .find(|e| addr >= e.start && end <= e.end)
            .unwrap_or_else(|| panic!("DMA access to unmapped memory 0x{:X}+0x{:X}", addr, size));
        let (mem, mem_offset) = entry
            .mem
            .as_ref()
            .unwrap_or_else(|| panic!("DMA access to MMIO region 0x{:X}", addr));
        (Rc::clone(mem), (addr - entry.start + mem_offset) as usize)
    }

    pub fn dma_mem_read(&self, addr: u32, buf: &mut [u8]) {
        let (mem, idx) = self.dma_region(addr, buf.len() as u32);
        buf.copy_from_slice(&mem.borrow()[idx..idx + buf.len()]);
    }

    pub fn dma_mem_write(&self, addr: u32, buf: &[u8]) {
        let (mem, idx) = self.dma_region(addr, buf.len() as u32);
        mem.borrow_mut()[idx..idx + buf.len()].copy_from_slice(buf);
    }

    /// Whether a DMA engine may write to `addr` (descriptor status
    /// write-back is skipped for programs fetched from ROM).
    pub fn dma_writable(&self, addr: u32) -> bool {
        self.find_range(addr)
            .is_some_and(|e| e.kind.intersects(RegionType::RAM))
    }
}

impl Default for MemCtrl {
    fn default() -> Self {
        Self::new()
    }
}

fn region_kind_name(kind: RegionType) -> &'static str {
    if kind.contains(RegionType::MIRROR) {
        "mirror"
    } else if kind.contains(RegionType::ROM) {
        "ROM"
    } else if kind.contains(RegionType::RAM) {
        "RAM"
    } else {
        "MMIO"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        last: Option<(u32, u32, u32, u32)>,
    }

    impl MmioDevice for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn read(&mut self, rgn_start: u32, offset: u32, size: u32) -> u32 {
            self.last = Some((rgn_start, offset, 0, size));
            0xA5A5_A5A5
        }
        fn write(&mut self, rgn_start: u32, offset: u32, value: u32, size: u32) {
            self.last = Some((rgn_start, offset, value, size));
        }
    }

    #[test]
    fn ram_round_trips_all_widths() {
        let mc = MemCtrl::new();
        mc.add_ram_region(0, 0x10000).unwrap();
        for (addr, val, size) in [(0x10u32, 0xEFu32, 1u32), (0x20, 0xBEEF, 2), (0x30, 0xDEADBEEF, 4)]
        {
            mc.write(addr, val, size);
            assert_eq!(mc.read(addr, size), val);
        }
        // big-endian byte order in host memory
        mc.write(0x40, 0x11223344, 4);
        assert_eq!(mc.read(0x40, 1), 0x11);
        assert_eq!(mc.read(0x43, 1), 0x44);
        assert_eq!(mc.read(0x42, 2), 0x3344);
    }

    #[test]
    fn duplicate_and_contained_regions_rejected() {
        let mc = MemCtrl::new();
        mc.add_ram_region(0, 0x1000).unwrap();
        assert!(mc.add_ram_region(0, 0x1000).is_err());
        assert!(mc.add_ram_region(0x100, 0x100).is_err());
        // partial overlap is honored
        mc.add_ram_region(0x800, 0x1000).unwrap();
    }

    #[test]
    fn mirror_reads_origin_bytes() {
        let mc = MemCtrl::new();
        mc.add_rom_region(0x4000_0000, 0x1000).unwrap();
        mc.set_data(0x4000_0000, &[0x12, 0x34, 0x56, 0x78]).unwrap();
        mc.add_mem_mirror(0xFFC0_0000, 0x4000_0000).unwrap();
        assert_eq!(mc.read(0xFFC0_0000, 4), 0x1234_5678);

        // partial mirror with an offset
        mc.add_mem_mirror_partial(0x5000_0000, 0x4000_0000, 2, 0x10)
            .unwrap();
        assert_eq!(mc.read(0x5000_0000, 2), 0x5678);
    }

    #[test]
    fn mirror_outside_origin_rejected() {
        let mc = MemCtrl::new();
        mc.add_rom_region(0x4000_0000, 0x1000).unwrap();
        assert!(mc
            .add_mem_mirror_partial(0x5000_0000, 0x4000_0000, 0x800, 0x1000)
            .is_err());
    }

    #[test]
    fn mmio_dispatch_passes_region_base_and_offset() {
        let mc = MemCtrl::new();
        let dev = Rc::new(RefCell::new(Recorder { last: None }));
        mc.add_mmio_region(0xF300_0000, 0x2_0000, dev.clone())
            .unwrap();

        mc.write(0xF300_0014, 0xCAFE, 2);
        assert_eq!(dev.borrow().last, Some((0xF300_0000, 0x14, 0xCAFE, 2)));

        assert_eq!(mc.read(0xF300_1000, 4), 0xA5A5_A5A5);
        assert_eq!(dev.borrow().last, Some((0xF300_0000, 0x1000, 0, 4)));
    }

    #[test]
    fn device_may_reenter_the_map_during_dispatch() {
        struct Remapper {
            mem: MemCtrl,
        }
        impl MmioDevice for Remapper {
            fn name(&self) -> &str {
                "remapper"
            }
            fn read(&mut self, _rgn_start: u32, _offset: u32, _size: u32) -> u32 {
                0
            }
            fn write(&mut self, _rgn_start: u32, _offset: u32, value: u32, _size: u32) {
                // firmware memory sizing: a register write creates RAM
                self.mem.add_ram_region(0, value).unwrap();
            }
        }

        let mc = MemCtrl::new();
        let dev = Rc::new(RefCell::new(Remapper { mem: mc.clone() }));
        mc.add_mmio_region(0xF000_0000, 0x1000, dev).unwrap();
        mc.write(0xF000_0000, 0x1000, 4);
        assert!(mc.find_range(0).is_some());
    }

    #[test]
    fn remove_mmio_region_unmaps() {
        let mc = MemCtrl::new();
        let dev: MmioRef = Rc::new(RefCell::new(Recorder { last: None }));
        mc.add_mmio_region(0x8000_0000, 0x1000, dev.clone()).unwrap();
        assert!(mc.remove_mmio_region(0x8000_0000, 0x1000, &dev));
        assert!(mc.find_range(0x8000_0000).is_none());
        assert!(!mc.remove_mmio_region(0x8000_0000, 0x1000, &dev));
    }

    #[test]
    fn rom_writes_ignored() {
        let mc = MemCtrl::new();
        mc.add_rom_region(0xFFC0_0000, 0x1000).unwrap();
        mc.set_data(0xFFC0_0000, &[0xAA]).unwrap();
        mc.write(0xFFC0_0000, 0x55, 1);
        assert_eq!(mc.read(0xFFC0_0000, 1), 0xAA);
    }

    #[test]
    fn dma_accessor_round_trip() {
        let mc = MemCtrl::new();
        mc.add_ram_region(0, 0x1000).unwrap();
        mc.dma_mem_write(0x100, &[1, 2, 3, 4]);
        let mut buf = [0u8; 4];
        mc.dma_mem_read(0x100, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert!(mc.dma_writable(0x100));
    }

    #[test]
    fn relocation_moves_contents() {
        let mc = MemCtrl::new();
        mc.add_ram_region(0x2000_0000, 0x1000).unwrap();
        mc.write(0x2000_0010, 0x77, 1);
        assert!(mc.relocate_region(0x2000_0000, 0x0100_0000));
        assert_eq!(mc.read(0x0100_0010, 1), 0x77);
        assert!(mc.find_range(0x2000_0000).is_none());
    }

    #[test]
    #[should_panic]
    fn straddling_access_panics() {
        let mc = MemCtrl::new();
        mc.add_ram_region(0, 0x1000).unwrap();
        mc.read(0xFFE, 4);
    }
}
