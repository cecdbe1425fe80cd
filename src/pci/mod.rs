//! PCI hierarchy: host bridges, devices, PCI-to-PCI bridges.
//!
//! The guest is big-endian, PCI configuration space is little-endian, and the
//! host bridges of these machines (Bandit, Chaos, Grackle) translate every
//! guest access into a naturally aligned dword access plus a small reshaping
//! descriptor. The reshaping tables in this module are the wire contract and
//! are ported exactly; everything else builds on them.

pub mod bandit;
pub mod bridge;
pub mod device;
pub mod grackle;
pub mod host;

pub use bandit::{Bandit, Chaos};
pub use bridge::PciBridge;
pub use device::{BarType, PciCfgState, PciDevice, PciDeviceHandle};
pub use grackle::Grackle;
pub use host::PciHost;

// ── Config space access details ───────────────────────────────

pub const PCI_CONFIG_DIRECTION: u8 = 1;
pub const PCI_CONFIG_READ: u8 = 0;
pub const PCI_CONFIG_WRITE: u8 = 1;

pub const PCI_CONFIG_TYPE: u8 = 4;
pub const PCI_CONFIG_TYPE_0: u8 = 0;
pub const PCI_CONFIG_TYPE_1: u8 = 4;

/// How a guest access maps onto the addressed config dword: original access
/// size, byte offset within the dword, direction and command type flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessDetails {
    pub size: u8,
    pub offset: u8,
    pub flags: u8,
}

/// Standard configuration space register offsets.
pub const PCI_CFG_DEV_ID: u32 = 0x00;
pub const PCI_CFG_STAT_CMD: u32 = 0x04;
pub const PCI_CFG_CLASS_REV: u32 = 0x08;
pub const PCI_CFG_DWORD_3: u32 = 0x0C; // BIST, header type, latency timer, cache line size
pub const PCI_CFG_BAR0: u32 = 0x10;
pub const PCI_CFG_BAR1: u32 = 0x14;
pub const PCI_CFG_BAR2: u32 = 0x18;
pub const PCI_CFG_BAR3: u32 = 0x1C;
pub const PCI_CFG_BAR4: u32 = 0x20;
pub const PCI_CFG_BAR5: u32 = 0x24;
pub const PCI_CFG_SUBSYS_ID: u32 = 0x2C;
pub const PCI_CFG_ROM_BAR: u32 = 0x30;
pub const PCI_CFG_CAP_PTR: u32 = 0x34;
pub const PCI_CFG_DWORD_15: u32 = 0x3C; // int line/pin, min_gnt/max_lat or bridge control

/// Bridge (header type 1) register offsets.
pub const PCI_CFG_PRIMARY_BUS: u32 = 0x18;
pub const PCI_CFG_IO_BASE: u32 = 0x1C;
pub const PCI_CFG_MEMORY_BASE: u32 = 0x20;
pub const PCI_CFG_PREF_MEM_BASE: u32 = 0x24;
pub const PCI_CFG_PREF_BASE_UPPER32: u32 = 0x28;
pub const PCI_CFG_PREF_LIMIT_UPPER32: u32 = 0x2C;
pub const PCI_CFG_IO_BASE_UPPER16: u32 = 0x30;
pub const PCI_CFG_BRIDGE_ROM_ADDRESS: u32 = 0x38;

/// PCI vendor ids seen in Power Macintosh systems.
pub const PCI_VENDOR_ATI: u16 = 0x1002;
pub const PCI_VENDOR_DEC: u16 = 0x1011;
pub const PCI_VENDOR_MOTOROLA: u16 = 0x1057;
pub const PCI_VENDOR_APPLE: u16 = 0x106B;

/// Combined device/function number, the key of a host's device map.
pub const fn dev_fun(dev_num: u8, fun_num: u8) -> u8 {
    (dev_num << 3) | fun_num
}

// ── Endian reshaping ──────────────────────────────────────────

/// Reshape a little-endian config dword for a big-endian guest access.
///
/// `value` is the addressed dword, `value2` the following one; a 4-byte
/// access at an unaligned offset spans both. Indexed by
/// `(size << 2) | (offset & 3)`.
pub fn pci_conv_rd_data(value: u32, value2: u32, details: AccessDetails) -> u32 {
    match (details.size as u32) << 2 | (details.offset as u32 & 3) {
        // Bytes
        0x04 => value & 0xFF,         // 0
        0x05 => (value >> 8) & 0xFF,  // 1
        0x06 => (value >> 16) & 0xFF, // 2
        0x07 => (value >> 24) & 0xFF, // 3

        // Words
        0x08 => (value as u16).swap_bytes() as u32,           // 0 1
        0x09 => ((value >> 8) as u16).swap_bytes() as u32,    // 1 2
        0x0A => ((value >> 16) as u16).swap_bytes() as u32,   // 2 3
        0x0B => ((value >> 16) & 0xFF00) | (value2 & 0xFF),   // 3 4

        // Dwords
        0x10 => value.swap_bytes(),                                      // 0 1 2 3
        0x11 => ((((value2 as u64) << 32 | value as u64) >> 8) as u32).swap_bytes(), // 1 2 3 4
        0x12 => ((((value2 as u64) << 32 | value as u64) >> 16) as u32).swap_bytes(), // 2 3 4 5
        0x13 => ((((value2 as u64) << 32 | value as u64) >> 24) as u32).swap_bytes(), // 3 4 5 6
        _ => 0xFFFF_FFFF,
    }
}

/// Merge a guest write `v2` into the existing dword `v1`, updating only the
/// addressed byte lanes, with the same endian conversion as the read path.
/// Unaligned data wraps around within the dword.
pub fn pci_conv_wr_data(v1: u32, v2: u32, details: AccessDetails) -> u32 {
    match (details.size as u32) << 2 | (details.offset as u32 & 3) {
        // Bytes
        0x04 => (v1 & !0xFF) | (v2 & 0xFF),                //  3  2  1 d0
        0x05 => (v1 & !0xFF00) | ((v2 & 0xFF) << 8),       //  3  2 d0  0
        0x06 => (v1 & !0xFF_0000) | ((v2 & 0xFF) << 16),   //  3 d0  1  0
        0x07 => (v1 & 0x00FF_FFFF) | ((v2 & 0xFF) << 24),  // d0  2  1  0

        // Words
        0x08 => (v1 & !0xFFFF) | (v2 as u16).swap_bytes() as u32, //  3  2 d1 d0
        0x09 => (v1 & !0xFF_FF00) | (((v2 as u16).swap_bytes() as u32) << 8), //  3 d1 d0  0
        0x0A => (v1 & 0x0000_FFFF) | (((v2 as u16).swap_bytes() as u32) << 16), // d1 d0  1  0
        0x0B => (v1 & 0x00FF_FF00) | ((v2 & 0xFF00) << 16) | (v2 & 0xFF), // d0  2  1 d1

        // Dwords
        0x10 => v2.swap_bytes(),                  // d3 d2 d1 d0
        0x11 => v2.swap_bytes().rotate_left(8),   // d2 d1 d0 d3
        0x12 => v2.swap_bytes().rotate_left(16),  // d1 d0 d3 d2
        0x13 => v2.swap_bytes().rotate_right(8),  // d0 d3 d2 d1

        _ => 0xFFFF_FFFF,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rd(size: u8, offset: u8, value: u32, value2: u32) -> u32 {
        pci_conv_rd_data(
            value,
            value2,
            AccessDetails {
                size,
                offset,
                flags: 0,
            },
        )
    }

    fn wr(size: u8, offset: u8, v1: u32, v2: u32) -> u32 {
        pci_conv_wr_data(
            v1,
            v2,
            AccessDetails {
                size,
                offset,
                flags: 0,
            },
        )
    }

    #[test]
    fn byte_reads_select_lanes() {
        // register holds host-ordered 0x11223344: the little-endian dword as
        // read back from the device is 0x11223344 with byte 0 = 0x44
        let v = 0x1122_3344;
        assert_eq!(rd(1, 0, v, v), 0x44);
        assert_eq!(rd(1, 1, v, v), 0x33);
        assert_eq!(rd(1, 2, v, v), 0x22);
        assert_eq!(rd(1, 3, v, v), 0x11);
    }

    #[test]
    fn word_reads_swap_halves() {
        let v = 0x1122_3344;
        assert_eq!(rd(2, 0, v, v), 0x4433);
        assert_eq!(rd(2, 2, v, v), 0x2211);
    }

    #[test]
    fn dword_read_rotations() {
        let v = 0x1122_3344;
        assert_eq!(rd(4, 0, v, v), 0x4433_2211);
        // unaligned dword spills into the second register: bytes 1..=4 and
        // 3..=6 of the little-endian stream, presented MSB-first
        assert_eq!(rd(4, 1, v, 0xAABB_CCDD), 0x3322_11DD);
        assert_eq!(rd(4, 3, v, 0xAABB_CCDD), 0x11DD_CCBB);
    }

    #[test]
    fn writes_touch_only_addressed_lanes() {
        let v1 = 0x1122_3344;
        assert_eq!(wr(1, 0, v1, 0xAB), 0x1122_33AB);
        assert_eq!(wr(1, 3, v1, 0xAB), 0xAB22_3344);
        assert_eq!(wr(2, 0, v1, 0xABCD), 0x1122_CDAB);
        assert_eq!(wr(4, 0, v1, 0xAABB_CCDD), 0xDDCC_BBAA);
    }

    #[test]
    fn read_write_round_trip_on_aligned_access() {
        // a guest that writes x and reads it back must see x, per width
        for (size, offset, guest_val) in [(1u8, 2u8, 0xA5u32), (2, 0, 0xBEEF), (4, 0, 0x0102_0304)] {
            let reg = wr(size, offset, 0, guest_val);
            assert_eq!(rd(size, offset, reg, reg), guest_val);
        }
    }
}
