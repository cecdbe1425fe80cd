//! Descriptor-based DMA (DBDMA) channel emulation.
//!
//! Every mac-io DMA channel interprets a program of 16-byte descriptors in
//! guest memory. Device FIFOs consume the program through `pull_data` /
//! `push_data`; the guest drives the channel through four dword registers.
//! Channel callbacks must not re-enter the channel synchronously; devices
//! that need to move data in response to a start defer through the timer
//! manager, which is how the cooperative main loop works everywhere else.

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;

use crate::interrupts::IntCtrlRef;
use crate::memctrl::MemCtrlRef;

bitflags! {
    /// ChannelStatus bits. The high byte is channel control, the low byte
    /// holds the general-purpose s0..s7 bits device firmware assigns.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChStat: u16 {
        const RUN    = 0x8000;
        const PAUSE  = 0x4000;
        const FLUSH  = 0x2000;
        const WAKE   = 0x1000;
        const DEAD   = 0x0800;
        const ACTIVE = 0x0400;
        const BT     = 0x0100;
        const S7     = 0x0080;
        const S0     = 0x0001;
    }
}

/// Channel register offsets (one dword each).
pub mod dma_reg {
    pub const CH_CTRL: u32 = 0x00;
    pub const CH_STAT: u32 = 0x04;
    pub const CMD_PTR_HI: u32 = 0x08;
    pub const CMD_PTR_LO: u32 = 0x0C;
    pub const INT_SELECT: u32 = 0x10;
    pub const BRANCH_SELECT: u32 = 0x14;
    pub const WAIT_SELECT: u32 = 0x18;
}

/// DBDMA command codes (bits 12..15 of the descriptor command word).
pub mod dbdma_cmd {
    pub const OUTPUT_MORE: u8 = 0;
    pub const OUTPUT_LAST: u8 = 1;
    pub const INPUT_MORE: u8 = 2;
    pub const INPUT_LAST: u8 = 3;
    pub const STORE_QUAD: u8 = 4;
    pub const LOAD_QUAD: u8 = 5;
    pub const NOP: u8 = 6;
    pub const STOP: u8 = 7;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaPullResult {
    MoreData,
    NoMoreData,
}

/// One 16-byte descriptor, decoded from guest memory (little-endian).
struct DmaCmd {
    req_count: u16,
    cmd: u8,
    key: u8,
    wait_bits: u8,
    branch_bits: u8,
    int_bits: u8,
    address: u32,
    cmd_dep: u32,
}

impl DmaCmd {
    fn decode(bytes: &[u8; 16]) -> Self {
        let command = u16::from_le_bytes([bytes[2], bytes[3]]);
        Self {
            req_count: u16::from_le_bytes([bytes[0], bytes[1]]),
            cmd: (command >> 12) as u8,
            key: ((command >> 8) & 7) as u8,
            int_bits: ((command >> 4) & 3) as u8,
            branch_bits: ((command >> 2) & 3) as u8,
            wait_bits: (command & 3) as u8,
            address: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            cmd_dep: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        }
    }
}

pub type DmaCallback = Rc<RefCell<dyn FnMut()>>;

pub struct DmaChannel {
    name: String,
    mem_ctrl: MemCtrlRef,

    int_ctrl: Option<IntCtrlRef>,
    irq_id: u64,

    ch_stat: u16,
    cmd_ptr: u32,
    int_select: u32,
    branch_select: u32,
    wait_select: u32,

    /// Guest physical cursor of the live buffer.
    queue_addr: u32,
    queue_len: u32,

    cur_cmd: u8,
    cmd_in_progress: bool,

    start_cb: Option<DmaCallback>,
    stop_cb: Option<DmaCallback>,
}

pub type DmaChannelRef = Rc<RefCell<DmaChannel>>;

impl DmaChannel {
    pub fn new(name: &str, mem_ctrl: MemCtrlRef) -> Self {
        Self {
            name: name.to_string(),
            mem_ctrl,
            int_ctrl: None,
            irq_id: 0,
            ch_stat: 0,
            cmd_ptr: 0,
            int_select: 0,
            branch_select: 0,
            wait_select: 0,
            queue_addr: 0,
            queue_len: 0,
            cur_cmd: 0,
            cmd_in_progress: false,
            start_cb: None,
            stop_cb: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register_dma_int(&mut self, int_ctrl: IntCtrlRef, irq_id: u64) {
        self.int_ctrl = Some(int_ctrl);
        self.irq_id = irq_id;
    }

    pub fn set_callbacks(&mut self, start_cb: DmaCallback, stop_cb: DmaCallback) {
        self.start_cb = Some(start_cb);
        self.stop_cb = Some(stop_cb);
    }

    pub fn ch_stat(&self) -> u16 {
        self.ch_stat
    }

    pub fn cmd_ptr(&self) -> u32 {
        self.cmd_ptr
    }

    pub fn is_active(&self) -> bool {
        self.ch_stat & ChStat::DEAD.bits() == 0 && self.ch_stat & ChStat::ACTIVE.bits() != 0
    }

    // ── Program interpretation ────────────────────────────────

    fn fetch_cmd(&self, cmd_addr: u32) -> DmaCmd {
        let mut bytes = [0u8; 16];
        self.mem_ctrl.dma_mem_read(cmd_addr, &mut bytes);
        DmaCmd::decode(&bytes)
    }

    /// Interpret the descriptor at `cmd_ptr`. Finishes the in-flight command
    /// first: status/residual write-back, then wait, branch, and interrupt
    /// actions under control of the select comparators.
    fn interpret_cmd(&mut self) -> u8 {
        if self.cmd_in_progress {
            // return current command if there is still data to transfer
            if self.queue_len != 0 {
                return self.cur_cmd;
            }

            let cmd_struct = self.fetch_cmd(self.cmd_ptr);
            let is_writable = self.mem_ctrl.dma_writable(self.cmd_ptr);
            let mut branch_taken = false;

            self.cur_cmd = cmd_struct.cmd;

            // all commands except STOP update xfer_status and perform
            // actions under control of the i/b/w bits
            if self.cur_cmd < dbdma_cmd::STOP {
                if is_writable {
                    let status = self.ch_stat | ChStat::ACTIVE.bits();
                    self.mem_ctrl.dma_mem_write(self.cmd_ptr + 14, &status.to_le_bytes());
                }

                if cmd_struct.wait_bits != 0 {
                    panic!("{}: cmd.wait bits not implemented", self.name);
                }

                if cmd_struct.branch_bits != 0 {
                    let mut cond = true;
                    if cmd_struct.branch_bits != 3 {
                        let br_mask = (self.branch_select >> 16) as u16;
                        cond = (self.ch_stat & br_mask) == (self.branch_select as u16 & br_mask);
                        if cmd_struct.branch_bits == 2 {
                            cond = !cond; // branch if condition cleared
                        }
                    }
                    if cond {
                        self.cmd_ptr = cmd_struct.cmd_dep;
                        branch_taken = true;
                    }
                }

                self.update_irq();
            }

            // all INPUT and OUTPUT commands update res_count
            if self.cur_cmd < dbdma_cmd::STORE_QUAD && is_writable {
                self.mem_ctrl.dma_mem_write(self.cmd_ptr + 12, &(self.queue_len as u16).to_le_bytes());
            }

            if !branch_taken {
                self.cmd_ptr += 16;
            }

            self.cmd_in_progress = false;
        }

        let cmd_struct = self.fetch_cmd(self.cmd_ptr);

        self.ch_stat &= !ChStat::WAKE.bits(); // clear wake bit (DBDMA spec 5.5.3.4)

        self.cur_cmd = cmd_struct.cmd;

        match self.cur_cmd {
            dbdma_cmd::OUTPUT_MORE
            | dbdma_cmd::OUTPUT_LAST
            | dbdma_cmd::INPUT_MORE
            | dbdma_cmd::INPUT_LAST => {
                if cmd_struct.key != 0 {
                    log::error!("{}: Key > 0 not implemented", self.name);
                } else {
                    self.queue_addr = cmd_struct.address;
                    self.queue_len = cmd_struct.req_count as u32;
                    self.cmd_in_progress = true;
                }
            }
            dbdma_cmd::STORE_QUAD => {
                log::error!("{}: Unsupported DMA Command STORE_QUAD", self.name);
            }
            dbdma_cmd::LOAD_QUAD => {
                log::error!("{}: Unsupported DMA Command LOAD_QUAD", self.name);
            }
            dbdma_cmd::NOP => {
                log::error!("{}: Unsupported DMA Command NOP", self.name);
            }
            dbdma_cmd::STOP => {
                self.ch_stat &= !ChStat::ACTIVE.bits();
                self.cmd_in_progress = false;
            }
            _ => {
                log::error!("{}: Unsupported DMA command 0x{:X}", self.name, self.cur_cmd);
                self.ch_stat |= ChStat::DEAD.bits();
                self.ch_stat &= !ChStat::ACTIVE.bits();
            }
        }

        self.cur_cmd
    }

    /// Fire the channel interrupt if the completed descriptor requests it.
    fn update_irq(&mut self) {
        let cmd_struct = self.fetch_cmd(self.cmd_ptr);

        // STOP doesn't generate interrupts
        if self.cur_cmd < dbdma_cmd::STOP && cmd_struct.int_bits != 0 {
            let mut cond = true;
            if cmd_struct.int_bits != 3 {
                let int_mask = (self.int_select >> 16) as u16;
                cond = (self.ch_stat & int_mask) == (self.int_select as u16 & int_mask);
                if cmd_struct.int_bits == 2 {
                    cond = !cond; // interrupt if condition cleared
                }
            }
            if cond {
                match &self.int_ctrl {
                    Some(ctrl) => ctrl.borrow_mut().ack_dma_int(self.irq_id, 1),
                    None => log::error!("{}: no DMA interrupt registered", self.name),
                }
            }
        }
    }

    // ── Register block ────────────────────────────────────────

    pub fn reg_read(&mut self, offset: u32, size: u32) -> u32 {
        if size != 4 {
            panic!(
                "{}: non-DWORD read from a DMA channel not supported",
                self.name
            );
        }

        match offset {
            dma_reg::CH_CTRL => 0, // ChannelControl reads as 0 (DBDMA spec 5.5.1)
            dma_reg::CH_STAT => (self.ch_stat as u32).swap_bytes(),
            _ => {
                log::warn!(
                    "{}: Unsupported DMA channel register read @{:02X}",
                    self.name,
                    offset
                );
                0
            }
        }
    }

    pub fn reg_write(&mut self, offset: u32, value: u32, size: u32) {
        if size != 4 {
            panic!(
                "{}: non-DWORD write to a DMA channel not supported",
                self.name
            );
        }

        let value = value.swap_bytes();
        let old_stat = self.ch_stat;

        match offset {
            dma_reg::CH_CTRL => {
                let mask = (value >> 16) as u16;
                let mut new_stat = (value as u16 & mask & 0xF0FF) | (old_stat & !mask);
                log::trace!("{}: New ChannelStatus value = 0x{:X}", self.name, new_stat);

                // update ch_stat.s0...s7 if requested (interrupt generation
                // depends on them)
                if (new_stat & 0xFF) != (old_stat & 0xFF) {
                    self.ch_stat |= new_stat & 0xFF;
                }

                // the flush bit can arrive together with the run bit being
                // cleared; buffered data must hit memory before the abort
                if new_stat & ChStat::FLUSH.bits() != 0 {
                    // buffered writes are not batched in this implementation,
                    // nothing to flush
                    new_stat &= !ChStat::FLUSH.bits();
                    self.ch_stat = new_stat;
                }

                if (new_stat ^ old_stat) & ChStat::RUN.bits() != 0 {
                    if new_stat & ChStat::RUN.bits() != 0 {
                        new_stat |= ChStat::ACTIVE.bits();
                        self.ch_stat = new_stat;
                        self.start();
                    } else {
                        self.abort();
                        self.update_irq();
                        new_stat &= !ChStat::ACTIVE.bits();
                        new_stat &= !ChStat::DEAD.bits();
                        self.cmd_in_progress = false;
                        self.ch_stat = new_stat;
                    }
                } else if (new_stat ^ old_stat) & ChStat::WAKE.bits() != 0 {
                    new_stat |= ChStat::ACTIVE.bits();
                    self.ch_stat = new_stat;
                    self.resume();
                } else if (new_stat ^ old_stat) & ChStat::PAUSE.bits() != 0
                    && new_stat & ChStat::PAUSE.bits() != 0
                {
                    new_stat &= !ChStat::ACTIVE.bits();
                    self.ch_stat = new_stat;
                    self.pause();
                }
            }
            dma_reg::CH_STAT => {} // ignore writes to ChannelStatus
            dma_reg::CMD_PTR_HI => {
                if value != 0 {
                    log::warn!(
                        "{}: Unsupported DMA channel register write @{:02X} = {:X}",
                        self.name,
                        offset,
                        value
                    );
                }
            }
            dma_reg::CMD_PTR_LO => {
                if self.ch_stat & (ChStat::RUN.bits() | ChStat::ACTIVE.bits()) == 0 {
                    self.cmd_ptr = value;
                    log::trace!("{}: CommandPtrLo set to 0x{:X}", self.name, self.cmd_ptr);
                }
            }
            dma_reg::INT_SELECT => self.int_select = value & 0xFF00FF,
            dma_reg::BRANCH_SELECT => self.branch_select = value & 0xFF00FF,
            dma_reg::WAIT_SELECT => self.wait_select = value & 0xFF00FF,
            _ => {
                log::warn!(
                    "{}: Unsupported DMA channel register write @{:02X} = {:X}",
                    self.name,
                    offset,
                    value
                );
            }
        }
    }

    // ── Consumer/producer API ─────────────────────────────────

    /// Interpret descriptors until output data is available or the channel
    /// idles, then return up to `req_len` bytes of the live buffer.
    pub fn pull_data(&mut self, req_len: u32) -> (DmaPullResult, Vec<u8>) {
        if self.ch_stat & ChStat::DEAD.bits() != 0 || self.ch_stat & ChStat::ACTIVE.bits() == 0 {
            log::warn!("{}: Dead/idle channel -> no more data", self.name);
            return (DmaPullResult::NoMoreData, Vec::new());
        }

        // interpret the DBDMA program until we get data or become idle
        while self.ch_stat & ChStat::ACTIVE.bits() != 0 && self.queue_len == 0 {
            self.interpret_cmd();
        }

        if self.queue_len != 0 {
            let chunk = self.queue_len.min(req_len);
            let mut data = vec![0u8; chunk as usize];
            self.mem_ctrl.dma_mem_read(self.queue_addr, &mut data);
            self.queue_addr += chunk;
            self.queue_len -= chunk;
            return (DmaPullResult::MoreData, data);
        }

        (DmaPullResult::NoMoreData, Vec::new())
    }

    /// Interpret descriptors until an input buffer is available, then copy
    /// as much of `src` into it as fits. Returns false on a dead or idle
    /// channel.
    pub fn push_data(&mut self, src: &[u8]) -> bool {
        if self.ch_stat & ChStat::DEAD.bits() != 0 || self.ch_stat & ChStat::ACTIVE.bits() == 0 {
            log::warn!("{}: attempt to push data to dead/idle channel", self.name);
            return false;
        }

        // interpret the DBDMA program until we get a buffer to fill
        while self.ch_stat & ChStat::ACTIVE.bits() != 0 && self.queue_len == 0 {
            self.interpret_cmd();
        }

        if self.queue_len != 0 {
            let len = (self.queue_len as usize).min(src.len());
            self.mem_ctrl.dma_mem_write(self.queue_addr, &src[..len]);
            self.queue_addr += len as u32;
            self.queue_len -= len as u32;
        }

        // proceed with the program once the buffer is exhausted
        if self.queue_len == 0 {
            self.interpret_cmd();
        }

        true
    }

    // ── State transitions ─────────────────────────────────────

    fn start(&mut self) {
        if self.ch_stat & ChStat::PAUSE.bits() != 0 {
            log::warn!("{}: Cannot start DMA channel, PAUSE bit is set", self.name);
            return;
        }
        self.queue_len = 0;
        if let Some(cb) = self.start_cb.clone() {
            (cb.borrow_mut())();
        }
    }

    fn resume(&mut self) {
        if self.ch_stat & ChStat::PAUSE.bits() != 0 {
            log::warn!("{}: Cannot resume DMA channel, PAUSE bit is set", self.name);
            return;
        }
        log::info!("{}: Resuming DMA channel", self.name);
    }

    fn abort(&mut self) {
        log::trace!("{}: Aborting DMA channel", self.name);
        if let Some(cb) = self.stop_cb.clone() {
            (cb.borrow_mut())();
        }
    }

    fn pause(&mut self) {
        log::info!("{}: Pausing DMA channel", self.name);
        if let Some(cb) = self.stop_cb.clone() {
            (cb.borrow_mut())();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memctrl::MemCtrl;

    fn make_channel() -> (DmaChannel, MemCtrlRef) {
        let mem = MemCtrl::new();
        mem.add_ram_region(0, 0x10000).unwrap();
        let ch = DmaChannel::new("test_dma", mem.clone());
        (ch, mem)
    }

    fn write_desc(
        mem: &MemCtrlRef,
        at: u32,
        cmd: u8,
        req_count: u16,
        address: u32,
        cmd_dep: u32,
        int_bits: u8,
        branch_bits: u8,
    ) {
        let command: u16 =
            ((cmd as u16) << 12) | ((int_bits as u16) << 4) | ((branch_bits as u16) << 2);
        let mut desc = [0u8; 16];
        desc[0..2].copy_from_slice(&req_count.to_le_bytes());
        desc[2..4].copy_from_slice(&command.to_le_bytes());
        desc[4..8].copy_from_slice(&address.to_le_bytes());
        desc[8..12].copy_from_slice(&cmd_dep.to_le_bytes());
        mem.dma_mem_write(at, &desc);
    }

    /// Guest-style dword write: the register file is little-endian.
    fn guest_write(ch: &mut DmaChannel, offset: u32, value: u32) {
        ch.reg_write(offset, value.swap_bytes(), 4);
    }

    #[test]
    fn output_program_pulls_concatenated_buffers() {
        let (mut ch, mem) = make_channel();

        mem.dma_mem_write(0x1000, &[0xAA; 16]);
        mem.dma_mem_write(0x1100, &[0xBB; 8]);
        write_desc(&mem, 0x2000, dbdma_cmd::OUTPUT_MORE, 16, 0x1000, 0, 0, 0);
        write_desc(&mem, 0x2010, dbdma_cmd::OUTPUT_LAST, 8, 0x1100, 0, 0, 0);
        write_desc(&mem, 0x2020, dbdma_cmd::STOP, 0, 0, 0, 0, 0);

        guest_write(&mut ch, dma_reg::CMD_PTR_LO, 0x2000);
        guest_write(&mut ch, dma_reg::CH_CTRL, 0x8000_8000); // set RUN

        let (res, data) = ch.pull_data(10);
        assert_eq!(res, DmaPullResult::MoreData);
        assert_eq!(data, vec![0xAA; 10]);

        let (res, data) = ch.pull_data(64);
        assert_eq!(res, DmaPullResult::MoreData);
        assert_eq!(data, vec![0xAA; 6]);

        let (res, data) = ch.pull_data(64);
        assert_eq!(res, DmaPullResult::MoreData);
        assert_eq!(data, vec![0xBB; 8]);

        // program exhausted: STOP clears ACTIVE, no further data
        let (res, data) = ch.pull_data(1);
        assert_eq!(res, DmaPullResult::NoMoreData);
        assert!(data.is_empty());
        assert_eq!(ch.ch_stat() & ChStat::ACTIVE.bits(), 0);
    }

    #[test]
    fn input_program_receives_pushed_bytes() {
        let (mut ch, mem) = make_channel();

        write_desc(&mem, 0x2000, dbdma_cmd::INPUT_LAST, 8, 0x3000, 0, 0, 0);
        write_desc(&mem, 0x2010, dbdma_cmd::STOP, 0, 0, 0, 0, 0);

        guest_write(&mut ch, dma_reg::CMD_PTR_LO, 0x2000);
        guest_write(&mut ch, dma_reg::CH_CTRL, 0x8000_8000);

        assert!(ch.push_data(&[1, 2, 3, 4, 5, 6, 7, 8]));

        let mut buf = [0u8; 8];
        mem.dma_mem_read(0x3000, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);

        // residual count of the completed descriptor is zero
        let mut res = [0u8; 2];
        mem.dma_mem_read(0x2000 + 12, &mut res);
        assert_eq!(u16::from_le_bytes(res), 0);

        // xfer_status was written with ACTIVE set
        let mut stat = [0u8; 2];
        mem.dma_mem_read(0x2000 + 14, &mut stat);
        assert_ne!(u16::from_le_bytes(stat) & ChStat::ACTIVE.bits(), 0);
    }

    #[test]
    fn branch_if_s7_set() {
        let (mut ch, mem) = make_channel();

        mem.dma_mem_write(0x1000, &[0xCC; 16]);
        // branch mode 3: always taken, comparator bypassed
        write_desc(
            &mem,
            0x2000,
            dbdma_cmd::OUTPUT_MORE,
            16,
            0x1000,
            0x4000,
            0,
            3,
        );
        write_desc(&mem, 0x4000, dbdma_cmd::STOP, 0, 0, 0, 0, 0);
        write_desc(&mem, 0x2010, dbdma_cmd::STOP, 0, 0, 0, 0, 0);

        guest_write(&mut ch, dma_reg::CMD_PTR_LO, 0x2000);
        // branch on s7: mask 0x0080, value 0x0080
        guest_write(&mut ch, dma_reg::BRANCH_SELECT, 0x0080_0080);
        // set s7 together with RUN
        guest_write(&mut ch, dma_reg::CH_CTRL, 0x8080_8080);

        let (_, data) = ch.pull_data(16);
        assert_eq!(data.len(), 16);
        let _ = ch.pull_data(1);
        // branch always taken: cmd_ptr followed cmd_dep to 0x4000
        assert_eq!(ch.cmd_ptr(), 0x4000);
    }

    #[test]
    fn branch_conditional_not_taken_when_s7_clear() {
        let (mut ch, mem) = make_channel();

        mem.dma_mem_write(0x1000, &[0xCC; 16]);
        // branch mode 1: branch if condition set
        write_desc(
            &mem,
            0x2000,
            dbdma_cmd::OUTPUT_MORE,
            16,
            0x1000,
            0x4000,
            0,
            1,
        );
        write_desc(&mem, 0x2010, dbdma_cmd::STOP, 0, 0, 0, 0, 0);
        write_desc(&mem, 0x4000, dbdma_cmd::STOP, 0, 0, 0, 0, 0);

        guest_write(&mut ch, dma_reg::CMD_PTR_LO, 0x2000);
        guest_write(&mut ch, dma_reg::BRANCH_SELECT, 0x0080_0080);
        guest_write(&mut ch, dma_reg::CH_CTRL, 0x8000_8000); // s7 stays clear

        let (_, data) = ch.pull_data(16);
        assert_eq!(data.len(), 16);
        let _ = ch.pull_data(1);
        // condition false: fall through to the next descriptor
        assert_eq!(ch.cmd_ptr(), 0x2010);
    }

    #[test]
    fn unsupported_command_sets_dead() {
        let (mut ch, mem) = make_channel();

        // command nibble 9 is undefined
        write_desc(&mem, 0x2000, 9, 4, 0x3000, 0, 0, 0);
        guest_write(&mut ch, dma_reg::CMD_PTR_LO, 0x2000);
        guest_write(&mut ch, dma_reg::CH_CTRL, 0x8000_8000);

        let (res, _) = ch.pull_data(4);
        assert_eq!(res, DmaPullResult::NoMoreData);
        assert_ne!(ch.ch_stat() & ChStat::DEAD.bits(), 0);
        assert_eq!(ch.ch_stat() & ChStat::ACTIVE.bits(), 0);
    }

    #[test]
    fn cmd_ptr_ignored_while_running() {
        let (mut ch, mem) = make_channel();
        write_desc(&mem, 0x2000, dbdma_cmd::STOP, 0, 0, 0, 0, 0);

        guest_write(&mut ch, dma_reg::CMD_PTR_LO, 0x2000);
        guest_write(&mut ch, dma_reg::CH_CTRL, 0x8000_8000);
        guest_write(&mut ch, dma_reg::CMD_PTR_LO, 0x5000);
        assert_eq!(ch.cmd_ptr(), 0x2000);

        // clearing RUN allows the latch again
        guest_write(&mut ch, dma_reg::CH_CTRL, 0x8000_0000);
        guest_write(&mut ch, dma_reg::CMD_PTR_LO, 0x5000);
        assert_eq!(ch.cmd_ptr(), 0x5000);
    }

    #[test]
    #[should_panic]
    fn non_dword_access_panics() {
        let (mut ch, _mem) = make_channel();
        ch.reg_read(dma_reg::CH_STAT, 2);
    }

    #[test]
    fn ch_stat_reads_as_little_endian_dword() {
        let (mut ch, mem) = make_channel();
        write_desc(&mem, 0x2000, dbdma_cmd::STOP, 0, 0, 0, 0, 0);
        guest_write(&mut ch, dma_reg::CMD_PTR_LO, 0x2000);
        guest_write(&mut ch, dma_reg::CH_CTRL, 0x8000_8000);

        let raw = ch.reg_read(dma_reg::CH_STAT, 4);
        let stat = raw.swap_bytes() as u16;
        assert_ne!(stat & ChStat::RUN.bits(), 0);
        assert_ne!(stat & ChStat::ACTIVE.bits(), 0);
    }
}
