//! Generic SCSI hard disk target.
//!
//! Serves the block-command subset the Old World firmware and Mac OS
//! drivers actually issue against the fabric. The medium is a plain byte
//! image supplied by the disk-image collaborator.

use crate::impl_scsi_device_for_target;

use super::device::{ScsiTargetDevice, TargetState};
use super::{scsi_cmd, scsi_error, scsi_status, ScsiPhase, ScsiSense};

const SECTOR_SIZE: usize = 512;

const VENDOR_ID: &[u8; 8] = b"QUANTUM ";
const PRODUCT_ID: &[u8; 16] = b"Emulated Disk   ";
const REVISION_ID: &[u8; 4] = b"di01";

pub struct ScsiHardDisk {
    state: TargetState,
    img: Vec<u8>,

    sense_key: ScsiSense,
    asc: u8,

    /// Write-back bookkeeping for DATA_OUT commands.
    write_lba: u32,
    write_blocks: u32,
}

impl ScsiHardDisk {
    pub fn new(name: &str, scsi_id: usize) -> Self {
        Self {
            state: TargetState::new(name, scsi_id),
            img: Vec::new(),
            sense_key: ScsiSense::NoSense,
            asc: scsi_error::NO_ERROR,
            write_lba: 0,
            write_blocks: 0,
        }
    }

    /// Attach a medium. The image is padded up to a full sector.
    pub fn insert_image(&mut self, mut img: Vec<u8>) {
        let rem = img.len() % SECTOR_SIZE;
        if rem != 0 {
            img.resize(img.len() + SECTOR_SIZE - rem, 0);
        }
        if img.len() / SECTOR_SIZE > 0xFF_FFFF {
            panic!("{}: image file too large", self.state.name);
        }
        self.img = img;
    }

    pub fn image(&self) -> &[u8] {
        &self.img
    }

    fn size_blocks(&self) -> u32 {
        (self.img.len() / SECTOR_SIZE) as u32
    }

    fn set_error(&mut self, sense_key: ScsiSense, asc: u8) {
        self.sense_key = sense_key;
        self.asc = asc;
        self.state.set_status(scsi_status::CHECK_CONDITION);
    }

    fn lba(&self) -> u32 {
        let cdb = &self.state.cmd_buf;
        match cdb[0] >> 5 {
            0 => (((cdb[1] & 0x1F) as u32) << 16) | ((cdb[2] as u32) << 8) | cdb[3] as u32,
            _ => u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]),
        }
    }

    fn xfer_blocks(&self) -> u32 {
        let cdb = &self.state.cmd_buf;
        match cdb[0] >> 5 {
            // zero transfer length means 256 blocks for group-0 commands
            0 => {
                if cdb[4] == 0 {
                    256
                } else {
                    cdb[4] as u32
                }
            }
            _ => ((cdb[7] as u32) << 8) | cdb[8] as u32,
        }
    }

    // ── Command implementations ───────────────────────────────

    fn inquiry(&mut self) -> ScsiPhase {
        let alloc_len = self.state.cmd_buf[4] as usize;
        let mut resp = vec![0u8; 36];
        resp[0] = 0; // direct access device
        resp[1] = 0; // non-removable medium
        resp[2] = 2; // ANSI version: SCSI-2
        resp[3] = 2; // response data format: SCSI-2
        resp[4] = 31; // additional length
        resp[7] = 1 << 4; // supports synchronous transfers
        resp[8..16].copy_from_slice(VENDOR_ID);
        resp[16..32].copy_from_slice(PRODUCT_ID);
        resp[32..36].copy_from_slice(REVISION_ID);
        resp.truncate(alloc_len.max(5).min(36));

        let len = resp.len();
        self.state.data_buf = resp;
        self.state.set_xfer_len(len);
        ScsiPhase::DataIn
    }

    fn request_sense(&mut self) -> ScsiPhase {
        let alloc_len = (self.state.cmd_buf[4] as usize).min(18);
        let mut resp = vec![0u8; 18];
        resp[0] = 0x70; // fixed format, current error
        resp[2] = self.sense_key as u8;
        resp[7] = 10; // additional sense length
        resp[12] = self.asc;
        resp.truncate(alloc_len);

        // sense data is cleared by reporting it
        self.sense_key = ScsiSense::NoSense;
        self.asc = scsi_error::NO_ERROR;

        let len = resp.len();
        self.state.data_buf = resp;
        self.state.set_xfer_len(len);
        ScsiPhase::DataIn
    }

    fn mode_sense(&mut self) -> ScsiPhase {
        let page_code = self.state.cmd_buf[2] & 0x3F;
        let alloc_len = self.state.cmd_buf[4] as usize;

        let mut resp = vec![0u8; 4];
        resp[3] = 8; // block descriptor length

        // block descriptor
        let blocks = self.size_blocks();
        resp.extend_from_slice(&(blocks & 0xFF_FFFF).to_be_bytes());
        resp.extend_from_slice(&(SECTOR_SIZE as u32 & 0xFF_FFFF).to_be_bytes());

        match page_code {
            0x01 => {
                // error recovery page
                resp.extend_from_slice(&[0x01, 6, 0, 0, 0, 0, 0, 0]);
            }
            0x30 => {
                // Apple copyright page
                resp.extend_from_slice(&[0x30, 22]);
                resp.extend_from_slice(b"APPLE COMPUTER, INC   ");
            }
            _ => {
                self.set_error(ScsiSense::IllegalReq, scsi_error::INVALID_CDB);
                return ScsiPhase::Status;
            }
        }
        resp[0] = (resp.len() - 1) as u8; // mode data length

        resp.truncate(alloc_len.max(4));
        let len = resp.len();
        self.state.data_buf = resp;
        self.state.set_xfer_len(len);
        ScsiPhase::DataIn
    }

    fn read_capacity(&mut self) -> ScsiPhase {
        if self.img.is_empty() {
            self.set_error(ScsiSense::NotReady, scsi_error::MEDIUM_NOT_PRESENT);
            return ScsiPhase::Status;
        }
        let mut resp = Vec::with_capacity(8);
        resp.extend_from_slice(&(self.size_blocks() - 1).to_be_bytes());
        resp.extend_from_slice(&(SECTOR_SIZE as u32).to_be_bytes());
        self.state.data_buf = resp;
        self.state.set_xfer_len(8);
        ScsiPhase::DataIn
    }

    fn read(&mut self) -> ScsiPhase {
        let lba = self.lba();
        let nblocks = self.xfer_blocks();
        if nblocks == 0 {
            log::warn!("{}: skip data transfer because nblocks = 0", self.state.name);
            return ScsiPhase::Status;
        }
        if lba + nblocks > self.size_blocks() {
            self.set_error(ScsiSense::IllegalReq, scsi_error::INVALID_LBA);
            return ScsiPhase::Status;
        }

        let start = lba as usize * SECTOR_SIZE;
        let end = start + nblocks as usize * SECTOR_SIZE;
        self.state.data_buf = self.img[start..end].to_vec();
        self.state.set_xfer_len(end - start);
        ScsiPhase::DataIn
    }

    fn write(&mut self) -> ScsiPhase {
        let lba = self.lba();
        let nblocks = self.xfer_blocks();
        if nblocks == 0 {
            log::warn!("{}: skip data transfer because nblocks = 0", self.state.name);
            return ScsiPhase::Status;
        }
        if lba + nblocks > self.size_blocks() {
            self.set_error(ScsiSense::IllegalReq, scsi_error::INVALID_LBA);
            return ScsiPhase::Status;
        }

        self.write_lba = lba;
        self.write_blocks = nblocks;
        self.state.expect_data(nblocks as usize * SECTOR_SIZE);
        self.state.arm_post_xfer_action();
        ScsiPhase::DataOut
    }
}

impl ScsiTargetDevice for ScsiHardDisk {
    fn state(&self) -> &TargetState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut TargetState {
        &mut self.state
    }

    fn prepare_data(&mut self) -> bool {
        true
    }

    fn get_more_data(&mut self) -> bool {
        false
    }

    fn process_command(&mut self) {
        // assume successful command execution
        self.state.set_status(scsi_status::GOOD);
        self.state.msg_buf[0] = super::scsi_message::COMMAND_COMPLETE;

        let opcode = self.state.cmd_buf[0];
        let next_phase = match opcode {
            scsi_cmd::TEST_UNIT_READY => ScsiPhase::Status,
            scsi_cmd::REQ_SENSE => self.request_sense(),
            scsi_cmd::INQUIRY => self.inquiry(),
            scsi_cmd::MODE_SENSE_6 => self.mode_sense(),
            scsi_cmd::READ_CAPACITY_10 => self.read_capacity(),
            scsi_cmd::READ_6 | scsi_cmd::READ_10 => self.read(),
            scsi_cmd::WRITE_6 | scsi_cmd::WRITE_10 => self.write(),
            _ => {
                log::error!("{}: unsupported opcode 0x{:02X}", self.state.name, opcode);
                self.set_error(ScsiSense::IllegalReq, scsi_error::INVALID_CMD);
                ScsiPhase::Status
            }
        };

        super::device::switch_phase(self, next_phase);
    }

    fn post_xfer_action(&mut self) {
        // commit the received sectors to the medium
        let start = self.write_lba as usize * SECTOR_SIZE;
        let len = self.write_blocks as usize * SECTOR_SIZE;
        let data: Vec<u8> = self.state.data_buf[..len].to_vec();
        self.img[start..start + len].copy_from_slice(&data);
    }
}

impl_scsi_device_for_target!(ScsiHardDisk);
