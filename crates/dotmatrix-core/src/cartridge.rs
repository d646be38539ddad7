use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use thiserror::Error;

use crate::host::SystemHost;

/// Size of one ROM bank as visible through the two 16 KiB CPU windows.
pub const ROM_BANK_SIZE: usize = 0x4000;

/// Size of the external RAM window at 0xA000-0xBFFF.
pub const ERAM_BANK_SIZE: usize = 0x2000;

/// The header spans 0x0100-0x014F.
const HEADER_END: usize = 0x0150;

/// Length of the persisted RTC record.
pub const RTC_RECORD_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CartridgeError {
    #[error("failed to read cartridge header")]
    HeaderRead,
    #[error("unknown cartridge type: {0:#04X}")]
    UnknownCartridgeType(u8),
    #[error("unknown rom size code: {0:#04X}")]
    UnknownRomSize(u8),
    #[error("unknown ram size code: {0:#04X}")]
    UnknownRamSize(u8),
    #[error("ROM bank {0} is truncated")]
    BankReadShort(u32),
    #[error("{0} mapper is not implemented")]
    UnsupportedMbc(MbcKind),
    #[error("{0} mapper failed initialization: {1}")]
    MbcInit(MbcKind, &'static str),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SaveStateError {
    #[error("save state CRC {found:#010X} does not match cartridge CRC {expected:#010X}")]
    CrcMismatch { expected: u32, found: u32 },
    #[error("save state external RAM size {found} does not match cartridge ({expected})")]
    RamSizeMismatch { expected: u32, found: u32 },
    #[error("save state MBC tag {found} does not match cartridge ({expected})")]
    MbcMismatch { expected: u32, found: u32 },
    #[error("MBC state body is invalid")]
    MbcBody,
    #[error("MBC trailer tag mismatch")]
    TrailerMismatch,
    #[error("save state ends prematurely")]
    Truncated,
}

/// Memory bank controller families named by the header type byte.
///
/// The header table below covers every id real cartridges used;
/// only None/MBC1/MBC3/MBC5 have mapper logic here, the rest are rejected
/// with [`CartridgeError::UnsupportedMbc`] at load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MbcKind {
    None,
    Mbc1,
    Mbc2,
    Mbc3,
    Mbc4,
    Mbc5,
    Mmm01,
}

impl MbcKind {
    /// Save-state discriminant. Values are part of the on-disk format.
    const fn tag(self) -> u32 {
        match self {
            MbcKind::None => 0,
            MbcKind::Mbc1 => 1,
            MbcKind::Mbc2 => 2,
            MbcKind::Mbc3 => 3,
            MbcKind::Mbc4 => 4,
            MbcKind::Mbc5 => 5,
            MbcKind::Mmm01 => 6,
        }
    }
}

impl std::fmt::Display for MbcKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MbcKind::None => "MBC_NONE",
            MbcKind::Mbc1 => "MBC1",
            MbcKind::Mbc2 => "MBC2",
            MbcKind::Mbc3 => "MBC3",
            MbcKind::Mbc4 => "MBC4",
            MbcKind::Mbc5 => "MBC5",
            MbcKind::Mmm01 => "MMM01",
        };
        f.write_str(name)
    }
}

/// Header-derived cartridge descriptor.
#[derive(Debug)]
pub struct CartridgeTypeInfo {
    pub id: u8,
    pub mbc: MbcKind,
    pub has_ram: bool,
    pub has_battery: bool,
    pub has_timer: bool,
    pub has_rumble: bool,
    pub description: &'static str,
}

// https://gbdev.io/pandocs/The_Cartridge_Header.html
#[rustfmt::skip]
const CART_TYPE_INFOS: &[CartridgeTypeInfo] = &[
    // id          mbc              ram    battery timer  rumble
    CartridgeTypeInfo { id: 0x00, mbc: MbcKind::None,  has_ram: false, has_battery: false, has_timer: false, has_rumble: false, description: "ROM ONLY" },
    CartridgeTypeInfo { id: 0x01, mbc: MbcKind::Mbc1,  has_ram: false, has_battery: false, has_timer: false, has_rumble: false, description: "MBC1" },
    CartridgeTypeInfo { id: 0x02, mbc: MbcKind::Mbc1,  has_ram: true,  has_battery: false, has_timer: false, has_rumble: false, description: "MBC1+RAM" },
    CartridgeTypeInfo { id: 0x03, mbc: MbcKind::Mbc1,  has_ram: true,  has_battery: true,  has_timer: false, has_rumble: false, description: "MBC1+RAM+BATTERY" },
    CartridgeTypeInfo { id: 0x05, mbc: MbcKind::Mbc2,  has_ram: false, has_battery: false, has_timer: false, has_rumble: false, description: "MBC2" },
    CartridgeTypeInfo { id: 0x06, mbc: MbcKind::Mbc2,  has_ram: false, has_battery: true,  has_timer: false, has_rumble: false, description: "MBC2+BATTERY" },
    CartridgeTypeInfo { id: 0x08, mbc: MbcKind::None,  has_ram: true,  has_battery: false, has_timer: false, has_rumble: false, description: "ROM+RAM" },
    CartridgeTypeInfo { id: 0x09, mbc: MbcKind::None,  has_ram: true,  has_battery: true,  has_timer: false, has_rumble: false, description: "ROM+RAM+BATTERY" },
    CartridgeTypeInfo { id: 0x0B, mbc: MbcKind::Mmm01, has_ram: false, has_battery: false, has_timer: false, has_rumble: false, description: "MMM01" },
    CartridgeTypeInfo { id: 0x0C, mbc: MbcKind::Mmm01, has_ram: true,  has_battery: false, has_timer: false, has_rumble: false, description: "MMM01+RAM" },
    CartridgeTypeInfo { id: 0x0D, mbc: MbcKind::Mmm01, has_ram: true,  has_battery: true,  has_timer: false, has_rumble: false, description: "MMM01+RAM+BATTERY" },
    CartridgeTypeInfo { id: 0x0F, mbc: MbcKind::Mbc3,  has_ram: false, has_battery: true,  has_timer: true,  has_rumble: false, description: "MBC3+TIMER+BATTERY" },
    CartridgeTypeInfo { id: 0x10, mbc: MbcKind::Mbc3,  has_ram: true,  has_battery: true,  has_timer: true,  has_rumble: false, description: "MBC3+TIMER+RAM+BATTERY" },
    CartridgeTypeInfo { id: 0x11, mbc: MbcKind::Mbc3,  has_ram: false, has_battery: false, has_timer: false, has_rumble: false, description: "MBC3" },
    CartridgeTypeInfo { id: 0x12, mbc: MbcKind::Mbc3,  has_ram: true,  has_battery: false, has_timer: false, has_rumble: false, description: "MBC3+RAM" },
    CartridgeTypeInfo { id: 0x13, mbc: MbcKind::Mbc3,  has_ram: true,  has_battery: true,  has_timer: false, has_rumble: false, description: "MBC3+RAM+BATTERY" },
    CartridgeTypeInfo { id: 0x15, mbc: MbcKind::Mbc4,  has_ram: false, has_battery: false, has_timer: false, has_rumble: false, description: "MBC4" },
    CartridgeTypeInfo { id: 0x16, mbc: MbcKind::Mbc4,  has_ram: true,  has_battery: false, has_timer: false, has_rumble: false, description: "MBC4+RAM" },
    CartridgeTypeInfo { id: 0x17, mbc: MbcKind::Mbc4,  has_ram: true,  has_battery: true,  has_timer: false, has_rumble: false, description: "MBC4+RAM+BATTERY" },
    CartridgeTypeInfo { id: 0x19, mbc: MbcKind::Mbc5,  has_ram: false, has_battery: false, has_timer: false, has_rumble: false, description: "MBC5" },
    CartridgeTypeInfo { id: 0x1A, mbc: MbcKind::Mbc5,  has_ram: true,  has_battery: false, has_timer: false, has_rumble: false, description: "MBC5+RAM" },
    CartridgeTypeInfo { id: 0x1B, mbc: MbcKind::Mbc5,  has_ram: true,  has_battery: true,  has_timer: false, has_rumble: false, description: "MBC5+RAM+BATTERY" },
    CartridgeTypeInfo { id: 0x1C, mbc: MbcKind::Mbc5,  has_ram: false, has_battery: false, has_timer: false, has_rumble: true,  description: "MBC5+RUMBLE" },
    CartridgeTypeInfo { id: 0x1D, mbc: MbcKind::Mbc5,  has_ram: true,  has_battery: false, has_timer: false, has_rumble: true,  description: "MBC5+RUMBLE+RAM" },
    CartridgeTypeInfo { id: 0x1E, mbc: MbcKind::Mbc5,  has_ram: true,  has_battery: true,  has_timer: false, has_rumble: true,  description: "MBC5+RUMBLE+RAM+BATTERY" },
];

const ERAM_SIZES: [u32; 6] = [0, 2048, 8192, 32768, 65536, 131072];

#[rustfmt::skip]
const ROM_BANK_COUNTS: &[(u8, u32)] = &[
    (0x00, 2),
    (0x01, 4),   (0x02, 8),   (0x03, 16), (0x04, 32), (0x05, 64),
    (0x06, 128), (0x07, 256), (0x52, 72), (0x53, 80), (0x54, 96),
];

/// Borrowed view of the 80-byte cartridge header at 0x0100.
struct Header<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> {
    fn parse(data: &'a [u8]) -> Result<Self, CartridgeError> {
        if data.len() < HEADER_END {
            return Err(CartridgeError::HeaderRead);
        }
        Ok(Self { data })
    }

    fn title(&self) -> String {
        header_string(&self.data[0x0134..0x0144])
    }

    /// CGB carts shorten the title field to make room for the manufacturer
    /// code and CGB flag.
    fn cgb_title(&self) -> String {
        header_string(&self.data[0x0134..0x013F])
    }

    fn name(&self) -> String {
        if self.cgb_flag() & 0xC0 != 0 {
            self.cgb_title()
        } else {
            self.title()
        }
    }

    fn cgb_flag(&self) -> u8 {
        self.data[0x0143]
    }

    fn sgb_flag(&self) -> u8 {
        self.data[0x0146]
    }

    fn cart_type(&self) -> u8 {
        self.data[0x0147]
    }

    fn rom_size_code(&self) -> u8 {
        self.data[0x0148]
    }

    fn ram_size_code(&self) -> u8 {
        self.data[0x0149]
    }

    fn region_code(&self) -> u8 {
        self.data[0x014A]
    }

    fn licensee_code(&self) -> u8 {
        self.data[0x014B]
    }

    fn rom_version(&self) -> u8 {
        self.data[0x014C]
    }

    fn header_checksum(&self) -> u8 {
        self.data[0x014D]
    }

    fn cartridge_checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[0x014E], self.data[0x014F]])
    }
}

fn header_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// MBC3 real-time clock.
///
/// Stored as an absolute base timestamp plus offset fields, so the clock
/// keeps running while the emulator is closed. While halted (DH bit 6) the
/// base clock is frozen: the elapsed time is folded into the offsets and
/// `active` goes false, so the readable value stops moving.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RtcState {
    pub base_time_unix: u64,
    /// Bits 0-8 are the day counter; bit 9 doubles as the day-carry flag.
    pub offset_days: u16,
    pub offset_hours: u8,
    pub offset_minutes: u8,
    pub offset_seconds: u8,
    pub active: bool,
}

#[derive(Clone, Copy, Debug)]
struct RtcValue {
    seconds: u32,
    minutes: u32,
    hours: u32,
    days: u32,
}

impl RtcState {
    fn new(now_unix: u64) -> Self {
        Self {
            base_time_unix: now_unix,
            active: true,
            ..Default::default()
        }
    }

    fn total_offset_seconds(&self) -> u64 {
        self.offset_seconds as u64
            + self.offset_minutes as u64 * 60
            + self.offset_hours as u64 * 3600
            + self.offset_days as u64 * 86400
    }

    fn value_at(&self, now_unix: u64) -> RtcValue {
        let mut diff = self.total_offset_seconds();
        if self.active {
            diff += now_unix.saturating_sub(self.base_time_unix);
        }
        RtcValue {
            seconds: (diff % 60) as u32,
            minutes: ((diff / 60) % 60) as u32,
            hours: ((diff / 3600) % 24) as u32,
            days: (diff / 86400) as u32,
        }
    }

    /// Latched register bytes S, M, H, DL, DH.
    fn latch(&self, now_unix: u64) -> [u8; 5] {
        let v = self.value_at(now_unix);
        let mut dh = ((v.days >> 8) & 0x01) as u8;
        dh |= ((v.days >= 512) as u8) << 7;
        [v.seconds as u8, v.minutes as u8, v.hours as u8, (v.days & 0xFF) as u8, dh]
    }

    /// Halt or resume the clock. Halting folds the running elapsed time
    /// into the offset fields so the value freezes in place; resuming
    /// rebases the clock on `now_unix` and continues from there.
    fn set_halted(&mut self, halted: bool, now_unix: u64) {
        if halted && self.active {
            let v = self.value_at(now_unix);
            self.offset_seconds = v.seconds as u8;
            self.offset_minutes = v.minutes as u8;
            self.offset_hours = v.hours as u8;
            self.offset_days = v.days.min(u16::MAX as u32) as u16;
            self.base_time_unix = now_unix;
            self.active = false;
        } else if !halted && !self.active {
            self.base_time_unix = now_unix;
            self.active = true;
        }
    }

    fn serialize(&self) -> [u8; RTC_RECORD_LEN] {
        let mut out = [0u8; RTC_RECORD_LEN];
        out[0..8].copy_from_slice(&self.base_time_unix.to_le_bytes());
        out[8..10].copy_from_slice(&self.offset_days.to_le_bytes());
        out[10] = self.offset_hours;
        out[11] = self.offset_minutes;
        out[12] = self.offset_seconds;
        out[13] = self.active as u8;
        out
    }

    fn from_record(data: &[u8]) -> Option<Self> {
        if data.len() < RTC_RECORD_LEN {
            return None;
        }
        Some(Self {
            base_time_unix: u64::from_le_bytes(data[0..8].try_into().ok()?),
            offset_days: u16::from_le_bytes([data[8], data[9]]),
            offset_hours: data[10],
            offset_minutes: data[11],
            offset_seconds: data[12],
            active: data[13] != 0,
        })
    }
}

#[derive(Debug, Default)]
struct Mbc1State {
    ram_enable: bool,
    bank_mode: u8,
    rom_bank_number: u8,
    ram_bank_number: u8,
    active_rom_bank: u8,
    active_ram_bank: u8,
}

impl Mbc1State {
    fn reset(&mut self, num_rom_banks: usize) {
        self.ram_enable = false;
        self.bank_mode = 0;
        self.rom_bank_number = 1;
        self.ram_bank_number = 0;
        self.update_active_banks(num_rom_banks);
    }

    /// Recompute the active banks after a control write.
    ///
    /// Mode 0 forms a 7-bit ROM selector from the two registers; mode 1
    /// splits them into independent ROM and RAM selectors. Banks 0x00,
    /// 0x20, 0x40 and 0x60 are unmappable and select the next bank up.
    fn update_active_banks(&mut self, num_rom_banks: usize) {
        if self.bank_mode == 0 {
            self.active_ram_bank = 0;
            self.active_rom_bank = (self.ram_bank_number << 5) | (self.rom_bank_number & 0x1F);
        } else {
            self.active_ram_bank = self.ram_bank_number & 0x03;
            self.active_rom_bank = self.rom_bank_number & 0x1F;
        }

        if matches!(self.active_rom_bank, 0x00 | 0x20 | 0x40 | 0x60) {
            self.active_rom_bank += 1;
        }

        if self.active_rom_bank as usize >= num_rom_banks {
            warn!(
                "MBC1 ROM bank out of range ({} / {})",
                self.active_rom_bank, num_rom_banks
            );
            self.active_rom_bank = (num_rom_banks - 1) as u8;
        }
    }

    /// Handle a 0x0000-0x7FFF control write. Returns `true` when the RAM
    /// enable latch transitioned enabled -> disabled.
    fn control_write(&mut self, addr: u16, value: u8, num_rom_banks: usize) -> bool {
        match addr & 0xF000 {
            0x0000 | 0x1000 => {
                let was_enabled = self.ram_enable;
                self.ram_enable = value & 0x0F == 0x0A;
                return was_enabled && !self.ram_enable;
            }
            0x2000 | 0x3000 => {
                self.rom_bank_number = value & 0x1F;
                self.update_active_banks(num_rom_banks);
            }
            0x4000 | 0x5000 => {
                self.ram_bank_number = value & 0x03;
                self.update_active_banks(num_rom_banks);
            }
            0x6000 | 0x7000 => {
                self.bank_mode = value & 0x01;
                self.update_active_banks(num_rom_banks);
            }
            _ => unreachable!(),
        }
        false
    }
}

#[derive(Debug, Default)]
struct Mbc3State {
    ram_rtc_enable: bool,
    rom_bank_number: u8,
    /// 0x00-0x07 select a RAM bank, 0x08-0x0C an RTC register.
    ram_bank_number: u8,
    rtc_latch_prev: u8,
    rtc_latched: [u8; 5],
}

impl Mbc3State {
    fn reset(&mut self, num_rom_banks: usize) {
        self.ram_rtc_enable = false;
        self.rom_bank_number = 1;
        self.ram_bank_number = 0;
        self.rtc_latch_prev = 0;
        self.update_active_banks(num_rom_banks);
    }

    fn update_active_banks(&mut self, num_rom_banks: usize) {
        // Writing 0 selects bank 1, like MBC1 but over the full 7 bits.
        if self.rom_bank_number == 0 {
            self.rom_bank_number = 1;
        }

        if self.rom_bank_number as usize >= num_rom_banks {
            warn!(
                "MBC3 ROM bank out of range ({} / {})",
                self.rom_bank_number, num_rom_banks
            );
            self.rom_bank_number = (num_rom_banks - 1) as u8;
        }
    }

    fn control_write(
        &mut self,
        addr: u16,
        value: u8,
        num_rom_banks: usize,
        rtc: Option<&RtcState>,
    ) -> bool {
        match addr & 0xF000 {
            0x0000 | 0x1000 => {
                let was_enabled = self.ram_rtc_enable;
                self.ram_rtc_enable = value & 0x0F == 0x0A;
                return was_enabled && !self.ram_rtc_enable;
            }
            0x2000 | 0x3000 => {
                self.rom_bank_number = value & 0x7F;
                self.update_active_banks(num_rom_banks);
            }
            0x4000 | 0x5000 => {
                self.ram_bank_number = value;
            }
            0x6000 | 0x7000 => {
                // Writing 0x00 then 0x01 latches the current time.
                if self.rtc_latch_prev != 0x01 && value == 0x01 {
                    if let Some(rtc) = rtc {
                        self.rtc_latched = rtc.latch(unix_now());
                    }
                }
                self.rtc_latch_prev = value;
            }
            _ => unreachable!(),
        }
        false
    }
}

#[derive(Debug, Default)]
struct Mbc5State {
    ram_enable: bool,
    rom_bank_number: u16,
    ram_bank_number: u8,
    active_rom_bank: u16,
}

impl Mbc5State {
    fn reset(&mut self, num_rom_banks: usize) {
        self.ram_enable = false;
        self.rom_bank_number = 1;
        self.ram_bank_number = 0;
        self.update_active_banks(num_rom_banks);
    }

    fn update_active_banks(&mut self, num_rom_banks: usize) {
        // Unlike MBC1, bank 0 is mappable. The 9-bit selector arrives as
        // two separate writes, so a temporarily out-of-range value is
        // expected and just clamps.
        self.active_rom_bank = self.rom_bank_number;
        if self.active_rom_bank as usize >= num_rom_banks {
            self.active_rom_bank = (num_rom_banks - 1) as u16;
        }
    }

    fn control_write(&mut self, addr: u16, value: u8, num_rom_banks: usize, has_rumble: bool) -> bool {
        match addr & 0xF000 {
            0x0000 | 0x1000 => {
                let was_enabled = self.ram_enable;
                self.ram_enable = value & 0x0F == 0x0A;
                return was_enabled && !self.ram_enable;
            }
            0x2000 => {
                self.rom_bank_number = (self.rom_bank_number & 0x100) | value as u16;
                self.update_active_banks(num_rom_banks);
            }
            0x3000 => {
                self.rom_bank_number = (self.rom_bank_number & 0xFF) | (((value & 0x01) as u16) << 8);
                self.update_active_banks(num_rom_banks);
            }
            0x4000 | 0x5000 => {
                // On rumble carts bit 3 drives the motor instead of RAM
                // banking.
                self.ram_bank_number = if has_rumble { value & 0x07 } else { value & 0x0F };
            }
            0x6000 | 0x7000 => {
                warn!("MBC5 unhandled write to {addr:#06X} (value {value:#04X})");
            }
            _ => unreachable!(),
        }
        false
    }
}

/// Per-mapper state, tagged by controller family.
#[derive(Debug)]
enum MbcState {
    None,
    Mbc1(Mbc1State),
    Mbc3(Mbc3State),
    Mbc5(Mbc5State),
}

impl MbcState {
    fn kind(&self) -> MbcKind {
        match self {
            MbcState::None => MbcKind::None,
            MbcState::Mbc1(_) => MbcKind::Mbc1,
            MbcState::Mbc3(_) => MbcKind::Mbc3,
            MbcState::Mbc5(_) => MbcKind::Mbc5,
        }
    }
}

pub struct Cartridge {
    name: String,
    type_info: &'static CartridgeTypeInfo,
    /// Header CGB flag bit 7: the cart wants CGB hardware features.
    cgb: bool,
    rom_banks: Vec<Vec<u8>>,
    external_ram: Vec<u8>,
    external_ram_modified: bool,
    crc: u32,
    mbc: MbcState,
    rtc: Option<RtcState>,
}

impl Cartridge {
    /// Parse the header, slice the image into ROM banks, and pull battery
    /// RAM / RTC state from the host.
    pub fn load(data: &[u8], host: &mut dyn SystemHost) -> Result<Self, CartridgeError> {
        let crc = crc32fast::hash(data);

        let header = Header::parse(data)?;
        let name = header.name();

        info!("Cartridge info:");
        info!("  Title: {}", header.title());
        info!("  CGB Flag: {:#04X}", header.cgb_flag());
        info!("  SGB Flag: {:#04X}", header.sgb_flag());
        info!("  Type: {:#04X}", header.cart_type());
        info!("  ROM Size Code: {:#04X}", header.rom_size_code());
        info!("  RAM Size Code: {:#04X}", header.ram_size_code());
        info!("  Region Code: {:#04X}", header.region_code());
        info!("  Licensee Code: {:#04X}", header.licensee_code());
        info!("  ROM Version: {:#04X}", header.rom_version());
        info!("  Header Checksum: {:#04X}", header.header_checksum());
        info!("  Cartridge Checksum: {:#06X}", header.cartridge_checksum());

        let type_info = CART_TYPE_INFOS
            .iter()
            .find(|ti| ti.id == header.cart_type())
            .ok_or(CartridgeError::UnknownCartridgeType(header.cart_type()))?;

        info!("  Cartridge type description: {}", type_info.description);
        info!("    Memory bank controller: {}", type_info.mbc);
        info!("    External RAM: {}", if type_info.has_ram { "yes" } else { "no" });
        info!("    Battery: {}", if type_info.has_battery { "yes" } else { "no" });
        info!("    Timer: {}", if type_info.has_timer { "yes" } else { "no" });
        info!("    Rumble: {}", if type_info.has_rumble { "yes" } else { "no" });

        let mut num_rom_banks = ROM_BANK_COUNTS
            .iter()
            .find(|(code, _)| *code == header.rom_size_code())
            .map(|(_, count)| *count)
            .ok_or(CartridgeError::UnknownRomSize(header.rom_size_code()))?;

        let ram_size_code = header.ram_size_code();
        if ram_size_code as usize >= ERAM_SIZES.len() || (ram_size_code > 0 && !type_info.has_ram) {
            return Err(CartridgeError::UnknownRamSize(ram_size_code));
        }
        let external_ram_size = ERAM_SIZES[ram_size_code as usize] as usize;

        info!("  ROM Banks: {}", num_rom_banks);
        info!("  External ram size: {} bytes", external_ram_size);

        // Overdumped images are common; when the file carries more banks
        // than the header admits, trust the file size.
        if data.len() > ROM_BANK_SIZE * num_rom_banks as usize && type_info.mbc != MbcKind::None {
            num_rom_banks = (data.len() / ROM_BANK_SIZE) as u32;
            warn!(
                "ROM has extra bytes at end of bank space, recalculated banks: {}",
                num_rom_banks
            );
        }

        let mut rom_banks = Vec::with_capacity(num_rom_banks as usize);
        for i in 0..num_rom_banks {
            let start = i as usize * ROM_BANK_SIZE;
            let end = start + ROM_BANK_SIZE;
            let bank = data.get(start..end).ok_or(CartridgeError::BankReadShort(i))?;
            rom_banks.push(bank.to_vec());
        }

        let mbc = match type_info.mbc {
            MbcKind::None => {
                if rom_banks.len() != 2 {
                    return Err(CartridgeError::MbcInit(MbcKind::None, "expects exactly 2 ROM banks"));
                }
                MbcState::None
            }
            MbcKind::Mbc1 => {
                let mut s = Mbc1State::default();
                s.reset(rom_banks.len());
                MbcState::Mbc1(s)
            }
            MbcKind::Mbc3 => {
                let mut s = Mbc3State::default();
                s.reset(rom_banks.len());
                MbcState::Mbc3(s)
            }
            MbcKind::Mbc5 => {
                let mut s = Mbc5State::default();
                s.reset(rom_banks.len());
                MbcState::Mbc5(s)
            }
            other => return Err(CartridgeError::UnsupportedMbc(other)),
        };

        let mut cart = Self {
            name,
            type_info,
            cgb: header.cgb_flag() & 0x80 != 0,
            rom_banks,
            external_ram: vec![0; external_ram_size],
            external_ram_modified: false,
            crc,
            mbc,
            rtc: None,
        };

        cart.load_ram(host);
        cart.load_rtc(host);
        Ok(cart)
    }

    /// Pull battery RAM from the host. Without a battery the contents are
    /// ephemeral and nothing is loaded.
    fn load_ram(&mut self, host: &mut dyn SystemHost) {
        if self.external_ram.is_empty() || !self.type_info.has_battery {
            return;
        }

        if !host.load_cart_ram(&mut self.external_ram) {
            warn!("Failed to load external SRAM, blanking.");
            self.external_ram.fill(0);
        }
    }

    fn load_rtc(&mut self, host: &mut dyn SystemHost) {
        if !self.type_info.has_timer {
            return;
        }

        let mut record = [0u8; RTC_RECORD_LEN];
        if host.load_cart_rtc(&mut record)
            && let Some(rtc) = RtcState::from_record(&record)
        {
            self.rtc = Some(rtc);
        } else {
            // New cart: start the clock now and persist a fresh record.
            self.rtc = Some(RtcState::new(unix_now()));
            self.save_rtc(host);
        }
    }

    /// Persist battery RAM unconditionally and clear the dirty flag.
    pub fn save_ram(&mut self, host: &mut dyn SystemHost) {
        if !self.external_ram.is_empty() && self.type_info.has_battery {
            host.save_cart_ram(&self.external_ram);
        }
        self.external_ram_modified = false;
    }

    /// Persist battery RAM only when it changed since the last save.
    pub fn flush_battery(&mut self, host: &mut dyn SystemHost) {
        if self.external_ram_modified {
            self.save_ram(host);
        }
    }

    fn save_rtc(&self, host: &mut dyn SystemHost) {
        if let Some(rtc) = &self.rtc {
            host.save_cart_rtc(&rtc.serialize());
        }
    }

    /// Reset the mapper registers to power-on values. ROM, external RAM
    /// and the RTC survive a power cycle.
    pub fn reset(&mut self) {
        let num_rom_banks = self.rom_banks.len();
        match &mut self.mbc {
            MbcState::None => {}
            MbcState::Mbc1(s) => s.reset(num_rom_banks),
            MbcState::Mbc3(s) => s.reset(num_rom_banks),
            MbcState::Mbc5(s) => s.reset(num_rom_banks),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_info(&self) -> &CartridgeTypeInfo {
        self.type_info
    }

    pub fn cgb_support(&self) -> bool {
        self.cgb
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    pub fn rom_bank_count(&self) -> usize {
        self.rom_banks.len()
    }

    pub fn external_ram_size(&self) -> usize {
        self.external_ram.len()
    }

    /// Currently selected switchable ROM bank.
    pub fn active_rom_bank(&self) -> usize {
        match &self.mbc {
            MbcState::None => 1,
            MbcState::Mbc1(s) => s.active_rom_bank as usize,
            MbcState::Mbc3(s) => s.rom_bank_number as usize,
            MbcState::Mbc5(s) => s.active_rom_bank as usize,
        }
    }

    /// CPU read in 0x0000-0x7FFF or 0xA000-0xBFFF.
    pub fn read(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x3FFF => self.rom_banks[0][addr as usize],
            0x4000..=0x7FFF => {
                let bank = self.active_rom_bank();
                self.rom_banks
                    .get(bank)
                    .map(|b| b[(addr & 0x3FFF) as usize])
                    .unwrap_or(0x00)
            }
            0xA000..=0xBFFF => self.eram_read(addr),
            _ => {
                warn!("{} unhandled read from {:#06X}", self.mbc.kind(), addr);
                0x00
            }
        }
    }

    fn eram_read(&self, addr: u16) -> u8 {
        match &self.mbc {
            MbcState::None => {
                let offset = (addr - 0xA000) as usize;
                self.external_ram.get(offset).copied().unwrap_or(0x00)
            }
            MbcState::Mbc1(s) => {
                if !s.ram_enable {
                    return 0x00;
                }
                self.eram_window_read(s.active_ram_bank as usize, addr)
            }
            MbcState::Mbc3(s) => {
                if !s.ram_rtc_enable {
                    return 0x00;
                }
                match s.ram_bank_number {
                    0x00..=0x07 => self.eram_window_read(s.ram_bank_number as usize, addr),
                    0x08..=0x0C => s.rtc_latched[(s.ram_bank_number - 0x08) as usize],
                    _ => 0x00,
                }
            }
            MbcState::Mbc5(s) => {
                if !s.ram_enable {
                    return 0x00;
                }
                self.eram_window_read(s.ram_bank_number as usize, addr)
            }
        }
    }

    fn eram_window_read(&self, bank: usize, addr: u16) -> u8 {
        let offset = bank * ERAM_BANK_SIZE + (addr - 0xA000) as usize;
        self.external_ram.get(offset).copied().unwrap_or(0x00)
    }

    /// CPU write in 0x0000-0x7FFF (control plane) or 0xA000-0xBFFF.
    pub fn write(&mut self, addr: u16, value: u8, host: &mut dyn SystemHost) {
        match addr {
            0x0000..=0x7FFF => {
                let num_rom_banks = self.rom_banks.len();
                let has_rumble = self.type_info.has_rumble;
                let disabled_edge = match &mut self.mbc {
                    MbcState::None => {
                        warn!("MBC_NONE unhandled write to {addr:#06X} (value {value:#04X})");
                        false
                    }
                    MbcState::Mbc1(s) => s.control_write(addr, value, num_rom_banks),
                    MbcState::Mbc3(s) => {
                        s.control_write(addr, value, num_rom_banks, self.rtc.as_ref())
                    }
                    MbcState::Mbc5(s) => s.control_write(addr, value, num_rom_banks, has_rumble),
                };
                // Disabling RAM is the canonical "done saving" signal, so
                // flush dirty battery RAM on that edge.
                if disabled_edge && self.external_ram_modified {
                    self.save_ram(host);
                }
            }
            0xA000..=0xBFFF => self.eram_write(addr, value, host),
            _ => {
                warn!(
                    "{} unhandled write to {:#06X} (value {:#04X})",
                    self.mbc.kind(),
                    addr,
                    value
                );
            }
        }
    }

    fn eram_write(&mut self, addr: u16, value: u8, host: &mut dyn SystemHost) {
        let mut persist_rtc = false;
        match &mut self.mbc {
            MbcState::None => {
                let offset = (addr - 0xA000) as usize;
                if let Some(byte) = self.external_ram.get_mut(offset) {
                    if *byte != value {
                        self.external_ram_modified = true;
                    }
                    *byte = value;
                } else {
                    warn!("MBC_NONE unhandled write to {addr:#06X} (value {value:#04X})");
                }
            }
            MbcState::Mbc1(s) => {
                if s.ram_enable {
                    let bank = s.active_ram_bank as usize;
                    let offset = bank * ERAM_BANK_SIZE + (addr - 0xA000) as usize;
                    if let Some(byte) = self.external_ram.get_mut(offset) {
                        if *byte != value {
                            self.external_ram_modified = true;
                        }
                        *byte = value;
                    }
                }
            }
            MbcState::Mbc3(s) => {
                if s.ram_rtc_enable {
                    match s.ram_bank_number {
                        0x00..=0x07 => {
                            let bank = s.ram_bank_number as usize;
                            let offset = bank * ERAM_BANK_SIZE + (addr - 0xA000) as usize;
                            if let Some(byte) = self.external_ram.get_mut(offset) {
                                if *byte != value {
                                    self.external_ram_modified = true;
                                }
                                *byte = value;
                            }
                        }
                        0x08..=0x0C => {
                            if let Some(rtc) = self.rtc.as_mut() {
                                match s.ram_bank_number {
                                    0x08 => rtc.offset_seconds = value,
                                    0x09 => rtc.offset_minutes = value,
                                    0x0A => rtc.offset_hours = value,
                                    0x0B => {
                                        rtc.offset_days = (rtc.offset_days & 0x300) | value as u16;
                                    }
                                    0x0C => {
                                        rtc.offset_days = (rtc.offset_days & 0xFF)
                                            | (((value & 0x01) as u16) << 8)
                                            | (((value & 0x80) as u16) << 2);
                                        rtc.set_halted(value & 0x40 != 0, unix_now());
                                    }
                                    _ => unreachable!(),
                                }
                                persist_rtc = true;
                            }
                        }
                        _ => {}
                    }
                }
            }
            MbcState::Mbc5(s) => {
                if s.ram_enable {
                    let bank = s.ram_bank_number as usize;
                    let offset = bank * ERAM_BANK_SIZE + (addr - 0xA000) as usize;
                    if let Some(byte) = self.external_ram.get_mut(offset) {
                        if *byte != value {
                            self.external_ram_modified = true;
                        }
                        *byte = value;
                    }
                }
            }
        }

        if persist_rtc {
            self.save_rtc(host);
        }
    }

    /// Serialize the cartridge-owned mutable state: external RAM, RTC, and
    /// mapper registers, framed by the ROM CRC and a `!tag` trailer.
    pub fn save_state(&self) -> Vec<u8> {
        let mut w = StateWriter::default();
        w.put_u32(self.crc);
        w.put_u32(self.external_ram.len() as u32);
        w.put_bytes(&self.external_ram);

        w.put_bool(self.type_info.has_timer);
        if let Some(rtc) = &self.rtc {
            w.put_u64(rtc.base_time_unix);
            w.put_u16(rtc.offset_days);
            w.put_u8(rtc.offset_hours);
            w.put_u8(rtc.offset_minutes);
            w.put_u8(rtc.offset_seconds);
            w.put_bool(rtc.active);
        }

        let tag = self.mbc.kind().tag();
        w.put_u32(tag);
        match &self.mbc {
            MbcState::None => {}
            MbcState::Mbc1(s) => {
                w.put_u8(s.active_rom_bank);
                w.put_u8(s.active_ram_bank);
                w.put_bool(s.ram_enable);
                w.put_u8(s.bank_mode);
                w.put_u8(s.rom_bank_number);
                w.put_u8(s.ram_bank_number);
            }
            MbcState::Mbc3(s) => {
                w.put_u8(s.rom_bank_number);
                w.put_u8(s.ram_bank_number);
                w.put_bool(s.ram_rtc_enable);
            }
            MbcState::Mbc5(s) => {
                w.put_u16(s.active_rom_bank);
                w.put_u16(s.rom_bank_number);
                w.put_u8(s.ram_bank_number);
                w.put_bool(s.ram_enable);
            }
        }
        w.put_u32(!tag);
        w.into_bytes()
    }

    /// Restore a [`save_state`](Self::save_state) blob.
    ///
    /// The whole blob is parsed and validated before anything is applied,
    /// so a rejected state leaves the running cartridge untouched.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), SaveStateError> {
        let mut r = StateReader::new(data);

        let crc = r.take_u32()?;
        if crc != self.crc {
            return Err(SaveStateError::CrcMismatch {
                expected: self.crc,
                found: crc,
            });
        }

        let external_ram_size = r.take_u32()?;
        if external_ram_size as usize != self.external_ram.len() {
            return Err(SaveStateError::RamSizeMismatch {
                expected: self.external_ram.len() as u32,
                found: external_ram_size,
            });
        }
        let external_ram = r.take_bytes(external_ram_size as usize)?;

        let has_timer = r.take_bool()?;
        let rtc = if has_timer {
            Some(RtcState {
                base_time_unix: r.take_u64()?,
                offset_days: r.take_u16()?,
                offset_hours: r.take_u8()?,
                offset_minutes: r.take_u8()?,
                offset_seconds: r.take_u8()?,
                active: r.take_bool()?,
            })
        } else {
            None
        };

        let expected_tag = self.mbc.kind().tag();
        let tag = r.take_u32()?;
        if tag != expected_tag {
            return Err(SaveStateError::MbcMismatch {
                expected: expected_tag,
                found: tag,
            });
        }

        let num_rom_banks = self.rom_banks.len();
        let mbc = match self.mbc.kind() {
            MbcKind::None => MbcState::None,
            MbcKind::Mbc1 => {
                let s = Mbc1State {
                    active_rom_bank: r.take_u8()?,
                    active_ram_bank: r.take_u8()?,
                    ram_enable: r.take_bool()?,
                    bank_mode: r.take_u8()?,
                    rom_bank_number: r.take_u8()?,
                    ram_bank_number: r.take_u8()?,
                };
                if s.active_rom_bank as usize >= num_rom_banks {
                    return Err(SaveStateError::MbcBody);
                }
                MbcState::Mbc1(s)
            }
            MbcKind::Mbc3 => {
                let latched = match &self.mbc {
                    MbcState::Mbc3(s) => (s.rtc_latch_prev, s.rtc_latched),
                    _ => (0, [0; 5]),
                };
                let s = Mbc3State {
                    rom_bank_number: r.take_u8()?,
                    ram_bank_number: r.take_u8()?,
                    ram_rtc_enable: r.take_bool()?,
                    rtc_latch_prev: latched.0,
                    rtc_latched: latched.1,
                };
                if s.rom_bank_number as usize >= num_rom_banks {
                    return Err(SaveStateError::MbcBody);
                }
                MbcState::Mbc3(s)
            }
            MbcKind::Mbc5 => {
                let s = Mbc5State {
                    active_rom_bank: r.take_u16()?,
                    rom_bank_number: r.take_u16()?,
                    ram_bank_number: r.take_u8()?,
                    ram_enable: r.take_bool()?,
                };
                if s.active_rom_bank as usize >= num_rom_banks {
                    return Err(SaveStateError::MbcBody);
                }
                MbcState::Mbc5(s)
            }
            _ => return Err(SaveStateError::MbcBody),
        };

        let trailer = r.take_u32()?;
        if trailer != !expected_tag {
            return Err(SaveStateError::TrailerMismatch);
        }

        // Everything checked out: commit.
        self.external_ram.copy_from_slice(external_ram);
        self.external_ram_modified = false;
        if self.type_info.has_timer {
            self.rtc = rtc;
        }
        self.mbc = mbc;
        Ok(())
    }

    /// RTC state, present on MBC3+TIMER carts.
    pub fn rtc(&self) -> Option<&RtcState> {
        self.rtc.as_ref()
    }
}

impl std::fmt::Debug for Cartridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cartridge")
            .field("name", &self.name)
            .field("type", &self.type_info.description)
            .field("rom_banks", &self.rom_banks.len())
            .field("external_ram", &self.external_ram.len())
            .finish()
    }
}

/// Little-endian fixed-width writer for save-state blobs.
#[derive(Default)]
struct StateWriter {
    buf: Vec<u8>,
}

impl StateWriter {
    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Little-endian fixed-width reader for save-state blobs.
struct StateReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> StateReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take_bytes(&mut self, len: usize) -> Result<&'a [u8], SaveStateError> {
        let slice = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or(SaveStateError::Truncated)?;
        self.pos += len;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, SaveStateError> {
        Ok(self.take_bytes(1)?[0])
    }

    fn take_bool(&mut self) -> Result<bool, SaveStateError> {
        Ok(self.take_u8()? != 0)
    }

    fn take_u16(&mut self) -> Result<u16, SaveStateError> {
        Ok(u16::from_le_bytes(self.take_bytes(2)?.try_into().unwrap()))
    }

    fn take_u32(&mut self) -> Result<u32, SaveStateError> {
        Ok(u32::from_le_bytes(self.take_bytes(4)?.try_into().unwrap()))
    }

    fn take_u64(&mut self) -> Result<u64, SaveStateError> {
        Ok(u64::from_le_bytes(self.take_bytes(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtc_value_counts_from_base() {
        let rtc = RtcState::new(1_000);
        let v = rtc.value_at(1_000 + 86400 + 3 * 3600 + 4 * 60 + 5);
        assert_eq!(v.days, 1);
        assert_eq!(v.hours, 3);
        assert_eq!(v.minutes, 4);
        assert_eq!(v.seconds, 5);
    }

    #[test]
    fn rtc_offsets_add_to_elapsed_time() {
        let mut rtc = RtcState::new(0);
        rtc.offset_seconds = 30;
        rtc.offset_minutes = 1;
        let v = rtc.value_at(40);
        assert_eq!(v.minutes, 2);
        assert_eq!(v.seconds, 10);
    }

    #[test]
    fn rtc_halt_freezes_and_resume_continues() {
        let mut rtc = RtcState::new(100);

        rtc.set_halted(true, 100 + 75);
        assert!(!rtc.active);
        let frozen = rtc.value_at(100 + 75 + 10_000);
        assert_eq!(frozen.minutes, 1);
        assert_eq!(frozen.seconds, 15);

        rtc.set_halted(false, 5_000);
        let v = rtc.value_at(5_000 + 10);
        assert_eq!(v.minutes, 1);
        assert_eq!(v.seconds, 25);
    }

    #[test]
    fn rtc_latch_encodes_day_high_bit_and_carry() {
        let mut rtc = RtcState::new(0);
        rtc.active = false;
        rtc.offset_days = 300;
        let regs = rtc.latch(0);
        assert_eq!(regs[3], (300 & 0xFF) as u8);
        assert_eq!(regs[4], 0x01);

        rtc.offset_days = 513;
        let regs = rtc.latch(0);
        assert_eq!(regs[4], 0x80 | 0x01);
    }

    #[test]
    fn rtc_record_round_trips() {
        let rtc = RtcState {
            base_time_unix: 0x0102_0304_0506_0708,
            offset_days: 0x0123,
            offset_hours: 7,
            offset_minutes: 8,
            offset_seconds: 9,
            active: true,
        };
        let record = rtc.serialize();
        assert_eq!(record.len(), RTC_RECORD_LEN);
        assert_eq!(RtcState::from_record(&record), Some(rtc));
    }

    #[test]
    fn mbc1_translates_unmappable_banks() {
        let mut s = Mbc1State::default();
        s.reset(128);

        for raw in [0x00u8, 0x20, 0x40, 0x60] {
            s.ram_bank_number = raw >> 5;
            s.rom_bank_number = raw & 0x1F;
            s.update_active_banks(128);
            assert_eq!(s.active_rom_bank, raw + 1);
        }
    }

    #[test]
    fn mbc1_clamps_to_bank_count() {
        let mut s = Mbc1State::default();
        s.reset(8);
        s.control_write(0x2000, 0x1F, 8);
        assert_eq!(s.active_rom_bank, 7);
    }

    #[test]
    fn mbc5_selector_spans_nine_bits() {
        let mut s = Mbc5State::default();
        s.reset(512);
        s.control_write(0x2000, 0xFF, 512, false);
        s.control_write(0x3000, 0x01, 512, false);
        assert_eq!(s.active_rom_bank, 0x1FF);
    }

    #[test]
    fn mbc5_bank_zero_is_not_remapped() {
        let mut s = Mbc5State::default();
        s.reset(64);
        s.control_write(0x2000, 0x00, 64, false);
        assert_eq!(s.active_rom_bank, 0);
    }
}
