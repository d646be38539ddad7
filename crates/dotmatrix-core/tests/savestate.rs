mod common;

use common::{RecordingHost, build_rom, stamp_banks};
use dotmatrix_core::cartridge::{Cartridge, SaveStateError};

#[test]
fn mbc1_state_round_trips_into_a_fresh_cartridge() {
    let mut rom = build_rom(0x03, 0x03, 0x03);
    stamp_banks(&mut rom);
    let mut host = RecordingHost::default();
    let mut cart = Cartridge::load(&rom, &mut host).unwrap();

    cart.write(0x0000, 0x0A, &mut host);
    cart.write(0xA000, 0x42, &mut host);
    cart.write(0xA001, 0x43, &mut host);
    cart.write(0x2000, 0x07, &mut host);
    let state = cart.save_state();

    let mut host2 = RecordingHost::default();
    let mut fresh = Cartridge::load(&rom, &mut host2).unwrap();
    fresh.load_state(&state).unwrap();

    // Mapper registers restored: bank 7 selected, RAM enabled.
    assert_eq!(fresh.read(0x4000), 7);
    assert_eq!(fresh.read(0xA000), 0x42);
    assert_eq!(fresh.read(0xA001), 0x43);
}

#[test]
fn mbc3_state_restores_rtc_fields() {
    let rom = build_rom(0x10, 0x00, 0x03);
    let mut host = RecordingHost::default();
    let mut cart = Cartridge::load(&rom, &mut host).unwrap();

    cart.write(0x0000, 0x0A, &mut host);
    cart.write(0x4000, 0x0C, &mut host);
    cart.write(0xA000, 0x40, &mut host);
    cart.write(0x4000, 0x08, &mut host);
    cart.write(0xA000, 17, &mut host);
    let state = cart.save_state();

    let mut host2 = RecordingHost::default();
    let mut fresh = Cartridge::load(&rom, &mut host2).unwrap();
    fresh.load_state(&state).unwrap();

    let rtc = fresh.rtc().unwrap();
    assert!(!rtc.active);
    assert_eq!(rtc.offset_seconds, 17);
    assert_eq!(rtc, cart.rtc().unwrap());
}

#[test]
fn mbc5_state_round_trips() {
    let mut rom = build_rom(0x1B, 0x06, 0x03);
    stamp_banks(&mut rom);
    let mut host = RecordingHost::default();
    let mut cart = Cartridge::load(&rom, &mut host).unwrap();

    cart.write(0x2000, 0x63, &mut host);
    cart.write(0x0000, 0x0A, &mut host);
    cart.write(0x4000, 0x02, &mut host);
    cart.write(0xA000, 0x77, &mut host);
    let state = cart.save_state();

    let mut host2 = RecordingHost::default();
    let mut fresh = Cartridge::load(&rom, &mut host2).unwrap();
    fresh.load_state(&state).unwrap();

    assert_eq!(fresh.read(0x4000), 0x63);
    assert_eq!(fresh.read(0xA000), 0x77);
}

#[test]
fn crc_mismatch_rejects_the_state() {
    let rom_a = build_rom(0x01, 0x00, 0x00);
    let mut rom_b = build_rom(0x01, 0x00, 0x00);
    rom_b[0x3000] = 0x01;

    let mut host = RecordingHost::default();
    let cart_a = Cartridge::load(&rom_a, &mut host).unwrap();
    let mut cart_b = Cartridge::load(&rom_b, &mut host).unwrap();

    let state = cart_a.save_state();
    let err = cart_b.load_state(&state).unwrap_err();
    assert!(matches!(err, SaveStateError::CrcMismatch { .. }));
}

// Blob layout for a RAM-less, timer-less cart: crc (4), eram size (4),
// timer flag (1), MBC tag (4), body, !tag trailer (4).
const TAG_OFFSET: usize = 9;

#[test]
fn tampered_ram_size_is_rejected() {
    let rom = build_rom(0x01, 0x00, 0x00);
    let mut host = RecordingHost::default();
    let mut cart = Cartridge::load(&rom, &mut host).unwrap();

    let mut state = cart.save_state();
    state[4] = 0xFF;
    let err = cart.load_state(&state).unwrap_err();
    assert!(matches!(err, SaveStateError::RamSizeMismatch { .. }));
}

#[test]
fn tampered_mbc_tag_is_rejected() {
    let rom = build_rom(0x01, 0x00, 0x00);
    let mut host = RecordingHost::default();
    let mut cart = Cartridge::load(&rom, &mut host).unwrap();

    let mut state = cart.save_state();
    state[TAG_OFFSET] = 0x05;
    let err = cart.load_state(&state).unwrap_err();
    assert!(matches!(err, SaveStateError::MbcMismatch { .. }));
}

#[test]
fn out_of_range_bank_in_body_is_rejected() {
    let rom = build_rom(0x01, 0x00, 0x00);
    let mut host = RecordingHost::default();
    let mut cart = Cartridge::load(&rom, &mut host).unwrap();

    let mut state = cart.save_state();
    // First body byte is MBC1's active ROM bank.
    state[TAG_OFFSET + 4] = 0xFF;
    let err = cart.load_state(&state).unwrap_err();
    assert_eq!(err, SaveStateError::MbcBody);
}

#[test]
fn tampered_trailer_is_rejected() {
    let rom = build_rom(0x01, 0x00, 0x00);
    let mut host = RecordingHost::default();
    let mut cart = Cartridge::load(&rom, &mut host).unwrap();

    let mut state = cart.save_state();
    let last = state.len() - 1;
    state[last] ^= 0xFF;
    let err = cart.load_state(&state).unwrap_err();
    assert_eq!(err, SaveStateError::TrailerMismatch);
}

#[test]
fn truncated_blob_is_rejected() {
    let rom = build_rom(0x01, 0x00, 0x00);
    let mut host = RecordingHost::default();
    let mut cart = Cartridge::load(&rom, &mut host).unwrap();

    let mut state = cart.save_state();
    state.truncate(state.len() - 2);
    let err = cart.load_state(&state).unwrap_err();
    assert_eq!(err, SaveStateError::Truncated);
}

#[test]
fn rejected_state_leaves_the_session_untouched() {
    let mut rom = build_rom(0x03, 0x03, 0x03);
    stamp_banks(&mut rom);
    let mut host = RecordingHost::default();
    let mut cart = Cartridge::load(&rom, &mut host).unwrap();

    cart.write(0x0000, 0x0A, &mut host);
    cart.write(0xA000, 0x42, &mut host);
    cart.write(0x2000, 0x02, &mut host);

    let mut state = cart.save_state();
    let last = state.len() - 1;
    state[last] ^= 0xFF;
    cart.load_state(&state).unwrap_err();

    // Current bank selection and RAM contents are exactly as before.
    assert_eq!(cart.read(0x4000), 2);
    assert_eq!(cart.read(0xA000), 0x42);
}
