#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use dotmatrix_core::host::SystemHost;

/// Build a synthetic ROM image with the given header bytes. The image is
/// sized from the ROM size code so header and file agree.
pub fn build_rom(cart_type: u8, rom_size_code: u8, ram_size_code: u8) -> Vec<u8> {
    let banks: usize = match rom_size_code {
        0x00..=0x08 => 2 << rom_size_code,
        0x52 => 72,
        0x53 => 80,
        0x54 => 96,
        _ => 2,
    };
    let mut rom = vec![0u8; banks * 0x4000];
    rom[0x0147] = cart_type;
    rom[0x0148] = rom_size_code;
    rom[0x0149] = ram_size_code;
    rom
}

/// Stamp each bank's first byte with its bank number, so reads through the
/// switchable window reveal the selected bank.
pub fn stamp_banks(rom: &mut [u8]) {
    for (i, bank) in rom.chunks_mut(0x4000).enumerate() {
        bank[0] = i as u8;
    }
}

/// Host that records every callback so tests can assert on persistence
/// traffic and presented frames.
#[derive(Default)]
pub struct RecordingHost {
    pub frames_presented: usize,
    pub last_frame: Vec<u8>,
    pub ram_saves: Vec<Vec<u8>>,
    pub rtc_saves: Vec<Vec<u8>>,
    pub ram_to_load: Option<Vec<u8>>,
    pub rtc_to_load: Option<Vec<u8>>,
}

impl SystemHost for RecordingHost {
    fn present_frame(&mut self, pixels: &[u8], _row_stride: u32) {
        self.frames_presented += 1;
        self.last_frame = pixels.to_vec();
    }

    fn load_cart_ram(&mut self, out: &mut [u8]) -> bool {
        match &self.ram_to_load {
            Some(data) => {
                let len = data.len().min(out.len());
                out[..len].copy_from_slice(&data[..len]);
                true
            }
            None => false,
        }
    }

    fn save_cart_ram(&mut self, data: &[u8]) {
        self.ram_saves.push(data.to_vec());
    }

    fn load_cart_rtc(&mut self, out: &mut [u8]) -> bool {
        match &self.rtc_to_load {
            Some(data) => {
                let len = data.len().min(out.len());
                out[..len].copy_from_slice(&data[..len]);
                true
            }
            None => false,
        }
    }

    fn save_cart_rtc(&mut self, data: &[u8]) {
        self.rtc_saves.push(data.to_vec());
    }
}

/// Clonable handle around a [`RecordingHost`], for tests that hand a boxed
/// host to the machine but still want to inspect the traffic afterwards.
#[derive(Clone, Default)]
pub struct SharedHost(pub Arc<Mutex<RecordingHost>>);

impl SystemHost for SharedHost {
    fn present_frame(&mut self, pixels: &[u8], row_stride: u32) {
        self.0.lock().unwrap().present_frame(pixels, row_stride);
    }

    fn load_cart_ram(&mut self, out: &mut [u8]) -> bool {
        self.0.lock().unwrap().load_cart_ram(out)
    }

    fn save_cart_ram(&mut self, data: &[u8]) {
        self.0.lock().unwrap().save_cart_ram(data);
    }

    fn load_cart_rtc(&mut self, out: &mut [u8]) -> bool {
        self.0.lock().unwrap().load_cart_rtc(out)
    }

    fn save_cart_rtc(&mut self, data: &[u8]) {
        self.0.lock().unwrap().save_cart_rtc(data);
    }
}
