/// Capability set the core requires from the host platform.
///
/// The core depends only on these operations, never on a particular
/// windowing or filesystem library. All callbacks run synchronously on the
/// emulation thread; they may block, and the host is responsible for
/// keeping them bounded.
pub trait SystemHost: Send {
    /// A completed 160x144 frame is ready for presentation. `pixels` holds
    /// 4 bytes per pixel in B,G,R,A order, `row_stride` bytes per row.
    ///
    /// Called exactly once per frame, at the VBLANK boundary. The buffer is
    /// not mutated again until the next frame completes, so presenting the
    /// same borrow twice yields identical output.
    fn present_frame(&mut self, pixels: &[u8], row_stride: u32);

    /// Fill `out` with previously persisted battery RAM. Returns `false`
    /// when no save exists; the cartridge then starts from zeroed RAM.
    fn load_cart_ram(&mut self, out: &mut [u8]) -> bool;

    /// Persist the battery-backed external RAM image.
    fn save_cart_ram(&mut self, data: &[u8]);

    /// Fill `out` with the persisted 16-byte RTC record. Returns `false`
    /// when no record exists yet.
    fn load_cart_rtc(&mut self, out: &mut [u8]) -> bool;

    /// Persist the 16-byte RTC record.
    fn save_cart_rtc(&mut self, data: &[u8]);
}

/// Host that drops frames and persists nothing. Useful for headless runs
/// and tests that don't care about persistence.
#[derive(Debug, Default)]
pub struct NullHost;

impl SystemHost for NullHost {
    fn present_frame(&mut self, _pixels: &[u8], _row_stride: u32) {}

    fn load_cart_ram(&mut self, _out: &mut [u8]) -> bool {
        false
    }

    fn save_cart_ram(&mut self, _data: &[u8]) {}

    fn load_cart_rtc(&mut self, _out: &mut [u8]) -> bool {
        false
    }

    fn save_cart_rtc(&mut self, _data: &[u8]) {}
}
