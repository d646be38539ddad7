use crate::{cartridge::CartridgeError, host::SystemHost, mmu::Mmu};

/// High-level facade owning the bus and the host callback table.
///
/// One `GameBoy` is one machine instance; nothing in the core is
/// process-global. The (external) CPU drives memory through [`Mmu`] and
/// advances the shared clock through [`step`](Self::step).
pub struct GameBoy {
    pub mmu: Mmu,
}

impl GameBoy {
    pub fn new(host: Box<dyn SystemHost>) -> Self {
        Self {
            mmu: Mmu::new(host),
        }
    }

    /// Load a ROM image. Battery RAM and RTC state come from the host.
    pub fn load_cart(&mut self, data: &[u8]) -> Result<(), CartridgeError> {
        self.mmu.load_cart(data)
    }

    /// Power-cycle the machine, keeping the loaded cartridge.
    pub fn reset(&mut self) {
        self.mmu.reset();
    }

    /// Advance by `m_cycles` CPU machine cycles (four dots each).
    pub fn step(&mut self, m_cycles: u32) {
        self.mmu.tick(m_cycles);
    }

    /// Final persistence pass; battery RAM is written out when dirty.
    pub fn shutdown(&mut self) {
        self.mmu.flush_battery();
    }
}

impl Drop for GameBoy {
    fn drop(&mut self) {
        self.mmu.flush_battery();
    }
}
