use bitvec::{array::BitArray, field::BitField, order::Lsb0, view::BitView};
use log::trace;

use super::Interrupt;

const SUPERVISOR_SOFTWARE_INTERRUPT: usize = Interrupt::SupervisorSoftwareInterrupt as usize;
const MACHINE_SOFTWARE_INTERRUPT: usize = Interrupt::MachineSoftwareInterrupt as usize;
const SUPERVISOR_TIMER_INTERRUPT: usize = Interrupt::SupervisorTimerInterrupt as usize;
const MACHINE_TIMER_INTERRUPT: usize = Interrupt::MachineTimerInterrupt as usize;
const SUPERVISOR_EXTERNAL_INTERRUPT: usize = Interrupt::SupervisorExternalInterrupt as usize;
const MACHINE_EXTERNAL_INTERRUPT: usize = Interrupt::MachineExternalInterrupt as usize;

#[allow(clippy::identity_op)]
const VALID_INTERRUPTS_MASK: u16 = 0
    | (1 << SUPERVISOR_SOFTWARE_INTERRUPT)
    | (1 << MACHINE_SOFTWARE_INTERRUPT)
    | (1 << SUPERVISOR_TIMER_INTERRUPT)
    | (1 << MACHINE_TIMER_INTERRUPT)
    | (1 << SUPERVISOR_EXTERNAL_INTERRUPT)
    | (1 << MACHINE_EXTERNAL_INTERRUPT);

// MTIP and MEIP are driven by the CLINT and PLIC respectively; MSIP by the CLINT's msip word.
// SSIP and MSIP remain software-writable through mip.
const SOFTWARE_WRITABLE_MASK: u16 =
    (1 << SUPERVISOR_SOFTWARE_INTERRUPT) | (1 << MACHINE_SOFTWARE_INTERRUPT);

/// The mip and mie registers, with the device-driven bits kept separate from the
/// software-writable ones.
#[derive(Debug, Clone, Default)]
pub struct Interrupts {
    /// Software-writable bit that is ORed with [`seip_external`](Self::seip_external) to become
    /// the SEIP field of the final mip register.
    seip_internal: bool,
    /// External interrupt bit driven by the PLIC's S-context line.
    seip_external: bool,
    /// Software-writable MSIP bit, ORed with the CLINT's msip line.
    msip_internal: bool,
    /// MSIP line driven by the CLINT's memory-mapped msip word.
    msip_external: bool,

    /// The final mip register as visible from guest software. The SEIP and MSIP fields are
    /// recomputed each time one of their inputs changes.
    mip: BitArray<[u16; 1], Lsb0>,

    /// The mie register.
    mie: BitArray<[u16; 1], Lsb0>,
}

impl Interrupts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indicate whether there is an M-level external interrupt pending (MEIP).
    ///
    /// Controlled by the PLIC.
    pub fn set_m_external(&mut self, value: bool) {
        if self.mip[MACHINE_EXTERNAL_INTERRUPT] != value {
            trace!("setting mip.MEIP to {value}");
        }
        self.mip.set(MACHINE_EXTERNAL_INTERRUPT, value);
    }

    /// Indicate whether there is an S-level external interrupt pending (SEIP).
    ///
    /// Controlled by the PLIC. Note that calling this with `false` does not mean the SEIP field
    /// will be set to `0`, since it is ORed with the (hidden) software-writable SEIP bit.
    pub fn set_s_external(&mut self, value: bool) {
        self.seip_external = value;
        self.mip.set(
            SUPERVISOR_EXTERNAL_INTERRUPT,
            self.seip_external | self.seip_internal,
        );
    }

    /// Indicate whether there is an M-level timer interrupt pending (MTIP).
    ///
    /// Controlled by the CLINT based on mtime and mtimecmp.
    pub fn set_m_timer(&mut self, value: bool) {
        if self.mip[MACHINE_TIMER_INTERRUPT] != value {
            trace!("setting mip.MTIP to {value}");
        }
        self.mip.set(MACHINE_TIMER_INTERRUPT, value);
    }

    /// Indicate whether there is an M-level software interrupt pending (MSIP).
    ///
    /// Controlled by the CLINT's memory-mapped msip word; ORed with the software-writable bit.
    pub fn set_m_soft(&mut self, value: bool) {
        self.msip_external = value;
        self.mip.set(
            MACHINE_SOFTWARE_INTERRUPT,
            self.msip_external | self.msip_internal,
        );
    }

    /// Returns `Some(interrupt)` if any interrupt is both pending and enabled. If there are
    /// multiple, `interrupt` is the one with the highest priority.
    ///
    /// > Multiple simultaneous interrupts destined for M-mode are handled in the following
    /// > decreasing priority order: MEI, MSI, MTI, SEI, SSI, STI.
    pub fn highest_priority_ready(&self) -> Option<Interrupt> {
        let ready = self.mip & self.mie;
        [
            Interrupt::MachineExternalInterrupt,
            Interrupt::MachineSoftwareInterrupt,
            Interrupt::MachineTimerInterrupt,
            Interrupt::SupervisorExternalInterrupt,
            Interrupt::SupervisorSoftwareInterrupt,
            Interrupt::SupervisorTimerInterrupt,
        ]
        .into_iter()
        .find(|&i| ready[i as usize])
    }

    pub fn read_mip(&self) -> u64 {
        self.mip.load_le::<u16>() as u64
    }

    pub fn write_mip(&mut self, value: u64, mask: u64) {
        let mask = mask as u16 & SOFTWARE_WRITABLE_MASK;
        let value = value as u16;
        let mask = mask.view_bits::<Lsb0>();
        let value = value.view_bits::<Lsb0>();

        // Writes to MEIP, MTIP, SEIP, and STIP are ignored; their values are device-driven
        // (or, for STIP, not implemented since there is no S-mode timer).

        if mask[MACHINE_SOFTWARE_INTERRUPT] {
            self.msip_internal = value[MACHINE_SOFTWARE_INTERRUPT];
            self.mip.set(
                MACHINE_SOFTWARE_INTERRUPT,
                self.msip_external | self.msip_internal,
            );
        }

        if mask[SUPERVISOR_SOFTWARE_INTERRUPT] {
            self.mip.set(
                SUPERVISOR_SOFTWARE_INTERRUPT,
                value[SUPERVISOR_SOFTWARE_INTERRUPT],
            );
        }
    }

    pub fn read_mie(&self) -> u64 {
        self.mie.load_le::<u16>() as u64
    }

    pub fn write_mie(&mut self, value: u64, mask: u64) {
        let mask = mask as u16 & VALID_INTERRUPTS_MASK;
        let updated = self.mie.load_le::<u16>() & !mask | value as u16 & mask;
        self.mie.store_le(updated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_driven_bits_ignore_writes() {
        let mut interrupts = Interrupts::new();
        interrupts.set_m_timer(true);
        interrupts.set_m_external(true);
        assert_eq!((1 << 7) | (1 << 11), interrupts.read_mip());

        // Attempting to clear MTIP/MEIP from software must be a no-op.
        interrupts.write_mip(0, u64::MAX);
        assert_eq!((1 << 7) | (1 << 11), interrupts.read_mip());

        interrupts.set_m_timer(false);
        interrupts.set_m_external(false);
        assert_eq!(0, interrupts.read_mip());
    }

    #[test]
    fn test_software_writable_bits() {
        let mut interrupts = Interrupts::new();
        interrupts.write_mip(1 << 1 | 1 << 3, u64::MAX);
        assert_eq!(1 << 1 | 1 << 3, interrupts.read_mip());
        interrupts.write_mip(0, 1 << 1);
        assert_eq!(1 << 3, interrupts.read_mip());

        // The CLINT msip line keeps MSIP high even after the software bit is cleared.
        interrupts.set_m_soft(true);
        interrupts.write_mip(0, 1 << 3);
        assert_eq!(1 << 3, interrupts.read_mip());
        interrupts.set_m_soft(false);
        assert_eq!(0, interrupts.read_mip());
    }

    #[test]
    fn test_priority_order() {
        let mut interrupts = Interrupts::new();
        interrupts.write_mie(u64::MAX, u64::MAX);
        interrupts.set_m_timer(true);
        assert_eq!(
            Some(Interrupt::MachineTimerInterrupt),
            interrupts.highest_priority_ready()
        );
        interrupts.set_m_external(true);
        assert_eq!(
            Some(Interrupt::MachineExternalInterrupt),
            interrupts.highest_priority_ready()
        );
    }

    #[test]
    fn test_mie_masks_pending() {
        let mut interrupts = Interrupts::new();
        interrupts.set_m_timer(true);
        assert_eq!(None, interrupts.highest_priority_ready());
        interrupts.write_mie(1 << 7, u64::MAX);
        assert_eq!(
            Some(Interrupt::MachineTimerInterrupt),
            interrupts.highest_priority_ready()
        );
    }
}
