use bitvec::{field::BitField, order::Lsb0, view::BitView};

use crate::PrivilegeLevel;

// Mask to be applied to mstatus to get sstatus.
const SSTATUS_MASK: u64 = 0x8000_0003_000D_E762;

/// Provides the mstatus and sstatus registers.
///
/// > The mstatus register is an MXLEN-bit read/write register [...]. The mstatus register keeps
/// > track of and controls the hart’s current operating state. A restricted view of mstatus
/// > appears as the sstatus register in the S-level ISA.
///
/// The endianness control fields (MBE/SBE/UBE) are hardwired to zero (little-endian), and the
/// UXL/SXL fields are hardwired to `2` (XLEN=64 at every privilege level).
#[derive(Debug, Clone)]
pub struct Status {
    mstatus: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

impl Status {
    pub fn new() -> Self {
        let mut status = Self { mstatus: 0 };
        // UXL and SXL read as 2 (XLEN=64); they are WARL read-only in this implementation.
        status.mstatus.view_bits_mut::<Lsb0>()[idx::UXL..(idx::UXL + 2)].store_le(2u8);
        status.mstatus.view_bits_mut::<Lsb0>()[idx::SXL..(idx::SXL + 2)].store_le(2u8);
        status
    }

    /// Returns `true` if the MIE (M-mode Interrupt Enable) bit is set.
    pub fn mie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MIE]
    }

    /// Sets the MIE (M-mode Interrupt Enable) bit to `value`.
    pub fn set_mie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MIE, value);
    }

    /// Returns `true` if the SIE (S-mode Interrupt Enable) bit is set.
    pub fn sie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SIE]
    }

    /// Sets the SIE (S-mode Interrupt Enable) bit to `value`.
    pub fn set_sie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SIE, value);
    }

    /// Returns `true` if the MPIE (M-mode Previous Interrupt Enable) bit is set.
    pub fn mpie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MPIE]
    }

    /// Sets the MPIE (M-mode Previous Interrupt Enable) bit to `value`.
    pub fn set_mpie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MPIE, value);
    }

    /// Returns `true` if the SPIE (S-mode Previous Interrupt Enable) bit is set.
    pub fn spie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SPIE]
    }

    /// Sets the SPIE (S-mode Previous Interrupt Enable) bit to `value`.
    pub fn set_spie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SPIE, value);
    }

    /// Returns the privilege level encoded by the MPP (M-mode Previous Privilege level) field.
    pub fn mpp(&self) -> PrivilegeLevel {
        let bits = self.mstatus.view_bits::<Lsb0>()[idx::MPP..(idx::MPP + 2)].load_le::<u8>();
        // Only set_mpp writes this field, so the reserved encoding can never be stored.
        PrivilegeLevel::from_u2(bits).unwrap()
    }

    /// Sets the MPP (M-mode Previous Privilege level) field to `value`.
    pub fn set_mpp(&mut self, value: PrivilegeLevel) {
        self.mstatus.view_bits_mut::<Lsb0>()[idx::MPP..(idx::MPP + 2)].store_le(value as u8);
    }

    /// Returns the privilege level encoded by the SPP (S-mode Previous Privilege level) field.
    ///
    /// SPP is a single bit: it can only record U- or S-mode.
    pub fn spp(&self) -> PrivilegeLevel {
        match self.mstatus.view_bits::<Lsb0>()[idx::SPP] {
            false => PrivilegeLevel::User,
            true => PrivilegeLevel::Supervisor,
        }
    }

    /// Sets the SPP (S-mode Previous Privilege level) field to `value`.
    ///
    /// The SPP field is **WARL**; M-mode is not encodable in its single bit and is ignored.
    pub fn set_spp(&mut self, value: PrivilegeLevel) {
        if value <= PrivilegeLevel::Supervisor {
            let bit = value == PrivilegeLevel::Supervisor;
            self.mstatus.view_bits_mut::<Lsb0>().set(idx::SPP, bit);
        }
    }

    /// Returns `true` if the MPRV (Modify PRiVilege) bit is set.
    pub fn mprv(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MPRV]
    }

    /// Sets the MPRV (Modify PRiVilege) bit to `value`.
    pub fn set_mprv(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MPRV, value);
    }

    /// Returns `true` if the MXR (Make eXecutable Readable) bit is set.
    pub fn mxr(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MXR]
    }

    /// Sets the MXR (Make eXecutable Readable) bit to `value`.
    pub fn set_mxr(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MXR, value);
    }

    /// Returns `true` if the SUM (permit Supervisor User Memory access) bit is set.
    pub fn sum(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SUM]
    }

    /// Sets the SUM (permit Supervisor User Memory access) bit to `value`.
    pub fn set_sum(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SUM, value);
    }

    /// Returns the extension context status encoded by the FS (F extension Status) field.
    ///
    /// The FS field is **WARL**.
    pub fn fs(&self) -> ExtensionContextStatus {
        ExtensionContextStatus::from_u2(
            self.mstatus.view_bits::<Lsb0>()[idx::FS..(idx::FS + 2)].load_le(),
        )
    }

    /// Sets the extension context status encoded by the FS (F extension Status) field to `value`.
    ///
    /// The FS field is **WARL**.
    pub fn set_fs(&mut self, value: ExtensionContextStatus) {
        self.mstatus.view_bits_mut::<Lsb0>()[idx::FS..(idx::FS + 2)].store_le(value as u8);
        self.update_sd();
    }

    /// Returns `true` if the SD (extension Status Dirty) bit is set.
    pub fn sd(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SD]
    }

    fn update_sd(&mut self) {
        let dirty = self.fs() == ExtensionContextStatus::Dirty;
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SD, dirty);
    }

    pub fn read_mstatus(&self) -> u64 {
        self.mstatus
    }

    pub fn write_mstatus(&mut self, value: u64, mask: u64) {
        let mask_bits = mask.view_bits::<Lsb0>();
        let updated = self.mstatus & !mask | value & mask;
        let updated_bits = updated.view_bits::<Lsb0>();

        // Update the fields using the relevant setters to treat WARL fields correctly.
        if mask_bits[idx::SIE] {
            self.set_sie(updated_bits[idx::SIE]);
        }
        if mask_bits[idx::MIE] {
            self.set_mie(updated_bits[idx::MIE]);
        }
        if mask_bits[idx::SPIE] {
            self.set_spie(updated_bits[idx::SPIE]);
        }
        if mask_bits[idx::MPIE] {
            self.set_mpie(updated_bits[idx::MPIE]);
        }
        if mask_bits[idx::SPP] {
            self.set_spp(match updated_bits[idx::SPP] {
                false => PrivilegeLevel::User,
                true => PrivilegeLevel::Supervisor,
            });
        }
        if mask_bits[idx::MPP] | mask_bits[idx::MPP + 1] {
            // MPP is a WARL field; a write of the reserved encoding is dropped.
            if let Some(level) =
                PrivilegeLevel::from_u2(updated_bits[idx::MPP..(idx::MPP + 2)].load_le())
            {
                self.set_mpp(level);
            }
        }
        if mask_bits[idx::FS] | mask_bits[idx::FS + 1] {
            self.set_fs(ExtensionContextStatus::from_u2(
                updated_bits[idx::FS..(idx::FS + 2)].load_le(),
            ));
        }
        if mask_bits[idx::MPRV] {
            self.set_mprv(updated_bits[idx::MPRV]);
        }
        if mask_bits[idx::SUM] {
            self.set_sum(updated_bits[idx::SUM]);
        }
        if mask_bits[idx::MXR] {
            self.set_mxr(updated_bits[idx::MXR]);
        }
        // Ignore read-only fields (UBE/SBE/MBE, UXL/SXL, SD), and the remaining WPRI fields.
    }

    pub fn read_sstatus(&self) -> u64 {
        self.mstatus & SSTATUS_MASK
    }

    pub fn write_sstatus(&mut self, value: u64, mask: u64) {
        self.write_mstatus(value, mask & SSTATUS_MASK);
    }
}

/// Bit indices into mstatus register.
mod idx {
    pub const SIE: usize = 1;
    pub const MIE: usize = 3;
    pub const SPIE: usize = 5;
    pub const MPIE: usize = 7;
    pub const SPP: usize = 8;
    pub const MPP: usize = 11;
    pub const FS: usize = 13;
    pub const MPRV: usize = 17;
    pub const SUM: usize = 18;
    pub const MXR: usize = 19;
    pub const UXL: usize = 32;
    pub const SXL: usize = 34;
    pub const SD: usize = 63;
}

/// Possible values of the extension context status field (FS) in the mstatus register.
///
/// > | Status | FS Meaning |
/// > | ------ | ---------- |
/// > | 0      | Off        |
/// > | 1      | Initial    |
/// > | 2      | Clean      |
/// > | 3      | Dirty      |
///
/// > When an extension’s status is set to Off, any instruction that attempts to read or write the
/// > corresponding state will cause an illegal instruction exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExtensionContextStatus {
    Off = 0,
    Initial = 1,
    Clean = 2,
    Dirty = 3,
}

impl ExtensionContextStatus {
    /// Convert a 2-bit value into an [`ExtensionContextStatus`].
    /// Panics if the value doesn't fit in 2 bits (`0..=3`).
    pub fn from_u2(value_u2: u8) -> Self {
        match value_u2 {
            0 => Self::Off,
            1 => Self::Initial,
            2 => Self::Clean,
            3 => Self::Dirty,
            _ => panic!("out of range u2 used"),
        }
    }
}
