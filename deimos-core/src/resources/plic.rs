//! Platform-level interrupt controller

use bitvec::array::BitArray;
use bitvec::order::Lsb0;
use bitvec::BitArr;

use crate::bus::Device;
use crate::DataSize;

/// Number of interrupt sources, including the reserved source 0.
pub const SOURCE_COUNT: usize = 64;
/// Number of interrupt targets: context 0 is hart0/M-mode, context 1 is hart0/S-mode.
pub const CONTEXT_COUNT: usize = 2;
/// Highest supported priority value; priorities are clamped to this on write.
pub const MAX_PRIORITY: u32 = 7;

pub const PRIORITY_BASE: u64 = 0x0;
pub const PENDING_BASE: u64 = 0x1000;
pub const ENABLE_BASE: u64 = 0x2000;
pub const ENABLE_STRIDE: u64 = 0x80;
pub const CONTEXT_BASE: u64 = 0x20_0000;
pub const CONTEXT_STRIDE: u64 = 0x1000;

type SourceBits = BitArr!(for SOURCE_COUNT, in u32, Lsb0);

/// PLIC with 64 sources and two contexts (hart0 M-mode and S-mode).
///
/// Register layout (all registers 32 bits wide):
///
/// | Offset                  | Register                        |
/// |-------------------------|---------------------------------|
/// | `0x000000 + 4·i`        | priority of source `i`          |
/// | `0x001000`, `0x001004`  | pending bits 0-31, 32-63        |
/// | `0x002000 + 0x80·c`     | enable bits of context `c`      |
/// | `0x200000 + 0x1000·c`   | priority threshold of context `c` |
/// | `0x200004 + 0x1000·c`   | claim/complete of context `c`   |
#[derive(Debug)]
pub struct Plic {
    priority: [u32; SOURCE_COUNT],
    pending: SourceBits,
    contexts: [Context; CONTEXT_COUNT],
}

#[derive(Debug, Default)]
struct Context {
    enable: SourceBits,
    threshold: u32,
}

impl Default for Plic {
    fn default() -> Self {
        Self::new()
    }
}

impl Plic {
    /// Create new Plic in reset state.
    pub fn new() -> Self {
        Self {
            priority: [0; SOURCE_COUNT],
            pending: BitArray::ZERO,
            contexts: Default::default(),
        }
    }

    /// Latch interrupt source `id` as pending. Source 0 does not exist and is ignored.
    pub fn raise(&mut self, id: u32) {
        if (1..SOURCE_COUNT as u32).contains(&id) {
            self.pending.set(id as usize, true);
        }
    }

    /// Level of the external interrupt line into context `c`: high iff at least one source is
    /// pending, enabled for `c`, and prioritized above `c`'s threshold.
    pub fn irq_line(&self, context: usize) -> bool {
        self.best_pending(context).is_some()
    }

    /// The claimable source for `context`: the pending-and-enabled source with the highest
    /// priority above the context's threshold. Ties break towards the lowest source id.
    fn best_pending(&self, context: usize) -> Option<u32> {
        let ctx = &self.contexts[context];
        (1..SOURCE_COUNT)
            .filter(|&id| self.pending[id] && ctx.enable[id] && self.priority[id] > ctx.threshold)
            // max_by_key returns the last maximum; reverse so ties resolve to the lowest id.
            .rev()
            .max_by_key(|&id| self.priority[id])
            .map(|id| id as u32)
    }

    /// Claim: atomically fetch the best pending source and clear its pending bit.
    /// Returns 0 if nothing is claimable.
    fn claim(&mut self, context: usize) -> u32 {
        match self.best_pending(context) {
            Some(id) => {
                self.pending.set(id as usize, false);
                id
            }
            None => 0,
        }
    }

    /// Complete: signals the handler is done with a source. Pending bits are edge-latched by
    /// [`raise`](Self::raise), so completion itself has nothing to clear; a source that is still
    /// asserted will simply be raised again by the next device sweep.
    fn complete(&mut self, _context: usize, _id: u32) {}
}

impl Device for Plic {
    fn read(&mut self, offset: u64, _size: DataSize) -> u64 {
        let value = match offset {
            PRIORITY_BASE..=0xFFF => {
                let id = (offset / 4) as usize;
                if (1..SOURCE_COUNT).contains(&id) {
                    self.priority[id]
                } else {
                    0
                }
            }
            PENDING_BASE..=0x1FFF => {
                let word = ((offset - PENDING_BASE) / 4) as usize;
                *self.pending.as_raw_slice().get(word).unwrap_or(&0)
            }
            ENABLE_BASE..=0x1F_FFFF => {
                let context = ((offset - ENABLE_BASE) / ENABLE_STRIDE) as usize;
                let word = ((offset - ENABLE_BASE) % ENABLE_STRIDE / 4) as usize;
                match self.contexts.get(context) {
                    Some(ctx) => *ctx.enable.as_raw_slice().get(word).unwrap_or(&0),
                    None => 0,
                }
            }
            CONTEXT_BASE.. => {
                let context = ((offset - CONTEXT_BASE) / CONTEXT_STRIDE) as usize;
                let reg = (offset - CONTEXT_BASE) % CONTEXT_STRIDE;
                if context >= CONTEXT_COUNT {
                    0
                } else if reg == 0 {
                    self.contexts[context].threshold
                } else if reg == 4 {
                    self.claim(context)
                } else {
                    0
                }
            }
            _ => 0,
        };
        value as u64
    }

    fn write(&mut self, offset: u64, _size: DataSize, value: u64) {
        let value = value as u32;
        match offset {
            PRIORITY_BASE..=0xFFF => {
                let id = (offset / 4) as usize;
                if (1..SOURCE_COUNT).contains(&id) {
                    self.priority[id] = value.min(MAX_PRIORITY);
                }
            }
            // The pending array is read-only; pending bits are set by the devices and cleared
            // by claims.
            PENDING_BASE..=0x1FFF => {}
            ENABLE_BASE..=0x1F_FFFF => {
                let context = ((offset - ENABLE_BASE) / ENABLE_STRIDE) as usize;
                let word = ((offset - ENABLE_BASE) % ENABLE_STRIDE / 4) as usize;
                if let Some(ctx) = self.contexts.get_mut(context) {
                    if let Some(slot) = ctx.enable.as_raw_mut_slice().get_mut(word) {
                        *slot = value;
                        // Source 0 does not exist, its enable bit is hardwired to zero.
                        ctx.enable.set(0, false);
                    }
                }
            }
            CONTEXT_BASE.. => {
                let context = ((offset - CONTEXT_BASE) / CONTEXT_STRIDE) as usize;
                let reg = (offset - CONTEXT_BASE) % CONTEXT_STRIDE;
                if context >= CONTEXT_COUNT {
                    return;
                }
                if reg == 0 {
                    self.contexts[context].threshold = value.min(MAX_PRIORITY);
                } else if reg == 4 {
                    self.complete(context, value);
                }
            }
            _ => {}
        }
    }
}
