//! Stack poisoning.
//!
//! Unused stack bytes are filled with a repeating 8-byte signature where every
//! [`ID_PERIOD`]th slot carries the owning fiber's id instead. Reading a stack
//! back shows how deep it has ever been used (the intact prefix from the low
//! end) and, in a crash dump, which fiber's pattern sits right below a
//! corrupted region.

/// Repeating fill value.
pub const SIGNATURE: u64 = 0xF1BE_5EED_F1BE_5EED;

/// Every `ID_PERIOD`th 8-byte slot holds the fiber id.
pub const ID_PERIOD: usize = 8;

const SLOT: usize = std::mem::size_of::<u64>();
const BLOCK: usize = SLOT * ID_PERIOD;

fn pattern_block(fiber_id: u64) -> [u8; BLOCK] {
    let mut block = [0u8; BLOCK];
    for (i, slot) in block.chunks_exact_mut(SLOT).enumerate() {
        let value = if i == ID_PERIOD - 1 { fiber_id } else { SIGNATURE };
        slot.copy_from_slice(&value.to_ne_bytes());
    }
    block
}

/// Fills `region` with the poison pattern for `fiber_id`.
///
/// Bytes before the first 8-byte aligned address get plain signature bytes so
/// the id interleave is counted from the first aligned slot.
pub fn fill(region: &mut [u8], fiber_id: u64) {
    let lead = region.as_ptr().align_offset(SLOT).min(region.len());
    let signature = SIGNATURE.to_ne_bytes();
    let (head, rest) = region.split_at_mut(lead);
    for (i, byte) in head.iter_mut().enumerate() {
        *byte = signature[i % SLOT];
    }

    let block = pattern_block(fiber_id);
    let mut chunks = rest.chunks_exact_mut(BLOCK);
    for chunk in &mut chunks {
        chunk.copy_from_slice(&block);
    }
    let tail = chunks.into_remainder();
    let len = tail.len();
    tail.copy_from_slice(&block[..len]);
}

/// Result of reading a poisoned region back.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PoisonReport {
    /// Bytes from the low end of the region that still carry the pattern.
    pub intact_bytes: usize,
    /// Last id found before the pattern breaks.
    pub last_id: Option<u64>,
    /// Ids in the intact prefix that are not the owner's. Non-empty means
    /// another fiber's fill landed in this region.
    pub foreign_ids: Vec<u64>,
}

impl PoisonReport {
    pub fn is_clean(&self) -> bool {
        self.foreign_ids.is_empty()
    }
}

/// Scans `region` (filled by [`fill`]) from its low end.
pub fn inspect(region: &[u8], owner: u64) -> PoisonReport {
    let mut report = PoisonReport::default();
    let lead = region.as_ptr().align_offset(SLOT).min(region.len());
    let signature = SIGNATURE.to_ne_bytes();

    for (i, &byte) in region[..lead].iter().enumerate() {
        if byte != signature[i % SLOT] {
            report.intact_bytes = i;
            return report;
        }
    }
    report.intact_bytes = lead;

    let slots: Vec<u64> = region[lead..]
        .chunks_exact(SLOT)
        .map(|slot| {
            let mut raw = [0u8; SLOT];
            raw.copy_from_slice(slot);
            u64::from_ne_bytes(raw)
        })
        .collect();

    for (k, &value) in slots.iter().enumerate() {
        if k % ID_PERIOD == ID_PERIOD - 1 {
            // A foreign fill is bracketed by signatures. Anything else in an
            // id slot is stack data.
            let bracketed = slots.get(k + 1) == Some(&SIGNATURE);
            if value == SIGNATURE || (value != owner && !bracketed) {
                break;
            }
            report.last_id = Some(value);
            if value != owner {
                report.foreign_ids.push(value);
            }
        } else if value != SIGNATURE {
            break;
        }
        report.intact_bytes += SLOT;
    }
    report
}
