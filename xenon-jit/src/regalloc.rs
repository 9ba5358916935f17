//! Linear scan register allocation over LIR virtual registers.
//!
//! Live intervals are computed over the instruction ordinals of the block layout. A value that is
//! used outside of the block that defines it is kept live until the end of the function, which is
//! conservative but correct in the presence of loops. When the host registers are exhausted, the
//! interval that ends soonest is spilled.

use xenon_hir::Arena;

use crate::lir::{Lir, VReg};

/// Number of host registers handed to the allocator.
pub const NUM_HOST_REGS: usize = 12;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Location {
    Reg(u8),
    Spill(u32),
}

#[derive(Copy, Clone, Debug)]
struct Interval {
    start: u32,
    end: u32,
    first_use: u32,
    def_block: u32,
    defined: bool,
    crosses_blocks: bool,
}

impl Interval {
    const EMPTY: Self = Self {
        start: u32::MAX,
        end: 0,
        first_use: u32::MAX,
        def_block: 0,
        defined: false,
        crosses_blocks: false,
    };
}

#[derive(Copy, Clone)]
struct Active {
    end: u32,
    vreg: u32,
    reg: u8,
}

pub struct Allocation {
    locations: Vec<Option<Location>>,
    pub spill_slots: u32,
    pub host_regs: usize,
}

impl Allocation {
    #[inline]
    pub fn location(&self, reg: VReg) -> Option<Location> {
        self.locations.get(reg.index()).copied().flatten()
    }

    pub fn spilled(&self) -> usize {
        self.locations.iter().filter(|x| matches!(x, Some(Location::Spill(_)))).count()
    }
}

impl std::fmt::Display for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, loc) in self.locations.iter().enumerate() {
            match loc {
                Some(Location::Reg(r)) => writeln!(f, "%{i} -> r{r}")?,
                Some(Location::Spill(s)) => writeln!(f, "%{i} -> [spill+{:#x}]", *s * 8)?,
                None => {}
            }
        }
        Ok(())
    }
}

/// Assigns every defined virtual register of `lir` to one of `host_regs` registers or to a spill
/// slot. Scratch data lives in `arena`.
pub fn linear_scan(lir: &mut Lir, arena: &Arena, host_regs: usize) -> Allocation {
    let host_regs = host_regs.clamp(1, 32);
    let count = lir.assign_ordinals();
    let last = count.saturating_sub(1);

    let intervals = arena.alloc_slice_fill(lir.vreg_count(), Interval::EMPTY);
    let instrs = lir.all_instrs();
    for &id in &instrs {
        let instr = lir.instr(id);
        if let Some(dest) = instr.dest {
            let interval = &mut intervals[dest.index()];
            interval.start = interval.start.min(instr.ordinal);
            interval.end = interval.end.max(instr.ordinal);
            interval.def_block = instr.block.0;
            interval.defined = true;
        }
    }
    for &id in &instrs {
        let instr = lir.instr(id);
        for reg in instr.uses() {
            let interval = &mut intervals[reg.index()];
            interval.end = interval.end.max(instr.ordinal);
            interval.first_use = interval.first_use.min(instr.ordinal);
            if interval.def_block != instr.block.0 {
                interval.crosses_blocks = true;
            }
        }
    }

    let mut defined = 0;
    for interval in intervals.iter_mut().filter(|x| x.defined) {
        if interval.crosses_blocks {
            interval.start = interval.start.min(interval.first_use);
            interval.end = last;
        }
        defined += 1;
    }

    let order = arena.alloc_slice_fill(defined, 0_u32);
    let mut n = 0;
    for (i, interval) in intervals.iter().enumerate() {
        if interval.defined {
            order[n] = i as u32;
            n += 1;
        }
    }
    order.sort_unstable_by_key(|&i| (intervals[i as usize].start, i));

    let mut locations = vec![None; lir.vreg_count()];
    let mut active: Vec<Active> = Vec::with_capacity(host_regs);
    let mut free: u32 = if host_regs == 32 { u32::MAX } else { (1 << host_regs) - 1 };
    let mut spill_slots = 0;

    for &vreg in order.iter() {
        let current = intervals[vreg as usize];

        active.retain(|x| {
            if x.end <= current.start {
                free |= 1 << x.reg;
                return false;
            }
            true
        });

        if free != 0 {
            let reg = free.trailing_zeros() as u8;
            free &= !(1 << reg);
            locations[vreg as usize] = Some(Location::Reg(reg));
            active.push(Active { end: current.end, vreg, reg });
            continue;
        }

        let Some((victim, soonest)) = active.iter().enumerate().min_by_key(|(_, x)| x.end)
        else {
            continue;
        };
        let soonest = *soonest;
        if current.end <= soonest.end {
            locations[vreg as usize] = Some(Location::Spill(spill_slots));
        }
        else {
            locations[soonest.vreg as usize] = Some(Location::Spill(spill_slots));
            locations[vreg as usize] = Some(Location::Reg(soonest.reg));
            active[victim] = Active { end: current.end, vreg, reg: soonest.reg };
        }
        spill_slots += 1;
    }

    tracing::trace!(
        "{:#x}: allocated {defined} intervals over {count} instructions, {spill_slots} spill slots",
        lir.address
    );
    Allocation { locations, spill_slots, host_regs }
}
