//! Discovers the extent and basic blocks of guest functions.

use std::sync::Arc;

use crate::{
    frontend::decode::{self, PpcOpcode, BCTR, BLR, MFLR_R12},
    mem::{Endian, Memory},
    sdb::{FunctionSymbol, SymbolBehavior, SymbolDatabase},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub start: u32,
    /// Address of the last instruction in the block.
    pub end: u32,
}

pub struct Scanner {
    memory: Arc<dyn Memory>,
    max_instructions: usize,
}

impl Scanner {
    pub fn new(memory: Arc<dyn Memory>, max_instructions: usize) -> Self {
        Self { memory, max_instructions: max_instructions.max(1) }
    }

    fn is_epilog_return(sdb: &SymbolDatabase, address: u32) -> bool {
        sdb.lookup(address).map_or(false, |x| x.behavior() == SymbolBehavior::EpilogReturn)
    }

    /// Walks forward from the entry of `symbol` to find the last instruction of the function,
    /// then declares the symbol with that extent. Returns the end address.
    ///
    /// This is a heuristic: the function ends at the first return or unconditional branch that no
    /// previously seen branch jumps over.
    pub fn find_extents(&self, sdb: &SymbolDatabase, symbol: &FunctionSymbol) -> u32 {
        let start = symbol.address;
        let end = match self.scan(sdb, start) {
            Some(end) => end,
            None => {
                tracing::debug!("{start:#x}: scan failed, using single instruction extent");
                start
            }
        };
        tracing::trace!("{start:#x}: function extent {start:#x}..={end:#x}");
        symbol.declare(end);
        end
    }

    fn scan(&self, sdb: &SymbolDatabase, start: u32) -> Option<u32> {
        let mut address = start;
        let mut furthest_target = start;
        let mut blocks_found = 0;
        let mut in_block = false;
        let mut starts_with_mflr = false;

        for _ in 0..self.max_instructions {
            let code = self.memory.read_u32(address, Endian::Big).ok()?;
            if code == 0 {
                tracing::trace!("{address:#x}: function end (zero word)");
                return (address > start).then(|| address - 4);
            }

            if address == start && code == MFLR_R12 {
                starts_with_mflr = true;
            }
            if !in_block {
                in_block = true;
                blocks_found += 1;
            }

            let instr = decode::decode(address, code);
            let mut ends_fn = false;
            let mut ends_block = false;

            // A `mtlr r12; blr` epilogue ends here too, unless a branch skips over it.
            if code == BLR || code == BCTR {
                if furthest_target <= address {
                    tracing::trace!("{address:#x}: function end (return)");
                    ends_fn = true;
                }
                ends_block = true;
            }
            else if let Some(instr) = instr {
                match instr.opcode {
                    PpcOpcode::bx if instr.lk() => {
                        let target = instr.branch_target();
                        if sdb.lookup(target).is_none() {
                            sdb.get_or_insert(target);
                        }
                        ends_block = true;
                    }
                    PpcOpcode::bx => {
                        let target = instr.branch_target();
                        let nothing_after = furthest_target <= address;

                        if nothing_after && target >= start && target < address {
                            tracing::trace!("{address:#x}: function end (back branch)");
                            ends_fn = true;
                        }
                        else if nothing_after && target < start {
                            tracing::trace!("{address:#x}: function end (tail call)");
                            ends_fn = true;
                        }
                        else if nothing_after && Self::is_epilog_return(sdb, target) {
                            tracing::trace!("{address:#x}: function end (restore helper)");
                            ends_fn = true;
                        }
                        else if !starts_with_mflr && blocks_found == 1 {
                            tracing::trace!("{address:#x}: function end (leaf thunk)");
                            ends_fn = true;
                        }

                        if !ends_fn && !Self::is_epilog_return(sdb, target) {
                            furthest_target = furthest_target.max(target);
                        }
                        ends_block = true;
                    }
                    PpcOpcode::bcx => {
                        let target = instr.cond_branch_target();
                        if !instr.lk() && !Self::is_epilog_return(sdb, target) {
                            furthest_target = furthest_target.max(target);
                        }
                        ends_block = true;
                    }
                    PpcOpcode::bclrx | PpcOpcode::bcctrx => ends_block = true,
                    _ => {}
                }
            }

            if ends_fn {
                return Some(address);
            }
            if ends_block {
                in_block = false;
            }
            address = address.checked_add(4)?;
        }

        tracing::warn!("{start:#x}: function exceeded {} instructions", self.max_instructions);
        None
    }

    /// Splits a declared function into basic blocks, ordered by address.
    pub fn find_blocks(&self, symbol: &FunctionSymbol) -> Vec<BlockInfo> {
        let mut blocks = vec![];
        let end = symbol.end_address();
        let mut block_start = None;

        let mut address = symbol.address;
        while address <= end {
            let code = match self.memory.read_u32(address, Endian::Big) {
                Ok(code) => code,
                Err(_) => break,
            };
            if code != 0 {
                let start = *block_start.get_or_insert(address);
                let ends_block = code == BLR
                    || code == BCTR
                    || matches!(
                        decode::lookup(code),
                        Some(PpcOpcode::bx | PpcOpcode::bcx | PpcOpcode::bclrx | PpcOpcode::bcctrx)
                    );
                if ends_block {
                    blocks.push(BlockInfo { start, end: address });
                    block_start = None;
                }
            }
            address = match address.checked_add(4) {
                Some(next) => next,
                None => break,
            };
        }

        if let Some(start) = block_start {
            blocks.push(BlockInfo { start, end });
        }
        blocks
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{frontend::decode::MTLR_R12, mem::FlatMemory, sdb::SymbolState};

    const BASE: u32 = 0x8200_0000;

    fn setup(code: &[u32]) -> (Scanner, SymbolDatabase) {
        let memory = FlatMemory::new(BASE, 0x10000);
        let bytes: Vec<u8> = code.iter().flat_map(|x| x.to_be_bytes()).collect();
        memory.load(BASE, &bytes).unwrap();
        (Scanner::new(Arc::new(memory), 0x1000), SymbolDatabase::new())
    }

    #[test]
    fn extent_with_epilogue() {
        let code = [
            MFLR_R12,    // mflr r12
            0x9181_fff8, // stw r12, -8(r1)
            0x9421_ffa0, // stwu r1, -0x60(r1)
            0x2c03_0000, // cmpwi r3, 0
            0x4182_000c, // beq +0xc
            0x3860_0001, // li r3, 1
            0x4800_0008, // b +0x8
            0x3860_0000, // li r3, 0
            0x3821_0060, // addi r1, r1, 0x60
            0x8181_fff8, // lwz r12, -8(r1)
            MTLR_R12,    // mtlr r12
            BLR,         // blr
            0x3860_0002, // li r3, 2 (next function)
            BLR,
        ];
        let (scanner, sdb) = setup(&code);
        let symbol = sdb.get_or_insert(BASE);
        assert!(symbol.begin_scan());

        let end = scanner.find_extents(&sdb, &symbol);
        assert_eq!(end, BASE + 11 * 4);
        assert_eq!(symbol.end_address(), BASE + 11 * 4);
        assert_eq!(symbol.state(), SymbolState::Declared);

        let blocks = scanner.find_blocks(&symbol);
        assert_eq!(blocks, vec![
            BlockInfo { start: BASE, end: BASE + 0x10 },
            BlockInfo { start: BASE + 0x14, end: BASE + 0x18 },
            BlockInfo { start: BASE + 0x1c, end: BASE + 0x2c },
        ]);
    }

    #[test]
    fn blr_skipped_when_branched_over() {
        let code = [
            0x2c03_0000, // cmpwi r3, 0
            0x4182_000c, // beq +0xc
            0x3860_0001, // li r3, 1
            BLR,
            0x3860_0000, // li r3, 0
            BLR,
        ];
        let (scanner, sdb) = setup(&code);
        let symbol = sdb.get_or_insert(BASE);
        assert_eq!(scanner.find_extents(&sdb, &symbol), BASE + 0x14);
    }

    #[test]
    fn epilogue_inside_a_branch_does_not_end() {
        let code = [
            MFLR_R12,
            0x4182_000c, // beq +0xc
            MTLR_R12,
            BLR,
            0x3860_0001, // li r3, 1
            BLR,
        ];
        let (scanner, sdb) = setup(&code);
        let symbol = sdb.get_or_insert(BASE);
        assert_eq!(scanner.find_extents(&sdb, &symbol), BASE + 0x14);
    }

    #[test]
    fn zero_word_ends_function() {
        let (scanner, sdb) = setup(&[0x3860_0001, 0x3860_0002, 0]);
        let symbol = sdb.get_or_insert(BASE);
        assert_eq!(scanner.find_extents(&sdb, &symbol), BASE + 4);
    }

    #[test]
    fn call_targets_are_queued() {
        let code = [
            MFLR_R12,
            0x4800_0011, // bl +0x10
            MTLR_R12,
            BLR,
            0x3860_0001, // callee: li r3, 1
            BLR,
        ];
        let (scanner, sdb) = setup(&code);
        let symbol = sdb.get_or_insert(BASE);
        assert_eq!(scanner.find_extents(&sdb, &symbol), BASE + 0xc);
        let callee = sdb.lookup(BASE + 0x14).expect("callee declared");
        assert_eq!(callee.state(), SymbolState::Unscanned);
    }

    #[test]
    fn leaf_thunk() {
        let code = [
            0x3860_0000, // li r3, 0
            0x4800_0100, // b +0x100
            0x3860_0001,
            BLR,
        ];
        let (scanner, sdb) = setup(&code);
        let symbol = sdb.get_or_insert(BASE);
        assert_eq!(scanner.find_extents(&sdb, &symbol), BASE + 4);
    }

    #[test]
    fn unmapped_memory_gives_single_instruction() {
        let (scanner, sdb) = setup(&[]);
        let symbol = sdb.get_or_insert(BASE + 0x20000);
        assert_eq!(scanner.find_extents(&sdb, &symbol), BASE + 0x20000);
    }
}
