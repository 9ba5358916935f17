use crate::{Opcode, OpcodeFlags, OpcodeTable, TypeName, Value};

macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            #[inline(always)]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_id!(BlockId, "b");
define_id!(InstrId, "i");
define_id!(ValueId, "v");
define_id!(LabelId, "label");

/// A source operand of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Operand {
    #[default]
    None,
    Value(ValueId),
    Label(LabelId),
    Offset(u64),
    /// The guest address of a function.
    Symbol(u32),
    /// An index into the runtime's table of resolved exports.
    Extern(u32),
    /// An index into the comment table of the function.
    Comment(u32),
}

impl Operand {
    #[inline]
    pub fn as_value(&self) -> Option<ValueId> {
        match self {
            Self::Value(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_label(&self) -> Option<LabelId> {
        match self {
            Self::Label(l) => Some(*l),
            _ => None,
        }
    }

    #[inline]
    pub fn as_offset(&self) -> Option<u64> {
        match self {
            Self::Offset(x) => Some(*x),
            _ => None,
        }
    }
}

impl From<ValueId> for Operand {
    fn from(v: ValueId) -> Self {
        Self::Value(v)
    }
}

impl From<LabelId> for Operand {
    fn from(l: LabelId) -> Self {
        Self::Label(l)
    }
}

#[derive(Debug, Clone)]
pub struct Instr {
    pub id: InstrId,
    pub block: BlockId,
    pub opcode: Opcode,
    pub dest: Option<ValueId>,
    pub src: [Operand; 3],
    pub next: Option<InstrId>,
    pub prev: Option<InstrId>,
    /// Position of the instruction within the function (assigned by value reduction).
    pub ordinal: u32,
    /// Set when the instruction has been unlinked from its block.
    pub removed: bool,
}

impl Instr {
    /// Iterate over all value operands of the instruction.
    pub fn value_operands(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.src.iter().filter_map(|x| x.as_value())
    }

    #[inline]
    pub fn src_value(&self, slot: usize) -> ValueId {
        match self.src[slot] {
            Operand::Value(v) => v,
            other => panic!("{} operand {slot} is not a value: {other:?}", self.id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Label {
    pub id: LabelId,
    pub block: Option<BlockId>,
    pub next: Option<LabelId>,
    pub prev: Option<LabelId>,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub next: Option<BlockId>,
    pub prev: Option<BlockId>,
    pub label_head: Option<LabelId>,
    pub label_tail: Option<LabelId>,
    pub instr_head: Option<InstrId>,
    pub instr_tail: Option<InstrId>,
    pub predecessors: Vec<BlockId>,
    pub successors: Vec<BlockId>,
    pub ordinal: u32,
    pub removed: bool,
}

impl Block {
    fn new(id: BlockId) -> Self {
        Self {
            id,
            next: None,
            prev: None,
            label_head: None,
            label_tail: None,
            instr_head: None,
            instr_tail: None,
            predecessors: vec![],
            successors: vec![],
            ordinal: 0,
            removed: false,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instr_head.is_none()
    }
}

/// The HIR of a single guest function.
///
/// Blocks, instructions, values and labels live in per-function tables and refer to each other by
/// index. Blocks form a doubly linked list in program order, and each block holds doubly linked
/// lists of its labels and instructions.
#[derive(Clone)]
pub struct Function {
    pub address: u32,
    pub end_address: u32,
    blocks: Vec<Block>,
    instrs: Vec<Instr>,
    values: Vec<Value>,
    labels: Vec<Label>,
    comments: Vec<String>,
    /// The types of local slots used by `load_local`/`store_local`.
    pub locals: Vec<TypeName>,
    first_block: Option<BlockId>,
    last_block: Option<BlockId>,
    pub(crate) current_block: Option<BlockId>,
}

impl Function {
    pub fn new(address: u32) -> Self {
        Self {
            address,
            end_address: address,
            blocks: vec![],
            instrs: vec![],
            values: vec![],
            labels: vec![],
            comments: vec![],
            locals: vec![],
            first_block: None,
            last_block: None,
            current_block: None,
        }
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    #[inline]
    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id.index()]
    }

    #[inline]
    pub fn instr_mut(&mut self, id: InstrId) -> &mut Instr {
        &mut self.instrs[id.index()]
    }

    #[inline]
    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.index()]
    }

    #[inline]
    pub fn value_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.values[id.index()]
    }

    #[inline]
    pub fn ty(&self, id: ValueId) -> TypeName {
        self.values[id.index()].ty
    }

    #[inline]
    pub fn label(&self, id: LabelId) -> &Label {
        &self.labels[id.index()]
    }

    #[inline]
    pub fn label_mut(&mut self, id: LabelId) -> &mut Label {
        &mut self.labels[id.index()]
    }

    pub fn comment_text(&self, index: u32) -> &str {
        self.comments.get(index as usize).map_or("", |x| x.as_str())
    }

    pub fn first_block(&self) -> Option<BlockId> {
        self.first_block
    }

    pub fn last_block(&self) -> Option<BlockId> {
        self.last_block
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    pub fn instr_capacity(&self) -> usize {
        self.instrs.len()
    }

    /// Returns the ids of all linked blocks in program order.
    pub fn block_ids(&self) -> Vec<BlockId> {
        let mut out = vec![];
        let mut cursor = self.first_block;
        while let Some(id) = cursor {
            out.push(id);
            cursor = self.blocks[id.index()].next;
        }
        out
    }

    /// Returns the ids of all linked instructions in `block` in order.
    pub fn instr_ids(&self, block: BlockId) -> Vec<InstrId> {
        let mut out = vec![];
        let mut cursor = self.blocks[block.index()].instr_head;
        while let Some(id) = cursor {
            out.push(id);
            cursor = self.instrs[id.index()].next;
        }
        out
    }

    /// Returns the ids of all labels bound to `block`.
    pub fn label_ids(&self, block: BlockId) -> Vec<LabelId> {
        let mut out = vec![];
        let mut cursor = self.blocks[block.index()].label_head;
        while let Some(id) = cursor {
            out.push(id);
            cursor = self.labels[id.index()].next;
        }
        out
    }

    /// Returns all linked instructions in the function in program order.
    pub fn all_instrs(&self) -> Vec<InstrId> {
        self.block_ids().into_iter().flat_map(|block| self.instr_ids(block)).collect()
    }

    /// Total number of linked instructions, excluding those that generate no code.
    pub fn instr_count(&self, table: &OpcodeTable) -> usize {
        self.all_instrs()
            .into_iter()
            .filter(|id| !table.flags(self.instr(*id).opcode).contains(OpcodeFlags::IGNORE))
            .count()
    }

    /// Returns the last linked instruction of `block`, ignoring trailing instructions that
    /// generate no code.
    pub fn terminator(&self, block: BlockId, table: &OpcodeTable) -> Option<InstrId> {
        let mut cursor = self.blocks[block.index()].instr_tail;
        while let Some(id) = cursor {
            let instr = &self.instrs[id.index()];
            if !table.flags(instr.opcode).contains(OpcodeFlags::IGNORE) {
                return Some(id);
            }
            cursor = instr.prev;
        }
        None
    }

    //
    // Structure manipulation
    //

    pub fn alloc_value(&mut self, ty: TypeName) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(Value::new(id, ty));
        id
    }

    pub fn add_comment(&mut self, text: impl Into<String>) -> u32 {
        self.comments.push(text.into());
        self.comments.len() as u32 - 1
    }

    pub fn new_label(&mut self) -> LabelId {
        let id = LabelId(self.labels.len() as u32);
        self.labels.push(Label { id, block: None, next: None, prev: None, name: None });
        id
    }

    /// Creates a new, empty block after `after` (or at the end of the function if `after` is
    /// `None`).
    pub fn insert_block(&mut self, after: Option<BlockId>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(id));

        match after.or(self.last_block) {
            Some(prev) => {
                let next = self.blocks[prev.index()].next;
                self.blocks[id.index()].prev = Some(prev);
                self.blocks[id.index()].next = next;
                self.blocks[prev.index()].next = Some(id);
                match next {
                    Some(next) => self.blocks[next.index()].prev = Some(id),
                    None => self.last_block = Some(id),
                }
            }
            None => {
                self.first_block = Some(id);
                self.last_block = Some(id);
            }
        }
        id
    }

    /// Unlinks `block` from the function, removing all instructions it contains and detaching its
    /// labels.
    pub fn remove_block(&mut self, block: BlockId) {
        for instr in self.instr_ids(block) {
            self.remove_instr(instr);
        }
        for label in self.label_ids(block) {
            let label = &mut self.labels[label.index()];
            label.block = None;
            label.next = None;
            label.prev = None;
        }

        let (prev, next) = {
            let b = &mut self.blocks[block.index()];
            b.label_head = None;
            b.label_tail = None;
            b.removed = true;
            (b.prev.take(), b.next.take())
        };
        match prev {
            Some(prev) => self.blocks[prev.index()].next = next,
            None => self.first_block = next,
        }
        match next {
            Some(next) => self.blocks[next.index()].prev = prev,
            None => self.last_block = prev,
        }
        if self.current_block == Some(block) {
            self.current_block = None;
        }
    }

    /// Binds `label` to `block`, appending it to the block's label list.
    pub fn attach_label(&mut self, label: LabelId, block: BlockId) {
        let tail = self.blocks[block.index()].label_tail;
        {
            let l = &mut self.labels[label.index()];
            assert!(l.block.is_none(), "{label} is already bound to a block");
            l.block = Some(block);
            l.prev = tail;
            l.next = None;
        }
        match tail {
            Some(tail) => self.labels[tail.index()].next = Some(label),
            None => self.blocks[block.index()].label_head = Some(label),
        }
        self.blocks[block.index()].label_tail = Some(label);
    }

    /// Appends a new instruction to the end of `block`.
    pub fn push_instr(
        &mut self,
        block: BlockId,
        opcode: Opcode,
        dest: Option<TypeName>,
        src: [Operand; 3],
    ) -> InstrId {
        let id = InstrId(self.instrs.len() as u32);
        let dest = dest.map(|ty| {
            let value = self.alloc_value(ty);
            self.values[value.index()].def = Some(id);
            value
        });

        let tail = self.blocks[block.index()].instr_tail;
        self.instrs.push(Instr {
            id,
            block,
            opcode,
            dest,
            src: [Operand::None; 3],
            next: None,
            prev: tail,
            ordinal: 0,
            removed: false,
        });
        match tail {
            Some(tail) => self.instrs[tail.index()].next = Some(id),
            None => self.blocks[block.index()].instr_head = Some(id),
        }
        self.blocks[block.index()].instr_tail = Some(id);

        for (slot, operand) in src.into_iter().enumerate() {
            self.set_src(id, slot, operand);
        }
        id
    }

    /// Replaces operand `slot` of `instr`, keeping use lists up to date.
    pub fn set_src(&mut self, instr: InstrId, slot: usize, operand: Operand) {
        let old = std::mem::replace(&mut self.instrs[instr.index()].src[slot], operand);
        if let Operand::Value(v) = old {
            self.remove_use(v, instr);
        }
        if let Operand::Value(v) = operand {
            self.values[v.index()].uses.push(instr);
        }
    }

    fn remove_use(&mut self, value: ValueId, instr: InstrId) {
        let uses = &mut self.values[value.index()].uses;
        if let Some(pos) = uses.iter().position(|x| *x == instr) {
            uses.swap_remove(pos);
        }
    }

    /// Changes the opcode of `instr` and replaces all of its operands. The destination is kept.
    pub fn replace_instr(&mut self, instr: InstrId, opcode: Opcode, src: [Operand; 3]) {
        self.instrs[instr.index()].opcode = opcode;
        for (slot, operand) in src.into_iter().enumerate() {
            self.set_src(instr, slot, operand);
        }
    }

    /// Unlinks `instr` from its block and drops the uses of its operands.
    ///
    /// The destination value (if any) is left in place: it is either unused or has been turned
    /// into a constant by the caller.
    pub fn remove_instr(&mut self, instr: InstrId) {
        if self.instrs[instr.index()].removed {
            return;
        }
        for slot in 0..3 {
            self.set_src(instr, slot, Operand::None);
        }

        let (block, prev, next) = {
            let i = &mut self.instrs[instr.index()];
            i.removed = true;
            i.opcode = Opcode::Nop;
            (i.block, i.prev.take(), i.next.take())
        };
        match prev {
            Some(prev) => self.instrs[prev.index()].next = next,
            None => self.blocks[block.index()].instr_head = next,
        }
        match next {
            Some(next) => self.instrs[next.index()].prev = prev,
            None => self.blocks[block.index()].instr_tail = prev,
        }

        if let Some(dest) = self.instrs[instr.index()].dest {
            if self.values[dest.index()].def == Some(instr) {
                self.values[dest.index()].def = None;
            }
        }
    }

    /// Replaces the result of `instr` with a constant and removes the instruction. Users of the
    /// result keep referring to the same value, which is now constant.
    pub fn fold_to_constant(&mut self, instr: InstrId, bits: u128) {
        if let Some(dest) = self.instrs[instr.index()].dest {
            self.values[dest.index()].set_constant(bits);
        }
        self.remove_instr(instr);
    }

    /// Rewrites every use of `old` to refer to `new` instead.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        if old == new {
            return;
        }
        let users = std::mem::take(&mut self.values[old.index()].uses);
        for user in users {
            for slot in 0..3 {
                if self.instrs[user.index()].src[slot] == Operand::Value(old) {
                    self.instrs[user.index()].src[slot] = Operand::Value(new);
                    self.values[new.index()].uses.push(user);
                }
            }
        }
    }

    /// Moves all instructions after `after` into a new block placed directly after the current
    /// one. Returns the new block.
    pub fn split_block_after(&mut self, after: InstrId) -> BlockId {
        let block = self.instrs[after.index()].block;
        let new_block = self.insert_block(Some(block));

        let rest = self.instrs[after.index()].next.take();
        if let Some(first) = rest {
            self.instrs[first.index()].prev = None;
            let old_tail = self.blocks[block.index()].instr_tail;
            self.blocks[new_block.index()].instr_head = Some(first);
            self.blocks[new_block.index()].instr_tail = old_tail;

            let mut cursor = Some(first);
            while let Some(id) = cursor {
                self.instrs[id.index()].block = new_block;
                cursor = self.instrs[id.index()].next;
            }
        }
        self.blocks[block.index()].instr_tail = Some(after);

        if self.current_block == Some(block) {
            self.current_block = Some(new_block);
        }
        new_block
    }

    /// Appends all instructions and labels of `src` to `dst` then removes `src`.
    pub fn merge_blocks(&mut self, dst: BlockId, src: BlockId) {
        for label in self.label_ids(src) {
            let l = &mut self.labels[label.index()];
            l.block = None;
            l.next = None;
            l.prev = None;
            self.attach_label(label, dst);
        }
        self.blocks[src.index()].label_head = None;
        self.blocks[src.index()].label_tail = None;

        if let Some(head) = self.blocks[src.index()].instr_head.take() {
            let src_tail = self.blocks[src.index()].instr_tail.take();
            let mut cursor = Some(head);
            while let Some(id) = cursor {
                self.instrs[id.index()].block = dst;
                cursor = self.instrs[id.index()].next;
            }

            match self.blocks[dst.index()].instr_tail {
                Some(tail) => {
                    self.instrs[tail.index()].next = Some(head);
                    self.instrs[head.index()].prev = Some(tail);
                }
                None => self.blocks[dst.index()].instr_head = Some(head),
            }
            self.blocks[dst.index()].instr_tail = src_tail;
        }

        if self.current_block == Some(src) {
            self.current_block = Some(dst);
        }
        self.remove_block(src);
    }

    //
    // Consistency checks
    //

    /// Panics if the instruction list of `block` contains a cycle.
    ///
    /// Uses a fast/slow pointer traversal so that the check terminates even on a corrupted list.
    pub fn assert_no_cycles(&self, block: BlockId) {
        let mut slow = self.blocks[block.index()].instr_head;
        let mut fast = slow;
        loop {
            fast = match fast.and_then(|x| self.instrs[x.index()].next) {
                Some(x) => self.instrs[x.index()].next,
                None => return,
            };
            slow = slow.and_then(|x| self.instrs[x.index()].next);
            if fast.is_some() && fast == slow {
                panic!("cycle detected in the instruction list of {block} ({:#x})", self.address);
            }
        }
    }

    /// Panics if the block list of the function contains a cycle.
    pub fn assert_no_block_cycles(&self) {
        let mut slow = self.first_block;
        let mut fast = slow;
        loop {
            fast = match fast.and_then(|x| self.blocks[x.index()].next) {
                Some(x) => self.blocks[x.index()].next,
                None => return,
            };
            slow = slow.and_then(|x| self.blocks[x.index()].next);
            if fast.is_some() && fast == slow {
                panic!("cycle detected in the block list of {:#x}", self.address);
            }
        }
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.display(), f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn simple_function() -> Function {
        let mut f = Function::new(0x1000);
        let a = f.load_context(0x18, TypeName::I64);
        let b = f.load_context(0x20, TypeName::I64);
        let sum = f.add(a, b);
        f.store_context(0x18, sum);
        f.ret();
        f
    }

    #[test]
    fn use_lists_are_tracked() {
        let mut f = simple_function();
        let block = f.first_block().unwrap();
        let instrs = f.instr_ids(block);
        assert_eq!(instrs.len(), 5);

        let add = instrs[2];
        let a = f.instr(add).src_value(0);
        assert_eq!(f.value(a).uses, vec![add]);

        f.remove_instr(add);
        assert!(f.value(a).uses.is_empty());
        assert_eq!(f.instr_ids(block).len(), 4);
    }

    #[test]
    fn split_and_merge() {
        let mut f = simple_function();
        let block = f.first_block().unwrap();
        let instrs = f.instr_ids(block);

        let new_block = f.split_block_after(instrs[1]);
        assert_eq!(f.instr_ids(block), &instrs[..2]);
        assert_eq!(f.instr_ids(new_block), &instrs[2..]);
        assert_eq!(f.instr(instrs[3]).block, new_block);

        f.merge_blocks(block, new_block);
        assert_eq!(f.instr_ids(block), instrs);
        assert_eq!(f.block_ids(), vec![block]);
    }

    #[test]
    fn no_cycles_in_valid_function() {
        let f = simple_function();
        f.assert_no_block_cycles();
        for block in f.block_ids() {
            f.assert_no_cycles(block);
        }
    }

    #[test]
    #[should_panic(expected = "cycle detected")]
    fn cycle_is_detected() {
        let mut f = simple_function();
        let block = f.first_block().unwrap();
        let instrs = f.instr_ids(block);
        f.instr_mut(instrs[3]).next = Some(instrs[1]);
        f.assert_no_cycles(block);
    }
}
