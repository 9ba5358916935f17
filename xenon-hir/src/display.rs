use crate::{Block, Function, Instr, LabelId, Opcode, Operand, ValueId};

pub trait HirDisplay<T>: Sized {
    fn fmt(&self, f: &mut std::fmt::Formatter, ctx: &T) -> std::fmt::Result;
    fn display<'a>(&'a self, ctx: &'a T) -> DisplayWrapper<'a, T, Self> {
        DisplayWrapper { ctx, value: self }
    }
}

pub struct DisplayWrapper<'a, T, U> {
    ctx: &'a T,
    value: &'a U,
}

impl<'a, T, U> std::fmt::Display for DisplayWrapper<'a, T, U>
where
    U: HirDisplay<T>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f, self.ctx)
    }
}

impl<'a, T, U> std::fmt::Debug for DisplayWrapper<'a, T, U>
where
    U: HirDisplay<T>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f, self.ctx)
    }
}

impl HirDisplay<Function> for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter, ctx: &Function) -> std::fmt::Result {
        let value = ctx.value(*self);
        match value.const_bits() {
            Some(bits) if value.ty.is_float() => match value.ty {
                crate::TypeName::F32 => write!(f, "{:?}:f32", f32::from_bits(bits as u32)),
                _ => write!(f, "{:?}:f64", f64::from_bits(bits as u64)),
            },
            Some(bits) => write!(f, "{bits:#x}:{}", value.ty),
            None => write!(f, "{self}:{}", value.ty),
        }
    }
}

impl HirDisplay<Function> for LabelId {
    fn fmt(&self, f: &mut std::fmt::Formatter, ctx: &Function) -> std::fmt::Result {
        match &ctx.label(*self).name {
            Some(name) => f.write_str(name),
            None => write!(f, "{self}"),
        }
    }
}

impl HirDisplay<Function> for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter, ctx: &Function) -> std::fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Value(v) => v.fmt(f, ctx),
            Operand::Label(l) => l.fmt(f, ctx),
            Operand::Offset(x) => write!(f, "{x:#x}"),
            Operand::Symbol(addr) => write!(f, "sub_{addr:08x}"),
            Operand::Extern(index) => write!(f, "extern[{index}]"),
            Operand::Comment(index) => write!(f, "\"{}\"", ctx.comment_text(*index)),
        }
    }
}

impl HirDisplay<Function> for Instr {
    fn fmt(&self, f: &mut std::fmt::Formatter, ctx: &Function) -> std::fmt::Result {
        match self.opcode {
            Opcode::Comment => return write!(f, "; {}", self.src[0].display(ctx)),
            Opcode::SourceOffset => {
                return write!(f, "// {:08x}", self.src[0].as_offset().unwrap_or(0));
            }
            _ => {}
        }

        if let Some(dest) = self.dest {
            write!(f, "{dest}:{} = ", ctx.ty(dest))?;
        }
        f.write_str(self.opcode.name())?;

        let mut first = true;
        for operand in self.src.iter().filter(|x| **x != Operand::None) {
            f.write_str(if first { " " } else { ", " })?;
            operand.fmt(f, ctx)?;
            first = false;
        }
        Ok(())
    }
}

impl HirDisplay<Function> for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter, ctx: &Function) -> std::fmt::Result {
        write!(f, "{}:", self.id)?;
        for label in ctx.label_ids(self.id) {
            write!(f, " {}", label.display(ctx))?;
        }
        if !self.predecessors.is_empty() {
            f.write_str("  ; preds:")?;
            for pred in &self.predecessors {
                write!(f, " {pred}")?;
            }
        }
        writeln!(f)?;

        for instr in ctx.instr_ids(self.id) {
            writeln!(f, "    {}", ctx.instr(instr).display(ctx))?;
        }
        Ok(())
    }
}

pub struct FunctionDisplay<'a>(&'a Function);

impl std::fmt::Display for FunctionDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let func = self.0;
        writeln!(f, "function {:#x}..={:#x}", func.address, func.end_address)?;
        for block in func.block_ids() {
            write!(f, "{}", func.block(block).display(func))?;
        }
        Ok(())
    }
}

impl Function {
    /// Returns a wrapper that formats the function as text.
    pub fn display(&self) -> FunctionDisplay<'_> {
        FunctionDisplay(self)
    }
}

#[test]
fn display_function() {
    let mut f = Function::new(0x8200_0000);
    f.end_address = 0x8200_000c;
    f.source_offset(0x8200_0000);
    let a = f.load_context(0x18, crate::TypeName::I64);
    let b = f.add_imm(a, 4);
    f.store_context(0x18, b);
    f.ret();

    let text = f.display().to_string();
    assert_eq!(
        text,
        "function 0x82000000..=0x8200000c\n\
         b0:\n    \
         // 82000000\n    \
         v0:i64 = load_context 0x18\n    \
         v2:i64 = add v0:i64, 0x4:i64\n    \
         store_context 0x18, v2:i64\n    \
         return\n"
    );
}
