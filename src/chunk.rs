use crate::object::Object;
use crate::value::Value;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;

pub const MAX_CONSTANTS: usize = 256;

#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Constant,
    Nil,
    True,
    False,
    Pop,
    GetLocal,
    SetLocal,
    GetGlobal,
    DefineGlobal,
    SetGlobal,
    GetUpvalue,
    SetUpvalue,
    GetProperty,
    SetProperty,
    GetSuper,
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Not,
    Negate,
    Print,
    Assert,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    Invoke,
    SuperInvoke,
    Closure,
    CloseUpvalue,
    Return,
    Class,
    Inherit,
    Method,
}

impl Opcode {
    pub fn as_byte(self) -> u8 {
        self.into()
    }
}

#[derive(Default)]
pub struct Chunk {
    code: Vec<u8>,
    constants: Vec<Value>,
    lines: Vec<usize>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, byte: u8, line: usize) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn add_opcode(&mut self, opcode: Opcode, line: usize) {
        self.write(opcode.as_byte(), line)
    }

    pub fn add_opcode_and_operand(&mut self, opcode: Opcode, operand: u8, line: usize) {
        self.write(opcode.as_byte(), line);
        self.write(operand, line);
    }

    /// Returns the index of `value` in the constant pool, reusing an identical constant.
    /// `None` once the pool can no longer be addressed by a single byte.
    pub fn add_constant(&mut self, value: Value) -> Option<u8> {
        let existing_index = self.constants.iter().position(|c| c.is_identical(&value));
        if let Some(idx) = existing_index {
            return u8::try_from(idx).ok();
        }
        if self.constants.len() < MAX_CONSTANTS {
            self.constants.push(value);
            u8::try_from(self.constants.len() - 1).ok()
        } else {
            None
        }
    }

    pub fn get_constant(&self, index: u8) -> Option<&Value> {
        self.constants.get(index as usize)
    }

    pub fn line_at(&self, offset: usize) -> Option<usize> {
        self.lines.get(offset).copied()
    }

    /// Emits `opcode` followed by a two byte placeholder and returns the placeholder's offset.
    pub fn add_dummy_jump(&mut self, opcode: Opcode, line: usize) -> usize {
        self.add_opcode(opcode, line);
        self.write(u8::MAX, line);
        self.write(u8::MAX, line);
        self.code.len() - 2
    }

    /// Points the jump whose placeholder sits at `offset` at the end of the chunk.
    /// Returns false if the distance does not fit in 16 bits.
    pub fn patch_jump(&mut self, offset: usize) -> bool {
        let jump = self.code.len() - offset - 2;
        let Ok(jump) = u16::try_from(jump) else {
            return false;
        };
        let [high, low] = jump.to_be_bytes();
        self.code[offset] = high;
        self.code[offset + 1] = low;
        true
    }

    /// Emits a backwards jump to `loop_start`. Returns false if the body is too large.
    pub fn emit_loop(&mut self, loop_start: usize, line: usize) -> bool {
        self.add_opcode(Opcode::Loop, line);
        let offset = self.code.len() - loop_start + 2;
        let (fits, offset) = match u16::try_from(offset) {
            Ok(offset) => (true, offset),
            Err(_) => (false, u16::MAX),
        };
        let [high, low] = offset.to_be_bytes();
        self.write(high, line);
        self.write(low, line);
        fits
    }

    pub fn disassemble<'c>(&'c self, name: &'c str) -> Disassembly<'c> {
        Disassembly { chunk: self, name }
    }

    pub fn instruction_at(&self, offset: usize) -> InstructionAt<'_> {
        InstructionAt {
            chunk: self,
            offset,
        }
    }

    fn read_short(&self, offset: usize) -> Option<u16> {
        let high = *self.code.get(offset)?;
        let low = *self.code.get(offset + 1)?;
        Some(u16::from_be_bytes([high, low]))
    }

    /// Length in bytes of the instruction starting at `offset`, operands included.
    pub fn instruction_len(&self, offset: usize) -> usize {
        let Some(opcode) = self.code.get(offset).and_then(|b| Opcode::try_from(*b).ok()) else {
            return 1;
        };
        use Opcode::*;
        match opcode {
            Constant | GetLocal | SetLocal | GetGlobal | DefineGlobal | SetGlobal | GetUpvalue
            | SetUpvalue | GetProperty | SetProperty | GetSuper | Call | Class | Method => 2,
            Jump | JumpIfFalse | Loop | Invoke | SuperInvoke => 3,
            Closure => {
                let upvalue_count = self
                    .code
                    .get(offset + 1)
                    .and_then(|idx| self.get_constant(*idx))
                    .map(|c| match c {
                        Value::Obj(Object::Function(f)) => f.upvalue_count,
                        _ => 0,
                    })
                    .unwrap_or(0);
                2 + 2 * upvalue_count
            }
            _ => 1,
        }
    }

    fn write_instruction(&self, f: &mut Formatter<'_>, offset: usize) -> std::fmt::Result {
        write!(f, "0x{offset:04x} ")?;
        match (self.line_at(offset), offset.checked_sub(1).and_then(|o| self.line_at(o))) {
            (Some(line), Some(previous)) if line == previous => write!(f, "   | ")?,
            (Some(line), _) => write!(f, "{line:04} ")?,
            (None, _) => write!(f, "???? ")?,
        }

        let Some(&byte) = self.code.get(offset) else {
            return write!(f, "(end of chunk)");
        };
        let Ok(opcode) = Opcode::try_from(byte) else {
            return write!(f, "Unknown opcode 0x{byte:02x}");
        };
        let operand = |n: usize| self.code.get(offset + n).copied();
        use Opcode::*;
        match opcode {
            Constant | GetGlobal | DefineGlobal | SetGlobal | GetProperty | SetProperty
            | GetSuper | Class | Method => self.constant_instruction(f, opcode, operand(1)),
            GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call => match operand(1) {
                Some(idx) => write!(f, "{opcode:?} {idx}"),
                None => write!(f, "{opcode:?} (unknown)"),
            },
            Jump | JumpIfFalse | Loop => {
                let Some(jump) = self.read_short(offset + 1) else {
                    return write!(f, "{opcode:?} (unknown)");
                };
                let target = if opcode == Loop {
                    (offset + 3).checked_sub(jump as usize)
                } else {
                    Some(offset + 3 + jump as usize)
                };
                match target {
                    Some(target) => write!(f, "{opcode:?} 0x{offset:04x} -> 0x{target:04x}"),
                    None => write!(f, "{opcode:?} 0x{offset:04x} -> (invalid)"),
                }
            }
            Invoke | SuperInvoke => {
                self.constant_instruction(f, opcode, operand(1))?;
                match operand(2) {
                    Some(args) => write!(f, " ({args} args)"),
                    None => write!(f, " (unknown args)"),
                }
            }
            Closure => {
                self.constant_instruction(f, opcode, operand(1))?;
                let mut at = offset + 2;
                while at < offset + self.instruction_len(offset) {
                    match (operand(at - offset), operand(at - offset + 1)) {
                        (Some(is_local), Some(index)) => write!(
                            f,
                            "\n       |   {} {index}",
                            if is_local == 1 { "local" } else { "upvalue" }
                        )?,
                        _ => write!(f, "\n       |   (unknown)")?,
                    }
                    at += 2;
                }
                Ok(())
            }
            Nil | True | False | Pop | Equal | Greater | Less | Add | Subtract | Multiply
            | Divide | Not | Negate | Print | Assert | CloseUpvalue | Return | Inherit => {
                write!(f, "{opcode:?}")
            }
        }
    }

    fn constant_instruction(
        &self,
        f: &mut Formatter<'_>,
        opcode: Opcode,
        operand: Option<u8>,
    ) -> std::fmt::Result {
        match operand {
            Some(idx) => match self.get_constant(idx) {
                Some(value) => write!(f, "{opcode:?} {idx} {value}"),
                None => write!(f, "{opcode:?} (index 0x{idx:02x} unknown)"),
            },
            None => write!(f, "{opcode:?} (unknown)"),
        }
    }
}

/// Display adapter printing a whole chunk, one instruction per line.
pub struct Disassembly<'c> {
    chunk: &'c Chunk,
    name: &'c str,
}

impl Display for Disassembly<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "== {} ==", self.name)?;
        let mut offset = 0;
        while offset < self.chunk.code.len() {
            self.chunk.write_instruction(f, offset)?;
            writeln!(f)?;
            offset += self.chunk.instruction_len(offset);
        }
        Ok(())
    }
}

/// Display adapter printing the single instruction at an offset.
pub struct InstructionAt<'c> {
    chunk: &'c Chunk,
    offset: usize,
}

impl Display for InstructionAt<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.chunk.write_instruction(f, self.offset)
    }
}

impl Debug for Chunk {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.disassemble("chunk"))?;
        writeln!(f, "Constants:")?;
        for (i, c) in self.constants.iter().enumerate() {
            writeln!(f, "{i:04}: {c:?}")?;
        }
        Ok(())
    }
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_parallel_code() {
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(1.2)).unwrap();
        chunk.add_opcode_and_operand(Opcode::Constant, idx, 1);
        chunk.add_opcode(Opcode::Negate, 2);
        chunk.add_opcode(Opcode::Return, 2);
        assert_eq!(chunk.len(), 4);
        assert_eq!(chunk.line_at(0), Some(1));
        assert_eq!(chunk.line_at(1), Some(1));
        assert_eq!(chunk.line_at(3), Some(2));
        assert_eq!(chunk.line_at(4), None);
    }

    #[test]
    fn constants_are_reused() {
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::string("x")).unwrap();
        let b = chunk.add_constant(Value::Number(2.0)).unwrap();
        let c = chunk.add_constant(Value::string("x")).unwrap();
        assert_eq!(a, c);
        assert_ne!(a, b);
    }

    #[test]
    fn nearly_equal_numbers_get_their_own_constant() {
        let mut chunk = Chunk::new();
        let one = chunk.add_constant(Value::Number(1.0)).unwrap();
        let close = chunk.add_constant(Value::Number(1.0000000001)).unwrap();
        assert_ne!(one, close);
        match chunk.get_constant(close) {
            Some(Value::Number(n)) => assert_eq!(n.to_bits(), 1.0000000001f64.to_bits()),
            other => panic!("unexpected constant {other:?}"),
        }
        assert_eq!(chunk.add_constant(Value::Number(1.0)), Some(one));
    }

    #[test]
    fn constant_pool_is_limited() {
        let mut chunk = Chunk::new();
        for i in 0..MAX_CONSTANTS {
            assert_eq!(chunk.add_constant(Value::Number(i as f64)), Some(i as u8));
        }
        assert_eq!(chunk.add_constant(Value::Number(-1.0)), None);
        // Existing constants are still reachable.
        assert_eq!(chunk.add_constant(Value::Number(3.0)), Some(3));
    }

    #[test]
    fn patch_jump_writes_big_endian_distance() {
        let mut chunk = Chunk::new();
        let jump = chunk.add_dummy_jump(Opcode::JumpIfFalse, 1);
        for _ in 0..300 {
            chunk.add_opcode(Opcode::Nil, 1);
        }
        assert!(chunk.patch_jump(jump));
        assert_eq!(chunk[jump], 0x01);
        assert_eq!(chunk[jump + 1], 0x2c);
    }

    #[test]
    fn patch_jump_rejects_long_jumps() {
        let mut chunk = Chunk::new();
        let jump = chunk.add_dummy_jump(Opcode::Jump, 1);
        for _ in 0..=u16::MAX as usize {
            chunk.add_opcode(Opcode::Pop, 1);
        }
        assert!(!chunk.patch_jump(jump));
    }

    #[test]
    fn loop_jumps_back_to_start() {
        let mut chunk = Chunk::new();
        chunk.add_opcode(Opcode::Nil, 1);
        chunk.add_opcode(Opcode::Pop, 1);
        assert!(chunk.emit_loop(0, 1));
        // Loop sits at 2, operands at 3..5; ip after reading is 5, minus 5 lands on 0.
        assert_eq!(chunk.read_short(3), Some(5));
    }

    #[test]
    fn disassembly_lists_instructions() {
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(1.5)).unwrap();
        chunk.add_opcode_and_operand(Opcode::Constant, idx, 1);
        chunk.add_opcode(Opcode::Print, 1);
        let jump = chunk.add_dummy_jump(Opcode::Jump, 2);
        assert!(chunk.patch_jump(jump));
        chunk.add_opcode(Opcode::Return, 2);
        let text = chunk.disassemble("test").to_string();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "== test ==");
        assert_eq!(lines[1], "0x0000 0001 Constant 0 1.5");
        assert_eq!(lines[2], "0x0002    | Print");
        assert_eq!(lines[3], "0x0003 0002 Jump 0x0003 -> 0x0006");
        assert_eq!(lines[4], "0x0006    | Return");
    }
}
