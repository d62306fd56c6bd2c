use crate::bytecode::Instruction;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Slots in the auxiliary register stack before any call.
pub const AUX_BASE_SIZE: usize = 64;

/// Slots pushed onto the front of the auxiliary stack per call.
pub const AUX_WINDOW_SIZE: usize = 48;

/// Width in bytes of one value cell.
pub const VALUE_WIDTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldId(pub usize);

/// Errors decoding or encoding a serialized executable.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("malformed executable: {0}")]
    Codec(#[from] postcard::Error),
}

/// One function, constructor or destructor body plus its private constants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub code: Vec<Instruction>,
    /// Integer constants only; `Constant` indexes this through the window.
    pub constants: Vec<i64>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// The implicit chunk 0: a lone `Return`.
    pub fn return_only() -> Self {
        Self {
            code: vec![Instruction::bare(crate::bytecode::Opcode::Return)],
            constants: Vec::new(),
        }
    }

    pub fn from_code(code: Vec<Instruction>) -> Self {
        Self {
            code,
            constants: Vec::new(),
        }
    }

    /// Code as a flat array of 2-byte units.
    pub fn code_bytes(&self) -> Vec<u8> {
        self.code.iter().flat_map(|inst| inst.to_bytes()).collect()
    }
}

/// What a field or boxed value holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Long,
    Double,
    CodePtr,
    DataPtr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassRecord {
    pub name: String,
    pub fields: Vec<ValueKind>,
    /// Chunk 0 when the class has no constructor.
    pub ctor: ChunkId,
    /// Chunk 0 when the class has no destructor.
    pub dtor: ChunkId,
}

impl ClassRecord {
    /// Cells an instance occupies: the class-id header plus one per field.
    pub fn cells(&self) -> usize {
        self.fields.len() + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Symbol {
    Unresolved,
    Address(u64),
    Class(ClassId),
    Chunk(ChunkId),
    Field(FieldId),
}

/// A compiled program, ready for the interpreter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Executable {
    /// Convention: `chunks[0]` is the implicit return-only chunk.
    pub chunks: Vec<Chunk>,
    /// Byte address of each chunk when laid out back to back.
    pub chunk_locations: Vec<u64>,
    pub globals: Vec<i64>,
    pub classes: Vec<ClassRecord>,
    /// Ordered so that encoding is deterministic.
    pub symbols: BTreeMap<String, Symbol>,
    /// Chunk execution starts in.
    pub entry: ChunkId,
}

impl Default for Executable {
    fn default() -> Self {
        Self::new()
    }
}

impl Executable {
    /// An executable holding only the implicit chunk 0.
    pub fn new() -> Self {
        Self {
            chunks: vec![Chunk::return_only()],
            chunk_locations: vec![0],
            globals: Vec::new(),
            classes: Vec::new(),
            symbols: BTreeMap::new(),
            entry: ChunkId(1),
        }
    }

    /// Convenience for hand-assembled programs: chunk 0 followed by `chunks`,
    /// entering at chunk 1.
    pub fn from_chunks(chunks: Vec<Chunk>) -> Self {
        let mut exe = Self::new();
        exe.chunks.extend(chunks);
        exe.relocate();
        exe
    }

    /// Recompute `chunk_locations` from the current chunk sizes.
    pub fn relocate(&mut self) {
        let mut address = 0u64;
        self.chunk_locations = self
            .chunks
            .iter()
            .map(|chunk| {
                let base = address;
                address += (chunk.code.len() * 2) as u64;
                base
            })
            .collect();
    }

    pub fn symbol(&self, name: &str) -> Option<Symbol> {
        self.symbols.get(name).copied()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;

    #[test]
    fn test_new_executable_has_return_chunk() {
        let exe = Executable::new();
        assert_eq!(exe.chunks.len(), 1);
        assert_eq!(exe.chunks[0].code, vec![Instruction::bare(Opcode::Return)]);
        assert_eq!(exe.chunk_locations, vec![0]);
    }

    #[test]
    fn test_relocate_lays_chunks_back_to_back() {
        let exe = Executable::from_chunks(vec![
            Chunk::from_code(vec![Opcode::Nop.into(), Opcode::Nop.into(), Opcode::Return.into()]),
            Chunk::from_code(vec![Opcode::Return.into()]),
        ]);
        assert_eq!(exe.chunk_locations, vec![0, 2, 8]);
    }

    #[test]
    fn test_code_bytes_are_two_per_instruction() {
        let chunk = Chunk::from_code(vec![
            Instruction::new(Opcode::ImmByte, -1),
            Instruction::bare(Opcode::Exit),
        ]);
        assert_eq!(chunk.code_bytes(), vec![0x40, 0xFF, 0x01, 0x00]);
    }

    #[test]
    fn test_encoding_survives_decode() {
        let mut exe = Executable::from_chunks(vec![Chunk {
            code: vec![Instruction::new(Opcode::Constant, 0), Opcode::Exit.into()],
            constants: vec![1 << 40],
        }]);
        exe.symbols.insert("main".to_string(), Symbol::Chunk(ChunkId(1)));
        exe.classes.push(ClassRecord {
            name: "Pair".to_string(),
            fields: vec![ValueKind::Long, ValueKind::DataPtr],
            ctor: ChunkId(0),
            dtor: ChunkId(0),
        });

        let bytes = exe.to_bytes().unwrap();
        assert_eq!(Executable::from_bytes(&bytes).unwrap(), exe);
    }

    #[test]
    fn test_truncated_bytes_are_rejected() {
        let bytes = Executable::new().to_bytes().unwrap();
        let err = Executable::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(err.to_string().contains("malformed executable"));
    }
}
