//! Compiled-module containers
//!
//! The on-disk format for compiled modules (`.slb`). The core treats the
//! container as opaque; this module is the loader's authoritative reader
//! and writer.
//!
//! Layout, all integers little-endian except bytecode jump offsets (which
//! live inside chunk bytes and stay big-endian):
//!
//! ```text
//! header    magic u32 | version u32 | flags u32 | section_count u32
//!           | timestamp u64 | checksum u32
//! directory section_count x { type u32 | size u32 | offset u32 }
//! payloads  section bytes at their directory offsets
//! ```
//!
//! The checksum is CRC-32 (IEEE polynomial, 0xFFFFFFFF initial,
//! post-inverted) over the entire file with the checksum field zeroed.
//! Readers verify magic and checksum before trusting anything else.

use std::time::{SystemTime, UNIX_EPOCH};

use swiftlang_core::{Chunk, Function, Handle, HeapData, Value};

use crate::error::ModuleError;
use crate::vm::Vm;

pub const MAGIC: u32 = 0x534C_4243; // "SLBC"
pub const VERSION: u32 = 1;

const HEADER_SIZE: usize = 28;
const DIR_ENTRY_SIZE: usize = 12;
const CHECKSUM_OFFSET: usize = 24;

/// Section kinds. `End` is a zero-size sentinel closing the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SectionType {
    Metadata = 1,
    Exports = 2,
    Imports = 3,
    Bytecode = 4,
    Natives = 5,
    End = 6,
}

impl SectionType {
    fn from_u32(value: u32) -> Option<SectionType> {
        match value {
            1 => Some(SectionType::Metadata),
            2 => Some(SectionType::Exports),
            3 => Some(SectionType::Imports),
            4 => Some(SectionType::Bytecode),
            5 => Some(SectionType::Natives),
            6 => Some(SectionType::End),
            _ => None,
        }
    }
}

/// What an export entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Function = 0,
    Value = 1,
}

/// One entry of the Exports section.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportEntry {
    pub name: String,
    pub kind: u8,
    pub bytecode_offset: u32,
    pub signature: String,
}

/// One entry of the Imports section.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportEntry {
    pub module: String,
    pub name: String,
    pub alias: String,
}

/// One entry of the Natives section: an export backed by a symbol in a
/// native library.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeEntry {
    pub export: String,
    pub symbol: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub name: String,
    pub version: String,
}

// ---- writer ---------------------------------------------------------------

/// Builds a container image in memory. The `End` sentinel is appended
/// automatically.
pub struct ContainerWriter {
    flags: u32,
    timestamp: u64,
    sections: Vec<(SectionType, Vec<u8>)>,
}

impl ContainerWriter {
    pub fn new() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            flags: 0,
            timestamp,
            sections: Vec::new(),
        }
    }

    pub fn add_section(&mut self, ty: SectionType, bytes: Vec<u8>) {
        self.sections.push((ty, bytes));
    }

    pub fn metadata(&mut self, meta: &Metadata) {
        let mut out = Vec::new();
        write_str(&mut out, &meta.name);
        write_str(&mut out, &meta.version);
        self.add_section(SectionType::Metadata, out);
    }

    pub fn exports(&mut self, entries: &[ExportEntry]) {
        let mut out = Vec::new();
        out.extend((entries.len() as u16).to_le_bytes());
        for e in entries {
            write_str(&mut out, &e.name);
            out.push(e.kind);
            out.extend(e.bytecode_offset.to_le_bytes());
            write_str(&mut out, &e.signature);
        }
        self.add_section(SectionType::Exports, out);
    }

    pub fn imports(&mut self, entries: &[ImportEntry]) {
        let mut out = Vec::new();
        out.extend((entries.len() as u16).to_le_bytes());
        for e in entries {
            write_str(&mut out, &e.module);
            write_str(&mut out, &e.name);
            write_str(&mut out, &e.alias);
        }
        self.add_section(SectionType::Imports, out);
    }

    pub fn natives(&mut self, entries: &[NativeEntry]) {
        let mut out = Vec::new();
        out.extend((entries.len() as u16).to_le_bytes());
        for e in entries {
            write_str(&mut out, &e.export);
            write_str(&mut out, &e.symbol);
            write_str(&mut out, &e.signature);
        }
        self.add_section(SectionType::Natives, out);
    }

    /// Serialize a compiled top-level function into the Bytecode section.
    pub fn bytecode(&mut self, vm: &Vm, function: Handle) -> Result<(), ModuleError> {
        let mut out = Vec::new();
        encode_function(vm, function, &mut out)?;
        self.add_section(SectionType::Bytecode, out);
        Ok(())
    }

    /// Produce the final image, checksummed.
    pub fn finish(mut self) -> Vec<u8> {
        self.sections.push((SectionType::End, Vec::new()));

        let count = self.sections.len();
        let mut image = Vec::new();
        image.extend(MAGIC.to_le_bytes());
        image.extend(VERSION.to_le_bytes());
        image.extend(self.flags.to_le_bytes());
        image.extend((count as u32).to_le_bytes());
        image.extend(self.timestamp.to_le_bytes());
        image.extend(0u32.to_le_bytes()); // checksum, patched below

        let mut offset = HEADER_SIZE + count * DIR_ENTRY_SIZE;
        for (ty, bytes) in &self.sections {
            image.extend((*ty as u32).to_le_bytes());
            image.extend((bytes.len() as u32).to_le_bytes());
            image.extend((offset as u32).to_le_bytes());
            offset += bytes.len();
        }
        for (_, bytes) in &self.sections {
            image.extend(bytes);
        }

        let checksum = checksum_of(&image);
        image[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
        image
    }
}

impl Default for ContainerWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC-32 of an image with its checksum field treated as zero.
pub fn checksum_of(image: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    if image.len() >= HEADER_SIZE {
        hasher.update(&image[..CHECKSUM_OFFSET]);
        hasher.update(&[0, 0, 0, 0]);
        hasher.update(&image[CHECKSUM_OFFSET + 4..]);
    } else {
        hasher.update(image);
    }
    hasher.finalize()
}

// ---- reader ---------------------------------------------------------------

/// A parsed, verified container.
#[derive(Debug)]
pub struct Container {
    data: Vec<u8>,
    pub version: u32,
    pub flags: u32,
    pub timestamp: u64,
    directory: Vec<(SectionType, usize, usize)>,
}

impl Container {
    /// Parse and verify an image. Magic and checksum are checked before
    /// the directory is trusted.
    pub fn parse(data: Vec<u8>) -> Result<Container, ModuleError> {
        if data.len() < HEADER_SIZE {
            return Err(ModuleError::Corrupt("file shorter than header".into()));
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(ModuleError::Corrupt(format!(
                "bad magic {:#010x}",
                magic
            )));
        }
        let stored = u32::from_le_bytes(
            data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].try_into().unwrap(),
        );
        let computed = checksum_of(&data);
        if stored != computed {
            return Err(ModuleError::Corrupt(format!(
                "checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            )));
        }

        let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(ModuleError::Corrupt(format!(
                "unsupported container version {}",
                version
            )));
        }
        let flags = u32::from_le_bytes(data[8..12].try_into().unwrap());
        let count = u32::from_le_bytes(data[12..16].try_into().unwrap()) as usize;
        let timestamp = u64::from_le_bytes(data[16..24].try_into().unwrap());

        let dir_end = HEADER_SIZE + count * DIR_ENTRY_SIZE;
        if data.len() < dir_end {
            return Err(ModuleError::Corrupt("truncated section directory".into()));
        }
        let mut directory = Vec::with_capacity(count);
        for i in 0..count {
            let at = HEADER_SIZE + i * DIR_ENTRY_SIZE;
            let ty = u32::from_le_bytes(data[at..at + 4].try_into().unwrap());
            let size = u32::from_le_bytes(data[at + 4..at + 8].try_into().unwrap()) as usize;
            let offset = u32::from_le_bytes(data[at + 8..at + 12].try_into().unwrap()) as usize;
            let Some(ty) = SectionType::from_u32(ty) else {
                return Err(ModuleError::Corrupt(format!("unknown section type {}", ty)));
            };
            if offset + size > data.len() {
                return Err(ModuleError::Corrupt("section extends past file end".into()));
            }
            directory.push((ty, offset, size));
        }

        Ok(Container {
            data,
            version,
            flags,
            timestamp,
            directory,
        })
    }

    pub fn section(&self, ty: SectionType) -> Option<&[u8]> {
        self.directory
            .iter()
            .find(|(t, _, _)| *t == ty)
            .map(|(_, offset, size)| &self.data[*offset..*offset + *size])
    }

    pub fn metadata(&self) -> Result<Option<Metadata>, ModuleError> {
        let Some(bytes) = self.section(SectionType::Metadata) else {
            return Ok(None);
        };
        let mut r = Reader::new(bytes);
        Ok(Some(Metadata {
            name: r.str16()?,
            version: r.str16()?,
        }))
    }

    pub fn exports(&self) -> Result<Vec<ExportEntry>, ModuleError> {
        let Some(bytes) = self.section(SectionType::Exports) else {
            return Ok(Vec::new());
        };
        let mut r = Reader::new(bytes);
        let count = r.u16()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(ExportEntry {
                name: r.str16()?,
                kind: r.u8()?,
                bytecode_offset: r.u32()?,
                signature: r.str16()?,
            });
        }
        Ok(entries)
    }

    pub fn imports(&self) -> Result<Vec<ImportEntry>, ModuleError> {
        let Some(bytes) = self.section(SectionType::Imports) else {
            return Ok(Vec::new());
        };
        let mut r = Reader::new(bytes);
        let count = r.u16()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(ImportEntry {
                module: r.str16()?,
                name: r.str16()?,
                alias: r.str16()?,
            });
        }
        Ok(entries)
    }

    pub fn natives(&self) -> Result<Vec<NativeEntry>, ModuleError> {
        let Some(bytes) = self.section(SectionType::Natives) else {
            return Ok(Vec::new());
        };
        let mut r = Reader::new(bytes);
        let count = r.u16()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(NativeEntry {
                export: r.str16()?,
                symbol: r.str16()?,
                signature: r.str16()?,
            });
        }
        Ok(entries)
    }

    /// Decode the Bytecode section into a heap function.
    pub fn decode_bytecode(&self, vm: &mut Vm) -> Result<Handle, ModuleError> {
        let Some(bytes) = self.section(SectionType::Bytecode) else {
            return Err(ModuleError::Corrupt("container has no bytecode".into()));
        };
        let mut r = Reader::new(bytes);
        decode_function(vm, &mut r)
    }
}

// ---- chunk (de)serialization ----------------------------------------------

const CONST_NIL: u8 = 0;
const CONST_FALSE: u8 = 1;
const CONST_TRUE: u8 = 2;
const CONST_NUMBER: u8 = 3;
const CONST_STRING: u8 = 4;
const CONST_FUNCTION: u8 = 5;

fn encode_function(vm: &Vm, handle: Handle, out: &mut Vec<u8>) -> Result<(), ModuleError> {
    let function = vm
        .heap
        .function(handle)
        .ok_or_else(|| ModuleError::Corrupt("bytecode constant is not a function".into()))?;
    write_str(out, vm.strings.resolve(function.name));
    out.push(function.arity);
    out.push(function.upvalue_count);

    let code = function.chunk.code();
    out.extend((code.len() as u32).to_le_bytes());
    out.extend(code);
    for i in 0..code.len() {
        out.extend(function.chunk.line_at(i).to_le_bytes());
    }

    let constants = function.chunk.constants();
    out.extend((constants.len() as u16).to_le_bytes());
    for value in constants {
        match *value {
            Value::Nil => out.push(CONST_NIL),
            Value::Bool(false) => out.push(CONST_FALSE),
            Value::Bool(true) => out.push(CONST_TRUE),
            Value::Number(n) => {
                out.push(CONST_NUMBER);
                out.extend(n.to_le_bytes());
            }
            Value::Str(id) => {
                out.push(CONST_STRING);
                write_str(out, vm.strings.resolve(id));
            }
            Value::Function(nested) => {
                out.push(CONST_FUNCTION);
                encode_function(vm, nested, out)?;
            }
            other => {
                return Err(ModuleError::Corrupt(format!(
                    "constant kind {:?} cannot be serialized",
                    other
                )));
            }
        }
    }
    Ok(())
}

fn decode_function(vm: &mut Vm, r: &mut Reader<'_>) -> Result<Handle, ModuleError> {
    let name = r.str16()?;
    let name = vm.strings.intern(&name);
    let arity = r.u8()?;
    let upvalue_count = r.u8()?;

    let code_len = r.u32()? as usize;
    let code = r.bytes(code_len)?.to_vec();
    let mut lines = Vec::with_capacity(code_len);
    for _ in 0..code_len {
        lines.push(r.u32()?);
    }

    let mut chunk = Chunk::new();
    for (byte, line) in code.iter().zip(lines.iter()) {
        chunk.write_byte(*byte, *line);
    }

    let const_count = r.u16()?;
    // Nested function handles are pinned while they sit outside any root;
    // the finished parent keeps them alive afterwards.
    let mut pinned = Vec::new();
    let result = (|| -> Result<Handle, ModuleError> {
        for _ in 0..const_count {
            let value = match r.u8()? {
                CONST_NIL => Value::Nil,
                CONST_FALSE => Value::Bool(false),
                CONST_TRUE => Value::Bool(true),
                CONST_NUMBER => Value::Number(f64::from_le_bytes(r.array::<8>()?)),
                CONST_STRING => {
                    let s = r.str16()?;
                    Value::Str(vm.strings.intern(&s))
                }
                CONST_FUNCTION => {
                    let nested = decode_function(vm, r)?;
                    vm.heap.pin(nested);
                    pinned.push(nested);
                    Value::Function(nested)
                }
                tag => {
                    return Err(ModuleError::Corrupt(format!(
                        "unknown constant tag {}",
                        tag
                    )));
                }
            };
            chunk.add_constant(value);
        }
        let mut function = Function::new(name, arity, std::mem::take(&mut chunk));
        function.upvalue_count = upvalue_count;
        vm.alloc(HeapData::Function(function))
            .map_err(|e| ModuleError::Init(e.to_string()))
    })();
    for handle in pinned {
        vm.heap.unpin(handle);
    }
    result
}

// ---- byte-level helpers ---------------------------------------------------

fn write_str(out: &mut Vec<u8>, s: &str) {
    out.extend((s.len() as u16).to_le_bytes());
    out.extend(s.as_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], ModuleError> {
        if self.pos + len > self.data.len() {
            return Err(ModuleError::Corrupt("unexpected end of section".into()));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ModuleError> {
        Ok(self.bytes(N)?.try_into().expect("length checked"))
    }

    fn u8(&mut self) -> Result<u8, ModuleError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, ModuleError> {
        Ok(u16::from_le_bytes(self.array::<2>()?))
    }

    fn u32(&mut self) -> Result<u32, ModuleError> {
        Ok(u32::from_le_bytes(self.array::<4>()?))
    }

    fn str16(&mut self) -> Result<String, ModuleError> {
        let len = self.u16()? as usize;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ModuleError::Corrupt("string is not UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swiftlang_core::OpCode;

    fn sample_image() -> Vec<u8> {
        let mut writer = ContainerWriter::new();
        writer.metadata(&Metadata {
            name: "demo".into(),
            version: "1.0.0".into(),
        });
        writer.exports(&[ExportEntry {
            name: "square".into(),
            kind: ExportKind::Function as u8,
            bytecode_offset: 0,
            signature: "(n)".into(),
        }]);
        writer.add_section(SectionType::Bytecode, vec![1, 2, 3]);
        writer.finish()
    }

    #[test]
    fn test_round_trip_header_and_sections() {
        let image = sample_image();
        let container = Container::parse(image).expect("image should verify");
        assert_eq!(container.version, VERSION);
        let meta = container.metadata().unwrap().unwrap();
        assert_eq!(meta.name, "demo");
        assert_eq!(meta.version, "1.0.0");
        let exports = container.exports().unwrap();
        assert_eq!(exports.len(), 1);
        assert_eq!(exports[0].name, "square");
        assert_eq!(container.section(SectionType::Bytecode), Some(&[1, 2, 3][..]));
        // The End sentinel closes the directory.
        assert_eq!(container.section(SectionType::End), Some(&[][..]));
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut image = sample_image();
        image[0] ^= 0xff;
        let err = Container::parse(image).unwrap_err();
        assert!(matches!(err, ModuleError::Corrupt(_)));
    }

    #[test]
    fn test_corruption_fails_checksum() {
        let mut image = sample_image();
        let last = image.len() - 1;
        image[last] ^= 0x01;
        let err = Container::parse(image).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_checksum_ignores_its_own_field() {
        let image = sample_image();
        // Recomputing over the finished image (checksum now nonzero, but
        // zeroed for the computation) matches the stored value.
        let stored = u32::from_le_bytes(image[24..28].try_into().unwrap());
        assert_eq!(checksum_of(&image), stored);
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let image = sample_image();
        let err = Container::parse(image[..20].to_vec()).unwrap_err();
        assert!(matches!(err, ModuleError::Corrupt(_)));
    }

    #[test]
    fn test_bytecode_function_round_trip() {
        let mut vm = Vm::new();

        // inner(n) just returns its argument; outer's constants hold it.
        let inner_name = vm.strings.intern("inner");
        let mut inner_chunk = Chunk::new();
        inner_chunk.write_op(OpCode::GetLocal, 1);
        inner_chunk.write_byte(1, 1);
        inner_chunk.write_op(OpCode::Return, 1);
        let inner = Function::new(inner_name, 1, inner_chunk);
        let inner_h = vm.alloc(HeapData::Function(inner)).unwrap();

        let outer_name = vm.strings.intern("outer");
        let mut outer_chunk = Chunk::new();
        outer_chunk.add_constant(Value::Number(2.5));
        outer_chunk.add_constant(Value::Str(vm.strings.intern("hi")));
        outer_chunk.add_constant(Value::Function(inner_h));
        outer_chunk.write_op(OpCode::Nil, 1);
        outer_chunk.write_op(OpCode::Return, 2);
        let outer = Function::new(outer_name, 0, outer_chunk);
        let outer_h = vm.alloc(HeapData::Function(outer)).unwrap();

        let mut writer = ContainerWriter::new();
        writer.bytecode(&vm, outer_h).unwrap();
        let image = writer.finish();

        let container = Container::parse(image).unwrap();
        let decoded = container.decode_bytecode(&mut vm).unwrap();
        let function = vm.heap.function(decoded).unwrap();
        assert_eq!(vm.strings.resolve(function.name), "outer");
        assert_eq!(function.arity, 0);
        assert_eq!(function.chunk.code().len(), 2);
        assert_eq!(function.chunk.line_at(1), 2);

        let constants = function.chunk.constants();
        assert_eq!(constants[0], Value::Number(2.5));
        assert_eq!(constants[1], Value::Str(vm.strings.intern("hi")));
        let Value::Function(decoded_inner) = constants[2] else {
            panic!("expected nested function constant");
        };
        let inner = vm.heap.function(decoded_inner).unwrap();
        assert_eq!(vm.strings.resolve(inner.name), "inner");
        assert_eq!(inner.arity, 1);
    }
}
