//! Symbol tables read from the `pclntab` that the Go linker embeds in every executable.
//!
//! The table maps each compiled function to its entry and end addresses, and carries
//! compact pc-value tables from which the file and line of any pc can be decoded.
//! Supported layouts are those written by Go 1.16, 1.18, and 1.20 and later, for
//! little-endian 64-bit targets.

use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::Path;

use object::{Object, ObjectSection};
use tracing::{debug, info};

use crate::error::{Error, Result};

const GO116_MAGIC: u32 = 0xffff_fffa;
const GO118_MAGIC: u32 = 0xffff_fff0;
const GO120_MAGIC: u32 = 0xffff_fff1;

/// Internally-linked executables use the first name, PIE builds the second.
const SECTION_NAMES: [&str; 2] = [".gopclntab", ".data.rel.ro.gopclntab"];

const HEADER_SIZE: usize = 8;
const PTR_SIZE: usize = 8;

// Indices of the `u32` fields following the entry in a `_func` record.
const FIELD_NAME: usize = 1;
const FIELD_PCFILE: usize = 5;
const FIELD_PCLN: usize = 6;
const FIELD_CU: usize = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Version {
    Go116,
    Go118,
    Go120,
}

impl Version {
    fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            GO116_MAGIC => Some(Version::Go116),
            GO118_MAGIC => Some(Version::Go118),
            GO120_MAGIC => Some(Version::Go120),
            _ => None,
        }
    }

    // Size of the entry fields in the functab and in `_func` records. Since 1.18 these
    // are `u32` offsets from the start of the text segment.
    fn entry_size(self) -> usize {
        match self {
            Version::Go116 => PTR_SIZE,
            Version::Go118 | Version::Go120 => 4,
        }
    }
}

/// A compiled function.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Function {
    pub name: String,
    pub entry: u64,
    pub end: u64,

    // Offset of the `_func` record in the table.
    record: usize,
}

impl Function {
    pub fn contains(&self, pc: u64) -> bool {
        self.entry <= pc && pc < self.end
    }
}

/// The source position of a program counter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub function: Function,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {} in {}", self.function.name, self.line, self.file)
    }
}

/// Immutable function and line table of one executable.
#[derive(Clone, Debug)]
pub struct SymbolTable {
    data: Vec<u8>,
    version: Version,
    quantum: u32,
    text_start: u64,

    // Offsets of the subtables within `data`.
    funcnametab: usize,
    cutab: usize,
    filetab: usize,
    pctab: usize,
    functab: usize,

    /// Sorted by entry address, non-overlapping.
    functions: Vec<Function>,
}

impl SymbolTable {
    /// Read the symbol table embedded in the ELF executable at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let bytes = fs::read(path)
            .map_err(|err| Error::load(format!("could not read {}: {}", path.display(), err)))?;
        let file = object::File::parse(&*bytes)
            .map_err(|err| Error::load(format!("{}: {}", path.display(), err)))?;

        let section = SECTION_NAMES
            .iter()
            .find_map(|name| file.section_by_name(name))
            .ok_or_else(|| Error::load(format!("{} has no .gopclntab section", path.display())))?;
        let data = section
            .data()
            .map_err(|err| Error::load(format!("{}: {}", path.display(), err)))?
            .to_vec();

        // The header's copy of the text start may be unrelocated, so prefer the section.
        let text_start = file.section_by_name(".text").map(|text| text.address());

        let table = Self::parse(data, text_start)?;
        info!(path = %path.display(), functions = table.functions.len(), "loaded symbol table");

        Ok(table)
    }

    /// Parse a raw `pclntab`. If `text_start` is `None`, the address recorded in the
    /// table header is used.
    pub fn parse(data: Vec<u8>, text_start: Option<u64>) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::load("table shorter than its header"));
        }

        let magic = read_u32(&data, 0)?;
        let version = Version::from_magic(magic)
            .ok_or_else(|| Error::load(format!("unsupported pclntab magic {:#x}", magic)))?;

        if data[4] != 0 || data[5] != 0 {
            return Err(Error::load("nonzero header padding"));
        }

        let quantum = u32::from(data[6]);
        if quantum == 0 {
            return Err(Error::load("zero instruction size quantum"));
        }

        let ptr_size = usize::from(data[7]);
        if ptr_size != PTR_SIZE {
            return Err(Error::load(format!("unsupported pointer size {}", ptr_size)));
        }

        let word = |index: usize| read_word(&data, HEADER_SIZE + index * PTR_SIZE);
        let offset = |index: usize| -> Result<usize> {
            let off = word(index)? as usize;
            if off > data.len() {
                return Err(Error::load(format!("header offset {:#x} out of bounds", off)));
            }
            Ok(off)
        };

        let nfunc = word(0)? as usize;
        let nfiles = word(1)?;

        let (text_start, funcnametab, cutab, filetab, pctab, functab) = match version {
            Version::Go116 => {
                (0, offset(2)?, offset(3)?, offset(4)?, offset(5)?, offset(6)?)
            },
            Version::Go118 | Version::Go120 => {
                let text_start = match text_start {
                    Some(text_start) => text_start,
                    None => word(2)?,
                };
                (text_start, offset(3)?, offset(4)?, offset(5)?, offset(6)?, offset(7)?)
            },
        };

        debug!(?version, nfunc, nfiles, text_start, "parsing pclntab");

        let mut table = Self {
            data,
            version,
            quantum,
            text_start,
            funcnametab,
            cutab,
            filetab,
            pctab,
            functab,
            functions: vec![],
        };

        table.functions = table.read_functions(nfunc)?;

        Ok(table)
    }

    fn read_functions(&self, nfunc: usize) -> Result<Vec<Function>> {
        let size = self.version.entry_size();

        // `nfunc` pairs of (entry, record offset), then the end of the last function.
        let len = nfunc
            .checked_mul(2)
            .and_then(|n| n.checked_add(1))
            .and_then(|n| n.checked_mul(size))
            .ok_or_else(|| Error::load("function count overflow"))?;
        if self.functab.checked_add(len).map_or(true, |end| end > self.data.len()) {
            return Err(Error::load(format!("functab for {} functions out of bounds", nfunc)));
        }

        let field = |index: usize| self.read_sized(self.functab + index * size, size);

        let mut functions = Vec::with_capacity(nfunc);

        for i in 0..nfunc {
            let entry = self.pc(field(2 * i)?);
            let end = self.pc(field(2 * i + 2)?);
            let record = self.functab.saturating_add(field(2 * i + 1)? as usize);

            let name_off = self.record_field(record, FIELD_NAME)? as usize;
            let name = self.read_cstr(self.funcnametab.saturating_add(name_off))?.to_owned();

            functions.push(Function { name, entry, end, record });
        }

        functions.sort_by_key(|f| f.entry);

        Ok(functions)
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Find the function whose `[entry, end)` range contains `pc`.
    pub fn lookup_function(&self, pc: u64) -> Result<&Function> {
        let idx = self.functions.partition_point(|f| f.entry <= pc);

        match idx.checked_sub(1).map(|i| &self.functions[i]) {
            Some(function) if function.contains(pc) => Ok(function),
            _ => Err(Error::NotFound { pc }),
        }
    }

    /// Find a function by its fully-qualified name, like `main.main`.
    pub fn lookup_func(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Resolve `pc` to its function, file, and line.
    ///
    /// Fails with [`Error::NotFound`] if `pc` is outside every function, or if the
    /// function carries no line information for it.
    pub fn pc_to_line(&self, pc: u64) -> Result<Location> {
        let function = self.lookup_function(pc)?;

        match self.decode_position(function, pc) {
            Ok(Some((file, line))) => {
                Ok(Location { file, line, function: function.clone() })
            },
            Ok(None) => Err(Error::NotFound { pc }),
            Err(err) => {
                debug!(%err, pc, function = %function.name, "malformed line table");
                Err(Error::NotFound { pc })
            },
        }
    }

    /// Find the first pc of any instruction attributed to `file:line`.
    ///
    /// `file` matches a recorded path exactly or as a trailing run of path components,
    /// so `main.go` matches `/src/app/main.go`.
    pub fn line_to_pc(&self, file: &str, line: u32) -> Result<u64> {
        for function in &self.functions {
            match self.find_line(function, file, line) {
                Ok(Some(pc)) => return Ok(pc),
                Ok(None) => {},
                Err(err) => debug!(%err, function = %function.name, "malformed line table"),
            }
        }

        Err(Error::Unresolved { target: format!("{}:{}", file, line) })
    }

    fn find_line(&self, function: &Function, file: &str, line: u32) -> Result<Option<u64>> {
        let pcln = self.record_field(function.record, FIELD_PCLN)?;

        for value in self.pc_values(pcln, function.entry) {
            let (range, value) = value?;

            if value < 0 || value as u32 != line {
                continue;
            }

            if let Some(found) = self.file_at(function, range.start)? {
                if path_matches(&found, file) {
                    return Ok(Some(range.start));
                }
            }
        }

        Ok(None)
    }

    fn decode_position(&self, function: &Function, pc: u64) -> Result<Option<(String, u32)>> {
        let pcln = self.record_field(function.record, FIELD_PCLN)?;

        let line = match self.pc_value(pcln, function.entry, pc)? {
            Some(line) if line > 0 => line as u32,
            _ => return Ok(None),
        };

        Ok(self.file_at(function, pc)?.map(|file| (file, line)))
    }

    fn file_at(&self, function: &Function, pc: u64) -> Result<Option<String>> {
        let pcfile = self.record_field(function.record, FIELD_PCFILE)?;

        let index = match self.pc_value(pcfile, function.entry, pc)? {
            Some(index) if index >= 0 => index as usize,
            _ => return Ok(None),
        };

        let cu = self.record_field(function.record, FIELD_CU)? as usize;
        let slot = cu
            .checked_add(index)
            .and_then(|i| i.checked_mul(4))
            .and_then(|off| off.checked_add(self.cutab))
            .ok_or_else(|| Error::load("file index overflow"))?;

        match read_u32(&self.data, slot)? {
            u32::MAX => Ok(None),
            off => Ok(Some(self.read_cstr(self.filetab.saturating_add(off as usize))?.to_owned())),
        }
    }

    // Value of the pc-value table at `off` for `target`, or `None` if not covered.
    fn pc_value(&self, off: u32, entry: u64, target: u64) -> Result<Option<i32>> {
        for value in self.pc_values(off, entry) {
            let (range, value) = value?;

            if target < range.end {
                return Ok(Some(value));
            }
        }

        Ok(None)
    }

    fn pc_values(&self, off: u32, entry: u64) -> PcValues<'_> {
        PcValues {
            table: self,
            pos: self.pctab.saturating_add(off as usize),
            pc: entry,
            value: -1,
            first: true,
            // Offset zero means the function has no such table.
            done: off == 0,
        }
    }

    fn pc(&self, raw: u64) -> u64 {
        match self.version {
            Version::Go116 => raw,
            Version::Go118 | Version::Go120 => self.text_start.wrapping_add(raw),
        }
    }

    fn record_field(&self, record: usize, field: usize) -> Result<u32> {
        let off = record.saturating_add(self.version.entry_size() + (field - 1) * 4);
        read_u32(&self.data, off)
    }

    fn read_sized(&self, off: usize, size: usize) -> Result<u64> {
        match size {
            4 => Ok(u64::from(read_u32(&self.data, off)?)),
            _ => read_word(&self.data, off),
        }
    }

    fn read_cstr(&self, off: usize) -> Result<&str> {
        let bytes = self.data.get(off..).ok_or_else(|| truncated(off))?;
        let len = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::load(format!("unterminated string at {:#x}", off)))?;

        std::str::from_utf8(&bytes[..len])
            .map_err(|_| Error::load(format!("invalid UTF-8 in string at {:#x}", off)))
    }
}

/// Iterator over the `(pc range, value)` runs of one pc-value table.
///
/// Each run is encoded as a zig-zag uvarint value delta followed by a uvarint pc delta
/// in units of the instruction quantum. The value starts at -1 at the function entry.
struct PcValues<'a> {
    table: &'a SymbolTable,
    pos: usize,
    pc: u64,
    value: i32,
    first: bool,
    done: bool,
}

impl PcValues<'_> {
    fn step(&mut self) -> Result<Option<(Range<u64>, i32)>> {
        let uvdelta = self.uvarint()?;
        if uvdelta == 0 && !self.first {
            return Ok(None);
        }
        self.first = false;

        let vdelta = if uvdelta & 1 != 0 {
            !(uvdelta >> 1) as i32
        } else {
            (uvdelta >> 1) as i32
        };
        let pcdelta = u64::from(self.uvarint()?) * u64::from(self.table.quantum);

        let start = self.pc;
        self.pc = self.pc.wrapping_add(pcdelta);
        self.value = self.value.wrapping_add(vdelta);

        Ok(Some((start..self.pc, self.value)))
    }

    fn uvarint(&mut self) -> Result<u32> {
        let mut value = 0u32;
        let mut shift = 0;

        loop {
            let byte = *self.table.data.get(self.pos).ok_or_else(|| truncated(self.pos))?;
            self.pos += 1;

            value |= u32::from(byte & 0x7f) << shift;

            if byte & 0x80 == 0 {
                return Ok(value);
            }

            shift += 7;
            if shift > 28 {
                return Err(Error::load(format!("varint overflow at {:#x}", self.pos)));
            }
        }
    }
}

impl Iterator for PcValues<'_> {
    type Item = Result<(Range<u64>, i32)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.step() {
            Ok(Some(run)) => Some(Ok(run)),
            Ok(None) => {
                self.done = true;
                None
            },
            Err(err) => {
                self.done = true;
                Some(Err(err))
            },
        }
    }
}

fn path_matches(recorded: &str, wanted: &str) -> bool {
    if recorded == wanted {
        return true;
    }

    recorded
        .strip_suffix(wanted)
        .map_or(false, |prefix| prefix.ends_with('/'))
}

fn truncated(off: usize) -> Error {
    Error::load(format!("truncated table at offset {:#x}", off))
}

fn read_u32(data: &[u8], off: usize) -> Result<u32> {
    let bytes = data.get(off..off.saturating_add(4)).ok_or_else(|| truncated(off))?;
    let mut buf = [0; 4];
    buf.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(buf))
}

fn read_word(data: &[u8], off: usize) -> Result<u64> {
    let bytes = data.get(off..off.saturating_add(PTR_SIZE)).ok_or_else(|| truncated(off))?;
    let mut buf = [0; PTR_SIZE];
    buf.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}
