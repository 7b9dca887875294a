#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Once;

use godbg::{Error, Memory, Result, SymbolTable};
use nix::errno::Errno;
use object::{Object, ObjectKind, ObjectSymbol};

#[allow(unused)]
macro_rules! pid {
    ($raw: expr) => {
        godbg::Pid::from_raw($raw)
    };
}

/// Construct a tracee stop with a readable, test-friendly syntax.
#[allow(unused)]
macro_rules! stopped {
    ($raw_pid: expr, $stop: expr) => {{
        use godbg::Signal::*;
        use godbg::Stop::*;

        let pid = godbg::Pid::from_raw($raw_pid);

        godbg::Event::Stopped(godbg::Tracee::new(pid, None, $stop))
    }};
    ($raw_pid: expr, $stop: expr, $signal: expr) => {{
        use godbg::Signal::*;
        use godbg::Stop::*;

        let pid = godbg::Pid::from_raw($raw_pid);

        godbg::Event::Stopped(godbg::Tracee::new(pid, $signal, $stop))
    }};
}

pub const TEXT_START: u64 = 0x40_1000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Layout {
    Go116,
    Go120,
}

struct FuncDef {
    name: String,
    file: String,
    size: u32,

    /// Runs of (length in bytes, line). Empty for a function without line info.
    lines: Vec<(u32, i32)>,
}

/// Builds `pclntab` images the way the Go linker lays them out, for a contiguous run
/// of functions starting at `text_start`.
pub struct PclntabBuilder {
    layout: Layout,
    text_start: u64,
    funcs: Vec<FuncDef>,
}

impl PclntabBuilder {
    pub fn new(text_start: u64) -> Self {
        Self { layout: Layout::Go120, text_start, funcs: vec![] }
    }

    pub fn layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Append a function whose instructions are attributed to `lines`, given as runs of
    /// (length in bytes, line number).
    pub fn function(mut self, name: &str, file: &str, lines: &[(u32, u32)]) -> Self {
        let size = lines.iter().map(|(len, _)| len).sum();
        let lines = lines.iter().map(|&(len, line)| (len, line as i32)).collect();

        self.funcs.push(FuncDef { name: name.into(), file: file.into(), size, lines });
        self
    }

    /// Append a function without a line table.
    pub fn function_without_lines(mut self, name: &str, size: u32) -> Self {
        self.funcs.push(FuncDef { name: name.into(), file: String::new(), size, lines: vec![] });
        self
    }

    /// Entry address of the function at `index`.
    pub fn entry(&self, index: usize) -> u64 {
        self.text_start + self.funcs[..index].iter().map(|f| u64::from(f.size)).sum::<u64>()
    }

    pub fn end(&self) -> u64 {
        self.entry(self.funcs.len())
    }

    pub fn table(&self) -> SymbolTable {
        SymbolTable::parse(self.build(), None).expect("valid synthetic pclntab")
    }

    pub fn build(&self) -> Vec<u8> {
        let mut funcnametab = vec![];
        let mut name_offs = vec![];
        for func in &self.funcs {
            name_offs.push(funcnametab.len() as u32);
            funcnametab.extend_from_slice(func.name.as_bytes());
            funcnametab.push(0);
        }

        let mut files: Vec<&str> = vec![];
        for func in &self.funcs {
            if !func.lines.is_empty() && !files.contains(&func.file.as_str()) {
                files.push(&func.file);
            }
        }

        let mut filetab = vec![];
        let mut cutab = vec![];
        for file in &files {
            cutab.extend_from_slice(&(filetab.len() as u32).to_le_bytes());
            filetab.extend_from_slice(file.as_bytes());
            filetab.push(0);
        }

        // Offset zero is reserved to mean "no table".
        let mut pctab = vec![0];
        let mut pc_offs = vec![];
        for func in &self.funcs {
            if func.lines.is_empty() {
                pc_offs.push((0, 0));
                continue;
            }

            let file_index = files.iter().position(|f| *f == func.file).unwrap() as i32;

            let pcfile = pctab.len() as u32;
            pctab.extend(encode_pcvalue(&[(func.size, file_index)]));

            let pcln = pctab.len() as u32;
            pctab.extend(encode_pcvalue(&func.lines));

            pc_offs.push((pcfile, pcln));
        }

        let entry_size = match self.layout {
            Layout::Go116 => 8,
            Layout::Go120 => 4,
        };
        let nfunc = self.funcs.len();
        let functab_len = (2 * nfunc + 1) * entry_size;
        let record_len = entry_size + 8 * 4 + 4 + if self.layout == Layout::Go120 { 4 } else { 0 };

        let mut functab = vec![];
        let push_entry = |buf: &mut Vec<u8>, value: u64| match entry_size {
            4 => buf.extend_from_slice(&(value as u32).to_le_bytes()),
            _ => buf.extend_from_slice(&value.to_le_bytes()),
        };
        let entry_value = |addr: u64| match self.layout {
            Layout::Go116 => addr,
            Layout::Go120 => addr - self.text_start,
        };

        for i in 0..nfunc {
            push_entry(&mut functab, entry_value(self.entry(i)));
            push_entry(&mut functab, (functab_len + i * record_len) as u64);
        }
        push_entry(&mut functab, entry_value(self.end()));

        for (i, func) in self.funcs.iter().enumerate() {
            let (pcfile, pcln) = pc_offs[i];

            push_entry(&mut functab, entry_value(self.entry(i)));
            for field in &[name_offs[i], 0, 0, 0, pcfile, pcln, 0, 0] {
                functab.extend_from_slice(&field.to_le_bytes());
            }
            if self.layout == Layout::Go120 {
                // startLine
                let start_line = func.lines.first().map_or(0, |(_, line)| *line);
                functab.extend_from_slice(&start_line.to_le_bytes());
            }
            // funcID, flag, padding, nfuncdata
            functab.extend_from_slice(&[0, 0, 0, 0]);
        }

        let (magic, nwords) = match self.layout {
            Layout::Go116 => (0xffff_fffa_u32, 7),
            Layout::Go120 => (0xffff_fff1_u32, 8),
        };
        let header_len = 8 + nwords * 8;

        let funcname_off = header_len;
        let cu_off = funcname_off + funcnametab.len();
        let filetab_off = cu_off + cutab.len();
        let pctab_off = filetab_off + filetab.len();
        let functab_off = pctab_off + pctab.len();

        let mut words = vec![nfunc as u64, files.len() as u64];
        if self.layout == Layout::Go120 {
            words.push(self.text_start);
        }
        words.extend(&[funcname_off, cu_off, filetab_off, pctab_off, functab_off].map(|off| off as u64));

        let mut data = vec![];
        data.extend_from_slice(&magic.to_le_bytes());
        data.extend_from_slice(&[0, 0, 1, 8]);
        for word in words {
            data.extend_from_slice(&word.to_le_bytes());
        }
        data.extend(funcnametab);
        data.extend(cutab);
        data.extend(filetab);
        data.extend(pctab);
        data.extend(functab);

        data
    }
}

/// Encode (length, value) runs as a pc-value table with an instruction quantum of 1.
fn encode_pcvalue(runs: &[(u32, i32)]) -> Vec<u8> {
    // Adjacent equal values would encode a zero delta, which terminates the table.
    let mut merged: Vec<(u32, i32)> = vec![];
    for &(len, value) in runs {
        match merged.last_mut() {
            Some(last) if last.1 == value => last.0 += len,
            _ => merged.push((len, value)),
        }
    }

    let mut out = vec![];
    let mut prev = -1;
    for (len, value) in merged {
        let delta: i32 = value - prev;
        let zigzag = if delta < 0 {
            ((!delta as u32) << 1) | 1
        } else {
            (delta as u32) << 1
        };
        put_uvarint(&mut out, zigzag);
        put_uvarint(&mut out, len);
        prev = value;
    }
    out.push(0);

    out
}

fn put_uvarint(out: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Line reported for every address of `hot()` in [`thread_trap()`].
pub const HOT_LINE: u32 = 10;

/// The `thread-trap` program in `test-programs/`, built with cargo on first use, and a
/// symbol table holding only its `hot()` function.
pub fn thread_trap() -> (PathBuf, SymbolTable) {
    static BUILD: Once = Once::new();

    let dir: PathBuf = [env!("CARGO_MANIFEST_DIR"), "test-programs", "thread-trap"].iter().collect();

    BUILD.call_once(|| {
        let status = Command::new(env!("CARGO"))
            .args(&["build", "--release", "--quiet", "--offline", "--manifest-path"])
            .arg(dir.join("Cargo.toml"))
            .arg("--target-dir")
            .arg(dir.join("target"))
            // Linked at fixed addresses, so symbol values are runtime addresses.
            .env("RUSTFLAGS", "-C relocation-model=static -C force-frame-pointers=yes")
            .env_remove("CARGO_ENCODED_RUSTFLAGS")
            .env_remove("CARGO_BUILD_TARGET")
            .status()
            .expect("could not run cargo");

        assert!(status.success(), "could not build test-programs/thread-trap");
    });

    let path = dir.join("target/release/thread-trap");
    let data = fs::read(&path).expect("thread-trap was built");
    let file = object::File::parse(&*data).expect("thread-trap is an ELF file");
    assert_eq!(file.kind(), ObjectKind::Executable, "thread-trap must not be position-independent");

    let hot = file
        .symbols()
        .find(|symbol| symbol.name().map_or(false, |name| name == "hot"))
        .expect("thread-trap exports `hot`");
    let size = (hot.size() as u32).max(1);

    let symbols = PclntabBuilder::new(hot.address())
        .function("hot", "hot.rs", &[(size, HOT_LINE)])
        .table();

    (path, symbols)
}

/// Sparse, byte-addressed stand-in for a tracee's address space.
#[derive(Clone, Debug, Default)]
pub struct FakeMemory {
    bytes: BTreeMap<u64, u8>,
}

impl FakeMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&mut self, addr: u64, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.bytes.insert(addr + i as u64, *byte);
        }
    }

    pub fn map_word(&mut self, addr: u64, word: u64) {
        self.map(addr, &word.to_le_bytes());
    }

    /// Map a frame record: the saved frame pointer at `bp`, the return address above it.
    pub fn map_frame(&mut self, bp: u64, saved_bp: u64, ret: u64) {
        self.map_word(bp, saved_bp);
        self.map_word(bp + 8, ret);
    }

    pub fn bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        (0..len as u64).map(|i| self.bytes[&(addr + i)]).collect()
    }

    fn check_mapped(&self, addr: u64) -> Result<()> {
        if (0..8).all(|i| self.bytes.contains_key(&(addr + i))) {
            Ok(())
        } else {
            Err(Error::MemoryAccess { addr, source: Errno::EIO })
        }
    }
}

impl Memory for FakeMemory {
    fn peek(&self, addr: u64) -> Result<u64> {
        self.check_mapped(addr)?;

        let mut word = [0; 8];
        for (i, byte) in word.iter_mut().enumerate() {
            *byte = self.bytes[&(addr + i as u64)];
        }

        Ok(u64::from_le_bytes(word))
    }

    fn poke(&mut self, addr: u64, word: u64) -> Result<()> {
        self.check_mapped(addr)?;
        self.map_word(addr, word);

        Ok(())
    }
}
