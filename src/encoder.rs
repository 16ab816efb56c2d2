use std::cmp;

use object::{Object, ObjectSection, ObjectSymbol, SectionIndex, SymbolKind};
use scroll::Pread;

use crate::dwarf::{BaseType, CompositeKind, Cu, Tag, VariableScope};
use crate::types::*;
use crate::writer::{map_type_id, BtfWriter, PERCPU_SECTION};
use crate::{btf_error, BtfError, BtfResult};

/// Hard cap of the per-CPU variable table.
pub const MAX_PERCPU_VARS: usize = 4096;

const FUNC_TABLE_SEED: usize = 1000;
const BTF_NAME_BUF_LEN: usize = 128;

const MCOUNT_START: &str = "__start_mcount_loc";
const MCOUNT_STOP: &str = "__stop_mcount_loc";
const INIT_BEGIN: &str = "__init_begin";
const INIT_END: &str = "__init_end";
const PRESERVE_BEGIN: &str = "__init_bpf_preserve_type_begin";
const PRESERVE_END: &str = "__init_bpf_preserve_type_end";

const ARRAY_INDEX_NAME: &str = "__ARRAY_SIZE_TYPE__";

#[derive(Debug, Default, Clone, Copy)]
pub struct EncoderCfg {
    pub verbose: bool,
    /// Downgrade recoverable errors (bad names, void-typed per-CPU
    /// variables) to warnings and keep going.
    pub force: bool,
    pub skip_encoding_vars: bool,
    /// Type count of an already-encoded base BTF to stack on top of.
    pub base_type_cnt: u32,
}

/// A function symbol collected from the ELF symbol table. The name borrows
/// from the mapped object file.
#[derive(Debug)]
pub struct ElfFunction<'a> {
    name: &'a str,
    addr: u64,
    generated: bool,
}

impl<'a> ElfFunction<'a> {
    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PercpuVar<'a> {
    addr: u64,
    sz: u64,
    name: &'a str,
}

impl<'a> PercpuVar<'a> {
    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn size(&self) -> u64 {
        self.sz
    }
}

/// Address anchors scraped from the symbol table by name. Function
/// filtering only activates once every anchor has been seen.
#[derive(Debug, Default)]
struct FuncsLayout {
    mcount_start: Option<u64>,
    mcount_stop: Option<u64>,
    init_begin: Option<u64>,
    init_end: Option<u64>,
    preserve_begin: Option<u64>,
    preserve_end: Option<u64>,
    mcount_sec_idx: Option<SectionIndex>,
}

struct FtraceRange {
    mcount_start: u64,
    mcount_stop: u64,
    init_begin: u64,
    init_end: u64,
    preserve_begin: u64,
    preserve_end: u64,
    mcount_sec_idx: SectionIndex,
}

impl FuncsLayout {
    fn record(&mut self, name: &str, value: u64, shndx: Option<SectionIndex>) {
        match name {
            MCOUNT_START if self.mcount_start.is_none() => {
                self.mcount_start = Some(value);
                self.mcount_sec_idx = shndx;
            }
            MCOUNT_STOP if self.mcount_stop.is_none() => self.mcount_stop = Some(value),
            INIT_BEGIN if self.init_begin.is_none() => self.init_begin = Some(value),
            INIT_END if self.init_end.is_none() => self.init_end = Some(value),
            PRESERVE_BEGIN if self.preserve_begin.is_none() => self.preserve_begin = Some(value),
            PRESERVE_END if self.preserve_end.is_none() => self.preserve_end = Some(value),
            _ => {}
        }
    }

    fn resolve(&self) -> Option<FtraceRange> {
        Some(FtraceRange {
            mcount_start: self.mcount_start?,
            mcount_stop: self.mcount_stop?,
            init_begin: self.init_begin?,
            init_end: self.init_end?,
            preserve_begin: self.preserve_begin?,
            preserve_end: self.preserve_end?,
            mcount_sec_idx: self.mcount_sec_idx?,
        })
    }
}

/// A finished per-object BTF blob, handed back when the encoder switches
/// to a new object file or is finalized.
#[derive(Debug)]
pub struct EncodedBtf {
    pub filename: String,
    pub data: Vec<u8>,
}

/// One encoding session over a stream of compilation units. The session
/// owns the active writer, the name-sorted function table and the
/// address-sorted per-CPU table; all of it is torn down on a fatal error
/// or when the object filename changes.
#[derive(Debug)]
pub struct BtfEncoder<'a> {
    cfg: EncoderCfg,
    writer: Option<BtfWriter>,
    functions: Vec<ElfFunction<'a>>,
    percpu: Vec<PercpuVar<'a>>,
    array_index_id: u32,
    has_index_type: bool,
    need_index_type: bool,
}

impl<'a> BtfEncoder<'a> {
    pub fn new(cfg: EncoderCfg) -> BtfEncoder<'a> {
        BtfEncoder {
            cfg,
            writer: None,
            functions: Vec::new(),
            percpu: Vec::new(),
            array_index_id: 0,
            has_index_type: false,
            need_index_type: false,
        }
    }

    /// Encodes one compilation unit. When `cu` belongs to a different
    /// object file than the active session, that session is finalized
    /// first and its blob returned.
    pub fn encode_cu(&mut self, cu: &Cu<'a>) -> BtfResult<Option<EncodedBtf>> {
        match self.encode_cu_impl(cu) {
            Ok(flushed) => Ok(flushed),
            Err(err) => {
                self.teardown();
                Err(err)
            }
        }
    }

    /// Commits the last open session, if any.
    pub fn finalize(&mut self) -> BtfResult<Option<EncodedBtf>> {
        if self.writer.is_none() {
            return Ok(None);
        }
        match self.finish_session() {
            Ok(btf) => Ok(Some(btf)),
            Err(err) => {
                self.teardown();
                Err(err)
            }
        }
    }

    /// Functions eligible for emission, sorted by name.
    pub fn functions(&self) -> &[ElfFunction<'a>] {
        &self.functions
    }

    /// Collected per-CPU variables, sorted by address.
    pub fn percpu_vars(&self) -> &[PercpuVar<'a>] {
        &self.percpu
    }

    fn teardown(&mut self) {
        self.writer = None;
        self.functions.clear();
        self.percpu.clear();
    }

    fn writer_mut(&mut self) -> BtfResult<&mut BtfWriter> {
        match self.writer.as_mut() {
            Some(writer) => Ok(writer),
            None => btf_error("no active BTF writer".to_string()),
        }
    }

    fn encode_cu_impl(&mut self, cu: &Cu<'a>) -> BtfResult<Option<EncodedBtf>> {
        let mut flushed = None;
        if let Some(writer) = &self.writer {
            if writer.filename() != cu.filename {
                flushed = Some(self.finish_session()?);
            }
        }
        if self.writer.is_none() {
            self.writer = Some(BtfWriter::new(&cu.filename, cu.elf, self.cfg.base_type_cnt));
            self.has_index_type = false;
            self.need_index_type = false;
            self.array_index_id = 0;
            self.collect_symbols(cu)?;
        }

        let type_id_off = self.writer_mut()?.type_count();

        self.prepare_array_index(cu, type_id_off);

        for (core_id, tag) in cu.types() {
            let btf_type_id = self.encode_tag(tag, type_id_off)?;
            if btf_type_id != type_id_off + core_id {
                return btf_error(format!(
                    "id drift for {}: core_id: {}, btf_type_id: {}, type_id_off: {}",
                    tag, core_id, btf_type_id, type_id_off
                ));
            }
        }

        if self.need_index_type && !self.has_index_type {
            let index_type = BaseType {
                name: ARRAY_INDEX_NAME,
                bits: 32,
                is_signed: false,
                is_bool: false,
            };
            self.writer_mut()?.add_base_type(&index_type);
            self.has_index_type = true;
        }

        self.encode_cu_functions(cu, type_id_off)?;
        self.encode_cu_variables(cu, type_id_off)?;
        Ok(flushed)
    }

    /// Picks the BTF ID used as the index type of arrays. A base type named
    /// "int" anywhere in the CU is used directly; otherwise the slot one
    /// past the CU's last type is reserved for a synthetic 32-bit index
    /// type, emitted after the type pass if any array needed it. Once made,
    /// the choice holds for the rest of the session, even when a later CU
    /// does declare "int".
    fn prepare_array_index(&mut self, cu: &Cu, type_id_off: u32) {
        if self.has_index_type {
            return;
        }
        match cu.find_base_type("int") {
            Some(core_id) => {
                self.array_index_id = type_id_off + core_id;
                self.has_index_type = true;
            }
            None => self.array_index_id = type_id_off + cu.nr_types() + 1,
        }
    }

    fn encode_tag(&mut self, tag: &Tag, type_id_off: u32) -> BtfResult<u32> {
        if let Tag::Array(_) = tag {
            self.need_index_type = true;
        }
        let array_index_id = self.array_index_id;
        let writer = self.writer_mut()?;
        match tag {
            Tag::BaseType(bt) => Ok(writer.add_base_type(bt)),
            Tag::Ref(r) => Ok(writer.add_ref_type(
                r.kind.btf_kind(),
                map_type_id(type_id_off, r.type_id),
                "",
                false,
            )),
            Tag::Typedef(td) => Ok(writer.add_ref_type(
                BTF_KIND_TYPEDEF,
                map_type_id(type_id_off, td.type_id),
                td.name,
                false,
            )),
            Tag::Composite(c) if c.declaration => Ok(writer.add_ref_type(
                BTF_KIND_FWD,
                0,
                c.name,
                c.kind == CompositeKind::Union,
            )),
            Tag::Composite(c) => {
                let kind = if c.kind == CompositeKind::Union {
                    BTF_KIND_UNION
                } else {
                    BTF_KIND_STRUCT
                };
                let type_id = writer.add_struct(kind, c.name, c.byte_size);
                for m in &c.members {
                    writer.add_member(
                        m.name,
                        type_id_off + m.type_id,
                        m.bitfield_size,
                        m.bit_offset,
                    )?;
                }
                Ok(type_id)
            }
            Tag::Array(a) => Ok(writer.add_array(
                map_type_id(type_id_off, a.type_id),
                array_index_id,
                a.nr_entries(),
            )),
            Tag::Enum(et) => {
                let type_id = writer.add_enum(et.name, et.byte_size);
                for v in &et.enumerators {
                    writer.add_enum_val(v.name, v.value)?;
                }
                Ok(type_id)
            }
            Tag::Subroutine(proto) => Ok(writer.add_func_proto(proto, type_id_off)),
            Tag::Unsupported(name) => btf_error(format!("unsupported tag {}", name)),
        }
    }

    fn encode_cu_functions(&mut self, cu: &Cu<'a>, type_id_off: u32) -> BtfResult<()> {
        for func in cu.functions() {
            if !self.functions.is_empty() {
                // Functions with unnamed parameters are useless to the
                // kernel verifier.
                if func.proto.params.iter().any(|p| p.name.is_empty()) {
                    continue;
                }
                let idx = match self
                    .functions
                    .binary_search_by(|f| f.name.cmp(&func.name))
                {
                    Ok(idx) => idx,
                    Err(_) => continue,
                };
                if self.functions[idx].generated {
                    continue;
                }
                self.functions[idx].generated = true;
            } else if func.declaration || !func.external {
                continue;
            }
            if self.cfg.verbose {
                println!("function '{}'", func.name);
            }
            let writer = self.writer_mut()?;
            let proto_id = writer.add_func_proto(&func.proto, type_id_off);
            writer.add_ref_type(BTF_KIND_FUNC, proto_id, func.name, false);
        }
        Ok(())
    }

    fn encode_cu_variables(&mut self, cu: &Cu<'a>, type_id_off: u32) -> BtfResult<()> {
        if self.cfg.skip_encoding_vars {
            return Ok(());
        }
        match &self.writer {
            Some(w) if w.percpu_shndx().is_some() && w.has_symtab() => {}
            _ => return Ok(()),
        }
        if self.cfg.verbose {
            println!("searching '{}' for percpu global variables", cu.filename);
        }
        for var in cu.variables() {
            if var.declaration && var.specification.is_none() {
                continue;
            }
            if var.scope != VariableScope::Global && var.specification.is_none() {
                continue;
            }
            // The definition carries the address; its specification link,
            // if any, leads to the entry carrying name and type.
            let addr = var.address;
            let var = match var.specification {
                Some(idx) => match cu.variables().get(idx) {
                    Some(spec) => spec,
                    None => {
                        return btf_error(format!(
                            "dangling specification link on variable '{}'",
                            var.name
                        ))
                    }
                },
                None => var,
            };
            let percpu = match self.percpu_var(addr) {
                Some(v) => v,
                None => continue,
            };
            if var.type_id == 0 {
                let msg = format!("percpu variable '{}' has void type", percpu.name);
                if !self.cfg.force {
                    return btf_error(msg);
                }
                eprintln!("btfenc: warning: {}, skipping", msg);
                continue;
            }
            let linkage = if var.external {
                BTF_VAR_GLOBAL_ALLOCATED
            } else {
                BTF_VAR_STATIC
            };
            if self.cfg.verbose {
                println!("percpu var '{}' at 0x{:x}", percpu.name, addr);
            }
            let type_id = type_id_off + var.type_id;
            let writer = self.writer_mut()?;
            let var_id = writer.add_var_type(type_id, percpu.name, linkage);
            let offset = addr - writer.percpu_base_addr();
            writer.add_var_secinfo(var_id, offset as u32, percpu.sz as u32);
        }
        Ok(())
    }

    fn finish_session(&mut self) -> BtfResult<EncodedBtf> {
        let mut writer = match self.writer.take() {
            Some(writer) => writer,
            None => return btf_error("no active BTF writer".to_string()),
        };
        if writer.percpu_secinfo_len() != 0 {
            writer.add_datasec_type(PERCPU_SECTION);
        }
        let data = writer.encode(0)?;
        self.functions.clear();
        self.percpu.clear();
        Ok(EncodedBtf {
            filename: writer.into_filename(),
            data,
        })
    }

    fn collect_symbols(&mut self, cu: &Cu<'a>) -> BtfResult<()> {
        let elf = match cu.elf {
            Some(elf) => elf,
            None => return Ok(()),
        };
        let collect_percpu = !self.cfg.skip_encoding_vars;
        let percpu_shndx = match &self.writer {
            Some(writer) => writer.percpu_shndx(),
            None => None,
        };
        let mut layout = FuncsLayout::default();
        for sym in elf.symbols() {
            let name = match sym.name() {
                Ok(name) if !name.is_empty() => name,
                _ => continue,
            };
            self.collect_function(&sym, name);
            if collect_percpu {
                self.collect_percpu_var(&sym, name, percpu_shndx)?;
            }
            layout.record(name, sym.address(), sym.section_index());
        }
        self.percpu.sort_by_key(|v| v.addr);
        self.functions.sort_by(|a, b| a.name.cmp(b.name));

        match layout.resolve() {
            Some(range) if !self.functions.is_empty() => {
                self.filter_functions(elf, &range)?;
                if self.cfg.verbose {
                    println!("found {} traceable functions", self.functions.len());
                }
            }
            _ => {
                // No usable ftrace layout; fall back to selecting functions
                // from the debug info alone.
                if self.cfg.verbose && !self.functions.is_empty() {
                    println!(
                        "ftrace layout symbols not found in '{}', falling back to debug-info function selection",
                        cu.filename
                    );
                }
                self.functions.clear();
            }
        }
        Ok(())
    }

    fn collect_function(&mut self, sym: &object::Symbol<'a, '_>, name: &'a str) {
        if sym.kind() != SymbolKind::Text || sym.address() == 0 {
            return;
        }
        if self.functions.len() == self.functions.capacity() {
            let cap = cmp::max(FUNC_TABLE_SEED, self.functions.capacity() * 3 / 2);
            self.functions.reserve_exact(cap - self.functions.len());
        }
        self.functions.push(ElfFunction {
            name,
            addr: sym.address(),
            generated: false,
        });
    }

    fn collect_percpu_var(
        &mut self,
        sym: &object::Symbol<'a, '_>,
        name: &'a str,
        percpu_shndx: Option<SectionIndex>,
    ) -> BtfResult<()> {
        let shndx = match percpu_shndx {
            Some(shndx) => shndx,
            None => return Ok(()),
        };
        if sym.section_index() != Some(shndx) || sym.kind() != SymbolKind::Data {
            return Ok(());
        }
        let addr = sym.address();
        if addr == 0 {
            return Ok(());
        }
        let sz = sym.size();
        if sz == 0 {
            return Ok(());
        }
        if !btf_name_valid(name) {
            let msg = format!("invalid percpu variable name '{}'", name);
            if !self.cfg.force {
                return btf_error(msg);
            }
            eprintln!("btfenc: warning: {}, skipping", msg);
            return Ok(());
        }
        if self.percpu.len() >= MAX_PERCPU_VARS {
            return btf_error(format!(
                "reached the limit of {} percpu variables",
                MAX_PERCPU_VARS
            ));
        }
        if self.cfg.verbose {
            println!("percpu var '{}' at 0x{:x} size {}", name, addr, sz);
        }
        self.percpu.push(PercpuVar { addr, sz, name });
        Ok(())
    }

    fn filter_functions(&mut self, elf: &object::File, range: &FtraceRange) -> BtfResult<()> {
        let endian = if elf.is_little_endian() {
            scroll::LE
        } else {
            scroll::BE
        };
        let entry_sz = if elf.is_64() { 8 } else { 4 };
        let section = elf.section_by_index(range.mcount_sec_idx)?;
        let data = section.data()?;
        let offset = range
            .mcount_start
            .checked_sub(section.address())
            .ok_or_else(|| Box::new(BtfError::new("mcount table starts before its section")))?
            as usize;
        let len = range
            .mcount_stop
            .checked_sub(range.mcount_start)
            .ok_or_else(|| Box::new(BtfError::new("mcount table stop precedes its start")))?
            as usize;
        if offset + len > data.len() {
            return btf_error(format!(
                "mcount table [{}..{}] outside of section data ({} bytes)",
                offset,
                offset + len,
                data.len()
            ));
        }
        let count = len / entry_sz;
        let mut addrs = Vec::with_capacity(count);
        for i in 0..count {
            let addr = if entry_sz == 8 {
                data.pread_with::<u64>(offset + i * entry_sz, endian)?
            } else {
                data.pread_with::<u32>(offset + i * entry_sz, endian)? as u64
            };
            addrs.push(addr);
        }
        addrs.sort_unstable();

        let is_init = |addr: u64| addr >= range.init_begin && addr < range.init_end;
        let is_preserved = |addr: u64| addr >= range.preserve_begin && addr < range.preserve_end;
        self.functions.retain(|func| {
            // Init-section functions are gone after boot, except for the
            // bpf-preserve-type range.
            if is_init(func.addr) && !is_preserved(func.addr) {
                return false;
            }
            addrs.binary_search(&func.addr).is_ok()
        });
        Ok(())
    }

    fn percpu_var(&self, addr: u64) -> Option<PercpuVar<'a>> {
        self.percpu
            .binary_search_by(|v| v.addr.cmp(&addr))
            .ok()
            .map(|idx| self.percpu[idx])
    }
}

fn btf_name_char_ok(c: u8, first: bool) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b'.' || (!first && c.is_ascii_digit())
}

/// A BTF identifier starts with a letter, underscore or dot, continues
/// with letters, digits, underscores or dots, and must fit a 128-byte
/// buffer including the terminating NUL.
pub fn btf_name_valid(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= BTF_NAME_BUF_LEN {
        return false;
    }
    if !btf_name_char_ok(bytes[0], true) {
        return false;
    }
    bytes[1..].iter().all(|&c| btf_name_char_ok(c, false))
}
