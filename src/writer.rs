use std::collections::HashMap;
use std::mem::size_of;

use object::{Object, ObjectSection, SectionIndex};
use scroll::IOwrite;

use crate::dwarf::{BaseType, FuncProto};
use crate::types::*;
use crate::{btf_error, BtfResult};

/// ELF section holding the per-CPU variables of a kernel image.
pub const PERCPU_SECTION: &str = ".data..percpu";

#[derive(Debug)]
struct MemberRec {
    name_off: u32,
    type_id: u32,
    bit_offset: u32,
    bitfield_size: u8,
}

#[derive(Debug)]
enum TypeRec {
    Int {
        name_off: u32,
        bits: u32,
        encoding: IntEncoding,
    },
    Ref {
        kind: u32,
        type_id: u32,
        name_off: u32,
        kind_flag: bool,
    },
    Composite {
        kind: u32,
        name_off: u32,
        size: u32,
        members: Vec<MemberRec>,
    },
    Array(btf_array),
    Enum {
        name_off: u32,
        size: u32,
        values: Vec<btf_enum>,
    },
    FuncProto {
        ret_type_id: u32,
        params: Vec<btf_param>,
    },
    Var {
        name_off: u32,
        type_id: u32,
        linkage: u32,
    },
    Datasec {
        name_off: u32,
        size: u32,
        vars: Vec<btf_datasec_var>,
    },
}

/// Deduplicating BTF string section. Offset 0 is the empty string; every
/// other string is appended once, NUL-terminated, on first use.
#[derive(Debug)]
struct Strtab {
    data: Vec<u8>,
    index: HashMap<String, u32>,
}

impl Strtab {
    fn new() -> Strtab {
        Strtab {
            data: vec![0],
            index: HashMap::new(),
        }
    }

    fn add(&mut self, s: &str) -> u32 {
        if s.is_empty() {
            return 0;
        }
        if let Some(&off) = self.index.get(s) {
            return off;
        }
        let off = self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        self.index.insert(s.to_string(), off);
        off
    }
}

/// Accumulates BTF type records and serializes them into a `.BTF` blob.
///
/// Type IDs are 1-based and handed out in insertion order on top of
/// `base_type_cnt`, the type count of an already-encoded base BTF.
#[derive(Debug)]
pub struct BtfWriter {
    filename: String,
    endian: scroll::Endian,
    base_type_cnt: u32,
    types: Vec<TypeRec>,
    strings: Strtab,
    percpu_secinfo: Vec<btf_datasec_var>,
    percpu_shndx: Option<SectionIndex>,
    percpu_base_addr: u64,
    percpu_sec_sz: u32,
    has_symtab: bool,
}

impl BtfWriter {
    pub fn new(filename: &str, elf: Option<&object::File>, base_type_cnt: u32) -> BtfWriter {
        let mut writer = BtfWriter {
            filename: filename.to_string(),
            endian: scroll::LE,
            base_type_cnt,
            types: Vec::new(),
            strings: Strtab::new(),
            percpu_secinfo: Vec::new(),
            percpu_shndx: None,
            percpu_base_addr: 0,
            percpu_sec_sz: 0,
            has_symtab: false,
        };
        if let Some(elf) = elf {
            if !elf.is_little_endian() {
                writer.endian = scroll::BE;
            }
            writer.has_symtab = elf.symbol_table().is_some();
            if let Some(sec) = elf.section_by_name(PERCPU_SECTION) {
                writer.percpu_shndx = Some(sec.index());
                writer.percpu_base_addr = sec.address();
                writer.percpu_sec_sz = sec.size() as u32;
            }
        }
        writer
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn into_filename(self) -> String {
        self.filename
    }

    pub fn type_count(&self) -> u32 {
        self.base_type_cnt + self.types.len() as u32
    }

    pub fn percpu_shndx(&self) -> Option<SectionIndex> {
        self.percpu_shndx
    }

    pub fn percpu_base_addr(&self) -> u64 {
        self.percpu_base_addr
    }

    pub fn has_symtab(&self) -> bool {
        self.has_symtab
    }

    pub fn percpu_secinfo_len(&self) -> usize {
        self.percpu_secinfo.len()
    }

    fn push(&mut self, rec: TypeRec) -> u32 {
        self.types.push(rec);
        self.type_count()
    }

    pub fn add_base_type(&mut self, bt: &BaseType) -> u32 {
        let name_off = self.strings.add(bt.name);
        let mut encoding = IntEncoding::empty();
        if bt.is_signed {
            encoding |= IntEncoding::SIGNED;
        }
        if bt.is_bool {
            encoding |= IntEncoding::BOOL;
        }
        self.push(TypeRec::Int {
            name_off,
            bits: bt.bits,
            encoding,
        })
    }

    pub fn add_ref_type(&mut self, kind: u32, type_id: u32, name: &str, kind_flag: bool) -> u32 {
        let name_off = self.strings.add(name);
        self.push(TypeRec::Ref {
            kind,
            type_id,
            name_off,
            kind_flag,
        })
    }

    pub fn add_struct(&mut self, kind: u32, name: &str, byte_size: u32) -> u32 {
        let name_off = self.strings.add(name);
        self.push(TypeRec::Composite {
            kind,
            name_off,
            size: byte_size,
            members: Vec::new(),
        })
    }

    pub fn add_member(
        &mut self,
        name: &str,
        type_id: u32,
        bitfield_size: u8,
        bit_offset: u32,
    ) -> BtfResult<()> {
        let name_off = self.strings.add(name);
        match self.types.last_mut() {
            Some(TypeRec::Composite { members, .. }) => {
                members.push(MemberRec {
                    name_off,
                    type_id,
                    bit_offset,
                    bitfield_size,
                });
                Ok(())
            }
            _ => btf_error("member added outside of a struct/union".to_string()),
        }
    }

    pub fn add_array(&mut self, val_type_id: u32, idx_type_id: u32, nelems: u32) -> u32 {
        self.push(TypeRec::Array(btf_array {
            val_type_id,
            idx_type_id,
            nelems,
        }))
    }

    pub fn add_enum(&mut self, name: &str, byte_size: u32) -> u32 {
        let name_off = self.strings.add(name);
        self.push(TypeRec::Enum {
            name_off,
            size: byte_size,
            values: Vec::new(),
        })
    }

    pub fn add_enum_val(&mut self, name: &str, value: i32) -> BtfResult<()> {
        let name_off = self.strings.add(name);
        match self.types.last_mut() {
            Some(TypeRec::Enum { values, .. }) => {
                values.push(btf_enum {
                    name_off,
                    val: value,
                });
                Ok(())
            }
            _ => btf_error("enumerator added outside of an enum".to_string()),
        }
    }

    pub fn add_func_proto(&mut self, proto: &FuncProto, type_id_off: u32) -> u32 {
        let ret_type_id = map_type_id(type_id_off, proto.ret_type_id);
        let mut params = Vec::with_capacity(proto.params.len() + proto.unspec_args as usize);
        for p in &proto.params {
            params.push(btf_param {
                name_off: self.strings.add(p.name),
                type_id: map_type_id(type_id_off, p.type_id),
            });
        }
        if proto.unspec_args {
            params.push(btf_param {
                name_off: 0,
                type_id: 0,
            });
        }
        self.push(TypeRec::FuncProto {
            ret_type_id,
            params,
        })
    }

    pub fn add_var_type(&mut self, type_id: u32, name: &str, linkage: u32) -> u32 {
        let name_off = self.strings.add(name);
        self.push(TypeRec::Var {
            name_off,
            type_id,
            linkage,
        })
    }

    pub fn add_var_secinfo(&mut self, type_id: u32, offset: u32, size: u32) {
        self.percpu_secinfo.push(btf_datasec_var {
            type_id,
            offset,
            size,
        });
    }

    /// Flushes the accumulated per-CPU section info into a DATASEC record
    /// sized by the ELF section, entries sorted by offset.
    pub fn add_datasec_type(&mut self, name: &str) -> u32 {
        let name_off = self.strings.add(name);
        let mut vars = std::mem::take(&mut self.percpu_secinfo);
        vars.sort_by_key(|v| v.offset);
        let size = self.percpu_sec_sz;
        self.push(TypeRec::Datasec {
            name_off,
            size,
            vars,
        })
    }

    pub fn encode(&self, flags: u8) -> BtfResult<Vec<u8>> {
        let mut type_data: Vec<u8> = Vec::new();
        for rec in &self.types {
            self.write_type(&mut type_data, rec)?;
        }
        let hdr = btf_header {
            magic: BTF_MAGIC,
            version: BTF_VERSION,
            flags,
            hdr_len: size_of::<btf_header>() as u32,
            type_off: 0,
            type_len: type_data.len() as u32,
            str_off: type_data.len() as u32,
            str_len: self.strings.data.len() as u32,
        };
        let mut buf =
            Vec::with_capacity(size_of::<btf_header>() + type_data.len() + self.strings.data.len());
        buf.iowrite_with(hdr, self.endian)?;
        buf.extend_from_slice(&type_data);
        buf.extend_from_slice(&self.strings.data);
        Ok(buf)
    }

    fn write_type(&self, buf: &mut Vec<u8>, rec: &TypeRec) -> BtfResult<()> {
        let e = self.endian;
        match rec {
            TypeRec::Int {
                name_off,
                bits,
                encoding,
            } => {
                buf.iowrite_with(
                    btf_type {
                        name_off: *name_off,
                        info: type_info(BTF_KIND_INT, false, 0),
                        type_id: bits_to_bytes(*bits), // it's a type/size union in C
                    },
                    e,
                )?;
                buf.iowrite_with(int_info(*encoding, *bits), e)?;
            }
            TypeRec::Ref {
                kind,
                type_id,
                name_off,
                kind_flag,
            } => {
                buf.iowrite_with(
                    btf_type {
                        name_off: *name_off,
                        info: type_info(*kind, *kind_flag, 0),
                        type_id: *type_id,
                    },
                    e,
                )?;
            }
            TypeRec::Composite {
                kind,
                name_off,
                size,
                members,
            } => {
                let kind_flag = members.iter().any(|m| m.bitfield_size != 0);
                buf.iowrite_with(
                    btf_type {
                        name_off: *name_off,
                        info: type_info(*kind, kind_flag, members.len()),
                        type_id: *size,
                    },
                    e,
                )?;
                for m in members {
                    let offset = if kind_flag {
                        (m.bitfield_size as u32) << 24 | (m.bit_offset & 0xffffff)
                    } else {
                        m.bit_offset
                    };
                    buf.iowrite_with(
                        btf_member {
                            name_off: m.name_off,
                            type_id: m.type_id,
                            offset,
                        },
                        e,
                    )?;
                }
            }
            TypeRec::Array(a) => {
                buf.iowrite_with(
                    btf_type {
                        name_off: 0,
                        info: type_info(BTF_KIND_ARRAY, false, 0),
                        type_id: 0,
                    },
                    e,
                )?;
                buf.iowrite_with(*a, e)?;
            }
            TypeRec::Enum {
                name_off,
                size,
                values,
            } => {
                buf.iowrite_with(
                    btf_type {
                        name_off: *name_off,
                        info: type_info(BTF_KIND_ENUM, false, values.len()),
                        type_id: *size,
                    },
                    e,
                )?;
                for v in values {
                    buf.iowrite_with(*v, e)?;
                }
            }
            TypeRec::FuncProto {
                ret_type_id,
                params,
            } => {
                buf.iowrite_with(
                    btf_type {
                        name_off: 0,
                        info: type_info(BTF_KIND_FUNC_PROTO, false, params.len()),
                        type_id: *ret_type_id,
                    },
                    e,
                )?;
                for p in params {
                    buf.iowrite_with(*p, e)?;
                }
            }
            TypeRec::Var {
                name_off,
                type_id,
                linkage,
            } => {
                buf.iowrite_with(
                    btf_type {
                        name_off: *name_off,
                        info: type_info(BTF_KIND_VAR, false, 0),
                        type_id: *type_id,
                    },
                    e,
                )?;
                buf.iowrite_with(*linkage, e)?;
            }
            TypeRec::Datasec {
                name_off,
                size,
                vars,
            } => {
                buf.iowrite_with(
                    btf_type {
                        name_off: *name_off,
                        info: type_info(BTF_KIND_DATASEC, false, vars.len()),
                        type_id: *size,
                    },
                    e,
                )?;
                for v in vars {
                    buf.iowrite_with(*v, e)?;
                }
            }
        }
        Ok(())
    }
}

/// Maps a core type reference to its BTF ID; 0 stays the void reference.
pub fn map_type_id(type_id_off: u32, type_id: u32) -> u32 {
    if type_id == 0 {
        0
    } else {
        type_id_off + type_id
    }
}
