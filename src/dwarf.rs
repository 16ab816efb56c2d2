use std::fmt;

use crate::types::*;

const ANON_NAME: &str = "<anon>";

fn disp_name(s: &str) -> &str {
    if s == "" {
        ANON_NAME
    } else {
        s
    }
}

/// A base (scalar) type as described by the debug info.
#[derive(Debug)]
pub struct BaseType<'a> {
    pub name: &'a str,
    pub bits: u32,
    pub is_signed: bool,
    pub is_bool: bool,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum RefKind {
    Const,
    Pointer,
    Restrict,
    Volatile,
}

impl RefKind {
    pub fn btf_kind(&self) -> u32 {
        match self {
            RefKind::Const => BTF_KIND_CONST,
            RefKind::Pointer => BTF_KIND_PTR,
            RefKind::Restrict => BTF_KIND_RESTRICT,
            RefKind::Volatile => BTF_KIND_VOLATILE,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            RefKind::Const => "const",
            RefKind::Pointer => "pointer",
            RefKind::Restrict => "restrict",
            RefKind::Volatile => "volatile",
        }
    }
}

/// Type qualifier or pointer; `type_id` 0 references void.
#[derive(Debug)]
pub struct RefTag {
    pub kind: RefKind,
    pub type_id: u32,
}

#[derive(Debug)]
pub struct TypedefTag<'a> {
    pub name: &'a str,
    pub type_id: u32,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum CompositeKind {
    Struct,
    Union,
    Class,
}

/// A data member of a struct or union. Bit offsets follow the DWARF
/// convention, which is also what BTF stores.
#[derive(Debug)]
pub struct ClassMember<'a> {
    pub name: &'a str,
    pub type_id: u32,
    pub bit_offset: u32,
    pub bitfield_size: u8,
}

#[derive(Debug)]
pub struct CompositeTag<'a> {
    pub kind: CompositeKind,
    pub name: &'a str,
    pub byte_size: u32,
    /// Forward declaration only, no layout.
    pub declaration: bool,
    pub members: Vec<ClassMember<'a>>,
}

#[derive(Debug)]
pub struct ArrayTag {
    pub type_id: u32,
    pub dims: Vec<u32>,
}

impl ArrayTag {
    pub fn nr_entries(&self) -> u32 {
        self.dims.iter().product()
    }
}

#[derive(Debug)]
pub struct Enumerator<'a> {
    pub name: &'a str,
    pub value: i32,
}

#[derive(Debug)]
pub struct EnumTag<'a> {
    pub name: &'a str,
    pub byte_size: u32,
    pub enumerators: Vec<Enumerator<'a>>,
}

#[derive(Debug)]
pub struct Parameter<'a> {
    pub name: &'a str,
    pub type_id: u32,
}

#[derive(Debug)]
pub struct FuncProto<'a> {
    pub ret_type_id: u32,
    pub params: Vec<Parameter<'a>>,
    /// Trailing `...` in the parameter list.
    pub unspec_args: bool,
}

#[derive(Debug)]
pub struct Function<'a> {
    pub name: &'a str,
    pub proto: FuncProto<'a>,
    pub declaration: bool,
    pub external: bool,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum VariableScope {
    Global,
    Local,
}

#[derive(Debug)]
pub struct Variable<'a> {
    pub name: &'a str,
    pub type_id: u32,
    pub address: u64,
    pub external: bool,
    pub declaration: bool,
    pub scope: VariableScope,
    /// Index of the declaration this definition refers back to, if any.
    pub specification: Option<usize>,
}

/// One entry of a compilation unit's type table.
#[derive(Debug)]
pub enum Tag<'a> {
    BaseType(BaseType<'a>),
    Ref(RefTag),
    Typedef(TypedefTag<'a>),
    Composite(CompositeTag<'a>),
    Array(ArrayTag),
    Enum(EnumTag<'a>),
    Subroutine(FuncProto<'a>),
    Unsupported(&'a str),
}

impl<'a> Tag<'a> {
    pub fn kind_name(&self) -> &str {
        match self {
            Tag::BaseType(_) => "base_type",
            Tag::Ref(t) => t.kind.name(),
            Tag::Typedef(_) => "typedef",
            Tag::Composite(t) => match t.kind {
                CompositeKind::Struct => "struct",
                CompositeKind::Union => "union",
                CompositeKind::Class => "class",
            },
            Tag::Array(_) => "array",
            Tag::Enum(_) => "enumeration",
            Tag::Subroutine(_) => "subroutine",
            Tag::Unsupported(name) => *name,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Tag::BaseType(t) => t.name,
            Tag::Typedef(t) => t.name,
            Tag::Composite(t) => t.name,
            Tag::Enum(t) => t.name,
            _ => "",
        }
    }
}

impl<'a> fmt::Display for Tag<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<{}> '{}'", self.kind_name(), disp_name(self.name()))
    }
}

/// A compilation unit handed over by the debug-info loader: a dense,
/// 1-based type table plus the functions and variables declared in it.
pub struct Cu<'a> {
    pub filename: String,
    pub elf: Option<&'a object::File<'a>>,
    types: Vec<Tag<'a>>,
    functions: Vec<Function<'a>>,
    variables: Vec<Variable<'a>>,
}

impl<'a> Cu<'a> {
    pub fn new(filename: impl Into<String>, elf: Option<&'a object::File<'a>>) -> Cu<'a> {
        Cu {
            filename: filename.into(),
            elf,
            types: Vec::new(),
            functions: Vec::new(),
            variables: Vec::new(),
        }
    }

    /// Appends a tag and returns its core ID.
    pub fn add_type(&mut self, tag: Tag<'a>) -> u32 {
        self.types.push(tag);
        self.types.len() as u32
    }

    pub fn add_function(&mut self, func: Function<'a>) {
        self.functions.push(func);
    }

    /// Appends a variable and returns its table index, usable as a
    /// specification link target.
    pub fn add_variable(&mut self, var: Variable<'a>) -> usize {
        self.variables.push(var);
        self.variables.len() - 1
    }

    pub fn nr_types(&self) -> u32 {
        self.types.len() as u32
    }

    pub fn types(&self) -> impl Iterator<Item = (u32, &Tag<'a>)> + '_ {
        self.types.iter().enumerate().map(|(i, t)| (i as u32 + 1, t))
    }

    pub fn type_by_id(&self, core_id: u32) -> Option<&Tag<'a>> {
        if core_id == 0 {
            return None;
        }
        self.types.get(core_id as usize - 1)
    }

    pub fn functions(&self) -> &[Function<'a>] {
        &self.functions
    }

    pub fn variables(&self) -> &[Variable<'a>] {
        &self.variables
    }

    /// Core ID of the first base type with the given name.
    pub fn find_base_type(&self, name: &str) -> Option<u32> {
        self.types
            .iter()
            .position(|t| matches!(t, Tag::BaseType(bt) if bt.name == name))
            .map(|i| i as u32 + 1)
    }
}
