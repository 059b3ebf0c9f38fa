//! Shared test fixtures: an in-memory metadata reader and a small CIL
//! assembler with label fixups.
#![allow(dead_code)] // each integration binary uses a different subset

use std::collections::HashMap;

use cillift::{
    metadata::{
        AttributeOwner, AttributeRecord, ExceptionRegion, FieldHandle, FieldRecord,
        MemberRefHandle, MemberRefRecord, MetadataReader, MethodBodyData, MethodDefHandle,
        MethodDefRecord, MethodSpecHandle, MethodSpecRecord, SignatureProvider, TypeDefHandle,
        TypeDefRecord, TypeRefHandle, TypeRefRecord, TypeSpecHandle,
    },
    typesystem::{MethodSignature, PrimitiveKind, TsTypeRef},
    Error, Result,
};

/// A type in signature-spec form; the reader drives the provider callback
/// to build the core's own type tree from it.
#[derive(Debug, Clone)]
pub enum TySpec {
    Prim(PrimitiveKind),
    Def(u32),
    Ref(u32),
    ByRef(Box<TySpec>),
    Ptr(Box<TySpec>),
    Array(Box<TySpec>, u8),
    Generic(Box<TySpec>, Vec<TySpec>),
    ClassParam(u16),
    MethodParam(u16),
}

impl TySpec {
    fn build(&self, provider: &dyn SignatureProvider) -> Result<TsTypeRef> {
        Ok(match self {
            TySpec::Prim(kind) => provider.primitive(*kind),
            TySpec::Def(row) => provider.from_type_def(TypeDefHandle(*row))?,
            TySpec::Ref(row) => provider.from_type_ref(TypeRefHandle(*row))?,
            TySpec::ByRef(element) => {
                let inner = element.build(provider)?;
                provider.by_reference(inner)
            }
            TySpec::Ptr(element) => {
                let inner = element.build(provider)?;
                provider.pointer_to(inner)
            }
            TySpec::Array(element, rank) => {
                let inner = element.build(provider)?;
                provider.array_of(inner, *rank)
            }
            TySpec::Generic(definition, arguments) => {
                let def = definition.build(provider)?;
                let args = arguments
                    .iter()
                    .map(|arg| arg.build(provider))
                    .collect::<Result<Vec<_>>>()?;
                provider.generic_instance(def, args)?
            }
            TySpec::ClassParam(index) => provider.class_type_parameter(*index)?,
            TySpec::MethodParam(index) => provider.method_type_parameter(*index)?,
        })
    }
}

/// A method signature in spec form.
#[derive(Debug, Clone)]
pub struct SigSpec {
    pub has_this: bool,
    pub generic_param_count: u16,
    pub is_vararg: bool,
    pub ret: TySpec,
    pub params: Vec<TySpec>,
    pub sentinel_params: Vec<TySpec>,
}

impl SigSpec {
    pub fn new(has_this: bool, ret: TySpec, params: Vec<TySpec>) -> Self {
        Self {
            has_this,
            generic_param_count: 0,
            is_vararg: false,
            ret,
            params,
            sentinel_params: Vec::new(),
        }
    }

    fn build(&self, provider: &dyn SignatureProvider) -> Result<MethodSignature> {
        Ok(MethodSignature {
            has_this: self.has_this,
            generic_param_count: self.generic_param_count,
            is_vararg: self.is_vararg,
            return_type: self.ret.build(provider)?,
            parameters: self
                .params
                .iter()
                .map(|param| param.build(provider))
                .collect::<Result<Vec<_>>>()?,
            sentinel_params: self
                .sentinel_params
                .iter()
                .map(|param| param.build(provider))
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

/// An in-memory metadata reader. Handles are one-based row indices into the
/// vectors below.
#[derive(Default)]
pub struct MockReader {
    pub assembly_name: String,
    pub type_defs: Vec<TypeDefRecord>,
    pub type_refs: Vec<TypeRefRecord>,
    pub method_defs: Vec<(MethodDefRecord, SigSpec)>,
    pub fields: Vec<(FieldRecord, TySpec)>,
    pub member_refs: Vec<(MemberRefRecord, SigSpec)>,
    pub member_ref_fields: HashMap<u32, TySpec>,
    pub bodies: HashMap<u32, MethodBodyData>,
    pub user_strings: Vec<String>,
    pub assembly_attributes: Vec<AttributeRecord>,
}

impl MockReader {
    pub fn new(assembly_name: &str) -> Self {
        Self {
            assembly_name: assembly_name.to_string(),
            ..Self::default()
        }
    }

    pub fn add_type(&mut self, record: TypeDefRecord) -> TypeDefHandle {
        self.type_defs.push(record);
        TypeDefHandle(self.type_defs.len() as u32)
    }

    pub fn add_type_ref(&mut self, record: TypeRefRecord) -> TypeRefHandle {
        self.type_refs.push(record);
        TypeRefHandle(self.type_refs.len() as u32)
    }

    pub fn add_method(&mut self, record: MethodDefRecord, sig: SigSpec) -> MethodDefHandle {
        self.method_defs.push((record, sig));
        MethodDefHandle(self.method_defs.len() as u32)
    }

    pub fn add_member_ref(&mut self, record: MemberRefRecord, sig: SigSpec) -> MemberRefHandle {
        self.member_refs.push((record, sig));
        MemberRefHandle(self.member_refs.len() as u32)
    }

    /// The metadata token for a member-ref handle, as it appears in IL.
    pub fn member_ref_token(handle: MemberRefHandle) -> u32 {
        0x0A00_0000 | handle.0
    }

    /// The metadata token for a method-def handle.
    pub fn method_def_token(handle: MethodDefHandle) -> u32 {
        0x0600_0000 | handle.0
    }

    /// Registers a user string and returns its `ldstr` token.
    pub fn add_user_string(&mut self, value: &str) -> u32 {
        self.user_strings.push(value.to_string());
        0x7000_0000 | (self.user_strings.len() as u32)
    }

    pub fn set_body(&mut self, handle: MethodDefHandle, body: MethodBodyData) {
        self.bodies.insert(handle.0, body);
    }

    fn missing(what: &str, row: u32) -> Error {
        Error::Malformed {
            message: format!("{what} row {row} does not exist"),
            file: file!(),
            line: line!(),
        }
    }
}

impl MetadataReader for MockReader {
    fn assembly_name(&self) -> String {
        self.assembly_name.clone()
    }

    fn type_definitions(&self) -> Vec<TypeDefHandle> {
        (1..=self.type_defs.len() as u32).map(TypeDefHandle).collect()
    }

    fn type_definition(&self, handle: TypeDefHandle) -> Result<TypeDefRecord> {
        self.type_defs
            .get(handle.0 as usize - 1)
            .cloned()
            .ok_or_else(|| Self::missing("TypeDef", handle.0))
    }

    fn type_reference(&self, handle: TypeRefHandle) -> Result<TypeRefRecord> {
        self.type_refs
            .get(handle.0 as usize - 1)
            .cloned()
            .ok_or_else(|| Self::missing("TypeRef", handle.0))
    }

    fn type_specification(
        &self,
        handle: TypeSpecHandle,
        _provider: &dyn SignatureProvider,
    ) -> Result<TsTypeRef> {
        Err(Self::missing("TypeSpec", handle.0))
    }

    fn method_definition(&self, handle: MethodDefHandle) -> Result<MethodDefRecord> {
        self.method_defs
            .get(handle.0 as usize - 1)
            .map(|(record, _)| record.clone())
            .ok_or_else(|| Self::missing("MethodDef", handle.0))
    }

    fn method_def_signature(
        &self,
        handle: MethodDefHandle,
        provider: &dyn SignatureProvider,
    ) -> Result<MethodSignature> {
        let (_, sig) = self
            .method_defs
            .get(handle.0 as usize - 1)
            .ok_or_else(|| Self::missing("MethodDef", handle.0))?;
        sig.build(provider)
    }

    fn member_reference(&self, handle: MemberRefHandle) -> Result<MemberRefRecord> {
        self.member_refs
            .get(handle.0 as usize - 1)
            .map(|(record, _)| record.clone())
            .ok_or_else(|| Self::missing("MemberRef", handle.0))
    }

    fn member_ref_signature(
        &self,
        handle: MemberRefHandle,
        provider: &dyn SignatureProvider,
    ) -> Result<MethodSignature> {
        let (_, sig) = self
            .member_refs
            .get(handle.0 as usize - 1)
            .ok_or_else(|| Self::missing("MemberRef", handle.0))?;
        sig.build(provider)
    }

    fn member_ref_field_type(
        &self,
        handle: MemberRefHandle,
        provider: &dyn SignatureProvider,
    ) -> Result<TsTypeRef> {
        self.member_ref_fields
            .get(&handle.0)
            .ok_or_else(|| Self::missing("MemberRef field", handle.0))?
            .build(provider)
    }

    fn method_specification(&self, handle: MethodSpecHandle) -> Result<MethodSpecRecord> {
        Err(Self::missing("MethodSpec", handle.0))
    }

    fn method_spec_arguments(
        &self,
        handle: MethodSpecHandle,
        _provider: &dyn SignatureProvider,
    ) -> Result<Vec<TsTypeRef>> {
        Err(Self::missing("MethodSpec", handle.0))
    }

    fn field(&self, handle: FieldHandle) -> Result<FieldRecord> {
        self.fields
            .get(handle.0 as usize - 1)
            .map(|(record, _)| record.clone())
            .ok_or_else(|| Self::missing("Field", handle.0))
    }

    fn field_signature(
        &self,
        handle: FieldHandle,
        provider: &dyn SignatureProvider,
    ) -> Result<TsTypeRef> {
        let (_, spec) = self
            .fields
            .get(handle.0 as usize - 1)
            .ok_or_else(|| Self::missing("Field", handle.0))?;
        spec.build(provider)
    }

    fn custom_attributes(&self, owner: AttributeOwner) -> Vec<AttributeRecord> {
        match owner {
            AttributeOwner::Assembly => self.assembly_attributes.clone(),
            _ => Vec::new(),
        }
    }

    fn method_body(&self, handle: MethodDefHandle) -> Result<MethodBodyData> {
        self.bodies
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| Self::missing("method body", handle.0))
    }

    fn user_string(&self, token: u32) -> Result<String> {
        let row = token & 0x00FF_FFFF;
        self.user_strings
            .get(row as usize - 1)
            .cloned()
            .ok_or_else(|| Self::missing("user string", row))
    }
}

/// A tiny CIL assembler with label fixups, enough for test bodies.
#[derive(Default)]
pub struct Asm {
    bytes: Vec<u8>,
    labels: HashMap<&'static str, u32>,
    fixups: Vec<(usize, &'static str)>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(&mut self, opcode: u8) -> &mut Self {
        self.bytes.push(opcode);
        self
    }

    pub fn ldarg(&mut self, index: u8) -> &mut Self {
        assert!(index < 4);
        self.op(0x02 + index)
    }

    pub fn ldloc(&mut self, index: u8) -> &mut Self {
        assert!(index < 4);
        self.op(0x06 + index)
    }

    pub fn stloc(&mut self, index: u8) -> &mut Self {
        assert!(index < 4);
        self.op(0x0A + index)
    }

    pub fn ldloca(&mut self, index: u8) -> &mut Self {
        self.op(0x12);
        self.bytes.push(index);
        self
    }

    pub fn ldc_i4(&mut self, value: i32) -> &mut Self {
        self.op(0x20);
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn token(&mut self, opcode: u8, token: u32) -> &mut Self {
        self.op(opcode);
        self.bytes.extend_from_slice(&token.to_le_bytes());
        self
    }

    pub fn call(&mut self, token: u32) -> &mut Self {
        self.token(0x28, token)
    }

    pub fn callvirt(&mut self, token: u32) -> &mut Self {
        self.token(0x6F, token)
    }

    pub fn ldstr(&mut self, token: u32) -> &mut Self {
        self.token(0x72, token)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(0x2A)
    }

    fn branch(&mut self, opcode: u8, label: &'static str) -> &mut Self {
        self.op(opcode);
        self.fixups.push((self.bytes.len(), label));
        self.bytes.extend_from_slice(&0i32.to_le_bytes());
        self
    }

    pub fn br(&mut self, label: &'static str) -> &mut Self {
        self.branch(0x38, label)
    }

    pub fn brfalse(&mut self, label: &'static str) -> &mut Self {
        self.branch(0x39, label)
    }

    pub fn brtrue(&mut self, label: &'static str) -> &mut Self {
        self.branch(0x3A, label)
    }

    pub fn leave(&mut self, label: &'static str) -> &mut Self {
        self.branch(0xDD, label)
    }

    pub fn endfinally(&mut self) -> &mut Self {
        self.op(0xDC)
    }

    pub fn mark(&mut self, label: &'static str) -> &mut Self {
        let previous = self.labels.insert(label, self.bytes.len() as u32);
        assert!(previous.is_none(), "label {label} defined twice");
        self
    }

    /// The current offset; useful for exception-region tables.
    pub fn offset(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// The offset a label was marked at.
    pub fn label_offset(&self, label: &'static str) -> u32 {
        self.labels[label]
    }

    pub fn finish(mut self) -> Vec<u8> {
        for (position, label) in std::mem::take(&mut self.fixups) {
            let target = *self
                .labels
                .get(label)
                .unwrap_or_else(|| panic!("label {label} was never marked"));
            let relative = target as i64 - (position as i64 + 4);
            let relative =
                i32::try_from(relative).expect("branch distance exceeds 32 bits");
            self.bytes[position..position + 4].copy_from_slice(&relative.to_le_bytes());
        }
        self.bytes
    }
}

/// Builds a body with no locals and no exception regions.
pub fn simple_body(code: Vec<u8>) -> MethodBodyData {
    MethodBodyData {
        code,
        max_stack: 8,
        local_types: Vec::new(),
        init_locals: true,
        exception_regions: Vec::new(),
    }
}

/// Builds a body with the given locals and regions.
pub fn body_with(
    code: Vec<u8>,
    local_types: Vec<TsTypeRef>,
    exception_regions: Vec<ExceptionRegion>,
) -> MethodBodyData {
    MethodBodyData {
        code,
        max_stack: 8,
        local_types,
        init_locals: true,
        exception_regions,
    }
}
