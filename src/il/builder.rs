//! IL tree builder: method-body bytes to an [`ILFunction`].
//!
//! The builder decodes the supported CIL opcode subset, splits the body into
//! basic blocks at branch targets and exception-region boundaries, and
//! simulates the evaluation stack. Every pushed value is materialized as a
//! store into a fresh `StackSlot` variable, so the initial tree is flat;
//! the stack-slot inlining pass later folds single-use slots back into
//! expression trees. Exception regions are nested innermost-first into
//! `TryCatch`/`TryFinally`/`TryFault` instructions whose protected blocks
//! move into their own containers, with region-crossing branches rewritten
//! into `Leave`.
//!
//! Unsupported or undecodable opcodes fail with a `Malformed` error; the
//! pipeline driver turns that into a per-method failure record.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    il::{
        function::ILFunction,
        instruction::{BinaryOperator, Comparison, ContainerKind, InstrId, InstrKind, LabelSet, UnaryOperator},
        variable::{VarId, VariableKind},
    },
    metadata::{
        DebugInfoProvider, ExceptionRegion, ExceptionRegionKind, FieldHandle, FieldToken,
        MemberRefHandle, MethodBodyData, MethodDefHandle, MethodSpecHandle, MethodToken,
        TypeDefHandle, TypeRefHandle, TypeSpecHandle, TypeToken,
    },
    typesystem::{
        GenericContext, MethodRefRc, PrimitiveKind, ResolveOptions, TsType, TsTypeRef, TypeSystem,
    },
    Error, Result,
};

/// Builds IL trees from raw method bodies.
pub struct ILBuilder<'a> {
    types: &'a TypeSystem,
}

impl<'a> ILBuilder<'a> {
    /// Creates a builder over a type system.
    #[must_use]
    pub fn new(types: &'a TypeSystem) -> Self {
        Self { types }
    }

    /// Builds the IL tree for a method body.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for truncated bytes, unknown opcodes, or
    /// inconsistent evaluation-stack depths at block boundaries.
    pub fn build(&self, method: MethodRefRc, body: &MethodBodyData) -> Result<ILFunction> {
        self.build_inner(method, body, None)
    }

    /// Builds the IL tree, naming local slots from debug symbols when the
    /// provider knows the method.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`ILBuilder::build`].
    pub fn build_with_debug_info(
        &self,
        method: MethodRefRc,
        body: &MethodBodyData,
        debug_info: &dyn DebugInfoProvider,
        handle: MethodDefHandle,
    ) -> Result<ILFunction> {
        self.build_inner(method, body, Some((debug_info, handle)))
    }

    fn build_inner(
        &self,
        method: MethodRefRc,
        body: &MethodBodyData,
        debug_info: Option<(&dyn DebugInfoProvider, MethodDefHandle)>,
    ) -> Result<ILFunction> {
        let context = generic_context_of(&method);
        let raw = self.decode_stream(&body.code, &context)?;
        let leaders = find_leaders(&raw, &body.exception_regions, body.code.len() as u32);

        let mut state = BodyBuilder::new(self.types, method, body, debug_info, &context);
        state.create_blocks(&leaders)?;
        state.prepare_handler_entries(&body.exception_regions)?;
        state.fill_blocks(&raw, &leaders)?;
        state.nest_regions(&body.exception_regions)?;
        Ok(state.function)
    }

    /// Decodes the byte stream into offset-tagged raw operations.
    fn decode_stream(&self, code: &[u8], context: &GenericContext) -> Result<Vec<RawInstr>> {
        let mut decoded = Vec::new();
        let mut cursor = Cursor { code, pos: 0 };
        while !cursor.at_end() {
            let offset = cursor.pos as u32;
            let op = self.decode_one(&mut cursor, context)?;
            decoded.push(RawInstr { offset, op });
        }
        Ok(decoded)
    }

    #[allow(clippy::too_many_lines)]
    fn decode_one(&self, cursor: &mut Cursor<'_>, context: &GenericContext) -> Result<RawOp> {
        use RawOp as R;
        let offset = cursor.pos as u32;
        let opcode = cursor.u8()?;
        let op = match opcode {
            0x00 => R::Nop,
            0x01 => R::Nop, // break: debugger trap, decompiles to nothing
            0x02..=0x05 => R::LdArg(u16::from(opcode - 0x02)),
            0x06..=0x09 => R::LdLoc(u16::from(opcode - 0x06)),
            0x0A..=0x0D => R::StLoc(u16::from(opcode - 0x0A)),
            0x0E => R::LdArg(u16::from(cursor.u8()?)),
            0x0F => R::LdArgA(u16::from(cursor.u8()?)),
            0x10 => R::StArg(u16::from(cursor.u8()?)),
            0x11 => R::LdLoc(u16::from(cursor.u8()?)),
            0x12 => R::LdLocA(u16::from(cursor.u8()?)),
            0x13 => R::StLoc(u16::from(cursor.u8()?)),
            0x14 => R::LdNull,
            0x15 => R::LdcI4(-1),
            0x16..=0x1E => R::LdcI4(i32::from(opcode) - 0x16),
            0x1F => R::LdcI4(i32::from(cursor.u8()? as i8)),
            0x20 => R::LdcI4(cursor.i32()?),
            0x21 => R::LdcI8(cursor.i64()?),
            0x22 => R::LdcR8(f64::from(f32::from_bits(cursor.u32()?))),
            0x23 => R::LdcR8(f64::from_bits(cursor.u64()?)),
            0x25 => R::Dup,
            0x26 => R::Pop,
            0x28 => R::Call {
                method: self.resolve_method_token(cursor.u32()?, context)?,
                is_virtual: false,
            },
            0x2A => R::Ret,
            0x2B => R::Br(cursor.branch_target_i8()?),
            0x2C => R::BrFalse(cursor.branch_target_i8()?),
            0x2D => R::BrTrue(cursor.branch_target_i8()?),
            0x2E => R::BrCmp(Comparison::Equals, false, cursor.branch_target_i8()?),
            0x2F => R::BrCmp(Comparison::LessThan, true, cursor.branch_target_i8()?), // bge
            0x30 => R::BrCmp(Comparison::GreaterThan, false, cursor.branch_target_i8()?),
            0x31 => R::BrCmp(Comparison::GreaterThan, true, cursor.branch_target_i8()?), // ble
            0x32 => R::BrCmp(Comparison::LessThan, false, cursor.branch_target_i8()?),
            0x33 => R::BrCmp(Comparison::NotEquals, false, cursor.branch_target_i8()?),
            0x34 => R::BrCmp(Comparison::LessThanUn, true, cursor.branch_target_i8()?), // bge.un
            0x35 => R::BrCmp(Comparison::GreaterThanUn, false, cursor.branch_target_i8()?),
            0x36 => R::BrCmp(Comparison::GreaterThanUn, true, cursor.branch_target_i8()?), // ble.un
            0x37 => R::BrCmp(Comparison::LessThanUn, false, cursor.branch_target_i8()?),
            0x38 => R::Br(cursor.branch_target_i32()?),
            0x39 => R::BrFalse(cursor.branch_target_i32()?),
            0x3A => R::BrTrue(cursor.branch_target_i32()?),
            0x3B => R::BrCmp(Comparison::Equals, false, cursor.branch_target_i32()?),
            0x3C => R::BrCmp(Comparison::LessThan, true, cursor.branch_target_i32()?),
            0x3D => R::BrCmp(Comparison::GreaterThan, false, cursor.branch_target_i32()?),
            0x3E => R::BrCmp(Comparison::GreaterThan, true, cursor.branch_target_i32()?),
            0x3F => R::BrCmp(Comparison::LessThan, false, cursor.branch_target_i32()?),
            0x40 => R::BrCmp(Comparison::NotEquals, false, cursor.branch_target_i32()?),
            0x41 => R::BrCmp(Comparison::LessThanUn, true, cursor.branch_target_i32()?),
            0x42 => R::BrCmp(Comparison::GreaterThanUn, false, cursor.branch_target_i32()?),
            0x43 => R::BrCmp(Comparison::GreaterThanUn, true, cursor.branch_target_i32()?),
            0x44 => R::BrCmp(Comparison::LessThanUn, false, cursor.branch_target_i32()?),
            0x45 => {
                let count = cursor.u32()? as usize;
                let base = (cursor.pos + count * 4) as u32;
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    let relative = cursor.i32()?;
                    targets.push(base.wrapping_add_signed(relative));
                }
                R::Switch(targets)
            }
            0x46 => R::LdInd(PrimitiveKind::SByte),
            0x47 => R::LdInd(PrimitiveKind::Byte),
            0x48 => R::LdInd(PrimitiveKind::Int16),
            0x49 => R::LdInd(PrimitiveKind::UInt16),
            0x4A => R::LdInd(PrimitiveKind::Int32),
            0x4B => R::LdInd(PrimitiveKind::UInt32),
            0x4C => R::LdInd(PrimitiveKind::Int64),
            0x4D => R::LdInd(PrimitiveKind::IntPtr),
            0x4E => R::LdInd(PrimitiveKind::Single),
            0x4F => R::LdInd(PrimitiveKind::Double),
            0x50 => R::LdInd(PrimitiveKind::Object),
            0x51 => R::StInd(PrimitiveKind::Object),
            0x52 => R::StInd(PrimitiveKind::SByte),
            0x53 => R::StInd(PrimitiveKind::Int16),
            0x54 => R::StInd(PrimitiveKind::Int32),
            0x55 => R::StInd(PrimitiveKind::Int64),
            0x56 => R::StInd(PrimitiveKind::Single),
            0x57 => R::StInd(PrimitiveKind::Double),
            0x58 => R::Binary(BinaryOperator::Add),
            0x59 => R::Binary(BinaryOperator::Sub),
            0x5A => R::Binary(BinaryOperator::Mul),
            0x5B => R::Binary(BinaryOperator::Div),
            0x5C => R::Binary(BinaryOperator::DivUn),
            0x5D => R::Binary(BinaryOperator::Rem),
            0x5E => R::Binary(BinaryOperator::RemUn),
            0x5F => R::Binary(BinaryOperator::BitAnd),
            0x60 => R::Binary(BinaryOperator::BitOr),
            0x61 => R::Binary(BinaryOperator::BitXor),
            0x62 => R::Binary(BinaryOperator::ShiftLeft),
            0x63 => R::Binary(BinaryOperator::ShiftRight),
            0x64 => R::Binary(BinaryOperator::ShiftRightUn),
            0x65 => R::Unary(UnaryOperator::Negate),
            0x66 => R::Unary(UnaryOperator::BitNot),
            0x67 => R::Conv(PrimitiveKind::SByte),
            0x68 => R::Conv(PrimitiveKind::Int16),
            0x69 => R::Conv(PrimitiveKind::Int32),
            0x6A => R::Conv(PrimitiveKind::Int64),
            0x6B => R::Conv(PrimitiveKind::Single),
            0x6C => R::Conv(PrimitiveKind::Double),
            0x6D => R::Conv(PrimitiveKind::UInt32),
            0x6E => R::Conv(PrimitiveKind::UInt64),
            0x6F => R::Call {
                method: self.resolve_method_token(cursor.u32()?, context)?,
                is_virtual: true,
            },
            0x71 => R::LdObjTok(self.resolve_type_token(cursor.u32()?, context)?),
            0x72 => R::LdStr(self.types.reader().user_string(cursor.u32()?)?),
            0x73 => R::NewObj(self.resolve_method_token(cursor.u32()?, context)?),
            0x74 => R::CastClass(self.resolve_type_token(cursor.u32()?, context)?),
            0x75 => R::IsInst(self.resolve_type_token(cursor.u32()?, context)?),
            0x76 => R::Conv(PrimitiveKind::Double),
            0x7A => R::Throw,
            0x7B => R::LdFld(self.resolve_field_token(cursor.u32()?, context)?),
            0x7C => R::LdFldA(self.resolve_field_token(cursor.u32()?, context)?),
            0x7D => R::StFld(self.resolve_field_token(cursor.u32()?, context)?),
            0x7E => R::LdsFld(self.resolve_field_token(cursor.u32()?, context)?),
            0x7F => R::LdsFldA(self.resolve_field_token(cursor.u32()?, context)?),
            0x80 => R::StsFld(self.resolve_field_token(cursor.u32()?, context)?),
            0x81 => R::StObjTok(self.resolve_type_token(cursor.u32()?, context)?),
            0x8C => R::Box(self.resolve_type_token(cursor.u32()?, context)?),
            0xA5 => R::UnboxAny(self.resolve_type_token(cursor.u32()?, context)?),
            0xD1 => R::Conv(PrimitiveKind::UInt16),
            0xD2 => R::Conv(PrimitiveKind::Byte),
            0xD3 => R::Conv(PrimitiveKind::IntPtr),
            0xDC => R::EndFinally,
            0xDD => R::Leave(cursor.branch_target_i32()?),
            0xDE => R::Leave(cursor.branch_target_i8()?),
            0xDF => R::StInd(PrimitiveKind::IntPtr),
            0xE0 => R::Conv(PrimitiveKind::UIntPtr),
            0xFE => {
                let extended = cursor.u8()?;
                match extended {
                    0x01 => R::Compare(Comparison::Equals),
                    0x02 => R::Compare(Comparison::GreaterThan),
                    0x03 => R::Compare(Comparison::GreaterThanUn),
                    0x04 => R::Compare(Comparison::LessThan),
                    0x05 => R::Compare(Comparison::LessThanUn),
                    0x09 => R::LdArg(cursor.u16()?),
                    0x0A => R::LdArgA(cursor.u16()?),
                    0x0B => R::StArg(cursor.u16()?),
                    0x0C => R::LdLoc(cursor.u16()?),
                    0x0D => R::LdLocA(cursor.u16()?),
                    0x0E => R::StLoc(cursor.u16()?),
                    0x11 => R::EndFilter,
                    0x15 => R::InitObj(self.resolve_type_token(cursor.u32()?, context)?),
                    0x16 => {
                        // constrained. prefix: consume the type and decode the
                        // following call normally.
                        let _constrained = cursor.u32()?;
                        return self.decode_one(cursor, context);
                    }
                    0x1A => R::Rethrow,
                    other => {
                        return Err(malformed_error!(
                            "unsupported opcode 0xfe{:02x} at offset {}",
                            other,
                            offset
                        ))
                    }
                }
            }
            other => {
                return Err(malformed_error!(
                    "unsupported opcode {:#04x} at offset {}",
                    other,
                    offset
                ))
            }
        };
        Ok(op)
    }

    fn resolve_method_token(&self, token: u32, context: &GenericContext) -> Result<MethodRefRc> {
        let row = token & 0x00FF_FFFF;
        let method_token = match token >> 24 {
            0x06 => MethodToken::Definition(MethodDefHandle(row)),
            0x0A => MethodToken::MemberRef(MemberRefHandle(row)),
            0x2B => MethodToken::Specification(MethodSpecHandle(row)),
            table => {
                return Err(malformed_error!(
                    "token table {:#04x} is not a method token",
                    table
                ))
            }
        };
        self.types
            .resolve_method(method_token, context, ResolveOptions::default())
    }

    fn resolve_field_token(
        &self,
        token: u32,
        context: &GenericContext,
    ) -> Result<crate::typesystem::FieldRefRc> {
        let row = token & 0x00FF_FFFF;
        let field_token = match token >> 24 {
            0x04 => FieldToken::Definition(FieldHandle(row)),
            0x0A => FieldToken::MemberRef(MemberRefHandle(row)),
            table => {
                return Err(malformed_error!(
                    "token table {:#04x} is not a field token",
                    table
                ))
            }
        };
        self.types.resolve_field(field_token, context)
    }

    fn resolve_type_token(&self, token: u32, context: &GenericContext) -> Result<TsTypeRef> {
        let row = token & 0x00FF_FFFF;
        let type_token = match token >> 24 {
            0x01 => TypeToken::Reference(TypeRefHandle(row)),
            0x02 => TypeToken::Definition(TypeDefHandle(row)),
            0x1B => TypeToken::Specification(TypeSpecHandle(row)),
            table => {
                return Err(malformed_error!(
                    "token table {:#04x} is not a type token",
                    table
                ))
            }
        };
        self.types
            .resolve_type(type_token, context, ResolveOptions::default())
    }
}

/// The generic context of a method body: declaring-class arity plus the
/// method's own generic parameter count.
fn generic_context_of(method: &MethodRefRc) -> GenericContext {
    fn class_arity(ty: &TsType) -> u16 {
        match ty {
            TsType::Definition(def) => def.generic_param_count(),
            TsType::Unknown(unknown) => unknown.arity,
            TsType::Parameterized { definition, .. } => class_arity(definition),
            _ => 0,
        }
    }
    GenericContext::new(
        class_arity(&method.declaring_type),
        method.signature.generic_param_count,
    )
}

struct RawInstr {
    offset: u32,
    op: RawOp,
}

enum RawOp {
    Nop,
    Pop,
    Dup,
    LdcI4(i32),
    LdcI8(i64),
    LdcR8(f64),
    LdStr(String),
    LdNull,
    LdArg(u16),
    LdArgA(u16),
    StArg(u16),
    LdLoc(u16),
    LdLocA(u16),
    StLoc(u16),
    Call { method: MethodRefRc, is_virtual: bool },
    NewObj(MethodRefRc),
    Ret,
    Br(u32),
    BrTrue(u32),
    BrFalse(u32),
    /// Comparison branch; the bool negates the comparison (`bge` is
    /// `!(a < b)`).
    BrCmp(Comparison, bool, u32),
    Switch(Vec<u32>),
    Leave(u32),
    EndFinally,
    EndFilter,
    Throw,
    Rethrow,
    LdFld(crate::typesystem::FieldRefRc),
    LdFldA(crate::typesystem::FieldRefRc),
    StFld(crate::typesystem::FieldRefRc),
    LdsFld(crate::typesystem::FieldRefRc),
    LdsFldA(crate::typesystem::FieldRefRc),
    StsFld(crate::typesystem::FieldRefRc),
    LdObjTok(TsTypeRef),
    StObjTok(TsTypeRef),
    LdInd(PrimitiveKind),
    StInd(PrimitiveKind),
    InitObj(TsTypeRef),
    Box(TsTypeRef),
    UnboxAny(TsTypeRef),
    CastClass(TsTypeRef),
    IsInst(TsTypeRef),
    Binary(BinaryOperator),
    Unary(UnaryOperator),
    Compare(Comparison),
    Conv(PrimitiveKind),
}

impl RawOp {
    fn ends_block_unconditionally(&self) -> bool {
        matches!(
            self,
            Self::Ret
                | Self::Br(_)
                | Self::Leave(_)
                | Self::EndFinally
                | Self::EndFilter
                | Self::Throw
                | Self::Rethrow
        )
    }

    fn is_block_terminator(&self) -> bool {
        self.ends_block_unconditionally()
            || matches!(
                self,
                Self::BrTrue(_) | Self::BrFalse(_) | Self::BrCmp(..) | Self::Switch(_)
            )
    }
}

/// Computes the basic-block leader offsets.
fn find_leaders(
    raw: &[RawInstr],
    regions: &[ExceptionRegion],
    code_len: u32,
) -> BTreeSet<u32> {
    let mut leaders = BTreeSet::new();
    leaders.insert(0);
    for (index, instr) in raw.iter().enumerate() {
        let next_offset = raw
            .get(index + 1)
            .map_or(code_len, |next| next.offset);
        match &instr.op {
            RawOp::Br(target)
            | RawOp::BrTrue(target)
            | RawOp::BrFalse(target)
            | RawOp::BrCmp(_, _, target)
            | RawOp::Leave(target) => {
                leaders.insert(*target);
                leaders.insert(next_offset);
            }
            RawOp::Switch(targets) => {
                leaders.extend(targets.iter().copied());
                leaders.insert(next_offset);
            }
            op if op.ends_block_unconditionally() => {
                leaders.insert(next_offset);
            }
            _ => {}
        }
    }
    for region in regions {
        leaders.insert(region.try_offset);
        leaders.insert(region.try_offset + region.try_length);
        leaders.insert(region.handler_offset);
        leaders.insert(region.handler_offset + region.handler_length);
        if let ExceptionRegionKind::Filter { filter_offset } = region.kind {
            leaders.insert(filter_offset);
        }
    }
    leaders.retain(|&offset| offset < code_len);
    leaders
}

struct BodyBuilder<'a> {
    function: ILFunction,
    param_vars: Vec<VarId>,
    local_vars: Vec<VarId>,
    /// Current top-level block for each leader offset; region nesting
    /// replaces entries as blocks move into containers.
    block_at: BTreeMap<u32, InstrId>,
    /// Evaluation-stack variables expected at each block's entry.
    entry_stacks: FxHashMap<InstrId, Vec<VarId>>,
    next_stack_slot: usize,
    next_exception_slot: usize,
    /// Exit-selector variable of the region group currently being nested.
    current_exit_selector: Option<VarId>,
    returns_void: bool,
    types: &'a TypeSystem,
}

impl<'a> BodyBuilder<'a> {
    fn new(
        types: &'a TypeSystem,
        method: MethodRefRc,
        body: &MethodBodyData,
        debug_info: Option<(&dyn DebugInfoProvider, MethodDefHandle)>,
        _context: &GenericContext,
    ) -> Self {
        let returns_void = matches!(
            &*method.signature.return_type,
            TsType::Primitive(PrimitiveKind::Void)
        );

        let mut function = ILFunction::new(Some(method.clone()));

        let mut param_vars = Vec::new();
        if method.has_this() {
            let this_ty = method.declaring_type.clone();
            param_vars.push(function.add_named_variable(
                VariableKind::Parameter,
                0,
                "this".to_string(),
                Some(this_ty),
            ));
        }
        for param_ty in &method.signature.parameters {
            let index = param_vars.len();
            param_vars.push(function.add_variable(
                VariableKind::Parameter,
                index,
                Some(param_ty.clone()),
            ));
        }

        let debug_names: FxHashMap<usize, String> = debug_info
            .map(|(provider, handle)| provider.local_names(handle).into_iter().collect())
            .unwrap_or_default();
        let mut local_vars = Vec::new();
        for (slot, local_ty) in body.local_types.iter().enumerate() {
            let var = match debug_names.get(&slot) {
                Some(name) => function.add_named_variable(
                    VariableKind::Local,
                    slot,
                    name.clone(),
                    Some(local_ty.clone()),
                ),
                None => function.add_variable(VariableKind::Local, slot, Some(local_ty.clone())),
            };
            local_vars.push(var);
        }

        Self {
            function,
            param_vars,
            local_vars,
            block_at: BTreeMap::new(),
            entry_stacks: FxHashMap::default(),
            next_stack_slot: 0,
            next_exception_slot: 0,
            current_exit_selector: None,
            returns_void,
            types,
        }
    }

    fn create_blocks(&mut self, leaders: &BTreeSet<u32>) -> Result<()> {
        for &offset in leaders {
            let block = self.function.create(
                InstrKind::Block {
                    incoming_edge_count: 0,
                },
                vec![],
            )?;
            self.function.push_child(self.function.root(), block)?;
            self.block_at.insert(offset, block);
        }
        Ok(())
    }

    /// Catch and filter handler entries receive the exception object on the
    /// stack; materialize it as an exception-slot variable.
    fn prepare_handler_entries(&mut self, regions: &[ExceptionRegion]) -> Result<()> {
        for region in regions {
            match region.kind {
                ExceptionRegionKind::Catch { .. } => {
                    let var = self.fresh_exception_slot();
                    let entry = self.block_for(region.handler_offset)?;
                    self.entry_stacks.insert(entry, vec![var]);
                }
                ExceptionRegionKind::Filter { filter_offset } => {
                    let var = self.fresh_exception_slot();
                    let filter_entry = self.block_for(filter_offset)?;
                    self.entry_stacks.insert(filter_entry, vec![var]);
                    let handler_entry = self.block_for(region.handler_offset)?;
                    self.entry_stacks.insert(handler_entry, vec![var]);
                }
                ExceptionRegionKind::Finally | ExceptionRegionKind::Fault => {}
            }
        }
        Ok(())
    }

    fn fresh_exception_slot(&mut self) -> VarId {
        let index = self.next_exception_slot;
        self.next_exception_slot += 1;
        self.function
            .add_variable(VariableKind::ExceptionSlot, index, None)
    }

    fn fresh_stack_slot(&mut self) -> VarId {
        let index = self.next_stack_slot;
        self.next_stack_slot += 1;
        self.function
            .add_variable(VariableKind::StackSlot, index, None)
    }

    fn block_for(&self, offset: u32) -> Result<InstrId> {
        self.block_at
            .get(&offset)
            .copied()
            .ok_or_else(|| malformed_error!("branch target {} is not a leader", offset))
    }

    fn fill_blocks(&mut self, raw: &[RawInstr], leaders: &BTreeSet<u32>) -> Result<()> {
        let leader_list: Vec<u32> = leaders.iter().copied().collect();
        let mut raw_index = 0usize;

        for (position, &leader) in leader_list.iter().enumerate() {
            let block = self.block_for(leader)?;
            let block_end = leader_list.get(position + 1).copied();
            let mut stack: Vec<VarId> = self
                .entry_stacks
                .get(&block)
                .cloned()
                .unwrap_or_default();

            let mut terminated = false;
            while raw_index < raw.len() {
                let instr = &raw[raw_index];
                if block_end.is_some_and(|end| instr.offset >= end) {
                    break;
                }
                raw_index += 1;
                if instr.op.is_block_terminator() {
                    self.emit_terminator(block, &instr.op, &mut stack, block_end)?;
                    terminated = true;
                    // Remaining instructions before the next leader are
                    // unreachable padding; skip them.
                    while raw_index < raw.len()
                        && block_end.is_some_and(|end| raw[raw_index].offset < end)
                    {
                        raw_index += 1;
                    }
                    break;
                }
                self.emit_simple(block, &instr.op, &mut stack)?;
            }

            if !terminated {
                // Fallthrough into the next leader.
                let Some(end) = block_end else {
                    return Err(malformed_error!("method body falls off the end"));
                };
                let target = self.block_for(end)?;
                self.spill_stack_for(block, target, &mut stack)?;
                let branch = self.function.create(InstrKind::Branch(target), vec![])?;
                self.function.push_child(block, branch)?;
            }
        }
        Ok(())
    }

    /// Emits merge stores so `target` sees the surviving stack entries in its
    /// own entry variables.
    fn spill_stack_for(
        &mut self,
        block: InstrId,
        target: InstrId,
        stack: &mut Vec<VarId>,
    ) -> Result<()> {
        if stack.is_empty() && !self.entry_stacks.contains_key(&target) {
            return Ok(());
        }
        let entry: Vec<VarId> = match self.entry_stacks.get(&target) {
            Some(existing) => {
                if existing.len() != stack.len() {
                    return Err(malformed_error!(
                        "evaluation stack depth mismatch at block boundary ({} vs {})",
                        existing.len(),
                        stack.len()
                    ));
                }
                existing.clone()
            }
            None => {
                let fresh: Vec<VarId> = stack.iter().map(|_| self.fresh_stack_slot()).collect();
                self.entry_stacks.insert(target, fresh.clone());
                fresh
            }
        };
        for (&current, &expected) in stack.iter().zip(&entry) {
            if current != expected {
                let load = self.function.create(InstrKind::LdLoc(current), vec![])?;
                let store = self.function.create(InstrKind::StLoc(expected), vec![load])?;
                self.function.push_child(block, store)?;
            }
        }
        Ok(())
    }

    fn push_value(&mut self, block: InstrId, value: InstrId, stack: &mut Vec<VarId>) -> Result<()> {
        let slot = self.fresh_stack_slot();
        let store = self.function.create(InstrKind::StLoc(slot), vec![value])?;
        self.function.push_child(block, store)?;
        stack.push(slot);
        Ok(())
    }

    fn pop_value(&mut self, stack: &mut Vec<VarId>) -> Result<InstrId> {
        let slot = stack
            .pop()
            .ok_or_else(|| malformed_error!("evaluation stack underflow"))?;
        self.function.create(InstrKind::LdLoc(slot), vec![])
    }

    fn pop_many(&mut self, stack: &mut Vec<VarId>, count: usize) -> Result<Vec<InstrId>> {
        if stack.len() < count {
            return Err(malformed_error!("evaluation stack underflow"));
        }
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.pop_value(stack)?);
        }
        values.reverse();
        Ok(values)
    }

    #[allow(clippy::too_many_lines)]
    fn emit_simple(
        &mut self,
        block: InstrId,
        op: &RawOp,
        stack: &mut Vec<VarId>,
    ) -> Result<()> {
        use InstrKind as K;
        match op {
            RawOp::Nop => {
                let nop = self.function.create(K::Nop, vec![])?;
                self.function.push_child(block, nop)?;
            }
            RawOp::Pop => {
                stack
                    .pop()
                    .ok_or_else(|| malformed_error!("evaluation stack underflow"))?;
            }
            RawOp::Dup => {
                let top = *stack
                    .last()
                    .ok_or_else(|| malformed_error!("evaluation stack underflow"))?;
                stack.push(top);
            }
            RawOp::LdcI4(value) => {
                let node = self.function.create(K::LdcI4(*value), vec![])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::LdcI8(value) => {
                let node = self.function.create(K::LdcI8(*value), vec![])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::LdcR8(value) => {
                let node = self.function.create(K::LdcR8(*value), vec![])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::LdStr(value) => {
                let node = self.function.create(K::LdStr(value.clone()), vec![])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::LdNull => {
                let node = self.function.create(K::LdNull, vec![])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::LdArg(index) => {
                let var = self.param_var(*index)?;
                let node = self.function.create(K::LdLoc(var), vec![])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::LdArgA(index) => {
                let var = self.param_var(*index)?;
                let node = self.function.create(K::LdLoca(var), vec![])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::StArg(index) => {
                let var = self.param_var(*index)?;
                let value = self.pop_value(stack)?;
                let store = self.function.create(K::StLoc(var), vec![value])?;
                self.function.push_child(block, store)?;
            }
            RawOp::LdLoc(index) => {
                let var = self.local_var(*index)?;
                let node = self.function.create(K::LdLoc(var), vec![])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::LdLocA(index) => {
                let var = self.local_var(*index)?;
                let node = self.function.create(K::LdLoca(var), vec![])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::StLoc(index) => {
                let var = self.local_var(*index)?;
                let value = self.pop_value(stack)?;
                let store = self.function.create(K::StLoc(var), vec![value])?;
                self.function.push_child(block, store)?;
            }
            RawOp::Call { method, is_virtual } => {
                let arguments = self.pop_many(stack, method.argument_count())?;
                let kind = if *is_virtual {
                    K::CallVirt(method.clone())
                } else {
                    K::Call(method.clone())
                };
                let call = self.function.create(kind, arguments)?;
                let returns_value = !matches!(
                    &*method.signature.return_type,
                    TsType::Primitive(PrimitiveKind::Void)
                );
                if returns_value {
                    self.push_value(block, call, stack)?;
                } else {
                    self.function.push_child(block, call)?;
                }
            }
            RawOp::NewObj(ctor) => {
                let argument_count = ctor.signature.parameters.len();
                let arguments = self.pop_many(stack, argument_count)?;
                let node = self.function.create(K::NewObj(ctor.clone()), arguments)?;
                self.push_value(block, node, stack)?;
            }
            RawOp::LdFld(field) => {
                let target = self.pop_value(stack)?;
                let node = self.function.create(K::LdFld(field.clone()), vec![target])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::LdFldA(field) => {
                let target = self.pop_value(stack)?;
                let node = self
                    .function
                    .create(K::LdFlda(field.clone()), vec![target])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::StFld(field) => {
                let value = self.pop_value(stack)?;
                let target = self.pop_value(stack)?;
                let node = self
                    .function
                    .create(K::StFld(field.clone()), vec![target, value])?;
                self.function.push_child(block, node)?;
            }
            RawOp::LdsFld(field) => {
                let node = self.function.create(K::LdsFld(field.clone()), vec![])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::LdsFldA(field) => {
                let node = self.function.create(K::LdsFlda(field.clone()), vec![])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::StsFld(field) => {
                let value = self.pop_value(stack)?;
                let node = self.function.create(K::StsFld(field.clone()), vec![value])?;
                self.function.push_child(block, node)?;
            }
            RawOp::LdObjTok(ty) => {
                let target = self.pop_value(stack)?;
                let node = self.function.create(K::LdObj(ty.clone()), vec![target])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::StObjTok(ty) => {
                let value = self.pop_value(stack)?;
                let target = self.pop_value(stack)?;
                let node = self
                    .function
                    .create(K::StObj(ty.clone()), vec![target, value])?;
                self.function.push_child(block, node)?;
            }
            RawOp::LdInd(kind) => {
                let target = self.pop_value(stack)?;
                let node = self
                    .function
                    .create(K::LdObj(TsType::primitive(*kind)), vec![target])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::StInd(kind) => {
                let value = self.pop_value(stack)?;
                let target = self.pop_value(stack)?;
                let node = self
                    .function
                    .create(K::StObj(TsType::primitive(*kind)), vec![target, value])?;
                self.function.push_child(block, node)?;
            }
            RawOp::InitObj(ty) => {
                let target = self.pop_value(stack)?;
                let default = self.function.create(K::DefaultValue(ty.clone()), vec![])?;
                let node = self
                    .function
                    .create(K::StObj(ty.clone()), vec![target, default])?;
                self.function.push_child(block, node)?;
            }
            RawOp::Box(ty) => {
                let value = self.pop_value(stack)?;
                let node = self.function.create(K::Box(ty.clone()), vec![value])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::UnboxAny(ty) => {
                let value = self.pop_value(stack)?;
                let node = self.function.create(K::UnboxAny(ty.clone()), vec![value])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::CastClass(ty) => {
                let value = self.pop_value(stack)?;
                let node = self.function.create(K::CastClass(ty.clone()), vec![value])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::IsInst(ty) => {
                let value = self.pop_value(stack)?;
                let node = self.function.create(K::IsInst(ty.clone()), vec![value])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::Binary(operator) => {
                let operands = self.pop_many(stack, 2)?;
                let node = self.function.create(K::BinaryOp(*operator), operands)?;
                self.push_value(block, node, stack)?;
            }
            RawOp::Unary(operator) => {
                let value = self.pop_value(stack)?;
                let node = self.function.create(K::UnaryOp(*operator), vec![value])?;
                self.push_value(block, node, stack)?;
            }
            RawOp::Compare(comparison) => {
                let operands = self.pop_many(stack, 2)?;
                let node = self.function.create(K::Comp(*comparison), operands)?;
                self.push_value(block, node, stack)?;
            }
            RawOp::Conv(kind) => {
                let value = self.pop_value(stack)?;
                let node = self.function.create(K::Conv(*kind), vec![value])?;
                self.push_value(block, node, stack)?;
            }
            _ => {
                return Err(invariant_error!(
                    "terminator handled as simple instruction"
                ))
            }
        }
        Ok(())
    }

    fn emit_terminator(
        &mut self,
        block: InstrId,
        op: &RawOp,
        stack: &mut Vec<VarId>,
        fallthrough: Option<u32>,
    ) -> Result<()> {
        use InstrKind as K;
        match op {
            RawOp::Ret => {
                let children = if self.returns_void {
                    vec![]
                } else {
                    vec![self.pop_value(stack)?]
                };
                let ret = self.function.create(K::Return, children)?;
                self.function.push_child(block, ret)?;
            }
            RawOp::Br(target_offset) => {
                let target = self.block_for(*target_offset)?;
                self.spill_stack_for(block, target, stack)?;
                let branch = self.function.create(K::Branch(target), vec![])?;
                self.function.push_child(block, branch)?;
            }
            RawOp::Leave(target_offset) => {
                // Decoded as a plain branch; region nesting rewrites branches
                // that cross a protected-region boundary into `leave`.
                stack.clear();
                let target = self.block_for(*target_offset)?;
                let branch = self.function.create(K::Branch(target), vec![])?;
                self.function.push_child(block, branch)?;
            }
            RawOp::EndFinally => {
                // Placeholder target: rewritten to the enclosing handler
                // container during region nesting.
                stack.clear();
                let leave = self.function.create(K::Leave(self.function.root()), vec![])?;
                self.function.push_child(block, leave)?;
            }
            RawOp::EndFilter => {
                let value = self.pop_value(stack)?;
                let leave = self
                    .function
                    .create(K::Leave(self.function.root()), vec![value])?;
                self.function.push_child(block, leave)?;
            }
            RawOp::Throw => {
                let exception = self.pop_value(stack)?;
                let throw = self.function.create(K::Throw, vec![exception])?;
                self.function.push_child(block, throw)?;
            }
            RawOp::Rethrow => {
                let rethrow = self.function.create(K::Rethrow, vec![])?;
                self.function.push_child(block, rethrow)?;
            }
            RawOp::BrTrue(target_offset) | RawOp::BrFalse(target_offset) => {
                let mut condition = self.pop_value(stack)?;
                if matches!(op, RawOp::BrFalse(_)) {
                    condition = self.function.create(K::LogicNot, vec![condition])?;
                }
                self.emit_conditional(block, condition, *target_offset, fallthrough, stack)?;
            }
            RawOp::BrCmp(comparison, negate, target_offset) => {
                let operands = self.pop_many(stack, 2)?;
                let mut condition = self.function.create(K::Comp(*comparison), operands)?;
                if *negate {
                    condition = self.function.create(K::LogicNot, vec![condition])?;
                }
                self.emit_conditional(block, condition, *target_offset, fallthrough, stack)?;
            }
            RawOp::Switch(target_offsets) => {
                let value = self.pop_value(stack)?;
                let fallthrough_offset = fallthrough
                    .ok_or_else(|| malformed_error!("switch at the end of the method body"))?;

                let mut spill_targets: Vec<u32> = target_offsets.clone();
                spill_targets.push(fallthrough_offset);
                for &offset in &spill_targets {
                    let target = self.block_for(offset)?;
                    self.spill_stack_for(block, target, &mut stack.clone())?;
                }

                let mut children = vec![value];
                for (ordinal, &offset) in target_offsets.iter().enumerate() {
                    let target = self.block_for(offset)?;
                    let branch = self.function.create(K::Branch(target), vec![])?;
                    let section = self.function.create(
                        K::SwitchSection(LabelSet::single(ordinal as i64)),
                        vec![branch],
                    )?;
                    children.push(section);
                }
                let covered: Vec<i64> = (0..target_offsets.len() as i64).collect();
                let default_labels = LabelSet::from_values(&covered).complement();
                let default_target = self.block_for(fallthrough_offset)?;
                let default_branch = self.function.create(K::Branch(default_target), vec![])?;
                let default_section = self
                    .function
                    .create(K::SwitchSection(default_labels), vec![default_branch])?;
                children.push(default_section);

                let switch = self.function.create(K::SwitchInstruction, children)?;
                self.function.push_child(block, switch)?;
                stack.clear();
            }
            _ => return Err(invariant_error!("simple instruction handled as terminator")),
        }
        Ok(())
    }

    fn emit_conditional(
        &mut self,
        block: InstrId,
        condition: InstrId,
        target_offset: u32,
        fallthrough: Option<u32>,
        stack: &mut Vec<VarId>,
    ) -> Result<()> {
        use InstrKind as K;
        let target = self.block_for(target_offset)?;
        let fallthrough_offset = fallthrough
            .ok_or_else(|| malformed_error!("conditional branch at the end of the method body"))?;
        let fallthrough_block = self.block_for(fallthrough_offset)?;

        // Merge stores are unconditional but target fresh slot variables, so
        // emitting them for both successors before the branch is safe.
        self.spill_stack_for(block, target, &mut stack.clone())?;
        self.spill_stack_for(block, fallthrough_block, stack)?;

        let then_branch = self.function.create(K::Branch(target), vec![])?;
        let else_nop = self.function.create(K::Nop, vec![])?;
        let if_instr = self
            .function
            .create(K::IfInstruction, vec![condition, then_branch, else_nop])?;
        self.function.push_child(block, if_instr)?;

        let fall_branch = self
            .function
            .create(K::Branch(fallthrough_block), vec![])?;
        self.function.push_child(block, fall_branch)?;
        Ok(())
    }

    fn param_var(&self, index: u16) -> Result<VarId> {
        self.param_vars
            .get(index as usize)
            .copied()
            .ok_or_else(|| malformed_error!("parameter index {} out of range", index))
    }

    fn local_var(&self, index: u16) -> Result<VarId> {
        self.local_vars
            .get(index as usize)
            .copied()
            .ok_or_else(|| malformed_error!("local slot {} out of range", index))
    }

    // ------------------------------------------------------------------
    // Exception-region nesting
    // ------------------------------------------------------------------

    fn nest_regions(&mut self, regions: &[ExceptionRegion]) -> Result<()> {
        if regions.is_empty() {
            return Ok(());
        }
        let mut groups = group_regions(regions);
        // Innermost regions first, so outer regions wrap the already-built
        // try instructions.
        groups.sort_by_key(|group| (group.span_end - group.span_start, group.span_start));

        for group in groups {
            self.nest_one_group(&group)?;
        }
        Ok(())
    }

    fn nest_one_group(&mut self, group: &RegionGroup) -> Result<()> {
        use InstrKind as K;

        let try_entry = self.block_for(group.try_offset)?;
        let try_container =
            self.collect_range_into_container(group.try_offset, group.try_end)?;
        // Exit targets are indexed across the try and every handler, so the
        // selector dispatch agrees no matter which region left.
        let mut exits: Vec<InstrId> = Vec::new();
        self.rewrite_region_exits(try_container, false, &mut exits)?;

        let mut handler_nodes = Vec::new();
        let mut try_kind = None;
        for handler in &group.handlers {
            let handler_container = self.collect_range_into_container(
                handler.handler_offset,
                handler.handler_offset + handler.handler_length,
            )?;
            self.rewrite_region_exits(
                handler_container,
                matches!(
                    handler.kind,
                    ExceptionRegionKind::Finally | ExceptionRegionKind::Fault
                ),
                &mut exits,
            )?;

            match &handler.kind {
                ExceptionRegionKind::Catch { exception_type } => {
                    let caught = match exception_type {
                        Some(token) => self.types.resolve_type(
                            *token,
                            &GenericContext::unconstrained(),
                            ResolveOptions::default(),
                        )?,
                        None => TsType::primitive(PrimitiveKind::Object),
                    };
                    let entry = self.function.children(handler_container)[0];
                    let variable = self.entry_stacks.get(&entry).and_then(|s| s.first().copied());
                    let variable = variable
                        .ok_or_else(|| invariant_error!("catch handler entry has no slot"))?;
                    let filter = self.function.create(K::LdcI4(1), vec![])?;
                    let handler_node = self.function.create(
                        K::CatchHandler {
                            variable,
                            exception_type: caught,
                        },
                        vec![filter, handler_container],
                    )?;
                    handler_nodes.push(handler_node);
                    try_kind.get_or_insert(K::TryCatch);
                }
                ExceptionRegionKind::Filter { filter_offset } => {
                    let filter_container = self
                        .collect_range_into_container(*filter_offset, handler.handler_offset)?;
                    let mut filter_exits = Vec::new();
                    self.rewrite_region_exits(filter_container, true, &mut filter_exits)?;
                    let entry = self.function.children(handler_container)[0];
                    let variable = self.entry_stacks.get(&entry).and_then(|s| s.first().copied());
                    let variable = variable
                        .ok_or_else(|| invariant_error!("filter handler entry has no slot"))?;
                    let handler_node = self.function.create(
                        K::CatchHandler {
                            variable,
                            exception_type: TsType::primitive(PrimitiveKind::Object),
                        },
                        vec![filter_container, handler_container],
                    )?;
                    handler_nodes.push(handler_node);
                    try_kind.get_or_insert(K::TryCatch);
                }
                ExceptionRegionKind::Finally => {
                    handler_nodes.push(handler_container);
                    try_kind = Some(K::TryFinally);
                }
                ExceptionRegionKind::Fault => {
                    handler_nodes.push(handler_container);
                    try_kind = Some(K::TryFault);
                }
            }
        }

        let mut children = vec![try_container];
        children.extend(handler_nodes);
        let try_node = self.function.create(
            try_kind.ok_or_else(|| malformed_error!("exception region without handlers"))?,
            children,
        )?;

        // Wrapper block standing where the protected region began.
        let wrapper = self.function.create(
            K::Block {
                incoming_edge_count: 0,
            },
            vec![try_node],
        )?;
        self.append_exit_dispatch(wrapper, try_container, &exits)?;

        // Insert the wrapper where the protected range began: right after
        // the last remaining top-level block with a lower leader offset.
        let root = self.function.root();
        let insert_at = self
            .block_at
            .range(..group.try_offset)
            .filter_map(|(_, &b)| {
                self.function
                    .children(root)
                    .iter()
                    .position(|&child| child == b)
            })
            .max()
            .map_or(0, |p| p + 1);
        self.function.insert_child(root, insert_at, wrapper)?;
        self.block_at.insert(group.try_offset, wrapper);

        self.redirect_branches_outside(try_container, try_entry, wrapper)?;
        Ok(())
    }

    /// Moves the top-level blocks whose leader offsets fall in
    /// `[start, end)` into a fresh container, preserving order. The moved
    /// offsets are removed from the offset map (the caller reinstates the
    /// start offset for the wrapper).
    fn collect_range_into_container(&mut self, start: u32, end: u32) -> Result<InstrId> {
        let offsets: Vec<u32> = self
            .block_at
            .range(start..end)
            .map(|(&offset, _)| offset)
            .collect();
        let container = self
            .function
            .create(InstrKind::BlockContainer(ContainerKind::Normal), vec![])?;
        for offset in offsets {
            let block = self.block_at.remove(&offset).expect("offset just listed");
            let detached = self.function.detach(block)?;
            self.function.push_child(container, detached)?;
        }
        if self.function.children(container).is_empty() {
            return Err(malformed_error!(
                "exception region [{start}, {end}) covers no blocks"
            ));
        }
        Ok(container)
    }

    /// Rewrites branches that escape `container` into `leave container`,
    /// returning the distinct outside targets in first-seen order. With
    /// `rewrite_placeholders`, `leave`s still targeting the function root
    /// (from `endfinally`/`endfilter`) are retargeted to this container.
    fn rewrite_region_exits(
        &mut self,
        container: InstrId,
        rewrite_placeholders: bool,
        exits: &mut Vec<InstrId>,
    ) -> Result<()> {
        let members: FxHashSet<InstrId> =
            self.function.children(container).iter().copied().collect();
        let root = self.function.root();

        for descendant in self.function.descendants(container) {
            match *self.function.kind(descendant) {
                InstrKind::Branch(target) => {
                    // Only branches to this container's own level matter;
                    // branches inside nested containers resolve within them.
                    let owner = self.owning_container(descendant);
                    if owner != Some(container) {
                        continue;
                    }
                    if !members.contains(&target) {
                        if !exits.contains(&target) {
                            exits.push(target);
                        }
                        let exit_index = exits.iter().position(|&t| t == target).unwrap();
                        self.replace_branch_with_leave(descendant, container, exit_index, exits.len())?;
                    }
                }
                InstrKind::Leave(target) if rewrite_placeholders && target == root => {
                    self.function
                        .replace_kind(descendant, InstrKind::Leave(container));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// The block container whose block-level the branch resolves against.
    fn owning_container(&self, branch: InstrId) -> Option<InstrId> {
        self.function.ancestor_matching(branch, |kind| {
            matches!(kind, InstrKind::BlockContainer(_))
        })
    }

    /// Replaces an escaping branch with `stloc sel(k); leave container` when
    /// several exit targets exist, or a plain `leave` otherwise. The
    /// selector store is patched in later by `append_exit_dispatch` once the
    /// full exit set is known, so here every exit records its index.
    fn replace_branch_with_leave(
        &mut self,
        branch: InstrId,
        container: InstrId,
        exit_index: usize,
        _total: usize,
    ) -> Result<()> {
        let parent = self
            .function
            .parent(branch)
            .ok_or_else(|| invariant_error!("escaping branch is detached"))?;
        let slot = self.function.child_index(branch);
        let selector = self.exit_selector_for(container)?;
        let constant = self
            .function
            .create(InstrKind::LdcI4(exit_index as i32), vec![])?;
        let store = self.function.create(InstrKind::StLoc(selector), vec![constant])?;
        self.function.insert_child(parent, slot, store)?;

        self.function.replace_kind(branch, InstrKind::Leave(container));
        Ok(())
    }

    /// One selector variable per nesting pass, shared by try and handlers.
    fn exit_selector_for(&mut self, _container: InstrId) -> Result<VarId> {
        if let Some(var) = self.current_exit_selector {
            return Ok(var);
        }
        let index = self.local_vars.len() + self.next_stack_slot;
        let var = self
            .function
            .add_variable(VariableKind::Local, index, None);
        self.current_exit_selector = Some(var);
        Ok(var)
    }

    /// Emits the continuation after the try instruction: nothing when the
    /// region never exits normally, a direct branch for a single exit, or an
    /// if-chain over the exit selector.
    fn append_exit_dispatch(
        &mut self,
        wrapper: InstrId,
        _try_container: InstrId,
        exits: &[InstrId],
    ) -> Result<()> {
        use InstrKind as K;
        let selector = self.current_exit_selector.take();
        match exits {
            [] => Ok(()),
            [only] => {
                // A single exit target needs no selector; drop the stores.
                if let Some(var) = selector {
                    self.strip_selector_stores(var, wrapper)?;
                }
                let branch = self.function.create(K::Branch(*only), vec![])?;
                self.function.push_child(wrapper, branch)
            }
            [init @ .., last] => {
                let selector =
                    selector.ok_or_else(|| invariant_error!("multi-exit region lost its selector"))?;
                for (index, &target) in init.iter().enumerate() {
                    let load = self.function.create(K::LdLoc(selector), vec![])?;
                    let constant = self.function.create(K::LdcI4(index as i32), vec![])?;
                    let compare = self
                        .function
                        .create(K::Comp(Comparison::Equals), vec![load, constant])?;
                    let then_branch = self.function.create(K::Branch(target), vec![])?;
                    let else_nop = self.function.create(K::Nop, vec![])?;
                    let if_instr = self
                        .function
                        .create(K::IfInstruction, vec![compare, then_branch, else_nop])?;
                    self.function.push_child(wrapper, if_instr)?;
                }
                let fallback = self.function.create(K::Branch(*last), vec![])?;
                self.function.push_child(wrapper, fallback)
            }
        }
    }

    /// Removes the selector stores inserted for what turned out to be a
    /// single-exit region. The wrapper is not attached to the root yet, so
    /// the scan starts from it rather than from the function root.
    fn strip_selector_stores(&mut self, selector: VarId, within: InstrId) -> Result<()> {
        let all: Vec<InstrId> = self.function.descendants(within);
        for id in all {
            if self.function.is_dead(id) {
                continue;
            }
            if let Some((var, _)) = self.function.match_stloc(id) {
                if var == selector {
                    self.function.discard(id)?;
                }
            }
        }
        Ok(())
    }

    /// Redirects branches living outside the moved region from the old entry
    /// block to the wrapper.
    fn redirect_branches_outside(
        &mut self,
        container: InstrId,
        old_entry: InstrId,
        wrapper: InstrId,
    ) -> Result<()> {
        let inside: FxHashSet<InstrId> = self
            .function
            .descendants_and_self(container)
            .into_iter()
            .collect();
        let all: Vec<InstrId> = self.function.descendants(self.function.root());
        for id in all {
            if inside.contains(&id) || self.function.is_dead(id) {
                continue;
            }
            if let InstrKind::Branch(target) = *self.function.kind(id) {
                if target == old_entry {
                    self.function.set_branch_target(id, wrapper)?;
                }
            }
        }
        Ok(())
    }
}

/// A try range plus all its handlers (catches sharing one try range merge
/// into a single group).
struct RegionGroup {
    try_offset: u32,
    try_end: u32,
    span_start: u32,
    span_end: u32,
    handlers: Vec<ExceptionRegion>,
}

fn group_regions(regions: &[ExceptionRegion]) -> Vec<RegionGroup> {
    let mut groups: Vec<RegionGroup> = Vec::new();
    for region in regions {
        let try_end = region.try_offset + region.try_length;
        let handler_end = region.handler_offset + region.handler_length;
        let span_start = region.try_offset.min(match region.kind {
            ExceptionRegionKind::Filter { filter_offset } => filter_offset,
            _ => region.handler_offset,
        });
        let span_end = try_end.max(handler_end);

        let mergeable = matches!(
            region.kind,
            ExceptionRegionKind::Catch { .. } | ExceptionRegionKind::Filter { .. }
        );
        if mergeable {
            if let Some(group) = groups.iter_mut().find(|group| {
                group.try_offset == region.try_offset
                    && group.try_end == try_end
                    && group.handlers.iter().all(|existing| {
                        matches!(
                            existing.kind,
                            ExceptionRegionKind::Catch { .. } | ExceptionRegionKind::Filter { .. }
                        )
                    })
            }) {
                group.span_start = group.span_start.min(span_start);
                group.span_end = group.span_end.max(span_end);
                group.handlers.push(region.clone());
                continue;
            }
        }
        groups.push(RegionGroup {
            try_offset: region.try_offset,
            try_end,
            span_start,
            span_end,
            handlers: vec![region.clone()],
        });
    }
    groups
}

struct Cursor<'a> {
    code: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.code.len()
    }

    fn u8(&mut self) -> Result<u8> {
        let byte = *self.code.get(self.pos).ok_or(Error::OutOfBounds)?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self
            .code
            .get(self.pos..self.pos + 2)
            .ok_or(Error::OutOfBounds)?;
        self.pos += 2;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self
            .code
            .get(self.pos..self.pos + 4)
            .ok_or(Error::OutOfBounds)?;
        self.pos += 4;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self
            .code
            .get(self.pos..self.pos + 8)
            .ok_or(Error::OutOfBounds)?;
        self.pos += 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    /// Decodes a one-byte relative branch target into an absolute offset.
    fn branch_target_i8(&mut self) -> Result<u32> {
        let relative = self.u8()? as i8;
        Ok((self.pos as u32).wrapping_add_signed(i32::from(relative)))
    }

    /// Decodes a four-byte relative branch target into an absolute offset.
    fn branch_target_i32(&mut self) -> Result<u32> {
        let relative = self.i32()?;
        Ok((self.pos as u32).wrapping_add_signed(relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::{
        metadata::{
            AttributeOwner, AttributeRecord, FieldRecord, MemberRefRecord, MetadataReader,
            MethodDefRecord, MethodSpecRecord, SignatureProvider, TypeDefRecord, TypeRefRecord,
        },
        typesystem::{
            MethodRef, MethodSignature, MethodTarget, TypeParameterSubstitution, UnknownType,
        },
    };

    /// A reader backing nothing; the tests below hand bodies to the builder
    /// directly and use only tokenless opcodes.
    struct NullReader;

    impl MetadataReader for NullReader {
        fn assembly_name(&self) -> String {
            "null".to_string()
        }

        fn type_definitions(&self) -> Vec<TypeDefHandle> {
            Vec::new()
        }

        fn type_definition(&self, _handle: TypeDefHandle) -> Result<TypeDefRecord> {
            Err(malformed_error!("no metadata behind the null reader"))
        }

        fn type_reference(&self, _handle: TypeRefHandle) -> Result<TypeRefRecord> {
            Err(malformed_error!("no metadata behind the null reader"))
        }

        fn type_specification(
            &self,
            _handle: TypeSpecHandle,
            _provider: &dyn SignatureProvider,
        ) -> Result<TsTypeRef> {
            Err(malformed_error!("no metadata behind the null reader"))
        }

        fn method_definition(&self, _handle: MethodDefHandle) -> Result<MethodDefRecord> {
            Err(malformed_error!("no metadata behind the null reader"))
        }

        fn method_def_signature(
            &self,
            _handle: MethodDefHandle,
            _provider: &dyn SignatureProvider,
        ) -> Result<MethodSignature> {
            Err(malformed_error!("no metadata behind the null reader"))
        }

        fn member_reference(&self, _handle: MemberRefHandle) -> Result<MemberRefRecord> {
            Err(malformed_error!("no metadata behind the null reader"))
        }

        fn member_ref_signature(
            &self,
            _handle: MemberRefHandle,
            _provider: &dyn SignatureProvider,
        ) -> Result<MethodSignature> {
            Err(malformed_error!("no metadata behind the null reader"))
        }

        fn member_ref_field_type(
            &self,
            _handle: MemberRefHandle,
            _provider: &dyn SignatureProvider,
        ) -> Result<TsTypeRef> {
            Err(malformed_error!("no metadata behind the null reader"))
        }

        fn method_specification(&self, _handle: MethodSpecHandle) -> Result<MethodSpecRecord> {
            Err(malformed_error!("no metadata behind the null reader"))
        }

        fn method_spec_arguments(
            &self,
            _handle: MethodSpecHandle,
            _provider: &dyn SignatureProvider,
        ) -> Result<Vec<TsTypeRef>> {
            Err(malformed_error!("no metadata behind the null reader"))
        }

        fn field(&self, _handle: FieldHandle) -> Result<FieldRecord> {
            Err(malformed_error!("no metadata behind the null reader"))
        }

        fn field_signature(
            &self,
            _handle: FieldHandle,
            _provider: &dyn SignatureProvider,
        ) -> Result<TsTypeRef> {
            Err(malformed_error!("no metadata behind the null reader"))
        }

        fn custom_attributes(&self, _owner: AttributeOwner) -> Vec<AttributeRecord> {
            Vec::new()
        }

        fn method_body(&self, _handle: MethodDefHandle) -> Result<MethodBodyData> {
            Err(malformed_error!("no metadata behind the null reader"))
        }

        fn user_string(&self, _token: u32) -> Result<String> {
            Err(malformed_error!("no metadata behind the null reader"))
        }
    }

    fn fake_method(parameters: Vec<TsTypeRef>) -> MethodRefRc {
        Arc::new(MethodRef {
            target: MethodTarget::Fake,
            declaring_type: Arc::new(TsType::Unknown(UnknownType {
                namespace: "My".into(),
                name: "App".into(),
                arity: 0,
            })),
            name: "Target".into(),
            signature: MethodSignature::simple(
                TsType::primitive(PrimitiveKind::Void),
                parameters,
            ),
            substitution: TypeParameterSubstitution::identity(),
            vararg_instance: false,
        })
    }

    /// A minimal label-fixup assembler for test bodies.
    #[derive(Default)]
    struct TestAsm {
        bytes: Vec<u8>,
        labels: FxHashMap<&'static str, u32>,
        fixups: Vec<(usize, &'static str)>,
    }

    impl TestAsm {
        fn op(&mut self, opcode: u8) -> &mut Self {
            self.bytes.push(opcode);
            self
        }

        fn ldarg0(&mut self) -> &mut Self {
            self.op(0x02)
        }

        fn ldnull(&mut self) -> &mut Self {
            self.op(0x14)
        }

        fn pop(&mut self) -> &mut Self {
            self.op(0x26)
        }

        fn ldc_i4(&mut self, value: i32) -> &mut Self {
            self.op(0x20);
            self.bytes.extend_from_slice(&value.to_le_bytes());
            self
        }

        fn throw(&mut self) -> &mut Self {
            self.op(0x7A)
        }

        fn ret(&mut self) -> &mut Self {
            self.op(0x2A)
        }

        fn endfinally(&mut self) -> &mut Self {
            self.op(0xDC)
        }

        fn endfilter(&mut self) -> &mut Self {
            self.op(0xFE);
            self.op(0x11)
        }

        fn branch(&mut self, opcode: u8, label: &'static str) -> &mut Self {
            self.op(opcode);
            self.fixups.push((self.bytes.len(), label));
            self.bytes.extend_from_slice(&0i32.to_le_bytes());
            self
        }

        fn brfalse(&mut self, label: &'static str) -> &mut Self {
            self.branch(0x39, label)
        }

        fn leave(&mut self, label: &'static str) -> &mut Self {
            self.branch(0xDD, label)
        }

        fn mark(&mut self, label: &'static str) -> &mut Self {
            self.labels.insert(label, self.bytes.len() as u32);
            self
        }

        fn label_offset(&self, label: &'static str) -> u32 {
            self.labels[label]
        }

        fn finish(mut self) -> Vec<u8> {
            for (position, label) in std::mem::take(&mut self.fixups) {
                let target = self.labels[label];
                let relative = target as i64 - (position as i64 + 4);
                self.bytes[position..position + 4]
                    .copy_from_slice(&(relative as i32).to_le_bytes());
            }
            self.bytes
        }
    }

    fn body(
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

    fn build(parameters: Vec<TsTypeRef>, data: &MethodBodyData) -> ILFunction {
        let types = TypeSystem::new(Arc::new(NullReader));
        let function = ILBuilder::new(&types)
            .build(fake_method(parameters), data)
            .unwrap();
        function.check_invariants().unwrap();
        function
    }

    fn find_kind(
        function: &ILFunction,
        predicate: impl Fn(&InstrKind) -> bool,
    ) -> Option<InstrId> {
        function
            .descendants_and_self(function.root())
            .into_iter()
            .find(|&id| !function.is_dead(id) && predicate(function.kind(id)))
    }

    #[test]
    fn test_two_catch_handlers_share_one_try() {
        let mut asm = TestAsm::default();
        asm.mark("TRY").ldnull().throw();
        asm.mark("H1").pop().leave("AFTER");
        asm.mark("H2").pop().leave("AFTER");
        asm.mark("AFTER").ret();

        let try_offset = asm.label_offset("TRY");
        let h1 = asm.label_offset("H1");
        let h2 = asm.label_offset("H2");
        let after = asm.label_offset("AFTER");
        let regions = vec![
            ExceptionRegion {
                kind: ExceptionRegionKind::Catch {
                    exception_type: None,
                },
                try_offset,
                try_length: h1 - try_offset,
                handler_offset: h1,
                handler_length: h2 - h1,
            },
            ExceptionRegion {
                kind: ExceptionRegionKind::Catch {
                    exception_type: None,
                },
                try_offset,
                try_length: h1 - try_offset,
                handler_offset: h2,
                handler_length: after - h2,
            },
        ];
        let function = build(vec![], &body(asm.finish(), vec![], regions));

        // One try instruction carrying both handlers.
        let try_catch = find_kind(&function, |kind| matches!(kind, InstrKind::TryCatch))
            .expect("a TryCatch must be built");
        let children = function.children(try_catch);
        assert_eq!(children.len(), 3);
        for &handler in &children[1..] {
            assert!(matches!(
                function.kind(handler),
                InstrKind::CatchHandler { .. }
            ));
            // Plain catches carry the constant-true filter.
            assert!(function.match_ldc_i4_const(function.child(handler, 0), 1));
        }

        // Each handler binds its own exception slot, defined exactly once.
        let slots: Vec<_> = function
            .variables()
            .filter(|(_, variable)| variable.kind() == VariableKind::ExceptionSlot)
            .collect();
        assert_eq!(slots.len(), 2);
        for (_, variable) in slots {
            assert_eq!(variable.store_count(), 1);
        }

        // Both handlers leave to the same continuation; the wrapper block
        // dispatches there directly, with no selector variable left behind.
        let wrapper = function.parent(try_catch).unwrap();
        assert_eq!(function.children(wrapper).len(), 2);
        assert!(function
            .match_branch(function.child(wrapper, 1))
            .is_some());
        assert!(function
            .variables()
            .all(|(_, variable)| variable.kind() != VariableKind::Local
                || variable.is_dead()));
    }

    #[test]
    fn test_filter_clause_builds_filter_container() {
        let mut asm = TestAsm::default();
        asm.mark("TRY").ldnull().throw();
        asm.mark("FILTER").pop().ldc_i4(1).endfilter();
        asm.mark("HANDLER").pop().leave("AFTER");
        asm.mark("AFTER").ret();

        let try_offset = asm.label_offset("TRY");
        let filter_offset = asm.label_offset("FILTER");
        let handler_offset = asm.label_offset("HANDLER");
        let after = asm.label_offset("AFTER");
        let regions = vec![ExceptionRegion {
            kind: ExceptionRegionKind::Filter { filter_offset },
            try_offset,
            try_length: filter_offset - try_offset,
            handler_offset,
            handler_length: after - handler_offset,
        }];
        let function = build(vec![], &body(asm.finish(), vec![], regions));

        let try_catch = find_kind(&function, |kind| matches!(kind, InstrKind::TryCatch))
            .expect("a TryCatch must be built");
        assert_eq!(function.children(try_catch).len(), 2);
        let handler = function.child(try_catch, 1);
        assert!(matches!(
            function.kind(handler),
            InstrKind::CatchHandler { .. }
        ));

        // The filter slot holds a container whose endfilter became a
        // value-carrying leave of that container.
        let filter = function.child(handler, 0);
        assert!(matches!(
            function.kind(filter),
            InstrKind::BlockContainer(_)
        ));
        let filter_block = function.children(filter)[0];
        let last = *function.children(filter_block).last().unwrap();
        let result = function
            .match_leave(last, filter)
            .expect("endfilter leaves the filter container");
        assert!(result.is_some(), "the filter leave carries its verdict");

        // Filter and handler share one exception slot.
        let slots: Vec<_> = function
            .variables()
            .filter(|(_, variable)| variable.kind() == VariableKind::ExceptionSlot)
            .collect();
        assert_eq!(slots.len(), 1);
    }

    #[test]
    fn test_fault_handler_builds_try_fault() {
        let mut asm = TestAsm::default();
        asm.mark("TRY").ldnull().throw();
        asm.mark("FAULT").endfinally();
        asm.mark("END");

        let try_offset = asm.label_offset("TRY");
        let fault = asm.label_offset("FAULT");
        let end = asm.label_offset("END");
        let regions = vec![ExceptionRegion {
            kind: ExceptionRegionKind::Fault,
            try_offset,
            try_length: fault - try_offset,
            handler_offset: fault,
            handler_length: end - fault,
        }];
        let function = build(vec![], &body(asm.finish(), vec![], regions));

        let try_fault = find_kind(&function, |kind| matches!(kind, InstrKind::TryFault))
            .expect("a TryFault must be built");
        assert_eq!(function.children(try_fault).len(), 2);

        // The handler's endfinally became a leave of the fault container.
        let fault_container = function.child(try_fault, 1);
        let fault_block = function.children(fault_container)[0];
        let last = *function.children(fault_block).last().unwrap();
        assert!(function.match_leave(last, fault_container).is_some());

        // The protected region never exits normally, so the wrapper holds
        // only the try instruction.
        let wrapper = function.parent(try_fault).unwrap();
        assert_eq!(function.children(wrapper).len(), 1);
    }

    #[test]
    fn test_multi_exit_region_dispatches_through_selector() {
        let mut asm = TestAsm::default();
        asm.mark("TRY").ldarg0().brfalse("INNER");
        asm.leave("EXIT1");
        asm.mark("INNER").leave("EXIT2");
        asm.mark("FIN").endfinally();
        asm.mark("EXIT1").ret();
        asm.mark("EXIT2").ret();

        let try_offset = asm.label_offset("TRY");
        let fin = asm.label_offset("FIN");
        let exit1 = asm.label_offset("EXIT1");
        let regions = vec![ExceptionRegion {
            kind: ExceptionRegionKind::Finally,
            try_offset,
            try_length: fin - try_offset,
            handler_offset: fin,
            handler_length: exit1 - fin,
        }];
        let function = build(
            vec![TsType::primitive(PrimitiveKind::Int32)],
            &body(asm.finish(), vec![], regions),
        );

        let try_finally = find_kind(&function, |kind| matches!(kind, InstrKind::TryFinally))
            .expect("a TryFinally must be built");

        // Two distinct leave targets force the selector dispatch: the
        // wrapper holds the try, one selector test, and the fallback branch.
        let wrapper = function.parent(try_finally).unwrap();
        let continuation = function.children(wrapper);
        assert_eq!(continuation.len(), 3);
        assert!(matches!(
            function.kind(continuation[1]),
            InstrKind::IfInstruction
        ));
        assert!(function.match_branch(continuation[2]).is_some());

        // The selector is a synthesized local stored once per exit path and
        // read by the dispatch test.
        let selector = function
            .variables()
            .find(|(_, variable)| variable.kind() == VariableKind::Local)
            .map(|(id, _)| id)
            .expect("the selector local exists");
        assert_eq!(function.variable(selector).store_count(), 2);
        assert_eq!(function.variable(selector).load_count(), 1);

        // Both leaves target the try container.
        let try_container = function.child(try_finally, 0);
        let leaves = function
            .descendants(try_container)
            .into_iter()
            .filter(|&id| function.match_leave(id, try_container).is_some())
            .count();
        assert_eq!(leaves, 2);
    }
}
