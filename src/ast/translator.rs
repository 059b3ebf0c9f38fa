//! IL-tree-to-AST translation.
//!
//! Converts a fully transformed [`ILFunction`] into the outbound statement
//! tree. Structured constructs map one-to-one (if, loops, switch, try
//! forms, lock, using); residual unstructured control flow falls back to
//! labels and gotos so the output is always complete.
//!
//! Two call-site details are handled here rather than in the transforms:
//! ref-returning calls stay assignment targets (no temporary is invented),
//! and the defensive copy compilers emit for `in` arguments of
//! non-readonly structs is preserved, while for readonly structs the
//! argument collapses back to the original variable.

use rustc_hash::FxHashMap;

use crate::{
    ast::{
        CaseLabel, CatchClause, Expression, ExpressionKind, Literal, Statement, SwitchCase,
        Symbol,
    },
    il::{ILFunction, InstrId, InstrKind, VarId, VariableKind},
    typesystem::{MethodRefRc, TsType},
    Result,
};

/// Translates a transformed function body into statements.
///
/// # Errors
///
/// Returns `InvariantViolation` when the tree is malformed (a slot missing
/// where a kind requires one).
pub fn translate_function(function: &ILFunction) -> Result<Vec<Statement>> {
    let mut translator = Translator {
        function,
        loop_stack: Vec::new(),
        elided_copies: FxHashMap::default(),
    };
    translator.container_statements(function.root())
}

struct Translator<'a> {
    function: &'a ILFunction,
    /// Enclosing loop containers, innermost last.
    loop_stack: Vec<InstrId>,
    /// `in`-argument defensive copies elided for readonly structs:
    /// temp variable -> original variable.
    elided_copies: FxHashMap<VarId, VarId>,
}

impl Translator<'_> {
    fn label_of(&self, block: InstrId) -> String {
        format!("IL_{:04}", block.0)
    }

    fn var_name(&self, var: VarId) -> String {
        self.function.variable(var).name().to_string()
    }

    fn container_statements(&mut self, container: InstrId) -> Result<Vec<Statement>> {
        let blocks: Vec<InstrId> = self.function.children(container).to_vec();
        let mut statements = Vec::new();
        let multi = blocks.len() > 1;
        for block in blocks {
            if multi {
                statements.push(Statement::Label(self.label_of(block)));
            }
            statements.extend(self.block_statements(block)?);
        }
        Ok(statements)
    }

    fn block_statements(&mut self, block: InstrId) -> Result<Vec<Statement>> {
        let children: Vec<InstrId> = self.function.children(block).to_vec();
        let mut statements = Vec::new();
        let mut index = 0;
        while index < children.len() {
            let instr = children[index];
            // `stloc tmp(ldloc v)` feeding an `in` argument of a readonly
            // struct is the compiler's defensive copy; elide it.
            if let Some(next) = children.get(index + 1) {
                if let Some((tmp, source)) = self.readonly_in_copy(instr, *next) {
                    self.elided_copies.insert(tmp, source);
                    index += 1;
                    continue;
                }
            }
            self.push_statement(instr, &mut statements)?;
            index += 1;
        }
        Ok(statements)
    }

    /// Detects `stloc tmp(ldloc v)` where `tmp`'s only other use is
    /// `ldloca tmp` as an `in` argument of a readonly struct in `next`.
    fn readonly_in_copy(&self, instr: InstrId, next: InstrId) -> Option<(VarId, VarId)> {
        let (tmp, value) = self.function.match_stloc(instr)?;
        let source = self.function.match_ldloc(value)?;
        let variable = self.function.variable(tmp);
        if variable.kind() != VariableKind::StackSlot
            || !variable.is_single_definition()
            || variable.load_count() != 0
            || variable.address_count() != 1
        {
            return None;
        }

        // The single address use must be an in-parameter of a readonly
        // struct within the immediately following call.
        for descendant in self.function.descendants_and_self(next) {
            if self.function.match_ldloca(descendant) != Some(tmp) {
                continue;
            }
            let call = self.function.parent(descendant)?;
            let method = match self.function.kind(call) {
                InstrKind::Call(method) | InstrKind::CallVirt(method) => method,
                _ => return None,
            };
            let position = self.function.child_index(descendant);
            let param_index = position.checked_sub(usize::from(method.has_this()))?;
            let param_type = method.signature.parameters.get(param_index)?;
            let TsType::ByReference(element) = &**param_type else {
                return None;
            };
            let TsType::Definition(def) = &**element else {
                return None;
            };
            if def.is_value_type() && def.is_readonly() {
                return Some((tmp, source));
            }
            return None;
        }
        None
    }

    #[allow(clippy::too_many_lines)]
    fn push_statement(&mut self, instr: InstrId, out: &mut Vec<Statement>) -> Result<()> {
        use InstrKind as K;
        match self.function.kind(instr) {
            K::Nop => {}

            K::StLoc(var) => {
                let var = *var;
                let value = self.expression(self.function.child(instr, 0))?;
                let target = Expression::with_symbol(
                    ExpressionKind::Identifier(self.var_name(var)),
                    Symbol::Variable(self.var_name(var)),
                );
                out.push(Statement::Expression(Expression::new(
                    ExpressionKind::Assignment {
                        target: Box::new(target),
                        value: Box::new(value),
                    },
                )));
            }

            K::StFld(field) => {
                let field = field.clone();
                let target = self.expression(self.function.child(instr, 0))?;
                let value = self.expression(self.function.child(instr, 1))?;
                let access = Expression::with_symbol(
                    ExpressionKind::FieldAccess {
                        target: Some(Box::new(target)),
                    },
                    Symbol::Field(field),
                );
                out.push(Statement::Expression(Expression::new(
                    ExpressionKind::Assignment {
                        target: Box::new(access),
                        value: Box::new(value),
                    },
                )));
            }

            K::StsFld(field) => {
                let field = field.clone();
                let value = self.expression(self.function.child(instr, 0))?;
                let access = Expression::with_symbol(
                    ExpressionKind::FieldAccess { target: None },
                    Symbol::Field(field),
                );
                out.push(Statement::Expression(Expression::new(
                    ExpressionKind::Assignment {
                        target: Box::new(access),
                        value: Box::new(value),
                    },
                )));
            }

            K::StObj(_) => {
                let target = self.store_target(self.function.child(instr, 0))?;
                let value = self.expression(self.function.child(instr, 1))?;
                out.push(Statement::Expression(Expression::new(
                    ExpressionKind::Assignment {
                        target: Box::new(target),
                        value: Box::new(value),
                    },
                )));
            }

            K::Call(_) | K::CallVirt(_) | K::NewObj(_) => {
                let expr = self.expression(instr)?;
                out.push(Statement::Expression(expr));
            }

            K::Pop => {
                let expr = self.expression(self.function.child(instr, 0))?;
                out.push(Statement::Expression(expr));
            }

            K::IfInstruction => {
                let condition = self.expression(self.function.child(instr, 0))?;
                let then_branch = self.arm_statements(self.function.child(instr, 1))?;
                let else_arm = self.function.child(instr, 2);
                let else_branch = if self.function.match_nop(else_arm) {
                    None
                } else {
                    Some(self.arm_statements(else_arm)?)
                };
                out.push(Statement::If {
                    condition,
                    then_branch,
                    else_branch,
                });
            }

            K::SwitchInstruction => {
                out.push(self.switch_statement(instr)?);
            }

            K::Branch(target) => {
                let target = *target;
                // A backward branch to the enclosing loop header is a
                // continue.
                if let Some(&loop_container) = self.loop_stack.last() {
                    if self.function.children(loop_container).first() == Some(&target) {
                        out.push(Statement::Continue);
                        return Ok(());
                    }
                }
                out.push(Statement::Goto(self.label_of(target)));
            }

            K::Leave(target) => {
                let target = *target;
                if target == self.function.root() {
                    let value = self
                        .function
                        .children(instr)
                        .first()
                        .map(|&child| self.expression(child))
                        .transpose()?;
                    out.push(Statement::Return(value));
                } else if self.loop_stack.last() == Some(&target) {
                    out.push(Statement::Break);
                }
                // Leaving any other container is the normal structured
                // fall-out of its statement; nothing to emit.
            }

            K::Return => {
                let value = self
                    .function
                    .children(instr)
                    .first()
                    .map(|&child| self.expression(child))
                    .transpose()?;
                out.push(Statement::Return(value));
            }

            K::Throw => {
                let value = self.expression(self.function.child(instr, 0))?;
                out.push(Statement::Throw(Some(value)));
            }
            K::Rethrow => out.push(Statement::Throw(None)),

            K::TryCatch => {
                let body = self.container_statements(self.function.child(instr, 0))?;
                let mut catches = Vec::new();
                for &handler in &self.function.children(instr)[1..].to_vec() {
                    catches.push(self.catch_clause(handler)?);
                }
                out.push(Statement::TryCatch { body, catches });
            }

            K::TryFinally => {
                let body = self.container_statements(self.function.child(instr, 0))?;
                let finally = self.container_statements(self.function.child(instr, 1))?;
                out.push(Statement::TryFinally { body, finally });
            }

            K::TryFault => {
                // A fault handler is a catch-everything that reruns the
                // handler body and rethrows.
                let body = self.container_statements(self.function.child(instr, 0))?;
                let mut fault = self.container_statements(self.function.child(instr, 1))?;
                fault.push(Statement::Throw(None));
                out.push(Statement::TryCatch {
                    body,
                    catches: vec![CatchClause {
                        exception_type: TsType::primitive(
                            crate::typesystem::PrimitiveKind::Object,
                        ),
                        variable: String::new(),
                        filter: None,
                        body: fault,
                    }],
                });
            }

            K::LockInstruction => {
                let target = self.expression(self.function.child(instr, 0))?;
                let body = self.body_statements(self.function.child(instr, 1))?;
                out.push(Statement::Lock { target, body });
            }

            K::UsingInstruction(var) => {
                let variable = self.var_name(*var);
                let resource = self.expression(self.function.child(instr, 0))?;
                let body = self.body_statements(self.function.child(instr, 1))?;
                out.push(Statement::Using {
                    variable,
                    resource,
                    body,
                });
            }

            K::BlockContainer(crate::il::ContainerKind::Loop) => {
                self.loop_stack.push(instr);
                let body = self.container_statements(instr)?;
                self.loop_stack.pop();
                out.push(Statement::Loop { body });
            }

            K::BlockContainer(_) => {
                out.push(Statement::Block(self.container_statements(instr)?));
            }

            K::Block { .. } => {
                out.push(Statement::Block(self.block_statements_nested(instr)?));
            }

            _ => {
                let expr = self.expression(instr)?;
                out.push(Statement::Expression(expr));
            }
        }
        Ok(())
    }

    /// Statements of an if/switch arm: a folded block inlines, a single
    /// instruction becomes a one-element list.
    fn arm_statements(&mut self, arm: InstrId) -> Result<Vec<Statement>> {
        match self.function.kind(arm) {
            InstrKind::Block { .. } => self.block_statements_nested(arm),
            _ => {
                let mut statements = Vec::new();
                self.push_statement(arm, &mut statements)?;
                Ok(statements)
            }
        }
    }

    fn block_statements_nested(&mut self, block: InstrId) -> Result<Vec<Statement>> {
        self.block_statements(block)
    }

    /// Body of a lock/using: either a container or a plain block.
    fn body_statements(&mut self, body: InstrId) -> Result<Vec<Statement>> {
        match self.function.kind(body) {
            InstrKind::BlockContainer(_) => self.container_statements(body),
            InstrKind::Block { .. } => self.block_statements_nested(body),
            _ => {
                let mut statements = Vec::new();
                self.push_statement(body, &mut statements)?;
                Ok(statements)
            }
        }
    }

    fn catch_clause(&mut self, handler: InstrId) -> Result<CatchClause> {
        let InstrKind::CatchHandler {
            variable,
            exception_type,
        } = self.function.kind(handler)
        else {
            return Err(invariant_error!("try/catch child is not a catch handler"));
        };
        let (variable, exception_type) = (*variable, exception_type.clone());

        let filter_child = self.function.child(handler, 0);
        let filter = if self.function.match_ldc_i4_const(filter_child, 1) {
            None
        } else {
            self.filter_expression(filter_child)?
        };
        let body = self.container_statements(self.function.child(handler, 1))?;
        Ok(CatchClause {
            exception_type,
            variable: self.var_name(variable),
            filter,
            body,
        })
    }

    /// A filter container that collapsed to a single `leave(value)` renders
    /// as its expression; anything more complex is not expressible as a
    /// single filter expression and is dropped.
    fn filter_expression(&mut self, filter: InstrId) -> Result<Option<Expression>> {
        if let InstrKind::BlockContainer(_) = self.function.kind(filter) {
            let blocks = self.function.children(filter);
            if let [block] = blocks {
                let instrs = self.function.children(*block);
                if let [only] = instrs {
                    if let Some(Some(value)) = self.function.match_leave(*only, filter) {
                        return Ok(Some(self.expression(value)?));
                    }
                }
            }
            return Ok(None);
        }
        Ok(Some(self.expression(filter)?))
    }

    fn switch_statement(&mut self, instr: InstrId) -> Result<Statement> {
        let value_child = self.function.child(instr, 0);

        // A recovered string switch dispatches on StringToInt; surface the
        // string value and string labels directly.
        let (value, string_labels) = match self.function.kind(value_child) {
            InstrKind::StringToInt(literals) => {
                let literals = literals.clone();
                let inner = self.expression(self.function.child(value_child, 0))?;
                (inner, Some(literals))
            }
            _ => (self.expression(value_child)?, None),
        };

        let mut cases = Vec::new();
        for &section in &self.function.children(instr)[1..].to_vec() {
            let InstrKind::SwitchSection(labels) = self.function.kind(section) else {
                return Err(invariant_error!("switch child is not a section"));
            };
            let labels = labels.clone();
            let case_labels = match labels.values() {
                Some(values) => values
                    .into_iter()
                    .filter_map(|ordinal| match &string_labels {
                        Some(literals) => literals
                            .get(usize::try_from(ordinal).ok()?)
                            .map(|literal| CaseLabel::String(literal.clone())),
                        None => Some(CaseLabel::Int(ordinal)),
                    })
                    .collect(),
                None => vec![CaseLabel::Default],
            };
            let body = self.arm_statements(self.function.child(section, 0))?;
            cases.push(SwitchCase {
                labels: case_labels,
                body,
            });
        }
        Ok(Statement::Switch { value, cases })
    }

    /// The assignment target for an indirect store: a ref-returning call
    /// stays a call, everything else dereferences the address.
    fn store_target(&mut self, target: InstrId) -> Result<Expression> {
        match self.function.kind(target) {
            InstrKind::Call(method) | InstrKind::CallVirt(method)
                if matches!(&*method.signature.return_type, TsType::ByReference(_)) =>
            {
                self.expression(target)
            }
            InstrKind::LdLoca(var) => {
                let var = *var;
                Ok(self.identifier(var))
            }
            InstrKind::LdFlda(field) => {
                let field = field.clone();
                let inner = self.expression(self.function.child(target, 0))?;
                Ok(Expression::with_symbol(
                    ExpressionKind::FieldAccess {
                        target: Some(Box::new(inner)),
                    },
                    Symbol::Field(field),
                ))
            }
            InstrKind::LdsFlda(field) => {
                let field = field.clone();
                Ok(Expression::with_symbol(
                    ExpressionKind::FieldAccess { target: None },
                    Symbol::Field(field),
                ))
            }
            _ => {
                let inner = self.expression(target)?;
                Ok(Expression::new(ExpressionKind::Dereference(Box::new(
                    inner,
                ))))
            }
        }
    }

    fn identifier(&self, var: VarId) -> Expression {
        Expression::with_symbol(
            ExpressionKind::Identifier(self.var_name(var)),
            Symbol::Variable(self.var_name(var)),
        )
    }

    fn invocation(&mut self, instr: InstrId, method: &MethodRefRc) -> Result<Expression> {
        let children = self.function.children(instr).to_vec();
        let mut arguments = Vec::with_capacity(children.len());
        for child in &children {
            arguments.push(self.expression(*child)?);
        }
        let target = if method.has_this() && !arguments.is_empty() {
            Some(Box::new(arguments.remove(0)))
        } else {
            None
        };
        Ok(Expression::with_symbol(
            ExpressionKind::Invocation { target, arguments },
            Symbol::Method(method.clone()),
        ))
    }

    #[allow(clippy::too_many_lines)]
    fn expression(&mut self, instr: InstrId) -> Result<Expression> {
        use InstrKind as K;
        Ok(match self.function.kind(instr) {
            K::LdcI4(value) => Expression::new(ExpressionKind::Literal(Literal::Int32(*value))),
            K::LdcI8(value) => Expression::new(ExpressionKind::Literal(Literal::Int64(*value))),
            K::LdcR8(value) => {
                Expression::new(ExpressionKind::Literal(Literal::Float64(*value)))
            }
            K::LdStr(value) => {
                Expression::new(ExpressionKind::Literal(Literal::String(value.clone())))
            }
            K::LdNull => Expression::new(ExpressionKind::Null),
            K::DefaultValue(ty) => Expression::new(ExpressionKind::Default(ty.clone())),

            K::LdLoc(var) => self.identifier(*var),
            K::LdLoca(var) => {
                let var = *var;
                // An elided readonly-in copy renders as the original
                // variable, with no address-of and no copy.
                if let Some(&source) = self.elided_copies.get(&var) {
                    self.identifier(source)
                } else {
                    Expression::new(ExpressionKind::AddressOf(Box::new(self.identifier(var))))
                }
            }

            K::BinaryOp(op) => {
                let op = *op;
                let left = self.expression(self.function.child(instr, 0))?;
                let right = self.expression(self.function.child(instr, 1))?;
                Expression::new(ExpressionKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                })
            }
            K::UnaryOp(op) => {
                let op = *op;
                let operand = self.expression(self.function.child(instr, 0))?;
                Expression::new(ExpressionKind::Unary {
                    op,
                    operand: Box::new(operand),
                })
            }
            K::Comp(op) => {
                let op = *op;
                let left = self.expression(self.function.child(instr, 0))?;
                let right = self.expression(self.function.child(instr, 1))?;
                Expression::new(ExpressionKind::Comparison {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                })
            }
            K::LogicNot => {
                let operand = self.expression(self.function.child(instr, 0))?;
                Expression::new(ExpressionKind::Not(Box::new(operand)))
            }
            K::Conv(kind) => {
                let ty = TsType::primitive(*kind);
                let operand = self.expression(self.function.child(instr, 0))?;
                Expression::new(ExpressionKind::Conversion {
                    ty,
                    operand: Box::new(operand),
                })
            }

            K::Call(method) | K::CallVirt(method) => {
                let method = method.clone();
                self.invocation(instr, &method)?
            }
            K::NewObj(ctor) => {
                let ctor = ctor.clone();
                let children = self.function.children(instr).to_vec();
                let mut arguments = Vec::with_capacity(children.len());
                for child in &children {
                    arguments.push(self.expression(*child)?);
                }
                Expression::with_symbol(
                    ExpressionKind::ObjectCreation { arguments },
                    Symbol::Method(ctor),
                )
            }

            K::LdFld(field) => {
                let field = field.clone();
                let target = self.expression(self.function.child(instr, 0))?;
                Expression::with_symbol(
                    ExpressionKind::FieldAccess {
                        target: Some(Box::new(target)),
                    },
                    Symbol::Field(field),
                )
            }
            K::LdFlda(field) => {
                let field = field.clone();
                let target = self.expression(self.function.child(instr, 0))?;
                Expression::new(ExpressionKind::AddressOf(Box::new(
                    Expression::with_symbol(
                        ExpressionKind::FieldAccess {
                            target: Some(Box::new(target)),
                        },
                        Symbol::Field(field),
                    ),
                )))
            }
            K::LdsFld(field) => Expression::with_symbol(
                ExpressionKind::FieldAccess { target: None },
                Symbol::Field(field.clone()),
            ),
            K::LdsFlda(field) => {
                let field = field.clone();
                Expression::new(ExpressionKind::AddressOf(Box::new(
                    Expression::with_symbol(
                        ExpressionKind::FieldAccess { target: None },
                        Symbol::Field(field),
                    ),
                )))
            }

            K::LdObj(_) => {
                let target = self.function.child(instr, 0);
                self.store_target(target)?
            }

            K::Box(ty) | K::UnboxAny(ty) | K::CastClass(ty) => {
                let ty = ty.clone();
                let operand = self.expression(self.function.child(instr, 0))?;
                Expression::new(ExpressionKind::Conversion {
                    ty,
                    operand: Box::new(operand),
                })
            }
            K::IsInst(ty) => {
                let ty = ty.clone();
                let operand = self.expression(self.function.child(instr, 0))?;
                Expression::new(ExpressionKind::TypeTest {
                    ty,
                    operand: Box::new(operand),
                })
            }

            K::NullCoalescing => {
                let value = self.expression(self.function.child(instr, 0))?;
                let fallback = self.expression(self.function.child(instr, 1))?;
                Expression::new(ExpressionKind::NullCoalescing {
                    value: Box::new(value),
                    fallback: Box::new(fallback),
                })
            }
            K::NullConditional => {
                let target = self.expression(self.function.child(instr, 0))?;
                let access = self.expression(self.function.child(instr, 1))?;
                Expression::new(ExpressionKind::ConditionalAccess {
                    target: Box::new(target),
                    access: Box::new(access),
                })
            }

            K::StringToInt(_) => self.expression(self.function.child(instr, 0))?,

            other => {
                return Err(invariant_error!(
                    "instruction kind {:?} has no expression form",
                    std::mem::discriminant(other)
                ))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::InstrKind as K;
    use crate::typesystem::{
        MethodRef, MethodSignature, MethodTarget, PrimitiveKind, TypeParameterSubstitution,
        UnknownType,
    };
    use std::sync::Arc;

    fn ref_returning_method() -> MethodRefRc {
        Arc::new(MethodRef {
            target: MethodTarget::Fake,
            declaring_type: Arc::new(TsType::Unknown(UnknownType {
                namespace: "My".into(),
                name: "Store".into(),
                arity: 0,
            })),
            name: "GetRef".into(),
            signature: MethodSignature::simple(
                Arc::new(TsType::ByReference(TsType::primitive(PrimitiveKind::Int32))),
                vec![],
            ),
            substitution: TypeParameterSubstitution::identity(),
            vararg_instance: false,
        })
    }

    #[test]
    fn test_ref_returning_call_is_assignment_target() {
        // stobj int32(call GetRef(), ldc 42)
        let mut function = ILFunction::new(None);
        let root = function.root();
        let block = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        function.push_child(root, block).unwrap();

        let call = function
            .create(K::Call(ref_returning_method()), vec![])
            .unwrap();
        let value = function.create(K::LdcI4(42), vec![]).unwrap();
        let store = function
            .create(
                K::StObj(TsType::primitive(PrimitiveKind::Int32)),
                vec![call, value],
            )
            .unwrap();
        function.push_child(block, store).unwrap();
        let leave = function.create(K::Leave(root), vec![]).unwrap();
        function.push_child(block, leave).unwrap();

        let statements = translate_function(&function).unwrap();
        // [assignment, return]
        let Statement::Expression(assignment) = &statements[0] else {
            panic!("expected an expression statement");
        };
        let ExpressionKind::Assignment { target, value } = &assignment.kind else {
            panic!("expected an assignment");
        };
        assert!(
            matches!(target.kind, ExpressionKind::Invocation { .. }),
            "the ref-returning call must remain the assignment target"
        );
        assert!(matches!(
            value.kind,
            ExpressionKind::Literal(Literal::Int32(42))
        ));
    }

    fn struct_def(readonly: bool) -> Arc<crate::typesystem::TypeDef> {
        Arc::new(crate::typesystem::TypeDef::new(
            crate::metadata::TypeDefHandle(if readonly { 1 } else { 2 }),
            "My".into(),
            "Vec2".into(),
            0,
            true,
            readonly,
            None,
        ))
    }

    fn in_param_method(def: &Arc<crate::typesystem::TypeDef>) -> MethodRefRc {
        let byref = Arc::new(TsType::ByReference(Arc::new(TsType::Definition(
            def.clone(),
        ))));
        Arc::new(MethodRef {
            target: MethodTarget::Fake,
            declaring_type: Arc::new(TsType::Unknown(UnknownType {
                namespace: "My".into(),
                name: "Math".into(),
                arity: 0,
            })),
            name: "Length".into(),
            signature: MethodSignature::simple(
                TsType::primitive(PrimitiveKind::Double),
                vec![byref],
            ),
            substitution: TypeParameterSubstitution::identity(),
            vararg_instance: false,
        })
    }

    /// Builds `stloc tmp(ldloc v); pop(call Length(ldloca tmp)); leave`.
    fn build_in_call(readonly: bool) -> (ILFunction, Vec<Statement>) {
        let def = struct_def(readonly);
        let mut function = ILFunction::new(None);
        let root = function.root();
        let v = function.add_variable(
            VariableKind::Local,
            0,
            Some(Arc::new(TsType::Definition(def.clone()))),
        );
        let tmp = function.add_variable(VariableKind::StackSlot, 0, None);

        let block = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        function.push_child(root, block).unwrap();

        let load_v = function.create(K::LdLoc(v), vec![]).unwrap();
        let copy = function.create(K::StLoc(tmp), vec![load_v]).unwrap();
        function.push_child(block, copy).unwrap();

        let addr = function.create(K::LdLoca(tmp), vec![]).unwrap();
        let call = function
            .create(K::Call(in_param_method(&def)), vec![addr])
            .unwrap();
        let pop = function.create(K::Pop, vec![call]).unwrap();
        function.push_child(block, pop).unwrap();
        let leave = function.create(K::Leave(root), vec![]).unwrap();
        function.push_child(block, leave).unwrap();

        let statements = translate_function(&function).unwrap();
        (function, statements)
    }

    #[test]
    fn test_readonly_in_argument_elides_copy() {
        let (_function, statements) = build_in_call(true);
        // The defensive copy disappears: [call-expression, return].
        assert_eq!(statements.len(), 2);
        let Statement::Expression(call) = &statements[0] else {
            panic!("expected the call statement first");
        };
        let ExpressionKind::Invocation { arguments, .. } = &call.kind else {
            panic!("expected an invocation");
        };
        // The argument is the original variable, no address-of wrapper.
        assert!(matches!(
            &arguments[0].kind,
            ExpressionKind::Identifier(name) if name == "V_0"
        ));
    }

    #[test]
    fn test_non_readonly_in_argument_keeps_copy() {
        let (_function, statements) = build_in_call(false);
        // The copy assignment stays visible: [copy, call, return].
        assert_eq!(statements.len(), 3);
        assert!(matches!(
            &statements[0],
            Statement::Expression(expr)
                if matches!(expr.kind, ExpressionKind::Assignment { .. })
        ));
        let Statement::Expression(call) = &statements[1] else {
            panic!("expected the call statement second");
        };
        let ExpressionKind::Invocation { arguments, .. } = &call.kind else {
            panic!("expected an invocation");
        };
        assert!(matches!(
            &arguments[0].kind,
            ExpressionKind::AddressOf(_)
        ));
    }

    #[test]
    fn test_lock_translates() {
        let mut function = ILFunction::new(None);
        let root = function.root();
        let x = function.add_variable(VariableKind::Parameter, 0, None);
        let block = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        function.push_child(root, block).unwrap();

        let target = function.create(K::LdLoc(x), vec![]).unwrap();
        let body_container = function
            .create(K::BlockContainer(crate::il::ContainerKind::Normal), vec![])
            .unwrap();
        let body_block = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        function.push_child(body_container, body_block).unwrap();
        let inner_leave = function.create(K::Leave(body_container), vec![]).unwrap();
        function.push_child(body_block, inner_leave).unwrap();

        let lock_instr = function
            .create(K::LockInstruction, vec![target, body_container])
            .unwrap();
        function.push_child(block, lock_instr).unwrap();
        let leave = function.create(K::Leave(root), vec![]).unwrap();
        function.push_child(block, leave).unwrap();

        let statements = translate_function(&function).unwrap();
        assert!(matches!(statements[0], Statement::Lock { .. }));
        assert!(matches!(statements[1], Statement::Return(None)));
    }
}
