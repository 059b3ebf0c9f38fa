//! Generic contexts and type-parameter substitution.
//!
//! A [`GenericContext`] says how many class and method type parameters are in
//! scope while a signature is decoded; a [`TypeParameterSubstitution`] maps
//! position-keyed parameter references to concrete arguments when a member of
//! an instantiated type (or a generic method instantiation) is viewed from a
//! call site. Contexts are passed explicitly by value; nothing is threaded
//! through ambient state.

use std::sync::Arc;

use crate::typesystem::{
    entities::MethodSignature,
    types::{TsType, TsTypeRef, TypeParameterOwner},
};

/// The number of class and method type parameters in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericContext {
    /// Type parameters declared by the enclosing class.
    pub class_param_count: u16,
    /// Type parameters declared by the method.
    pub method_param_count: u16,
}

impl GenericContext {
    /// No type parameters in scope.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            class_param_count: 0,
            method_param_count: 0,
        }
    }

    /// A context with the given counts.
    #[must_use]
    pub fn new(class_param_count: u16, method_param_count: u16) -> Self {
        Self {
            class_param_count,
            method_param_count,
        }
    }

    /// A context that accepts any parameter index. Used when parsing
    /// free-standing reflection names, where no declaration is in scope.
    #[must_use]
    pub fn unconstrained() -> Self {
        Self {
            class_param_count: u16::MAX,
            method_param_count: u16::MAX,
        }
    }

    /// Is a class-level parameter index valid here?
    #[must_use]
    pub fn allows_class_param(&self, index: u16) -> bool {
        index < self.class_param_count
    }

    /// Is a method-level parameter index valid here?
    #[must_use]
    pub fn allows_method_param(&self, index: u16) -> bool {
        index < self.method_param_count
    }
}

/// Maps position-keyed type-parameter references to arguments.
///
/// The identity substitution leaves every reference in place; missing
/// arguments (an index beyond the list) also stay in place, which keeps
/// partially instantiated views usable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeParameterSubstitution {
    class_arguments: Vec<TsTypeRef>,
    method_arguments: Vec<TsTypeRef>,
}

impl TypeParameterSubstitution {
    /// The identity substitution.
    #[must_use]
    pub fn identity() -> Self {
        Self::default()
    }

    /// A substitution with the given class and method arguments.
    #[must_use]
    pub fn new(class_arguments: Vec<TsTypeRef>, method_arguments: Vec<TsTypeRef>) -> Self {
        Self {
            class_arguments,
            method_arguments,
        }
    }

    /// Class arguments of this substitution.
    #[must_use]
    pub fn class_arguments(&self) -> &[TsTypeRef] {
        &self.class_arguments
    }

    /// Method arguments of this substitution.
    #[must_use]
    pub fn method_arguments(&self) -> &[TsTypeRef] {
        &self.method_arguments
    }

    /// `true` when applying this substitution changes nothing.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.class_arguments.is_empty() && self.method_arguments.is_empty()
    }

    /// Composes class arguments from `self` with method arguments from
    /// `method_args`, mapping the method arguments through `self` first.
    ///
    /// This is the composition used when a generic method instantiation is
    /// applied to a member of an instantiated type: the method arguments may
    /// themselves mention the class parameters.
    #[must_use]
    pub fn with_method_arguments(&self, method_args: Vec<TsTypeRef>) -> Self {
        let mapped = method_args
            .into_iter()
            .map(|arg| self.apply(&arg))
            .collect();
        Self {
            class_arguments: self.class_arguments.clone(),
            method_arguments: mapped,
        }
    }

    /// Applies the substitution to a type, rebuilding structurally.
    #[must_use]
    pub fn apply(&self, ty: &TsTypeRef) -> TsTypeRef {
        if self.is_identity() {
            return ty.clone();
        }
        match &**ty {
            TsType::TypeParameter { owner, index } => {
                let arguments = match owner {
                    TypeParameterOwner::Class => &self.class_arguments,
                    TypeParameterOwner::Method => &self.method_arguments,
                };
                arguments
                    .get(usize::from(*index))
                    .cloned()
                    .unwrap_or_else(|| ty.clone())
            }
            TsType::Pointer(element) => Arc::new(TsType::Pointer(self.apply(element))),
            TsType::ByReference(element) => Arc::new(TsType::ByReference(self.apply(element))),
            TsType::Array { element, rank } => Arc::new(TsType::Array {
                element: self.apply(element),
                rank: *rank,
            }),
            TsType::Parameterized {
                definition,
                arguments,
            } => Arc::new(TsType::Parameterized {
                definition: definition.clone(),
                arguments: arguments.iter().map(|arg| self.apply(arg)).collect(),
            }),
            _ => ty.clone(),
        }
    }

    /// Applies the substitution to every type in a signature.
    #[must_use]
    pub fn apply_signature(&self, signature: &MethodSignature) -> MethodSignature {
        if self.is_identity() {
            return signature.clone();
        }
        MethodSignature {
            has_this: signature.has_this,
            generic_param_count: signature.generic_param_count,
            is_vararg: signature.is_vararg,
            return_type: self.apply(&signature.return_type),
            parameters: signature.parameters.iter().map(|p| self.apply(p)).collect(),
            sentinel_params: signature
                .sentinel_params
                .iter()
                .map(|p| self.apply(p))
                .collect(),
        }
    }
}
