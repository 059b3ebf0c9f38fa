//! Resolved type-system view.
//!
//! An immutable, lazily materialized view of the types and members an
//! assembly declares, resolved from metadata handles on demand and memoized
//! for concurrent readers. The IL tier binds call and field-access
//! instructions to the entities defined here; transform passes compare them
//! structurally.
//!
//! # Key pieces
//!
//! - [`TypeSystem`] - the facade: handle resolution, overload matching,
//!   reflection-name lookup, attribute decoding, `InternalsVisibleTo`.
//! - [`TsType`] - the structural type tree.
//! - [`MethodRef`] / [`FieldRef`] - call-site and access-site member views.
//! - [`GenericContext`] / [`TypeParameterSubstitution`] - explicit generic
//!   contexts, composed rather than threaded through ambient state.

mod entities;
pub(crate) mod reflection;
mod resolver;
mod substitution;
mod types;

pub use entities::{
    AttributeArgument, AttributeValue, FieldDef, FieldRef, FieldRefRc, MethodDef, MethodRef,
    MethodRefRc, MethodSignature, MethodTarget, TypeDef,
};
pub use reflection::{format_reflection_name, parse_reflection_name};
pub use resolver::{ResolveOptions, TypeSystem};
pub use substitution::{GenericContext, TypeParameterSubstitution};
pub use types::{PrimitiveKind, TsType, TsTypeRef, TypeParameterOwner, UnknownType};
