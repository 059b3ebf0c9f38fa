//! Resolved member entities: type definitions, methods, fields, attributes.
//!
//! Entities are immutable once constructed and shared through `Arc`. Member
//! lists on [`TypeDef`] are materialized lazily by the type system using the
//! initialize-once idiom, so concurrent readers either see the finished list
//! or race to install the same value, with the first writer winning.

use std::sync::{Arc, OnceLock};

use crate::{
    metadata::{FieldHandle, MethodDefHandle, TypeDefHandle},
    typesystem::{
        substitution::TypeParameterSubstitution,
        types::{TsType, TsTypeRef},
    },
};

/// Shared reference to a resolved method view.
pub type MethodRefRc = Arc<MethodRef>;
/// Shared reference to a resolved field view.
pub type FieldRefRc = Arc<FieldRef>;

/// A type defined in the current module.
pub struct TypeDef {
    handle: TypeDefHandle,
    namespace: String,
    /// Name without the arity suffix.
    name: String,
    generic_param_count: u16,
    is_value_type: bool,
    is_readonly: bool,
    enclosing: Option<Arc<TypeDef>>,
    /// Lazily materialized member lists; populated by the type system.
    pub(crate) methods: OnceLock<Vec<Arc<MethodDef>>>,
    pub(crate) fields: OnceLock<Vec<Arc<FieldDef>>>,
    pub(crate) attributes: OnceLock<Vec<AttributeValue>>,
}

impl TypeDef {
    pub(crate) fn new(
        handle: TypeDefHandle,
        namespace: String,
        name: String,
        generic_param_count: u16,
        is_value_type: bool,
        is_readonly: bool,
        enclosing: Option<Arc<TypeDef>>,
    ) -> Self {
        Self {
            handle,
            namespace,
            name,
            generic_param_count,
            is_value_type,
            is_readonly,
            enclosing,
            methods: OnceLock::new(),
            fields: OnceLock::new(),
            attributes: OnceLock::new(),
        }
    }

    /// The metadata handle this definition was resolved from.
    #[must_use]
    pub fn handle(&self) -> TypeDefHandle {
        self.handle
    }

    /// Namespace of the outermost type; empty for nested definitions.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Type name without the arity suffix.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of generic parameters declared on this type.
    #[must_use]
    pub fn generic_param_count(&self) -> u16 {
        self.generic_param_count
    }

    /// `true` for value types.
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        self.is_value_type
    }

    /// `true` for `readonly struct` declarations.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.is_readonly
    }

    /// The enclosing type for nested definitions.
    #[must_use]
    pub fn enclosing(&self) -> Option<&Arc<TypeDef>> {
        self.enclosing.as_ref()
    }

    /// The nested name path (`Outer+Inner`), without namespace or arity.
    #[must_use]
    pub fn nested_path(&self) -> String {
        match &self.enclosing {
            Some(outer) => format!("{}+{}", outer.nested_path(), self.name),
            None => self.name.clone(),
        }
    }
}

// Identity of a definition is its handle; member lists do not participate.
impl PartialEq for TypeDef {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for TypeDef {}

impl std::hash::Hash for TypeDef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.handle.hash(state);
    }
}

impl std::fmt::Debug for TypeDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypeDef({}, {}.{})", self.handle, self.namespace, self.nested_path())
    }
}

/// A method defined in the current module.
pub struct MethodDef {
    handle: MethodDefHandle,
    name: String,
    declaring_type: Arc<TypeDef>,
    generic_param_count: u16,
    is_static: bool,
    /// The declared signature, with type parameters position-keyed.
    signature: MethodSignature,
}

impl MethodDef {
    pub(crate) fn new(
        handle: MethodDefHandle,
        name: String,
        declaring_type: Arc<TypeDef>,
        generic_param_count: u16,
        is_static: bool,
        signature: MethodSignature,
    ) -> Self {
        Self {
            handle,
            name,
            declaring_type,
            generic_param_count,
            is_static,
            signature,
        }
    }

    /// The metadata handle this definition was resolved from.
    #[must_use]
    pub fn handle(&self) -> MethodDefHandle {
        self.handle
    }

    /// Method name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declaring type definition.
    #[must_use]
    pub fn declaring_type(&self) -> &Arc<TypeDef> {
        &self.declaring_type
    }

    /// Number of generic parameters declared on the method.
    #[must_use]
    pub fn generic_param_count(&self) -> u16 {
        self.generic_param_count
    }

    /// `true` when the method is static.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// The declared (unsubstituted) signature.
    #[must_use]
    pub fn signature(&self) -> &MethodSignature {
        &self.signature
    }
}

impl PartialEq for MethodDef {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for MethodDef {}

impl std::fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MethodDef({}, {:?}.{})", self.handle, self.declaring_type, self.name)
    }
}

/// A field defined in the current module.
pub struct FieldDef {
    handle: FieldHandle,
    name: String,
    declaring_type: Arc<TypeDef>,
    is_static: bool,
    field_type: TsTypeRef,
}

impl FieldDef {
    pub(crate) fn new(
        handle: FieldHandle,
        name: String,
        declaring_type: Arc<TypeDef>,
        is_static: bool,
        field_type: TsTypeRef,
    ) -> Self {
        Self {
            handle,
            name,
            declaring_type,
            is_static,
            field_type,
        }
    }

    /// The metadata handle this definition was resolved from.
    #[must_use]
    pub fn handle(&self) -> FieldHandle {
        self.handle
    }

    /// Field name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declaring type definition.
    #[must_use]
    pub fn declaring_type(&self) -> &Arc<TypeDef> {
        &self.declaring_type
    }

    /// `true` when the field is static.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// The declared field type.
    #[must_use]
    pub fn field_type(&self) -> &TsTypeRef {
        &self.field_type
    }
}

impl PartialEq for FieldDef {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for FieldDef {}

impl std::fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FieldDef({}, {:?}.{})", self.handle, self.declaring_type, self.name)
    }
}

/// A decoded method signature, in the core's type vocabulary.
///
/// Type parameters inside the signature are position-keyed
/// ([`TsType::TypeParameter`]); whether they mean the declaring type's or the
/// method's own parameters is carried by the owner kind, not by identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    /// Instance signature (`HASTHIS`).
    pub has_this: bool,
    /// Number of generic parameters (`GENERIC` calling convention).
    pub generic_param_count: u16,
    /// Vararg calling convention.
    pub is_vararg: bool,
    /// Return type.
    pub return_type: TsTypeRef,
    /// Fixed parameter types.
    pub parameters: Vec<TsTypeRef>,
    /// Parameters after the vararg sentinel, present only on call-site
    /// signatures of vararg methods.
    pub sentinel_params: Vec<TsTypeRef>,
}

impl MethodSignature {
    /// A static, non-generic signature.
    #[must_use]
    pub fn simple(return_type: TsTypeRef, parameters: Vec<TsTypeRef>) -> Self {
        Self {
            has_this: false,
            generic_param_count: 0,
            is_vararg: false,
            return_type,
            parameters,
            sentinel_params: Vec::new(),
        }
    }

    /// An instance, non-generic signature.
    #[must_use]
    pub fn instance(return_type: TsTypeRef, parameters: Vec<TsTypeRef>) -> Self {
        Self {
            has_this: true,
            ..Self::simple(return_type, parameters)
        }
    }

    /// Normalizes every type in the signature (see [`TsType::normalized`]).
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            has_this: self.has_this,
            generic_param_count: self.generic_param_count,
            is_vararg: self.is_vararg,
            return_type: self.return_type.normalized(),
            parameters: self.parameters.iter().map(TsType::normalized).collect(),
            sentinel_params: self
                .sentinel_params
                .iter()
                .map(TsType::normalized)
                .collect(),
        }
    }

    /// Compares two signatures modulo normalization: parameter and return
    /// types are normalized before the structural comparison, and sentinel
    /// parameters are ignored (they describe a call site, not a member).
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self.has_this == other.has_this
            && self.generic_param_count == other.generic_param_count
            && self.is_vararg == other.is_vararg
            && self.parameters.len() == other.parameters.len()
            && self.return_type.normalized() == other.return_type.normalized()
            && self
                .parameters
                .iter()
                .zip(&other.parameters)
                .all(|(a, b)| a.normalized() == b.normalized())
    }
}

/// How a [`MethodRef`] relates to the current module's definitions.
#[derive(Debug, Clone)]
pub enum MethodTarget {
    /// The reference resolved to a definition in this module.
    Definition(Arc<MethodDef>),
    /// No matching member exists; the reference carries the requested
    /// signature so decompilation can continue.
    Fake,
}

/// A resolved view of a method as used at a call site.
///
/// For references into instantiated generic types the signature is already
/// substituted, and [`MethodRef::substitution`] records the arguments.
#[derive(Debug, Clone)]
pub struct MethodRef {
    /// What the reference resolved to.
    pub target: MethodTarget,
    /// The declaring type as seen at the call site (possibly parameterized).
    pub declaring_type: TsTypeRef,
    /// Member name.
    pub name: String,
    /// The call-site signature, substituted.
    pub signature: MethodSignature,
    /// Class + method type arguments in effect at the call site.
    pub substitution: TypeParameterSubstitution,
    /// `true` when this is a vararg call-site instance carrying sentinel
    /// parameters.
    pub vararg_instance: bool,
}

impl MethodRef {
    /// `true` when no matching definition was found.
    #[must_use]
    pub fn is_fake(&self) -> bool {
        matches!(self.target, MethodTarget::Fake)
    }

    /// Tests declaring type and member name against well-known names, e.g.
    /// `matches_member("System.Threading", "Monitor", "Enter")`.
    #[must_use]
    pub fn matches_member(&self, namespace: &str, type_name: &str, method_name: &str) -> bool {
        self.name == method_name
            && self.declaring_type.named_pair() == Some((namespace, type_name))
    }

    /// Number of arguments a call to this method pops, including `this`.
    #[must_use]
    pub fn argument_count(&self) -> usize {
        usize::from(self.has_this())
            + self.signature.parameters.len()
            + self.signature.sentinel_params.len()
    }

    /// Instance signature?
    #[must_use]
    pub fn has_this(&self) -> bool {
        self.signature.has_this
    }
}

/// A resolved view of a field as used at an access site.
///
/// Equality is structural (declaring type, name, field type) rather than by
/// handle, so recognizers that compare fields across blocks are robust
/// against metadata reloading.
#[derive(Debug, Clone)]
pub struct FieldRef {
    /// The definition, when the field lives in this module.
    pub target: Option<Arc<FieldDef>>,
    /// The declaring type as seen at the access site.
    pub declaring_type: TsTypeRef,
    /// Field name.
    pub name: String,
    /// The field type, substituted.
    pub field_type: TsTypeRef,
}

impl PartialEq for FieldRef {
    fn eq(&self, other: &Self) -> bool {
        self.declaring_type == other.declaring_type
            && self.name == other.name
            && self.field_type == other.field_type
    }
}

impl Eq for FieldRef {}

/// A constructed custom attribute with decoded arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeValue {
    /// The attribute type.
    pub attribute_type: TsTypeRef,
    /// Positional constructor arguments.
    pub fixed_arguments: Vec<AttributeArgument>,
    /// `name = value` arguments.
    pub named_arguments: Vec<(String, AttributeArgument)>,
}

/// A single decoded attribute argument, in type-system vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeArgument {
    /// A boolean constant.
    Boolean(bool),
    /// An integer constant, sign-extended to 64 bits.
    Int(i64),
    /// A floating-point constant.
    Float(f64),
    /// A string constant.
    String(String),
    /// A `typeof(...)` argument, resolved.
    Type(TsTypeRef),
    /// A null string or type argument.
    Null,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typesystem::types::{PrimitiveKind, UnknownType};

    fn unknown(namespace: &str, name: &str) -> TsTypeRef {
        Arc::new(TsType::Unknown(UnknownType {
            namespace: namespace.into(),
            name: name.into(),
            arity: 0,
        }))
    }

    #[test]
    fn test_signature_matches_modulo_normalization() {
        // One side resolved System.Int32 to a primitive, the other kept the
        // unknown spelling; they must still match.
        let a = MethodSignature::simple(
            TsType::primitive(PrimitiveKind::Void),
            vec![TsType::primitive(PrimitiveKind::Int32)],
        );
        let b = MethodSignature::simple(
            TsType::primitive(PrimitiveKind::Void),
            vec![unknown("System", "Int32")],
        );
        assert!(a.matches(&b));

        let c = MethodSignature::simple(
            TsType::primitive(PrimitiveKind::Void),
            vec![TsType::primitive(PrimitiveKind::Int64)],
        );
        assert!(!a.matches(&c));
    }

    #[test]
    fn test_signature_matches_requires_same_shape() {
        let inst = MethodSignature::instance(TsType::primitive(PrimitiveKind::Void), vec![]);
        let stat = MethodSignature::simple(TsType::primitive(PrimitiveKind::Void), vec![]);
        assert!(!inst.matches(&stat));
    }

    #[test]
    fn test_field_ref_structural_equality() {
        let a = FieldRef {
            target: None,
            declaring_type: unknown("My", "Widget"),
            name: "cache".into(),
            field_type: TsType::primitive(PrimitiveKind::Object),
        };
        let b = FieldRef {
            target: None,
            declaring_type: unknown("My", "Widget"),
            name: "cache".into(),
            field_type: TsType::primitive(PrimitiveKind::Object),
        };
        assert_eq!(a, b);

        let c = FieldRef {
            name: "other".into(),
            ..b.clone()
        };
        assert_ne!(a, c);
    }
}
