//! The resolved type tree.
//!
//! [`TsType`] is the core's own vocabulary for types: an immutable tree that
//! signature decoding, the resolver, and the reflection-name parser all
//! produce, and that the IL tier consumes. Definitions resolved from the
//! current module appear as [`TsType::Definition`]; types the module merely
//! references appear as [`TsType::Unknown`] unless they name a runtime
//! primitive.
//!
//! Equality is structural. Type parameters are position-keyed (owner kind +
//! index), so two views of the same signature compare equal regardless of
//! which declaration they were decoded against.

use std::sync::Arc;

use crate::typesystem::entities::TypeDef;

/// Shared reference to a resolved type.
pub type TsTypeRef = Arc<TsType>;

/// Runtime primitive types (ECMA-335 §II.23.1.16 element types).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    /// `System.Void`
    Void,
    /// `System.Boolean`
    Boolean,
    /// `System.Char`
    Char,
    /// `System.SByte`
    SByte,
    /// `System.Byte`
    Byte,
    /// `System.Int16`
    Int16,
    /// `System.UInt16`
    UInt16,
    /// `System.Int32`
    Int32,
    /// `System.UInt32`
    UInt32,
    /// `System.Int64`
    Int64,
    /// `System.UInt64`
    UInt64,
    /// `System.Single`
    Single,
    /// `System.Double`
    Double,
    /// `System.IntPtr`
    IntPtr,
    /// `System.UIntPtr`
    UIntPtr,
    /// `System.Object`
    Object,
    /// `System.String`
    String,
    /// `System.TypedReference`
    TypedReference,
}

impl PrimitiveKind {
    /// The type name within the `System` namespace.
    #[must_use]
    pub fn system_name(&self) -> &'static str {
        match self {
            Self::Void => "Void",
            Self::Boolean => "Boolean",
            Self::Char => "Char",
            Self::SByte => "SByte",
            Self::Byte => "Byte",
            Self::Int16 => "Int16",
            Self::UInt16 => "UInt16",
            Self::Int32 => "Int32",
            Self::UInt32 => "UInt32",
            Self::Int64 => "Int64",
            Self::UInt64 => "UInt64",
            Self::Single => "Single",
            Self::Double => "Double",
            Self::IntPtr => "IntPtr",
            Self::UIntPtr => "UIntPtr",
            Self::Object => "Object",
            Self::String => "String",
            Self::TypedReference => "TypedReference",
        }
    }

    /// Maps a `System.*` type name back to its primitive, if it is one.
    #[must_use]
    pub fn from_system_name(namespace: &str, name: &str) -> Option<Self> {
        if namespace != "System" {
            return None;
        }
        Some(match name {
            "Void" => Self::Void,
            "Boolean" => Self::Boolean,
            "Char" => Self::Char,
            "SByte" => Self::SByte,
            "Byte" => Self::Byte,
            "Int16" => Self::Int16,
            "UInt16" => Self::UInt16,
            "Int32" => Self::Int32,
            "UInt32" => Self::UInt32,
            "Int64" => Self::Int64,
            "UInt64" => Self::UInt64,
            "Single" => Self::Single,
            "Double" => Self::Double,
            "IntPtr" => Self::IntPtr,
            "UIntPtr" => Self::UIntPtr,
            "Object" => Self::Object,
            "String" => Self::String,
            "TypedReference" => Self::TypedReference,
            _ => return None,
        })
    }
}

/// Which declaration a type parameter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeParameterOwner {
    /// A class-level type parameter (`ELEMENT_TYPE_VAR`, `` `0 `` in
    /// reflection names).
    Class,
    /// A method-level type parameter (`ELEMENT_TYPE_MVAR`, ` ``0 `` in
    /// reflection names).
    Method,
}

/// A type the current module references but does not define.
///
/// Carries enough identity for structural equality and reflection-name
/// printing; the assembly of origin is intentionally not part of identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnknownType {
    /// Namespace, empty for nested references.
    pub namespace: String,
    /// Name without the arity suffix; nested chains keep their `+` separators.
    pub name: String,
    /// Number of generic parameters.
    pub arity: u16,
}

/// A resolved type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TsType {
    /// A runtime primitive.
    Primitive(PrimitiveKind),
    /// A type defined in the current module.
    Definition(Arc<TypeDef>),
    /// An external or unresolvable named type.
    Unknown(UnknownType),
    /// An unmanaged pointer.
    Pointer(TsTypeRef),
    /// A managed by-reference. Always outermost.
    ByReference(TsTypeRef),
    /// An array with the given rank; rank 1 is the vector type.
    Array {
        /// Element type.
        element: TsTypeRef,
        /// Number of dimensions.
        rank: u8,
    },
    /// A generic instantiation.
    Parameterized {
        /// The open definition being instantiated.
        definition: TsTypeRef,
        /// Type arguments, one per declared parameter.
        arguments: Vec<TsTypeRef>,
    },
    /// A position-keyed type parameter reference.
    TypeParameter {
        /// Class-level or method-level.
        owner: TypeParameterOwner,
        /// Zero-based position.
        index: u16,
    },
}

impl TsType {
    /// Shorthand for a shared primitive.
    #[must_use]
    pub fn primitive(kind: PrimitiveKind) -> TsTypeRef {
        Arc::new(Self::Primitive(kind))
    }

    /// The `(namespace, name)` pair of the underlying named type, if any.
    ///
    /// Parameterized types answer with their definition's name; arrays,
    /// pointers and type parameters have none.
    #[must_use]
    pub fn named_pair(&self) -> Option<(&str, &str)> {
        match self {
            Self::Primitive(kind) => Some(("System", kind.system_name())),
            Self::Definition(def) => Some((def.namespace(), def.name())),
            Self::Unknown(unknown) => Some((&unknown.namespace, &unknown.name)),
            Self::Parameterized { definition, .. } => definition.named_pair(),
            _ => None,
        }
    }

    /// `true` when this is `System.Nullable<T>` for some `T`.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        matches!(self.named_pair(), Some(("System", "Nullable")))
            && matches!(self, Self::Parameterized { arguments, .. } if arguments.len() == 1)
    }

    /// `true` when this is one of the `System.ValueTuple` arities.
    #[must_use]
    pub fn is_tuple(&self) -> bool {
        matches!(self.named_pair(), Some(("System", "ValueTuple")))
    }

    /// `true` for an unbound type-parameter reference.
    #[must_use]
    pub fn is_type_parameter(&self) -> bool {
        matches!(self, Self::TypeParameter { .. })
    }

    /// Normalizes the type for comparisons.
    ///
    /// Well-known `System.*` names that slipped through as [`TsType::Unknown`]
    /// (for example from a reflection name or an external reference) collapse
    /// to their [`TsType::Primitive`] form; everything else is rebuilt
    /// structurally. Type parameters are already position-keyed and need no
    /// renaming.
    #[must_use]
    pub fn normalized(self: &Arc<Self>) -> TsTypeRef {
        match &**self {
            Self::Unknown(unknown) if unknown.arity == 0 => {
                match PrimitiveKind::from_system_name(&unknown.namespace, &unknown.name) {
                    Some(kind) => Self::primitive(kind),
                    None => self.clone(),
                }
            }
            Self::Pointer(element) => Arc::new(Self::Pointer(element.normalized())),
            Self::ByReference(element) => Arc::new(Self::ByReference(element.normalized())),
            Self::Array { element, rank } => Arc::new(Self::Array {
                element: element.normalized(),
                rank: *rank,
            }),
            Self::Parameterized {
                definition,
                arguments,
            } => Arc::new(Self::Parameterized {
                definition: definition.normalized(),
                arguments: arguments.iter().map(TsType::normalized).collect(),
            }),
            _ => self.clone(),
        }
    }

    /// The canonical reflection name of this type (see the grammar in the
    /// reflection module). Assembly names are never included.
    #[must_use]
    pub fn reflection_name(&self) -> String {
        crate::typesystem::reflection::format_reflection_name(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_name_round_trip() {
        for kind in [
            PrimitiveKind::Void,
            PrimitiveKind::Int32,
            PrimitiveKind::String,
            PrimitiveKind::TypedReference,
        ] {
            assert_eq!(
                PrimitiveKind::from_system_name("System", kind.system_name()),
                Some(kind)
            );
        }
        assert_eq!(PrimitiveKind::from_system_name("System", "Action"), None);
        assert_eq!(PrimitiveKind::from_system_name("Other", "Int32"), None);
    }

    #[test]
    fn test_normalized_collapses_well_known_unknowns() {
        let unknown = Arc::new(TsType::Unknown(UnknownType {
            namespace: "System".into(),
            name: "Int32".into(),
            arity: 0,
        }));
        assert_eq!(
            unknown.normalized(),
            TsType::primitive(PrimitiveKind::Int32)
        );

        // Non-system unknowns survive unchanged
        let other = Arc::new(TsType::Unknown(UnknownType {
            namespace: "My".into(),
            name: "Widget".into(),
            arity: 0,
        }));
        assert_eq!(other.normalized(), other);
    }

    #[test]
    fn test_normalized_recurses_into_constructors() {
        let inner = Arc::new(TsType::Unknown(UnknownType {
            namespace: "System".into(),
            name: "String".into(),
            arity: 0,
        }));
        let array = Arc::new(TsType::Array {
            element: inner,
            rank: 1,
        });
        let expected = Arc::new(TsType::Array {
            element: TsType::primitive(PrimitiveKind::String),
            rank: 1,
        });
        assert_eq!(array.normalized(), expected);
    }

    #[test]
    fn test_nullable_and_tuple_detection() {
        let nullable_def = Arc::new(TsType::Unknown(UnknownType {
            namespace: "System".into(),
            name: "Nullable".into(),
            arity: 1,
        }));
        let nullable = TsType::Parameterized {
            definition: nullable_def,
            arguments: vec![TsType::primitive(PrimitiveKind::Int32)],
        };
        assert!(nullable.is_nullable());
        assert!(!nullable.is_tuple());
    }
}
