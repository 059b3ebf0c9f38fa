//! Opaque metadata handles.
//!
//! The external metadata reader identifies every row it can describe by a
//! handle. Handles are plain indices from the core's point of view; only the
//! reader knows how to dereference them. The core uses them as memoization
//! keys and never inspects their value.

macro_rules! handle_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}(0x{:08x})", stringify!($name), self.0)
            }
        }
    };
}

handle_type! {
    /// A row in the TypeDef table.
    TypeDefHandle
}
handle_type! {
    /// A row in the TypeRef table.
    TypeRefHandle
}
handle_type! {
    /// A row in the TypeSpec table (an encoded type signature).
    TypeSpecHandle
}
handle_type! {
    /// A row in the MethodDef table.
    MethodDefHandle
}
handle_type! {
    /// A row in the MemberRef table (a method or field reference).
    MemberRefHandle
}
handle_type! {
    /// A row in the MethodSpec table (a generic method instantiation).
    MethodSpecHandle
}
handle_type! {
    /// A row in the Field table.
    FieldHandle
}

/// A token referring to a type by any of the three encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeToken {
    /// A type defined in this module.
    Definition(TypeDefHandle),
    /// A reference to a type in another scope.
    Reference(TypeRefHandle),
    /// An encoded type signature (arrays, pointers, instantiations, ...).
    Specification(TypeSpecHandle),
}

/// A token referring to a method by any of the three encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodToken {
    /// A method defined in this module.
    Definition(MethodDefHandle),
    /// A reference to a member of another type (possibly instantiated).
    MemberRef(MemberRefHandle),
    /// A generic method instantiation.
    Specification(MethodSpecHandle),
}

/// A token referring to a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldToken {
    /// A field defined in this module.
    Definition(FieldHandle),
    /// A reference to a field of another type.
    MemberRef(MemberRefHandle),
}

/// The owner of a custom-attribute list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeOwner {
    /// Attributes on the assembly itself.
    Assembly,
    /// Attributes on a type definition.
    Type(TypeDefHandle),
    /// Attributes on a method definition.
    Method(MethodDefHandle),
    /// Attributes on a field definition.
    Field(FieldHandle),
}
