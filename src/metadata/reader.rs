//! The metadata reader contract.
//!
//! The core does not parse Portable-Executable files or metadata streams. An
//! external layer implements [`MetadataReader`] and delivers typed records,
//! decoded signatures, and method bodies. The shape of the contract mirrors
//! ECMA-335 §II.23-II.25: tables are exposed as handle enumerations, and
//! signatures are decoded *by the reader* but built *by the core* through the
//! [`SignatureProvider`] callback, so the reader never needs to know the
//! core's type representation.

use crate::{
    metadata::handles::{
        AttributeOwner, FieldHandle, MemberRefHandle, MethodDefHandle, MethodSpecHandle,
        MethodToken, TypeDefHandle, TypeRefHandle, TypeSpecHandle, TypeToken,
    },
    typesystem::{MethodSignature, PrimitiveKind, TsTypeRef},
    Result,
};

/// Callback the core supplies when asking the reader to decode a signature.
///
/// The reader walks the signature blob and calls back into the provider for
/// each element it encounters; the provider assembles the core's own type
/// tree. Composition is bottom-up: element types are built before the
/// constructors that wrap them.
pub trait SignatureProvider: Sync {
    /// A primitive element type (`ELEMENT_TYPE_I4`, `ELEMENT_TYPE_STRING`, ...).
    fn primitive(&self, kind: PrimitiveKind) -> TsTypeRef;

    /// A `TypeDef`-coded class or value type.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle cannot be resolved.
    fn from_type_def(&self, handle: TypeDefHandle) -> Result<TsTypeRef>;

    /// A `TypeRef`-coded class or value type.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle cannot be resolved.
    fn from_type_ref(&self, handle: TypeRefHandle) -> Result<TsTypeRef>;

    /// An unmanaged pointer to `element`.
    fn pointer_to(&self, element: TsTypeRef) -> TsTypeRef;

    /// A managed by-reference to `element`.
    fn by_reference(&self, element: TsTypeRef) -> TsTypeRef;

    /// An array of `element` with the given rank (1 for `ELEMENT_TYPE_SZARRAY`).
    fn array_of(&self, element: TsTypeRef, rank: u8) -> TsTypeRef;

    /// A generic instantiation `definition<arguments...>`.
    ///
    /// # Errors
    ///
    /// Returns an error when the definition is not a generic type or the
    /// argument count does not match its arity.
    fn generic_instance(&self, definition: TsTypeRef, arguments: Vec<TsTypeRef>)
        -> Result<TsTypeRef>;

    /// A class-level type parameter reference (`ELEMENT_TYPE_VAR`).
    ///
    /// # Errors
    ///
    /// Returns an error when the index is outside the current generic context.
    fn class_type_parameter(&self, index: u16) -> Result<TsTypeRef>;

    /// A method-level type parameter reference (`ELEMENT_TYPE_MVAR`).
    ///
    /// # Errors
    ///
    /// Returns an error when the index is outside the current generic context.
    fn method_type_parameter(&self, index: u16) -> Result<TsTypeRef>;
}

/// A decoded TypeDef row.
#[derive(Debug, Clone)]
pub struct TypeDefRecord {
    /// Namespace, empty for nested and global types.
    pub namespace: String,
    /// Type name including any arity suffix the compiler emitted (`List`1`).
    pub name: String,
    /// The enclosing type for nested types.
    pub enclosing: Option<TypeDefHandle>,
    /// Number of generic parameters declared on the type.
    pub generic_param_count: u16,
    /// `true` for value types (extends System.ValueType).
    pub is_value_type: bool,
    /// `true` for `readonly struct` declarations (carries the
    /// `IsReadOnlyAttribute`).
    pub is_readonly: bool,
    /// Methods declared by this type, in table order.
    pub methods: Vec<MethodDefHandle>,
    /// Fields declared by this type, in table order.
    pub fields: Vec<FieldHandle>,
}

/// A decoded TypeRef row.
#[derive(Debug, Clone)]
pub struct TypeRefRecord {
    /// Namespace of the referenced type.
    pub namespace: String,
    /// Name of the referenced type (with arity suffix).
    pub name: String,
    /// Number of generic parameters, recovered from the arity suffix.
    pub generic_param_count: u16,
    /// Resolution scope as an assembly simple name, when external.
    pub assembly: Option<String>,
    /// The enclosing reference for nested type refs.
    pub enclosing: Option<TypeRefHandle>,
}

/// A decoded MethodDef row (signature delivered separately via the provider).
#[derive(Debug, Clone)]
pub struct MethodDefRecord {
    /// Method name.
    pub name: String,
    /// The declaring type.
    pub declaring_type: TypeDefHandle,
    /// Number of generic parameters declared on the method.
    pub generic_param_count: u16,
    /// `true` when the method is static.
    pub is_static: bool,
}

/// A decoded MemberRef row.
#[derive(Debug, Clone)]
pub struct MemberRefRecord {
    /// Member name.
    pub name: String,
    /// The declaring type of the referenced member.
    pub declaring_type: TypeToken,
    /// `true` when the signature is a field signature rather than a method one.
    pub is_field: bool,
}

/// A decoded MethodSpec row.
#[derive(Debug, Clone)]
pub struct MethodSpecRecord {
    /// The generic method being instantiated.
    pub method: MethodToken,
}

/// A decoded Field row.
#[derive(Debug, Clone)]
pub struct FieldRecord {
    /// Field name.
    pub name: String,
    /// The declaring type.
    pub declaring_type: TypeDefHandle,
    /// `true` when the field is static.
    pub is_static: bool,
}

/// A custom attribute with its arguments pre-decoded by the reader.
///
/// Type-valued arguments arrive as reflection-name strings; the core resolves
/// them into its own type vocabulary when constructing attribute values.
#[derive(Debug, Clone)]
pub struct AttributeRecord {
    /// The attribute constructor.
    pub constructor: MethodToken,
    /// Positional arguments in declaration order.
    pub fixed_args: Vec<AttributeArgRecord>,
    /// `name = value` arguments.
    pub named_args: Vec<(String, AttributeArgRecord)>,
}

/// A single decoded attribute argument.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeArgRecord {
    /// A boolean constant.
    Boolean(bool),
    /// Any integer constant up to 64 bits, sign-extended.
    Int(i64),
    /// A floating-point constant.
    Float(f64),
    /// A string constant.
    String(String),
    /// A `typeof(...)` argument, as a reflection name.
    TypeName(String),
    /// A null string or type argument.
    Null,
}

/// An exception-region row from a method body's data section.
#[derive(Debug, Clone)]
pub struct ExceptionRegion {
    /// What kind of handler this region attaches.
    pub kind: ExceptionRegionKind,
    /// Offset of the protected range.
    pub try_offset: u32,
    /// Length of the protected range.
    pub try_length: u32,
    /// Offset of the handler.
    pub handler_offset: u32,
    /// Length of the handler.
    pub handler_length: u32,
}

/// Exception-region discriminator.
#[derive(Debug, Clone)]
pub enum ExceptionRegionKind {
    /// A typed catch handler.
    Catch {
        /// The caught exception type; `None` catches everything.
        exception_type: Option<TypeToken>,
    },
    /// A filtered handler (filter code precedes the handler).
    Filter {
        /// Offset of the filter expression.
        filter_offset: u32,
    },
    /// A finally handler.
    Finally,
    /// A fault handler (finally that only runs on exceptional exit).
    Fault,
}

/// A raw method body as stored in the image.
#[derive(Debug, Clone)]
pub struct MethodBodyData {
    /// The CIL byte stream.
    pub code: Vec<u8>,
    /// Declared evaluation-stack depth bound.
    pub max_stack: u16,
    /// Types of the local variable slots, in slot order.
    pub local_types: Vec<TsTypeRef>,
    /// Whether locals are zero-initialized.
    pub init_locals: bool,
    /// Exception regions covering the body.
    pub exception_regions: Vec<ExceptionRegion>,
}

/// The inbound metadata contract the core consumes.
///
/// Implementations must be safe for concurrent readers; whole-module
/// decompilation calls into the reader from multiple worker threads.
pub trait MetadataReader: Send + Sync {
    /// Simple name of the assembly this reader describes.
    fn assembly_name(&self) -> String;

    /// All type definitions in the module, in table order.
    fn type_definitions(&self) -> Vec<TypeDefHandle>;

    /// Reads one TypeDef row.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for an invalid handle.
    fn type_definition(&self, handle: TypeDefHandle) -> Result<TypeDefRecord>;

    /// Reads one TypeRef row.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for an invalid handle.
    fn type_reference(&self, handle: TypeRefHandle) -> Result<TypeRefRecord>;

    /// Decodes a TypeSpec signature through the provider.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for an undecodable signature.
    fn type_specification(
        &self,
        handle: TypeSpecHandle,
        provider: &dyn SignatureProvider,
    ) -> Result<TsTypeRef>;

    /// Reads one MethodDef row.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for an invalid handle.
    fn method_definition(&self, handle: MethodDefHandle) -> Result<MethodDefRecord>;

    /// Decodes a MethodDef signature through the provider.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for an undecodable signature.
    fn method_def_signature(
        &self,
        handle: MethodDefHandle,
        provider: &dyn SignatureProvider,
    ) -> Result<MethodSignature>;

    /// Reads one MemberRef row.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for an invalid handle.
    fn member_reference(&self, handle: MemberRefHandle) -> Result<MemberRefRecord>;

    /// Decodes a MemberRef *method* signature through the provider.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for an undecodable signature, or when the
    /// member reference is a field reference.
    fn member_ref_signature(
        &self,
        handle: MemberRefHandle,
        provider: &dyn SignatureProvider,
    ) -> Result<MethodSignature>;

    /// Decodes a MemberRef *field* signature through the provider.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for an undecodable signature, or when the
    /// member reference is a method reference.
    fn member_ref_field_type(
        &self,
        handle: MemberRefHandle,
        provider: &dyn SignatureProvider,
    ) -> Result<TsTypeRef>;

    /// Reads one MethodSpec row.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for an invalid handle.
    fn method_specification(&self, handle: MethodSpecHandle) -> Result<MethodSpecRecord>;

    /// Decodes the instantiation arguments of a MethodSpec.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for an undecodable signature.
    fn method_spec_arguments(
        &self,
        handle: MethodSpecHandle,
        provider: &dyn SignatureProvider,
    ) -> Result<Vec<TsTypeRef>>;

    /// Reads one Field row.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for an invalid handle.
    fn field(&self, handle: FieldHandle) -> Result<FieldRecord>;

    /// Decodes a Field signature through the provider.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for an undecodable signature.
    fn field_signature(
        &self,
        handle: FieldHandle,
        provider: &dyn SignatureProvider,
    ) -> Result<TsTypeRef>;

    /// Custom attributes attached to `owner`, pre-decoded.
    fn custom_attributes(&self, owner: AttributeOwner) -> Vec<AttributeRecord>;

    /// The raw body of a method.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error when the body header or exception table
    /// cannot be decoded, or when the method has no body.
    fn method_body(&self, handle: MethodDefHandle) -> Result<MethodBodyData>;

    /// Resolves a `ldstr` token (table `0x70`) from the user-string heap.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for an invalid token.
    fn user_string(&self, token: u32) -> Result<String>;
}
