//! The resolved type-system facade.
//!
//! [`TypeSystem`] turns opaque metadata handles into shared, immutable entity
//! views. Resolution is lazy and memoized per handle with the
//! initialize-once idiom: read the cache, compute on miss, then try to
//! install the result - the first writer wins and later readers observe its
//! value. There are no locks on the fast path and concurrent readers are
//! safe, which whole-module decompilation relies on.
//!
//! Member references into instantiated generic types are resolved by overload
//! matching *modulo normalization*: both sides keep their type parameters
//! position-keyed, and well-known names are collapsed before comparison.
//! An unknown member never fails resolution; it yields a synthetic fake
//! method carrying the requested signature.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use rustc_hash::FxHashMap;

use crate::{
    metadata::{
        AttributeArgRecord, AttributeOwner, FieldHandle, FieldToken, MetadataReader,
        MethodDefHandle, MethodToken, SignatureProvider, TypeDefHandle, TypeRefHandle, TypeToken,
    },
    typesystem::{
        entities::{
            AttributeArgument, AttributeValue, FieldDef, FieldRef, FieldRefRc, MethodDef,
            MethodRef, MethodRefRc, MethodSignature, MethodTarget, TypeDef,
        },
        reflection::parse_reflection_name,
        substitution::{GenericContext, TypeParameterSubstitution},
        types::{PrimitiveKind, TsType, TsTypeRef, UnknownType},
    },
    Result,
};

/// Options controlling method resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Wrap vararg signatures into a call-site instance that keeps the
    /// sentinel parameters. When `false`, sentinel parameters are dropped.
    pub expand_varargs: bool,
}

/// Lazy, memoized view of an assembly's types and members.
pub struct TypeSystem {
    reader: Arc<dyn MetadataReader>,
    type_defs: DashMap<TypeDefHandle, Arc<TypeDef>>,
    type_refs: DashMap<TypeRefHandle, TsTypeRef>,
    method_defs: DashMap<MethodDefHandle, Arc<MethodDef>>,
    field_defs: DashMap<FieldHandle, Arc<FieldDef>>,
    assembly_attributes: OnceLock<Vec<AttributeValue>>,
    name_index: OnceLock<FxHashMap<(String, String, u16), TypeDefHandle>>,
}

impl TypeSystem {
    /// Creates a type system over a metadata reader.
    #[must_use]
    pub fn new(reader: Arc<dyn MetadataReader>) -> Self {
        Self {
            reader,
            type_defs: DashMap::new(),
            type_refs: DashMap::new(),
            method_defs: DashMap::new(),
            field_defs: DashMap::new(),
            assembly_attributes: OnceLock::new(),
            name_index: OnceLock::new(),
        }
    }

    /// The underlying reader.
    #[must_use]
    pub fn reader(&self) -> &Arc<dyn MetadataReader> {
        &self.reader
    }

    /// Simple name of the assembly.
    #[must_use]
    pub fn assembly_name(&self) -> String {
        self.reader.assembly_name()
    }

    /// Resolves a type definition handle. Idempotent: repeated calls return
    /// the same shared entity.
    ///
    /// # Errors
    ///
    /// Propagates `Malformed` errors from the reader.
    pub fn type_def(&self, handle: TypeDefHandle) -> Result<Arc<TypeDef>> {
        if let Some(existing) = self.type_defs.get(&handle) {
            return Ok(existing.clone());
        }
        let record = self.reader.type_definition(handle)?;
        let enclosing = match record.enclosing {
            Some(outer) => Some(self.type_def(outer)?),
            None => None,
        };
        let (name, name_arity) = split_arity(&record.name);
        let arity = if record.generic_param_count > 0 {
            record.generic_param_count
        } else {
            name_arity
        };
        let fresh = Arc::new(TypeDef::new(
            handle,
            record.namespace,
            name,
            arity,
            record.is_value_type,
            record.is_readonly,
            enclosing,
        ));
        Ok(self.type_defs.entry(handle).or_insert(fresh).clone())
    }

    /// Resolves a method definition handle.
    ///
    /// # Errors
    ///
    /// Propagates `Malformed` errors from the reader.
    pub fn method_def(&self, handle: MethodDefHandle) -> Result<Arc<MethodDef>> {
        if let Some(existing) = self.method_defs.get(&handle) {
            return Ok(existing.clone());
        }
        let record = self.reader.method_definition(handle)?;
        let declaring = self.type_def(record.declaring_type)?;
        let builder = SignatureBuilder {
            types: self,
            context: GenericContext::new(
                declaring.generic_param_count(),
                record.generic_param_count,
            ),
            options: ResolveOptions::default(),
        };
        let signature = self.reader.method_def_signature(handle, &builder)?;
        let fresh = Arc::new(MethodDef::new(
            handle,
            record.name,
            declaring,
            record.generic_param_count,
            record.is_static,
            signature,
        ));
        Ok(self.method_defs.entry(handle).or_insert(fresh).clone())
    }

    /// Resolves a field definition handle.
    ///
    /// # Errors
    ///
    /// Propagates `Malformed` errors from the reader.
    pub fn field_def(&self, handle: FieldHandle) -> Result<Arc<FieldDef>> {
        if let Some(existing) = self.field_defs.get(&handle) {
            return Ok(existing.clone());
        }
        let record = self.reader.field(handle)?;
        let declaring = self.type_def(record.declaring_type)?;
        let builder = SignatureBuilder {
            types: self,
            context: GenericContext::new(declaring.generic_param_count(), 0),
            options: ResolveOptions::default(),
        };
        let field_type = self.reader.field_signature(handle, &builder)?;
        let fresh = Arc::new(FieldDef::new(
            handle,
            record.name,
            declaring,
            record.is_static,
            field_type,
        ));
        Ok(self.field_defs.entry(handle).or_insert(fresh).clone())
    }

    /// The methods declared by a type, materialized on first use.
    ///
    /// # Errors
    ///
    /// Propagates `Malformed` errors from the reader.
    pub fn methods_of<'t>(&self, def: &'t TypeDef) -> Result<&'t [Arc<MethodDef>]> {
        if let Some(methods) = def.methods.get() {
            return Ok(methods);
        }
        let record = self.reader.type_definition(def.handle())?;
        let mut computed = Vec::with_capacity(record.methods.len());
        for handle in record.methods {
            computed.push(self.method_def(handle)?);
        }
        Ok(def.methods.get_or_init(|| computed))
    }

    /// The fields declared by a type, materialized on first use.
    ///
    /// # Errors
    ///
    /// Propagates `Malformed` errors from the reader.
    pub fn fields_of<'t>(&self, def: &'t TypeDef) -> Result<&'t [Arc<FieldDef>]> {
        if let Some(fields) = def.fields.get() {
            return Ok(fields);
        }
        let record = self.reader.type_definition(def.handle())?;
        let mut computed = Vec::with_capacity(record.fields.len());
        for handle in record.fields {
            computed.push(self.field_def(handle)?);
        }
        Ok(def.fields.get_or_init(|| computed))
    }

    /// Resolves a type token in a generic context.
    ///
    /// Named-type resolution is option-independent (the per-handle caches
    /// stay valid for every caller); the options are carried into signature
    /// decoding so method signatures nested inside a type specification
    /// honor the same vararg treatment as direct method resolution.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for undecodable signatures or unknown
    /// signature kinds.
    pub fn resolve_type(
        &self,
        token: TypeToken,
        context: &GenericContext,
        options: ResolveOptions,
    ) -> Result<TsTypeRef> {
        match token {
            TypeToken::Definition(handle) => {
                Ok(Arc::new(TsType::Definition(self.type_def(handle)?)))
            }
            TypeToken::Reference(handle) => self.type_ref(handle),
            TypeToken::Specification(handle) => {
                let builder = SignatureBuilder {
                    types: self,
                    context: *context,
                    options,
                };
                self.reader.type_specification(handle, &builder)
            }
        }
    }

    /// Resolves a type reference, preferring definitions from this module,
    /// then well-known primitives, then an [`TsType::Unknown`] identity.
    pub(crate) fn type_ref(&self, handle: TypeRefHandle) -> Result<TsTypeRef> {
        if let Some(existing) = self.type_refs.get(&handle) {
            return Ok(existing.clone());
        }
        let (namespace, path, arity, external) = self.type_ref_identity(handle)?;

        let resolved = if external {
            None
        } else {
            self.lookup_named(&namespace, &path, arity)
        };
        let fresh = resolved.unwrap_or_else(|| {
            if arity == 0 && !path.contains('+') {
                if let Some(kind) = PrimitiveKind::from_system_name(&namespace, &path) {
                    return TsType::primitive(kind);
                }
            }
            Arc::new(TsType::Unknown(UnknownType {
                namespace,
                name: path,
                arity,
            }))
        });
        Ok(self.type_refs.entry(handle).or_insert(fresh).clone())
    }

    /// Computes `(namespace, nested path, total arity, is_external)` for a
    /// type reference, walking enclosing references.
    fn type_ref_identity(&self, handle: TypeRefHandle) -> Result<(String, String, u16, bool)> {
        let record = self.reader.type_reference(handle)?;
        let (name, name_arity) = split_arity(&record.name);
        let arity = if record.generic_param_count > 0 {
            record.generic_param_count
        } else {
            name_arity
        };
        match record.enclosing {
            Some(outer) => {
                let (namespace, outer_path, outer_arity, external) =
                    self.type_ref_identity(outer)?;
                Ok((
                    namespace,
                    format!("{outer_path}+{name}"),
                    outer_arity + arity,
                    external || record.assembly.is_some(),
                ))
            }
            None => Ok((
                record.namespace,
                name,
                arity,
                record.assembly.is_some(),
            )),
        }
    }

    /// Looks up a definition by `(namespace, nested path, arity)`.
    pub(crate) fn lookup_named(
        &self,
        namespace: &str,
        path: &str,
        arity: u16,
    ) -> Option<TsTypeRef> {
        let index = self.name_index.get_or_init(|| {
            let mut map = FxHashMap::default();
            for handle in self.reader.type_definitions() {
                if let Ok(def) = self.type_def(handle) {
                    map.insert(
                        (
                            def.namespace().to_string(),
                            def.nested_path(),
                            def.generic_param_count(),
                        ),
                        handle,
                    );
                }
            }
            map
        });
        let handle = index.get(&(namespace.to_string(), path.to_string(), arity))?;
        let def = self.type_def(*handle).ok()?;
        Some(Arc::new(TsType::Definition(def)))
    }

    /// Parses a reflection name and resolves it component-wise.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ReflectionNameParse`] on grammar violations.
    pub fn find_type(&self, reflection_name: &str) -> Result<TsTypeRef> {
        parse_reflection_name(self, reflection_name)
    }

    /// Resolves a method token to a call-site view.
    ///
    /// Member references into instantiated types are matched against the
    /// definition's overloads modulo normalization; a missing member yields a
    /// fake method with the requested signature rather than an error.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error only for undecodable metadata, never for a
    /// merely unknown member.
    pub fn resolve_method(
        &self,
        token: MethodToken,
        context: &GenericContext,
        options: ResolveOptions,
    ) -> Result<MethodRefRc> {
        match token {
            MethodToken::Definition(handle) => {
                let def = self.method_def(handle)?;
                let declaring_type = Arc::new(TsType::Definition(def.declaring_type().clone()));
                Ok(Arc::new(MethodRef {
                    declaring_type,
                    name: def.name().to_string(),
                    signature: def.signature().clone(),
                    target: MethodTarget::Definition(def),
                    substitution: TypeParameterSubstitution::identity(),
                    vararg_instance: false,
                }))
            }
            MethodToken::MemberRef(handle) => self.resolve_member_ref_method(handle, context, options),
            MethodToken::Specification(handle) => {
                let record = self.reader.method_specification(handle)?;
                let base = self.resolve_method(record.method, context, options)?;
                let builder = SignatureBuilder {
                    types: self,
                    context: *context,
                    options,
                };
                let arguments = self.reader.method_spec_arguments(handle, &builder)?;
                let substitution = base.substitution.with_method_arguments(arguments);
                let signature = match &base.target {
                    MethodTarget::Definition(def) => substitution.apply_signature(def.signature()),
                    MethodTarget::Fake => substitution.apply_signature(&base.signature),
                };
                Ok(Arc::new(MethodRef {
                    target: base.target.clone(),
                    declaring_type: base.declaring_type.clone(),
                    name: base.name.clone(),
                    signature,
                    substitution,
                    vararg_instance: base.vararg_instance,
                }))
            }
        }
    }

    fn resolve_member_ref_method(
        &self,
        handle: crate::metadata::MemberRefHandle,
        context: &GenericContext,
        options: ResolveOptions,
    ) -> Result<MethodRefRc> {
        let record = self.reader.member_reference(handle)?;
        if record.is_field {
            return Err(malformed_error!(
                "member reference {} is a field, not a method",
                handle
            ));
        }
        let declaring_type = self.resolve_type(record.declaring_type, context, options)?;

        // The member-ref signature lives in the declaring type's parameter
        // space. The method parameter count is carried by the signature
        // itself, so it is left unconstrained here.
        let builder = SignatureBuilder {
            types: self,
            context: GenericContext::new(declared_arity(&declaring_type), u16::MAX),
            options,
        };
        let requested = self.reader.member_ref_signature(handle, &builder)?;

        let (target, substitution) = match &*declaring_type {
            TsType::Parameterized {
                definition,
                arguments,
            } => {
                let substitution =
                    TypeParameterSubstitution::new(arguments.clone(), Vec::new());
                match &**definition {
                    TsType::Definition(def) => (
                        self.find_overload(def, &record.name, &requested)?,
                        substitution,
                    ),
                    _ => (None, substitution),
                }
            }
            TsType::Definition(def) => (
                self.find_overload(def, &record.name, &requested)?,
                TypeParameterSubstitution::identity(),
            ),
            _ => (None, TypeParameterSubstitution::identity()),
        };

        let (target, mut signature) = match target {
            Some(method) => {
                let signature = substitution.apply_signature(method.signature());
                (MethodTarget::Definition(method), signature)
            }
            None => (MethodTarget::Fake, substitution.apply_signature(&requested)),
        };

        let vararg_instance = signature.is_vararg && options.expand_varargs;
        if vararg_instance {
            // Sentinel parameters describe the call site, so they always come
            // from the requested signature.
            signature.sentinel_params = substitution
                .apply_signature(&requested)
                .sentinel_params;
        } else {
            signature.sentinel_params.clear();
        }

        Ok(Arc::new(MethodRef {
            target,
            declaring_type,
            name: record.name,
            signature,
            substitution,
            vararg_instance,
        }))
    }

    fn find_overload(
        &self,
        def: &Arc<TypeDef>,
        name: &str,
        requested: &MethodSignature,
    ) -> Result<Option<Arc<MethodDef>>> {
        let methods = self.methods_of(def)?;
        Ok(methods
            .iter()
            .find(|method| method.name() == name && method.signature().matches(requested))
            .cloned())
    }

    /// Resolves a field token to an access-site view.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for undecodable metadata.
    pub fn resolve_field(
        &self,
        token: FieldToken,
        context: &GenericContext,
    ) -> Result<FieldRefRc> {
        match token {
            FieldToken::Definition(handle) => {
                let def = self.field_def(handle)?;
                let declaring_type = Arc::new(TsType::Definition(def.declaring_type().clone()));
                Ok(Arc::new(FieldRef {
                    declaring_type,
                    name: def.name().to_string(),
                    field_type: def.field_type().clone(),
                    target: Some(def),
                }))
            }
            FieldToken::MemberRef(handle) => {
                let record = self.reader.member_reference(handle)?;
                if !record.is_field {
                    return Err(malformed_error!(
                        "member reference {} is a method, not a field",
                        handle
                    ));
                }
                let declaring_type =
                    self.resolve_type(record.declaring_type, context, ResolveOptions::default())?;
                let builder = SignatureBuilder {
                    types: self,
                    context: GenericContext::new(declared_arity(&declaring_type), 0),
                    options: ResolveOptions::default(),
                };
                let requested = self.reader.member_ref_field_type(handle, &builder)?;

                let (target, field_type) = match &*declaring_type {
                    TsType::Definition(def) => {
                        let found = self
                            .fields_of(def)?
                            .iter()
                            .find(|field| field.name() == record.name)
                            .cloned();
                        let field_type = found
                            .as_ref()
                            .map_or_else(|| requested.clone(), |f| f.field_type().clone());
                        (found, field_type)
                    }
                    TsType::Parameterized {
                        definition,
                        arguments,
                    } => {
                        let substitution =
                            TypeParameterSubstitution::new(arguments.clone(), Vec::new());
                        let found = match &**definition {
                            TsType::Definition(def) => self
                                .fields_of(def)?
                                .iter()
                                .find(|field| field.name() == record.name)
                                .cloned(),
                            _ => None,
                        };
                        let field_type = found.as_ref().map_or_else(
                            || substitution.apply(&requested),
                            |f| substitution.apply(f.field_type()),
                        );
                        (found, field_type)
                    }
                    _ => (None, requested),
                };

                Ok(Arc::new(FieldRef {
                    target,
                    declaring_type,
                    name: record.name,
                    field_type,
                }))
            }
        }
    }

    /// Custom attributes on `owner`, decoded to type-system values.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for undecodable attribute blobs, and
    /// propagates reflection-name errors from type-valued arguments.
    pub fn attributes(&self, owner: AttributeOwner) -> Result<Vec<AttributeValue>> {
        let records = self.reader.custom_attributes(owner);
        let mut values = Vec::with_capacity(records.len());
        for record in records {
            let constructor = self.resolve_method(
                record.constructor,
                &GenericContext::empty(),
                ResolveOptions::default(),
            )?;
            let mut fixed_arguments = Vec::with_capacity(record.fixed_args.len());
            for arg in record.fixed_args {
                fixed_arguments.push(self.decode_attribute_arg(arg)?);
            }
            let mut named_arguments = Vec::with_capacity(record.named_args.len());
            for (name, arg) in record.named_args {
                named_arguments.push((name, self.decode_attribute_arg(arg)?));
            }
            values.push(AttributeValue {
                attribute_type: constructor.declaring_type.clone(),
                fixed_arguments,
                named_arguments,
            });
        }
        Ok(values)
    }

    fn decode_attribute_arg(&self, record: AttributeArgRecord) -> Result<AttributeArgument> {
        Ok(match record {
            AttributeArgRecord::Boolean(value) => AttributeArgument::Boolean(value),
            AttributeArgRecord::Int(value) => AttributeArgument::Int(value),
            AttributeArgRecord::Float(value) => AttributeArgument::Float(value),
            AttributeArgRecord::String(value) => AttributeArgument::String(value),
            AttributeArgRecord::TypeName(name) => {
                AttributeArgument::Type(self.find_type(&name)?)
            }
            AttributeArgRecord::Null => AttributeArgument::Null,
        })
    }

    /// Attributes on the assembly, cached after the first materialization.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error when the attribute blobs cannot be decoded.
    pub fn assembly_attributes(&self) -> Result<&[AttributeValue]> {
        if let Some(attrs) = self.assembly_attributes.get() {
            return Ok(attrs);
        }
        let computed = self.attributes(AttributeOwner::Assembly)?;
        Ok(self.assembly_attributes.get_or_init(|| computed))
    }

    /// Does this assembly grant internals access to `other`?
    ///
    /// Considers the `InternalsVisibleTo` attribute list; the attribute
    /// argument's public-key suffix is ignored when comparing names.
    #[must_use]
    pub fn internals_visible_to(&self, other: &TypeSystem) -> bool {
        let Ok(attributes) = self.assembly_attributes() else {
            return false;
        };
        let other_name = other.assembly_name();
        attributes.iter().any(|attr| {
            matches!(
                attr.attribute_type.named_pair(),
                Some(("System.Runtime.CompilerServices", "InternalsVisibleToAttribute"))
            ) && matches!(
                attr.fixed_arguments.first(),
                Some(AttributeArgument::String(declared))
                    if assembly_simple_name(declared) == other_name
            )
        })
    }
}

impl std::fmt::Debug for TypeSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeSystem")
            .field("assembly", &self.assembly_name())
            .field("cached_type_defs", &self.type_defs.len())
            .field("cached_methods", &self.method_defs.len())
            .finish()
    }
}

/// Splits an arity suffix off a metadata type name (`"List`1"` -> `("List", 1)`).
fn split_arity(name: &str) -> (String, u16) {
    match name.rfind('`') {
        Some(tick) => match name[tick + 1..].parse::<u16>() {
            Ok(arity) => (name[..tick].to_string(), arity),
            Err(_) => (name.to_string(), 0),
        },
        None => (name.to_string(), 0),
    }
}

/// The declared arity of the named type underlying a call-site declaring type.
fn declared_arity(ty: &TsType) -> u16 {
    match ty {
        TsType::Definition(def) => def.generic_param_count(),
        TsType::Unknown(unknown) => unknown.arity,
        TsType::Parameterized { definition, .. } => declared_arity(definition),
        _ => 0,
    }
}

/// Extracts the simple name from an `InternalsVisibleTo` argument, which may
/// carry a `, PublicKey=...` suffix.
fn assembly_simple_name(declared: &str) -> &str {
    declared.split(',').next().unwrap_or(declared).trim()
}

/// The signature-provider callback handed to the metadata reader.
///
/// Builds the core's type tree while the reader walks the signature blob.
pub(crate) struct SignatureBuilder<'a> {
    pub types: &'a TypeSystem,
    pub context: GenericContext,
    /// Carried for signatures nested inside type specifications; named-type
    /// resolution does not consult it.
    pub options: ResolveOptions,
}

impl SignatureProvider for SignatureBuilder<'_> {
    fn primitive(&self, kind: PrimitiveKind) -> TsTypeRef {
        TsType::primitive(kind)
    }

    fn from_type_def(&self, handle: TypeDefHandle) -> Result<TsTypeRef> {
        Ok(Arc::new(TsType::Definition(self.types.type_def(handle)?)))
    }

    fn from_type_ref(&self, handle: TypeRefHandle) -> Result<TsTypeRef> {
        self.types.type_ref(handle)
    }

    fn pointer_to(&self, element: TsTypeRef) -> TsTypeRef {
        Arc::new(TsType::Pointer(element))
    }

    fn by_reference(&self, element: TsTypeRef) -> TsTypeRef {
        Arc::new(TsType::ByReference(element))
    }

    fn array_of(&self, element: TsTypeRef, rank: u8) -> TsTypeRef {
        Arc::new(TsType::Array { element, rank })
    }

    fn generic_instance(
        &self,
        definition: TsTypeRef,
        arguments: Vec<TsTypeRef>,
    ) -> Result<TsTypeRef> {
        let arity = match &*definition {
            TsType::Definition(def) => def.generic_param_count(),
            TsType::Unknown(unknown) => unknown.arity,
            _ => {
                return Err(malformed_error!(
                    "generic instantiation of a non-named type"
                ))
            }
        };
        if usize::from(arity) != arguments.len() {
            return Err(malformed_error!(
                "generic instantiation with {} arguments on a type of arity {}",
                arguments.len(),
                arity
            ));
        }
        Ok(Arc::new(TsType::Parameterized {
            definition,
            arguments,
        }))
    }

    fn class_type_parameter(&self, index: u16) -> Result<TsTypeRef> {
        if !self.context.allows_class_param(index) {
            return Err(malformed_error!(
                "class type parameter {} outside the generic context",
                index
            ));
        }
        Ok(Arc::new(TsType::TypeParameter {
            owner: crate::typesystem::types::TypeParameterOwner::Class,
            index,
        }))
    }

    fn method_type_parameter(&self, index: u16) -> Result<TsTypeRef> {
        if !self.context.allows_method_param(index) {
            return Err(malformed_error!(
                "method type parameter {} outside the generic context",
                index
            ));
        }
        Ok(Arc::new(TsType::TypeParameter {
            owner: crate::typesystem::types::TypeParameterOwner::Method,
            index,
        }))
    }
}
