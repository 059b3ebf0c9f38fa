//! Metadata ingestion boundary.
//!
//! The core never touches Portable-Executable bytes. Everything it knows
//! about an assembly arrives through the contracts in this module:
//!
//! - [`MetadataReader`] - typed rows, decoded signatures (driven through the
//!   [`SignatureProvider`] callback), and raw method bodies;
//! - [`DebugInfoProvider`] - optional sequence points and local names;
//! - the handle vocabulary in [`handles`].

mod debuginfo;
mod handles;
mod reader;

pub use debuginfo::{
    sequence_points_or_empty, DebugInfoProvider, NoDebugInfo, SequencePoint,
};
pub use handles::{
    AttributeOwner, FieldHandle, FieldToken, MemberRefHandle, MethodDefHandle, MethodSpecHandle,
    MethodToken, TypeDefHandle, TypeRefHandle, TypeSpecHandle, TypeToken,
};
pub use reader::{
    AttributeArgRecord, AttributeRecord, ExceptionRegion, ExceptionRegionKind, FieldRecord,
    MemberRefRecord, MetadataReader, MethodBodyData, MethodDefRecord, MethodSpecRecord,
    SignatureProvider, TypeDefRecord, TypeRefRecord,
};
