//! Reflection-name parsing and printing.
//!
//! The grammar is the ECMA-335-adjacent canonical form:
//!
//! - nested-type separator `+`, generic arity suffix `` ` `` + digits;
//! - bound generic arguments `[[T1],[T2],...]`, each optionally followed by
//!   `, AssemblyName` which is accepted and ignored;
//! - type-parameter references `` `N `` (class) and ```` ``N ```` (method);
//! - array specifiers `[]`, `[,]`, ... composing right-to-left;
//! - pointer `*`; by-reference `&`, which must be outermost.
//!
//! Parsing is strict: an empty name, a bare backtick, an unterminated
//! bracket, a trailing `+`, a non-digit arity, or any suffix after `&` raise
//! [`Error::ReflectionNameParse`] with the offending position.

use std::sync::Arc;

use crate::{
    typesystem::types::{PrimitiveKind, TsType, TsTypeRef, TypeParameterOwner, UnknownType},
    typesystem::TypeSystem,
    Error, Result,
};

/// Parses a reflection name against a type system.
///
/// Names that resolve to definitions in the module come back as
/// [`TsType::Definition`]; well-known `System.*` names become primitives;
/// everything else is [`TsType::Unknown`] with the parsed identity.
///
/// # Errors
///
/// Returns [`Error::ReflectionNameParse`] on any grammar violation.
pub fn parse_reflection_name(types: &TypeSystem, name: &str) -> Result<TsTypeRef> {
    let mut parser = Parser {
        bytes: name.as_bytes(),
        pos: 0,
        types,
    };
    let parsed = parser.parse_type()?;
    if parser.pos != parser.bytes.len() {
        return Err(parser.error("unexpected trailing characters"));
    }
    Ok(parsed)
}

/// Formats a type in the canonical reflection-name form.
///
/// Assembly names are never emitted, so the output of
/// [`parse_reflection_name`] round-trips bit-exactly.
#[must_use]
pub fn format_reflection_name(ty: &TsType) -> String {
    let mut out = String::new();
    write_name(ty, &mut out);
    out
}

fn write_name(ty: &TsType, out: &mut String) {
    match ty {
        TsType::Primitive(kind) => {
            out.push_str("System.");
            out.push_str(kind.system_name());
        }
        TsType::Definition(def) => {
            if !def.namespace().is_empty() {
                out.push_str(def.namespace());
                out.push('.');
            }
            out.push_str(&def.nested_path());
            if def.generic_param_count() > 0 {
                out.push('`');
                out.push_str(&def.generic_param_count().to_string());
            }
        }
        TsType::Unknown(unknown) => {
            if !unknown.namespace.is_empty() {
                out.push_str(&unknown.namespace);
                out.push('.');
            }
            out.push_str(&unknown.name);
            if unknown.arity > 0 {
                out.push('`');
                out.push_str(&unknown.arity.to_string());
            }
        }
        TsType::Parameterized {
            definition,
            arguments,
        } => {
            write_name(definition, out);
            out.push('[');
            for (position, argument) in arguments.iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                out.push('[');
                write_name(argument, out);
                out.push(']');
            }
            out.push(']');
        }
        TsType::TypeParameter { owner, index } => {
            match owner {
                TypeParameterOwner::Class => out.push('`'),
                TypeParameterOwner::Method => out.push_str("``"),
            }
            out.push_str(&index.to_string());
        }
        TsType::Pointer(element) => {
            write_name(element, out);
            out.push('*');
        }
        TsType::ByReference(element) => {
            write_name(element, out);
            out.push('&');
        }
        TsType::Array { element, rank } => {
            write_name(element, out);
            out.push('[');
            for _ in 1..*rank {
                out.push(',');
            }
            out.push(']');
        }
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    types: &'a TypeSystem,
}

impl<'a> Parser<'a> {
    fn error(&self, message: &str) -> Error {
        Error::ReflectionNameParse {
            message: message.to_string(),
            position: self.pos,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek();
        if byte.is_some() {
            self.pos += 1;
        }
        byte
    }

    /// Parses a complete type at the current position, including suffixes.
    /// Stops at `]` or `,`, which belong to an enclosing argument list.
    fn parse_type(&mut self) -> Result<TsTypeRef> {
        let mut ty = if self.peek() == Some(b'`') {
            self.parse_type_parameter()?
        } else {
            self.parse_named()?
        };

        // Bound generic arguments attach once, before array/pointer suffixes.
        if self.peek() == Some(b'[') && self.bytes.get(self.pos + 1) == Some(&b'[') {
            let arguments = self.parse_generic_arguments()?;
            ty = Arc::new(TsType::Parameterized {
                definition: ty,
                arguments,
            });
        }

        loop {
            match self.peek() {
                Some(b'[') => ty = self.parse_array_suffix(ty)?,
                Some(b'*') => {
                    self.bump();
                    ty = Arc::new(TsType::Pointer(ty));
                }
                Some(b'&') => {
                    self.bump();
                    if self.peek().is_some_and(|b| b != b']' && b != b',') {
                        return Err(self.error("no suffix may follow '&'"));
                    }
                    return Ok(Arc::new(TsType::ByReference(ty)));
                }
                _ => return Ok(ty),
            }
        }
    }

    fn parse_type_parameter(&mut self) -> Result<TsTypeRef> {
        self.bump(); // consume '`'
        let owner = if self.peek() == Some(b'`') {
            self.bump();
            TypeParameterOwner::Method
        } else {
            TypeParameterOwner::Class
        };
        let index = self.parse_digits()?;
        Ok(Arc::new(TsType::TypeParameter { owner, index }))
    }

    fn parse_digits(&mut self) -> Result<u16> {
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.bump();
        }
        if self.pos == start {
            return Err(self.error("expected digits after '`'"));
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| self.error("arity out of range"))
    }

    /// Parses `Namespace.Name`n(+Nested`m)*` and resolves it.
    fn parse_named(&mut self) -> Result<TsTypeRef> {
        let first = self.parse_segment()?;
        let (namespace, name) = match first.0.rfind('.') {
            Some(dot) => (first.0[..dot].to_string(), first.0[dot + 1..].to_string()),
            None => (String::new(), first.0),
        };
        if name.is_empty() {
            return Err(self.error("empty type name"));
        }

        let mut path = name;
        let mut arity = first.1;
        while self.peek() == Some(b'+') {
            self.bump();
            let segment = self.parse_segment()?;
            if segment.0.is_empty() {
                return Err(self.error("trailing '+'"));
            }
            path.push('+');
            path.push_str(&segment.0);
            arity += segment.1;
        }

        Ok(self.resolve_named(namespace, path, arity))
    }

    /// Parses one identifier with an optional arity suffix.
    fn parse_segment(&mut self) -> Result<(String, u16)> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| !matches!(b, b'+' | b'`' | b'[' | b']' | b',' | b'*' | b'&'))
        {
            self.bump();
        }
        let ident = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.error("invalid identifier"))?
            .to_string();
        if ident.is_empty() {
            // The caller distinguishes "empty name" from "trailing '+'".
            return Ok((ident, 0));
        }

        let arity = if self.peek() == Some(b'`') {
            self.bump();
            self.parse_digits()?
        } else {
            0
        };
        Ok((ident, arity))
    }

    fn resolve_named(&self, namespace: String, path: String, arity: u16) -> TsTypeRef {
        if arity == 0 && !path.contains('+') {
            if let Some(kind) = PrimitiveKind::from_system_name(&namespace, &path) {
                return TsType::primitive(kind);
            }
        }
        if let Some(found) = self.types.lookup_named(&namespace, &path, arity) {
            return found;
        }
        Arc::new(TsType::Unknown(UnknownType {
            namespace,
            name: path,
            arity,
        }))
    }

    fn parse_generic_arguments(&mut self) -> Result<Vec<TsTypeRef>> {
        self.bump(); // outer '['
        let mut arguments = Vec::new();
        loop {
            if self.bump() != Some(b'[') {
                return Err(self.error("expected '[' before generic argument"));
            }
            arguments.push(self.parse_type()?);

            // Optional ", AssemblyName" - accepted and ignored.
            if self.peek() == Some(b',') {
                while self.peek().is_some_and(|b| b != b']') {
                    if self.peek() == Some(b'[') {
                        return Err(self.error("unexpected '[' in assembly name"));
                    }
                    self.bump();
                }
            }
            if self.bump() != Some(b']') {
                return Err(self.error("unterminated bracket"));
            }

            match self.bump() {
                Some(b',') => continue,
                Some(b']') => return Ok(arguments),
                _ => return Err(self.error("unterminated bracket")),
            }
        }
    }

    fn parse_array_suffix(&mut self, element: TsTypeRef) -> Result<TsTypeRef> {
        self.bump(); // '['
        let mut rank: u16 = 1;
        loop {
            match self.bump() {
                Some(b',') => rank += 1,
                Some(b']') => break,
                Some(_) => return Err(self.error("invalid array specifier")),
                None => return Err(self.error("unterminated bracket")),
            }
        }
        if rank > u16::from(u8::MAX) {
            return Err(self.error("array rank out of range"));
        }
        Ok(Arc::new(TsType::Array {
            element,
            rank: rank as u8,
        }))
    }
}
