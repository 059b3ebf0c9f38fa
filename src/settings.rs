//! Decompiler settings controlling which recovery passes run.
//!
//! Every optional recovery pass consults a setting and becomes a no-op when it
//! is disabled. This is a hard invariant: a user may disable any recovery, and
//! the output must then contain the equivalent low-level construct instead.
//!
//! Settings can be constructed programmatically with the builder-style `with_*`
//! setters, or loaded from `(name, value)` pairs via
//! [`DecompilerSettings::from_pairs`], which rejects unknown names at load time.

use crate::{Error, Result};

/// Settings recognized by the decompilation core.
///
/// All settings are boolean. The defaults enable every recovery pass and
/// disable the purely cosmetic options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecompilerSettings {
    /// Recover `lock (obj) { ... }` blocks from Monitor.Enter/Exit patterns.
    pub lock_statement: bool,

    /// Recover `using (res) { ... }` blocks from try/finally Dispose patterns.
    pub using_statement: bool,

    /// Recover `switch` over strings from equality cascades, hash dispatch,
    /// and dictionary lookups.
    pub switch_statement_on_string: bool,

    /// Recover `foreach` loops over arrays and enumerators.
    pub for_each_statement: bool,

    /// Recover `??` and `?.` from null-check patterns.
    pub null_propagation: bool,

    /// Unwind iterator (yield return) state machines.
    pub iterators: bool,

    /// Unwind async/await state machines.
    pub async_await: bool,

    /// Recover tuple construction and deconstruction.
    pub tuples: bool,

    /// Expand member definitions even when they could be auto-generated.
    pub expand_member_definitions: bool,

    /// Attach debug information (sequence points, original slot names) to output.
    pub show_debug_info: bool,

    /// Attach XML documentation to emitted members.
    pub show_xml_documentation: bool,

    /// Suppress metadata tables with no rows in metadata views.
    pub hide_empty_metadata_tables: bool,
}

impl Default for DecompilerSettings {
    fn default() -> Self {
        Self {
            lock_statement: true,
            using_statement: true,
            switch_statement_on_string: true,
            for_each_statement: true,
            null_propagation: true,
            iterators: true,
            async_await: true,
            tuples: true,
            expand_member_definitions: false,
            show_debug_info: false,
            show_xml_documentation: false,
            hide_empty_metadata_tables: true,
        }
    }
}

impl DecompilerSettings {
    /// Creates settings with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates settings with every recovery pass disabled.
    ///
    /// Useful for inspecting the low-level IL view of a method, and for tests
    /// that verify the settings gate.
    #[must_use]
    pub fn low_level() -> Self {
        Self {
            lock_statement: false,
            using_statement: false,
            switch_statement_on_string: false,
            for_each_statement: false,
            null_propagation: false,
            iterators: false,
            async_await: false,
            tuples: false,
            ..Self::default()
        }
    }

    /// Loads settings from `(name, value)` pairs.
    ///
    /// Names use the canonical PascalCase spelling (`"LockStatement"`,
    /// `"SwitchStatementOnString"`, ...). Unknown names are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSetting`] for a name outside the recognized set.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, bool)>,
    {
        let mut settings = Self::default();
        for (name, value) in pairs {
            settings.set(name, value)?;
        }
        Ok(settings)
    }

    /// Sets a single setting by its canonical name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSetting`] if the name is not recognized.
    pub fn set(&mut self, name: &str, value: bool) -> Result<()> {
        match name {
            "LockStatement" => self.lock_statement = value,
            "UsingStatement" => self.using_statement = value,
            "SwitchStatementOnString" => self.switch_statement_on_string = value,
            "ForEachStatement" => self.for_each_statement = value,
            "NullPropagation" => self.null_propagation = value,
            "Iterators" => self.iterators = value,
            "AsyncAwait" => self.async_await = value,
            "Tuples" => self.tuples = value,
            "ExpandMemberDefinitions" => self.expand_member_definitions = value,
            "ShowDebugInfo" => self.show_debug_info = value,
            "ShowXmlDocumentation" => self.show_xml_documentation = value,
            "HideEmptyMetadataTables" => self.hide_empty_metadata_tables = value,
            other => return Err(Error::UnknownSetting(other.to_string())),
        }
        Ok(())
    }

    /// Enables or disables lock-statement recovery.
    #[must_use]
    pub fn with_lock_statement(mut self, enable: bool) -> Self {
        self.lock_statement = enable;
        self
    }

    /// Enables or disables using-statement recovery.
    #[must_use]
    pub fn with_using_statement(mut self, enable: bool) -> Self {
        self.using_statement = enable;
        self
    }

    /// Enables or disables switch-on-string recovery.
    #[must_use]
    pub fn with_switch_statement_on_string(mut self, enable: bool) -> Self {
        self.switch_statement_on_string = enable;
        self
    }

    /// Enables or disables null-propagation recovery.
    #[must_use]
    pub fn with_null_propagation(mut self, enable: bool) -> Self {
        self.null_propagation = enable;
        self
    }

    /// Enables or disables debug-information output.
    #[must_use]
    pub fn with_show_debug_info(mut self, enable: bool) -> Self {
        self.show_debug_info = enable;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = DecompilerSettings::default();
        assert!(settings.lock_statement);
        assert!(settings.switch_statement_on_string);
        assert!(settings.null_propagation);
        assert!(!settings.expand_member_definitions);
        assert!(!settings.show_debug_info);
        assert!(settings.hide_empty_metadata_tables);
    }

    #[test]
    fn test_from_pairs() {
        let settings =
            DecompilerSettings::from_pairs([("LockStatement", false), ("ShowDebugInfo", true)])
                .unwrap();
        assert!(!settings.lock_statement);
        assert!(settings.show_debug_info);
        // Untouched settings keep their defaults
        assert!(settings.using_statement);
    }

    #[test]
    fn test_unknown_setting_rejected() {
        let err = DecompilerSettings::from_pairs([("NoSuchSetting", true)]).unwrap_err();
        assert!(matches!(err, Error::UnknownSetting(name) if name == "NoSuchSetting"));
    }

    #[test]
    fn test_builder_pattern() {
        let settings = DecompilerSettings::new()
            .with_lock_statement(false)
            .with_null_propagation(false);
        assert!(!settings.lock_statement);
        assert!(!settings.null_propagation);
        assert!(settings.tuples);
    }

    #[test]
    fn test_low_level_disables_recoveries() {
        let settings = DecompilerSettings::low_level();
        assert!(!settings.lock_statement);
        assert!(!settings.switch_statement_on_string);
        assert!(!settings.iterators);
        // Cosmetic options keep their defaults
        assert!(settings.hide_empty_metadata_tables);
    }
}
