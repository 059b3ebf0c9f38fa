//! Optional debug-symbol provider contract.
//!
//! When a symbol file is available, the host implements [`DebugInfoProvider`]
//! to deliver per-offset sequence points and original local-variable names.
//! When it is absent (or knows nothing about a method), the core synthesizes
//! slot names (`V_0`, `V_1`, ...).

use crate::metadata::handles::MethodDefHandle;

/// A single sequence point mapping an IL offset to a source span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencePoint {
    /// IL offset of the first instruction the span covers.
    pub il_offset: u32,
    /// 1-based start line.
    pub line: u32,
    /// 1-based start column.
    pub column: u32,
    /// 1-based end line.
    pub end_line: u32,
    /// 1-based end column.
    pub end_column: u32,
    /// Hidden sequence points mark compiler-generated code.
    pub is_hidden: bool,
}

/// Debug-symbol access for a module.
pub trait DebugInfoProvider: Send + Sync {
    /// Number of sequence points recorded for `method`; zero when none exist.
    fn sequence_point_count(&self, method: MethodDefHandle) -> usize;

    /// The sequence points for `method`, ordered by IL offset.
    fn sequence_points(&self, method: MethodDefHandle) -> Vec<SequencePoint>;

    /// Original names for local-variable slots, as `(slot_index, name)` pairs.
    fn local_names(&self, method: MethodDefHandle) -> Vec<(usize, String)>;
}

/// Fetches sequence points, returning an empty list when the provider has
/// none recorded. A zero count means empty; a non-zero count means the points
/// are read.
#[must_use]
pub fn sequence_points_or_empty(
    provider: &dyn DebugInfoProvider,
    method: MethodDefHandle,
) -> Vec<SequencePoint> {
    if provider.sequence_point_count(method) == 0 {
        Vec::new()
    } else {
        provider.sequence_points(method)
    }
}

/// A provider representing "no symbol file".
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDebugInfo;

impl DebugInfoProvider for NoDebugInfo {
    fn sequence_point_count(&self, _method: MethodDefHandle) -> usize {
        0
    }

    fn sequence_points(&self, _method: MethodDefHandle) -> Vec<SequencePoint> {
        Vec::new()
    }

    fn local_names(&self, _method: MethodDefHandle) -> Vec<(usize, String)> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPoints(Vec<SequencePoint>);

    impl DebugInfoProvider for FixedPoints {
        fn sequence_point_count(&self, _method: MethodDefHandle) -> usize {
            self.0.len()
        }

        fn sequence_points(&self, _method: MethodDefHandle) -> Vec<SequencePoint> {
            self.0.clone()
        }

        fn local_names(&self, _method: MethodDefHandle) -> Vec<(usize, String)> {
            Vec::new()
        }
    }

    #[test]
    fn test_zero_count_yields_empty() {
        let provider = NoDebugInfo;
        assert!(sequence_points_or_empty(&provider, MethodDefHandle(1)).is_empty());
    }

    #[test]
    fn test_nonzero_count_reads_points() {
        let point = SequencePoint {
            il_offset: 0,
            line: 10,
            column: 1,
            end_line: 10,
            end_column: 20,
            is_hidden: false,
        };
        let provider = FixedPoints(vec![point.clone()]);
        let points = sequence_points_or_empty(&provider, MethodDefHandle(1));
        assert_eq!(points, vec![point]);
    }
}
