//! Script Cache
//!
//! Two keyed stores in front of script execution: raw source → transformed
//! source, and finalized text (transformed + `\nmain()`) → prepared program.
//! Both are hard-capped; on overflow the whole map is cleared; compilation
//! cost is amortised and the hit rate stays high, so the simplification is
//! acceptable. `get_or_compute` gives at most one transform per unique source
//! per clear cycle regardless of concurrent requests.

use std::sync::Arc;

use super::resource::TtlCache;

/// Suffix appended to every transformed script before execution
pub const MAIN_CALL: &str = "\nmain()";

/// A script prepared for repeated execution.
///
/// QuickJS parses per eval; the amortised cost the program cache protects is
/// the transform and module resolution that produced this text.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub source: Arc<String>,
}

/// Two-level transform/program cache
pub struct ScriptCache {
    transforms: TtlCache<String, Arc<String>>,
    programs: TtlCache<String, Arc<CompiledProgram>>,
    cap: usize,
}

impl ScriptCache {
    pub fn new(cap: usize) -> Self {
        Self {
            transforms: TtlCache::new(None),
            programs: TtlCache::new(None),
            cap: cap.max(1),
        }
    }

    /// Transformed source for a raw script, computed at most once per source
    /// text per clear cycle.
    pub fn get_or_transform(&self, source: &str) -> Arc<String> {
        if self.transforms.len() >= self.cap {
            tracing::debug!(cap = self.cap, "transform cache full, clearing");
            self.transforms.clear();
        }
        match self
            .transforms
            .get_or_compute(source.to_string(), || -> Result<Arc<String>, std::convert::Infallible> {
                Ok(Arc::new(transform_source(source)))
            }) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Prepared program for a transformed script (the `\nmain()` call is the
    /// cache key suffix).
    pub fn get_or_compile(&self, transformed: &str) -> Arc<CompiledProgram> {
        if self.programs.len() >= self.cap {
            tracing::debug!(cap = self.cap, "program cache full, clearing");
            self.programs.clear();
        }
        let key = format!("{}{}", transformed, MAIN_CALL);
        match self
            .programs
            .get_or_compute(key.clone(), || -> Result<Arc<CompiledProgram>, std::convert::Infallible> {
                Ok(Arc::new(CompiledProgram {
                    source: Arc::new(key.clone()),
                }))
            }) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    pub fn clear(&self) {
        self.transforms.clear();
        self.programs.clear();
    }

    pub fn transform_count(&self) -> usize {
        self.transforms.len()
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }
}

/// Normalise a user script for execution.
///
/// Strips the UTF-8 BOM, normalises CRLF, and wraps bare snippets that do not
/// define `main` into a `function main() { ... }` body so inline code blocks
/// can omit the boilerplate.
pub fn transform_source(source: &str) -> String {
    let source = source.strip_prefix('\u{feff}').unwrap_or(source);
    let source = source.replace("\r\n", "\n");
    if defines_main(&source) {
        source
    } else {
        format!("function main() {{\n{}\n}}", source)
    }
}

fn defines_main(source: &str) -> bool {
    source.contains("function main")
        || source.contains("main =")
        || source.contains("main=")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_preserves_main() {
        let src = "function main() { payload.x = 1; }";
        assert_eq!(transform_source(src), src);
    }

    #[test]
    fn test_transform_wraps_bare_snippet() {
        let out = transform_source("payload.x = 1;");
        assert!(out.starts_with("function main() {"));
        assert!(out.contains("payload.x = 1;"));
    }

    #[test]
    fn test_transform_normalises() {
        let out = transform_source("\u{feff}function main() {\r\n}\r\n");
        assert!(!out.contains('\u{feff}'));
        assert!(!out.contains('\r'));
    }

    #[test]
    fn test_same_program_until_clear() {
        let cache = ScriptCache::new(16);
        let transformed = cache.get_or_transform("function main(){}");
        let first = cache.get_or_compile(&transformed);
        let second = cache.get_or_compile(&transformed);
        assert!(Arc::ptr_eq(&first, &second));

        cache.clear();
        let third = cache.get_or_compile(&transformed);
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(first.source.as_str(), third.source.as_str());
    }

    #[test]
    fn test_program_key_appends_main_call() {
        let cache = ScriptCache::new(16);
        let program = cache.get_or_compile("function main(){}");
        assert!(program.source.ends_with(MAIN_CALL));
    }

    #[test]
    fn test_overflow_clears_whole_map() {
        let cache = ScriptCache::new(2);
        cache.get_or_transform("a()");
        cache.get_or_transform("b()");
        assert_eq!(cache.transform_count(), 2);
        // Third insert trips the cap and starts a new cycle.
        cache.get_or_transform("c()");
        assert_eq!(cache.transform_count(), 1);
    }
}
