//! Instrumentation eligibility: glob filters, opt-out attributes,
//! excluded source files.
//!
//! Eligibility is decided on the *outermost* declaring type: a nested
//! type inherits exclusion from the type it is lexically contained in.
//! Methods can additionally opt out individually, and compiler-lifted
//! local functions inherit the attributes of the method they were lifted
//! from.

use std::collections::HashSet;

use glob::Pattern;

use crate::{
    module::ModuleMap,
    tracker::TRACKER_NAMESPACE,
    Error, Result,
};

/// Attribute type names that opt a type or method out of coverage, with
/// and without the conventional `Attribute` suffix.
const OPT_OUT_ATTRIBUTES: [&str; 4] = [
    "ExcludeFromCoverageAttribute",
    "ExcludeFromCoverage",
    "ExcludeFromCodeCoverageAttribute",
    "ExcludeFromCodeCoverage",
];

/// Compiled include/exclude configuration.
pub struct Filter {
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
    excluded_files: HashSet<String>,
}

impl Filter {
    /// Compiles filter patterns.
    ///
    /// Patterns are glob expressions matched against namespace-qualified
    /// type names (`My.Namespace.MyType`). `excluded_files` are source
    /// paths compared verbatim against document paths from the symbols.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFilter`] for a pattern that does not
    /// compile.
    pub fn new(
        exclude_filters: &[String],
        include_filters: &[String],
        excluded_files: &[String],
    ) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Pattern>> {
            patterns
                .iter()
                .map(|p| {
                    Pattern::new(p).map_err(|e| Error::InvalidFilter {
                        pattern: p.clone(),
                        message: e.to_string(),
                    })
                })
                .collect()
        };

        Ok(Filter {
            includes: compile(include_filters)?,
            excludes: compile(exclude_filters)?,
            excluded_files: excluded_files.iter().cloned().collect(),
        })
    }

    /// True when the type with the given TypeDef RID is subject to
    /// instrumentation.
    pub(crate) fn is_type_instrumented(&self, module: &ModuleMap, type_rid: u32) -> bool {
        let outer_rid = module.outermost_type(type_rid);
        let Some(outer) = module.type_by_rid(outer_rid) else {
            return false;
        };

        if outer.namespace.starts_with(TRACKER_NAMESPACE) {
            return false;
        }

        if has_opt_out(module.type_attributes(outer_rid)) {
            return false;
        }

        let fqn = if outer.namespace.is_empty() {
            outer.name.clone()
        } else {
            format!("{}.{}", outer.namespace, outer.name)
        };

        if self.excludes.iter().any(|p| p.matches(&fqn)) {
            return false;
        }

        if !self.includes.is_empty() && !self.includes.iter().any(|p| p.matches(&fqn)) {
            return false;
        }

        true
    }

    /// True when the method with the given MethodDef RID is subject to
    /// instrumentation. Assumes the declaring type already passed
    /// [`Filter::is_type_instrumented`].
    pub(crate) fn is_method_instrumented(&self, module: &ModuleMap, method_rid: u32) -> bool {
        let Some(method) = module.method_by_rid(method_rid) else {
            return false;
        };

        if has_opt_out(module.method_attributes(method_rid)) {
            return false;
        }

        // A local function `<Outer>g__Inner|x_y` was lifted out of
        // `Outer`; it inherits that method's attributes. The name shape
        // is a compiler convention, so this is best-effort.
        if let Some(outer_name) = enclosing_method_name(&method.name) {
            if let Some(outer) = module.find_method_in_type(method.type_rid, outer_name) {
                if has_opt_out(module.method_attributes(outer.rid)) {
                    return false;
                }
            }
        }

        true
    }

    /// True when a source document is on the excluded-files list.
    pub(crate) fn is_file_excluded(&self, document_path: &str) -> bool {
        self.excluded_files.contains(document_path)
    }
}

fn has_opt_out(attributes: &[crate::module::AttributeName]) -> bool {
    attributes
        .iter()
        .any(|attr| OPT_OUT_ATTRIBUTES.iter().any(|name| attr.matches(name)))
}

/// Extracts `Outer` from a lifted local-function name `<Outer>g__Inner|x_y`.
fn enclosing_method_name(method_name: &str) -> Option<&str> {
    let rest = method_name.strip_prefix('<')?;
    let end = rest.find('>')?;
    if end == 0 {
        return None;
    }
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{AttributeName, MethodInfo, ModuleMap, TypeInfo};
    use std::collections::HashMap;

    fn type_info(rid: u32, namespace: &str, name: &str) -> TypeInfo {
        TypeInfo {
            rid,
            name: name.to_string(),
            namespace: namespace.to_string(),
            method_list: 1,
            method_end: 100,
        }
    }

    fn method_info(rid: u32, type_rid: u32, name: &str) -> MethodInfo {
        MethodInfo {
            rid,
            name: name.to_string(),
            type_rid,
            rva: 0x2000,
            impl_flags: 0,
        }
    }

    fn opt_out() -> AttributeName {
        AttributeName {
            name: "ExcludeFromCodeCoverageAttribute".to_string(),
            namespace: "System.Diagnostics.CodeAnalysis".to_string(),
        }
    }

    fn module(
        types: Vec<TypeInfo>,
        methods: Vec<MethodInfo>,
        enclosing: HashMap<u32, u32>,
        attributes: HashMap<u32, Vec<AttributeName>>,
    ) -> ModuleMap {
        ModuleMap::from_parts(types, methods, enclosing, attributes)
    }

    fn empty_filter() -> Filter {
        Filter::new(&[], &[], &[]).unwrap()
    }

    #[test]
    fn plain_type_is_instrumented_by_default() {
        let m = module(vec![type_info(1, "App", "Widget")], vec![], HashMap::new(), HashMap::new());
        assert!(empty_filter().is_type_instrumented(&m, 1));
    }

    #[test]
    fn opt_out_attribute_excludes_type_and_nested_types() {
        let mut attributes = HashMap::new();
        attributes.insert(0x0200_0001, vec![opt_out()]);
        let mut enclosing = HashMap::new();
        enclosing.insert(2, 1);

        let m = module(
            vec![type_info(1, "App", "Outer"), type_info(2, "", "Inner")],
            vec![],
            enclosing,
            attributes,
        );

        let filter = empty_filter();
        assert!(!filter.is_type_instrumented(&m, 1));
        // Nested types inherit exclusion through outermost lookup.
        assert!(!filter.is_type_instrumented(&m, 2));
    }

    #[test]
    fn tracker_namespace_is_reserved() {
        let m = module(
            vec![type_info(1, TRACKER_NAMESPACE, "Widget_abc")],
            vec![],
            HashMap::new(),
            HashMap::new(),
        );
        assert!(!empty_filter().is_type_instrumented(&m, 1));
    }

    #[test]
    fn exclude_wins_over_include() {
        let m = module(vec![type_info(1, "App", "Widget")], vec![], HashMap::new(), HashMap::new());

        let filter =
            Filter::new(&["App.*".to_string()], &["App.Widget".to_string()], &[]).unwrap();
        assert!(!filter.is_type_instrumented(&m, 1));
    }

    #[test]
    fn include_list_restricts_when_present() {
        let m = module(
            vec![type_info(1, "App", "Widget"), type_info(2, "Lib", "Helper")],
            vec![],
            HashMap::new(),
            HashMap::new(),
        );

        let filter = Filter::new(&[], &["App.*".to_string()], &[]).unwrap();
        assert!(filter.is_type_instrumented(&m, 1));
        assert!(!filter.is_type_instrumented(&m, 2));
    }

    #[test]
    fn method_opt_out_excludes_method_only() {
        let mut attributes = HashMap::new();
        attributes.insert(0x0600_0002, vec![opt_out()]);

        let m = module(
            vec![type_info(1, "App", "Widget")],
            vec![method_info(1, 1, "Covered"), method_info(2, 1, "NotCovered")],
            HashMap::new(),
            attributes,
        );

        let filter = empty_filter();
        assert!(filter.is_method_instrumented(&m, 1));
        assert!(!filter.is_method_instrumented(&m, 2));
    }

    #[test]
    fn local_function_inherits_outer_method_opt_out() {
        let mut attributes = HashMap::new();
        attributes.insert(0x0600_0001, vec![opt_out()]);

        let m = module(
            vec![type_info(1, "App", "Widget")],
            vec![
                method_info(1, 1, "Outer"),
                method_info(2, 1, "<Outer>g__Inner|0_0"),
                method_info(3, 1, "<Missing>g__Orphan|0_0"),
            ],
            HashMap::new(),
            attributes,
        );

        let filter = empty_filter();
        assert!(!filter.is_method_instrumented(&m, 2));
        // No matching outer method: the local function stands alone.
        assert!(filter.is_method_instrumented(&m, 3));
    }

    #[test]
    fn excluded_files_are_exact_matches() {
        let filter = Filter::new(&[], &[], &["src/generated.cs".to_string()]).unwrap();
        assert!(filter.is_file_excluded("src/generated.cs"));
        assert!(!filter.is_file_excluded("src/widgets.cs"));
    }

    #[test]
    fn enclosing_method_names() {
        assert_eq!(enclosing_method_name("<Outer>g__Inner|0_0"), Some("Outer"));
        assert_eq!(enclosing_method_name("Ordinary"), None);
        assert_eq!(enclosing_method_name("<>c__DisplayClass0_0"), None);
    }
}
