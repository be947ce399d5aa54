//! Read-side catalogue of the target module.
//!
//! The instrumenter plans its work against the raw metadata tables: type
//! and method names, method ownership ranges, nesting relationships, and
//! custom-attribute constructor names. All of it is extracted once into
//! owned form so the planning phase never holds borrows into the view.

use std::collections::HashMap;

use dotscope::{
    metadata::tables::{
        CustomAttributeRaw, MemberRefRaw, MetadataTable, MethodDefRaw, NestedClassRaw, TableId,
        TypeDefRaw, TypeRefRaw,
    },
    CilAssemblyView,
};

use crate::Result;

/// Name of a custom attribute's constructor type.
#[derive(Debug, Clone)]
pub(crate) struct AttributeName {
    /// Simple type name, e.g. `ExcludeFromCodeCoverageAttribute`.
    pub name: String,
    /// Namespace, possibly empty.
    pub namespace: String,
}

impl AttributeName {
    /// True when the attribute's simple or namespace-qualified name equals
    /// `candidate`.
    pub(crate) fn matches(&self, candidate: &str) -> bool {
        if self.name == candidate {
            return true;
        }
        !self.namespace.is_empty()
            && candidate.len() == self.namespace.len() + 1 + self.name.len()
            && candidate.starts_with(self.namespace.as_str())
            && candidate.ends_with(self.name.as_str())
            && candidate.as_bytes()[self.namespace.len()] == b'.'
    }
}

/// One TypeDef row, resolved.
#[derive(Debug, Clone)]
pub(crate) struct TypeInfo {
    pub rid: u32,
    pub name: String,
    pub namespace: String,
    /// First MethodDef RID owned by this type.
    pub method_list: u32,
    /// One past the last MethodDef RID owned by this type.
    pub method_end: u32,
}

/// One MethodDef row, resolved.
#[derive(Debug, Clone)]
pub(crate) struct MethodInfo {
    pub rid: u32,
    pub name: String,
    /// RID of the declaring TypeDef.
    pub type_rid: u32,
    pub rva: u32,
    pub impl_flags: u32,
}

/// Owned index over the metadata a planning pass needs.
pub(crate) struct ModuleMap {
    types: Vec<TypeInfo>,
    methods: Vec<MethodInfo>,
    /// nested TypeDef RID -> enclosing TypeDef RID.
    enclosing: HashMap<u32, u32>,
    /// attribute-parent token value -> constructor type names.
    attributes: HashMap<u32, Vec<AttributeName>>,
}

impl ModuleMap {
    /// Builds the catalogue from a loaded assembly view.
    pub(crate) fn build(view: &CilAssemblyView) -> Result<Self> {
        let Some(tables) = view.tables() else {
            return Ok(ModuleMap::empty());
        };
        let strings = view.strings();
        let read_string = |index: u32| -> String {
            if index == 0 {
                return String::new();
            }
            strings
                .and_then(|s| s.get(index as usize).ok())
                .unwrap_or_default()
                .to_string()
        };

        let method_count = tables.table_row_count(TableId::MethodDef);

        let mut types = Vec::new();
        if let Some(typedef_table) = tables.table::<TypeDefRaw>() {
            let rows: Vec<TypeDefRaw> = typedef_table.iter().collect();
            for (position, row) in rows.iter().enumerate() {
                let method_end = rows
                    .get(position + 1)
                    .map(|next| next.method_list)
                    .unwrap_or(method_count + 1);
                types.push(TypeInfo {
                    rid: row.rid,
                    name: read_string(row.type_name),
                    namespace: read_string(row.type_namespace),
                    method_list: row.method_list,
                    method_end,
                });
            }
        }

        let mut methods = Vec::new();
        if let Some(method_table) = tables.table::<MethodDefRaw>() {
            for row in method_table.iter() {
                let type_rid = types
                    .iter()
                    .find(|t| t.method_list <= row.rid && row.rid < t.method_end)
                    .map(|t| t.rid)
                    .unwrap_or(0);
                methods.push(MethodInfo {
                    rid: row.rid,
                    name: read_string(row.name),
                    type_rid,
                    rva: row.rva,
                    impl_flags: row.impl_flags,
                });
            }
        }

        let mut enclosing = HashMap::new();
        if let Some(nested_table) = tables.table::<NestedClassRaw>() {
            for row in nested_table.iter() {
                enclosing.insert(row.nested_class, row.enclosing_class);
            }
        }

        let mut attributes: HashMap<u32, Vec<AttributeName>> = HashMap::new();
        if let Some(attr_table) = tables.table::<CustomAttributeRaw>() {
            for row in attr_table.iter() {
                let Some(name) = resolve_constructor_name(
                    &row,
                    &types,
                    &methods,
                    tables.table::<TypeRefRaw>(),
                    tables.table::<MemberRefRaw>(),
                    &read_string,
                ) else {
                    continue;
                };

                let parent = token_value(row.parent.tag, row.parent.row);
                attributes.entry(parent).or_default().push(name);
            }
        }

        Ok(ModuleMap {
            types,
            methods,
            enclosing,
            attributes,
        })
    }

    fn empty() -> Self {
        ModuleMap {
            types: Vec::new(),
            methods: Vec::new(),
            enclosing: HashMap::new(),
            attributes: HashMap::new(),
        }
    }

    /// All TypeDef rows in RID order.
    pub(crate) fn types(&self) -> &[TypeInfo] {
        &self.types
    }

    pub(crate) fn type_by_rid(&self, rid: u32) -> Option<&TypeInfo> {
        self.types.get(rid.checked_sub(1)? as usize)
    }

    pub(crate) fn method_by_rid(&self, rid: u32) -> Option<&MethodInfo> {
        self.methods.get(rid.checked_sub(1)? as usize)
    }

    /// RID of the outermost declaring type, walking NestedClass upwards.
    pub(crate) fn outermost_type(&self, mut rid: u32) -> u32 {
        let mut depth = 0;
        while let Some(&outer) = self.enclosing.get(&rid) {
            rid = outer;
            depth += 1;
            if depth > 64 {
                break; // cyclic nesting in a hostile module
            }
        }
        rid
    }

    /// Namespace-qualified name of a type, nested types joined with `/`.
    pub(crate) fn full_name(&self, rid: u32) -> String {
        let Some(info) = self.type_by_rid(rid) else {
            return String::new();
        };

        let own = if info.namespace.is_empty() {
            info.name.clone()
        } else {
            format!("{}.{}", info.namespace, info.name)
        };

        match self.enclosing.get(&rid) {
            Some(&outer) if outer != rid => format!("{}/{}", self.full_name(outer), info.name),
            _ => own,
        }
    }

    /// Custom attribute constructor names attached to a TypeDef.
    pub(crate) fn type_attributes(&self, rid: u32) -> &[AttributeName] {
        self.attributes_of(token_value(TableId::TypeDef, rid))
    }

    /// Custom attribute constructor names attached to a MethodDef.
    pub(crate) fn method_attributes(&self, rid: u32) -> &[AttributeName] {
        self.attributes_of(token_value(TableId::MethodDef, rid))
    }

    fn attributes_of(&self, parent: u32) -> &[AttributeName] {
        self.attributes
            .get(&parent)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Finds a method by name inside one type.
    pub(crate) fn find_method_in_type(&self, type_rid: u32, name: &str) -> Option<&MethodInfo> {
        let info = self.type_by_rid(type_rid)?;
        (info.method_list..info.method_end)
            .filter_map(|rid| self.method_by_rid(rid))
            .find(|m| m.name == name)
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        types: Vec<TypeInfo>,
        methods: Vec<MethodInfo>,
        enclosing: HashMap<u32, u32>,
        attributes: HashMap<u32, Vec<AttributeName>>,
    ) -> Self {
        ModuleMap {
            types,
            methods,
            enclosing,
            attributes,
        }
    }
}

/// Builds a metadata token value from a table and row id.
pub(crate) fn token_value(table: TableId, row: u32) -> u32 {
    ((table as u32) << 24) | (row & 0x00FF_FFFF)
}

fn resolve_constructor_name(
    row: &CustomAttributeRaw,
    types: &[TypeInfo],
    methods: &[MethodInfo],
    typerefs: Option<&MetadataTable<'_, TypeRefRaw>>,
    memberrefs: Option<&MetadataTable<'_, MemberRefRaw>>,
    read_string: &impl Fn(u32) -> String,
) -> Option<AttributeName> {
    match row.constructor.tag {
        TableId::MethodDef => {
            let method = methods.get(row.constructor.row.checked_sub(1)? as usize)?;
            let declaring = types.get(method.type_rid.checked_sub(1)? as usize)?;
            Some(AttributeName {
                name: declaring.name.clone(),
                namespace: declaring.namespace.clone(),
            })
        }
        TableId::MemberRef => {
            let member = memberrefs?.get(row.constructor.row)?;
            match member.class.tag {
                TableId::TypeRef => {
                    let typeref = typerefs?.get(member.class.row)?;
                    Some(AttributeName {
                        name: read_string(typeref.type_name),
                        namespace: read_string(typeref.type_namespace),
                    })
                }
                TableId::TypeDef => {
                    let declaring = types.get(member.class.row.checked_sub(1)? as usize)?;
                    Some(AttributeName {
                        name: declaring.name.clone(),
                        namespace: declaring.namespace.clone(),
                    })
                }
                // Attributes constructed through TypeSpec (generic
                // instantiations) cannot opt code out of coverage.
                _ => None,
            }
        }
        _ => None,
    }
}
