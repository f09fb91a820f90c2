//! Loading IR files from disk, following `imports` across a search path.
//!
//! Imports resolve relative to the importing file first, then against
//! the configured search directories. The DFS detects cycles, and after
//! all dependencies are visited their `types` and `enums` merge into the
//! root spec in DFS post-order. Only the merged result is validated.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tracing::debug;

use crate::error::{IrError, Result};
use crate::spec::Spec;
use crate::text::{deserialize, parse_unvalidated};
use crate::validate::validate;

/// Load and validate a single IR file, ignoring its imports.
pub fn load_from_file(path: &Path) -> Result<Spec> {
    let encoded = fs::read_to_string(path)
        .map_err(|_| IrError::OpenFile(path.display().to_string()))?;
    deserialize(&encoded)
}

/// Load an IR file, resolve its transitive imports and merge their
/// symbols into one validated spec.
pub fn load_with_imports(path: &Path, import_paths: &[PathBuf]) -> Result<Spec> {
    let root = canonical_or_self(path);

    let mut state = LoadState {
        loaded: IndexMap::new(),
        visiting: HashSet::new(),
        stack: Vec::new(),
    };
    visit(&root, &mut state, import_paths)?;

    let mut merged = state.loaded[&root].clone();
    let mut seen_types: HashSet<String> = HashSet::new();
    let mut seen_enums: HashSet<String> = HashSet::new();
    seen_types.insert(merged.name.clone());
    for t in &merged.types {
        seen_types.insert(t.name.clone());
    }
    for e in &merged.enums {
        seen_enums.insert(e.name.clone());
    }

    let mut merged_files: HashSet<PathBuf> = HashSet::new();
    merge_deps(
        &root,
        &state.loaded,
        import_paths,
        &mut merged,
        &mut merged_files,
        &mut seen_types,
        &mut seen_enums,
    )?;

    validate(&merged)?;
    Ok(merged)
}

struct LoadState {
    loaded: IndexMap<PathBuf, Spec>,
    visiting: HashSet<PathBuf>,
    stack: Vec<PathBuf>,
}

fn visit(path: &Path, state: &mut LoadState, import_paths: &[PathBuf]) -> Result<()> {
    if state.loaded.contains_key(path) {
        return Ok(());
    }
    if !state.visiting.insert(path.to_path_buf()) {
        let mut chain: Vec<String> = state
            .stack
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        chain.push(path.display().to_string());
        return Err(IrError::ImportCycle(chain.join(" -> ")));
    }
    state.stack.push(path.to_path_buf());
    debug!(file = %path.display(), "loading IR module");

    let encoded = fs::read_to_string(path)
        .map_err(|_| IrError::OpenFile(path.display().to_string()))?;
    let spec = parse_unvalidated(&encoded)?;

    for import in &spec.imports {
        let resolved = resolve_import(import, path, import_paths)?;
        visit(&resolved, state, import_paths)?;
    }

    state.loaded.insert(path.to_path_buf(), spec);
    state.stack.pop();
    state.visiting.remove(path);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn merge_deps(
    path: &Path,
    loaded: &IndexMap<PathBuf, Spec>,
    import_paths: &[PathBuf],
    merged: &mut Spec,
    merged_files: &mut HashSet<PathBuf>,
    seen_types: &mut HashSet<String>,
    seen_enums: &mut HashSet<String>,
) -> Result<()> {
    let spec = &loaded[path];
    for import in &spec.imports {
        let resolved = resolve_import(import, path, import_paths)?;
        if !merged_files.insert(resolved.clone()) {
            continue;
        }
        merge_deps(
            &resolved,
            loaded,
            import_paths,
            merged,
            merged_files,
            seen_types,
            seen_enums,
        )?;

        let dep = &loaded[&resolved];
        if !seen_types.insert(dep.name.clone()) {
            return Err(IrError::DuplicateSymbol {
                kind: "type",
                name: dep.name.clone(),
            });
        }
        for t in &dep.types {
            if !seen_types.insert(t.name.clone()) {
                return Err(IrError::DuplicateSymbol {
                    kind: "type",
                    name: t.name.clone(),
                });
            }
            merged.types.push(t.clone());
        }
        for e in &dep.enums {
            if !seen_enums.insert(e.name.clone()) {
                return Err(IrError::DuplicateSymbol {
                    kind: "enum",
                    name: e.name.clone(),
                });
            }
            merged.enums.push(e.clone());
        }
    }
    Ok(())
}

fn resolve_import(
    import_name: &str,
    current_file: &Path,
    import_paths: &[PathBuf],
) -> Result<PathBuf> {
    let normalized = import_name.replace('\\', "/");
    let normalized = Path::new(&normalized);

    let mut candidates: Vec<PathBuf> = Vec::new();
    if normalized.is_absolute() {
        candidates.push(normalized.to_path_buf());
    } else {
        if let Some(parent) = current_file.parent() {
            candidates.push(parent.join(normalized));
        }
        for base in import_paths {
            if base.as_os_str().is_empty() {
                continue;
            }
            candidates.push(base.join(normalized));
        }
    }

    for candidate in candidates {
        if candidate.exists() {
            return Ok(canonical_or_self(&candidate));
        }
    }
    Err(IrError::ImportNotFound {
        name: import_name.to_string(),
        from: current_file.display().to_string(),
    })
}

fn canonical_or_self(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
