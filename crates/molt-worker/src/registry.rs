//! Export manifest parsing, the compiled-entries reconciliation file, and
//! resolution of an incoming entry name to a handler.
//!
//! The manifest is the client-visible contract of what a worker *claims*
//! to serve; the compiled-entries file additionally says which of those
//! names have a real, non-demo handler wired in. A manifest name with
//! neither a built-in handler nor a compiled entry is a packaging
//! mistake, not a caller error, so it surfaces as `InternalError`.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use molt_wire::Codec;
use serde::Deserialize;
use thiserror::Error;

/// Major ABI version this binary implements. A manifest declaring a
/// different major version is rejected outright; minor/patch are
/// informational only.
pub const RUNTIME_ABI_MAJOR: u32 = 1;

const RESERVED_PREFIX: &str = "__";

/// The demo/built-in entries every worker binary serves without needing a
/// compiled-entries file, plus the two DB entries this crate adds.
pub const BUILTIN_ENTRIES: &[&str] = &["health", "list", "compute", "offload_table", "db_query", "db_exec"];

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read manifest at {path}: {source}")]
    ReadManifest {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest at {path}: {source}")]
    ParseManifest {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to parse compiled-exports file at {path}: {source}")]
    ParseCompiled {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest abi_version '{manifest}' is incompatible with worker RUNTIME_ABI_MAJOR {worker}")]
    AbiMismatch { manifest: String, worker: u32 },
    #[error("manifest abi_version '{0}' is not a valid dotted version string")]
    MalformedAbiVersion(String),
    #[error("entry name '{0}' uses the reserved '__' prefix")]
    ReservedName(String),
    #[error("duplicate entry name '{0}' in manifest")]
    DuplicateEntry(String),
    #[error("entry '{0}' declares unknown codec '{1}'")]
    UnknownCodec(String, String),
}

/// A single exported entry as declared in the manifest file.
#[derive(Clone, Debug, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub codec_in: String,
    pub codec_out: String,
}

#[derive(Clone, Debug, Deserialize)]
struct ExportsManifestFile {
    /// A dotted version string (e.g. `"1.0"`); only the leading major
    /// component is checked for compatibility, minor/patch are
    /// informational.
    abi_version: String,
    exports: Vec<ManifestEntry>,
}

fn abi_major(version: &str) -> Option<u32> {
    version.split('.').next()?.parse().ok()
}

/// One entry from the `--compiled-exports` file: names a real handler
/// beyond the built-ins, with its own declared codecs.
#[derive(Clone, Debug, Deserialize)]
pub struct CompiledEntry {
    pub name: String,
    pub codec_in: String,
    pub codec_out: String,
}

#[derive(Clone, Debug, Deserialize)]
struct CompiledExportsFile {
    exports: Vec<CompiledEntry>,
}

/// What a dispatcher should do with a given entry name.
#[derive(Clone, Debug)]
pub enum ResolvedExport {
    Builtin(&'static str),
    Compiled(CompiledEntry),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown entry '{0}'")]
    UnknownEntry(String),
    #[error("manifest and compiled set diverged: entry '{0}' is declared but not wired")]
    NotWired(String),
}

/// The reconciled, validated view of the manifest a dispatcher consults on
/// every request.
pub struct ExportRegistry {
    declared: HashSet<String>,
    compiled: HashMap<String, CompiledEntry>,
}

impl ExportRegistry {
    pub fn load(
        manifest_path: impl AsRef<Path>,
        compiled_exports_path: Option<impl AsRef<Path>>,
    ) -> Result<Self, RegistryError> {
        let declared = load_manifest(manifest_path)?;
        let compiled = match compiled_exports_path {
            Some(path) => load_compiled_entries(path)?,
            None => HashMap::new(),
        };
        Ok(Self { declared, compiled })
    }

    pub fn declared_entries(&self) -> &HashSet<String> {
        &self.declared
    }

    /// Resolves a request's `entry` name to either a built-in handler or a
    /// compiled entry. Built-ins always win (they need no manifest
    /// declaration to stay reachable for local testing), then the compiled
    /// set, then `NotWired` for a declared-but-unimplemented name, then
    /// `UnknownEntry`.
    pub fn resolve(&self, name: &str) -> Result<ResolvedExport, DispatchError> {
        if let Some(builtin) = BUILTIN_ENTRIES.iter().find(|&&b| b == name) {
            return Ok(ResolvedExport::Builtin(builtin));
        }
        if let Some(entry) = self.compiled.get(name) {
            return Ok(ResolvedExport::Compiled(entry.clone()));
        }
        if self.declared.contains(name) {
            return Err(DispatchError::NotWired(name.to_string()));
        }
        Err(DispatchError::UnknownEntry(name.to_string()))
    }
}

fn load_manifest(path: impl AsRef<Path>) -> Result<HashSet<String>, RegistryError> {
    let path_ref = path.as_ref();
    let raw = fs::read_to_string(path_ref).map_err(|source| RegistryError::ReadManifest {
        path: path_ref.display().to_string(),
        source,
    })?;
    let manifest: ExportsManifestFile =
        serde_json::from_str(&raw).map_err(|source| RegistryError::ParseManifest {
            path: path_ref.display().to_string(),
            source,
        })?;

    let major = abi_major(&manifest.abi_version)
        .ok_or_else(|| RegistryError::MalformedAbiVersion(manifest.abi_version.clone()))?;
    if major != RUNTIME_ABI_MAJOR {
        return Err(RegistryError::AbiMismatch {
            manifest: manifest.abi_version,
            worker: RUNTIME_ABI_MAJOR,
        });
    }

    let mut declared = HashSet::new();
    for entry in manifest.exports {
        if entry.name.starts_with(RESERVED_PREFIX) {
            return Err(RegistryError::ReservedName(entry.name));
        }
        if Codec::parse(&entry.codec_in).is_none() {
            return Err(RegistryError::UnknownCodec(entry.name, entry.codec_in));
        }
        if Codec::parse(&entry.codec_out).is_none() {
            return Err(RegistryError::UnknownCodec(entry.name, entry.codec_out));
        }
        if !declared.insert(entry.name.clone()) {
            return Err(RegistryError::DuplicateEntry(entry.name));
        }
    }
    Ok(declared)
}

fn load_compiled_entries(path: impl AsRef<Path>) -> Result<HashMap<String, CompiledEntry>, RegistryError> {
    let path_ref = path.as_ref();
    let raw = fs::read_to_string(path_ref).map_err(|source| RegistryError::ReadManifest {
        path: path_ref.display().to_string(),
        source,
    })?;
    let file: CompiledExportsFile =
        serde_json::from_str(&raw).map_err(|source| RegistryError::ParseCompiled {
            path: path_ref.display().to_string(),
            source,
        })?;

    let mut compiled = HashMap::new();
    for entry in file.exports {
        let name = entry.name.trim();
        if name.is_empty() || name.starts_with(RESERVED_PREFIX) {
            tracing::warn!(name, "ignoring invalid compiled-exports entry name");
            continue;
        }
        compiled.insert(name.to_string(), entry);
    }
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_and_resolves_builtins_without_a_manifest_declaration() {
        let manifest = write_file(r#"{"abi_version": "1.0", "exports": []}"#);
        let registry = ExportRegistry::load(manifest.path(), None::<&Path>).unwrap();
        assert!(matches!(registry.resolve("health"), Ok(ResolvedExport::Builtin("health"))));
    }

    #[test]
    fn resolves_compiled_entries_over_unknown() {
        let manifest = write_file(
            r#"{"abi_version": "1.0", "exports": [{"name": "widgets", "codec_in": "json", "codec_out": "json"}]}"#,
        );
        let compiled = write_file(
            r#"{"exports": [{"name": "widgets", "codec_in": "json", "codec_out": "json"}]}"#,
        );
        let registry = ExportRegistry::load(manifest.path(), Some(compiled.path())).unwrap();
        assert!(matches!(registry.resolve("widgets"), Ok(ResolvedExport::Compiled(_))));
    }

    #[test]
    fn declared_but_unwired_entry_is_not_wired_not_unknown() {
        let manifest = write_file(
            r#"{"abi_version": "1.0", "exports": [{"name": "widgets", "codec_in": "json", "codec_out": "json"}]}"#,
        );
        let registry = ExportRegistry::load(manifest.path(), None::<&Path>).unwrap();
        assert!(matches!(registry.resolve("widgets"), Err(DispatchError::NotWired(_))));
        assert!(matches!(registry.resolve("nonexistent"), Err(DispatchError::UnknownEntry(_))));
    }

    #[test]
    fn rejects_reserved_names_and_bad_codecs_and_duplicates_and_abi_mismatch() {
        let reserved = write_file(
            r#"{"abi_version": "1.0", "exports": [{"name": "__cancel__", "codec_in": "json", "codec_out": "json"}]}"#,
        );
        assert!(matches!(
            ExportRegistry::load(reserved.path(), None::<&Path>),
            Err(RegistryError::ReservedName(_))
        ));

        let bad_codec = write_file(
            r#"{"abi_version": "1.0", "exports": [{"name": "x", "codec_in": "xml", "codec_out": "json"}]}"#,
        );
        assert!(matches!(
            ExportRegistry::load(bad_codec.path(), None::<&Path>),
            Err(RegistryError::UnknownCodec(_, _))
        ));

        let dup = write_file(
            r#"{"abi_version": "1.0", "exports": [
                {"name": "x", "codec_in": "json", "codec_out": "json"},
                {"name": "x", "codec_in": "json", "codec_out": "json"}
            ]}"#,
        );
        assert!(matches!(
            ExportRegistry::load(dup.path(), None::<&Path>),
            Err(RegistryError::DuplicateEntry(_))
        ));

        let bad_abi = write_file(r#"{"abi_version": "2.0", "exports": []}"#);
        assert!(matches!(
            ExportRegistry::load(bad_abi.path(), None::<&Path>),
            Err(RegistryError::AbiMismatch { .. })
        ));
    }

    #[test]
    fn compiled_exports_file_ignores_invalid_names() {
        let manifest = write_file(r#"{"abi_version": "1.0", "exports": []}"#);
        let compiled = write_file(
            r#"{"exports": [{"name": "__reserved__", "codec_in": "json", "codec_out": "json"}, {"name": "  ", "codec_in": "json", "codec_out": "json"}]}"#,
        );
        let registry = ExportRegistry::load(manifest.path(), Some(compiled.path())).unwrap();
        assert!(matches!(registry.resolve("__reserved__"), Err(DispatchError::UnknownEntry(_))));
    }
}
