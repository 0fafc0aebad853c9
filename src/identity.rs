//! Record identity resolution
//!
//! Maps a raw resource name to a canonical form and a stable 64-bit record
//! identifier. Canonicalization is purely lexical so the result depends on
//! nothing but the input: repeated separators and `.` components collapse,
//! `..` pops the previous component. Names that cannot be canonicalized
//! (too long, embedded NUL) are used as-is.
//!
//! Identifiers are FNV-1a hashes of a namespace byte followed by the
//! canonical name. Every module tracks files, so all records share the
//! `File` namespace today; the byte keeps room for another record flavor
//! without colliding with existing identifiers.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher;

/// Longest name accepted for canonicalization (matches Linux `PATH_MAX`)
pub const MAX_PATH_LEN: usize = 4096;

/// Stable identifier of a tracked resource
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Record flavor used as a hash discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Namespace {
    /// Files opened through any file-level interface
    File = 1,
}

/// A name after canonicalization together with its identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    pub canonical: String,
    pub id: RecordId,
}

/// Lexically canonicalize a path
///
/// Returns `None` when the name is empty, longer than [`MAX_PATH_LEN`] or
/// contains a NUL byte.
///
/// # Example
/// ```
/// use rastro::identity::canonicalize;
///
/// assert_eq!(canonicalize("/data//run1/./out.dat").as_deref(), Some("/data/run1/out.dat"));
/// assert_eq!(canonicalize("/data/tmp/../run1.dat").as_deref(), Some("/data/run1.dat"));
/// ```
pub fn canonicalize(name: &str) -> Option<String> {
    if name.is_empty() || name.len() > MAX_PATH_LEN || name.contains('\0') {
        return None;
    }

    let absolute = name.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for component in name.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if absolute {
                    // ".." at the root stays at the root
                    parts.pop();
                } else if matches!(parts.last(), Some(last) if *last != "..") {
                    parts.pop();
                } else {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    Some(if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    })
}

/// Canonical form of `name`, falling back to the raw name
pub fn canonical_name(name: &str) -> Cow<'_, str> {
    match canonicalize(name) {
        Some(canonical) if canonical == name => Cow::Borrowed(name),
        Some(canonical) => Cow::Owned(canonical),
        None => Cow::Borrowed(name),
    }
}

/// Hash an already canonical name into a record identifier
pub fn generate_record_id(namespace: Namespace, canonical: &str) -> RecordId {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(&[namespace as u8]);
    hasher.write(canonical.as_bytes());
    RecordId(hasher.finish())
}

/// Canonicalize and hash in one step
pub fn resolve(namespace: Namespace, name: &str) -> ResolvedName {
    let canonical = canonical_name(name).into_owned();
    let id = generate_record_id(namespace, &canonical);
    ResolvedName { canonical, id }
}

/// Authority that assigns identifiers to canonical names
///
/// The coordinating runtime owns the job-wide authority; tracking engines
/// only ever see it through this trait.
pub trait IdentifierAuthority: Send + Sync {
    /// Identifier for an already canonicalized name
    fn lookup_identifier(&self, canonical: &str, namespace: Namespace) -> RecordId;

    /// Identifier `lookup_identifier` would return, without recording the name
    fn peek_identifier(&self, canonical: &str, namespace: Namespace) -> RecordId {
        generate_record_id(namespace, canonical)
    }

    /// Canonical name previously assigned to `id`, if the authority keeps one
    fn name_of(&self, _id: RecordId) -> Option<String> {
        None
    }
}

/// Stateless authority: hashing only, no name table
#[derive(Debug, Clone, Copy, Default)]
pub struct HashAuthority;

impl IdentifierAuthority for HashAuthority {
    fn lookup_identifier(&self, canonical: &str, namespace: Namespace) -> RecordId {
        generate_record_id(namespace, canonical)
    }
}

/// Authority that also remembers every name it has identified
///
/// The remembered table is persisted with the job log so analysis output
/// can print a file name next to each record.
#[derive(Debug, Default)]
pub struct NameRegistry {
    names: Mutex<HashMap<RecordId, String>>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct names identified so far
    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.lock().is_empty()
    }

    /// All (id, name) pairs ordered by identifier
    pub fn snapshot(&self) -> Vec<(RecordId, String)> {
        let mut entries: Vec<_> = self
            .names
            .lock()
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }
}

impl IdentifierAuthority for NameRegistry {
    fn lookup_identifier(&self, canonical: &str, namespace: Namespace) -> RecordId {
        let id = generate_record_id(namespace, canonical);
        self.names
            .lock()
            .entry(id)
            .or_insert_with(|| canonical.to_string());
        id
    }

    fn name_of(&self, id: RecordId) -> Option<String> {
        self.names.lock().get(&id).cloned()
    }
}
