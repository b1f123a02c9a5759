// Scoped OS object names
//
// Concurrent runs on one host share the kernel's global namespaces for
// interfaces, netns and cgroups. Every name we create is therefore encoded as
// `n-<base58 uid>-<name>`, where the uid defaults to our process id.

use std::fmt;
use std::marker::PhantomData;

use serde::{Serialize, Serializer};

use crate::constants::SCOPE_PREFIX;
use crate::domain::base58;
use crate::error::{NetlabError, Result};

/// Largest uid that still fits in four base58 digits (58^4 - 1)
///
/// Covers `/proc/sys/kernel/pid_max` (2^22) on every Linux configuration.
pub const UID_MAX: u32 = 11_316_495;

/// Characters consumed by `n-XXXX-`
pub const PREFIX_LEN: usize = SCOPE_PREFIX.len() + 1 + 4 + 1;

/// Per-object constraints for a kind of scoped name
pub trait ScopeKind {
    /// Kernel ceiling for the full encoded name
    const MAX_LEN: usize;
    /// Names that are never prefixed
    const UNSCOPED: &'static [&'static str];
    /// Human readable kind, used in error messages
    const KIND: &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interface;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Namespace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CGroup;

impl ScopeKind for Interface {
    const MAX_LEN: usize = 15; // IFNAMSIZ - 1
    const UNSCOPED: &'static [&'static str] = &["lo"];
    const KIND: &'static str = "interface";
}

impl ScopeKind for Namespace {
    const MAX_LEN: usize = 255;
    const UNSCOPED: &'static [&'static str] = &["1"];
    const KIND: &'static str = "namespace";
}

impl ScopeKind for CGroup {
    const MAX_LEN: usize = 255;
    const UNSCOPED: &'static [&'static str] = &[];
    const KIND: &'static str = "cgroup";
}

/// A (name, uid) pair that renders to a collision-free OS object name
///
/// Ordering and equality follow `(uid, name)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Scoped<K> {
    uid: u32,
    name: String,
    kind: PhantomData<K>,
}

pub type InterfaceName = Scoped<Interface>;
pub type NamespaceName = Scoped<Namespace>;
pub type CGroupName = Scoped<CGroup>;

/// Uid used when a name is created without an explicit one
pub fn default_uid() -> u32 {
    std::process::id()
}

impl<K: ScopeKind> Scoped<K> {
    /// Create a scoped name
    ///
    /// # Errors
    /// - `InvalidName` if the name is empty, contains whitespace or `/`,
    ///   or would not fit the kernel ceiling once prefixed
    /// - `InvalidName` if `uid` exceeds [`UID_MAX`]
    pub fn new(name: impl Into<String>, uid: u32) -> Result<Self> {
        let name = name.into();

        if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(NetlabError::InvalidName(format!(
                "{} name '{}' must be non-empty without whitespace or '/'",
                K::KIND,
                name
            )));
        }

        if uid > UID_MAX {
            return Err(NetlabError::InvalidName(format!(
                "{} uid must be at most {}, was {}",
                K::KIND,
                UID_MAX,
                uid
            )));
        }

        let max_name_len = K::MAX_LEN - PREFIX_LEN;
        if uid != 0 && !K::UNSCOPED.contains(&name.as_str()) && name.len() > max_name_len {
            return Err(NetlabError::InvalidName(format!(
                "{} name must be at most {} characters, was {} ('{}')",
                K::KIND,
                max_name_len,
                name.len(),
                name
            )));
        }

        if uid == 0 && name.len() > K::MAX_LEN {
            return Err(NetlabError::InvalidName(format!(
                "{} name must be at most {} characters, was {}",
                K::KIND,
                K::MAX_LEN,
                name.len()
            )));
        }

        Ok(Self {
            uid,
            name,
            kind: PhantomData,
        })
    }

    /// Create a scoped name with the current process id as uid
    pub fn with_default_uid(name: impl Into<String>) -> Result<Self> {
        Self::new(name, default_uid())
    }

    /// Parse an encoded `n-<uid>-<name>` string back into its parts
    pub fn parse(encoded: &str) -> Result<Self> {
        let invalid = || {
            NetlabError::InvalidName(format!(
                "{} name '{}' is not a valid scoped name",
                K::KIND,
                encoded
            ))
        };

        let rest = encoded
            .strip_prefix(SCOPE_PREFIX)
            .and_then(|r| r.strip_prefix('-'))
            .ok_or_else(invalid)?;
        let (uid, name) = rest.split_once('-').ok_or_else(invalid)?;

        if !base58::is_base58(uid) || name.is_empty() {
            return Err(invalid());
        }
        let uid = base58::decode(uid)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(invalid)?;

        Self::new(name, uid)
    }

    /// Parse an encoded name, or scope a plain one with `uid`
    pub fn from_any(input: &str, uid: u32) -> Result<Self> {
        Self::parse(input).or_else(|_| Self::new(input, uid))
    }

    /// The user-facing name component
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// The encoded OS object name
    pub fn scoped(&self) -> String {
        if self.uid == 0 || K::UNSCOPED.contains(&self.name.as_str()) {
            return self.name.clone();
        }
        format!("{}-{}-{}", SCOPE_PREFIX, base58::encode(self.uid.into()), self.name)
    }
}

impl<K: ScopeKind> fmt::Display for Scoped<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.scoped())
    }
}

impl<K: ScopeKind> Serialize for Scoped<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.scoped())
    }
}
