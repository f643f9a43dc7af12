use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::{CacheEntry, CacheError, ResourceType};

/// The separator between the segments of a [`CacheKey`].
pub const SEPARATOR: char = ':';

/// A structured key into the cache.
///
/// The canonical form of a key is `{namespace}:{resource_type}:{id1}:{id2}:...[:v{version}]`.
/// Equality and hashing only consider that canonical form.
///
/// Keys can only be created through a [`CacheKeyBuilder`] or by [parsing](CacheKey::parse) a
/// canonical string, both of which validate the identifiers.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    canonical: Arc<str>,
    namespace: Arc<str>,
    resource_type: ResourceType,
    identifiers: Arc<[String]>,
    version: Option<u32>,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.canonical
    }
}

impl CacheKey {
    /// Creates a [`CacheKeyBuilder`] for a key of the given resource type.
    pub fn builder(namespace: &str, resource_type: ResourceType) -> CacheKeyBuilder {
        CacheKeyBuilder {
            namespace: namespace.to_owned(),
            resource_type,
            identifiers: Vec::new(),
            version: None,
        }
    }

    /// Parses a canonical key string.
    ///
    /// This is the strict inverse of [`CacheKeyBuilder::build`]: every string produced by the
    /// builder parses back into an equal key, and everything the builder would reject fails with
    /// [`CacheError::MalformedKey`].
    pub fn parse(s: &str) -> CacheEntry<Self> {
        let mut segments: Vec<&str> = s.split(SEPARATOR).collect();
        if segments.len() < 2 {
            return Err(CacheError::MalformedKey(format!(
                "`{s}` is missing a namespace or resource type"
            )));
        }

        let version = match segments.last().and_then(|last| parse_version(last)) {
            Some(version) if segments.len() > 2 => {
                segments.pop();
                Some(version)
            }
            _ => None,
        };

        let namespace = segments[0];
        let resource_type: ResourceType = segments[1]
            .parse()
            .map_err(|_| CacheError::MalformedKey(format!("`{s}` has an unknown resource type")))?;

        let mut builder = Self::builder(namespace, resource_type);
        for id in &segments[2..] {
            builder = builder.id(*id);
        }
        if let Some(version) = version {
            builder = builder.version(version);
        }
        builder.build()
    }

    /// The namespace of this key.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The resource type this key refers to.
    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    /// The identifier fields, in order.
    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    /// The schema version this key was built for, if any.
    pub fn version(&self) -> Option<u32> {
        self.version
    }

    /// Returns this key without its version segment.
    pub fn unversioned(&self) -> &str {
        match self.version {
            Some(_) => self
                .canonical
                .rsplit_once(SEPARATOR)
                .map_or(&*self.canonical, |(head, _)| head),
            None => &self.canonical,
        }
    }

    /// Returns a stable relative path for this cache key.
    ///
    /// The relative path is a sha-256 hash of the unversioned key, hex-formatted like so:
    /// `v$version/aa/bbccdd/eeff...`. Keys without a version are placed under `v0`.
    pub fn cache_path(&self) -> String {
        let hash = Sha256::digest(self.unversioned().as_bytes());
        let version = self.version.unwrap_or(0);

        let mut path = format!("v{version}/{:02x}/", hash[0]);
        for b in &hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }
}

/// A builder for [`CacheKey`]s.
///
/// Identifiers are validated all at once when calling [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    namespace: String,
    resource_type: ResourceType,
    identifiers: Vec<String>,
    version: Option<u32>,
}

impl CacheKeyBuilder {
    /// Appends an identifier field.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.identifiers.push(id.into());
        self
    }

    /// Appends all the given identifier fields.
    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identifiers.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Sets the schema version suffix.
    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheEntry<CacheKey> {
        let Self {
            namespace,
            resource_type,
            identifiers,
            version,
        } = self;

        validate_segment("namespace", &namespace)?;
        let arity = resource_type.arity();
        if identifiers.len() != arity {
            return Err(CacheError::MalformedKey(format!(
                "`{resource_type}` keys need {arity} identifiers, got {}",
                identifiers.len()
            )));
        }
        for id in &identifiers {
            validate_segment("identifier", id)?;
        }

        let mut canonical = format!("{namespace}{SEPARATOR}{resource_type}");
        for id in &identifiers {
            canonical.push(SEPARATOR);
            canonical.push_str(id);
        }
        if let Some(version) = version {
            let _ = write!(canonical, "{SEPARATOR}v{version}");
        }

        Ok(CacheKey {
            canonical: canonical.into(),
            namespace: namespace.into(),
            resource_type,
            identifiers: identifiers.into(),
            version,
        })
    }
}

/// A prefix matching a group of [`CacheKey`]s.
///
/// The prefix consists of a namespace, a resource type and zero or more leading identifiers, and
/// matches every key sharing those regardless of the trailing identifiers and version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPrefix {
    /// Always ends with the separator.
    prefix: String,
}

impl KeyPrefix {
    /// Creates a new prefix.
    pub fn new(
        namespace: &str,
        resource_type: ResourceType,
        leading_ids: &[&str],
    ) -> CacheEntry<Self> {
        validate_segment("namespace", namespace)?;
        if leading_ids.len() > resource_type.arity() {
            return Err(CacheError::MalformedKey(format!(
                "`{resource_type}` keys only have {} identifiers",
                resource_type.arity()
            )));
        }

        let mut prefix = format!("{namespace}{SEPARATOR}{resource_type}{SEPARATOR}");
        for id in leading_ids {
            validate_segment("identifier", id)?;
            prefix.push_str(id);
            prefix.push(SEPARATOR);
        }
        Ok(Self { prefix })
    }

    /// The prefix string, including the trailing separator.
    pub fn as_str(&self) -> &str {
        &self.prefix
    }

    /// Returns whether the given canonical key string falls under this prefix.
    pub fn matches_str(&self, key: &str) -> bool {
        key.starts_with(&self.prefix) || Some(key) == self.prefix.strip_suffix(SEPARATOR)
    }

    /// Returns whether the given key falls under this prefix.
    pub fn matches(&self, key: &CacheKey) -> bool {
        self.matches_str(key.as_ref())
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*", self.prefix)
    }
}

/// Parses a `v{digits}` version segment.
fn parse_version(segment: &str) -> Option<u32> {
    let digits = segment.strip_prefix('v')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn validate_segment(what: &str, segment: &str) -> CacheEntry<()> {
    if segment.is_empty() {
        return Err(CacheError::MalformedKey(format!("empty {what}")));
    }
    if segment.contains(SEPARATOR) {
        return Err(CacheError::MalformedKey(format!(
            "{what} `{segment}` contains the `{SEPARATOR}` separator"
        )));
    }
    if segment.starts_with('v') && segment[1..].bytes().all(|b| b.is_ascii_digit()) {
        return Err(CacheError::MalformedKey(format!(
            "{what} `{segment}` is indistinguishable from a version"
        )));
    }
    Ok(())
}
