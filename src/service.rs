//! Names of services, as the catalog knows them
use std::sync::Arc;

use thiserror::Error;

/// Describes the name of a service in the catalog
#[derive(Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct Name(pub Arc<str>);

impl Name {
    pub fn new(s: impl ToString) -> Self {
        Self(Arc::from(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Name {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<&'_ str> for Name {
    fn from(s: &'_ str) -> Self {
        Self(Arc::from(s))
    }
}

impl std::borrow::Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for Name {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

/// A function name which cannot be turned into a service name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed function name {0:?}")]
pub struct MalformedName(pub String);

/// Returns true if `name` is usable as a function name.
///
/// Function names are non-empty and consist of ASCII alphanumerics,
/// `-`, `_` and `.`.
pub fn is_valid_function_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Maps external function names onto the service names registered by the
/// scheduler.
///
/// The scheduler registers every function as `{prefix}{function}`. Gateways
/// may also address a function as `{function}.{namespace}`; the namespace
/// suffix is dropped before the prefix is applied.
#[derive(Clone, Debug)]
pub struct Canonicalizer {
    prefix: Arc<str>,
    namespace_suffix: Option<Arc<str>>,
}

impl Canonicalizer {
    pub fn new(prefix: impl Into<String>, namespace: impl Into<String>) -> Self {
        let namespace: String = namespace.into();
        let namespace_suffix = if namespace.is_empty() {
            None
        } else {
            Some(Arc::from(format!(".{namespace}")))
        };
        Self {
            prefix: Arc::from(prefix.into()),
            namespace_suffix,
        }
    }

    pub fn canonicalize(&self, function: &str) -> Result<Name, MalformedName> {
        let function = match &self.namespace_suffix {
            Some(suffix) => function.strip_suffix(&**suffix).unwrap_or(function),
            None => function,
        };
        if !is_valid_function_name(function) {
            return Err(MalformedName(function.to_string()));
        }
        Ok(Name::new(format!("{}{}", self.prefix, function)))
    }
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self::new("faas-fn-", "default")
    }
}
