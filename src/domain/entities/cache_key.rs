//! Cache keys and the resources they address.

use url::Url;

/// Opaque key identifying one cached artifact in every tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(pub String);

impl CacheKey {
    /// Creates a new `CacheKey` from any string-like input.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the content-addressed file name used when the payload is
    /// stored outside the metadata database.
    #[must_use]
    pub fn file_name(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..16])
    }

    /// Returns the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the key is the empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&Url> for CacheKey {
    fn from(url: &Url) -> Self {
        Self::new(url.as_str())
    }
}

/// Something that can be fetched and cached: where to download it from and
/// under which key to keep it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Key used for every cache tier.
    pub cache_key: CacheKey,
    /// Source location.
    pub url: Url,
}

impl Resource {
    /// Creates a resource with an explicit cache key.
    #[must_use]
    pub fn new(cache_key: impl Into<CacheKey>, url: Url) -> Self {
        Self {
            cache_key: cache_key.into(),
            url,
        }
    }

    /// Creates a resource keyed by the URL's absolute string.
    #[must_use]
    pub fn from_url(url: Url) -> Self {
        Self {
            cache_key: CacheKey::from(&url),
            url,
        }
    }

    /// Parses a URL string into a resource keyed by that URL.
    ///
    /// # Errors
    /// Returns the parse error if `url` is not an absolute URL.
    pub fn parse(url: &str) -> Result<Self, url::ParseError> {
        Url::parse(url).map(Self::from_url)
    }

    /// Returns true if the resource lives on the local filesystem.
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.url.scheme() == "file"
    }
}

impl From<Url> for Resource {
    fn from(url: Url) -> Self {
        Self::from_url(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_is_stable_hex() {
        let key = CacheKey::new("https://example.com/image.png");
        let name = key.file_name();
        assert_eq!(name.len(), 32);
        assert_eq!(name, CacheKey::new("https://example.com/image.png").file_name());
        assert_ne!(name, CacheKey::new("https://example.com/other.png").file_name());
    }

    #[test]
    fn test_resource_from_url_uses_absolute_string() -> Result<(), Box<dyn std::error::Error>> {
        let resource = Resource::parse("https://example.com/a.png")?;
        assert_eq!(resource.cache_key.as_str(), "https://example.com/a.png");
        assert!(!resource.is_file());

        let local = Resource::parse("file:///tmp/a.png")?;
        assert!(local.is_file());
        Ok(())
    }
}
