//! Storage file providers.
//!
//! A provider is the capability set of one backend type (an NFS export, an
//! object-store bucket, ...). Providers are registered in a
//! [`ProviderRegistry`] under their backend key and looked up per resource
//! at runtime.

mod local;
mod memory;
mod paged;

use std::{
    collections::HashMap,
    fmt,
    io::Read,
    sync::Arc,
    time::SystemTime,
};

pub use self::{
    local::LocalProvider,
    memory::MemoryProvider,
    paged::{Page, PageSource, Paged, VecSource},
};
use crate::{
    error::{Error, Result},
    model::FileRecord,
};

/// Short-lived, backend-specific credential.
#[derive(Clone)]
pub struct Credential {
    pub token: String,
    pub expires_at: Option<SystemTime>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expiry| expiry <= SystemTime::now())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Called for every provider operation; never cached by callers.
pub type CredentialSupplier =
    Arc<dyn Fn() -> Result<Credential> + Send + Sync>;

/// Supplier that always hands out the same non-expiring token.
pub fn static_credential(token: &str) -> CredentialSupplier {
    let token = token.to_string();
    Arc::new(move || Ok(Credential::new(token.clone())))
}

pub trait StorageProvider: Send + Sync {
    /// Registry key of the backend type.
    fn backend(&self) -> &str;

    /// Current files under `prefix` (resource-relative, `/`-prefixed).
    fn list(&self, root: &str, prefix: &str) -> Result<Paged<FileRecord>>;

    /// Every stored version under `prefix`; delete markers only when
    /// `include_deleted` is set.
    fn list_versions(
        &self,
        root: &str,
        prefix: &str,
        include_deleted: bool,
    ) -> Result<Paged<FileRecord>>;

    fn read_content(&self, root: &str, path: &str)
    -> Result<Box<dyn Read + Send>>;

    fn delete(&self, root: &str, path: &str) -> Result<()>;

    /// The live record at exactly `path`, if any.
    fn stat(&self, root: &str, path: &str) -> Result<Option<FileRecord>> {
        for record in self.list(root, path)? {
            let record = record?;
            if record.path == path && !record.is_delete_marker {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

/// Providers keyed by backend type.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn StorageProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn StorageProvider>) {
        self.providers
            .insert(provider.backend().to_string(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn StorageProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, backend: &str) -> Result<Arc<dyn StorageProvider>> {
        self.providers
            .get(backend)
            .cloned()
            .ok_or_else(|| Error::not_found("backend", backend))
    }

    pub fn backends(&self) -> Vec<&str> {
        let mut keys: Vec<&str> =
            self.providers.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("backends", &self.backends())
            .finish()
    }
}

/// Reject paths that could escape the resource root.
pub(crate) fn check_relative(backend: &str, path: &str) -> Result<()> {
    if path.split('/').any(|part| part == "..") {
        return Err(Error::provider(
            backend,
            format!("path escapes resource root: {path}"),
        ));
    }
    Ok(())
}
