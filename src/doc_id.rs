use blake3::Hasher;

const KEY_LEN: usize = 16;

/// Index key for a file, derived from `(resource_id, path)`.
///
/// Keys are persisted in on-disk indexes and must not change between
/// builds of the binary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId {
    pub key: String,
}

impl DocumentId {
    pub fn new(resource_id: &str, path: &str) -> Self {
        let mut hasher = Hasher::new();
        // Length prefix keeps ("ab", "c") and ("a", "bc") apart.
        hasher.update(&(resource_id.len() as u64).to_le_bytes());
        hasher.update(resource_id.as_bytes());
        hasher.update(path.as_bytes());
        let hex = hasher.finalize().to_hex();
        Self {
            key: hex[..KEY_LEN].to_string(),
        }
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}
