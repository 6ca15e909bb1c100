use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Opaque token for a displayable image owned by the [`HandleRegistry`].
///
/// Tokens are unique for the lifetime of the process and are never reissued,
/// so a revoked handle can be detected as dead rather than silently pointing
/// at newer bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ResourceHandle(u64);

impl ResourceHandle {
    pub fn token(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Who asked for the handle. Used for leak accounting and event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOrigin {
    SketchPreview,
    StyleThumbnail,
    ResultArtifact,
}

impl HandleOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SketchPreview => "sketch_preview",
            Self::StyleThumbnail => "style_thumbnail",
            Self::ResultArtifact => "result_artifact",
        }
    }
}

#[derive(Debug)]
struct HandleEntry {
    bytes: Vec<u8>,
    origin: HandleOrigin,
}

/// Registry of image payloads keyed by display handle.
///
/// Callers that create a handle own its revocation; `created()` and
/// `revoked()` expose the running totals so a session can assert it is not
/// leaking display resources.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    entries: HashMap<u64, HandleEntry>,
    last_token: u64,
    created: u64,
    revoked: u64,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, bytes: Vec<u8>, origin: HandleOrigin) -> ResourceHandle {
        self.last_token += 1;
        self.created += 1;
        let token = self.last_token;
        self.entries.insert(token, HandleEntry { bytes, origin });
        ResourceHandle(token)
    }

    pub fn resolve(&self, handle: ResourceHandle) -> Option<&[u8]> {
        self.entries
            .get(&handle.0)
            .map(|entry| entry.bytes.as_slice())
    }

    pub fn origin(&self, handle: ResourceHandle) -> Option<HandleOrigin> {
        self.entries.get(&handle.0).map(|entry| entry.origin)
    }

    /// Releases the payload behind `handle`. Returns `false` when the handle
    /// was already revoked or never existed; revoking twice is not an error.
    pub fn revoke(&mut self, handle: ResourceHandle) -> bool {
        if self.entries.remove(&handle.0).is_none() {
            return false;
        }
        self.revoked += 1;
        true
    }

    pub fn revoke_all(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.revoked += count as u64;
        count
    }

    /// Handles still live, in creation order. Session teardown reports these
    /// as leaks.
    pub fn live_handles(&self) -> Vec<ResourceHandle> {
        let mut tokens: Vec<u64> = self.entries.keys().copied().collect();
        tokens.sort_unstable();
        tokens.into_iter().map(ResourceHandle).collect()
    }

    pub fn live(&self) -> usize {
        self.entries.len()
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn revoked(&self) -> u64 {
        self.revoked
    }
}
