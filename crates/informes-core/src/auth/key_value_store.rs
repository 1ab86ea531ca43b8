use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::ConfigLocator;

use super::AuthError;

/// Slot holding the access token.
pub const ACCESS_TOKEN_SLOT: &str = "jwt";
/// Slot holding the refresh token.
pub const REFRESH_TOKEN_SLOT: &str = "refreshToken";

/// Persistence abstraction for named string slots that survive restarts.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, slot: &str) -> Result<Option<String>, AuthError>;
    fn set(&self, slot: &str, value: &str) -> Result<(), AuthError>;
    fn remove(&self, slot: &str) -> Result<(), AuthError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, slot: &str) -> Result<Option<String>, AuthError> {
        (**self).get(slot)
    }

    fn set(&self, slot: &str, value: &str) -> Result<(), AuthError> {
        (**self).set(slot, value)
    }

    fn remove(&self, slot: &str) -> Result<(), AuthError> {
        (**self).remove(slot)
    }
}

/// Process-local store; nothing outlives the value itself.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValueStore {
    slots: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, slot: &str) -> Result<Option<String>, AuthError> {
        Ok(self.slots.lock().get(slot).cloned())
    }

    fn set(&self, slot: &str, value: &str) -> Result<(), AuthError> {
        self.slots.lock().insert(slot.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, slot: &str) -> Result<(), AuthError> {
        self.slots.lock().remove(slot);
        Ok(())
    }
}

/// Filesystem-backed slots located in the user configuration directory, one file per profile.
pub struct FileKeyValueStore {
    path: PathBuf,
    profile: String,
    // Serializes read-modify-write cycles on the file.
    guard: Mutex<()>,
}

impl FileKeyValueStore {
    pub fn new(locator: &ConfigLocator, profile: impl Into<String>) -> Self {
        let profile = profile.into();
        Self {
            path: locator.session_file(&profile),
            profile,
            guard: Mutex::new(()),
        }
    }

    pub fn with_default_locator(profile: impl Into<String>) -> Result<Self, AuthError> {
        Ok(Self::new(&ConfigLocator::new()?, profile))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_envelope(&self) -> Result<SlotEnvelope, AuthError> {
        if !self.path.exists() {
            return Ok(SlotEnvelope::empty(&self.profile));
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_envelope(&self, envelope: &SlotEnvelope) -> Result<(), AuthError> {
        if envelope.slots.is_empty() {
            return match fs::remove_file(&self.path) {
                Ok(_) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            };
        }
        let payload = serde_json::to_string_pretty(envelope)?;
        write_file(&self.path, &payload)
    }
}

fn write_file(path: &Path, payload: &str) -> Result<(), AuthError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(payload.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perm = file.metadata()?.permissions();
        perm.set_mode(0o600);
        fs::set_permissions(path, perm)?;
    }

    Ok(())
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, slot: &str) -> Result<Option<String>, AuthError> {
        let _guard = self.guard.lock();
        Ok(self.read_envelope()?.slots.remove(slot))
    }

    fn set(&self, slot: &str, value: &str) -> Result<(), AuthError> {
        let _guard = self.guard.lock();
        let mut envelope = self.read_envelope()?;
        envelope.slots.insert(slot.to_owned(), value.to_owned());
        self.write_envelope(&envelope)
    }

    fn remove(&self, slot: &str) -> Result<(), AuthError> {
        let _guard = self.guard.lock();
        let mut envelope = self.read_envelope()?;
        if envelope.slots.remove(slot).is_none() {
            return Ok(());
        }
        self.write_envelope(&envelope)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SlotEnvelope {
    version: u32,
    profile: String,
    slots: BTreeMap<String, String>,
}

impl SlotEnvelope {
    fn empty(profile: &str) -> Self {
        Self {
            version: 1,
            profile: profile.to_owned(),
            slots: BTreeMap::new(),
        }
    }
}
