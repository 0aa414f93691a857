//! Durable client map persisted as a single JSON document

use crate::config::StateLayout;
use crate::{validate_client_id, ClientMap, Error, Result};
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Loads, heals, and atomically saves `clients.json`
#[derive(Debug, Clone)]
pub struct ClientStore {
    path: PathBuf,
    clients_dir: PathBuf,
}

impl ClientStore {
    pub fn new(path: impl Into<PathBuf>, clients_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            clients_dir: clients_dir.into(),
        }
    }

    pub fn from_layout(layout: &StateLayout) -> Self {
        Self::new(&layout.clients_file, &layout.clients_dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn clients_dir(&self) -> &Path {
        &self.clients_dir
    }

    /// Load the client map, healing incomplete records.
    ///
    /// A missing or blank file is an empty store. Malformed JSON is a
    /// [`Error::Parse`] and is never repaired here, and so is a key that is
    /// not a valid client id. When any record needed
    /// healing the store is written back before returning.
    pub fn load(&self) -> Result<ClientMap> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ClientMap::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(ClientMap::new());
        }

        let mut clients: ClientMap = serde_json::from_str(&raw).map_err(|e| {
            Error::parse(format!(
                "Corrupt client state {}: {}",
                self.path.display(),
                e
            ))
        })?;

        for id in clients.keys() {
            validate_client_id(id).map_err(|e| {
                Error::parse(format!(
                    "Corrupt client state {}: '{}': {}",
                    self.path.display(),
                    id,
                    e
                ))
            })?;
        }

        let mut changed = false;
        for (id, record) in clients.iter_mut() {
            changed |= record.heal(id, &self.clients_dir);
        }

        if changed {
            log::info!("healed client records in {}", self.path.display());
            self.save(&clients)?;
        }

        Ok(clients)
    }

    /// Persist the full map, keyed and normalized by id
    pub fn save(&self, clients: &ClientMap) -> Result<()> {
        let normalized: ClientMap = clients
            .iter()
            .map(|(id, record)| {
                let mut record = record.clone();
                record.id = id.clone();
                if record.config_path.as_os_str().is_empty() {
                    record.config_path = crate::model::client_config_path(&self.clients_dir, id);
                }
                (id.clone(), record)
            })
            .collect();

        let content = to_pretty_json(&normalized)?;
        write_secret_file(&self.path, content.as_bytes())
    }
}

/// Pretty JSON terminated by a newline
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let mut content = serde_json::to_string_pretty(value)?;
    if !content.ends_with('\n') {
        content.push('\n');
    }
    Ok(content)
}

/// Write `content` to a `0600` sibling temp file, then rename it over `path`.
///
/// Readers see either the previous file or the new one, never a partial write.
pub fn write_secret_file(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let result = (|| -> std::io::Result<()> {
        let mut file = options.open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;

        // A stale temp file keeps its old mode, so set it explicitly
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }

        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        fs::remove_file(&tmp_path).ok();
    }
    Ok(result?)
}
