//! State manager: the single owner of client state and the data-plane handle
//!
//! Every public operation runs under one mutex from load to response, so
//! persisted files are never written concurrently and a data-plane reload
//! never overlaps another.

use crate::config::StateLayout;
use crate::share_link::ShareLink;
use crate::store::{to_pretty_json, write_secret_file, ClientStore};
use crate::supervisor::{ExitReport, ProcessState, ProcessSupervisor, StartOutcome, StopOutcome};
use crate::tls::ensure_tls_material;
use crate::{
    allocate_client_id, ClientConfig, ClientMap, ClientRecord, ConfigBuilder, Error,
    GlobalConfig, Result, StatusClient, StatusResponse, DEFAULT_CLIENT_NAME, PROTOCOL, TRANSPORT,
};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

struct Inner {
    store: ClientStore,
    supervisor: ProcessSupervisor,
}

/// Coordinates the client store, document generation, and the data plane
pub struct StateManager {
    config: GlobalConfig,
    layout: StateLayout,
    inner: Mutex<Inner>,
}

impl StateManager {
    pub fn new(config: GlobalConfig) -> Self {
        let layout = config.layout();
        let inner = Inner {
            store: ClientStore::from_layout(&layout),
            supervisor: ProcessSupervisor::new(&config.data_plane, &layout),
        };
        Self {
            config,
            layout,
            inner: Mutex::new(inner),
        }
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Prepare directories, TLS material, the bootstrap client, and all documents.
    ///
    /// Idempotent: a second call neither adds a client nor regenerates TLS material.
    pub fn initialize_state(&self) -> Result<()> {
        let inner = self.lock();

        create_private_dir(&self.layout.root)?;
        create_private_dir(&self.layout.clients_dir)?;
        for path in [&self.layout.tls_cert, &self.layout.tls_key] {
            if let Some(parent) = path.parent() {
                create_private_dir(parent)?;
            }
        }

        ensure_tls_material(
            &self.layout.tls_cert,
            &self.layout.tls_key,
            &self.config.certificate_common_name(),
        )?;

        let mut clients = inner.store.load()?;
        if clients.is_empty() {
            let record = self.insert_client(&inner, DEFAULT_CLIENT_NAME, &mut clients)?;
            log::info!("bootstrapped default client '{}'", record.id);
        }

        self.write_documents(&clients)?;
        log::info!(
            "state initialized at {} ({} clients)",
            self.layout.root.display(),
            clients.len()
        );
        Ok(())
    }

    /// Create a client and return it with its client document.
    ///
    /// When the data plane is running it is restarted so the new user is
    /// accepted. A failed restart is [`Error::Reload`]; the client is
    /// persisted regardless.
    pub fn create_client(&self, name: &str) -> Result<ClientConfig> {
        let inner = self.lock();

        let mut clients = inner.store.load()?;
        let record = self.insert_client(&inner, name, &mut clients)?;
        self.write_documents(&clients)?;
        log::info!("created client '{}' ({})", record.id, record.name);

        if inner.supervisor.is_running() {
            if let Err(source) = restart(&inner.supervisor) {
                log::error!("reload after creating client '{}' failed: {}", record.id, source);
                return Err(Error::Reload {
                    record: Box::new(record),
                    source: Box::new(source),
                });
            }
        }

        let config = self.client_document_text(&record)?;
        Ok(ClientConfig { record, config })
    }

    /// Running flag, listener settings, and clients sorted by id
    pub fn get_status(&self) -> Result<StatusResponse> {
        let inner = self.lock();
        let clients = inner.store.load()?;
        let state = inner.supervisor.state();
        drop(inner);

        Ok(StatusResponse {
            running: state.is_running(),
            pid: state.pid(),
            interface: self.config.server.interface.clone(),
            listen_port: self.config.server.listen_port,
            protocol: PROTOCOL.to_string(),
            transport: TRANSPORT.to_string(),
            endpoint: self.config.server.endpoint.clone(),
            clients: clients.values().map(StatusClient::from).collect(),
        })
    }

    /// Regenerate one client's document and return it
    pub fn get_client_config(&self, id: &str) -> Result<ClientConfig> {
        let inner = self.lock();
        let clients = inner.store.load()?;
        let record = find_client(&clients, id)?.clone();

        let config = self.client_document_text(&record)?;
        Ok(ClientConfig { record, config })
    }

    /// `vless://` link for a client
    pub fn share_uri(&self, id: &str) -> Result<String> {
        let inner = self.lock();
        let clients = inner.store.load()?;
        let record = find_client(&clients, id)?;
        Ok(ShareLink::for_client(&self.config, record).to_uri())
    }

    /// Rewrite the server document and start the data plane unless running
    pub fn start_interface(&self) -> Result<StartOutcome> {
        let inner = self.lock();
        let clients = inner.store.load()?;
        self.write_server_document(&clients)?;
        inner.supervisor.start()
    }

    /// Stop the data plane; stopping a stopped interface is a no-op
    pub fn stop_interface(&self) -> StopOutcome {
        self.lock().supervisor.stop()
    }

    pub fn interface_state(&self) -> ProcessState {
        self.lock().supervisor.state()
    }

    /// Check the data-plane binary and return its version line
    pub fn check_data_plane(&self) -> Result<String> {
        self.lock().supervisor.check_binary()
    }

    /// Block until the running data plane exits, or `timeout` passes.
    ///
    /// The lock is released while waiting. Returns `None` when nothing was
    /// running or the timeout expired first.
    pub fn wait_for_exit(&self, timeout: Option<Duration>) -> Option<ExitReport> {
        let watch = self.lock().supervisor.watch()?;
        watch.wait(timeout)
    }

    fn insert_client(
        &self,
        inner: &Inner,
        name: &str,
        clients: &mut ClientMap,
    ) -> Result<ClientRecord> {
        let id = allocate_client_id(name, clients);
        let record = ClientRecord::new(id, name, &self.layout.clients_dir);
        clients.insert(record.id.clone(), record.clone());
        inner.store.save(clients)?;
        Ok(record)
    }

    fn write_documents(&self, clients: &ClientMap) -> Result<()> {
        self.write_server_document(clients)?;
        for record in clients.values() {
            self.client_document_text(record)?;
        }
        Ok(())
    }

    fn write_server_document(&self, clients: &ClientMap) -> Result<()> {
        let document = ConfigBuilder::server_document(&self.config, clients.values());
        let content = to_pretty_json(&document)?;
        write_secret_file(&self.layout.server_config, content.as_bytes())
    }

    /// Write a client's document to its config path and return the text
    fn client_document_text(&self, record: &ClientRecord) -> Result<String> {
        let document = ConfigBuilder::client_document(&self.config, record);
        let content = to_pretty_json(&document)?;
        write_secret_file(&record.config_path, content.as_bytes())?;
        Ok(content)
    }
}

fn find_client<'a>(clients: &'a ClientMap, id: &str) -> Result<&'a ClientRecord> {
    clients
        .get(id)
        .ok_or_else(|| Error::not_found(format!("client '{}'", id)))
}

fn restart(supervisor: &ProcessSupervisor) -> Result<StartOutcome> {
    supervisor.stop();
    supervisor.start()
}

fn create_private_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::{ClientDocument, ServerDocument};
    use crate::CONFIG_PLACEHOLDER;
    use std::sync::Arc;
    use std::thread;
    use tempfile::{tempdir, TempDir};

    fn test_config(dir: &TempDir) -> GlobalConfig {
        let mut config = GlobalConfig::default();
        config.state.root = dir.path().join("state");
        config.server.endpoint = "111.88.141.226:8443".to_string();
        config.data_plane.binary = "sh".to_string();
        config.data_plane.args = vec![
            "-c".to_string(),
            "exec sleep 30".to_string(),
            "sing-box".to_string(),
            CONFIG_PLACEHOLDER.to_string(),
        ];
        config.data_plane.stop_grace_ms = 300;
        config.data_plane.startup_probe_ms = 50;
        config
    }

    fn manager(dir: &TempDir) -> StateManager {
        let manager = StateManager::new(test_config(dir));
        manager.initialize_state().unwrap();
        manager
    }

    fn server_document(manager: &StateManager) -> ServerDocument {
        let raw = fs::read_to_string(&manager.layout().server_config).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    fn user_ids(manager: &StateManager) -> Vec<String> {
        server_document(manager)
            .vless_inbound()
            .unwrap()
            .users
            .iter()
            .map(|user| user.uuid.clone())
            .collect()
    }

    #[test]
    fn test_initialize_bootstraps_once() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir);
        let layout = manager.layout().clone();

        let status = manager.get_status().unwrap();
        assert_eq!(status.clients.len(), 1);
        assert_eq!(status.clients[0].id, DEFAULT_CLIENT_NAME);
        assert!(layout.tls_cert.is_file());
        assert!(layout.server_config.is_file());
        assert!(layout.clients_dir.join("default-client.json").is_file());

        let cert = fs::read_to_string(&layout.tls_cert).unwrap();
        manager.initialize_state().unwrap();
        assert_eq!(manager.get_status().unwrap().clients.len(), 1);
        assert_eq!(fs::read_to_string(&layout.tls_cert).unwrap(), cert);
    }

    #[cfg(unix)]
    #[test]
    fn test_initialize_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let manager = manager(&dir);
        let layout = manager.layout();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&layout.root), 0o700);
        assert_eq!(mode(&layout.clients_dir), 0o700);
        assert_eq!(mode(&layout.clients_file), 0o600);
        assert_eq!(mode(&layout.tls_key), 0o600);
    }

    #[test]
    fn test_create_client_colliding_names() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir);

        let first = manager.create_client("Alice Phone").unwrap();
        let second = manager.create_client("alice phone").unwrap();
        assert_eq!(first.record.id, "alice-phone");
        assert_eq!(second.record.id, "alice-phone-2");
        assert_ne!(first.record.secret_identity, second.record.secret_identity);

        let users = user_ids(&manager);
        assert!(users.contains(&first.record.secret_identity));
        assert!(users.contains(&second.record.secret_identity));
    }

    #[test]
    fn test_create_client_blank_name() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir);

        let created = manager.create_client("   ").unwrap();
        assert_eq!(created.record.id, "client");
        assert_eq!(created.record.name, "client");
    }

    #[test]
    fn test_created_config_matches_file() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir);

        let created = manager.create_client("laptop").unwrap();
        let on_disk = fs::read_to_string(&created.record.config_path).unwrap();
        assert_eq!(created.config, on_disk);

        let doc: ClientDocument = serde_json::from_str(&created.config).unwrap();
        assert_eq!(
            doc.vless_outbound().unwrap().uuid,
            created.record.secret_identity
        );
        assert_eq!(
            doc.tun_inbound().unwrap().route_exclude_address,
            vec!["111.88.141.226/32".to_string()]
        );
    }

    #[test]
    fn test_get_client_config_heals_deleted_file() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir);
        let path = manager.layout().clients_dir.join("default-client.json");

        let original = fs::read_to_string(&path).unwrap();
        fs::remove_file(&path).unwrap();

        let fetched = manager.get_client_config(DEFAULT_CLIENT_NAME).unwrap();
        assert_eq!(fetched.config, original);
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn test_get_client_config_unknown_id() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir);

        let err = manager.get_client_config("nobody").unwrap_err();
        assert!(err.is_not_found());
        assert!(manager.share_uri("nobody").unwrap_err().is_not_found());
    }

    #[test]
    fn test_share_uri_for_client() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir);
        let status = manager.get_status().unwrap();

        let uri = manager.share_uri(DEFAULT_CLIENT_NAME).unwrap();
        let link = ShareLink::parse(&uri).unwrap();
        assert_eq!(link.uuid, status.clients[0].uuid);
        assert_eq!(link.host, "111.88.141.226");
        assert_eq!(link.port, 8443);
    }

    #[test]
    fn test_status_sorted_and_aliased() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir);
        manager.create_client("zeta").unwrap();
        manager.create_client("alpha").unwrap();

        let status = manager.get_status().unwrap();
        let ids: Vec<_> = status.clients.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "default-client", "zeta"]);
        assert!(status.clients.iter().all(|c| c.address == c.uuid));
        assert_eq!(status.listen_port, 443);
        assert_eq!(status.protocol, "vless");
        assert_eq!(status.transport, "ws+tls");
        assert!(!status.running);
    }

    #[test]
    fn test_corrupt_store_is_fatal() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir);
        fs::write(&manager.layout().clients_file, "{ not json").unwrap();

        assert!(matches!(manager.get_status(), Err(Error::Parse(_))));
        assert!(matches!(manager.create_client("x"), Err(Error::Parse(_))));
        assert_eq!(
            fs::read_to_string(&manager.layout().clients_file).unwrap(),
            "{ not json"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_start_and_stop_are_idempotent() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir);

        assert_eq!(manager.stop_interface(), StopOutcome::AlreadyStopped);

        let pid = match manager.start_interface().unwrap() {
            StartOutcome::Started { pid } => pid,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(
            manager.start_interface().unwrap(),
            StartOutcome::AlreadyRunning { pid }
        );

        let status = manager.get_status().unwrap();
        assert!(status.running);
        assert_eq!(status.pid, Some(pid));

        assert_eq!(manager.stop_interface(), StopOutcome::Terminated);
        assert_eq!(manager.stop_interface(), StopOutcome::AlreadyStopped);
        assert!(!manager.get_status().unwrap().running);
    }

    #[cfg(unix)]
    #[test]
    fn test_create_client_reloads_running_data_plane() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir);

        manager.start_interface().unwrap();
        let old_pid = manager.interface_state().pid().unwrap();
        let created = manager.create_client("tablet").unwrap();

        let state = manager.interface_state();
        assert!(state.is_running());
        assert_ne!(state.pid(), Some(old_pid));
        assert!(user_ids(&manager).contains(&created.record.secret_identity));

        manager.stop_interface();
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_reload_keeps_client() {
        let dir = tempdir().unwrap();
        let mut config = test_config(&dir);
        // Runs once, then every later start exits immediately
        config.data_plane.args[1] =
            "if [ -e \"$0.started\" ]; then exit 1; fi; touch \"$0.started\"; exec sleep 30"
                .to_string();
        config.data_plane.args[2] = dir.path().join("marker").display().to_string();
        config.data_plane.startup_probe_ms = 500;
        let manager = StateManager::new(config);
        manager.initialize_state().unwrap();
        manager.start_interface().unwrap();

        let err = manager.create_client("phone").unwrap_err();
        match err {
            Error::Reload { record, source } => {
                assert_eq!(record.id, "phone");
                assert!(matches!(*source, Error::Process(_)));
            }
            other => panic!("unexpected error {other}"),
        }

        let status = manager.get_status().unwrap();
        assert!(!status.running);
        assert!(status.clients.iter().any(|c| c.id == "phone"));
    }

    #[cfg(unix)]
    #[test]
    fn test_start_rewrites_server_document() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir);
        fs::remove_file(&manager.layout().server_config).unwrap();

        manager.start_interface().unwrap();
        assert_eq!(user_ids(&manager).len(), 1);
        manager.stop_interface();
    }

    #[cfg(unix)]
    #[test]
    fn test_wait_for_exit_without_holding_lock() {
        let dir = tempdir().unwrap();
        let manager = Arc::new(manager(&dir));
        manager.start_interface().unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.wait_for_exit(Some(Duration::from_secs(10))))
        };
        thread::sleep(Duration::from_millis(100));

        // Status stays reachable while another thread waits
        assert!(manager.get_status().unwrap().running);
        manager.stop_interface();

        assert!(waiter.join().unwrap().is_some());
        assert!(manager.wait_for_exit(Some(Duration::from_millis(10))).is_none());
    }

    #[test]
    fn test_concurrent_creates_lose_nothing() {
        let dir = tempdir().unwrap();
        let manager = Arc::new(manager(&dir));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || manager.create_client("worker").unwrap().record.id)
            })
            .collect();
        let mut ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);

        let status = manager.get_status().unwrap();
        assert_eq!(status.clients.len(), 9);
        assert_eq!(user_ids(&manager).len(), 9);
    }
}
