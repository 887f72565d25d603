use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;

use reef_bridge::{MessageHandler, SpawnHandler};

use crate::echo::EchoEngineFactory;
use crate::engine::BootConfig;
use crate::error::RuntimeError;
use crate::gate::Gate;
use crate::instance::{bind_request, lock as lock_fs, InstanceFactory, InstanceState};
use crate::request::RunOptions;
use crate::response::{extract_response, Response};
use crate::vfs::{SharedBytes, VirtFs};

/// Path of the auto-prepended constants loader installed at bootstrap.
pub const BOOT_DEFINES_SCRIPT: &str = "/tmp/boot_defines";
/// Path of the constants file the loader reads.
pub const DEFINES_PATH: &str = "/tmp/defines.json";

const LOADER_SCRIPT: &str =
    "# auto-prepended loader: define each scalar in /tmp/defines.json unless already defined\n";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory under which servable files live; rotation copies this
    /// subtree to the next instance.
    pub document_root: String,
    /// Completed requests before the instance is rotated. 0 disables
    /// rotation.
    pub max_requests: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            document_root: "/www".to_string(),
            max_requests: 0,
        }
    }
}

#[derive(Default)]
struct SharedConfig {
    ini_path: Option<String>,
    ini_entries: Vec<(String, String)>,
    identity: Option<String>,
    spawn_handler: Option<Arc<dyn SpawnHandler>>,
    message_handlers: Vec<Arc<dyn MessageHandler>>,
}

/// Lifecycle manager and public facade for a rotating sequence of
/// interpreter instances.
///
/// State machine per instance: created, then initializing on the first
/// request (ini overrides applied, constants loader installed), then
/// serving repeated request cycles, until rotation replaces it or a crash
/// poisons it. A poisoned runtime returns the fixed
/// [`RuntimeError::Crashed`] sentinel from every public operation.
pub struct Runtime {
    factory: Arc<dyn InstanceFactory>,
    config: RuntimeConfig,
    gate: Gate,
    core: Mutex<InstanceState>,
    fs: Arc<StdMutex<VirtFs>>,
    bridge: StdMutex<Arc<reef_bridge::ExecutionBridge>>,
    shared: StdMutex<SharedConfig>,
    crashed: AtomicBool,
    retired: AtomicBool,
    booted: AtomicBool,
    completed: AtomicU64,
    generation: AtomicU64,
}

impl Runtime {
    pub fn new(factory: Arc<dyn InstanceFactory>, config: RuntimeConfig) -> anyhow::Result<Self> {
        let parts = factory.create()?;
        let fs = Arc::new(StdMutex::new(parts.fs));
        let bridge = Arc::clone(&parts.bridge);
        let core = InstanceState {
            fs: Arc::clone(&fs),
            bridge: parts.bridge,
            engine: parts.engine,
            booted: false,
        };
        Ok(Self {
            factory,
            config,
            gate: Gate::new(),
            core: Mutex::new(core),
            fs,
            bridge: StdMutex::new(bridge),
            shared: StdMutex::new(SharedConfig::default()),
            crashed: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            booted: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        })
    }

    /// A runtime backed by the built-in echo engine.
    pub fn with_echo_engine(config: RuntimeConfig) -> anyhow::Result<Self> {
        let factory = Arc::new(EchoEngineFactory::new(config.document_root.clone()));
        Self::new(factory, config)
    }

    fn ensure_live(&self) -> Result<(), RuntimeError> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(RuntimeError::Crashed);
        }
        if self.retired.load(Ordering::SeqCst) {
            return Err(RuntimeError::Retired);
        }
        Ok(())
    }

    fn ensure_configurable(&self, what: &'static str) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        if self.booted.load(Ordering::SeqCst) {
            return Err(RuntimeError::ConfigAfterBoot { what });
        }
        Ok(())
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn is_request_running(&self) -> bool {
        self.gate.running() > 0
    }

    pub fn completed_requests(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Increments on every rotation; two runs observing different
    /// generations ran on distinct instances.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn document_root(&self) -> &str {
        &self.config.document_root
    }

    // One-time configuration. Each fails once the first request has run.

    pub fn set_ini_path(&self, path: &str) -> Result<(), RuntimeError> {
        self.ensure_configurable("the ini path")?;
        lock_shared(&self.shared).ini_path = Some(path.to_string());
        Ok(())
    }

    pub fn add_ini_entry(&self, key: &str, value: &str) -> Result<(), RuntimeError> {
        self.ensure_configurable("ini entries")?;
        lock_shared(&self.shared)
            .ini_entries
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    pub fn set_identity(&self, name: &str) -> Result<(), RuntimeError> {
        self.ensure_configurable("the server identity")?;
        lock_shared(&self.shared).identity = Some(name.to_string());
        Ok(())
    }

    /// Merges a constant into the defines file read by the auto-prepended
    /// loader. Unlike the one-time setters this may be called at any time.
    pub fn define_constant(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        let mut fs = lock_fs(&self.fs);
        let mut defines = match fs.read_to_string(DEFINES_PATH) {
            Ok(raw) => serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&raw)
                .unwrap_or_default(),
            Err(_) => serde_json::Map::new(),
        };
        defines.insert(key.to_string(), value);
        fs.mkdir_tree("/tmp")?;
        fs.write_file(
            DEFINES_PATH,
            serde_json::Value::Object(defines).to_string(),
        )?;
        Ok(())
    }

    /// Registers the host's process launcher. Applied to the current
    /// instance and re-applied to every rotated one.
    pub fn set_spawn_handler(&self, handler: Arc<dyn SpawnHandler>) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        lock_shared(&self.shared).spawn_handler = Some(Arc::clone(&handler));
        self.bridge().set_spawn_handler(handler);
        Ok(())
    }

    pub fn add_message_handler(&self, handler: Arc<dyn MessageHandler>) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        lock_shared(&self.shared)
            .message_handlers
            .push(Arc::clone(&handler));
        self.bridge().add_message_handler(handler);
        Ok(())
    }

    /// The current instance's execution bridge. Replaced on rotation.
    pub fn bridge(&self) -> Arc<reef_bridge::ExecutionBridge> {
        match self.bridge.lock() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Runs one request against the current instance. Exactly one run is
    /// active at a time; an unrecoverable engine fault poisons the
    /// runtime.
    pub async fn run(&self, opts: RunOptions) -> Result<Response, RuntimeError> {
        self.ensure_live()?;

        let response = {
            let _guard = self.gate.acquire().await;
            let mut core = self.core.lock().await;
            if !core.booted {
                if let Err(err) = self.bootstrap(&mut core) {
                    if matches!(err, RuntimeError::Fault(_)) {
                        self.crashed.store(true, Ordering::SeqCst);
                    }
                    return Err(err);
                }
            }
            let state = bind_request(&self.fs, &opts)?;
            match core.drive(&state).await {
                Ok(exit_code) => {
                    let fs = lock_fs(&self.fs);
                    extract_response(&fs, exit_code)?
                }
                Err(fault) => {
                    self.crashed.store(true, Ordering::SeqCst);
                    return Err(RuntimeError::Fault(fault));
                }
            }
        };

        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if self.config.max_requests > 0 && completed % self.config.max_requests == 0 {
            if let Err(err) = self.rotate_now().await {
                tracing::error!(error = %err, "instance rotation failed");
            }
        }
        Ok(response)
    }

    fn bootstrap(&self, core: &mut InstanceState) -> Result<(), RuntimeError> {
        let boot_config = {
            let shared = lock_shared(&self.shared);
            let mut entries = Vec::with_capacity(shared.ini_entries.len() + 1);
            entries.push((
                "auto_prepend_file".to_string(),
                BOOT_DEFINES_SCRIPT.to_string(),
            ));
            entries.extend(shared.ini_entries.iter().cloned());
            BootConfig {
                ini_path: shared.ini_path.clone(),
                ini_entries: entries,
                identity: shared.identity.clone(),
            }
        };
        {
            let mut fs = lock_fs(&self.fs);
            fs.mkdir_tree("/tmp")?;
            if !fs.exists(BOOT_DEFINES_SCRIPT) {
                fs.write_file(BOOT_DEFINES_SCRIPT, LOADER_SCRIPT)?;
            }
            core.engine
                .boot(&mut fs, &boot_config)
                .map_err(RuntimeError::Fault)?;
        }
        core.booted = true;
        self.booted.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Replaces the current instance with a fresh one, carrying over the
    /// in-memory filesystem under the document root. The swap holds the
    /// gate and contains no suspension point, so no concurrent write can
    /// be lost mid-copy.
    pub async fn rotate_now(&self) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        let _guard = self.gate.acquire().await;
        let mut core = self.core.lock().await;

        let parts = self.factory.create().map_err(RuntimeError::Fault)?;
        let mut new_fs = parts.fs;
        {
            let mut fs = lock_fs(&self.fs);
            fs.copy_memory_tree(&mut new_fs, &self.config.document_root)?;
            *fs = new_fs;
        }
        core.engine = parts.engine;
        core.bridge = Arc::clone(&parts.bridge);
        match self.bridge.lock() {
            Ok(mut guard) => *guard = parts.bridge,
            Err(poisoned) => *poisoned.into_inner() = parts.bridge,
        }
        core.booted = false;
        self.booted.store(false, Ordering::SeqCst);

        let shared = lock_shared(&self.shared);
        if let Some(handler) = &shared.spawn_handler {
            core.bridge.set_spawn_handler(Arc::clone(handler));
        }
        for handler in &shared.message_handlers {
            core.bridge.add_message_handler(Arc::clone(handler));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(generation, "rotated runtime instance");
        Ok(())
    }

    /// Destroys the runtime. Further operations fail with
    /// [`RuntimeError::Retired`].
    pub fn exit(&self) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        self.retired.store(true, Ordering::SeqCst);
        Ok(())
    }

    // Filesystem operations exposed to collaborators. All surface the
    // uniform filesystem error.

    pub fn mkdir_tree(&self, path: &str) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        Ok(lock_fs(&self.fs).mkdir_tree(path)?)
    }

    pub fn write_file(&self, path: &str, data: impl Into<Vec<u8>>) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        Ok(lock_fs(&self.fs).write_file(path, data)?)
    }

    pub fn write_shared(&self, path: &str, data: SharedBytes) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        Ok(lock_fs(&self.fs).write_shared(path, data)?)
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, RuntimeError> {
        self.ensure_live()?;
        Ok(lock_fs(&self.fs).read(path)?)
    }

    pub fn read_file_to_string(&self, path: &str) -> Result<String, RuntimeError> {
        self.ensure_live()?;
        Ok(lock_fs(&self.fs).read_to_string(path)?)
    }

    pub fn unlink(&self, path: &str) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        Ok(lock_fs(&self.fs).unlink(path)?)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        Ok(lock_fs(&self.fs).rename(from, to)?)
    }

    pub fn remove_dir(&self, path: &str, recursive: bool) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        Ok(lock_fs(&self.fs).remove_dir(path, recursive)?)
    }

    pub fn list_dir(&self, path: &str, prepend_path: bool) -> Result<Vec<String>, RuntimeError> {
        self.ensure_live()?;
        Ok(lock_fs(&self.fs).list_dir(path, prepend_path)?)
    }

    pub fn exists(&self, path: &str) -> bool {
        !self.crashed.load(Ordering::SeqCst) && lock_fs(&self.fs).exists(path)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        !self.crashed.load(Ordering::SeqCst) && lock_fs(&self.fs).is_dir(path)
    }
}

fn lock_shared(shared: &StdMutex<SharedConfig>) -> std::sync::MutexGuard<'_, SharedConfig> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
