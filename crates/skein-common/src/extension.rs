//! Named, configuration-selected implementations of pluggable capabilities.
//!
//! Each capability (load balancer, coordinator, serializer, compressor) has
//! one [`ExtensionLoader`]. The loader reads a `name=implementation-id` table
//! once, resolves implementation ids against a catalog of factories, and
//! caches one instance per name.
//!
//! # Configuration format
//!
//! ```text
//! # comment
//! roundRobin=skein_balance::RoundRobinBalancer
//! leastActive=skein_balance::LeastActiveBalancer
//! ```
//!
//! The table comes from `<extension dir>/<capability>` when an extension
//! directory is configured and that file exists, and from the capability's
//! built-in defaults otherwise.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::protocol::error::{Result, RpcError};

/// A capability that can be selected by name.
///
/// Implemented on the capability's trait object type, e.g.
/// `impl Extension for dyn LoadBalancer`.
pub trait Extension: Send + Sync + 'static {
    /// File name of the capability's configuration table.
    const CAPABILITY: &'static str;

    /// Table used when no configuration file is present.
    const DEFAULT_CONFIG: &'static str;
}

type Factory<T> = Arc<dyn Fn() -> Arc<T> + Send + Sync>;

/// Loads and caches the implementations of one capability.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use skein_common::extension::ExtensionLoader;
/// use skein_common::transport::{JsonSerializer, Serializer};
///
/// let loader: ExtensionLoader<dyn Serializer> = ExtensionLoader::new(None);
/// loader.register("skein_common::transport::JsonSerializer", || Arc::new(JsonSerializer));
///
/// let json = loader.get("json").unwrap();
/// assert_eq!(json.id(), 0x01);
/// ```
pub struct ExtensionLoader<T: ?Sized + Extension> {
    config_dir: Option<PathBuf>,
    catalog: RwLock<HashMap<String, Factory<T>>>,
    classes: OnceLock<HashMap<String, String>>,
    instances: DashMap<String, Arc<OnceLock<Arc<T>>>>,
}

impl<T: ?Sized + Extension> ExtensionLoader<T> {
    /// Creates a loader reading `<config_dir>/<capability>` if present.
    pub fn new(config_dir: Option<PathBuf>) -> Self {
        ExtensionLoader {
            config_dir,
            catalog: RwLock::new(HashMap::new()),
            classes: OnceLock::new(),
            instances: DashMap::new(),
        }
    }

    /// Adds a factory to the catalog under `implementation`.
    ///
    /// Registering an id twice replaces the earlier factory; instances that
    /// were already created are not affected.
    pub fn register<F>(&self, implementation: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<T> + Send + Sync + 'static,
    {
        self.catalog
            .write()
            .insert(implementation.into(), Arc::new(factory));
    }

    /// Returns the singleton registered under `name`.
    ///
    /// The instance is created on first use; concurrent first calls share
    /// one instance.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::ExtensionNotFound` if `name` is not in the
    /// configuration table or its implementation id has no factory.
    pub fn get(&self, name: &str) -> Result<Arc<T>> {
        if let Some(cell) = self.instances.get(name) {
            if let Some(instance) = cell.get() {
                return Ok(instance.clone());
            }
        }

        let implementation = self
            .extension_classes()
            .get(name)
            .ok_or_else(|| self.not_found(name))?;

        let factory = self.catalog.read().get(implementation).cloned();
        let factory = match factory {
            Some(factory) => factory,
            None => {
                warn!(
                    capability = T::CAPABILITY,
                    name,
                    implementation = %implementation,
                    "No factory registered for extension implementation"
                );
                return Err(self.not_found(name));
            }
        };

        let cell = self
            .instances
            .entry(name.to_string())
            .or_default()
            .value()
            .clone();
        Ok(cell.get_or_init(|| factory()).clone())
    }

    /// Names in the configuration table, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.extension_classes().keys().cloned().collect();
        names.sort();
        names
    }

    fn not_found(&self, name: &str) -> RpcError {
        RpcError::ExtensionNotFound {
            capability: T::CAPABILITY.to_string(),
            name: name.to_string(),
        }
    }

    fn extension_classes(&self) -> &HashMap<String, String> {
        self.classes.get_or_init(|| self.load_directory())
    }

    fn load_directory(&self) -> HashMap<String, String> {
        if let Some(dir) = &self.config_dir {
            let path = dir.join(T::CAPABILITY);
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    debug!(path = %path.display(), "Loading extension table");
                    return parse_table(&text, &path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "No extension table, using defaults");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read extension table, using defaults");
                }
            }
        }
        parse_table(T::DEFAULT_CONFIG, Path::new("<built-in>"))
    }
}

fn parse_table(text: &str, origin: &Path) -> HashMap<String, String> {
    let mut classes = HashMap::new();
    for (line_no, raw) in text.lines().enumerate() {
        match parse_line(raw) {
            Ok(Some((name, implementation))) => {
                classes.insert(name.to_string(), implementation.to_string());
            }
            Ok(None) => {}
            Err(()) => {
                warn!(
                    origin = %origin.display(),
                    line = line_no + 1,
                    content = raw,
                    "Skipping malformed extension line"
                );
            }
        }
    }
    classes
}

/// Parses one table line. `Ok(None)` for blanks and comments.
fn parse_line(raw: &str) -> std::result::Result<Option<(&str, &str)>, ()> {
    let line = match raw.find('#') {
        Some(pos) => &raw[..pos],
        None => raw,
    }
    .trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (name, implementation) = line.split_once('=').ok_or(())?;
    let (name, implementation) = (name.trim(), implementation.trim());
    if name.is_empty() || implementation.is_empty() {
        return Err(());
    }
    Ok(Some((name, implementation)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Greeter: Send + Sync {
        fn greet(&self) -> &'static str;
    }

    impl Extension for dyn Greeter {
        const CAPABILITY: &'static str = "greeter";
        const DEFAULT_CONFIG: &'static str = "hello=test::Hello\n";
    }

    struct Hello;
    impl Greeter for Hello {
        fn greet(&self) -> &'static str {
            "hello"
        }
    }

    struct Hola;
    impl Greeter for Hola {
        fn greet(&self) -> &'static str {
            "hola"
        }
    }

    fn loader(dir: Option<PathBuf>) -> ExtensionLoader<dyn Greeter> {
        let loader: ExtensionLoader<dyn Greeter> = ExtensionLoader::new(dir);
        loader.register("test::Hello", || Arc::new(Hello));
        loader.register("test::Hola", || Arc::new(Hola));
        loader
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("a=b"), Ok(Some(("a", "b"))));
        assert_eq!(parse_line("  a = b  # trailing"), Ok(Some(("a", "b"))));
        assert_eq!(parse_line("# only comment"), Ok(None));
        assert_eq!(parse_line("   "), Ok(None));
        assert_eq!(parse_line("no-equals"), Err(()));
        assert_eq!(parse_line("=b"), Err(()));
    }

    #[test]
    fn test_defaults_used_without_directory() {
        let loader = loader(None);
        assert_eq!(loader.get("hello").unwrap().greet(), "hello");
        assert_eq!(loader.names(), vec!["hello".to_string()]);
    }

    #[test]
    fn test_unknown_name_is_not_found() {
        let loader = loader(None);
        match loader.get("bonjour") {
            Err(RpcError::ExtensionNotFound { capability, name }) => {
                assert_eq!(capability, "greeter");
                assert_eq!(name, "bonjour");
            }
            other => panic!("expected ExtensionNotFound, got {:?}", other.map(|g| g.greet())),
        }
    }

    #[test]
    fn test_directory_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("greeter"),
            "# greeters\n\nspanish=test::Hola\nbroken line\nghost=test::Missing\n",
        )
        .unwrap();

        let loader = loader(Some(dir.path().to_path_buf()));
        assert_eq!(loader.get("spanish").unwrap().greet(), "hola");
        assert!(loader.get("hello").is_err());
        assert!(matches!(
            loader.get("ghost"),
            Err(RpcError::ExtensionNotFound { .. })
        ));
        assert_eq!(loader.names(), vec!["ghost".to_string(), "spanish".to_string()]);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(Some(dir.path().to_path_buf()));
        assert_eq!(loader.get("hello").unwrap().greet(), "hello");
    }

    #[test]
    fn test_instance_is_created_once() {
        let created = Arc::new(AtomicUsize::new(0));
        let loader: Arc<ExtensionLoader<dyn Greeter>> = Arc::new(ExtensionLoader::new(None));
        let counter = created.clone();
        loader.register("test::Hello", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(Hello)
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let loader = loader.clone();
                std::thread::spawn(move || loader.get("hello").unwrap())
            })
            .collect();
        let instances: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        for instance in &instances[1..] {
            assert!(Arc::ptr_eq(&instances[0], instance));
        }
    }
}
