//! TreeManager – owns the root instance and the class registry, and is the
//! surface handlers, the renderer and tooling work through.

use crate::error::RegistryError;
use crate::instance::{Instance, InstanceRef, NodeKind, NodeSnapshot};
use crate::registry::{
    ClassRegistry, InstanceBlueprint, BASE_CLASS, DATA_MODEL_CLASS, WORKSPACE_CLASS,
};
use crate::types::TreeStats;
use log::{info, warn};
use parking_lot::RwLock;

pub const DEFAULT_ROOT_NAME: &str = "Root";

pub struct TreeManager {
    registry: ClassRegistry,
    root: RwLock<Option<InstanceRef>>,
}

impl TreeManager {
    pub fn new(registry: ClassRegistry) -> Self {
        Self {
            registry,
            root: RwLock::new(None),
        }
    }

    /// Built-in classes, a `DataModel` root named `Root` and a `Workspace`
    /// parented under it.
    pub fn with_data_model() -> Self {
        let manager = Self::new(ClassRegistry::with_builtin_classes());

        if let Some(root) = manager.create_named(DATA_MODEL_CLASS, DEFAULT_ROOT_NAME) {
            manager.set_root(root);
        }
        let root = manager.root();
        match manager.create_named(WORKSPACE_CLASS, WORKSPACE_CLASS) {
            Some(workspace) => {
                if let Err(e) = workspace.set_parent(Some(&root)) {
                    warn!("Failed to parent workspace under root: {}", e);
                }
            }
            None => warn!("Workspace class missing from builtin registry"),
        }

        info!("Data model initialised");
        manager
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub fn register_class<F>(&self, class_name: &str, ctor: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Option<InstanceBlueprint> + Send + Sync + 'static,
    {
        self.registry.register(class_name, ctor)
    }

    pub fn create(&self, class_name: &str) -> Option<InstanceRef> {
        self.registry.create(class_name)
    }

    pub fn create_named(&self, class_name: &str, name: &str) -> Option<InstanceRef> {
        self.registry.create_named(class_name, name)
    }

    pub fn list_registered(&self) -> Vec<String> {
        self.registry.list_registered()
    }

    /// Deep copy of `instance` through this manager's registry.
    pub fn clone_instance(&self, instance: &InstanceRef) -> InstanceRef {
        instance.clone_tree(Some(&self.registry))
    }

    // -----------------------------------------------------------------------
    // Root
    // -----------------------------------------------------------------------

    /// Install `root`. It is detached from any parent first and may not be
    /// re-parented while it is the root.
    pub fn set_root(&self, root: InstanceRef) {
        if let Err(e) = root.set_parent(None) {
            warn!("New root {} could not be detached: {}", root.id(), e);
        }
        root.set_pinned_root(true);
        if let Some(old) = self.root.write().replace(root) {
            old.set_pinned_root(false);
        }
    }

    /// The current root. If none was ever set a base-class root named `Root`
    /// is created on first read.
    pub fn root(&self) -> InstanceRef {
        if let Some(root) = self.root.read().as_ref() {
            return root.clone();
        }

        let mut slot = self.root.write();
        if let Some(root) = slot.as_ref() {
            return root.clone();
        }
        let root = self
            .registry
            .create_named(BASE_CLASS, DEFAULT_ROOT_NAME)
            .unwrap_or_else(|| {
                // The base class was overwritten with a failing constructor.
                Instance::new(
                    BASE_CLASS.to_string(),
                    DEFAULT_ROOT_NAME.to_string(),
                    NodeKind::Generic,
                )
            });
        root.set_pinned_root(true);
        *slot = Some(root.clone());
        root
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Resolve a dot-separated path. The first segment may name the root
    /// itself ("Root.A.B") or one of its children ("A.B").
    pub fn find_by_path(&self, path: &str) -> Option<InstanceRef> {
        if path.is_empty() {
            return None;
        }
        let mut segments = path.split('.');
        let first = segments.next()?;

        let root = self.root();
        let mut current = if root.name() == first {
            root
        } else {
            root.find_first_child(first)?
        };

        for segment in segments {
            current = current.find_first_child(segment)?;
        }
        Some(current)
    }

    // -----------------------------------------------------------------------
    // Stats & snapshot
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> TreeStats {
        let root = self.root();
        TreeStats {
            instance_count: root.get_descendants().len() + 1,
            renderable_count: root.get_renderables().len(),
            registered_classes: self.registry.len(),
        }
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        self.root().snapshot()
    }
}

impl Default for TreeManager {
    fn default() -> Self {
        Self::new(ClassRegistry::new())
    }
}
