//! Class registry: class name → constructor, and the factory that turns a
//! constructor's blueprint into a fully initialised [`Instance`].

use crate::error::RegistryError;
use crate::instance::{Instance, InstanceRef, NodeKind, PartData, WorkspaceData};
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub const BASE_CLASS: &str = "Instance";
pub const DATA_MODEL_CLASS: &str = "DataModel";
pub const WORKSPACE_CLASS: &str = "Workspace";
pub const PART_CLASS: &str = "Part";

// ---------------------------------------------------------------------------
// Blueprint
// ---------------------------------------------------------------------------

/// What a constructor hands back. Anything left unset is backfilled by the
/// factory: the name defaults to the class name, the class name is always
/// the registered one, and the child list always starts empty.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceBlueprint {
    pub name: Option<String>,
    pub kind: NodeKind,
}

impl InstanceBlueprint {
    pub fn new(kind: NodeKind) -> Self {
        Self { name: None, kind }
    }

    pub fn generic() -> Self {
        Self::new(NodeKind::Generic)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Returns `None` to report construction failure.
pub type Constructor = Arc<dyn Fn() -> Option<InstanceBlueprint> + Send + Sync>;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct ClassRegistry {
    constructors: RwLock<HashMap<String, Constructor>>,
}

impl ClassRegistry {
    /// Registry with only the base `Instance` class.
    pub fn new() -> Self {
        let registry = Self {
            constructors: RwLock::new(HashMap::new()),
        };
        registry.insert(BASE_CLASS, Arc::new(|| Some(InstanceBlueprint::generic())));
        registry
    }

    /// Registry with the base class plus `DataModel`, `Workspace` and `Part`.
    pub fn with_builtin_classes() -> Self {
        let registry = Self::new();
        registry.insert(DATA_MODEL_CLASS, Arc::new(|| Some(InstanceBlueprint::generic())));
        registry.insert(
            WORKSPACE_CLASS,
            Arc::new(|| Some(InstanceBlueprint::new(NodeKind::Workspace(WorkspaceData::default())))),
        );
        registry.insert(
            PART_CLASS,
            Arc::new(|| Some(InstanceBlueprint::new(NodeKind::Part(PartData::default())))),
        );
        registry
    }

    /// Store `ctor` under `class_name`. Re-registering overwrites.
    pub fn register<F>(&self, class_name: &str, ctor: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Option<InstanceBlueprint> + Send + Sync + 'static,
    {
        if class_name.is_empty() {
            return Err(RegistryError::EmptyClassName);
        }
        self.insert(class_name, Arc::new(ctor));
        Ok(())
    }

    fn insert(&self, class_name: &str, ctor: Constructor) {
        if self
            .constructors
            .write()
            .insert(class_name.to_string(), ctor)
            .is_some()
        {
            debug!("Class '{}' re-registered; previous constructor replaced", class_name);
        }
    }

    pub fn is_registered(&self, class_name: &str) -> bool {
        self.constructors.read().contains_key(class_name)
    }

    /// Build a new instance of `class_name`. `None` when the class is unknown
    /// or its constructor reports failure.
    pub fn create(&self, class_name: &str) -> Option<InstanceRef> {
        // Clone the constructor out so it runs without the registry lock held
        // (a constructor may itself consult the registry).
        let ctor = self.constructors.read().get(class_name).cloned()?;

        let Some(blueprint) = ctor() else {
            debug!("Constructor for '{}' reported failure", class_name);
            return None;
        };

        let name = blueprint
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| class_name.to_string());

        Some(Instance::new(class_name.to_string(), name, blueprint.kind))
    }

    pub fn create_named(&self, class_name: &str, name: &str) -> Option<InstanceRef> {
        let instance = self.create(class_name)?;
        instance.set_name(name);
        Some(instance)
    }

    /// Registered class names, sorted.
    pub fn list_registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.constructors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.read().is_empty()
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}
