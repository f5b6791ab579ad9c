//! Instance tree – typed, mutable, concurrently readable hierarchy of nodes.
//!
//! ## Ownership
//!
//! ```text
//! parent ──Arc──▶ child        (children: strong, insertion ordered)
//! child  ──Weak─▶ parent       (back-reference, never owns)
//! ```
//!
//! Each instance guards its own `parent`/`children` pair with one mutex.
//! There is no whole-tree lock: mutation is expected from a single owning
//! thread, and the per-node locks only keep concurrent readers (the
//! renderer walking `get_renderables`) from observing a torn list.
//!
//! When one call touches several instances (`set_parent` touches the child,
//! the old parent and the new parent) the locks are taken in ascending
//! [`InstanceId`] order and held together, so a move is atomic for any
//! observer and two opposite moves cannot deadlock.
//!
//! Moves additionally serialise on one process-wide move lock that readers
//! never take. The cycle check and the relink happen under it, so two
//! concurrent opposite moves cannot both pass the check.

use crate::error::TreeError;
use crate::registry::{ClassRegistry, PART_CLASS};
use crate::types::{InstanceId, Quat, Vec3};
use log::warn;
use parking_lot::{const_mutex, Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::sync::{Arc, Weak};

/// Held by `set_parent` for its whole check-and-relink.
static MOVE_LOCK: Mutex<()> = const_mutex(());

/// Shared handle to an instance. Clone it freely; identity is `Arc::ptr_eq`
/// (or [`Instance::id`]).
pub type InstanceRef = Arc<Instance>;

// ---------------------------------------------------------------------------
// Variant payloads
// ---------------------------------------------------------------------------

/// Physical, renderable block.
#[derive(Debug, Clone, PartialEq)]
pub struct PartData {
    pub position: Vec3,
    pub size: Vec3,
    /// Axis-angle vector: direction is the axis, length is the angle in
    /// degrees.
    pub rotation: Vec3,
    /// Primitive tag consumed by the renderer ("Cube", "LightCube", ...).
    pub primitive: String,
}

impl Default for PartData {
    fn default() -> Self {
        Self {
            position: Vec3::zero(),
            size: Vec3::one(),
            rotation: Vec3::zero(),
            primitive: "Cube".into(),
        }
    }
}

impl PartData {
    pub fn rotation_quat(&self) -> Quat {
        Quat::from_scaled_axis_degrees(self.rotation)
    }
}

/// Container for world content.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkspaceData {
    pub meta: String,
}

/// Closed set of node behaviours. The class name picks the registry entry;
/// the kind carries the payload generic tree code never has to inspect.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Generic,
    Workspace(WorkspaceData),
    Part(PartData),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Generic => "generic",
            NodeKind::Workspace(_) => "workspace",
            NodeKind::Part(_) => "part",
        }
    }
}

// ---------------------------------------------------------------------------
// Read-only views
// ---------------------------------------------------------------------------

/// Per-frame draw record produced by [`Instance::get_renderables`].
#[derive(Debug, Clone, PartialEq)]
pub struct Renderable {
    pub id: InstanceId,
    pub name: String,
    pub position: Vec3,
    pub size: Vec3,
    pub rotation: Quat,
    pub primitive: String,
}

/// Serialisable dump of a subtree.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: InstanceId,
    pub name: String,
    pub class_name: String,
    pub kind: &'static str,
    pub children: Vec<NodeSnapshot>,
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Links {
    parent: Option<Weak<Instance>>,
    children: Vec<InstanceRef>,
    destroyed: bool,
    /// Set while this instance is a `TreeManager` root.
    pinned_root: bool,
}

pub struct Instance {
    id: InstanceId,
    class_name: String,
    name: RwLock<String>,
    kind: RwLock<NodeKind>,
    links: Mutex<Links>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("class_name", &self.class_name)
            .field("name", &*self.name.read())
            .finish_non_exhaustive()
    }
}

impl Instance {
    /// Only the factory (and the class-erased clone fallback) builds
    /// instances.
    pub(crate) fn new(class_name: String, name: String, kind: NodeKind) -> InstanceRef {
        Arc::new(Self {
            id: InstanceId::next(),
            class_name,
            name: RwLock::new(name),
            kind: RwLock::new(kind),
            links: Mutex::new(Links::default()),
        })
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    // -----------------------------------------------------------------------
    // Variant payload
    // -----------------------------------------------------------------------

    pub fn kind(&self) -> NodeKind {
        self.kind.read().clone()
    }

    /// Renderability follows the class tag, not the payload.
    pub fn is_renderable(&self) -> bool {
        self.class_name == PART_CLASS
    }

    /// Copy of the part payload, if this is a part.
    pub fn part(&self) -> Option<PartData> {
        match &*self.kind.read() {
            NodeKind::Part(p) => Some(p.clone()),
            _ => None,
        }
    }

    /// Mutate the part payload in place. Returns `false` for non-parts.
    pub fn edit_part(&self, f: impl FnOnce(&mut PartData)) -> bool {
        match &mut *self.kind.write() {
            NodeKind::Part(p) => {
                f(p);
                true
            }
            _ => false,
        }
    }

    pub fn meta(&self) -> Option<String> {
        match &*self.kind.read() {
            NodeKind::Workspace(w) => Some(w.meta.clone()),
            _ => None,
        }
    }

    pub fn set_meta(&self, meta: impl Into<String>) -> bool {
        match &mut *self.kind.write() {
            NodeKind::Workspace(w) => {
                w.meta = meta.into();
                true
            }
            _ => false,
        }
    }

    fn renderable(&self) -> Option<Renderable> {
        if !self.is_renderable() {
            return None;
        }
        let part = self.part().unwrap_or_default();
        Some(Renderable {
            id: self.id,
            name: self.name(),
            position: part.position,
            size: part.size,
            rotation: part.rotation_quat(),
            primitive: part.primitive,
        })
    }

    // -----------------------------------------------------------------------
    // Parent & children
    // -----------------------------------------------------------------------

    pub fn parent(&self) -> Option<InstanceRef> {
        self.links.lock().parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_destroyed(&self) -> bool {
        self.links.lock().destroyed
    }

    pub(crate) fn set_pinned_root(&self, pinned: bool) {
        self.links.lock().pinned_root = pinned;
    }

    /// True when `candidate` appears somewhere on the parent chain.
    pub fn is_descendant_of(&self, candidate: &Instance) -> bool {
        let mut current = self.parent();
        while let Some(node) = current {
            if node.id == candidate.id {
                return true;
            }
            current = node.parent();
        }
        false
    }

    /// Move this instance under `new_parent` (or detach it with `None`).
    ///
    /// The child leaves the old parent's list and joins the end of the new
    /// parent's list while all three locks are held, so no observer sees it
    /// in both lists or in neither. Re-setting the current parent is a no-op
    /// and keeps sibling order.
    pub fn set_parent(self: &Arc<Self>, new_parent: Option<&InstanceRef>) -> Result<(), TreeError> {
        let _moving = MOVE_LOCK.lock();

        if let Some(parent) = new_parent {
            if parent.is_destroyed() {
                return Err(TreeError::Destroyed { id: parent.id });
            }
            if Arc::ptr_eq(parent, self) || parent.is_descendant_of(self) {
                return Err(TreeError::WouldCycle {
                    child: self.id,
                    parent: parent.id,
                });
            }
        }

        loop {
            let old_parent = {
                let links = self.links.lock();
                if links.destroyed {
                    return Err(TreeError::Destroyed { id: self.id });
                }
                if links.pinned_root && new_parent.is_some() {
                    return Err(TreeError::RootReparent { id: self.id });
                }
                links.parent.as_ref().and_then(Weak::upgrade)
            };

            match (&old_parent, new_parent) {
                (None, None) => return Ok(()),
                (Some(old), Some(new)) if Arc::ptr_eq(old, new) => return Ok(()),
                _ => {}
            }

            let mut nodes: Vec<&Instance> = vec![self.as_ref()];
            if let Some(old) = old_parent.as_deref() {
                nodes.push(old);
            }
            if let Some(new) = new_parent {
                nodes.push(new.as_ref());
            }
            let mut guards = lock_ordered(&nodes);

            // Parent changed between the peek and the lock; start over.
            let current = guards[0].parent.as_ref().and_then(Weak::upgrade);
            let unchanged = match (&current, &old_parent) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            };
            if !unchanged {
                continue;
            }

            let mut slot = 1;
            if old_parent.is_some() {
                guards[slot].children.retain(|c| !Arc::ptr_eq(c, self));
                slot += 1;
            }
            if new_parent.is_some() {
                guards[slot].children.push(Arc::clone(self));
            }
            guards[0].parent = new_parent.map(Arc::downgrade);
            return Ok(());
        }
    }

    /// Point-in-time copy of the child list.
    pub fn get_children(&self) -> Vec<InstanceRef> {
        self.links.lock().children.clone()
    }

    pub fn find_first_child(&self, name: &str) -> Option<InstanceRef> {
        self.links
            .lock()
            .children
            .iter()
            .find(|c| *c.name.read() == name)
            .cloned()
    }

    pub fn find_first_child_of_class(&self, class_name: &str) -> Option<InstanceRef> {
        self.links
            .lock()
            .children
            .iter()
            .find(|c| c.class_name == class_name)
            .cloned()
    }

    // -----------------------------------------------------------------------
    // Subtree queries
    // -----------------------------------------------------------------------

    /// Pre-order list of every descendant (self excluded). Each level is
    /// copied before recursing, so a concurrent move yields a stale view at
    /// worst.
    pub fn get_descendants(&self) -> Vec<InstanceRef> {
        let mut out = Vec::new();
        self.walk(&mut |node| out.push(Arc::clone(node)));
        out
    }

    /// Every instance of `class_name` in this subtree, self included.
    pub fn get_all_of_type(self: &Arc<Self>, class_name: &str) -> Vec<InstanceRef> {
        let mut out = Vec::new();
        if self.class_name == class_name {
            out.push(Arc::clone(self));
        }
        self.walk(&mut |node| {
            if node.class_name == class_name {
                out.push(Arc::clone(node));
            }
        });
        out
    }

    /// Draw records for every `Part`-class instance in this subtree, self
    /// included. A part without a part payload draws with the default part
    /// geometry. This is the query the renderer calls once per frame.
    pub fn get_renderables(&self) -> Vec<Renderable> {
        let mut out = Vec::new();
        out.extend(self.renderable());
        self.walk(&mut |node| out.extend(node.renderable()));
        out
    }

    fn walk(&self, visit: &mut dyn FnMut(&InstanceRef)) {
        for child in self.get_children() {
            visit(&child);
            child.walk(visit);
        }
    }

    /// Dot-joined path from the root, recomputed on every call.
    pub fn get_full_name(&self) -> String {
        let mut segments = vec![self.name()];
        let mut current = self.parent();
        while let Some(node) = current {
            segments.push(node.name());
            current = node.parent();
        }
        segments.reverse();
        segments.join(".")
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Destroy children first, then detach, then clear. Destroying twice is
    /// a no-op; mutating afterwards returns [`TreeError::Destroyed`].
    pub fn destroy(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }

        for child in self.get_children() {
            child.destroy();
        }

        if let Err(e) = self.set_parent(None) {
            warn!("Failed to detach {} during destroy: {}", self.id, e);
        }

        let mut links = self.links.lock();
        links.destroyed = true;
        links.parent = None;
        links.children.clear();
    }

    /// Deep copy through the factory. The copy gets fresh identities and is
    /// returned detached; parent it wherever it belongs.
    ///
    /// Without a registry, or for an unregistered class, the copy is a
    /// class-erased generic instance that keeps the class name and name only.
    pub fn clone_tree(&self, registry: Option<&ClassRegistry>) -> InstanceRef {
        let copy = match registry.and_then(|r| r.create(&self.class_name)) {
            Some(copy) => {
                let source = self.kind();
                let mut kind = copy.kind.write();
                if std::mem::discriminant(&*kind) == std::mem::discriminant(&source) {
                    *kind = source;
                }
                drop(kind);
                copy
            }
            None => Instance::new(self.class_name.clone(), String::new(), NodeKind::Generic),
        };
        copy.set_name(self.name());

        for child in self.get_children() {
            let child_copy = child.clone_tree(registry);
            if let Err(e) = child_copy.set_parent(Some(&copy)) {
                warn!("Failed to attach clone of {}: {}", child.id, e);
            }
        }
        copy
    }

    // -----------------------------------------------------------------------
    // Debug
    // -----------------------------------------------------------------------

    /// Indented pre-order dump, one `name (class)` line per instance.
    pub fn hierarchy_string(&self, depth: usize) -> String {
        let mut out = String::new();
        self.write_hierarchy(depth, &mut out);
        out
    }

    fn write_hierarchy(&self, depth: usize, out: &mut String) {
        out.push_str(&"  ".repeat(depth));
        out.push_str(&format!("{} ({})\n", self.name(), self.class_name));
        for child in self.get_children() {
            child.write_hierarchy(depth + 1, out);
        }
    }

    pub fn print_hierarchy(&self, depth: usize) {
        print!("{}", self.hierarchy_string(depth));
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id,
            name: self.name(),
            class_name: self.class_name.clone(),
            kind: self.kind.read().label(),
            children: self.get_children().iter().map(|c| c.snapshot()).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Lock ordering
// ---------------------------------------------------------------------------

/// Lock distinct instances in ascending id order. Guards come back in the
/// order of `nodes`.
fn lock_ordered<'a>(nodes: &[&'a Instance]) -> Vec<MutexGuard<'a, Links>> {
    let mut order: Vec<usize> = (0..nodes.len()).collect();
    order.sort_by_key(|&i| nodes[i].id);

    let mut slots: Vec<Option<MutexGuard<'a, Links>>> = nodes.iter().map(|_| None).collect();
    for i in order {
        slots[i] = Some(nodes[i].links.lock());
    }
    slots.into_iter().flatten().collect()
}
