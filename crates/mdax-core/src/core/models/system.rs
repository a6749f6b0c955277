use super::component::Component;
use super::ids::SystemId;
use slotmap::SlotMap;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SetupError {
    #[error("'{name}' is not a valid system or variable name")]
    InvalidName { name: String },

    #[error("Group '{group}' already contains a subsystem named '{name}'")]
    DuplicateSubsystem { group: String, name: String },

    #[error("System '{path}' is not a group")]
    NotAGroup { path: String },

    #[error("Unknown system handle")]
    UnknownSystem,

    #[error("Unexpected new order for group '{group}': {details}")]
    InvalidOrder { group: String, details: String },

    #[error("Variable '{name}' has {actual} initial values but its shape needs {expected}")]
    InvalidValue {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Partial declaration in '{component}' for '{of}' wrt '{wrt}' matches no variables")]
    InvalidPartial {
        component: String,
        of: String,
        wrt: String,
    },

    #[error("'{name}' cannot be used as a design variable: {reason}")]
    InvalidDesignVariable { name: String, reason: String },

    #[error("Index {index} is out of range for '{name}' of size {size}")]
    InvalidIndices {
        name: String,
        index: usize,
        size: usize,
    },

    #[error("Nonlinear iteration for group '{group}' needs at least one iteration and a positive tolerance")]
    InvalidIteration { group: String },

    #[error("Children of parallel group '{group}' must be independent, but '{input}' reads '{output}'")]
    ParallelDependency {
        group: String,
        output: String,
        input: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupKind {
    /// Children run one after another in the group's order.
    #[default]
    Serial,
    /// Children are independent and may be spread across processes.
    Parallel,
}

/// Settings for the nonlinear block Gauss-Seidel loop a group can run over its children.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NonlinearIteration {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for NonlinearIteration {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-10,
        }
    }
}

/// An explicit connection declared on a group, named in the group's own scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub source: String,
    pub target: String,
    pub src_indices: Option<Vec<usize>>,
}

pub struct GroupNode {
    pub(crate) kind: GroupKind,
    pub(crate) children: Vec<SystemId>,
    pub(crate) connections: Vec<Connection>,
    pub(crate) order: Option<Vec<String>>,
    pub(crate) nonlinear: Option<NonlinearIteration>,
}

pub enum SystemKind {
    Component(Box<dyn Component>),
    Group(GroupNode),
}

pub struct SystemNode {
    pub(crate) name: String,
    pub(crate) parent: Option<SystemId>,
    pub(crate) promotes: Vec<String>,
    pub(crate) kind: SystemKind,
}

impl SystemNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<SystemId> {
        self.parent
    }

    pub fn promotes(&self) -> &[String] {
        &self.promotes
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, SystemKind::Group(_))
    }

    pub(crate) fn group(&self) -> Option<&GroupNode> {
        match &self.kind {
            SystemKind::Group(g) => Some(g),
            SystemKind::Component(_) => None,
        }
    }

    pub(crate) fn component(&self) -> Option<&dyn Component> {
        match &self.kind {
            SystemKind::Component(c) => Some(c.as_ref()),
            SystemKind::Group(_) => None,
        }
    }
}

impl fmt::Debug for SystemNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemNode")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("promotes", &self.promotes)
            .field("group", &self.is_group())
            .finish()
    }
}

/// The system hierarchy: a tree of groups with components at the leaves.
///
/// Nodes live in a slot map and refer to each other by [`SystemId`], so the tree can be built
/// incrementally and later walked without borrowing gymnastics. The root is an unnamed serial
/// group.
#[derive(Debug)]
pub struct Model {
    systems: SlotMap<SystemId, SystemNode>,
    root: SystemId,
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    pub fn new() -> Self {
        let mut systems = SlotMap::with_key();
        let root = systems.insert(SystemNode {
            name: String::new(),
            parent: None,
            promotes: Vec::new(),
            kind: SystemKind::Group(GroupNode {
                kind: GroupKind::Serial,
                children: Vec::new(),
                connections: Vec::new(),
                order: None,
                nonlinear: None,
            }),
        });
        Self { systems, root }
    }

    pub fn root(&self) -> SystemId {
        self.root
    }

    /// Adds a component under `parent`.
    ///
    /// # Arguments
    ///
    /// * `parent` - The group that will own the component.
    /// * `name` - Local name, unique among the group's children.
    /// * `component` - The analysis itself.
    /// * `promotes` - Variable names (globs allowed) exposed in the parent's namespace unchanged.
    ///
    /// # Return
    ///
    /// The handle of the new component.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if the name is invalid, already taken, or `parent` is not a group.
    pub fn add_component<C: Component + 'static>(
        &mut self,
        parent: SystemId,
        name: &str,
        component: C,
        promotes: &[&str],
    ) -> Result<SystemId, SetupError> {
        self.insert_child(
            parent,
            name,
            promotes,
            SystemKind::Component(Box::new(component)),
        )
    }

    /// Adds an empty group under `parent`. See [`Model::add_component`] for the arguments.
    pub fn add_group(
        &mut self,
        parent: SystemId,
        name: &str,
        kind: GroupKind,
        promotes: &[&str],
    ) -> Result<SystemId, SetupError> {
        self.insert_child(
            parent,
            name,
            promotes,
            SystemKind::Group(GroupNode {
                kind,
                children: Vec::new(),
                connections: Vec::new(),
                order: None,
                nonlinear: None,
            }),
        )
    }

    fn insert_child(
        &mut self,
        parent: SystemId,
        name: &str,
        promotes: &[&str],
        kind: SystemKind,
    ) -> Result<SystemId, SetupError> {
        validate_name(name)?;
        let group_path = self.path(parent);
        let existing: Vec<SystemId> = self.group(parent)?.children.clone();
        if existing.iter().any(|&c| self.systems[c].name == name) {
            return Err(SetupError::DuplicateSubsystem {
                group: group_path,
                name: name.to_string(),
            });
        }
        let id = self.systems.insert(SystemNode {
            name: name.to_string(),
            parent: Some(parent),
            promotes: promotes.iter().map(|p| p.to_string()).collect(),
            kind,
        });
        self.group_mut(parent)?.children.push(id);
        Ok(id)
    }

    /// Connects an output to an input, both named relative to `group`.
    pub fn connect(&mut self, group: SystemId, source: &str, target: &str) -> Result<(), SetupError> {
        self.push_connection(group, source, target, None)
    }

    /// Like [`Model::connect`], but the input only receives the listed entries of the source.
    pub fn connect_indices(
        &mut self,
        group: SystemId,
        source: &str,
        target: &str,
        src_indices: Vec<usize>,
    ) -> Result<(), SetupError> {
        self.push_connection(group, source, target, Some(src_indices))
    }

    fn push_connection(
        &mut self,
        group: SystemId,
        source: &str,
        target: &str,
        src_indices: Option<Vec<usize>>,
    ) -> Result<(), SetupError> {
        self.group_mut(group)?.connections.push(Connection {
            source: source.to_string(),
            target: target.to_string(),
            src_indices,
        });
        Ok(())
    }

    /// Fixes the execution order of a group's children.
    ///
    /// The list must be a permutation of the current child names.
    pub fn set_order(&mut self, group: SystemId, order: &[&str]) -> Result<(), SetupError> {
        let group_path = self.path(group);
        let names: Vec<String> = self
            .group(group)?
            .children
            .iter()
            .map(|&c| self.systems[c].name.clone())
            .collect();

        let mut seen = HashSet::new();
        let mut duplicates: Vec<&str> = order.iter().copied().filter(|n| !seen.insert(*n)).collect();
        duplicates.dedup();
        let missing: Vec<&str> = names
            .iter()
            .map(String::as_str)
            .filter(|n| !order.contains(n))
            .collect();
        let extra: Vec<&str> = order
            .iter()
            .copied()
            .filter(|n| !names.iter().any(|m| m == n))
            .collect();

        if !duplicates.is_empty() || !missing.is_empty() || !extra.is_empty() {
            let mut parts = Vec::new();
            if !duplicates.is_empty() {
                parts.push(format!("duplicate entries {:?}", duplicates));
            }
            if !missing.is_empty() {
                parts.push(format!("missing {:?}", missing));
            }
            if !extra.is_empty() {
                parts.push(format!("unknown {:?}", extra));
            }
            return Err(SetupError::InvalidOrder {
                group: group_path,
                details: parts.join("; "),
            });
        }

        self.group_mut(group)?.order = Some(order.iter().map(|s| s.to_string()).collect());
        Ok(())
    }

    /// Makes the group iterate its children with nonlinear block Gauss-Seidel until the change
    /// in its outputs drops below the tolerance. Needed for groups that contain feedback.
    pub fn set_nonlinear_iteration(
        &mut self,
        group: SystemId,
        settings: NonlinearIteration,
    ) -> Result<(), SetupError> {
        if settings.max_iterations == 0 || settings.tolerance.is_nan() || settings.tolerance <= 0.0 {
            return Err(SetupError::InvalidIteration {
                group: self.path(group),
            });
        }
        self.group_mut(group)?.nonlinear = Some(settings);
        Ok(())
    }

    pub fn system(&self, id: SystemId) -> Option<&SystemNode> {
        self.systems.get(id)
    }

    /// Dotted absolute path of a system; the root's path is empty.
    pub fn path(&self, id: SystemId) -> String {
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            let Some(node) = self.systems.get(c) else {
                break;
            };
            if node.parent.is_some() {
                parts.push(node.name.as_str());
            }
            current = node.parent;
        }
        parts.reverse();
        parts.join(".")
    }

    /// Looks up a system by dotted path relative to the root.
    pub fn find(&self, path: &str) -> Option<SystemId> {
        if path.is_empty() {
            return Some(self.root);
        }
        let mut current = self.root;
        for part in path.split('.') {
            let group = self.systems.get(current)?.group()?;
            current = group
                .children
                .iter()
                .copied()
                .find(|&c| self.systems[c].name == part)?;
        }
        Some(current)
    }

    pub fn children(&self, id: SystemId) -> &[SystemId] {
        self.systems
            .get(id)
            .and_then(SystemNode::group)
            .map(|g| g.children.as_slice())
            .unwrap_or(&[])
    }

    /// All components in declaration (depth-first) order.
    pub fn components(&self) -> Vec<SystemId> {
        let mut out = Vec::new();
        self.collect_components(self.root, &mut out);
        out
    }

    fn collect_components(&self, id: SystemId, out: &mut Vec<SystemId>) {
        match self.systems.get(id).map(|n| &n.kind) {
            Some(SystemKind::Component(_)) => out.push(id),
            Some(SystemKind::Group(g)) => {
                for &child in &g.children {
                    self.collect_components(child, out);
                }
            }
            None => {}
        }
    }

    /// All groups in declaration (depth-first) order, root first.
    pub fn groups(&self) -> Vec<SystemId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if let Some(g) = self.systems.get(id).and_then(SystemNode::group) {
                out.push(id);
                stack.extend(g.children.iter().rev().copied());
            }
        }
        out
    }

    /// True if `ancestor` is `id` itself or one of its enclosing groups.
    pub fn is_ancestor(&self, ancestor: SystemId, id: SystemId) -> bool {
        let mut current = Some(id);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.systems.get(c).and_then(|n| n.parent);
        }
        false
    }

    pub(crate) fn group(&self, id: SystemId) -> Result<&GroupNode, SetupError> {
        let node = self.systems.get(id).ok_or(SetupError::UnknownSystem)?;
        node.group().ok_or_else(|| SetupError::NotAGroup {
            path: self.path(id),
        })
    }

    fn group_mut(&mut self, id: SystemId) -> Result<&mut GroupNode, SetupError> {
        let path = self.path(id);
        match self.systems.get_mut(id).map(|n| &mut n.kind) {
            Some(SystemKind::Group(g)) => Ok(g),
            Some(SystemKind::Component(_)) => Err(SetupError::NotAGroup { path }),
            None => Err(SetupError::UnknownSystem),
        }
    }
}

/// Names are identifiers: non-empty, no dots or separators, not starting with a digit.
pub(crate) fn validate_name(name: &str) -> Result<(), SetupError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_alphabetic() || first == '_')
                && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == ':')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(SetupError::InvalidName {
            name: name.to_string(),
        })
    }
}
