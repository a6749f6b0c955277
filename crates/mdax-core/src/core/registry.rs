use super::models::ids::{SystemId, VarId};
use super::models::variable::{Shape, VarKind};
use slotmap::{SecondaryMap, SlotMap};
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
#[error("Variable '{name}' is declared more than once: {reason}")]
pub struct DuplicateVariableError {
    pub name: String,
    pub reason: String,
}

/// A name lookup that failed, with the deepest system on the path that does exist.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("Variable '{name}' not found: {}", describe_scope(.scope, .remainder))]
pub struct UnknownVariableError {
    pub name: String,
    /// Dotted path of the deepest existing system the name points into; empty for the root.
    pub scope: String,
    /// The part of the name left unresolved below `scope`.
    pub remainder: String,
}

fn describe_scope(scope: &str, remainder: &str) -> String {
    if scope.is_empty() {
        format!("the model has no variable '{remainder}'")
    } else {
        format!("system '{scope}' has no variable '{remainder}'")
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("Output '{output}' was read by '{reader}' before it was computed or set")]
pub struct UninitializedOutputError {
    pub output: String,
    pub reader: String,
}

#[derive(Debug, Clone)]
pub struct Variable {
    /// Absolute dotted path, e.g. `cycle.d1.y1`.
    pub path: String,
    /// Name visible at the root after promotion.
    pub promoted: String,
    /// Name inside the owning component.
    pub local: String,
    pub kind: VarKind,
    pub shape: Shape,
    pub owner: SystemId,
    /// Name of the variable in the scope of each enclosing group, innermost first.
    pub(crate) scoped: Vec<(SystemId, String)>,
    pub(crate) initial: Option<Vec<f64>>,
    offset: usize,
    position: usize,
}

impl Variable {
    pub fn size(&self) -> usize {
        self.shape.size()
    }

    /// Name of this variable as seen from inside `group`, if `group` encloses it.
    pub(crate) fn name_in(&self, group: SystemId) -> Option<&str> {
        self.scoped
            .iter()
            .find(|(g, _)| *g == group)
            .map(|(_, n)| n.as_str())
    }
}

pub(crate) struct NewVariable {
    pub path: String,
    pub local: String,
    pub kind: VarKind,
    pub shape: Shape,
    pub owner: SystemId,
    pub scoped: Vec<(SystemId, String)>,
    pub initial: Option<Vec<f64>>,
}

/// Where a connected input takes its value from.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub output: VarId,
    pub indices: Option<Vec<usize>>,
}

/// Flat storage for every variable of a model.
///
/// Outputs live in one contiguous unknowns buffer (with a parallel residuals buffer) and inputs
/// in a params buffer. Each variable owns a fixed range of its buffer once the layout has been
/// finalized, which is what lets the Jacobian and the linear solvers address variables by plain
/// integer offsets. Names resolve through the promoted namespace first and then absolute paths.
#[derive(Debug, Default)]
pub struct VariableRegistry {
    vars: SlotMap<VarId, Variable>,
    declared: Vec<VarId>,
    outputs: Vec<VarId>,
    inputs: Vec<VarId>,
    promoted: HashMap<String, Vec<VarId>>,
    paths: HashMap<String, VarId>,
    system_paths: BTreeSet<String>,
    sources: SecondaryMap<VarId, Source>,
    initialized: SecondaryMap<VarId, bool>,
    unknowns: Vec<f64>,
    residuals: Vec<f64>,
    params: Vec<f64>,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a variable. Its root-level promoted name is the last entry of `scoped`.
    ///
    /// # Errors
    ///
    /// Returns [`DuplicateVariableError`] when the absolute path already exists, when two outputs
    /// end up with the same promoted name, or when inputs sharing a promoted name disagree in
    /// shape.
    pub(crate) fn register(&mut self, new: NewVariable) -> Result<VarId, DuplicateVariableError> {
        if self.paths.contains_key(&new.path) {
            return Err(DuplicateVariableError {
                name: new.path.clone(),
                reason: "the absolute path is already registered".to_string(),
            });
        }
        let promoted = new
            .scoped
            .last()
            .map(|(_, n)| n.clone())
            .unwrap_or_else(|| new.path.clone());

        for &other in self.promoted.get(&promoted).into_iter().flatten() {
            let existing = &self.vars[other];
            match (new.kind, existing.kind) {
                (VarKind::Output, VarKind::Output) => {
                    return Err(DuplicateVariableError {
                        name: promoted.clone(),
                        reason: format!(
                            "outputs '{}' and '{}' are promoted to the same name",
                            existing.path, new.path
                        ),
                    });
                }
                (VarKind::Input, VarKind::Input) if existing.shape != new.shape => {
                    return Err(DuplicateVariableError {
                        name: promoted.clone(),
                        reason: format!(
                            "inputs '{}' {} and '{}' {} are promoted to the same name with different shapes",
                            existing.path, existing.shape, new.path, new.shape
                        ),
                    });
                }
                _ => {}
            }
        }

        let path = new.path.clone();
        let id = self.vars.insert(Variable {
            path: new.path,
            promoted: promoted.clone(),
            local: new.local,
            kind: new.kind,
            shape: new.shape,
            owner: new.owner,
            scoped: new.scoped,
            initial: new.initial,
            offset: 0,
            position: 0,
        });
        self.declared.push(id);
        self.paths.insert(path, id);
        self.promoted.entry(promoted).or_default().push(id);
        Ok(id)
    }

    pub(crate) fn set_system_paths(&mut self, paths: impl IntoIterator<Item = String>) {
        self.system_paths = paths.into_iter().collect();
    }

    /// Assigns buffer offsets in the given orders and loads initial values.
    pub(crate) fn finalize_layout(&mut self, outputs: Vec<VarId>, inputs: Vec<VarId>) {
        let mut offset = 0;
        for (position, &id) in outputs.iter().enumerate() {
            let var = &mut self.vars[id];
            var.offset = offset;
            var.position = position;
            offset += var.size();
        }
        self.unknowns = vec![0.0; offset];
        self.residuals = vec![0.0; offset];

        let mut offset = 0;
        for (position, &id) in inputs.iter().enumerate() {
            let var = &mut self.vars[id];
            var.offset = offset;
            var.position = position;
            offset += var.size();
        }
        self.params = vec![0.0; offset];

        self.outputs = outputs;
        self.inputs = inputs;
        let ids: Vec<VarId> = self.declared.clone();
        for id in ids {
            let var = &self.vars[id];
            let range = var.offset..var.offset + var.size();
            let has_initial = var.initial.is_some();
            if let Some(initial) = var.initial.clone() {
                let buffer = match var.kind {
                    VarKind::Output => &mut self.unknowns,
                    VarKind::Input => &mut self.params,
                };
                buffer[range].copy_from_slice(&initial);
            }
            let initialized = var.kind == VarKind::Input || has_initial;
            self.initialized.insert(id, initialized);
        }
    }

    /// Resolves a promoted name or absolute path.
    ///
    /// A promoted name shared by an output and the inputs it feeds resolves to the output.
    pub fn resolve(&self, name: &str) -> Result<VarId, UnknownVariableError> {
        if let Some(ids) = self.promoted.get(name) {
            let output = ids.iter().copied().find(|&id| self.vars[id].kind == VarKind::Output);
            if let Some(id) = output.or_else(|| ids.first().copied()) {
                return Ok(id);
            }
        }
        if let Some(&id) = self.paths.get(name) {
            return Ok(id);
        }
        Err(self.unknown(name))
    }

    fn unknown(&self, name: &str) -> UnknownVariableError {
        let parts: Vec<&str> = name.split('.').collect();
        let mut depth = 0;
        for i in 1..parts.len() {
            if self.system_paths.contains(&parts[..i].join(".")) {
                depth = i;
            }
        }
        UnknownVariableError {
            name: name.to_string(),
            scope: parts[..depth].join("."),
            remainder: parts[depth..].join("."),
        }
    }

    /// Resolves a name to the output holding its value, following the connection of an input.
    pub fn resolve_output(&self, name: &str) -> Result<VarId, UnknownVariableError> {
        let id = self.resolve(name)?;
        match self.vars[id].kind {
            VarKind::Output => Ok(id),
            VarKind::Input => self
                .sources
                .get(id)
                .filter(|s| s.indices.is_none())
                .map(|s| s.output)
                .ok_or_else(|| self.unknown(name)),
        }
    }

    pub fn get(&self, id: VarId) -> Option<&Variable> {
        self.vars.get(id)
    }

    pub(crate) fn var(&self, id: VarId) -> &Variable {
        &self.vars[id]
    }

    /// Outputs in buffer layout order.
    pub fn outputs(&self) -> &[VarId] {
        &self.outputs
    }

    /// Inputs in buffer layout order.
    pub fn inputs(&self) -> &[VarId] {
        &self.inputs
    }

    /// All variables in registration order.
    pub fn declared(&self) -> &[VarId] {
        &self.declared
    }

    /// Index of a variable within the layout order of its kind.
    pub(crate) fn position(&self, id: VarId) -> usize {
        self.vars[id].position
    }

    /// Range of a variable within its buffer (unknowns for outputs, params for inputs).
    pub fn range(&self, id: VarId) -> Range<usize> {
        let var = &self.vars[id];
        var.offset..var.offset + var.size()
    }

    pub fn n_unknowns(&self) -> usize {
        self.unknowns.len()
    }

    pub(crate) fn set_source(&mut self, input: VarId, source: Source) {
        self.sources.insert(input, source);
    }

    pub fn source(&self, input: VarId) -> Option<&Source> {
        self.sources.get(input)
    }

    pub fn is_initialized(&self, id: VarId) -> bool {
        self.initialized.get(id).copied().unwrap_or(false)
    }

    /// Current value without the initialization check.
    pub fn value(&self, id: VarId) -> &[f64] {
        let range = self.range(id);
        match self.vars[id].kind {
            VarKind::Output => &self.unknowns[range],
            VarKind::Input => &self.params[range],
        }
    }

    /// Current value of an output, failing if nothing has written it yet.
    pub fn read(&self, id: VarId, reader: &str) -> Result<&[f64], UninitializedOutputError> {
        if !self.is_initialized(id) {
            return Err(UninitializedOutputError {
                output: self.vars[id].path.clone(),
                reader: reader.to_string(),
            });
        }
        Ok(self.value(id))
    }

    /// Overwrites a variable's value and marks it initialized. `values` must match its size.
    pub(crate) fn write(&mut self, id: VarId, values: &[f64]) {
        let range = self.range(id);
        match self.vars[id].kind {
            VarKind::Output => self.unknowns[range].copy_from_slice(values),
            VarKind::Input => self.params[range].copy_from_slice(values),
        }
        self.initialized.insert(id, true);
    }

    pub(crate) fn write_residual(&mut self, id: VarId, values: &[f64]) {
        let range = self.range(id);
        self.residuals[range].copy_from_slice(values);
    }

    pub fn unknowns(&self) -> &[f64] {
        &self.unknowns
    }

    pub fn residuals(&self) -> &[f64] {
        &self.residuals
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub(crate) fn unknowns_mut(&mut self) -> &mut [f64] {
        &mut self.unknowns
    }
}
