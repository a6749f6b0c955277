use super::config::{ConfigError, validate_fd};
use super::distributed::partition::assign_round_robin;
use super::error::{ConnectionError, MdoError};
use super::ordering::topological_order;
use crate::core::jacobian::approx::{FdConfig, WrtRef};
use crate::core::jacobian::block::PartialPattern;
use crate::core::jacobian::store::JacobianStore;
use crate::core::models::component::{Declarations, matches_pattern};
use crate::core::models::ids::{SystemId, VarId};
use crate::core::models::system::{
    GroupKind, Model, NonlinearIteration, SetupError, validate_name,
};
use crate::core::models::variable::VarKind;
use crate::core::registry::{DuplicateVariableError, NewVariable, Source, VariableRegistry};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedPartial {
    /// Local output index.
    pub of: usize,
    pub wrt: WrtRef,
    pub pattern: PartialPattern,
}

/// Everything the engine needs to know about one component after setup.
#[derive(Debug, Clone)]
pub(crate) struct ComponentLayout {
    pub id: SystemId,
    pub path: String,
    pub inputs: Vec<VarId>,
    pub outputs: Vec<VarId>,
    pub partials: Vec<ResolvedPartial>,
    pub implicit: bool,
    pub independent: bool,
    pub fd: Option<FdConfig>,
    pub force_fd: bool,
    /// Rank that evaluates this component; `None` when every rank does.
    pub owner: Option<usize>,
}

impl ComponentLayout {
    pub(crate) fn wrt_var(&self, wrt: WrtRef) -> VarId {
        match wrt {
            WrtRef::Input(i) => self.inputs[i],
            WrtRef::Output(i) => self.outputs[i],
        }
    }

    pub(crate) fn runs_on(&self, rank: usize) -> bool {
        self.owner.is_none_or(|owner| owner == rank)
    }
}

/// Hierarchical execution plan. Component steps index into [`Assembly::components`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    Run(usize),
    /// Children of a parallel group, each tagged with the rank that runs it.
    Parallel {
        path: String,
        branches: Vec<(usize, Vec<Step>)>,
    },
    /// A group iterated with nonlinear block Gauss-Seidel.
    Iterate {
        path: String,
        settings: NonlinearIteration,
        body: Vec<Step>,
    },
}

impl Step {
    /// Component indices reached by a list of steps, in execution order.
    pub(crate) fn components(steps: &[Step]) -> Vec<usize> {
        let mut out = Vec::new();
        for step in steps {
            match step {
                Step::Run(i) => out.push(*i),
                Step::Parallel { branches, .. } => {
                    for (_, body) in branches {
                        out.extend(Step::components(body));
                    }
                }
                Step::Iterate { body, .. } => out.extend(Step::components(body)),
            }
        }
        out
    }
}

/// A model after setup: variables registered and laid out, connections resolved, execution
/// order fixed and the Jacobian sparsity declared.
pub(crate) struct Assembly {
    pub model: Model,
    pub registry: VariableRegistry,
    pub components: Vec<ComponentLayout>,
    pub schedule: Vec<Step>,
    /// Unknown ranges of the top-level subsystems, in execution order.
    pub blocks: Vec<Range<usize>>,
    pub jacobian: JacobianStore,
}

struct Pending {
    decl: Declarations,
    inputs: Vec<VarId>,
    outputs: Vec<VarId>,
    implicit: bool,
    independent: bool,
}

/// Performs setup.
///
/// # Errors
///
/// Every structural problem is reported here, before any component computes: invalid or
/// duplicate names, connection errors, unconnected inputs, bad orders and bad partial
/// declarations.
#[instrument(skip_all, name = "setup")]
pub(crate) fn assemble(model: Model, comm_size: usize) -> Result<Assembly, MdoError> {
    let mut registry = VariableRegistry::new();
    let mut pending: HashMap<SystemId, Pending> = HashMap::new();

    for id in model.components() {
        let pending_component = register_component(&model, &mut registry, id)?;
        pending.insert(id, pending_component);
    }

    let mut system_paths: Vec<String> = model.groups().into_iter().map(|g| model.path(g)).collect();
    system_paths.extend(model.components().into_iter().map(|c| model.path(c)));
    registry.set_system_paths(system_paths);

    let sources = resolve_connections(&model, &registry)?;
    for (input, source) in &sources {
        registry.set_source(*input, source.clone());
    }

    let mut builder = ScheduleBuilder {
        model: &model,
        registry: &registry,
        pending: &mut pending,
        components: Vec::new(),
        comm_size: comm_size.max(1),
    };
    let schedule = builder.build_group(model.root(), None)?;
    let mut components = builder.components;

    let outputs: Vec<VarId> = components.iter().flat_map(|c| c.outputs.clone()).collect();
    let inputs: Vec<VarId> = components.iter().flat_map(|c| c.inputs.clone()).collect();
    registry.finalize_layout(outputs, inputs);

    let blocks = top_level_blocks(&model, &registry, &components);

    let mut jacobian = JacobianStore::new();
    for layout in &mut components {
        let Some(p) = pending.get(&layout.id) else {
            continue;
        };
        layout.partials = declare_partials(&registry, &mut jacobian, layout, &p.decl)?;
    }

    info!(
        components = components.len(),
        unknowns = registry.n_unknowns(),
        partial_blocks = jacobian.len(),
        "Setup complete"
    );

    Ok(Assembly {
        model,
        registry,
        components,
        schedule,
        blocks,
        jacobian,
    })
}

fn register_component(
    model: &Model,
    registry: &mut VariableRegistry,
    id: SystemId,
) -> Result<Pending, MdoError> {
    let path = model.path(id);
    let Some(component) = model.system(id).and_then(|n| n.component()) else {
        return Err(SetupError::UnknownSystem.into());
    };
    let mut decl = Declarations::new();
    component.declare(&mut decl);

    let mut seen = HashSet::new();
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let vars = decl
        .inputs
        .iter()
        .map(|v| (v, VarKind::Input))
        .chain(decl.outputs.iter().map(|v| (v, VarKind::Output)));
    for (var, kind) in vars {
        validate_name(&var.name)?;
        let full = format!("{path}.{}", var.name);
        if !seen.insert(var.name.as_str()) {
            return Err(DuplicateVariableError {
                name: full,
                reason: "declared twice in the same component".to_string(),
            }
            .into());
        }
        if let Some(value) = &var.value
            && value.len() != var.shape.size()
        {
            return Err(SetupError::InvalidValue {
                name: full,
                expected: var.shape.size(),
                actual: value.len(),
            }
            .into());
        }
        let vid = registry.register(NewVariable {
            path: full,
            local: var.name.clone(),
            kind,
            shape: var.shape.clone(),
            owner: id,
            scoped: scoped_names(model, id, &var.name),
            initial: var.value.clone(),
        })?;
        match kind {
            VarKind::Input => inputs.push(vid),
            VarKind::Output => outputs.push(vid),
        }
    }

    Ok(Pending {
        implicit: component.is_implicit(),
        independent: component.is_independent(),
        decl,
        inputs,
        outputs,
    })
}

/// Name of a component variable in the scope of each enclosing group, innermost first.
fn scoped_names(model: &Model, component: SystemId, local: &str) -> Vec<(SystemId, String)> {
    let mut out = Vec::new();
    let mut name = local.to_string();
    let mut node = component;
    while let Some(system) = model.system(node) {
        let Some(parent) = system.parent() else {
            break;
        };
        if !system.promotes().iter().any(|p| matches_pattern(p, &name)) {
            name = format!("{}.{}", system.name(), name);
        }
        out.push((parent, name.clone()));
        node = parent;
    }
    out
}

fn vars_named(registry: &VariableRegistry, group: SystemId, name: &str, kind: VarKind) -> Vec<VarId> {
    registry
        .declared()
        .iter()
        .copied()
        .filter(|&id| {
            let var = registry.var(id);
            var.kind == kind && var.name_in(group) == Some(name)
        })
        .collect()
}

fn check_transfer(
    registry: &VariableRegistry,
    src: VarId,
    target: VarId,
    indices: Option<&[usize]>,
) -> Result<(), ConnectionError> {
    let s = registry.var(src);
    let t = registry.var(target);
    let mismatch = || ConnectionError::ShapeMismatch {
        src: s.path.clone(),
        target: t.path.clone(),
        src_shape: s.shape.to_string(),
        target_shape: t.shape.to_string(),
    };
    match indices {
        Some(ix) => {
            if let Some(&bad) = ix.iter().find(|&&i| i >= s.size()) {
                return Err(ConnectionError::IndexOutOfRange {
                    src: s.path.clone(),
                    index: bad,
                    size: s.size(),
                });
            }
            if ix.len() != t.size() {
                return Err(mismatch());
            }
        }
        None if s.shape != t.shape => return Err(mismatch()),
        None => {}
    }
    Ok(())
}

/// Resolves explicit and implicit (same promoted name) connections for every input.
fn resolve_connections(
    model: &Model,
    registry: &VariableRegistry,
) -> Result<Vec<(VarId, Source)>, MdoError> {
    let mut explicit: HashMap<VarId, Source> = HashMap::new();

    for group_id in model.groups() {
        let group = model.group(group_id)?;
        let group_path = model.path(group_id);
        for conn in &group.connections {
            let srcs = vars_named(registry, group_id, &conn.source, VarKind::Output);
            let Some(&src) = srcs.first() else {
                let err = if vars_named(registry, group_id, &conn.source, VarKind::Input).is_empty() {
                    ConnectionError::NonexistentSource {
                        group: group_path.clone(),
                        src: conn.source.clone(),
                    }
                } else {
                    ConnectionError::SourceNotOutput {
                        group: group_path.clone(),
                        src: conn.source.clone(),
                    }
                };
                return Err(err.into());
            };
            let targets = vars_named(registry, group_id, &conn.target, VarKind::Input);
            if targets.is_empty() {
                let err = if vars_named(registry, group_id, &conn.target, VarKind::Output).is_empty() {
                    ConnectionError::NonexistentTarget {
                        group: group_path.clone(),
                        target: conn.target.clone(),
                    }
                } else {
                    ConnectionError::TargetNotInput {
                        group: group_path.clone(),
                        target: conn.target.clone(),
                    }
                };
                return Err(err.into());
            }
            for target in targets {
                check_transfer(registry, src, target, conn.src_indices.as_deref())?;
                if let Some(existing) = explicit.get(&target)
                    && existing.output != src
                {
                    return Err(ConnectionError::MultipleSources {
                        input: registry.var(target).path.clone(),
                        first: registry.var(existing.output).path.clone(),
                        second: registry.var(src).path.clone(),
                    }
                    .into());
                }
                explicit.insert(
                    target,
                    Source {
                        output: src,
                        indices: conn.src_indices.clone(),
                    },
                );
            }
        }
    }

    let mut resolved = Vec::new();
    for &id in registry.declared() {
        let var = registry.var(id);
        if var.kind != VarKind::Input {
            continue;
        }
        let implicit = registry
            .resolve(&var.promoted)
            .ok()
            .filter(|&o| registry.var(o).kind == VarKind::Output);
        match (explicit.remove(&id), implicit) {
            (Some(source), Some(other)) if other != source.output => {
                return Err(ConnectionError::MultipleSources {
                    input: var.path.clone(),
                    first: registry.var(other).path.clone(),
                    second: registry.var(source.output).path.clone(),
                }
                .into());
            }
            (Some(source), _) => resolved.push((id, source)),
            (None, Some(output)) => {
                check_transfer(registry, output, id, None)?;
                resolved.push((
                    id,
                    Source {
                        output,
                        indices: None,
                    },
                ));
            }
            (None, None) => {
                return Err(ConnectionError::Unconnected {
                    input: var.path.clone(),
                }
                .into());
            }
        }
    }
    debug!(connections = resolved.len(), "Resolved connections");
    Ok(resolved)
}

struct ScheduleBuilder<'a> {
    model: &'a Model,
    registry: &'a VariableRegistry,
    pending: &'a mut HashMap<SystemId, Pending>,
    components: Vec<ComponentLayout>,
    comm_size: usize,
}

impl ScheduleBuilder<'_> {
    /// Index of the child of `group` that contains `system`, if any.
    fn child_index(&self, group: SystemId, children: &[SystemId], system: SystemId) -> Option<usize> {
        let mut current = system;
        loop {
            let parent = self.model.system(current)?.parent()?;
            if parent == group {
                return children.iter().position(|&c| c == current);
            }
            current = parent;
        }
    }

    /// Data dependencies between distinct children of `group`, as `(source child, reading
    /// child, input)`.
    fn child_edges(&self, group: SystemId, children: &[SystemId]) -> Vec<(usize, usize, VarId)> {
        let mut edges = Vec::new();
        for &input in self.registry.declared() {
            let Some(source) = self.registry.source(input) else {
                continue;
            };
            let to = self.child_index(group, children, self.registry.var(input).owner);
            let from = self.child_index(group, children, self.registry.var(source.output).owner);
            if let (Some(from), Some(to)) = (from, to)
                && from != to
            {
                edges.push((from, to, input));
            }
        }
        edges
    }

    /// Parallel children may run on different ranks at the same time, so none may read
    /// another's output.
    fn check_independent(&self, group: SystemId) -> Result<(), MdoError> {
        let children = self.model.group(group)?.children.clone();
        if let Some(&(_, _, input)) = self.child_edges(group, &children).first() {
            let output = self
                .registry
                .source(input)
                .map(|s| self.registry.var(s.output).path.clone())
                .unwrap_or_default();
            return Err(SetupError::ParallelDependency {
                group: self.model.path(group),
                output,
                input: self.registry.var(input).path.clone(),
            }
            .into());
        }
        Ok(())
    }

    fn ordered_children(&self, group: SystemId) -> Result<Vec<SystemId>, MdoError> {
        let node = self.model.group(group)?;
        let children = node.children.clone();
        let group_path = self.model.path(group);

        if let Some(order) = &node.order {
            let mut ordered = Vec::with_capacity(children.len());
            for name in order {
                let found = children.iter().copied().find(|&c| {
                    self.model.system(c).is_some_and(|n| n.name() == name.as_str())
                });
                match found {
                    Some(c) => ordered.push(c),
                    None => {
                        return Err(SetupError::InvalidOrder {
                            group: group_path,
                            details: format!("unknown [\"{name}\"]"),
                        }
                        .into());
                    }
                }
            }
            if ordered.len() != children.len() {
                return Err(SetupError::InvalidOrder {
                    group: group_path,
                    details: "subsystems were added after the order was set".to_string(),
                }
                .into());
            }
            return Ok(ordered);
        }

        let edges: Vec<(usize, usize)> = self
            .child_edges(group, &children)
            .into_iter()
            .map(|(from, to, _)| (from, to))
            .collect();
        let ordering = topological_order(children.len(), &edges);
        if !ordering.broken.is_empty() {
            let names = |i: usize| self.model.system(children[i]).map_or("", |n| n.name()).to_string();
            let broken: Vec<String> = ordering
                .broken
                .iter()
                .map(|&(a, b)| format!("{} -> {}", names(a), names(b)))
                .collect();
            if node.nonlinear.is_some() {
                debug!(group = %group_path, broken = ?broken, "Broke feedback cycle for ordering");
            } else {
                warn!(
                    group = %group_path,
                    broken = ?broken,
                    "Group contains a feedback cycle but no nonlinear iteration"
                );
            }
        }
        Ok(ordering.order.into_iter().map(|i| children[i]).collect())
    }

    fn build_group(&mut self, group: SystemId, owner: Option<usize>) -> Result<Vec<Step>, MdoError> {
        let node = self.model.group(group)?;
        let kind = node.kind;
        let nonlinear = node.nonlinear;
        let path = self.model.path(group);
        if kind == GroupKind::Parallel {
            self.check_independent(group)?;
        }
        let children = self.ordered_children(group)?;

        let body = if kind == GroupKind::Parallel && owner.is_none() {
            let ranks = assign_round_robin(children.len(), self.comm_size);
            let mut branches = Vec::with_capacity(children.len());
            for (&child, rank) in children.iter().zip(ranks) {
                branches.push((rank, self.build_child(child, Some(rank))?));
            }
            vec![Step::Parallel {
                path: path.clone(),
                branches,
            }]
        } else {
            let mut steps = Vec::new();
            for &child in &children {
                steps.extend(self.build_child(child, owner)?);
            }
            steps
        };

        Ok(match nonlinear {
            Some(settings) => vec![Step::Iterate {
                path,
                settings,
                body,
            }],
            None => body,
        })
    }

    fn build_child(&mut self, child: SystemId, owner: Option<usize>) -> Result<Vec<Step>, MdoError> {
        let is_group = self.model.system(child).is_some_and(|n| n.is_group());
        if is_group {
            return self.build_group(child, owner);
        }
        let Some(p) = self.pending.get(&child) else {
            return Err(SetupError::UnknownSystem.into());
        };
        let path = self.model.path(child);
        if let Some(fd) = &p.decl.fd {
            validate_fd(fd).map_err(|e| ConfigError::Component {
                component: path.clone(),
                source: Box::new(e),
            })?;
        }
        let index = self.components.len();
        self.components.push(ComponentLayout {
            id: child,
            path,
            inputs: p.inputs.clone(),
            outputs: p.outputs.clone(),
            partials: Vec::new(),
            implicit: p.implicit,
            independent: p.independent,
            fd: p.decl.fd,
            force_fd: p.decl.force_fd,
            owner,
        });
        Ok(vec![Step::Run(index)])
    }
}

fn top_level_blocks(
    model: &Model,
    registry: &VariableRegistry,
    components: &[ComponentLayout],
) -> Vec<Range<usize>> {
    let root = model.root();
    let mut blocks: Vec<(SystemId, Range<usize>)> = Vec::new();
    for layout in components {
        let mut top = layout.id;
        while let Some(parent) = model.system(top).and_then(|n| n.parent()) {
            if parent == root {
                break;
            }
            top = parent;
        }
        for &out in &layout.outputs {
            let range = registry.range(out);
            match blocks.last_mut() {
                Some((sys, block)) if *sys == top => block.end = range.end,
                _ => blocks.push((top, range)),
            }
        }
    }
    blocks.into_iter().map(|(_, r)| r).collect()
}

fn declare_partials(
    registry: &VariableRegistry,
    jacobian: &mut JacobianStore,
    layout: &ComponentLayout,
    decl: &Declarations,
) -> Result<Vec<ResolvedPartial>, MdoError> {
    if !layout.implicit {
        for &out in &layout.outputs {
            jacobian.add_identity(out);
        }
    }

    let mut resolved: Vec<ResolvedPartial> = Vec::new();
    for pd in &decl.partials {
        let ofs: Vec<usize> = layout
            .outputs
            .iter()
            .enumerate()
            .filter(|&(_, &v)| matches_pattern(&pd.of, &registry.var(v).local))
            .map(|(i, _)| i)
            .collect();
        let mut wrts: Vec<WrtRef> = layout
            .inputs
            .iter()
            .enumerate()
            .filter(|&(_, &v)| matches_pattern(&pd.wrt, &registry.var(v).local))
            .map(|(i, _)| WrtRef::Input(i))
            .collect();
        if layout.implicit {
            wrts.extend(
                layout
                    .outputs
                    .iter()
                    .enumerate()
                    .filter(|&(_, &v)| matches_pattern(&pd.wrt, &registry.var(v).local))
                    .map(|(i, _)| WrtRef::Output(i)),
            );
        }
        if ofs.is_empty() || wrts.is_empty() {
            return Err(SetupError::InvalidPartial {
                component: layout.path.clone(),
                of: pd.of.clone(),
                wrt: pd.wrt.clone(),
            }
            .into());
        }
        for &of in &ofs {
            for &wrt in &wrts {
                jacobian.declare(
                    registry,
                    layout.outputs[of],
                    layout.wrt_var(wrt),
                    pd.pattern.clone(),
                    layout.id,
                )?;
                let entry = ResolvedPartial {
                    of,
                    wrt,
                    pattern: pd.pattern.clone(),
                };
                match resolved.iter_mut().find(|r| r.of == of && r.wrt == wrt) {
                    Some(existing) => *existing = entry,
                    None => resolved.push(entry),
                }
            }
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::component::IndepVarComp;
    use crate::core::registry::UnknownVariableError;
    use crate::testing::{Scale, sellar_model};

    fn chain_model() -> Model {
        let mut model = Model::new();
        let root = model.root();
        model
            .add_component(root, "p", IndepVarComp::scalar("x", 1.0), &["x"])
            .unwrap();
        model
            .add_component(root, "A", Scale::new("x", "y", 2.0), &["x", "y"])
            .unwrap();
        model
            .add_component(root, "B", Scale::new("y", "z", 3.0), &["y", "z"])
            .unwrap();
        model
    }

    mod connections {
        use super::*;

        #[test]
        fn promoted_names_connect_implicitly() {
            let asm = assemble(chain_model(), 1).unwrap();
            let reg = &asm.registry;
            let a_in = reg.resolve("A.x").unwrap();
            let source = reg.source(a_in).unwrap();
            assert_eq!(reg.var(source.output).path, "p.x");
            assert_eq!(reg.resolve("y").unwrap(), reg.resolve("A.y").unwrap());
        }

        #[test]
        fn unconnected_input_fails_before_anything_runs() {
            let mut model = Model::new();
            let root = model.root();
            model
                .add_component(root, "A", Scale::new("x", "y", 2.0), &[])
                .unwrap();
            let err = assemble(model, 1).err().unwrap();
            assert!(matches!(
                err,
                MdoError::Connection(ConnectionError::Unconnected { input }) if input == "A.x"
            ));
        }

        #[test]
        fn explicit_connection_between_unpromoted_variables() {
            let mut model = Model::new();
            let root = model.root();
            model
                .add_component(root, "p", IndepVarComp::scalar("x", 1.0), &[])
                .unwrap();
            model
                .add_component(root, "A", Scale::new("x", "y", 2.0), &[])
                .unwrap();
            model.connect(root, "p.x", "A.x").unwrap();
            let asm = assemble(model, 1).unwrap();
            let a_in = asm.registry.resolve("A.x").unwrap();
            assert!(asm.registry.source(a_in).is_some());
        }

        #[test]
        fn connection_errors_are_specific() {
            let cases: Vec<(&str, &str, fn(&ConnectionError) -> bool)> = vec![
                ("p.nope", "A.x", |e| matches!(e, ConnectionError::NonexistentSource { .. })),
                ("p.x", "A.nope", |e| matches!(e, ConnectionError::NonexistentTarget { .. })),
                ("A.x", "A.x", |e| matches!(e, ConnectionError::SourceNotOutput { .. })),
                ("p.x", "A.y", |e| matches!(e, ConnectionError::TargetNotInput { .. })),
            ];
            for (src, target, check) in cases {
                let mut model = Model::new();
                let root = model.root();
                model
                    .add_component(root, "p", IndepVarComp::scalar("x", 1.0), &[])
                    .unwrap();
                model
                    .add_component(root, "A", Scale::new("x", "y", 2.0), &[])
                    .unwrap();
                model.connect(root, src, target).unwrap();
                match assemble(model, 1) {
                    Err(MdoError::Connection(e)) => assert!(check(&e), "{src} -> {target}: {e}"),
                    Err(other) => panic!("{src} -> {target}: unexpected {other}"),
                    Ok(_) => panic!("{src} -> {target}: expected an error"),
                }
            }
        }

        #[test]
        fn shape_mismatch_and_bad_indices_are_rejected() {
            let build = |indices: Option<Vec<usize>>| {
                let mut model = Model::new();
                let root = model.root();
                model
                    .add_component(root, "p", IndepVarComp::new().with_output("v", vec![1.0, 2.0]), &[])
                    .unwrap();
                model
                    .add_component(root, "A", Scale::new("x", "y", 2.0), &[])
                    .unwrap();
                match indices {
                    Some(ix) => model.connect_indices(root, "p.v", "A.x", ix).unwrap(),
                    None => model.connect(root, "p.v", "A.x").unwrap(),
                }
                assemble(model, 1)
            };
            assert!(matches!(
                build(None).err().unwrap(),
                MdoError::Connection(ConnectionError::ShapeMismatch { .. })
            ));
            assert!(matches!(
                build(Some(vec![2])).err().unwrap(),
                MdoError::Connection(ConnectionError::IndexOutOfRange { index: 2, size: 2, .. })
            ));
            assert!(build(Some(vec![1])).is_ok());
        }

        #[test]
        fn explicit_and_implicit_sources_conflict() {
            let mut model = Model::new();
            let root = model.root();
            model
                .add_component(root, "p", IndepVarComp::scalar("x", 1.0), &["x"])
                .unwrap();
            model
                .add_component(root, "q", IndepVarComp::scalar("w", 1.0), &[])
                .unwrap();
            model
                .add_component(root, "A", Scale::new("x", "y", 2.0), &["x"])
                .unwrap();
            model.connect(root, "q.w", "x").unwrap();
            assert!(matches!(
                assemble(model, 1).err().unwrap(),
                MdoError::Connection(ConnectionError::MultipleSources { .. })
            ));
        }
    }

    mod namespaces {
        use super::*;

        #[test]
        fn promoted_output_collision_is_a_duplicate() {
            let mut model = Model::new();
            let root = model.root();
            model
                .add_component(root, "p", IndepVarComp::scalar("x", 1.0), &["x"])
                .unwrap();
            model
                .add_component(root, "q", IndepVarComp::scalar("x", 2.0), &["*"])
                .unwrap();
            let err = assemble(model, 1).err().unwrap();
            assert!(matches!(err, MdoError::DuplicateVariable(d) if d.name == "x"));
        }

        #[test]
        fn nested_groups_prefix_unpromoted_names() {
            let mut model = Model::new();
            let root = model.root();
            let sub = model.add_group(root, "sub", GroupKind::Serial, &[]).unwrap();
            model
                .add_component(sub, "p", IndepVarComp::scalar("x", 1.0), &["x"])
                .unwrap();
            let asm = assemble(model, 1).unwrap();
            let x = asm.registry.resolve("sub.x").unwrap();
            assert_eq!(asm.registry.var(x).path, "sub.p.x");
            assert_eq!(asm.registry.var(x).promoted, "sub.x");

            let err: UnknownVariableError = asm.registry.resolve("sub.p.q").unwrap_err();
            assert_eq!(err.scope, "sub.p");
            assert_eq!(err.remainder, "q");
        }
    }

    mod scheduling {
        use super::*;

        #[test]
        fn data_dependencies_reorder_children() {
            let mut model = Model::new();
            let root = model.root();
            model
                .add_component(root, "B", Scale::new("y", "z", 3.0), &["y", "z"])
                .unwrap();
            model
                .add_component(root, "A", Scale::new("x", "y", 2.0), &["x", "y"])
                .unwrap();
            model
                .add_component(root, "p", IndepVarComp::scalar("x", 1.0), &["x"])
                .unwrap();
            let asm = assemble(model, 1).unwrap();
            let order: Vec<&str> = asm.components.iter().map(|c| c.path.as_str()).collect();
            assert_eq!(order, vec!["p", "A", "B"]);
            assert_eq!(asm.blocks, vec![0..1, 1..2, 2..3]);
        }

        #[test]
        fn explicit_order_is_respected() {
            let mut model = chain_model();
            let root = model.root();
            model.set_order(root, &["B", "p", "A"]).unwrap();
            let asm = assemble(model, 1).unwrap();
            let order: Vec<&str> = asm.components.iter().map(|c| c.path.as_str()).collect();
            assert_eq!(order, vec!["B", "p", "A"]);
        }

        #[test]
        fn coupled_group_is_wrapped_in_iteration() {
            let asm = assemble(sellar_model(), 1).unwrap();
            let iterate = asm
                .schedule
                .iter()
                .find(|s| matches!(s, Step::Iterate { .. }))
                .unwrap();
            let Step::Iterate { path, body, .. } = iterate else {
                unreachable!()
            };
            assert_eq!(path, "cycle");
            let names: Vec<&str> = Step::components(body)
                .into_iter()
                .map(|i| asm.components[i].path.as_str())
                .collect();
            assert_eq!(names, vec!["cycle.d1", "cycle.d2"]);
        }

        #[test]
        fn parallel_children_are_spread_round_robin() {
            let mut model = Model::new();
            let root = model.root();
            model
                .add_component(root, "p", IndepVarComp::scalar("x", 1.0), &["x"])
                .unwrap();
            let par = model
                .add_group(root, "par", GroupKind::Parallel, &["*"])
                .unwrap();
            for (name, out) in [("a", "ya"), ("b", "yb"), ("c", "yc")] {
                model
                    .add_component(par, name, Scale::new("x", out, 1.0), &["x", out])
                    .unwrap();
            }
            let asm = assemble(model, 2).unwrap();
            let owners: Vec<Option<usize>> = asm.components.iter().map(|c| c.owner).collect();
            assert_eq!(owners, vec![None, Some(0), Some(1), Some(0)]);
        }
        #[test]
        fn parallel_siblings_reading_each_other_are_rejected() {
            for size in [1, 2] {
                let err = assemble(dependent_parallel_model(), size).err().unwrap();
                assert!(
                    matches!(
                        &err,
                        MdoError::Setup(SetupError::ParallelDependency { group, output, input })
                            if group == "par" && output == "par.A.y" && input == "par.B.y"
                    ),
                    "{err}"
                );
            }
        }

        fn dependent_parallel_model() -> Model {
            let mut model = Model::new();
            let root = model.root();
            model
                .add_component(root, "p", IndepVarComp::scalar("x", 1.0), &["x"])
                .unwrap();
            let par = model
                .add_group(root, "par", GroupKind::Parallel, &["*"])
                .unwrap();
            model
                .add_component(par, "A", Scale::new("x", "y", 2.0), &["x", "y"])
                .unwrap();
            model
                .add_component(par, "B", Scale::new("y", "z", 3.0), &["y", "z"])
                .unwrap();
            model
        }

        #[test]
        fn nested_parallel_group_is_checked_too() {
            let mut model = Model::new();
            let root = model.root();
            model
                .add_component(root, "p", IndepVarComp::scalar("x", 1.0), &["x"])
                .unwrap();
            let outer = model
                .add_group(root, "outer", GroupKind::Parallel, &["*"])
                .unwrap();
            let inner = model
                .add_group(outer, "inner", GroupKind::Parallel, &["*"])
                .unwrap();
            model
                .add_component(inner, "A", Scale::new("x", "y", 2.0), &["x", "y"])
                .unwrap();
            model
                .add_component(inner, "B", Scale::new("y", "z", 3.0), &["y", "z"])
                .unwrap();
            let err = assemble(model, 2).err().unwrap();
            assert!(matches!(
                err,
                MdoError::Setup(SetupError::ParallelDependency { ref group, .. }) if group == "outer.inner"
            ));
        }

        #[test]
        fn component_fd_options_are_validated() {
            let mut model = Model::new();
            let root = model.root();
            model
                .add_component(root, "p", IndepVarComp::scalar("x", 1.0), &["x"])
                .unwrap();
            let zero_step = FdConfig {
                step_size: 0.0,
                ..FdConfig::default()
            };
            model
                .add_component(
                    root,
                    "A",
                    Scale::new("x", "y", 2.0).with_fd_options(zero_step),
                    &["x", "y"],
                )
                .unwrap();
            let err = assemble(model, 1).err().unwrap();
            match err {
                MdoError::Config(ConfigError::Component { component, source }) => {
                    assert_eq!(component, "A");
                    assert!(matches!(
                        *source,
                        ConfigError::InvalidParameter { name, .. } if name == "fd_step_size"
                    ));
                }
                other => panic!("expected a configuration error, got {other:?}"),
            }
        }
    }

    mod partials {
        use super::*;

        #[test]
        fn explicit_outputs_get_identity_and_declared_blocks() {
            let asm = assemble(chain_model(), 1).unwrap();
            let reg = &asm.registry;
            let y = reg.resolve("y").unwrap();
            let a_x = reg.resolve("A.x").unwrap();
            assert!(!asm.jacobian.is_structural_zero(y, a_x));
            assert!(asm.jacobian.is_structural_zero(y, reg.resolve("z").unwrap()));
            let dense = asm.jacobian.get_operator(reg, asm.blocks.clone()).to_dense();
            assert_eq!(dense[(1, 1)], 1.0);
        }

        #[test]
        fn partial_matching_nothing_is_rejected() {
            struct BadPartials;
            impl crate::core::models::component::Component for BadPartials {
                fn declare(&self, decl: &mut Declarations) {
                    decl.add_output_with_value("y", 1, vec![0.0])
                        .declare_partials("y", "missing");
                }
                fn compute(
                    &self,
                    _: &crate::core::models::variable::VarSet<f64>,
                    _: &mut crate::core::models::variable::VarSet<f64>,
                ) -> Result<(), crate::core::models::component::ComponentError> {
                    Ok(())
                }
            }
            let mut model = Model::new();
            let root = model.root();
            model.add_component(root, "bad", BadPartials, &[]).unwrap();
            assert!(matches!(
                assemble(model, 1).err().unwrap(),
                MdoError::Setup(SetupError::InvalidPartial { .. })
            ));
        }
    }
}
