use std::collections::HashMap;

use tracing::debug;

use finflow_core::definition::{StepSpec, WorkflowDefinition};
use finflow_core::error::GraphError;

use super::plan::ExecutionPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Compile a definition into an [`ExecutionPlan`].
///
/// Validation order: empty workflow, step settings and duplicate names,
/// dangling references, cycles. The first problem found is returned.
pub fn compile(definition: &WorkflowDefinition) -> Result<ExecutionPlan, GraphError> {
    if definition.steps.is_empty() {
        return Err(GraphError::Empty(definition.id.clone()));
    }

    let mut index: HashMap<&str, usize> = HashMap::with_capacity(definition.steps.len());
    for (i, step) in definition.steps.iter().enumerate() {
        validate_step(i, step)?;
        if index.insert(step.name.as_str(), i).is_some() {
            return Err(GraphError::DuplicateStep(step.name.clone()));
        }
    }

    // edges[i] = indices of the steps that step i depends on
    let mut edges: Vec<Vec<usize>> = Vec::with_capacity(definition.steps.len());
    for step in &definition.steps {
        let mut deps = Vec::with_capacity(step.depends_on.len());
        for dep in &step.depends_on {
            let j = *index.get(dep.as_str()).ok_or_else(|| GraphError::DanglingDependency {
                step: step.name.clone(),
                dependency: dep.clone(),
            })?;
            if !deps.contains(&j) {
                deps.push(j);
            }
        }
        edges.push(deps);
    }

    if let Some(cycle) = find_cycle(&edges) {
        return Err(GraphError::Cycle {
            cycle: cycle
                .into_iter()
                .map(|i| definition.steps[i].name.clone())
                .collect(),
        });
    }

    let waves = layer(&edges).map_err(|stuck| GraphError::Cycle {
        cycle: stuck
            .into_iter()
            .map(|i| definition.steps[i].name.clone())
            .collect(),
    })?;

    let waves: Vec<Vec<String>> = waves
        .into_iter()
        .map(|wave| {
            wave.into_iter()
                .map(|i| definition.steps[i].name.clone())
                .collect()
        })
        .collect();

    let dependencies = definition
        .steps
        .iter()
        .zip(&edges)
        .map(|(step, deps)| {
            let names = deps
                .iter()
                .map(|&j| definition.steps[j].name.clone())
                .collect();
            (step.name.clone(), names)
        })
        .collect();

    debug!(
        workflow_id = %definition.id,
        steps = definition.steps.len(),
        waves = waves.len(),
        "Compiled workflow"
    );

    Ok(ExecutionPlan::new(definition.id.clone(), waves, dependencies))
}

fn validate_step(position: usize, step: &StepSpec) -> Result<(), GraphError> {
    let invalid = |reason: String| GraphError::InvalidStep {
        step: if step.name.is_empty() {
            format!("#{}", position)
        } else {
            step.name.clone()
        },
        reason,
    };

    if step.name.trim().is_empty() {
        return Err(invalid("step name is empty".into()));
    }
    if step.agent_type.trim().is_empty() {
        return Err(invalid("agent_type is empty".into()));
    }
    if step.timeout_ms == Some(0) {
        return Err(invalid("timeout must be greater than zero".into()));
    }
    if let Some(retry) = &step.retry {
        retry.validate().map_err(invalid)?;
    }
    Ok(())
}

/// Depth-first search with recursion-stack marking.
///
/// Returns the first cycle found as a path that starts and ends on the same
/// step, e.g. `[a, b, a]`.
fn find_cycle(edges: &[Vec<usize>]) -> Option<Vec<usize>> {
    fn visit(
        node: usize,
        edges: &[Vec<usize>],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::OnStack;
        stack.push(node);

        for &next in &edges[node] {
            match marks[next] {
                Mark::OnStack => {
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(next, edges, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::Unvisited; edges.len()];
    let mut stack = Vec::new();
    for node in 0..edges.len() {
        if marks[node] == Mark::Unvisited {
            if let Some(cycle) = visit(node, edges, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Kahn layering: each wave holds every step whose remaining dependency
/// count is zero once all earlier waves are placed.
///
/// On a residual cycle, returns the indices that could not be placed.
fn layer(edges: &[Vec<usize>]) -> Result<Vec<Vec<usize>>, Vec<usize>> {
    let n = edges.len();
    let mut remaining: Vec<usize> = edges.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![vec![]; n];
    for (step, deps) in edges.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(step);
        }
    }

    let mut waves = Vec::new();
    let mut current: Vec<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
    let mut placed = 0;

    while !current.is_empty() {
        placed += current.len();
        let mut next = Vec::new();
        for &step in &current {
            for &dependent in &dependents[step] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort_unstable();
        waves.push(current);
        current = next;
    }

    if placed < n {
        return Err((0..n).filter(|&i| remaining[i] > 0).collect());
    }
    Ok(waves)
}
