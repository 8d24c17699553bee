use std::collections::HashMap;

/// Compiled, validated execution order for a workflow definition.
///
/// Every step appears in exactly one wave. Steps within a wave are listed
/// in declaration order, which has no semantic meaning: they are
/// independent and may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    workflow_id: String,
    waves: Vec<Vec<String>>,
    dependencies: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
    wave_index: HashMap<String, usize>,
}

impl ExecutionPlan {
    pub(crate) fn new(
        workflow_id: String,
        waves: Vec<Vec<String>>,
        dependencies: HashMap<String, Vec<String>>,
    ) -> Self {
        let mut dependents: HashMap<String, Vec<String>> =
            dependencies.keys().map(|k| (k.clone(), vec![])).collect();
        let mut wave_index = HashMap::new();

        for (index, wave) in waves.iter().enumerate() {
            for step in wave {
                wave_index.insert(step.clone(), index);
            }
        }
        // Walk in wave order so dependents come out in execution order.
        for step in waves.iter().flatten() {
            for dep in dependencies.get(step).into_iter().flatten() {
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(step.clone());
                }
            }
        }

        Self {
            workflow_id,
            waves,
            dependencies,
            dependents,
            wave_index,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    pub fn num_waves(&self) -> usize {
        self.waves.len()
    }

    /// Number of steps in the plan.
    pub fn len(&self) -> usize {
        self.wave_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wave_index.is_empty()
    }

    pub fn contains(&self, step: &str) -> bool {
        self.wave_index.contains_key(step)
    }

    /// Zero-based wave the step runs in.
    pub fn wave_of(&self, step: &str) -> Option<usize> {
        self.wave_index.get(step).copied()
    }

    /// Direct (deduplicated) dependencies of a step.
    pub fn dependencies(&self, step: &str) -> &[String] {
        self.dependencies.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Steps that directly depend on `step`.
    pub fn dependents(&self, step: &str) -> &[String] {
        self.dependents.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All steps flattened wave by wave; a valid topological order.
    pub fn topological_order(&self) -> impl Iterator<Item = &str> {
        self.waves.iter().flatten().map(String::as_str)
    }
}
