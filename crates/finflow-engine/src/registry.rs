use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use finflow_core::definition::{StepSpec, WorkflowDefinition};
use finflow_core::error::{FinflowError, Result};
use finflow_core::traits::{Agent, AgentFactory};

use crate::graph::{compile, ExecutionPlan};

/// Maps agent type names to factories.
///
/// A factory receives the step's `config` and builds the agent that runs it.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    factories: HashMap<String, AgentFactory>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one for the same type.
    pub fn register<F>(&mut self, agent_type: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> std::result::Result<Arc<dyn Agent>, finflow_core::AgentError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(agent_type.into(), Arc::new(factory));
    }

    /// Register one shared agent instance that ignores step config.
    pub fn register_instance(&mut self, agent_type: impl Into<String>, agent: Arc<dyn Agent>) {
        self.register(agent_type, move |_| Ok(agent.clone()));
    }

    pub fn unregister(&mut self, agent_type: &str) -> bool {
        self.factories.remove(agent_type).is_some()
    }

    pub fn contains(&self, agent_type: &str) -> bool {
        self.factories.contains_key(agent_type)
    }

    /// Registered agent types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Build the agent for one step.
    pub fn instantiate(&self, step: &StepSpec) -> Result<Arc<dyn Agent>> {
        let factory = self
            .factories
            .get(&step.agent_type)
            .ok_or_else(|| FinflowError::UnknownAgentType {
                step: step.name.clone(),
                agent_type: step.agent_type.clone(),
            })?;
        factory(&step.config).map_err(|e| FinflowError::AgentConstruction {
            step: step.name.clone(),
            agent_type: step.agent_type.clone(),
            message: e.message,
        })
    }

    /// Compile the definition and resolve an agent for every step.
    ///
    /// Fails before anything runs if the graph is invalid or any agent type
    /// is unknown.
    pub fn prepare(&self, definition: Arc<WorkflowDefinition>) -> Result<PreparedWorkflow> {
        let plan = compile(&definition)?;
        let mut steps = HashMap::with_capacity(definition.steps.len());
        for spec in &definition.steps {
            let agent = self.instantiate(spec)?;
            steps.insert(
                spec.name.clone(),
                ResolvedStep {
                    spec: Arc::new(spec.clone()),
                    agent,
                },
            );
        }
        debug!(
            workflow = %definition.id,
            steps = steps.len(),
            waves = plan.num_waves(),
            "Prepared workflow"
        );
        Ok(PreparedWorkflow {
            definition,
            plan,
            steps,
        })
    }
}

/// A step paired with the agent that will run it.
#[derive(Clone)]
pub struct ResolvedStep {
    pub spec: Arc<StepSpec>,
    pub agent: Arc<dyn Agent>,
}

/// A validated workflow with its execution plan and resolved agents.
#[derive(Clone)]
pub struct PreparedWorkflow {
    pub definition: Arc<WorkflowDefinition>,
    pub plan: ExecutionPlan,
    pub steps: HashMap<String, ResolvedStep>,
}

impl PreparedWorkflow {
    pub fn step(&self, name: &str) -> Option<&ResolvedStep> {
        self.steps.get(name)
    }

    pub fn workflow_id(&self) -> &str {
        &self.definition.id
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finflow_core::error::{AgentError, GraphError};
    use finflow_test_utils::MockAgent;
    use serde_json::json;

    fn registry() -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        registry.register_instance("echo", MockAgent::echo().shared());
        registry.register("constant", |config| {
            let value = config
                .get("value")
                .cloned()
                .ok_or_else(|| AgentError::fatal("missing 'value'"))?;
            Ok(MockAgent::returning(value).shared() as Arc<dyn Agent>)
        });
        registry
    }

    #[test]
    fn test_register_and_list() {
        let mut registry = registry();
        assert_eq!(registry.list(), vec!["constant", "echo"]);
        assert!(registry.contains("echo"));
        assert!(registry.unregister("echo"));
        assert!(!registry.unregister("echo"));
        assert_eq!(registry.list(), vec!["constant"]);
    }

    #[test]
    fn test_prepare_resolves_all_steps() {
        let def = WorkflowDefinition::new("wf")
            .with_step(StepSpec::new("a", "echo"))
            .with_step(StepSpec::new("b", "constant").with_config(json!({"value": 7})).depends_on(["a"]));
        let prepared = registry().prepare(Arc::new(def)).unwrap();
        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared.plan.waves(), &[vec!["a".to_string()], vec!["b".to_string()]]);
        assert!(prepared.step("b").is_some());
    }

    #[test]
    fn test_unknown_agent_type() {
        let def = WorkflowDefinition::new("wf").with_step(StepSpec::new("a", "llm"));
        let err = registry().prepare(Arc::new(def)).err().unwrap();
        assert!(matches!(
            err,
            FinflowError::UnknownAgentType { ref step, ref agent_type } if step == "a" && agent_type == "llm"
        ));
    }

    #[test]
    fn test_factory_error_is_reported() {
        let def = WorkflowDefinition::new("wf").with_step(StepSpec::new("a", "constant"));
        let err = registry().prepare(Arc::new(def)).err().unwrap();
        match err {
            FinflowError::AgentConstruction { message, .. } => assert!(message.contains("value")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_graph_errors_come_first() {
        let def = WorkflowDefinition::new("wf")
            .with_step(StepSpec::new("a", "llm").depends_on(["b"]))
            .with_step(StepSpec::new("b", "llm").depends_on(["a"]));
        let err = registry().prepare(Arc::new(def)).err().unwrap();
        assert!(matches!(err, FinflowError::Graph(GraphError::Cycle { .. })));
    }
}
