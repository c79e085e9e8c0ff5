use crate::error::{EngineError, Result};
use crate::workflow::registry::StepRegistry;
use crate::workflow::types::*;
use std::collections::{HashMap, HashSet};

/// Check a workflow before anything runs: required fields, unique step ids,
/// known dependencies, acyclic graph, and a registered executor per step type.
pub fn validate_workflow(workflow: &Workflow, registry: &StepRegistry) -> Result<()> {
    if workflow.id.trim().is_empty() {
        return Err(EngineError::Validation("workflow id is missing".into()));
    }
    if workflow.steps.is_empty() {
        return Err(EngineError::Validation(format!(
            "workflow {} has no steps",
            workflow.id
        )));
    }

    let mut steps: HashMap<&str, &WorkflowStep> = HashMap::new();
    for step in &workflow.steps {
        if step.id.trim().is_empty() {
            return Err(EngineError::Validation(format!(
                "workflow {} has a step without an id",
                workflow.id
            )));
        }
        if steps.insert(step.id.as_str(), step).is_some() {
            return Err(EngineError::Validation(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
    }

    for step in &workflow.steps {
        for dep in &step.dependencies {
            if !steps.contains_key(dep.as_str()) {
                return Err(EngineError::Validation(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
        }
    }

    if let Some(cycle) = find_cycle(workflow, &steps) {
        return Err(EngineError::Validation(format!(
            "dependency cycle: {}",
            cycle.join(" -> ")
        )));
    }

    for step in &workflow.steps {
        if !registry.has_capability(&step.step_type) {
            return Err(EngineError::Validation(format!(
                "step '{}' has unknown type '{}'",
                step.id, step.step_type
            )));
        }
    }

    Ok(())
}

/// Depth-first search with a recursion stack; returns the first cycle found
fn find_cycle<'a>(
    workflow: &'a Workflow,
    steps: &HashMap<&'a str, &'a WorkflowStep>,
) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut path = Vec::new();

    for step in &workflow.steps {
        if let Some(cycle) = visit(step.id.as_str(), steps, &mut visited, &mut path) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    step_id: &'a str,
    steps: &HashMap<&'a str, &'a WorkflowStep>,
    visited: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    if let Some(start) = path.iter().position(|id| *id == step_id) {
        let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
        cycle.push(step_id.to_string());
        return Some(cycle);
    }
    if !visited.insert(step_id) {
        return None;
    }

    path.push(step_id);
    if let Some(&step) = steps.get(step_id) {
        for dep in &step.dependencies {
            if let Some(cycle) = visit(dep.as_str(), steps, visited, path) {
                return Some(cycle);
            }
        }
    }
    path.pop();
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> StepRegistry {
        StepRegistry::with_builtins()
    }

    #[test]
    fn test_valid_diamond() {
        let workflow = Workflow::new(
            "diamond",
            vec![
                WorkflowStep::new("a", "echo"),
                WorkflowStep::new("b", "echo").depends_on("a"),
                WorkflowStep::new("c", "echo").depends_on("a"),
                WorkflowStep::new("d", "echo").depends_on("b").depends_on("c"),
            ],
        );
        assert!(validate_workflow(&workflow, &registry()).is_ok());
    }

    #[test]
    fn test_missing_fields() {
        let no_id = Workflow::new("", vec![WorkflowStep::new("a", "echo")]);
        assert!(matches!(
            validate_workflow(&no_id, &registry()),
            Err(EngineError::Validation(_))
        ));

        let no_steps = Workflow::new("empty", vec![]);
        assert!(validate_workflow(&no_steps, &registry()).is_err());
    }

    #[test]
    fn test_cycle_detected() {
        let workflow = Workflow::new(
            "loop",
            vec![
                WorkflowStep::new("a", "echo").depends_on("c"),
                WorkflowStep::new("b", "echo").depends_on("a"),
                WorkflowStep::new("c", "echo").depends_on("b"),
            ],
        );
        let err = validate_workflow(&workflow, &registry()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("cycle"), "{}", message);
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let workflow = Workflow::new("selfie", vec![WorkflowStep::new("a", "echo").depends_on("a")]);
        assert!(validate_workflow(&workflow, &registry()).is_err());
    }

    #[test]
    fn test_unknown_type_and_dependency() {
        let unknown_type = Workflow::new("t", vec![WorkflowStep::new("a", "teleport")]);
        let err = validate_workflow(&unknown_type, &registry()).unwrap_err();
        assert!(err.to_string().contains("teleport"));

        let unknown_dep = Workflow::new("d", vec![WorkflowStep::new("a", "echo").depends_on("z")]);
        assert!(validate_workflow(&unknown_dep, &registry()).is_err());
    }

    #[test]
    fn test_duplicate_step_ids() {
        let workflow = Workflow::new(
            "dups",
            vec![WorkflowStep::new("a", "echo"), WorkflowStep::new("a", "echo")],
        );
        assert!(validate_workflow(&workflow, &registry()).is_err());
    }
}
