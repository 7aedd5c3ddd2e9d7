//! Definition-time validation.
//!
//! Runs before anything is persisted: a rejected plan leaves no trace.

use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};

use super::model::{PlanDefinition, StageDefinition, SuccessorKind};
use crate::rpc::ResultCode;
use crate::trigger::TriggerSpec;
use crate::types::{Error, Result};

/// Validate a whole plan definition.
pub fn validate(plan: &PlanDefinition) -> Result<()> {
    if plan.name.trim().is_empty() {
        return Err(Error::validation("plan name must not be empty"));
    }
    if plan.stages.is_empty() && !plan.dynamic {
        return Err(Error::validation(format!(
            "plan '{}' declares no stages",
            plan.name
        )));
    }

    let mut seen = HashSet::new();
    for stage in &plan.stages {
        if !seen.insert(stage.name.as_str()) {
            return Err(Error::validation(format!(
                "duplicate stage name '{}'",
                stage.name
            )));
        }
    }

    for stage in &plan.stages {
        validate_stage(stage, plan.dynamic)?;
    }

    validate_dependencies(plan)
}

fn validate_stage(stage: &StageDefinition, dynamic: bool) -> Result<()> {
    if stage.name.trim().is_empty() {
        return Err(Error::validation("stage name must not be empty"));
    }
    TriggerSpec::parse(stage.trigger_type, &stage.trigger_args).map_err(|e| {
        Error::validation(format!("stage '{}': {}", stage.name, e))
    })?;

    if stage.steps.is_empty() {
        if dynamic {
            return Ok(());
        }
        return Err(Error::validation(format!(
            "stage '{}' declares no steps",
            stage.name
        )));
    }

    let mut names = HashSet::new();
    for step in &stage.steps {
        if step.name.trim().is_empty() {
            return Err(Error::validation(format!(
                "stage '{}': step name must not be empty",
                stage.name
            )));
        }
        if step.module.trim().is_empty() {
            return Err(Error::validation(format!(
                "step '{}.{}': module must not be empty",
                stage.name, step.name
            )));
        }
        if !names.insert(step.name.as_str()) {
            return Err(Error::validation(format!(
                "stage '{}': duplicate step name '{}'",
                stage.name, step.name
            )));
        }
    }

    if !stage.steps.iter().any(|s| s.is_init) {
        return Err(Error::validation(format!(
            "stage '{}' has no initial step",
            stage.name
        )));
    }

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &stage.steps {
        let children = adjacency.entry(step.name.as_str()).or_default();
        for edge in &step.next {
            validate_edge_value(&stage.name, &step.name, edge.kind, edge.value.as_deref())?;
            let targets = edge.step.names();
            if targets.is_empty() {
                return Err(Error::validation(format!(
                    "step '{}.{}': successor without target",
                    stage.name, step.name
                )));
            }
            for target in targets {
                if !names.contains(target) {
                    return Err(Error::validation(format!(
                        "step '{}.{}': unknown successor '{}'",
                        stage.name, step.name, target
                    )));
                }
                children.push(target);
            }
        }
    }

    let order: Vec<&str> = stage.steps.iter().map(|s| s.name.as_str()).collect();
    if let Some(cycle) = find_cycle(&order, &adjacency) {
        return Err(Error::cycle_detected(format!(
            "stage '{}': {}",
            stage.name,
            cycle.join(" -> ")
        )));
    }

    let roots = stage.steps.iter().filter(|s| s.is_init).map(|s| s.name.as_str());
    let reachable = reachable_from(roots, &adjacency);
    if let Some(step) = stage.steps.iter().find(|s| !reachable.contains(s.name.as_str())) {
        return Err(Error::unreachable_step(format!(
            "step '{}.{}' is not reachable from any initial step",
            stage.name, step.name
        )));
    }

    Ok(())
}

fn validate_edge_value(stage: &str, step: &str, kind: SuccessorKind, value: Option<&str>) -> Result<()> {
    match (kind, value) {
        (SuccessorKind::Any, _) => Ok(()),
        (_, None) => Err(Error::validation(format!(
            "step '{}.{}': successor of type {:?} requires a value",
            stage, step, kind
        ))),
        (SuccessorKind::Result, Some(value)) => ResultCode::parse(value).map(|_| ()).ok_or_else(|| {
            Error::validation(format!(
                "step '{}.{}': unknown result '{}', expected ok|fail|error|stopped",
                stage, step, value
            ))
        }),
        (SuccessorKind::Output | SuccessorKind::SerializedOutput, Some(pattern)) => Regex::new(pattern)
            .map(|_| ())
            .map_err(|e| {
                Error::validation(format!(
                    "step '{}.{}': invalid pattern '{}': {}",
                    stage, step, pattern, e
                ))
            }),
    }
}

fn validate_dependencies(plan: &PlanDefinition) -> Result<()> {
    let names: HashSet<&str> = plan.stages.iter().map(|s| s.name.as_str()).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for stage in &plan.stages {
        let deps = adjacency.entry(stage.name.as_str()).or_default();
        for dependency in &stage.depends_on {
            if !names.contains(dependency.as_str()) {
                return Err(Error::unknown_dependency(format!(
                    "stage '{}' depends on unknown stage '{}'",
                    stage.name, dependency
                )));
            }
            deps.push(dependency.as_str());
        }
    }

    let order: Vec<&str> = plan.stages.iter().map(|s| s.name.as_str()).collect();
    if let Some(cycle) = find_cycle(&order, &adjacency) {
        return Err(Error::cycle_detected(format!(
            "plan '{}': {}",
            plan.name,
            cycle.join(" -> ")
        )));
    }
    Ok(())
}

/// Iterative depth-first search. A back-edge to a node on the current path
/// (the `visiting` set) is a cycle; the returned path repeats its first node.
pub(crate) fn find_cycle<'a>(
    order: &[&'a str],
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
) -> Option<Vec<&'a str>> {
    let mut visiting: HashSet<&str> = HashSet::new();
    let mut completed: HashSet<&str> = HashSet::new();

    for &root in order {
        if completed.contains(root) {
            continue;
        }
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
        visiting.insert(root);

        while let Some((node, next)) = stack.last_mut() {
            let node = *node;
            let children = adjacency.get(node).map(Vec::as_slice).unwrap_or(&[]);
            if *next < children.len() {
                let child = children[*next];
                *next += 1;
                if visiting.contains(child) {
                    let start = stack.iter().position(|(n, _)| *n == child).unwrap_or(0);
                    let mut cycle: Vec<&str> = stack[start..].iter().map(|(n, _)| *n).collect();
                    cycle.push(child);
                    return Some(cycle);
                }
                if !completed.contains(child) {
                    visiting.insert(child);
                    stack.push((child, 0));
                }
            } else {
                visiting.remove(node);
                completed.insert(node);
                stack.pop();
            }
        }
    }
    None
}

fn reachable_from<'a>(
    roots: impl Iterator<Item = &'a str>,
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
) -> HashSet<&'a str> {
    let mut reached: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    for root in roots {
        if reached.insert(root) {
            queue.push_back(root);
        }
    }
    while let Some(node) = queue.pop_front() {
        for &child in adjacency.get(node).map(Vec::as_slice).unwrap_or(&[]) {
            if reached.insert(child) {
                queue.push_back(child);
            }
        }
    }
    reached
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::PlanTemplate;
    use proptest::prelude::*;

    fn parse(yaml: &str) -> PlanDefinition {
        PlanTemplate::from_yaml(yaml).unwrap().plan
    }

    const DIAMOND: &str = r#"
plan:
  name: diamond
  stages:
    - name: recon
      steps:
        - name: scan
          module: scan
          is_init: true
          next:
            - type: any
              step: [left, right]
        - name: left
          module: echo
          next:
            - type: result
              value: ok
              step: join
        - name: right
          module: echo
          next:
            - type: output
              value: "^open"
              step: join
        - name: join
          module: echo
"#;

    #[test]
    fn test_accepts_diamond() {
        assert!(validate(&parse(DIAMOND)).is_ok());
    }

    #[test]
    fn test_rejects_unknown_dependency() {
        let plan = parse(
            r#"
plan:
  name: p
  stages:
    - name: a
      depends_on: [ghost]
      steps: [{name: s, module: m, is_init: true}]
"#,
        );
        assert!(matches!(validate(&plan), Err(Error::UnknownDependency(_))));
    }

    #[test]
    fn test_rejects_dependency_cycle() {
        let plan = parse(
            r#"
plan:
  name: p
  stages:
    - name: a
      depends_on: [c]
      steps: [{name: s, module: m, is_init: true}]
    - name: b
      depends_on: [a]
      steps: [{name: s, module: m, is_init: true}]
    - name: c
      depends_on: [b]
      steps: [{name: s, module: m, is_init: true}]
"#,
        );
        let err = validate(&plan).unwrap_err();
        assert!(matches!(err, Error::CycleDetected(_)));
    }

    #[test]
    fn test_rejects_successor_cycle() {
        let plan = parse(
            r#"
plan:
  name: p
  stages:
    - name: a
      steps:
        - {name: s1, module: m, is_init: true, next: [{type: any, step: s2}]}
        - {name: s2, module: m, next: [{type: any, step: s3}]}
        - {name: s3, module: m, next: [{type: any, step: s2}]}
"#,
        );
        assert!(matches!(validate(&plan), Err(Error::CycleDetected(_))));
    }

    #[test]
    fn test_rejects_unreachable_step() {
        let plan = parse(
            r#"
plan:
  name: p
  stages:
    - name: a
      steps:
        - {name: s1, module: m, is_init: true}
        - {name: orphan, module: m}
"#,
        );
        assert!(matches!(validate(&plan), Err(Error::UnreachableStep(_))));
    }

    #[test]
    fn test_rejects_bad_result_and_pattern() {
        let bad_result = parse(
            r#"
plan:
  name: p
  stages:
    - name: a
      steps:
        - {name: s1, module: m, is_init: true, next: [{type: result, value: maybe, step: s2}]}
        - {name: s2, module: m}
"#,
        );
        assert!(matches!(validate(&bad_result), Err(Error::Validation(_))));

        let bad_pattern = parse(
            r#"
plan:
  name: p
  stages:
    - name: a
      steps:
        - {name: s1, module: m, is_init: true, next: [{type: output, value: "(", step: s2}]}
        - {name: s2, module: m}
"#,
        );
        assert!(matches!(validate(&bad_pattern), Err(Error::Validation(_))));
    }

    #[test]
    fn test_rejects_missing_init_and_duplicates() {
        let no_init = parse(
            r#"
plan:
  name: p
  stages:
    - name: a
      steps: [{name: s1, module: m}]
"#,
        );
        assert!(matches!(validate(&no_init), Err(Error::Validation(_))));

        let duplicate = parse(
            r#"
plan:
  name: p
  stages:
    - name: a
      steps: [{name: s1, module: m, is_init: true}]
    - name: a
      steps: [{name: s1, module: m, is_init: true}]
"#,
        );
        assert!(matches!(validate(&duplicate), Err(Error::Validation(_))));
    }

    #[test]
    fn test_dynamic_plan_may_be_empty() {
        let plan = parse(
            r#"
plan:
  name: p
  dynamic: true
"#,
        );
        assert!(validate(&plan).is_ok());
    }

    #[test]
    fn test_find_cycle_reports_path() {
        let adjacency: HashMap<&str, Vec<&str>> =
            [("a", vec!["b"]), ("b", vec!["c"]), ("c", vec!["a"])].into_iter().collect();
        let cycle = find_cycle(&["a", "b", "c"], &adjacency).unwrap();
        assert_eq!(cycle, vec!["a", "b", "c", "a"]);
    }

    // Edges only point from lower to higher index: always acyclic.
    fn forward_dag() -> impl Strategy<Value = Vec<(usize, usize)>> {
        prop::collection::vec((0usize..12, 0usize..12), 0..40).prop_map(|pairs| {
            pairs
                .into_iter()
                .filter(|(a, b)| a < b)
                .collect()
        })
    }

    proptest! {
        #[test]
        fn forward_graphs_have_no_cycle(edges in forward_dag()) {
            let names: Vec<String> = (0..12).map(|i| format!("n{}", i)).collect();
            let order: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
            for (a, b) in &edges {
                adjacency.entry(order[*a]).or_default().push(order[*b]);
            }
            prop_assert!(find_cycle(&order, &adjacency).is_none());
        }

        #[test]
        fn back_edge_always_detected(edges in forward_dag(), from in 1usize..12) {
            let names: Vec<String> = (0..12).map(|i| format!("n{}", i)).collect();
            let order: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
            for (a, b) in &edges {
                adjacency.entry(order[*a]).or_default().push(order[*b]);
            }
            // chain 0 -> 1 -> ... -> from, then close it
            for i in 0..from {
                adjacency.entry(order[i]).or_default().push(order[i + 1]);
            }
            adjacency.entry(order[from]).or_default().push(order[0]);
            prop_assert!(find_cycle(&order, &adjacency).is_some());
        }
    }
}
