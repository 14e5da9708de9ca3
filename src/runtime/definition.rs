use super::execution::Execution;
use crate::core::errors::{EngineError, Result};
use dashmap::DashMap;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Guard on an outgoing sequence flow of an exclusive gateway
pub trait Condition: Send + Sync {
    fn evaluate(&self, execution: &Execution) -> bool;
}

impl<F> Condition for F
where
    F: Fn(&Execution) -> bool + Send + Sync,
{
    fn evaluate(&self, execution: &Execution) -> bool {
        self(execution)
    }
}

/// What an activity does when an execution arrives
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityKind {
    StartEvent,
    EndEvent,
    /// Wait state left by completing the task
    UserTask,
    /// Runs the named [`ActivityHandler`](super::ActivityHandler), then leaves
    ServiceTask { handler: String },
    /// Fork and join
    ParallelGateway,
    /// Takes the first outgoing flow whose condition holds, else the default flow
    ExclusiveGateway { default_flow: Option<String> },
    /// Wait state left when the timer job fires
    TimerCatch { duration: Duration },
}

impl ActivityKind {
    pub fn is_wait_state(&self) -> bool {
        matches!(self, ActivityKind::UserTask | ActivityKind::TimerCatch { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Activity {
    pub id: String,
    pub name: Option<String>,
    pub kind: ActivityKind,
    /// Continue in a job instead of the calling command
    pub async_before: bool,
    /// Jobs created for this activity are exclusive
    pub exclusive: bool,
    pub incoming: Vec<String>,
    /// Outgoing transition ids in declaration order
    pub outgoing: Vec<String>,
}

#[derive(Clone)]
pub struct Transition {
    pub id: String,
    pub source: String,
    pub target: String,
    pub condition: Option<Arc<dyn Condition>>,
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("target", &self.target)
            .field("conditional", &self.condition.is_some())
            .finish()
    }
}

/// Immutable, validated process graph
#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    pub key: String,
    pub name: Option<String>,
    activities: HashMap<String, Activity>,
    transitions: HashMap<String, Transition>,
    initial: String,
}

impl ProcessDefinition {
    pub fn builder(key: impl Into<String>) -> ProcessDefinitionBuilder {
        ProcessDefinitionBuilder::new(key)
    }

    /// The start event
    pub fn initial(&self) -> &str {
        &self.initial
    }

    pub fn activity(&self, id: &str) -> Result<&Activity> {
        self.activities.get(id).ok_or_else(|| {
            EngineError::fault(format!(
                "activity {} does not exist in process definition {}",
                id, self.key
            ))
        })
    }

    pub fn transition(&self, id: &str) -> Result<&Transition> {
        self.transitions.get(id).ok_or_else(|| {
            EngineError::fault(format!(
                "transition {} does not exist in process definition {}",
                id, self.key
            ))
        })
    }

    pub fn outgoing(&self, activity_id: &str) -> Result<Vec<&Transition>> {
        self.activity(activity_id)?
            .outgoing
            .iter()
            .map(|id| self.transition(id))
            .collect()
    }

    pub fn incoming_count(&self, activity_id: &str) -> Result<usize> {
        Ok(self.activity(activity_id)?.incoming.len())
    }

    pub fn activities(&self) -> impl Iterator<Item = &Activity> {
        self.activities.values()
    }
}

/// Fluent builder for process definitions
pub struct ProcessDefinitionBuilder {
    key: String,
    name: Option<String>,
    activities: Vec<Activity>,
    flows: Vec<Transition>,
    defaults: Vec<(String, String)>,
}

impl ProcessDefinitionBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: None,
            activities: Vec::new(),
            flows: Vec::new(),
            defaults: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn activity(mut self, id: impl Into<String>, kind: ActivityKind) -> Self {
        self.activities.push(Activity {
            id: id.into(),
            name: None,
            kind,
            async_before: false,
            exclusive: true,
            incoming: Vec::new(),
            outgoing: Vec::new(),
        });
        self
    }

    pub fn start_event(self, id: impl Into<String>) -> Self {
        self.activity(id, ActivityKind::StartEvent)
    }

    pub fn end_event(self, id: impl Into<String>) -> Self {
        self.activity(id, ActivityKind::EndEvent)
    }

    pub fn user_task(self, id: impl Into<String>) -> Self {
        self.activity(id, ActivityKind::UserTask)
    }

    pub fn service_task(self, id: impl Into<String>, handler: impl Into<String>) -> Self {
        self.activity(
            id,
            ActivityKind::ServiceTask {
                handler: handler.into(),
            },
        )
    }

    pub fn parallel_gateway(self, id: impl Into<String>) -> Self {
        self.activity(id, ActivityKind::ParallelGateway)
    }

    pub fn exclusive_gateway(self, id: impl Into<String>) -> Self {
        self.activity(id, ActivityKind::ExclusiveGateway { default_flow: None })
    }

    pub fn timer_catch(self, id: impl Into<String>, duration: Duration) -> Self {
        self.activity(id, ActivityKind::TimerCatch { duration })
    }

    /// Name the most recently added activity
    pub fn labelled(mut self, name: impl Into<String>) -> Self {
        if let Some(last) = self.activities.last_mut() {
            last.name = Some(name.into());
        }
        self
    }

    /// Continue the most recently added activity asynchronously
    pub fn async_before(mut self) -> Self {
        if let Some(last) = self.activities.last_mut() {
            last.async_before = true;
        }
        self
    }

    /// Let jobs of the most recently added activity run concurrently with
    /// other jobs of the same process instance
    pub fn non_exclusive(mut self) -> Self {
        if let Some(last) = self.activities.last_mut() {
            last.exclusive = false;
        }
        self
    }

    /// Sequence flow with a generated id `source->target`
    pub fn flow(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        let id = format!("{}->{}", source, target);
        self.flow_with_id(id, source, target)
    }

    pub fn flow_with_id(
        mut self,
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.flows.push(Transition {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
        });
        self
    }

    pub fn conditional_flow<C>(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: C,
    ) -> Self
    where
        C: Condition + 'static,
    {
        let source = source.into();
        let target = target.into();
        self.flows.push(Transition {
            id: format!("{}->{}", source, target),
            source,
            target,
            condition: Some(Arc::new(condition)),
        });
        self
    }

    /// Unconditional flow taken by an exclusive gateway when no condition holds
    pub fn default_flow(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        let id = format!("{}->{}", source, target);
        self.defaults.push((source.clone(), id.clone()));
        self.flow_with_id(id, source, target)
    }

    /// Validate and build the definition
    pub fn build(self) -> Result<ProcessDefinition> {
        if self.key.trim().is_empty() {
            return Err(EngineError::validation_field(
                "process definition key must not be empty",
                "key",
            ));
        }

        let mut activities: HashMap<String, Activity> = HashMap::new();
        for activity in self.activities {
            if activities.contains_key(&activity.id) {
                return Err(EngineError::validation_field(
                    format!("duplicate activity id {}", activity.id),
                    "activities",
                ));
            }
            activities.insert(activity.id.clone(), activity);
        }

        let mut transitions: HashMap<String, Transition> = HashMap::new();
        for flow in self.flows {
            if transitions.contains_key(&flow.id) {
                return Err(EngineError::validation_field(
                    format!("duplicate sequence flow {}", flow.id),
                    "flows",
                ));
            }
            for endpoint in [&flow.source, &flow.target] {
                if !activities.contains_key(endpoint) {
                    return Err(EngineError::validation_field(
                        format!(
                            "sequence flow {} references unknown activity {}",
                            flow.id, endpoint
                        ),
                        "flows",
                    ));
                }
            }
            if let Some(source) = activities.get_mut(&flow.source) {
                source.outgoing.push(flow.id.clone());
            }
            if let Some(target) = activities.get_mut(&flow.target) {
                target.incoming.push(flow.id.clone());
            }
            transitions.insert(flow.id.clone(), flow);
        }

        for (gateway, flow_id) in self.defaults {
            match activities.get_mut(&gateway) {
                Some(Activity {
                    kind: ActivityKind::ExclusiveGateway { default_flow },
                    ..
                }) => *default_flow = Some(flow_id),
                _ => {
                    return Err(EngineError::validation_field(
                        format!("default flow {} must leave an exclusive gateway", flow_id),
                        "flows",
                    ))
                }
            }
        }

        let starts: Vec<&Activity> = activities
            .values()
            .filter(|a| a.kind == ActivityKind::StartEvent)
            .collect();
        if starts.len() != 1 {
            return Err(EngineError::validation(format!(
                "process definition {} must have exactly one start event, found {}",
                self.key,
                starts.len()
            )));
        }
        let initial = starts[0].id.clone();

        for activity in activities.values() {
            validate_flows(activity)?;
        }

        validate_reachability(&self.key, &initial, &activities, &transitions)?;

        let definition = ProcessDefinition {
            key: self.key,
            name: self.name,
            activities,
            transitions,
            initial,
        };
        Ok(definition)
    }
}

fn validate_flows(activity: &Activity) -> Result<()> {
    match &activity.kind {
        ActivityKind::StartEvent => {
            if !activity.incoming.is_empty() {
                return Err(EngineError::validation(format!(
                    "start event {} cannot have incoming flows",
                    activity.id
                )));
            }
            if activity.outgoing.is_empty() {
                return Err(EngineError::validation(format!(
                    "start event {} needs an outgoing flow",
                    activity.id
                )));
            }
        }
        ActivityKind::EndEvent => {
            if !activity.outgoing.is_empty() {
                return Err(EngineError::validation(format!(
                    "end event {} cannot have outgoing flows",
                    activity.id
                )));
            }
        }
        ActivityKind::ExclusiveGateway { .. } | ActivityKind::ParallelGateway => {
            if activity.outgoing.is_empty() {
                return Err(EngineError::validation(format!(
                    "gateway {} needs at least one outgoing flow",
                    activity.id
                )));
            }
        }
        ActivityKind::ServiceTask { handler } if handler.trim().is_empty() => {
            return Err(EngineError::validation(format!(
                "service task {} has no handler",
                activity.id
            )));
        }
        _ => {}
    }
    Ok(())
}

fn validate_reachability(
    key: &str,
    initial: &str,
    activities: &HashMap<String, Activity>,
    transitions: &HashMap<String, Transition>,
) -> Result<()> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
    for id in activities.keys() {
        nodes.insert(id.as_str(), graph.add_node(id.as_str()));
    }
    for transition in transitions.values() {
        if let (Some(&from), Some(&to)) = (
            nodes.get(transition.source.as_str()),
            nodes.get(transition.target.as_str()),
        ) {
            graph.add_edge(from, to, ());
        }
    }

    let Some(&start) = nodes.get(initial) else {
        return Err(EngineError::fault("start event missing from graph"));
    };
    let mut reached = HashSet::new();
    let mut dfs = Dfs::new(&graph, start);
    while let Some(node) = dfs.next(&graph) {
        reached.insert(graph[node]);
    }

    let mut unreachable: Vec<&str> = activities
        .keys()
        .map(String::as_str)
        .filter(|id| !reached.contains(id))
        .collect();
    if !unreachable.is_empty() {
        unreachable.sort_unstable();
        return Err(EngineError::validation(format!(
            "process definition {} has activities unreachable from the start event: {}",
            key,
            unreachable.join(", ")
        )));
    }
    Ok(())
}

/// Deployed process definitions by key. Deploying a key again replaces it.
#[derive(Default)]
pub struct DefinitionRepository {
    definitions: DashMap<String, Arc<ProcessDefinition>>,
}

impl DefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deploy(&self, definition: ProcessDefinition) -> Arc<ProcessDefinition> {
        let definition = Arc::new(definition);
        info!(key = %definition.key, activities = definition.activities.len(), "Deployed process definition");
        self.definitions
            .insert(definition.key.clone(), definition.clone());
        definition
    }

    pub fn get(&self, key: &str) -> Option<Arc<ProcessDefinition>> {
        self.definitions.get(key).map(|d| d.value().clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.definitions.iter().map(|d| d.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fork_join() -> ProcessDefinitionBuilder {
        ProcessDefinition::builder("review")
            .start_event("start")
            .parallel_gateway("fork")
            .user_task("legal")
            .user_task("finance")
            .parallel_gateway("join")
            .end_event("end")
            .flow("start", "fork")
            .flow("fork", "legal")
            .flow("fork", "finance")
            .flow("legal", "join")
            .flow("finance", "join")
            .flow("join", "end")
    }

    #[test]
    fn test_labels_and_wait_states() {
        let definition = ProcessDefinition::builder("approval")
            .start_event("start")
            .user_task("approve")
            .labelled("Approve request")
            .timer_catch("cool_off", Duration::from_secs(60))
            .end_event("end")
            .flow("start", "approve")
            .flow("approve", "cool_off")
            .flow("cool_off", "end")
            .build()
            .unwrap();

        let approve = definition.activity("approve").unwrap();
        assert_eq!(approve.name.as_deref(), Some("Approve request"));
        assert!(approve.kind.is_wait_state());
        assert!(definition.activity("cool_off").unwrap().kind.is_wait_state());
        assert!(definition.activity("start").unwrap().name.is_none());
        assert!(!definition.activity("start").unwrap().kind.is_wait_state());
    }

    #[test]
    fn test_build_wires_flows_in_declaration_order() {
        let definition = fork_join().build().unwrap();
        assert_eq!(definition.initial(), "start");

        let targets: Vec<&str> = definition
            .outgoing("fork")
            .unwrap()
            .iter()
            .map(|t| t.target.as_str())
            .collect();
        assert_eq!(targets, vec!["legal", "finance"]);
        assert_eq!(definition.incoming_count("join").unwrap(), 2);
    }

    #[test]
    fn test_rejects_unknown_endpoint() {
        let err = fork_join().flow("join", "nowhere").build().unwrap_err();
        assert!(err.to_string().contains("unknown activity nowhere"));
    }

    #[test]
    fn test_rejects_unreachable_activity() {
        let err = fork_join().user_task("orphan").build().unwrap_err();
        assert!(err.to_string().contains("orphan"));
    }

    #[test]
    fn test_requires_single_start() {
        let err = ProcessDefinition::builder("empty")
            .user_task("task")
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn test_default_flow_only_on_exclusive_gateway() {
        let definition = ProcessDefinition::builder("route")
            .start_event("start")
            .exclusive_gateway("choose")
            .user_task("big")
            .user_task("small")
            .flow("start", "choose")
            .conditional_flow("choose", "big", |e: &Execution| {
                e.business_key.as_deref() == Some("big")
            })
            .default_flow("choose", "small")
            .build()
            .unwrap();

        match &definition.activity("choose").unwrap().kind {
            ActivityKind::ExclusiveGateway { default_flow } => {
                assert_eq!(default_flow.as_deref(), Some("choose->small"))
            }
            other => panic!("unexpected kind {:?}", other),
        }

        let err = ProcessDefinition::builder("bad")
            .start_event("start")
            .user_task("task")
            .default_flow("start", "task")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("exclusive gateway"));
    }

    #[test]
    fn test_repository_replaces_by_key() {
        let repository = DefinitionRepository::new();
        repository.deploy(fork_join().build().unwrap());
        repository.deploy(fork_join().name("v2").build().unwrap());
        assert_eq!(repository.keys(), vec!["review".to_string()]);
        assert_eq!(
            repository.get("review").unwrap().name.as_deref(),
            Some("v2")
        );
    }
}
