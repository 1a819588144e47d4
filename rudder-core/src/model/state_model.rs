//! State model definitions and their compiled transition tables.
//!
//! A definition declares a finite set of states and the transitions allowed between them. Before
//! use it is compiled into a `StateModel`, which validates the definition and precomputes the
//! next single hop along a shortest path between every pair of states.

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::algo::dijkstra;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{EdgeRef, Reversed};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// The implicit state of a replica which has not yet reported anything.
///
/// Matches the initial state of the replica's state model.
pub const UNINITIALIZED: &str = "UNINITIALIZED";

const DEFAULT_ERROR_STATE: &str = "ERROR";
const DEFAULT_DROPPED_STATE: &str = "DROPPED";

fn default_error_state() -> String {
    DEFAULT_ERROR_STATE.into()
}

fn default_dropped_state() -> String {
    DEFAULT_DROPPED_STATE.into()
}

/// A declared transition between two states.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl Transition {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            name: None,
        }
    }
}

/// The rule used to choose among multiple shortest paths between two states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TieBreak {
    /// Minimise the number of error-adjacent states on the remaining path, then fall back to
    /// transition priority and state name.
    AvoidErrorAdjacent,
    /// Prefer the transition declared first, then state name.
    TransitionPriority,
    /// Prefer the lexicographically smallest next state.
    Lexicographic,
}

impl Default for TieBreak {
    fn default() -> Self {
        Self::AvoidErrorAdjacent
    }
}

/// A state model definition, as stored in the metadata store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateModelDefinition {
    pub name: String,
    pub initial_state: String,
    /// All states of the model in priority order, highest first.
    pub states: Vec<String>,
    /// All allowed transitions in priority order, highest first.
    pub transitions: Vec<Transition>,
    #[serde(default = "default_error_state")]
    pub error_state: String,
    #[serde(default = "default_dropped_state")]
    pub dropped_state: String,
    /// The state a replica in the error state is reset to; defaults to the initial state.
    #[serde(default)]
    pub recovery_state: Option<String>,
    /// The maximum number of replicas of a partition which may be in a given state.
    #[serde(default)]
    pub upper_bounds: BTreeMap<String, u32>,
    #[serde(default)]
    pub tie_break: TieBreak,
}

impl StateModelDefinition {
    /// The classic single-master model.
    pub fn master_slave() -> Self {
        Self {
            name: "MasterSlave".into(),
            initial_state: "OFFLINE".into(),
            states: vec!["MASTER".into(), "SLAVE".into(), "OFFLINE".into(), DEFAULT_DROPPED_STATE.into()],
            transitions: vec![
                Transition::new("MASTER", "SLAVE"),
                Transition::new("SLAVE", "MASTER"),
                Transition::new("OFFLINE", "SLAVE"),
                Transition::new("SLAVE", "OFFLINE"),
                Transition::new("OFFLINE", DEFAULT_DROPPED_STATE),
                Transition::new(DEFAULT_ERROR_STATE, "OFFLINE"),
            ],
            error_state: default_error_state(),
            dropped_state: default_dropped_state(),
            recovery_state: None,
            upper_bounds: bounds(&[("MASTER", 1)]),
            tie_break: TieBreak::default(),
        }
    }

    /// A model where every replica is simply online or offline.
    pub fn online_offline() -> Self {
        Self {
            name: "OnlineOffline".into(),
            initial_state: "OFFLINE".into(),
            states: vec!["ONLINE".into(), "OFFLINE".into(), DEFAULT_DROPPED_STATE.into()],
            transitions: vec![
                Transition::new("OFFLINE", "ONLINE"),
                Transition::new("ONLINE", "OFFLINE"),
                Transition::new("OFFLINE", DEFAULT_DROPPED_STATE),
                Transition::new(DEFAULT_ERROR_STATE, "OFFLINE"),
            ],
            error_state: default_error_state(),
            dropped_state: default_dropped_state(),
            recovery_state: None,
            upper_bounds: BTreeMap::new(),
            tie_break: TieBreak::default(),
        }
    }
}

fn bounds(entries: &[(&str, u32)]) -> BTreeMap<String, u32> {
    entries.iter().map(|(state, max)| (state.to_string(), *max)).collect()
}

/// A validated state model with precomputed next hops.
#[derive(Clone, Debug)]
pub struct StateModel {
    def: StateModelDefinition,
    /// `(from, to) -> next state` along a shortest path.
    next_hops: HashMap<(String, String), String>,
    /// `(from, to) -> transition name` for every declared transition.
    transition_names: HashMap<(String, String), String>,
    /// States with a declared transition to or from the error state.
    error_adjacent: HashSet<String>,
}

impl StateModel {
    /// Validate the given definition and compile its transition table.
    pub fn compile(def: StateModelDefinition) -> Result<Self, AppError> {
        let invalid = |msg: String| AppError::InvalidInput(format!("state model {}: {}", def.name, msg));
        if def.name.is_empty() {
            return Err(AppError::InvalidInput("state model name must not be empty".into()));
        }
        if def.states.is_empty() {
            return Err(invalid("at least one state must be declared".into()));
        }
        let recovery = def.recovery_state.clone().unwrap_or_else(|| def.initial_state.clone());
        for (role, state) in [("initial", &def.initial_state), ("dropped", &def.dropped_state), ("recovery", &recovery)] {
            if !def.states.contains(state) {
                return Err(invalid(format!("{} state {} is not a declared state", role, state)));
            }
        }
        if def.states.contains(&def.error_state) {
            return Err(invalid(format!("error state {} must not be declared as a regular state", def.error_state)));
        }
        if let Some(state) = def.upper_bounds.keys().find(|state| !def.states.contains(state)) {
            return Err(invalid(format!("upper bound given for undeclared state {}", state)));
        }

        let mut graph = DiGraph::<String, usize>::new();
        let mut nodes: HashMap<String, NodeIndex> = HashMap::new();
        for state in def.states.iter() {
            if nodes.insert(state.clone(), graph.add_node(state.clone())).is_some() {
                return Err(invalid(format!("state {} declared more than once", state)));
            }
        }

        let mut transition_names = HashMap::new();
        let mut error_adjacent = HashSet::new();
        for (priority, transition) in def.transitions.iter().enumerate() {
            let is_known = |state: &String| nodes.contains_key(state) || *state == def.error_state;
            if !is_known(&transition.from) || !is_known(&transition.to) {
                return Err(invalid(format!("transition {}-{} references an undeclared state", transition.from, transition.to)));
            }
            if transition.from == transition.to {
                return Err(invalid(format!("transition {}-{} is a self transition", transition.from, transition.to)));
            }
            transition_names
                .entry((transition.from.clone(), transition.to.clone()))
                .or_insert_with(|| transition.name.clone().unwrap_or_else(|| format!("{}-{}", transition.from, transition.to)));
            if transition.from == def.error_state {
                error_adjacent.insert(transition.to.clone());
                continue;
            }
            if transition.to == def.error_state {
                error_adjacent.insert(transition.from.clone());
                continue;
            }
            if let (Some(from), Some(to)) = (nodes.get(&transition.from), nodes.get(&transition.to)) {
                graph.add_edge(*from, *to, priority);
            }
        }

        // Every state must be reachable from the initial state.
        let initial = nodes.get(&def.initial_state).copied().ok_or_else(|| invalid("initial state missing".into()))?;
        let reachable = dijkstra(&graph, initial, None, |_| 1u32);
        if let Some(state) = def.states.iter().find(|state| nodes.get(*state).map_or(true, |idx| !reachable.contains_key(idx))) {
            return Err(invalid(format!("state {} is not reachable from initial state {}", state, def.initial_state)));
        }

        let is_adjacent = |idx: NodeIndex| u32::from(error_adjacent.contains(&graph[idx]));
        let mut next_hops = HashMap::new();
        for target in def.states.iter() {
            let target_idx = match nodes.get(target) {
                Some(idx) => *idx,
                None => continue,
            };
            // Distances of every state to the target.
            let distances = dijkstra(Reversed(&graph), target_idx, None, |_| 1u32);
            for state in def.states.iter() {
                if state == target || *state == def.dropped_state {
                    continue;
                }
                if nodes.get(state).map_or(true, |idx| !distances.contains_key(idx)) {
                    return Err(invalid(format!("state {} cannot reach state {}", state, target)));
                }
            }

            let mut by_distance: Vec<(u32, NodeIndex)> = distances.iter().map(|(idx, dist)| (*dist, *idx)).collect();
            by_distance.sort();
            let mut penalties: HashMap<NodeIndex, u32> = HashMap::new();
            penalties.insert(target_idx, 0);
            for (dist, idx) in by_distance.into_iter().filter(|(dist, _)| *dist > 0) {
                let mut best: Option<((u32, usize, &str), NodeIndex)> = None;
                for edge in graph.edges(idx) {
                    let next = edge.target();
                    if distances.get(&next) != Some(&(dist - 1)) {
                        continue;
                    }
                    let penalty = is_adjacent(next) + penalties.get(&next).copied().unwrap_or(0);
                    let name = graph[next].as_str();
                    let key = match def.tie_break {
                        TieBreak::AvoidErrorAdjacent => (penalty, *edge.weight(), name),
                        TieBreak::TransitionPriority => (0, *edge.weight(), name),
                        TieBreak::Lexicographic => (0, 0, name),
                    };
                    if best.as_ref().map_or(true, |(best_key, _)| key < *best_key) {
                        best = Some((key, next));
                    }
                }
                if let Some((_, next)) = best {
                    let penalty = is_adjacent(next) + penalties.get(&next).copied().unwrap_or(0);
                    penalties.insert(idx, penalty);
                    next_hops.insert((graph[idx].clone(), target.clone()), graph[next].clone());
                }
            }
        }

        let mut def = def;
        def.recovery_state = Some(recovery);
        Ok(Self {
            def,
            next_hops,
            transition_names,
            error_adjacent,
        })
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn definition(&self) -> &StateModelDefinition {
        &self.def
    }

    pub fn initial_state(&self) -> &str {
        &self.def.initial_state
    }

    pub fn error_state(&self) -> &str {
        &self.def.error_state
    }

    pub fn dropped_state(&self) -> &str {
        &self.def.dropped_state
    }

    pub fn recovery_state(&self) -> &str {
        self.def.recovery_state.as_deref().unwrap_or(&self.def.initial_state)
    }

    /// The declared states in priority order, highest first.
    pub fn states(&self) -> &[String] {
        &self.def.states
    }

    /// The priority of the given state, `0` being the highest.
    pub fn state_priority(&self, state: &str) -> Option<usize> {
        self.def.states.iter().position(|declared| declared == state)
    }

    /// The state directly below the given state in priority order.
    pub fn next_lower_state(&self, state: &str) -> Option<&str> {
        let idx = self.state_priority(state)?;
        self.def.states.get(idx + 1).map(String::as_str)
    }

    pub fn upper_bound(&self, state: &str) -> Option<u32> {
        self.def.upper_bounds.get(state).copied()
    }

    pub fn is_error_adjacent(&self, state: &str) -> bool {
        self.error_adjacent.contains(state)
    }

    /// Normalise a locally observed state, mapping `UNINITIALIZED` onto the initial state.
    pub fn normalize<'a>(&'a self, state: &'a str) -> &'a str {
        if state == UNINITIALIZED {
            &self.def.initial_state
        } else {
            state
        }
    }

    /// The next single hop from `from` towards `to`.
    ///
    /// From the error state the only hop is the recovery state. Returns `None` when `from` and
    /// `to` are equal, or when `to` can not be reached from `from`.
    pub fn next_state(&self, from: &str, to: &str) -> Option<&str> {
        if from == to {
            return None;
        }
        if from == self.def.error_state {
            return Some(self.recovery_state());
        }
        self.next_hops.get(&(from.to_string(), to.to_string())).map(String::as_str)
    }

    /// Check if `from -> to` is a declared transition, or the implicit recovery out of the error state.
    pub fn is_transition(&self, from: &str, to: &str) -> bool {
        self.transition_names.contains_key(&(from.to_string(), to.to_string())) || (from == self.def.error_state && to == self.recovery_state())
    }

    /// The name of the given transition.
    pub fn transition_name(&self, from: &str, to: &str) -> String {
        self.transition_names
            .get(&(from.to_string(), to.to_string()))
            .cloned()
            .unwrap_or_else(|| format!("{}-{}", from, to))
    }
}
