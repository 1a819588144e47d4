use anyhow::Result;

use crate::error::AppError;
use crate::model::{Partition, StateModel, StateModelDefinition, TieBreak, Transition, UNINITIALIZED};

fn diamond(tie_break: TieBreak) -> StateModelDefinition {
    StateModelDefinition {
        name: "Diamond".into(),
        initial_state: "A".into(),
        states: vec!["A".into(), "B".into(), "C".into(), "D".into(), "GONE".into()],
        transitions: vec![
            Transition::new("A", "B"),
            Transition::new("A", "C"),
            Transition::new("B", "D"),
            Transition::new("C", "D"),
            Transition::new("D", "A"),
            Transition::new("A", "GONE"),
            Transition::new("ERROR", "B"),
        ],
        error_state: "ERROR".into(),
        dropped_state: "GONE".into(),
        recovery_state: Some("B".into()),
        upper_bounds: Default::default(),
        tie_break,
    }
}

#[test]
fn master_slave_next_hops() -> Result<()> {
    let model = StateModel::compile(StateModelDefinition::master_slave())?;
    let cases = vec![
        ("OFFLINE", "MASTER", Some("SLAVE")),
        ("SLAVE", "MASTER", Some("MASTER")),
        ("MASTER", "OFFLINE", Some("SLAVE")),
        ("MASTER", "DROPPED", Some("SLAVE")),
        ("SLAVE", "DROPPED", Some("OFFLINE")),
        ("OFFLINE", "DROPPED", Some("DROPPED")),
        ("ERROR", "MASTER", Some("OFFLINE")),
        ("MASTER", "MASTER", None),
        ("DROPPED", "MASTER", None),
    ];
    for (from, to, expected) in cases {
        let actual = model.next_state(from, to);
        assert_eq!(actual, expected, "unexpected next hop from {} to {}, expected {:?} got {:?}", from, to, expected, actual);
    }
    Ok(())
}

#[test]
fn master_slave_accessors() -> Result<()> {
    let model = StateModel::compile(StateModelDefinition::master_slave())?;
    assert_eq!(model.initial_state(), "OFFLINE");
    assert_eq!(model.recovery_state(), "OFFLINE");
    assert_eq!(model.upper_bound("MASTER"), Some(1));
    assert_eq!(model.upper_bound("SLAVE"), None);
    assert_eq!(model.next_lower_state("MASTER"), Some("SLAVE"));
    assert_eq!(model.normalize(UNINITIALIZED), "OFFLINE");
    assert!(model.is_error_adjacent("OFFLINE"));
    assert!(model.is_transition("ERROR", "OFFLINE"));
    assert!(model.is_transition("OFFLINE", "SLAVE"));
    assert!(!model.is_transition("OFFLINE", "MASTER"));
    assert_eq!(model.transition_name("OFFLINE", "SLAVE"), "OFFLINE-SLAVE");
    Ok(())
}

#[test]
fn tie_break_avoids_error_adjacent_states_by_default() -> Result<()> {
    let model = StateModel::compile(diamond(TieBreak::default()))?;
    let next = model.next_state("A", "D");
    assert_eq!(next, Some("C"), "expected hop through non error-adjacent state C, got {:?}", next);
    Ok(())
}

#[test]
fn tie_break_by_transition_priority() -> Result<()> {
    let model = StateModel::compile(diamond(TieBreak::TransitionPriority))?;
    let next = model.next_state("A", "D");
    assert_eq!(next, Some("B"), "expected hop through first declared transition, got {:?}", next);
    let model = StateModel::compile(diamond(TieBreak::Lexicographic))?;
    let next = model.next_state("A", "D");
    assert_eq!(next, Some("B"), "expected lexicographic hop, got {:?}", next);
    Ok(())
}

#[test]
fn recovery_state_is_the_only_hop_out_of_error() -> Result<()> {
    let model = StateModel::compile(diamond(TieBreak::default()))?;
    let next = model.next_state("ERROR", "C");
    assert_eq!(next, Some("B"), "expected recovery hop, got {:?}", next);
    Ok(())
}

#[test]
fn compile_rejects_unreachable_states() {
    let mut def = StateModelDefinition::online_offline();
    def.transitions.retain(|transition| !(transition.from == "ONLINE" && transition.to == "OFFLINE"));
    let res = StateModel::compile(def);
    assert!(matches!(res, Err(AppError::InvalidInput(_))), "expected validation error, got {:?}", res.map(|_| ()));
}

#[test]
fn compile_rejects_undeclared_states() {
    let mut def = StateModelDefinition::online_offline();
    def.transitions.push(Transition::new("OFFLINE", "BOOTSTRAP"));
    assert!(StateModel::compile(def).is_err(), "expected undeclared transition target to be rejected");

    let mut def = StateModelDefinition::online_offline();
    def.initial_state = "STARTING".into();
    assert!(StateModel::compile(def).is_err(), "expected undeclared initial state to be rejected");

    let mut def = StateModelDefinition::master_slave();
    def.upper_bounds.insert("LEADER".into(), 1);
    assert!(StateModel::compile(def).is_err(), "expected undeclared upper bound state to be rejected");
}

#[test]
fn definition_json_uses_defaults() -> Result<()> {
    let def: StateModelDefinition = serde_json::from_str(
        r#"{
            "name": "OnlineOffline",
            "initialState": "OFFLINE",
            "states": ["ONLINE", "OFFLINE", "DROPPED"],
            "transitions": [
                {"from": "OFFLINE", "to": "ONLINE"},
                {"from": "ONLINE", "to": "OFFLINE"},
                {"from": "OFFLINE", "to": "DROPPED", "name": "drop"}
            ]
        }"#,
    )?;
    assert_eq!(def.error_state, "ERROR");
    assert_eq!(def.dropped_state, "DROPPED");
    assert_eq!(def.tie_break, TieBreak::AvoidErrorAdjacent);
    let model = StateModel::compile(def)?;
    assert_eq!(model.transition_name("OFFLINE", "DROPPED"), "drop");
    Ok(())
}

#[test]
fn partition_names_round_trip() {
    let partition = Partition::parse("my_db_12").expect("expected partition name to parse");
    assert_eq!(partition, Partition::new("my_db", 12));
    assert_eq!(partition.name(), "my_db_12");
    assert!(Partition::parse("db").is_none());
    assert!(Partition::parse("_3").is_none());
    assert!(Partition::parse("db_x").is_none());
    assert!(Partition::new("db", 2) < Partition::new("db", 10), "expected partitions to order by index");
}
