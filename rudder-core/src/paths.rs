//! Cluster property path layout.
//!
//! All cluster metadata lives under a root node named after the cluster:
//!
//! ```text
//! /{cluster}/IDEALSTATES/{resource}
//! /{cluster}/CONFIGS/CLUSTER/{cluster}
//! /{cluster}/CONFIGS/PARTICIPANT/{instance}
//! /{cluster}/STATEMODELDEFS/{state_model}
//! /{cluster}/LIVEINSTANCES/{instance}
//! /{cluster}/INSTANCES/{instance}/CURRENTSTATES/{session}/{resource}
//! /{cluster}/INSTANCES/{instance}/MESSAGES/{message_id}
//! /{cluster}/CONTROLLER/LEADER
//! /{cluster}/CONTROLLER/MESSAGES
//! /{cluster}/EXTERNALVIEW/{resource}
//! ```

const IDEALSTATES: &str = "IDEALSTATES";
const CONFIGS: &str = "CONFIGS";
const CLUSTER: &str = "CLUSTER";
const PARTICIPANT: &str = "PARTICIPANT";
const STATEMODELDEFS: &str = "STATEMODELDEFS";
const LIVEINSTANCES: &str = "LIVEINSTANCES";
const INSTANCES: &str = "INSTANCES";
const CURRENTSTATES: &str = "CURRENTSTATES";
const MESSAGES: &str = "MESSAGES";
const CONTROLLER: &str = "CONTROLLER";
const LEADER: &str = "LEADER";
const EXTERNALVIEW: &str = "EXTERNALVIEW";

/// The kinds of properties stored for a cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PropertyType {
    IdealStates,
    Configs,
    ClusterConfig,
    ParticipantConfigs,
    StateModelDefs,
    LiveInstances,
    Instances,
    /// Keyed as `[instance, session, resource]`.
    CurrentStates,
    /// Keyed as `[instance, message_id]`.
    Messages,
    Controller,
    Leader,
    ControllerMessages,
    ExternalView,
}

/// Build the path of a property of the given cluster.
///
/// Properties nested under an instance (`CurrentStates` & `Messages`) take the instance name as
/// their first key; when it is absent the `INSTANCES` root is returned.
pub fn path(ty: PropertyType, cluster: &str, keys: &[&str]) -> String {
    let mut segments: Vec<&str> = vec![cluster];
    let mut keys = keys.iter().copied();
    match ty {
        PropertyType::IdealStates => segments.push(IDEALSTATES),
        PropertyType::Configs => segments.push(CONFIGS),
        PropertyType::ClusterConfig => segments.extend([CONFIGS, CLUSTER]),
        PropertyType::ParticipantConfigs => segments.extend([CONFIGS, PARTICIPANT]),
        PropertyType::StateModelDefs => segments.push(STATEMODELDEFS),
        PropertyType::LiveInstances => segments.push(LIVEINSTANCES),
        PropertyType::Instances => segments.push(INSTANCES),
        PropertyType::CurrentStates | PropertyType::Messages => {
            segments.push(INSTANCES);
            if let Some(instance) = keys.next() {
                segments.push(instance);
                segments.push(if ty == PropertyType::CurrentStates { CURRENTSTATES } else { MESSAGES });
            }
        }
        PropertyType::Controller => segments.push(CONTROLLER),
        PropertyType::Leader => segments.extend([CONTROLLER, LEADER]),
        PropertyType::ControllerMessages => segments.extend([CONTROLLER, MESSAGES]),
        PropertyType::ExternalView => segments.push(EXTERNALVIEW),
    }
    segments.extend(keys);
    format!("/{}", segments.join("/"))
}

/// Classify the given path of the given cluster, returning its property type and keys.
///
/// This is the inverse of `path`, used to map store notifications back onto cluster properties.
/// Returns `None` for paths outside of the cluster or outside of the known layout.
pub fn classify(cluster: &str, path: &str) -> Option<(PropertyType, Vec<String>)> {
    let rest = path.strip_prefix('/')?;
    let mut segments = rest.split('/');
    if segments.next()? != cluster {
        return None;
    }
    let segments: Vec<&str> = segments.collect();
    let owned = |keys: &[&str]| keys.iter().map(|key| key.to_string()).collect::<Vec<_>>();
    let classified = match segments.as_slice() {
        [IDEALSTATES, keys @ ..] => (PropertyType::IdealStates, owned(keys)),
        [CONFIGS, CLUSTER, keys @ ..] => (PropertyType::ClusterConfig, owned(keys)),
        [CONFIGS, PARTICIPANT, keys @ ..] => (PropertyType::ParticipantConfigs, owned(keys)),
        [CONFIGS, keys @ ..] => (PropertyType::Configs, owned(keys)),
        [STATEMODELDEFS, keys @ ..] => (PropertyType::StateModelDefs, owned(keys)),
        [LIVEINSTANCES, keys @ ..] => (PropertyType::LiveInstances, owned(keys)),
        [INSTANCES, instance, CURRENTSTATES, keys @ ..] => {
            let mut all = vec![instance.to_string()];
            all.extend(owned(keys));
            (PropertyType::CurrentStates, all)
        }
        [INSTANCES, instance, MESSAGES, keys @ ..] => {
            let mut all = vec![instance.to_string()];
            all.extend(owned(keys));
            (PropertyType::Messages, all)
        }
        [INSTANCES, keys @ ..] => (PropertyType::Instances, owned(keys)),
        [CONTROLLER, LEADER, keys @ ..] => (PropertyType::Leader, owned(keys)),
        [CONTROLLER, MESSAGES, keys @ ..] => (PropertyType::ControllerMessages, owned(keys)),
        [CONTROLLER, keys @ ..] => (PropertyType::Controller, owned(keys)),
        [EXTERNALVIEW, keys @ ..] => (PropertyType::ExternalView, owned(keys)),
        _ => return None,
    };
    Some(classified)
}
