/// Response bodies for the management endpoints.
/// `/v1/models` mimics the openai API's models endpoint; `/running` reports backend states.
use crate::process::ProcessState;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Value reported as `owned_by` for every model.
pub(crate) const OWNED_BY: &str = "llmswap";

/// The returned models from the /v1/models endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct Model {
    /// The model identifier, which can be referenced in the API endpoints.
    pub(crate) id: String,
    /// The object type, which is always "model".
    pub(crate) object: String,
    /// The Unix timestamp (in seconds) the listing was generated at.
    pub(crate) created: u64,
    /// The organization that owns the model.
    pub(crate) owned_by: String,
}

/// The response from the /v1/models endpoint, which is a list of models.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct ListModelResponse {
    /// The object type, which is always "list".
    pub object: String,
    /// A list of model objects.
    pub data: Vec<Model>,
}

impl ListModelResponse {
    pub(crate) fn from_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        let data = ids
            .into_iter()
            .map(|id| Model {
                id: id.to_owned(),
                object: "model".into(),
                created,
                owned_by: OWNED_BY.into(),
            })
            .collect();
        ListModelResponse {
            object: "list".into(),
            data,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct RunningModel {
    pub model: String,
    pub state: ProcessState,
}

/// The response from the /running endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct RunningResponse {
    pub running: Vec<RunningModel>,
}

impl RunningResponse {
    pub(crate) fn new(running: Vec<(String, ProcessState)>) -> Self {
        RunningResponse {
            running: running
                .into_iter()
                .map(|(model, state)| RunningModel { model, state })
                .collect(),
        }
    }
}
