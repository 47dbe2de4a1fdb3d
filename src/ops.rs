//! Typed engine operations.
//!
//! Thin wrappers over [`EngineClient::call`]: each builds the action's
//! params, sends one request, and extracts the documented result field.
//! A missing result field comes back as `Value::Null`; the engine omits
//! fields it has nothing to report for.

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::client::EngineClient;
use crate::error::{BridgeError, Result};
use crate::transport::TransportKind;

/// Passive tree allocation for `set_tree`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSpec {
    pub class_id: u32,
    pub ascend_class_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_ascend_class_id: Option<u32>,
    pub nodes: Vec<u32>,
    /// Mastery node id -> chosen effect id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mastery_effects: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree_version: Option<String>,
}

/// Incremental allocation change for `update_tree_delta`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeDelta {
    pub add_nodes: Vec<u32>,
    pub remove_nodes: Vec<u32>,
}

/// Item to create from its text form for `add_item`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    pub item_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_auto_equip: Option<bool>,
}

/// Main skill selection for `set_main_selection`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MainSelection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_socket_group: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_active_skill: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill_part: Option<u32>,
}

fn to_params<T: Serialize>(action: &str, params: &T) -> Result<Value> {
    serde_json::to_value(params).map_err(|e| BridgeError::Protocol {
        action: action.to_string(),
        detail: format!("failed to encode params: {}", e),
    })
}

fn take_field(mut fields: Map<String, Value>, name: &str) -> Value {
    fields.remove(name).unwrap_or(Value::Null)
}

impl EngineClient {
    /// Liveness check; resolves to `true` on `{ok: true}`.
    pub async fn ping(&self) -> Result<bool> {
        self.call("ping", None).await.map(|_| true)
    }

    /// Replace the engine's current build with the given build XML.
    pub async fn load_build_xml(&self, xml: &str, name: Option<&str>) -> Result<()> {
        let mut params = json!({ "xml": xml });
        if let Some(name) = name {
            params["name"] = json!(name);
        }
        self.call("load_build_xml", Some(params)).await.map(drop)
    }

    /// Calculated stats, optionally restricted to `fields`.
    pub async fn get_stats(&self, fields: Option<&[&str]>) -> Result<Value> {
        let params = fields.map(|fields| json!({ "fields": fields }));
        self.call("get_stats", params)
            .await
            .map(|f| take_field(f, "stats"))
    }

    pub async fn get_tree(&self) -> Result<Value> {
        self.call("get_tree", None)
            .await
            .map(|f| take_field(f, "tree"))
    }

    /// Replace the whole passive allocation; returns the resulting tree.
    pub async fn set_tree(&self, tree: &TreeSpec) -> Result<Value> {
        let params = to_params("set_tree", tree)?;
        self.call("set_tree", Some(params))
            .await
            .map(|f| take_field(f, "tree"))
    }

    pub async fn get_items(&self) -> Result<Value> {
        self.call("get_items", None)
            .await
            .map(|f| take_field(f, "items"))
    }

    /// Create an item from its text form. Returns all result fields.
    pub async fn add_item(&self, item: &NewItem) -> Result<Map<String, Value>> {
        let params = to_params("add_item", item)?;
        self.call("add_item", Some(params)).await
    }

    pub async fn set_flask_active(&self, flask_index: u32, active: bool) -> Result<()> {
        let params = json!({ "flaskIndex": flask_index, "active": active });
        self.call("set_flask_active", Some(params)).await.map(drop)
    }

    /// Socket groups and gems. Returns all result fields.
    pub async fn get_skills(&self) -> Result<Map<String, Value>> {
        self.call("get_skills", None).await
    }

    pub async fn set_main_selection(&self, selection: &MainSelection) -> Result<()> {
        let params = to_params("set_main_selection", selection)?;
        self.call("set_main_selection", Some(params))
            .await
            .map(drop)
    }

    pub async fn get_config(&self) -> Result<Value> {
        self.call("get_config", None)
            .await
            .map(|f| take_field(f, "config"))
    }

    /// Apply configuration changes (an object of option -> value).
    pub async fn set_config(&self, changes: Value) -> Result<Value> {
        self.call("set_config", Some(changes))
            .await
            .map(|f| take_field(f, "config"))
    }

    pub async fn set_level(&self, level: u32) -> Result<()> {
        self.call("set_level", Some(json!({ "level": level })))
            .await
            .map(drop)
    }

    /// Current build serialized as build XML.
    pub async fn export_build_xml(&self) -> Result<String> {
        match take_field(self.call("export_build_xml", None).await?, "xml") {
            Value::String(xml) => Ok(xml),
            other => Err(BridgeError::Protocol {
                action: "export_build_xml".to_string(),
                detail: format!("expected `xml` string, got {}", other),
            }),
        }
    }

    pub async fn get_build_info(&self) -> Result<Value> {
        self.call("get_build_info", None)
            .await
            .map(|f| take_field(f, "info"))
    }

    /// Allocate/deallocate nodes incrementally. Live (socket) engines only.
    pub async fn update_tree_delta(&self, delta: &TreeDelta) -> Result<Value> {
        let params = to_params("update_tree_delta", delta)?;
        self.call_on(TransportKind::Socket, "update_tree_delta", Some(params))
            .await
            .map(|f| take_field(f, "tree"))
    }

    /// Recalculate under hypothetical changes without committing them.
    /// Live (socket) engines only.
    pub async fn calc_with(&self, changes: Value) -> Result<Value> {
        self.call_on(TransportKind::Socket, "calc_with", Some(changes))
            .await
            .map(|f| take_field(f, "output"))
    }
}
