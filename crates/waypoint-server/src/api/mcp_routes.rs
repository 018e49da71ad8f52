//! MCP Streamable HTTP API - /api/mcp
//!
//! POST   /api/mcp - JSON-RPC messages (initialize, tools/list, tools/call)
//! GET    /api/mcp - SSE stream for server-initiated messages
//! DELETE /api/mcp - Terminate an MCP session
//!
//! Implements the MCP Streamable HTTP protocol and exposes the five
//! orchestrator tools: list_workflows, start_workflow,
//! get_workflow_status, advance_workflow, resume_workflow.

use axum::{
    extract::State,
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_stream::StreamExt as _;

use waypoint_core::error::EngineError;
use waypoint_core::models::StepReport;
use waypoint_core::state::AppState;

/// In-memory session store for MCP sessions.
type McpSessions = Arc<RwLock<HashMap<String, McpSessionData>>>;

struct McpSessionData {
    #[allow(dead_code)]
    protocol_version: String,
}

pub fn router() -> Router<AppState> {
    let sessions: McpSessions = Arc::new(RwLock::new(HashMap::new()));

    Router::new().route(
        "/",
        get({
            let sessions = sessions.clone();
            move |headers, state| mcp_get(headers, state, sessions)
        })
        .post({
            let sessions = sessions.clone();
            move |headers, state, body| mcp_post(headers, state, body, sessions)
        })
        .delete({
            let sessions = sessions.clone();
            move |headers, state| mcp_delete(headers, state, sessions)
        }),
    )
}

// ─── POST /api/mcp ────────────────────────────────────────────────────

async fn mcp_post(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
    sessions: McpSessions,
) -> Result<(HeaderMap, Json<serde_json::Value>), EngineError> {
    let session_id = headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let method = body.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let id = body.get("id").cloned().unwrap_or(serde_json::json!(null));
    let params = body.get("params").cloned().unwrap_or_default();

    tracing::info!("[MCP Route] POST: method={}, session={:?}", method, session_id);

    let mut response_headers = HeaderMap::new();
    response_headers.insert("access-control-allow-origin", "*".parse().unwrap());
    response_headers.insert(
        "access-control-expose-headers",
        "Mcp-Session-Id, MCP-Protocol-Version".parse().unwrap(),
    );

    match method {
        "initialize" => {
            let new_session_id = uuid::Uuid::new_v4().to_string();
            let protocol_version = params
                .get("protocolVersion")
                .and_then(|v| v.as_str())
                .unwrap_or("2024-11-05");

            sessions.write().await.insert(
                new_session_id.clone(),
                McpSessionData {
                    protocol_version: protocol_version.to_string(),
                },
            );

            response_headers.insert("mcp-session-id", new_session_id.parse().unwrap());

            let active_count = sessions.read().await.len();
            tracing::info!(
                "[MCP Route] Session created: {} (active: {})",
                new_session_id,
                active_count
            );

            Ok((
                response_headers,
                Json(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "protocolVersion": protocol_version,
                        "capabilities": {
                            "tools": { "listChanged": false }
                        },
                        "serverInfo": {
                            "name": "waypoint-orchestrator",
                            "version": env!("CARGO_PKG_VERSION")
                        }
                    }
                })),
            ))
        }

        "tools/list" => Ok((
            response_headers,
            Json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "tools": build_tool_list() }
            })),
        )),

        "tools/call" => {
            let tool_name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
            let arguments = params
                .get("arguments")
                .cloned()
                .unwrap_or(serde_json::json!({}));

            let result = execute_tool(&state, tool_name, &arguments).await;

            Ok((
                response_headers,
                Json(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": result
                })),
            ))
        }

        "notifications/initialized" => Ok((
            response_headers,
            Json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {}
            })),
        )),

        _ => Ok((
            response_headers,
            Json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": -32601,
                    "message": format!("Method not found: {}", method)
                }
            })),
        )),
    }
}

// ─── GET /api/mcp (SSE) ──────────────────────────────────────────────

async fn mcp_get(
    headers: HeaderMap,
    State(_state): State<AppState>,
    sessions: McpSessions,
) -> Result<
    Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>,
    (axum::http::StatusCode, Json<serde_json::Value>),
> {
    let session_id = headers.get("mcp-session-id").and_then(|v| v.to_str().ok());

    if session_id.is_none() || !sessions.read().await.contains_key(session_id.unwrap_or("")) {
        return Err((
            axum::http::StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "jsonrpc": "2.0",
                "error": {
                    "code": -32600,
                    "message": "No active session. Send an initialize POST request first."
                }
            })),
        ));
    }

    let heartbeat = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(
        std::time::Duration::from_secs(30),
    ))
    .map(|_| Ok(Event::default().comment("heartbeat")));

    Ok(Sse::new(heartbeat).keep_alive(KeepAlive::default()))
}

// ─── DELETE /api/mcp ──────────────────────────────────────────────────

async fn mcp_delete(
    headers: HeaderMap,
    State(_state): State<AppState>,
    sessions: McpSessions,
) -> Result<axum::http::StatusCode, EngineError> {
    let session_id = headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if let Some(sid) = session_id {
        let mut store = sessions.write().await;
        if store.remove(&sid).is_some() {
            tracing::info!("[MCP Route] Session closed: {} (active: {})", sid, store.len());
            Ok(axum::http::StatusCode::NO_CONTENT)
        } else {
            Err(EngineError::BadRequest("Session not found".into()))
        }
    } else {
        Err(EngineError::BadRequest("Missing Mcp-Session-Id header".into()))
    }
}

// ─── Tool Definitions ─────────────────────────────────────────────────

fn build_tool_list() -> Vec<serde_json::Value> {
    vec![
        tool_def(
            "list_workflows",
            "List available workflow definitions",
            serde_json::json!({
                "type": "object",
                "properties": {}
            }),
        ),
        tool_def(
            "start_workflow",
            "Start a new instance of a workflow by its definition name. Returns the instance ID, the first step with its instructions, and the initial context.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "workflow_name": { "type": "string", "description": "Name of the workflow definition to start" },
                    "context": { "type": "object", "description": "Initial key-value map for the instance context" }
                },
                "required": ["workflow_name"]
            }),
        ),
        tool_def(
            "get_workflow_status",
            "Get the full persisted state of a workflow instance",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "instance_id": { "type": "string", "description": "Workflow instance ID" }
                },
                "required": ["instance_id"]
            }),
        ),
        tool_def(
            "advance_workflow",
            "Report the outcome of the previously issued step and request the next step.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "instance_id": { "type": "string", "description": "Workflow instance ID" },
                    "report": {
                        "type": "object",
                        "description": "Outcome of the previous step",
                        "properties": {
                            "status": { "type": "string", "description": "How the step went (success, failure, ...)" },
                            "details": { "type": "object" },
                            "message": { "type": "string" },
                            "error": { "type": "string" }
                        }
                    },
                    "context_updates": { "type": "object", "description": "Key-value changes to merge into the instance context" }
                },
                "required": ["instance_id", "report"]
            }),
        ),
        tool_def(
            "resume_workflow",
            "Reconnect to an existing workflow instance, reconciling the client's assumed step with the persisted state.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "instance_id": { "type": "string", "description": "Workflow instance ID" },
                    "assumed_current_step_name": { "type": "string", "description": "The step the client believes it is on" },
                    "report": { "type": "object", "description": "The client's current situation" },
                    "context_updates": { "type": "object", "description": "Key-value changes to merge into the instance context" }
                },
                "required": ["instance_id", "assumed_current_step_name", "report"]
            }),
        ),
    ]
}

fn tool_def(name: &str, description: &str, input_schema: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "description": description,
        "inputSchema": input_schema,
    })
}

/// Execute an MCP tool by name.
async fn execute_tool(
    state: &AppState,
    name: &str,
    args: &serde_json::Value,
) -> serde_json::Value {
    match name {
        "list_workflows" => tool_result_json(&serde_json::json!({
            "workflows": state.engine.list_workflows()
        })),

        "start_workflow" => {
            let Some(workflow_name) = args.get("workflow_name").and_then(|v| v.as_str()) else {
                return tool_result_error("workflow_name is required");
            };
            let context = args.get("context").and_then(|v| v.as_object()).cloned();
            match state.engine.start_workflow(workflow_name, context).await {
                Ok(output) => tool_result_json(
                    &serde_json::to_value(&output).unwrap_or_default(),
                ),
                Err(e) => tool_result_error(&e.to_string()),
            }
        }

        "get_workflow_status" => {
            let Some(instance_id) = args.get("instance_id").and_then(|v| v.as_str()) else {
                return tool_result_error("instance_id is required");
            };
            match state.store.get(instance_id).await {
                Ok(instance) => tool_result_json(
                    &serde_json::to_value(&instance).unwrap_or_default(),
                ),
                Err(e) => tool_result_error(&e.to_string()),
            }
        }

        "advance_workflow" => {
            let Some(instance_id) = args.get("instance_id").and_then(|v| v.as_str()) else {
                return tool_result_error("instance_id is required");
            };
            let report: StepReport = match args.get("report") {
                Some(raw) => match serde_json::from_value(raw.clone()) {
                    Ok(report) => report,
                    Err(e) => return tool_result_error(&format!("invalid report: {}", e)),
                },
                None => return tool_result_error("report is required"),
            };
            let context_updates = args
                .get("context_updates")
                .and_then(|v| v.as_object())
                .cloned();

            match state
                .engine
                .advance_workflow(instance_id, &report, context_updates)
                .await
            {
                Ok(output) => tool_result_json(
                    &serde_json::to_value(&output).unwrap_or_default(),
                ),
                Err(e) => tool_result_error(&e.to_string()),
            }
        }

        "resume_workflow" => {
            let Some(instance_id) = args.get("instance_id").and_then(|v| v.as_str()) else {
                return tool_result_error("instance_id is required");
            };
            let Some(assumed_step) = args
                .get("assumed_current_step_name")
                .and_then(|v| v.as_str())
            else {
                return tool_result_error("assumed_current_step_name is required");
            };
            let report: StepReport = match args.get("report") {
                Some(raw) => match serde_json::from_value(raw.clone()) {
                    Ok(report) => report,
                    Err(e) => return tool_result_error(&format!("invalid report: {}", e)),
                },
                None => return tool_result_error("report is required"),
            };
            let context_updates = args
                .get("context_updates")
                .and_then(|v| v.as_object())
                .cloned();

            match state
                .engine
                .resume_workflow(instance_id, assumed_step, &report, context_updates)
                .await
            {
                Ok(output) => tool_result_json(
                    &serde_json::to_value(&output).unwrap_or_default(),
                ),
                Err(e) => tool_result_error(&e.to_string()),
            }
        }

        _ => tool_result_error(&format!("Unknown tool: {}", name)),
    }
}

fn tool_result_json(value: &serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "content": [{ "type": "text", "text": serde_json::to_string_pretty(value).unwrap_or_default() }]
    })
}

fn tool_result_error(msg: &str) -> serde_json::Value {
    serde_json::json!({
        "isError": true,
        "content": [{ "type": "text", "text": msg }]
    })
}
