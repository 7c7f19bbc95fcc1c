//! Built-in tools registered at startup
//!
//! The core only routes tool calls; real device tools live in collaborator
//! crates. The one built-in is the device status report the server polls.

use std::sync::Arc;
use tokio::sync::watch;

use sona_core::DeviceState;
use sona_tools::{FnTool, PropertyList, ToolOutput, ToolRegistry};

/// Register the built-in tool set on a fresh registry.
pub fn register_builtin_tools(
    registry: &Arc<ToolRegistry>,
    state: watch::Receiver<DeviceState>,
) -> Result<(), sona_core::ToolError> {
    registry.register(FnTool::new(
        "self.get_device_status",
        "Report the client session state. Use when the user asks what the \
         device is doing or whether it is listening.",
        PropertyList::default(),
        move |_args| {
            let state = *state.borrow();
            async move {
                let status = serde_json::json!({
                    "session_state": state.as_str(),
                    "audio_ready": true,
                });
                Ok(ToolOutput::text(status.to_string()))
            }
        },
    ))
}
