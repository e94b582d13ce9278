use std::io::ErrorKind;
use std::sync::Arc;

use crate::action::Action;
use crate::core::{DeployError, Result};

pub const LOG_SEPARATOR: &str = "\n\n";

/// Concatenate the execution logs of `actions`.
///
/// Actions still running have no file yet; their in-memory log is used.
pub async fn collect_logs(actions: &[Arc<Action>]) -> Result<String> {
    let mut parts = Vec::with_capacity(actions.len());
    for action in actions {
        let text = match tokio::fs::read_to_string(action.log_path()).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => action.render_log(),
            Err(e) => {
                return Err(DeployError::io(
                    format!("read {}", action.log_path().display()),
                    e,
                ))
            }
        };
        if !text.is_empty() {
            parts.push(text);
        }
    }
    Ok(parts.join(LOG_SEPARATOR))
}
