use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use super::{check_items, mismatch};
use crate::action::{Action, ActionItem, ActionKind, ActionType, ExecContext, Executor, ItemErrorKind, RemoteSession};
use crate::core::{CheckItem, DeployError, ErrorDetail, Result};
use crate::machine::CommandOutput;
use crate::model::NodeConfig;
use crate::scripts;

/// Probe every configured port from the action's node to a destination.
///
/// For each item the destination starts a capture first, the source sends
/// after `probe_grace`, and the capture result comes back over a oneshot.
/// A failed item never stops the remaining ones.
pub struct ConnectivityCheckExecutor;

impl ConnectivityCheckExecutor {
    async fn check_item(
        item: &CheckItem,
        source: &RemoteSession,
        destination: &RemoteSession,
        source_node: &NodeConfig,
        destination_node: &NodeConfig,
        ctx: &ExecContext,
    ) -> std::result::Result<(), (ItemErrorKind, ErrorDetail)> {
        let capture = scripts::capture(item, source_node, ctx.config.capture_timeout);
        let (tx, rx) = oneshot::channel::<Result<CommandOutput>>();
        let receiver = destination.clone();
        tokio::spawn(async move {
            let _ = tx.send(receiver.run(&capture).await);
        });

        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err((ItemErrorKind::Script, DeployError::cancelled(item.name()).detail()));
            }
            _ = tokio::time::sleep(ctx.config.probe_grace) => {}
        }

        let sent = source.run_unchecked(&scripts::probe(item, destination_node)).await;
        let captured = rx
            .await
            .map_err(|_| DeployError::internal(format!("capture for {} dropped", item.name())));

        if let Err(e) = sent {
            return Err((ItemErrorKind::Script, e.detail()));
        }
        match captured {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(DeployError::Remote { stderr, .. })) => Err((
                ItemErrorKind::Script,
                ErrorDetail::new(
                    "port unreachable",
                    format!(
                        "{} from {} to {} was not received: {}",
                        item.name(),
                        source_node.ip,
                        destination_node.ip,
                        stderr.trim()
                    ),
                    "check firewall rules between the nodes",
                ),
            )),
            Ok(Err(e)) | Err(e) => Err((ItemErrorKind::Script, e.detail())),
        }
    }
}

#[async_trait]
impl Executor for ConnectivityCheckExecutor {
    async fn execute(&self, action: &Arc<Action>, ctx: &ExecContext) -> Result<()> {
        let ActionKind::ConnectivityCheck { destination, items } = action.kind() else {
            return Err(mismatch(ActionType::ConnectivityCheck, action));
        };
        let source = RemoteSession::open(action, action.node(), ctx).await?;
        let receiver = match RemoteSession::open(action, destination, ctx).await {
            Ok(session) => session,
            Err(e) => {
                source.close().await;
                return Err(e);
            }
        };

        for item in items {
            let result = Self::check_item(item, &source, &receiver, action.node(), destination, ctx).await;
            debug!(
                source = %action.node().name,
                destination = %destination.name,
                item = %item.name(),
                ok = result.is_ok(),
                "connectivity item"
            );
            match result {
                Ok(()) => action.push_item(ActionItem::done(item.name())),
                Err((kind, error)) => action.push_item(ActionItem::failed(item.name(), kind, error)),
            }
        }
        source.close().await;
        receiver.close().await;

        check_items(action)
    }
}
