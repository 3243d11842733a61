//! Optional replies to the human operator.

use serde_json::Value;
use sqlx::SqlitePool;

use crate::context::LoopContext;
use crate::model::ModelManager;
use crate::prompts::PromptKey;
use crate::store;

fn reply_text(doc: &Value) -> Option<String> {
    let text = doc.get("response")?.as_str()?.trim();
    (!text.is_empty() && !text.eq_ignore_ascii_case("null")).then(|| text.to_owned())
}

/// Ask whether the unread operator messages warrant a reply and persist it.
/// Messages stay unread when no reply is produced. Errors are logged and
/// swallowed; this never blocks the loop.
pub async fn respond(pool: &SqlitePool, models: &mut ModelManager, ctx: &LoopContext) -> Option<String> {
    let newest = ctx.human_messages.iter().map(|m| m.id).max()?;
    let listed = ctx
        .human_messages
        .iter()
        .map(|m| format!("- {}", m.content))
        .collect::<Vec<_>>()
        .join("\n");
    let context = format!("Human's recent messages:\n{listed}\n\nCurrent context:\n{}", ctx.full_context);

    let doc = match models.complete(PromptKey::Conversation, &context).await {
        Ok(doc) => doc,
        Err(e) => {
            tracing::warn!(error = %e, "conversation reply failed");
            return None;
        }
    };
    let Some(reply) = reply_text(&doc) else {
        tracing::debug!("no reply needed");
        return None;
    };
    match store::messages::reply_and_mark_read(pool, &reply, newest).await {
        Ok(_) => {
            tracing::info!(answered = ctx.human_messages.len(), "replied to operator");
            Some(reply)
        }
        Err(e) => {
            tracing::warn!(error = %e, "storing operator reply failed");
            None
        }
    }
}
