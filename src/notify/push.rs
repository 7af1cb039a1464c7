//! Push delivery via the external provider.
//!
//! One POST per (subscription, notification). The provider distinguishes a
//! permanently invalid token (404/410) from a transient failure; the former
//! deactivates that single subscription row, the latter is logged and
//! dropped — there are no retries.

use serde_json::json;

use crate::config::PushConfig;
use crate::db::models::PushSubscriptionRow;
use crate::db::{self, DbPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// Provider reports the token is permanently invalid.
    Gone,
    Transient,
}

#[derive(Clone)]
pub struct PushSender {
    http: reqwest::Client,
    config: Option<PushConfig>,
}

impl PushSender {
    pub fn new(config: Option<PushConfig>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config
            .as_ref()
            .map(|c| c.enabled && !c.endpoint.is_empty())
            .unwrap_or(false)
    }

    /// Deliver one notification to one subscription.
    pub async fn deliver(
        &self,
        sub: &PushSubscriptionRow,
        title: &str,
        body: &str,
        payload: &serde_json::Value,
    ) -> PushOutcome {
        let Some(cfg) = self.config.as_ref().filter(|c| c.enabled) else {
            return PushOutcome::Transient;
        };

        let resp = self
            .http
            .post(&cfg.endpoint)
            .bearer_auth(&cfg.api_key)
            .json(&json!({
                "to": sub.endpoint,
                "keys": { "p256dh": sub.key_p256dh, "auth": sub.key_auth },
                "title": title,
                "body": body,
                "payload": payload,
            }))
            .send()
            .await;

        match resp {
            Ok(r) if r.status().is_success() => PushOutcome::Delivered,
            Ok(r) if r.status().as_u16() == 404 || r.status().as_u16() == 410 => PushOutcome::Gone,
            Ok(r) => {
                tracing::warn!(status = %r.status(), endpoint = %sub.endpoint, "push delivery failed");
                PushOutcome::Transient
            }
            Err(e) => {
                tracing::warn!(error = %e, endpoint = %sub.endpoint, "push delivery failed");
                PushOutcome::Transient
            }
        }
    }
}

/// Load a principal's active subscriptions and deliver to each.
/// A Gone outcome deactivates that subscription only; other subscriptions
/// for the same principal are unaffected. Errors never propagate.
pub async fn push_to_user(
    db: DbPool,
    sender: PushSender,
    user_id: String,
    title: String,
    body: String,
    payload: serde_json::Value,
) {
    if !sender.enabled() {
        return;
    }

    let uid = user_id.clone();
    let subs = db::blocking(db.clone(), move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, user_id, endpoint, key_p256dh, key_auth, active
             FROM push_subscriptions WHERE user_id = ?1 AND active = 1",
        )?;
        let subs: Vec<PushSubscriptionRow> = stmt
            .query_map([uid], |row| {
                Ok(PushSubscriptionRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    endpoint: row.get(2)?,
                    key_p256dh: row.get(3)?,
                    key_auth: row.get(4)?,
                    active: row.get::<_, i64>(5)? != 0,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(subs)
    })
    .await;

    let subs = match subs {
        Ok(subs) => subs,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "failed to load push subscriptions");
            return;
        }
    };

    for sub in subs {
        match sender.deliver(&sub, &title, &body, &payload).await {
            PushOutcome::Delivered => {}
            PushOutcome::Transient => {}
            PushOutcome::Gone => {
                tracing::info!(
                    user_id = %user_id,
                    endpoint = %sub.endpoint,
                    "push subscription gone, deactivating"
                );
                let sub_id = sub.id.clone();
                let result = db::blocking(db.clone(), move |conn| {
                    conn.execute(
                        "UPDATE push_subscriptions SET active = 0 WHERE id = ?1",
                        [sub_id],
                    )?;
                    Ok(())
                })
                .await;
                if let Err(e) = result {
                    tracing::warn!(error = %e, "failed to deactivate push subscription");
                }
            }
        }
    }
}
