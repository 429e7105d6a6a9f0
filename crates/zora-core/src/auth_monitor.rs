use chrono::{Duration, Utc};
use serde_json::json;

use zora_providers::ProviderRegistry;
use zora_types::{AuthStatus, Envelope};

use crate::event_bus::EventBus;

#[derive(Debug, Clone)]
pub struct AuthReport {
    pub provider: String,
    pub status: AuthStatus,
    pub expiring_soon: bool,
}

/// Periodically probes provider credentials and warns before they expire so
/// the user can act ahead of a mid-task auth failure.
pub struct AuthMonitor {
    registry: ProviderRegistry,
    bus: EventBus,
    warn_before: Duration,
}

impl AuthMonitor {
    pub fn new(registry: ProviderRegistry, bus: EventBus, warn_before_expiry_minutes: i64) -> Self {
        Self {
            registry,
            bus,
            warn_before: Duration::minutes(warn_before_expiry_minutes.max(0)),
        }
    }

    pub async fn check_all(&self) -> Vec<AuthReport> {
        let mut reports = Vec::new();
        for provider in self.registry.all() {
            let name = provider.spec().name.clone();
            let status = provider.check_auth().await;
            let expiring_soon = status
                .expires_at
                .map(|at| at - Utc::now() <= self.warn_before)
                .unwrap_or(false);

            if !status.valid {
                tracing::warn!(provider = %name, "provider authentication is invalid");
                self.bus.publish(Envelope::new(
                    "provider.auth.invalid",
                    "auth-monitor",
                    json!({
                        "provider": name,
                        "requiresInteraction": status.requires_interaction,
                        "canAutoRefresh": status.can_auto_refresh,
                    }),
                ));
            } else if expiring_soon {
                tracing::warn!(
                    provider = %name,
                    expires_at = ?status.expires_at,
                    "provider credentials expire soon"
                );
                self.bus.publish(Envelope::new(
                    "provider.auth.expiring",
                    "auth-monitor",
                    json!({
                        "provider": name,
                        "expiresAt": status.expires_at,
                        "canAutoRefresh": status.can_auto_refresh,
                    }),
                ));
                if status.can_auto_refresh {
                    // A fresh probe is the refresh for adapters that renew
                    // transparently; drop the cache so it happens now.
                    provider.state().poison_auth();
                    let _ = provider.check_auth().await;
                }
            }

            reports.push(AuthReport {
                provider: name,
                status,
                expiring_soon,
            });
        }
        reports
    }
}
