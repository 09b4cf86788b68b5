use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::utils::is_shutting_down;

/// Remote-side client for the headquarters instance this host federates
/// with: register on startup, heartbeat through the shared health endpoint,
/// forward session-change events, deregister on shutdown.
pub struct HqClient {
    hq_url: String,
    hq_username: String,
    hq_password: String,
    remote_id: String,
    remote_name: String,
    /// The URL HQ should reach us on.
    our_url: String,
    /// Bearer token HQ must present when calling back.
    token: String,
    http: reqwest::blocking::Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    id: &'a str,
    name: &'a str,
    url: &'a str,
    token: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshSessionsRequest<'a> {
    action: &'a str,
    session_id: &'a str,
}

impl HqClient {
    pub fn new(
        hq_url: String,
        hq_username: String,
        hq_password: String,
        remote_id: String,
        remote_name: String,
        our_url: String,
        token: String,
    ) -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to construct http client");
        Self {
            hq_url,
            hq_username,
            hq_password,
            remote_id,
            remote_name,
            our_url,
            token,
            http,
        }
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn hq_url(&self) -> &str {
        &self.hq_url
    }

    /// Registers this host with HQ. A duplicate name is a startup error the
    /// operator has to resolve.
    pub fn register(&self) -> anyhow::Result<()> {
        let url = format!("{}/api/remotes/register", self.hq_url.trim_end_matches('/'));
        let body = RegisterRequest {
            id: &self.remote_id,
            name: &self.remote_name,
            url: &self.our_url,
            token: &self.token,
        };
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.hq_username, Some(&self.hq_password))
            .json(&body)
            .send()?;
        if !response.status().is_success() {
            anyhow::bail!(
                "HQ rejected registration ({}): {}",
                response.status(),
                response.text().unwrap_or_default()
            );
        }
        info!(hq = self.hq_url, name = self.remote_name, "registered with HQ");
        Ok(())
    }

    /// Best-effort removal from HQ's registry on shutdown.
    pub fn deregister(&self) {
        let url = format!(
            "{}/api/remotes/{}",
            self.hq_url.trim_end_matches('/'),
            self.remote_id
        );
        match self
            .http
            .delete(&url)
            .basic_auth(&self.hq_username, Some(&self.hq_password))
            .send()
        {
            Ok(response) => {
                debug!(status = %response.status(), "deregistered from HQ");
            }
            Err(err) => {
                debug!(%err, "failed to deregister from HQ");
            }
        }
    }

    /// Tells HQ a session directory appeared or disappeared on this host.
    /// During shutdown a 503 from HQ is expected and silently accepted.
    pub fn notify_session_change(&self, action: &str, session_id: &str) {
        let url = format!(
            "{}/api/remotes/{}/refresh-sessions",
            self.hq_url.trim_end_matches('/'),
            self.remote_name
        );
        let body = RefreshSessionsRequest { action, session_id };
        let result = self
            .http
            .post(&url)
            .basic_auth(&self.hq_username, Some(&self.hq_password))
            .json(&body)
            .send();
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) if response.status().as_u16() == 503 && is_shutting_down() => {
                debug!("HQ returned 503 during shutdown, ignoring");
            }
            Ok(response) => {
                if is_shutting_down() {
                    debug!(status = %response.status(), "session-change notify failed during shutdown");
                } else {
                    warn!(status = %response.status(), session_id, "HQ rejected session-change notification");
                }
            }
            Err(err) => {
                if is_shutting_down() {
                    debug!(%err, "session-change notify failed during shutdown");
                } else {
                    warn!(%err, session_id, "failed to notify HQ of session change");
                }
            }
        }
    }
}
