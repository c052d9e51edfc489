//! External ticket exchange.
//!
//! When the server answers the credential step with a challenge, the
//! account and password are presented to a separate HTTPS login service
//! together with that challenge. The service replies with a ticket that is
//! then handed back to the server.
//!
//! ```text
//! Session                 NexusClient                 login service
//!    | RequestTicket           |                             |
//!    |------------------------>|  GET, Authorization:        |
//!    |                         |  Passport1.4 ...,<challenge>|
//!    |                         |---------------------------->|
//!    |                         |<----------------------------|
//!    |                         |  Authentication-Info:       |
//!    |   ticket result         |  ...,from-PP='<ticket>',... |
//!    |<------------------------|                             |
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, LOCATION};
use reqwest::{redirect, Client, StatusCode};
use tracing::{debug, warn};

use crate::config::NexusConfig;
use crate::error::{EngineError, Result};

/// Redirects followed within one ticket request.
const MAX_NEXUS_REDIRECTS: usize = 5;

lazy_static! {
    /// Ticket inside an `Authentication-Info` value
    static ref TICKET_RE: Option<Regex> = Regex::new(r"from-PP='([^']*)'").ok();
}

/// Everything the ticket service needs.
#[derive(Clone, PartialEq, Eq)]
pub struct TicketRequest {
    /// Account identifier
    pub account: String,
    /// Credential
    pub password: String,
    /// Challenge string from the server's credential reply
    pub challenge: String,
}

impl std::fmt::Debug for TicketRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketRequest")
            .field("account", &self.account)
            .field("password", &"<redacted>")
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// Performs the ticket exchange.
///
/// Implementations run on the driver's runtime; the result is fed back to
/// the Session as an input.
pub trait TicketService: Send + Sync {
    /// Exchange credentials and challenge for a ticket.
    fn request_ticket(
        &self,
        request: TicketRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>>;

    /// Service name for logs
    fn name(&self) -> &'static str;
}

/// HTTPS ticket service client.
#[derive(Debug, Clone)]
pub struct NexusClient {
    client: Client,
    url: String,
}

impl NexusClient {
    /// Build a client for the configured login endpoint.
    pub fn new(config: &NexusConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| EngineError::Authentication(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }

    /// Login endpoint
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn exchange(&self, request: TicketRequest) -> Result<String> {
        let auth = authorization_header(&request);
        let mut url = self.url.clone();

        // Redirects are followed by hand: the Authorization header must
        // survive a change of host.
        for _ in 0..=MAX_NEXUS_REDIRECTS {
            debug!(url = %url, account = %request.account, "requesting ticket");
            let response = self
                .client
                .get(&url)
                .header(AUTHORIZATION, auth.as_str())
                .send()
                .await?;

            let status = response.status();
            match status {
                StatusCode::OK => {
                    let info = response
                        .headers()
                        .get("Authentication-Info")
                        .and_then(|v| v.to_str().ok())
                        .ok_or_else(|| {
                            EngineError::Authentication("reply without Authentication-Info".into())
                        })?;
                    return parse_ticket(info).ok_or_else(|| {
                        EngineError::Authentication("reply without a ticket".into())
                    });
                }
                StatusCode::UNAUTHORIZED => {
                    warn!(account = %request.account, "ticket service rejected credentials");
                    return Err(EngineError::Authentication("credentials rejected".into()));
                }
                s if s.is_redirection() => {
                    url = response
                        .headers()
                        .get(LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                        .ok_or_else(|| {
                            EngineError::Authentication("redirect without Location".into())
                        })?;
                }
                other => {
                    return Err(EngineError::Authentication(format!(
                        "ticket service returned {other}"
                    )))
                }
            }
        }
        Err(EngineError::Authentication("too many redirects".into()))
    }
}

impl TicketService for NexusClient {
    fn request_ticket(
        &self,
        request: TicketRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(self.exchange(request))
    }

    fn name(&self) -> &'static str {
        "nexus"
    }
}

/// `Authorization` value for a ticket request.
pub fn authorization_header(request: &TicketRequest) -> String {
    format!(
        "Passport1.4 OrgVerb=GET,OrgURL=http%3A%2F%2Fmessenger%2Emsn%2Ecom,sign-in={},pwd={},{}",
        percent_encode(&request.account),
        percent_encode(&request.password),
        request.challenge
    )
}

/// Pull the ticket out of an `Authentication-Info` value.
pub fn parse_ticket(header: &str) -> Option<String> {
    TICKET_RE
        .as_ref()?
        .captures(header)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|t| !t.is_empty())
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
