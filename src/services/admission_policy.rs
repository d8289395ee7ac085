use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::stores::settings_store::GatewaySettings;

const BEARER_PREFIX: &str = "Bearer ";

/// Claims extracted from a verified identity token
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityClaims {
    pub subject: Option<String>,
    pub email: Option<String>,
    pub email_verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError(pub String);

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token verification failed: {}", self.0)
    }
}

impl std::error::Error for VerifyError {}

/// Checks a bearer token's signature, issuer and audience against the
/// identity provider's key set
pub trait IdentityVerifier: Send + Sync {
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<IdentityClaims, VerifyError>>;
}

/// Identity forwarded with an admitted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedIdentity {
    /// Lower-cased
    pub email: String,
    pub subject: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitStatus {
    Admitted(AdmittedIdentity),
    Rejected { status: u16, reason: &'static str },
}

impl AdmitStatus {
    fn unauthorized(reason: &'static str) -> Self {
        Self::Rejected { status: 401, reason }
    }

    fn forbidden(reason: &'static str) -> Self {
        Self::Rejected { status: 403, reason }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }

    /// HTTP status to answer with
    pub fn status(&self) -> u16 {
        match self {
            Self::Admitted(_) => 200,
            Self::Rejected { status, .. } => *status,
        }
    }
}

/// Admission policy for the wallet backend's edge proxy
///
/// Requests must carry a verified identity token. Rejected requests never
/// reach wallet logic:
/// - 401 when the bearer token is missing or fails verification
/// - 403 when the identity has no email, is denylisted, or is unverified
///   while verification is required
pub struct IdentityAdmissionPolicy {
    verifier: Arc<dyn IdentityVerifier>,
    denylist: Vec<String>,
    require_email_verified: bool,
}

impl IdentityAdmissionPolicy {
    pub fn new(verifier: Arc<dyn IdentityVerifier>, settings: &GatewaySettings) -> Self {
        Self {
            verifier,
            denylist: settings.denylist(),
            require_email_verified: settings.require_email_verified,
        }
    }

    pub fn admit_request<'a>(&'a self, authorization: Option<&'a str>) -> BoxFuture<'a, AdmitStatus> {
        Box::pin(async move {
            let Some(token) = authorization.and_then(|h| h.strip_prefix(BEARER_PREFIX)) else {
                log::debug!("Rejected request without bearer token");
                return AdmitStatus::unauthorized("missing_bearer");
            };

            let claims = match self.verifier.verify(token.trim()).await {
                Ok(claims) => claims,
                Err(e) => {
                    log::warn!("Rejected request: {}", e);
                    return AdmitStatus::unauthorized("invalid_token");
                }
            };

            let email = claims
                .email
                .as_deref()
                .map(|e| e.trim().to_lowercase())
                .unwrap_or_default();
            if email.is_empty() {
                return AdmitStatus::forbidden("email_missing");
            }
            if self.denylist.iter().any(|denied| *denied == email) {
                log::warn!("Rejected denylisted identity {}", email);
                return AdmitStatus::forbidden("email_denylisted");
            }
            if self.require_email_verified && !claims.email_verified {
                log::info!("Rejected unverified identity {}", email);
                return AdmitStatus::forbidden("email_not_verified");
            }

            AdmitStatus::Admitted(AdmittedIdentity {
                email,
                subject: claims.subject,
            })
        })
    }
}
