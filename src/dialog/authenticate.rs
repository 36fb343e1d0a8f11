use crate::stack::{ClientTransaction, SipStack};
use crate::transaction::{make_via_branch, random_text, CNONCE_LEN};
use crate::{Error, Result};
use async_trait::async_trait;
use rsip::headers::auth::{AuthQop, Qop};
use rsip::prelude::*;
use rsip::services::DigestGenerator;
use rsip::typed::{Authorization, ProxyAuthorization, WwwAuthenticate};
use rsip::{Header, Param, Request, Response};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Digest credentials of a trunk account.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub realm: Option<String>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("realm", &self.realm)
            .finish()
    }
}

/// How many later requests of a call may be authorized from its last
/// answered challenge (see [`AuthenticationHelper::authorize`]).
///
/// Registration flows use `Limited(0)`: nothing is cached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryBudget {
    Limited(u32),
    Unlimited,
}

#[async_trait]
pub trait AuthenticationHelper: Send + Sync {
    /// Build a credentialed retry of the challenged transaction. The returned
    /// transaction is created but not sent.
    async fn handle_challenge(
        &self,
        response: &Response,
        tx: &ClientTransaction,
        credential: &Credential,
        budget: RetryBudget,
    ) -> Result<ClientTransaction>;

    /// Answer a challenge of the request's call in advance, from what earlier
    /// challenges left in the cache. Returns false when nothing is cached or
    /// the budget of the call is spent.
    fn authorize(&self, request: &mut Request) -> Result<bool>;
}

/// The last challenge answered for a call, kept to authorize its later
/// requests without another round trip.
struct CachedChallenge {
    challenge: WwwAuthenticate,
    proxy: bool,
    credential: Credential,
    nonce_count: u8,
    remaining: RetryBudget,
}

/// RFC 2617 digest answer to 401/407 challenges.
pub struct DigestAuthenticator {
    stack: Arc<dyn SipStack>,
    cache: Mutex<HashMap<String, CachedChallenge>>,
}

impl DigestAuthenticator {
    pub fn new(stack: Arc<dyn SipStack>) -> Self {
        Self {
            stack,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn forget(&self, call_id: &str) {
        self.cache.lock().unwrap().remove(call_id);
    }

    pub fn is_cached(&self, call_id: &str) -> bool {
        self.cache.lock().unwrap().contains_key(call_id)
    }

    /// Challenge of `call_id` with its next nonce count, consuming one use of
    /// its budget.
    fn take_cached(&self, call_id: &str) -> Option<(WwwAuthenticate, bool, Credential, u8)> {
        let mut cache = self.cache.lock().unwrap();
        let entry = cache.get_mut(call_id)?;
        match entry.remaining {
            RetryBudget::Limited(0) => {
                cache.remove(call_id);
                return None;
            }
            RetryBudget::Limited(n) => entry.remaining = RetryBudget::Limited(n - 1),
            RetryBudget::Unlimited => {}
        }
        entry.nonce_count = entry.nonce_count.saturating_add(1);
        Some((
            entry.challenge.clone(),
            entry.proxy,
            entry.credential.clone(),
            entry.nonce_count,
        ))
    }
}

/// Digest answer of `credential` to `challenge` for `request`.
fn digest_authorization(
    challenge: &WwwAuthenticate,
    credential: &Credential,
    request: &Request,
    nonce_count: u8,
) -> Authorization {
    let cnonce = random_text(CNONCE_LEN);
    let qop = match challenge.qop {
        Some(Qop::Auth) => Some(AuthQop::Auth {
            cnonce,
            nc: nonce_count,
        }),
        Some(Qop::AuthInt) => Some(AuthQop::AuthInt {
            cnonce,
            nc: nonce_count,
        }),
        _ => None,
    };
    let algorithm = challenge
        .algorithm
        .unwrap_or(rsip::headers::auth::Algorithm::Md5);

    let digest = DigestGenerator {
        username: credential.username.as_str(),
        password: credential.password.as_str(),
        algorithm,
        nonce: challenge.nonce.as_str(),
        method: &request.method,
        qop: qop.as_ref(),
        uri: &request.uri,
        realm: challenge.realm.as_str(),
    }
    .compute();

    Authorization {
        scheme: challenge.scheme.clone(),
        username: credential.username.clone(),
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        uri: request.uri.clone(),
        response: digest,
        algorithm: Some(algorithm),
        opaque: challenge.opaque.clone(),
        qop,
    }
}

/// Replace any authorization on `request` by `auth`.
fn set_authorization(request: &mut Request, auth: Authorization, proxy: bool) {
    request.headers_mut().retain(|h| {
        !matches!(
            h,
            Header::ProxyAuthenticate(_)
                | Header::Authorization(_)
                | Header::WwwAuthenticate(_)
                | Header::ProxyAuthorization(_)
        )
    });
    let header: Header = if proxy {
        ProxyAuthorization(auth).into()
    } else {
        auth.into()
    };
    request.headers_mut().push(header);
}

#[async_trait]
impl AuthenticationHelper for DigestAuthenticator {
    async fn handle_challenge(
        &self,
        response: &Response,
        tx: &ClientTransaction,
        credential: &Credential,
        budget: RetryBudget,
    ) -> Result<ClientTransaction> {
        let (challenge, proxy) = match response.www_authenticate_header() {
            Some(h) => (h.typed()?, false),
            None => {
                let h = rsip::header_opt!(response.headers().iter(), Header::ProxyAuthenticate)
                    .ok_or_else(|| {
                        Error::TransactionError(
                            "missing proxy/www authenticate".to_string(),
                            tx.key.clone(),
                        )
                    })?;
                (h.typed()?.0, true)
            }
        };

        let mut request = tx.request.clone();
        let seq = request.cseq_header()?.seq()?;
        request.cseq_header_mut()?.mut_seq(seq + 1)?;

        let mut via = request.via_header()?.typed()?;
        via.params.retain(|p| !matches!(p, Param::Branch(_)));
        via.params.push(make_via_branch());
        request.headers_mut().unique_push(via.into());

        let auth = digest_authorization(&challenge, credential, &tx.request, 1);
        set_authorization(&mut request, auth, proxy);

        let call_id = request.call_id_header()?.value().to_string();
        if budget == RetryBudget::Limited(0) {
            self.forget(&call_id);
        } else {
            self.cache.lock().unwrap().insert(
                call_id.clone(),
                CachedChallenge {
                    challenge,
                    proxy,
                    credential: credential.clone(),
                    nonce_count: 1,
                    remaining: budget,
                },
            );
        }
        debug!(key = %tx.key, %call_id, proxy, "answering digest challenge");

        self.stack
            .new_client_transaction(tx.listener, request, tx.destination.clone())
    }

    fn authorize(&self, request: &mut Request) -> Result<bool> {
        let call_id = request.call_id_header()?.value().to_string();
        let Some((challenge, proxy, credential, nonce_count)) = self.take_cached(&call_id) else {
            return Ok(false);
        };
        let auth = digest_authorization(&challenge, &credential, request, nonce_count);
        set_authorization(request, auth, proxy);
        debug!(%call_id, nonce_count, "authorized from cached challenge");
        Ok(true)
    }
}
