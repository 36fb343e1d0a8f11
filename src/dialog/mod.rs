use crate::{Error, Result};
use rsip::prelude::*;
use rsip::{Request, Response};

pub mod authenticate;
pub mod context;
pub mod session_timer;


pub use context::{DialogContext, MediaAssociation, MediaSessionHandle, PeerLink};

/// SIP dialog identifier: Call-ID, local tag and remote tag (RFC 3261 12).
///
/// During early dialog establishment `remote_tag` may be empty.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

macro_rules! tag_value {
    ($header:expr) => {
        $header
            .tag()?
            .map(|t| t.value().to_string())
            .unwrap_or_default()
    };
}

impl DialogId {
    pub fn new(call_id: &str, local_tag: &str, remote_tag: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            local_tag: local_tag.to_string(),
            remote_tag: remote_tag.to_string(),
        }
    }

    /// From-tag is local, to-tag is remote.
    pub fn from_uac_request(request: &Request) -> Result<Self> {
        let local_tag = tag_value!(request.from_header()?);
        if local_tag.is_empty() {
            return Err(Error::Error("from tag not found".to_string()));
        }
        Ok(Self {
            call_id: request.call_id_header()?.value().to_string(),
            local_tag,
            remote_tag: tag_value!(request.to_header()?),
        })
    }

    /// To-tag is local, from-tag is remote.
    pub fn from_uas_request(request: &Request) -> Result<Self> {
        let remote_tag = tag_value!(request.from_header()?);
        if remote_tag.is_empty() {
            return Err(Error::Error("from tag not found".to_string()));
        }
        Ok(Self {
            call_id: request.call_id_header()?.value().to_string(),
            local_tag: tag_value!(request.to_header()?),
            remote_tag,
        })
    }

    /// Dialog of a response received as UAC. Both tags are required.
    pub fn from_uac_response(resp: &Response) -> Result<Self> {
        let local_tag = tag_value!(resp.from_header()?);
        let remote_tag = tag_value!(resp.to_header()?);
        if local_tag.is_empty() || remote_tag.is_empty() {
            return Err(Error::Error("dialog tags not found".to_string()));
        }
        Ok(Self {
            call_id: resp.call_id_header()?.value().to_string(),
            local_tag,
            remote_tag,
        })
    }

    /// Dialog of a response sent as UAS: to-tag is local, from-tag is remote.
    pub fn from_uas_response(resp: &Response) -> Result<Self> {
        let local_tag = tag_value!(resp.to_header()?);
        let remote_tag = tag_value!(resp.from_header()?);
        if local_tag.is_empty() || remote_tag.is_empty() {
            return Err(Error::Error("dialog tags not found".to_string()));
        }
        Ok(Self {
            call_id: resp.call_id_header()?.value().to_string(),
            local_tag,
            remote_tag,
        })
    }
}

impl TryFrom<&Response> for DialogId {
    type Error = crate::Error;

    fn try_from(resp: &Response) -> Result<Self> {
        Self::from_uac_response(resp)
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.remote_tag.is_empty() {
            write!(f, "{}-{}", self.call_id, self.local_tag)
        } else {
            write!(f, "{}-{}-{}", self.call_id, self.local_tag, self.remote_tag)
        }
    }
}
