use crate::transaction::make_tag;
use crate::{Error, Result};
use rsip::prelude::*;
use rsip::{Header, Method, Request, Response, StatusCode, StatusCodeKind};

pub const SIPFRAG_CONTENT_TYPE: &str = "message/sipfrag";

pub fn call_id<T: HeadersExt>(msg: &T) -> Result<String> {
    Ok(msg.call_id_header()?.value().to_string())
}

/// Call-ID joined with the From tag. Forked branches of one request share it.
pub fn call_leg_id<T: HeadersExt>(msg: &T) -> Result<String> {
    let from_tag = msg
        .from_header()?
        .tag()?
        .map(|t| t.value().to_string())
        .unwrap_or_default();
    Ok(format!("{}:{}", msg.call_id_header()?.value(), from_tag))
}

pub fn cseq_method<T: HeadersExt>(msg: &T) -> Result<Method> {
    Ok(msg.cseq_header()?.method()?)
}

pub fn has_to_tag(request: &Request) -> Result<bool> {
    Ok(request.to_header()?.tag()?.is_some())
}

pub fn is_challenge(status: &StatusCode) -> bool {
    matches!(
        status,
        StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
    )
}

pub fn is_success(status: &StatusCode) -> bool {
    matches!(status.kind(), StatusCodeKind::Successful)
}

/// Received parameter (if any) and sent-by host of the top Via.
pub fn top_via_sender(request: &Request) -> Result<(Option<String>, String)> {
    let via = request.via_header()?.typed()?;
    let received = via
        .received()
        .map_err(|e| Error::SipMessage(format!("invalid via received: {}", e)))?
        .map(|ip| ip.to_string());
    Ok((received, via.uri.host_with_port.host.to_string()))
}

pub fn warning_header(text: &str) -> Header {
    Header::Other("Warning".into(), format!("399 sipbridge \"{}\"", text).into())
}

/// Build a response to `request` the way a UAS would: Via, From, To, Call-ID,
/// CSeq and Record-Route are copied and a To tag is added when missing.
pub fn make_response(
    request: &Request,
    status: StatusCode,
    headers: Option<Vec<Header>>,
    body: Option<Vec<u8>>,
) -> Result<Response> {
    let mut resp_headers: Vec<Header> = request
        .headers
        .iter()
        .filter(|h| {
            matches!(
                h,
                Header::Via(_)
                    | Header::From(_)
                    | Header::CallId(_)
                    | Header::CSeq(_)
                    | Header::RecordRoute(_)
            )
        })
        .cloned()
        .collect();

    let to = request.to_header()?;
    if to.tag()?.is_none() && status != StatusCode::Trying {
        resp_headers.push(Header::To(to.typed()?.with_tag(make_tag().into()).untyped()));
    } else {
        resp_headers.push(Header::To(to.clone()));
    }
    resp_headers.extend(headers.unwrap_or_default());

    let body = body.unwrap_or_default();
    resp_headers.push(Header::ContentLength((body.len() as u32).into()));

    Ok(Response {
        status_code: status,
        version: rsip::Version::V2,
        headers: resp_headers.into(),
        body,
    })
}

/// Attach a short diagnostic as a `message/sipfrag` body.
pub fn add_sipfrag(response: &mut Response, text: &str) {
    let body = text.as_bytes().to_vec();
    let headers = response.headers_mut();
    headers.retain(|h| !matches!(h, Header::ContentType(_) | Header::ContentLength(_)));
    headers.push(Header::ContentType(SIPFRAG_CONTENT_TYPE.into()));
    headers.push(Header::ContentLength((body.len() as u32).into()));
    response.body = body;
}

/// Copy the digest challenge headers of `challenge` onto `response`.
pub fn copy_challenge_headers(challenge: &Response, response: &mut Response) {
    let challenges: Vec<Header> = challenge
        .headers
        .iter()
        .filter(|h| matches!(h, Header::WwwAuthenticate(_) | Header::ProxyAuthenticate(_)))
        .cloned()
        .collect();
    for header in challenges {
        response.headers_mut().push(header);
    }
}
