//! Conversation id propagation
//!
//! Inbound, the id comes from one request parameter. Outbound, it is written
//! into generated URLs that should resume the same conversation.

use scoped_store::RequestHost;

/// Parameter that suppresses propagation when present
pub const NO_CID_PARAMETER: &str = "nocid";

/// Parameter controlling propagation
pub const CONVERSATION_PROPAGATION_PARAMETER: &str = "conversationPropagation";

/// Value of [`CONVERSATION_PROPAGATION_PARAMETER`] that suppresses propagation
pub const CONVERSATION_PROPAGATION_NONE: &str = "none";

/// Propagated conversation id of a request
///
/// `None` means the request starts a transient conversation.
#[must_use]
pub fn determine_conversation_id(request: &dyn RequestHost, parameter_name: &str) -> Option<String> {
    if request.parameter(NO_CID_PARAMETER).is_some() {
        return None;
    }
    if request.parameter(CONVERSATION_PROPAGATION_PARAMETER).as_deref()
        == Some(CONVERSATION_PROPAGATION_NONE)
    {
        return None;
    }
    let cid = request.parameter(parameter_name).filter(|cid| !cid.is_empty());
    tracing::trace!(cid = ?cid, "conversation id from request");
    cid
}

/// Write `cid` into `url` under `parameter_name`
///
/// Replaces an existing value of the parameter and keeps any fragment at the
/// end.
#[must_use]
pub fn propagate_url(url: &str, parameter_name: &str, cid: &str) -> String {
    let (without_fragment, fragment) = match url.find('#') {
        Some(at) => url.split_at(at),
        None => (url, ""),
    };
    let (path, query) = match without_fragment.find('?') {
        Some(at) => (&without_fragment[..at], &without_fragment[at + 1..]),
        None => (without_fragment, ""),
    };

    let encoded_name = urlencoding::encode(parameter_name);
    let mut pairs: Vec<String> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let name = pair.split_once('=').map_or(*pair, |(name, _)| name);
            urlencoding::decode(name).map_or(true, |name| name != parameter_name)
        })
        .map(str::to_string)
        .collect();
    pairs.push(format!("{encoded_name}={}", urlencoding::encode(cid)));

    format!("{path}?{}{fragment}", pairs.join("&"))
}
