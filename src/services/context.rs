//! Caller identity carried on requests.
//!
//! The transport layer records who authenticated a request and whether it
//! came from inside the mesh as request extensions. Forwarded requests also
//! carry the identity they were proxied for in metadata.

use tonic::metadata::MetadataValue;
use tonic::Request;

use crate::constants::PROXIED_FOR_METADATA_KEY;

/// Verified identity of the direct caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedCaller(pub String);

/// Marks a request that arrived from a mesh peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InNetwork;

pub fn authenticated_caller<T>(request: &Request<T>) -> Option<&str> {
    request
        .extensions()
        .get::<AuthenticatedCaller>()
        .map(|c| c.0.as_str())
}

pub fn is_in_network<T>(request: &Request<T>) -> bool {
    request.extensions().get::<InNetwork>().is_some()
}

/// True when the request was already forwarded once
pub fn is_proxied<T>(request: &Request<T>) -> bool {
    request.metadata().contains_key(PROXIED_FOR_METADATA_KEY)
}

/// Identity a forwarded request was proxied for. Empty for an anonymous
/// original caller.
pub fn proxied_for<T>(request: &Request<T>) -> Option<&str> {
    request
        .metadata()
        .get(PROXIED_FOR_METADATA_KEY)
        .and_then(|v| v.to_str().ok())
}

/// Identity authorization decisions are made against: the proxied-for
/// identity when an in-network peer forwarded the request, the direct
/// caller otherwise.
pub fn effective_caller<T>(request: &Request<T>) -> Option<&str> {
    let caller = if is_proxied(request) && is_in_network(request) {
        proxied_for(request)
    } else {
        authenticated_caller(request)
    };
    caller.filter(|c| !c.is_empty())
}

/// Builds the request a node sends on behalf of `original`: same message,
/// authenticated as `node_id`, in-network, tagged with the original caller.
pub fn forwarded_request<T>(
    node_id: &str,
    original: Request<T>,
) -> Request<T> {
    let on_behalf_of = authenticated_caller(&original).unwrap_or_default().to_string();
    let mut request = Request::new(original.into_inner());
    let value = MetadataValue::try_from(on_behalf_of.as_str())
        .unwrap_or_else(|_| MetadataValue::from_static(""));
    request.metadata_mut().insert(PROXIED_FOR_METADATA_KEY, value);
    request
        .extensions_mut()
        .insert(AuthenticatedCaller(node_id.to_string()));
    request.extensions_mut().insert(InNetwork);
    request
}

/// Request as seen from a peer inside the mesh, for embedded callers
pub fn peer_request<T>(
    caller: &str,
    message: T,
) -> Request<T> {
    let mut request = Request::new(message);
    request
        .extensions_mut()
        .insert(AuthenticatedCaller(caller.to_string()));
    request.extensions_mut().insert(InNetwork);
    request
}
