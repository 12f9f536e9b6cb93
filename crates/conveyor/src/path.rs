//! Derives a non-deterministic destination's stored replica path from
//! the PFN the transfer tool reports, by stripping the matching
//! write-protocol's scheme/host/port/prefix (spec.md §4.5
//! "Non-deterministic RSEs").

use catalog::rse::Protocol;

/// Returns the path relative to `protocol`'s prefix, or `None` if `pfn`
/// doesn't actually match this protocol (wrong scheme, host or port).
pub fn derive_path(protocol: &Protocol, pfn: &str) -> Option<String> {
    let expected_prefix = format!("{}://{}:{}{}", protocol.scheme, protocol.hostname, protocol.port, protocol.prefix);
    pfn.strip_prefix(&expected_prefix).map(|rest| rest.to_string())
}
