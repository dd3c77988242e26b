//! Helpers for validating resource names. Fully qualified names must be what Kubernetes accepts
//! as an [extended
//! resource](https://github.com/kubernetes/community/blob/master/contributors/design-proposals/scheduling/resources.md#the-kubernetes-resource-model).
use lazy_static::lazy_static;
use regex::Regex;
use tracing::trace;

const QUALIFIED_NAME_MAX_LENGTH: usize = 63;
// QUALIFIED_NAME_FMT = "(" + QUALIFIED_NAME_CHAR_FMT + "*)?" + QUALIFIED_NAME_EXT_CHAR_FMT +
// QUALIFIED_NAME_CHAR_FMT
const QUALIFIED_NAME_FMT: &str =
    concat!("(", "[A-Za-z0-9]", "[-A-Za-z0-9_.]", "*)?", "[A-Za-z0-9]");
const QUALIFIED_NAME_ERR_MSG: &str = "must consist of alphanumeric characters, '-', '_' or '.', and must start and end with an alphanumeric character";

// DNS1123SubdomainMaxLength is a subdomain's max length in DNS (RFC 1123)
const DNS_1123_SUBDOMAIN_MAX_LEN: usize = 253;
const DNS_1123_LABEL_ERR_MSG: &str = "a lowercase RFC 1123 label must consist of lower case alphanumeric characters or '-', and must start and end with an alphanumeric character";
// DNS_1123_SUBDOMAIN_FMT = DNS_1123_LABEL_FMT + "(\\." + DNS_1123_LABEL_FMT + ")*"
const DNS_1123_SUBDOMAIN_FMT: &str = concat!(
    "[a-z0-9]([-a-z0-9]*[a-z0-9])?",
    "(\\.",
    "[a-z0-9]([-a-z0-9]*[a-z0-9])?",
    ")*"
);

/// RESOURCE_DEFAULT_NAMESPACE_PREFIX is the default namespace prefix.
const RESOURCE_DEFAULT_NAMESPACE_PREFIX: &str = "kubernetes.io/";
/// Default resource requests prefix
const DEFAULT_RESOURCE_REQUESTS_PREFIX: &str = "requests.";

lazy_static! {
    static ref QUALIFIED_NAME: Regex = anchored(QUALIFIED_NAME_FMT);
    static ref DNS_1123_SUBDOMAIN: Regex = anchored(DNS_1123_SUBDOMAIN_FMT);
    static ref RESOURCE_NAME: Regex = anchored("[A-Za-z0-9_]+");
}

fn anchored(fmt: &str) -> Regex {
    Regex::new(&format!("^{}$", fmt)).unwrap()
}

/// Returns true when a configured resource name, without prefix, only holds alphanumeric
/// characters and underscores.
pub fn is_valid_resource_name(name: &str) -> bool {
    RESOURCE_NAME.is_match(name)
}

/// Returns true if:
/// 1. the resource name is not in the default namespace;
/// 2. resource name does not have "requests." prefix, to avoid confusion with the convention in
///    quota
/// 3. it satisfies the rules in IsQualifiedName() after converted into quota resource name
pub fn is_extended_resource_name(name: &str) -> bool {
    if is_native_resource(name) || name.starts_with(DEFAULT_RESOURCE_REQUESTS_PREFIX) {
        false
    } else {
        let quota_resource_name = format!("{}{}", DEFAULT_RESOURCE_REQUESTS_PREFIX, name);
        match is_qualified_name(&quota_resource_name) {
            Ok(_) => true,
            Err(e) => {
                trace!(
                    "name {} does not qualify as an extended resource name due to {}",
                    name,
                    e
                );
                false
            }
        }
    }
}

/// Returns true if the resource name is in the *kubernetes.io/ namespace. Partially-qualified
/// (unprefixed) names are implicitly in the kubernetes.io/ namespace.
fn is_native_resource(name: &str) -> bool {
    !name.contains('/') || name.contains(RESOURCE_DEFAULT_NAMESPACE_PREFIX)
}

/// Tests whether the value passed is what Kubernetes calls a "qualified name": an optional
/// DNS-style subdomain followed by a slash and a name. Returns the first formatting error hit.
fn is_qualified_name(name: &str) -> anyhow::Result<()> {
    let parts: Vec<&str> = name.split('/').collect();
    let name = match parts[..] {
        [name] => name,
        [prefix, name] => {
            if prefix.is_empty() {
                return Err(anyhow::Error::msg("prefix part must not be empty"));
            }
            is_dns_1123_subdomain(prefix)?;
            name
        }
        _ => {
            return Err(anyhow::Error::msg("a qualified name was expected with an optional DNS subdomain prefix and '/' (e.g. 'example.com/MyName')"));
        }
    };

    if name.len() > QUALIFIED_NAME_MAX_LENGTH {
        return Err(anyhow::format_err!(
            "expected qualified name to be no longer than {} characters",
            QUALIFIED_NAME_MAX_LENGTH
        ));
    }

    if !QUALIFIED_NAME.is_match(name) {
        return Err(anyhow::format_err!(
            "qualified name not properly formatted ... {}",
            QUALIFIED_NAME_ERR_MSG
        ));
    }

    Ok(())
}

/// Tests for a string that conforms to the definition of a subdomain in DNS (RFC 1123).
fn is_dns_1123_subdomain(value: &str) -> anyhow::Result<()> {
    if value.len() > DNS_1123_SUBDOMAIN_MAX_LEN {
        Err(anyhow::format_err!(
            "DNS subdomain cannot be more than {} characters",
            DNS_1123_SUBDOMAIN_MAX_LEN
        ))
    } else if !DNS_1123_SUBDOMAIN.is_match(value) {
        Err(anyhow::format_err!(
            "dns subdomain not properly formatted ... {}",
            DNS_1123_LABEL_ERR_MSG
        ))
    } else {
        Ok(())
    }
}
