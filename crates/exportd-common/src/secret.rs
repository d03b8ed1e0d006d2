//! Secret-reference templates in class parameters.
//!
//! Class parameters may name a secret through a pair of templated keys. The
//! templates are resolved against the content name and the export identity;
//! no lookup of the referenced secret happens here, only name resolution and
//! syntactic validation. The namespace template deliberately accepts fewer
//! tokens than the name template: the namespace must never be chosen by the
//! export user.

use std::collections::{BTreeMap, HashMap};

use crate::crd::NfsExport;
use crate::error::Error;

/// Template token for the content name.
pub const TOKEN_CONTENT_NAME: &str = "content.name";
/// Template token for the export name.
pub const TOKEN_EXPORT_NAME: &str = "nfsexport.name";
/// Template token for the export namespace.
pub const TOKEN_EXPORT_NAMESPACE: &str = "nfsexport.namespace";

/// The pair of class-parameter keys describing one secret reference.
#[derive(Clone, Copy, Debug)]
pub struct SecretParams {
    /// Human name used in error messages ("export" / "list").
    pub name: &'static str,
    /// Parameter key holding the secret name template.
    pub name_key: &'static str,
    /// Parameter key holding the secret namespace template.
    pub namespace_key: &'static str,
}

/// Secret reference for CreateExport/DeleteExport credentials.
pub const EXPORT_SECRET_PARAMS: SecretParams = SecretParams {
    name: "export",
    name_key: crate::keys::PARAM_SECRET_NAME,
    namespace_key: crate::keys::PARAM_SECRET_NAMESPACE,
};

/// Secret reference for ListExports credentials.
pub const LIST_SECRET_PARAMS: SecretParams = SecretParams {
    name: "list",
    name_key: crate::keys::PARAM_LIST_SECRET_NAME,
    namespace_key: crate::keys::PARAM_LIST_SECRET_NAMESPACE,
};

/// A resolved (but not fetched) secret reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretRef {
    /// Secret name (DNS-1123 subdomain).
    pub name: String,
    /// Secret namespace (DNS-1123 label).
    pub namespace: String,
}

/// Resolve the secret reference described by `params` from class parameters.
///
/// Returns `Ok(None)` when neither key is present. Setting only one of the two
/// keys, an unresolvable token, or a resolved value that is not a valid
/// DNS-1123 name are all errors.
pub fn secret_reference(
    params: &SecretParams,
    class_params: &BTreeMap<String, String>,
    content_name: &str,
    export: Option<&NfsExport>,
) -> Result<Option<SecretRef>, Error> {
    let name_template = class_params.get(params.name_key);
    let namespace_template = class_params.get(params.namespace_key);

    let (name_template, namespace_template) = match (name_template, namespace_template) {
        (None, None) => return Ok(None),
        (Some(n), Some(ns)) if !n.is_empty() && !ns.is_empty() => (n, ns),
        (Some(_), Some(_)) => {
            return Err(Error::secrets(format!(
                "{} secrets specified in parameters but value of either namespace or name is empty",
                params.name
            )))
        }
        _ => {
            return Err(Error::secrets(format!(
                "either name and namespace for {} secrets specified, both must be specified",
                params.name
            )))
        }
    };

    // The namespace is never derived from user-controlled export names.
    let mut namespace_tokens = HashMap::new();
    namespace_tokens.insert(TOKEN_CONTENT_NAME, content_name.to_string());
    if let Some(export) = export {
        namespace_tokens.insert(
            TOKEN_EXPORT_NAMESPACE,
            export.metadata.namespace.clone().unwrap_or_default(),
        );
    }
    let namespace = resolve_template(namespace_template, &namespace_tokens)?;
    if !is_dns1123_label(&namespace) {
        return Err(Error::secrets(format!(
            "{namespace_template:?} resolved to {namespace:?} which is not a valid namespace name"
        )));
    }

    let mut name_tokens = HashMap::new();
    name_tokens.insert(TOKEN_CONTENT_NAME, content_name.to_string());
    if let Some(export) = export {
        name_tokens.insert(
            TOKEN_EXPORT_NAME,
            export.metadata.name.clone().unwrap_or_default(),
        );
        name_tokens.insert(
            TOKEN_EXPORT_NAMESPACE,
            export.metadata.namespace.clone().unwrap_or_default(),
        );
    }
    let name = resolve_template(name_template, &name_tokens)?;
    if !is_dns1123_subdomain(&name) {
        return Err(Error::secrets(format!(
            "{name_template:?} resolved to {name:?} which is not a valid secret name"
        )));
    }

    Ok(Some(SecretRef { name, namespace }))
}

/// Expand `${token}` occurrences; any unknown token fails.
fn resolve_template(template: &str, tokens: &HashMap<&str, String>) -> Result<String, Error> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(Error::secrets(format!(
                "invalid template {template:?}: unterminated token"
            )));
        };
        let token = &after[..end];
        match tokens.get(token) {
            Some(value) => out.push_str(value),
            None => {
                return Err(Error::secrets(format!(
                    "invalid tokens: [{token:?}]"
                )))
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// DNS-1123 label: lowercase alphanumerics and '-', 1..=63 chars,
/// alphanumeric at both ends.
pub fn is_dns1123_label(s: &str) -> bool {
    if s.is_empty() || s.len() > 63 {
        return false;
    }
    let bytes = s.as_bytes();
    if !bytes[0].is_ascii_lowercase() && !bytes[0].is_ascii_digit() {
        return false;
    }
    if !bytes[bytes.len() - 1].is_ascii_lowercase() && !bytes[bytes.len() - 1].is_ascii_digit() {
        return false;
    }
    s.bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// DNS-1123 subdomain: dot-separated DNS-1123 labels, up to 253 chars.
pub fn is_dns1123_subdomain(s: &str) -> bool {
    if s.is_empty() || s.len() > 253 {
        return false;
    }
    s.split('.').all(is_dns1123_label)
}
