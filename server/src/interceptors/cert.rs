use tonic::{Request, Status};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Verified client identity, attached to every request by [`extract_common_name`].
#[derive(Clone, Debug)]
pub struct ClientIdentity {
    pub common_name: String,
}

/// A tonic interceptor service function.
///
/// Pulls the subject common name out of the verified peer certificate and
/// adds it to the request extensions; the ownership key for every job is
/// derived from it. Requests without a parsable certificate carrying a
/// common name are rejected as unauthenticated.
pub fn extract_common_name(mut req: Request<()>) -> Result<Request<()>, Status> {
    let certs = req
        .peer_certs()
        .ok_or_else(|| Status::unauthenticated("request missing client certificate"))?;
    let cert = certs
        .first()
        .ok_or_else(|| Status::unauthenticated("request missing client certificate"))?;
    let common_name = common_name_from_der(cert.as_ref())
        .ok_or_else(|| Status::unauthenticated("client certificate has no common name"))?;
    req.extensions_mut().insert(ClientIdentity { common_name });
    Ok(req)
}

/// Parse a DER-encoded certificate and return its subject common name, if
/// there is a non-empty one.
fn common_name_from_der(der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())?;
    if cn.is_empty() {
        None
    } else {
        Some(cn.to_string())
    }
}
