/*
 * Copyright (c) Huawei Technologies Co., Ltd. 2023. All rights reserved.
 * CDI is licensed under the Mulan PSL v2.
 * You can use this software according to the terms and conditions of the Mulan PSL v2.
 * You may obtain a copy of Mulan PSL v2 at:
 *     http://license.coscl.org.cn/MulanPSL2
 * THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND, EITHER EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR
 * PURPOSE.
 * See the Mulan PSL v2 for more details.
 */

//! Clone tokens. The admission side signs a payload naming the source PVC
//! and the intended target; the controller validates it before acting on a
//! cross-namespace clone.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use token_error::Error;

type HmacSha256 = Hmac<Sha256>;

pub const OPERATION_CLONE: &str = "clone";
pub const TOKEN_PARAM_TARGET_NAMESPACE: &str = "targetNamespace";
pub const TOKEN_PARAM_TARGET_NAME: &str = "targetName";
const TOKEN_TTL_SECONDS: i64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayload {
    pub operation: String,
    pub name: String,
    pub namespace: String,
    pub resource: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub issued_at: i64,
}

pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<TokenPayload, Error>;
}

pub trait TokenGenerator: Send + Sync {
    fn generate(&self, payload: &TokenPayload) -> Result<String, Error>;
}

/// Payload JSON, base64 encoded, with an HMAC-SHA256 signature appended:
/// `<payload-b64>.<signature-b64>`.
#[derive(Clone)]
pub struct SignedToken {
    key: Vec<u8>,
}

impl SignedToken {
    pub fn new(key: Vec<u8>) -> Self {
        SignedToken { key }
    }

    fn mac(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).map_err(|_| Error::NoKeyConfigured)?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

impl TokenGenerator for SignedToken {
    fn generate(&self, payload: &TokenPayload) -> Result<String, Error> {
        if self.key.is_empty() {
            return Err(Error::NoKeyConfigured);
        }
        let encoded = serde_json::to_vec(payload).map_err(|_| Error::Malformed)?;
        let signature = self.mac(&encoded)?;
        Ok(format!("{}.{}", base64::encode(&encoded), base64::encode(&signature)))
    }
}

impl TokenValidator for SignedToken {
    fn validate(&self, token: &str) -> Result<TokenPayload, Error> {
        if self.key.is_empty() {
            return Err(Error::NoKeyConfigured);
        }
        let (payload_part, signature_part) = token.split_once('.').ok_or(Error::Malformed)?;
        let encoded = base64::decode(payload_part).map_err(|_| Error::Malformed)?;
        let signature = base64::decode(signature_part).map_err(|_| Error::Malformed)?;
        if self.mac(&encoded)? != signature {
            return Err(Error::BadSignature);
        }
        let payload: TokenPayload = serde_json::from_slice(&encoded).map_err(|_| Error::Malformed)?;
        let now = unix_now();
        if payload.issued_at + TOKEN_TTL_SECONDS < now {
            return Err(Error::Expired);
        }
        Ok(payload)
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// The payload a clone token must carry for the given source and target.
pub fn clone_token_payload(
    source_namespace: &str,
    source_name: &str,
    target_namespace: &str,
    target_name: &str,
) -> TokenPayload {
    let mut params = BTreeMap::new();
    params.insert(TOKEN_PARAM_TARGET_NAMESPACE.to_string(), target_namespace.to_string());
    params.insert(TOKEN_PARAM_TARGET_NAME.to_string(), target_name.to_string());
    TokenPayload {
        operation: OPERATION_CLONE.to_string(),
        name: source_name.to_string(),
        namespace: source_namespace.to_string(),
        resource: "persistentvolumeclaims".to_string(),
        params,
        issued_at: unix_now(),
    }
}

/// Check a validated payload against the clone the DataVolume asks for.
pub fn payload_matches_clone(
    payload: &TokenPayload,
    source_namespace: &str,
    source_name: &str,
    target_namespace: &str,
    target_name: &str,
) -> bool {
    payload.operation == OPERATION_CLONE
        && payload.namespace == source_namespace
        && payload.name == source_name
        && payload.params.get(TOKEN_PARAM_TARGET_NAMESPACE).map(String::as_str)
            == Some(target_namespace)
        && payload.params.get(TOKEN_PARAM_TARGET_NAME).map(String::as_str) == Some(target_name)
}

pub mod token_error {
    use thiserror::Error;

    #[derive(Error, Debug, PartialEq, Eq)]
    pub enum Error {
        #[error("no clone token key configured")]
        NoKeyConfigured,

        #[error("malformed clone token")]
        Malformed,

        #[error("clone token signature mismatch")]
        BadSignature,

        #[error("clone token expired")]
        Expired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> SignedToken {
        SignedToken::new(b"test-signing-key".to_vec())
    }

    #[test]
    fn test_round_trip() {
        let signer = signer();
        let payload = clone_token_payload("source-ns", "golden-pvc", "target-ns", "test-dv");
        let token = signer.generate(&payload).unwrap();
        let validated = signer.validate(&token).unwrap();
        assert_eq!(validated, payload);
        assert!(payload_matches_clone(&validated, "source-ns", "golden-pvc", "target-ns", "test-dv"));
        assert!(!payload_matches_clone(&validated, "source-ns", "other-pvc", "target-ns", "test-dv"));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let signer = signer();
        let payload = clone_token_payload("source-ns", "golden-pvc", "target-ns", "test-dv");
        let token = signer.generate(&payload).unwrap();
        let (_, signature) = token.split_once('.').unwrap();
        let mut forged = clone_token_payload("source-ns", "stolen-pvc", "target-ns", "test-dv");
        forged.issued_at = payload.issued_at;
        let forged_encoded = base64::encode(serde_json::to_vec(&forged).unwrap());
        let forged_token = format!("{}.{}", forged_encoded, signature);
        assert_eq!(signer.validate(&forged_token).unwrap_err(), Error::BadSignature);
    }

    #[test]
    fn test_expired_token_rejected() {
        let signer = signer();
        let mut payload = clone_token_payload("ns", "pvc", "ns2", "dv");
        payload.issued_at = unix_now() - TOKEN_TTL_SECONDS - 10;
        let token = signer.generate(&payload).unwrap();
        assert_eq!(signer.validate(&token).unwrap_err(), Error::Expired);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let payload = clone_token_payload("ns", "pvc", "ns2", "dv");
        let token = signer().generate(&payload).unwrap();
        let other = SignedToken::new(b"other-key".to_vec());
        assert_eq!(other.validate(&token).unwrap_err(), Error::BadSignature);
    }

    #[test]
    fn test_no_key_is_refused() {
        let disabled = SignedToken::new(Vec::new());
        let payload = clone_token_payload("ns", "pvc", "ns2", "dv");
        assert_eq!(disabled.generate(&payload).unwrap_err(), Error::NoKeyConfigured);
        assert_eq!(disabled.validate("whatever").unwrap_err(), Error::NoKeyConfigured);
    }
}
