// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;

use der::asn1::{Any, ObjectIdentifier, SetOfVec};
use der::pem::LineEnding;
use der::{EncodePem, Tag};
use rsa::RsaPrivateKey;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs1v15::{Signature, SigningKey};
use rsa::rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::builder::{Builder, RequestBuilder};
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};

pub const MIN_KEY_BITS: usize = 2048;

const COUNTRY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.6");
const PROVINCE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.8");
const LOCALITY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.7");
const STREET_ADDRESS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.9");
const POSTAL_CODE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.17");
const ORGANIZATION: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
const ORGANIZATION_UNIT: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.11");
const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("failed to encode certificate request: {0}")]
    Encoding(String),
    #[error("der: {0}")]
    Der(#[from] der::Error),
}

/// CertificateRequestSpec describes the subject of the certificate being requested.
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub country: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locality: Vec<String>,
    /// Kubernetes maps each organization to a group of the user.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organization: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organization_unit: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub postal_code: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub province: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub street_address: Vec<String>,
    /// Subject common name, which Kubernetes uses as the user name.
    #[serde(default)]
    pub user: String,
}

impl CertificateRequestSpec {
    fn subject(&self) -> Result<Name, Error> {
        // Same attribute order as Go's pkix.Name, which is what the apiserver expects to see.
        let attrs = [
            (COUNTRY, self.country.as_slice()),
            (PROVINCE, self.province.as_slice()),
            (LOCALITY, self.locality.as_slice()),
            (STREET_ADDRESS, self.street_address.as_slice()),
            (POSTAL_CODE, self.postal_code.as_slice()),
            (ORGANIZATION, self.organization.as_slice()),
            (ORGANIZATION_UNIT, self.organization_unit.as_slice()),
            (COMMON_NAME, std::slice::from_ref(&self.user)),
        ];
        let rdns = attrs
            .iter()
            .flat_map(|(oid, values)| {
                values
                    .iter()
                    .filter(|v| !v.is_empty())
                    .map(move |v| rdn(*oid, v))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RdnSequence(rdns))
    }
}

fn rdn(oid: ObjectIdentifier, value: &str) -> Result<RelativeDistinguishedName, Error> {
    let tag = if value.chars().all(is_printable) {
        Tag::PrintableString
    } else {
        Tag::Utf8String
    };
    let atv = AttributeTypeAndValue {
        oid,
        value: Any::new(tag, value.as_bytes())?,
    };
    Ok(RelativeDistinguishedName(SetOfVec::try_from(vec![atv])?))
}

// X.680 PrintableString alphabet.
fn is_printable(c: char) -> bool {
    c.is_ascii_alphanumeric() || " '()+,-./:=?".contains(c)
}

/// KeyPair is the private key generated for a single issuance. It is never written to disk.
pub struct KeyPair {
    key: RsaPrivateKey,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("bits", &self.bits())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// generate creates a fresh RSA key of the requested size.
    pub fn generate(bits: usize) -> Result<KeyPair, Error> {
        if bits < MIN_KEY_BITS {
            return Err(Error::KeyGeneration(format!(
                "key size {bits} is below the minimum of {MIN_KEY_BITS} bits"
            )));
        }
        let key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| Error::KeyGeneration(e.to_string()))?;
        Ok(KeyPair { key })
    }

    pub fn bits(&self) -> usize {
        self.key.size() * 8
    }

    /// to_pem serializes the key as a PKCS#1 "RSA PRIVATE KEY" block.
    pub fn to_pem(&self) -> Result<Vec<u8>, Error> {
        let pem = self
            .key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| Error::Encoding(e.to_string()))?;
        Ok(pem.as_bytes().to_vec())
    }
}

/// SigningRequest is a PEM encoded PKCS#10 certificate request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningRequest(String);

impl SigningRequest {
    pub fn as_pem(&self) -> &str {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0.into_bytes()
    }
}

impl CertificateRequestSpec {
    /// signing_request builds and signs (SHA256 with RSA) a CSR for this subject.
    pub fn signing_request(&self, key: &KeyPair) -> Result<SigningRequest, Error> {
        let subject = self.subject()?;
        let signer = SigningKey::<Sha256>::new(key.key.clone());
        let csr = RequestBuilder::new(subject, &signer)
            .map_err(|e| Error::Encoding(e.to_string()))?
            .build::<Signature>()
            .map_err(|e| Error::Encoding(e.to_string()))?;
        Ok(SigningRequest(csr.to_pem(LineEnding::LF)?))
    }
}
