//! SASL authentication for the key-value session: SCRAM-SHA variants, with
//! PLAIN available only where the transport (or configuration) permits it.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::distr::Alphanumeric;
use rand::Rng;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use shoal_errors::{ErrorKind, ShoalError, ShoalResult};

use crate::config::SaslMechanism;

const CLIENT_KEY: &[u8] = b"Client Key";
const SERVER_KEY: &[u8] = b"Server Key";
const GS2_HEADER: &str = "n,,";

/// PLAIN payload: `\0user\0password`.
pub fn plain_payload(username: &str, password: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(username.len() + password.len() + 2);
    payload.push(0);
    payload.extend_from_slice(username.as_bytes());
    payload.push(0);
    payload.extend_from_slice(password.as_bytes());
    payload
}

struct HashFns {
    hmac: fn(&[u8], &[&[u8]]) -> Vec<u8>,
    hash: fn(&[u8]) -> Vec<u8>,
}

fn hmac_of<D>(key: &[u8], chunks: &[&[u8]]) -> Vec<u8>
where
    Hmac<D>: Mac + hmac::digest::KeyInit,
    D: Digest + hmac::digest::core_api::CoreProxy,
    D::Core: hmac::digest::HashMarker
        + hmac::digest::core_api::UpdateCore
        + hmac::digest::core_api::FixedOutputCore
        + hmac::digest::core_api::BufferKindUser<BufferKind = hmac::digest::block_buffer::Eager>
        + Default
        + Clone,
    <D::Core as hmac::digest::core_api::BlockSizeUser>::BlockSize:
        hmac::digest::generic_array::typenum::IsLess<hmac::digest::generic_array::typenum::U256>,
    hmac::digest::generic_array::typenum::Le<
        <D::Core as hmac::digest::core_api::BlockSizeUser>::BlockSize,
        hmac::digest::generic_array::typenum::U256,
    >: hmac::digest::generic_array::typenum::NonZero,
{
    let mut mac = <Hmac<D> as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    for chunk in chunks {
        mac.update(chunk);
    }
    mac.finalize().into_bytes().to_vec()
}

fn hash_of<D: Digest>(data: &[u8]) -> Vec<u8> {
    let mut digest = D::new();
    digest.update(data);
    digest.finalize().to_vec()
}

fn hash_fns(mechanism: SaslMechanism) -> ShoalResult<HashFns> {
    Ok(match mechanism {
        SaslMechanism::ScramSha512 => HashFns {
            hmac: hmac_of::<Sha512>,
            hash: hash_of::<Sha512>,
        },
        SaslMechanism::ScramSha256 => HashFns {
            hmac: hmac_of::<Sha256>,
            hash: hash_of::<Sha256>,
        },
        SaslMechanism::ScramSha1 => HashFns {
            hmac: hmac_of::<Sha1>,
            hash: hash_of::<Sha1>,
        },
        SaslMechanism::Plain => {
            return Err(ShoalError::with_message(
                ErrorKind::AuthenticationFailure,
                "PLAIN has no SCRAM exchange",
            ))
        }
    })
}

/// PBKDF2 (the SCRAM `Hi` function) over the mechanism's HMAC.
fn salted_password(fns: &HashFns, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut block = salt.to_vec();
    block.extend_from_slice(&1u32.to_be_bytes());
    let mut u = (fns.hmac)(password, &[&block]);
    let mut result = u.clone();
    for _ in 1..iterations {
        u = (fns.hmac)(password, &[&u]);
        for (acc, byte) in result.iter_mut().zip(u.iter()) {
            *acc ^= byte;
        }
    }
    result
}

fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

/// One SCRAM conversation. Messages map 1:1 onto the SASL_AUTH / SASL_STEP
/// request values.
pub struct ScramExchange {
    mechanism: SaslMechanism,
    password: String,
    client_first_bare: String,
    /// Expected server signature, fixed once the client-final is produced.
    server_signature: Option<Vec<u8>>,
}

impl ScramExchange {
    pub fn new(mechanism: SaslMechanism, username: &str, password: &str) -> ShoalResult<Self> {
        let username = stringprep::saslprep(username)
            .map_err(|e| ShoalError::with_source(ErrorKind::AuthenticationFailure, e))?
            .into_owned();
        let password = stringprep::saslprep(password)
            .map_err(|e| ShoalError::with_source(ErrorKind::AuthenticationFailure, e))?
            .into_owned();
        let nonce: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        Ok(ScramExchange {
            mechanism,
            password,
            client_first_bare: format!("n={},r={}", escape_username(&username), nonce),
            server_signature: None,
        })
    }

    pub fn mechanism(&self) -> SaslMechanism {
        self.mechanism
    }

    /// Value of the initial SASL_AUTH request.
    pub fn client_first(&self) -> String {
        format!("{GS2_HEADER}{}", self.client_first_bare)
    }

    /// Consume the server-first message, produce the SASL_STEP value.
    pub fn client_final(&mut self, server_first: &[u8]) -> ShoalResult<String> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|e| ShoalError::with_source(ErrorKind::AuthenticationFailure, e))?;
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for field in server_first.split(',') {
            match field.split_once('=') {
                Some(("r", value)) => nonce = Some(value.to_string()),
                Some(("s", value)) => {
                    salt = Some(BASE64.decode(value).map_err(|e| {
                        ShoalError::with_source(ErrorKind::AuthenticationFailure, e)
                    })?)
                }
                Some(("i", value)) => {
                    iterations = Some(value.parse::<u32>().map_err(|e| {
                        ShoalError::with_source(ErrorKind::AuthenticationFailure, e)
                    })?)
                }
                _ => {}
            }
        }
        let (nonce, salt, iterations) = match (nonce, salt, iterations) {
            (Some(n), Some(s), Some(i)) if i >= 1 => (n, s, i),
            _ => {
                return Err(ShoalError::with_message(
                    ErrorKind::AuthenticationFailure,
                    "malformed SCRAM server-first message",
                ))
            }
        };

        let fns = hash_fns(self.mechanism)?;
        let salted = salted_password(&fns, self.password.as_bytes(), &salt, iterations);
        let client_key = (fns.hmac)(&salted, &[CLIENT_KEY]);
        let stored_key = (fns.hash)(&client_key);

        let without_proof = format!("c={},r={}", BASE64.encode(GS2_HEADER), nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );
        let client_signature = (fns.hmac)(&stored_key, &[auth_message.as_bytes()]);
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let server_key = (fns.hmac)(&salted, &[SERVER_KEY]);
        self.server_signature = Some((fns.hmac)(&server_key, &[auth_message.as_bytes()]));

        Ok(format!("{without_proof},p={}", BASE64.encode(proof)))
    }

    /// Check the server-final `v=` signature.
    pub fn verify_server_final(&self, server_final: &[u8]) -> ShoalResult<()> {
        let expected = self.server_signature.as_ref().ok_or_else(|| {
            ShoalError::with_message(
                ErrorKind::AuthenticationFailure,
                "SCRAM server-final before client-final",
            )
        })?;
        let server_final = std::str::from_utf8(server_final)
            .map_err(|e| ShoalError::with_source(ErrorKind::AuthenticationFailure, e))?;
        for field in server_final.split(',') {
            if let Some(("v", value)) = field.split_once('=') {
                let signature = BASE64
                    .decode(value)
                    .map_err(|e| ShoalError::with_source(ErrorKind::AuthenticationFailure, e))?;
                if &signature == expected {
                    return Ok(());
                }
                return Err(ShoalError::with_message(
                    ErrorKind::AuthenticationFailure,
                    "SCRAM server signature mismatch",
                ));
            }
        }
        Err(ShoalError::with_message(
            ErrorKind::AuthenticationFailure,
            "SCRAM server-final carries no signature",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_payload_layout() {
        assert_eq!(plain_payload("user", "pass"), b"\0user\0pass");
    }

    #[test]
    fn client_first_carries_gs2_header_and_nonce() {
        let exchange =
            ScramExchange::new(SaslMechanism::ScramSha256, "user,name", "secret").unwrap();
        let first = exchange.client_first();
        assert!(first.starts_with("n,,n=user=2Cname,r="));
        // 24-character nonce
        let nonce = first.rsplit("r=").next().unwrap();
        assert_eq!(nonce.len(), 24);
    }

    // RFC 5802 test vector (SCRAM-SHA-1, user/pencil) adapted to a fixed
    // exchange: verify the derived keys rather than the full conversation,
    // since our nonce is random.
    #[test]
    fn salted_password_matches_rfc_vector() {
        let fns = hash_fns(SaslMechanism::ScramSha1).unwrap();
        let salt = BASE64.decode("QSXCR+Q6sek8bf92").unwrap();
        let salted = salted_password(&fns, b"pencil", &salt, 4096);
        assert_eq!(
            salted,
            [
                0x1d, 0x96, 0xee, 0x3a, 0x52, 0x9b, 0x5a, 0x5f, 0x9e, 0x47, 0xc0, 0x1f, 0x22,
                0x9a, 0x2c, 0xb8, 0xa6, 0xe1, 0x5f, 0x7d
            ]
        );
    }

    #[test]
    fn malformed_server_first_is_rejected() {
        let mut exchange =
            ScramExchange::new(SaslMechanism::ScramSha256, "user", "secret").unwrap();
        let err = exchange.client_final(b"r=onlynonce").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
    }

    #[test]
    fn server_final_verification_round_trip() {
        // Drive both sides of the conversation locally.
        let mut exchange =
            ScramExchange::new(SaslMechanism::ScramSha256, "user", "pencil").unwrap();
        let first = exchange.client_first();
        let client_nonce = first.split("r=").nth(1).unwrap();
        let server_nonce = format!("{client_nonce}SERVER");
        let salt = BASE64.encode(b"somesalt");
        let server_first = format!("r={server_nonce},s={salt},i=128");
        let final_message = exchange.client_final(server_first.as_bytes()).unwrap();
        assert!(final_message.contains(&format!("r={server_nonce}")));
        assert!(final_message.contains(",p="));

        // Recompute the server signature the way a server would.
        let fns = hash_fns(SaslMechanism::ScramSha256).unwrap();
        let salted = salted_password(&fns, b"pencil", b"somesalt", 128);
        let server_key = (fns.hmac)(&salted, &[SERVER_KEY]);
        let client_first_bare = first.strip_prefix("n,,").unwrap();
        let without_proof = final_message.split(",p=").next().unwrap();
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");
        let signature = (fns.hmac)(&server_key, &[auth_message.as_bytes()]);
        let server_final = format!("v={}", BASE64.encode(signature));

        exchange
            .verify_server_final(server_final.as_bytes())
            .unwrap();
        assert!(exchange.verify_server_final(b"v=AAAA").is_err());
    }
}
