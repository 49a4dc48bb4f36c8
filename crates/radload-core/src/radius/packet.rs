use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use thiserror::Error;

use super::{Credentials, SharedSecret};

pub const HEADER_LEN: usize = 20;
pub const AUTHENTICATOR_LEN: usize = 16;
pub const MAX_PACKET_LEN: usize = 4096;
pub const MAX_PASSWORD_LEN: usize = 128;
const MAX_ATTRIBUTE_VALUE_LEN: usize = 253;
const PASSWORD_BLOCK_LEN: usize = 16;

/// Attribute type numbers used by the Access-Request.
pub mod attr {
    pub const USER_NAME: u8 = 1;
    pub const USER_PASSWORD: u8 = 2;
    pub const NAS_IDENTIFIER: u8 = 32;
    pub const MESSAGE_AUTHENTICATOR: u8 = 80;
}

type HmacMd5 = Hmac<Md5>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    AccessRequest,
    AccessAccept,
    AccessReject,
    AccessChallenge,
}

impl Code {
    pub fn as_u8(self) -> u8 {
        match self {
            Code::AccessRequest => 1,
            Code::AccessAccept => 2,
            Code::AccessReject => 3,
            Code::AccessChallenge => 11,
        }
    }

    /// Codes a server may legitimately answer an Access-Request with.
    fn reply_from_u8(value: u8) -> Option<Self> {
        match value {
            2 => Some(Code::AccessAccept),
            3 => Some(Code::AccessReject),
            11 => Some(Code::AccessChallenge),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("password is {0} bytes, at most 128 are allowed")]
    PasswordTooLong(usize),
    #[error("attribute {kind} has an empty value")]
    EmptyAttribute { kind: u8 },
    #[error("attribute {kind} value is {len} bytes, at most 253 are allowed")]
    AttributeTooLong { kind: u8, len: usize },
    #[error("packet would be {0} bytes, at most 4096 are allowed")]
    PacketTooLong(usize),
    #[error("shared secret cannot be used as an HMAC key")]
    InvalidKey,
    #[error("reply is {0} bytes, shorter than the 20 byte header")]
    Truncated(usize),
    #[error("reply length field says {declared} bytes but {received} were received")]
    LengthMismatch { declared: usize, received: usize },
    #[error("unexpected reply code {0}")]
    UnexpectedCode(u8),
    #[error("reply authenticator does not match the request")]
    BadAuthenticator,
}

/// A verified reply to one of our requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub code: Code,
    pub identifier: u8,
    pub length: usize,
}

fn md5_block(secret: &[u8], chain: &[u8]) -> [u8; PASSWORD_BLOCK_LEN] {
    let mut hasher = Md5::new();
    hasher.update(secret);
    hasher.update(chain);
    let digest = hasher.finalize();
    let mut block = [0u8; PASSWORD_BLOCK_LEN];
    block.copy_from_slice(&digest);
    block
}

/// User-Password hiding from RFC 2865 section 5.2.
///
/// The plaintext is NUL padded to a multiple of 16 bytes (an empty password
/// becomes one block). Block `i` is XORed with `MD5(secret || c[i-1])`, where
/// `c[0]` is the request authenticator.
pub fn obfuscate_password(
    password: &[u8],
    secret: &SharedSecret,
    authenticator: &[u8; AUTHENTICATOR_LEN],
) -> Result<Vec<u8>, PacketError> {
    if password.len() > MAX_PASSWORD_LEN {
        return Err(PacketError::PasswordTooLong(password.len()));
    }

    let padded_len = password.len().div_ceil(PASSWORD_BLOCK_LEN).max(1) * PASSWORD_BLOCK_LEN;
    let mut out = vec![0u8; padded_len];
    out[..password.len()].copy_from_slice(password);

    let mut chain: Vec<u8> = authenticator.to_vec();
    for block in out.chunks_mut(PASSWORD_BLOCK_LEN) {
        let mask = md5_block(secret.as_bytes(), &chain);
        for (byte, key) in block.iter_mut().zip(mask.iter()) {
            *byte ^= key;
        }
        chain.clear();
        chain.extend_from_slice(block);
    }
    Ok(out)
}

/// Inverse of [`obfuscate_password`]. Returns the padded plaintext.
pub fn reveal_password(
    hidden: &[u8],
    secret: &SharedSecret,
    authenticator: &[u8; AUTHENTICATOR_LEN],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(hidden.len());
    let mut chain: &[u8] = authenticator;
    for block in hidden.chunks(PASSWORD_BLOCK_LEN) {
        let mask = md5_block(secret.as_bytes(), chain);
        out.extend(block.iter().zip(mask.iter()).map(|(c, k)| c ^ k));
        chain = block;
    }
    out
}

/// HMAC-MD5 over the serialized packet, keyed by the shared secret.
///
/// The caller is responsible for zero-filling the Message-Authenticator value
/// inside `packet` before calling this.
pub fn message_authenticator(
    secret: &SharedSecret,
    packet: &[u8],
) -> Result<[u8; AUTHENTICATOR_LEN], PacketError> {
    let mut mac =
        <HmacMd5 as Mac>::new_from_slice(secret.as_bytes()).map_err(|_| PacketError::InvalidKey)?;
    mac.update(packet);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; AUTHENTICATOR_LEN];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// `MD5(code || id || length || request authenticator || attributes || secret)`
fn response_authenticator(
    reply: &[u8],
    request_authenticator: &[u8; AUTHENTICATOR_LEN],
    secret: &SharedSecret,
) -> [u8; AUTHENTICATOR_LEN] {
    let mut hasher = Md5::new();
    hasher.update(&reply[..4]);
    hasher.update(request_authenticator);
    hasher.update(&reply[HEADER_LEN..]);
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; AUTHENTICATOR_LEN];
    out.copy_from_slice(&digest);
    out
}

fn push_attribute(out: &mut Vec<u8>, kind: u8, value: &[u8]) -> Result<usize, PacketError> {
    if value.is_empty() {
        return Err(PacketError::EmptyAttribute { kind });
    }
    if value.len() > MAX_ATTRIBUTE_VALUE_LEN {
        return Err(PacketError::AttributeTooLong {
            kind,
            len: value.len(),
        });
    }
    out.push(kind);
    out.push((value.len() + 2) as u8);
    let value_offset = out.len();
    out.extend_from_slice(value);
    Ok(value_offset)
}

/// A fully serialized and signed Access-Request.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    identifier: u8,
    authenticator: [u8; AUTHENTICATOR_LEN],
    bytes: Vec<u8>,
}

impl AccessRequest {
    /// Serialize an Access-Request carrying User-Name, the hidden User-Password,
    /// an optional NAS-Identifier and a Message-Authenticator.
    ///
    /// The Message-Authenticator is computed over the finished packet with its
    /// own value zeroed, then written back in place.
    pub fn build(
        identifier: u8,
        authenticator: [u8; AUTHENTICATOR_LEN],
        credentials: &Credentials,
        nas_identifier: Option<&str>,
        secret: &SharedSecret,
    ) -> Result<Self, PacketError> {
        let hidden = obfuscate_password(credentials.password.as_bytes(), secret, &authenticator)?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + 64);
        bytes.push(Code::AccessRequest.as_u8());
        bytes.push(identifier);
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&authenticator);

        push_attribute(&mut bytes, attr::USER_NAME, credentials.username.as_bytes())?;
        push_attribute(&mut bytes, attr::USER_PASSWORD, &hidden)?;
        if let Some(nas) = nas_identifier {
            push_attribute(&mut bytes, attr::NAS_IDENTIFIER, nas.as_bytes())?;
        }
        let integrity_offset = push_attribute(
            &mut bytes,
            attr::MESSAGE_AUTHENTICATOR,
            &[0u8; AUTHENTICATOR_LEN],
        )?;

        if bytes.len() > MAX_PACKET_LEN {
            return Err(PacketError::PacketTooLong(bytes.len()));
        }
        let length = bytes.len() as u16;
        bytes[2..4].copy_from_slice(&length.to_be_bytes());

        let digest = message_authenticator(secret, &bytes)?;
        bytes[integrity_offset..integrity_offset + AUTHENTICATOR_LEN].copy_from_slice(&digest);

        Ok(Self {
            identifier,
            authenticator,
            bytes,
        })
    }

    pub fn identifier(&self) -> u8 {
        self.identifier
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Check a datagram received after sending this request.
    ///
    /// Returns `Ok(None)` when the datagram answers a different identifier
    /// (a late reply to an earlier request); the caller keeps waiting.
    pub fn verify_reply(
        &self,
        datagram: &[u8],
        secret: &SharedSecret,
    ) -> Result<Option<Reply>, PacketError> {
        if datagram.len() < HEADER_LEN {
            return Err(PacketError::Truncated(datagram.len()));
        }
        if datagram[1] != self.identifier {
            return Ok(None);
        }

        let declared = u16::from_be_bytes([datagram[2], datagram[3]]) as usize;
        if declared < HEADER_LEN || declared > datagram.len() {
            return Err(PacketError::LengthMismatch {
                declared,
                received: datagram.len(),
            });
        }
        // Octets past the length field are padding.
        let reply = &datagram[..declared];

        let code = Code::reply_from_u8(reply[0]).ok_or(PacketError::UnexpectedCode(reply[0]))?;

        let expected = response_authenticator(reply, &self.authenticator, secret);
        if expected[..] != reply[4..HEADER_LEN] {
            return Err(PacketError::BadAuthenticator);
        }

        Ok(Some(Reply {
            code,
            identifier: reply[1],
            length: declared,
        }))
    }
}

/// Serialize a server reply with a valid Response Authenticator.
///
/// `attributes` must already be encoded as type/length/value triplets.
pub fn encode_reply(
    code: Code,
    identifier: u8,
    request_authenticator: &[u8; AUTHENTICATOR_LEN],
    attributes: &[u8],
    secret: &SharedSecret,
) -> Vec<u8> {
    let length = (HEADER_LEN + attributes.len()) as u16;
    let mut out = Vec::with_capacity(length as usize);
    out.push(code.as_u8());
    out.push(identifier);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&[0u8; AUTHENTICATOR_LEN]);
    out.extend_from_slice(attributes);
    let auth = response_authenticator(&out, request_authenticator, secret);
    out[4..HEADER_LEN].copy_from_slice(&auth);
    out
}
