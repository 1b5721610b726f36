use crate::chain::operator_id_of;
use crate::error::{KeepError, KeepResult};
use borsh::{BorshDeserialize, BorshSerialize};
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::AffinePoint;
use keep_primitives::OperatorId;
use sha3::{Digest as _, Keccak256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Arbitrary magic byte to tell our connections apart from anything else.
const MAGIC_BYTE: u8 = 0xcc;

pub const PROTOCOL_VERSION: u32 = 1;

const DOMAIN: &[u8] = b"keep-node handshake";
const MAX_NODE_DATA_LEN: u32 = 1024;

/// What each side announces upon connecting.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
struct NodeData {
    /// SEC1 compressed secp256k1 public key.
    public_key: Vec<u8>,
    nonce: [u8; 32],
}

/// The authenticated identity of the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    pub public_key: AffinePoint,
    pub operator: OperatorId,
}

fn transcript(peer_nonce: &[u8; 32], own_nonce: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(DOMAIN);
    hasher.update(peer_nonce);
    hasher.update(own_nonce);
    hasher.finalize().into()
}

fn transport_error(context: &str) -> impl Fn(std::io::Error) -> KeepError + '_ {
    move |err| KeepError::Transport(format!("{}: {}", context, err))
}

/// Performs the handshake on a fresh connection: both sides exchange the
/// protocol version and their public key, then prove possession of the key
/// by signing the other side's random nonce.
pub async fn p2p_handshake<T: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut T,
    key: &SigningKey,
    timeout: std::time::Duration,
) -> KeepResult<PeerIdentity> {
    let handshake = async move {
        let own = NodeData {
            public_key: key.verifying_key().to_encoded_point(true).as_bytes().to_vec(),
            nonce: rand::random(),
        };
        let mut header = [0u8; 5];
        header[0] = MAGIC_BYTE;
        header[1..].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        conn.write_all(&header).await.map_err(transport_error("write header"))?;
        let own_buf = borsh::to_vec(&own)
            .map_err(|err| KeepError::Transport(format!("encode node data: {}", err)))?;
        conn.write_all(&(own_buf.len() as u32).to_be_bytes())
            .await
            .map_err(transport_error("write node data"))?;
        conn.write_all(&own_buf)
            .await
            .map_err(transport_error("write node data"))?;

        let mut other_header = [0u8; 5];
        conn.read_exact(&mut other_header)
            .await
            .map_err(transport_error("read header"))?;
        if other_header[0] != MAGIC_BYTE {
            return Err(KeepError::Transport(
                "invalid magic byte in handshake".to_string(),
            ));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&other_header[1..]);
        let other_version = u32::from_be_bytes(version);
        if other_version != PROTOCOL_VERSION {
            return Err(KeepError::Transport(format!(
                "incompatible protocol version; we have {}, they have {}",
                PROTOCOL_VERSION, other_version
            )));
        }

        let mut len = [0u8; 4];
        conn.read_exact(&mut len)
            .await
            .map_err(transport_error("read node data"))?;
        let len = u32::from_be_bytes(len);
        if len > MAX_NODE_DATA_LEN {
            return Err(KeepError::Transport(format!("node data too long: {}", len)));
        }
        let mut other_buf = vec![0u8; len as usize];
        conn.read_exact(&mut other_buf)
            .await
            .map_err(transport_error("read node data"))?;
        let other: NodeData = borsh::from_slice(&other_buf)
            .map_err(|err| KeepError::Transport(format!("decode node data: {}", err)))?;
        let other_key = VerifyingKey::from_sec1_bytes(&other.public_key)
            .map_err(|_| KeepError::Transport("invalid peer public key".to_string()))?;

        let (signature, _) = key
            .sign_prehash_recoverable(&transcript(&other.nonce, &own.nonce))
            .map_err(|err| KeepError::Crypto(format!("sign handshake: {}", err)))?;
        conn.write_all(&signature.to_bytes())
            .await
            .map_err(transport_error("write signature"))?;

        let mut other_signature = [0u8; 64];
        conn.read_exact(&mut other_signature)
            .await
            .map_err(transport_error("read signature"))?;
        let other_signature = Signature::from_slice(&other_signature)
            .map_err(|_| KeepError::Transport("malformed handshake signature".to_string()))?;
        other_key
            .verify_prehash(&transcript(&own.nonce, &other.nonce), &other_signature)
            .map_err(|_| KeepError::Transport("peer failed to prove its key".to_string()))?;

        let public_key = *other_key.as_affine();
        Ok::<_, KeepError>(PeerIdentity {
            public_key,
            operator: operator_id_of(&public_key),
        })
    };
    tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| KeepError::Transport("handshake timed out".to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::future::Future;

    const TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

    fn do_handshake(
        mut conn: tokio::io::DuplexStream,
        key: &SigningKey,
    ) -> impl Future<Output = KeepResult<PeerIdentity>> {
        let key = key.clone();
        let handle = tokio::spawn(async move { p2p_handshake(&mut conn, &key, TIMEOUT).await });
        async move { handle.await.unwrap() }
    }

    fn random_key() -> SigningKey {
        SigningKey::random(&mut rand::thread_rng())
    }

    #[tokio::test]
    async fn test_p2p_handshake_authenticates_both_sides() {
        let (a, b) = tokio::io::duplex(1024);
        let (a_key, b_key) = (random_key(), random_key());
        let a_result = do_handshake(a, &a_key);
        let b_result = do_handshake(b, &b_key);
        let seen_by_a = a_result.await.unwrap();
        let seen_by_b = b_result.await.unwrap();
        assert_eq!(seen_by_a.public_key, *b_key.verifying_key().as_affine());
        assert_eq!(
            seen_by_b.operator,
            operator_id_of(a_key.verifying_key().as_affine())
        );
    }

    #[tokio::test]
    async fn test_p2p_handshake_different_version() {
        let (a, mut b) = tokio::io::duplex(1024);
        let a_result = do_handshake(a, &random_key());
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        buf[1..].copy_from_slice(&(PROTOCOL_VERSION + 1).to_be_bytes());
        b.write_all(&buf).await.unwrap();
        let err = a_result.await.unwrap_err();
        assert_eq!(
            err,
            KeepError::Transport(format!(
                "incompatible protocol version; we have {}, they have {}",
                PROTOCOL_VERSION,
                PROTOCOL_VERSION + 1
            ))
        );
    }

    #[tokio::test]
    async fn test_p2p_handshake_invalid_magic_byte() {
        let (a, mut b) = tokio::io::duplex(1024);
        let a_result = do_handshake(a, &random_key());
        b.write_all(&[0u8; 10]).await.unwrap();
        assert_matches!(
            a_result.await,
            Err(KeepError::Transport(msg)) if msg == "invalid magic byte in handshake"
        );
    }

    #[tokio::test]
    async fn test_p2p_handshake_rejects_borrowed_public_key() {
        let (a, mut b) = tokio::io::duplex(4096);
        let a_result = do_handshake(a, &random_key());
        // Announce someone else's key without being able to sign for it.
        let victim = random_key();
        let data = borsh::to_vec(&NodeData {
            public_key: victim.verifying_key().to_encoded_point(true).as_bytes().to_vec(),
            nonce: [7; 32],
        })
        .unwrap();
        let mut header = vec![MAGIC_BYTE];
        header.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        b.write_all(&header).await.unwrap();
        b.write_all(&(data.len() as u32).to_be_bytes()).await.unwrap();
        b.write_all(&data).await.unwrap();
        let (signature, _) = random_key()
            .sign_prehash_recoverable(&[1u8; 32])
            .unwrap();
        b.write_all(&signature.to_bytes()).await.unwrap();
        assert_matches!(
            a_result.await,
            Err(KeepError::Transport(msg)) if msg == "peer failed to prove its key"
        );
    }

    #[tokio::test]
    async fn test_p2p_handshake_response_too_short_and_hangs() {
        for i in 0..=4 {
            let (a, mut b) = tokio::io::duplex(1024);
            let a_result = do_handshake(a, &random_key());
            b.write_all(&vec![MAGIC_BYTE; i]).await.unwrap();
            assert_matches!(
                a_result.await,
                Err(KeepError::Transport(msg)) if msg == "handshake timed out"
            );
        }
    }
}
